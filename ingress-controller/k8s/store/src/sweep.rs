//! Periodic certificate maintenance, independent of watch traffic.

use crate::Store;
use std::{sync::Arc, time::Duration};
use tokio::time;

/// Restores certificates that admitted routes reference but the tracker has
/// lost, every `interval`.
pub async fn missing_certificates(store: Arc<Store>, interval: Duration, shutdown: drain::Watch) {
    let mut timer = time::interval_at(time::Instant::now() + interval, interval);
    timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let shutdown = shutdown.signaled();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => return,
            _ = timer.tick() => {}
        }
        let restored = store.sync_missing_certificates().await;
        tracing::debug!(restored, "Swept for missing certificates");
    }
}

/// Re-validates the chain of every tracked certificate on disk, every
/// `interval`. Failures are only logged.
pub async fn certificate_health(store: Arc<Store>, interval: Duration, shutdown: drain::Watch) {
    let mut timer = time::interval_at(time::Instant::now() + interval, interval);
    timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let shutdown = shutdown.signaled();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => return,
            _ = timer.tick() => {}
        }
        let unhealthy = store.check_certificate_health().await;
        if unhealthy.is_empty() {
            tracing::debug!("All certificates are healthy");
        }
    }
}
