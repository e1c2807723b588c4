use crate::{
    client::SideChannel,
    configurer::Configurer,
    diff::{is_incremental_sufficient, Changes},
};
use ingress_controller_core::Configuration;
use std::{fmt, future::Future, pin::Pin, time::Duration};
use tokio::{sync::mpsc, time};

/// Builds the desired snapshot from current cluster state.
#[async_trait::async_trait]
pub trait BuildConfiguration: Send + Sync {
    async fn build(&self) -> anyhow::Result<Configuration>;
}

/// Applies a snapshot that the side channel cannot express.
#[async_trait::async_trait]
pub trait Reload: Send + Sync {
    async fn reload(&self, config: &Configuration) -> anyhow::Result<()>;
}

/// Delays between failed passes, doubling from `initial` up to `max`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The candidate matched the running snapshot.
    Unchanged,
    Applied { changes: Changes, reloaded: bool },
}

/// Drives the proxy toward the snapshot the cluster state describes.
#[derive(Debug)]
pub struct Reconciler<B, R, C> {
    builder: B,
    reloader: R,
    configurer: Configurer<C>,
    backoff: Backoff,
}

// === impl Backoff ===

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    fn next(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max)
    }
}

// === impl Reconciler ===

impl<B, R, C> Reconciler<B, R, C>
where
    B: BuildConfiguration,
    R: Reload,
    C: SideChannel,
{
    pub fn new(builder: B, reloader: R, channel: C) -> Self {
        Self {
            builder,
            reloader,
            configurer: Configurer::new(channel),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(self, backoff: Backoff) -> Self {
        Self { backoff, ..self }
    }

    pub fn running(&self) -> Option<&Configuration> {
        self.configurer.running()
    }

    /// Reconciles once at start and then once per burst of `events`, until
    /// the stream closes or shutdown is signaled.
    ///
    /// A failed pass is retried in full after a backoff delay. Events that
    /// arrive in the meantime are folded into the retry.
    pub async fn run<E>(mut self, mut events: mpsc::Receiver<E>, shutdown: drain::Watch)
    where
        E: fmt::Display + Send,
    {
        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);

        tracing::debug!("Initial reconciliation");
        if !self.apply(&mut events, shutdown.as_mut()).await {
            return;
        }

        loop {
            let trigger = tokio::select! {
                biased;
                _ = &mut shutdown => return,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        tracing::debug!("Event stream closed");
                        return;
                    }
                },
            };
            let coalesced = drain_pending(&mut events);
            tracing::debug!(%trigger, coalesced, "Reconciling");

            if !self.apply(&mut events, shutdown.as_mut()).await {
                return;
            }
        }
    }

    /// Retries [`Self::reconcile`] until it succeeds. Returns false if
    /// shutdown was signaled first.
    async fn apply<E, F>(
        &mut self,
        events: &mut mpsc::Receiver<E>,
        mut shutdown: Pin<&mut F>,
    ) -> bool
    where
        F: Future,
    {
        let mut delay = self.backoff.initial;
        loop {
            match self.reconcile().await {
                Ok(Outcome::Unchanged) => {
                    tracing::debug!("No configuration change");
                    return true;
                }
                Ok(Outcome::Applied { changes, reloaded }) => {
                    tracing::info!(
                        backends = changes.backends,
                        streams = changes.streams,
                        servers = changes.servers,
                        reloaded,
                        "Configuration applied"
                    );
                    return true;
                }
                Err(error) => {
                    tracing::error!(%error, retry_in = ?delay, "Reconciliation failed");
                    tokio::select! {
                        biased;
                        _ = shutdown.as_mut() => return false,
                        _ = time::sleep(delay) => {}
                    }
                    delay = self.backoff.next(delay);
                    drain_pending(events);
                }
            }
        }
    }

    /// Builds a candidate snapshot and applies whatever differs from the
    /// running one, reloading first when the change is not incremental.
    pub async fn reconcile(&mut self) -> anyhow::Result<Outcome> {
        let candidate = self.builder.build().await?;
        let reload = match self.configurer.running() {
            Some(running) if *running == candidate => return Ok(Outcome::Unchanged),
            Some(running) => !is_incremental_sufficient(&candidate, running),
            None => true,
        };

        if reload {
            self.reloader.reload(&candidate).await?;
        }
        let changes = self.configurer.configure_dynamically(&candidate).await?;
        Ok(Outcome::Applied {
            changes,
            reloaded: reload,
        })
    }
}

fn drain_pending<E>(events: &mut mpsc::Receiver<E>) -> usize {
    let mut n = 0;
    while events.try_recv().is_ok() {
        n += 1;
    }
    n
}
