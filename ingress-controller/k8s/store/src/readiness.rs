use crate::Kind;
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio::{sync::watch, time};

/// Waits until every registered watch has completed its initial list.
#[derive(Clone, Debug)]
pub struct SyncBarrier {
    pending: Arc<watch::Sender<BTreeSet<Kind>>>,
}

/// Marks one watch as synced.
#[derive(Debug)]
pub struct Synced {
    kind: Kind,
    pending: Arc<watch::Sender<BTreeSet<Kind>>>,
}

/// The initial cache sync did not complete in time.
#[derive(Debug, thiserror::Error)]
#[error("timed out after {timeout:?} waiting for initial sync of {pending:?}")]
pub struct SyncTimeout {
    pub timeout: Duration,
    pub pending: Vec<Kind>,
}

// === impl SyncBarrier ===

impl Default for SyncBarrier {
    fn default() -> Self {
        Self {
            pending: Arc::new(watch::Sender::new(BTreeSet::new())),
        }
    }
}

impl SyncBarrier {
    /// Registers a watch the barrier must wait for.
    pub fn register(&self, kind: Kind) -> Synced {
        self.pending.send_modify(|p| {
            p.insert(kind);
        });
        Synced {
            kind,
            pending: self.pending.clone(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    pub async fn wait(&self, timeout: Duration) -> Result<(), SyncTimeout> {
        let mut rx = self.pending.subscribe();
        let synced = time::timeout(timeout, rx.wait_for(BTreeSet::is_empty))
            .await
            .map(|res| res.is_ok());
        match synced {
            Ok(true) => Ok(()),
            // The barrier owns the sender, so only the timeout can fail.
            Ok(false) | Err(_) => Err(SyncTimeout {
                timeout,
                pending: self.pending.borrow().iter().copied().collect(),
            }),
        }
    }
}

// === impl Synced ===

impl Synced {
    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn ready(&self) {
        let kind = self.kind;
        self.pending.send_if_modified(|p| p.remove(&kind));
    }
}
