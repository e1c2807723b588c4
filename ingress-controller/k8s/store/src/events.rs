use crate::Kind;
use ingress_controller_core::ResourceId;
use std::fmt;
use tokio::sync::mpsc;

/// A change the store has applied.
///
/// Events name what changed; consumers read the current state back from the
/// store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Create { kind: Kind, id: ResourceId },
    Update { kind: Kind, id: ResourceId },
    Delete { kind: Kind, id: ResourceId },

    /// Derived state changed without a single watched object changing.
    Configuration {
        reason: String,
        affected: Vec<ResourceId>,
    },
}

/// The producing half of the store's ordered event stream.
///
/// Sends wait for capacity, so a slow consumer blocks the producing watch
/// instead of losing events.
#[derive(Clone, Debug)]
pub struct EventSender(mpsc::Sender<Event>);

pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender(tx), rx)
}

// === impl Event ===

impl Event {
    pub fn configuration(reason: impl Into<String>, affected: Vec<ResourceId>) -> Self {
        Self::Configuration {
            reason: reason.into(),
            affected,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create { kind, id } => write!(f, "create {kind} {id}"),
            Self::Update { kind, id } => write!(f, "update {kind} {id}"),
            Self::Delete { kind, id } => write!(f, "delete {kind} {id}"),
            Self::Configuration { reason, .. } => write!(f, "configuration: {reason}"),
        }
    }
}

// === impl EventSender ===

impl EventSender {
    pub async fn send(&self, event: Event) {
        tracing::trace!(%event, "Emitting");
        if self.0.send(event).await.is_err() {
            tracing::debug!("Event receiver dropped");
        }
    }
}
