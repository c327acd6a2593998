use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Change notifications emitted by the stores and consumed by the index
/// feed. Delivery is best-effort; a lost event is recoverable via a full
/// reindex.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    DocumentCreated { id: Uuid, chain_id: Uuid },
    DocumentUpdated { id: Uuid, chain_id: Uuid },
    DocumentDeleted { id: Uuid, chain_id: Uuid },
    ContentChanged {
        id: Uuid,
        chain_id: Uuid,
        content_id: Uuid,
        indexable: bool,
    },
}

impl Event {
    pub fn version_id(&self) -> Uuid {
        match self {
            Event::DocumentCreated { id, .. }
            | Event::DocumentUpdated { id, .. }
            | Event::DocumentDeleted { id, .. }
            | Event::ContentChanged { id, .. } => *id,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(100);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
