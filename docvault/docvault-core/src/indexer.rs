//! Outbound feed keeping an external search index in sync.
//!
//! Store mutations land on the event bus; the feed debounces them per
//! version, builds a textual update payload and hands it to an
//! [`IndexSink`]. Delivery is best-effort and never blocks or fails the
//! triggering request; a dropped update is recoverable with
//! [`IndexFeed::reindex_all`].

use crate::events::{Event, EventBus};
use crate::versions::VersionStore;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::time::{sleep, Duration};
use uuid::Uuid;

const DEBOUNCE: Duration = Duration::from_millis(100);

/// One unit of work for the external index.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct IndexUpdate {
    pub id: Uuid,
    pub chain_id: Uuid,
    /// Remove the document from the index instead of upserting it.
    pub deleted: bool,
    pub name: String,
    pub description: Option<String>,
    pub keywords: Option<String>,
    pub tags: Vec<String>,
    /// Extracted text of the version's indexable content, when present.
    pub text: Option<String>,
}

/// Seam to the external text-search engine. Implementations must not
/// assume exactly-once delivery.
#[async_trait]
pub trait IndexSink: Send + Sync {
    async fn deliver(&self, update: IndexUpdate) -> anyhow::Result<()>;
}

pub struct IndexFeed {
    sink: Arc<dyn IndexSink>,
    store: Arc<RwLock<VersionStore>>,
    pending: AsyncMutex<HashMap<Uuid, tokio::task::JoinHandle<()>>>,
}

impl IndexFeed {
    pub fn new(sink: Arc<dyn IndexSink>, store: Arc<RwLock<VersionStore>>) -> Self {
        Self {
            sink,
            store,
            pending: AsyncMutex::new(HashMap::new()),
        }
    }

    fn build_update(store: &VersionStore, id: Uuid, chain_id: Uuid) -> IndexUpdate {
        match store.get(id) {
            Some(obj) => IndexUpdate {
                id,
                chain_id: obj.chain_id,
                deleted: false,
                name: obj.name.clone(),
                description: obj.description.clone(),
                keywords: obj.keywords.clone(),
                tags: obj.tags.iter().cloned().collect(),
                text: store.indexable_text(id),
            },
            None => IndexUpdate {
                id,
                chain_id,
                deleted: true,
                name: String::new(),
                description: None,
                keywords: None,
                tags: Vec::new(),
                text: None,
            },
        }
    }

    async fn push(
        sink: Arc<dyn IndexSink>,
        store: Arc<RwLock<VersionStore>>,
        id: Uuid,
        chain_id: Uuid,
    ) {
        sleep(DEBOUNCE).await;
        let update = {
            let guard = store.read().await;
            Self::build_update(&guard, id, chain_id)
        };
        if let Err(e) = sink.deliver(update).await {
            tracing::warn!(version = %id, error = %e, "index update delivery failed");
        }
    }

    /// Queue an update for one version, replacing any update already
    /// pending for it.
    pub async fn schedule(&self, id: Uuid, chain_id: Uuid) {
        let mut pending = self.pending.lock().await;
        if let Some(handle) = pending.remove(&id) {
            handle.abort();
        }
        let sink = self.sink.clone();
        let store = self.store.clone();
        let handle = tokio::spawn(Self::push(sink, store, id, chain_id));
        pending.insert(id, handle);
    }

    /// Consume the event bus until it closes. Spawned once at startup.
    pub fn spawn_consumer(self: &Arc<Self>, bus: &EventBus) -> tokio::task::JoinHandle<()> {
        let mut rx = bus.subscribe();
        let feed = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let (id, chain_id) = match &event {
                            Event::DocumentCreated { id, chain_id }
                            | Event::DocumentUpdated { id, chain_id }
                            | Event::DocumentDeleted { id, chain_id }
                            | Event::ContentChanged { id, chain_id, .. } => (*id, *chain_id),
                        };
                        feed.schedule(id, chain_id).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "index feed lagged behind the event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Push every chain's latest version to the sink. Exposed for full
    /// index rebuilds after lost updates.
    pub async fn reindex_all(&self) -> usize {
        let updates: Vec<IndexUpdate> = {
            let guard = self.store.read().await;
            guard
                .latest_versions()
                .into_iter()
                .map(|obj| Self::build_update(&guard, obj.id, obj.chain_id))
                .collect()
        };
        let mut delivered = 0;
        for update in updates {
            match self.sink.deliver(update).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(error = %e, "reindex delivery failed"),
            }
        }
        delivered
    }
}
