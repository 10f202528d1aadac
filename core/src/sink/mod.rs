pub mod archive;
pub mod document;
pub mod router;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::config::{SinkConfig, SinkTarget};
use crate::errors::SinkError;
use crate::event::EventTime;

pub use archive::{LocalObjectStore, MemoryObjectStore};
pub use document::{MemoryDocumentStore, PROCESSING_VERSION};
pub use router::{Delivery, OutputRouter};

/// A keyed document database with named containers.
///
/// `upsert` replaces any document with the same id, so writing the same
/// document twice leaves one copy.
pub trait DocumentStore: Send + Sync {
    fn upsert<'a>(
        &'a self,
        container: &'a str,
        id: &'a str,
        document: Value,
        expires_at: Option<EventTime>,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    fn get<'a>(&'a self, container: &'a str, id: &'a str) -> BoxFuture<'a, anyhow::Result<Option<Value>>>;

    /// Documents in `container` whose top-level `field` equals `value`, ordered by id.
    fn query<'a>(
        &'a self,
        container: &'a str,
        field: &'a str,
        value: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<Vec<Value>>>;

    /// Removes documents whose expiry is at or before `now`. Returns how many.
    fn purge_expired(&self, now: EventTime) -> BoxFuture<'_, anyhow::Result<usize>>;
}

/// Append-only object storage addressed by slash-separated paths.
pub trait ObjectStore: Send + Sync {
    fn append<'a>(&'a self, path: &'a str, bytes: &'a [u8]) -> BoxFuture<'a, anyhow::Result<()>>;

    fn read<'a>(&'a self, path: &'a str) -> BoxFuture<'a, anyhow::Result<Option<Vec<u8>>>>;
}

/// A configured sink bound to its store.
#[derive(Clone)]
pub enum SinkHandle {
    Document {
        store: Arc<dyn DocumentStore>,
        container: String,
        ttl_ms: Option<i64>,
    },
    Archive {
        store: Arc<dyn ObjectStore>,
        topic: String,
    },
}

/// Every sink in the configuration, shared by all pipelines.
#[derive(Clone, Default)]
pub struct SinkRegistry {
    sinks: HashMap<String, SinkHandle>,
}

impl SinkRegistry {
    /// Binds document sinks to `documents` and archive sinks to a local store
    /// under their `root`, or to `objects` when no root is set.
    pub fn build(
        configs: &[SinkConfig],
        documents: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        let sinks = configs
            .iter()
            .map(|config| {
                let handle = match &config.target {
                    SinkTarget::DocumentStore {
                        container,
                        ttl_seconds,
                    } => SinkHandle::Document {
                        store: Arc::clone(&documents),
                        container: container.clone(),
                        ttl_ms: ttl_seconds.map(|s| s as i64 * 1000),
                    },
                    SinkTarget::Archive { topic, root } => SinkHandle::Archive {
                        store: match root {
                            Some(root) => Arc::new(LocalObjectStore::new(root)),
                            None => Arc::clone(&objects),
                        },
                        topic: topic.clone(),
                    },
                };
                (config.id.clone(), handle)
            })
            .collect();
        Self { sinks }
    }

    pub fn insert(&mut self, id: impl Into<String>, handle: SinkHandle) {
        self.sinks.insert(id.into(), handle);
    }

    pub fn get(&self, id: &str) -> Result<&SinkHandle, SinkError> {
        self.sinks.get(id).ok_or_else(|| SinkError::UnknownSink {
            sink: id.to_string(),
        })
    }
}
