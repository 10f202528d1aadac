use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use futures::future::BoxFuture;
use serde_json::{Value, json};
use tracing::debug;

use crate::event::{Event, EventTime, format_time, hour_bucket};
use crate::sink::DocumentStore;

/// Stamped on every processed-event document.
pub const PROCESSING_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Id of a processed event: the producer's `event_id`, or `{partition}-{offset}`
/// when it sent none, so replays overwrite rather than duplicate.
pub fn processed_event_id(event: &Event, partition: u32, offset: u64) -> String {
    match &event.event_id {
        Some(id) => id.clone(),
        None => format!("{partition}-{offset}"),
    }
}

/// A validated event enriched with processing metadata.
pub fn processed_event_document(
    event: &Event,
    id: &str,
    partition: u32,
    offset: u64,
    processed_at: EventTime,
) -> Value {
    json!({
        "id": id,
        "event_id": event.event_id,
        "event_type": event.kind,
        "user_id": event.user_id,
        "session_id": event.session_id,
        "content_id": event.content_id,
        "content_title": event.content_title,
        "content_type": event.content_type,
        "timestamp": format_time(event.event_time),
        "arrival_time": format_time(event.arrival_time),
        "duration_seconds": event.duration_seconds,
        "device_type": event.device_type,
        "location": event.location,
        "buffer_duration_ms": event.buffer_duration_ms,
        "subscription_tier": event.subscription_tier,
        "partition": partition,
        "offset": offset,
        "hour_bucket": hour_bucket(event.event_time),
        "processed_at": format_time(processed_at),
        "processing_version": PROCESSING_VERSION,
    })
}

#[derive(Debug, Clone)]
struct Stored {
    document: Value,
    expires_at: Option<EventTime>,
}

type Containers = BTreeMap<String, BTreeMap<String, Stored>>;

/// In-process document store. Containers are created on first write.
#[derive(Default)]
pub struct MemoryDocumentStore {
    containers: Mutex<Containers>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Containers> {
        self.containers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every document in a container, ordered by id.
    pub fn documents(&self, container: &str) -> Vec<(String, Value)> {
        self.lock()
            .get(container)
            .map(|docs| {
                docs.iter()
                    .map(|(id, stored)| (id.clone(), stored.document.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, container: &str) -> usize {
        self.lock().get(container).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, container: &str) -> bool {
        self.len(container) == 0
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn upsert<'a>(
        &'a self,
        container: &'a str,
        id: &'a str,
        document: Value,
        expires_at: Option<EventTime>,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.lock()
                .entry(container.to_string())
                .or_default()
                .insert(id.to_string(), Stored { document, expires_at });
            Ok(())
        })
    }

    fn get<'a>(&'a self, container: &'a str, id: &'a str) -> BoxFuture<'a, anyhow::Result<Option<Value>>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .get(container)
                .and_then(|docs| docs.get(id))
                .map(|stored| stored.document.clone()))
        })
    }

    fn query<'a>(
        &'a self,
        container: &'a str,
        field: &'a str,
        value: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<Vec<Value>>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .get(container)
                .map(|docs| {
                    docs.values()
                        .filter(|stored| stored.document.get(field) == Some(value))
                        .map(|stored| stored.document.clone())
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn purge_expired(&self, now: EventTime) -> BoxFuture<'_, anyhow::Result<usize>> {
        Box::pin(async move {
            let mut containers = self.lock();
            let mut purged = 0;
            for (name, docs) in containers.iter_mut() {
                let before = docs.len();
                docs.retain(|_, stored| stored.expires_at.is_none_or(|at| at > now));
                if docs.len() < before {
                    debug!(container = %name, purged = before - docs.len(), "expired documents purged");
                }
                purged += before - docs.len();
            }
            Ok(purged)
        })
    }
}
