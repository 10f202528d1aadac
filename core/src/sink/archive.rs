//! Newline-delimited JSON archival into object storage.
//!
//! Objects are keyed `{topic}/{YYYY-MM-DD}/{HH}/partition-{p}.ndjson` and only
//! ever appended to. Replays may append duplicates; readers tolerate them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;

use crate::dead_letter::MAX_PAYLOAD_BYTES;
use crate::event::{EventTime, date_hour, format_time};
use crate::sink::ObjectStore;
use crate::source::LogRecord;

pub fn archive_path(topic: &str, time: EventTime, partition: u32) -> String {
    let (date, hour) = date_hour(time);
    format!("{topic}/{date}/{hour}/partition-{partition}.ndjson")
}

/// One archive line for a raw ingress record, tagged with where it came from.
///
/// Payloads that are not JSON objects are kept verbatim under `_raw` and
/// flagged with `_parse_error`.
pub fn raw_archive_line(record: &LogRecord) -> Vec<u8> {
    let mut object = match serde_json::from_slice::<Value>(&record.payload) {
        Ok(Value::Object(object)) => object,
        _ => {
            let end = record.payload.len().min(MAX_PAYLOAD_BYTES);
            let mut object = Map::new();
            object.insert(
                "_raw".to_string(),
                Value::String(String::from_utf8_lossy(&record.payload[..end]).into_owned()),
            );
            object.insert("_parse_error".to_string(), Value::Bool(true));
            object
        }
    };
    object.insert("_partition".to_string(), Value::from(record.partition));
    object.insert("_offset".to_string(), Value::from(record.offset));
    object.insert(
        "_enqueued_time".to_string(),
        Value::String(format_time(record.appended_at)),
    );
    let mut line = Value::Object(object).to_string().into_bytes();
    line.push(b'\n');
    line
}

/// Object store on the local filesystem under a root directory.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> anyhow::Result<PathBuf> {
        if path.split('/').any(|part| part == "..") {
            anyhow::bail!("object path escapes the archive root: {path}");
        }
        Ok(self.root.join(path))
    }
}

impl ObjectStore for LocalObjectStore {
    fn append<'a>(&'a self, path: &'a str, bytes: &'a [u8]) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let target = self.resolve(path)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target)
                .await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            Ok(())
        })
    }

    fn read<'a>(&'a self, path: &'a str) -> BoxFuture<'a, anyhow::Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            match tokio::fs::read(self.resolve(path)?).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn append<'a>(&'a self, path: &'a str, bytes: &'a [u8]) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.lock()
                .entry(path.to_string())
                .or_default()
                .extend_from_slice(bytes);
            Ok(())
        })
    }

    fn read<'a>(&'a self, path: &'a str) -> BoxFuture<'a, anyhow::Result<Option<Vec<u8>>>> {
        Box::pin(async move { Ok(self.lock().get(path).cloned()) })
    }
}
