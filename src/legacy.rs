//! Import of whole-record snapshot files written by the older wrapper.
//!
//! Those files hold a single (often pretty-printed) JSON object that was
//! overwritten on every update. Importing converts it to a `snapshot` event
//! and swaps it into the store atomically.

use crate::error::{Result, StoreError};
use crate::record_store::RecordStore;
use crate::storage::{parse_timestamp, EventBody, ExecutionKind, ExecutionStatus, LogEvent};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct LegacySnapshot {
    pub id: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>, // "python", "shell", ...
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub status: ExecutionStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub execution_time: f64, // Milliseconds, fractional
}

impl LegacySnapshot {
    pub fn into_event(self) -> LogEvent {
        let kind = ExecutionKind::resolve(self.kind.as_deref(), &self.code);
        LogEvent {
            id: Some(self.id),
            timestamp: self.timestamp.as_deref().and_then(parse_timestamp),
            body: EventBody::Snapshot {
                kind,
                description: self.description,
                code: self.code,
                status: self.status,
                output: self.output,
                error_output: self.error,
                duration_ms: self.execution_time.max(0.0).round() as u64,
            },
        }
    }
}

/// Returns the imported execution id.
pub fn import_file(store: &RecordStore, path: &Path) -> Result<String> {
    let content = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
    let snapshot: LegacySnapshot = serde_json::from_str(&content)?;
    let id = snapshot.id.clone();

    store.replace(&id, &[snapshot.into_event()])?;
    info!(id = %id, source = %path.display(), "imported legacy snapshot");
    Ok(id)
}
