//! Folding a log file's events into the current record.
//!
//! Events are applied in file order and every field keeps the value of the
//! last event that set it. File position, not the timestamp, decides which
//! write wins.

use crate::record_store::RecordStore;
use crate::storage::{EventBody, ExecutionKind, ExecutionRecord, ExecutionStatus, LogEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;

pub const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Default)]
struct Fold {
    id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    kind: Option<ExecutionKind>,
    description: Option<String>,
    code: Option<String>,
    status: Option<ExecutionStatus>,
    output: Option<String>,
    error_output: Option<String>,
    duration_ms: Option<u64>,
    exit_code: Option<i32>,
}

impl Fold {
    fn apply(&mut self, event: &LogEvent) {
        if let Some(id) = &event.id {
            self.id = Some(id.clone());
        }
        if let Some(ts) = event.timestamp {
            // Lines may be out of order on disk; creation is the earliest stamp seen
            self.created_at = Some(self.created_at.map_or(ts, |current| current.min(ts)));
            self.updated_at = Some(self.updated_at.map_or(ts, |current| current.max(ts)));
        }

        match &event.body {
            EventBody::Started { kind, description } => {
                self.kind = Some(kind.clone());
                if description.is_some() {
                    self.description = description.clone();
                }
            }
            EventBody::Code { code, description } => {
                self.code = Some(code.clone());
                if description.is_some() {
                    self.description = description.clone();
                }
            }
            EventBody::Output {
                output,
                error_output,
                duration_ms,
                exit_code,
            } => {
                self.output = Some(output.clone());
                self.error_output = Some(error_output.clone());
                self.duration_ms = Some(*duration_ms);
                if exit_code.is_some() {
                    self.exit_code = *exit_code;
                }
            }
            EventBody::Status { status } => self.status = Some(*status),
            EventBody::Snapshot {
                kind,
                description,
                code,
                status,
                output,
                error_output,
                duration_ms,
            } => {
                self.kind = Some(kind.clone());
                if description.is_some() {
                    self.description = description.clone();
                }
                self.code = Some(code.clone());
                self.status = Some(*status);
                self.output = Some(output.clone());
                self.error_output = Some(error_output.clone());
                self.duration_ms = Some(*duration_ms);
            }
        }
    }

    fn finish(self) -> Option<ExecutionRecord> {
        Some(ExecutionRecord {
            id: self.id?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            kind: self.kind,
            description: self.description,
            code: self.code.unwrap_or_default(),
            // Never promoted: without a status event the execution is still running
            status: self.status.unwrap_or(ExecutionStatus::Running),
            output: self.output.unwrap_or_default(),
            error_output: self.error_output.unwrap_or_default(),
            duration_ms: self.duration_ms.unwrap_or(0),
            exit_code: self.exit_code,
        })
    }
}

impl ExecutionRecord {
    /// `None` when no event carried an id, i.e. the record is not valid yet.
    pub fn from_events(events: &[LogEvent]) -> Option<Self> {
        let mut fold = Fold::default();
        for event in events {
            fold.apply(event);
        }
        fold.finish()
    }
}

/// Listing row for one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub kind: String,
    pub status: ExecutionStatus,
    pub description: String,
    pub code_preview: String,
    pub output_preview: String,
    pub error_preview: String,
    pub duration_ms: u64,
    pub file: String,
}

impl ExecutionSummary {
    pub fn from_record(record: &ExecutionRecord) -> Self {
        Self {
            id: record.id.clone(),
            created_at: record.created_at,
            kind: record
                .kind
                .as_ref()
                .map_or_else(|| "unknown".to_string(), |k| k.as_str().to_string()),
            status: record.status,
            description: record.description.clone().unwrap_or_default(),
            code_preview: preview(&record.code),
            output_preview: preview(&record.output),
            error_preview: preview(&record.error_output),
            duration_ms: record.duration_ms,
            file: RecordStore::file_name_for(&record.id),
        }
    }
}

/// First `PREVIEW_CHARS` characters, cut on a character boundary.
pub fn preview(text: &str) -> String {
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::parse_timestamp;

    fn at(raw: &str) -> DateTime<Utc> {
        parse_timestamp(raw).unwrap()
    }

    fn lifecycle() -> Vec<LogEvent> {
        vec![
            LogEvent::started("exec-f", ExecutionKind::Python, Some("say hi".to_string()))
                .with_timestamp(at("2026-03-01T10:00:00Z")),
            LogEvent::code("exec-f", "print('hi')", None).with_timestamp(at("2026-03-01T10:00:00Z")),
            LogEvent::output("exec-f", "hi\n".to_string(), String::new(), 40, Some(0))
                .with_timestamp(at("2026-03-01T10:00:01Z")),
            LogEvent::status("exec-f", ExecutionStatus::Completed)
                .with_timestamp(at("2026-03-01T10:00:01Z")),
        ]
    }

    #[test]
    fn later_status_wins() {
        let record = ExecutionRecord::from_events(&lifecycle()).unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.kind, Some(ExecutionKind::Python));
        assert_eq!(record.description.as_deref(), Some("say hi"));
        assert_eq!(record.output, "hi\n");
        assert_eq!(record.duration_ms, 40);
        assert_eq!(record.exit_code, Some(0));
    }

    #[test]
    fn position_beats_wall_clock() {
        let mut events = lifecycle();
        // A status line stamped earlier but written later still wins
        events.push(
            LogEvent::status("exec-f", ExecutionStatus::Error)
                .with_timestamp(at("2026-03-01T09:00:00Z")),
        );
        let record = ExecutionRecord::from_events(&events).unwrap();
        assert_eq!(record.status, ExecutionStatus::Error);
        assert_eq!(record.created_at, Some(at("2026-03-01T09:00:00Z")));
        assert_eq!(record.updated_at, Some(at("2026-03-01T10:00:01Z")));
    }

    #[test]
    fn record_without_terminal_event_stays_running() {
        let events = &lifecycle()[..2];
        let record = ExecutionRecord::from_events(events).unwrap();
        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(record.duration_ms, 0);
        assert!(record.output.is_empty());
    }

    #[test]
    fn fold_is_idempotent() {
        let events = lifecycle();
        assert_eq!(
            ExecutionRecord::from_events(&events),
            ExecutionRecord::from_events(&events)
        );
    }

    #[test]
    fn events_without_id_do_not_make_a_record() {
        let mut event = LogEvent::status("x", ExecutionStatus::Completed);
        event.id = None;
        assert!(ExecutionRecord::from_events(&[event]).is_none());
        assert!(ExecutionRecord::from_events(&[]).is_none());
    }

    #[test]
    fn summary_previews_are_bounded() {
        let mut record = ExecutionRecord::from_events(&lifecycle()).unwrap();
        record.code = "é".repeat(250);
        let summary = ExecutionSummary::from_record(&record);
        assert_eq!(summary.code_preview.chars().count(), PREVIEW_CHARS);
        assert_eq!(summary.output_preview, "hi\n");
        assert_eq!(summary.kind, "python");
        assert_eq!(summary.file, "exec-f.jsonl");
    }
}
