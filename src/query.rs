//! Read-side views over the record store.
//!
//! Nothing is cached: each call rescans the directory, so results always
//! reflect what is on disk at call time. Cross-file views never trust file
//! order and sort on each event's own timestamp.

use crate::error::{Result, StoreError};
use crate::fold::ExecutionSummary;
use crate::record_store::RecordStore;
use crate::storage::{ExecutionRecord, LogEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use tracing::debug;

pub const MAX_LIST_LIMIT: usize = 50;
pub const DEFAULT_LATEST_MAX_ENTRIES: usize = 50;
pub const DEFAULT_LATEST_FILES_TO_SCAN: usize = 10;
pub const DEFAULT_ALL_MAX_FILES: usize = 20;
pub const DEFAULT_ALL_MAX_ENTRIES: usize = 100;

/// Events taken from the end of each file for the latest view.
pub const TAIL_EVENTS_PER_FILE: usize = 10;

#[derive(Debug, Serialize)]
pub struct ExecutionList {
    pub executions: Vec<ExecutionSummary>,
    pub count: usize,
    pub total_available: usize, // Log files in the directory
}

#[derive(Debug, Serialize)]
pub struct ExecutionDetail {
    pub execution_id: String,
    pub entries: Vec<LogEvent>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct EventFeed {
    pub entries: Vec<LogEvent>,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_available: Option<usize>, // Events before truncation
}

#[derive(Debug, Clone)]
pub struct QueryEngine {
    store: RecordStore,
}

impl QueryEngine {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }

    pub fn list_recent(&self, limit: usize) -> Result<ExecutionList> {
        let ids = self.store.list_ids(limit)?;
        let mut executions = Vec::with_capacity(ids.len());

        for id in &ids {
            let events = self.store.get(id)?;
            match ExecutionRecord::from_events(&events) {
                Some(record) => executions.push(ExecutionSummary::from_record(&record)),
                None => debug!(id = %id, "omitting log without a parseable id"),
            }
        }

        Ok(ExecutionList {
            count: executions.len(),
            executions,
            total_available: self.store.count()?,
        })
    }

    pub fn get_by_id(&self, id: &str) -> Result<ExecutionDetail> {
        let events = self.events_or_not_found(id)?;
        let entries: Vec<LogEvent> = events.iter().map(LogEvent::trimmed).collect();
        Ok(ExecutionDetail {
            execution_id: id.to_string(),
            count: entries.len(),
            entries,
        })
    }

    /// Resolved current state of one execution.
    pub fn get_record(&self, id: &str) -> Result<ExecutionRecord> {
        let events = self.events_or_not_found(id)?;
        ExecutionRecord::from_events(&events).ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Approximate global tail: the last few events of the most recently
    /// touched files, newest first.
    pub fn latest_across_all(&self, max_entries: usize, files_to_scan: usize) -> Result<EventFeed> {
        let mut entries = Vec::new();
        for id in self.store.list_ids(files_to_scan)? {
            let events = self.store.get(&id)?;
            let start = events.len().saturating_sub(TAIL_EVENTS_PER_FILE);
            entries.extend(events.into_iter().skip(start));
        }

        sort_newest_first(&mut entries);
        entries.truncate(max_entries);

        Ok(EventFeed {
            count: entries.len(),
            entries,
            total_available: None,
        })
    }

    /// Every event of the most recently touched files, newest first.
    pub fn all_recent_entries(&self, max_files: usize, max_entries: usize) -> Result<EventFeed> {
        let mut entries = Vec::new();
        for id in self.store.list_ids(max_files)? {
            entries.extend(self.store.get(&id)?);
        }

        let total_available = entries.len();
        sort_newest_first(&mut entries);
        entries.truncate(max_entries);

        Ok(EventFeed {
            count: entries.len(),
            entries,
            total_available: Some(total_available),
        })
    }

    fn events_or_not_found(&self, id: &str) -> Result<Vec<LogEvent>> {
        let events = match self.store.get(id) {
            Ok(events) => events,
            Err(StoreError::InvalidId(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        if events.is_empty() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(events)
    }
}

/// Stable: ties and missing timestamps keep their scan order, and events
/// without a timestamp go last.
fn sort_newest_first(events: &mut [LogEvent]) {
    events.sort_by(|a, b| newest_first(a.timestamp.as_ref(), b.timestamp.as_ref()));
}

fn newest_first(a: Option<&DateTime<Utc>>, b: Option<&DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_store::tests::set_mtime;
    use crate::record_store::StoreOptions;
    use crate::storage::{parse_timestamp, ExecutionKind, ExecutionStatus};
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn at(raw: &str) -> DateTime<Utc> {
        parse_timestamp(raw).unwrap()
    }

    fn setup() -> (TempDir, RecordStore, QueryEngine) {
        let temp = tempdir().unwrap();
        let store = RecordStore::open(temp.path(), StoreOptions::default()).unwrap();
        let engine = QueryEngine::new(store.clone());
        (temp, store, engine)
    }

    fn write_completed(store: &RecordStore, id: &str, minute: u32) {
        let base = format!("2026-05-01T12:{minute:02}");
        store
            .put_all(
                id,
                &[
                    LogEvent::started(id, ExecutionKind::Shell, None)
                        .with_timestamp(at(&format!("{base}:00Z"))),
                    LogEvent::code(id, &format!("echo {id}"), Some(format!("run {id}")))
                        .with_timestamp(at(&format!("{base}:00Z"))),
                    LogEvent::output(id, format!("{id}\n"), String::new(), 5, Some(0))
                        .with_timestamp(at(&format!("{base}:01Z"))),
                    LogEvent::status(id, ExecutionStatus::Completed)
                        .with_timestamp(at(&format!("{base}:01Z"))),
                ],
            )
            .unwrap();
    }

    #[test]
    fn empty_store_lists_nothing() {
        let (_temp, _store, engine) = setup();
        let list = engine.list_recent(20).unwrap();
        assert!(list.executions.is_empty());
        assert_eq!(list.count, 0);
        assert_eq!(list.total_available, 0);
        assert!(engine.latest_across_all(50, 10).unwrap().entries.is_empty());
    }

    #[test]
    fn list_recent_follows_mtime_and_limit() {
        let (_temp, store, engine) = setup();
        for (i, id) in ["exec-1", "exec-2", "exec-3"].iter().enumerate() {
            write_completed(&store, id, i as u32);
        }
        set_mtime(&store, "exec-1", 300);
        set_mtime(&store, "exec-2", 100);
        set_mtime(&store, "exec-3", 200);

        let list = engine.list_recent(2).unwrap();
        let ids: Vec<&str> = list.executions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["exec-1", "exec-3"]);
        assert_eq!(list.total_available, 3);
        assert_eq!(list.executions[0].status, ExecutionStatus::Completed);
        assert_eq!(list.executions[0].description, "run exec-1");
        assert_eq!(list.executions[0].output_preview, "exec-1\n");
    }

    #[test]
    fn corrupt_file_is_left_out_of_listing() {
        let (temp, store, engine) = setup();
        for i in 0..9 {
            write_completed(&store, &format!("exec-ok{i}"), i);
        }
        fs::write(temp.path().join("exec-broken.jsonl"), "{{{{ garbage\n\u{0}\u{1}").unwrap();

        let list = engine.list_recent(10).unwrap();
        assert_eq!(list.count, 9);
        assert!(list.executions.iter().all(|s| s.id.starts_with("exec-ok")));
    }

    #[test]
    fn running_record_is_not_promoted() {
        let (_temp, store, engine) = setup();
        store
            .put_all(
                "exec-r",
                &[
                    LogEvent::started("exec-r", ExecutionKind::Shell, None),
                    LogEvent::code("exec-r", "sleep 100", None),
                ],
            )
            .unwrap();
        let list = engine.list_recent(5).unwrap();
        assert_eq!(list.executions[0].status, ExecutionStatus::Running);
    }

    #[test]
    fn get_by_id_trims_and_keeps_order() {
        let (_temp, store, engine) = setup();
        write_completed(&store, "exec-g", 0);

        let detail = engine.get_by_id("exec-g").unwrap();
        assert_eq!(detail.count, 4);
        let expected: Vec<LogEvent> = store
            .get("exec-g")
            .unwrap()
            .iter()
            .map(LogEvent::trimmed)
            .collect();
        assert_eq!(detail.entries, expected);
        match &detail.entries[2].body {
            crate::storage::EventBody::Output { output, .. } => assert_eq!(output, "exec-g"),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn get_by_id_reports_not_found() {
        let (temp, _store, engine) = setup();
        fs::write(temp.path().join("exec-junk.jsonl"), "junk\n").unwrap();
        assert!(engine.get_by_id("exec-none").unwrap_err().is_not_found());
        assert!(engine.get_by_id("exec-junk").unwrap_err().is_not_found());
        assert!(engine.get_by_id("../escape").unwrap_err().is_not_found());
    }

    #[test]
    fn latest_orders_later_completion_first() {
        let (_temp, store, engine) = setup();
        write_completed(&store, "exec-early", 1);
        write_completed(&store, "exec-late", 2);

        let feed = engine.latest_across_all(50, 10).unwrap();
        assert_eq!(feed.count, 8);
        assert_eq!(feed.entries[0].id.as_deref(), Some("exec-late"));
        assert_eq!(feed.entries[0].timestamp, Some(at("2026-05-01T12:02:01Z")));
        assert!(feed.total_available.is_none());
    }

    #[test]
    fn latest_only_takes_each_file_tail() {
        let (_temp, store, engine) = setup();
        let events: Vec<LogEvent> = (0..15)
            .map(|i| {
                LogEvent::status("exec-t", ExecutionStatus::Running)
                    .with_timestamp(at(&format!("2026-05-01T13:00:{i:02}Z")))
            })
            .collect();
        store.put_all("exec-t", &events).unwrap();

        let feed = engine.latest_across_all(50, 10).unwrap();
        assert_eq!(feed.count, TAIL_EVENTS_PER_FILE);
        assert_eq!(feed.entries.last().unwrap().timestamp, Some(at("2026-05-01T13:00:05Z")));
    }

    #[test]
    fn ties_and_missing_timestamps_keep_scan_order() {
        let (_temp, store, engine) = setup();
        let stamp = at("2026-05-01T14:00:00Z");
        let mut untimed = LogEvent::status("exec-s", ExecutionStatus::Completed);
        untimed.timestamp = None;
        store
            .put_all(
                "exec-s",
                &[
                    untimed,
                    LogEvent::started("exec-s", ExecutionKind::Shell, None).with_timestamp(stamp),
                    LogEvent::code("exec-s", "true", None).with_timestamp(stamp),
                    LogEvent::output("exec-s", String::new(), String::new(), 1, Some(0))
                        .with_timestamp(stamp),
                ],
            )
            .unwrap();

        let feed = engine.all_recent_entries(20, 100).unwrap();
        let types: Vec<&str> = feed
            .entries
            .iter()
            .map(|e| match e.body {
                crate::storage::EventBody::Started { .. } => "started",
                crate::storage::EventBody::Code { .. } => "code",
                crate::storage::EventBody::Output { .. } => "output",
                _ => "other",
            })
            .collect();
        assert_eq!(types, vec!["started", "code", "output", "other"]);
    }

    #[test]
    fn all_recent_reports_truncation() {
        let (_temp, store, engine) = setup();
        for i in 0..3 {
            write_completed(&store, &format!("exec-{i}"), i);
        }
        let feed = engine.all_recent_entries(20, 5).unwrap();
        assert_eq!(feed.count, 5);
        assert_eq!(feed.total_available, Some(12));
        assert_eq!(feed.entries[0].id.as_deref(), Some("exec-2"));

        let narrow = engine.all_recent_entries(1, 100).unwrap();
        assert_eq!(narrow.total_available, Some(4));
    }

    #[test]
    fn get_record_folds_current_state() {
        let (_temp, store, engine) = setup();
        write_completed(&store, "exec-x", 3);
        let record = engine.get_record("exec-x").unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.created_at, Some(at("2026-05-01T12:03:00Z")));
    }
}
