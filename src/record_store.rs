//! Flat-directory store of execution logs.
//!
//! Every execution owns one `<id>.jsonl` file holding newline-delimited JSON
//! events. Writers only ever append whole lines or atomically rename a fully
//! written replacement into place, so a reader never sees a torn record: at
//! worst an unfinished last line, which fails to parse and is skipped.

use crate::error::{Result, StoreError};
use crate::storage::LogEvent;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

pub const LOG_EXTENSION: &str = "jsonl";

#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Call `sync_data` after every write.
    pub fsync: bool,
}

#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
    options: StoreOptions,
}

/// Parsed content of one log file.
#[derive(Debug, Default)]
pub struct LoadedLog {
    pub events: Vec<LogEvent>,
    pub skipped_lines: usize, // Non-blank lines that failed to parse
}

impl RecordStore {
    pub fn open(dir: impl Into<PathBuf>, options: StoreOptions) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self { dir, options })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ids become file names, so only a conservative character set is allowed.
    pub fn validate_id(id: &str) -> Result<()> {
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(())
        } else {
            Err(StoreError::InvalidId(id.to_string()))
        }
    }

    pub fn file_name_for(id: &str) -> String {
        format!("{}.{}", id, LOG_EXTENSION)
    }

    pub fn path_for(&self, id: &str) -> Result<PathBuf> {
        Self::validate_id(id)?;
        Ok(self.dir.join(Self::file_name_for(id)))
    }

    pub fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.path_for(id)?.exists())
    }

    /// Appends one event. The runner batches its writes through `put_all`.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn put(&self, id: &str, event: &LogEvent) -> Result<()> {
        self.put_all(id, std::slice::from_ref(event))
    }

    /// Appends the events as one write, so they land together or not at all
    /// as far as line-oriented readers are concerned.
    pub fn put_all(&self, id: &str, events: &[LogEvent]) -> Result<()> {
        let path = self.path_for(id)?;
        let buffer = encode_lines(events)?;

        fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.write_all(&buffer)
            .map_err(|e| StoreError::io(&path, e))?;
        if self.options.fsync {
            file.sync_data().map_err(|e| StoreError::io(&path, e))?;
        }

        debug!(id, events = events.len(), "appended log events");
        Ok(())
    }

    /// Replaces the whole file through a temporary sibling and an atomic rename.
    pub fn replace(&self, id: &str, events: &[LogEvent]) -> Result<()> {
        let path = self.path_for(id)?;
        let buffer = encode_lines(events)?;

        fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;

        let mut temp = NamedTempFile::new_in(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        temp.write_all(&buffer)
            .map_err(|e| StoreError::io(temp.path(), e))?;
        if self.options.fsync {
            temp.as_file()
                .sync_data()
                .map_err(|e| StoreError::io(temp.path(), e))?;
        }
        temp.persist(&path)
            .map_err(|e| StoreError::io(&path, e.error))?;

        debug!(id, events = events.len(), "replaced log file");
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<LoadedLog> {
        let path = self.path_for(id)?;
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LoadedLog::default()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let mut reader = BufReader::new(file);
        let mut loaded = LoadedLog::default();
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .map_err(|e| StoreError::io(&path, e))?;
            if read == 0 {
                break;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<LogEvent>(&line) {
                Ok(event) => loaded.events.push(event),
                Err(e) => {
                    loaded.skipped_lines += 1;
                    debug!(id, error = %e, "skipping unparseable log line");
                }
            }
        }

        if loaded.skipped_lines > 0 {
            warn!(
                id,
                skipped = loaded.skipped_lines,
                parsed = loaded.events.len(),
                "log file contains unparseable lines"
            );
        }
        Ok(loaded)
    }

    pub fn get(&self, id: &str) -> Result<Vec<LogEvent>> {
        Ok(self.load(id)?.events)
    }

    /// Most recently modified first, at most `limit` ids.
    pub fn list_ids(&self, limit: usize) -> Result<Vec<String>> {
        let mut entries = self.scan()?;
        // Newest first; equal mtimes fall back to the id so the order is stable
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        Ok(entries.into_iter().take(limit).map(|(id, _)| id).collect())
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.scan()?.len())
    }

    /// Nothing is buffered between calls; this only marks the end of the handle.
    pub fn close(self) -> Result<()> {
        debug!(dir = %self.dir.display(), "record store closed");
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(String, SystemTime)>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| StoreError::io(&self.dir, e))?;
            let path = entry.path();

            if path.extension().and_then(|s| s.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if Self::validate_id(id).is_err() {
                continue;
            }

            // Files can vanish between read_dir and stat
            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(&path, e)),
            };
            let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
            entries.push((id.to_string(), modified));
        }
        Ok(entries)
    }
}

fn encode_lines(events: &[LogEvent]) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    for event in events {
        serde_json::to_writer(&mut buffer, event)?;
        buffer.push(b'\n');
    }
    Ok(buffer)
}
