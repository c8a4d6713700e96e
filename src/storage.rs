use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Interpreter family for an execution.
///
/// Serialized as a bare string. Labels other than the known ones are kept
/// verbatim and run through the shell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExecutionKind {
    Python,
    Shell,
    Other(String),
}

impl ExecutionKind {
    pub fn parse(label: &str) -> Self {
        let label = label.trim();
        match label.to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => ExecutionKind::Python,
            "shell" | "sh" | "bash" => ExecutionKind::Shell,
            _ => ExecutionKind::Other(label.to_string()),
        }
    }

    /// Guess the kind from the code itself.
    pub fn infer(code: &str) -> Self {
        if code.contains("import ") || code.contains("def ") || code.contains("print(") {
            ExecutionKind::Python
        } else {
            ExecutionKind::Shell
        }
    }

    /// A missing, empty or `auto` label falls back to inference.
    pub fn resolve(label: Option<&str>, code: &str) -> Self {
        match label.map(str::trim) {
            None | Some("") => Self::infer(code),
            Some(l) if l.eq_ignore_ascii_case("auto") => Self::infer(code),
            Some(l) => Self::parse(l),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ExecutionKind::Python => "python",
            ExecutionKind::Shell => "shell",
            ExecutionKind::Other(label) => label,
        }
    }

    pub fn is_python(&self) -> bool {
        matches!(self, ExecutionKind::Python)
    }
}

impl From<String> for ExecutionKind {
    fn from(label: String) -> Self {
        ExecutionKind::parse(&label)
    }
}

impl From<ExecutionKind> for String {
    fn from(kind: ExecutionKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Running,
    Completed,
    Error,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of an execution log file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>, // Execution the event belongs to
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_timestamp"
    )]
    pub timestamp: Option<DateTime<Utc>>, // When the event was written
    #[serde(flatten)]
    pub body: EventBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    Started {
        kind: ExecutionKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Code {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Output {
        #[serde(default)]
        output: String,
        #[serde(default)]
        error_output: String,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    Status {
        status: ExecutionStatus,
    },
    // Whole-record form, written by `RecordStore::replace`
    Snapshot {
        kind: ExecutionKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default)]
        code: String,
        status: ExecutionStatus,
        #[serde(default)]
        output: String,
        #[serde(default)]
        error_output: String,
        #[serde(default)]
        duration_ms: u64,
    },
}

impl LogEvent {
    pub fn new(id: &str, body: EventBody) -> Self {
        Self {
            id: Some(id.to_string()),
            timestamp: Some(Utc::now()),
            body,
        }
    }

    pub fn started(id: &str, kind: ExecutionKind, description: Option<String>) -> Self {
        Self::new(id, EventBody::Started { kind, description })
    }

    pub fn code(id: &str, code: &str, description: Option<String>) -> Self {
        Self::new(
            id,
            EventBody::Code {
                code: code.to_string(),
                description,
            },
        )
    }

    pub fn output(
        id: &str,
        output: String,
        error_output: String,
        duration_ms: u64,
        exit_code: Option<i32>,
    ) -> Self {
        Self::new(
            id,
            EventBody::Output {
                output,
                error_output,
                duration_ms,
                exit_code,
            },
        )
    }

    pub fn status(id: &str, status: ExecutionStatus) -> Self {
        Self::new(id, EventBody::Status { status })
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Copy of the event with every free-text field whitespace-trimmed.
    pub fn trimmed(&self) -> Self {
        let mut event = self.clone();
        match &mut event.body {
            EventBody::Started { description, .. } => trim_opt(description),
            EventBody::Code { code, description } => {
                trim_in_place(code);
                trim_opt(description);
            }
            EventBody::Output {
                output,
                error_output,
                ..
            } => {
                trim_in_place(output);
                trim_in_place(error_output);
            }
            EventBody::Status { .. } => {}
            EventBody::Snapshot {
                description,
                code,
                output,
                error_output,
                ..
            } => {
                trim_opt(description);
                trim_in_place(code);
                trim_in_place(output);
                trim_in_place(error_output);
            }
        }
        event
    }
}

fn trim_in_place(text: &mut String) {
    let trimmed = text.trim();
    if trimmed.len() != text.len() {
        *text = trimmed.to_string();
    }
}

fn trim_opt(text: &mut Option<String>) {
    if let Some(text) = text {
        trim_in_place(text);
    }
}

/// Accepts RFC 3339, or a naive ISO-8601 timestamp which is read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}"))),
    }
}

/// Current state of one execution, folded from its events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>, // Earliest timestamp in the file
    pub updated_at: Option<DateTime<Utc>>, // Latest timestamp in the file
    pub kind: Option<ExecutionKind>,
    pub description: Option<String>,
    pub code: String,
    pub status: ExecutionStatus,
    pub output: String,
    pub error_output: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_case_insensitive_and_keep_unknown_labels() {
        assert_eq!(ExecutionKind::parse("Python"), ExecutionKind::Python);
        assert_eq!(ExecutionKind::parse("bash"), ExecutionKind::Shell);
        assert_eq!(
            ExecutionKind::parse("node"),
            ExecutionKind::Other("node".to_string())
        );
        assert_eq!(ExecutionKind::Other("node".to_string()).as_str(), "node");
    }

    #[test]
    fn auto_kind_is_inferred_from_code() {
        assert_eq!(
            ExecutionKind::resolve(Some("auto"), "import os\nprint(os.getcwd())"),
            ExecutionKind::Python
        );
        assert_eq!(ExecutionKind::resolve(None, "ls -la | head"), ExecutionKind::Shell);
        assert_eq!(
            ExecutionKind::resolve(Some("shell"), "print('x')"),
            ExecutionKind::Shell
        );
    }

    #[test]
    fn event_line_shape() {
        let ts = parse_timestamp("2026-01-02T03:04:05Z").unwrap();
        let event = LogEvent::status("exec-a", ExecutionStatus::Completed).with_timestamp(ts);
        let line = serde_json::to_string(&event).unwrap();
        assert_eq!(
            line,
            r#"{"id":"exec-a","timestamp":"2026-01-02T03:04:05Z","type":"status","status":"completed"}"#
        );
    }

    #[test]
    fn parses_lines_without_id_or_timestamp() {
        let event: LogEvent =
            serde_json::from_str(r#"{"type":"code","code":"echo hi"}"#).unwrap();
        assert_eq!(event.id, None);
        assert_eq!(event.timestamp, None);
        assert_eq!(
            event.body,
            EventBody::Code {
                code: "echo hi".to_string(),
                description: None
            }
        );
    }

    #[test]
    fn naive_timestamps_are_read_as_utc() {
        let event: LogEvent = serde_json::from_str(
            r#"{"id":"x","timestamp":"2025-07-07T10:19:00.123456","type":"status","status":"timeout"}"#,
        )
        .unwrap();
        let ts = event.timestamp.unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-07-07T10:19:00.123456+00:00");
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        assert!(serde_json::from_str::<LogEvent>(r#"{"id":"x","type":"bogus"}"#).is_err());
        assert!(serde_json::from_str::<LogEvent>(
            r#"{"id":"x","timestamp":"yesterday","type":"status","status":"running"}"#
        )
        .is_err());
    }

    #[test]
    fn trimmed_strips_text_fields_only() {
        let event = LogEvent::output("x", "  hi\n".to_string(), "\n".to_string(), 7, Some(0));
        match event.trimmed().body {
            EventBody::Output {
                output,
                error_output,
                duration_ms,
                ..
            } => {
                assert_eq!(output, "hi");
                assert_eq!(error_output, "");
                assert_eq!(duration_ms, 7);
            }
            other => panic!("unexpected body {other:?}"),
        }
    }
}
