use crate::error::{Result, StoreError};
use crate::record_store::RecordStore;
use crate::storage::{ExecutionKind, ExecutionRecord, ExecutionStatus, LogEvent};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

// How often the supervisor checks the child against the deadline
const POLL_INTERVAL: Duration = Duration::from_millis(10);
// How long pipes may stay open after the process group was killed
const KILL_GRACE: Duration = Duration::from_millis(500);
// Characters of code mixed into the id hash
const ID_CODE_PREFIX_CHARS: usize = 50;

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub python: String,          // Interpreter for python executions
    pub shell: String,           // Shell for everything else
    pub default_timeout_ms: u64, // Used when a request carries no timeout
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            shell: "sh".to_string(),
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub code: String,
    pub kind: Option<String>, // `None` or "auto" infers from the code
    pub description: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// What the subprocess left behind.
struct Captured {
    status: ExecutionStatus,
    output: String,
    error_output: String,
    duration_ms: u64,
    exit_code: Option<i32>,
}

enum Exit {
    Finished(ExitStatus),
    TimedOut,
    WaitFailed(io::Error),
}

pub struct ExecutionRunner {
    store: RecordStore,
    options: RunnerOptions,
}

impl ExecutionRunner {
    pub fn new(store: RecordStore, options: RunnerOptions) -> Self {
        Self { store, options }
    }

    /// Writes the opening events before anything runs, so a crash mid-run
    /// still leaves a discoverable `running` record.
    pub fn create(
        &self,
        code: &str,
        kind: ExecutionKind,
        description: Option<String>,
    ) -> Result<ExecutionRecord> {
        let mut timestamp = Utc::now();
        let mut id = generate_id(code, timestamp);
        while self.store.contains(&id)? {
            timestamp = Utc::now();
            id = generate_id(code, timestamp);
        }

        let description = description
            .filter(|d| !d.trim().is_empty())
            .or_else(|| Some(format!("Execute {} code", kind)));
        self.store.put_all(
            &id,
            &[
                LogEvent::started(&id, kind.clone(), description.clone()).with_timestamp(timestamp),
                LogEvent::code(&id, code, description).with_timestamp(timestamp),
            ],
        )?;

        info!(id = %id, kind = %kind, "execution created");
        self.load_record(&id)
    }

    /// Runs the code and appends the terminal events. Failures and timeouts
    /// come back as record statuses, not as errors.
    pub fn run(
        &self,
        id: &str,
        code: &str,
        kind: &ExecutionKind,
        timeout_ms: Option<u64>,
    ) -> Result<ExecutionRecord> {
        let current = self.load_record(id)?;
        if current.status.is_terminal() {
            return Err(StoreError::AlreadyFinished {
                id: id.to_string(),
                status: current.status,
            });
        }

        let timeout = Duration::from_millis(timeout_ms.unwrap_or(self.options.default_timeout_ms));
        let captured = self.spawn_and_wait(code, kind, timeout);

        // Output first, then the status flip, in one append
        self.store.put_all(
            id,
            &[
                LogEvent::output(
                    id,
                    captured.output,
                    captured.error_output,
                    captured.duration_ms,
                    captured.exit_code,
                ),
                LogEvent::status(id, captured.status),
            ],
        )?;

        info!(
            id,
            status = %captured.status,
            duration_ms = captured.duration_ms,
            "execution finished"
        );
        self.load_record(id)
    }

    pub fn execute(&self, request: ExecutionRequest) -> Result<ExecutionRecord> {
        let kind = ExecutionKind::resolve(request.kind.as_deref(), &request.code);
        let record = self.create(&request.code, kind.clone(), request.description)?;
        self.run(&record.id, &request.code, &kind, request.timeout_ms)
    }

    fn load_record(&self, id: &str) -> Result<ExecutionRecord> {
        let events = self.store.get(id)?;
        ExecutionRecord::from_events(&events).ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn build_command(&self, code: &str, kind: &ExecutionKind) -> Command {
        let mut command = if kind.is_python() {
            Command::new(&self.options.python)
        } else {
            Command::new(&self.options.shell)
        };
        command
            .arg("-c")
            .arg(code)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group, so a timeout can take down grandchildren too
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        command
    }

    fn spawn_and_wait(&self, code: &str, kind: &ExecutionKind, timeout: Duration) -> Captured {
        let start_time = Instant::now();

        let mut child = match self.build_command(code, kind).spawn() {
            Ok(child) => child,
            Err(e) => {
                let program = if kind.is_python() {
                    &self.options.python
                } else {
                    &self.options.shell
                };
                warn!(program = %program, error = %e, "failed to spawn execution");
                return Captured {
                    status: ExecutionStatus::Error,
                    output: String::new(),
                    error_output: format!("Failed to start {}: {}", program, e),
                    duration_ms: elapsed_ms(start_time),
                    exit_code: None,
                };
            }
        };

        // Readers hold a sender each; the channel disconnects once both pipes hit EOF
        let (done_tx, done_rx) = mpsc::channel();
        let stdout_reader = child
            .stdout
            .take()
            .map(|pipe| drain("stdout", pipe, done_tx.clone()));
        let stderr_reader = child
            .stderr
            .take()
            .map(|pipe| drain("stderr", pipe, done_tx.clone()));
        drop(done_tx);

        let deadline = start_time + timeout;
        let mut exit = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Exit::Finished(status),
                Ok(None) => {
                    let now = Instant::now();
                    if now >= deadline {
                        terminate(&mut child);
                        break Exit::TimedOut;
                    }
                    thread::sleep(POLL_INTERVAL.min(deadline - now));
                }
                Err(e) => {
                    terminate(&mut child);
                    break Exit::WaitFailed(e);
                }
            }
        };

        // Background processes can keep the pipes open after the child exits,
        // and the same deadline covers them
        let mut drained = match exit {
            Exit::Finished(_) => wait_for_pipes(&done_rx, deadline),
            _ => wait_for_pipes(&done_rx, Instant::now() + KILL_GRACE),
        };
        if !drained && matches!(exit, Exit::Finished(_)) {
            terminate(&mut child);
            exit = Exit::TimedOut;
            drained = wait_for_pipes(&done_rx, Instant::now() + KILL_GRACE);
        }
        if !drained {
            warn!("pipes still open after kill, keeping partial output");
        }
        let duration_ms = elapsed_ms(start_time);

        let (output, stdout_error) = capture(stdout_reader, drained);
        let (stderr, stderr_error) = capture(stderr_reader, drained);
        let capture_error = match (stdout_error, stderr_error) {
            (Some(a), Some(b)) => Some(format!("{}\n{}", a, b)),
            (a, b) => a.or(b),
        };

        outcome(exit, output, stderr, capture_error, timeout, duration_ms)
    }
}

fn elapsed_ms(start_time: Instant) -> u64 {
    start_time.elapsed().as_millis() as u64
}

/// Maps how the process ended, and whether its streams were read in full,
/// to the terminal status.
fn outcome(
    exit: Exit,
    output: String,
    stderr: String,
    capture_error: Option<String>,
    timeout: Duration,
    duration_ms: u64,
) -> Captured {
    match exit {
        Exit::Finished(status) => match capture_error {
            None => Captured {
                status: ExecutionStatus::Completed,
                output,
                error_output: stderr,
                duration_ms,
                exit_code: status.code(),
            },
            Some(message) => {
                warn!(error = %message, "execution output could not be captured");
                Captured {
                    status: ExecutionStatus::Error,
                    output,
                    error_output: with_stderr(message, &stderr),
                    duration_ms,
                    exit_code: status.code(),
                }
            }
        },
        Exit::TimedOut => {
            debug!(timeout_ms = timeout.as_millis() as u64, "execution deadline exceeded");
            let mut message = format!("Execution timed out after {}ms", timeout.as_millis());
            if let Some(capture_error) = capture_error {
                message.push('\n');
                message.push_str(&capture_error);
            }
            Captured {
                status: ExecutionStatus::Timeout,
                output,
                error_output: with_stderr(message, &stderr),
                duration_ms,
                exit_code: None,
            }
        }
        Exit::WaitFailed(e) => Captured {
            status: ExecutionStatus::Error,
            output,
            error_output: with_stderr(format!("Failed to wait for execution: {}", e), &stderr),
            duration_ms,
            exit_code: None,
        },
    }
}

fn with_stderr(mut message: String, stderr: &str) -> String {
    if !stderr.is_empty() {
        message.push('\n');
        message.push_str(stderr);
    }
    message
}

/// One pipe being read on its own thread. The buffer is shared so partial
/// output survives even when the thread cannot be joined.
struct PipeReader {
    name: &'static str,
    buffer: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<io::Result<()>>,
}

fn drain<R: Read + Send + 'static>(
    name: &'static str,
    mut reader: R,
    done: Sender<()>,
) -> PipeReader {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let collected = Arc::clone(&buffer);
    let handle = thread::spawn(move || {
        // Dropped on return, which is what the supervisor waits for
        let _done = done;
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(bytes_read) => lock(&collected).extend_from_slice(&chunk[..bytes_read]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    });
    PipeReader {
        name,
        buffer,
        handle,
    }
}

/// Blocks until every reader finished or `until` passes. True when all finished.
fn wait_for_pipes(done: &Receiver<()>, until: Instant) -> bool {
    loop {
        let now = Instant::now();
        if now >= until {
            return matches!(done.try_recv(), Err(TryRecvError::Disconnected));
        }
        match done.recv_timeout(until - now) {
            Ok(()) => continue,
            Err(RecvTimeoutError::Disconnected) => return true,
            Err(RecvTimeoutError::Timeout) => return false,
        }
    }
}

/// Text read so far, plus a description of the read failure if there was one.
/// Readers are only joined once `drained`; otherwise they are left detached.
fn capture(reader: Option<PipeReader>, drained: bool) -> (String, Option<String>) {
    let Some(reader) = reader else {
        return (String::new(), None);
    };

    let error = if drained {
        match reader.handle.join() {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("Failed to capture {}: {}", reader.name, e)),
            Err(_) => Some(format!("Failed to capture {}: reader thread panicked", reader.name)),
        }
    } else {
        None
    };

    let bytes = std::mem::take(&mut *lock(&reader.buffer));
    (String::from_utf8_lossy(&bytes).to_string(), error)
}

// A reader that panicked mid-append still left valid bytes behind
fn lock(buffer: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Kills the child's whole process group and reaps the child.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        let pgid = Pid::from_raw(child.id() as i32);
        if let Err(e) = killpg(pgid, Signal::SIGKILL) {
            debug!(error = %e, "killpg failed, killing child directly");
            let _ = child.kill();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }
    let _ = child.wait();
}

/// `exec-YYYY-MM-DD-HHMMSS-<8 hex>`, the hex taken from a SHA-256 of the
/// full-precision timestamp and the start of the code.
pub fn generate_id(code: &str, timestamp: DateTime<Utc>) -> String {
    let prefix: String = code.chars().take(ID_CODE_PREFIX_CHARS).collect();
    let mut hasher = Sha256::new();
    hasher.update(timestamp.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true).as_bytes());
    hasher.update(b"-");
    hasher.update(prefix.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("exec-{}-{}", timestamp.format("%Y-%m-%d-%H%M%S"), &digest[..8])
}

/// Human-readable rendering of a finished (or running) execution.
pub fn format_summary(record: &ExecutionRecord) -> String {
    let kind = record
        .kind
        .as_ref()
        .map_or("unknown", |k| k.as_str());
    let description = record
        .description
        .as_deref()
        .unwrap_or("No description provided");

    let mut summary = match kind {
        "python" => format!("Executing python code: {}\n", description),
        "shell" => format!("Executing shell command: {}\n", description),
        other => format!("Executing {} code: {}\n", other, description),
    };
    if !record.output.is_empty() {
        summary.push_str("Output:\n");
        summary.push_str(record.output.trim_end());
        summary.push('\n');
    }
    if !record.error_output.is_empty() {
        summary.push_str("Errors:\n");
        summary.push_str(record.error_output.trim_end());
        summary.push('\n');
    }
    summary.push_str(&format!("Status: {}\n", record.status));
    summary.push_str(&format!("Execution time: {}ms", record.duration_ms));
    summary
}
