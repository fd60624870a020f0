//! Handler discovery and dispatch.
//!
//! An action name maps 1:1 to an executable discovered in the handler
//! directory. Dispatch hands the full envelope JSON to the executable's
//! stdin under a wall-clock timeout and classifies the outcome. Each
//! invocation is an independent subprocess with its own captured streams;
//! the only shared state between dispatches is the read-only handler table,
//! which is rebuilt wholesale on rescan.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use swarm_protocol::{Envelope, SwarmError, SwarmResult};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

/// Action name → executable path, discovered by scanning a directory.
#[derive(Debug, Clone, Default)]
pub struct HandlerSet {
    handlers: BTreeMap<String, PathBuf>,
}

impl HandlerSet {
    /// Scan `dir` for handler executables.
    ///
    /// Only regular executable files count; dotfiles and directories are
    /// skipped. The filename is the action name. A missing directory yields
    /// an empty set rather than an error.
    pub fn discover(dir: &Path) -> Self {
        let mut handlers = BTreeMap::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), %err, "handler directory not readable");
                return Self { handlers };
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') || !path.is_file() {
                continue;
            }
            if !is_executable(&path) {
                debug!(path = %path.display(), "skipping non-executable entry");
                continue;
            }
            info!(action = name, path = %path.display(), "discovered handler");
            handlers.insert(name.to_owned(), path);
        }

        Self { handlers }
    }

    pub fn get(&self, action: &str) -> Option<&PathBuf> {
        self.handlers.get(action)
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

/// Raw result of running one handler process.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// The one capability the dispatcher needs from the platform: run a program
/// with envelope bytes on stdin and capture what came back.
#[async_trait]
pub trait HandlerRunner: Send + Sync {
    async fn run(&self, program: &Path, input: &[u8], limit: Duration) -> SwarmResult<ExecOutcome>;
}

/// Runs handlers as real subprocesses via tokio.
#[derive(Debug, Clone, Default)]
pub struct SubprocessRunner;

#[async_trait]
impl HandlerRunner for SubprocessRunner {
    #[instrument(skip(self, input), fields(program = %program.display()))]
    async fn run(&self, program: &Path, input: &[u8], limit: Duration) -> SwarmResult<ExecOutcome> {
        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // A handler that never reads stdin can make write_all fail with
            // a broken pipe; that is its choice, not a dispatch error.
            let _ = stdin.write_all(input).await;
        }

        match timeout(limit, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(ExecOutcome {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    timed_out: false,
                })
            }
            // Dropping the wait future drops the child, and kill_on_drop
            // takes the process down with it.
            Err(_) => Ok(ExecOutcome {
                exit_code: None,
                stdout: String::new(),
                stderr: format!("handler timed out after {}s", limit.as_secs()),
                timed_out: true,
            }),
        }
    }
}

/// Why a dispatch did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    /// Non-zero exit status.
    Exit,
    /// Exit 0 but stdout was not a JSON object/value.
    BadOutput,
    /// Wall-clock limit exceeded, process killed.
    Timeout,
    /// The executable could not be started at all, e.g. removed or made
    /// unreadable after discovery.
    Spawn,
}

/// Classified result of dispatching an envelope to its handler.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub action: String,
    pub result: Result<Value, (FailureReason, String)>,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl DispatchReport {
    pub fn ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Retained result payload published to the per-node-per-action topic.
    pub fn to_payload(&self, node_id: &str, source_id: &str) -> Value {
        match &self.result {
            Ok(value) => json!({
                "node_id": node_id,
                "action": self.action,
                "ok": true,
                "result": value,
                "source": source_id,
                "ts": self.started_at.timestamp(),
                "duration_ms": self.duration_ms,
            }),
            Err((reason, detail)) => json!({
                "node_id": node_id,
                "action": self.action,
                "ok": false,
                "reason": reason,
                "error": detail,
                "source": source_id,
                "ts": self.started_at.timestamp(),
                "duration_ms": self.duration_ms,
            }),
        }
    }

    /// The failure as a protocol error, for escalation and logging.
    pub fn to_error(&self, timeout_secs: u64) -> Option<SwarmError> {
        match &self.result {
            Ok(_) => None,
            Err((FailureReason::Timeout, _)) => Some(SwarmError::HandlerTimeout {
                action: self.action.clone(),
                timeout_secs,
            }),
            Err((_, detail)) => Some(SwarmError::HandlerFailure {
                action: self.action.clone(),
                reason: detail.clone(),
            }),
        }
    }
}

/// Dispatches action envelopes to discovered handler executables.
pub struct Dispatcher {
    handler_dir: PathBuf,
    limit: Duration,
    runner: Arc<dyn HandlerRunner>,
    handlers: RwLock<HandlerSet>,
}

impl Dispatcher {
    pub fn new(handler_dir: impl Into<PathBuf>, limit: Duration, runner: Arc<dyn HandlerRunner>) -> Self {
        Self {
            handler_dir: handler_dir.into(),
            limit,
            runner,
            handlers: RwLock::new(HandlerSet::default()),
        }
    }

    /// Discover (or re-discover) handlers, replacing the table wholesale.
    /// Returns the number of handlers now registered.
    pub fn rescan(&self) -> usize {
        let set = HandlerSet::discover(&self.handler_dir);
        let count = set.len();
        *self.handlers.write() = set;
        count
    }

    pub fn has_handler(&self, action: &str) -> bool {
        self.handlers.read().contains(action)
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.read().names()
    }

    pub fn timeout_secs(&self) -> u64 {
        self.limit.as_secs()
    }

    /// Run the handler for the envelope's action.
    ///
    /// `Err(HandlerNotFound)` when the action has no executable — the caller
    /// escalates to the agent bridge instead of failing silently. All other
    /// outcomes (success, failure, timeout) come back as a report.
    #[instrument(skip(self, envelope), fields(id = %envelope.id, action = ?envelope.action))]
    pub async fn dispatch(&self, envelope: &Envelope) -> SwarmResult<DispatchReport> {
        let action = envelope
            .action
            .clone()
            .ok_or_else(|| SwarmError::HandlerNotFound("<none>".to_owned()))?;
        let program = self
            .handlers
            .read()
            .get(&action)
            .cloned()
            .ok_or_else(|| SwarmError::HandlerNotFound(action.clone()))?;

        let input = envelope.to_json().into_bytes();
        let started_at = Utc::now();
        // A spawn failure is a failed dispatch like any other: the result
        // still gets published and the sender still gets its response.
        let (result, exit_code) = match self.runner.run(&program, &input, self.limit).await {
            Ok(outcome) => (classify(&outcome), outcome.exit_code),
            Err(err) => (Err((FailureReason::Spawn, err.to_string())), None),
        };
        let duration_ms = (Utc::now() - started_at).num_milliseconds();

        match &result {
            Ok(_) => info!(action, duration_ms, "handler succeeded"),
            Err((reason, detail)) => {
                error!(action, ?reason, detail, duration_ms, "handler failed");
            }
        }

        Ok(DispatchReport {
            action,
            result,
            exit_code,
            started_at,
            duration_ms,
        })
    }
}

fn classify(outcome: &ExecOutcome) -> Result<Value, (FailureReason, String)> {
    if outcome.timed_out {
        return Err((FailureReason::Timeout, outcome.stderr.trim().to_owned()));
    }
    if outcome.exit_code != Some(0) {
        let detail = if outcome.stderr.trim().is_empty() {
            format!("exit status {:?}", outcome.exit_code)
        } else {
            outcome.stderr.trim().to_owned()
        };
        return Err((FailureReason::Exit, detail));
    }
    match serde_json::from_str(outcome.stdout.trim()) {
        Ok(value) => Ok(value),
        Err(err) => Err((
            FailureReason::BadOutput,
            format!("stdout is not valid JSON: {err}"),
        )),
    }
}
