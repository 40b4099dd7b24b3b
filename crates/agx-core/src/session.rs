//! Session domain entities and value objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::process::process_start_ticks;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Externally assigned identifier for an agent session.
///
/// Executors announce it through a `session.created` event some time after
/// the invocation starts. Until then an entry lives under a provisional key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new SessionId from a string.
    ///
    /// Note: no format validation. The executor owns the identifier format.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a shortened display form (first 8 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Session Status
// ============================================================================

/// Last authoritatively recorded status of an invocation.
///
/// This is what the store holds. What the user sees is computed by
/// [`crate::resolve_display_status`], which also looks at process liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created but the executor has not been started yet.
    #[default]
    Pending,
    /// Runner or executor has been launched.
    Running,
    /// Executor exited with code 0.
    Completed,
    /// Executor exited non-zero or could not be spawned.
    Failed,
    /// Stopped on user request.
    Stopped,
}

impl SessionStatus {
    /// Returns the display label for this status.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Returns true if the executor has finished, one way or another.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Session Entry
// ============================================================================

/// Persisted record of one agent invocation.
///
/// While `session_id` is `None` the entry is stored under its provisional
/// `name`. Once discovered it is moved (never copied) to live under the
/// session id; `name` is kept so the launcher can still find it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    /// Agent that was invoked.
    #[serde(default)]
    pub agent: String,

    /// Provisional key the entry was created under.
    #[serde(default)]
    pub name: String,

    /// Externally assigned identifier; `None` until discovered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,

    #[serde(default)]
    pub status: SessionStatus,

    /// PID of the process doing the agent's work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_pid: Option<u32>,

    /// PID of the detached wrapper that launched the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_pid: Option<u32>,

    /// Start times (clock ticks since boot) of the two PIDs above, used to
    /// tell a reused PID from the original process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_start_ticks: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_start_ticks: Option<u64>,

    #[serde(default)]
    pub background: bool,

    /// Append-only transcript for this invocation.
    #[serde(default)]
    pub log_file: PathBuf,

    #[serde(default = "Utc::now", alias = "created")]
    pub start_time: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub last_used: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Name of the signal that ended the executor, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_prompt: Option<String>,
}

impl SessionEntry {
    /// Creates a pending entry for an invocation that has not started yet.
    pub fn new(
        agent: impl Into<String>,
        name: impl Into<String>,
        log_file: impl Into<PathBuf>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            agent: agent.into(),
            name: name.into(),
            session_id: None,
            status: SessionStatus::Pending,
            executor_pid: None,
            runner_pid: None,
            executor_start_ticks: None,
            runner_start_ticks: None,
            background: false,
            log_file: log_file.into(),
            start_time,
            last_used: start_time,
            exit_code: None,
            signal: None,
            error: None,
            executor: None,
            mode: None,
            last_prompt: None,
        }
    }

    /// Key this entry belongs under in the store right now.
    pub fn store_key(&self) -> &str {
        match &self.session_id {
            Some(id) => id.as_str(),
            None => &self.name,
        }
    }

    /// Returns true once the real session id is known.
    #[must_use]
    pub fn is_discovered(&self) -> bool {
        self.session_id.is_some()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_file
    }

    /// Updates `last_used` to now.
    pub fn touch(&mut self) {
        self.last_used = Utc::now();
    }

    /// Marks the executor as started.
    ///
    /// Start times are captured for the PIDs given so later liveness checks
    /// survive PID reuse.
    pub fn mark_running(&mut self, executor_pid: Option<u32>, runner_pid: Option<u32>) {
        self.status = SessionStatus::Running;
        self.executor_pid = executor_pid;
        self.executor_start_ticks = executor_pid.and_then(process_start_ticks);
        if let Some(pid) = runner_pid {
            self.set_runner_pid(pid);
        }
        self.error = None;
        self.touch();
    }

    /// Records the runner PID and its start time.
    pub fn set_runner_pid(&mut self, pid: u32) {
        self.runner_pid = Some(pid);
        self.runner_start_ticks = process_start_ticks(pid);
    }

    /// Records the executor's exit.
    ///
    /// `code` is `None` when the process was terminated by a signal.
    pub fn record_exit(&mut self, code: Option<i32>, signal: Option<String>) {
        self.exit_code = code;
        self.signal = signal;
        self.status = if code == Some(0) {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };
        self.touch();
    }

    /// Records that the executor could not be spawned at all.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.status = SessionStatus::Failed;
        self.error = Some(error.into());
        self.touch();
    }

    /// Records a user-requested stop.
    pub fn mark_stopped(&mut self, signal: &str) {
        self.status = SessionStatus::Stopped;
        if self.signal.is_none() {
            self.signal = Some(signal.to_string());
        }
        self.touch();
    }
}

// ============================================================================
// Naming Helpers
// ============================================================================

/// Builds the provisional store key for a new invocation.
///
/// Format: `{slug}-{YYMMDDHHmm}`, e.g. `analyze-2310171530`.
pub fn provisional_key(agent: &str, start_time: DateTime<Utc>) -> String {
    let slug = slugify(agent);
    format!("{slug}-{}", start_time.format("%y%m%d%H%M"))
}

fn slugify(agent: &str) -> String {
    let mut slug = String::with_capacity(agent.len());
    for c in agent.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "session".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Makes an agent name safe to use as a log file stem.
///
/// Keeps `[A-Za-z0-9._-]`, collapses everything else to a single `-`,
/// and trims leading/trailing `-` and `.`.
pub fn sanitize_log_name(agent: &str) -> String {
    let mut out = String::with_capacity(agent.len());
    for c in agent.trim().chars() {
        let c = if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
            c
        } else {
            '-'
        };
        if (c == '-' && out.ends_with('-')) || (c == '.' && out.ends_with('.')) {
            continue;
        }
        out.push(c);
    }
    let trimmed = out.trim_matches(|c| c == '-' || c == '.');
    if trimmed.is_empty() {
        "agent".to_string()
    } else {
        trimmed.to_string()
    }
}

/// File name for an invocation's transcript: `{agent}-{unix_millis}.log`.
pub fn log_file_name(agent: &str, start_time: DateTime<Utc>) -> String {
    format!(
        "{}-{}.log",
        sanitize_log_name(agent),
        start_time.timestamp_millis()
    )
}

// ============================================================================
// Tests
// ============================================================================
