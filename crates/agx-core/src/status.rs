//! Status reconciliation.
//!
//! The store only holds the last status a writer recorded. A runner that was
//! killed never gets to record anything, so what the user sees combines the
//! recorded status with live checks of the executor and runner PIDs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{LivenessProbe, SessionEntry, SessionStatus};

/// User-visible status of a session entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "state")]
pub enum DisplayStatus {
    Pending,
    Running,
    /// Executor is gone but the runner is still finishing its bookkeeping.
    PendingCompletion,
    Completed,
    /// `exit_code` is only known when it was derived from a dead process.
    Failed { exit_code: Option<i32> },
    Stopped,
}

impl DisplayStatus {
    /// Returns true if some process for the entry is still doing work.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::PendingCompletion)
    }
}

impl From<SessionStatus> for DisplayStatus {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Pending => Self::Pending,
            SessionStatus::Running => Self::Running,
            SessionStatus::Completed => Self::Completed,
            SessionStatus::Failed => Self::Failed { exit_code: None },
            SessionStatus::Stopped => Self::Stopped,
        }
    }
}

impl fmt::Display for DisplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running => f.write_str("running"),
            Self::PendingCompletion => f.write_str("pending-completion"),
            Self::Completed => f.write_str("completed"),
            Self::Failed { exit_code: Some(code) } => write!(f, "failed ({code})"),
            Self::Failed { exit_code: None } => f.write_str("failed"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// Computes what to show for `entry`.
///
/// Precedence:
/// 1. recorded `running`: executor alive → running; executor dead but runner
///    alive → pending-completion; exit code 0 → completed; other exit code →
///    `failed (<code>)`; otherwise stopped.
/// 2. recorded `completed`/`failed`: trusted as-is.
/// 3. anything else: running if either PID is alive, else the recorded status.
///
/// Never mutates the entry; persisting a correction is the caller's call.
pub fn resolve_display_status<P>(entry: &SessionEntry, probe: &P) -> DisplayStatus
where
    P: LivenessProbe + ?Sized,
{
    let executor_alive = probe.is_alive_since(entry.executor_pid, entry.executor_start_ticks);
    let runner_alive = probe.is_alive_since(entry.runner_pid, entry.runner_start_ticks);

    match entry.status {
        SessionStatus::Running => {
            if executor_alive {
                DisplayStatus::Running
            } else if runner_alive {
                DisplayStatus::PendingCompletion
            } else {
                match entry.exit_code {
                    Some(0) => DisplayStatus::Completed,
                    Some(code) => DisplayStatus::Failed {
                        exit_code: Some(code),
                    },
                    None => DisplayStatus::Stopped,
                }
            }
        }
        SessionStatus::Completed | SessionStatus::Failed => entry.status.into(),
        SessionStatus::Pending | SessionStatus::Stopped => {
            if executor_alive || runner_alive {
                DisplayStatus::Running
            } else {
                entry.status.into()
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
