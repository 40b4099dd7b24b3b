//! OS process liveness, signalling and resource snapshots.
//!
//! Callers that only need a yes/no answer go through [`LivenessProbe`], so
//! status reconciliation can run against a fixed process table in tests.

use std::fmt;
use std::io;

use sysinfo::{Pid, System};
use tracing::debug;

use crate::{DomainError, DomainResult};

// ============================================================================
// Liveness
// ============================================================================

/// Answers "is this PID a live process?".
pub trait LivenessProbe {
    fn is_alive(&self, pid: u32) -> bool;

    /// Same as [`LivenessProbe::is_alive`], treating a missing PID as dead.
    fn is_alive_opt(&self, pid: Option<u32>) -> bool {
        pid.is_some_and(|pid| self.is_alive(pid))
    }

    /// Liveness of a recorded process.
    ///
    /// When `start_ticks` was recorded, a live process that started at a
    /// different time holds a reused PID and counts as dead.
    fn is_alive_since(&self, pid: Option<u32>, _start_ticks: Option<u64>) -> bool {
        self.is_alive_opt(pid)
    }
}

/// Liveness backed by the real OS process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLiveness;

impl LivenessProbe for SystemLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        is_process_alive(pid)
    }

    fn is_alive_since(&self, pid: Option<u32>, start_ticks: Option<u64>) -> bool {
        pid.is_some_and(|pid| is_same_process(pid, start_ticks))
    }
}

/// Checks whether a process with the given PID exists.
///
/// `kill(pid, 0)` succeeding or failing with `EPERM` both mean the process
/// exists. Zombies (exited but not yet reaped) count as dead.
pub fn is_process_alive(pid: u32) -> bool {
    match raw_pid(pid) {
        Some(raw) => process_exists(raw) && !is_zombie(raw),
        None => false,
    }
}

/// Start time of `pid` in clock ticks since boot (`/proc/<pid>/stat` field 22).
///
/// Stable for the lifetime of a process, so it tells a reused PID apart.
pub fn process_start_ticks(pid: u32) -> Option<u64> {
    let raw = raw_pid(pid)?;
    procfs::process::Process::new(raw)
        .and_then(|p| p.stat())
        .ok()
        .map(|stat| stat.starttime)
}

/// [`is_process_alive`], plus a start time match when one is known.
pub fn is_same_process(pid: u32, start_ticks: Option<u64>) -> bool {
    if !is_process_alive(pid) {
        return false;
    }
    let Some(expected) = start_ticks else {
        return true;
    };
    match process_start_ticks(pid) {
        Some(current) if current == expected => true,
        Some(current) => {
            debug!(pid, expected, current, "start time mismatch, PID reused");
            false
        }
        None => false,
    }
}

#[cfg(unix)]
fn process_exists(pid: i32) -> bool {
    // SAFETY: signal 0 performs error checking only, nothing is delivered.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_exists(pid: i32) -> bool {
    procfs::process::Process::new(pid).is_ok()
}

fn is_zombie(pid: i32) -> bool {
    let zombie = procfs::process::Process::new(pid)
        .and_then(|p| p.stat())
        .map(|stat| stat.state == 'Z')
        .unwrap_or(false);
    if zombie {
        debug!(pid, "process is a zombie, treating as dead");
    }
    zombie
}

/// PIDs we are willing to signal: non-zero and representable as `pid_t`.
///
/// Negative or zero values would address process groups.
fn raw_pid(pid: u32) -> Option<i32> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(raw),
        _ => None,
    }
}

// ============================================================================
// Signals
// ============================================================================

/// Termination signals the supervisor and `stop` command send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful termination request.
    Term,
    /// Forced kill.
    Kill,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Term => "SIGTERM",
            Self::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    fn raw(&self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sends `signal` to `pid`.
///
/// Returns `Ok(false)` if the process does not exist; that is not an error.
pub fn send_signal(pid: u32, signal: Signal) -> DomainResult<bool> {
    let Some(raw) = raw_pid(pid) else {
        return Ok(false);
    };
    kill(raw, signal).map_err(|reason| DomainError::SignalFailed {
        pid,
        signal: signal.name().to_string(),
        reason,
    })
}

#[cfg(unix)]
fn kill(pid: i32, signal: Signal) -> Result<bool, String> {
    // SAFETY: plain kill(2) on a positive pid.
    let rc = unsafe { libc::kill(pid, signal.raw()) };
    if rc == 0 {
        debug!(pid, signal = %signal, "signal sent");
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(err.to_string())
}

#[cfg(not(unix))]
fn kill(_pid: i32, _signal: Signal) -> Result<bool, String> {
    Err("signals are only supported on Unix systems".to_string())
}

// ============================================================================
// Resource Snapshot
// ============================================================================

/// Point-in-time resource usage of a process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
    pub run_time_secs: u64,
}

impl ProcessSnapshot {
    /// Captures usage for `pid` via `sysinfo`. `None` if the process is gone.
    pub fn capture(pid: u32) -> Option<Self> {
        let mut system = System::new();
        system.refresh_all();

        let process = system.process(Pid::from_u32(pid))?;
        Some(Self {
            pid,
            memory_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
            run_time_secs: process.run_time(),
        })
    }

    /// Memory usage in megabytes.
    pub fn memory_mb(&self) -> u64 {
        self.memory_bytes / 1024 / 1024
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FixedLiveness(HashSet<u32>);

    impl LivenessProbe for FixedLiveness {
        fn is_alive(&self, pid: u32) -> bool {
            self.0.contains(&pid)
        }
    }

    #[test]
    fn test_is_process_alive_current() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(999_999_999));
    }

    #[test]
    fn test_is_process_alive_rejects_zero() {
        assert!(!is_process_alive(0));
    }

    #[test]
    fn test_is_alive_opt_none_is_dead() {
        let probe = FixedLiveness(HashSet::from([7]));
        assert!(!probe.is_alive_opt(None));
        assert!(probe.is_alive_opt(Some(7)));
        assert!(!probe.is_alive_opt(Some(8)));
    }

    #[test]
    fn test_same_process_compares_start_time() {
        let pid = std::process::id();
        let ticks = process_start_ticks(pid).unwrap();
        assert!(is_same_process(pid, Some(ticks)));
        assert!(is_same_process(pid, None));
        assert!(!is_same_process(pid, Some(ticks + 1)));
        assert!(!is_same_process(999_999_999, None));
    }

    #[test]
    fn test_system_liveness_detects_reused_pid() {
        let pid = std::process::id();
        let ticks = process_start_ticks(pid).unwrap();
        assert!(SystemLiveness.is_alive_since(Some(pid), Some(ticks)));
        assert!(!SystemLiveness.is_alive_since(Some(pid), Some(ticks.wrapping_add(7))));
        assert!(!SystemLiveness.is_alive_since(None, Some(ticks)));

        // Probes without a process table ignore the start time.
        let fixed = FixedLiveness(HashSet::from([pid]));
        assert!(fixed.is_alive_since(Some(pid), Some(ticks.wrapping_add(7))));
    }

    #[test]
    fn test_send_signal_to_missing_process() {
        assert!(!send_signal(999_999_999, Signal::Term).unwrap());
    }

    #[test]
    fn test_snapshot_current_process() {
        let snapshot = ProcessSnapshot::capture(std::process::id()).unwrap();
        assert_eq!(snapshot.pid, std::process::id());
        assert!(snapshot.memory_bytes > 0);
    }
}
