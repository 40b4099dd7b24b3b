//! Background launcher.
//!
//! A background request re-executes the CLI as a detached runner, persists a
//! provisional entry for it and then waits (bounded) until the runner has
//! reported a session id, failed, or the wait times out. The job is never
//! killed on timeout; it keeps running and can be inspected later.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use agx_core::{SessionEntry, SessionId, SessionStatus};
use agx_protocol::{ProtocolError, RunnerHandoff};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::discovery::{LogPoller, SessionDiscovery};
use crate::runner::Invocation;
use crate::store::StoreError;
use crate::ticker::PollTicker;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("background launches are disabled in config")]
    Disabled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("failed to prepare log {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn background runner: {0}")]
    Spawn(#[source] io::Error),
}

/// What the launcher needs to start a runner.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Program to re-execute, normally the current executable.
    pub program: PathBuf,
    /// Arguments for `program`, normally this process's own.
    pub args: Vec<OsString>,
    pub background: bool,
    pub invocation: Invocation,
}

impl LaunchRequest {
    /// Re-executes the running binary with its original arguments.
    pub fn reexec(invocation: Invocation, background: bool) -> io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: std::env::args_os().skip(1).collect(),
            background,
            invocation,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LaunchOutcome {
    /// Not a background request, or this process is already the runner.
    NotHandled,
    Discovered {
        session_id: SessionId,
        runner_pid: u32,
        log_file: PathBuf,
        elapsed: Duration,
    },
    /// The runner recorded a terminal status without an id.
    Failed {
        key: String,
        status: SessionStatus,
        exit_code: Option<i32>,
        error: Option<String>,
        log_file: PathBuf,
    },
    /// No id within the timeout; the job is left running.
    TimedOut {
        key: String,
        runner_pid: u32,
        log_file: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct BackgroundLauncher {
    ctx: Context,
    poll_interval: Duration,
    timeout: Duration,
}

impl BackgroundLauncher {
    pub fn new(ctx: Context) -> Self {
        let launch = &ctx.config().launch;
        let (poll_interval, timeout) = (launch.poll_interval(), launch.timeout());
        Self {
            ctx,
            poll_interval,
            timeout,
        }
    }

    #[must_use]
    pub fn with_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.timeout = timeout;
        self
    }

    pub async fn launch(&self, request: LaunchRequest) -> Result<LaunchOutcome, LaunchError> {
        if !request.background || self.ctx.is_runner() {
            return Ok(LaunchOutcome::NotHandled);
        }
        if !self.ctx.config().launch.enabled {
            return Err(LaunchError::Disabled);
        }

        let entry = request.invocation.entry.clone();
        let key = request.invocation.key().to_string();
        let log_file = entry.log_file.clone();

        let handoff = RunnerHandoff::new(entry.start_time, log_file.clone(), key.clone())
            .with_session_id(entry.session_id.clone())
            .with_sessions_file(self.ctx.sessions_file().to_path_buf());

        self.persist_provisional(entry)?;
        let runner_pid = spawn_runner(&request.program, &request.args, &handoff)?;

        // The runner may already have written; merge into what is on disk.
        let recorded = self.ctx.update_entry(&key, |entry| {
            if entry.status == SessionStatus::Pending {
                entry.status = SessionStatus::Running;
            }
            if entry.runner_pid.is_none() {
                entry.set_runner_pid(runner_pid);
            }
            entry.background = true;
            entry.touch();
        })?;
        if recorded.is_none() {
            warn!(key = %key, "Entry vanished after spawning the runner");
        }
        info!(key = %key, runner_pid, log = %log_file.display(), "Background runner started");

        // Fallback in case the runner's stream scan misses the announcement.
        let poller = LogPoller::new(
            SessionDiscovery::new(self.ctx.clone(), key.clone()),
            log_file.clone(),
            self.poll_interval,
            self.timeout,
        );
        let poll_task = tokio::spawn(poller.run());

        let outcome = self.await_session(&key, runner_pid, log_file).await;
        poll_task.abort();
        Ok(outcome)
    }

    /// Writes the entry for this run before the runner exists.
    ///
    /// An entry already saved for the same run is kept as is, including a
    /// re-key. One left from an earlier run of the session is replaced.
    fn persist_provisional(&self, mut entry: SessionEntry) -> Result<(), LaunchError> {
        let mut store = self.ctx.load_store()?;
        entry.background = true;
        match store.locate(&entry.name) {
            Some(current) => {
                let same_run = store
                    .get(&current)
                    .is_some_and(|existing| existing.start_time == entry.start_time);
                if same_run {
                    if let Some(existing) = store.get_mut(&current) {
                        existing.background = true;
                    }
                } else {
                    store.remove(&current);
                    store.insert(entry);
                }
            }
            None => {
                store.insert(entry);
            }
        }
        self.ctx.save_store(&store)?;
        Ok(())
    }

    async fn await_session(&self, key: &str, runner_pid: u32, log_file: PathBuf) -> LaunchOutcome {
        let mut ticker = PollTicker::new(self.poll_interval, self.timeout);
        while ticker.tick().await {
            let store = match self.ctx.load_store() {
                Ok(store) => store,
                Err(e) => {
                    debug!(error = %e, "Store unreadable while waiting for runner");
                    continue;
                }
            };
            let Some((current_key, entry)) = store.resolve(key) else {
                debug!(key, "Entry not visible yet");
                continue;
            };

            if let Some(session_id) = &entry.session_id {
                return LaunchOutcome::Discovered {
                    session_id: session_id.clone(),
                    runner_pid,
                    log_file: entry.log_file.clone(),
                    elapsed: ticker.elapsed(),
                };
            }
            if entry.status.is_finished() {
                warn!(key = %current_key, status = %entry.status, "Runner finished without a session id");
                return LaunchOutcome::Failed {
                    key: current_key,
                    status: entry.status,
                    exit_code: entry.exit_code,
                    error: entry.error.clone(),
                    log_file: entry.log_file.clone(),
                };
            }
        }

        warn!(key, runner_pid, "Timed out waiting for session id, leaving job running");
        LaunchOutcome::TimedOut {
            key: key.to_string(),
            runner_pid,
            log_file,
        }
    }
}

/// Spawns the detached runner, its output appended to the transcript.
///
/// The child gets its own process group so terminal signals aimed at the
/// launcher do not reach it.
fn spawn_runner(
    program: &std::path::Path,
    args: &[OsString],
    handoff: &RunnerHandoff,
) -> Result<u32, LaunchError> {
    let log_err = |source| LaunchError::Log {
        path: handoff.log_file.clone(),
        source,
    };
    if let Some(dir) = handoff.log_file.parent() {
        std::fs::create_dir_all(dir).map_err(log_err)?;
    }
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&handoff.log_file)
        .map_err(log_err)?;
    let log_err_stream = log.try_clone().map_err(log_err)?;

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(handoff.to_env()?)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err_stream))
        .process_group(0);

    let mut child = command.spawn().map_err(LaunchError::Spawn)?;
    let pid = child.id();

    // Reap the runner if it exits while we are still around.
    std::thread::spawn(move || {
        let _ = child.wait();
    });

    Ok(pid)
}
