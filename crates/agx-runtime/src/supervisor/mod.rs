//! Backend process supervisor.
//!
//! Starts the backend as a detached child with its output appended to
//! `<log_dir>/<name>.log`, remembers it in `<log_dir>/<name>.pid`, and
//! answers health/readiness questions over HTTP. Stopping escalates from
//! SIGTERM to SIGKILL.

mod binary;
mod health;

pub use binary::BinaryResolver;
pub use health::{HealthProbe, HttpHealthProbe};

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use agx_core::{
    send_signal, DomainError, LivenessProbe, ProcessSnapshot, Signal, SystemLiveness,
};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::ticker::{poll_until, PollTicker};

/// Port handed to the backend when the base URL does not name one.
pub const DEFAULT_PORT: u16 = 8887;

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const STOP_INTERVAL: Duration = Duration::from_millis(100);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_TIMEOUT: Duration = Duration::from_secs(1);
const RESTART_GRACE: Duration = Duration::from_secs(1);
const PROGRESS_EVERY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("could not find backend binary `{name}` (searched {searched:?})")]
    BinaryNotFound { name: String, searched: Vec<PathBuf> },

    #[error("backend already running (PID {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("backend (PID {pid}) still alive after SIGKILL")]
    StillRunning { pid: u32 },

    #[error("backend at {url} not ready after {timeout:?}")]
    NotReady { url: String, timeout: Duration },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// A backend process this supervisor started or found via its PID file.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedProcess {
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    pub binary_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub base_url: String,
    pub log_dir: PathBuf,
    pub resolver: BinaryResolver,
    pub args: Vec<String>,
    pub ready_timeout: Duration,
    pub ready_interval: Duration,
}

impl StartOptions {
    pub fn from_config(config: &BackendConfig, log_dir: PathBuf) -> Self {
        Self {
            base_url: config.base_url.clone(),
            log_dir,
            resolver: BinaryResolver::new(config.name.clone()).with_override(config.binary.clone()),
            args: config.args.clone(),
            ready_timeout: config.ready_timeout(),
            ready_interval: config.ready_interval(),
        }
    }
}

/// Snapshot for `backend status`.
#[derive(Debug, Clone)]
pub struct BackendStatus {
    pub base_url: String,
    pub healthy: bool,
    pub process: Option<ManagedProcess>,
    pub usage: Option<ProcessSnapshot>,
}

#[derive(Clone)]
pub struct BackendSupervisor<P = HttpHealthProbe> {
    probe: P,
    name: String,
    health_retries: u32,
    liveness: Arc<dyn LivenessProbe + Send + Sync>,
}

impl<P> std::fmt::Debug for BackendSupervisor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSupervisor")
            .field("name", &self.name)
            .field("health_retries", &self.health_retries)
            .finish_non_exhaustive()
    }
}

impl BackendSupervisor<HttpHealthProbe> {
    pub fn from_config(config: &BackendConfig) -> Result<Self, SupervisorError> {
        let probe = HttpHealthProbe::new(config.health_path.clone(), config.health_timeout())?;
        Ok(Self::new(config.name.clone(), probe).with_retries(config.health_retries))
    }
}

impl<P: HealthProbe> BackendSupervisor<P> {
    /// `name` is the stem of the PID and log files.
    pub fn new(name: impl Into<String>, probe: P) -> Self {
        Self {
            probe,
            name: name.into(),
            health_retries: 3,
            liveness: Arc::new(SystemLiveness),
        }
    }

    #[must_use]
    pub fn with_liveness(mut self, liveness: Arc<dyn LivenessProbe + Send + Sync>) -> Self {
        self.liveness = liveness;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.health_retries = retries.max(1);
        self
    }

    pub fn pid_file(&self, log_dir: &Path) -> PathBuf {
        log_dir.join(format!("{}.pid", self.name))
    }

    pub fn log_file(&self, log_dir: &Path) -> PathBuf {
        log_dir.join(format!("{}.log", self.name))
    }

    // ========================================================================
    // Health
    // ========================================================================

    /// Health check with the configured retries and 100/200/400ms backoff.
    pub async fn is_running(&self, base_url: &str) -> bool {
        self.is_running_with(base_url, self.health_retries).await
    }

    pub async fn is_running_with(&self, base_url: &str, attempts: u32) -> bool {
        let attempts = attempts.max(1);
        for attempt in 0..attempts {
            if self.probe.probe(base_url).await {
                return true;
            }
            if attempt + 1 < attempts {
                let backoff = BACKOFF_BASE * 2u32.saturating_pow(attempt);
                debug!(attempt, ?backoff, "Health check failed, retrying");
                tokio::time::sleep(backoff).await;
            }
        }
        false
    }

    pub async fn wait_until_ready(&self, base_url: &str, timeout: Duration, interval: Duration) -> bool {
        self.wait_until_ready_with(base_url, timeout, interval, |_| {})
            .await
    }

    /// Polls with one probe per cycle until healthy or `timeout` passes.
    ///
    /// `on_progress` is called at most every 2s while still waiting.
    pub async fn wait_until_ready_with<F>(
        &self,
        base_url: &str,
        timeout: Duration,
        interval: Duration,
        mut on_progress: F,
    ) -> bool
    where
        F: FnMut(Duration) + Send,
    {
        let mut ticker = PollTicker::new(interval, timeout);
        let mut last_progress = Duration::ZERO;
        loop {
            let budget = ticker.remaining() + interval;
            let healthy = tokio::time::timeout(budget, self.probe.probe(base_url))
                .await
                .unwrap_or(false);
            if healthy {
                info!(base_url, elapsed = ?ticker.elapsed(), "Backend ready");
                return true;
            }

            let elapsed = ticker.elapsed();
            if elapsed >= last_progress + PROGRESS_EVERY {
                last_progress = elapsed;
                on_progress(elapsed);
            }

            if !ticker.tick().await {
                warn!(base_url, ?timeout, "Backend not ready before timeout");
                return false;
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawns the backend detached and returns without waiting for it.
    ///
    /// Nothing is spawned and no PID file is written if the binary cannot
    /// be resolved.
    pub fn start(&self, opts: &StartOptions) -> Result<ManagedProcess, SupervisorError> {
        if let Some(existing) = self.process_info(&opts.log_dir) {
            return Err(SupervisorError::AlreadyRunning { pid: existing.pid });
        }

        fs::create_dir_all(&opts.log_dir).map_err(|source| SupervisorError::Io {
            context: format!("failed to create {}", opts.log_dir.display()),
            source,
        })?;
        let binary = opts.resolver.resolve()?;

        let log_path = self.log_file(&opts.log_dir);
        let mut log = open_append(&log_path)?;
        let stdout = clone_file(&log, &log_path)?;
        let stderr = clone_file(&log, &log_path)?;
        let port = port_from_url(&opts.base_url);

        let mut command = Command::new(&binary);
        command
            .args(&opts.args)
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let _ = writeln!(log, "[SPAWN ERROR] {}: {source}", binary.display());
                return Err(SupervisorError::Spawn { binary, source });
            }
        };
        let pid = child.id();
        let _ = writeln!(
            log,
            "[START] pid={pid} binary={} port={port} at {}",
            binary.display(),
            Utc::now().to_rfc3339()
        );

        if let Err(e) = write_pid(&self.pid_file(&opts.log_dir), pid) {
            warn!(pid, error = %e, "Failed to write PID file");
            let _ = writeln!(log, "[WARNING] failed to write PID file: {e}");
        }

        // Reap the child and note a premature death while we are alive.
        std::thread::spawn(move || {
            if let Ok(status) = child.wait() {
                if !status.success() {
                    let _ = writeln!(log, "[EARLY EXIT] pid={pid} {status}");
                }
            }
        });

        info!(pid, binary = %binary.display(), port, "Backend started");
        Ok(ManagedProcess {
            pid,
            start_time: Utc::now(),
            binary_path: binary,
        })
    }

    /// Stops the backend recorded in the PID file.
    ///
    /// Returns `Ok(false)` when there is no PID file or the process is
    /// already gone. The PID file is removed once death is confirmed; a
    /// process that survives SIGKILL keeps it and is reported as
    /// [`SupervisorError::StillRunning`].
    pub async fn stop(&self, log_dir: &Path) -> Result<bool, SupervisorError> {
        let pid_path = self.pid_file(log_dir);
        let Some(pid) = read_pid(&pid_path) else {
            debug!(path = %pid_path.display(), "No PID file");
            return Ok(false);
        };

        if !self.liveness.is_alive(pid) || !send_signal(pid, Signal::Term)? {
            debug!(pid, "Backend already gone, removing stale PID file");
            remove_pid_file(&pid_path);
            return Ok(false);
        }
        info!(pid, "Sent SIGTERM to backend");

        if !self.wait_for_exit(pid, STOP_TIMEOUT).await {
            warn!(pid, "Backend ignored SIGTERM, sending SIGKILL");
            send_signal(pid, Signal::Kill)?;
            if !self.wait_for_exit(pid, KILL_TIMEOUT).await {
                warn!(pid, "Backend still alive after SIGKILL, keeping PID file");
                return Err(SupervisorError::StillRunning { pid });
            }
        }

        remove_pid_file(&pid_path);
        info!(pid, "Backend stopped");
        Ok(true)
    }

    /// Stop (if running), start, and wait for readiness.
    pub async fn restart(&self, opts: &StartOptions) -> Result<ManagedProcess, SupervisorError> {
        if self.is_running(&opts.base_url).await || self.process_info(&opts.log_dir).is_some() {
            self.stop(&opts.log_dir).await?;
            tokio::time::sleep(RESTART_GRACE).await;
        }

        let process = self.start(opts)?;
        if !self
            .wait_until_ready(&opts.base_url, opts.ready_timeout, opts.ready_interval)
            .await
        {
            return Err(SupervisorError::NotReady {
                url: opts.base_url.clone(),
                timeout: opts.ready_timeout,
            });
        }
        Ok(process)
    }

    /// The live process named by the PID file, if any.
    ///
    /// A PID file naming a dead process is removed.
    pub fn process_info(&self, log_dir: &Path) -> Option<ManagedProcess> {
        let pid_path = self.pid_file(log_dir);
        let pid = read_pid(&pid_path)?;
        if !self.liveness.is_alive(pid) {
            debug!(pid, "Removing stale PID file");
            remove_pid_file(&pid_path);
            return None;
        }
        let run_time = ProcessSnapshot::capture(pid)
            .map(|snap| snap.run_time_secs)
            .unwrap_or(0);
        let start_time = i64::try_from(run_time)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .map_or_else(Utc::now, |age| Utc::now() - age);
        let binary_path = fs::read_link(format!("/proc/{pid}/exe")).unwrap_or_default();
        Some(ManagedProcess {
            pid,
            start_time,
            binary_path,
        })
    }

    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        poll_until(STOP_INTERVAL, timeout, || async move {
            (!self.liveness.is_alive(pid)).then_some(())
        })
        .await
        .is_some()
    }

    pub async fn status(&self, base_url: &str, log_dir: &Path) -> BackendStatus {
        let healthy = self.is_running(base_url).await;
        let process = self.process_info(log_dir);
        let usage = process.as_ref().and_then(|p| ProcessSnapshot::capture(p.pid));
        BackendStatus {
            base_url: base_url.to_string(),
            healthy,
            process,
            usage,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Explicit port of `base_url`, else [`DEFAULT_PORT`].
pub fn port_from_url(base_url: &str) -> u16 {
    reqwest::Url::parse(base_url)
        .ok()
        .and_then(|url| url.port())
        .unwrap_or(DEFAULT_PORT)
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .filter(|pid| *pid > 0)
}

fn write_pid(path: &Path, pid: u32) -> io::Result<()> {
    fs::write(path, format!("{pid}\n"))
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }
}

fn open_append(path: &Path) -> Result<File, SupervisorError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| SupervisorError::Io {
            context: format!("failed to open {}", path.display()),
            source,
        })
}

fn clone_file(file: &File, path: &Path) -> Result<File, SupervisorError> {
    file.try_clone().map_err(|source| SupervisorError::Io {
        context: format!("failed to duplicate handle for {}", path.display()),
        source,
    })
}
