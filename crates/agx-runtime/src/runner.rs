//! Executor runner.
//!
//! Runs the agent command as a child, appends everything it prints to the
//! invocation's transcript, watches stdout for the session announcement and
//! records how the child ended. The same code path serves the foreground CLI
//! (output also echoed to the terminal) and the detached background runner.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use agx_core::{
    log_file_name, provisional_key, DomainError, SessionEntry, SessionId, SessionStatus,
};
use agx_protocol::{RunnerHandoff, HANDOFF_ENV, RUNNER_MARKER_ENV};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::discovery::{DiscoveryLatch, SessionDiscovery, StreamDiscovery};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no command given")]
    EmptyCommand,

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to open log {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for executor: {0}")]
    Wait(#[source] io::Error),
}

// ============================================================================
// Invocation Setup
// ============================================================================

/// A session entry prepared for one run of the executor.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub entry: SessionEntry,
}

impl Invocation {
    /// Prepares a brand new session for `agent`.
    ///
    /// The key is `name` if given, otherwise `{agent-slug}-{YYMMDDHHmm}`,
    /// suffixed with `-2`, `-3`, ... when already taken.
    pub fn start(
        ctx: &Context,
        agent: &str,
        name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Self, RunnerError> {
        let store = ctx.load_store()?;
        let base = match name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => provisional_key(agent, now),
        };
        let key = store.unique_key(&base);
        let log_file = ctx.paths().logs_dir.join(log_file_name(agent, now));
        Ok(Self {
            entry: SessionEntry::new(agent, key, log_file, now),
        })
    }

    /// Prepares another run of an existing session.
    ///
    /// The entry keeps its key and id; it gets a fresh transcript and its
    /// previous outcome is cleared.
    pub fn resume(ctx: &Context, ident: &str, now: DateTime<Utc>) -> Result<Self, RunnerError> {
        let store = ctx.load_store()?;
        let (_, existing) = store.resolve(ident).ok_or_else(|| DomainError::SessionNotFound {
            key: ident.to_string(),
        })?;

        let mut entry = existing.clone();
        entry.log_file = ctx.paths().logs_dir.join(log_file_name(&entry.agent, now));
        entry.start_time = now;
        entry.status = SessionStatus::Pending;
        entry.executor_pid = None;
        entry.runner_pid = None;
        entry.exit_code = None;
        entry.signal = None;
        entry.error = None;
        entry.touch();
        Ok(Self { entry })
    }

    /// Identifier that keeps finding this entry across a re-key.
    pub fn key(&self) -> &str {
        &self.entry.name
    }

    /// Writes the entry, replacing whatever sits under its key.
    pub fn save(&self, ctx: &Context) -> Result<(), RunnerError> {
        let mut store = ctx.load_store()?;
        store.insert(self.entry.clone());
        ctx.save_store(&store)?;
        Ok(())
    }
}

// ============================================================================
// Running
// ============================================================================

#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Store key, session id or name of the entry to update.
    pub key: String,
    /// Program followed by its arguments.
    pub command: Vec<OsString>,
    /// Transcript path; defaults to the entry's `log_file`.
    pub log_file: Option<PathBuf>,
    /// Mirror the child's output on this process's stdout/stderr.
    pub echo: bool,
    /// This process is the detached runner; its PID is recorded.
    pub detached: bool,
    /// Id already known for the entry.
    pub session_id: Option<SessionId>,
}

impl RunRequest {
    pub fn foreground(key: impl Into<String>, command: Vec<OsString>) -> Self {
        Self {
            key: key.into(),
            command,
            log_file: None,
            echo: true,
            detached: false,
            session_id: None,
        }
    }

    /// Request for the runner side of a background launch.
    pub fn from_handoff(handoff: &RunnerHandoff, command: Vec<OsString>) -> Self {
        Self {
            key: handoff.session_key.clone(),
            command,
            log_file: Some(handoff.log_file.clone()),
            echo: false,
            detached: true,
            session_id: handoff.session_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Key the entry ended up under.
    pub key: String,
    pub session_id: Option<SessionId>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl RunOutcome {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Exit code to hand back to a shell: the child's code, `128 + signal`
    /// when it was killed, else 1.
    pub fn shell_exit_code(&self) -> i32 {
        match (self.exit_code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        }
    }
}

/// Runs the executor to completion and records the outcome on the entry.
pub async fn run_executor(ctx: &Context, request: RunRequest) -> Result<RunOutcome, RunnerError> {
    let (program, args) = request
        .command
        .split_first()
        .ok_or(RunnerError::EmptyCommand)?;
    let program_name = program.to_string_lossy().into_owned();

    let entry_log = ctx
        .load_store()?
        .resolve(&request.key)
        .map(|(_, entry)| entry.log_file.clone())
        .ok_or_else(|| DomainError::SessionNotFound {
            key: request.key.clone(),
        })?;
    let log_path = request.log_file.clone().unwrap_or(entry_log);
    let mut log = open_log(&log_path).await?;

    let mut command = executor_command(program, args);
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(source) => {
            let message = format!("failed to spawn {program_name}: {source}");
            warn!(key = %request.key, error = %message, "Executor spawn failed");
            let _ = log
                .write_all(format!("[SPAWN ERROR] {message}\n").as_bytes())
                .await;
            let _ = log.flush().await;
            ctx.update_entry(&request.key, |entry| entry.record_failure(message.clone()))?;
            return Err(RunnerError::Spawn {
                program: program_name,
                source,
            });
        }
    };

    let executor_pid = child.id();
    let runner_pid = request.detached.then(std::process::id);
    ctx.update_entry(&request.key, |entry| {
        entry.mark_running(executor_pid, runner_pid);
        entry.background = request.detached;
        entry.log_file = log_path.clone();
    })?;
    info!(
        key = %request.key,
        program = %program_name,
        executor_pid = ?executor_pid,
        runner_pid = ?runner_pid,
        "Executor started"
    );

    let discovery = SessionDiscovery::new(ctx.clone(), request.key.clone())
        .with_latch(DiscoveryLatch::with_known(request.session_id.clone()));
    let stream = StreamDiscovery::new(discovery.clone());

    let err_log = clone_log(&log, &log_path).await?;
    let (stdout_res, stderr_res, status) = tokio::join!(
        pump(
            child.stdout.take(),
            log,
            request.echo.then(tokio::io::stdout),
            Some(stream),
        ),
        pump(
            child.stderr.take(),
            err_log,
            request.echo.then(tokio::io::stderr),
            None,
        ),
        child.wait(),
    );
    for res in [stdout_res, stderr_res] {
        if let Err(e) = res {
            warn!(key = %request.key, error = %e, "Output pump failed");
        }
    }

    let status = match status {
        Ok(status) => status,
        Err(e) => {
            let message = format!("failed to wait for executor: {e}");
            ctx.update_entry(&request.key, |entry| entry.record_failure(message.clone()))?;
            return Err(RunnerError::Wait(e));
        }
    };

    let exit_code = status.code();
    let signal = exit_signal(&status);
    let updated = ctx.update_entry(&request.key, |entry| {
        entry.record_exit(exit_code, signal.map(signal_name));
    })?;
    info!(key = %request.key, ?exit_code, ?signal, "Executor exited");

    Ok(RunOutcome {
        key: updated
            .as_ref()
            .map(|entry| entry.store_key().to_string())
            .unwrap_or(request.key),
        session_id: discovery.latch().get(),
        exit_code,
        signal,
    })
}

/// The executor never inherits the runner handoff, so an `agx` it starts
/// behaves as a fresh top-level invocation.
fn executor_command(program: &OsString, args: &[OsString]) -> Command {
    let mut command = Command::new(program);
    command
        .args(args)
        .env_remove(RUNNER_MARKER_ENV)
        .env_remove(HANDOFF_ENV)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command
}

async fn open_log(path: &std::path::Path) -> Result<File, RunnerError> {
    let log_err = |source| RunnerError::Log {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(log_err)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(log_err)
}

async fn clone_log(log: &File, path: &std::path::Path) -> Result<File, RunnerError> {
    log.try_clone().await.map_err(|source| RunnerError::Log {
        path: path.to_path_buf(),
        source,
    })
}

/// Copies `reader` into the transcript, optionally echoing and scanning it.
async fn pump<R, E>(
    reader: Option<R>,
    mut log: File,
    mut echo: Option<E>,
    mut stream: Option<StreamDiscovery>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    E: AsyncWrite + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = buf.get(..n).unwrap_or_default();

        log.write_all(chunk).await?;
        log.flush().await?;

        if let Some(out) = echo.as_mut() {
            let echoed = match out.write_all(chunk).await {
                Ok(()) => out.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = echoed {
                debug!(error = %e, "Echo target closed, continuing without it");
                echo = None;
            }
        }

        if let Some(stream) = stream.as_mut() {
            stream.feed(chunk);
        }
    }
    if let Some(stream) = stream.as_mut() {
        stream.finish();
    }
    Ok(())
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Conventional name for a signal number, e.g. `SIGTERM`.
pub fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        3 => "SIGQUIT".to_string(),
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        13 => "SIGPIPE".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("SIG{other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use tempfile::TempDir;

    fn ctx(dir: &TempDir) -> Context {
        Context::new(dir.path().to_path_buf(), RuntimeConfig::default())
    }

    fn sh(script: &str) -> Vec<OsString> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn prepared(ctx: &Context) -> Invocation {
        let invocation = Invocation::start(ctx, "analyze", None, Utc::now()).unwrap();
        invocation.save(ctx).unwrap();
        invocation
    }

    #[test]
    fn test_start_picks_unique_key_and_log_path() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let now = Utc::now();

        let first = Invocation::start(&ctx, "Analyze Code", None, now).unwrap();
        first.save(&ctx).unwrap();
        let second = Invocation::start(&ctx, "Analyze Code", None, now).unwrap();

        assert!(first.key().starts_with("analyze-code-"));
        assert_eq!(second.key(), format!("{}-2", first.key()));
        assert!(first.entry.log_file.starts_with(&ctx.paths().logs_dir));
        assert_eq!(first.entry.status, SessionStatus::Pending);
    }

    #[test]
    fn test_resume_unknown_session() {
        let dir = TempDir::new().unwrap();
        let result = Invocation::resume(&ctx(&dir), "nope", Utc::now());
        assert!(matches!(
            result,
            Err(RunnerError::Domain(DomainError::SessionNotFound { .. }))
        ));
    }

    #[test]
    fn test_resume_clears_previous_outcome() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let mut invocation = prepared(&ctx);
        invocation.entry.session_id = Some(SessionId::new("abc123"));
        invocation.entry.record_exit(Some(3), None);
        let mut store = ctx.load_store().unwrap();
        store.remove(invocation.key());
        store.insert(invocation.entry.clone());
        ctx.save_store(&store).unwrap();

        let resumed = Invocation::resume(&ctx, "abc123", Utc::now()).unwrap();
        assert_eq!(resumed.entry.session_id, Some(SessionId::new("abc123")));
        assert_eq!(resumed.entry.status, SessionStatus::Pending);
        assert_eq!(resumed.entry.exit_code, None);
        assert_eq!(resumed.key(), invocation.key());
    }

    #[tokio::test]
    async fn test_run_records_output_discovery_and_exit() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let invocation = prepared(&ctx);

        let script = r#"echo hello; echo '{"type":"session.created","session_id":"abc123"}'; echo oops >&2; exit 0"#;
        let mut request = RunRequest::foreground(invocation.key(), sh(script));
        request.echo = false;
        let outcome = run_executor(&ctx, request).await.unwrap();

        assert!(outcome.success());
        assert_eq!(outcome.session_id, Some(SessionId::new("abc123")));
        assert_eq!(outcome.key, "abc123");

        let store = ctx.load_store().unwrap();
        let entry = store.get("abc123").unwrap();
        assert_eq!(entry.status, SessionStatus::Completed);
        assert_eq!(entry.exit_code, Some(0));
        assert!(entry.executor_pid.is_some());

        let log = std::fs::read_to_string(&entry.log_file).unwrap();
        assert!(log.contains("hello"));
        assert!(log.contains("oops"));
    }

    #[tokio::test]
    async fn test_run_records_failure_code() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let invocation = prepared(&ctx);

        let mut request = RunRequest::foreground(invocation.key(), sh("exit 7"));
        request.echo = false;
        let outcome = run_executor(&ctx, request).await.unwrap();

        assert_eq!(outcome.exit_code, Some(7));
        assert_eq!(outcome.shell_exit_code(), 7);
        let store = ctx.load_store().unwrap();
        let entry = store.get(invocation.key()).unwrap();
        assert_eq!(entry.status, SessionStatus::Failed);
        assert_eq!(entry.exit_code, Some(7));
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_entry_failed() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let invocation = prepared(&ctx);

        let request = RunRequest::foreground(
            invocation.key(),
            vec!["/definitely/not/a/real/executor".into()],
        );
        let result = run_executor(&ctx, request).await;
        assert!(matches!(result, Err(RunnerError::Spawn { .. })));

        let store = ctx.load_store().unwrap();
        let entry = store.get(invocation.key()).unwrap();
        assert_eq!(entry.status, SessionStatus::Failed);
        assert!(entry.error.as_deref().unwrap_or("").contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let invocation = prepared(&ctx);
        let result = run_executor(&ctx, RunRequest::foreground(invocation.key(), vec![])).await;
        assert!(matches!(result, Err(RunnerError::EmptyCommand)));
    }

    #[test]
    fn test_shell_exit_code_for_signals() {
        let outcome = RunOutcome {
            key: "k".into(),
            session_id: None,
            exit_code: None,
            signal: Some(15),
        };
        assert_eq!(outcome.shell_exit_code(), 143);
        assert_eq!(signal_name(15), "SIGTERM");
        assert_eq!(signal_name(42), "SIG42");
    }

    #[test]
    fn test_executor_command_drops_runner_env() {
        use std::ffi::OsStr;

        let command = executor_command(&OsString::from("sh"), &[]);
        let envs: Vec<_> = command.as_std().get_envs().collect();
        assert!(envs.contains(&(OsStr::new(RUNNER_MARKER_ENV), None)));
        assert!(envs.contains(&(OsStr::new(HANDOFF_ENV), None)));
    }
}
