//! agx - launch and track long-running agent invocations
//!
//! # Usage
//!
//! ```text
//! agx run <agent> [--background] [--name KEY] -- <command...>
//! agx continue <id> [--background] -- <command...>
//! agx list
//! agx view <id> [--lines N]
//! agx stop <id>
//! agx backend start|stop|restart|status
//! ```
//!
//! Exit codes: 0 success, 1 failure, 2 background launch timed out (the job
//! keeps running). A foreground run exits with the executor's own code.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use agx_core::{send_signal, LivenessProbe, Signal};
use agx_protocol::RunnerHandoff;
use agx_runtime::{
    run_executor, BackendSupervisor, BackgroundLauncher, Context, Invocation, LaunchOutcome,
    LaunchRequest, RunRequest, StartOptions,
};
use anyhow::{bail, Context as _, Result};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Background launch gave up waiting for a session id.
const EXIT_LAUNCH_TIMEOUT: u8 = 2;

// ============================================================================
// CLI Arguments
// ============================================================================

/// Launch, track and supervise agent sessions
#[derive(Parser, Debug)]
#[command(name = "agx")]
#[command(version)]
struct Args {
    /// State directory (defaults to $AGX_STATE_DIR, then the XDG state dir)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new session for an agent
    Run {
        agent: String,

        /// Detach and return once the session id is known
        #[arg(long, short = 'b')]
        background: bool,

        /// Provisional key instead of `{agent}-{YYMMDDHHmm}`
        #[arg(long)]
        name: Option<String>,

        /// Executor command line
        #[arg(last = true, required = true)]
        command: Vec<OsString>,
    },
    /// Run the executor again for an existing session
    Continue {
        /// Store key, session id or name
        id: String,

        #[arg(long, short = 'b')]
        background: bool,

        #[arg(last = true, required = true)]
        command: Vec<OsString>,
    },
    /// List sessions, most recent first
    List,
    /// Print a session's transcript
    View {
        id: String,

        /// Only the last N lines
        #[arg(long, short = 'n')]
        lines: Option<usize>,
    },
    /// Stop a running session
    Stop { id: String },
    /// Manage the backend process
    Backend {
        #[command(subcommand)]
        action: BackendAction,
    },
}

#[derive(Subcommand, Debug)]
enum BackendAction {
    Start,
    Stop,
    Restart,
    Status,
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let ctx = match Context::from_env(args.state_dir.clone()) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&ctx.paths().log_file);

    match dispatch(ctx, args.command).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Logs to `<state_dir>/agx.log`; stdout and stderr belong to the executor.
fn init_logging(log_file: &Path) {
    let file = log_file
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .and_then(|()| OpenOptions::new().create(true).append(true).open(log_file));

    let mut filter = EnvFilter::from_default_env();
    for directive in ["agx=info", "agx_runtime=info", "agx_core=info", "agx_protocol=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    match file {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        Err(e) => {
            eprintln!("Warning: cannot open {}: {e}", log_file.display());
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new("warn"))
                .with_writer(io::stderr)
                .init();
        }
    }
}

async fn dispatch(ctx: Context, command: Command) -> Result<u8> {
    match command {
        Command::Run {
            agent,
            background,
            name,
            command,
        } => {
            if ctx.is_runner() {
                return run_as_runner(ctx, command).await;
            }
            let invocation = Invocation::start(&ctx, &agent, name.as_deref(), Utc::now())?;
            launch_or_run(ctx, invocation, background, command).await
        }
        Command::Continue {
            id,
            background,
            command,
        } => {
            if ctx.is_runner() {
                return run_as_runner(ctx, command).await;
            }
            let invocation = Invocation::resume(&ctx, &id, Utc::now())?;
            launch_or_run(ctx, invocation, background, command).await
        }
        Command::List => list(&ctx),
        Command::View { id, lines } => view(&ctx, &id, lines),
        Command::Stop { id } => stop(&ctx, &id),
        Command::Backend { action } => backend(&ctx, action).await,
    }
}

// ============================================================================
// Run / Continue
// ============================================================================

async fn launch_or_run(
    ctx: Context,
    invocation: Invocation,
    background: bool,
    command: Vec<OsString>,
) -> Result<u8> {
    invocation.save(&ctx)?;

    let request = LaunchRequest::reexec(invocation.clone(), background)
        .context("cannot locate the agx executable")?;
    let outcome = BackgroundLauncher::new(ctx.clone()).launch(request).await?;

    match outcome {
        LaunchOutcome::NotHandled => {
            let mut request = RunRequest::foreground(invocation.key(), command);
            request.session_id = invocation.entry.session_id.clone();
            let outcome = run_executor(&ctx, request).await?;
            if let Some(id) = &outcome.session_id {
                eprintln!("session: {id}");
            }
            Ok(exit_byte(outcome.shell_exit_code()))
        }
        LaunchOutcome::Discovered {
            session_id,
            runner_pid,
            log_file,
            elapsed,
        } => {
            println!("{session_id}");
            eprintln!(
                "Running in background (runner PID {runner_pid}, id after {:.1}s)\nLog: {}",
                elapsed.as_secs_f64(),
                log_file.display()
            );
            Ok(0)
        }
        LaunchOutcome::Failed {
            key,
            status,
            exit_code,
            error,
            log_file,
        } => {
            eprintln!("Background session {key} {status} before reporting a session id");
            if let Some(code) = exit_code {
                eprintln!("Exit code: {code}");
            }
            if let Some(error) = error {
                eprintln!("Error: {error}");
            }
            eprintln!("Log: {}", log_file.display());
            Ok(1)
        }
        LaunchOutcome::TimedOut {
            key,
            runner_pid,
            log_file,
        } => {
            eprintln!(
                "No session id yet; the job is still running as {key} (runner PID {runner_pid})"
            );
            eprintln!("Check later with `agx list` or `agx view {key}`");
            eprintln!("Log: {}", log_file.display());
            Ok(EXIT_LAUNCH_TIMEOUT)
        }
    }
}

async fn run_as_runner(ctx: Context, command: Vec<OsString>) -> Result<u8> {
    let handoff = RunnerHandoff::from_env()?
        .context("runner marker set but no handoff in the environment")?;
    let ctx = match &handoff.sessions_file {
        Some(path) => ctx.with_sessions_file(path.clone()),
        None => ctx,
    };
    info!(
        key = %handoff.session_key,
        started = %handoff.start_time,
        log = %handoff.log_file.display(),
        "Background runner starting"
    );
    let outcome = run_executor(&ctx, RunRequest::from_handoff(&handoff, command)).await?;
    Ok(exit_byte(outcome.shell_exit_code()))
}

fn exit_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

// ============================================================================
// List / View / Stop
// ============================================================================

fn list(ctx: &Context) -> Result<u8> {
    let store = ctx.load_store()?;
    if store.is_empty() {
        println!("No sessions.");
        return Ok(0);
    }

    let mut out = io::stdout().lock();
    writeln!(
        out,
        "{:<32} {:<16} {:<20} {:<16} {}",
        "KEY", "AGENT", "STATUS", "STARTED", "MODE"
    )?;
    for (key, entry) in store.recent() {
        let status = ctx.display_status(entry);
        let mode = if entry.background { "background" } else { "foreground" };
        writeln!(
            out,
            "{:<32} {:<16} {:<20} {:<16} {}",
            key,
            entry.agent,
            status.to_string(),
            entry
                .start_time
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M")
                .to_string(),
            mode
        )?;
    }
    Ok(0)
}

fn view(ctx: &Context, id: &str, lines: Option<usize>) -> Result<u8> {
    let store = ctx.load_store()?;
    let Some((key, entry)) = store.resolve(id) else {
        bail!("no session matches `{id}`");
    };

    let mut out = io::stdout().lock();
    writeln!(out, "Key:     {key}")?;
    writeln!(out, "Agent:   {}", entry.agent)?;
    writeln!(out, "Status:  {}", ctx.display_status(entry))?;
    if let Some(id) = &entry.session_id {
        writeln!(out, "Session: {id}")?;
    }
    if let Some(code) = entry.exit_code {
        writeln!(out, "Exit:    {code}")?;
    }
    if let Some(error) = &entry.error {
        writeln!(out, "Error:   {error}")?;
    }
    writeln!(out, "Log:     {}", entry.log_file.display())?;
    writeln!(out)?;

    let content = match fs::read_to_string(&entry.log_file) {
        Ok(content) => content,
        Err(e) => {
            warn!(key = %key, log = %entry.log_file.display(), error = %e, "Transcript unreadable");
            writeln!(out, "(log unavailable: {e})")?;
            return Ok(0);
        }
    };
    match lines {
        Some(n) => {
            let all: Vec<&str> = content.lines().collect();
            for line in all.iter().skip(all.len().saturating_sub(n)) {
                writeln!(out, "{line}")?;
            }
        }
        None => out.write_all(content.as_bytes())?,
    }
    Ok(0)
}

fn stop(ctx: &Context, id: &str) -> Result<u8> {
    let store = ctx.load_store()?;
    let Some((key, entry)) = store.resolve(id) else {
        bail!("no session matches `{id}`");
    };
    let status = ctx.display_status(entry);
    if !status.is_active() {
        println!("{key} is not running ({status})");
        return Ok(0);
    }

    let targets = [
        (entry.runner_pid, entry.runner_start_ticks),
        (entry.executor_pid, entry.executor_start_ticks),
    ];
    let mut signalled = false;
    for (pid, start_ticks) in targets {
        let Some(pid) = pid else { continue };
        if ctx.liveness().is_alive_since(Some(pid), start_ticks) {
            signalled |= send_signal(pid, Signal::Term)?;
        } else {
            info!(key = %key, pid, "Not signalling: process gone or PID reused");
        }
    }

    ctx.update_entry(&key, |entry| entry.mark_stopped(Signal::Term.name()))?;
    info!(key = %key, signalled, "Session stopped");
    println!("Stopped {key}");
    Ok(0)
}

// ============================================================================
// Backend
// ============================================================================

async fn backend(ctx: &Context, action: BackendAction) -> Result<u8> {
    let config = &ctx.config().backend;
    let supervisor = BackendSupervisor::from_config(config)?;
    let opts = StartOptions::from_config(config, ctx.paths().backend_log_dir.clone());

    match action {
        BackendAction::Start => {
            if supervisor.is_running(&opts.base_url).await {
                println!("Backend already running at {}", opts.base_url);
                return Ok(0);
            }
            let process = supervisor.start(&opts)?;
            println!("Started backend (PID {})", process.pid);
            eprint!("Waiting for {}", opts.base_url);
            let ready = supervisor
                .wait_until_ready_with(&opts.base_url, opts.ready_timeout, opts.ready_interval, |_| {
                    eprint!(".");
                })
                .await;
            eprintln!();
            if ready {
                println!("Backend ready");
                Ok(0)
            } else {
                eprintln!(
                    "Backend not ready after {:?}; see {}",
                    opts.ready_timeout,
                    supervisor.log_file(&opts.log_dir).display()
                );
                Ok(1)
            }
        }
        BackendAction::Stop => {
            if supervisor.stop(&opts.log_dir).await? {
                println!("Backend stopped");
            } else {
                println!("Backend was not running");
            }
            Ok(0)
        }
        BackendAction::Restart => {
            let process = supervisor.restart(&opts).await?;
            println!("Backend restarted (PID {})", process.pid);
            Ok(0)
        }
        BackendAction::Status => {
            let status = supervisor.status(&opts.base_url, &opts.log_dir).await;
            let health = if status.healthy { "healthy" } else { "unreachable" };
            println!("Backend {} at {}", health, status.base_url);
            if let Some(process) = &status.process {
                println!("  PID:     {}", process.pid);
                println!("  Binary:  {}", process.binary_path.display());
                println!("  Started: {}", process.start_time.with_timezone(&Local));
            }
            if let Some(usage) = &status.usage {
                println!("  Uptime:  {}s", usage.run_time_secs);
                println!("  Memory:  {} MB", usage.memory_mb());
                println!("  CPU:     {:.1}%", usage.cpu_percent);
            }
            Ok(if status.healthy { 0 } else { 1 })
        }
    }
}
