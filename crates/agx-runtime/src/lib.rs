//! agx runtime - session lifecycle for long-running agent invocations
//!
//! - `store` - persistent session store with atomic writes and re-keying
//! - `discovery` - finding the executor's session id in its output
//! - `runner` - running the executor and recording its outcome
//! - `launcher` - detaching a background runner and waiting for its id
//! - `supervisor` - starting, stopping and health-checking the backend
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   spawn + handoff env   ┌──────────────────────┐
//! │  BackgroundLauncher  │────────────────────────▶│   detached runner    │
//! │  (foreground CLI)    │                         │   run_executor()     │
//! └──────────┬───────────┘                         └──────────┬───────────┘
//!            │ poll store / log                               │ stream scan
//!            ▼                                                ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 SessionStore (sessions.json, atomic)                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All production code follows the panic-free policy: no `.unwrap()`,
//! `.expect()`, `panic!()` or direct indexing outside tests.

pub mod config;
pub mod context;
pub mod discovery;
pub mod launcher;
pub mod runner;
pub mod store;
pub mod supervisor;
pub mod ticker;

pub use config::{ConfigError, RuntimeConfig, StatePaths};
pub use context::Context;
pub use discovery::{DiscoveryLatch, LogPoller, SessionDiscovery, StreamDiscovery};
pub use launcher::{BackgroundLauncher, LaunchError, LaunchOutcome, LaunchRequest};
pub use runner::{run_executor, Invocation, RunOutcome, RunRequest, RunnerError};
pub use store::{Assignment, SessionStore, StoreError, StoreResult, STORE_VERSION};
pub use supervisor::{
    BackendStatus, BackendSupervisor, BinaryResolver, HealthProbe, HttpHealthProbe,
    ManagedProcess, StartOptions, SupervisorError,
};
pub use ticker::{poll_until, PollTicker};
