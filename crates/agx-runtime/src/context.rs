//! Per-invocation runtime context.
//!
//! Built once at startup and passed to every component. Cheap to clone.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agx_core::{resolve_display_status, DisplayStatus, LivenessProbe, SessionEntry, SystemLiveness};
use agx_protocol::is_runner;

use crate::config::{resolve_state_dir, ConfigError, RuntimeConfig, StatePaths};
use crate::store::{SessionStore, StoreResult};

#[derive(Clone)]
pub struct Context {
    config: Arc<RuntimeConfig>,
    paths: Arc<StatePaths>,
    liveness: Arc<dyn LivenessProbe + Send + Sync>,
    runner: bool,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("paths", &self.paths)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn new(state_dir: PathBuf, config: RuntimeConfig) -> Self {
        let paths = StatePaths::new(state_dir, &config);
        Self {
            config: Arc::new(config),
            paths: Arc::new(paths),
            liveness: Arc::new(SystemLiveness),
            runner: false,
        }
    }

    /// Builds the context from the process environment.
    ///
    /// Reads `config.toml` from the resolved state dir and applies env
    /// overrides.
    pub fn from_env(state_dir_flag: Option<PathBuf>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| std::env::var(key).ok();
        let state_dir = resolve_state_dir(state_dir_flag, lookup);
        let mut config = RuntimeConfig::load(&state_dir.join(crate::config::CONFIG_FILE_NAME))?;
        config.apply_env_overrides(lookup);
        Ok(Self::new(state_dir, config).with_runner(is_runner(lookup)))
    }

    #[must_use]
    pub fn with_liveness(mut self, probe: Arc<dyn LivenessProbe + Send + Sync>) -> Self {
        self.liveness = probe;
        self
    }

    /// Marks this process as the detached runner.
    #[must_use]
    pub fn with_runner(mut self, runner: bool) -> Self {
        self.runner = runner;
        self
    }

    /// Points the store somewhere else, e.g. the path handed to a runner.
    #[must_use]
    pub fn with_sessions_file(mut self, path: PathBuf) -> Self {
        Arc::make_mut(&mut self.paths).sessions_file = path;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn sessions_file(&self) -> &Path {
        &self.paths.sessions_file
    }

    pub fn is_runner(&self) -> bool {
        self.runner
    }

    pub fn liveness(&self) -> &(dyn LivenessProbe + Send + Sync) {
        self.liveness.as_ref()
    }

    pub fn load_store(&self) -> StoreResult<SessionStore> {
        SessionStore::load(self.sessions_file())
    }

    pub fn save_store(&self, store: &SessionStore) -> StoreResult<()> {
        store.save(self.sessions_file())
    }

    /// Load, mutate the entry `ident` resolves to, save.
    ///
    /// Returns the updated entry, or `None` (and writes nothing) when no
    /// entry matches.
    pub fn update_entry<F>(&self, ident: &str, f: F) -> StoreResult<Option<SessionEntry>>
    where
        F: FnOnce(&mut SessionEntry),
    {
        let mut store = self.load_store()?;
        let Some(key) = store.locate(ident) else {
            return Ok(None);
        };
        let Some(entry) = store.get_mut(&key) else {
            return Ok(None);
        };
        f(entry);
        let updated = entry.clone();
        self.save_store(&store)?;
        Ok(Some(updated))
    }

    pub fn display_status(&self, entry: &SessionEntry) -> DisplayStatus {
        resolve_display_status(entry, self.liveness())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agx_core::SessionStatus;
    use chrono::Utc;
    use tempfile::TempDir;

    struct NothingAlive;

    impl LivenessProbe for NothingAlive {
        fn is_alive(&self, _pid: u32) -> bool {
            false
        }
    }

    #[test]
    fn test_update_entry_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::new(dir.path().to_path_buf(), RuntimeConfig::default());

        let mut store = SessionStore::default();
        store.insert(SessionEntry::new("demo", "demo-1", "/tmp/demo.log", Utc::now()));
        ctx.save_store(&store).unwrap();

        let updated = ctx
            .update_entry("demo-1", |e| e.record_exit(Some(0), None))
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Completed);
        assert_eq!(
            ctx.load_store().unwrap().get("demo-1").map(|e| e.status),
            Some(SessionStatus::Completed)
        );

        assert!(ctx.update_entry("missing", |_| {}).unwrap().is_none());
    }

    #[test]
    fn test_display_status_uses_injected_liveness() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::new(dir.path().to_path_buf(), RuntimeConfig::default())
            .with_liveness(Arc::new(NothingAlive));

        let mut entry = SessionEntry::new("demo", "demo-1", "/tmp/demo.log", Utc::now());
        entry.status = SessionStatus::Running;
        entry.executor_pid = Some(std::process::id());
        assert_eq!(ctx.display_status(&entry), DisplayStatus::Stopped);
    }

    #[test]
    fn test_sessions_file_override() {
        let dir = TempDir::new().unwrap();
        let other = dir.path().join("elsewhere.json");
        let ctx = Context::new(dir.path().to_path_buf(), RuntimeConfig::default())
            .with_sessions_file(other.clone());
        assert_eq!(ctx.sessions_file(), other.as_path());
        assert!(!ctx.is_runner());
    }
}
