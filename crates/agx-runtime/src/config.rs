//! Runtime configuration.
//!
//! Everything lives under one state directory. Resolution order for that
//! directory: explicit flag, `AGX_STATE_DIR`, `dirs::state_dir()/agx`,
//! `/tmp/agx`. An optional `config.toml` inside it tweaks the defaults.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Overrides the state directory.
pub const STATE_DIR_ENV: &str = "AGX_STATE_DIR";
/// Overrides `backend.base_url`.
pub const BACKEND_URL_ENV: &str = "AGX_BACKEND_URL";
/// Overrides `backend.binary`.
pub const BACKEND_BIN_ENV: &str = "AGX_BACKEND_BIN";

pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

// ============================================================================
// Config Sections
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub sessions: SessionsConfig,
    pub launch: LaunchConfig,
    pub backend: BackendConfig,
}

/// Where session state lives. Relative paths are taken from the state dir.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub file: Option<PathBuf>,
    pub logs_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Background launches are refused when false.
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 500,
            timeout_ms: 20_000,
        }
    }
}

impl LaunchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Executable name looked up across install layouts.
    pub name: String,
    pub base_url: String,
    pub health_path: String,
    /// Explicit executable, skips layout search.
    pub binary: Option<PathBuf>,
    pub args: Vec<String>,
    pub log_dir: Option<PathBuf>,
    pub health_timeout_ms: u64,
    pub health_retries: u32,
    pub ready_timeout_ms: u64,
    pub ready_interval_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: "agx-backend".to_string(),
            base_url: "http://localhost:8887".to_string(),
            health_path: "/health".to_string(),
            binary: None,
            args: Vec::new(),
            log_dir: None,
            health_timeout_ms: 3_000,
            health_retries: 3,
            ready_timeout_ms: 60_000,
            ready_interval_ms: 500,
        }
    }
}

impl BackendConfig {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms.max(1))
    }
}

impl RuntimeConfig {
    /// Loads `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `AGX_BACKEND_URL` / `AGX_BACKEND_BIN` style overrides.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(BACKEND_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.backend.base_url = url;
        }
        if let Some(bin) = lookup(BACKEND_BIN_ENV).filter(|v| !v.trim().is_empty()) {
            self.backend.binary = Some(PathBuf::from(bin));
        }
    }
}

// ============================================================================
// State Paths
// ============================================================================

/// Resolves the state directory.
pub fn resolve_state_dir<F>(flag: Option<PathBuf>, lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    flag.or_else(|| lookup(STATE_DIR_ENV).map(PathBuf::from))
        .unwrap_or_else(|| {
            dirs::state_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("agx")
        })
}

/// Concrete file locations derived from a state dir and config.
#[derive(Debug, Clone, PartialEq)]
pub struct StatePaths {
    pub state_dir: PathBuf,
    pub sessions_file: PathBuf,
    pub logs_dir: PathBuf,
    pub backend_log_dir: PathBuf,
    /// agx's own tracing output.
    pub log_file: PathBuf,
}

impl StatePaths {
    pub fn new(state_dir: PathBuf, config: &RuntimeConfig) -> Self {
        let under = |p: &Option<PathBuf>, default: &str| match p {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => state_dir.join(p),
            None => state_dir.join(default),
        };
        Self {
            sessions_file: under(&config.sessions.file, "sessions.json"),
            logs_dir: under(&config.sessions.logs_dir, "logs"),
            backend_log_dir: under(&config.backend.log_dir, "backend"),
            log_file: state_dir.join("agx.log"),
            state_dir,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = RuntimeConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.launch.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.launch.timeout(), Duration::from_secs(20));
    }

    #[test]
    fn test_partial_config_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[launch]\ntimeout_ms = 5000\n\n[backend]\nbase_url = \"http://127.0.0.1:9000\"\n").unwrap();

        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.launch.timeout_ms, 5000);
        assert_eq!(config.launch.poll_interval_ms, 500);
        assert_eq!(config.backend.base_url, "http://127.0.0.1:9000");
        assert_eq!(config.backend.health_retries, 3);
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[launch\n").unwrap();
        assert!(matches!(RuntimeConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RuntimeConfig::default();
        config.apply_env_overrides(|key| match key {
            BACKEND_URL_ENV => Some("http://10.0.0.1:1234".into()),
            BACKEND_BIN_ENV => Some("/opt/backend".into()),
            _ => None,
        });
        assert_eq!(config.backend.base_url, "http://10.0.0.1:1234");
        assert_eq!(config.backend.binary, Some(PathBuf::from("/opt/backend")));
    }

    #[test]
    fn test_state_dir_precedence() {
        let flag = resolve_state_dir(Some(PathBuf::from("/flag")), |_| Some("/env".into()));
        assert_eq!(flag, PathBuf::from("/flag"));

        let env = resolve_state_dir(None, |_| Some("/env".into()));
        assert_eq!(env, PathBuf::from("/env"));

        let fallback = resolve_state_dir(None, |_| None);
        assert!(fallback.ends_with("agx"));
    }

    #[test]
    fn test_state_paths_relative_and_absolute() {
        let mut config = RuntimeConfig::default();
        config.sessions.logs_dir = Some(PathBuf::from("transcripts"));
        config.backend.log_dir = Some(PathBuf::from("/var/log/agx"));

        let paths = StatePaths::new(PathBuf::from("/state"), &config);
        assert_eq!(paths.sessions_file, PathBuf::from("/state/sessions.json"));
        assert_eq!(paths.logs_dir, PathBuf::from("/state/transcripts"));
        assert_eq!(paths.backend_log_dir, PathBuf::from("/var/log/agx"));
        assert_eq!(paths.config_file(), PathBuf::from("/state/config.toml"));
    }
}
