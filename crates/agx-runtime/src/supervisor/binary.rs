//! Locating the backend executable.
//!
//! Search order, first hit wins:
//! 1. explicit override (exclusive when set)
//! 2. next to the running executable
//! 3. `../libexec/agx/<name>` relative to the executable's directory
//! 4. `../lib/agx/bin/<name>` relative to the executable's directory
//! 5. `<data_dir>/agx/bin/<name>`
//! 6. `PATH`

use std::path::{Path, PathBuf};

use tracing::debug;

use super::SupervisorError;

#[derive(Debug, Clone)]
pub struct BinaryResolver {
    name: String,
    override_path: Option<PathBuf>,
    exe_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    search_path: bool,
}

impl BinaryResolver {
    /// Resolver with the default layouts for this installation.
    pub fn new(name: impl Into<String>) -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        Self {
            name: name.into(),
            override_path: None,
            exe_dir,
            data_dir: dirs::data_dir(),
            search_path: true,
        }
    }

    #[must_use]
    pub fn with_override(mut self, path: Option<PathBuf>) -> Self {
        self.override_path = path;
        self
    }

    #[must_use]
    pub fn with_exe_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.exe_dir = dir;
        self
    }

    #[must_use]
    pub fn with_data_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.data_dir = dir;
        self
    }

    #[must_use]
    pub fn search_path(mut self, enabled: bool) -> Self {
        self.search_path = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem locations checked before `PATH`.
    pub fn candidates(&self) -> Vec<PathBuf> {
        if let Some(path) = &self.override_path {
            return vec![path.clone()];
        }
        let mut out = Vec::new();
        if let Some(dir) = &self.exe_dir {
            out.push(dir.join(&self.name));
            out.push(dir.join("../libexec/agx").join(&self.name));
            out.push(dir.join("../lib/agx/bin").join(&self.name));
        }
        if let Some(dir) = &self.data_dir {
            out.push(dir.join("agx/bin").join(&self.name));
        }
        out
    }

    pub fn resolve(&self) -> Result<PathBuf, SupervisorError> {
        let candidates = self.candidates();
        for candidate in &candidates {
            if is_executable(candidate) {
                debug!(path = %candidate.display(), "Resolved backend binary");
                return Ok(candidate.clone());
            }
        }

        if self.search_path && self.override_path.is_none() {
            if let Ok(path) = which::which(&self.name) {
                debug!(path = %path.display(), "Resolved backend binary from PATH");
                return Ok(path);
            }
        }

        Err(SupervisorError::BinaryNotFound {
            name: self.name.clone(),
            searched: candidates,
        })
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
