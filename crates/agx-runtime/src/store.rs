//! Persistent session store.
//!
//! One JSON document, `{"version":3,"sessions":{<key>:<entry>}}`. Entries are
//! keyed by their provisional name until the executor announces a session id,
//! after which they live under that id. Every mutation is a whole-file
//! rewrite through a temp file in the same directory followed by a rename, so
//! a reader never observes a half-written document.
//!
//! Older layouts are migrated in memory on load:
//! - version 2 (or no version) keyed by session id without names
//! - version 1, `{"agents":{<agent>:<entry>}}`

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use agx_core::{SessionEntry, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

/// Current on-disk format version.
pub const STORE_VERSION: u32 = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read session store {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("session store {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("session store {path} has an unexpected layout: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("failed to write session store {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of [`SessionStore::assign_session_id`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// Id recorded and the entry moved under it.
    Applied,
    /// The entry already had an id; nothing changed.
    AlreadyKnown(SessionId),
    /// No entry matches the key.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStore {
    pub version: u32,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionEntry>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            sessions: BTreeMap::new(),
        }
    }
}

impl SessionStore {
    // ========================================================================
    // Persistence
    // ========================================================================

    /// Loads the store at `path`.
    ///
    /// A missing or empty file is an empty store. Content that is not JSON,
    /// or JSON of the wrong shape, is an error; it is never silently replaced.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Session store not found, starting empty");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let value: Value = serde_json::from_str(&content).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_value(value, path)
    }

    /// Writes the whole store atomically.
    pub fn save(&self, path: &Path) -> StoreResult<()> {
        let write_err = |source: io::Error| StoreError::Write {
            path: path.to_path_buf(),
            source,
        };

        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(write_err)?;

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| write_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(json.as_bytes()).map_err(write_err)?;
        tmp.write_all(b"\n").map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(path).map_err(|e| write_err(e.error))?;
        Ok(())
    }

    fn from_value(value: Value, path: &Path) -> StoreResult<Self> {
        let malformed = |reason: &str| StoreError::Malformed {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        let Value::Object(mut root) = value else {
            return Err(malformed("top level is not an object"));
        };

        let version = match root.get("version") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_u64().ok_or_else(|| malformed("`version` is not a number"))?),
        };
        if let Some(v) = version.filter(|v| *v > u64::from(STORE_VERSION)) {
            return Err(malformed(&format!(
                "version {v} is newer than the supported version {STORE_VERSION}"
            )));
        }

        if let Some(agents) = root.remove("agents") {
            if !root.contains_key("sessions") {
                let Value::Object(agents) = agents else {
                    return Err(malformed("`agents` is not an object"));
                };
                warn!(path = %path.display(), "Migrating version 1 session store");
                return Self::migrate_agents(agents, path);
            }
        }

        let sessions = match root.remove("sessions") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(sessions)) => sessions,
            Some(_) => return Err(malformed("`sessions` is not an object")),
        };

        if version == Some(u64::from(STORE_VERSION)) {
            let sessions = serde_json::from_value(Value::Object(sessions)).map_err(|source| {
                StoreError::Parse {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            return Ok(Self {
                version: STORE_VERSION,
                sessions,
            });
        }

        warn!(path = %path.display(), ?version, "Migrating legacy session store");
        Self::migrate_by_id(sessions, path)
    }

    /// Version 2 and versionless stores: keyed by session id, names optional.
    fn migrate_by_id(sessions: Map<String, Value>, path: &Path) -> StoreResult<Self> {
        let mut store = Self::default();
        for (key, raw) in sessions {
            let mut entry = legacy_entry(raw, &key, path)?;
            if entry.session_id.is_none() {
                entry.session_id = Some(SessionId::new(key.clone()));
            }
            if entry.name.is_empty() {
                let id = SessionId::new(key.clone());
                entry.name = format!("migrated-{}", id.short());
            }
            store.sessions.insert(entry.store_key().to_string(), entry);
        }
        Ok(store)
    }

    /// Version 1: one entry per agent name.
    fn migrate_agents(agents: Map<String, Value>, path: &Path) -> StoreResult<Self> {
        let mut store = Self::default();
        for (agent, raw) in agents {
            let mut entry = legacy_entry(raw, &agent, path)?;
            if entry.agent.is_empty() {
                entry.agent = agent.clone();
            }
            if entry.name.is_empty() {
                entry.name = format!("migrated-{agent}");
            }
            store.sessions.insert(entry.store_key().to_string(), entry);
        }
        Ok(store)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&SessionEntry> {
        self.sessions.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(key)
    }

    pub fn find_by_session_id(&self, id: &SessionId) -> Option<(&str, &SessionEntry)> {
        self.sessions
            .iter()
            .find(|(_, entry)| entry.session_id.as_ref() == Some(id))
            .map(|(key, entry)| (key.as_str(), entry))
    }

    pub fn find_by_name(&self, name: &str) -> Option<(&str, &SessionEntry)> {
        self.sessions
            .iter()
            .find(|(_, entry)| entry.name == name)
            .map(|(key, entry)| (key.as_str(), entry))
    }

    /// Finds the current key for a user-supplied identifier.
    ///
    /// Tries the store key, then the session id, then the entry name.
    pub fn locate(&self, ident: &str) -> Option<String> {
        if self.sessions.contains_key(ident) {
            return Some(ident.to_string());
        }
        self.find_by_session_id(&SessionId::new(ident))
            .or_else(|| self.find_by_name(ident))
            .map(|(key, _)| key.to_string())
    }

    /// Like [`SessionStore::locate`] but returns the entry too.
    pub fn resolve(&self, ident: &str) -> Option<(String, &SessionEntry)> {
        let key = self.locate(ident)?;
        let entry = self.sessions.get(&key)?;
        Some((key, entry))
    }

    /// Returns `base`, or `base-2`, `base-3`, ... if it is taken as a key or
    /// a name.
    pub fn unique_key(&self, base: &str) -> String {
        let taken = |candidate: &str| {
            self.sessions.contains_key(candidate) || self.find_by_name(candidate).is_some()
        };
        if !taken(base) {
            return base.to_string();
        }
        (2u32..)
            .map(|n| format!("{base}-{n}"))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    /// Entries ordered by most recently used first.
    pub fn recent(&self) -> Vec<(&str, &SessionEntry)> {
        let mut entries: Vec<_> = self
            .sessions
            .iter()
            .map(|(key, entry)| (key.as_str(), entry))
            .collect();
        entries.sort_by(|a, b| b.1.last_used.cmp(&a.1.last_used));
        entries
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Stores `entry` under its own [`SessionEntry::store_key`], replacing
    /// whatever was there.
    pub fn insert(&mut self, entry: SessionEntry) -> Option<SessionEntry> {
        self.sessions.insert(entry.store_key().to_string(), entry)
    }

    pub fn remove(&mut self, key: &str) -> Option<SessionEntry> {
        self.sessions.remove(key)
    }

    /// Moves the entry at `old_key` to `new_key`.
    ///
    /// No-op when `old_key` is absent, which makes repeating a re-key
    /// harmless. An entry already at `new_key` is overwritten.
    pub fn rekey(&mut self, old_key: &str, new_key: &str) -> bool {
        if old_key == new_key {
            return self.sessions.contains_key(old_key);
        }
        let Some(entry) = self.sessions.remove(old_key) else {
            return false;
        };
        if self.sessions.insert(new_key.to_string(), entry).is_some() {
            warn!(old_key, new_key, "Re-key overwrote an existing session entry");
        }
        true
    }

    /// Records a discovered session id on the entry identified by `ident`
    /// and moves it under that id.
    ///
    /// Only the first id wins: an entry that already has one is left alone.
    pub fn assign_session_id(&mut self, ident: &str, id: &SessionId) -> Assignment {
        let Some(key) = self.locate(ident) else {
            return Assignment::Missing;
        };
        let Some(entry) = self.sessions.get_mut(&key) else {
            return Assignment::Missing;
        };
        if let Some(existing) = &entry.session_id {
            return Assignment::AlreadyKnown(existing.clone());
        }
        entry.session_id = Some(id.clone());
        entry.touch();
        self.rekey(&key, id.as_str());
        Assignment::Applied
    }
}

/// An unreadable entry fails the whole load so the next save cannot drop it.
fn legacy_entry(raw: Value, key: &str, path: &Path) -> StoreResult<SessionEntry> {
    serde_json::from_value(raw).map_err(|e| StoreError::Malformed {
        path: path.to_path_buf(),
        reason: format!("legacy entry `{key}` is unreadable: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agx_core::SessionStatus;
    use chrono::Utc;
    use tempfile::TempDir;

    fn entry(name: &str) -> SessionEntry {
        SessionEntry::new("analyze", name, format!("/tmp/{name}.log"), Utc::now())
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::load(&dir.path().join("sessions.json")).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.version, STORE_VERSION);
    }

    #[test]
    fn test_empty_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(&path, "  \n").unwrap();
        assert!(SessionStore::load(&path).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_json_fails_loudly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(&path, "{\"version\":3,\"sessions\":").unwrap();
        assert!(matches!(SessionStore::load(&path), Err(StoreError::Parse { .. })));

        fs::write(&path, "[1,2,3]").unwrap();
        assert!(matches!(SessionStore::load(&path), Err(StoreError::Malformed { .. })));

        // Nothing was overwritten.
        assert_eq!(fs::read_to_string(&path).unwrap(), "[1,2,3]");
    }

    #[test]
    fn test_save_then_load_preserves_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("sessions.json");

        let mut store = SessionStore::default();
        let mut first = entry("analyze-2310171530");
        first.session_id = Some(SessionId::new("abc123"));
        first.status = SessionStatus::Completed;
        first.exit_code = Some(0);
        store.insert(first);
        store.insert(entry("analyze-2310171531"));
        store.save(&path).unwrap();

        let loaded = SessionStore::load(&path).unwrap();
        assert_eq!(loaded, store);
        assert!(loaded.get("abc123").is_some());
        assert!(loaded.get("analyze-2310171531").is_some());
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        SessionStore::default().save(&path).unwrap();
        SessionStore::default().save(&path).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("sessions.json")]);
    }

    #[test]
    fn test_rekey_moves_entry() {
        let mut store = SessionStore::default();
        store.insert(entry("k1"));

        assert!(store.rekey("k1", "abc123"));
        assert!(store.get("k1").is_none());
        assert_eq!(store.get("abc123").map(|e| e.name.as_str()), Some("k1"));
    }

    #[test]
    fn test_rekey_is_idempotent() {
        let mut store = SessionStore::default();
        store.insert(entry("k1"));

        store.rekey("k1", "abc123");
        let once = store.clone();
        assert!(!store.rekey("k1", "abc123"));
        assert_eq!(store, once);
    }

    #[test]
    fn test_rekey_overwrites_existing_target() {
        let mut store = SessionStore::default();
        store.insert(entry("old"));
        let mut stale = entry("stale");
        stale.session_id = Some(SessionId::new("abc123"));
        store.insert(stale);

        assert!(store.rekey("old", "abc123"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("abc123").map(|e| e.name.as_str()), Some("old"));
    }

    #[test]
    fn test_assign_session_id_first_wins() {
        let mut store = SessionStore::default();
        store.insert(entry("k1"));

        assert_eq!(
            store.assign_session_id("k1", &SessionId::new("first")),
            Assignment::Applied
        );
        assert_eq!(
            store.assign_session_id("k1", &SessionId::new("second")),
            Assignment::AlreadyKnown(SessionId::new("first"))
        );
        assert!(store.get("second").is_none());
        assert_eq!(
            store.get("first").and_then(|e| e.session_id.clone()),
            Some(SessionId::new("first"))
        );
        assert_eq!(
            store.assign_session_id("nope", &SessionId::new("x")),
            Assignment::Missing
        );
    }

    #[test]
    fn test_locate_order() {
        let mut store = SessionStore::default();
        let mut discovered = entry("named");
        discovered.session_id = Some(SessionId::new("abc123"));
        store.insert(discovered);

        assert_eq!(store.locate("abc123").as_deref(), Some("abc123"));
        assert_eq!(store.locate("named").as_deref(), Some("abc123"));
        assert_eq!(store.locate("missing"), None);
    }

    #[test]
    fn test_unique_key_suffixes() {
        let mut store = SessionStore::default();
        assert_eq!(store.unique_key("analyze-2310171530"), "analyze-2310171530");

        let mut e = entry("analyze-2310171530");
        e.session_id = Some(SessionId::new("abc"));
        store.insert(e);
        assert_eq!(store.unique_key("analyze-2310171530"), "analyze-2310171530-2");

        store.insert(entry("analyze-2310171530-2"));
        assert_eq!(store.unique_key("analyze-2310171530"), "analyze-2310171530-3");
    }

    #[test]
    fn test_migrates_versionless_store_keyed_by_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(
            &path,
            r#"{"sessions":{"0123456789abcdef":{"agent":"analyze","status":"completed","logFile":"/tmp/a.log"}}}"#,
        )
        .unwrap();

        let store = SessionStore::load(&path).unwrap();
        assert_eq!(store.version, STORE_VERSION);
        let entry = store.get("0123456789abcdef").unwrap();
        assert_eq!(entry.name, "migrated-01234567");
        assert_eq!(entry.session_id, Some(SessionId::new("0123456789abcdef")));
        assert_eq!(entry.status, SessionStatus::Completed);
    }

    #[test]
    fn test_migrates_v1_agents_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(
            &path,
            r#"{"version":1,"agents":{"review":{"sessionId":"s-1","logFile":"/tmp/r.log"},"plan":{"logFile":"/tmp/p.log"}}}"#,
        )
        .unwrap();

        let store = SessionStore::load(&path).unwrap();
        assert_eq!(store.get("s-1").map(|e| e.agent.as_str()), Some("review"));
        let plan = store.get("migrated-plan").unwrap();
        assert_eq!(plan.agent, "plan");
        assert!(plan.session_id.is_none());
    }

    #[test]
    fn test_newer_version_is_rejected_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        let raw = r#"{"version":4,"sessions":{"att-1":{"agent":"a","status":"running","logFile":"/tmp/a.log"}}}"#;
        fs::write(&path, raw).unwrap();

        let err = SessionStore::load(&path).unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }), "{err}");
        assert!(err.to_string().contains("newer"));
        assert_eq!(fs::read_to_string(&path).unwrap(), raw);
    }

    #[test]
    fn test_unreadable_legacy_entry_fails_the_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(
            &path,
            r#"{"version":2,"sessions":{"att-1":{"agent":"a","status":"running","logFile":"/tmp/a.log"},"att-2":{"agent":"a","status":"abandoned","logFile":"/tmp/b.log"}}}"#,
        )
        .unwrap();

        let err = SessionStore::load(&path).unwrap_err();
        assert!(matches!(err, StoreError::Malformed { ref reason, .. } if reason.contains("att-2")));

        fs::write(&path, r#"{"version":1,"agents":{"plan":{"logFile":42}}}"#).unwrap();
        assert!(matches!(
            SessionStore::load(&path),
            Err(StoreError::Malformed { .. })
        ));
    }

    #[test]
    fn test_non_numeric_version_is_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(&path, r#"{"version":"3","sessions":{}}"#).unwrap();
        assert!(matches!(
            SessionStore::load(&path),
            Err(StoreError::Malformed { .. })
        ));
    }
}
