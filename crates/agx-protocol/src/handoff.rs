//! Parent → detached runner handoff.
//!
//! The background launcher re-executes the CLI with its original arguments
//! and passes everything the runner must agree on through two environment
//! variables: a marker that says "you are the runner" (so the child never
//! re-launches itself) and one JSON document with the fields below.
//!
//! | field          | required | meaning                                        |
//! |----------------|----------|------------------------------------------------|
//! | `version`      | yes      | handoff format version, must match            |
//! | `start_time`   | yes      | invocation start, shared by parent and runner |
//! | `log_file`     | yes      | transcript path the runner must append to     |
//! | `session_key`  | yes      | store key of the provisional entry to update  |
//! | `session_id`   | no       | identifier already known (continue)           |
//! | `sessions_file`| no       | store path, when not the default              |

use std::path::PathBuf;

use agx_core::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Set to `"1"` in the runner's environment.
pub const RUNNER_MARKER_ENV: &str = "AGX_BACKGROUND_RUNNER";

/// Holds the JSON-encoded [`RunnerHandoff`].
pub const HANDOFF_ENV: &str = "AGX_RUNNER_HANDOFF";

/// Current handoff format version.
pub const HANDOFF_VERSION: u16 = 1;

/// Everything a detached runner needs from the process that launched it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerHandoff {
    pub version: u16,
    pub start_time: DateTime<Utc>,
    pub log_file: PathBuf,
    pub session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions_file: Option<PathBuf>,
}

impl RunnerHandoff {
    pub fn new(start_time: DateTime<Utc>, log_file: PathBuf, session_key: String) -> Self {
        Self {
            version: HANDOFF_VERSION,
            start_time,
            log_file,
            session_key,
            session_id: None,
            sessions_file: None,
        }
    }

    /// Carries an already known identifier so the runner updates the same entry.
    #[must_use]
    pub fn with_session_id(mut self, session_id: Option<SessionId>) -> Self {
        self.session_id = session_id;
        self
    }

    #[must_use]
    pub fn with_sessions_file(mut self, path: PathBuf) -> Self {
        self.sessions_file = Some(path);
        self
    }

    /// Environment variables to set on the runner process.
    pub fn to_env(&self) -> Result<Vec<(&'static str, String)>, ProtocolError> {
        let payload = serde_json::to_string(self).map_err(ProtocolError::Encode)?;
        Ok(vec![
            (RUNNER_MARKER_ENV, "1".to_string()),
            (HANDOFF_ENV, payload),
        ])
    }

    /// Reads the handoff from this process's environment.
    ///
    /// `Ok(None)` means this process is not a runner.
    pub fn from_env() -> Result<Option<Self>, ProtocolError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the handoff through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, ProtocolError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if !is_runner(&lookup) {
            return Ok(None);
        }
        let payload = lookup(HANDOFF_ENV).ok_or(ProtocolError::MissingHandoff)?;
        let handoff: Self = serde_json::from_str(&payload).map_err(ProtocolError::Decode)?;
        if handoff.version != HANDOFF_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: HANDOFF_VERSION,
                found: handoff.version,
            });
        }
        Ok(Some(handoff))
    }
}

/// Returns true when the runner marker is set.
pub fn is_runner<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(RUNNER_MARKER_ENV).as_deref() == Some("1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample() -> RunnerHandoff {
        RunnerHandoff::new(
            Utc::now(),
            PathBuf::from("/tmp/logs/demo-1.log"),
            "demo-2310171530".to_string(),
        )
    }

    fn env_of(handoff: &RunnerHandoff) -> HashMap<String, String> {
        handoff
            .to_env()
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn test_env_carries_marker_and_payload() {
        let handoff = sample().with_session_id(Some(SessionId::new("abc123")));
        let env = env_of(&handoff);
        assert_eq!(env.get(RUNNER_MARKER_ENV).map(String::as_str), Some("1"));

        let decoded = RunnerHandoff::from_lookup(|k| env.get(k).cloned()).unwrap();
        assert_eq!(decoded, Some(handoff));
    }

    #[test]
    fn test_no_marker_means_not_a_runner() {
        let decoded = RunnerHandoff::from_lookup(|_| None).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_marker_without_payload_is_an_error() {
        let result = RunnerHandoff::from_lookup(|k| (k == RUNNER_MARKER_ENV).then(|| "1".into()));
        assert!(matches!(result, Err(ProtocolError::MissingHandoff)));
    }

    #[test]
    fn test_garbage_payload_is_an_error() {
        let result = RunnerHandoff::from_lookup(|k| match k {
            RUNNER_MARKER_ENV => Some("1".into()),
            HANDOFF_ENV => Some("not json".into()),
            _ => None,
        });
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let mut handoff = sample();
        handoff.version = HANDOFF_VERSION + 1;
        let env = env_of(&handoff);
        let result = RunnerHandoff::from_lookup(|k| env.get(k).cloned());
        assert!(matches!(result, Err(ProtocolError::VersionMismatch { .. })));
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("session_id").is_none());
        assert!(json.get("sessions_file").is_none());
    }
}
