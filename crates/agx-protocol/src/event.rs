//! Parsing structured events out of executor output.
//!
//! Executors print newline-delimited JSON interleaved with arbitrary log
//! noise. The only event the lifecycle manager cares about is
//! `{"type":"session.created","session_id":"<id>"}`; some executors spell the
//! field `sessionId`.

use agx_core::SessionId;
use serde::Deserialize;

/// Event type announcing the executor's session identifier.
pub const SESSION_CREATED: &str = "session.created";

/// Raw event line. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default, rename = "sessionId")]
    pub session_id_camel: Option<String>,
}

impl RawEvent {
    /// Returns the announced session id if this is a `session.created` event.
    ///
    /// `session_id` wins over `sessionId` when both are present; empty
    /// strings do not count.
    pub fn created_session_id(&self) -> Option<SessionId> {
        if self.event_type != SESSION_CREATED {
            return None;
        }
        [&self.session_id, &self.session_id_camel]
            .into_iter()
            .flatten()
            .map(|id| id.trim())
            .find(|id| !id.is_empty())
            .map(SessionId::from)
    }
}

/// Parses one output line, returning the session id from a
/// `session.created` event.
///
/// Anything that is not a JSON object with that event type yields `None`.
pub fn parse_session_created(line: &str) -> Option<SessionId> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str::<RawEvent>(trimmed)
        .ok()?
        .created_session_id()
}

/// Scans a whole transcript and returns the first announced session id.
pub fn find_session_created(text: &str) -> Option<SessionId> {
    text.lines().find_map(parse_session_created)
}
