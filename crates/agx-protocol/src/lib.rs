//! agx Protocol - Formats exchanged between agx processes
//!
//! This crate provides the pieces that cross process boundaries:
//! - `event` - parsing `session.created` events out of executor output
//! - `lines` - newline framing for streamed output
//! - `handoff` - the parent → detached runner environment contract

pub mod error;
pub mod event;
pub mod handoff;
pub mod lines;

pub use error::ProtocolError;
pub use event::{find_session_created, parse_session_created, RawEvent, SESSION_CREATED};
pub use handoff::{is_runner, RunnerHandoff, HANDOFF_ENV, HANDOFF_VERSION, RUNNER_MARKER_ENV};
pub use lines::{LineBuffer, MAX_LINE_LEN};
