//! Errors for inter-process formats.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Runner marker was set but no handoff payload came with it
    #[error("runner handoff missing: marker is set but no payload was provided")]
    MissingHandoff,

    #[error("failed to encode runner handoff: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode runner handoff: {0}")]
    Decode(#[source] serde_json::Error),

    /// Parent and runner were built from incompatible versions
    #[error("runner handoff version mismatch (expected {expected}, found {found})")]
    VersionMismatch { expected: u16, found: u16 },
}
