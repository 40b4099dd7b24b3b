//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone)]
pub enum DomainError {
    /// No entry under the given key, session id or name
    #[error("Session not found: {key}")]
    SessionNotFound { key: String },

    /// Signal delivery failed for a reason other than "no such process"
    #[error("Failed to send {signal} to process {pid}: {reason}")]
    SignalFailed {
        pid: u32,
        signal: String,
        reason: String,
    },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_failed_display() {
        let error = DomainError::SignalFailed {
            pid: 42,
            signal: "SIGTERM".to_string(),
            reason: "Operation not permitted".to_string(),
        };
        let display = error.to_string();
        assert!(display.contains("SIGTERM"));
        assert!(display.contains("42"));
    }
}
