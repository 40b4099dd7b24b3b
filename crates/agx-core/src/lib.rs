//! agx Core - Shared types for agent session tracking
//!
//! This crate provides the domain types shared between the runtime
//! (`agx-runtime`), the inter-process formats (`agx-protocol`) and the CLI.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod process;
pub mod session;
pub mod status;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use process::{
    is_process_alive, is_same_process, process_start_ticks, send_signal, LivenessProbe,
    ProcessSnapshot, Signal, SystemLiveness,
};
pub use session::{
    log_file_name, provisional_key, sanitize_log_name, SessionEntry, SessionId, SessionStatus,
};
pub use status::{resolve_display_status, DisplayStatus};
