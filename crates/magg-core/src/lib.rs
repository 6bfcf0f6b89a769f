//! Shared error and status types for the magg workspace.

pub mod error;
pub mod types;

pub use error::ProxyError;
pub use types::{BackendStatus, OutputFormat, SessionStatus};
