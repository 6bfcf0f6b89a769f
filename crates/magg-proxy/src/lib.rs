//! Runtime engine of the magg aggregating MCP proxy.
//!
//! Terminates inbound MCP sessions, multiplexes them over a fleet of
//! outbound MCP backends, and keeps the aggregated capability view
//! consistent as backends come and go.

pub mod aggregate;
pub mod broker;
pub mod filter;
pub mod instructions;
pub mod internal;
pub mod pool;
pub mod router;
pub mod scope;
pub mod serve;
pub mod session;
pub mod template;
#[cfg(test)]
pub(crate) mod testutil;
pub mod transport;
pub mod upstream;

pub use serve::{ServeOptions, handle_serve_command, handle_status_command, handle_stop_command};
