//! Process-wide tracing setup shared by the server and the migration command.

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use crate::tracing::{default_directive, init};
