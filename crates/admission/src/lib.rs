//! Device admission engine.
//!
//! Decides which devices may join: lists and records auth sets, applies operator
//! decisions, keeps devauth informed of every decision and provisions tenants.

pub mod app;
pub mod devadm;
pub mod error;

#[cfg(test)]
mod tests;

pub use app::App;
pub use devadm::DevAdm;
pub use error::AdmissionError;
