//! `deviceadm-core`: device admission domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the auth set record and its status state machine, partial-update
//! merge rules, the injectable clock and the per-request context.

pub mod clock;
pub mod context;
pub mod error;
pub mod id;
pub mod model;

pub use clock::{Clock, FixedClock, SystemClock};
pub use context::{RequestContext, TenantScope};
pub use error::{DomainError, DomainResult};
pub use id::{AuthId, DeviceId, TenantId};
pub use model::{
    AuthStatus, DeviceAttributes, DeviceAuth, DeviceAuthFilter, DeviceAuthUpdate, NewDeviceAuth,
    PreAuthRequest,
};
