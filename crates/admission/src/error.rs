use thiserror::Error;

use deviceadm_core::{AuthStatus, DomainError};
use deviceadm_infra::devauth::{ApiError, DevAuthError};
use deviceadm_infra::store::StoreError;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("device auth set not found")]
    NotFound,

    /// Accepting a pre-authorization needs a record that is still `preauthorized`.
    #[error("auth set is {status}, not preauthorized")]
    NotPreauthorized { status: AuthStatus },

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: AuthStatus, to: AuthStatus },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Validation(#[from] DomainError),

    /// devauth refused the request; its message is meant for the caller.
    #[error("{0}")]
    Usage(ApiError),

    #[error("devauth: {0}")]
    Upstream(#[source] DevAuthError),

    #[error("persistence failure: {0}")]
    Persistence(#[source] StoreError),
}

impl AdmissionError {
    /// Both kinds of rejected status change.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            AdmissionError::InvalidTransition { .. } | AdmissionError::NotPreauthorized { .. }
        )
    }

    pub(crate) fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => AdmissionError::NotFound,
            StoreError::Conflict(msg) => AdmissionError::Conflict(msg),
            other => AdmissionError::Persistence(other),
        }
    }

    /// Status updates keep devauth's usage errors; everything else is upstream.
    pub(crate) fn from_status_update(err: DevAuthError) -> Self {
        match err {
            DevAuthError::Usage(api) => AdmissionError::Usage(api),
            other => AdmissionError::Upstream(other),
        }
    }
}
