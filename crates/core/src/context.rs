//! Per-request scope: which tenant's data to touch, and when to give up.

use tokio_util::sync::CancellationToken;

use crate::id::TenantId;

/// Tenant boundary for storage access.
///
/// `Default` addresses the single non-tenant database of a single-tenant
/// deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TenantScope {
    #[default]
    Default,
    Tenant(TenantId),
}

impl From<Option<TenantId>> for TenantScope {
    fn from(value: Option<TenantId>) -> Self {
        value.map_or(TenantScope::Default, TenantScope::Tenant)
    }
}

impl core::fmt::Display for TenantScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TenantScope::Default => f.write_str("<default>"),
            TenantScope::Tenant(id) => core::fmt::Display::fmt(id, f),
        }
    }
}

/// Context for one inbound request.
///
/// Immutable; the cancellation token is shared with every outbound call made on
/// behalf of the request, so cancelling it aborts them.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    scope: TenantScope,
    cancellation: CancellationToken,
}

impl RequestContext {
    pub fn new(scope: TenantScope) -> Self {
        Self {
            scope,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self::new(TenantScope::Tenant(tenant_id))
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn scope(&self) -> &TenantScope {
        &self.scope
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}
