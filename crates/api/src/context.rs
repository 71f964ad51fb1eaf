use deviceadm_core::{RequestContext, TenantScope};
use tokio_util::sync::CancellationToken;

/// Tenant context for a request.
///
/// Inserted by the middleware; present on every admission route.
#[derive(Debug, Clone)]
pub struct TenantContext {
    scope: TenantScope,
    cancellation: CancellationToken,
}

impl TenantContext {
    pub fn new(scope: TenantScope, cancellation: CancellationToken) -> Self {
        Self {
            scope,
            cancellation,
        }
    }

    pub fn scope(&self) -> &TenantScope {
        &self.scope
    }

    /// Engine context sharing this request's cancellation.
    pub fn request(&self) -> RequestContext {
        RequestContext::new(self.scope.clone()).with_cancellation(self.cancellation.clone())
    }
}

/// Raw `Authorization` header of a management request, forwarded to devauth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization(pub String);
