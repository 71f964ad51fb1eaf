use async_trait::async_trait;

use deviceadm_core::{
    AuthId, DeviceAuth, DeviceAuthFilter, DeviceId, PreAuthRequest, RequestContext, TenantId,
};

use crate::error::AdmissionError;

/// Device admission operations.
///
/// Every call is scoped to the tenant of `ctx` and gives up when its
/// cancellation token fires.
#[async_trait]
pub trait App: Send + Sync {
    /// Auth sets matching `filter`, sorted by id. `limit == 0` means no limit.
    async fn list_device_auths(
        &self,
        ctx: &RequestContext,
        skip: usize,
        limit: usize,
        filter: &DeviceAuthFilter,
    ) -> Result<Vec<DeviceAuth>, AdmissionError>;

    /// Record an auth set reported by devauth. The request time is stamped here.
    async fn submit_device_auth(
        &self,
        ctx: &RequestContext,
        dev: DeviceAuth,
    ) -> Result<(), AdmissionError>;

    async fn get_device_auth(
        &self,
        ctx: &RequestContext,
        id: &AuthId,
    ) -> Result<DeviceAuth, AdmissionError>;

    async fn accept_device_auth(&self, ctx: &RequestContext, id: &AuthId)
    -> Result<(), AdmissionError>;

    async fn reject_device_auth(&self, ctx: &RequestContext, id: &AuthId)
    -> Result<(), AdmissionError>;

    /// Accept a pre-authorized auth set on devauth's request; devauth already
    /// knows, so nothing is sent back.
    async fn accept_device_preauth(
        &self,
        ctx: &RequestContext,
        id: &AuthId,
    ) -> Result<(), AdmissionError>;

    async fn delete_device_auth(&self, ctx: &RequestContext, id: &AuthId)
    -> Result<(), AdmissionError>;

    /// Remove every auth set of a decommissioned device.
    async fn delete_device_data(
        &self,
        ctx: &RequestContext,
        device_id: &DeviceId,
    ) -> Result<(), AdmissionError>;

    /// Admit a device before it ever asks, then tell devauth, forwarding the
    /// caller's `Authorization` header.
    async fn preauthorize_device(
        &self,
        ctx: &RequestContext,
        req: PreAuthRequest,
        authorization: &str,
    ) -> Result<DeviceAuth, AdmissionError>;

    /// Create or upgrade the database of a new tenant.
    async fn provision_tenant(
        &self,
        ctx: &RequestContext,
        tenant_id: &TenantId,
    ) -> Result<(), AdmissionError>;
}
