//! The admission engine.
//!
//! ## Ordering
//!
//! Operator decisions are validated first, sent to devauth second and persisted
//! last, so a devauth failure leaves the local record untouched. A store failure
//! after devauth accepted the change leaves devauth ahead of the local record;
//! repeating the operation is safe.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use deviceadm_core::{
    AuthId, AuthStatus, Clock, DeviceAuth, DeviceAuthFilter, DeviceAuthUpdate, DeviceId,
    DomainError, NewDeviceAuth, PreAuthRequest, RequestContext, SystemClock, TenantId,
    TenantScope,
};
use deviceadm_infra::devauth::{DevAuthClient, PreAuthPayload, StatusRequest};
use deviceadm_infra::migrate::DB_VERSION;
use deviceadm_infra::store::DataStore;

use crate::app::App;
use crate::error::AdmissionError;

pub struct DevAdm<S> {
    store: S,
    devauth: DevAuthClient,
    clock: Arc<dyn Clock>,
}

impl<S: DataStore> DevAdm<S> {
    pub fn new(store: S, devauth: DevAuthClient) -> Self {
        Self {
            store,
            devauth,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Operator decision on a `pending` or `preauthorized` auth set.
    async fn change_status(
        &self,
        ctx: &RequestContext,
        id: &AuthId,
        status: AuthStatus,
    ) -> Result<(), AdmissionError> {
        let dev = self
            .store
            .get_device_auth(ctx.scope(), id)
            .await
            .map_err(AdmissionError::from_store)?;

        if !dev.status.can_transition_to(status) {
            return Err(AdmissionError::InvalidTransition {
                from: dev.status,
                to: status,
            });
        }

        self.devauth
            .update_device_status(
                ctx.cancellation(),
                &StatusRequest {
                    device_id: dev.device_id.clone(),
                    auth_id: dev.id.clone(),
                    status,
                },
            )
            .await
            .map_err(AdmissionError::from_status_update)?;

        self.store
            .update_device_auth(
                ctx.scope(),
                id,
                &DeviceAuthUpdate::status(status).with_device_id(dev.device_id),
            )
            .await
            .map_err(|e| {
                warn!(error = %e, "devauth updated but local status change failed");
                AdmissionError::from_store(e)
            })?;

        info!(from = %dev.status, to = %status, "auth set status changed");
        Ok(())
    }
}

#[async_trait]
impl<S: DataStore> App for DevAdm<S> {
    #[instrument(skip(self, ctx, filter), fields(scope = %ctx.scope()), err)]
    async fn list_device_auths(
        &self,
        ctx: &RequestContext,
        skip: usize,
        limit: usize,
        filter: &DeviceAuthFilter,
    ) -> Result<Vec<DeviceAuth>, AdmissionError> {
        self.store
            .get_device_auths(ctx.scope(), skip, limit, filter)
            .await
            .map_err(AdmissionError::from_store)
    }

    #[instrument(skip(self, ctx, dev), fields(scope = %ctx.scope(), auth_id = %dev.id), err)]
    async fn submit_device_auth(
        &self,
        ctx: &RequestContext,
        mut dev: DeviceAuth,
    ) -> Result<(), AdmissionError> {
        if dev.id.is_empty() {
            return Err(DomainError::invalid_id("auth set id must not be empty").into());
        }

        dev.request_time = Some(self.clock.now());
        self.store
            .put_device_auth(ctx.scope(), &dev.id, &DeviceAuthUpdate::from_record(&dev))
            .await
            .map_err(AdmissionError::from_store)
    }

    #[instrument(skip(self, ctx), fields(scope = %ctx.scope(), auth_id = %id), err)]
    async fn get_device_auth(
        &self,
        ctx: &RequestContext,
        id: &AuthId,
    ) -> Result<DeviceAuth, AdmissionError> {
        self.store
            .get_device_auth(ctx.scope(), id)
            .await
            .map_err(AdmissionError::from_store)
    }

    #[instrument(skip(self, ctx), fields(scope = %ctx.scope(), auth_id = %id), err)]
    async fn accept_device_auth(
        &self,
        ctx: &RequestContext,
        id: &AuthId,
    ) -> Result<(), AdmissionError> {
        self.change_status(ctx, id, AuthStatus::Accepted).await
    }

    #[instrument(skip(self, ctx), fields(scope = %ctx.scope(), auth_id = %id), err)]
    async fn reject_device_auth(
        &self,
        ctx: &RequestContext,
        id: &AuthId,
    ) -> Result<(), AdmissionError> {
        self.change_status(ctx, id, AuthStatus::Rejected).await
    }

    #[instrument(skip(self, ctx), fields(scope = %ctx.scope(), auth_id = %id), err)]
    async fn accept_device_preauth(
        &self,
        ctx: &RequestContext,
        id: &AuthId,
    ) -> Result<(), AdmissionError> {
        let dev = self
            .store
            .get_device_auth(ctx.scope(), id)
            .await
            .map_err(AdmissionError::from_store)?;

        if dev.status != AuthStatus::Preauthorized {
            return Err(AdmissionError::NotPreauthorized { status: dev.status });
        }

        self.store
            .update_device_auth(
                ctx.scope(),
                id,
                &DeviceAuthUpdate::status(AuthStatus::Accepted),
            )
            .await
            .map_err(AdmissionError::from_store)?;

        info!("pre-authorized auth set accepted");
        Ok(())
    }

    #[instrument(skip(self, ctx), fields(scope = %ctx.scope(), auth_id = %id), err)]
    async fn delete_device_auth(
        &self,
        ctx: &RequestContext,
        id: &AuthId,
    ) -> Result<(), AdmissionError> {
        self.store
            .delete_device_auth(ctx.scope(), id)
            .await
            .map_err(AdmissionError::from_store)
    }

    #[instrument(skip(self, ctx), fields(scope = %ctx.scope(), device_id = %device_id), err)]
    async fn delete_device_data(
        &self,
        ctx: &RequestContext,
        device_id: &DeviceId,
    ) -> Result<(), AdmissionError> {
        let removed = self
            .store
            .delete_device_auths_by_device(ctx.scope(), device_id)
            .await
            .map_err(AdmissionError::from_store)?;

        info!(removed, "device data deleted");
        Ok(())
    }

    #[instrument(skip(self, ctx, req, authorization), fields(scope = %ctx.scope()), err)]
    async fn preauthorize_device(
        &self,
        ctx: &RequestContext,
        req: PreAuthRequest,
        authorization: &str,
    ) -> Result<DeviceAuth, AdmissionError> {
        req.validate()?;

        let existing = self
            .store
            .get_device_auths_by_identity_data(ctx.scope(), &req.device_identity)
            .await
            .map_err(AdmissionError::from_store)?;
        if !existing.is_empty() {
            return Err(AdmissionError::Conflict(
                "device with this identity data already exists".to_string(),
            ));
        }

        let dev = self
            .store
            .insert_device_auth(
                ctx.scope(),
                NewDeviceAuth {
                    device_identity: req.device_identity,
                    key: req.key,
                    attributes: req.attributes,
                    status: AuthStatus::Preauthorized,
                    request_time: Some(self.clock.now()),
                },
            )
            .await
            .map_err(AdmissionError::from_store)?;

        // The local record is kept on failure; devauth can be told again by
        // deleting and re-creating the pre-authorization.
        self.devauth
            .preauthorize_device(
                ctx.cancellation(),
                &PreAuthPayload {
                    device_id: dev.device_id.clone(),
                    auth_set_id: dev.id.clone(),
                    id_data: dev.device_identity.clone(),
                    pubkey: dev.key.clone(),
                },
                authorization,
            )
            .await
            .map_err(AdmissionError::Upstream)?;

        info!(auth_id = %dev.id, device_id = %dev.device_id, "device pre-authorized");
        Ok(dev)
    }

    #[instrument(skip(self, _ctx), fields(tenant_id = %tenant_id), err)]
    async fn provision_tenant(
        &self,
        _ctx: &RequestContext,
        tenant_id: &TenantId,
    ) -> Result<(), AdmissionError> {
        self.store
            .with_automigrate()
            .migrate_tenant(&DB_VERSION, &TenantScope::Tenant(tenant_id.clone()))
            .await
            .map_err(AdmissionError::Persistence)?;

        info!(version = %DB_VERSION, "tenant provisioned");
        Ok(())
    }
}
