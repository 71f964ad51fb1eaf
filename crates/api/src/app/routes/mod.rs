use axum::{
    Router,
    routing::{get, post, put},
};

pub mod internal;
pub mod management;
pub mod system;

/// Operator-facing routes, tenant taken from the bearer token.
pub fn management_router() -> Router {
    Router::new()
        .route(
            "/devices",
            get(management::list_devices).post(management::preauthorize_device),
        )
        .route(
            "/devices/:id",
            get(management::get_device).delete(management::delete_device),
        )
        .route(
            "/devices/:id/status",
            get(management::get_device_status).put(management::update_device_status),
        )
}

/// Service-to-service routes, tenant taken from the `tenant_id` query parameter.
pub fn internal_router() -> Router {
    Router::new()
        // On DELETE the path segment names a device, not an auth set.
        .route(
            "/devices/:id",
            put(internal::submit_device_auth).delete(internal::delete_device_data),
        )
        .route("/devices/:id/status", put(internal::accept_preauthorized))
        .route("/tenants", post(internal::provision_tenant))
}
