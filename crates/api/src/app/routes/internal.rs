use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use deviceadm_admission::App;
use deviceadm_core::{AuthId, AuthStatus, DeviceId};

use crate::app::{dto, errors};
use crate::context::TenantContext;

/// Auth set reported by devauth; stored as `pending`.
pub async fn submit_device_auth(
    Extension(app): Extension<Arc<dyn App>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::SubmitDeviceAuthRequest>,
) -> axum::response::Response {
    let dev = body.into_record(AuthId::from(id));
    match app.submit_device_auth(&tenant.request(), dev).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::admission_error_to_response(e),
    }
}

/// devauth accepted a pre-authorized device; only `accepted` is meaningful.
pub async fn accept_preauthorized(
    Extension(app): Extension<Arc<dyn App>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::StatusBody>,
) -> axum::response::Response {
    match errors::parse_status(&body.status) {
        Ok(AuthStatus::Accepted) => {}
        Ok(other) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_status",
                format!("only accepted is supported, not {other}"),
            );
        }
        Err(resp) => return resp,
    }

    match app.accept_device_preauth(&tenant.request(), &AuthId::from(id)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::admission_error_to_response(e),
    }
}

pub async fn delete_device_data(
    Extension(app): Extension<Arc<dyn App>>,
    Extension(tenant): Extension<TenantContext>,
    Path(device_id): Path<String>,
) -> axum::response::Response {
    match app
        .delete_device_data(&tenant.request(), &DeviceId::from(device_id))
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::admission_error_to_response(e),
    }
}

pub async fn provision_tenant(
    Extension(app): Extension<Arc<dyn App>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<dto::ProvisionTenantRequest>,
) -> axum::response::Response {
    match app.provision_tenant(&tenant.request(), &body.tenant_id).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => errors::admission_error_to_response(e),
    }
}
