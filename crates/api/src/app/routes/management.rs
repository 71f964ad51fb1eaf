use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::{StatusCode, header},
    response::IntoResponse,
};

use deviceadm_admission::App;
use deviceadm_core::{AuthId, AuthStatus, PreAuthRequest};

use crate::app::{dto, errors};
use crate::context::{Authorization, TenantContext};

pub const DEVICES_PATH: &str = "/api/management/v1/admission/devices";

pub async fn list_devices(
    Extension(app): Extension<Arc<dyn App>>,
    Extension(tenant): Extension<TenantContext>,
    Query(query): Query<dto::ListQuery>,
) -> axum::response::Response {
    let params = match query.into_params() {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    match app
        .list_device_auths(&tenant.request(), params.skip, params.limit, &params.filter)
        .await
    {
        Ok(devices) => (StatusCode::OK, Json(devices)).into_response(),
        Err(e) => errors::admission_error_to_response(e),
    }
}

pub async fn preauthorize_device(
    Extension(app): Extension<Arc<dyn App>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(Authorization(authorization)): Extension<Authorization>,
    Json(body): Json<PreAuthRequest>,
) -> axum::response::Response {
    match app
        .preauthorize_device(&tenant.request(), body, &authorization)
        .await
    {
        Ok(dev) => (
            StatusCode::CREATED,
            [(header::LOCATION, format!("{DEVICES_PATH}/{}", dev.id))],
            Json(dev),
        )
            .into_response(),
        Err(e) => errors::admission_error_to_response(e),
    }
}

pub async fn get_device(
    Extension(app): Extension<Arc<dyn App>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match app.get_device_auth(&tenant.request(), &AuthId::from(id)).await {
        Ok(dev) => (StatusCode::OK, Json(dev)).into_response(),
        Err(e) => errors::admission_error_to_response(e),
    }
}

pub async fn delete_device(
    Extension(app): Extension<Arc<dyn App>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match app.delete_device_auth(&tenant.request(), &AuthId::from(id)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::admission_error_to_response(e),
    }
}

pub async fn get_device_status(
    Extension(app): Extension<Arc<dyn App>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match app.get_device_auth(&tenant.request(), &AuthId::from(id)).await {
        Ok(dev) => (StatusCode::OK, Json(dto::StatusResponse { status: dev.status })).into_response(),
        Err(e) => errors::admission_error_to_response(e),
    }
}

/// Operator decision: `accepted` or `rejected`.
pub async fn update_device_status(
    Extension(app): Extension<Arc<dyn App>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::StatusBody>,
) -> axum::response::Response {
    let status = match errors::parse_status(&body.status) {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    let ctx = tenant.request();
    let id = AuthId::from(id);
    let result = match status {
        AuthStatus::Accepted => app.accept_device_auth(&ctx, &id).await,
        AuthStatus::Rejected => app.reject_device_auth(&ctx, &id).await,
        other => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_status",
                format!("status can only be set to accepted or rejected, not {other}"),
            );
        }
    };

    match result {
        Ok(()) => (StatusCode::OK, Json(dto::StatusResponse { status })).into_response(),
        Err(e) => errors::admission_error_to_response(e),
    }
}
