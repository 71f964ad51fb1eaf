use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use deviceadm_admission::AdmissionError;

pub fn admission_error_to_response(err: AdmissionError) -> axum::response::Response {
    match err {
        AdmissionError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        AdmissionError::NotPreauthorized { .. } | AdmissionError::InvalidTransition { .. } => {
            json_error(StatusCode::CONFLICT, "invalid_transition", err.to_string())
        }
        AdmissionError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        AdmissionError::Validation(e) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        AdmissionError::Usage(api) => json_error(StatusCode::BAD_REQUEST, "usage_error", api.error),
        AdmissionError::Upstream(e) => {
            error!(error = %e, "devauth call failed");
            json_error(StatusCode::BAD_GATEWAY, "upstream_error", e.to_string())
        }
        AdmissionError::Persistence(e) => {
            error!(error = %e, "store operation failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal error",
            )
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_status(s: &str) -> Result<deviceadm_core::AuthStatus, axum::response::Response> {
    s.parse().map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "invalid_status",
            format!("unknown status {s:?}"),
        )
    })
}
