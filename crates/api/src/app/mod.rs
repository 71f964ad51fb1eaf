//! HTTP API application wiring (Axum router).
//!
//! - `routes/`: HTTP routes + handlers (management, internal, system)
//! - `dto.rs`: request/response DTOs and query validation
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use deviceadm_admission::App;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;

pub const MANAGEMENT_PREFIX: &str = "/api/management/v1/admission";
pub const INTERNAL_PREFIX: &str = "/api/internal/v1/admission";

/// Build the full HTTP router (public entrypoint used by `main.rs` and tests).
pub fn build_app(app: Arc<dyn App>) -> Router {
    let management = routes::management_router().layer(axum::middleware::from_fn(
        middleware::management_tenant_middleware,
    ));
    let internal = routes::internal_router().layer(axum::middleware::from_fn(
        middleware::internal_tenant_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .nest(MANAGEMENT_PREFIX, management)
        .nest(INTERNAL_PREFIX, internal)
        .layer(ServiceBuilder::new().layer(Extension(app)))
}
