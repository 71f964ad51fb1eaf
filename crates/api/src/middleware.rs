//! Tenant resolution for inbound requests.
//!
//! Management requests carry a bearer JWT whose signature was already checked
//! by the API gateway; only the `mender.tenant` claim is read here. Internal
//! requests come from other services and name the tenant in the `tenant_id`
//! query parameter. Either way, a missing tenant selects the default database.
//!
//! Each request also gets a cancellation token that fires when the request is
//! dropped, aborting any devauth call still in flight for it.

use axum::{
    extract::Query,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use deviceadm_core::{TenantId, TenantScope};

use crate::context::{Authorization, TenantContext};

const TENANT_CLAIM: &str = "mender.tenant";

pub async fn management_tenant_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let header = authorization_header(req.headers())?.to_string();
    let token = extract_bearer(&header)?;
    let scope = tenant_from_token(token)?;

    let cancellation = CancellationToken::new();
    let _cancel_on_drop = cancellation.clone().drop_guard();

    req.extensions_mut()
        .insert(TenantContext::new(scope, cancellation));
    req.extensions_mut().insert(Authorization(header));

    Ok(next.run(req).await)
}

#[derive(Debug, Deserialize)]
struct TenantQuery {
    tenant_id: Option<String>,
}

pub async fn internal_tenant_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Query(query) =
        Query::<TenantQuery>::try_from_uri(req.uri()).map_err(|_| StatusCode::BAD_REQUEST)?;
    let scope = parse_scope(query.tenant_id.as_deref()).ok_or(StatusCode::BAD_REQUEST)?;

    let cancellation = CancellationToken::new();
    let _cancel_on_drop = cancellation.clone().drop_guard();

    req.extensions_mut()
        .insert(TenantContext::new(scope, cancellation));

    Ok(next.run(req).await)
}

fn authorization_header(headers: &HeaderMap) -> Result<&str, StatusCode> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(StatusCode::UNAUTHORIZED)?
        .to_str()
        .map_err(|_| StatusCode::UNAUTHORIZED)
}

fn extract_bearer(header: &str) -> Result<&str, StatusCode> {
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?
        .trim();
    if token.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(token)
}

/// Tenant scope named by the (unverified) claims of a JWT.
pub fn tenant_from_token(token: &str) -> Result<TenantScope, StatusCode> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(StatusCode::UNAUTHORIZED),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    let claims: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(&bytes).map_err(|_| StatusCode::UNAUTHORIZED)?;

    let tenant = match claims.get(TENANT_CLAIM) {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s.as_str()),
        Some(_) => return Err(StatusCode::UNAUTHORIZED),
    };

    let scope = parse_scope(tenant).ok_or(StatusCode::UNAUTHORIZED)?;
    debug!(scope = %scope, "tenant resolved from token");
    Ok(scope)
}

/// `None` for a malformed tenant id; absent or empty is the default scope.
fn parse_scope(tenant: Option<&str>) -> Option<TenantScope> {
    match tenant.filter(|t| !t.is_empty()) {
        None => Some(TenantScope::Default),
        Some(t) => t.parse::<TenantId>().ok().map(TenantScope::Tenant),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.c2lnbmF0dXJl")
    }

    #[test]
    fn tenant_claim_selects_the_tenant() {
        let scope = tenant_from_token(&token(serde_json::json!({
            "sub": "user-1",
            "mender.tenant": "acme",
        })))
        .unwrap();
        assert_eq!(scope, TenantScope::Tenant("acme".parse().unwrap()));
    }

    #[test]
    fn missing_or_empty_claim_selects_default() {
        for claims in [
            serde_json::json!({"sub": "user-1"}),
            serde_json::json!({"mender.tenant": ""}),
            serde_json::json!({"mender.tenant": null}),
        ] {
            assert_eq!(tenant_from_token(&token(claims)).unwrap(), TenantScope::Default);
        }
    }

    #[test]
    fn malformed_tokens_are_unauthorized() {
        for bad in [
            "not-a-jwt".to_string(),
            "a.b".to_string(),
            "a.!!!.c".to_string(),
            token(serde_json::json!({"mender.tenant": 42})),
            token(serde_json::json!({"mender.tenant": "../etc"})),
        ] {
            assert_eq!(tenant_from_token(&bad), Err(StatusCode::UNAUTHORIZED), "{bad}");
        }
    }

    #[test]
    fn bearer_prefix_is_required() {
        assert_eq!(extract_bearer("Bearer abc"), Ok("abc"));
        assert_eq!(extract_bearer("Basic abc"), Err(StatusCode::UNAUTHORIZED));
        assert_eq!(extract_bearer("Bearer   "), Err(StatusCode::UNAUTHORIZED));
    }
}
