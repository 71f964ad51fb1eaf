use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use deviceadm_core::{AuthId, AuthStatus, DeviceId};

use super::http::{HttpRequest, HttpResponse, HttpRunner};

const DEVICE_STATUS_URI: &str = "/api/management/v1/devauth/devices/{id}/auth/{aid}/status";
const PREAUTHORIZE_URI: &str = "/api/management/v1/devauth/devices";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DevAuthConfig {
    /// Root address of devauth, without a trailing path.
    pub devauth_url: String,
    /// Per-request deadline; zero selects [`DEFAULT_TIMEOUT`].
    pub timeout: Duration,
}

impl Default for DevAuthConfig {
    fn default() -> Self {
        Self {
            devauth_url: "http://mender-device-auth:8080".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Status change of one auth set, pushed to devauth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRequest {
    pub device_id: DeviceId,
    pub auth_id: AuthId,
    pub status: AuthStatus,
}

#[derive(Serialize)]
struct StatusBody {
    status: AuthStatus,
}

/// Pre-authorization of a device, pushed to devauth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreAuthPayload {
    pub device_id: DeviceId,
    pub auth_set_id: AuthId,
    pub id_data: String,
    pub pubkey: String,
}

/// Error document devauth returns alongside `422`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl core::fmt::Display for ApiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.error)
    }
}

#[derive(Debug, Error)]
pub enum DevAuthError {
    /// devauth refused the request as invalid; the message is meant for the caller.
    #[error("devauth rejected the request: {0}")]
    Usage(ApiError),

    #[error("devauth request cancelled")]
    Cancelled,

    #[error("devauth request timed out after {0:?}")]
    Timeout(Duration),

    #[error("devauth request failed: {0}")]
    Transport(String),

    #[error("devauth {operation} request failed with status {status}")]
    UnexpectedStatus {
        operation: &'static str,
        status: StatusCode,
    },

    #[error("invalid devauth response: {0}")]
    InvalidResponse(String),

    #[error("failed to prepare devauth request: {0}")]
    Encode(String),
}

/// Client of the devauth management API.
#[derive(Clone)]
pub struct DevAuthClient {
    conf: DevAuthConfig,
    runner: Arc<dyn HttpRunner>,
}

impl core::fmt::Debug for DevAuthClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DevAuthClient").field("conf", &self.conf).finish_non_exhaustive()
    }
}

impl DevAuthClient {
    pub fn new(mut conf: DevAuthConfig, runner: Arc<dyn HttpRunner>) -> Self {
        if conf.timeout.is_zero() {
            conf.timeout = DEFAULT_TIMEOUT;
        }
        conf.devauth_url = conf.devauth_url.trim_end_matches('/').to_string();
        Self { conf, runner }
    }

    pub fn config(&self) -> &DevAuthConfig {
        &self.conf
    }

    /// `PUT` the new status of an auth set. `204` is success, `422` a usage error.
    #[instrument(
        skip(self, cancel, req),
        fields(device_id = %req.device_id, auth_id = %req.auth_id, status = %req.status),
        err
    )]
    pub async fn update_device_status(
        &self,
        cancel: &CancellationToken,
        req: &StatusRequest,
    ) -> Result<(), DevAuthError> {
        debug!("update device status");

        let url = format!(
            "{}{}",
            self.conf.devauth_url,
            DEVICE_STATUS_URI
                .replace("{id}", req.device_id.as_str())
                .replace("{aid}", req.auth_id.as_str())
        );
        let body = serde_json::to_vec(&StatusBody { status: req.status })
            .map_err(|e| DevAuthError::Encode(e.to_string()))?;

        let response = self.send(cancel, Method::PUT, url, json_headers(), body).await?;

        match response.status {
            StatusCode::NO_CONTENT => Ok(()),
            StatusCode::UNPROCESSABLE_ENTITY => {
                Err(match serde_json::from_slice::<ApiError>(&response.body) {
                    Ok(api_error) => DevAuthError::Usage(api_error),
                    Err(e) => DevAuthError::InvalidResponse(format!(
                        "device status update request failed: {e}"
                    )),
                })
            }
            status => Err(DevAuthError::UnexpectedStatus {
                operation: "device status update",
                status,
            }),
        }
    }

    /// `POST` a pre-authorization, forwarding the caller's `Authorization`
    /// header verbatim. Only `201` is success.
    #[instrument(
        skip(self, cancel, req, authorization),
        fields(device_id = %req.device_id, auth_set_id = %req.auth_set_id),
        err
    )]
    pub async fn preauthorize_device(
        &self,
        cancel: &CancellationToken,
        req: &PreAuthPayload,
        authorization: &str,
    ) -> Result<(), DevAuthError> {
        let url = format!("{}{}", self.conf.devauth_url, PREAUTHORIZE_URI);
        let body = serde_json::to_vec(req).map_err(|e| DevAuthError::Encode(e.to_string()))?;

        let mut headers = json_headers();
        if !authorization.is_empty() {
            let value = HeaderValue::from_str(authorization)
                .map_err(|e| DevAuthError::Encode(format!("invalid authorization header: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let response = self.send(cancel, Method::POST, url, headers, body).await?;

        match response.status {
            StatusCode::CREATED => Ok(()),
            status => Err(DevAuthError::UnexpectedStatus {
                operation: "device preauthorize",
                status,
            }),
        }
    }

    /// Run one request under the configured deadline, racing `cancel`.
    async fn send(
        &self,
        cancel: &CancellationToken,
        method: Method,
        url: String,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> Result<HttpResponse, DevAuthError> {
        if cancel.is_cancelled() {
            return Err(DevAuthError::Cancelled);
        }

        let request = HttpRequest {
            method,
            url,
            headers,
            body,
        };
        let timeout = self.conf.timeout;

        tokio::select! {
            _ = cancel.cancelled() => Err(DevAuthError::Cancelled),
            result = tokio::time::timeout(timeout, self.runner.execute(request)) => match result {
                Err(_) => Err(DevAuthError::Timeout(timeout)),
                Ok(Err(e)) => Err(DevAuthError::Transport(e.0)),
                Ok(Ok(response)) => Ok(response),
            },
        }
    }
}

fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}
