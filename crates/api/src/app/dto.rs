use serde::{Deserialize, Serialize};

use deviceadm_core::{
    AuthId, AuthStatus, DeviceAttributes, DeviceAuth, DeviceAuthFilter, DeviceId, TenantId,
};

use crate::app::errors;

pub const DEFAULT_PER_PAGE: usize = 20;
pub const MAX_PER_PAGE: usize = 500;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub page: Option<usize>,
    pub per_page: Option<usize>,
    pub status: Option<String>,
    pub device_id: Option<String>,
}

/// Validated list parameters.
#[derive(Debug, PartialEq, Eq)]
pub struct ListParams {
    pub skip: usize,
    pub limit: usize,
    pub filter: DeviceAuthFilter,
}

impl ListQuery {
    pub fn into_params(self) -> Result<ListParams, axum::response::Response> {
        let page = self.page.unwrap_or(1);
        let per_page = self.per_page.unwrap_or(DEFAULT_PER_PAGE);
        if page == 0 || per_page == 0 || per_page > MAX_PER_PAGE {
            return Err(invalid_pagination(format!(
                "page must be >= 1 and per_page within 1..={MAX_PER_PAGE}"
            )));
        }
        // Offsets end up as a signed 64-bit SQL OFFSET.
        let skip = (page - 1)
            .checked_mul(per_page)
            .filter(|skip| i64::try_from(*skip).is_ok())
            .ok_or_else(|| invalid_pagination(format!("page {page} is out of range")))?;

        let status = self
            .status
            .filter(|s| !s.is_empty())
            .map(|s| errors::parse_status(&s))
            .transpose()?;

        Ok(ListParams {
            skip,
            limit: per_page,
            filter: DeviceAuthFilter {
                status,
                device_id: self.device_id.filter(|d| !d.is_empty()).map(DeviceId::from),
            },
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub status: String,
}

/// Auth set reported by devauth on a device's authentication request.
#[derive(Debug, Deserialize)]
pub struct SubmitDeviceAuthRequest {
    pub device_id: DeviceId,
    pub device_identity: String,
    pub key: String,
    #[serde(default)]
    pub attributes: DeviceAttributes,
}

impl SubmitDeviceAuthRequest {
    pub fn into_record(self, id: AuthId) -> DeviceAuth {
        DeviceAuth {
            id,
            device_id: self.device_id,
            device_identity: self.device_identity,
            key: self.key,
            attributes: self.attributes,
            status: AuthStatus::Pending,
            request_time: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProvisionTenantRequest {
    pub tenant_id: TenantId,
}

fn invalid_pagination(message: String) -> axum::response::Response {
    errors::json_error(
        axum::http::StatusCode::BAD_REQUEST,
        "invalid_pagination",
        message,
    )
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: AuthStatus,
}
