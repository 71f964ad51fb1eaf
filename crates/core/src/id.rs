//! Strongly-typed identifiers used across the domain.
//!
//! Auth set and device identifiers are opaque strings: the authentication
//! service mints them for submitted auth sets, while the store mints them for
//! pre-authorized ones.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a single auth set (one authentication attempt).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthId(String);

/// Identifier of a physical device.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Mint a fresh identifier.
            ///
            /// Uses UUIDv7 (time-ordered) in its simple hex form, so freshly minted
            /// ids sort by creation time. Prefer passing IDs explicitly in tests.
            pub fn new() -> Self {
                Self(Uuid::now_v7().simple().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.trim();
                if s.is_empty() {
                    return Err(DomainError::invalid_id(format!("{}: empty", $name)));
                }
                Ok(Self(s.to_string()))
            }
        }
    };
}

impl_string_newtype!(AuthId, "AuthId");
impl_string_newtype!(DeviceId, "DeviceId");

/// Identifier of a tenant (multi-tenant boundary).
///
/// Tenant ids end up in database schema names, so only ASCII alphanumerics,
/// `-` and `_` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for TenantId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(DomainError::invalid_id("TenantId: empty"));
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(DomainError::invalid_id(format!(
                "TenantId: invalid character {c:?}"
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl<'de> Deserialize<'de> for TenantId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
