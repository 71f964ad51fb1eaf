//! Auth set data model and its status state machine.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{AuthId, DeviceId};

/// Device-supplied metadata, ordered by attribute name.
pub type DeviceAttributes = BTreeMap<String, String>;

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// Admission status of an auth set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    /// Submitted by a device, awaiting an operator decision.
    #[default]
    Pending,
    /// Admitted by an operator before the device asked for authentication.
    Preauthorized,
    Accepted,
    Rejected,
}

impl AuthStatus {
    pub const ALL: [AuthStatus; 4] = [
        AuthStatus::Pending,
        AuthStatus::Preauthorized,
        AuthStatus::Accepted,
        AuthStatus::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStatus::Pending => "pending",
            AuthStatus::Preauthorized => "preauthorized",
            AuthStatus::Accepted => "accepted",
            AuthStatus::Rejected => "rejected",
        }
    }

    /// Whether an operator decision may move an auth set from `self` to `target`.
    ///
    /// `accepted` and `rejected` are terminal.
    pub fn can_transition_to(&self, target: AuthStatus) -> bool {
        matches!(
            (self, target),
            (AuthStatus::Pending, AuthStatus::Accepted)
                | (AuthStatus::Pending, AuthStatus::Rejected)
                | (AuthStatus::Preauthorized, AuthStatus::Accepted)
        )
    }
}

impl core::fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AuthStatus::Pending),
            "preauthorized" => Ok(AuthStatus::Preauthorized),
            "accepted" => Ok(AuthStatus::Accepted),
            "rejected" => Ok(AuthStatus::Rejected),
            other => Err(DomainError::validation(format!(
                "unknown auth set status: {other:?}"
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// One authorization attempt by one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAuth {
    pub id: AuthId,
    pub device_id: DeviceId,
    pub device_identity: String,
    pub key: String,
    #[serde(default)]
    pub attributes: DeviceAttributes,
    pub status: AuthStatus,
    pub request_time: Option<DateTime<Utc>>,
}

impl DeviceAuth {
    /// A record carrying only its id; every other field takes its empty value.
    ///
    /// Used by stores when an upsert targets an id that does not exist yet.
    pub fn blank(id: AuthId) -> Self {
        Self {
            id,
            device_id: DeviceId::default(),
            device_identity: String::new(),
            key: String::new(),
            attributes: DeviceAttributes::new(),
            status: AuthStatus::default(),
            request_time: None,
        }
    }

    /// Attach store-minted identifiers to a new record.
    pub fn from_new(id: AuthId, device_id: DeviceId, dev: NewDeviceAuth) -> Self {
        Self {
            id,
            device_id,
            device_identity: dev.device_identity,
            key: dev.key,
            attributes: dev.attributes,
            status: dev.status,
            request_time: dev.request_time,
        }
    }
}

/// A record before the store has assigned its identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeviceAuth {
    pub device_identity: String,
    pub key: String,
    pub attributes: DeviceAttributes,
    pub status: AuthStatus,
    pub request_time: Option<DateTime<Utc>>,
}

/// Field-wise partial update of an auth set.
///
/// `None` leaves the stored value untouched. [`DeviceAuthUpdate::from_record`]
/// and [`DeviceAuthUpdate::normalized`] treat empty strings and empty attribute
/// maps as absent, so a caller can never blank out a stored field by omission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceAuthUpdate {
    pub device_id: Option<DeviceId>,
    pub device_identity: Option<String>,
    pub key: Option<String>,
    pub attributes: Option<DeviceAttributes>,
    pub status: Option<AuthStatus>,
    pub request_time: Option<DateTime<Utc>>,
}

impl DeviceAuthUpdate {
    /// Update touching only the status.
    pub fn status(status: AuthStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_device_id(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    /// Every non-empty field of `dev` (the id itself is the upsert key).
    pub fn from_record(dev: &DeviceAuth) -> Self {
        Self {
            device_id: Some(dev.device_id.clone()),
            device_identity: Some(dev.device_identity.clone()),
            key: Some(dev.key.clone()),
            attributes: Some(dev.attributes.clone()),
            status: Some(dev.status),
            request_time: dev.request_time,
        }
        .normalized()
    }

    /// Drop empty values so they cannot overwrite stored ones.
    pub fn normalized(self) -> Self {
        Self {
            device_id: self.device_id.filter(|d| !d.is_empty()),
            device_identity: self.device_identity.filter(|s| !s.is_empty()),
            key: self.key.filter(|s| !s.is_empty()),
            // TODO: merge attribute maps key by key instead of replacing the whole map.
            attributes: self.attributes.filter(|a| !a.is_empty()),
            status: self.status,
            request_time: self.request_time,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.device_id.is_none()
            && self.device_identity.is_none()
            && self.key.is_none()
            && self.attributes.is_none()
            && self.status.is_none()
            && self.request_time.is_none()
    }

    /// Merge into `dev` field by field.
    pub fn apply_to(&self, dev: &mut DeviceAuth) {
        let update = self.clone().normalized();
        if let Some(device_id) = update.device_id {
            dev.device_id = device_id;
        }
        if let Some(identity) = update.device_identity {
            dev.device_identity = identity;
        }
        if let Some(key) = update.key {
            dev.key = key;
        }
        if let Some(attributes) = update.attributes {
            dev.attributes = attributes;
        }
        if let Some(status) = update.status {
            dev.status = status;
        }
        if let Some(request_time) = update.request_time {
            dev.request_time = Some(request_time);
        }
    }
}

/// Equality filter for listing auth sets. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceAuthFilter {
    pub status: Option<AuthStatus>,
    pub device_id: Option<DeviceId>,
}

impl DeviceAuthFilter {
    pub fn matches(&self, dev: &DeviceAuth) -> bool {
        self.status.is_none_or(|s| dev.status == s)
            && self.device_id.as_ref().is_none_or(|d| &dev.device_id == d)
    }
}

/// Operator request to admit a device ahead of its first authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreAuthRequest {
    /// Identity data of the device, compared verbatim for duplicates.
    pub device_identity: String,
    pub key: String,
    #[serde(default)]
    pub attributes: DeviceAttributes,
}

impl PreAuthRequest {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.device_identity.trim().is_empty() {
            return Err(DomainError::validation("device_identity must not be empty"));
        }
        if self.key.trim().is_empty() {
            return Err(DomainError::validation("key must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn full_record() -> DeviceAuth {
        DeviceAuth {
            id: AuthId::from("auth-1"),
            device_id: DeviceId::from("dev-1"),
            device_identity: "{\"mac\":\"00:11:22\"}".to_string(),
            key: "-----BEGIN PUBLIC KEY-----".to_string(),
            attributes: [("mac".to_string(), "00:11:22".to_string())]
                .into_iter()
                .collect(),
            status: AuthStatus::Pending,
            request_time: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
        }
    }

    #[test]
    fn only_operator_transitions_are_allowed() {
        use AuthStatus::*;
        let allowed = [(Pending, Accepted), (Pending, Rejected), (Preauthorized, Accepted)];
        for from in AuthStatus::ALL {
            for to in AuthStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&AuthStatus::Preauthorized).unwrap(),
            "\"preauthorized\""
        );
        assert_eq!("rejected".parse::<AuthStatus>().unwrap(), AuthStatus::Rejected);
        assert!("Accepted".parse::<AuthStatus>().is_err());
    }

    #[test]
    fn status_only_update_keeps_other_fields() {
        let mut dev = full_record();
        let before = dev.clone();

        DeviceAuthUpdate::status(AuthStatus::Accepted).apply_to(&mut dev);

        assert_eq!(dev.status, AuthStatus::Accepted);
        assert_eq!(dev.device_id, before.device_id);
        assert_eq!(dev.device_identity, before.device_identity);
        assert_eq!(dev.key, before.key);
        assert_eq!(dev.attributes, before.attributes);
        assert_eq!(dev.request_time, before.request_time);
    }

    #[test]
    fn empty_values_never_overwrite() {
        let mut dev = full_record();
        let before = dev.clone();

        let update = DeviceAuthUpdate {
            device_id: Some(DeviceId::default()),
            device_identity: Some(String::new()),
            key: Some(String::new()),
            attributes: Some(DeviceAttributes::new()),
            status: None,
            request_time: None,
        };
        assert!(update.clone().normalized().is_empty());

        update.apply_to(&mut dev);
        assert_eq!(dev, before);
    }

    #[test]
    fn from_record_skips_empty_fields() {
        let mut dev = full_record();
        dev.key.clear();
        dev.attributes.clear();

        let update = DeviceAuthUpdate::from_record(&dev);
        assert_eq!(update.key, None);
        assert_eq!(update.attributes, None);
        assert_eq!(update.device_id, Some(DeviceId::from("dev-1")));
    }

    #[test]
    fn filter_matches_on_status_and_device() {
        let dev = full_record();
        assert!(DeviceAuthFilter::default().matches(&dev));
        assert!(
            DeviceAuthFilter {
                status: Some(AuthStatus::Pending),
                device_id: Some(DeviceId::from("dev-1")),
            }
            .matches(&dev)
        );
        assert!(
            !DeviceAuthFilter {
                status: Some(AuthStatus::Accepted),
                device_id: None,
            }
            .matches(&dev)
        );
    }

    #[test]
    fn preauth_request_requires_identity_and_key() {
        let req = PreAuthRequest {
            device_identity: " ".to_string(),
            key: "k".to_string(),
            attributes: DeviceAttributes::new(),
        };
        assert!(req.validate().is_err());
    }

    fn status_strategy() -> impl Strategy<Value = AuthStatus> {
        prop::sample::select(AuthStatus::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_status_update_preserves_unrelated_fields(
            identity in "[a-z0-9]{1,16}",
            key in "[A-Za-z0-9+/]{1,64}",
            attrs in prop::collection::btree_map("[a-z]{1,8}", "[a-z0-9]{0,8}", 0..5),
            from in status_strategy(),
            to in status_strategy(),
        ) {
            let mut dev = full_record();
            dev.device_identity = identity;
            dev.key = key;
            dev.attributes = attrs;
            dev.status = from;
            let before = dev.clone();

            DeviceAuthUpdate::status(to).apply_to(&mut dev);

            prop_assert_eq!(dev.status, to);
            dev.status = before.status;
            prop_assert_eq!(dev, before);
        }
    }
}
