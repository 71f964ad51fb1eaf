use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Method, StatusCode};
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

use deviceadm_core::{
    AuthId, AuthStatus, DeviceAttributes, DeviceAuth, DeviceAuthFilter, DeviceAuthUpdate,
    DeviceId, FixedClock, NewDeviceAuth, PreAuthRequest, RequestContext, TenantId, TenantScope,
};
use deviceadm_infra::devauth::{
    DevAuthClient, DevAuthConfig, DevAuthError, HttpResponse, RecordingRunner,
};
use deviceadm_infra::migrate::{DB_VERSION, SchemaVersion};
use deviceadm_infra::store::in_memory::InMemoryDataStore;
use deviceadm_infra::store::{DataStore, MissingDevicePolicy, StoreError};

use crate::{AdmissionError, App, DevAdm};

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory store with knobs for the awkward cases.
#[derive(Clone, Default)]
struct TestStore {
    inner: InMemoryDataStore,
    /// Held after the identity lookup so concurrent pre-authorizations all see
    /// an empty result before any of them inserts.
    lookup_gate: Option<Arc<Barrier>>,
    fail_updates: bool,
}

#[async_trait]
impl DataStore for TestStore {
    async fn get_device_auths(
        &self,
        scope: &TenantScope,
        skip: usize,
        limit: usize,
        filter: &DeviceAuthFilter,
    ) -> Result<Vec<DeviceAuth>, StoreError> {
        self.inner.get_device_auths(scope, skip, limit, filter).await
    }

    async fn get_device_auth(
        &self,
        scope: &TenantScope,
        id: &AuthId,
    ) -> Result<DeviceAuth, StoreError> {
        self.inner.get_device_auth(scope, id).await
    }

    async fn put_device_auth(
        &self,
        scope: &TenantScope,
        id: &AuthId,
        update: &DeviceAuthUpdate,
    ) -> Result<(), StoreError> {
        self.inner.put_device_auth(scope, id, update).await
    }

    async fn update_device_auth(
        &self,
        scope: &TenantScope,
        id: &AuthId,
        update: &DeviceAuthUpdate,
    ) -> Result<(), StoreError> {
        if self.fail_updates {
            return Err(StoreError::Storage("disk on fire".to_string()));
        }
        self.inner.update_device_auth(scope, id, update).await
    }

    async fn insert_device_auth(
        &self,
        scope: &TenantScope,
        dev: NewDeviceAuth,
    ) -> Result<DeviceAuth, StoreError> {
        self.inner.insert_device_auth(scope, dev).await
    }

    async fn delete_device_auth(&self, scope: &TenantScope, id: &AuthId) -> Result<(), StoreError> {
        self.inner.delete_device_auth(scope, id).await
    }

    async fn delete_device_auths_by_device(
        &self,
        scope: &TenantScope,
        device_id: &DeviceId,
    ) -> Result<u64, StoreError> {
        self.inner.delete_device_auths_by_device(scope, device_id).await
    }

    async fn get_device_auths_by_identity_data(
        &self,
        scope: &TenantScope,
        identity: &str,
    ) -> Result<Vec<DeviceAuth>, StoreError> {
        let found = self.inner.get_device_auths_by_identity_data(scope, identity).await;
        if let Some(gate) = &self.lookup_gate {
            gate.wait().await;
        }
        found
    }

    async fn migrate(&self, version: &SchemaVersion) -> Result<(), StoreError> {
        self.inner.migrate(version).await
    }

    async fn migrate_tenant(
        &self,
        version: &SchemaVersion,
        scope: &TenantScope,
    ) -> Result<(), StoreError> {
        self.inner.migrate_tenant(version, scope).await
    }

    fn with_automigrate(&self) -> Self {
        Self {
            inner: self.inner.with_automigrate(),
            ..self.clone()
        }
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap()
}

/// Engine over `store`, with the `acme` tenant of [`ctx`] provisioned.
async fn engine(store: TestStore) -> (DevAdm<TestStore>, RecordingRunner) {
    store
        .with_automigrate()
        .migrate_tenant(&DB_VERSION, ctx().scope())
        .await
        .unwrap();

    let runner = RecordingRunner::new();
    let devauth = DevAuthClient::new(
        DevAuthConfig {
            devauth_url: "http://devauth:8080".to_string(),
            ..DevAuthConfig::default()
        },
        Arc::new(runner.clone()),
    );
    let app = DevAdm::new(store, devauth).with_clock(Arc::new(FixedClock(now())));
    (app, runner)
}

fn ctx() -> RequestContext {
    RequestContext::for_tenant("acme".parse().unwrap())
}

fn submitted(id: &str, device: &str, identity: &str) -> DeviceAuth {
    DeviceAuth {
        id: AuthId::from(id),
        device_id: DeviceId::from(device),
        device_identity: identity.to_string(),
        key: format!("key-{id}"),
        attributes: [("mac".to_string(), identity.to_string())].into_iter().collect(),
        status: AuthStatus::Pending,
        request_time: None,
    }
}

fn preauth_request(identity: &str) -> PreAuthRequest {
    PreAuthRequest {
        device_identity: identity.to_string(),
        key: "-----BEGIN PUBLIC KEY-----".to_string(),
        attributes: DeviceAttributes::new(),
    }
}

async fn seed(app: &DevAdm<TestStore>, id: &str, status: AuthStatus) {
    app.store()
        .put_device_auth(
            ctx().scope(),
            &AuthId::from(id),
            &DeviceAuthUpdate::status(status).with_device_id(DeviceId::from(format!("dev-{id}"))),
        )
        .await
        .unwrap();
}

async fn status_of(app: &DevAdm<TestStore>, id: &str) -> AuthStatus {
    app.get_device_auth(&ctx(), &AuthId::from(id)).await.unwrap().status
}

// ─────────────────────────────────────────────────────────────────────────────
// Submission and lookup
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn submit_stamps_request_time_and_accept_notifies_devauth() {
    let (app, runner) = engine(TestStore::default()).await;

    app.submit_device_auth(&ctx(), submitted("A", "D", "id-A"))
        .await
        .unwrap();
    let stored = app.get_device_auth(&ctx(), &AuthId::from("A")).await.unwrap();
    assert_eq!(stored.request_time, Some(now()));
    assert_eq!(stored.status, AuthStatus::Pending);
    assert!(runner.requests().is_empty());

    app.accept_device_auth(&ctx(), &AuthId::from("A")).await.unwrap();

    let stored = app.get_device_auth(&ctx(), &AuthId::from("A")).await.unwrap();
    assert_eq!(stored.status, AuthStatus::Accepted);
    assert_eq!(stored.key, "key-A");
    assert_eq!(stored.device_id, DeviceId::from("D"));

    let requests = runner.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, Method::PUT);
    assert!(requests[0].url.ends_with("/devices/D/auth/A/status"));
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["status"], "accepted");
}

#[tokio::test]
async fn resubmission_merges_into_the_existing_record() {
    let (app, _) = engine(TestStore::default()).await;
    app.submit_device_auth(&ctx(), submitted("A", "D", "id-A"))
        .await
        .unwrap();

    let mut again = submitted("A", "", "");
    again.key = String::new();
    again.attributes.clear();
    app.submit_device_auth(&ctx(), again).await.unwrap();

    let stored = app.get_device_auth(&ctx(), &AuthId::from("A")).await.unwrap();
    assert_eq!(stored.key, "key-A");
    assert_eq!(stored.device_identity, "id-A");
    assert_eq!(stored.device_id, DeviceId::from("D"));
    assert!(!stored.attributes.is_empty());
}

#[tokio::test]
async fn submission_without_id_is_rejected() {
    let (app, _) = engine(TestStore::default()).await;
    let err = app
        .submit_device_auth(&ctx(), submitted("", "D", "id"))
        .await
        .unwrap_err();
    assert!(matches!(err, AdmissionError::Validation(_)));
}

#[tokio::test]
async fn submission_to_unprovisioned_tenant_is_not_found() {
    let (app, runner) = engine(TestStore::default()).await;
    let unknown = RequestContext::for_tenant("globex".parse().unwrap());

    let err = app
        .submit_device_auth(&unknown, submitted("A", "D", "id-A"))
        .await
        .unwrap_err();
    assert!(matches!(err, AdmissionError::NotFound));

    let err = app
        .preauthorize_device(&unknown, preauth_request("X"), "Bearer t")
        .await
        .unwrap_err();
    assert!(matches!(err, AdmissionError::NotFound));
    assert!(runner.requests().is_empty());
}

#[tokio::test]
async fn tenants_do_not_see_each_other() {
    let (app, _) = engine(TestStore::default()).await;
    app.submit_device_auth(&ctx(), submitted("A", "D", "id-A"))
        .await
        .unwrap();

    let other = RequestContext::for_tenant("globex".parse().unwrap());
    assert!(matches!(
        app.get_device_auth(&other, &AuthId::from("A")).await,
        Err(AdmissionError::NotFound)
    ));
    assert!(
        app.list_device_auths(&other, 0, 0, &DeviceAuthFilter::default())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn list_filters_and_paginates() {
    let (app, _) = engine(TestStore::default()).await;
    for (id, status) in [
        ("a", AuthStatus::Pending),
        ("b", AuthStatus::Accepted),
        ("c", AuthStatus::Pending),
        ("d", AuthStatus::Pending),
    ] {
        seed(&app, id, status).await;
    }

    let pending = app
        .list_device_auths(
            &ctx(),
            1,
            1,
            &DeviceAuthFilter {
                status: Some(AuthStatus::Pending),
                device_id: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, AuthId::from("c"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Status transitions
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn valid_operator_transitions_reach_devauth_once() {
    for (from, to) in [
        (AuthStatus::Pending, AuthStatus::Accepted),
        (AuthStatus::Pending, AuthStatus::Rejected),
        (AuthStatus::Preauthorized, AuthStatus::Accepted),
    ] {
        let (app, runner) = engine(TestStore::default()).await;
        seed(&app, "A", from).await;

        let result = match to {
            AuthStatus::Accepted => app.accept_device_auth(&ctx(), &AuthId::from("A")).await,
            _ => app.reject_device_auth(&ctx(), &AuthId::from("A")).await,
        };
        result.unwrap();

        assert_eq!(status_of(&app, "A").await, to, "{from} -> {to}");
        let requests = runner.requests();
        assert_eq!(requests.len(), 1, "{from} -> {to}");
        assert!(requests[0].url.ends_with("/devices/dev-A/auth/A/status"));
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["status"], to.as_str());
    }
}

#[tokio::test]
async fn invalid_transitions_fail_before_any_side_effect() {
    for (from, accept) in [
        (AuthStatus::Accepted, true),
        (AuthStatus::Accepted, false),
        (AuthStatus::Rejected, true),
        (AuthStatus::Rejected, false),
        (AuthStatus::Preauthorized, false),
    ] {
        let (app, runner) = engine(TestStore::default()).await;
        seed(&app, "A", from).await;

        let result = if accept {
            app.accept_device_auth(&ctx(), &AuthId::from("A")).await
        } else {
            app.reject_device_auth(&ctx(), &AuthId::from("A")).await
        };

        let err = result.unwrap_err();
        assert!(err.is_invalid_transition(), "{from}: {err}");
        assert_eq!(status_of(&app, "A").await, from);
        assert!(runner.requests().is_empty());
    }
}

#[tokio::test]
async fn missing_auth_set_is_not_found_everywhere() {
    let (app, runner) = engine(TestStore::default()).await;
    let id = AuthId::from("nope");

    assert!(matches!(app.get_device_auth(&ctx(), &id).await, Err(AdmissionError::NotFound)));
    assert!(matches!(app.accept_device_auth(&ctx(), &id).await, Err(AdmissionError::NotFound)));
    assert!(matches!(app.reject_device_auth(&ctx(), &id).await, Err(AdmissionError::NotFound)));
    assert!(matches!(
        app.accept_device_preauth(&ctx(), &id).await,
        Err(AdmissionError::NotFound)
    ));
    assert!(matches!(app.delete_device_auth(&ctx(), &id).await, Err(AdmissionError::NotFound)));
    assert!(runner.requests().is_empty());
}

#[tokio::test]
async fn devauth_failure_leaves_status_unchanged() {
    let (app, runner) = engine(TestStore::default()).await;
    seed(&app, "A", AuthStatus::Pending).await;
    runner.push_response(HttpResponse::new(StatusCode::INTERNAL_SERVER_ERROR));

    let err = app.accept_device_auth(&ctx(), &AuthId::from("A")).await.unwrap_err();

    assert!(matches!(err, AdmissionError::Upstream(DevAuthError::UnexpectedStatus { .. })));
    assert_eq!(status_of(&app, "A").await, AuthStatus::Pending);
}

#[tokio::test]
async fn devauth_usage_error_is_surfaced_unchanged() {
    let (app, runner) = engine(TestStore::default()).await;
    seed(&app, "A", AuthStatus::Pending).await;
    runner.push_response(HttpResponse::with_json(
        StatusCode::UNPROCESSABLE_ENTITY,
        &serde_json::json!({"error": "device limit reached"}),
    ));

    let err = app.reject_device_auth(&ctx(), &AuthId::from("A")).await.unwrap_err();

    match err {
        AdmissionError::Usage(api) => assert_eq!(api.error, "device limit reached"),
        other => panic!("expected usage error, got {other:?}"),
    }
    assert_eq!(status_of(&app, "A").await, AuthStatus::Pending);
}

#[tokio::test]
async fn cancelled_request_commits_nothing() {
    let (app, runner) = engine(TestStore::default()).await;
    seed(&app, "A", AuthStatus::Pending).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let cancelled = ctx().with_cancellation(cancel);

    let err = app.accept_device_auth(&cancelled, &AuthId::from("A")).await.unwrap_err();

    assert!(matches!(err, AdmissionError::Upstream(DevAuthError::Cancelled)));
    assert_eq!(status_of(&app, "A").await, AuthStatus::Pending);
    assert!(runner.requests().is_empty());
}

#[tokio::test]
async fn store_failure_after_devauth_is_a_persistence_error() {
    let store = TestStore {
        fail_updates: true,
        ..TestStore::default()
    };
    let (app, runner) = engine(store).await;
    seed(&app, "A", AuthStatus::Pending).await;

    let err = app.accept_device_auth(&ctx(), &AuthId::from("A")).await.unwrap_err();

    assert!(matches!(err, AdmissionError::Persistence(_)));
    assert_eq!(runner.requests().len(), 1);
    assert_eq!(status_of(&app, "A").await, AuthStatus::Pending);
}

#[tokio::test]
async fn accept_preauth_is_local_only() {
    let (app, runner) = engine(TestStore::default()).await;
    seed(&app, "A", AuthStatus::Preauthorized).await;

    app.accept_device_preauth(&ctx(), &AuthId::from("A")).await.unwrap();

    assert_eq!(status_of(&app, "A").await, AuthStatus::Accepted);
    assert!(runner.requests().is_empty());
}

#[tokio::test]
async fn accept_preauth_requires_preauthorized_status() {
    for status in [AuthStatus::Pending, AuthStatus::Accepted, AuthStatus::Rejected] {
        let (app, runner) = engine(TestStore::default()).await;
        seed(&app, "A", status).await;

        let err = app
            .accept_device_preauth(&ctx(), &AuthId::from("A"))
            .await
            .unwrap_err();

        assert!(matches!(err, AdmissionError::NotPreauthorized { status: s } if s == status));
        assert!(err.is_invalid_transition());
        assert_eq!(status_of(&app, "A").await, status);
        assert!(runner.requests().is_empty());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pre-authorization
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn preauthorize_creates_record_and_tells_devauth() {
    let (app, runner) = engine(TestStore::default()).await;

    let dev = app
        .preauthorize_device(&ctx(), preauth_request("X"), "Bearer token")
        .await
        .unwrap();

    assert_eq!(dev.status, AuthStatus::Preauthorized);
    assert_eq!(dev.request_time, Some(now()));
    assert!(!dev.id.is_empty());
    assert!(!dev.device_id.is_empty());
    assert_eq!(app.get_device_auth(&ctx(), &dev.id).await.unwrap(), dev);

    let requests = runner.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, Method::POST);
    assert_eq!(requests[0].headers["authorization"], "Bearer token");
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["auth_set_id"], dev.id.as_str());
    assert_eq!(body["device_id"], dev.device_id.as_str());
    assert_eq!(body["id_data"], "X");
}

#[tokio::test]
async fn second_preauthorization_of_identity_conflicts() {
    let (app, runner) = engine(TestStore::default()).await;

    app.preauthorize_device(&ctx(), preauth_request("X"), "Bearer token")
        .await
        .unwrap();
    let err = app
        .preauthorize_device(&ctx(), preauth_request("X"), "Bearer token")
        .await
        .unwrap_err();

    assert!(matches!(err, AdmissionError::Conflict(_)));
    assert_eq!(
        app.list_device_auths(&ctx(), 0, 0, &DeviceAuthFilter::default())
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(runner.requests().len(), 1);
}

#[tokio::test]
async fn identity_of_a_submitted_auth_set_also_conflicts() {
    let (app, _) = engine(TestStore::default()).await;
    app.submit_device_auth(&ctx(), submitted("A", "D", "X"))
        .await
        .unwrap();

    let err = app
        .preauthorize_device(&ctx(), preauth_request("X"), "Bearer token")
        .await
        .unwrap_err();
    assert!(matches!(err, AdmissionError::Conflict(_)));
}

#[tokio::test]
async fn concurrent_preauthorizations_leave_exactly_one_record() {
    let store = TestStore {
        lookup_gate: Some(Arc::new(Barrier::new(2))),
        ..TestStore::default()
    };
    let (app, _) = engine(store).await;
    let ctx = ctx();

    let (first, second) = tokio::join!(
        app.preauthorize_device(&ctx, preauth_request("X"), "Bearer token"),
        app.preauthorize_device(&ctx, preauth_request("X"), "Bearer token"),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(AdmissionError::Conflict(_))))
            .count(),
        1
    );
    assert_eq!(
        app.list_device_auths(&ctx, 0, 0, &DeviceAuthFilter::default())
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn preauthorization_survives_devauth_failure() {
    let (app, runner) = engine(TestStore::default()).await;
    runner.push_response(HttpResponse::new(StatusCode::BAD_GATEWAY));

    let err = app
        .preauthorize_device(&ctx(), preauth_request("X"), "Bearer token")
        .await
        .unwrap_err();

    assert!(matches!(err, AdmissionError::Upstream(_)));
    let stored = app
        .list_device_auths(&ctx(), 0, 0, &DeviceAuthFilter::default())
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, AuthStatus::Preauthorized);
}

#[tokio::test]
async fn preauthorization_requires_identity_and_key() {
    let (app, runner) = engine(TestStore::default()).await;
    let err = app
        .preauthorize_device(&ctx(), preauth_request(""), "Bearer token")
        .await
        .unwrap_err();
    assert!(matches!(err, AdmissionError::Validation(_)));
    assert!(runner.requests().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Deletion and provisioning
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_device_data_removes_all_auth_sets_of_the_device() {
    let (app, _) = engine(TestStore::default()).await;
    app.submit_device_auth(&ctx(), submitted("A1", "D", "x1")).await.unwrap();
    app.submit_device_auth(&ctx(), submitted("A2", "D", "x2")).await.unwrap();
    app.submit_device_auth(&ctx(), submitted("B", "E", "y")).await.unwrap();

    app.delete_device_data(&ctx(), &DeviceId::from("D")).await.unwrap();

    let left = app
        .list_device_auths(&ctx(), 0, 0, &DeviceAuthFilter::default())
        .await
        .unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, AuthId::from("B"));
}

#[tokio::test]
async fn delete_device_data_of_unknown_device_follows_policy() {
    let (strict, _) = engine(TestStore::default()).await;
    assert!(matches!(
        strict.delete_device_data(&ctx(), &DeviceId::from("ghost")).await,
        Err(AdmissionError::NotFound)
    ));

    let (lenient, _) = engine(TestStore {
        inner: InMemoryDataStore::new().with_missing_device_policy(MissingDevicePolicy::Idempotent),
        ..TestStore::default()
    }).await;
    lenient
        .delete_device_data(&ctx(), &DeviceId::from("ghost"))
        .await
        .unwrap();
}

#[tokio::test]
async fn delete_removes_a_single_auth_set() {
    let (app, _) = engine(TestStore::default()).await;
    seed(&app, "A", AuthStatus::Pending).await;
    seed(&app, "B", AuthStatus::Pending).await;

    app.delete_device_auth(&ctx(), &AuthId::from("A")).await.unwrap();

    assert!(matches!(
        app.get_device_auth(&ctx(), &AuthId::from("A")).await,
        Err(AdmissionError::NotFound)
    ));
    assert_eq!(status_of(&app, "B").await, AuthStatus::Pending);
}

#[tokio::test]
async fn provisioning_migrates_the_tenant_even_without_automigrate() {
    let store = TestStore::default();
    let (app, _) = engine(store.clone()).await;
    let tenant: TenantId = "newco".parse().unwrap();

    app.provision_tenant(&RequestContext::default(), &tenant)
        .await
        .unwrap();

    let applied = store.inner.applied_versions(&TenantScope::Tenant(tenant.clone()));
    assert_eq!(applied.last(), Some(&DB_VERSION));

    // The shared store itself still only checks.
    store
        .migrate_tenant(&DB_VERSION, &TenantScope::Tenant(tenant))
        .await
        .unwrap();
}
