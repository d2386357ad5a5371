//! Admission Pipeline Integration Tests
//!
//! These tests drive the full gate sequence (credential, rate window, monthly usage) against a
//! real `SQLite` schema and the in-memory shared store:
//! - Tier policies at their exact boundaries
//! - Gate ordering and short-circuiting
//! - Fail-open for the counters, fail-closed for credentials
//! - Concurrent increments and a single period rollover under contention

use crate::mock_infrastructure::{
    FailingRepository, FailingStore, ResetCountingOrganizations, TestBackend,
};
use chrono::{Duration as ChronoDuration, Utc};
use regrada_core::{
    auth::AuthError,
    middleware::{
        AdmissionPipeline, AuthCache, AuthStrategy, CredentialResolver, RateLimiter,
        RejectionKind, UsageMeter,
    },
    repository::{ApiKeyRepository, OrganizationRepository},
    types::{error_codes, Tier},
};
use std::{sync::Arc, time::Duration};

async fn monthly_count(backend: &TestBackend, organization_id: &str) -> i64 {
    backend
        .repository
        .get_usage(organization_id)
        .await
        .unwrap()
        .expect("organization exists")
        .monthly_request_count
}

#[tokio::test]
async fn test_valid_key_admitted_with_rate_and_usage_decisions() {
    let backend = TestBackend::new().await;
    let (org, secret) = backend.seed_organization(Tier::Team, 0).await;

    let admission = backend.pipeline().admit(TestBackend::bearer(&secret), true).await.unwrap();

    assert_eq!(admission.principal.organization_id, org.id);
    assert_eq!(admission.principal.tier, Tier::Team);

    let rate = admission.rate.expect("rate decision");
    assert!(rate.allowed);
    assert_eq!(rate.limit, 100);
    assert_eq!(rate.remaining, 99);

    let usage = admission.usage.expect("usage decision");
    assert!(usage.allowed);
    assert_eq!(usage.usage.monthly_request_count, 1);
    assert_eq!(usage.usage.monthly_request_limit, 500_000);
}

#[tokio::test]
async fn test_unmetered_route_does_not_touch_monthly_counter() {
    let backend = TestBackend::new().await;
    let (org, secret) = backend.seed_organization(Tier::Starter, 0).await;

    let admission = backend.pipeline().admit(TestBackend::bearer(&secret), false).await.unwrap();

    assert!(admission.rate.is_some());
    assert!(admission.usage.is_none());
    assert_eq!(monthly_count(&backend, &org.id).await, 0);
}

#[tokio::test]
async fn test_starter_blocked_when_request_reaches_limit() {
    let backend = TestBackend::new().await;
    let (org, secret) = backend.seed_organization(Tier::Starter, 49_998).await;
    let pipeline = backend.pipeline();

    let admission = pipeline.admit(TestBackend::bearer(&secret), true).await.unwrap();
    assert_eq!(admission.usage.unwrap().usage.monthly_request_count, 49_999);

    let rejection = pipeline.admit(TestBackend::bearer(&secret), true).await.unwrap_err();
    assert_eq!(rejection.kind, RejectionKind::UsageExceeded);
    assert_eq!(rejection.status_code(), 402);

    let envelope = rejection.envelope();
    assert_eq!(envelope.error.code, error_codes::USAGE_LIMIT_EXCEEDED);
    let details = envelope.error.details.expect("usage details");
    assert_eq!(details["limit"], 50_000);
    assert_eq!(details["used"], 50_000);
    assert_eq!(details["tier"], "starter");
    assert!(details.get("overage").is_none());

    // blocked requests are still counted
    assert_eq!(monthly_count(&backend, &org.id).await, 50_000);
}

#[tokio::test]
async fn test_team_throttled_at_one_hundred_twenty_percent() {
    let backend = TestBackend::new().await;
    let (_, secret) = backend.seed_organization(Tier::Team, 599_998).await;
    let pipeline = backend.pipeline();

    let admission = pipeline.admit(TestBackend::bearer(&secret), true).await.unwrap();
    let usage = admission.usage.unwrap();
    assert!(usage.allowed);
    assert!(usage.usage_percent > 100.0 && usage.usage_percent < 120.0);

    let rejection = pipeline.admit(TestBackend::bearer(&secret), true).await.unwrap_err();
    assert_eq!(rejection.kind, RejectionKind::UsageThrottled);
    assert_eq!(rejection.status_code(), 429);

    let envelope = rejection.envelope();
    assert_eq!(envelope.error.code, error_codes::USAGE_LIMIT_THROTTLED);
    let details = envelope.error.details.expect("usage details");
    assert_eq!(details["used"], 600_000);
    assert_eq!(details["overage"], 100_000);
    assert_eq!(details["tier"], "team");
}

#[tokio::test]
async fn test_team_over_limit_but_under_throttle_is_admitted() {
    let backend = TestBackend::new().await;
    let (_, secret) = backend.seed_organization(Tier::Team, 550_000).await;

    let admission = backend.pipeline().admit(TestBackend::bearer(&secret), true).await.unwrap();
    assert!(admission.usage.unwrap().allowed);
}

#[tokio::test]
async fn test_enterprise_never_rejected_for_usage() {
    let backend = TestBackend::new().await;
    let (_, secret) = backend.seed_organization(Tier::Enterprise, 90_000_000).await;

    let admission = backend.pipeline().admit(TestBackend::bearer(&secret), true).await.unwrap();
    let usage = admission.usage.unwrap();
    assert!(usage.allowed);
    assert!(usage.usage_percent > 400.0);
}

#[tokio::test]
async fn test_hundred_and_first_request_in_window_is_rate_limited() {
    let backend = TestBackend::new().await;
    let (_, secret) = backend.seed_organization(Tier::Team, 0).await;
    let pipeline = backend.pipeline();

    for i in 1..=100u32 {
        let admission = pipeline.admit(TestBackend::bearer(&secret), false).await.unwrap();
        assert_eq!(admission.rate.unwrap().remaining, 100 - i);
    }

    let rejection = pipeline.admit(TestBackend::bearer(&secret), false).await.unwrap_err();
    assert_eq!(rejection.kind, RejectionKind::RateLimited);
    assert_eq!(rejection.status_code(), 429);
    let rate = rejection.rate.expect("rate decision on rejection");
    assert_eq!(rate.remaining, 0);

    let details = rejection.envelope().error.details.expect("rate details");
    assert_eq!(details["limit"], 100);
    assert_eq!(details["reset"], rate.reset_epoch_seconds);
}

#[tokio::test]
async fn test_rate_window_rolls_over_on_the_minute() {
    let backend = TestBackend::new().await;
    let (org, _) = backend.seed_organization(Tier::Team, 0).await;
    let (_, secret) = backend.issue_key(&org.id, Tier::Team, Some(2)).await;
    let pipeline = backend.pipeline();

    pipeline.admit(TestBackend::bearer(&secret), false).await.unwrap();
    pipeline.admit(TestBackend::bearer(&secret), false).await.unwrap();
    let rejection = pipeline.admit(TestBackend::bearer(&secret), false).await.unwrap_err();
    let reset = rejection.rate.unwrap().reset_epoch_seconds;

    backend.clock.advance(ChronoDuration::seconds(50));
    assert_eq!(backend.clock.now().timestamp(), reset);

    let admission = pipeline.admit(TestBackend::bearer(&secret), false).await.unwrap();
    assert_eq!(admission.rate.unwrap().remaining, 1);
}

#[tokio::test]
async fn test_rate_limited_request_is_not_metered() {
    let backend = TestBackend::new().await;
    let mut org = backend.organization(Tier::Starter);
    org.monthly_request_count = 10;
    let secret = backend.seed(&org, Some(1)).await;
    let pipeline = backend.pipeline();

    pipeline.admit(TestBackend::bearer(&secret), true).await.unwrap();
    let rejection = pipeline.admit(TestBackend::bearer(&secret), true).await.unwrap_err();

    assert_eq!(rejection.kind, RejectionKind::RateLimited);
    assert!(rejection.usage.is_none());
    assert_eq!(monthly_count(&backend, &org.id).await, 11);
}

#[tokio::test]
async fn test_separate_keys_have_separate_rate_windows() {
    let backend = TestBackend::new().await;
    let (org, _) = backend.seed_organization(Tier::Team, 0).await;
    let (_, first) = backend.issue_key(&org.id, Tier::Team, Some(1)).await;
    let (_, second) = backend.issue_key(&org.id, Tier::Team, Some(1)).await;
    let pipeline = backend.pipeline();

    pipeline.admit(TestBackend::bearer(&first), false).await.unwrap();
    assert!(pipeline.admit(TestBackend::bearer(&first), false).await.is_err());
    assert!(pipeline.admit(TestBackend::bearer(&second), false).await.is_ok());
}

#[tokio::test]
async fn test_store_outage_fails_open() {
    let backend = TestBackend::new().await;
    let (org, secret) = backend.seed_organization(Tier::Starter, 0).await;
    let store = Arc::new(FailingStore::new());
    let pipeline = backend.pipeline_with(store.clone(), backend.repository.clone());

    for _ in 0..20 {
        let admission = pipeline.admit(TestBackend::bearer(&secret), true).await.unwrap();
        assert!(admission.rate.is_none());
        assert!(admission.usage.is_some());
    }

    assert!(store.calls() > 0);
    assert_eq!(monthly_count(&backend, &org.id).await, 20);
}

#[tokio::test]
async fn test_usage_repository_outage_fails_open() {
    let backend = TestBackend::new().await;
    let (_, secret) = backend.seed_organization(Tier::Starter, 60_000).await;
    let pipeline = backend.pipeline_with(backend.store.clone(), Arc::new(FailingRepository));

    let admission = pipeline.admit(TestBackend::bearer(&secret), true).await.unwrap();
    assert!(admission.rate.is_some());
    assert!(admission.usage.is_none());
}

#[tokio::test]
async fn test_credential_lookup_outage_fails_closed() {
    let backend = TestBackend::new().await;
    let (_, secret) = backend.seed_organization(Tier::Team, 0).await;
    let failing = Arc::new(FailingRepository);
    let resolver = CredentialResolver::new(
        failing.clone(),
        failing.clone(),
        failing.clone(),
        AuthCache::new(backend.store.clone(), Duration::from_secs(300)),
        backend.clock.clock(),
    );
    let pipeline = AdmissionPipeline::new(
        resolver,
        RateLimiter::new(backend.store.clone(), &backend.config.rate_limit, backend.clock.clock()),
        UsageMeter::new(failing, backend.clock.clock()),
    );

    let rejection = pipeline.admit(TestBackend::bearer(&secret), true).await.unwrap_err();

    assert!(matches!(rejection.kind, RejectionKind::Auth(AuthError::KeyLookupFailed(_))));
    assert_eq!(rejection.status_code(), 500);
    assert!(rejection.rate.is_none());
    let envelope = rejection.envelope();
    assert_eq!(envelope.error.code, error_codes::INTERNAL_ERROR);
    assert_eq!(envelope.error.message, "Failed to validate API key");
}

#[tokio::test]
async fn test_credential_errors_stop_before_rate_gate() {
    let backend = TestBackend::new().await;
    let pipeline = backend.pipeline();

    let missing = pipeline.admit(Err(AuthError::MissingCredentials), true).await.unwrap_err();
    assert_eq!(missing.status_code(), 401);
    assert!(missing.rate.is_none());

    let unknown = pipeline
        .admit(Ok(AuthStrategy::ApiKey("rg_live_does_not_exist".to_string())), true)
        .await
        .unwrap_err();
    assert_eq!(unknown.kind, RejectionKind::Auth(AuthError::InvalidApiKey));
    assert_eq!(unknown.envelope().error.code, error_codes::UNAUTHORIZED);

    assert!(backend.store.is_empty());
}

#[tokio::test]
async fn test_session_without_identity_provider_is_rejected() {
    let backend = TestBackend::new().await;
    let strategy = AuthStrategy::select(None, Some("eyJhbGciOiJSUzI1NiJ9.e30.sig"));

    let rejection = backend.pipeline().admit(strategy, true).await.unwrap_err();

    assert!(matches!(rejection.kind, RejectionKind::Auth(AuthError::InvalidSession(_))));
    assert_eq!(rejection.envelope().error.code, error_codes::TOKEN_EXPIRED);
}

#[tokio::test]
async fn test_revoked_key_served_from_cache_until_ttl() {
    let mut backend = TestBackend::new().await;
    backend.config.auth.api_key_cache_ttl_seconds = 1;
    let (org, _) = backend.seed_organization(Tier::Team, 0).await;
    let (key, secret) = backend.issue_key(&org.id, Tier::Team, None).await;
    let pipeline = backend.pipeline();

    pipeline.admit(TestBackend::bearer(&secret), false).await.unwrap();
    assert!(backend.repository.revoke(&key.id, Utc::now()).await.unwrap());

    // still cached
    pipeline.admit(TestBackend::bearer(&secret), false).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let rejection = pipeline.admit(TestBackend::bearer(&secret), false).await.unwrap_err();
    assert_eq!(rejection.kind, RejectionKind::Auth(AuthError::RevokedApiKey));
    assert_eq!(rejection.status_code(), 401);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_metered_requests_are_all_counted() {
    let backend = TestBackend::new().await;
    let (org, secret) = backend.seed_organization(Tier::Scale, 0).await;
    let pipeline = Arc::new(backend.pipeline());

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let pipeline = pipeline.clone();
            let secret = secret.clone();
            tokio::spawn(async move { pipeline.admit(TestBackend::bearer(&secret), true).await })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(monthly_count(&backend, &org.id).await, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_period_rollover_resets_once() {
    let backend = TestBackend::new().await;
    let mut org = backend.organization(Tier::Team);
    org.monthly_request_count = 499_000;
    org.usage_reset_at = backend.clock.now() - ChronoDuration::seconds(1);
    let secret = backend.seed(&org, None).await;

    let organizations = Arc::new(ResetCountingOrganizations::new(backend.repository.clone()));
    let pipeline = Arc::new(backend.pipeline_with(backend.store.clone(), organizations.clone()));

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let pipeline = pipeline.clone();
            let secret = secret.clone();
            tokio::spawn(async move { pipeline.admit(TestBackend::bearer(&secret), true).await })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(organizations.resets(), 1);

    let usage = backend.repository.get_usage(&org.id).await.unwrap().unwrap();
    assert_eq!(usage.monthly_request_count, 20);
    assert!(usage.usage_reset_at > backend.clock.now());
}

#[tokio::test]
async fn test_request_after_period_end_starts_fresh_count() {
    let backend = TestBackend::new().await;
    let mut org = backend.organization(Tier::Starter);
    org.monthly_request_count = 50_000;
    org.usage_reset_at = backend.clock.now() + ChronoDuration::minutes(5);
    let secret = backend.seed(&org, None).await;
    let pipeline = backend.pipeline();

    let rejection = pipeline.admit(TestBackend::bearer(&secret), true).await.unwrap_err();
    assert_eq!(rejection.kind, RejectionKind::UsageExceeded);

    backend.clock.advance(ChronoDuration::minutes(6));

    let admission = pipeline.admit(TestBackend::bearer(&secret), true).await.unwrap();
    let usage = admission.usage.unwrap();
    assert_eq!(usage.usage.monthly_request_count, 1);
    assert!(usage.usage.usage_reset_at > backend.clock.now());
}
