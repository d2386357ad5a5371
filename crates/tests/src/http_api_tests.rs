//! HTTP API End-to-End Tests
//!
//! Requests go through the complete router built by `create_app`: request-id layers, CORS,
//! the admission middleware, and the ingest handlers over an in-memory database.

use crate::mock_infrastructure::TestBackend;
use axum::{
    body::Body,
    http::{header::AUTHORIZATION, Method, Request, StatusCode},
    response::Response,
};
use regrada_core::{repository::OrganizationRepository, types::Tier};
use serde_json::{json, Value};
use server::middleware::{
    X_MONTHLY_LIMIT, X_MONTHLY_RESET, X_MONTHLY_USED, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET, X_REQUEST_ID,
};
use tower::ServiceExt;

fn trace(trace_id: &str) -> Value {
    json!({
        "trace_id": trace_id,
        "timestamp": "2026-03-15T12:00:00Z",
        "provider": "anthropic",
        "model": "claude-sonnet",
        "environment": "ci",
        "git_sha": "4f2a9c1",
        "request": {"messages": [{"role": "user", "content": "Summarize the release notes"}]},
        "response": {"assistant_text": "Three fixes and one feature."},
        "metrics": {"latency_ms": 840, "tokens_in": 12, "tokens_out": 9},
        "tags": ["release"]
    })
}

fn post(uri: &str, secret: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(secret) = secret {
        builder = builder.header(AUTHORIZATION, format!("Bearer {secret}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, secret: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(secret) = secret {
        builder = builder.header(AUTHORIZATION, format!("Bearer {secret}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_trace_upload_admitted_with_headers() {
    let backend = TestBackend::new().await;
    let (org, secret) = backend.seed_organization(Tier::Team, 0).await;

    let response = backend
        .app()
        .oneshot(post("/v1/projects/proj-1/traces", Some(&secret), &trace("tr-1")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let headers = response.headers();
    assert_eq!(headers[&X_RATELIMIT_LIMIT], "100");
    assert_eq!(headers[&X_RATELIMIT_REMAINING], "99");
    assert!(headers.contains_key(&X_RATELIMIT_RESET));
    assert_eq!(headers[&X_MONTHLY_LIMIT], "500000");
    assert_eq!(headers[&X_MONTHLY_USED], "1");
    assert_eq!(headers[&X_MONTHLY_RESET], "2026-04-01T00:00:00Z");
    assert!(headers.contains_key(&X_REQUEST_ID));

    let body = body_json(response).await;
    assert_eq!(body["status"], "created");
    assert_eq!(body["trace_id"], "tr-1");

    let usage = backend.repository.get_usage(&org.id).await.unwrap().unwrap();
    assert_eq!(usage.monthly_request_count, 1);
}

#[tokio::test]
async fn test_missing_credentials_rejected_with_envelope() {
    let backend = TestBackend::new().await;

    let response = backend
        .app()
        .oneshot(post("/v1/projects/proj-1/traces", None, &trace("tr-1")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get(&X_RATELIMIT_LIMIT).is_none());
    assert!(response.headers().contains_key(&X_REQUEST_ID));

    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    assert_eq!(body["error"]["message"], "Authentication required");
}

#[tokio::test]
async fn test_unknown_key_rejected() {
    let backend = TestBackend::new().await;

    let response = backend
        .app()
        .oneshot(post("/v1/projects/proj-1/traces", Some("rg_live_nope"), &trace("tr-1")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"]["message"], "Invalid API key");
}

#[tokio::test]
async fn test_starter_over_quota_gets_payment_required() {
    let backend = TestBackend::new().await;
    let (_, secret) = backend.seed_organization(Tier::Starter, 49_999).await;

    let response = backend
        .app()
        .oneshot(post("/v1/projects/proj-1/traces", Some(&secret), &trace("tr-1")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    assert_eq!(response.headers()[&X_MONTHLY_USED], "50000");
    assert_eq!(response.headers()[&X_MONTHLY_LIMIT], "50000");
    assert!(response.headers().contains_key(&X_RATELIMIT_REMAINING));

    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "USAGE_LIMIT_EXCEEDED");
    assert_eq!(body["error"]["details"]["tier"], "starter");
    assert_eq!(body["error"]["details"]["reset_at"], "2026-04-01T00:00:00Z");
}

#[tokio::test]
async fn test_batch_over_limit_is_rejected_after_admission() {
    let backend = TestBackend::new().await;
    let (org, secret) = backend.seed_organization(Tier::Scale, 0).await;
    let traces: Vec<Value> = (0..101).map(|i| trace(&format!("tr-{i}"))).collect();
    let batch = json!({ "traces": traces });

    let response = backend
        .app()
        .oneshot(post("/v1/projects/proj-1/traces/batch", Some(&secret), &batch))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["message"], "Maximum 100 traces per batch");

    // the request passed admission, so it was metered
    let usage = backend.repository.get_usage(&org.id).await.unwrap().unwrap();
    assert_eq!(usage.monthly_request_count, 1);
}

#[tokio::test]
async fn test_batch_and_test_run_upload() {
    let backend = TestBackend::new().await;
    let (_, secret) = backend.seed_organization(Tier::Team, 0).await;
    let app = backend.app();

    let batch = json!({ "traces": [trace("tr-a"), trace("tr-b")] });
    let response = app
        .clone()
        .oneshot(post("/v1/projects/proj-1/traces/batch", Some(&secret), &batch))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await["count"], 2);

    let run = json!({
        "run_id": "run-7",
        "timestamp": "2026-03-15T12:00:00Z",
        "git_sha": "4f2a9c1",
        "ci_provider": "github",
        "total_cases": 4,
        "passed_cases": 3,
        "failed_cases": 1,
        "status": "failed"
    });
    let response =
        app.oneshot(post("/v1/projects/proj-1/test-runs", Some(&secret), &run)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()[&X_MONTHLY_USED], "2");
    assert_eq!(body_json(response).await["run_id"], "run-7");
}

#[tokio::test]
async fn test_usage_endpoint_is_rate_limited_but_not_metered() {
    let backend = TestBackend::new().await;
    let (org, secret) = backend.seed_organization(Tier::Team, 1234).await;

    let response = backend.app().oneshot(get("/v1/usage", Some(&secret))).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[&X_RATELIMIT_REMAINING], "99");
    assert!(response.headers().get(&X_MONTHLY_USED).is_none());

    let body = body_json(response).await;
    assert_eq!(body["organization_id"], org.id);
    assert_eq!(body["tier"], "team");
    assert_eq!(body["monthly_request_count"], 1234);
    assert_eq!(body["monthly_request_limit"], 500_000);
}

#[tokio::test]
async fn test_rate_limit_shared_across_routes() {
    let backend = TestBackend::new().await;
    let (org, _) = backend.seed_organization(Tier::Team, 0).await;
    let (_, secret) = backend.issue_key(&org.id, Tier::Team, Some(1)).await;
    let app = backend.app();

    let first = app.clone().oneshot(get("/v1/usage", Some(&secret))).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(post("/v1/projects/proj-1/traces", Some(&secret), &trace("tr-1")))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second.headers()[&X_RATELIMIT_REMAINING], "0");

    let body = body_json(second).await;
    assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(body["error"]["details"]["limit"], 1);
}

#[tokio::test]
async fn test_public_routes_skip_admission() {
    let backend = TestBackend::new().await;
    let app = backend.app();

    let health = app.clone().oneshot(get("/health", None)).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(body_json(health).await["checks"]["database"], "up");

    // metrics collector is not configured in the fixture
    let metrics = app.oneshot(get("/metrics", None)).await.unwrap();
    assert_eq!(metrics.status(), StatusCode::NOT_FOUND);

    assert!(backend.store.is_empty());
}

#[tokio::test]
async fn test_request_id_preserved_on_rejection() {
    let backend = TestBackend::new().await;
    let mut request = get("/v1/usage", None);
    request.headers_mut().insert(X_REQUEST_ID.clone(), "ci-run-42".parse().unwrap());

    let response = backend.app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()[&X_REQUEST_ID], "ci-run-42");
}

#[tokio::test]
async fn test_api_key_lifecycle() {
    let backend = TestBackend::new().await;
    let (org, admin_secret) = backend.seed_organization(Tier::Team, 0).await;
    let app = backend.app();

    let created = app
        .clone()
        .oneshot(post("/v1/api-keys", Some(&admin_secret), &json!({"name": " deploy "})))
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    assert_eq!(created.headers()[&X_RATELIMIT_REMAINING], "99");
    assert!(created.headers().get(&X_MONTHLY_USED).is_none());

    let body = body_json(created).await;
    let key_id = body["api_key"]["id"].as_str().unwrap().to_string();
    let secret = body["secret"].as_str().unwrap().to_string();
    assert!(secret.starts_with("rg_live_"));
    assert_eq!(body["api_key"]["name"], "deploy");
    assert_eq!(body["api_key"]["tier"], "team");
    assert_eq!(body["api_key"]["rate_limit_rpm"], 100);
    assert_eq!(body["api_key"]["key_prefix"], &secret[..16]);
    assert!(body["api_key"].get("key_hash").is_none());

    let upload = app
        .clone()
        .oneshot(post("/v1/projects/proj-1/traces", Some(&secret), &trace("tr-1")))
        .await
        .unwrap();
    assert_eq!(upload.status(), StatusCode::CREATED);

    let revoke_uri = format!("/v1/api-keys/{key_id}/revoke");
    let revoked =
        app.clone().oneshot(post(&revoke_uri, Some(&admin_secret), &json!({}))).await.unwrap();
    assert_eq!(revoked.status(), StatusCode::OK);
    assert_eq!(body_json(revoked).await["success"], true);

    let again =
        app.clone().oneshot(post(&revoke_uri, Some(&admin_secret), &json!({}))).await.unwrap();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(again).await["error"]["message"], "API key not found or already revoked");

    let listed = app.oneshot(get("/v1/api-keys", Some(&admin_secret))).await.unwrap();
    assert_eq!(listed.status(), StatusCode::OK);
    let listing = body_json(listed).await;
    assert_eq!(listing["count"], 2);
    let entry = listing["api_keys"]
        .as_array()
        .unwrap()
        .iter()
        .find(|k| k["id"] == key_id.as_str())
        .expect("created key is listed")
        .clone();
    assert!(entry.get("revoked_at").is_some());

    // only the trace upload was metered
    let usage = backend.repository.get_usage(&org.id).await.unwrap().unwrap();
    assert_eq!(usage.monthly_request_count, 1);
}

#[tokio::test]
async fn test_key_revoked_before_first_use_is_rejected() {
    let backend = TestBackend::new().await;
    let (_, admin_secret) = backend.seed_organization(Tier::Starter, 0).await;
    let app = backend.app();

    let created = app
        .clone()
        .oneshot(post("/v1/api-keys", Some(&admin_secret), &json!({"name": "short-lived"})))
        .await
        .unwrap();
    let body = body_json(created).await;
    let key_id = body["api_key"]["id"].as_str().unwrap().to_string();
    let secret = body["secret"].as_str().unwrap().to_string();

    let revoked = app
        .clone()
        .oneshot(post(&format!("/v1/api-keys/{key_id}/revoke"), Some(&admin_secret), &json!({})))
        .await
        .unwrap();
    assert_eq!(revoked.status(), StatusCode::OK);

    let response = app
        .oneshot(post("/v1/projects/proj-1/traces", Some(&secret), &trace("tr-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"]["message"], "API key has been revoked");
}

#[tokio::test]
async fn test_keys_of_another_organization_are_not_visible() {
    let backend = TestBackend::new().await;
    let (_, own_secret) = backend.seed_organization(Tier::Team, 0).await;
    let (other_org, _) = backend.seed_organization(Tier::Scale, 0).await;
    let (other_key, other_secret) = backend.issue_key(&other_org.id, Tier::Scale, None).await;
    let app = backend.app();

    let revoke_uri = format!("/v1/api-keys/{}/revoke", other_key.id);
    let response =
        app.clone().oneshot(post(&revoke_uri, Some(&own_secret), &json!({}))).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"]["message"], "API key not found");

    let listed = app.clone().oneshot(get("/v1/api-keys", Some(&own_secret))).await.unwrap();
    assert_eq!(body_json(listed).await["count"], 1);

    let still_valid = app
        .oneshot(post("/v1/projects/proj-1/traces", Some(&other_secret), &trace("tr-1")))
        .await
        .unwrap();
    assert_eq!(still_valid.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_create_api_key_validates_body() {
    let backend = TestBackend::new().await;
    let (_, secret) = backend.seed_organization(Tier::Team, 0).await;
    let app = backend.app();

    let blank = app
        .clone()
        .oneshot(post("/v1/api-keys", Some(&secret), &json!({"name": "  "})))
        .await
        .unwrap();
    assert_eq!(blank.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(blank).await["error"]["message"], "name is required");

    let missing = app.oneshot(post("/v1/api-keys", Some(&secret), &json!({}))).await.unwrap();
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(missing).await["error"]["message"], "Invalid request parameters");
}
