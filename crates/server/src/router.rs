use crate::middleware::{
    admission_middleware, correlation_id_middleware, create_cors_layer, create_request_id_layers,
    AdmissionState,
};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use regrada_core::{
    auth::api_key::{ApiKey, ApiKeySummary, CreateApiKeyRequest},
    config::AppConfig,
    ingest::{TestRun, Trace, TraceBatch, MAX_BATCH_TRACES},
    metrics::MetricsCollector,
    middleware::AdmissionPipeline,
    repository::{ApiKeyRepository, HealthCheck, IngestRepository, OrganizationRepository},
    store::SharedStore,
    types::{error_codes, ErrorEnvelope, Principal},
};
use chrono::Utc;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

/// Budget for the dependency checks behind `GET /health`.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub api_keys: Arc<dyn ApiKeyRepository>,
    pub ingest: Arc<dyn IngestRepository>,
    pub organizations: Arc<dyn OrganizationRepository>,
    pub database: Arc<dyn HealthCheck>,
    pub store: Arc<dyn SharedStore>,
    /// `None` when the metrics endpoint is disabled.
    pub metrics: Option<MetricsCollector>,
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(ErrorEnvelope::new(code, message))).into_response()
}

fn require_organization(principal: &Principal) -> Result<&str, Response> {
    if principal.has_organization() {
        Ok(&principal.organization_id)
    } else {
        Err(error_response(
            StatusCode::FORBIDDEN,
            error_codes::FORBIDDEN,
            "Organization membership required",
        ))
    }
}

/// `POST /v1/projects/{project_id}/traces`
pub async fn handle_upload_trace(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(project_id): Path<String>,
    payload: Result<Json<Trace>, JsonRejection>,
) -> Response {
    if let Err(response) = require_organization(&principal) {
        return response;
    }
    let Ok(Json(trace)) = payload else {
        return error_response(
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_REQUEST,
            "Invalid trace data",
        );
    };

    if let Err(e) = state.ingest.store_trace(&project_id, &trace).await {
        error!(
            project_id = %project_id,
            trace_id = %trace.trace_id,
            error = %e,
            "failed to store trace"
        );
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INTERNAL_ERROR,
            "Failed to store trace",
        );
    }

    (StatusCode::CREATED, Json(json!({"status": "created", "trace_id": trace.trace_id})))
        .into_response()
}

/// `POST /v1/projects/{project_id}/traces/batch`
pub async fn handle_upload_trace_batch(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(project_id): Path<String>,
    payload: Result<Json<TraceBatch>, JsonRejection>,
) -> Response {
    if let Err(response) = require_organization(&principal) {
        return response;
    }
    let Ok(Json(batch)) = payload else {
        return error_response(
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_REQUEST,
            "Invalid request body",
        );
    };

    if batch.traces.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_REQUEST,
            "No traces provided",
        );
    }
    if batch.traces.len() > MAX_BATCH_TRACES {
        return error_response(
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_REQUEST,
            "Maximum 100 traces per batch",
        );
    }

    if let Err(e) = state.ingest.store_traces(&project_id, &batch.traces).await {
        error!(
            project_id = %project_id,
            count = batch.traces.len(),
            error = %e,
            "failed to store trace batch"
        );
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INTERNAL_ERROR,
            "Failed to store traces",
        );
    }

    (StatusCode::CREATED, Json(json!({"status": "created", "count": batch.traces.len()})))
        .into_response()
}

/// `POST /v1/projects/{project_id}/test-runs`
pub async fn handle_upload_test_run(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(project_id): Path<String>,
    payload: Result<Json<TestRun>, JsonRejection>,
) -> Response {
    if let Err(response) = require_organization(&principal) {
        return response;
    }
    let Ok(Json(run)) = payload else {
        return error_response(
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_REQUEST,
            "Invalid test run data",
        );
    };

    if let Err(e) = state.ingest.store_test_run(&project_id, &run).await {
        error!(
            project_id = %project_id,
            run_id = %run.run_id,
            error = %e,
            "failed to store test run"
        );
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INTERNAL_ERROR,
            "Failed to store test run",
        );
    }

    (StatusCode::CREATED, Json(json!({"status": "created", "run_id": run.run_id})))
        .into_response()
}

/// `GET /v1/usage`: the caller's monthly counter. Gated but not metered.
pub async fn handle_usage(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Response {
    let organization_id = match require_organization(&principal) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.organizations.get_usage(organization_id).await {
        Ok(Some(usage)) => Json(usage).into_response(),
        Ok(None) => {
            error_response(StatusCode::NOT_FOUND, error_codes::NOT_FOUND, "Organization not found")
        }
        Err(e) => {
            error!(organization_id, error = %e, "failed to load usage");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                error_codes::INTERNAL_ERROR,
                "Failed to load usage",
            )
        }
    }
}

/// `GET /v1/api-keys`
pub async fn handle_list_api_keys(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Response {
    let organization_id = match require_organization(&principal) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.api_keys.list_for_organization(organization_id).await {
        Ok(keys) => {
            let api_keys: Vec<ApiKeySummary> = keys.iter().map(ApiKeySummary::from).collect();
            Json(json!({"count": api_keys.len(), "api_keys": api_keys})).into_response()
        }
        Err(e) => {
            error!(organization_id, error = %e, "failed to list API keys");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                error_codes::INTERNAL_ERROR,
                "Failed to fetch API keys",
            )
        }
    }
}

/// `POST /v1/api-keys`: the plaintext secret is in this response and nowhere else.
pub async fn handle_create_api_key(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<CreateApiKeyRequest>, JsonRejection>,
) -> Response {
    let organization_id = match require_organization(&principal) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let Ok(Json(request)) = payload else {
        return error_response(
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_REQUEST,
            "Invalid request parameters",
        );
    };
    let name = request.name.trim();
    if name.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_REQUEST,
            "name is required",
        );
    }

    let organization = match state.organizations.get(organization_id).await {
        Ok(Some(organization)) => organization,
        Ok(None) => {
            return error_response(
                StatusCode::NOT_FOUND,
                error_codes::NOT_FOUND,
                "Organization not found",
            )
        }
        Err(e) => {
            error!(organization_id, error = %e, "failed to load organization");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                error_codes::INTERNAL_ERROR,
                "Failed to fetch organization",
            );
        }
    };

    let (key, secret) =
        match ApiKey::issue(organization_id, name, organization.tier, request.expires_at) {
            Ok(issued) => issued,
            Err(e) => {
                error!(organization_id, error = %e, "API key generation failed");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error_codes::INTERNAL_ERROR,
                    "Failed to generate API key",
                );
            }
        };

    if let Err(e) = state.api_keys.create(&key).await {
        error!(organization_id, error = %e, "failed to store API key");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INTERNAL_ERROR,
            "Failed to create API key",
        );
    }

    info!(organization_id, api_key_id = %key.id, tier = %key.tier, "API key created");
    (
        StatusCode::CREATED,
        Json(json!({"api_key": ApiKeySummary::from(&key), "secret": secret})),
    )
        .into_response()
}

/// `POST /v1/api-keys/{key_id}/revoke`
///
/// Keys of other organizations are reported as missing. A revoked key can keep
/// authenticating until its auth cache entry expires.
pub async fn handle_revoke_api_key(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(key_id): Path<String>,
) -> Response {
    let organization_id = match require_organization(&principal) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let owned = match state.api_keys.list_for_organization(organization_id).await {
        Ok(keys) => keys.iter().any(|key| key.id == key_id),
        Err(e) => {
            error!(organization_id, error = %e, "failed to list API keys");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                error_codes::INTERNAL_ERROR,
                "Failed to fetch API key",
            );
        }
    };
    if !owned {
        return error_response(StatusCode::NOT_FOUND, error_codes::NOT_FOUND, "API key not found");
    }

    match state.api_keys.revoke(&key_id, Utc::now()).await {
        Ok(true) => {
            info!(organization_id, api_key_id = %key_id, "API key revoked");
            Json(json!({"success": true})).into_response()
        }
        Ok(false) => error_response(
            StatusCode::NOT_FOUND,
            error_codes::NOT_FOUND,
            "API key not found or already revoked",
        ),
        Err(e) => {
            error!(organization_id, api_key_id = %key_id, error = %e, "failed to revoke API key");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                error_codes::INTERNAL_ERROR,
                "Failed to revoke API key",
            )
        }
    }
}

pub async fn handle_metrics(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(collector) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            collector.get_prometheus_metrics(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn handle_health(State(state): State<AppState>) -> Response {
    let checks = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, async {
        tokio::join!(state.database.ping(), state.store.ping())
    })
    .await;

    let (database_up, store_up) = match checks {
        Ok((database, store)) => {
            if let Err(e) = &database {
                warn!(error = %e, "health check: database down");
            }
            if let Err(e) = &store {
                warn!(error = %e, backend = state.store.backend_name(), "health check: store down");
            }
            (database.is_ok(), store.is_ok())
        }
        Err(_) => {
            warn!(timeout = ?HEALTH_CHECK_TIMEOUT, "health checks timed out");
            (false, false)
        }
    };

    let label = |up: bool| if up { "up" } else { "down" };
    let healthy = database_up && store_up;
    let body = json!({
        "status": if healthy { "ok" } else { "error" },
        "checks": {
            "database": label(database_up),
            "store": label(store_up),
        }
    });

    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body)).into_response()
}

/// Assembles the full application router.
///
/// ```text
/// /health, /metrics                      public
/// /v1/usage                              auth + rate limit
/// /v1/api-keys, /v1/api-keys/{key_id}/revoke   "
/// /v1/projects/{project_id}/traces       auth + rate limit + monthly usage
/// /v1/projects/{project_id}/traces/batch    "
/// /v1/projects/{project_id}/test-runs       "
/// ```
pub fn create_app(state: AppState, pipeline: Arc<AdmissionPipeline>, config: &AppConfig) -> Router {
    let gate = AdmissionState::new(
        pipeline,
        config.request_timeout(),
        &config.auth.session_cookie,
    );

    let public = Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics));

    let gated = Router::new()
        .route("/v1/usage", get(handle_usage))
        .route("/v1/api-keys", get(handle_list_api_keys).post(handle_create_api_key))
        .route("/v1/api-keys/{key_id}/revoke", post(handle_revoke_api_key))
        .layer(axum_middleware::from_fn_with_state(gate.clone(), admission_middleware));

    let metered = Router::new()
        .route("/v1/projects/{project_id}/traces", post(handle_upload_trace))
        .route("/v1/projects/{project_id}/traces/batch", post(handle_upload_trace_batch))
        .route("/v1/projects/{project_id}/test-runs", post(handle_upload_test_run))
        .layer(axum_middleware::from_fn_with_state(gate.metered(), admission_middleware));

    let (set_request_id, propagate_request_id) = create_request_id_layers();

    info!(
        max_concurrent = config.server.max_concurrent_requests,
        max_body_bytes = config.server.max_body_bytes,
        "router assembled"
    );

    public
        .merge(gated)
        .merge(metered)
        .with_state(state)
        .layer(axum_middleware::from_fn(correlation_id_middleware))
        .layer(ConcurrencyLimitLayer::new(config.server.max_concurrent_requests))
        .layer(RequestBodyLimitLayer::new(config.server.max_body_bytes))
        .layer(create_cors_layer(&config.cors, config.is_production()))
        // layers wrap in reverse order, so propagate runs after set
        .layer(propagate_request_id)
        .layer(set_request_id)
}
