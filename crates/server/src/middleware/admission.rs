use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::CookieJar;
use chrono::SecondsFormat;
use regrada_core::{
    auth::AuthError,
    middleware::{AdmissionPipeline, AuthStrategy, RateDecision, Rejection, UsageDecision},
    types::{error_codes, ErrorEnvelope},
};
use std::{sync::Arc, time::Duration};
use tracing::warn;

pub static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub static X_MONTHLY_LIMIT: HeaderName = HeaderName::from_static("x-monthly-limit");
pub static X_MONTHLY_USED: HeaderName = HeaderName::from_static("x-monthly-used");
pub static X_MONTHLY_RESET: HeaderName = HeaderName::from_static("x-monthly-reset");

/// State for [`admission_middleware`]. One instance per route group.
#[derive(Clone)]
pub struct AdmissionState {
    pub pipeline: Arc<AdmissionPipeline>,
    /// Whether requests on these routes count against the monthly quota.
    pub metered: bool,
    pub timeout: Duration,
    pub session_cookie: Arc<str>,
}

impl AdmissionState {
    #[must_use]
    pub fn new(pipeline: Arc<AdmissionPipeline>, timeout: Duration, session_cookie: &str) -> Self {
        Self { pipeline, metered: false, timeout, session_cookie: Arc::from(session_cookie) }
    }

    #[must_use]
    pub fn metered(mut self) -> Self {
        self.metered = true;
        self
    }
}

/// Axum middleware running the admission pipeline in front of a handler.
///
/// On success the [`Principal`](regrada_core::types::Principal) is inserted into request
/// extensions. Rate headers are attached to every response that reached the rate gate, usage
/// headers to every response whose organization was metered, rejections included.
pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let session = jar.get(&state.session_cookie).map(|cookie| cookie.value().to_string());
    let strategy = match request.headers().get(AUTHORIZATION).map(HeaderValue::to_str) {
        Some(Err(_)) => Err(AuthError::MalformedAuthorization),
        header => AuthStrategy::select(header.and_then(Result::ok), session.as_deref()),
    };

    let outcome =
        match tokio::time::timeout(state.timeout, state.pipeline.admit(strategy, state.metered))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(timeout = ?state.timeout, "admission timed out");
                return (
                    StatusCode::GATEWAY_TIMEOUT,
                    Json(ErrorEnvelope::new(error_codes::REQUEST_TIMEOUT, "Request timed out")),
                )
                    .into_response();
            }
        };

    match outcome {
        Ok(admission) => {
            request.extensions_mut().insert(admission.principal);
            let mut response = next.run(request).await;
            apply_admission_headers(
                response.headers_mut(),
                admission.rate.as_ref(),
                admission.usage.as_ref(),
            );
            response
        }
        Err(rejection) => rejection_response(&rejection),
    }
}

fn rejection_response(rejection: &Rejection) -> Response {
    let status =
        StatusCode::from_u16(rejection.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(rejection.envelope())).into_response();
    apply_admission_headers(
        response.headers_mut(),
        rejection.rate.as_ref(),
        rejection.usage.as_ref(),
    );
    response
}

fn apply_admission_headers(
    headers: &mut HeaderMap,
    rate: Option<&RateDecision>,
    usage: Option<&UsageDecision>,
) {
    if let Some(rate) = rate {
        headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(rate.limit));
        headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(rate.remaining));
        headers.insert(X_RATELIMIT_RESET.clone(), HeaderValue::from(rate.reset_epoch_seconds));
    }

    if let Some(usage) = usage {
        let counters = &usage.usage;
        headers.insert(X_MONTHLY_LIMIT.clone(), HeaderValue::from(counters.monthly_request_limit));
        headers.insert(X_MONTHLY_USED.clone(), HeaderValue::from(counters.monthly_request_count));
        let reset = counters.usage_reset_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        if let Ok(value) = HeaderValue::from_str(&reset) {
            headers.insert(X_MONTHLY_RESET.clone(), value);
        }
    }
}
