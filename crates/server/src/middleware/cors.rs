//! Browser CORS policy for the web dashboard.

use axum::http::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    HeaderValue, Method,
};
use regrada_core::config::CorsConfig;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

const PREFLIGHT_MAX_AGE: Duration = Duration::from_secs(7200);

/// Builds the CORS layer from the configured origin list.
///
/// Listed origins are echoed back with credentials allowed, so the session cookie travels.
/// A `*` entry opens the API to every origin without credentials, and is dropped when
/// `production` is set.
#[must_use]
pub fn create_cors_layer(config: &CorsConfig, production: bool) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .max_age(PREFLIGHT_MAX_AGE);

    let mut wildcard = false;
    let mut origins = Vec::with_capacity(config.allowed_origins.len());

    for origin in config.allowed_origins.iter().map(|o| o.trim()).filter(|o| !o.is_empty()) {
        if origin == "*" {
            if production {
                warn!("ignoring wildcard CORS origin in production");
            } else {
                wildcard = true;
            }
            continue;
        }

        match HeaderValue::from_str(origin) {
            Ok(value) => origins.push(value),
            Err(e) => warn!(origin, error = %e, "skipping invalid CORS origin"),
        }
    }

    if wildcard {
        base.allow_origin(Any)
    } else {
        base.allow_origin(AllowOrigin::list(origins)).allow_credentials(true)
    }
}
