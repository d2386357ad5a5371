//! HTTP middleware for the ingestion server.
//!
//! These are thin Axum adapters over `regrada_core::middleware`. They deal with headers, cookies,
//! and status codes; the admission decisions themselves live in the core crate.

pub mod admission;
pub mod correlation_id;
pub mod cors;

pub use admission::{
    admission_middleware, AdmissionState, X_MONTHLY_LIMIT, X_MONTHLY_RESET, X_MONTHLY_USED,
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use correlation_id::{
    correlation_id_middleware, create_request_id_layers, CorrelationId, UuidRequestIdGenerator,
    X_REQUEST_ID,
};
pub use cors::create_cors_layer;
