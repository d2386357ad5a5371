//! Admission pipeline for the ingestion API: authentication, rate limiting, and usage metering.
//!
//! This module provides the **business logic layer** for admission. HTTP adapter functions
//! (Axum extractors, headers, and responses) live in `crates/server/src/middleware`, while this
//! module decides whether a request may proceed.
//!
//! # Architecture
//!
//! ```text
//!   Incoming Request
//!        │
//!        ▼
//!   ┌──────────────────────────┐
//!   │  1. AUTHENTICATION       │  AuthStrategy::select() + CredentialResolver::resolve()
//!   │     - Bearer API key     │  - SHA-256 hash, AuthCache, repository
//!   │     - id_token cookie    │  - JWKS validation, user + membership lookup
//!   └──────────────────────────┘
//!        │ AuthError?
//!        ├─> 401 UNAUTHORIZED / TOKEN_EXPIRED, 500 INTERNAL_ERROR (fail closed)
//!        │
//!        ▼
//!   ┌──────────────────────────┐
//!   │  2. RATE LIMITING        │  RateLimiter::check()
//!   │     - fixed 60 s window  │  - shared-store INCR per credential
//!   └──────────────────────────┘
//!        │ over limit?
//!        ├─> 429 RATE_LIMIT_EXCEEDED        (store down: admitted)
//!        │
//!        ▼
//!   ┌──────────────────────────┐
//!   │  3. USAGE (metered only) │  UsageMeter::track()
//!   │     - monthly counter    │  - starter 100% hard stop
//!   │     - period rollover    │  - team/scale 120% throttle
//!   └──────────────────────────┘
//!        │ over quota?
//!        ├─> 402 USAGE_LIMIT_EXCEEDED / 429 USAGE_LIMIT_THROTTLED   (db down: admitted)
//!        │
//!        ▼
//!   Handler
//! ```
//!
//! # Module Organization
//!
//! - **[`auth`]**: credential selection and resolution into a [`Principal`](crate::types::Principal)
//! - **[`auth_cache`]**: shared-store cache of verified API keys (5 minute TTL)
//! - **[`rate_limiting`]**: fixed-window per-credential limiter
//! - **[`usage`]**: monthly per-organization quota
//! - **[`pipeline`]**: ordering of the gates and the rejection envelopes
//!
//! # Failure Policy
//!
//! Authentication fails closed: if the repository cannot confirm a credential, the request is
//! rejected. The rate and usage gates fail open: if their store is unreachable the request is
//! admitted and the event is logged and counted in `admission_fail_open_total`.

pub mod auth;
pub mod auth_cache;
pub mod pipeline;
pub mod rate_limiting;
pub mod usage;

pub use auth::{AuthStrategy, CredentialResolver};
pub use auth_cache::AuthCache;
pub use pipeline::{Admission, AdmissionPipeline, Rejection, RejectionKind};
pub use rate_limiting::{RateDecision, RateLimiter};
pub use usage::{UsageDecision, UsageMeter};
