//! # Regrada Core
//!
//! Core library for the Regrada trace and test-run ingestion backend.
//!
//! This crate provides the foundational components for:
//!
//! - **[`auth`]**: API key issuance and hashing, session token validation against the
//!   identity provider's JWKS.
//!
//! - **[`middleware`]**: The admission pipeline: credential resolution, auth cache, fixed-window
//!   rate limiting, and monthly usage metering.
//!
//! - **[`repository`]**: Persistence traits and the `SQLite` implementation.
//!
//! - **[`store`]**: Shared counter/cache store (Redis, or in-memory for tests).
//!
//! - **[`ingest`]**: Trace and test-run payload models.
//!
//! - **[`config`]**: Layered configuration (defaults, TOML file, environment).
//!
//! - **[`metrics`]**: Prometheus metrics collection.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      AdmissionPipeline                       │
//! │  ┌────────────────────┐ ┌──────────────┐ ┌────────────────┐  │
//! │  │ CredentialResolver │ │ RateLimiter  │ │   UsageMeter   │  │
//! │  └─────────┬──────────┘ └──────┬───────┘ └───────┬────────┘  │
//! │            │                   │                 │           │
//! │  ┌─────────▼──────────┐ ┌──────▼───────┐ ┌───────▼────────┐  │
//! │  │ AuthCache, JWKS,   │ │ SharedStore  │ │ Organization   │  │
//! │  │ ApiKey/User repos  │ │ (Redis)      │ │ repository     │  │
//! │  └────────────────────┘ └──────────────┘ └────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod config;
pub mod ingest;
pub mod metrics;
pub mod middleware;
pub mod repository;
pub mod store;
pub mod types;
