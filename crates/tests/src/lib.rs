//! Integration and End-to-End Tests for the Regrada Ingestion Backend
//!
//! This crate contains the following test modules:
//!
//! - `admission_pipeline_tests`: The gate sequence against a real schema and shared store:
//!   tier boundaries, gate ordering, fail-open counters, concurrency
//! - `http_api_tests`: Requests through the complete router, headers and envelopes included
//! - `mock_infrastructure`: Failing doubles, a manual clock, and the seeded `TestBackend`
//!
//! ## Running Tests
//!
//! No external services are needed; the database is in-memory `SQLite` and the shared store
//! is the in-process backend.
//!
//! ```bash
//! cargo test --package tests
//! ```

#[cfg(test)]
mod admission_pipeline_tests;

#[cfg(test)]
mod http_api_tests;
