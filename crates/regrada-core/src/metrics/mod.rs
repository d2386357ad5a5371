//! Prometheus counters for the admission pipeline.
//!
//! Recording goes through the `metrics` facade, so the `record_*` functions are cheap no-ops
//! until a recorder is installed. [`MetricsCollector::new`] installs the Prometheus recorder
//! once per process and renders it for `GET /metrics`.

use crate::{
    auth::AuthError,
    middleware::{rate_limiting::RateDecision, usage::UsageAction},
    types::CredentialKind,
};
use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn try_init_prometheus_recorder(
) -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().install_recorder()
}

fn init_prometheus_recorder() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| match try_init_prometheus_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Failed to install primary Prometheus recorder, attempting fallback"
                );

                let recorder = PrometheusBuilder::new().build_recorder();
                tracing::warn!(
                    "Using fallback Prometheus recorder (install error: {e}) - metrics may not be globally visible"
                );
                recorder.handle()
            }
        })
        .clone()
}

/// Owner of the process-wide Prometheus handle.
#[derive(Clone)]
pub struct MetricsCollector {
    prometheus_handle: PrometheusHandle,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self { prometheus_handle: init_prometheus_recorder() }
    }

    /// Current metrics in the Prometheus text exposition format.
    #[must_use]
    pub fn get_prometheus_metrics(&self) -> String {
        self.prometheus_handle.render()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Final outcome of one pass through the admission pipeline.
pub fn record_admission(outcome: &'static str) {
    counter!("admission_requests_total", "outcome" => outcome).increment(1);
}

pub fn record_auth_success(kind: CredentialKind) {
    counter!("auth_success_total", "credential" => kind.as_str()).increment(1);
}

pub fn record_auth_failure(error: &AuthError) {
    counter!("auth_failures_total", "reason" => error.as_metric_str()).increment(1);
}

/// `result` is `hit`, `miss` or `error`.
pub fn record_auth_cache(result: &'static str) {
    counter!("auth_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_rate_decision(decision: &RateDecision) {
    let result = if decision.allowed { "allowed" } else { "rejected" };
    counter!("rate_limit_decisions_total", "result" => result).increment(1);
}

pub fn record_usage_decision(action: UsageAction) {
    counter!("usage_decisions_total", "action" => action.as_str()).increment(1);
}

/// A gate could not reach its backing store and admitted the request anyway.
pub fn record_fail_open(gate: &'static str) {
    counter!("admission_fail_open_total", "gate" => gate).increment(1);
}
