//! Wire models for uploaded LLM traces and test runs.
//!
//! Only the identifying fields are required. Everything else defaults, so SDKs can send
//! partial payloads as they add instrumentation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum number of traces accepted in one batch upload.
pub const MAX_BATCH_TRACES: usize = 100;

/// Status stored for test runs uploaded without one.
pub const DEFAULT_TEST_RUN_STATUS: &str = "completed";

/// A single LLM API call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub request: TraceRequest,
    #[serde(default)]
    pub response: TraceResponse,
    #[serde(default)]
    pub metrics: TraceMetrics,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redaction_applied: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<SamplingParams>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Provider response body, kept verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceMetrics {
    #[serde(default)]
    pub latency_ms: i64,
    #[serde(default)]
    pub tokens_in: i64,
    #[serde(default)]
    pub tokens_out: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

/// Body of a batch trace upload.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceBatch {
    pub traces: Vec<Trace>,
}

/// One complete evaluation run, usually uploaded from CI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub git_sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_build_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_build_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_pr_number: Option<i64>,
    /// Snapshot of the evaluation config used for the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default)]
    pub results: Vec<CaseResult>,
    #[serde(default)]
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub total_cases: i64,
    #[serde(default)]
    pub passed_cases: i64,
    #[serde(default)]
    pub warned_cases: i64,
    #[serde(default)]
    pub failed_cases: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl TestRun {
    #[must_use]
    pub fn effective_status(&self) -> &str {
        self.status.as_deref().filter(|s| !s.is_empty()).unwrap_or(DEFAULT_TEST_RUN_STATUS)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub runs: Vec<RunResult>,
    #[serde(default)]
    pub aggregates: Aggregates,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: i64,
    pub pass: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    #[serde(default)]
    pub metrics: RunMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    #[serde(default)]
    pub latency_ms: i64,
    #[serde(default)]
    pub refused: bool,
    #[serde(default)]
    pub json_valid: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregates {
    #[serde(default)]
    pub pass_rate: f64,
    #[serde(default)]
    pub latency_p95_ms: i64,
    #[serde(default)]
    pub refusal_rate: f64,
    #[serde(default)]
    pub json_valid_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub policy_id: String,
    pub severity: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}
