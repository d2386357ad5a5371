//! Shared domain types: tiers, principals, and the JSON error envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// Source of the current time.
///
/// Injected into the gates so tests can pin the rate window and the billing period.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Wall-clock [`Clock`] backed by [`Utc::now`].
#[must_use]
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Service plan controlling rate and usage limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Entry plan with a hard monthly cap.
    #[default]
    Starter,
    /// Mid plan, throttled after a 20% monthly overage.
    Team,
    /// Mid plan, throttled after a 20% monthly overage.
    Scale,
    /// Negotiated plan, no automatic monthly enforcement.
    Enterprise,
}

/// How the monthly usage gate treats an organization once it crosses its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsagePolicy {
    /// Reject with 402 once usage reaches 100%.
    HardStop,
    /// Reject with 429 once usage reaches 120%.
    Throttle,
    /// Never reject.
    Unlimited,
}

impl Tier {
    /// Parses a stored tier name. Returns `None` for unknown names.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "starter" => Some(Self::Starter),
            "team" => Some(Self::Team),
            "scale" => Some(Self::Scale),
            "enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }

    /// Parses a stored tier name, falling back to [`Tier::Starter`] for unknown names.
    #[must_use]
    pub fn parse_or_starter(value: &str) -> Self {
        Self::parse(value).unwrap_or_else(|| {
            tracing::warn!(tier = value, "unknown tier, applying starter limits");
            Self::Starter
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starter => "starter",
            Self::Team => "team",
            Self::Scale => "scale",
            Self::Enterprise => "enterprise",
        }
    }

    #[must_use]
    pub fn usage_policy(&self) -> UsagePolicy {
        match self {
            Self::Starter => UsagePolicy::HardStop,
            Self::Team | Self::Scale => UsagePolicy::Throttle,
            Self::Enterprise => UsagePolicy::Unlimited,
        }
    }

    /// Monthly request allowance assigned to new organizations on this tier.
    #[must_use]
    pub fn default_monthly_request_limit(&self) -> i64 {
        match self {
            Self::Starter => 50_000,
            Self::Team => 500_000,
            Self::Scale => 5_000_000,
            Self::Enterprise => 20_000_000,
        }
    }

    /// Requests per minute assigned to new API keys on this tier.
    #[must_use]
    pub fn default_rate_limit_rpm(&self) -> u32 {
        match self {
            Self::Starter => 10,
            Self::Team => 100,
            Self::Scale => 500,
            Self::Enterprise => 2000,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the caller proved its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    ApiKey,
    Session,
}

impl CredentialKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::Session => "session",
        }
    }
}

/// Identity attached to a request once its credential has been resolved.
///
/// Both throttles key their counters off this value, so it must exist before either runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    /// Owning organization. Empty for session users still completing onboarding.
    pub organization_id: String,
    pub tier: Tier,
    /// SHA-256 hex digest identifying the credential. Used as the rate-limit key.
    pub credential_hash: String,
    pub credential_kind: CredentialKind,
    /// Per-key requests-per-minute override carried by API keys.
    pub rate_limit_rpm: Option<u32>,
    /// Local user id for session principals.
    pub user_id: Option<String>,
}

impl Principal {
    #[must_use]
    pub fn has_organization(&self) -> bool {
        !self.organization_id.is_empty()
    }
}

/// Body of every rejection: `{"error": {"code", "message", "details"?}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self { error: ErrorBody { code: code.to_string(), message: message.into(), details: None } }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }
}

/// Machine-readable codes carried in [`ErrorBody::code`].
pub mod error_codes {
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const TOKEN_EXPIRED: &str = "TOKEN_EXPIRED";
    pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
    pub const USAGE_LIMIT_EXCEEDED: &str = "USAGE_LIMIT_EXCEEDED";
    pub const USAGE_LIMIT_THROTTLED: &str = "USAGE_LIMIT_THROTTLED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
}
