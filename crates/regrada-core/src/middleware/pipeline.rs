use crate::{
    auth::AuthError,
    metrics,
    middleware::{
        auth::{AuthStrategy, CredentialResolver},
        rate_limiting::{RateDecision, RateLimiter},
        usage::{UsageAction, UsageDecision, UsageMeter},
    },
    types::{error_codes, ErrorEnvelope, Principal},
};
use chrono::SecondsFormat;
use serde_json::json;
use tracing::debug;

/// A request that passed every gate.
#[derive(Debug, Clone)]
pub struct Admission {
    pub principal: Principal,
    /// Absent when the rate limiter failed open.
    pub rate: Option<RateDecision>,
    /// Absent on unmetered routes, for principals without an organization, or on fail-open.
    pub usage: Option<UsageDecision>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectionKind {
    Auth(AuthError),
    RateLimited,
    UsageExceeded,
    UsageThrottled,
}

/// A request stopped by one of the gates.
///
/// Carries the decisions reached before the stop so the HTTP layer can still emit headers.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub rate: Option<RateDecision>,
    pub usage: Option<UsageDecision>,
}

impl Rejection {
    fn auth(error: AuthError) -> Self {
        Self { kind: RejectionKind::Auth(error), rate: None, usage: None }
    }

    #[must_use]
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            RejectionKind::Auth(e) => e.status_code(),
            RejectionKind::RateLimited | RejectionKind::UsageThrottled => 429,
            RejectionKind::UsageExceeded => 402,
        }
    }

    #[must_use]
    pub fn envelope(&self) -> ErrorEnvelope {
        match &self.kind {
            RejectionKind::Auth(e) => ErrorEnvelope::new(e.code(), e.client_message()),
            RejectionKind::RateLimited => {
                let envelope =
                    ErrorEnvelope::new(error_codes::RATE_LIMIT_EXCEEDED, "Rate limit exceeded");
                match self.rate {
                    Some(rate) => envelope.with_details(
                        json!({"limit": rate.limit, "reset": rate.reset_epoch_seconds}),
                    ),
                    None => envelope,
                }
            }
            RejectionKind::UsageExceeded => {
                let envelope = ErrorEnvelope::new(
                    error_codes::USAGE_LIMIT_EXCEEDED,
                    "Monthly request limit exceeded. Upgrade your plan to continue.",
                );
                match &self.usage {
                    Some(usage) => envelope.with_details(usage_details(usage, false)),
                    None => envelope,
                }
            }
            RejectionKind::UsageThrottled => {
                let envelope = ErrorEnvelope::new(
                    error_codes::USAGE_LIMIT_THROTTLED,
                    "Monthly request limit exceeded by 20%. Requests are being throttled.",
                );
                match &self.usage {
                    Some(usage) => envelope.with_details(usage_details(usage, true)),
                    None => envelope,
                }
            }
        }
    }

    fn metric_outcome(&self) -> &'static str {
        match self.kind {
            RejectionKind::Auth(_) => "unauthenticated",
            RejectionKind::RateLimited => "rate_limited",
            RejectionKind::UsageExceeded => "usage_exceeded",
            RejectionKind::UsageThrottled => "usage_throttled",
        }
    }
}

fn usage_details(decision: &UsageDecision, with_overage: bool) -> serde_json::Value {
    let usage = &decision.usage;
    let mut details = json!({
        "limit": usage.monthly_request_limit,
        "used": usage.monthly_request_count,
        "tier": decision.tier.as_str(),
        "reset_at": usage.usage_reset_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    });
    if with_overage {
        details["overage"] = json!(usage.monthly_request_count - usage.monthly_request_limit);
    }
    details
}

/// Authentication, then rate limiting, then (on metered routes) monthly usage.
///
/// Each gate short-circuits on rejection; nothing already counted is rolled back.
#[derive(Clone)]
pub struct AdmissionPipeline {
    resolver: CredentialResolver,
    rate_limiter: RateLimiter,
    usage_meter: UsageMeter,
}

impl AdmissionPipeline {
    #[must_use]
    pub fn new(
        resolver: CredentialResolver,
        rate_limiter: RateLimiter,
        usage_meter: UsageMeter,
    ) -> Self {
        Self { resolver, rate_limiter, usage_meter }
    }

    /// Runs the gates for one request.
    ///
    /// `strategy` is the outcome of [`AuthStrategy::select`], passed through so a malformed
    /// header is reported the same way as any other authentication failure.
    ///
    /// # Errors
    ///
    /// Returns the [`Rejection`] of the first gate that refused the request.
    pub async fn admit(
        &self,
        strategy: Result<AuthStrategy, AuthError>,
        metered: bool,
    ) -> Result<Admission, Rejection> {
        let result = self.run(strategy, metered).await;
        match &result {
            Ok(_) => metrics::record_admission("admitted"),
            Err(rejection) => metrics::record_admission(rejection.metric_outcome()),
        }
        result
    }

    async fn run(
        &self,
        strategy: Result<AuthStrategy, AuthError>,
        metered: bool,
    ) -> Result<Admission, Rejection> {
        let resolved = match strategy {
            Ok(strategy) => self.resolver.resolve(&strategy).await.map(|p| (strategy.kind(), p)),
            Err(e) => Err(e),
        };
        let principal = match resolved {
            Ok((kind, principal)) => {
                metrics::record_auth_success(kind);
                principal
            }
            Err(e) => {
                debug!(error = %e, "authentication rejected");
                metrics::record_auth_failure(&e);
                return Err(Rejection::auth(e));
            }
        };

        let rate = self.rate_limiter.check(&principal).await;
        if rate.is_some_and(|decision| !decision.allowed) {
            return Err(Rejection { kind: RejectionKind::RateLimited, rate, usage: None });
        }

        let usage = if metered {
            self.usage_meter.track(&principal.organization_id, principal.tier).await
        } else {
            None
        };

        if let Some(decision) = usage.as_ref().filter(|d| !d.allowed) {
            let kind = match decision.action {
                UsageAction::Throttle => RejectionKind::UsageThrottled,
                UsageAction::Block | UsageAction::Allow => RejectionKind::UsageExceeded,
            };
            return Err(Rejection { kind, rate, usage });
        }

        Ok(Admission { principal, rate, usage })
    }
}
