use crate::{
    metrics,
    repository::{OrganizationRepository, OrganizationUsage},
    types::{Clock, Tier, UsagePolicy},
};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageAction {
    Allow,
    /// Hard stop at 100%, answered with 402.
    Block,
    /// Overage past 120%, answered with 429.
    Throttle,
}

impl UsageAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
            Self::Throttle => "throttle",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageDecision {
    pub allowed: bool,
    /// Tier whose policy was applied.
    pub tier: Tier,
    pub action: UsageAction,
    pub usage_percent: f64,
    /// Counter state after this request was counted.
    pub usage: OrganizationUsage,
}

impl UsageDecision {
    /// Requests past the monthly limit. Zero while under it.
    #[must_use]
    pub fn overage(&self) -> i64 {
        (self.usage.monthly_request_count - self.usage.monthly_request_limit).max(0)
    }
}

/// Applies `tier`'s policy to a freshly incremented counter.
///
/// Thresholds are compared in integers so exactly 100% and exactly 120% trip the gate.
#[must_use]
pub fn evaluate(tier: Tier, usage: &OrganizationUsage) -> UsageDecision {
    let count = i128::from(usage.monthly_request_count);
    let limit = i128::from(usage.monthly_request_limit);

    let usage_percent = if limit > 0 {
        (count * 100) as f64 / limit as f64
    } else if count > 0 {
        f64::INFINITY
    } else {
        0.0
    };

    let action = match tier.usage_policy() {
        UsagePolicy::HardStop if count >= limit => UsageAction::Block,
        UsagePolicy::Throttle if count * 100 >= limit * 120 => UsageAction::Throttle,
        _ => UsageAction::Allow,
    };

    UsageDecision {
        allowed: action == UsageAction::Allow,
        tier,
        action,
        usage_percent,
        usage: usage.clone(),
    }
}

/// Monthly per-organization request meter backed by the organization repository.
#[derive(Clone)]
pub struct UsageMeter {
    organizations: Arc<dyn OrganizationRepository>,
    clock: Clock,
}

impl UsageMeter {
    #[must_use]
    pub fn new(organizations: Arc<dyn OrganizationRepository>, clock: Clock) -> Self {
        Self { organizations, clock }
    }

    /// Counts one metered request for `organization_id` and decides whether it may proceed.
    ///
    /// Returns `None` when there is nothing to track (no organization) or the repository
    /// failed; in both cases the request is admitted.
    pub async fn track(&self, organization_id: &str, tier: Tier) -> Option<UsageDecision> {
        if organization_id.is_empty() {
            return None;
        }

        let mut usage = match self.organizations.increment_usage(organization_id).await {
            Ok(usage) => usage,
            Err(e) => return self.fail_open(organization_id, &e),
        };

        let now = (self.clock)();
        if now >= usage.usage_reset_at {
            match self.organizations.reset_monthly_usage(organization_id, now).await {
                Ok(reset) => {
                    if reset {
                        info!(organization_id, "started new monthly usage period");
                    }
                }
                Err(e) => return self.fail_open(organization_id, &e),
            }

            // the increment above landed in the stale period
            usage = match self.organizations.increment_usage(organization_id).await {
                Ok(usage) => usage,
                Err(e) => return self.fail_open(organization_id, &e),
            };
        }

        let decision = evaluate(tier, &usage);
        if !decision.allowed {
            debug!(
                organization_id,
                tier = %tier,
                used = usage.monthly_request_count,
                limit = usage.monthly_request_limit,
                action = decision.action.as_str(),
                "monthly usage limit enforced"
            );
        }
        metrics::record_usage_decision(decision.action);
        Some(decision)
    }

    fn fail_open(
        &self,
        organization_id: &str,
        error: &crate::repository::RepositoryError,
    ) -> Option<UsageDecision> {
        warn!(organization_id, error = %error, "usage tracking failed, admitting request");
        metrics::record_fail_open("usage");
        None
    }
}
