use crate::{
    config::{RateLimitConfig, TierRateLimits},
    metrics,
    store::SharedStore,
    types::{Clock, Principal},
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    /// Requests left in the window after this one. Never negative.
    pub remaining: u32,
    /// Unix time (seconds) at which the current window ends.
    pub reset_epoch_seconds: i64,
}

/// Fixed-window request counter shared across server instances.
///
/// One counter per credential per window, created by the first request and expiring shortly
/// after the window closes. Two windows can each admit `limit` requests back to back, so a
/// burst of up to twice the limit straddling a boundary is possible and accepted.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    tiers: TierRateLimits,
    window_seconds: i64,
    counter_ttl: Duration,
    clock: Clock,
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, config: &RateLimitConfig, clock: Clock) -> Self {
        Self {
            store,
            tiers: config.tiers,
            window_seconds: i64::try_from(config.window_seconds.max(1)).unwrap_or(60),
            counter_ttl: Duration::from_secs(config.counter_ttl_seconds),
            clock,
        }
    }

    /// Limit for a principal: the key's own limit when set, otherwise the tier default.
    #[must_use]
    pub fn limit_for(&self, principal: &Principal) -> u32 {
        principal
            .rate_limit_rpm
            .filter(|rpm| *rpm > 0)
            .unwrap_or_else(|| self.tiers.for_tier(principal.tier))
    }

    /// Counts the request against `key`'s current window.
    ///
    /// Returns `None` when the store is unavailable; the caller admits the request.
    pub async fn admit(&self, key: &str, limit: u32) -> Option<RateDecision> {
        let now = (self.clock)().timestamp();
        let window = now.div_euclid(self.window_seconds);
        let counter_key = format!("ratelimit:{key}:{window}");

        let count = match self.store.incr_with_expiry(&counter_key, self.counter_ttl).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "rate limiter store unavailable, admitting request");
                metrics::record_fail_open("rate_limit");
                return None;
            }
        };

        let limit_wide = i64::from(limit);
        let remaining = u32::try_from((limit_wide - count).max(0)).unwrap_or(0);
        let decision = RateDecision {
            allowed: count <= limit_wide,
            limit,
            remaining,
            reset_epoch_seconds: (window + 1) * self.window_seconds,
        };

        if !decision.allowed {
            debug!(count, limit, "rate limit exceeded");
        }
        metrics::record_rate_decision(&decision);
        Some(decision)
    }

    /// [`admit`](Self::admit) keyed by the principal's credential hash.
    pub async fn check(&self, principal: &Principal) -> Option<RateDecision> {
        self.admit(&principal.credential_hash, self.limit_for(principal)).await
    }
}
