use crate::{metrics, store::SharedStore, types::Tier};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Identity remembered for a verified API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedIdentity {
    pub api_key_id: String,
    pub organization_id: String,
    pub tier: Tier,
    pub rate_limit_rpm: u32,
}

/// Cache-aside layer in front of the API key repository.
///
/// Entries are keyed by the secret's SHA-256 hash and expire after a fixed TTL, so a revoked
/// key keeps authenticating for at most that long. Store failures degrade to a cache miss.
#[derive(Clone)]
pub struct AuthCache {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
}

impl AuthCache {
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn key(hash: &str) -> String {
        format!("apikey:{hash}")
    }

    pub async fn resolve(&self, hash: &str) -> Option<CachedIdentity> {
        let raw = match self.store.get(&Self::key(hash)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                metrics::record_auth_cache("miss");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "auth cache read failed, falling back to repository");
                metrics::record_auth_cache("error");
                return None;
            }
        };

        match serde_json::from_str::<CachedIdentity>(&raw) {
            Ok(identity) => {
                metrics::record_auth_cache("hit");
                Some(identity)
            }
            Err(e) => {
                warn!(error = %e, "discarding undecodable auth cache entry");
                metrics::record_auth_cache("error");
                None
            }
        }
    }

    /// Stores an identity the repository has just confirmed.
    pub async fn populate(&self, hash: &str, identity: &CachedIdentity) {
        self.populate_for(hash, identity, self.ttl).await;
    }

    /// Like [`populate`](Self::populate), but the entry lives no longer than `ttl`.
    ///
    /// A zero `ttl` stores nothing.
    pub async fn populate_for(&self, hash: &str, identity: &CachedIdentity, ttl: Duration) {
        let ttl = ttl.min(self.ttl);
        if ttl.is_zero() {
            return;
        }

        let raw = match serde_json::to_string(identity) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "failed to encode auth cache entry");
                return;
            }
        };

        match self.store.set_with_ttl(&Self::key(hash), &raw, ttl).await {
            Ok(()) => debug!(api_key_id = %identity.api_key_id, "cached API key identity"),
            Err(e) => warn!(error = %e, "auth cache write failed"),
        }
    }
}
