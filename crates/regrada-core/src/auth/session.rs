//! Session token validation against the identity provider's published key set.

use crate::auth::AuthError;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use jsonwebtoken::{
    decode, decode_header,
    jwk::{Jwk, JwkSet},
    Algorithm, DecodingKey, Validation,
};
use serde::{Deserialize, Serialize};
use std::{
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Claims read from a verified ID token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Identity-provider subject, the stable user identifier.
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub token_use: Option<String>,
}

/// Verifies a session token and returns its claims.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<IdentityClaims, AuthError>;
}

/// Where to fetch keys and which claims to require.
#[derive(Debug, Clone)]
pub struct JwksOptions {
    pub jwks_url: String,
    pub issuer: String,
    pub audience: String,
    pub fetch_timeout: Duration,
    pub refresh_interval: Duration,
    /// Minimum gap between refreshes triggered by an unknown `kid`.
    pub on_demand_interval: Duration,
}

/// [`TokenValidator`] backed by a cached JWKS document.
///
/// The key set is swapped atomically on refresh. A failed refresh keeps serving the last good
/// set, so a brief identity-provider outage does not log everybody out.
pub struct JwksTokenValidator {
    client: reqwest::Client,
    options: JwksOptions,
    keys: ArcSwapOption<JwkSet>,
    last_on_demand: Mutex<Option<Instant>>,
}

impl JwksTokenValidator {
    /// # Errors
    ///
    /// Returns [`AuthError::ConfigError`] if the HTTP client cannot be built.
    pub fn new(options: JwksOptions) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(options.fetch_timeout)
            .build()
            .map_err(|e| AuthError::ConfigError(format!("failed to build JWKS client: {e}")))?;

        Ok(Self { client, options, keys: ArcSwapOption::empty(), last_on_demand: Mutex::new(None) })
    }

    /// Fetches the key set and replaces the cached one. Returns the number of keys loaded.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::IdentityLookupFailed`] if the document cannot be fetched or parsed.
    /// The previously cached set is left in place.
    pub async fn refresh(&self) -> Result<usize, AuthError> {
        let response = self
            .client
            .get(&self.options.jwks_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::IdentityLookupFailed(format!("JWKS fetch failed: {e}")))?;

        let set: JwkSet = response
            .json()
            .await
            .map_err(|e| AuthError::IdentityLookupFailed(format!("JWKS parse failed: {e}")))?;

        let count = set.keys.len();
        self.keys.store(Some(Arc::new(set)));
        debug!(keys = count, url = %self.options.jwks_url, "refreshed JWKS");
        Ok(count)
    }

    /// Refreshes on the configured interval until shutdown is signalled.
    #[must_use]
    pub fn start_refresh_task(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let validator = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(validator.options.refresh_interval);
            // the first tick completes immediately; startup already fetched once
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = validator.refresh().await {
                            warn!(error = %e, "JWKS refresh failed, keeping previous key set");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("JWKS refresher shutting down");
                        break;
                    }
                }
            }
        })
    }

    #[must_use]
    pub fn has_keys(&self) -> bool {
        self.keys.load_full().is_some()
    }

    fn find_key(&self, kid: &str) -> Option<Jwk> {
        self.keys.load_full().and_then(|set| set.find(kid).cloned())
    }

    async fn refresh_on_demand(&self) {
        let mut last = self.last_on_demand.lock().await;
        if last.is_some_and(|at| at.elapsed() < self.options.on_demand_interval) {
            debug!("skipping on-demand JWKS refresh, last attempt too recent");
            return;
        }
        *last = Some(Instant::now());

        if let Err(e) = self.refresh().await {
            warn!(error = %e, "on-demand JWKS refresh failed");
        }
    }
}

#[async_trait]
impl TokenValidator for JwksTokenValidator {
    async fn validate(&self, token: &str) -> Result<IdentityClaims, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::InvalidSession(e.to_string()))?;
        let kid = header
            .kid
            .clone()
            .ok_or_else(|| AuthError::InvalidSession("token has no key id".to_string()))?;

        let jwk = match self.find_key(&kid) {
            Some(jwk) => jwk,
            None => {
                self.refresh_on_demand().await;
                self.find_key(&kid).ok_or_else(|| {
                    AuthError::InvalidSession(format!("unknown signing key: {kid}"))
                })?
            }
        };

        let key =
            DecodingKey::from_jwk(&jwk).map_err(|e| AuthError::InvalidSession(e.to_string()))?;

        let algorithm = pinned_algorithm(&jwk)?;
        if header.alg != algorithm {
            return Err(AuthError::InvalidSession(format!(
                "token algorithm {:?} does not match signing key",
                header.alg
            )));
        }

        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[&self.options.issuer]);
        validation.set_audience(&[&self.options.audience]);

        let data = decode::<IdentityClaims>(token, &key, &validation)
            .map_err(|e| AuthError::InvalidSession(e.to_string()))?;

        if data.claims.token_use.as_deref().is_some_and(|token_use| token_use != "id") {
            return Err(AuthError::InvalidSession("token is not an ID token".to_string()));
        }

        Ok(data.claims)
    }
}

/// Algorithm a key may verify: the one the JWK declares, RS256 when it declares none.
fn pinned_algorithm(jwk: &Jwk) -> Result<Algorithm, AuthError> {
    match jwk.common.key_algorithm.as_ref() {
        Some(declared) => Algorithm::from_str(&declared.to_string()).map_err(|_| {
            AuthError::InvalidSession(format!("unsupported key algorithm: {declared}"))
        }),
        None => Ok(Algorithm::RS256),
    }
}
