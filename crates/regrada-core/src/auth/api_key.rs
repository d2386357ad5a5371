use crate::{auth::AuthError, types::Tier};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix carried by every live API key secret.
pub const KEY_PREFIX: &str = "rg_live_";

/// Number of leading secret characters persisted for display.
pub const DISPLAY_PREFIX_LEN: usize = 16;

const RANDOM_BYTES: usize = 32;

/// Database model for an organization's API key.
///
/// The plaintext secret is never stored. Lookups go through `key_hash`, the hex-encoded
/// SHA-256 digest of the secret. API keys are 256-bit random values, so a fast digest is
/// enough to make the stored hash useless for recovering the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub organization_id: String,
    /// `hex(SHA256(secret))`
    pub key_hash: String,
    /// First [`DISPLAY_PREFIX_LEN`] characters of the secret, for identification in listings.
    pub key_prefix: String,
    pub name: String,
    pub tier: Tier,
    /// Requests per minute allowed for this key. Zero falls back to the tier default.
    pub rate_limit_rpm: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Optional expiration timestamp (None = never expires)
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// Generates a new secret: `rg_live_` followed by 32 random bytes, base64url without padding.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyGenerationError`] if the system random number
    /// generator fails to produce secure random bytes.
    pub fn generate() -> Result<String, AuthError> {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; RANDOM_BYTES];
        rng.fill(&mut bytes).map_err(|_| {
            AuthError::KeyGenerationError("Failed to generate secure random bytes".to_string())
        })?;

        Ok(format!("{KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes)))
    }

    /// Generates a secret and builds the record that stores it.
    ///
    /// Returns the record together with the plaintext secret, which must be shown to the
    /// caller once and then discarded.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyGenerationError`] if secret generation fails.
    pub fn issue(
        organization_id: &str,
        name: &str,
        tier: Tier,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(Self, String), AuthError> {
        let secret = Self::generate()?;
        let record = Self {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: organization_id.to_string(),
            key_hash: Self::hash_secret(&secret),
            key_prefix: Self::display_prefix(&secret),
            name: name.to_string(),
            tier,
            rate_limit_rpm: tier.default_rate_limit_rpm(),
            last_used_at: None,
            expires_at,
            created_at: Utc::now(),
            revoked_at: None,
        };
        Ok((record, secret))
    }

    /// Computes the lookup hash for a secret (SHA-256, hex-encoded).
    #[must_use]
    pub fn hash_secret(secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hex::encode(hasher.finalize())
    }

    #[must_use]
    pub fn display_prefix(secret: &str) -> String {
        secret.chars().take(DISPLAY_PREFIX_LEN).collect()
    }

    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// A key stays usable through the instant it expires.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < now)
    }

    /// Checks whether the key may authenticate a request at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RevokedApiKey`] or [`AuthError::ExpiredApiKey`].
    pub fn ensure_usable(&self, now: DateTime<Utc>) -> Result<(), AuthError> {
        if self.is_revoked() {
            return Err(AuthError::RevokedApiKey);
        }
        if self.is_expired_at(now) {
            return Err(AuthError::ExpiredApiKey);
        }
        Ok(())
    }
}

/// Listing view of an [`ApiKey`]: everything except the lookup hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiKeySummary {
    pub id: String,
    pub name: String,
    pub key_prefix: String,
    pub tier: Tier,
    pub rate_limit_rpm: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl From<&ApiKey> for ApiKeySummary {
    fn from(key: &ApiKey) -> Self {
        Self {
            id: key.id.clone(),
            name: key.name.clone(),
            key_prefix: key.key_prefix.clone(),
            tier: key.tier,
            rate_limit_rpm: key.rate_limit_rpm,
            last_used_at: key.last_used_at,
            expires_at: key.expires_at,
            created_at: key.created_at,
            revoked_at: key.revoked_at,
        }
    }
}

/// Body of `POST /v1/api-keys`. The key inherits the organization's tier.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}
