//! Credential verification for API keys and identity-provider sessions.
//!
//! # Credentials
//!
//! Two credential kinds reach the server:
//!
//! - **API keys** (`Authorization: Bearer rg_live_...`): looked up by the SHA-256 hex digest
//!   of the secret. Only the digest is stored ([`ApiKey`](api_key::ApiKey)).
//! - **Sessions** (`id_token` cookie): ID tokens signed by the identity provider and verified
//!   against its published key set ([`JwksTokenValidator`](session::JwksTokenValidator)).
//!
//! ```text
//!   Authorization: Bearer rg_live_...          Cookie: id_token=eyJ...
//!        │                                           │
//!        ├──> SHA-256 hex ──> AuthCache ──miss──>    ├──> JWKS signature + claims
//!        │                       │   find_by_hash    │
//!        │                      hit      │           ├──> user by idp sub
//!        │                       │       ▼           │
//!        │                       │  revoked/expired  ├──> single membership ──> org tier
//!        ▼                       ▼       │           ▼
//!   Principal { organization_id, tier, credential_hash, credential_kind }
//! ```
//!
//! Resolution itself lives in [`crate::middleware::auth`]. This module owns the credential
//! models and the error type shared by both paths.
//!
//! # Failure policy
//!
//! Credential resolution fails closed: a repository error rejects the request with a 500
//! rather than admitting an unverified caller. See [`AuthError::is_infrastructure`].

pub mod api_key;
pub mod session;

use crate::types::error_codes;
use thiserror::Error;

/// Error types for credential resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Neither an `Authorization` header nor a session cookie was supplied
    #[error("Authentication required")]
    MissingCredentials,

    /// The `Authorization` header is not `Bearer <secret>`
    #[error("Invalid authorization header format")]
    MalformedAuthorization,

    /// No API key with the presented hash exists
    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("API key has been revoked")]
    RevokedApiKey,

    #[error("API key has expired")]
    ExpiredApiKey,

    /// The session token failed signature or claim validation
    #[error("Invalid session: {0}")]
    InvalidSession(String),

    /// The API key store could not be queried
    #[error("API key lookup failed: {0}")]
    KeyLookupFailed(String),

    /// The user or organization store could not be queried for a session
    #[error("Identity lookup failed: {0}")]
    IdentityLookupFailed(String),

    /// Authentication system configuration is invalid
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Failed to generate a cryptographically secure API key
    #[error("Key generation error: {0}")]
    KeyGenerationError(String),
}

impl AuthError {
    /// Whether the failure came from infrastructure rather than the caller's credential.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::KeyLookupFailed(_)
                | Self::IdentityLookupFailed(_)
                | Self::ConfigError(_)
                | Self::KeyGenerationError(_)
        )
    }

    #[must_use]
    pub fn status_code(&self) -> u16 {
        if self.is_infrastructure() {
            500
        } else {
            401
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSession(_) => error_codes::TOKEN_EXPIRED,
            err if err.is_infrastructure() => error_codes::INTERNAL_ERROR,
            _ => error_codes::UNAUTHORIZED,
        }
    }

    /// Message returned to the client. Infrastructure details stay in the logs.
    #[must_use]
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "Authentication required",
            Self::MalformedAuthorization => "Invalid authorization header format",
            Self::InvalidApiKey => "Invalid API key",
            Self::RevokedApiKey => "API key has been revoked",
            Self::ExpiredApiKey => "API key has expired",
            Self::InvalidSession(_) => "Session expired. Please log in again.",
            Self::KeyLookupFailed(_) => "Failed to validate API key",
            Self::IdentityLookupFailed(_) | Self::ConfigError(_) | Self::KeyGenerationError(_) => {
                "Failed to authenticate"
            }
        }
    }

    /// Short label used in metrics and logs.
    #[must_use]
    pub fn as_metric_str(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "missing_credentials",
            Self::MalformedAuthorization => "malformed_authorization",
            Self::InvalidApiKey => "invalid_api_key",
            Self::RevokedApiKey => "revoked_api_key",
            Self::ExpiredApiKey => "expired_api_key",
            Self::InvalidSession(_) => "invalid_session",
            Self::KeyLookupFailed(_) => "key_lookup_failed",
            Self::IdentityLookupFailed(_) => "identity_lookup_failed",
            Self::ConfigError(_) => "config_error",
            Self::KeyGenerationError(_) => "key_generation_error",
        }
    }
}
