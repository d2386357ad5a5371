use crate::{
    auth::{api_key::ApiKey, session::TokenValidator, AuthError},
    middleware::auth_cache::{AuthCache, CachedIdentity},
    repository::{ApiKeyRepository, OrganizationRepository, UserRepository},
    types::{Clock, CredentialKind, Principal, Tier},
};
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Credential presented with a request, chosen once at pipeline entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    /// Secret from `Authorization: Bearer <secret>`.
    ApiKey(String),
    /// Identity-provider ID token from the session cookie.
    Session(String),
}

impl AuthStrategy {
    /// Picks the credential from the raw `Authorization` header and session cookie.
    ///
    /// A non-blank header always wins and must be exactly `Bearer <secret>`.
    ///
    /// # Errors
    ///
    /// [`AuthError::MalformedAuthorization`] for a header in any other shape,
    /// [`AuthError::MissingCredentials`] when neither credential is present.
    pub fn select(
        authorization: Option<&str>,
        session_cookie: Option<&str>,
    ) -> Result<Self, AuthError> {
        if let Some(header) = authorization.filter(|h| !h.trim().is_empty()) {
            return match header.split_once(' ') {
                Some(("Bearer", secret)) if !secret.is_empty() && !secret.contains(' ') => {
                    Ok(Self::ApiKey(secret.to_string()))
                }
                _ => Err(AuthError::MalformedAuthorization),
            };
        }

        match session_cookie.filter(|c| !c.is_empty()) {
            Some(token) => Ok(Self::Session(token.to_string())),
            None => Err(AuthError::MissingCredentials),
        }
    }

    #[must_use]
    pub fn kind(&self) -> CredentialKind {
        match self {
            Self::ApiKey(_) => CredentialKind::ApiKey,
            Self::Session(_) => CredentialKind::Session,
        }
    }
}

/// Turns an [`AuthStrategy`] into a [`Principal`].
///
/// Repository failures reject the request; cache failures only cost a repository round trip.
#[derive(Clone)]
pub struct CredentialResolver {
    api_keys: Arc<dyn ApiKeyRepository>,
    users: Arc<dyn UserRepository>,
    organizations: Arc<dyn OrganizationRepository>,
    cache: AuthCache,
    tokens: Option<Arc<dyn TokenValidator>>,
    touch_timeout: Duration,
    clock: Clock,
}

impl CredentialResolver {
    #[must_use]
    pub fn new(
        api_keys: Arc<dyn ApiKeyRepository>,
        users: Arc<dyn UserRepository>,
        organizations: Arc<dyn OrganizationRepository>,
        cache: AuthCache,
        clock: Clock,
    ) -> Self {
        Self {
            api_keys,
            users,
            organizations,
            cache,
            tokens: None,
            touch_timeout: Duration::from_secs(5),
            clock,
        }
    }

    /// Enables session authentication.
    #[must_use]
    pub fn with_token_validator(mut self, tokens: Arc<dyn TokenValidator>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Bound on the detached last-used update.
    #[must_use]
    pub fn with_touch_timeout(mut self, timeout: Duration) -> Self {
        self.touch_timeout = timeout;
        self
    }

    /// # Errors
    ///
    /// Returns the [`AuthError`] that rejects the request.
    pub async fn resolve(&self, strategy: &AuthStrategy) -> Result<Principal, AuthError> {
        match strategy {
            AuthStrategy::ApiKey(secret) => self.resolve_api_key(secret).await,
            AuthStrategy::Session(token) => self.resolve_session(token).await,
        }
    }

    async fn resolve_api_key(&self, secret: &str) -> Result<Principal, AuthError> {
        let hash = ApiKey::hash_secret(secret);

        if let Some(cached) = self.cache.resolve(&hash).await {
            return Ok(api_key_principal(hash, &cached));
        }

        let key = self
            .api_keys
            .find_by_hash(&hash)
            .await
            .map_err(|e| AuthError::KeyLookupFailed(e.to_string()))?
            .ok_or(AuthError::InvalidApiKey)?;

        let now = (self.clock)();
        key.ensure_usable(now)?;

        let identity = CachedIdentity {
            api_key_id: key.id.clone(),
            organization_id: key.organization_id.clone(),
            tier: key.tier,
            rate_limit_rpm: key.rate_limit_rpm,
        };
        // an expiring key must not outlive its expiry in the cache
        let ttl = key.expires_at.map_or(self.cache.ttl(), |expires_at| {
            (expires_at - now).to_std().unwrap_or(Duration::ZERO)
        });
        self.cache.populate_for(&hash, &identity, ttl).await;
        self.touch_last_used(key.id, now);

        debug!(api_key_id = %identity.api_key_id, "API key verified against repository");
        Ok(api_key_principal(hash, &identity))
    }

    fn touch_last_used(&self, id: String, now: DateTime<Utc>) {
        let api_keys = Arc::clone(&self.api_keys);
        let timeout = self.touch_timeout;

        tokio::spawn(async move {
            match tokio::time::timeout(timeout, api_keys.touch_last_used(&id, now)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(api_key_id = %id, error = %e, "failed to update last_used_at"),
                Err(_) => warn!(api_key_id = %id, ?timeout, "last_used_at update timed out"),
            }
        });
    }

    async fn resolve_session(&self, token: &str) -> Result<Principal, AuthError> {
        let tokens = self.tokens.as_ref().ok_or_else(|| {
            AuthError::InvalidSession("session authentication is not configured".to_string())
        })?;
        let claims = tokens.validate(token).await?;

        let mut principal = Principal {
            organization_id: String::new(),
            tier: Tier::Starter,
            credential_hash: ApiKey::hash_secret(&format!("session:{}", claims.sub)),
            credential_kind: CredentialKind::Session,
            rate_limit_rpm: None,
            user_id: None,
        };

        let Some(user) = self
            .users
            .find_by_idp_sub(&claims.sub)
            .await
            .map_err(|e| AuthError::IdentityLookupFailed(e.to_string()))?
        else {
            debug!(sub = %claims.sub, "session user not registered yet");
            return Ok(principal);
        };
        principal.user_id = Some(user.id.clone());

        let organization_id = match self.users.list_memberships(&user.id).await {
            Ok(memberships) if memberships.len() == 1 => memberships[0].organization_id.clone(),
            Ok(memberships) => {
                debug!(user_id = %user.id, count = memberships.len(), "no single organization");
                return Ok(principal);
            }
            Err(e) => {
                warn!(user_id = %user.id, error = %e, "membership lookup failed");
                return Ok(principal);
            }
        };

        if let Some(organization) = self
            .organizations
            .get(&organization_id)
            .await
            .map_err(|e| AuthError::IdentityLookupFailed(e.to_string()))?
        {
            principal.organization_id = organization.id;
            principal.tier = organization.tier;
        }

        Ok(principal)
    }
}

fn api_key_principal(hash: String, identity: &CachedIdentity) -> Principal {
    Principal {
        organization_id: identity.organization_id.clone(),
        tier: identity.tier,
        credential_hash: hash,
        credential_kind: CredentialKind::ApiKey,
        rate_limit_rpm: Some(identity.rate_limit_rpm).filter(|rpm| *rpm > 0),
        user_id: None,
    }
}
