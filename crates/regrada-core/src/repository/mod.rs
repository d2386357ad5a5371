//! Persistence boundary for admission and ingestion.
//!
//! Traits are object-safe and used as `Arc<dyn Trait>` so the gates can be tested with mocks.
//! [`SqliteRepository`](sqlite::SqliteRepository) implements all of them.

pub mod sqlite;

use crate::{
    auth::api_key::ApiKey,
    ingest::{TestRun, Trace},
    types::Tier,
};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("row".to_string()),
            other => RepositoryError::Database(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub tier: Tier,
    pub monthly_request_limit: i64,
    pub monthly_request_count: i64,
    /// Exclusive upper bound of the current billing period.
    pub usage_reset_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    /// New organization with the tier's default monthly limit and a fresh billing period.
    #[must_use]
    pub fn new(name: &str, slug: &str, tier: Tier, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            slug: slug.to_string(),
            tier,
            monthly_request_limit: tier.default_monthly_request_limit(),
            monthly_request_count: 0,
            usage_reset_at: next_reset_boundary(now),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Monthly counter snapshot used by the usage gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationUsage {
    pub organization_id: String,
    pub tier: Tier,
    pub monthly_request_count: i64,
    pub monthly_request_limit: i64,
    pub usage_reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    /// Subject assigned by the identity provider.
    pub idp_sub: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Admin,
    Member,
    Viewer,
}

impl MemberRole {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Member => "member",
            Self::Viewer => "viewer",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "member" => Some(Self::Member),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationMember {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    pub role: MemberRole,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    /// Finds a key by the SHA-256 hex digest of its secret, regardless of revocation state.
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, RepositoryError>;

    async fn touch_last_used(&self, id: &str, at: DateTime<Utc>) -> Result<(), RepositoryError>;

    async fn create(&self, key: &ApiKey) -> Result<(), RepositoryError>;

    /// Marks a key revoked. Returns `false` if it was missing or already revoked.
    async fn revoke(&self, id: &str, at: DateTime<Utc>) -> Result<bool, RepositoryError>;

    async fn list_for_organization(
        &self,
        organization_id: &str,
    ) -> Result<Vec<ApiKey>, RepositoryError>;
}

#[async_trait]
pub trait OrganizationRepository: Send + Sync {
    async fn create(&self, organization: &Organization) -> Result<(), RepositoryError>;

    async fn get(&self, id: &str) -> Result<Option<Organization>, RepositoryError>;

    async fn get_usage(&self, id: &str) -> Result<Option<OrganizationUsage>, RepositoryError>;

    /// Atomically adds one request and returns the counter after the increment.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::NotFound`] if the organization does not exist.
    async fn increment_usage(&self, id: &str) -> Result<OrganizationUsage, RepositoryError>;

    /// Starts a new billing period if the stored one ended at or before `now`.
    ///
    /// Only the first of several concurrent callers performs the reset; the rest get `false`.
    async fn reset_monthly_usage(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_idp_sub(&self, idp_sub: &str) -> Result<Option<User>, RepositoryError>;

    async fn list_memberships(
        &self,
        user_id: &str,
    ) -> Result<Vec<OrganizationMember>, RepositoryError>;
}

#[async_trait]
pub trait IngestRepository: Send + Sync {
    async fn store_trace(&self, project_id: &str, trace: &Trace) -> Result<(), RepositoryError>;

    /// Stores every trace or none of them.
    async fn store_traces(&self, project_id: &str, traces: &[Trace])
        -> Result<(), RepositoryError>;

    async fn store_test_run(&self, project_id: &str, run: &TestRun)
        -> Result<(), RepositoryError>;
}

/// Liveness check used by the health endpoint.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn ping(&self) -> Result<(), RepositoryError>;
}

/// First instant (UTC) of the month after `now`.
#[must_use]
pub fn next_reset_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) =
        if now.month() == 12 { (now.year() + 1, 1) } else { (now.year(), now.month() + 1) };

    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).earliest().unwrap_or(now)
}
