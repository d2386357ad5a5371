//! Seeded backends for pipeline and HTTP tests.

use axum::Router;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use regrada_core::{
    auth::{api_key::ApiKey, AuthError},
    config::AppConfig,
    middleware::{
        AdmissionPipeline, AuthCache, AuthStrategy, CredentialResolver, RateLimiter, UsageMeter,
    },
    repository::{
        sqlite::SqliteRepository, ApiKeyRepository, Organization, OrganizationRepository,
    },
    store::{memory::MemoryStore, SharedStore},
    types::{Clock, Tier},
};
use server::router::{create_app, AppState};
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

/// Clock whose time only moves when a test moves it.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    #[must_use]
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(now)) }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn clock(&self) -> Clock {
        let now = self.now.clone();
        Arc::new(move || *now.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// In-memory database and store with a pinned clock.
///
/// The clock starts at 10 seconds into a minute in the middle of a billing period, so a test
/// has 50 seconds before its rate window rolls over.
pub struct TestBackend {
    pub repository: Arc<SqliteRepository>,
    pub store: Arc<MemoryStore>,
    pub clock: ManualClock,
    pub config: AppConfig,
}

impl TestBackend {
    /// # Panics
    ///
    /// Panics if the in-memory database cannot be opened or migrated.
    #[allow(clippy::expect_used)]
    pub async fn new() -> Self {
        let repository = Arc::new(
            SqliteRepository::connect(":memory:", 1).await.expect("open in-memory database"),
        );
        repository.migrate().await.expect("apply schema");

        let start = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 10).single().unwrap_or_else(Utc::now);

        Self {
            repository,
            store: Arc::new(MemoryStore::new()),
            clock: ManualClock::at(start),
            config: AppConfig::default(),
        }
    }

    /// Pipeline over the backend's own database and store.
    pub fn pipeline(&self) -> AdmissionPipeline {
        self.pipeline_with(self.store.clone(), self.repository.clone())
    }

    /// Pipeline whose store and usage repository are swapped for the given ones.
    ///
    /// Credential lookups still go to the seeded database.
    pub fn pipeline_with(
        &self,
        store: Arc<dyn SharedStore>,
        organizations: Arc<dyn OrganizationRepository>,
    ) -> AdmissionPipeline {
        let resolver = CredentialResolver::new(
            self.repository.clone(),
            self.repository.clone(),
            self.repository.clone(),
            AuthCache::new(store.clone(), self.config.api_key_cache_ttl()),
            self.clock.clock(),
        )
        .with_touch_timeout(Duration::from_secs(1));

        AdmissionPipeline::new(
            resolver,
            RateLimiter::new(store, &self.config.rate_limit, self.clock.clock()),
            UsageMeter::new(organizations, self.clock.clock()),
        )
    }

    /// Full HTTP application over this backend.
    pub fn app(&self) -> Router {
        let state = AppState {
            api_keys: self.repository.clone(),
            ingest: self.repository.clone(),
            organizations: self.repository.clone(),
            database: self.repository.clone(),
            store: self.store.clone(),
            metrics: None,
        };
        create_app(state, Arc::new(self.pipeline()), &self.config)
    }

    /// Creates an organization whose billing period ends next month and issues it a key.
    ///
    /// # Panics
    ///
    /// Panics if the rows cannot be inserted.
    pub async fn seed_organization(
        &self,
        tier: Tier,
        monthly_request_count: i64,
    ) -> (Organization, String) {
        let mut organization = self.organization(tier);
        organization.monthly_request_count = monthly_request_count;
        let secret = self.seed(&organization, None).await;
        (organization, secret)
    }

    /// Unsaved organization with a unique slug, created at the clock's current time.
    #[must_use]
    pub fn organization(&self, tier: Tier) -> Organization {
        let mut organization = Organization::new("Acme", "acme", tier, self.clock.now());
        organization.slug = format!("acme-{}", organization.id);
        organization
    }

    /// Inserts `organization` as given and issues it a key with the given rate override.
    ///
    /// # Panics
    ///
    /// Panics if the rows cannot be inserted.
    #[allow(clippy::expect_used)]
    pub async fn seed(&self, organization: &Organization, rate_limit_rpm: Option<u32>) -> String {
        OrganizationRepository::create(self.repository.as_ref(), organization)
            .await
            .expect("insert organization");
        self.issue_key(&organization.id, organization.tier, rate_limit_rpm).await.1
    }

    /// # Panics
    ///
    /// Panics if the key cannot be generated or inserted.
    #[allow(clippy::expect_used)]
    pub async fn issue_key(
        &self,
        organization_id: &str,
        tier: Tier,
        rate_limit_rpm: Option<u32>,
    ) -> (ApiKey, String) {
        let (mut key, secret) =
            ApiKey::issue(organization_id, "ci", tier, None).expect("generate key");
        if let Some(rpm) = rate_limit_rpm {
            key.rate_limit_rpm = rpm;
        }
        ApiKeyRepository::create(self.repository.as_ref(), &key).await.expect("insert key");
        (key, secret)
    }

    #[must_use]
    pub fn bearer(secret: &str) -> Result<AuthStrategy, AuthError> {
        AuthStrategy::select(Some(&format!("Bearer {secret}")), None)
    }
}
