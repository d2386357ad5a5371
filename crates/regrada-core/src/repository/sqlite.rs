use super::{
    next_reset_boundary, ApiKeyRepository, HealthCheck, IngestRepository, MemberRole,
    Organization, OrganizationMember, OrganizationRepository, OrganizationUsage, RepositoryError,
    User, UserRepository,
};
use crate::{
    auth::api_key::ApiKey,
    ingest::{TestRun, Trace},
    types::Tier,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{str::FromStr, time::Duration};

/// Embedded schema applied by [`SqliteRepository::migrate`].
pub const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS organizations (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        slug TEXT NOT NULL UNIQUE,
        tier TEXT NOT NULL DEFAULT 'starter',
        monthly_request_limit INTEGER NOT NULL,
        monthly_request_count INTEGER NOT NULL DEFAULT 0,
        usage_reset_at TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS api_keys (
        id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
        key_hash TEXT NOT NULL UNIQUE,
        key_prefix TEXT NOT NULL,
        name TEXT NOT NULL,
        tier TEXT NOT NULL DEFAULT 'starter',
        rate_limit_rpm INTEGER NOT NULL DEFAULT 0,
        last_used_at TEXT,
        expires_at TEXT,
        created_at TEXT NOT NULL,
        revoked_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_api_keys_organization ON api_keys(organization_id);

    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        idp_sub TEXT NOT NULL UNIQUE,
        name TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS organization_members (
        id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (organization_id, user_id)
    );
    CREATE INDEX IF NOT EXISTS idx_organization_members_user ON organization_members(user_id);

    CREATE TABLE IF NOT EXISTS traces (
        project_id TEXT NOT NULL,
        trace_id TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        provider TEXT NOT NULL,
        model TEXT NOT NULL,
        environment TEXT,
        git_sha TEXT,
        git_branch TEXT,
        request_data TEXT NOT NULL,
        response_data TEXT NOT NULL,
        latency_ms INTEGER NOT NULL DEFAULT 0,
        tokens_in INTEGER NOT NULL DEFAULT 0,
        tokens_out INTEGER NOT NULL DEFAULT 0,
        redaction_applied TEXT NOT NULL DEFAULT '[]',
        tags TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL,
        PRIMARY KEY (project_id, trace_id)
    );

    CREATE TABLE IF NOT EXISTS test_runs (
        project_id TEXT NOT NULL,
        run_id TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        git_sha TEXT NOT NULL,
        git_branch TEXT,
        git_commit_message TEXT,
        ci_provider TEXT,
        ci_build_id TEXT,
        ci_build_url TEXT,
        ci_pr_number INTEGER,
        config TEXT,
        results TEXT NOT NULL,
        violations TEXT NOT NULL,
        total_cases INTEGER NOT NULL DEFAULT 0,
        passed_cases INTEGER NOT NULL DEFAULT 0,
        warned_cases INTEGER NOT NULL DEFAULT 0,
        failed_cases INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (project_id, run_id)
    );
";

const API_KEY_COLUMNS: &str = "id, organization_id, key_hash, key_prefix, name, tier, \
     rate_limit_rpm, last_used_at, expires_at, created_at, revoked_at";

const ORGANIZATION_COLUMNS: &str = "id, name, slug, tier, monthly_request_limit, \
     monthly_request_count, usage_reset_at, created_at, updated_at";

const USAGE_COLUMNS: &str =
    "id, tier, monthly_request_count, monthly_request_limit, usage_reset_at";

/// `SQLite` implementation of every repository trait.
pub struct SqliteRepository {
    pool: Pool<Sqlite>,
}

impl SqliteRepository {
    /// Opens a pool, creating the database file if needed.
    ///
    /// # Errors
    /// Returns `RepositoryError::Database` if the URL is invalid or the connection fails.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, RepositoryError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections.max(1));
        if database_url.contains(":memory:") {
            // every new connection would open a fresh empty database
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;
        Ok(Self { pool })
    }

    /// Applies the embedded schema. Safe to run on every start.
    ///
    /// # Errors
    /// Returns `RepositoryError::Database` if a statement fails.
    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Extracts a field from a database row.
    /// Returns `Database` if the field is NULL (for non-optional types) or cannot be decoded.
    fn get_required<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, RepositoryError>
    where
        T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
    {
        row.try_get::<T, _>(column)
            .map_err(|e| RepositoryError::Database(format!("column '{column}': {e}")))
    }

    fn get_u32(row: &SqliteRow, column: &str) -> Result<u32, RepositoryError> {
        let value: i64 = Self::get_required(row, column)?;
        u32::try_from(value).map_err(|e| {
            RepositoryError::Database(format!(
                "column '{column}' value {value} out of u32 range: {e}"
            ))
        })
    }

    fn get_tier(row: &SqliteRow) -> Result<Tier, RepositoryError> {
        let tier: String = Self::get_required(row, "tier")?;
        Ok(Tier::parse_or_starter(&tier))
    }

    fn row_to_api_key(row: &SqliteRow) -> Result<ApiKey, RepositoryError> {
        Ok(ApiKey {
            id: Self::get_required(row, "id")?,
            organization_id: Self::get_required(row, "organization_id")?,
            key_hash: Self::get_required(row, "key_hash")?,
            key_prefix: Self::get_required(row, "key_prefix")?,
            name: Self::get_required(row, "name")?,
            tier: Self::get_tier(row)?,
            rate_limit_rpm: Self::get_u32(row, "rate_limit_rpm")?,
            last_used_at: Self::get_required(row, "last_used_at")?,
            expires_at: Self::get_required(row, "expires_at")?,
            created_at: Self::get_required(row, "created_at")?,
            revoked_at: Self::get_required(row, "revoked_at")?,
        })
    }

    fn row_to_organization(row: &SqliteRow) -> Result<Organization, RepositoryError> {
        Ok(Organization {
            id: Self::get_required(row, "id")?,
            name: Self::get_required(row, "name")?,
            slug: Self::get_required(row, "slug")?,
            tier: Self::get_tier(row)?,
            monthly_request_limit: Self::get_required(row, "monthly_request_limit")?,
            monthly_request_count: Self::get_required(row, "monthly_request_count")?,
            usage_reset_at: Self::get_required(row, "usage_reset_at")?,
            created_at: Self::get_required(row, "created_at")?,
            updated_at: Self::get_required(row, "updated_at")?,
        })
    }

    fn row_to_usage(row: &SqliteRow) -> Result<OrganizationUsage, RepositoryError> {
        Ok(OrganizationUsage {
            organization_id: Self::get_required(row, "id")?,
            tier: Self::get_tier(row)?,
            monthly_request_count: Self::get_required(row, "monthly_request_count")?,
            monthly_request_limit: Self::get_required(row, "monthly_request_limit")?,
            usage_reset_at: Self::get_required(row, "usage_reset_at")?,
        })
    }

    fn row_to_user(row: &SqliteRow) -> Result<User, RepositoryError> {
        Ok(User {
            id: Self::get_required(row, "id")?,
            email: Self::get_required(row, "email")?,
            idp_sub: Self::get_required(row, "idp_sub")?,
            name: Self::get_required(row, "name")?,
            created_at: Self::get_required(row, "created_at")?,
        })
    }

    fn row_to_member(row: &SqliteRow) -> Result<OrganizationMember, RepositoryError> {
        let role: String = Self::get_required(row, "role")?;
        Ok(OrganizationMember {
            id: Self::get_required(row, "id")?,
            organization_id: Self::get_required(row, "organization_id")?,
            user_id: Self::get_required(row, "user_id")?,
            role: MemberRole::parse(&role).ok_or_else(|| {
                RepositoryError::Database(format!("unknown member role '{role}'"))
            })?,
            created_at: Self::get_required(row, "created_at")?,
        })
    }

    fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
        serde_json::to_string(value)
            .map_err(|e| RepositoryError::Database(format!("failed to encode column: {e}")))
    }

    async fn insert_trace<'e, E>(
        executor: E,
        project_id: &str,
        trace: &Trace,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r"
            INSERT INTO traces (
                project_id, trace_id, timestamp, provider, model, environment, git_sha,
                git_branch, request_data, response_data, latency_ms, tokens_in, tokens_out,
                redaction_applied, tags, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(project_id)
        .bind(&trace.trace_id)
        .bind(trace.timestamp)
        .bind(&trace.provider)
        .bind(&trace.model)
        .bind(&trace.environment)
        .bind(&trace.git_sha)
        .bind(&trace.git_branch)
        .bind(Self::to_json(&trace.request)?)
        .bind(Self::to_json(&trace.response)?)
        .bind(trace.metrics.latency_ms)
        .bind(trace.metrics.tokens_in)
        .bind(trace.metrics.tokens_out)
        .bind(Self::to_json(&trace.redaction_applied)?)
        .bind(Self::to_json(&trace.tags)?)
        .bind(now)
        .execute(executor)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ApiKeyRepository for SqliteRepository {
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE key_hash = ?"))
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_api_key).transpose()
    }

    async fn touch_last_used(&self, id: &str, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create(&self, key: &ApiKey) -> Result<(), RepositoryError> {
        sqlx::query(&format!(
            "INSERT INTO api_keys ({API_KEY_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&key.id)
        .bind(&key.organization_id)
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(&key.name)
        .bind(key.tier.as_str())
        .bind(i64::from(key.rate_limit_rpm))
        .bind(key.last_used_at)
        .bind(key.expires_at)
        .bind(key.created_at)
        .bind(key.revoked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke(&self, id: &str, at: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("UPDATE api_keys SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL")
                .bind(at)
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_for_organization(
        &self,
        organization_id: &str,
    ) -> Result<Vec<ApiKey>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE organization_id = ? ORDER BY created_at"
        ))
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_api_key).collect()
    }
}

#[async_trait]
impl OrganizationRepository for SqliteRepository {
    async fn create(&self, organization: &Organization) -> Result<(), RepositoryError> {
        sqlx::query(&format!(
            "INSERT INTO organizations ({ORGANIZATION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&organization.id)
        .bind(&organization.name)
        .bind(&organization.slug)
        .bind(organization.tier.as_str())
        .bind(organization.monthly_request_limit)
        .bind(organization.monthly_request_count)
        .bind(organization.usage_reset_at)
        .bind(organization.created_at)
        .bind(organization.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Organization>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.as_ref().map(Self::row_to_organization).transpose()
    }

    async fn get_usage(&self, id: &str) -> Result<Option<OrganizationUsage>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {USAGE_COLUMNS} FROM organizations WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_usage).transpose()
    }

    async fn increment_usage(&self, id: &str) -> Result<OrganizationUsage, RepositoryError> {
        let row = sqlx::query(&format!(
            r"
            UPDATE organizations
            SET monthly_request_count = monthly_request_count + 1, updated_at = ?
            WHERE id = ?
            RETURNING {USAGE_COLUMNS}
            "
        ))
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("organization {id}")))?;

        Self::row_to_usage(&row)
    }

    async fn reset_monthly_usage(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE organizations
            SET monthly_request_count = 0, usage_reset_at = ?, updated_at = ?
            WHERE id = ? AND usage_reset_at <= ?
            ",
        )
        .bind(next_reset_boundary(now))
        .bind(now)
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl UserRepository for SqliteRepository {
    async fn find_by_idp_sub(&self, idp_sub: &str) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, email, idp_sub, name, created_at FROM users WHERE idp_sub = ?",
        )
        .bind(idp_sub)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_user).transpose()
    }

    async fn list_memberships(
        &self,
        user_id: &str,
    ) -> Result<Vec<OrganizationMember>, RepositoryError> {
        let rows = sqlx::query(
            r"
            SELECT id, organization_id, user_id, role, created_at
            FROM organization_members
            WHERE user_id = ?
            ORDER BY created_at
            ",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_member).collect()
    }
}

#[async_trait]
impl HealthCheck for SqliteRepository {
    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl IngestRepository for SqliteRepository {
    async fn store_trace(&self, project_id: &str, trace: &Trace) -> Result<(), RepositoryError> {
        Self::insert_trace(&self.pool, project_id, trace, Utc::now()).await
    }

    async fn store_traces(
        &self,
        project_id: &str,
        traces: &[Trace],
    ) -> Result<(), RepositoryError> {
        if traces.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for trace in traces {
            Self::insert_trace(&mut *tx, project_id, trace, now).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn store_test_run(&self, project_id: &str, run: &TestRun) -> Result<(), RepositoryError> {
        let config = run.config.as_ref().map(Self::to_json).transpose()?;

        sqlx::query(
            r"
            INSERT INTO test_runs (
                project_id, run_id, timestamp, git_sha, git_branch, git_commit_message,
                ci_provider, ci_build_id, ci_build_url, ci_pr_number, config, results,
                violations, total_cases, passed_cases, warned_cases, failed_cases, status,
                created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(project_id)
        .bind(&run.run_id)
        .bind(run.timestamp)
        .bind(&run.git_sha)
        .bind(&run.git_branch)
        .bind(&run.git_commit_message)
        .bind(&run.ci_provider)
        .bind(&run.ci_build_id)
        .bind(&run.ci_build_url)
        .bind(run.ci_pr_number)
        .bind(config)
        .bind(Self::to_json(&run.results)?)
        .bind(Self::to_json(&run.violations)?)
        .bind(run.total_cases)
        .bind(run.passed_cases)
        .bind(run.warned_cases)
        .bind(run.failed_cases)
        .bind(run.effective_status())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
