//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: `set_default` calls and struct `Default` implementations
//! 2. **Config file**: TOML file specified by the `REGRADA_CONFIG` env var
//!    (default `config/config.toml`, optional)
//! 3. **Environment variables**: `REGRADA__SECTION__FIELD` overrides a single field
//!
//! # Configuration Sections
//!
//! - [`ServerConfig`]: bind address, concurrency, request timeout, body limit
//! - [`DatabaseConfig`]: `SQLite` URL and pool size
//! - [`StoreConfig`]: shared counter store (Redis or in-memory)
//! - [`AuthConfig`]: credential cache and the session identity provider
//! - [`RateLimitConfig`]: window length and per-tier requests per minute
//! - [`CorsConfig`], [`MetricsConfig`], [`LoggingConfig`]
//!
//! # Example
//!
//! ```toml
//! environment = "production"
//!
//! [server]
//! bind_port = 8080
//!
//! [store]
//! backend = "redis"
//! redis_url = "redis://cache:6379"
//!
//! [auth.identity]
//! enabled = true
//! region = "us-east-1"
//! user_pool_id = "us-east-1_abc123"
//! client_id = "4example"
//!
//! [rate_limit.tiers]
//! team = 150
//! ```

use crate::types::Tier;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// HTTP server configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub bind_port: u16,
    /// Maximum number of requests processed at once on the API routes.
    pub max_concurrent_requests: usize,
    /// Upper bound for admission on a single request.
    pub request_timeout_seconds: u64,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Apply the embedded schema on startup.
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    pub operation_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Lifetime of a cached API key lookup. Bounds how long a revoked key keeps working.
    pub api_key_cache_ttl_seconds: u64,
    pub last_used_timeout_seconds: u64,
    pub session_cookie: String,
    pub identity: IdentityConfig,
}

/// Identity provider issuing session ID tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub enabled: bool,
    pub region: String,
    pub user_pool_id: String,
    /// Expected `aud` claim.
    pub client_id: String,
    /// Overrides the key-set URL derived from the issuer.
    pub jwks_url: Option<String>,
    pub refresh_interval_seconds: u64,
    pub on_demand_refresh_seconds: u64,
    pub fetch_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_seconds: u64,
    /// Lifetime of a window counter, measured from its first increment.
    pub counter_ttl_seconds: u64,
    pub tiers: TierRateLimits,
}

/// Requests per minute applied when an API key carries no limit of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierRateLimits {
    pub starter: u32,
    pub team: u32,
    pub scale: u32,
    pub enterprise: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Exact origins allowed with credentials. `*` allows any origin outside production.
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub environment: String,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub store: StoreConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub cors: CorsConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 8080,
            max_concurrent_requests: 1000,
            request_timeout_seconds: 30,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/regrada.db".to_string(),
            max_connections: 10,
            run_migrations: true,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            operation_timeout_ms: 500,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key_cache_ttl_seconds: 300,
            last_used_timeout_seconds: 5,
            session_cookie: "id_token".to_string(),
            identity: IdentityConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            region: "us-east-1".to_string(),
            user_pool_id: String::new(),
            client_id: String::new(),
            jwks_url: None,
            refresh_interval_seconds: 900,
            on_demand_refresh_seconds: 60,
            fetch_timeout_seconds: 5,
        }
    }
}

impl IdentityConfig {
    /// Expected `iss` claim.
    #[must_use]
    pub fn issuer(&self) -> String {
        format!("https://cognito-idp.{}.amazonaws.com/{}", self.region, self.user_pool_id)
    }

    #[must_use]
    pub fn jwks_url(&self) -> String {
        self.jwks_url.clone().unwrap_or_else(|| format!("{}/.well-known/jwks.json", self.issuer()))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { window_seconds: 60, counter_ttl_seconds: 120, tiers: TierRateLimits::default() }
    }
}

impl Default for TierRateLimits {
    fn default() -> Self {
        Self {
            starter: Tier::Starter.default_rate_limit_rpm(),
            team: Tier::Team.default_rate_limit_rpm(),
            scale: Tier::Scale.default_rate_limit_rpm(),
            enterprise: Tier::Enterprise.default_rate_limit_rpm(),
        }
    }
}

impl TierRateLimits {
    #[must_use]
    pub fn for_tier(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Starter => self.starter,
            Tier::Team => self.team,
            Tier::Scale => self.scale,
            Tier::Enterprise => self.enterprise,
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self { allowed_origins: vec!["http://localhost:3000".to_string()] }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            store: StoreConfig::default(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cors: CorsConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file with environment variable overrides.
    ///
    /// Environment variables with the `REGRADA__` prefix can override any configuration value.
    /// Use `__` as a separator for nested fields (e.g., `REGRADA__SERVER__BIND_PORT=9000`).
    /// `REGRADA__CORS__ALLOWED_ORIGINS` takes a comma-separated list.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or deserialized.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let config_builder = Config::builder()
            .set_default("environment", "development")?
            .set_default("server.bind_address", "0.0.0.0")?
            .set_default("server.bind_port", 8080)?
            .set_default("server.max_concurrent_requests", 1000)?
            .set_default("server.request_timeout_seconds", 30)?
            .set_default("database.url", "sqlite://data/regrada.db")?
            .set_default("database.max_connections", 10)?
            .set_default("store.backend", "redis")?
            .set_default("store.redis_url", "redis://127.0.0.1:6379")?
            .set_default("auth.api_key_cache_ttl_seconds", 300)?
            .set_default("rate_limit.window_seconds", 60)?
            .set_default("rate_limit.counter_ttl_seconds", 120)?
            .set_default("metrics.enabled", true)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(
                Environment::with_prefix("REGRADA")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cors.allowed_origins")
                    .try_parsing(true),
            )
            .build()?;

        config_builder.try_deserialize()
    }

    /// Loads configuration from `config/config.toml` with fallback to defaults.
    ///
    /// The config file path can be overridden using the `REGRADA_CONFIG` environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("REGRADA_CONFIG").unwrap_or_else(|_| "config/config.toml".to_string());
        Self::from_file(&config_path)
    }

    /// # Errors
    ///
    /// Returns an error string if the address cannot be parsed into a valid [`SocketAddr`].
    ///
    /// [`SocketAddr`]: std::net::SocketAddr
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, String> {
        format!("{}:{}", self.server.bind_address, self.server.bind_port).parse().map_err(|_| {
            format!(
                "Invalid socket address: {}:{}",
                self.server.bind_address, self.server.bind_port
            )
        })
    }

    #[must_use]
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_seconds)
    }

    #[must_use]
    pub fn store_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.store.operation_timeout_ms)
    }

    #[must_use]
    pub fn api_key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.api_key_cache_ttl_seconds)
    }

    #[must_use]
    pub fn last_used_timeout(&self) -> Duration {
        Duration::from_secs(self.auth.last_used_timeout_seconds)
    }

    /// Validates the configuration for correctness and consistency.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error string if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.bind_port == 0 {
            return Err("Bind port must be greater than 0".to_string());
        }

        if self.server.max_concurrent_requests == 0 {
            return Err("Max concurrent requests must be greater than 0".to_string());
        }

        if self.server.request_timeout_seconds == 0 {
            return Err("Request timeout must be greater than 0".to_string());
        }

        if self.database.url.is_empty() {
            return Err("Database URL must not be empty".to_string());
        }

        if self.store.backend == StoreBackend::Redis && !self.store.redis_url.starts_with("redis")
        {
            return Err(format!("Invalid Redis URL: {}", self.store.redis_url));
        }

        if self.store.operation_timeout_ms == 0 {
            return Err("Store operation timeout must be greater than 0".to_string());
        }

        if self.auth.api_key_cache_ttl_seconds == 0 {
            return Err("API key cache TTL must be greater than 0".to_string());
        }

        if self.auth.session_cookie.is_empty() {
            return Err("Session cookie name must not be empty".to_string());
        }

        let identity = &self.auth.identity;
        if identity.enabled
            && (identity.region.is_empty()
                || identity.user_pool_id.is_empty()
                || identity.client_id.is_empty())
        {
            return Err(
                "Identity provider requires region, user_pool_id and client_id".to_string()
            );
        }

        if self.rate_limit.window_seconds == 0 {
            return Err("Rate limit window must be greater than 0".to_string());
        }

        if self.rate_limit.counter_ttl_seconds < self.rate_limit.window_seconds {
            return Err("Rate limit counter TTL must cover the whole window".to_string());
        }

        let tiers = &self.rate_limit.tiers;
        if [tiers.starter, tiers.team, tiers.scale, tiers.enterprise].contains(&0) {
            return Err("Tier rate limits must be greater than 0".to_string());
        }

        if self.cors.allowed_origins.iter().any(|origin| origin.trim().is_empty()) {
            return Err("CORS origins must not be empty".to_string());
        }

        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err("Logging format must be 'json' or 'pretty'".to_string());
        }

        Ok(())
    }
}
