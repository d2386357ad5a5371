use anyhow::Result;
use regrada_core::{
    auth::session::{JwksOptions, JwksTokenValidator},
    config::{AppConfig, StoreBackend},
    metrics::MetricsCollector,
    middleware::{AdmissionPipeline, AuthCache, CredentialResolver, RateLimiter, UsageMeter},
    repository::sqlite::SqliteRepository,
    store::{memory::MemoryStore, redis::RedisStore, SharedStore},
    types::system_clock,
};
use server::router::{create_app, AppState};
use std::{
    future::{Future, IntoFuture},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use tokio::{
    signal,
    sync::{broadcast, Notify},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const MEMORY_STORE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Initializes the logging system based on the configuration.
///
/// `RUST_LOG` wins when set; otherwise `logging.level` applies to the workspace crates.
fn init_logging(config: &AppConfig) {
    let filter = if let Ok(env_filter) = std::env::var("RUST_LOG") {
        if env_filter == "debug" || env_filter == "trace" {
            EnvFilter::new(format!(
                "warn,regrada_core={env_filter},server={env_filter},tests={env_filter}"
            ))
        } else {
            EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| {
                EnvFilter::new("warn,regrada_core=debug,server=debug,tests=debug")
            })
        }
    } else {
        let level = &config.logging.level;
        EnvFilter::new(format!("warn,regrada_core={level},server={level},tests={level}"))
    };

    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format.as_str() == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        // "pretty" and any other format default to pretty logging
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).init();
    }
}

async fn init_store(
    config: &AppConfig,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<(Arc<dyn SharedStore>, Option<JoinHandle<()>>)> {
    match config.store.backend {
        StoreBackend::Redis => {
            let timeout = config.store_operation_timeout();
            let store = RedisStore::connect(&config.store.redis_url, timeout)
                .await
                .map_err(|e| anyhow::anyhow!("Redis connection failed: {e}"))?;
            info!(url = %config.store.redis_url, "connected to Redis");
            let store: Arc<dyn SharedStore> = Arc::new(store);
            Ok((store, None))
        }
        StoreBackend::Memory => {
            warn!("using in-memory store, counters are not shared between instances");
            let store = Arc::new(MemoryStore::new());
            let handle = start_memory_purge_task(store.clone(), shutdown_tx.subscribe());
            let store: Arc<dyn SharedStore> = store;
            Ok((store, Some(handle)))
        }
    }
}

fn start_memory_purge_task(
    store: Arc<MemoryStore>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MEMORY_STORE_PURGE_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let purged = store.purge_expired();
                    if purged > 0 {
                        debug!(purged, remaining = store.len(), "purged expired store entries");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}

/// Builds the JWKS validator and starts its refresher. A failed first fetch is logged and the
/// refresher keeps trying; session requests fail until keys arrive.
async fn init_token_validator(
    config: &AppConfig,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<(Arc<JwksTokenValidator>, JoinHandle<()>)> {
    let identity = &config.auth.identity;
    let validator = Arc::new(
        JwksTokenValidator::new(JwksOptions {
            jwks_url: identity.jwks_url(),
            issuer: identity.issuer(),
            audience: identity.client_id.clone(),
            fetch_timeout: Duration::from_secs(identity.fetch_timeout_seconds),
            refresh_interval: Duration::from_secs(identity.refresh_interval_seconds),
            on_demand_interval: Duration::from_secs(identity.on_demand_refresh_seconds),
        })
        .map_err(|e| anyhow::anyhow!("Session validator initialization failed: {e}"))?,
    );

    match validator.refresh().await {
        Ok(keys) => info!(keys, issuer = %identity.issuer(), "loaded identity provider keys"),
        Err(e) => warn!(error = %e, "initial JWKS fetch failed, sessions rejected until refresh"),
    }

    let handle = validator.start_refresh_task(shutdown_tx.subscribe());
    Ok((validator, handle))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config =
        AppConfig::load().map_err(|e| anyhow::anyhow!("Configuration loading failed: {e}"))?;
    config.validate().map_err(|e| anyhow::anyhow!("Configuration validation failed: {e}"))?;

    init_logging(&config);
    info!(environment = %config.environment, "Starting Regrada ingestion server");
    debug!(
        store_backend = ?config.store.backend,
        identity_enabled = config.auth.identity.enabled,
        metrics_enabled = config.metrics.enabled,
        bind_port = config.server.bind_port,
        "Configuration loaded"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    let repository = Arc::new(
        SqliteRepository::connect(&config.database.url, config.database.max_connections)
            .await
            .map_err(|e| anyhow::anyhow!("Database connection failed: {e}"))?,
    );
    if config.database.run_migrations {
        repository.migrate().await.map_err(|e| anyhow::anyhow!("Migrations failed: {e}"))?;
    }

    let (store, purge_handle) = init_store(&config, &shutdown_tx).await?;
    background.extend(purge_handle);

    let clock = system_clock();
    let mut resolver = CredentialResolver::new(
        repository.clone(),
        repository.clone(),
        repository.clone(),
        AuthCache::new(store.clone(), config.api_key_cache_ttl()),
        clock.clone(),
    )
    .with_touch_timeout(config.last_used_timeout());

    if config.auth.identity.enabled {
        let (validator, handle) = init_token_validator(&config, &shutdown_tx).await?;
        resolver = resolver.with_token_validator(validator);
        background.push(handle);
    } else {
        info!("identity provider not configured, session cookies will be rejected");
    }

    let pipeline = Arc::new(AdmissionPipeline::new(
        resolver,
        RateLimiter::new(store.clone(), &config.rate_limit, clock.clone()),
        UsageMeter::new(repository.clone(), clock),
    ));

    let state = AppState {
        api_keys: repository.clone(),
        ingest: repository.clone(),
        organizations: repository.clone(),
        database: repository,
        store,
        metrics: config.metrics.enabled.then(MetricsCollector::new),
    };

    let app = create_app(state, pipeline, &config);
    let addr = config.socket_addr().map_err(|e| anyhow::anyhow!(e))?;
    info!(address = %addr, "Ingestion server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let draining = Arc::new(Notify::new());
    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown({
            let draining = Arc::clone(&draining);
            async move {
                shutdown_signal().await;
                draining.notify_one();
            }
        });

    let grace = Duration::from_secs(GRACEFUL_SHUTDOWN_TIMEOUT_SECS);
    match run_until_drained(server.into_future(), &draining, grace).await {
        Some(Err(e)) => error!(error = %e, "Server error occurred"),
        Some(Ok(())) => {}
        None => warn!(
            timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT_SECS,
            "in-flight requests did not finish in time, forcing shutdown"
        ),
    }

    let _ = shutdown_tx.send(());
    for handle in background {
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!("background task did not stop in time");
        }
    }
    info!("Server shutdown complete");

    Ok(())
}

/// Graceful shutdown timeout in seconds.
/// After this timeout, the server will be forcefully terminated.
const GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Drives `server` to completion, giving up `grace` after `draining` is notified.
/// `None` means the deadline won.
async fn run_until_drained<F, T>(server: F, draining: &Notify, grace: Duration) -> Option<T>
where
    F: Future<Output = T>,
{
    let deadline = async {
        draining.notified().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        output = server => Some(output),
        () = deadline => None,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");

                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!(
        "Shutdown signal received, starting graceful shutdown (timeout: {}s)",
        GRACEFUL_SHUTDOWN_TIMEOUT_SECS
    );
}
