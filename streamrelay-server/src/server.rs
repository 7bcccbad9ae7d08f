use std::{
    net::SocketAddr,
    str::FromStr,
    sync::{Arc, OnceLock},
};

use anyhow::Context;
use axum::{
    Extension, Router,
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::get,
    serve,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shared::{
    config::server::{Config, DatabaseConfig, LogFormat},
    models::SweepReport,
};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::{
    app_state::AppState,
    chat::{ChatSink, DiscordSink},
    db::{
        bootstrap,
        store::{SqlStore, Store},
    },
    middleware::{
        auth::AdminToken,
        request_context::{self, RequestIdState},
    },
    platform::{
        PlatformApi,
        credentials::{CredentialManager, OAuthTokenSource},
        helix::HelixClient,
    },
    routes, tracer,
};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// The process-wide Prometheus handle, installing the recorder on first use.
pub fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if let Err(err) = metrics::set_global_recorder(recorder) {
                warn!(error = %err, "metrics recorder already installed");
            }
            handle
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Initializes the tracing subscriber for logging using the provided configuration.
///
/// Returns `false` when a global subscriber was already installed, in which
/// case that subscriber is kept.
pub fn initialize_tracing(config: &Config) -> bool {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if matches!(config.logging.format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };

    match installed {
        Ok(()) => true,
        Err(error) => {
            debug!(%error, "tracing subscriber already installed, keeping it");
            false
        }
    }
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// Opens the SQLite pool, creating the database file and its directory when
/// missing.
///
/// # Errors
/// Returns an error if the URL is invalid, the directory cannot be created or
/// the pool cannot connect.
pub async fn create_database_pool(db: &DatabaseConfig) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&db.url)
        .with_context(|| format!("invalid database url {}", db.url))?
        .create_if_missing(true)
        .foreign_keys(true);

    if let Some(parent) = options.get_filename().parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    // An in-memory database lives only as long as its connection.
    let pool = SqlitePoolOptions::new()
        .max_connections(db.max_connections.max(1))
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .context("failed to open database")?;
    metrics::gauge!("db_pool_max_connections").set(f64::from(db.max_connections));
    Ok(pool)
}

/// Opens the pool, applies the schema and checks that the database is usable.
async fn prepare_database(config: &Config) -> anyhow::Result<SqlitePool> {
    let pool = create_database_pool(&config.db).await?;
    bootstrap::ensure_liveness(&pool)
        .await
        .context("database liveness check failed")?;
    bootstrap::run(&pool).await.context("database bootstrap failed")?;
    bootstrap::ensure_readiness(&pool)
        .await
        .context("database readiness check failed")?;
    Ok(pool)
}

/// Builds the platform client over the persisted app credential.
fn create_platform(config: &Config, pool: &SqlitePool) -> anyhow::Result<Arc<dyn PlatformApi>> {
    let store: Arc<dyn Store> = Arc::new(SqlStore::new(pool.clone()));
    let source = Arc::new(OAuthTokenSource::new(&config.platform)?);
    let credentials = Arc::new(CredentialManager::new(store, source));
    let client = HelixClient::new(&config.platform, &config.webhook, credentials)?;
    Ok(Arc::new(client))
}

/// Creates the application state with real outbound clients and starts the
/// job workers.
///
/// # Errors
/// Returns an error if an outbound HTTP client cannot be built.
pub fn create_app_state(
    config: Arc<Config>,
    pool: SqlitePool,
    cancel: CancellationToken,
) -> anyhow::Result<(Arc<AppState>, JoinHandle<()>)> {
    let platform = create_platform(&config, &pool)?;
    let chat: Arc<dyn ChatSink> = Arc::new(DiscordSink::new(&config.chat)?);
    let (state, workers) = AppState::assemble(config, pool, platform, chat, cancel);
    Ok((Arc::new(state), workers))
}

/// Creates the main application router with all middleware and routes.
pub fn create_app_router(
    state: Arc<AppState>,
    config: &Config,
    metrics_handle: PrometheusHandle,
) -> Router {
    let request_id_state = RequestIdState::from_config(config);
    let admin_token = AdminToken::new(&config.server.admin_token);

    Router::new()
        .merge(routes::webhook::create_webhook_router(&config.webhook.path))
        .merge(routes::health::create_health_router())
        .nest("/api", routes::admin::create_admin_router(admin_token))
        .route("/metrics", get(metrics_endpoint))
        .layer(Extension(metrics_handle))
        .layer(tracer::create_trace_layer())
        .layer(axum::middleware::from_fn_with_state(
            request_id_state,
            request_context::assign_request_id,
        ))
        .with_state(state)
}

/// Resolves when Ctrl-C is received.
pub async fn create_shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}

/// Starts the relay: HTTP server, job workers, clip poller and sweep loop.
///
/// # Errors
/// Returns an error if the database or an outbound client cannot be set up,
/// or the listener fails.
pub async fn run(config: Config) -> anyhow::Result<()> {
    initialize_tracing(&config);
    info!(profile = ?config.profile, "starting streamrelay");
    if config.webhook.secret.is_none() {
        warn!("no webhook secret configured, deliveries will not be authenticated");
    }
    if config.server.admin_token.is_empty() {
        warn!("no admin token configured, the /api routes reject every request");
    }

    let metrics_handle = metrics_handle();
    let config = Arc::new(config);
    let pool = prepare_database(&config).await?;

    let cancel = CancellationToken::new();
    let (state, workers) = create_app_state(config.clone(), pool, cancel.clone())?;
    let background = spawn_background(&state, &config, &cancel);

    let app = create_app_router(state, &config, metrics_handle);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.host))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);

    let shutdown = cancel.clone();
    serve(listener, app)
        .with_graceful_shutdown(async move {
            create_shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    for task in background {
        if let Err(err) = task.await {
            warn!(error = %err, "background task ended abnormally");
        }
    }
    if let Err(err) = workers.await {
        warn!(error = %err, "dispatcher ended abnormally");
    }
    info!("streamrelay stopped");
    Ok(())
}

fn spawn_background(
    state: &Arc<AppState>,
    config: &Config,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    if config.reconciliation.sweep_on_startup {
        let reconciler = state.reconciler.clone();
        tasks.push(tokio::spawn(async move {
            match reconciler.sweep().await {
                Ok(report) => log_sweep(&report),
                Err(err) => warn!(error = %err, "startup sweep failed"),
            }
        }));
    }

    if let Some(interval) = config.reconciliation.sweep_interval() {
        tasks.push(tokio::spawn(
            state.reconciler.clone().run_periodic(interval, cancel.clone()),
        ));
    }

    if config.polling.enabled {
        tasks.push(tokio::spawn(state.poller.clone().run(cancel.clone())));
    } else {
        info!("clip polling disabled");
    }

    tasks
}

fn log_sweep(report: &SweepReport) {
    info!(
        adopted = report.adopted,
        created = report.created,
        orphans_deleted = report.orphans_deleted,
        duplicates_deleted = report.duplicates_deleted,
        stale_removed = report.stale_removed,
        unsubscribed = report.unsubscribed,
        failed_entities = report.failed_entities,
        "reconciliation sweep finished"
    );
}

/// Runs one reconciliation sweep against the configured database and exits.
///
/// # Errors
/// Returns an error if setup fails or the sweep cannot list remote
/// subscriptions.
pub async fn run_sweep(config: Config) -> anyhow::Result<SweepReport> {
    initialize_tracing(&config);
    let config = Arc::new(config);
    let pool = prepare_database(&config).await?;

    let cancel = CancellationToken::new();
    let (state, workers) = create_app_state(config, pool, cancel.clone())?;
    let report = state.reconciler.sweep().await;
    cancel.cancel();
    if let Err(err) = workers.await {
        warn!(error = %err, "dispatcher ended abnormally");
    }

    let report = report?;
    log_sweep(&report);
    Ok(report)
}
