use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conduit_api::{router, AppState};
use conduit_core::defaults::SERVER_PORT;
use conduit_core::{EmbeddingBackend, SourceClient};
use conduit_db::{log_pool_metrics, Database, PoolConfig, Stores};
use conduit_jobs::{
    FixtureSource, MapperRegistry, Pipeline, PipelineConfig, PipelinePlan, SourceRegistry,
};

/// In-flight queue messages older than this at startup belong to a dead
/// process and are returned to their queue.
const STALE_DELIVERY_SECS: u64 = 600;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "conduit_api=debug,conduit_jobs=debug")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "conduit_api=debug,conduit_jobs=debug,tower_http=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    // Optionally create a file appender with daily rotation
    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("conduit-api.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false)); // no ANSI in files by default
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        // Console-only output
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(SERVER_PORT);

    let stores = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let db = Database::connect_with_config(&url, PoolConfig::from_env())
                .await
                .context("connecting to DATABASE_URL")?;
            db.migrate().await.context("running migrations")?;
            db.queue
                .recover_in_flight(Duration::from_secs(STALE_DELIVERY_SECS))
                .await?;
            log_pool_metrics(db.pool());
            info!(subsystem = "api", "Using PostgreSQL stores");
            db.stores()
        }
        Err(_) => {
            warn!(subsystem = "api", "DATABASE_URL not set; using in-memory stores");
            Stores::in_memory()
        }
    };

    let sources = load_sources()?;
    let config = PipelineConfig::from_env();
    let backend = Pipeline::embedding_backend(&config);
    info!(
        subsystem = "api",
        provider = ?config.embedding_provider,
        model = backend.model_name(),
        dimension = backend.dimension(),
        "Embedding backend selected"
    );

    let pipeline = Arc::new(Pipeline::new(
        stores,
        sources,
        MapperRegistry::new(),
        backend,
        config,
    ));
    let handle = pipeline.start().await?;

    let app = router(AppState::new(pipeline.clone()));
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped; draining worker pools");
    handle.shutdown().await;
    Ok(())
}

/// Registered sources: a fixture file when `FIXTURE_SOURCE_PATH` is set,
/// otherwise the bundled GitHub and Jira samples.
fn load_sources() -> anyhow::Result<SourceRegistry> {
    let mut sources = SourceRegistry::new();
    match std::env::var("FIXTURE_SOURCE_PATH") {
        Ok(path) => {
            let fixture = FixtureSource::from_json_file(&path)
                .with_context(|| format!("loading fixture {}", path))?;
            let plan = match fixture.name() {
                "github" => PipelinePlan::github(),
                "jira" => PipelinePlan::jira(),
                other => anyhow::bail!("no pipeline plan for fixture source {}", other),
            };
            info!(subsystem = "api", path = %path, source = %plan.source, "Loaded fixture source");
            sources.register(plan, Arc::new(fixture));
        }
        Err(_) => {
            sources.register(PipelinePlan::github(), Arc::new(FixtureSource::github_sample()));
            sources.register(PipelinePlan::jira(), Arc::new(FixtureSource::jira_sample()));
        }
    }
    Ok(sources)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
