use std::sync::Arc;

use anyhow::Result;
use checkpoint_store::{PgCheckpointStore, PgPlaceRepository};
use job_controller::JobController;
use place_ingest_config::AppConfig;
use place_ingest_metrics::IngestMetrics;
use prometheus::Registry;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use update_queue::{QueueConfig as UpdateQueueConfig, RedisQueueBackend, UpdateQueue};

mod crawler;
mod deployment_mode;
mod embedding_stub;
mod errors;
mod jobs;
mod metrics_glue;
mod routes;
mod state;

use crawler::StubCrawlerClient;
use deployment_mode::DeploymentModeRegistry;
use state::AppState;

fn setup_env(token: CancellationToken) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic| {
        default_hook(panic);
        std::process::exit(12);
    }));

    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("cannot listen to SIGTERM signal")
                .recv()
                .await;
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("CTRL+C signal received, shutting down"),
            _ = terminate => tracing::info!("SIGTERM signal received, shutting down"),
        };

        token.cancel();
    });
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let token = CancellationToken::new();
    setup_env(token.clone());

    let config = AppConfig::from_env()?;

    let pg_pool = PgPoolOptions::new()
        .max_connections(config.db.max_connections)
        .connect(&config.db.connection_string())
        .await?;
    checkpoint_store::migrate(&pg_pool).await?;

    let redis_backend = RedisQueueBackend::connect(&config.queue.redis_url).await?;
    let queue = UpdateQueue::new(
        redis_backend,
        UpdateQueueConfig {
            visibility_timeout: config.queue.visibility_timeout,
            heartbeat_interval: config.queue.heartbeat_interval,
            max_attempts: config.queue.max_attempts,
            ..UpdateQueueConfig::default()
        },
    );

    let registry = Registry::new();
    let metrics = IngestMetrics::new(&registry);
    let http_port = config.http_port;

    let state = AppState {
        job_controller: Arc::new(JobController::new()),
        deployment_modes: Arc::new(DeploymentModeRegistry::new()),
        checkpoint_store: Arc::new(PgCheckpointStore::new(pg_pool.clone())),
        place_repo: Arc::new(PgPlaceRepository::new(pg_pool.clone())),
        pg_pool,
        queue,
        crawler: Arc::new(StubCrawlerClient),
        metrics: Arc::new(metrics),
        registry: Arc::new(registry),
        config,
    };

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], http_port));
    tracing::info!(%addr, "place-ingest-server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    Ok(())
}
