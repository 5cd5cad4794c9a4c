use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ingest_engine::checkpoint_store::CheckpointStore;
use ingest_engine::circuit_breaker::CircuitBreakerRegistry;
use ingest_engine::concurrency_limiter::ConcurrencyLimiter;
use ingest_engine::config::Config;
use ingest_engine::control_api;
use ingest_engine::ingest_run_store::IngestRunStore;
use ingest_engine::persistence::postgres::{PostgresCheckpointStore, PostgresIngestRunStore, PostgresMediaPersistence};
use ingest_engine::persistence::cdn::CdnSink;
use ingest_engine::persistence::MediaPersistence;
use ingest_engine::rate_limiter::RateLimiterRegistry;
use ingest_engine::repository::{PostgresSourceRepository, PostgresThreadRepository};
use ingest_engine::scanner::Scanner;
use ingest_engine::scheduler::queue::{IngestionQueue, SchedulerQueue};
use ingest_engine::scheduler::worker::{self, WorkerContext};
use ingest_engine::scheduler::Scheduler;
use ingest_engine::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into())))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let db_pool = PgPoolOptions::new()
        .max_connections(25)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .test_before_acquire(true)
        .connect(&config.database_url)
        .await?;

    sqlx::query("SELECT 1")
        .execute(&db_pool)
        .await
        .map_err(|e| anyhow::anyhow!("database connection validation failed: {e}"))?;

    let redis_cfg = deadpool_redis::Config::from_url(&config.redis_url);
    let redis_pool = redis_cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1))?;

    let http = build_http_client(&config)?;

    let breakers = Arc::new(CircuitBreakerRegistry::new());
    let rate_limiters = Arc::new(RateLimiterRegistry::new());
    let concurrency_limiter = Arc::new(ConcurrencyLimiter::new(config.max_concurrent_sources));

    let checkpoint_store: Arc<dyn CheckpointStore> = Arc::new(PostgresCheckpointStore::new(db_pool.clone()));
    let ingest_run_store: Arc<dyn IngestRunStore> = Arc::new(PostgresIngestRunStore::new(db_pool.clone()));
    let scanner = Arc::new(Scanner::new(checkpoint_store.clone(), ingest_run_store.clone(), config.scanner.clone()));

    let persistence: Arc<dyn MediaPersistence> = match build_cdn_sink(&config).await? {
        Some(cdn) => Arc::new(PostgresMediaPersistence::with_cdn(db_pool.clone(), cdn)),
        None => Arc::new(PostgresMediaPersistence::new(db_pool.clone())),
    };

    let sources = Arc::new(PostgresSourceRepository::new(db_pool.clone()));
    let threads = Arc::new(PostgresThreadRepository::new(db_pool.clone()));

    let ingestion_queue = Arc::new(IngestionQueue::new(redis_pool.clone()));
    let scheduler_queue = Arc::new(SchedulerQueue::new(redis_pool.clone()));
    let scheduler = Arc::new(Scheduler::new(threads.clone(), ingestion_queue.clone(), scheduler_queue));

    let worker_ctx = Arc::new(WorkerContext {
        scanner,
        persistence,
        checkpoint_store,
        ingest_run_store,
        sources,
        threads,
        breakers: breakers.clone(),
        rate_limiters: rate_limiters.clone(),
        concurrency_limiter,
        http,
        queue: ingestion_queue,
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let worker_pool = tokio::spawn(worker::run_pool(worker_ctx, config.worker_concurrency, shutdown_rx));

    let poll_scheduler = scheduler.clone();
    let poll_interval_ms = config.poll_interval_ms;
    let mut poll_shutdown = shutdown_tx.subscribe();
    let poll_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(poll_interval_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => poll_scheduler.run_poll_cycle().await,
                _ = poll_shutdown.changed() => {
                    if *poll_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    let state = AppState { scheduler, breakers, rate_limiters };
    let app = control_api::router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "starting control api");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    let _ = shutdown_tx.send(true);
    let _ = worker_pool.await;
    poll_task.abort();

    Ok(())
}

fn build_http_client(config: &Config) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none()).timeout(Duration::from_secs(30));
    if let Some(ua) = &config.user_agent {
        builder = builder.user_agent(ua.clone());
    }
    Ok(builder.build()?)
}

async fn build_cdn_sink(config: &Config) -> anyhow::Result<Option<CdnSink>> {
    let Some(r2) = &config.r2 else { return Ok(None) };

    let endpoint = format!("https://{}.r2.cloudflarestorage.com", r2.account_id);
    let credentials = aws_sdk_s3::config::Credentials::new(&r2.access_key_id, &r2.secret_access_key, None, None, "r2-config");
    let s3_config = aws_sdk_s3::config::Builder::new()
        .region(aws_sdk_s3::config::Region::new("auto"))
        .endpoint_url(endpoint)
        .credentials_provider(credentials)
        .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
        .build();
    let s3 = aws_sdk_s3::Client::from_conf(s3_config);

    Ok(Some(CdnSink::new(s3, r2.bucket.clone(), r2.public_url.clone())))
}

/// Waits for Ctrl+C or, on unix, SIGTERM, so in-flight requests and
/// in-flight jobs get a chance to finish before the process exits.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, draining");
}
