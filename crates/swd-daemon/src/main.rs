//! swd-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, selects the storage
//! backends, spawns the worker and janitor, wires middleware, and starts the
//! HTTP server. Route handlers live in `routes.rs`; shared state in
//! `state.rs`.
//!
//! Shutdown order on SIGTERM/SIGINT: stop accepting new submissions (serve
//! drains), worker finishes in-flight stages up to the next persisted
//! boundary and releases its leases, streams close, then the process exits
//! and the pool drops.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::Method;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

use swd_bus::EventBus;
use swd_clock::{system_clock, SharedClock};
use swd_config::EngineConfig;
use swd_daemon::{routes, state::AppState};
use swd_queue::{JobQueue, MemoryQueue, PgQueue, QueueConfig};
use swd_router::Router;
use swd_store::{MemoryOrderRepository, OrderRepository, PgOrderRepository};
use swd_venues::default_venues;
use swd_worker::{spawn_janitor, JanitorConfig, Worker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Dev convenience; silent if the file does not exist. Production
    // injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    let cfg = EngineConfig::from_env()?;
    init_tracing(&cfg.log_level);

    let clock = system_clock();
    let queue_cfg = QueueConfig {
        max_retries: cfg.max_retries,
        per_worker_cap: cfg.queue_concurrency,
        visibility_timeout: chrono::Duration::from_std(cfg.visibility_timeout)
            .context("visibility timeout out of range")?,
        ..QueueConfig::default()
    };

    let (repo, queue) = build_backends(&cfg, &clock, queue_cfg).await?;
    let bus = EventBus::new();
    let exec_router = Arc::new(Router::new(default_venues(cfg.mock_seed)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = Arc::new(Worker::new(
        WorkerConfig {
            concurrency: cfg.queue_concurrency,
            ..WorkerConfig::default()
        },
        repo.clone(),
        queue.clone(),
        exec_router,
        bus.clone(),
        clock.clone(),
    ));
    let worker_handle = worker.spawn(shutdown_rx.clone());

    let janitor_handle = spawn_janitor(
        repo.clone(),
        queue.clone(),
        clock.clone(),
        JanitorConfig {
            grace: chrono::Duration::from_std(cfg.janitor_grace)
                .context("janitor grace out of range")?,
            ..JanitorConfig::default()
        },
        shutdown_rx.clone(),
    );

    let port = cfg.port;
    let shared = Arc::new(AppState::new(cfg, clock, repo, queue, bus, shutdown_rx));

    let app = routes::build_router(shared)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_layer());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("swd-daemon listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await
    .context("server crashed")?;

    // Serve has drained; wait for the worker to finish its active jobs and
    // the janitor to park.
    let _ = worker_handle.await;
    let _ = janitor_handle.await;
    info!("swd-daemon stopped");
    Ok(())
}

async fn build_backends(
    cfg: &EngineConfig,
    clock: &SharedClock,
    queue_cfg: QueueConfig,
) -> Result<(Arc<dyn OrderRepository>, Arc<dyn JobQueue>)> {
    match &cfg.database_url {
        Some(url) => {
            let pool = swd_store::connect(url).await?;
            swd_store::migrate(&pool).await?;
            info!("using Postgres backends");
            Ok((
                Arc::new(PgOrderRepository::new(pool.clone())) as Arc<dyn OrderRepository>,
                Arc::new(PgQueue::new(pool, queue_cfg)) as Arc<dyn JobQueue>,
            ))
        }
        None => {
            info!("DATABASE_URL not set; using in-memory backends");
            Ok((
                Arc::new(MemoryOrderRepository::new(clock.clone())) as Arc<dyn OrderRepository>,
                Arc::new(MemoryQueue::new(clock.clone(), queue_cfg)) as Arc<dyn JobQueue>,
            ))
        }
    }
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}

/// Resolves when SIGTERM/SIGINT arrives; flips the shutdown watch so the
/// worker, janitor and open streams wind down while serve drains.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; draining");
    let _ = shutdown_tx.send(true);
}
