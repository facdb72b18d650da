//! ShowTrack Recommendation Service
//!
//! Hybrid show recommendations with background retraining.
//!
//! # Architecture
//!
//! - **Job Scheduler**: weekly retraining, daily materialization, hourly token pruning
//! - **Recommendation Engine**: model-based scoring with a content-based fallback
//! - **API Server**: REST endpoints for live and stored recommendations
//!
//! # Graceful Shutdown
//!
//! The service handles SIGTERM and SIGINT signals, ensuring:
//! - In-flight requests complete
//! - Running jobs finish their current attempt
//! - Database connections are closed cleanly

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use showtrack::api::{self, AppState};
use showtrack::config::Config;
use showtrack::database::Database;
use showtrack::error::Result;
use showtrack::jobs::JobScheduler;
use showtrack::recommendation::{Materializer, ModelHandle, ModelTrainer, Recommender};
use showtrack::store::{FileModelStorage, PgStore};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("═══════════════════════════════════════════════════════════════");
    info!("  🚀 ShowTrack Recommendation Service v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");
    info!("  Components:");
    info!("    • Job Scheduler (train, materialize, prune tokens)");
    info!("    • Recommendation Engine");
    info!("    • REST API Server");
    info!("═══════════════════════════════════════════════════════════════");

    let config = Arc::new(Config::from_env()?);
    info!("✅ Configuration loaded and validated");

    init_metrics();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let db = Database::new(&config.database).await?;
    let stats = db.stats();
    info!(
        "✅ Database connection pool established (size: {}, idle: {})",
        stats.size, stats.idle
    );

    let store = Arc::new(PgStore::new(db.pool().clone()));
    let storage = Arc::new(FileModelStorage::new(&config.recommendation.model_path));

    info!("📦 Loading recommendation model...");
    let model = ModelHandle::load(storage.as_ref()).await;

    let recommender = Recommender::new(store.clone(), store.clone(), store.clone(), model.clone());
    let trainer = ModelTrainer::new(store.clone(), storage, model.clone(), &config.recommendation);
    let materializer = Materializer::new(
        store.clone(),
        store.clone(),
        recommender.clone(),
        config.recommendation.materialize_count,
        config.recommendation.materialize_concurrency,
    );

    let mut handles = Vec::new();

    info!("⏰ Starting background jobs...");
    let scheduler = JobScheduler::new(
        trainer.clone(),
        materializer,
        store.clone(),
        config.jobs.clone(),
    );
    handles.extend(scheduler.spawn_all(&shutdown_tx));

    let state = Arc::new(AppState {
        recommender,
        trainer,
        reader: store.clone(),
        users: store.clone(),
        catalog: store.clone(),
        model,
        max_count: config.recommendation.max_count,
    });

    info!("🌐 Starting API server on port {}...", config.api.port);
    handles.push(spawn_api_server(state, config.clone(), &shutdown_tx));

    info!("═══════════════════════════════════════════════════════════════");
    info!("  ✅ All services started successfully");
    info!("  📡 API: http://{}:{}", config.api.host, config.api.port);
    info!(
        "  🔗 Health: http://{}:{}/health",
        config.api.host, config.api.port
    );
    info!("═══════════════════════════════════════════════════════════════");

    tokio::select! {
        _ = shutdown_signal() => {
            info!("📴 Shutdown signal received");
        }
        _ = wait_for_any_failure(&mut handles) => {
            warn!("⚠️ A service failed, initiating shutdown");
        }
    }

    info!("🛑 Initiating graceful shutdown...");
    let _ = shutdown_tx.send(());

    let shutdown_timeout = Duration::from_secs(30);
    if tokio::time::timeout(shutdown_timeout, shutdown_services(handles))
        .await
        .is_err()
    {
        warn!("⚠️ Shutdown timeout exceeded, forcing exit");
    }

    db.close().await;

    info!("👋 ShowTrack Recommendation Service stopped gracefully");
    Ok(())
}

/// Initialize structured logging with tracing. `LOG_FORMAT=json` switches
/// to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("showtrack=debug,showtrack_recs=debug,tower_http=debug,sqlx=warn,info")
    });

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(std::env::var("NO_COLOR").is_err()),
            )
            .init();
    }
}

/// Install the Prometheus exporter when built with the `prometheus` feature
#[cfg(feature = "prometheus")]
fn init_metrics() {
    let port: u16 = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(9000);

    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
    {
        Ok(()) => info!("📈 Prometheus metrics exposed on port {}", port),
        Err(e) => warn!("Failed to install Prometheus exporter: {}", e),
    }
}

#[cfg(not(feature = "prometheus"))]
fn init_metrics() {}

fn spawn_api_server(
    state: Arc<AppState>,
    config: Arc<Config>,
    shutdown: &broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown.subscribe();

    tokio::spawn(async move {
        let stop = async move {
            let _ = shutdown_rx.recv().await;
            info!("API server shutting down");
        };

        if let Err(e) = api::start_server(state, &config.api, stop).await {
            error!("API server error: {:?}", e);
        }
    })
}

/// Wait for any task to finish early
async fn wait_for_any_failure(handles: &mut [tokio::task::JoinHandle<()>]) {
    loop {
        if handles.iter().any(|h| h.is_finished()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn shutdown_services(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
