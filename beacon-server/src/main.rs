//! Beacon server - main entry point
//!
//! Wires the pieces together: database, broadcast queue, hub event loop,
//! status scheduler and the websocket listener, with one cancellation
//! token driving graceful shutdown of every background loop.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use beacon_common::config::TomlConfig;
use beacon_common::db::{init_database, setting_i64};
use beacon_server::broadcast::{spawn_drain, BroadcastQueue};
use beacon_server::db::RecordStore;
use beacon_server::hub::{self, HubConfig};
use beacon_server::scheduler::{SchedulerConfig, StatusScheduler};
use beacon_server::ws::{self, AppState};

/// Command-line arguments for beacon-server
#[derive(Parser, Debug)]
#[command(name = "beacon-server")]
#[command(about = "Real-time record change notification and scheduling server")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "BEACON_PORT")]
    port: Option<u16>,

    /// Path of the sqlite database file (overrides the config file)
    #[arg(short, long, env = "BEACON_DB")]
    database: Option<PathBuf>,

    /// Optional TOML config file
    #[arg(short, long, env = "BEACON_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = TomlConfig::load(args.config.as_deref());

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let port = args.port.unwrap_or(config.port);
    let db_path = args.database.unwrap_or_else(|| config.database.clone());

    info!("Starting Beacon server on port {}", port);
    info!("Database: {}", db_path.display());

    let pool = init_database(&db_path)
        .await
        .context("Failed to initialize database")?;

    let hub_config = HubConfig::from_database(&pool).await;
    let login_attempts_per_min =
        setting_i64(&pool, "login_attempts_per_min", 10).await.max(1) as usize;
    let drain_idle =
        Duration::from_millis(setting_i64(&pool, "drain_idle_ms", 250).await.max(1) as u64);

    let queue = BroadcastQueue::new();
    let store = RecordStore::new(pool.clone(), queue.clone());

    let shutdown = CancellationToken::new();

    let (hub_handle, hub) = hub::channel();
    tokio::spawn(hub.run(shutdown.clone()));
    spawn_drain(queue.clone(), hub_handle.clone(), drain_idle, shutdown.clone());

    let scheduler = StatusScheduler::new(
        store.clone(),
        SchedulerConfig::from_database(&pool).await,
    );
    tokio::spawn(scheduler.run(shutdown.clone()));

    let state = AppState {
        hub: hub_handle,
        store,
        mailbox_capacity: hub_config.mailbox_capacity,
        login_attempts_per_min,
    };
    let app = ws::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Stop the hub, drain and scheduler loops
    shutdown.cancel();

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
