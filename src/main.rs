use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};

use reviewpool::api;
use reviewpool::config::{Config, StorageKind};
use reviewpool::storage::{MemoryStorage, SqliteStorage, Storage};
use reviewpool::{AppState, ReviewService};

/// Resolves when the process receives Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting review assignment service");

    let config =
        Config::from_env().expect("Failed to load configuration from environment variables");

    let storage: Arc<dyn Storage> = match config.storage {
        StorageKind::Sqlite => {
            let db_path = config.state_dir.join("reviewpool.db");
            info!("Using state database: {}", db_path.display());
            Arc::new(SqliteStorage::new(&db_path).expect("Failed to initialize SQLite database"))
        }
        StorageKind::Memory => {
            info!("Using in-memory storage; state is lost on restart");
            Arc::new(MemoryStorage::new())
        }
    };

    let app_state = Arc::new(AppState {
        service: ReviewService::new(storage),
    });

    let app = api::router(app_state).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    });

    tokio::select! {
        result = &mut server => {
            // The server exited on its own, which only happens on error.
            result??;
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal. Shutting down HTTP server...");
            let drain = Duration::from_secs(config.shutdown_timeout_secs);
            match tokio::time::timeout(drain, &mut server).await {
                Ok(result) => {
                    result??;
                    info!("HTTP server stopped");
                }
                Err(_) => {
                    warn!(
                        "In-flight requests did not finish within {}s; aborting",
                        config.shutdown_timeout_secs
                    );
                    server.abort();
                }
            }
        }
    }

    Ok(())
}
