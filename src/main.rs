use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use bookings::config::Config;
use bookings::engine::Engine;
use bookings::http::{self, AppState};
use bookings::model::Room;
use bookings::repository::{RepoError, Repository};
use bookings::session::SessionStore;
use bookings::workflow::BookingWorkflow;
use bookings::{observability, reaper};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let engine = Arc::new(Engine::new(config.wal_path())?);
    seed_rooms(engine.as_ref(), &config.rooms).await?;

    let sessions = Arc::new(SessionStore::new(config.session_lifetime));
    tokio::spawn(reaper::run_session_reaper(
        sessions.clone(),
        Duration::from_secs(60),
    ));
    tokio::spawn(reaper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        Duration::from_secs(30),
    ));

    let workflow = Arc::new(BookingWorkflow::new(engine.clone()));
    let state = AppState::new(
        workflow,
        sessions,
        config.max_connections,
        config.in_production,
    );

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("bookings listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {}", config.max_connections);
    info!("  rooms: {}", config.rooms.len());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, let in-flight requests finish
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("bookings stopped");
    Ok(())
}

/// Create configured rooms that the WAL doesn't already know about.
async fn seed_rooms(repo: &dyn Repository, rooms: &[Room]) -> Result<(), RepoError> {
    for room in rooms {
        match repo.create_room(room.clone()).await {
            Ok(()) => info!("created room {} ({})", room.id, room.name),
            Err(RepoError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("cannot register SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received, draining requests");
}
