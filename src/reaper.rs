use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::session::SessionStore;

/// Background task that periodically drops expired sessions.
pub async fn run_session_reaper(sessions: Arc<SessionStore>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let purged = sessions.purge_expired();
        if purged > 0 {
            info!("reaped {purged} expired sessions");
        }
        metrics::gauge!(crate::observability::SESSIONS_ACTIVE).set(sessions.len() as f64);
    }
}

/// Background task that compacts the WAL once `threshold` appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compaction not due: {appends}/{threshold} appends");
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}
