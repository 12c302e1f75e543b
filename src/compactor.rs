use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Background task that rewrites a tenant's WAL once enough records have
/// accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let records = engine.wal_records_since_compact().await;
        if records < threshold {
            debug!("compactor idle: {records}/{threshold} records");
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {records} records"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
