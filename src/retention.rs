use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{error, info};

use crate::db;

/// Start the daily retention task: purge flows older than the configured
/// age and dismissed threats with them.
pub fn start_retention_task(pool: SqlitePool, data_retention_days: u32) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(86_400));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // skip the immediate first tick
        loop {
            interval.tick().await;
            info!(days = data_retention_days, "retention: starting daily cleanup");
            match db::cleanup_old_data(&pool, data_retention_days).await {
                Ok(result) => {
                    if result.flows_deleted + result.threats_deleted > 0 {
                        info!(
                            flows = result.flows_deleted,
                            threats = result.threats_deleted,
                            "retention: cleanup completed"
                        );
                    }
                }
                Err(e) => {
                    error!("retention: cleanup failed: {e}");
                }
            }
        }
    });
}
