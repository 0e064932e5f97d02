pub mod devices;
pub mod flows;
pub mod threats;

use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

/// Embedded migrations, applied in order against `schema_version`.
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (1, "initial schema", include_str!("migrations/001_init.sql")),
    (
        2,
        "device quality columns",
        include_str!("migrations/002_device_quality.sql"),
    ),
];

/// Number of retry attempts for transient write errors.
pub(crate) const WRITE_RETRIES: u32 = 3;

/// Exponential backoff for attempt n (1-based): 1s, 2s, 4s.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << (attempt - 1))
}

/// Initialize the SQLite database pool and run migrations.
///
/// The pool is capped at 5 connections; file-backed databases keep 2 warm.
/// Writes are serialized by SQLite's write lock; WAL mode lets readers
/// proceed concurrently with the single writer.
pub async fn init(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    // Connections are pinged on acquire and replaced when dead.
    let mut pool_options = SqlitePoolOptions::new()
        .max_connections(5)
        .test_before_acquire(true);
    if database_url != ":memory:" {
        // An in-memory database is private to its connection, so a warm
        // second connection would see an empty schema.
        pool_options = pool_options.min_connections(2);
    }
    let pool = pool_options.connect_with(options).await?;

    tune(&pool).await?;
    run_migrations(&pool).await?;
    info!("Database migrations applied");

    Ok(pool)
}

/// SQLite tuning for a small always-on host: WAL-friendly sync level, a
/// 32 MB page cache, in-memory temp tables and 256 MB of mmap.
async fn tune(pool: &SqlitePool) -> Result<()> {
    for pragma in [
        "PRAGMA synchronous=NORMAL",
        "PRAGMA cache_size=-32000",
        "PRAGMA temp_store=MEMORY",
        "PRAGMA mmap_size=268435456",
    ] {
        sqlx::query(pragma).execute(pool).await?;
    }
    Ok(())
}

/// Apply pending migrations in version order.
///
/// Running this twice is a no-op: applied versions are recorded in
/// `schema_version`, and a statement that adds an already-present column is
/// skipped so a partially-applied ALTER can be resumed safely.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (\
         version INTEGER PRIMARY KEY, \
         applied_at INTEGER NOT NULL, \
         description TEXT)",
    )
    .execute(pool)
    .await?;

    let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;
    let current = current.unwrap_or(0);

    for (version, description, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }

        for statement in sql.split(';') {
            let stmt = statement.trim();
            if stmt.is_empty() || stmt.starts_with("--") {
                continue;
            }
            if let Err(e) = sqlx::query(stmt).execute(pool).await {
                if is_duplicate_column(&e) {
                    debug!(version, "Skipping already-applied statement: {e}");
                    continue;
                }
                return Err(e.into());
            }
        }

        sqlx::query(
            "INSERT INTO schema_version (version, applied_at, description) VALUES (?, ?, ?)",
        )
        .bind(*version)
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(*description)
        .execute(pool)
        .await?;

        info!(version, description, "Applied migration");
    }

    Ok(())
}

fn is_duplicate_column(e: &sqlx::Error) -> bool {
    e.to_string().to_lowercase().contains("duplicate column name")
}

/// Counts of rows removed by one retention cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupResult {
    pub flows_deleted: u64,
    pub threats_deleted: u64,
    pub cutoff_ms: i64,
}

/// Delete flows older than `days` and dismissed threats older than `days`.
/// Idempotent: a second run over the same data deletes nothing.
pub async fn cleanup_old_data(pool: &SqlitePool, days: u32) -> Result<CleanupResult> {
    let cutoff_ms = chrono::Utc::now().timestamp_millis() - i64::from(days) * 86_400_000;

    let flows_deleted = sqlx::query("DELETE FROM flows WHERE timestamp < ?")
        .bind(cutoff_ms)
        .execute(pool)
        .await?
        .rows_affected();

    let threats_deleted =
        sqlx::query("DELETE FROM threats WHERE timestamp < ? AND dismissed = 1")
            .bind(cutoff_ms)
            .execute(pool)
            .await?
            .rows_affected();

    info!(
        flows_deleted,
        threats_deleted, days, "Retention cleanup completed"
    );

    Ok(CleanupResult {
        flows_deleted,
        threats_deleted,
        cutoff_ms,
    })
}

/// Aggregate counts and size information about the database.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_devices: i64,
    pub total_flows: i64,
    pub total_threats: i64,
    pub oldest_flow: Option<i64>,
    pub newest_flow: Option<i64>,
    pub database_size_bytes: i64,
}

pub async fn get_database_stats(pool: &SqlitePool) -> Result<DatabaseStats> {
    let total_devices: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices")
        .fetch_one(pool)
        .await?;
    let total_flows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM flows")
        .fetch_one(pool)
        .await?;
    let total_threats: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM threats")
        .fetch_one(pool)
        .await?;

    let range: (Option<i64>, Option<i64>) =
        sqlx::query_as("SELECT MIN(timestamp), MAX(timestamp) FROM flows")
            .fetch_one(pool)
            .await?;

    let database_size_bytes: i64 = sqlx::query_scalar(
        "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
    )
    .fetch_one(pool)
    .await?;

    Ok(DatabaseStats {
        total_devices,
        total_flows,
        total_threats,
        oldest_flow: range.0,
        newest_flow: range.1,
        database_size_bytes,
    })
}
