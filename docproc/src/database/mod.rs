//! SQLite persistence for the queue ordering and progress histories.

pub mod models;
pub mod repositories;

pub use repositories::{SqlxProgressStore, SqlxQueueStore};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::Result;

pub type DbPool = Pool<Sqlite>;

/// Connections opened by [`connect`] when the caller has no preference.
pub const DEFAULT_POOL_SIZE: u32 = 8;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const WAL_AUTOCHECKPOINT_PAGES: &str = "1000";

fn connect_options(database_url: &str) -> Result<SqliteConnectOptions> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true)
        .create_if_missing(true)
        .pragma("wal_autocheckpoint", WAL_AUTOCHECKPOINT_PAGES)
        .pragma("temp_store", "memory"))
}

/// Journal mode currently in effect, lowercased.
pub async fn journal_mode(pool: &DbPool) -> Result<String> {
    let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode").fetch_one(pool).await?;
    Ok(mode.to_lowercase())
}

/// Open the queue database and bring its schema up to date.
///
/// `database_url` is a sqlx SQLite URL such as `sqlite:docproc.db?mode=rwc`.
/// File databases run in WAL mode so progress writes do not block dequeues.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<DbPool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(connect_options(database_url)?)
        .await?;

    let mode = journal_mode(&pool).await?;
    if mode != "wal" && mode != "memory" {
        warn!(journal_mode = %mode, "Database is not in WAL mode");
    }

    migrate(&pool).await?;
    info!(max_connections, journal_mode = %mode, "Queue database ready");
    Ok(pool)
}

/// Apply pending migrations from `migrations/`.
pub async fn migrate(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
