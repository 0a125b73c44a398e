use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

pub mod task;
pub mod upload;

/// Open the SQLite pool shared by the task store and the job queue.
pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    info!("Connecting to {}", database_url);
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10));

    SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
}
