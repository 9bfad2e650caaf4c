//! Database pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time, so all writes go through a
//! single-connection pool. That serialization is what makes the conditional
//! status updates in the repository race-free within one process; across
//! processes the `WHERE status = ...` guards do the same job.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if missing) the database and run migrations.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let read_opts = base_opts.clone().read_only(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base_opts)
            .await?;

        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(read_opts)
            .await?;

        tracing::debug!(database_url, "database pool ready");
        Ok(Self { reader, writer })
    }

    pub async fn close(&self) {
        self.reader.close().await;
        self.writer.close().await;
    }
}

/// `FLOWGATE_DATA_DIR`, else `~/.flowgate`.
pub fn default_data_dir() -> PathBuf {
    match std::env::var_os("FLOWGATE_DATA_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".flowgate"),
    }
}

/// `sqlite://<data_dir>/flowgate.db`.
pub fn default_database_url() -> String {
    format!("sqlite://{}", default_data_dir().join("flowgate.db").display())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> (tempfile::TempDir, DatabasePool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
    let pool = DatabasePool::new(&url).await.unwrap();
    (dir, pool)
}
