//! Relational store shared by every Imperium node.
//!
//! Wraps a pooled `SQLite` database. Units of work run inside an explicit
//! [`Handle`] (a transaction): committing ends the work, dropping the handle
//! on an error path rolls everything back. Nested operations borrow the
//! connection of the open handle (`&mut *handle`) instead of opening their
//! own, so they observe the writes of the enclosing unit of work.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, Transaction};
use tracing::{debug, info};

use crate::config::DatabaseConfig;

/// Store failures. Whatever the variant, the enclosing unit of work is
/// aborted and no partial write survives.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Query error: {0}")]
    Query(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

/// An open unit of work.
///
/// Commit with [`Transaction::commit`]; dropping it uncommitted rolls back.
pub type Handle = Transaction<'static, Sqlite>;

/// Pooled connection to the shared relational store.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Open the store described by `config`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        match (&config.path, config.memory) {
            (Some(path), false) => {
                Self::open(path, config.max_connections, config.busy_timeout()).await
            }
            _ => Self::open_in_memory().await,
        }
    }

    /// Open (or create) a file-backed store at `path`.
    ///
    /// Creates the parent directory if needed, enables WAL journaling,
    /// foreign keys and uncommitted reads.
    pub async fn open(
        path: &Path,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }

        let options =
            SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
                .map_err(|e| StoreError::Connection(e.to_string()))?
                .journal_mode(SqliteJournalMode::Wal)
                .foreign_keys(true)
                .pragma("read_uncommitted", "true")
                .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(path = %path.display(), max_connections, "Store opened");

        Ok(Self { pool })
    }

    /// Open a private in-memory store.
    ///
    /// Every `SQLite` memory connection is its own database, so the pool is
    /// pinned to a single connection that never expires.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        debug!("In-memory store opened");

        Ok(Self { pool })
    }

    /// Begin a unit of work.
    pub async fn begin(&self) -> Result<Handle, StoreError> {
        Ok(self.pool.begin().await?)
    }

    /// Begin a unit of work that takes the write lock up front.
    ///
    /// Use it when the work reads before it writes: a deferred transaction
    /// whose snapshot went stale cannot upgrade to a writer and fails with
    /// `SQLITE_BUSY_SNAPSHOT`, while `BEGIN IMMEDIATE` waits on the busy
    /// timeout instead.
    pub async fn begin_immediate(&self) -> Result<Handle, StoreError> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Apply an idempotent schema script in a single unit of work.
    pub async fn execute_script(&self, script: &str) -> Result<(), StoreError> {
        let mut handle = self.begin_immediate().await?;
        sqlx::raw_sql(script)
            .execute(&mut *handle)
            .await
            .map_err(|e| StoreError::Script(e.to_string()))?;
        handle.commit().await?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Close every pooled connection. Pending acquisitions fail afterwards.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Store closed");
    }
}

/// Returns the current time as a Unix timestamp (seconds since epoch).
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Returns the current time in microseconds since epoch.
#[allow(clippy::cast_possible_truncation)]
pub fn unix_timestamp_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use sqlx::SqliteConnection;

    use super::*;

    const SCRIPT: &str = "
        CREATE TABLE IF NOT EXISTS item (
            id      INTEGER PRIMARY KEY,
            name    TEXT    NOT NULL UNIQUE
        );
    ";

    async fn count_items(conn: &mut SqliteConnection) -> i64 {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM item")
            .fetch_one(conn)
            .await
            .unwrap();
        row.0
    }

    async fn store() -> Store {
        let store = Store::open_in_memory().await.unwrap();
        store.execute_script(SCRIPT).await.unwrap();
        store
    }

    #[tokio::test]
    async fn script_is_idempotent() {
        let store = store().await;
        store.execute_script(SCRIPT).await.unwrap();
        store.execute_script(SCRIPT).await.unwrap();
    }

    #[tokio::test]
    async fn broken_script_is_a_store_error() {
        let store = store().await;
        let err = store.execute_script("CREATE TABLEZ nope;").await.unwrap_err();
        assert!(matches!(err, StoreError::Script(_)));
    }

    #[tokio::test]
    async fn nested_work_sees_uncommitted_writes() {
        let store = store().await;
        let mut handle = store.begin().await.unwrap();
        sqlx::query("INSERT INTO item (name) VALUES ('a')")
            .execute(&mut *handle)
            .await
            .unwrap();

        assert_eq!(count_items(&mut handle).await, 1);
        handle.commit().await.unwrap();

        let mut conn = store.pool().acquire().await.unwrap();
        assert_eq!(count_items(&mut conn).await, 1);
    }

    #[tokio::test]
    async fn dropped_handle_rolls_back() {
        let store = store().await;
        {
            let mut handle = store.begin().await.unwrap();
            sqlx::query("INSERT INTO item (name) VALUES ('a')")
                .execute(&mut *handle)
                .await
                .unwrap();
        }

        let mut conn = store.pool().acquire().await.unwrap();
        assert_eq!(count_items(&mut conn).await, 0);
    }

    #[tokio::test]
    async fn constraint_failure_surfaces_as_query_error() {
        let store = store().await;
        let mut handle = store.begin().await.unwrap();
        sqlx::query("INSERT INTO item (name) VALUES ('a')")
            .execute(&mut *handle)
            .await
            .unwrap();
        let err: StoreError = sqlx::query("INSERT INTO item (name) VALUES ('a')")
            .execute(&mut *handle)
            .await
            .unwrap_err()
            .into();
        assert!(matches!(err, StoreError::Query(_)));
    }

    #[tokio::test]
    async fn file_store_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("imperium.db");
        let store = Store::open(&path, 2, Duration::from_secs(1)).await.unwrap();
        store.execute_script(SCRIPT).await.unwrap();
        assert!(path.exists());
        store.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn immediate_work_reads_then_writes_under_contention() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("imperium.db"), 8, Duration::from_secs(5))
            .await
            .unwrap();
        store.execute_script(SCRIPT).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.spawn(async move {
                let mut handle = store.begin_immediate().await?;
                let seen = count_items(&mut handle).await;
                sqlx::query("INSERT INTO item (name) VALUES (?)")
                    .bind(format!("item-{i}-after-{seen}"))
                    .execute(&mut *handle)
                    .await?;
                handle.commit().await?;
                Ok::<_, StoreError>(())
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        let mut conn = store.pool().acquire().await.unwrap();
        assert_eq!(count_items(&mut conn).await, 16);
        store.close().await;
    }

    #[test]
    fn timestamps_are_reasonable() {
        // Should be after 2024-01-01
        assert!(unix_timestamp() > 1_704_067_200);
        assert!(unix_timestamp_micros() > 1_704_067_200_000_000);
    }
}
