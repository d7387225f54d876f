// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Database connection management with PRAGMA setup, WAL mode, and lifecycle.
//!
//! All writes are serialized through tokio-rusqlite's single background thread.
//! Query modules accept `&Database` and go through [`Database::connection`].
//! Do NOT create additional Connection instances for writes.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use tessera_config::model::StorageConfig;
use tessera_core::TesseraError;
use tracing::{debug, info};

/// Convert a tokio-rusqlite error into `TesseraError::Storage`.
pub fn map_tr_err(e: tokio_rusqlite::Error<rusqlite::Error>) -> TesseraError {
    storage_err(e)
}

/// Box any storage-side error into `TesseraError::Storage`.
pub fn storage_err<E>(e: E) -> TesseraError
where
    E: std::error::Error + Send + Sync + 'static,
{
    TesseraError::Storage {
        source: Box::new(e),
    }
}

/// Timestamp format stored in TEXT columns. Fixed width and UTC, so string
/// comparison in SQL orders the same as time.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp written by [`timestamp`].
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// Handle to the single SQLite connection. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    conn: tokio_rusqlite::Connection,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) the database at `path` in WAL mode and run migrations.
    pub async fn open(path: &str) -> Result<Self, TesseraError> {
        Self::open_with(path, true).await
    }

    /// Open using the `[storage]` config section.
    pub async fn from_config(config: &StorageConfig) -> Result<Self, TesseraError> {
        Self::open_with(&config.database_path, config.wal_mode).await
    }

    async fn open_with(path: &str, wal_mode: bool) -> Result<Self, TesseraError> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(storage_err)?;
            }
        }

        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(storage_err)?;

        conn.call(move |conn| {
            if wal_mode {
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            }
            conn.execute_batch(
                "PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;
                 PRAGMA foreign_keys = ON;",
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)?;

        conn.call(|conn| -> Result<(), TesseraError> { crate::migrations::run_migrations(conn) })
            .await
            .map_err(|e| match e {
                tokio_rusqlite::Error::Error(inner) => inner,
                other => storage_err(other),
            })?;

        info!(path, wal_mode, "database opened");
        Ok(Self { conn })
    }

    /// The underlying single-writer connection.
    pub fn connection(&self) -> &tokio_rusqlite::Connection {
        &self.conn
    }

    /// Truncate the WAL into the main database file.
    pub async fn checkpoint(&self) -> Result<(), TesseraError> {
        self.conn
            .call(|conn| -> Result<(), rusqlite::Error> {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close the connection.
    pub async fn close(self) -> Result<(), TesseraError> {
        self.checkpoint().await?;
        self.conn.close().await.map_err(storage_err)?;
        debug!("database closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_creates_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("tessera.db");
        let db = Database::open(path.to_str().unwrap()).await.unwrap();

        let tables: Vec<String> = db
            .connection()
            .call(|conn| -> Result<Vec<String>, rusqlite::Error> {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'refinery%' ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect()
            })
            .await
            .unwrap();
        assert_eq!(
            tables,
            vec![
                "address_allocator",
                "backup_store",
                "cold_store",
                "key_history",
                "overflow_queue",
                "pool_snapshots",
                "tombstones"
            ]
        );
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn reopen_skips_applied_migrations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tessera.db");
        let db = Database::open(path.to_str().unwrap()).await.unwrap();
        db.close().await.unwrap();
        let db = Database::open(path.to_str().unwrap()).await.unwrap();
        db.close().await.unwrap();
    }

    #[test]
    fn timestamps_round_trip_and_sort() {
        let early = Utc::now();
        let late = early + chrono::Duration::seconds(90);
        assert!(timestamp(early) < timestamp(late));
        let parsed = parse_timestamp(&timestamp(early)).unwrap();
        assert_eq!(parsed.timestamp_millis(), early.timestamp_millis());
    }
}
