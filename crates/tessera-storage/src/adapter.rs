// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite implementation of the PersistenceAdapter trait.

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use tessera_core::{AdapterType, HealthStatus, PersistenceAdapter, PluginAdapter, TesseraError};

use crate::database::{map_tr_err, Database};
use crate::models::RecordTable;
use crate::queries::records;

/// SQLite-backed persistence collaborator.
///
/// Serves as the local cold store when no remote persistence process is
/// configured, as the backing store of `tessera store`, and as the backup
/// store for the backup fork.
#[derive(Debug, Clone)]
pub struct SqlitePersistence {
    db: Database,
    table: RecordTable,
}

impl SqlitePersistence {
    pub fn new(db: Database, table: RecordTable) -> Self {
        Self { db, table }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn table(&self) -> RecordTable {
        self.table
    }
}

#[async_trait]
impl PluginAdapter for SqlitePersistence {
    fn name(&self) -> &str {
        match self.table {
            RecordTable::Cold => "sqlite-cold",
            RecordTable::Backup => "sqlite-backup",
        }
    }

    fn version(&self) -> semver::Version {
        semver::Version::new(0, 1, 0)
    }

    fn adapter_type(&self) -> AdapterType {
        match self.table {
            RecordTable::Cold => AdapterType::Persistence,
            RecordTable::Backup => AdapterType::Backup,
        }
    }

    async fn health_check(&self) -> Result<HealthStatus, TesseraError> {
        self.db
            .connection()
            .call(|conn| -> Result<(), rusqlite::Error> {
                conn.execute_batch("SELECT 1;")?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)?;
        Ok(HealthStatus::Healthy)
    }

    async fn shutdown(&self) -> Result<(), TesseraError> {
        self.db.checkpoint().await?;
        debug!(table = %self.table, "shutdown: WAL checkpoint complete");
        Ok(())
    }
}

#[async_trait]
impl PersistenceAdapter for SqlitePersistence {
    async fn put(&self, id: &str, payload: &[u8]) -> Result<(), TesseraError> {
        records::put(&self.db, self.table, id, payload.to_vec(), Utc::now())
            .await
            .map_err(|e| TesseraError::StorageWriteFailed {
                message: format!("{} put failed for {id}", self.table),
                source: Some(Box::new(e)),
            })
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>, TesseraError> {
        Ok(records::get(&self.db, self.table, id)
            .await?
            .map(|record| record.payload))
    }

    async fn get_all(&self) -> Result<Vec<(String, Vec<u8>)>, TesseraError> {
        Ok(records::get_all(&self.db, self.table)
            .await?
            .into_iter()
            .map(|record| (record.id, record.payload))
            .collect())
    }
}
