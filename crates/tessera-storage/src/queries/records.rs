// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Upsert-keyed record tables (`cold_store`, `backup_store`).

use chrono::{DateTime, Utc};
use rusqlite::params;
use tessera_core::TesseraError;

use crate::database::{map_tr_err, timestamp, Database};
use crate::models::{RecordTable, StoredRecord};

/// Insert or replace the record for `id`.
pub async fn put(
    db: &Database,
    table: RecordTable,
    id: &str,
    payload: Vec<u8>,
    now: DateTime<Utc>,
) -> Result<(), TesseraError> {
    let id = id.to_string();
    let now = timestamp(now);
    db.connection()
        .call(move |conn| {
            let sql = format!(
                "INSERT INTO {} (id, payload, stored_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, stored_at = excluded.stored_at",
                table.table_name()
            );
            conn.execute(&sql, params![id, payload, now])?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Get a record by id.
pub async fn get(
    db: &Database,
    table: RecordTable,
    id: &str,
) -> Result<Option<StoredRecord>, TesseraError> {
    let id = id.to_string();
    db.connection()
        .call(move |conn| {
            let sql = format!(
                "SELECT id, payload, stored_at FROM {} WHERE id = ?1",
                table.table_name()
            );
            let result = conn.query_row(&sql, params![id], |row| {
                Ok(StoredRecord {
                    id: row.get(0)?,
                    payload: row.get(1)?,
                    stored_at: row.get(2)?,
                })
            });
            match result {
                Ok(record) => Ok(Some(record)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(map_tr_err)
}

/// Every record in the table, ordered by id.
pub async fn get_all(db: &Database, table: RecordTable) -> Result<Vec<StoredRecord>, TesseraError> {
    db.connection()
        .call(move |conn| {
            let sql = format!(
                "SELECT id, payload, stored_at FROM {} ORDER BY id ASC",
                table.table_name()
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| {
                Ok(StoredRecord {
                    id: row.get(0)?,
                    payload: row.get(1)?,
                    stored_at: row.get(2)?,
                })
            })?;
            rows.collect()
        })
        .await
        .map_err(map_tr_err)
}

/// Delete a record. Returns whether it existed.
pub async fn delete(db: &Database, table: RecordTable, id: &str) -> Result<bool, TesseraError> {
    let id = id.to_string();
    db.connection()
        .call(move |conn| {
            let sql = format!("DELETE FROM {} WHERE id = ?1", table.table_name());
            Ok(conn.execute(&sql, params![id])? > 0)
        })
        .await
        .map_err(map_tr_err)
}

/// Number of records in the table.
pub async fn count(db: &Database, table: RecordTable) -> Result<usize, TesseraError> {
    db.connection()
        .call(move |conn| {
            let sql = format!("SELECT COUNT(*) FROM {}", table.table_name());
            let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(n as usize)
        })
        .await
        .map_err(map_tr_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup_db() -> (Database, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db").to_str().unwrap())
            .await
            .unwrap();
        (db, dir)
    }

    #[tokio::test]
    async fn put_is_an_upsert() {
        let (db, _dir) = setup_db().await;
        let now = Utc::now();
        put(&db, RecordTable::Cold, "frag", b"one".to_vec(), now).await.unwrap();
        put(&db, RecordTable::Cold, "frag", b"two".to_vec(), now).await.unwrap();

        assert_eq!(count(&db, RecordTable::Cold).await.unwrap(), 1);
        let record = get(&db, RecordTable::Cold, "frag").await.unwrap().unwrap();
        assert_eq!(record.payload, b"two");
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn tables_are_independent() {
        let (db, _dir) = setup_db().await;
        let now = Utc::now();
        put(&db, RecordTable::Backup, "frag", vec![1], now).await.unwrap();

        assert!(get(&db, RecordTable::Cold, "frag").await.unwrap().is_none());
        assert_eq!(get_all(&db, RecordTable::Backup).await.unwrap().len(), 1);
        assert!(delete(&db, RecordTable::Backup, "frag").await.unwrap());
        assert!(!delete(&db, RecordTable::Backup, "frag").await.unwrap());
        db.close().await.unwrap();
    }
}
