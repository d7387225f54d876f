// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tombstones for cleared addresses.
//!
//! The persistence collaborator cannot delete, so records it still holds for
//! cleared fragments come back on every reload. A tombstone makes the pool
//! skip them.

use chrono::{DateTime, Utc};
use rusqlite::params;
use tessera_core::TesseraError;

use crate::database::{map_tr_err, timestamp, Database};
use crate::models::Tombstone;

/// Record `(address, fragment_id)` pairs as cleared, in one transaction.
pub async fn insert_many(
    db: &Database,
    entries: Vec<(String, String)>,
    now: DateTime<Utc>,
) -> Result<usize, TesseraError> {
    if entries.is_empty() {
        return Ok(0);
    }
    let now = timestamp(now);
    db.connection()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO tombstones (address, fragment_id, cleared_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(address) DO UPDATE SET
                         fragment_id = excluded.fragment_id,
                         cleared_at = excluded.cleared_at",
                )?;
                for (address, fragment_id) in &entries {
                    inserted += stmt.execute(params![address, fragment_id, now])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
        .map_err(map_tr_err)
}

/// Every tombstone, ordered by address.
pub async fn list(db: &Database) -> Result<Vec<Tombstone>, TesseraError> {
    db.connection()
        .call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT address, fragment_id, cleared_at FROM tombstones ORDER BY address ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(Tombstone {
                    address: row.get(0)?,
                    fragment_id: row.get(1)?,
                    cleared_at: row.get(2)?,
                })
            })?;
            rows.collect()
        })
        .await
        .map_err(map_tr_err)
}

/// Lift the tombstone at `address` when a fragment is written there again.
pub async fn remove(db: &Database, address: &str) -> Result<bool, TesseraError> {
    let address = address.to_string();
    db.connection()
        .call(move |conn| {
            Ok(conn.execute("DELETE FROM tombstones WHERE address = ?1", params![address])? > 0)
        })
        .await
        .map_err(map_tr_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn insert_list_and_lift() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db").to_str().unwrap())
            .await
            .unwrap();

        let entries = vec![
            ("0001.002".to_string(), "frag-b".to_string()),
            ("0001.001".to_string(), "frag-a".to_string()),
        ];
        assert_eq!(insert_many(&db, entries.clone(), Utc::now()).await.unwrap(), 2);
        // Clearing the same address twice keeps one row.
        insert_many(&db, entries, Utc::now()).await.unwrap();

        let stones = list(&db).await.unwrap();
        assert_eq!(stones.len(), 2);
        assert_eq!(stones[0].address, "0001.001");
        assert_eq!(stones[0].fragment_id, "frag-a");

        assert!(remove(&db, "0001.001").await.unwrap());
        assert!(!remove(&db, "0001.001").await.unwrap());
        assert_eq!(list(&db).await.unwrap().len(), 1);
        assert_eq!(insert_many(&db, Vec::new(), Utc::now()).await.unwrap(), 0);
        db.close().await.unwrap();
    }
}
