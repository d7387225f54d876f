// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sealed slot pool snapshots. Only the latest snapshot is kept.

use chrono::{DateTime, Utc};
use rusqlite::params;
use tessera_core::TesseraError;

use crate::database::{map_tr_err, timestamp, Database};
use crate::models::PoolSnapshotRow;

/// Replace the stored snapshot.
pub async fn save(
    db: &Database,
    payload: Vec<u8>,
    fragments: u32,
    now: DateTime<Utc>,
) -> Result<(), TesseraError> {
    let now = timestamp(now);
    db.connection()
        .call(move |conn| {
            conn.execute(
                "INSERT INTO pool_snapshots (id, payload, fragments, taken_at) VALUES (1, ?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                     payload = excluded.payload,
                     fragments = excluded.fragments,
                     taken_at = excluded.taken_at",
                params![payload, fragments, now],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Load the stored snapshot, if any.
pub async fn load(db: &Database) -> Result<Option<PoolSnapshotRow>, TesseraError> {
    db.connection()
        .call(|conn| {
            let result = conn.query_row(
                "SELECT payload, fragments, taken_at FROM pool_snapshots WHERE id = 1",
                [],
                |row| {
                    Ok(PoolSnapshotRow {
                        payload: row.get(0)?,
                        fragments: row.get(1)?,
                        taken_at: row.get(2)?,
                    })
                },
            );
            match result {
                Ok(row) => Ok(Some(row)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(map_tr_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn latest_snapshot_wins() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db").to_str().unwrap())
            .await
            .unwrap();

        assert!(load(&db).await.unwrap().is_none());
        save(&db, b"first".to_vec(), 1, Utc::now()).await.unwrap();
        save(&db, b"second".to_vec(), 2, Utc::now()).await.unwrap();

        let row = load(&db).await.unwrap().unwrap();
        assert_eq!(row.payload, b"second");
        assert_eq!(row.fragments, 2);
        db.close().await.unwrap();
    }
}
