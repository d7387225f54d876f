// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Crash-safe overflow retry queue.
//!
//! Entries are keyed by fragment id. An entry is written before delivery is
//! attempted and removed only after the collaborator acknowledges it, so a
//! crash between the two leaves the fragment queued rather than lost.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use tessera_core::TesseraError;

use crate::database::{map_tr_err, timestamp, Database};
use crate::models::{QueueCounts, QueueEntry, QueueStatus};

const COLUMNS: &str = "fragment_id, address, payload, status, retry_count, max_retries,
                       last_attempt_at, last_error, created_at, updated_at";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let status: String = row.get(3)?;
    let status = QueueStatus::from_str(&status).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(QueueEntry {
        fragment_id: row.get(0)?,
        address: row.get(1)?,
        payload: row.get(2)?,
        status,
        retry_count: row.get(4)?,
        max_retries: row.get(5)?,
        last_attempt_at: row.get(6)?,
        last_error: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

/// Insert or replace the entry for `fragment_id`.
///
/// Re-queueing replaces the payload and resets the entry to a fresh pending
/// state; `created_at` of the original entry is kept.
pub async fn upsert(
    db: &Database,
    fragment_id: &str,
    address: &str,
    payload: Vec<u8>,
    max_retries: u32,
    now: DateTime<Utc>,
) -> Result<(), TesseraError> {
    let fragment_id = fragment_id.to_string();
    let address = address.to_string();
    let now = timestamp(now);
    db.connection()
        .call(move |conn| {
            conn.execute(
                "INSERT INTO overflow_queue
                     (fragment_id, address, payload, status, retry_count, max_retries,
                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?5)
                 ON CONFLICT(fragment_id) DO UPDATE SET
                     address = excluded.address,
                     payload = excluded.payload,
                     status = 'pending',
                     retry_count = 0,
                     max_retries = excluded.max_retries,
                     last_attempt_at = NULL,
                     last_error = NULL,
                     updated_at = excluded.updated_at",
                params![fragment_id, address, payload, max_retries, now],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Get one entry by fragment id.
pub async fn get(db: &Database, fragment_id: &str) -> Result<Option<QueueEntry>, TesseraError> {
    let fragment_id = fragment_id.to_string();
    db.connection()
        .call(move |conn| {
            let sql = format!("SELECT {COLUMNS} FROM overflow_queue WHERE fragment_id = ?1");
            match conn.query_row(&sql, params![fragment_id], entry_from_row) {
                Ok(entry) => Ok(Some(entry)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(map_tr_err)
}

/// Pending entries that have never been attempted or whose last attempt is at
/// or before `cutoff`, oldest first.
pub async fn list_due(db: &Database, cutoff: DateTime<Utc>) -> Result<Vec<QueueEntry>, TesseraError> {
    let cutoff = timestamp(cutoff);
    db.connection()
        .call(move |conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM overflow_queue
                 WHERE status = 'pending'
                   AND (last_attempt_at IS NULL OR last_attempt_at <= ?1)
                 ORDER BY created_at ASC, fragment_id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![cutoff], entry_from_row)?;
            rows.collect()
        })
        .await
        .map_err(map_tr_err)
}

/// Every entry with the given status, oldest first.
pub async fn list_by_status(
    db: &Database,
    status: QueueStatus,
) -> Result<Vec<QueueEntry>, TesseraError> {
    let status = status.to_string();
    db.connection()
        .call(move |conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM overflow_queue WHERE status = ?1
                 ORDER BY created_at ASC, fragment_id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![status], entry_from_row)?;
            rows.collect()
        })
        .await
        .map_err(map_tr_err)
}

/// Record a failed delivery attempt. Returns the new retry count, or `None`
/// if the entry no longer exists.
pub async fn record_failure(
    db: &Database,
    fragment_id: &str,
    error: &str,
    now: DateTime<Utc>,
) -> Result<Option<u32>, TesseraError> {
    let fragment_id = fragment_id.to_string();
    let error = error.to_string();
    let now = timestamp(now);
    db.connection()
        .call(move |conn| {
            let changed = conn.execute(
                "UPDATE overflow_queue
                 SET retry_count = retry_count + 1,
                     last_attempt_at = ?2,
                     last_error = ?3,
                     updated_at = ?2
                 WHERE fragment_id = ?1",
                params![fragment_id, now, error],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let count: u32 = conn.query_row(
                "SELECT retry_count FROM overflow_queue WHERE fragment_id = ?1",
                params![fragment_id],
                |row| row.get(0),
            )?;
            Ok(Some(count))
        })
        .await
        .map_err(map_tr_err)
}

/// Mark an entry abandoned. It stays in the table and is never retried.
pub async fn mark_abandoned(
    db: &Database,
    fragment_id: &str,
    now: DateTime<Utc>,
) -> Result<(), TesseraError> {
    let fragment_id = fragment_id.to_string();
    let now = timestamp(now);
    db.connection()
        .call(move |conn| {
            conn.execute(
                "UPDATE overflow_queue SET status = 'abandoned', updated_at = ?2
                 WHERE fragment_id = ?1",
                params![fragment_id, now],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Remove an entry after acknowledged delivery. Returns whether a row was removed.
pub async fn remove(db: &Database, fragment_id: &str) -> Result<bool, TesseraError> {
    let fragment_id = fragment_id.to_string();
    db.connection()
        .call(move |conn| {
            let changed = conn.execute(
                "DELETE FROM overflow_queue WHERE fragment_id = ?1",
                params![fragment_id],
            )?;
            Ok(changed > 0)
        })
        .await
        .map_err(map_tr_err)
}

/// Remove every entry for the given fragments in one transaction.
pub async fn remove_many(db: &Database, fragment_ids: Vec<String>) -> Result<usize, TesseraError> {
    db.connection()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            {
                let mut stmt = tx.prepare("DELETE FROM overflow_queue WHERE fragment_id = ?1")?;
                for id in &fragment_ids {
                    removed += stmt.execute(params![id])?;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
        .map_err(map_tr_err)
}

/// Count pending and abandoned entries.
pub async fn counts(db: &Database) -> Result<QueueCounts, TesseraError> {
    db.connection()
        .call(|conn| {
            let (pending, abandoned): (i64, i64) = conn.query_row(
                "SELECT
                     COALESCE(SUM(status = 'pending'), 0),
                     COALESCE(SUM(status = 'abandoned'), 0)
                 FROM overflow_queue",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(QueueCounts {
                pending: pending as usize,
                abandoned: abandoned as usize,
            })
        })
        .await
        .map_err(map_tr_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    async fn setup_db() -> (Database, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();
        (db, dir)
    }

    #[tokio::test]
    async fn upsert_and_get_lifecycle() {
        let (db, _dir) = setup_db().await;
        let now = Utc::now();

        upsert(&db, "frag-1", "0001.001", b"sealed".to_vec(), 5, now).await.unwrap();
        let entry = get(&db, "frag-1").await.unwrap().unwrap();
        assert_eq!(entry.address, "0001.001");
        assert_eq!(entry.payload, b"sealed");
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.retry_count, 0);
        assert!(entry.last_attempt().is_none());

        assert!(get(&db, "missing").await.unwrap().is_none());
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn upsert_replaces_payload_without_duplicating() {
        let (db, _dir) = setup_db().await;
        let now = Utc::now();

        upsert(&db, "frag-1", "0001.001", b"v1".to_vec(), 5, now).await.unwrap();
        record_failure(&db, "frag-1", "offline", now).await.unwrap();
        upsert(&db, "frag-1", "0001.001", b"v2".to_vec(), 5, now).await.unwrap();

        let entry = get(&db, "frag-1").await.unwrap().unwrap();
        assert_eq!(entry.payload, b"v2");
        assert_eq!(entry.retry_count, 0);
        assert_eq!(counts(&db).await.unwrap().pending, 1);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn list_due_honors_cooldown() {
        let (db, _dir) = setup_db().await;
        let t0 = Utc::now();

        upsert(&db, "fresh", "0001.001", vec![1], 5, t0).await.unwrap();
        upsert(&db, "failed", "0001.002", vec![2], 5, t0).await.unwrap();
        record_failure(&db, "failed", "offline", t0).await.unwrap();

        let due_now = list_due(&db, t0 - Duration::seconds(30)).await.unwrap();
        assert_eq!(due_now.len(), 1);
        assert_eq!(due_now[0].fragment_id, "fresh");

        let due_later = list_due(&db, t0 + Duration::seconds(1)).await.unwrap();
        assert_eq!(due_later.len(), 2);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn record_failure_increments_retry_count() {
        let (db, _dir) = setup_db().await;
        let now = Utc::now();
        upsert(&db, "frag", "0001.001", vec![], 3, now).await.unwrap();

        assert_eq!(record_failure(&db, "frag", "e1", now).await.unwrap(), Some(1));
        assert_eq!(record_failure(&db, "frag", "e2", now).await.unwrap(), Some(2));
        assert_eq!(record_failure(&db, "gone", "e", now).await.unwrap(), None);

        let entry = get(&db, "frag").await.unwrap().unwrap();
        assert_eq!(entry.last_error.as_deref(), Some("e2"));
        assert!(entry.last_attempt().is_some());
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_entries_are_kept_but_never_due() {
        let (db, _dir) = setup_db().await;
        let now = Utc::now();
        upsert(&db, "frag", "0001.001", vec![9], 1, now).await.unwrap();
        mark_abandoned(&db, "frag", now).await.unwrap();

        assert!(list_due(&db, now + Duration::days(1)).await.unwrap().is_empty());
        let abandoned = list_by_status(&db, QueueStatus::Abandoned).await.unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(
            counts(&db).await.unwrap(),
            QueueCounts {
                pending: 0,
                abandoned: 1
            }
        );
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn remove_and_remove_many() {
        let (db, _dir) = setup_db().await;
        let now = Utc::now();
        for id in ["a", "b", "c"] {
            upsert(&db, id, "0001.001", vec![], 5, now).await.unwrap();
        }
        assert!(remove(&db, "a").await.unwrap());
        assert!(!remove(&db, "a").await.unwrap());
        let removed = remove_many(&db, vec!["b".into(), "c".into(), "zzz".into()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(counts(&db).await.unwrap(), QueueCounts::default());
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_upserts_no_sqlite_busy() {
        let (db, _dir) = setup_db().await;
        let now = Utc::now();

        let mut handles = Vec::new();
        for i in 0..10 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                upsert(&db, &format!("frag-{i}"), "0001.001", vec![i as u8], 5, now).await
            }));
        }
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(result.is_ok(), "concurrent write failed: {result:?}");
        }
        assert_eq!(counts(&db).await.unwrap().pending, 10);
        db.close().await.unwrap();
    }
}
