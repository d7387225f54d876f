// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persisted high-water mark of the address allocator.

use chrono::{DateTime, Utc};
use rusqlite::params;
use tessera_core::TesseraError;

use crate::database::{map_tr_err, timestamp, Database};

/// Raise the stored next ordinal to `next_ordinal`. A lower value never
/// replaces a higher one.
pub async fn advance(db: &Database, next_ordinal: u64, now: DateTime<Utc>) -> Result<(), TesseraError> {
    let next = i64::try_from(next_ordinal).unwrap_or(i64::MAX);
    let now = timestamp(now);
    db.connection()
        .call(move |conn| {
            conn.execute(
                "INSERT INTO address_allocator (id, next_ordinal, updated_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                     next_ordinal = MAX(next_ordinal, excluded.next_ordinal),
                     updated_at = excluded.updated_at",
                params![next, now],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// The stored next ordinal, if one was ever written.
pub async fn load(db: &Database) -> Result<Option<u64>, TesseraError> {
    let stored = db
        .connection()
        .call(|conn| {
            match conn.query_row(
                "SELECT next_ordinal FROM address_allocator WHERE id = 1",
                [],
                |row| row.get::<_, i64>(0),
            ) {
                Ok(next) => Ok(Some(next)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(map_tr_err)?;
    Ok(stored.and_then(|next| u64::try_from(next).ok()))
}
