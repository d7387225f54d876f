// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wrapped session key history.

use rusqlite::{params, params_from_iter};
use tessera_core::TesseraError;

use crate::database::{map_tr_err, Database};
use crate::models::StoredKey;

/// Insert a wrapped key. Existing ids are left untouched.
pub async fn insert(db: &Database, key: StoredKey) -> Result<(), TesseraError> {
    db.connection()
        .call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO key_history (key_id, salt, nonce, wrapped_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![key.key_id, key.salt, key.nonce, key.wrapped_key, key.created_at],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// All stored keys, ascending by id.
pub async fn list(db: &Database) -> Result<Vec<StoredKey>, TesseraError> {
    db.connection()
        .call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key_id, salt, nonce, wrapped_key, created_at
                 FROM key_history ORDER BY key_id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(StoredKey {
                    key_id: row.get(0)?,
                    salt: row.get(1)?,
                    nonce: row.get(2)?,
                    wrapped_key: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?;
            rows.collect()
        })
        .await
        .map_err(map_tr_err)
}

/// Delete every key whose id is not in `keep`. Returns the number deleted.
/// An empty `keep` deletes nothing.
pub async fn delete_except(db: &Database, keep: Vec<u32>) -> Result<usize, TesseraError> {
    if keep.is_empty() {
        return Ok(0);
    }
    db.connection()
        .call(move |conn| {
            let placeholders = vec!["?"; keep.len()].join(", ");
            let sql = format!("DELETE FROM key_history WHERE key_id NOT IN ({placeholders})");
            Ok(conn.execute(&sql, params_from_iter(keep.iter()))?)
        })
        .await
        .map_err(map_tr_err)
}
