// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Row types for the storage tables. Timestamps are RFC 3339 strings as
//! written by [`crate::database::timestamp`].

use chrono::{DateTime, Utc};
use strum::{Display, EnumString};

use crate::database::parse_timestamp;

/// Status of an overflow queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for delivery or retry.
    Pending,
    /// Retry budget exhausted. Kept for manual export, never retried.
    Abandoned,
}

/// One row of `overflow_queue`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub fragment_id: String,
    pub address: String,
    pub payload: Vec<u8>,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_attempt_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl QueueEntry {
    pub fn last_attempt(&self) -> Option<DateTime<Utc>> {
        self.last_attempt_at.as_deref().and_then(parse_timestamp)
    }
}

/// Pending and abandoned entry counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub abandoned: usize,
}

/// Which record table a [`crate::SqlitePersistence`] writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RecordTable {
    /// `cold_store`: evicted fragments.
    Cold,
    /// `backup_store`: redundant copies from the backup fork.
    Backup,
}

impl RecordTable {
    pub(crate) fn table_name(self) -> &'static str {
        match self {
            RecordTable::Cold => "cold_store",
            RecordTable::Backup => "backup_store",
        }
    }
}

/// A row of `cold_store` or `backup_store`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: String,
    pub payload: Vec<u8>,
    pub stored_at: String,
}

/// The latest sealed pool snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSnapshotRow {
    pub payload: Vec<u8>,
    pub fragments: u32,
    pub taken_at: String,
}

/// A passphrase-wrapped session key.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredKey {
    pub key_id: u32,
    pub salt: Vec<u8>,
    pub nonce: Vec<u8>,
    pub wrapped_key: Vec<u8>,
    pub created_at: String,
}

/// A cleared address.
#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone {
    pub address: String,
    pub fragment_id: String,
    pub cleared_at: String,
}
