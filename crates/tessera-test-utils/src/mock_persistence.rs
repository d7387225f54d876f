// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mock persistence collaborator for deterministic testing.
//!
//! `MockPersistence` implements `PersistenceAdapter` over an in-memory map.
//! It can be taken offline to exercise the retry queue: while offline every
//! `put` and `get_all` fails with `StorageWriteFailed` / `Storage`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use tessera_core::{AdapterType, HealthStatus, PersistenceAdapter, PluginAdapter, TesseraError};

/// An in-memory persistence collaborator for testing.
///
/// Records are kept in insertion-independent order; `put` upserts.
/// `put_calls()` counts every attempt, successful or not.
#[derive(Debug)]
pub struct MockPersistence {
    records: Mutex<HashMap<String, Vec<u8>>>,
    online: AtomicBool,
    puts: AtomicUsize,
}

impl MockPersistence {
    /// Create an empty, online collaborator.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            puts: AtomicUsize::new(0),
        }
    }

    /// Create a collaborator that starts offline.
    pub fn offline() -> Self {
        let mock = Self::new();
        mock.set_online(false);
        mock
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Number of `put` attempts, including rejected ones.
    pub fn put_calls(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Stored ids, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Seed a record without counting it as a put.
    pub async fn insert(&self, id: impl Into<String>, payload: Vec<u8>) {
        self.records.lock().await.insert(id.into(), payload);
    }
}

impl Default for MockPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PluginAdapter for MockPersistence {
    fn name(&self) -> &str {
        "mock-persistence"
    }

    fn version(&self) -> semver::Version {
        semver::Version::new(0, 1, 0)
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Persistence
    }

    async fn health_check(&self) -> Result<HealthStatus, TesseraError> {
        if self.is_online() {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy("mock persistence is offline".into()))
        }
    }

    async fn shutdown(&self) -> Result<(), TesseraError> {
        Ok(())
    }
}

#[async_trait]
impl PersistenceAdapter for MockPersistence {
    async fn put(&self, id: &str, payload: &[u8]) -> Result<(), TesseraError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if !self.is_online() {
            return Err(TesseraError::StorageWriteFailed {
                message: format!("mock persistence offline, dropped {id}"),
                source: None,
            });
        }
        self.records
            .lock()
            .await
            .insert(id.to_string(), payload.to_vec());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>, TesseraError> {
        if !self.is_online() {
            return Err(offline_read());
        }
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn get_all(&self) -> Result<Vec<(String, Vec<u8>)>, TesseraError> {
        if !self.is_online() {
            return Err(offline_read());
        }
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .map(|(id, payload)| (id.clone(), payload.clone()))
            .collect())
    }
}

fn offline_read() -> TesseraError {
    TesseraError::Storage {
        source: "mock persistence offline".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_upserts_by_id() {
        let mock = MockPersistence::new();
        mock.put("a", b"1").await.unwrap();
        mock.put("a", b"2").await.unwrap();
        assert_eq!(mock.len().await, 1);
        assert_eq!(mock.get("a").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(mock.put_calls(), 2);
    }

    #[tokio::test]
    async fn offline_rejects_writes_and_counts_them() {
        let mock = MockPersistence::offline();
        let err = mock.put("a", b"1").await.unwrap_err();
        assert_eq!(err.kind(), tessera_core::ErrorKind::StorageWriteFailed);
        assert!(mock.is_empty().await);
        assert_eq!(mock.put_calls(), 1);
        assert!(mock.get_all().await.is_err());

        mock.set_online(true);
        mock.put("a", b"1").await.unwrap();
        assert_eq!(mock.ids().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn health_follows_online_flag() {
        let mock = MockPersistence::new();
        assert_eq!(mock.health_check().await.unwrap(), HealthStatus::Healthy);
        mock.set_online(false);
        assert!(matches!(
            mock.health_check().await.unwrap(),
            HealthStatus::Unhealthy(_)
        ));
    }
}
