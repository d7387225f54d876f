// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Crash-safe hand-off of evicted fragments to the persistence collaborator.
//!
//! Every record is written to the SQLite retry queue before delivery is
//! attempted, so a crash or an offline collaborator never loses it. The
//! queue is keyed by fragment id and the collaborator `put` is an upsert,
//! which makes repeated delivery harmless.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tessera_config::model::OverflowConfig;
use tessera_core::types::{BlockAddress, FragmentId, FragmentMeta, ThinTag};
use tessera_core::{PersistenceAdapter, TesseraError};
use tessera_crypto::SealedBlock;
use tessera_storage::models::{QueueCounts, QueueStatus};
use tessera_storage::queries::queue;
use tessera_storage::Database;
use tracing::{debug, info, warn};

/// What the collaborator stores for one evicted fragment: the sealed
/// FatBlock plus its plaintext ThinTag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverflowRecord {
    pub fragment_id: FragmentId,
    pub address: BlockAddress,
    pub meta: FragmentMeta,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub thin: Option<ThinTag>,
    pub sealed: SealedBlock,
}

impl OverflowRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, TesseraError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TesseraError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Result of a single hand-off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandOff {
    /// The collaborator acknowledged the record.
    Delivered,
    /// Delivery failed; the record waits in the retry queue.
    Queued { error: String },
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub attempted: usize,
    /// Delivered records, now cold.
    pub delivered: Vec<(FragmentId, BlockAddress)>,
    pub failed: usize,
    /// Entries that exhausted their retries during this pass.
    pub abandoned: Vec<FragmentId>,
}

/// Owns the retry queue.
#[derive(Debug, Clone)]
pub struct OverflowManager {
    db: Database,
    config: OverflowConfig,
}

impl OverflowManager {
    pub fn new(db: Database, config: OverflowConfig) -> Self {
        Self { db, config }
    }

    /// Queue the record, then try to deliver it.
    pub async fn hand_off(
        &self,
        record: &OverflowRecord,
        collaborator: &dyn PersistenceAdapter,
        now: DateTime<Utc>,
    ) -> Result<HandOff, TesseraError> {
        let id = record.fragment_id.as_str();
        let payload = record.to_bytes()?;
        let queued = queue::upsert(
            &self.db,
            id,
            &record.address.to_string(),
            payload.clone(),
            self.config.max_retries,
            now,
        )
        .await;
        if let Err(e) = &queued {
            warn!(fragment_id = %id, error = %e, "retry queue write failed, delivering directly");
        }

        match collaborator.put(id, &payload).await {
            Ok(()) => {
                if queued.is_ok() {
                    queue::remove(&self.db, id).await?;
                }
                debug!(fragment_id = %id, address = %record.address, "overflow delivered");
                Ok(HandOff::Delivered)
            }
            Err(e) => {
                let error = e.to_string();
                if queued.is_err() {
                    return Err(TesseraError::StorageWriteFailed {
                        message: format!("fragment {id} could not be queued or delivered: {error}"),
                        source: Some(Box::new(e)),
                    });
                }
                queue::record_failure(&self.db, id, &error, now).await?;
                info!(fragment_id = %id, error = %error, "collaborator unavailable, overflow queued");
                Ok(HandOff::Queued { error })
            }
        }
    }

    /// Retry due entries. Entries that reach their retry limit are marked
    /// abandoned and logged once; they stay in the table and are never
    /// retried again.
    pub async fn drain_queue(
        &self,
        collaborator: &dyn PersistenceAdapter,
        now: DateTime<Utc>,
    ) -> Result<DrainReport, TesseraError> {
        let cooldown = Duration::try_seconds(i64::try_from(self.config.cooldown_secs).unwrap_or(i64::MAX))
            .unwrap_or(Duration::MAX);
        let due = queue::list_due(&self.db, now - cooldown).await?;
        let mut report = DrainReport::default();

        for entry in due {
            let fragment_id = FragmentId(entry.fragment_id.clone());
            if entry.retry_count >= entry.max_retries {
                self.abandon(&fragment_id, entry.retry_count, now).await?;
                report.abandoned.push(fragment_id);
                continue;
            }

            report.attempted += 1;
            match collaborator.put(&entry.fragment_id, &entry.payload).await {
                Ok(()) => {
                    queue::remove(&self.db, &entry.fragment_id).await?;
                    match entry.address.parse::<BlockAddress>() {
                        Ok(address) => report.delivered.push((fragment_id, address)),
                        Err(e) => warn!(fragment_id = %entry.fragment_id, error = %e, "queued entry has a bad address"),
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    let attempts = queue::record_failure(&self.db, &entry.fragment_id, &e.to_string(), now)
                        .await?
                        .unwrap_or(entry.retry_count + 1);
                    if attempts >= entry.max_retries {
                        self.abandon(&fragment_id, attempts, now).await?;
                        report.abandoned.push(fragment_id);
                    }
                }
            }
        }

        if report.attempted > 0 || !report.abandoned.is_empty() {
            info!(
                attempted = report.attempted,
                delivered = report.delivered.len(),
                failed = report.failed,
                abandoned = report.abandoned.len(),
                "drained overflow queue"
            );
        }
        Ok(report)
    }

    async fn abandon(
        &self,
        fragment_id: &FragmentId,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<(), TesseraError> {
        queue::mark_abandoned(&self.db, fragment_id.as_str(), now).await?;
        let error = TesseraError::OverflowAbandoned {
            fragment_id: fragment_id.to_string(),
            attempts,
        };
        warn!(fragment_id = %fragment_id, attempts, error = %error, "overflow entry abandoned");
        Ok(())
    }

    /// Records still held by the queue, pending or abandoned, for warm-start
    /// reload. Abandoned rows are never retried but stay retrievable.
    pub async fn queued_records(&self) -> Result<Vec<OverflowRecord>, TesseraError> {
        let mut entries = queue::list_by_status(&self.db, QueueStatus::Pending).await?;
        entries.extend(queue::list_by_status(&self.db, QueueStatus::Abandoned).await?);
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            match OverflowRecord::from_bytes(&entry.payload) {
                Ok(record) => records.push(record),
                Err(e) => warn!(fragment_id = %entry.fragment_id, error = %e, "skipping unreadable queue entry"),
            }
        }
        Ok(records)
    }

    /// Drop queue entries for cleared fragments.
    pub async fn forget(&self, ids: Vec<String>) -> Result<usize, TesseraError> {
        if ids.is_empty() {
            return Ok(0);
        }
        queue::remove_many(&self.db, ids).await
    }

    pub async fn counts(&self) -> Result<QueueCounts, TesseraError> {
        queue::counts(&self.db).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tessera_core::{AdapterType, HealthStatus, PluginAdapter};

    /// A collaborator that can be switched offline.
    #[derive(Default)]
    struct Flaky {
        offline: AtomicBool,
        puts: AtomicUsize,
        records: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl PluginAdapter for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        fn version(&self) -> semver::Version {
            semver::Version::new(0, 0, 0)
        }
        fn adapter_type(&self) -> AdapterType {
            AdapterType::Persistence
        }
        async fn health_check(&self) -> Result<HealthStatus, TesseraError> {
            Ok(HealthStatus::Healthy)
        }
        async fn shutdown(&self) -> Result<(), TesseraError> {
            Ok(())
        }
    }

    #[async_trait]
    impl PersistenceAdapter for Flaky {
        async fn put(&self, id: &str, payload: &[u8]) -> Result<(), TesseraError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(TesseraError::write_failed("offline"));
            }
            let mut records = self.records.lock().unwrap();
            records.retain(|(existing, _)| existing != id);
            records.push((id.to_string(), payload.to_vec()));
            Ok(())
        }

        async fn get_all(&self) -> Result<Vec<(String, Vec<u8>)>, TesseraError> {
            Ok(self.records.lock().unwrap().clone())
        }
    }

    fn record(id: &str) -> OverflowRecord {
        OverflowRecord {
            fragment_id: FragmentId::from(id),
            address: BlockAddress { block: 1, chunk: 1 },
            meta: FragmentMeta::new("claude", "s1"),
            created_at: Utc::now(),
            thin: None,
            sealed: SealedBlock {
                key_id: 1,
                nonce: vec![0; 12],
                ciphertext: vec![1, 2, 3],
            },
        }
    }

    async fn manager(max_retries: u32) -> (OverflowManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("t.db").to_str().unwrap())
            .await
            .unwrap();
        let config = OverflowConfig {
            max_retries,
            cooldown_secs: 0,
            ..OverflowConfig::default()
        };
        (OverflowManager::new(db, config), dir)
    }

    #[tokio::test]
    async fn online_hand_off_leaves_queue_empty() {
        let (manager, _dir) = manager(3).await;
        let store = Flaky::default();
        let outcome = manager.hand_off(&record("a"), &store, Utc::now()).await.unwrap();
        assert_eq!(outcome, HandOff::Delivered);
        assert_eq!(manager.counts().await.unwrap().pending, 0);
        assert_eq!(store.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn offline_hand_off_queues_then_drain_delivers_once() {
        let (manager, _dir) = manager(3).await;
        let store = Flaky::default();
        store.offline.store(true, Ordering::SeqCst);

        let now = Utc::now();
        let outcome = manager.hand_off(&record("a"), &store, now).await.unwrap();
        assert!(matches!(outcome, HandOff::Queued { .. }));
        assert_eq!(manager.counts().await.unwrap().pending, 1);

        store.offline.store(false, Ordering::SeqCst);
        let report = manager
            .drain_queue(&store, now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.delivered.len(), 1);
        assert_eq!(manager.counts().await.unwrap().pending, 0);
        assert_eq!(store.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn requeue_replaces_payload() {
        let (manager, _dir) = manager(3).await;
        let store = Flaky::default();
        store.offline.store(true, Ordering::SeqCst);
        let now = Utc::now();
        manager.hand_off(&record("a"), &store, now).await.unwrap();
        manager.hand_off(&record("a"), &store, now).await.unwrap();
        assert_eq!(manager.counts().await.unwrap().pending, 1);
        assert_eq!(manager.queued_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_entries_are_abandoned_and_kept() {
        let (manager, _dir) = manager(2).await;
        let store = Flaky::default();
        store.offline.store(true, Ordering::SeqCst);
        let now = Utc::now();

        manager.hand_off(&record("a"), &store, now).await.unwrap();
        let report = manager
            .drain_queue(&store, now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.abandoned, vec![FragmentId::from("a")]);

        let counts = manager.counts().await.unwrap();
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.abandoned, 1);

        // Abandoned entries are never retried.
        store.offline.store(false, Ordering::SeqCst);
        let puts = store.puts.load(Ordering::SeqCst);
        let report = manager
            .drain_queue(&store, now + Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(store.puts.load(Ordering::SeqCst), puts);
        let abandoned = queue::list_by_status(&manager.db, QueueStatus::Abandoned)
            .await
            .unwrap();
        assert_eq!(abandoned.len(), 1);

        // Still handed back for reload.
        let queued = manager.queued_records().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].fragment_id, FragmentId::from("a"));
    }

    #[tokio::test]
    async fn cooldown_defers_retry() {
        let (mut manager, _dir) = manager(3).await;
        manager.config.cooldown_secs = 60;
        let store = Flaky::default();
        store.offline.store(true, Ordering::SeqCst);
        let now = Utc::now();
        manager.hand_off(&record("a"), &store, now).await.unwrap();

        let report = manager
            .drain_queue(&store, now + Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(report.attempted, 0);
        let report = manager
            .drain_queue(&store, now + Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(report.attempted, 1);
    }
}
