// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The explicit context object that owns every component of the pool.
//!
//! `MemoryContext` is not shared: the [`crate::service::MemoryService`] actor
//! owns it and serializes every command through it, so pool and index
//! mutations between two `.await` points are never interleaved.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use tessera_config::model::TesseraConfig;
use tessera_core::types::{
    BlockAddress, FatBlock, Fragment, FragmentId, FragmentMeta, SearchFilters, SearchHit, SessionId,
    Square, StatusReport, ThinTag,
};
use tessera_core::{PersistenceAdapter, TesseraError};
use tessera_crypto::crypto::NONCE_LEN;
use tessera_crypto::wrap::SALT_LEN;
use tessera_crypto::{KeyRing, KeyWrapper, SealedBlock, WrappedKey};
use tessera_router::message::{
    BackupRecord, ContentMessage, ContextDelivery, SearchRequest, SessionNotice, StorageNotice,
};
use tessera_router::{Envelope, ForkRouter, Inbound, Operation, Outbound, Priority, RecoveryStrategy, RoutingReport};
use tessera_storage::database::{parse_timestamp, timestamp};
use tessera_storage::models::{RecordTable, StoredKey};
use tessera_storage::queries::{allocator, keys as key_store, records, snapshots, tombstones};
use tessera_storage::{Database, SqlitePersistence};

use crate::index::{DualIndex, RetrieveSources};
use crate::overflow::{DrainReport, HandOff, OverflowManager, OverflowRecord};
use crate::pool::{PoolSnapshot, SlotPool};
use crate::progression::ProgressionEngine;

/// Associated data for sealed pool snapshots.
const SNAPSHOT_AAD: &str = "pool-snapshot";

/// Result of placing a fragment into the hot pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub fragment_id: FragmentId,
    pub address: BlockAddress,
    pub slot: u8,
    pub access_count: u64,
    /// An existing resident was replaced rather than added.
    pub replaced: bool,
    /// Fragments pushed out of the last slot by this placement.
    pub evicted: Vec<FragmentId>,
    /// Evictions the collaborator did not acknowledge; they wait in the retry queue.
    pub queued: usize,
}

/// Backup store body: the sealed router payload plus how to read it back.
#[derive(Debug, Serialize)]
struct BackupBody<'a> {
    compressed: bool,
    priority: Priority,
    sealed: &'a SealedBlock,
}

/// The part of a stored backup needed to keep its key.
#[derive(Debug, Deserialize)]
struct BackupKeyRef {
    sealed: SealedKeyRef,
}

#[derive(Debug, Deserialize)]
struct SealedKeyRef {
    key_id: u32,
}

pub struct MemoryContext {
    config: TesseraConfig,
    db: Database,
    keys: KeyRing,
    wrapper: Option<KeyWrapper>,
    engine: ProgressionEngine,
    pool: SlotPool,
    index: DualIndex,
    router: ForkRouter,
    overflow: OverflowManager,
    cold: Arc<dyn PersistenceAdapter>,
    backup: SqlitePersistence,
    broadcasts: broadcast::Sender<SessionNotice>,
    /// Key ids of blocks sealed outside the index.
    backup_keys: HashMap<FragmentId, u32>,
    snapshot_key: Option<u32>,
    /// Set after a regeneration until the next successful seal.
    regeneration_spent: bool,
}

impl std::fmt::Debug for MemoryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryContext")
            .field("hot_fragments", &self.pool.len())
            .field("thin_tags", &self.index.thin_len())
            .field("cold", &self.cold.name())
            .finish_non_exhaustive()
    }
}

impl MemoryContext {
    /// Open the pool, reading the key passphrase from the environment
    /// variable named by `crypto.passphrase_env`.
    pub async fn open(
        config: TesseraConfig,
        cold: Arc<dyn PersistenceAdapter>,
    ) -> Result<Self, TesseraError> {
        let passphrase = KeyWrapper::passphrase_from_env(&config.crypto);
        Self::open_with_passphrase(config, cold, passphrase).await
    }

    /// Open the pool and warm it from the last snapshot, the retry queue and
    /// the collaborator's records.
    pub async fn open_with_passphrase(
        config: TesseraConfig,
        cold: Arc<dyn PersistenceAdapter>,
        passphrase: Option<SecretString>,
    ) -> Result<Self, TesseraError> {
        let now = Utc::now();
        let db = Database::from_config(&config.storage).await?;
        let (keys, wrapper) = open_keys(&config, &db, passphrase, now).await?;

        let (broadcasts, _) = broadcast::channel(config.router.broadcast_capacity.max(1));
        let mut context = Self {
            engine: ProgressionEngine::new(&config.progression, config.index.chunks_per_block),
            pool: SlotPool::new(&config.pool),
            index: DualIndex::new(config.index.clone()),
            router: ForkRouter::new(config.router.clone()),
            overflow: OverflowManager::new(db.clone(), config.overflow.clone()),
            backup: SqlitePersistence::new(db.clone(), RecordTable::Backup),
            config,
            db,
            keys,
            wrapper,
            cold,
            broadcasts,
            backup_keys: HashMap::new(),
            snapshot_key: None,
            regeneration_spent: false,
        };
        if context.wrapper.is_some() {
            context.persist_current_key().await;
        }
        context.warm_start(now).await?;
        Ok(context)
    }

    async fn warm_start(&mut self, now: DateTime<Utc>) -> Result<(), TesseraError> {
        let cleared = tombstones::list(&self.db).await?;
        for tombstone in &cleared {
            match tombstone.address.parse::<BlockAddress>() {
                Ok(address) => {
                    self.index.tombstone(address);
                }
                Err(e) => warn!(address = %tombstone.address, error = %e, "skipping malformed tombstone"),
            }
        }

        let mut overflow = Vec::new();
        if let Some(row) = snapshots::load(&self.db).await? {
            match self.open_snapshot(&row.payload) {
                Ok((snapshot, key_id)) => {
                    self.snapshot_key = Some(key_id);
                    overflow = self.pool.restore(snapshot);
                }
                Err(e) => warn!(error = %e, taken_at = %row.taken_at, "pool snapshot unreadable, starting with an empty pool"),
            }
        }
        let stale: Vec<FragmentId> = self
            .pool
            .fragments()
            .filter(|f| self.index.is_cleared(f.address))
            .map(|f| f.id.clone())
            .collect();
        for id in &stale {
            self.pool.remove(id);
        }
        overflow.retain(|f| !self.index.is_cleared(f.address));

        for fragment in self.pool.fragments() {
            let block = FatBlock::from_fragment(fragment, fragment.last_promoted_at);
            self.index.write(&block, &self.keys)?;
        }
        for fragment in &overflow {
            self.index
                .write(&FatBlock::from_fragment(fragment, fragment.last_promoted_at), &self.keys)?;
        }

        for record in self.overflow.queued_records().await? {
            self.index.register_sealed(&record);
        }

        match self.cold.get_all().await {
            Ok(records) => {
                for (id, bytes) in records {
                    match OverflowRecord::from_bytes(&bytes) {
                        Ok(record) => self.index.register_cold(&record),
                        Err(e) => warn!(record_id = %id, error = %e, "skipping unreadable cold record"),
                    }
                }
            }
            Err(e) => warn!(collaborator = self.cold.name(), error = %e, "cold reload failed, continuing without cold records"),
        }

        match self.backup.get_all().await {
            Ok(rows) => {
                for (id, bytes) in rows {
                    if let Ok(body) = serde_json::from_slice::<BackupKeyRef>(&bytes) {
                        self.backup_keys.insert(FragmentId::from(id.as_str()), body.sealed.key_id);
                    }
                }
            }
            Err(e) => warn!(error = %e, "backup store unreadable, its keys are not pinned"),
        }

        if let Some(ordinal) = allocator::load(&self.db).await? {
            self.engine.resume_at(ordinal);
        }
        if let Some(max) = self.index.max_address() {
            self.engine.resume_after(max);
        }
        self.pin_referenced_keys();
        self.prune_key_store().await;

        let mut queued = 0;
        for fragment in overflow {
            if self.hand_off(fragment, now).await == Some(false) {
                queued += 1;
            }
        }

        info!(
            hot = self.pool.len(),
            thin = self.index.thin_len(),
            fat = self.index.fat_len(),
            cold = self.index.cold_len(),
            cleared = cleared.len(),
            queued,
            keys = self.keys.history_len() + 1,
            next_address = %self.engine.peek_address(),
            "memory pool ready"
        );
        Ok(())
    }

    fn open_snapshot(&self, payload: &[u8]) -> Result<(PoolSnapshot, u32), TesseraError> {
        let sealed = SealedBlock::from_bytes(payload)?;
        let plaintext = self.keys.decrypt_block(SNAPSHOT_AAD, &sealed)?;
        Ok((serde_json::from_slice(&plaintext)?, sealed.key_id))
    }

    pub fn config(&self) -> &TesseraConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Receive session broadcasts. Delivery is best-effort.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.broadcasts.subscribe()
    }

    /// Capture `text` as a new fragment and admit it to slot 1.
    pub async fn capture(&mut self, text: &str, meta: FragmentMeta) -> Result<Placement, TesseraError> {
        let now = Utc::now();
        let fragment = self.engine.capture(text, meta, now)?;
        self.place(fragment, now).await
    }

    /// Append an edit square. Evicted fragments are rehydrated first.
    pub async fn revise(&mut self, fragment_id: &FragmentId, text: &str) -> Result<Square, TesseraError> {
        let now = Utc::now();
        let mut fragment = self.checkout(fragment_id, now).await?;
        let square = self.engine.revise(&mut fragment, text, now)?;
        self.place(fragment, now).await?;
        Ok(square)
    }

    /// Compute Square 9 and return the resulting ThinTag. Finalizing twice
    /// returns the same tag content.
    pub async fn finalize(&mut self, fragment_id: &FragmentId) -> Result<ThinTag, TesseraError> {
        let now = Utc::now();
        let mut fragment = self.checkout(fragment_id, now).await?;
        self.engine.finalize(&mut fragment, now);
        let placement = self.place(fragment, now).await?;
        self.index
            .thin(placement.address)
            .cloned()
            .ok_or_else(|| TesseraError::Internal(format!("no thin tag after finalizing {fragment_id}")))
    }

    /// Admit an externally built fragment. Re-admitting a known id replaces
    /// its content and bumps its access count.
    pub async fn admit(&mut self, fragment: Fragment) -> Result<Placement, TesseraError> {
        let now = Utc::now();
        self.engine.resume_after(fragment.address);
        self.place(fragment, now).await
    }

    /// Count an access and promote the fragment one slot hotter.
    pub async fn touch(&mut self, fragment_id: &FragmentId) -> Result<Placement, TesseraError> {
        let now = Utc::now();
        if !self.pool.contains(fragment_id) {
            let mut fragment = self.checkout(fragment_id, now).await?;
            fragment.access_count += 1;
            return self.place(fragment, now).await;
        }

        self.maybe_rotate(now).await;
        let assignment = self.pool.touch(fragment_id, now)?;
        let address = self
            .pool
            .get(fragment_id)
            .map(|f| f.address)
            .ok_or_else(|| TesseraError::FragmentNotFound {
                fragment_id: fragment_id.to_string(),
            })?;
        let (evicted, queued) = self.hand_off_all(assignment.evicted, now).await;
        self.snapshot(now).await;
        Ok(Placement {
            fragment_id: assignment.fragment_id,
            address,
            slot: assignment.slot,
            access_count: assignment.access_count,
            replaced: false,
            evicted,
            queued,
        })
    }

    /// Rank ThinTags. Never decrypts, so it keeps working while the
    /// collaborator is offline.
    pub fn search(&self, query: &str, filters: &SearchFilters) -> Vec<SearchHit> {
        let pool = &self.pool;
        self.index.search(
            query,
            filters,
            |id| pool.slot_of(id),
            pool.max_slots(),
            Utc::now(),
        )
    }

    /// Search, then assemble the hits into a bounded context block.
    pub async fn context_for(
        &mut self,
        session_id: Option<SessionId>,
        query: &str,
        filters: &SearchFilters,
    ) -> Option<ContextDelivery> {
        let now = Utc::now();
        let hits = self.search(query, filters);
        if let Some(session) = &session_id {
            self.router.touch_session(session, now);
        }
        let report = self.router.route(
            Envelope::new(Inbound::Search(SearchRequest {
                session_id,
                query: query.to_string(),
                hits,
            })),
            now,
        );
        self.apply(report, now).await.into_iter().next()
    }

    /// Tiered retrieval with one recovery round on failure.
    pub async fn retrieve(&mut self, address: BlockAddress) -> Result<FatBlock, TesseraError> {
        let now = Utc::now();
        self.retrieve_block(address, now).await
    }

    async fn retrieve_block(
        &mut self,
        address: BlockAddress,
        now: DateTime<Utc>,
    ) -> Result<FatBlock, TesseraError> {
        let error = match self.retrieve_once(address, now).await {
            Ok(block) => return Ok(block),
            Err(e) => e,
        };

        let strategies = self
            .report_failure(Operation::Retrieve, None, Some(address), &error, now)
            .await;
        let attempts = strategies
            .iter()
            .map(|strategy| match strategy {
                RecoveryStrategy::CacheClearAndRetry => (1, 0),
                RecoveryStrategy::BackoffAndRetry {
                    attempts,
                    base_delay_ms,
                } => (*attempts, *base_delay_ms),
                RecoveryStrategy::StorageFallback | RecoveryStrategy::KeyRegeneration => (0, 0),
            })
            .max_by_key(|(attempts, _)| *attempts)
            .unwrap_or((0, 0));

        let (retries, base_delay_ms) = attempts;
        for attempt in 0..retries {
            if base_delay_ms > 0 {
                let delay = base_delay_ms.saturating_mul(1u64 << attempt.min(16));
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
            if let Ok(block) = self.retrieve_once(address, now).await {
                info!(%address, attempt = attempt + 1, "retrieve recovered");
                return Ok(block);
            }
        }
        Err(error)
    }

    async fn retrieve_once(
        &mut self,
        address: BlockAddress,
        now: DateTime<Utc>,
    ) -> Result<FatBlock, TesseraError> {
        let sources = RetrieveSources {
            hot: self.pool.by_address(address),
            keys: &self.keys,
            cold: Some(self.cold.as_ref()),
        };
        self.index.retrieve(address, sources, now).await
    }

    /// Bulk delete by provenance filter. Empty filters clear everything.
    /// Returns the number of fragments removed.
    pub async fn clear(&mut self, filters: &SearchFilters) -> Result<usize, TesseraError> {
        let now = Utc::now();
        let mut targets = self.index.matching(filters);
        for fragment in self.pool.fragments() {
            if filters.matches(&fragment.meta, fragment.created_at)
                && !targets.iter().any(|(_, id)| id == &fragment.id)
            {
                targets.push((fragment.address, fragment.id.clone()));
            }
        }

        // Tombstones go to disk first so a restart cannot resurrect anything
        // the collaborator or the queue still holds.
        let graves: Vec<(String, String)> = targets
            .iter()
            .map(|(address, id)| (address.to_string(), id.to_string()))
            .collect();
        tombstones::insert_many(&self.db, graves, now).await?;

        let mut ids = Vec::with_capacity(targets.len());
        for (address, id) in targets {
            self.pool.remove(&id);
            self.index.tombstone(address);
            if self.backup_keys.remove(&id).is_some() {
                records::delete(&self.db, RecordTable::Backup, id.as_str()).await?;
            }
            ids.push(id.to_string());
        }
        let removed = ids.len();
        let dropped = self.overflow.forget(ids).await?;
        self.snapshot(now).await;
        info!(removed, queue_entries = dropped, "cleared fragments");
        Ok(removed)
    }

    /// Retry queued hand-offs that are past their cooldown.
    pub async fn drain_queue(&mut self) -> Result<DrainReport, TesseraError> {
        let now = Utc::now();
        let report = match self.overflow.drain_queue(self.cold.as_ref(), now).await {
            Ok(report) => report,
            Err(e) => {
                self.report_failure(Operation::DrainQueue, None, None, &e, now).await;
                return Err(e);
            }
        };
        for (_, address) in &report.delivered {
            self.index.mark_cold(*address);
        }
        for fragment_id in &report.abandoned {
            let error = TesseraError::OverflowAbandoned {
                fragment_id: fragment_id.to_string(),
                attempts: self.config.overflow.max_retries,
            };
            self.report_failure(Operation::DrainQueue, Some(fragment_id.clone()), None, &error, now)
                .await;
        }
        Ok(report)
    }

    pub async fn status(&self) -> Result<StatusReport, TesseraError> {
        let counts = self.overflow.counts().await?;
        Ok(StatusReport {
            hot_fragments: self.pool.len(),
            slots: self.pool.stats(),
            thin_tags: self.index.thin_len(),
            fat_blocks: self.index.fat_len(),
            cold_blocks: self.index.cold_len(),
            queue_pending: counts.pending as u64,
            queue_abandoned: counts.abandoned as u64,
            active_key_id: self.keys.active_key_id(),
            key_history: self.keys.history_len(),
        })
    }

    /// Write a final snapshot and close the database.
    pub async fn shutdown(mut self) -> Result<(), TesseraError> {
        let now = Utc::now();
        self.snapshot(now).await;
        if let Err(e) = self.cold.shutdown().await {
            warn!(collaborator = self.cold.name(), error = %e, "collaborator shutdown failed");
        }
        self.db.close().await?;
        info!("memory pool shut down");
        Ok(())
    }

    /// A copy of the fragment for mutation, from the pool or rehydrated from
    /// the retrieve tiers.
    async fn checkout(&mut self, id: &FragmentId, now: DateTime<Utc>) -> Result<Fragment, TesseraError> {
        if let Some(fragment) = self.pool.get(id) {
            return Ok(fragment.clone());
        }
        let address = self
            .index
            .address_of(id)
            .ok_or_else(|| TesseraError::FragmentNotFound {
                fragment_id: id.to_string(),
            })?;
        let block = self.retrieve_block(address, now).await?;
        debug!(fragment_id = %id, %address, "rehydrated fragment");
        Ok(block.into_fragment(1, now))
    }

    /// Seal, admit, index, route and snapshot. The block is sealed before
    /// the pool moves, so a seal failure changes nothing.
    async fn place(&mut self, fragment: Fragment, now: DateTime<Utc>) -> Result<Placement, TesseraError> {
        self.maybe_rotate(now).await;
        self.advance_allocator(now).await;
        let session = fragment.meta.session_id.clone();
        let admission = self.pool.admission(fragment, now)?;
        let block = FatBlock::from_fragment(admission.fragment(), now);
        let prepared = match DualIndex::prepare(&block, &self.keys) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.report_failure(
                    Operation::IndexWrite,
                    Some(block.fragment_id.clone()),
                    Some(block.address),
                    &e,
                    now,
                )
                .await;
                return Err(e);
            }
        };
        self.regeneration_spent = false;

        if self.index.lift_tombstone(block.address) {
            if let Err(e) = tombstones::remove(&self.db, &block.address.to_string()).await {
                warn!(address = %block.address, error = %e, "failed to lift tombstone");
            }
        }
        let assignment = self.pool.admit_prepared(admission);
        self.index.commit(prepared);

        self.router.touch_session(&session, now);
        let content = ContentMessage {
            fragment_id: block.fragment_id.clone(),
            address: block.address,
            session_id: session,
            provider_tag: block.meta.provider_tag.clone(),
            text: block.revisions.latest().content.clone(),
            summary: block.revisions.canonical().map(|c| c.summary.clone()),
            block: serde_json::to_vec(&block)?,
        };
        let report = self
            .router
            .route(Envelope::new(Inbound::Content(content)), now);
        self.apply(report, now).await;

        let (evicted, queued) = self.hand_off_all(assignment.evicted, now).await;
        self.snapshot(now).await;

        Ok(Placement {
            fragment_id: assignment.fragment_id,
            address: block.address,
            slot: assignment.slot,
            access_count: assignment.access_count,
            replaced: assignment.replaced,
            evicted,
            queued,
        })
    }

    async fn hand_off_all(&mut self, evicted: Vec<Fragment>, now: DateTime<Utc>) -> (Vec<FragmentId>, usize) {
        let mut ids = Vec::with_capacity(evicted.len());
        let mut queued = 0;
        for fragment in evicted {
            ids.push(fragment.id.clone());
            if self.hand_off(fragment, now).await != Some(true) {
                queued += 1;
            }
        }
        (ids, queued)
    }

    /// Seal an evicted fragment and pass it to the overflow manager.
    /// `Some(true)` when delivered, `Some(false)` when queued, `None` when
    /// neither worked; the sealed copy stays in the index in every case.
    async fn hand_off(&mut self, fragment: Fragment, now: DateTime<Utc>) -> Option<bool> {
        let block = FatBlock::from_fragment(&fragment, now);
        let record = match self.seal_record(&block) {
            Ok(record) => record,
            Err(e) => {
                self.report_failure(Operation::HandOff, Some(block.fragment_id), Some(block.address), &e, now)
                    .await;
                return None;
            }
        };
        self.index.register_sealed(&record);

        match self.overflow.hand_off(&record, self.cold.as_ref(), now).await {
            Ok(HandOff::Delivered) => {
                self.index.mark_cold(record.address);
                Some(true)
            }
            Ok(HandOff::Queued { error }) => {
                debug!(fragment_id = %record.fragment_id, error = %error, "eviction queued");
                Some(false)
            }
            Err(e) => {
                self.report_failure(
                    Operation::HandOff,
                    Some(record.fragment_id.clone()),
                    Some(record.address),
                    &e,
                    now,
                )
                .await;
                None
            }
        }
    }

    fn seal_record(&self, block: &FatBlock) -> Result<OverflowRecord, TesseraError> {
        let plaintext = serde_json::to_vec(block)?;
        Ok(OverflowRecord {
            fragment_id: block.fragment_id.clone(),
            address: block.address,
            meta: block.meta.clone(),
            created_at: block.created_at,
            thin: block.thin_tag(),
            sealed: self.keys.encrypt_block(&block.address.to_string(), &plaintext)?,
        })
    }

    /// Persist the sealed pool state. Failures are reported, never raised;
    /// the hot pool itself is unaffected.
    async fn snapshot(&mut self, now: DateTime<Utc>) {
        if !self.config.pool.snapshot_on_change {
            return;
        }
        let snapshot = self.pool.snapshot();
        let fragments = u32::try_from(snapshot.fragments.len()).unwrap_or(u32::MAX);
        let key_id = self.keys.active_key_id();
        let sealed = serde_json::to_vec(&snapshot)
            .map_err(TesseraError::from)
            .and_then(|plaintext| self.keys.encrypt_block(SNAPSHOT_AAD, &plaintext))
            .and_then(|sealed| sealed.to_bytes());
        let result = match sealed {
            Ok(payload) => snapshots::save(&self.db, payload, fragments, now).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.snapshot_key = Some(key_id);
                debug!(fragments, key_id, "pool snapshot saved");
            }
            Err(e) => {
                warn!(error = %e, "pool snapshot failed");
                self.report_failure(Operation::Snapshot, None, None, &e, now).await;
            }
        }
    }

    async fn maybe_rotate(&mut self, now: DateTime<Utc>) {
        self.pin_referenced_keys();
        match self.keys.rotate_if_due(now) {
            Ok(Some(key_id)) => {
                info!(key_id, "session key rotated");
                self.persist_current_key().await;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "key rotation failed, keeping current key"),
        }
    }

    /// Record the next address ordinal so addresses survive restarts and
    /// clears without reuse.
    async fn advance_allocator(&self, now: DateTime<Utc>) {
        if let Err(e) = allocator::advance(&self.db, self.engine.next_ordinal(), now).await {
            warn!(error = %e, next_address = %self.engine.peek_address(), "failed to persist address allocator");
        }
    }

    /// Every key id a stored block still needs: sealed and cold index
    /// entries, queue rows, backups and the last snapshot.
    fn referenced_keys(&self) -> BTreeSet<u32> {
        let mut ids = self.index.referenced_key_ids();
        ids.extend(self.backup_keys.values().copied());
        ids.extend(self.snapshot_key);
        ids
    }

    fn pin_referenced_keys(&mut self) {
        let referenced = self.referenced_keys();
        let dropped = self.keys.pin(referenced);
        if dropped > 0 {
            debug!(dropped, "unreferenced keys left the history");
        }
    }

    async fn persist_current_key(&self) {
        let Some(wrapper) = &self.wrapper else {
            return;
        };
        let result = async {
            let wrapped = wrapper.wrap(self.keys.current())?;
            key_store::insert(
                &self.db,
                StoredKey {
                    key_id: wrapped.key_id,
                    salt: wrapped.salt.to_vec(),
                    nonce: wrapped.nonce.to_vec(),
                    wrapped_key: wrapped.ciphertext,
                    created_at: timestamp(wrapped.created_at),
                },
            )
            .await
        }
        .await;
        match result {
            Ok(()) => debug!(key_id = self.keys.active_key_id(), "session key persisted"),
            Err(e) => warn!(error = %e, "failed to persist session key"),
        }
        self.prune_key_store().await;
    }

    /// Delete stored keys the ring no longer holds.
    async fn prune_key_store(&self) {
        if self.wrapper.is_none() {
            return;
        }
        let keep: Vec<u32> = self.keys.keys().map(|k| k.id()).collect();
        match key_store::delete_except(&self.db, keep).await {
            Ok(0) => {}
            Ok(pruned) => debug!(pruned, "pruned stored keys"),
            Err(e) => warn!(error = %e, "failed to prune stored keys"),
        }
    }

    /// Dispatch router outputs. Context deliveries are returned to the caller.
    async fn apply(&mut self, report: RoutingReport, now: DateTime<Utc>) -> Vec<ContextDelivery> {
        for failure in &report.failures {
            warn!(fork = failure.fork, kind = %failure.kind, panicked = failure.panicked, error = %failure.message, "fork failed");
        }
        let mut deliveries = Vec::new();
        for output in report.outputs {
            match output {
                Outbound::ContextDelivery(delivery) => deliveries.push(delivery),
                Outbound::SessionBroadcast(notice) => {
                    let recipients = notice.recipients.len();
                    if self.broadcasts.send(notice).is_err() {
                        debug!(recipients, "no broadcast subscribers");
                    }
                }
                Outbound::Backup(record) => self.store_backup(record, now).await,
                Outbound::Recovery(action) => self.recover(&action.strategy, now).await,
            }
        }
        deliveries
    }

    async fn store_backup(&mut self, record: BackupRecord, now: DateTime<Utc>) {
        let body = self
            .keys
            .encrypt_block(&record.address.to_string(), &record.payload)
            .and_then(|sealed| {
                Ok(serde_json::to_vec(&BackupBody {
                    compressed: record.compressed,
                    priority: record.priority,
                    sealed: &sealed,
                })?)
            });
        let key_id = self.keys.active_key_id();
        let result = match body {
            Ok(bytes) => self.backup.put(record.fragment_id.as_str(), &bytes).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                debug!(fragment_id = %record.fragment_id, compressed = record.compressed, "backup written");
                self.backup_keys.insert(record.fragment_id, key_id);
            }
            Err(e) => {
                self.report_failure(
                    Operation::Backup,
                    Some(record.fragment_id),
                    Some(record.address),
                    &e,
                    now,
                )
                .await;
            }
        }
    }

    /// Route a failure to the recovery fork and act on its decision.
    async fn report_failure(
        &mut self,
        operation: Operation,
        fragment_id: Option<FragmentId>,
        address: Option<BlockAddress>,
        error: &TesseraError,
        now: DateTime<Utc>,
    ) -> Vec<RecoveryStrategy> {
        let notice = StorageNotice {
            operation,
            fragment_id,
            address,
            kind: error.kind(),
            message: error.to_string(),
        };
        let report = self.router.route(Envelope::new(Inbound::Storage(notice)), now);
        for failure in &report.failures {
            warn!(?operation, fork = failure.fork, error = %failure.message, "no recovery for failure");
        }
        let strategies: Vec<RecoveryStrategy> =
            report.recoveries().map(|action| action.strategy).collect();
        for strategy in &strategies {
            self.recover(strategy, now).await;
        }
        strategies
    }

    async fn recover(&mut self, strategy: &RecoveryStrategy, now: DateTime<Utc>) {
        match strategy {
            RecoveryStrategy::KeyRegeneration => self.regenerate_key(now).await,
            RecoveryStrategy::CacheClearAndRetry => self.index.clear_cache(),
            RecoveryStrategy::StorageFallback => {
                debug!("storage fallback: data stays on the local path")
            }
            RecoveryStrategy::BackoffAndRetry { attempts, .. } => {
                debug!(attempts, "backoff requested")
            }
        }
    }

    /// Replace the current key, but only when it cannot seal and reopen a
    /// fresh block, and at most once until a seal succeeds again. Retired
    /// keys that stored blocks reference stay in the ring.
    async fn regenerate_key(&mut self, now: DateTime<Utc>) {
        if self.keys.verify_current().is_ok() {
            debug!(key_id = self.keys.active_key_id(), "current key seals fine, not regenerating");
            return;
        }
        if self.regeneration_spent {
            warn!("key already regenerated for this failure, not regenerating again");
            return;
        }
        self.regeneration_spent = true;
        self.pin_referenced_keys();
        match self.keys.regenerate(now) {
            Ok(_) => self.persist_current_key().await,
            Err(e) => warn!(error = %e, "key regeneration failed"),
        }
    }
}

async fn open_keys(
    config: &TesseraConfig,
    db: &Database,
    passphrase: Option<SecretString>,
    now: DateTime<Utc>,
) -> Result<(KeyRing, Option<KeyWrapper>), TesseraError> {
    let Some(passphrase) = passphrase else {
        info!(
            env = %config.crypto.passphrase_env,
            "no key passphrase set, session keys live only in memory"
        );
        return Ok((KeyRing::generate(&config.crypto, now)?, None));
    };

    let stored = key_store::list(db).await?;
    let wrapped: Vec<WrappedKey> = stored.iter().filter_map(to_wrapped).collect();
    let wrapper = KeyWrapper::for_stored(&passphrase, &wrapped, &config.crypto)?;
    let restored = wrapper.unwrap_all(&wrapped);
    if !wrapped.is_empty() && restored.is_empty() {
        warn!("no stored key could be unwrapped, earlier sealed data is unreadable");
    }
    let ring = KeyRing::restore(restored, &config.crypto, now)?;
    Ok((ring, Some(wrapper)))
}

fn to_wrapped(row: &StoredKey) -> Option<WrappedKey> {
    let salt: [u8; SALT_LEN] = row.salt.as_slice().try_into().ok()?;
    let nonce: [u8; NONCE_LEN] = row.nonce.as_slice().try_into().ok()?;
    Some(WrappedKey {
        key_id: row.key_id,
        salt,
        nonce,
        ciphertext: row.wrapped_key.clone(),
        created_at: parse_timestamp(&row.created_at)?,
    })
}
