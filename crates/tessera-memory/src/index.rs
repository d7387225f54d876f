// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Paired fat/thin storage.
//!
//! The fat side maps a `block.chunk` address to a sealed FatBlock (or to a
//! marker saying the block now lives cold). The thin side maps the same
//! address to the plaintext ThinTag derived from Square 9. A write is sealed
//! in [`DualIndex::prepare`] before anything is touched, so a failed seal
//! leaves the pair (and the caller's pool) unchanged.
//!
//! Cleared addresses are remembered as tombstones so reloaded queue rows and
//! cold records cannot bring them back.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tessera_config::model::IndexConfig;
use tessera_core::types::{
    BlockAddress, FatBlock, Fragment, FragmentId, FragmentMeta, SearchFilters, SearchHit, ThinTag,
};
use tessera_core::{PersistenceAdapter, TesseraError};
use tessera_crypto::{KeyRing, SealedBlock};
use tracing::{debug, warn};

use crate::overflow::OverflowRecord;
use crate::scoring::{query_terms, Scorer};

/// Where the fat half of a pair currently lives.
#[derive(Debug, Clone, PartialEq)]
pub enum FatState {
    Sealed(SealedBlock),
    /// Acknowledged by the persistence collaborator; fetched on demand.
    /// The key id stays so the key is kept while the block exists.
    Cold { key_id: u32 },
}

impl FatState {
    pub fn key_id(&self) -> u32 {
        match self {
            FatState::Sealed(sealed) => sealed.key_id,
            FatState::Cold { key_id } => *key_id,
        }
    }
}

/// Fat-side entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FatEntry {
    pub fragment_id: FragmentId,
    pub meta: FragmentMeta,
    pub created_at: DateTime<Utc>,
    pub state: FatState,
}

/// A sealed block ready to be committed with [`DualIndex::commit`].
#[derive(Debug)]
pub struct PreparedWrite {
    address: BlockAddress,
    entry: FatEntry,
    tag: Option<ThinTag>,
}

impl PreparedWrite {
    pub fn address(&self) -> BlockAddress {
        self.address
    }
}

/// Tiers consulted by [`DualIndex::retrieve`] besides the index itself.
pub struct RetrieveSources<'a> {
    pub hot: Option<&'a Fragment>,
    pub keys: &'a KeyRing,
    pub cold: Option<&'a dyn PersistenceAdapter>,
}

/// Bounded LRU of decrypted FatBlocks.
#[derive(Debug)]
struct BlockCache {
    capacity: usize,
    order: VecDeque<BlockAddress>,
    blocks: HashMap<BlockAddress, FatBlock>,
}

impl BlockCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            blocks: HashMap::new(),
        }
    }

    fn get(&mut self, address: BlockAddress) -> Option<FatBlock> {
        let block = self.blocks.get(&address)?.clone();
        self.bump(address);
        Some(block)
    }

    fn put(&mut self, block: FatBlock) {
        let address = block.address;
        if self.blocks.insert(address, block).is_some() {
            self.bump(address);
            return;
        }
        self.order.push_back(address);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.blocks.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, address: BlockAddress) {
        if self.blocks.remove(&address).is_some() {
            self.order.retain(|a| *a != address);
        }
    }

    fn bump(&mut self, address: BlockAddress) {
        if let Some(pos) = self.order.iter().position(|a| *a == address) {
            self.order.remove(pos);
        }
        self.order.push_back(address);
    }

    fn clear(&mut self) {
        self.order.clear();
        self.blocks.clear();
    }

    fn len(&self) -> usize {
        self.blocks.len()
    }
}

/// Fat store, thin index and decrypted-block cache.
#[derive(Debug)]
pub struct DualIndex {
    config: IndexConfig,
    fat: HashMap<BlockAddress, FatEntry>,
    thin: BTreeMap<BlockAddress, ThinTag>,
    cleared: HashSet<BlockAddress>,
    cache: BlockCache,
}

impl DualIndex {
    pub fn new(config: IndexConfig) -> Self {
        Self {
            cache: BlockCache::new(config.cache_capacity),
            config,
            fat: HashMap::new(),
            thin: BTreeMap::new(),
            cleared: HashSet::new(),
        }
    }

    /// Seal `block` with the current key and upsert both halves.
    /// Returns the ThinTag when the block is finalized.
    pub fn write(&mut self, block: &FatBlock, keys: &KeyRing) -> Result<Option<ThinTag>, TesseraError> {
        let prepared = Self::prepare(block, keys)?;
        Ok(self.commit(prepared))
    }

    /// Seal `block` without touching the index.
    pub fn prepare(block: &FatBlock, keys: &KeyRing) -> Result<PreparedWrite, TesseraError> {
        let address = block.address;
        let plaintext = serde_json::to_vec(block)?;
        let sealed = keys.encrypt_block(&address.to_string(), &plaintext)?;
        Ok(PreparedWrite {
            address,
            entry: FatEntry {
                fragment_id: block.fragment_id.clone(),
                meta: block.meta.clone(),
                created_at: block.created_at,
                state: FatState::Sealed(sealed),
            },
            tag: block.thin_tag(),
        })
    }

    /// Upsert both halves of a prepared write. A write at a cleared address
    /// lifts its tombstone.
    pub fn commit(&mut self, prepared: PreparedWrite) -> Option<ThinTag> {
        let PreparedWrite { address, entry, tag } = prepared;
        let key_id = entry.state.key_id();
        self.cleared.remove(&address);
        self.fat.insert(address, entry);
        match &tag {
            Some(tag) => {
                self.thin.insert(address, tag.clone());
            }
            None => {
                self.thin.remove(&address);
            }
        }
        self.cache.remove(address);
        debug!(%address, key_id, thin = tag.is_some(), "index write");
        tag
    }

    /// Register a record that is still waiting in the retry queue.
    pub fn register_sealed(&mut self, record: &OverflowRecord) {
        self.register(record, FatState::Sealed(record.sealed.clone()));
    }

    /// Register a record held by the persistence collaborator.
    pub fn register_cold(&mut self, record: &OverflowRecord) {
        self.register(
            record,
            FatState::Cold {
                key_id: record.sealed.key_id,
            },
        );
    }

    fn register(&mut self, record: &OverflowRecord, state: FatState) {
        if self.cleared.contains(&record.address) {
            debug!(address = %record.address, "skipping cleared record");
            return;
        }
        // A hot write is always newer than anything reloaded.
        if matches!(self.fat.get(&record.address), Some(FatEntry { state: FatState::Sealed(_), .. }))
            && matches!(state, FatState::Cold { .. })
        {
            return;
        }
        self.fat.insert(
            record.address,
            FatEntry {
                fragment_id: record.fragment_id.clone(),
                meta: record.meta.clone(),
                created_at: record.created_at,
                state,
            },
        );
        if let Some(tag) = &record.thin {
            self.thin.insert(record.address, tag.clone());
        }
    }

    /// Drop the sealed payload after the collaborator acknowledged it.
    pub fn mark_cold(&mut self, address: BlockAddress) -> bool {
        match self.fat.get_mut(&address) {
            Some(entry) => {
                entry.state = FatState::Cold {
                    key_id: entry.state.key_id(),
                };
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, address: BlockAddress) -> Option<FatEntry> {
        self.thin.remove(&address);
        self.cache.remove(address);
        self.fat.remove(&address)
    }

    /// Remove `address` and remember it as cleared.
    pub fn tombstone(&mut self, address: BlockAddress) -> Option<FatEntry> {
        self.cleared.insert(address);
        self.remove(address)
    }

    pub fn is_cleared(&self, address: BlockAddress) -> bool {
        self.cleared.contains(&address)
    }

    /// Forget the tombstone at `address`. Returns whether one was set.
    pub fn lift_tombstone(&mut self, address: BlockAddress) -> bool {
        self.cleared.remove(&address)
    }

    /// Key ids still needed to open a sealed or cold block.
    pub fn referenced_key_ids(&self) -> BTreeSet<u32> {
        self.fat.values().map(|e| e.state.key_id()).collect()
    }

    pub fn clear_cache(&mut self) {
        let dropped = self.cache.len();
        self.cache.clear();
        debug!(dropped, "cleared block cache");
    }

    pub fn thin(&self, address: BlockAddress) -> Option<&ThinTag> {
        self.thin.get(&address)
    }

    pub fn entry(&self, address: BlockAddress) -> Option<&FatEntry> {
        self.fat.get(&address)
    }

    pub fn address_of(&self, fragment_id: &FragmentId) -> Option<BlockAddress> {
        self.fat
            .iter()
            .find(|(_, entry)| &entry.fragment_id == fragment_id)
            .map(|(address, _)| *address)
    }

    /// Addresses whose provenance passes `filters`.
    pub fn matching(&self, filters: &SearchFilters) -> Vec<(BlockAddress, FragmentId)> {
        self.fat
            .iter()
            .filter(|(_, entry)| filters.matches(&entry.meta, entry.created_at))
            .map(|(address, entry)| (*address, entry.fragment_id.clone()))
            .collect()
    }

    pub fn thin_len(&self) -> usize {
        self.thin.len()
    }

    pub fn fat_len(&self) -> usize {
        self.fat.len()
    }

    pub fn cold_len(&self) -> usize {
        self.fat
            .values()
            .filter(|e| matches!(e.state, FatState::Cold { .. }))
            .count()
    }

    /// Highest address ever written, cleared ones included.
    pub fn max_address(&self) -> Option<BlockAddress> {
        self.fat.keys().chain(self.cleared.iter()).max().copied()
    }

    /// Rank ThinTags against `query`. Tags are never decrypted, so search
    /// keeps working when keys or the collaborator are unavailable.
    pub fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        slot_of: impl Fn(&FragmentId) -> Option<u8>,
        max_slots: u8,
        now: DateTime<Utc>,
    ) -> Vec<SearchHit> {
        let terms = query_terms(query);
        let scorer = Scorer::new(&self.config, max_slots, now);
        let mut hits: Vec<SearchHit> = self
            .thin
            .values()
            .filter(|tag| filters.matches_tag(tag))
            .filter_map(|tag| {
                let slot = slot_of(&tag.fragment_id);
                scorer.score(&terms, tag, slot).map(|score| SearchHit {
                    tag: tag.clone(),
                    score,
                    slot,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.tag.updated_at.cmp(&a.tag.updated_at))
        });
        hits.truncate(filters.limit.unwrap_or(self.config.max_results));
        hits
    }

    /// Tiered lookup: hot pool, decrypted cache, sealed store, then cold
    /// storage. A tier that misses or fails falls through to the next.
    pub async fn retrieve(
        &mut self,
        address: BlockAddress,
        sources: RetrieveSources<'_>,
        now: DateTime<Utc>,
    ) -> Result<FatBlock, TesseraError> {
        if let Some(fragment) = sources.hot {
            return Ok(FatBlock::from_fragment(fragment, now));
        }

        if let Some(block) = self.cache.get(address) {
            debug!(%address, "retrieve: cache hit");
            return Ok(block);
        }

        let Some(entry) = self.fat.get(&address) else {
            return Err(TesseraError::NotFound {
                address: address.to_string(),
            });
        };
        let fragment_id = entry.fragment_id.clone();
        let mut undecryptable = false;

        if let FatState::Sealed(sealed) = &entry.state {
            match open_block(address, sealed, sources.keys) {
                Ok(block) => {
                    self.cache.put(block.clone());
                    return Ok(block);
                }
                Err(e) => {
                    warn!(%address, error = %e, "retrieve: sealed block could not be opened");
                    undecryptable = true;
                }
            }
        }

        if let Some(cold) = sources.cold {
            match cold.get(fragment_id.as_str()).await {
                Ok(Some(bytes)) => match OverflowRecord::from_bytes(&bytes)
                    .and_then(|record| open_block(address, &record.sealed, sources.keys))
                {
                    Ok(block) => {
                        debug!(%address, "retrieve: cold hit");
                        self.cache.put(block.clone());
                        return Ok(block);
                    }
                    Err(e) => {
                        warn!(%address, error = %e, "retrieve: cold block could not be opened");
                        undecryptable = true;
                    }
                },
                Ok(None) => debug!(%address, "retrieve: cold miss"),
                Err(e) => warn!(%address, error = %e, "retrieve: cold tier unavailable"),
            }
        }

        if undecryptable {
            Err(TesseraError::DecryptionFailed {
                context: address.to_string(),
                message: "no key in history opens this block".to_string(),
            })
        } else {
            Err(TesseraError::NotFound {
                address: address.to_string(),
            })
        }
    }
}

fn open_block(
    address: BlockAddress,
    sealed: &SealedBlock,
    keys: &KeyRing,
) -> Result<FatBlock, TesseraError> {
    let plaintext = keys.decrypt_block(&address.to_string(), sealed)?;
    serde_json::from_slice(&plaintext).map_err(|e| TesseraError::DecryptionFailed {
        context: address.to_string(),
        message: format!("opened block is not a FatBlock: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tessera_config::model::{CryptoConfig, ProgressionConfig};
    use tessera_core::types::FragmentMeta;

    use crate::progression::ProgressionEngine;

    fn keys() -> KeyRing {
        KeyRing::generate(&CryptoConfig::default(), Utc::now()).unwrap()
    }

    fn sources<'a>(keys: &'a KeyRing) -> RetrieveSources<'a> {
        RetrieveSources {
            hot: None,
            keys,
            cold: None,
        }
    }

    fn finalized(engine: &mut ProgressionEngine, text: &str, session: &str) -> FatBlock {
        let now = Utc::now();
        let mut fragment = engine
            .capture(text, FragmentMeta::new("claude", session), now)
            .unwrap();
        engine.finalize(&mut fragment, now);
        FatBlock::from_fragment(&fragment, now)
    }

    fn engine() -> ProgressionEngine {
        ProgressionEngine::new(&ProgressionConfig::default(), 100)
    }

    #[test]
    fn thin_tag_exists_only_after_finalize() {
        let keys = keys();
        let mut index = DualIndex::new(IndexConfig::default());
        let mut engine = engine();
        let now = Utc::now();
        let fragment = engine
            .capture("Hello world", FragmentMeta::new("claude", "s1"), now)
            .unwrap();
        let block = FatBlock::from_fragment(&fragment, now);
        assert!(index.write(&block, &keys).unwrap().is_none());
        assert_eq!(index.thin_len(), 0);
        assert_eq!(index.fat_len(), 1);

        let block = finalized(&mut engine, "Redis cluster migration plan.", "s1");
        let tag = index.write(&block, &keys).unwrap().unwrap();
        assert_eq!(tag.address.to_string(), format!("{}.sq9", block.address));
        assert!(tag.summary.chars().count() <= 150);
        assert_eq!(index.thin_len(), 1);
    }

    #[tokio::test]
    async fn sealed_block_round_trips_through_retrieve() {
        let keys = keys();
        let mut index = DualIndex::new(IndexConfig::default());
        let block = finalized(&mut engine(), "Redis cluster migration plan.", "s1");
        index.write(&block, &keys).unwrap();

        let got = index
            .retrieve(block.address, sources(&keys), Utc::now())
            .await
            .unwrap();
        assert_eq!(got.square_map(), block.square_map());
        assert_eq!(index.cache.len(), 1);
    }

    #[tokio::test]
    async fn rotated_keys_still_open_old_blocks() {
        let mut keys = keys();
        let mut index = DualIndex::new(IndexConfig::default());
        let block = finalized(&mut engine(), "Redis cluster migration plan.", "s1");
        index.write(&block, &keys).unwrap();
        keys.rotate(Utc::now()).unwrap();

        assert!(index
            .retrieve(block.address, sources(&keys), Utc::now())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn unknown_key_is_decryption_failed() {
        let keys = keys();
        let other = KeyRing::generate(&CryptoConfig::default(), Utc::now()).unwrap();
        let mut index = DualIndex::new(IndexConfig::default());
        let block = finalized(&mut engine(), "Redis cluster migration plan.", "s1");
        index.write(&block, &keys).unwrap();

        let err = index
            .retrieve(block.address, sources(&other), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), tessera_core::ErrorKind::DecryptionFailed);
    }

    #[tokio::test]
    async fn unknown_address_is_not_found() {
        let keys = keys();
        let mut index = DualIndex::new(IndexConfig::default());
        let err = index
            .retrieve("0009.009".parse().unwrap(), sources(&keys), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), tessera_core::ErrorKind::NotFound);
    }

    #[test]
    fn search_ranks_and_filters() {
        let keys = keys();
        let mut index = DualIndex::new(IndexConfig::default());
        let mut engine = engine();
        let redis = finalized(&mut engine, "Redis cluster failover. Redis needs tuning.", "s1");
        let kafka = finalized(&mut engine, "Kafka consumer lag on the cluster.", "s2");
        index.write(&redis, &keys).unwrap();
        index.write(&kafka, &keys).unwrap();

        let now = Utc::now();
        let hits = index.search("redis", &SearchFilters::default(), |_| None, 5, now);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tag.fragment_id, redis.fragment_id);

        let hits = index.search("cluster", &SearchFilters::default(), |_| None, 5, now);
        assert_eq!(hits.len(), 2);

        let filters = SearchFilters {
            session_id: Some("s2".into()),
            ..SearchFilters::default()
        };
        let hits = index.search("cluster", &filters, |_| None, 5, now);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tag.fragment_id, kafka.fragment_id);
    }

    #[test]
    fn ties_prefer_most_recent() {
        let keys = keys();
        let mut index = DualIndex::new(IndexConfig {
            recency_weight: 0.0,
            ..IndexConfig::default()
        });
        let mut engine = engine();
        let mut older = finalized(&mut engine, "Redis notes.", "s1");
        older.updated_at -= Duration::hours(1);
        let newer = finalized(&mut engine, "Redis notes.", "s1");
        index.write(&older, &keys).unwrap();
        index.write(&newer, &keys).unwrap();

        let hits = index.search("redis", &SearchFilters::default(), |_| None, 5, Utc::now());
        assert_eq!(hits[0].tag.fragment_id, newer.fragment_id);
    }

    #[test]
    fn hot_fragments_rank_above_cold() {
        let keys = keys();
        let mut index = DualIndex::new(IndexConfig::default());
        let mut engine = engine();
        let a = finalized(&mut engine, "Redis notes.", "s1");
        let b = finalized(&mut engine, "Redis notes.", "s1");
        index.write(&a, &keys).unwrap();
        index.write(&b, &keys).unwrap();
        let hot = a.fragment_id.clone();
        let hits = index.search(
            "redis",
            &SearchFilters::default(),
            |id| (id == &hot).then_some(1),
            5,
            Utc::now(),
        );
        assert_eq!(hits[0].tag.fragment_id, a.fragment_id);
        assert_eq!(hits[0].slot, Some(1));
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let keys = keys();
        let mut engine = engine();
        let mut cache = BlockCache::new(2);
        let blocks: Vec<FatBlock> = (0..3)
            .map(|i| finalized(&mut engine, &format!("note {i}"), "s1"))
            .collect();
        cache.put(blocks[0].clone());
        cache.put(blocks[1].clone());
        assert!(cache.get(blocks[0].address).is_some());
        cache.put(blocks[2].clone());
        assert!(cache.get(blocks[1].address).is_none());
        assert!(cache.get(blocks[0].address).is_some());
        assert_eq!(cache.len(), 2);
        let _ = keys;
    }

    #[test]
    fn mark_cold_keeps_the_tag() {
        let keys = keys();
        let mut index = DualIndex::new(IndexConfig::default());
        let block = finalized(&mut engine(), "Redis notes.", "s1");
        index.write(&block, &keys).unwrap();
        assert!(index.mark_cold(block.address));
        assert_eq!(index.cold_len(), 1);
        assert!(index.thin(block.address).is_some());
        assert_eq!(
            index.entry(block.address).unwrap().state,
            FatState::Cold {
                key_id: keys.active_key_id()
            }
        );
    }

    fn record(block: &FatBlock, keys: &KeyRing) -> OverflowRecord {
        let sealed = keys
            .encrypt_block(&block.address.to_string(), &serde_json::to_vec(block).unwrap())
            .unwrap();
        OverflowRecord {
            fragment_id: block.fragment_id.clone(),
            address: block.address,
            meta: block.meta.clone(),
            created_at: block.created_at,
            thin: block.thin_tag(),
            sealed,
        }
    }

    #[test]
    fn cleared_address_ignores_reloaded_records() {
        let keys = keys();
        let mut index = DualIndex::new(IndexConfig::default());
        let block = finalized(&mut engine(), "Redis notes.", "s1");
        index.write(&block, &keys).unwrap();
        assert!(index.tombstone(block.address).is_some());
        assert!(index.is_cleared(block.address));

        index.register_sealed(&record(&block, &keys));
        index.register_cold(&record(&block, &keys));
        assert_eq!(index.fat_len(), 0);
        assert_eq!(index.thin_len(), 0);
        assert_eq!(index.max_address(), Some(block.address));
    }

    #[test]
    fn rewrite_lifts_the_tombstone() {
        let keys = keys();
        let mut index = DualIndex::new(IndexConfig::default());
        let block = finalized(&mut engine(), "Redis notes.", "s1");
        index.tombstone(block.address);
        index.write(&block, &keys).unwrap();
        assert!(!index.is_cleared(block.address));
        assert_eq!(index.fat_len(), 1);
    }

    #[test]
    fn referenced_keys_cover_sealed_and_cold_entries() {
        let mut keys = keys();
        let mut index = DualIndex::new(IndexConfig::default());
        let mut engine = engine();
        let first = finalized(&mut engine, "Redis notes.", "s1");
        index.write(&first, &keys).unwrap();
        index.mark_cold(first.address);
        let first_key = keys.active_key_id();

        keys.rotate(Utc::now()).unwrap();
        let second = finalized(&mut engine, "Kafka notes.", "s1");
        index.write(&second, &keys).unwrap();

        let referenced = index.referenced_key_ids();
        assert_eq!(
            referenced.into_iter().collect::<Vec<_>>(),
            vec![first_key, keys.active_key_id()]
        );
    }

    #[test]
    fn failed_prepare_leaves_the_index_untouched() {
        let keys = keys();
        let mut index = DualIndex::new(IndexConfig::default());
        let block = finalized(&mut engine(), "Redis notes.", "s1");
        let prepared = DualIndex::prepare(&block, &keys).unwrap();
        assert_eq!(prepared.address(), block.address);
        assert_eq!(index.fat_len(), 0);
        assert!(index.commit(prepared).is_some());
        assert_eq!(index.fat_len(), 1);
    }
}
