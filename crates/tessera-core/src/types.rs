// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types shared by every Tessera crate.
//!
//! A [`Fragment`] is the hot, mutable view of one captured unit of text. A
//! [`FatBlock`] is its complete Square 1-9 record as written to the fat
//! store, and a [`ThinTag`] is the small search entry derived from Square 9.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::TesseraError;

/// Index of the raw capture square.
pub const RAW_SQUARE: u8 = 1;

/// Index of the last square available for edits.
pub const LAST_EDIT_SQUARE: u8 = 8;

/// Index of the canonical record.
pub const CANONICAL_SQUARE: u8 = 9;

/// Upper bound on the canonical summary, in characters.
pub const MAX_SUMMARY_CHARS: usize = 150;

/// Number of ranked keywords kept in a canonical record.
pub const MAX_KEYWORDS: usize = 5;

/// Opaque identifier of a fragment. The UI layer holds these, never live references.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentId(pub String);

impl FragmentId {
    /// Generates a fresh random fragment id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FragmentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of an interactive capture session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Hierarchical `block.chunk` address of a FatBlock.
///
/// Derived from a monotonically increasing creation ordinal; an ordinal is
/// never handed out twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockAddress {
    pub block: u32,
    pub chunk: u32,
}

impl BlockAddress {
    /// Maps a zero-based creation ordinal onto a `block.chunk` pair.
    pub fn from_ordinal(ordinal: u64, chunks_per_block: u32) -> Self {
        let per_block = u64::from(chunks_per_block.max(1));
        Self {
            block: (ordinal / per_block + 1) as u32,
            chunk: (ordinal % per_block + 1) as u32,
        }
    }

    /// Inverse of [`BlockAddress::from_ordinal`].
    pub fn ordinal(&self, chunks_per_block: u32) -> u64 {
        let per_block = u64::from(chunks_per_block.max(1));
        u64::from(self.block.saturating_sub(1)) * per_block + u64::from(self.chunk.saturating_sub(1))
    }

    /// Address of the ThinTag derived from this block's Square 9.
    pub fn thin(&self) -> ThinAddress {
        ThinAddress(*self)
    }
}

impl fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}.{:03}", self.block, self.chunk)
    }
}

impl FromStr for BlockAddress {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_suffix(".sq9").unwrap_or(s);
        let (block, chunk) = s
            .split_once('.')
            .ok_or_else(|| TesseraError::Internal(format!("malformed block address `{s}`")))?;
        let parse = |part: &str| {
            part.parse::<u32>()
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| TesseraError::Internal(format!("malformed block address `{s}`")))
        };
        Ok(Self {
            block: parse(block)?,
            chunk: parse(chunk)?,
        })
    }
}

impl TryFrom<String> for BlockAddress {
    type Error = TesseraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BlockAddress> for String {
    fn from(address: BlockAddress) -> Self {
        address.to_string()
    }
}

/// `block.chunk.sq9` address of a ThinTag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ThinAddress(pub BlockAddress);

impl ThinAddress {
    pub fn block(&self) -> BlockAddress {
        self.0
    }
}

impl fmt::Display for ThinAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.sq9", self.0)
    }
}

impl TryFrom<String> for ThinAddress {
    type Error = TesseraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if !value.ends_with(".sq9") {
            return Err(TesseraError::Internal(format!(
                "thin address `{value}` must end in .sq9"
            )));
        }
        Ok(Self(value.parse()?))
    }
}

impl From<ThinAddress> for String {
    fn from(address: ThinAddress) -> Self {
        address.to_string()
    }
}

/// Provenance supplied by the capture collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentMeta {
    pub provider_tag: String,
    pub session_id: SessionId,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub source_handle: Option<String>,
    /// Capture time reported by the collaborator, if any.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl FragmentMeta {
    pub fn new(provider_tag: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            provider_tag: provider_tag.into(),
            session_id: SessionId(session_id.into()),
            ..Self::default()
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_source(mut self, source_handle: impl Into<String>) -> Self {
        self.source_handle = Some(source_handle.into());
        self
    }
}

/// One revision stage (1 raw, 2-8 edits) of a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Square {
    pub index: u8,
    pub version: u32,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Kinds of entity recognised in a canonical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Person,
    Place,
    Concept,
    Date,
}

/// Typed entity map of a canonical record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMap {
    #[serde(default)]
    pub people: Vec<String>,
    #[serde(default)]
    pub places: Vec<String>,
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub dates: Vec<String>,
}

impl EntityMap {
    pub fn is_empty(&self) -> bool {
        self.people.is_empty()
            && self.places.is_empty()
            && self.concepts.is_empty()
            && self.dates.is_empty()
    }

    /// Iterates over every entity with its kind.
    pub fn iter(&self) -> impl Iterator<Item = (EntityKind, &str)> {
        tagged(EntityKind::Person, &self.people)
            .chain(tagged(EntityKind::Place, &self.places))
            .chain(tagged(EntityKind::Concept, &self.concepts))
            .chain(tagged(EntityKind::Date, &self.dates))
    }
}

fn tagged(kind: EntityKind, items: &[String]) -> impl Iterator<Item = (EntityKind, &str)> {
    items.iter().map(move |s| (kind, s.as_str()))
}

/// Square 9: the write-once canonical record of a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub summary: String,
    pub keywords: Vec<String>,
    pub entities: EntityMap,
    /// Hex-encoded SHA-256 over squares 1-8.
    pub content_hash: String,
    /// Square the summary was derived from.
    pub source_square: u8,
    pub created_at: DateTime<Utc>,
}

/// The bounded revision history of a fragment.
///
/// Enforces the square invariants: square 1 is immutable, squares 2-8 are
/// append-only, square 9 is written at most once and seals the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionSequence {
    squares: Vec<Square>,
    canonical: Option<CanonicalRecord>,
}

impl RevisionSequence {
    /// Starts a sequence from the raw capture.
    pub fn new(raw: String, now: DateTime<Utc>) -> Self {
        Self {
            squares: vec![Square {
                index: RAW_SQUARE,
                version: 1,
                content: raw,
                created_at: now,
            }],
            canonical: None,
        }
    }

    pub fn raw(&self) -> &Square {
        &self.squares[0]
    }

    /// Most recent square among 1-8.
    pub fn latest(&self) -> &Square {
        &self.squares[self.squares.len() - 1]
    }

    pub fn squares(&self) -> &[Square] {
        &self.squares
    }

    pub fn square(&self, index: u8) -> Option<&Square> {
        self.squares.iter().find(|s| s.index == index)
    }

    pub fn canonical(&self) -> Option<&CanonicalRecord> {
        self.canonical.as_ref()
    }

    pub fn is_finalized(&self) -> bool {
        self.canonical.is_some()
    }

    /// Number of edit squares still available.
    pub fn edits_remaining(&self) -> u8 {
        LAST_EDIT_SQUARE.saturating_sub(self.latest().index)
    }

    /// UTF-8 byte length of squares 1-8.
    pub fn size_bytes(&self) -> u64 {
        self.squares.iter().map(|s| s.content.len() as u64).sum()
    }

    /// Appends the next edit square.
    pub fn push_edit(
        &mut self,
        fragment_id: &FragmentId,
        content: String,
        now: DateTime<Utc>,
    ) -> Result<&Square, TesseraError> {
        if self.canonical.is_some() {
            return Err(TesseraError::FragmentFinalized {
                fragment_id: fragment_id.to_string(),
            });
        }
        let next = self.latest().index + 1;
        if next > LAST_EDIT_SQUARE {
            return Err(TesseraError::RevisionLimitExceeded {
                fragment_id: fragment_id.to_string(),
                limit: LAST_EDIT_SQUARE,
            });
        }
        self.squares.push(Square {
            index: next,
            version: u32::from(next),
            content,
            created_at: now,
        });
        Ok(self.latest())
    }

    /// Stores the canonical record unless one already exists.
    ///
    /// Returns the record that is in place afterwards, which is the existing
    /// one when called a second time.
    pub fn seal_canonical(&mut self, record: CanonicalRecord) -> &CanonicalRecord {
        self.canonical.get_or_insert(record)
    }
}

/// A captured unit of text plus its revision history and slot state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: FragmentId,
    pub address: BlockAddress,
    pub meta: FragmentMeta,
    pub created_at: DateTime<Utc>,
    /// Current slot, 1 = hottest.
    pub slot: u8,
    pub access_count: u64,
    pub last_promoted_at: DateTime<Utc>,
    pub revisions: RevisionSequence,
}

impl Fragment {
    pub fn size_bytes(&self) -> u64 {
        self.revisions.size_bytes()
    }
}

/// One entry of a FatBlock's square map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SquareEntry {
    Revision(Square),
    Canonical(CanonicalRecord),
}

/// The complete Square 1-9 record of a fragment, as kept in the fat store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FatBlock {
    pub address: BlockAddress,
    pub fragment_id: FragmentId,
    pub meta: FragmentMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub access_count: u64,
    pub revisions: RevisionSequence,
}

impl FatBlock {
    pub fn from_fragment(fragment: &Fragment, now: DateTime<Utc>) -> Self {
        Self {
            address: fragment.address,
            fragment_id: fragment.id.clone(),
            meta: fragment.meta.clone(),
            created_at: fragment.created_at,
            updated_at: now,
            access_count: fragment.access_count,
            revisions: fragment.revisions.clone(),
        }
    }

    /// Turns the block back into a hot fragment placed in `slot`.
    pub fn into_fragment(self, slot: u8, now: DateTime<Utc>) -> Fragment {
        Fragment {
            id: self.fragment_id,
            address: self.address,
            meta: self.meta,
            created_at: self.created_at,
            slot,
            access_count: self.access_count,
            last_promoted_at: now,
            revisions: self.revisions,
        }
    }

    /// The full Square 1-9 map.
    pub fn square_map(&self) -> BTreeMap<u8, SquareEntry> {
        let mut map: BTreeMap<u8, SquareEntry> = self
            .revisions
            .squares()
            .iter()
            .map(|s| (s.index, SquareEntry::Revision(s.clone())))
            .collect();
        if let Some(canonical) = self.revisions.canonical() {
            map.insert(CANONICAL_SQUARE, SquareEntry::Canonical(canonical.clone()));
        }
        map
    }

    /// Derives the ThinTag. `None` until Square 9 exists.
    pub fn thin_tag(&self) -> Option<ThinTag> {
        let canonical = self.revisions.canonical()?;
        Some(ThinTag {
            address: self.address.thin(),
            fragment_id: self.fragment_id.clone(),
            session_id: self.meta.session_id.clone(),
            provider_tag: self.meta.provider_tag.clone(),
            topic: self.meta.topic.clone(),
            summary: canonical.summary.clone(),
            keywords: canonical.keywords.clone(),
            entities: canonical.entities.clone(),
            content_hash: canonical.content_hash.clone(),
            size_bytes: self.revisions.size_bytes(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Compressed, unencrypted search entry derived from a FatBlock's Square 9.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinTag {
    pub address: ThinAddress,
    pub fragment_id: FragmentId,
    pub session_id: SessionId,
    pub provider_tag: String,
    pub topic: Option<String>,
    pub summary: String,
    pub keywords: Vec<String>,
    pub entities: EntityMap,
    pub content_hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filters shared by `search` and `clear`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub provider_tag: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SearchFilters {
    /// Whether a record with this provenance passes the filters.
    pub fn matches(&self, meta: &FragmentMeta, created_at: DateTime<Utc>) -> bool {
        if let Some(session) = &self.session_id {
            if &meta.session_id != session {
                return false;
            }
        }
        if let Some(provider) = &self.provider_tag {
            if !meta.provider_tag.eq_ignore_ascii_case(provider) {
                return false;
            }
        }
        if let Some(topic) = &self.topic {
            if meta.topic.as_deref() != Some(topic.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if created_at < since {
                return false;
            }
        }
        true
    }

    pub fn matches_tag(&self, tag: &ThinTag) -> bool {
        let meta = FragmentMeta {
            provider_tag: tag.provider_tag.clone(),
            session_id: tag.session_id.clone(),
            topic: tag.topic.clone(),
            source_handle: None,
            timestamp: None,
        };
        self.matches(&meta, tag.created_at)
    }

    /// True when no filter is set.
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none()
            && self.provider_tag.is_none()
            && self.topic.is_none()
            && self.since.is_none()
    }
}

/// A ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub tag: ThinTag,
    pub score: f64,
    /// Current hot slot, if the fragment is resident.
    pub slot: Option<u8>,
}

/// Occupancy of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStats {
    pub slot: u8,
    pub fragments: usize,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
}

/// Queue and backlog report, served over the `status` bridge message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub hot_fragments: usize,
    pub slots: Vec<SlotStats>,
    pub thin_tags: usize,
    pub fat_blocks: usize,
    pub cold_blocks: usize,
    pub queue_pending: u64,
    pub queue_abandoned: u64,
    pub active_key_id: u32,
    pub key_history: usize,
}

/// Health status reported by adapter health checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Adapter is fully operational.
    Healthy,
    /// Adapter is operational but experiencing issues.
    Degraded(String),
    /// Adapter is not operational.
    Unhealthy(String),
}

/// Identifies the role of an adapter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
pub enum AdapterType {
    Persistence,
    Backup,
    Transport,
}
