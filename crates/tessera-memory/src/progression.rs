// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Revision progression: capture (Square 1), edits (Squares 2-8) and the
//! write-once canonical record (Square 9).
//!
//! The engine also owns the address allocator. Ordinals only move forward,
//! so an address is never handed out twice, including after `clear`.

use chrono::{DateTime, Utc};
use tessera_config::model::ProgressionConfig;
use tessera_core::types::{
    BlockAddress, CanonicalRecord, Fragment, FragmentId, FragmentMeta, RevisionSequence, Square,
};
use tessera_core::TesseraError;
use tracing::{debug, warn};

use crate::extractor::Extractor;

/// Drives fragments through their revision sequence.
#[derive(Debug, Clone)]
pub struct ProgressionEngine {
    max_capture_bytes: u64,
    chunks_per_block: u32,
    next_ordinal: u64,
    extractor: Extractor,
}

impl ProgressionEngine {
    pub fn new(config: &ProgressionConfig, chunks_per_block: u32) -> Self {
        Self {
            max_capture_bytes: config.max_capture_bytes,
            chunks_per_block,
            next_ordinal: 0,
            extractor: Extractor::new(config),
        }
    }

    /// Moves the allocator past `address` if it has not already passed it.
    pub fn resume_after(&mut self, address: BlockAddress) {
        self.resume_at(address.ordinal(self.chunks_per_block) + 1);
    }

    /// Moves the allocator forward to a persisted high-water ordinal.
    pub fn resume_at(&mut self, ordinal: u64) {
        if ordinal > self.next_ordinal {
            self.next_ordinal = ordinal;
        }
    }

    /// Ordinal of the next address, persisted so addresses are never reused.
    pub fn next_ordinal(&self) -> u64 {
        self.next_ordinal
    }

    /// The address the next capture will receive.
    pub fn peek_address(&self) -> BlockAddress {
        BlockAddress::from_ordinal(self.next_ordinal, self.chunks_per_block)
    }

    fn allocate(&mut self) -> BlockAddress {
        let address = self.peek_address();
        self.next_ordinal += 1;
        address
    }

    fn check_text(&self, text: &str) -> Result<(), TesseraError> {
        if text.trim().is_empty() {
            return Err(TesseraError::rejected("text is empty"));
        }
        if text.len() as u64 > self.max_capture_bytes {
            return Err(TesseraError::rejected(format!(
                "text is {} bytes, limit is {}",
                text.len(),
                self.max_capture_bytes
            )));
        }
        Ok(())
    }

    /// Creates a fragment holding `text` as Square 1.
    pub fn capture(
        &mut self,
        text: &str,
        meta: FragmentMeta,
        now: DateTime<Utc>,
    ) -> Result<Fragment, TesseraError> {
        if let Err(e) = self.check_text(text) {
            warn!(provider = %meta.provider_tag, session = %meta.session_id, error = %e, "capture rejected");
            return Err(e);
        }
        let id = FragmentId::generate();
        let address = self.allocate();
        debug!(fragment_id = %id, %address, bytes = text.len(), "captured fragment");
        Ok(Fragment {
            id,
            address,
            created_at: meta.timestamp.unwrap_or(now),
            meta,
            slot: 1,
            access_count: 0,
            last_promoted_at: now,
            revisions: RevisionSequence::new(text.to_string(), now),
        })
    }

    /// Appends the next edit square to `fragment`.
    pub fn revise(
        &self,
        fragment: &mut Fragment,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<Square, TesseraError> {
        self.check_text(text)?;
        let square = fragment
            .revisions
            .push_edit(&fragment.id, text.to_string(), now)?
            .clone();
        debug!(fragment_id = %fragment.id, square = square.index, "revised fragment");
        Ok(square)
    }

    /// Computes Square 9. A second call returns the existing record unchanged.
    pub fn finalize(&self, fragment: &mut Fragment, now: DateTime<Utc>) -> CanonicalRecord {
        if let Some(existing) = fragment.revisions.canonical() {
            return existing.clone();
        }
        let record = self.extractor.canonical(&fragment.revisions, now);
        debug!(
            fragment_id = %fragment.id,
            keywords = record.keywords.len(),
            "finalized fragment"
        );
        fragment.revisions.seal_canonical(record).clone()
    }
}
