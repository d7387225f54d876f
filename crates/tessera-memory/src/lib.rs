// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tiered memory pool for the Tessera workspace.
//!
//! ## Architecture
//!
//! - **ProgressionEngine**: Square 1 capture, Squares 2-8 edits, Square 9 canonical record
//! - **Extractor**: deterministic summary, keyword and entity extraction
//! - **SlotPool**: bounded hot tier with cascading promotion and eviction
//! - **DualIndex**: sealed FatBlock store paired with the plaintext ThinTag index
//! - **OverflowManager**: durable retry queue in front of the persistence collaborator
//! - **MemoryContext**: owns every component; **MemoryService** serializes access to it

pub mod context;
pub mod extractor;
pub mod index;
pub mod overflow;
pub mod pool;
pub mod progression;
pub mod scoring;
pub mod service;

pub use context::{MemoryContext, Placement};
pub use extractor::Extractor;
pub use index::DualIndex;
pub use overflow::{DrainReport, HandOff, OverflowManager, OverflowRecord};
pub use pool::{PoolSnapshot, SlotAssignment, SlotPool};
pub use progression::ProgressionEngine;
pub use service::{MemoryHandle, MemoryService};
