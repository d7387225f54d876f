// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the Tessera memory pool.
//!
//! This crate provides the error taxonomy, the fragment / FatBlock / ThinTag
//! data model, and the adapter traits implemented by external persistence
//! collaborators.

pub mod error;
pub mod traits;
pub mod types;

// Re-export key items at crate root for ergonomic imports.
pub use error::{ErrorKind, TesseraError};
pub use types::{
    AdapterType, BlockAddress, FatBlock, Fragment, FragmentId, FragmentMeta, HealthStatus,
    SearchFilters, SearchHit, SessionId, StatusReport, ThinAddress, ThinTag,
};

pub use traits::{PersistenceAdapter, PluginAdapter};
