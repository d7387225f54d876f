// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! At-rest encryption for Tessera FatBlocks.
//!
//! Blocks are sealed with AES-256-GCM under a per-process session key that
//! rotates on a fixed interval. Retired keys stay in a bounded history so
//! older blocks remain readable. When a passphrase is available, session keys
//! are wrapped with an Argon2id-derived key so they can be persisted. The
//! same derivation seals whole configuration files ([`sealed_config`]).
//!
//! ThinTags never pass through this crate.

pub mod crypto;
pub mod kdf;
pub mod keyring;
pub mod sealed_config;
pub mod wrap;

pub use keyring::{KeyRing, SealedBlock, SessionKey};
pub use wrap::{KeyWrapper, WrappedKey};
