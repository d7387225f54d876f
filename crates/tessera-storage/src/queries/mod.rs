// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed query modules. Each function takes `&Database` and runs on the
//! single writer thread.

pub mod allocator;
pub mod keys;
pub mod queue;
pub mod records;
pub mod snapshots;
pub mod tombstones;
