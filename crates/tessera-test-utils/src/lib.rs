// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test utilities for Tessera integration tests.
//!
//! Provides a mock persistence collaborator and a harness that assembles a
//! running memory service over a temp SQLite database.
//!
//! # Components
//!
//! - [`MockPersistence`] - In-memory collaborator that can be switched offline
//! - [`TestHarness`] - Memory service, handle and cold store in one place

pub mod harness;
pub mod mock_persistence;

pub use harness::{TestHarness, TestHarnessBuilder};
pub use mock_persistence::MockPersistence;
