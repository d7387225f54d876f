// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed message routing for the Tessera memory pool.
//!
//! Inbound `Content`, `Search` and `Storage` messages pass through processing
//! forks (provider normalization, priority scoring, adaptive compression)
//! and fan out to outgoing forks (context delivery, session broadcast,
//! backup) or to the emergency recovery fork.

pub mod compression;
pub mod message;
pub mod priority;
pub mod profiles;
pub mod recovery;
pub mod router;

pub use message::{Envelope, Inbound, Operation, Outbound};
pub use priority::Priority;
pub use recovery::RecoveryStrategy;
pub use router::{ForkFailure, ForkRouter, RoutingReport};
