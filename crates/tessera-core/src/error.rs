// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the Tessera memory pool.

use strum::{Display, EnumString};
use thiserror::Error;

/// The primary error type used across all Tessera components and adapter traits.
#[derive(Debug, Error)]
pub enum TesseraError {
    /// Configuration errors (invalid TOML, missing required fields, type mismatches).
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed or empty capture input. Dropped and logged, never queued.
    #[error("capture rejected: {reason}")]
    CaptureRejected { reason: String },

    /// All edit squares of a fragment are consumed; the caller must open a new fragment.
    #[error("revision limit exceeded for fragment {fragment_id} ({limit} squares)")]
    RevisionLimitExceeded { fragment_id: String, limit: u8 },

    /// The fragment already carries its canonical record and is edit-locked.
    #[error("fragment {fragment_id} is finalized")]
    FragmentFinalized { fragment_id: String },

    /// No fragment with this id is known to any tier.
    #[error("fragment not found: {fragment_id}")]
    FragmentNotFound { fragment_id: String },

    /// Every retrieval tier was exhausted without finding the block.
    #[error("block not found: {address}")]
    NotFound { address: String },

    /// A write to a persistence collaborator failed. Queued for retry, not fatal.
    #[error("storage write failed: {message}")]
    StorageWriteFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Local storage backend errors (database connection, query failure, migrations).
    #[error("storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// No key in the key history could open a sealed block.
    #[error("decryption failed for {context}: {message}")]
    DecryptionFailed { context: String, message: String },

    /// Key generation, sealing or key-derivation failures.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// A fork in the router failed. Isolated per fork and reported through recovery.
    #[error("routing failure in fork `{fork}`: {message}")]
    RoutingFailure { fork: String, message: String },

    /// The overflow retry budget for a fragment is exhausted.
    #[error("overflow abandoned for fragment {fragment_id} after {attempts} attempts")]
    OverflowAbandoned { fragment_id: String, attempts: u32 },

    /// Transport errors talking to a remote persistence process.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation timed out.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`TesseraError`], used by the recovery fork
/// to pick a strategy without inspecting error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Config,
    CaptureRejected,
    RevisionLimitExceeded,
    FragmentFinalized,
    NotFound,
    StorageWriteFailed,
    Storage,
    DecryptionFailed,
    Crypto,
    RoutingFailure,
    OverflowAbandoned,
    Transport,
    Timeout,
    Internal,
}

impl TesseraError {
    /// Returns the coarse kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TesseraError::Config(_) => ErrorKind::Config,
            TesseraError::CaptureRejected { .. } => ErrorKind::CaptureRejected,
            TesseraError::RevisionLimitExceeded { .. } => ErrorKind::RevisionLimitExceeded,
            TesseraError::FragmentFinalized { .. } => ErrorKind::FragmentFinalized,
            TesseraError::FragmentNotFound { .. } | TesseraError::NotFound { .. } => {
                ErrorKind::NotFound
            }
            TesseraError::StorageWriteFailed { .. } => ErrorKind::StorageWriteFailed,
            TesseraError::Storage { .. } => ErrorKind::Storage,
            TesseraError::DecryptionFailed { .. } => ErrorKind::DecryptionFailed,
            TesseraError::Crypto(_) => ErrorKind::Crypto,
            TesseraError::RoutingFailure { .. } => ErrorKind::RoutingFailure,
            TesseraError::OverflowAbandoned { .. } => ErrorKind::OverflowAbandoned,
            TesseraError::Transport { .. } => ErrorKind::Transport,
            TesseraError::Timeout { .. } => ErrorKind::Timeout,
            TesseraError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Shorthand for a `CaptureRejected` error.
    pub fn rejected(reason: impl Into<String>) -> Self {
        TesseraError::CaptureRejected {
            reason: reason.into(),
        }
    }

    /// Shorthand for a `StorageWriteFailed` error without a source.
    pub fn write_failed(message: impl Into<String>) -> Self {
        TesseraError::StorageWriteFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Shorthand for a `Transport` error wrapping a source error.
    pub fn transport<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TesseraError::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether the error leaves the caller with nothing to retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::CaptureRejected
                | ErrorKind::RevisionLimitExceeded
                | ErrorKind::FragmentFinalized
                | ErrorKind::NotFound
                | ErrorKind::DecryptionFailed
                | ErrorKind::Config
        )
    }
}

impl From<serde_json::Error> for TesseraError {
    fn from(e: serde_json::Error) -> Self {
        TesseraError::Internal(format!("serialization failed: {e}"))
    }
}
