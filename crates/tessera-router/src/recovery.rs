// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Recovery strategy selection for failed storage operations.

use tessera_config::model::RouterConfig;
use tessera_core::ErrorKind;

use crate::message::Operation;

/// What the caller should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Keep the data on the local fallback path (retry queue, local cold store).
    StorageFallback,
    /// Drop cached state and retry once.
    CacheClearAndRetry,
    /// Retry with exponential backoff.
    BackoffAndRetry { attempts: u32, base_delay_ms: u64 },
    /// Install a fresh session key for future writes. Only chosen when the
    /// current key fails to seal; a block that no key opens is not helped by
    /// a new key.
    KeyRegeneration,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryStrategy::StorageFallback => write!(f, "storage_fallback"),
            RecoveryStrategy::CacheClearAndRetry => write!(f, "cache_clear_and_retry"),
            RecoveryStrategy::BackoffAndRetry { attempts, .. } => {
                write!(f, "backoff_and_retry({attempts})")
            }
            RecoveryStrategy::KeyRegeneration => write!(f, "key_regeneration"),
        }
    }
}

/// Picks a strategy for `kind` raised by `operation`. `None` means the
/// failure has no recovery path and is reported as terminal.
pub fn select_strategy(
    kind: ErrorKind,
    operation: Operation,
    config: &RouterConfig,
) -> Option<RecoveryStrategy> {
    let backoff = RecoveryStrategy::BackoffAndRetry {
        attempts: config.retry_attempts,
        base_delay_ms: config.retry_base_delay_ms,
    };
    match kind {
        ErrorKind::Crypto => Some(RecoveryStrategy::KeyRegeneration),
        ErrorKind::DecryptionFailed => match operation {
            Operation::Retrieve => Some(RecoveryStrategy::CacheClearAndRetry),
            _ => None,
        },
        ErrorKind::StorageWriteFailed | ErrorKind::OverflowAbandoned => {
            Some(RecoveryStrategy::StorageFallback)
        }
        ErrorKind::Transport | ErrorKind::Timeout => match operation {
            // Hand-off and drain already retry through the durable queue.
            Operation::HandOff | Operation::DrainQueue => Some(RecoveryStrategy::StorageFallback),
            _ => Some(backoff),
        },
        ErrorKind::Storage => Some(backoff),
        ErrorKind::NotFound | ErrorKind::Internal | ErrorKind::RoutingFailure => {
            Some(RecoveryStrategy::CacheClearAndRetry)
        }
        ErrorKind::Config
        | ErrorKind::CaptureRejected
        | ErrorKind::RevisionLimitExceeded
        | ErrorKind::FragmentFinalized => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_failure_regenerates_key() {
        let config = RouterConfig::default();
        assert_eq!(
            select_strategy(ErrorKind::Crypto, Operation::IndexWrite, &config),
            Some(RecoveryStrategy::KeyRegeneration)
        );
    }

    #[test]
    fn unreadable_block_never_regenerates_key() {
        let config = RouterConfig::default();
        assert_eq!(
            select_strategy(ErrorKind::DecryptionFailed, Operation::Retrieve, &config),
            Some(RecoveryStrategy::CacheClearAndRetry)
        );
        assert_eq!(
            select_strategy(ErrorKind::DecryptionFailed, Operation::DrainQueue, &config),
            None
        );
    }

    #[test]
    fn transport_during_hand_off_falls_back_to_queue() {
        let config = RouterConfig::default();
        assert_eq!(
            select_strategy(ErrorKind::Transport, Operation::HandOff, &config),
            Some(RecoveryStrategy::StorageFallback)
        );
        assert_eq!(
            select_strategy(ErrorKind::Transport, Operation::Backup, &config),
            Some(RecoveryStrategy::BackoffAndRetry {
                attempts: 3,
                base_delay_ms: 200
            })
        );
    }

    #[test]
    fn cache_miss_clears_cache() {
        let config = RouterConfig::default();
        assert_eq!(
            select_strategy(ErrorKind::NotFound, Operation::Retrieve, &config),
            Some(RecoveryStrategy::CacheClearAndRetry)
        );
    }

    #[test]
    fn caller_errors_have_no_recovery() {
        let config = RouterConfig::default();
        assert_eq!(
            select_strategy(ErrorKind::CaptureRejected, Operation::IndexWrite, &config),
            None
        );
    }
}
