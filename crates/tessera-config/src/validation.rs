// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Post-deserialization validation for configuration values.
//!
//! Validates semantic constraints that cannot be expressed via serde attributes,
//! such as non-zero capacities, summary bounds and parseable addresses.

use tessera_core::types::{MAX_KEYWORDS, MAX_SUMMARY_CHARS};

use crate::diagnostic::ConfigError;
use crate::model::TesseraConfig;

/// Validate a deserialized configuration for semantic correctness.
///
/// Returns `Ok(())` if all validations pass, or `Err(Vec<ConfigError>)` with
/// all collected validation errors (does not fail fast).
pub fn validate_config(config: &TesseraConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let mut fail = |message: String| errors.push(ConfigError::Validation { message });

    if config.storage.database_path.trim().is_empty() {
        fail("storage.database_path must not be empty".to_string());
    }

    if config.pool.max_slots == 0 {
        fail("pool.max_slots must be at least 1".to_string());
    }

    if config.pool.slot_capacity_bytes == 0 {
        fail("pool.slot_capacity_bytes must be greater than 0".to_string());
    }

    if config.progression.max_capture_bytes > config.pool.slot_capacity_bytes {
        fail(format!(
            "progression.max_capture_bytes ({}) must not exceed pool.slot_capacity_bytes ({})",
            config.progression.max_capture_bytes, config.pool.slot_capacity_bytes
        ));
    }

    if config.progression.max_summary_chars == 0
        || config.progression.max_summary_chars > MAX_SUMMARY_CHARS
    {
        fail(format!(
            "progression.max_summary_chars must be between 1 and {MAX_SUMMARY_CHARS}, got {}",
            config.progression.max_summary_chars
        ));
    }

    if config.progression.keyword_count == 0 || config.progression.keyword_count > MAX_KEYWORDS {
        fail(format!(
            "progression.keyword_count must be between 1 and {MAX_KEYWORDS}, got {}",
            config.progression.keyword_count
        ));
    }

    if config.index.chunks_per_block == 0 {
        fail("index.chunks_per_block must be at least 1".to_string());
    }

    if config.index.cache_capacity == 0 {
        fail("index.cache_capacity must be at least 1".to_string());
    }

    for (name, weight) in [
        ("index.keyword_weight", config.index.keyword_weight),
        ("index.entity_weight", config.index.entity_weight),
        ("index.recency_weight", config.index.recency_weight),
        ("index.hot_slot_boost", config.index.hot_slot_boost),
    ] {
        if !weight.is_finite() || weight < 0.0 {
            fail(format!("{name} must be a non-negative number, got {weight}"));
        }
    }

    if !(config.index.recency_half_life_hours > 0.0) {
        fail(format!(
            "index.recency_half_life_hours must be positive, got {}",
            config.index.recency_half_life_hours
        ));
    }

    if config.router.broadcast_capacity == 0 {
        fail("router.broadcast_capacity must be at least 1".to_string());
    }

    for (tag, profile) in &config.router.providers {
        if tag.trim().is_empty() {
            fail("router.providers keys must not be empty".to_string());
        }
        if profile.max_size_bytes == 0 {
            fail(format!(
                "router.providers.{tag}.max_size_bytes must be greater than 0"
            ));
        }
    }

    if config.overflow.max_retries == 0 {
        fail("overflow.max_retries must be at least 1".to_string());
    }

    if config.overflow.drain_interval_secs == 0 {
        fail("overflow.drain_interval_secs must be at least 1".to_string());
    }

    if config.crypto.key_rotation_secs == 0 {
        fail("crypto.key_rotation_secs must be at least 1".to_string());
    }

    if config.crypto.kdf_memory_cost < 32768 {
        fail(format!(
            "crypto.kdf_memory_cost must be at least 32768 (32 MiB), got {}",
            config.crypto.kdf_memory_cost
        ));
    }

    if config.crypto.kdf_iterations < 2 {
        fail(format!(
            "crypto.kdf_iterations must be at least 2, got {}",
            config.crypto.kdf_iterations
        ));
    }

    if config.crypto.kdf_parallelism < 1 {
        fail(format!(
            "crypto.kdf_parallelism must be at least 1, got {}",
            config.crypto.kdf_parallelism
        ));
    }

    if config
        .bridge
        .listen_address
        .parse::<std::net::SocketAddr>()
        .is_err()
    {
        fail(format!(
            "bridge.listen_address `{}` is not a valid socket address",
            config.bridge.listen_address
        ));
    }

    if let Some(addr) = &config.bridge.persistence_address {
        if addr.trim().is_empty() || !addr.contains(':') {
            fail(format!(
                "bridge.persistence_address `{addr}` must be host:port"
            ));
        }
    }

    if config.bridge.max_frame_bytes < 1024 {
        fail(format!(
            "bridge.max_frame_bytes must be at least 1024, got {}",
            config.bridge.max_frame_bytes
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
