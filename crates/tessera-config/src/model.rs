// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs for the Tessera memory pool.
//!
//! All structs use `#[serde(deny_unknown_fields)]` to reject unrecognized
//! config keys at startup, providing actionable error messages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Top-level Tessera configuration.
///
/// Loaded from TOML files following XDG hierarchy, with environment variable overrides.
/// All sections are optional and default to sensible values.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TesseraConfig {
    /// Instance identity and logging.
    #[serde(default)]
    pub instance: InstanceConfig,

    /// Local SQLite storage (retry queue, snapshots, key history, cold store).
    #[serde(default)]
    pub storage: StorageConfig,

    /// Hot slot pool sizing.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Revision progression and canonical record derivation.
    #[serde(default)]
    pub progression: ProgressionConfig,

    /// Fat store / thin index settings and search weights.
    #[serde(default)]
    pub index: IndexConfig,

    /// Fork router settings and provider profiles.
    #[serde(default)]
    pub router: RouterConfig,

    /// Overflow hand-off and retry queue settings.
    #[serde(default)]
    pub overflow: OverflowConfig,

    /// Block encryption and key rotation settings.
    #[serde(default)]
    pub crypto: CryptoConfig,

    /// Framed transport to the remote persistence process.
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// Instance identity and logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    /// Display name of this instance, reported in `status`.
    #[serde(default = "default_instance_name")]
    pub name: String,

    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: default_instance_name(),
            log_level: default_log_level(),
        }
    }
}

fn default_instance_name() -> String {
    "tessera".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Enable WAL (Write-Ahead Logging) mode for SQLite.
    #[serde(default = "default_wal_mode")]
    pub wal_mode: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            wal_mode: default_wal_mode(),
        }
    }
}

fn default_database_path() -> String {
    dirs::data_dir()
        .map(|p| p.join("tessera").join("tessera.db"))
        .unwrap_or_else(|| std::path::PathBuf::from("tessera.db"))
        .to_string_lossy()
        .into_owned()
}

fn default_wal_mode() -> bool {
    true
}

/// Hot slot pool configuration.
///
/// Total pool capacity is `max_slots * slot_capacity_bytes`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Number of slots; slot 1 is the hottest.
    #[serde(default = "default_max_slots")]
    pub max_slots: u8,

    /// Byte capacity of each slot.
    #[serde(default = "default_slot_capacity_bytes")]
    pub slot_capacity_bytes: u64,

    /// Write a sealed pool snapshot after every admit/touch.
    #[serde(default = "default_snapshot_on_change")]
    pub snapshot_on_change: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_slots: default_max_slots(),
            slot_capacity_bytes: default_slot_capacity_bytes(),
            snapshot_on_change: default_snapshot_on_change(),
        }
    }
}

fn default_max_slots() -> u8 {
    5
}

fn default_slot_capacity_bytes() -> u64 {
    64 * 1024
}

fn default_snapshot_on_change() -> bool {
    true
}

/// Progression (Square 1-9) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProgressionConfig {
    /// Maximum summary length in characters (capped at 150).
    #[serde(default = "default_max_summary_chars")]
    pub max_summary_chars: usize,

    /// Number of ranked keywords kept (capped at 5).
    #[serde(default = "default_keyword_count")]
    pub keyword_count: usize,

    /// Captures or edits larger than this are rejected.
    #[serde(default = "default_max_capture_bytes")]
    pub max_capture_bytes: u64,

    /// Shortest token considered as a keyword.
    #[serde(default = "default_min_keyword_len")]
    pub min_keyword_len: usize,
}

impl Default for ProgressionConfig {
    fn default() -> Self {
        Self {
            max_summary_chars: default_max_summary_chars(),
            keyword_count: default_keyword_count(),
            max_capture_bytes: default_max_capture_bytes(),
            min_keyword_len: default_min_keyword_len(),
        }
    }
}

fn default_max_summary_chars() -> usize {
    150
}

fn default_keyword_count() -> usize {
    5
}

fn default_max_capture_bytes() -> u64 {
    32 * 1024
}

fn default_min_keyword_len() -> usize {
    3
}

/// Dual index configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    /// Chunks per block when deriving `block.chunk` addresses.
    #[serde(default = "default_chunks_per_block")]
    pub chunks_per_block: u32,

    /// Capacity of the decrypted FatBlock cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Weight of a query term matching a keyword.
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,

    /// Weight of a query term matching an entity.
    #[serde(default = "default_entity_weight")]
    pub entity_weight: f64,

    /// Maximum contribution of recency to a score.
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,

    /// Age at which the recency contribution halves.
    #[serde(default = "default_recency_half_life_hours")]
    pub recency_half_life_hours: f64,

    /// Maximum boost for a fragment resident in slot 1.
    #[serde(default = "default_hot_slot_boost")]
    pub hot_slot_boost: f64,

    /// Results returned when the caller sets no limit.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            chunks_per_block: default_chunks_per_block(),
            cache_capacity: default_cache_capacity(),
            keyword_weight: default_keyword_weight(),
            entity_weight: default_entity_weight(),
            recency_weight: default_recency_weight(),
            recency_half_life_hours: default_recency_half_life_hours(),
            hot_slot_boost: default_hot_slot_boost(),
            max_results: default_max_results(),
        }
    }
}

fn default_chunks_per_block() -> u32 {
    100
}

fn default_cache_capacity() -> usize {
    64
}

fn default_keyword_weight() -> f64 {
    1.0
}

fn default_entity_weight() -> f64 {
    0.75
}

fn default_recency_weight() -> f64 {
    0.5
}

fn default_recency_half_life_hours() -> f64 {
    24.0
}

fn default_hot_slot_boost() -> f64 {
    0.5
}

fn default_max_results() -> usize {
    20
}

/// Per-provider normalization profile.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderProfileConfig {
    /// Content is truncated to this many bytes during normalization.
    pub max_size_bytes: usize,

    /// Whether backup payloads from this provider may be compressed.
    #[serde(default = "default_true")]
    pub compress: bool,

    /// Added to the priority score of every message from this provider.
    #[serde(default)]
    pub priority_bias: i32,
}

fn default_true() -> bool {
    true
}

/// Fork router configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    /// Provider profiles keyed by lowercase provider tag. Merged over the built-in profiles.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderProfileConfig>,

    /// Sessions idle longer than this stop receiving broadcasts.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,

    /// Capacity of the session broadcast channel.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Upper bound on an assembled context delivery block.
    #[serde(default = "default_context_max_chars")]
    pub context_max_chars: usize,

    /// Send critical/high priority content to the backup store.
    #[serde(default = "default_true")]
    pub backup_enabled: bool,

    /// Attempts made by the backoff-and-retry recovery strategy.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base delay of the backoff-and-retry recovery strategy.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            providers: BTreeMap::new(),
            session_idle_secs: default_session_idle_secs(),
            broadcast_capacity: default_broadcast_capacity(),
            context_max_chars: default_context_max_chars(),
            backup_enabled: true,
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

fn default_session_idle_secs() -> u64 {
    30 * 60
}

fn default_broadcast_capacity() -> usize {
    64
}

fn default_context_max_chars() -> usize {
    2000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

/// Overflow retry queue configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OverflowConfig {
    /// Delivery attempts before an entry is abandoned.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Minimum time between two attempts for the same entry.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Interval of the periodic queue drain.
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,
}

impl Default for OverflowConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            cooldown_secs: default_cooldown_secs(),
            drain_interval_secs: default_drain_interval_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_drain_interval_secs() -> u64 {
    15
}

/// Block encryption configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CryptoConfig {
    /// Session key rotation interval.
    #[serde(default = "default_key_rotation_secs")]
    pub key_rotation_secs: u64,

    /// Retired keys kept for decrypting older blocks.
    #[serde(default = "default_max_key_history")]
    pub max_key_history: usize,

    /// Environment variable holding the passphrase used to persist keys.
    /// Keys stay process-local when the variable is unset.
    #[serde(default = "default_passphrase_env")]
    pub passphrase_env: String,

    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB).
    #[serde(default = "default_kdf_memory_cost")]
    pub kdf_memory_cost: u32,

    /// Argon2id iteration count (default: 3).
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    /// Argon2id parallelism lanes (default: 4).
    #[serde(default = "default_kdf_parallelism")]
    pub kdf_parallelism: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_rotation_secs: default_key_rotation_secs(),
            max_key_history: default_max_key_history(),
            passphrase_env: default_passphrase_env(),
            kdf_memory_cost: default_kdf_memory_cost(),
            kdf_iterations: default_kdf_iterations(),
            kdf_parallelism: default_kdf_parallelism(),
        }
    }
}

fn default_key_rotation_secs() -> u64 {
    60 * 60
}

fn default_max_key_history() -> usize {
    24
}

fn default_passphrase_env() -> String {
    "TESSERA_KEY_PASSPHRASE".to_string()
}

fn default_kdf_memory_cost() -> u32 {
    65536 // 64 MiB
}

fn default_kdf_iterations() -> u32 {
    3
}

fn default_kdf_parallelism() -> u32 {
    4
}

/// Framed transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Address `tessera serve` listens on for ping/status/search/inject requests.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Address of the remote persistence process. When unset, evicted
    /// fragments go to the local SQLite cold store.
    #[serde(default)]
    pub persistence_address: Option<String>,

    /// Frames larger than this are rejected.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Timeout for one request/reply exchange.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            persistence_address: None,
            max_frame_bytes: default_max_frame_bytes(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_listen_address() -> String {
    "127.0.0.1:7420".to_string()
}

fn default_max_frame_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_request_timeout_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = TesseraConfig::default();
        assert_eq!(config.instance.name, "tessera");
        assert_eq!(config.pool.max_slots, 5);
        assert_eq!(config.progression.max_summary_chars, 150);
        assert_eq!(config.progression.keyword_count, 5);
        assert_eq!(config.overflow.max_retries, 5);
        assert!(config.bridge.persistence_address.is_none());
        assert!(config.router.providers.is_empty());
    }

    #[test]
    fn provider_profiles_deserialize() {
        let toml_str = r#"
[router.providers.claude]
max_size_bytes = 4096
priority_bias = 1

[router.providers.perplexity]
max_size_bytes = 1024
compress = false
"#;
        let config: TesseraConfig = toml::from_str(toml_str).unwrap();
        let claude = &config.router.providers["claude"];
        assert_eq!(claude.max_size_bytes, 4096);
        assert!(claude.compress);
        assert_eq!(claude.priority_bias, 1);
        assert!(!config.router.providers["perplexity"].compress);
    }

    #[test]
    fn unknown_field_in_section_is_rejected() {
        let result = toml::from_str::<TesseraConfig>("[pool]\nmax_slot = 3\n");
        assert!(result.is_err());
    }
}
