// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration loader using Figment for layered config merging.
//!
//! Supports XDG hierarchy: `./tessera.toml` > `~/.config/tessera/tessera.toml` > `/etc/tessera/tessera.toml`
//! with environment variable overrides via `TESSERA_` prefix.

#![allow(clippy::result_large_err)] // figment::Error is external and cannot be boxed without wrapper

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

use crate::model::TesseraConfig;

/// Top-level sections that environment variables may address.
pub(crate) const SECTIONS: &[&str] = &[
    "instance",
    "storage",
    "pool",
    "progression",
    "index",
    "router",
    "overflow",
    "crypto",
    "bridge",
];

/// System-wide config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/tessera/tessera.toml";

/// Local config file, relative to the working directory.
pub const LOCAL_CONFIG_FILE: &str = "tessera.toml";

/// User config file under the XDG config directory, if one exists.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tessera").join(LOCAL_CONFIG_FILE))
}

/// Load configuration from the standard XDG hierarchy with env var overrides.
///
/// Merge order (later overrides earlier):
/// 1. Compiled defaults
/// 2. `/etc/tessera/tessera.toml` (system-wide)
/// 3. `~/.config/tessera/tessera.toml` (user XDG config)
/// 4. `./tessera.toml` (local directory)
/// 5. `TESSERA_*` environment variables
pub fn load_config() -> Result<TesseraConfig, figment::Error> {
    build_figment().extract()
}

/// Load configuration from a TOML string only (no XDG lookup, no env).
///
/// Used for testing and explicit configuration.
pub fn load_config_from_str(toml_content: &str) -> Result<TesseraConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(TesseraConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()
}

/// Load configuration from a specific file path with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<TesseraConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(TesseraConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()
}

/// Load configuration from TOML text read by the caller, with env var
/// overrides. Used for sealed files, which are opened before parsing.
pub fn load_config_from_document(toml_content: &str) -> Result<TesseraConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(TesseraConfig::default()))
        .merge(Toml::string(toml_content))
        .merge(env_provider())
        .extract()
}

/// Build the Figment used internally for config loading.
///
/// Returns the Figment before extraction so callers can inspect metadata.
pub fn build_figment() -> Figment {
    Figment::new()
        .merge(Serialized::defaults(TesseraConfig::default()))
        .merge(Toml::file(SYSTEM_CONFIG_PATH))
        .merge(Toml::file(user_config_path().unwrap_or_default()))
        .merge(Toml::file(LOCAL_CONFIG_FILE))
        .merge(env_provider())
}

/// Maps a lowercased, prefix-stripped env var name onto a dotted config key.
///
/// Only the first underscore after a known section name becomes a dot, so
/// `TESSERA_POOL_SLOT_CAPACITY_BYTES` maps to `pool.slot_capacity_bytes`.
/// Names that do not start with a section are passed through unchanged and
/// rejected by `deny_unknown_fields`.
pub(crate) fn map_env_key(key: &str) -> String {
    for section in SECTIONS {
        if let Some(rest) = key.strip_prefix(section) {
            if let Some(field) = rest.strip_prefix('_') {
                return format!("{section}.{field}");
            }
        }
    }
    key.to_string()
}

/// Create the environment variable provider using explicit `map()` for section-to-dot mapping.
///
/// Uses `Env::map()` rather than `Env::split("_")` because field names contain
/// underscores themselves.
fn env_provider() -> Env {
    // Passphrases are secrets and never config keys.
    Env::prefixed("TESSERA_")
        .ignore(&["key_passphrase", "config_passphrase"])
        .map(|key| map_env_key(key.as_str()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_keys_map_to_sections() {
        assert_eq!(
            map_env_key("pool_slot_capacity_bytes"),
            "pool.slot_capacity_bytes"
        );
        assert_eq!(map_env_key("overflow_max_retries"), "overflow.max_retries");
        assert_eq!(
            map_env_key("bridge_persistence_address"),
            "bridge.persistence_address"
        );
        assert_eq!(map_env_key("instance_log_level"), "instance.log_level");
    }

    #[test]
    fn unknown_env_keys_pass_through() {
        assert_eq!(map_env_key("nonsense_value"), "nonsense_value");
    }

    #[test]
    fn env_overrides_toml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("tessera.toml", "[pool]\nmax_slots = 3\n")?;
            jail.set_env("TESSERA_POOL_MAX_SLOTS", "7");
            jail.set_env("TESSERA_OVERFLOW_COOLDOWN_SECS", "2");
            let config = load_config_from_path(Path::new("tessera.toml"))?;
            assert_eq!(config.pool.max_slots, 7);
            assert_eq!(config.overflow.cooldown_secs, 2);
            Ok(())
        });
    }

    #[test]
    fn passphrase_env_is_not_a_config_key() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("tessera.toml", "")?;
            jail.set_env("TESSERA_KEY_PASSPHRASE", "hunter2");
            let config = load_config_from_path(Path::new("tessera.toml"))?;
            assert_eq!(config.crypto.passphrase_env, "TESSERA_KEY_PASSPHRASE");
            Ok(())
        });
    }

    #[test]
    fn opened_document_still_takes_env_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("TESSERA_CONFIG_PASSPHRASE", "hunter2");
            jail.set_env("TESSERA_POOL_SLOT_CAPACITY_BYTES", "2048");
            let config = load_config_from_document("[pool]\nmax_slots = 4\n")?;
            assert_eq!(config.pool.max_slots, 4);
            assert_eq!(config.pool.slot_capacity_bytes, 2048);
            Ok(())
        });
    }
}
