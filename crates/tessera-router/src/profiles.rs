// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-provider normalization profiles.

use std::collections::BTreeMap;

use tessera_config::model::{ProviderProfileConfig, RouterConfig};

/// Profile used for provider tags with no entry of their own.
pub const DEFAULT_PROFILE: &str = "default";

/// Resolved profile for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub name: String,
    pub max_size_bytes: usize,
    pub compress: bool,
    pub priority_bias: i32,
}

/// Built-in profiles: (tag, max bytes, compress, bias).
const BUILT_IN: &[(&str, usize, bool, i32)] = &[
    ("chatgpt", 32 * 1024, true, 0),
    ("claude", 64 * 1024, true, 0),
    ("gemini", 32 * 1024, true, 0),
    ("perplexity", 16 * 1024, true, -1),
    (DEFAULT_PROFILE, 32 * 1024, true, 0),
];

/// Lookup table of provider profiles.
#[derive(Debug, Clone)]
pub struct ProviderProfiles {
    profiles: BTreeMap<String, ProviderProfileConfig>,
}

impl ProviderProfiles {
    /// Built-in profiles overlaid with `[router.providers]` entries.
    pub fn from_config(config: &RouterConfig) -> Self {
        let mut profiles: BTreeMap<String, ProviderProfileConfig> = BUILT_IN
            .iter()
            .map(|&(tag, max_size_bytes, compress, priority_bias)| {
                (
                    tag.to_string(),
                    ProviderProfileConfig {
                        max_size_bytes,
                        compress,
                        priority_bias,
                    },
                )
            })
            .collect();
        for (tag, profile) in &config.providers {
            profiles.insert(tag.to_lowercase(), profile.clone());
        }
        Self { profiles }
    }

    /// Profile for `provider_tag` (case-insensitive), falling back to `default`.
    pub fn resolve(&self, provider_tag: &str) -> ProviderProfile {
        let tag = provider_tag.trim().to_lowercase();
        let (name, profile) = match self.profiles.get_key_value(&tag) {
            Some(found) => found,
            None => match self.profiles.get_key_value(DEFAULT_PROFILE) {
                Some(found) => found,
                None => {
                    return ProviderProfile {
                        name: DEFAULT_PROFILE.to_string(),
                        max_size_bytes: 32 * 1024,
                        compress: true,
                        priority_bias: 0,
                    };
                }
            },
        };
        ProviderProfile {
            name: name.clone(),
            max_size_bytes: profile.max_size_bytes,
            compress: profile.compress,
            priority_bias: profile.priority_bias,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tags_resolve_case_insensitively() {
        let profiles = ProviderProfiles::from_config(&RouterConfig::default());
        let claude = profiles.resolve("Claude");
        assert_eq!(claude.name, "claude");
        assert_eq!(claude.max_size_bytes, 64 * 1024);
        assert_eq!(profiles.resolve("perplexity").priority_bias, -1);
    }

    #[test]
    fn unknown_tags_use_default() {
        let profiles = ProviderProfiles::from_config(&RouterConfig::default());
        assert_eq!(profiles.resolve("mistral").name, DEFAULT_PROFILE);
    }

    #[test]
    fn config_overrides_built_ins() {
        let mut config = RouterConfig::default();
        config.providers.insert(
            "ChatGPT".to_string(),
            ProviderProfileConfig {
                max_size_bytes: 100,
                compress: false,
                priority_bias: 2,
            },
        );
        let profile = ProviderProfiles::from_config(&config).resolve("chatgpt");
        assert_eq!(profile.max_size_bytes, 100);
        assert!(!profile.compress);
        assert_eq!(profile.priority_bias, 2);
    }
}
