// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lexical ranking of ThinTags.
//!
//! score = keyword overlap + entity overlap + recency decay + hot-slot boost

use chrono::{DateTime, Utc};
use tessera_config::model::IndexConfig;
use tessera_core::types::ThinTag;

/// Summary-only matches count for this fraction of a keyword match.
const SUMMARY_MATCH_FACTOR: f64 = 0.25;

/// Lowercased query terms.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '#' && c != '-')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();
    terms.dedup();
    terms
}

pub struct Scorer<'a> {
    config: &'a IndexConfig,
    max_slots: u8,
    now: DateTime<Utc>,
}

impl<'a> Scorer<'a> {
    pub fn new(config: &'a IndexConfig, max_slots: u8, now: DateTime<Utc>) -> Self {
        Self {
            config,
            max_slots: max_slots.max(1),
            now,
        }
    }

    /// Term overlap with keywords, entities and the summary. Zero means the
    /// tag does not match the query at all.
    pub fn overlap(&self, terms: &[String], tag: &ThinTag) -> f64 {
        let summary = tag.summary.to_lowercase();
        let mut score = 0.0;
        for term in terms {
            let keyword_hit = tag.keywords.iter().any(|k| k == term);
            let entity_hit = tag.entities.iter().any(|(_, entity)| {
                entity
                    .split_whitespace()
                    .any(|word| word.trim_start_matches('#').eq_ignore_ascii_case(term.trim_start_matches('#')))
            });
            if keyword_hit {
                score += self.config.keyword_weight;
            }
            if entity_hit {
                score += self.config.entity_weight;
            }
            if !keyword_hit && !entity_hit && summary.contains(term.as_str()) {
                score += self.config.keyword_weight * SUMMARY_MATCH_FACTOR;
            }
        }
        score
    }

    /// Exponential decay on the tag's last update.
    pub fn recency(&self, tag: &ThinTag) -> f64 {
        let age_hours = (self.now - tag.updated_at).num_seconds().max(0) as f64 / 3600.0;
        let half_life = self.config.recency_half_life_hours.max(f64::EPSILON);
        self.config.recency_weight * 0.5f64.powf(age_hours / half_life)
    }

    /// Lower slot, larger boost. Cold or sealed-only tags get nothing.
    pub fn hot_boost(&self, slot: Option<u8>) -> f64 {
        match slot {
            Some(slot) => {
                let rank = f64::from(self.max_slots.saturating_sub(slot) + 1);
                self.config.hot_slot_boost * rank / f64::from(self.max_slots)
            }
            None => 0.0,
        }
    }

    /// Full score, or `None` if the query has terms and none of them match.
    pub fn score(&self, terms: &[String], tag: &ThinTag, slot: Option<u8>) -> Option<f64> {
        let overlap = self.overlap(terms, tag);
        if !terms.is_empty() && overlap <= 0.0 {
            return None;
        }
        Some(overlap + self.recency(tag) + self.hot_boost(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tessera_core::types::{BlockAddress, EntityMap, FragmentId, SessionId};

    fn tag(keywords: &[&str], updated_at: DateTime<Utc>) -> ThinTag {
        ThinTag {
            address: BlockAddress { block: 1, chunk: 1 }.thin(),
            fragment_id: FragmentId::from("f"),
            session_id: SessionId::from("s"),
            provider_tag: "claude".into(),
            topic: None,
            summary: "Notes about the storage migration".into(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            entities: EntityMap {
                people: vec!["Alice Johnson".into()],
                concepts: vec!["#infra".into()],
                ..EntityMap::default()
            },
            content_hash: String::new(),
            size_bytes: 10,
            created_at: updated_at,
            updated_at,
        }
    }

    #[test]
    fn query_terms_are_lowercased_and_split() {
        assert_eq!(query_terms("Redis, CLUSTER  #infra"), vec!["redis", "cluster", "#infra"]);
    }

    #[test]
    fn keyword_and_entity_hits_add_weights() {
        let config = IndexConfig::default();
        let now = Utc::now();
        let scorer = Scorer::new(&config, 5, now);
        let t = tag(&["redis", "alice"], now);
        let overlap = scorer.overlap(&query_terms("redis alice"), &t);
        assert!((overlap - (2.0 * config.keyword_weight + config.entity_weight)).abs() < 1e-9);
        assert!(scorer.overlap(&query_terms("#infra"), &t) > 0.0);
    }

    #[test]
    fn summary_only_match_is_weaker() {
        let config = IndexConfig::default();
        let now = Utc::now();
        let scorer = Scorer::new(&config, 5, now);
        let t = tag(&["redis"], now);
        let summary = scorer.overlap(&query_terms("migration"), &t);
        let keyword = scorer.overlap(&query_terms("redis"), &t);
        assert!(summary > 0.0 && summary < keyword);
    }

    #[test]
    fn non_matching_query_scores_none() {
        let config = IndexConfig::default();
        let now = Utc::now();
        let scorer = Scorer::new(&config, 5, now);
        assert!(scorer.score(&query_terms("kafka"), &tag(&["redis"], now), None).is_none());
        assert!(scorer.score(&[], &tag(&["redis"], now), None).is_some());
    }

    #[test]
    fn recency_halves_per_half_life() {
        let config = IndexConfig::default();
        let now = Utc::now();
        let scorer = Scorer::new(&config, 5, now);
        let fresh = scorer.recency(&tag(&[], now));
        let old = scorer.recency(&tag(
            &[],
            now - Duration::hours(config.recency_half_life_hours as i64),
        ));
        assert!((fresh - config.recency_weight).abs() < 1e-6);
        assert!((old - config.recency_weight / 2.0).abs() < 1e-6);
    }

    #[test]
    fn hotter_slots_boost_more() {
        let config = IndexConfig::default();
        let scorer = Scorer::new(&config, 5, Utc::now());
        assert!(scorer.hot_boost(Some(1)) > scorer.hot_boost(Some(5)));
        assert!(scorer.hot_boost(Some(5)) > scorer.hot_boost(None));
        assert!((scorer.hot_boost(Some(1)) - config.hot_slot_boost).abs() < 1e-9);
    }
}
