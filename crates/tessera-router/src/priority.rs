// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Heuristic priority scoring of captured content.
//!
//! Scores text into Critical/High/Medium/Low using keyword and shape signals
//! plus the provider's priority bias. No model call, no I/O.

use serde::{Deserialize, Serialize};

/// Priority levels, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Routing weight of the level.
    pub fn weight(self) -> f64 {
        match self {
            Priority::Critical => 1.0,
            Priority::High => 0.75,
            Priority::Medium => 0.5,
            Priority::Low => 0.25,
        }
    }

    /// Whether content at this level must also go to the backup store.
    pub fn backup_required(self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Result of scoring one piece of content.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityAssessment {
    pub level: Priority,
    pub score: i32,
    /// Human-readable reason for the level.
    pub reason: &'static str,
}

impl PriorityAssessment {
    pub fn weight(&self) -> f64 {
        self.level.weight()
    }

    pub fn backup_required(&self) -> bool {
        self.level.backup_required()
    }
}

/// Content that must never be lost (contains, case-insensitive).
const CRITICAL_INDICATORS: &[&str] = &[
    "password", "passphrase", "api key", "private key", "secret", "emergency",
    "urgent", "critical", "do not lose", "security incident",
];

/// Content worth a redundant copy (contains, case-insensitive).
const HIGH_INDICATORS: &[&str] = &[
    "deadline", "decision", "decided", "action item", "todo", "important",
    "remember", "contract", "invoice", "meeting", "follow up", "follow-up",
];

/// Throwaway acknowledgements (exact match, case-insensitive).
const LOW_EXACT: &[&str] = &[
    "ok", "okay", "thanks", "thank you", "yes", "no", "sure", "cool", "nice",
    "got it", "lol", "yep", "nope",
];

/// Scores content with zero cost and zero latency.
#[derive(Debug, Clone, Default)]
pub struct PriorityScorer;

impl PriorityScorer {
    pub fn new() -> Self {
        Self
    }

    /// Score `text`. `finalized` content (has a canonical record) is nudged up.
    pub fn assess(&self, text: &str, finalized: bool, bias: i32) -> PriorityAssessment {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return PriorityAssessment {
                level: Priority::Low,
                score: -3,
                reason: "empty content",
            };
        }

        let lower = trimmed.to_lowercase();
        let mut score: i32 = 0;

        // Signal 1: length
        score += Self::length_score(trimmed.split_whitespace().count());

        // Signal 2: throwaway acknowledgements
        let bare = lower.trim_end_matches(['.', '!']);
        if LOW_EXACT.iter().any(|p| bare == *p) {
            score -= 3;
        }

        // Signal 3: high-value indicators
        let high_hit = HIGH_INDICATORS.iter().any(|p| lower.contains(p));
        if high_hit {
            score += 2;
        }

        // Signal 4: critical indicators
        let critical_hit = CRITICAL_INDICATORS.iter().any(|p| lower.contains(p));
        if critical_hit {
            score += 4;
        }

        // Signal 5: canonical record present
        if finalized {
            score += 1;
        }

        score += bias;

        let (level, reason) = Self::score_to_level(score, critical_hit, high_hit);
        PriorityAssessment {
            level,
            score,
            reason,
        }
    }

    fn length_score(word_count: usize) -> i32 {
        match word_count {
            0..=3 => -1,
            4..=40 => 0,
            _ => 1,
        }
    }

    fn score_to_level(score: i32, critical_hit: bool, high_hit: bool) -> (Priority, &'static str) {
        if score >= 4 {
            let reason = if critical_hit {
                "critical indicators"
            } else {
                "accumulated signals"
            };
            (Priority::Critical, reason)
        } else if score >= 2 {
            let reason = if high_hit {
                "high-value indicators"
            } else {
                "accumulated signals"
            };
            (Priority::High, reason)
        } else if score >= 0 {
            (Priority::Medium, "no strong signal")
        } else {
            (Priority::Low, "low-value content")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_match_levels() {
        assert_eq!(Priority::Critical.weight(), 1.0);
        assert_eq!(Priority::High.weight(), 0.75);
        assert_eq!(Priority::Medium.weight(), 0.5);
        assert_eq!(Priority::Low.weight(), 0.25);
    }

    #[test]
    fn backup_required_for_critical_and_high_only() {
        assert!(Priority::Critical.backup_required());
        assert!(Priority::High.backup_required());
        assert!(!Priority::Medium.backup_required());
        assert!(!Priority::Low.backup_required());
    }

    #[test]
    fn secrets_are_critical() {
        let scorer = PriorityScorer::new();
        let result = scorer.assess("the staging database password is in the team vault", false, 0);
        assert_eq!(result.level, Priority::Critical);
        assert_eq!(result.reason, "critical indicators");
    }

    #[test]
    fn decisions_are_high() {
        let scorer = PriorityScorer::new();
        let result = scorer.assess("We decided to move the launch deadline to Friday", false, 0);
        assert_eq!(result.level, Priority::High);
    }

    #[test]
    fn plain_prose_is_medium() {
        let scorer = PriorityScorer::new();
        let result = scorer.assess("The new layout uses a two column grid for the sidebar", false, 0);
        assert_eq!(result.level, Priority::Medium);
    }

    #[test]
    fn acknowledgements_are_low() {
        let scorer = PriorityScorer::new();
        assert_eq!(scorer.assess("thanks!", false, 0).level, Priority::Low);
        assert_eq!(scorer.assess("   ", false, 0).level, Priority::Low);
    }

    #[test]
    fn provider_bias_shifts_level() {
        let scorer = PriorityScorer::new();
        let text = "The new layout uses a two column grid for the sidebar";
        assert_eq!(scorer.assess(text, false, -1).level, Priority::Low);
        assert_eq!(scorer.assess(text, true, 1).level, Priority::High);
    }
}
