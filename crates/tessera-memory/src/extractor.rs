// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic derivation of the Square 9 canonical record.
//!
//! Summarization picks the longest sentence of the latest revision, keywords
//! are ranked by frequency then first position, and entities come from a
//! small set of capitalization and calendar patterns. Same input, same
//! record: no model call, no randomness.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use tessera_config::model::ProgressionConfig;
use tessera_core::types::{CanonicalRecord, EntityMap, RevisionSequence, Square};

static SENTENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^.!?\n]+[.!?]*").unwrap());

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+(?:['-][\p{L}\p{N}]+)*").unwrap());

static ISO_DATE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").unwrap());

static MONTH_DAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:Jan(?:uary)?|Feb(?:ruary)?|Mar(?:ch)?|Apr(?:il)?|May|June?|July?|Aug(?:ust)?|Sep(?:t(?:ember)?)?|Oct(?:ober)?|Nov(?:ember)?|Dec(?:ember)?)\.?\s+\d{1,2}(?:st|nd|rd|th)?\b|\b\d{1,2}(?:st|nd|rd|th)?\s+(?:January|February|March|April|May|June|July|August|September|October|November|December)\b",
    )
    .unwrap()
});

static DAY_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:monday|tuesday|wednesday|thursday|friday|saturday|sunday|today|tomorrow|yesterday)\b",
    )
    .unwrap()
});

static PLACE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:in|at|from|to|near)\s+([A-Z][\p{L}]+(?:\s+[A-Z][\p{L}]+)*)").unwrap()
});

static NAME_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][\p{Ll}]+(?:[ \t]+[A-Z][\p{Ll}]+)+\b").unwrap());

static CAPITALIZED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][\p{L}\p{N}]+\b").unwrap());

static HASHTAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#[\p{L}\p{N}_]+").unwrap());

const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "all", "also", "am", "an", "and", "any", "are",
    "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
    "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for",
    "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers", "him",
    "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself", "just", "me", "more",
    "most", "my", "no", "nor", "not", "now", "of", "off", "on", "once", "only", "or", "other",
    "our", "ours", "out", "over", "own", "same", "she", "should", "so", "some", "such", "than",
    "that", "the", "their", "them", "then", "there", "these", "they", "this", "those",
    "through", "to", "too", "under", "until", "up", "very", "was", "we", "were", "what",
    "when", "where", "which", "while", "who", "whom", "why", "will", "with", "would", "you",
    "your", "yours",
];

const CALENDAR_WORDS: &[&str] = &[
    "january", "february", "march", "april", "may", "june", "july", "august", "september",
    "october", "november", "december", "monday", "tuesday", "wednesday", "thursday", "friday",
    "saturday", "sunday", "today", "tomorrow", "yesterday",
];

fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word.to_lowercase().as_str())
}

fn is_calendar_word(word: &str) -> bool {
    CALENDAR_WORDS.contains(&word.to_lowercase().as_str())
}

/// Derives canonical records from revision sequences.
#[derive(Debug, Clone)]
pub struct Extractor {
    max_summary_chars: usize,
    keyword_count: usize,
    min_keyword_len: usize,
}

impl Extractor {
    pub fn new(config: &ProgressionConfig) -> Self {
        Self {
            max_summary_chars: config.max_summary_chars,
            keyword_count: config.keyword_count,
            min_keyword_len: config.min_keyword_len,
        }
    }

    /// Builds Square 9 from the latest revision and the full square history.
    pub fn canonical(&self, revisions: &RevisionSequence, now: DateTime<Utc>) -> CanonicalRecord {
        let latest = revisions.latest();
        CanonicalRecord {
            summary: self.summarize(&latest.content),
            keywords: self.keywords(&latest.content),
            entities: entities(&latest.content),
            content_hash: content_hash(revisions.squares()),
            source_square: latest.index,
            created_at: now,
        }
    }

    /// Longest sentence, cut to the character limit on a char boundary.
    pub fn summarize(&self, text: &str) -> String {
        let mut best = "";
        let mut best_len = 0;
        for m in SENTENCE.find_iter(text) {
            let sentence = m.as_str().trim();
            let len = sentence.chars().count();
            if len > best_len {
                best = sentence;
                best_len = len;
            }
        }
        if best.is_empty() {
            best = text.trim();
        }
        best.chars()
            .take(self.max_summary_chars)
            .collect::<String>()
            .trim_end()
            .to_string()
    }

    /// Top keywords by frequency, ties broken by first occurrence.
    pub fn keywords(&self, text: &str) -> Vec<String> {
        // word -> (count, first position)
        let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
        for (position, m) in WORD.find_iter(text).enumerate() {
            let word = m.as_str().to_lowercase();
            if word.chars().count() < self.min_keyword_len
                || is_stop_word(&word)
                || word.chars().all(|c| c.is_numeric())
            {
                continue;
            }
            counts
                .entry(word)
                .and_modify(|(count, _)| *count += 1)
                .or_insert((1, position));
        }

        let mut ranked: Vec<(String, usize, usize)> = counts
            .into_iter()
            .map(|(word, (count, first))| (word, count, first))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        ranked
            .into_iter()
            .take(self.keyword_count)
            .map(|(word, _, _)| word)
            .collect()
    }
}

/// Lightweight typed entity extraction.
pub fn entities(text: &str) -> EntityMap {
    let mut claimed: Vec<Range<usize>> = Vec::new();

    let mut dates: Vec<(usize, String)> = Vec::new();
    for pattern in [&*ISO_DATE, &*MONTH_DAY, &*DAY_WORD] {
        for m in pattern.find_iter(text) {
            if overlaps(&claimed, &m.range()) {
                continue;
            }
            claimed.push(m.range());
            dates.push((m.start(), m.as_str().to_string()));
        }
    }
    dates.sort_by_key(|(pos, _)| *pos);

    let mut places = Vec::new();
    for caps in PLACE.captures_iter(text) {
        let Some(m) = caps.get(1) else { continue };
        let first = m.as_str().split_whitespace().next().unwrap_or_default();
        if is_calendar_word(first) || overlaps(&claimed, &m.range()) {
            continue;
        }
        claimed.push(m.range());
        places.push(m.as_str().to_string());
    }

    let mut people = Vec::new();
    for m in NAME_RUN.find_iter(text) {
        if overlaps(&claimed, &m.range()) {
            continue;
        }
        let words: Vec<&str> = m.as_str().split_whitespace().collect();
        if words.iter().any(|w| is_calendar_word(w)) {
            continue;
        }
        let lead = words.iter().take_while(|w| is_stop_word(w)).count();
        let name = &words[lead..];
        if name.len() < 2 {
            continue;
        }
        // Claim only the name itself so a leading "The" can still be skipped below.
        let start = m.start() + m.as_str().find(name[0]).unwrap_or(0);
        claimed.push(start..m.end());
        people.push(name.join(" "));
    }

    let mut concepts: Vec<(usize, String)> = Vec::new();
    for m in CAPITALIZED.find_iter(text) {
        let word = m.as_str();
        if overlaps(&claimed, &m.range())
            || is_stop_word(word)
            || is_calendar_word(word)
            || at_sentence_start(text, m.start())
        {
            continue;
        }
        concepts.push((m.start(), word.to_string()));
    }
    for m in HASHTAG.find_iter(text) {
        concepts.push((m.start(), m.as_str().to_string()));
    }
    concepts.sort_by_key(|(pos, _)| *pos);

    EntityMap {
        people: dedup(people),
        places: dedup(places),
        concepts: dedup(concepts.into_iter().map(|(_, s)| s).collect()),
        dates: dedup(dates.into_iter().map(|(_, s)| s).collect()),
    }
}

/// Hex SHA-256 over squares 1-8 in order.
pub fn content_hash(squares: &[Square]) -> String {
    let mut hasher = Sha256::new();
    for square in squares {
        hasher.update([square.index]);
        hasher.update(square.content.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

fn overlaps(claimed: &[Range<usize>], range: &Range<usize>) -> bool {
    claimed
        .iter()
        .any(|c| c.start < range.end && range.start < c.end)
}

fn at_sentence_start(text: &str, pos: usize) -> bool {
    let before = text[..pos].trim_end();
    before.is_empty() || before.ends_with(['.', '!', '?', ':', '\n'])
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}
