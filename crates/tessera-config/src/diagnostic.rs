// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Config error diagnostics.
//!
//! Figment errors become [`ConfigError`]s rendered by miette. Unknown keys
//! get a Jaro-Winkler "did you mean" and the `TESSERA_*` variable that sets
//! the suggested key. Spans are resolved against the TOML text that was
//! parsed, which for sealed files is the unsealed document.

#![allow(unused_assignments)] // miette's Diagnostic derive generates code triggering this lint

use figment::error::Kind;
use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

use crate::loader::SECTIONS;

/// Catches `max_slot` -> `max_slots` and `coldown_secs` -> `cooldown_secs`.
const SUGGESTION_THRESHOLD: f64 = 0.75;

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("unknown configuration key `{key}`")]
    #[diagnostic(code(tessera::config::unknown_key), help("{help}"))]
    UnknownKey {
        key: String,
        suggestion: Option<String>,
        help: String,
        #[label("not a tessera setting")]
        span: Option<SourceSpan>,
        #[source_code]
        src: Option<NamedSource<String>>,
    },

    #[error("invalid type for `{key}`: {detail}")]
    #[diagnostic(code(tessera::config::invalid_type))]
    InvalidType {
        key: String,
        detail: String,
        #[label("wrong type here")]
        span: Option<SourceSpan>,
        #[source_code]
        src: Option<NamedSource<String>>,
    },

    /// Values that parse but break a pool, index or crypto constraint.
    #[error("validation error: {message}")]
    #[diagnostic(code(tessera::config::validation))]
    Validation { message: String },

    /// A sealed config file that could not be read or opened.
    #[error("cannot open sealed config `{path}`: {message}")]
    #[diagnostic(
        code(tessera::config::sealed),
        help("set TESSERA_CONFIG_PASSPHRASE to the passphrase used with `tessera config seal`")
    )]
    Sealed { path: String, message: String },

    #[error("configuration error: {0}")]
    #[diagnostic(code(tessera::config::other))]
    Other(String),
}

/// Convert every error carried by `err`. `toml_sources` pairs an origin
/// (file path or label) with the text that was parsed from it.
pub fn figment_to_config_errors(
    err: figment::Error,
    toml_sources: &[(String, String)],
) -> Vec<ConfigError> {
    err.into_iter()
        .map(|error| {
            let path: Vec<String> = error.path.iter().map(|s| s.to_string()).collect();
            match &error.kind {
                Kind::UnknownField(field, expected) => {
                    let suggestion = suggest_key(field, expected);
                    let (span, src) = locate(&error, &path, field, toml_sources);
                    ConfigError::UnknownKey {
                        key: field.clone(),
                        help: unknown_key_help(&path, suggestion.as_deref(), expected),
                        suggestion,
                        span,
                        src,
                    }
                }
                Kind::InvalidType(actual, expected) => {
                    let (span, src) = match path.split_last() {
                        Some((field, section)) => locate(&error, section, field, toml_sources),
                        None => (None, None),
                    };
                    ConfigError::InvalidType {
                        key: path.join("."),
                        detail: format!("found {actual}, expected {expected}"),
                        span,
                        src,
                    }
                }
                _ => ConfigError::Other(error.to_string()),
            }
        })
        .collect()
}

fn unknown_key_help(section: &[String], suggestion: Option<&str>, expected: &[&str]) -> String {
    match (suggestion, section.first()) {
        (Some(key), Some(section)) => format!(
            "did you mean `{key}`? It can also be set with TESSERA_{}_{}",
            section.to_uppercase(),
            key.to_uppercase()
        ),
        (Some(key), None) => format!("did you mean the `[{key}]` section?"),
        (None, Some(_)) => format!("valid keys: {}", expected.join(", ")),
        (None, None) => format!("valid sections: {}", SECTIONS.join(", ")),
    }
}

/// Span of `section.field` in the source that produced `error`. Documents
/// parsed from a string carry no file metadata; a single source is assumed
/// to be the one that was parsed.
fn locate(
    error: &figment::error::Error,
    section: &[String],
    field: &str,
    toml_sources: &[(String, String)],
) -> (Option<SourceSpan>, Option<NamedSource<String>>) {
    let file = error
        .metadata
        .as_ref()
        .and_then(|m| m.source.as_ref())
        .and_then(|s| match s {
            figment::Source::File(path) => Some(path.display().to_string()),
            _ => None,
        });
    let source = match file {
        Some(file) => toml_sources.iter().find(|(origin, _)| *origin == file),
        None if toml_sources.len() == 1 => toml_sources.first(),
        None => None,
    };
    let Some((origin, content)) = source else {
        return (None, None);
    };
    match find_key_offset(content, section, field) {
        Some(offset) => (
            Some(SourceSpan::new(offset.into(), field.len())),
            Some(NamedSource::new(origin, content.clone())),
        ),
        None => (None, None),
    }
}

/// Byte offset of `field` inside the `[section]` table, or of a top-level
/// key or table name when `section` is empty.
pub fn find_key_offset(content: &str, section: &[String], field: &str) -> Option<usize> {
    let wanted = section.first().map(|s| format!("[{s}]"));
    let mut in_table = wanted.is_none();
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();
        if let Some(header) = trimmed.trim_end().strip_prefix('[') {
            match &wanted {
                None if header.strip_suffix(']') == Some(field) => return Some(offset + indent + 1),
                None => in_table = false,
                Some(wanted) => in_table = trimmed.trim_end() == wanted,
            }
        } else if in_table && is_key_line(trimmed, field) {
            return Some(offset + indent);
        }
        offset += line.len();
    }
    None
}

fn is_key_line(line: &str, field: &str) -> bool {
    line.strip_prefix(field)
        .is_some_and(|rest| rest.starts_with([' ', '\t', '=']))
}

/// Closest valid key above the similarity threshold. Top-level unknowns are
/// compared against the section names.
pub fn suggest_key(unknown: &str, valid_keys: &[&str]) -> Option<String> {
    let candidates = if valid_keys.is_empty() { SECTIONS } else { valid_keys };
    candidates
        .iter()
        .map(|key| (strsim::jaro_winkler(unknown, key), *key))
        .filter(|(score, _)| *score > SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, key)| key.to_string())
}

/// Render to stderr with miette's graphical handler.
pub fn render_errors(errors: &[ConfigError]) {
    let handler = miette::GraphicalReportHandler::new();
    for error in errors {
        let mut buf = String::new();
        match handler.render_report(&mut buf, error as &dyn Diagnostic) {
            Ok(()) => eprint!("{buf}"),
            Err(_) => eprintln!("Error: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Vec<String> {
        vec!["pool".to_string()]
    }

    #[test]
    fn suggests_pool_and_overflow_keys() {
        let pool_keys = &["max_slots", "slot_capacity_bytes", "snapshot_on_change"];
        assert_eq!(suggest_key("max_slot", pool_keys).as_deref(), Some("max_slots"));
        let overflow_keys = &["max_retries", "cooldown_secs", "drain_interval_secs"];
        assert_eq!(
            suggest_key("coldown_secs", overflow_keys).as_deref(),
            Some("cooldown_secs")
        );
        assert_eq!(suggest_key("zzzzzz", pool_keys), None);
    }

    #[test]
    fn misspelled_section_suggests_a_section() {
        assert_eq!(suggest_key("overflw", &[]).as_deref(), Some("overflow"));
    }

    #[test]
    fn help_names_the_env_override() {
        let help = unknown_key_help(&pool(), Some("max_slots"), &["max_slots"]);
        assert!(help.contains("TESSERA_POOL_MAX_SLOTS"));
        let help = unknown_key_help(&[], None, &[]);
        assert!(help.contains("crypto"));
    }

    #[test]
    fn key_offset_is_scoped_to_its_table() {
        let content = "[router]\nmax_slot = 1\n\n[pool]\nmax_slot = 3\n";
        let o = find_key_offset(content, &pool(), "max_slot").unwrap();
        assert_eq!(&content[o..o + 8], "max_slot");
        assert!(o > content.find("[pool]").unwrap());
    }

    #[test]
    fn key_outside_the_table_is_not_found() {
        let content = "[pool]\nmax_slots = 3\n\n[bridge]\nframe_limit = 1\n";
        assert_eq!(find_key_offset(content, &pool(), "frame_limit"), None);
        assert_eq!(find_key_offset(content, &["index".to_string()], "max_slots"), None);
    }

    #[test]
    fn unknown_section_header_is_located() {
        let content = "[telemetry]\nenabled = true\n";
        let o = find_key_offset(content, &[], "telemetry").unwrap();
        assert_eq!(&content[o..o + 9], "telemetry");
    }

    #[test]
    fn inline_document_gets_a_span() {
        let text = "[pool]\nmax_slot = 3\n";
        let err = crate::loader::load_config_from_str(text).unwrap_err();
        let errors = figment_to_config_errors(err, &[("sealed.toml".to_string(), text.to_string())]);
        assert!(errors.iter().any(|e| matches!(
            e,
            ConfigError::UnknownKey { span: Some(_), src: Some(_), .. }
        )));
    }
}
