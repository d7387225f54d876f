// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `tessera ping`, `tessera status` and `tessera search`.
//!
//! Each command opens a bridge connection to a running pool (by default
//! `bridge.listen_address`), sends one request, and prints the reply either
//! as a table or, with `--json`, as structured JSON for scripting. An
//! unreachable pool is reported, not treated as an error.

use std::io::IsTerminal;
use std::time::Duration;

use serde::Serialize;

use tessera_bridge::RemotePersistence;
use tessera_config::model::TesseraConfig;
use tessera_core::types::{SearchFilters, SearchHit, StatusReport};
use tessera_core::TesseraError;

/// Structured status output for `--json` mode.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub running: bool,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<StatusReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn client(config: &TesseraConfig, address: Option<String>) -> RemotePersistence {
    let address = address.unwrap_or_else(|| config.bridge.listen_address.clone());
    RemotePersistence::new(address, &config.bridge)
}

/// Run the `tessera ping` command.
pub async fn run_ping(config: &TesseraConfig, address: Option<String>) -> Result<(), TesseraError> {
    let client = client(config, address);
    let rtt = client.ping().await?;
    println!("pong from {} in {}", client.address(), format_rtt(rtt));
    Ok(())
}

/// Run the `tessera status` command.
pub async fn run_status(
    config: &TesseraConfig,
    address: Option<String>,
    json: bool,
    plain: bool,
) -> Result<(), TesseraError> {
    let client = client(config, address);
    let response = match client.status().await {
        Ok(report) => StatusResponse {
            running: true,
            address: client.address().to_string(),
            report,
            error: None,
        },
        Err(e) => StatusResponse {
            running: false,
            address: client.address().to_string(),
            report: None,
            error: Some(e.to_string()),
        },
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        let use_color = !plain && std::io::stdout().is_terminal();
        print_status(&response, use_color);
    }
    Ok(())
}

/// Run the `tessera search` command.
pub async fn run_search(
    config: &TesseraConfig,
    address: Option<String>,
    query: String,
    filters: SearchFilters,
    json: bool,
) -> Result<(), TesseraError> {
    let hits = client(config, address).search(query, filters).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("no matches");
        return Ok(());
    }
    for line in hits.iter().map(format_hit) {
        println!("{line}");
    }
    Ok(())
}

fn format_rtt(rtt: Duration) -> String {
    if rtt.as_millis() > 0 {
        format!("{} ms", rtt.as_millis())
    } else {
        format!("{} us", rtt.as_micros())
    }
}

/// One search hit: score, address, tier, session and summary.
fn format_hit(hit: &SearchHit) -> String {
    let tier = match hit.slot {
        Some(slot) => format!("slot {slot}"),
        None => "indexed".to_string(),
    };
    format!(
        "{:>6.3}  {}  {:<8}  {}  {}",
        hit.score, hit.tag.address, tier, hit.tag.session_id, hit.tag.summary
    )
}

fn print_status(response: &StatusResponse, use_color: bool) {
    println!();
    println!("  tessera status");
    println!("  {}", "-".repeat(35));

    let Some(report) = response.report.as_ref().filter(|_| response.running) else {
        if response.running {
            // A store process answers status without a report.
            println!("    State:    persistence process at {}", response.address);
        } else {
            if use_color {
                use colored::Colorize;
                println!("    State:    {} {}", "✗".red(), "not running".red());
            } else {
                println!("    State:    [FAIL] not running");
            }
            println!("    Address:  {}", response.address);
            println!();
            println!("  Start with: tessera serve");
        }
        println!();
        return;
    };

    if use_color {
        use colored::Colorize;
        println!("    State:    {} {}", "✓".green(), "running".green());
    } else {
        println!("    State:    [OK] running");
    }
    println!("    Address:  {}", response.address);
    println!("    Hot:      {} fragments", report.hot_fragments);
    for slot in &report.slots {
        println!(
            "      slot {}: {:>3} fragments  {:>8} / {} bytes",
            slot.slot, slot.fragments, slot.used_bytes, slot.capacity_bytes
        );
    }
    println!(
        "    Index:    {} thin tags, {} fat blocks, {} cold",
        report.thin_tags, report.fat_blocks, report.cold_blocks
    );
    println!(
        "    Queue:    {} pending, {} abandoned",
        report.queue_pending, report.queue_abandoned
    );
    println!(
        "    Keys:     active {} ({} in history)",
        report.active_key_id, report.key_history
    );
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tessera_core::types::{BlockAddress, EntityMap, FragmentId, SessionId, ThinTag};

    fn hit(slot: Option<u8>) -> SearchHit {
        let now = Utc::now();
        SearchHit {
            tag: ThinTag {
                address: BlockAddress { block: 1, chunk: 2 }.thin(),
                fragment_id: FragmentId::from("f1"),
                session_id: SessionId::from("s1"),
                provider_tag: "claude".into(),
                topic: None,
                summary: "Redis failover drill".into(),
                keywords: vec!["redis".into()],
                entities: EntityMap::default(),
                content_hash: "abc".into(),
                size_bytes: 20,
                created_at: now,
                updated_at: now,
            },
            score: 0.75,
            slot,
        }
    }

    #[test]
    fn format_rtt_prefers_milliseconds() {
        assert_eq!(format_rtt(Duration::from_millis(12)), "12 ms");
        assert_eq!(format_rtt(Duration::from_micros(250)), "250 us");
    }

    #[test]
    fn hit_line_shows_tier_and_summary() {
        let line = format_hit(&hit(Some(2)));
        assert!(line.contains("slot 2"));
        assert!(line.contains("Redis failover drill"));
        assert!(format_hit(&hit(None)).contains("indexed"));
    }

    #[test]
    fn status_response_offline_serializes_without_report() {
        let resp = StatusResponse {
            running: false,
            address: "127.0.0.1:7420".to_string(),
            report: None,
            error: Some("connection refused".to_string()),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"running\":false"));
        assert!(!json.contains("report"));
    }

    #[tokio::test]
    async fn status_against_nothing_reports_not_running() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let config = TesseraConfig::default();
        run_status(&config, Some(address), true, true).await.unwrap();
    }
}
