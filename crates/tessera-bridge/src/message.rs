// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bridge message contract.
//!
//! Every frame carries one JSON object tagged by `type`:
//!
//! ```json
//! {"type": "ping", "request_id": "..."}
//! {"type": "overflow", "request_id": "...", "record": {"id": "...", "payload": "<base64>"}}
//! {"type": "sendAllMemory", "request_id": "...", "records": []}
//! {"type": "searchMemory", "request_id": "...", "query": "redis", "filters": {}}
//! {"type": "inject_memory", "request_id": "...", "address": "0001.007"}
//! {"type": "ack", "request_id": "...", "ok": true}
//! ```
//!
//! Replies reuse the request's `request_id`.

use serde::{Deserialize, Serialize};
use tessera_core::types::{FatBlock, SearchFilters, SearchHit, StatusReport};

/// One stored record on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRecord {
    pub id: String,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeMessage {
    #[serde(rename = "ping")]
    Ping { request_id: String },

    #[serde(rename = "pong")]
    Pong { request_id: String },

    /// Request (no report) or reply (with report).
    #[serde(rename = "status")]
    Status {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        report: Option<StatusReport>,
    },

    /// Upsert one evicted record.
    #[serde(rename = "overflow")]
    Overflow { request_id: String, record: WireRecord },

    /// Bulk push when `records` is non-empty; otherwise a pull answered with
    /// every stored record.
    #[serde(rename = "sendAllMemory")]
    SendAllMemory {
        request_id: String,
        #[serde(default)]
        records: Vec<WireRecord>,
    },

    #[serde(rename = "searchMemory")]
    SearchMemory {
        request_id: String,
        #[serde(default)]
        query: String,
        #[serde(default)]
        filters: SearchFilters,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        hits: Vec<SearchHit>,
    },

    /// Fetch a FatBlock by address for re-insertion into a session.
    #[serde(rename = "inject_memory")]
    InjectMemory {
        request_id: String,
        address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        block: Option<Box<FatBlock>>,
    },

    #[serde(rename = "ack")]
    Ack {
        request_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl BridgeMessage {
    pub fn new_request_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn request_id(&self) -> &str {
        match self {
            BridgeMessage::Ping { request_id }
            | BridgeMessage::Pong { request_id }
            | BridgeMessage::Status { request_id, .. }
            | BridgeMessage::Overflow { request_id, .. }
            | BridgeMessage::SendAllMemory { request_id, .. }
            | BridgeMessage::SearchMemory { request_id, .. }
            | BridgeMessage::InjectMemory { request_id, .. }
            | BridgeMessage::Ack { request_id, .. } => request_id,
        }
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeMessage::Ping { .. } => "ping",
            BridgeMessage::Pong { .. } => "pong",
            BridgeMessage::Status { .. } => "status",
            BridgeMessage::Overflow { .. } => "overflow",
            BridgeMessage::SendAllMemory { .. } => "sendAllMemory",
            BridgeMessage::SearchMemory { .. } => "searchMemory",
            BridgeMessage::InjectMemory { .. } => "inject_memory",
            BridgeMessage::Ack { .. } => "ack",
        }
    }

    pub fn ack(request_id: impl Into<String>) -> Self {
        BridgeMessage::Ack {
            request_id: request_id.into(),
            ok: true,
            error: None,
        }
    }

    pub fn nack(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        BridgeMessage::Ack {
            request_id: request_id.into(),
            ok: false,
            error: Some(error.into()),
        }
    }
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
