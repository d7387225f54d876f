// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Message classes flowing through the router.
//!
//! Every stage is a closed enum so adding a class forces every match in the
//! router to handle it.

use serde::{Deserialize, Serialize};
use tessera_core::types::{BlockAddress, FragmentId, SearchHit, SessionId, ThinAddress};
use tessera_core::ErrorKind;

use crate::priority::{Priority, PriorityAssessment};
use crate::profiles::ProviderProfile;
use crate::recovery::RecoveryStrategy;

/// Identifier used for at-most-once delivery within a routing pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An inbound message with its delivery id.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: MessageId,
    pub message: Inbound,
}

impl Envelope {
    pub fn new(message: Inbound) -> Self {
        Self {
            id: MessageId::generate(),
            message,
        }
    }

    pub fn with_id(id: impl Into<String>, message: Inbound) -> Self {
        Self {
            id: MessageId(id.into()),
            message,
        }
    }
}

/// Incoming classes.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A fragment was admitted or revised.
    Content(ContentMessage),
    /// Search results to assemble into a context block.
    Search(SearchRequest),
    /// A storage operation failed and needs a recovery decision.
    Storage(StorageNotice),
}

/// Content written to the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentMessage {
    pub fragment_id: FragmentId,
    pub address: BlockAddress,
    pub session_id: SessionId,
    pub provider_tag: String,
    /// Latest revision text.
    pub text: String,
    /// Canonical summary, once finalized.
    pub summary: Option<String>,
    /// Serialized FatBlock for the backup path.
    pub block: Vec<u8>,
}

/// Ranked search results plus the query that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub session_id: Option<SessionId>,
    pub query: String,
    pub hits: Vec<SearchHit>,
}

/// Operations that can report a failure to the recovery fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    HandOff,
    DrainQueue,
    Retrieve,
    Snapshot,
    Backup,
    IndexWrite,
}

/// A typed failure reported by a storage-side operation.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageNotice {
    pub operation: Operation,
    pub fragment_id: Option<FragmentId>,
    pub address: Option<BlockAddress>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Output of the processing forks.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    Content(ProcessedContent),
    Search(SearchRequest),
    Storage(StorageNotice),
}

/// Content after normalization, priority scoring and compression.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedContent {
    pub message: ContentMessage,
    pub profile: ProviderProfile,
    /// Text was cut to the provider's size limit.
    pub truncated: bool,
    pub priority: PriorityAssessment,
    /// Backup payload; compressed unless the priority or profile forbids it.
    pub payload: Option<BackupPayload>,
}

/// Backup body produced by the compression fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPayload {
    pub compressed: bool,
    pub level: Option<u32>,
    pub bytes: Vec<u8>,
}

/// Outgoing classes.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    ContextDelivery(ContextDelivery),
    SessionBroadcast(SessionNotice),
    Backup(BackupRecord),
    Recovery(RecoveryAction),
}

impl Outbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::ContextDelivery(_) => "context_delivery",
            Outbound::SessionBroadcast(_) => "session_broadcast",
            Outbound::Backup(_) => "backup",
            Outbound::Recovery(_) => "recovery",
        }
    }
}

/// Bounded text block assembled from retrieval results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextDelivery {
    pub session_id: Option<SessionId>,
    pub query: String,
    pub text: String,
    pub addresses: Vec<ThinAddress>,
    /// Some hits did not fit the character budget.
    pub truncated: bool,
}

/// Fan-out notice to other active sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNotice {
    pub origin: SessionId,
    pub recipients: Vec<SessionId>,
    pub fragment_id: FragmentId,
    pub address: BlockAddress,
    pub priority: Priority,
    pub preview: String,
}

/// Redundant write for the secondary store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub fragment_id: FragmentId,
    pub address: BlockAddress,
    pub priority: Priority,
    pub compressed: bool,
    pub payload: Vec<u8>,
}

/// Recovery decision for a failed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryAction {
    pub operation: Operation,
    pub fragment_id: Option<FragmentId>,
    pub address: Option<BlockAddress>,
    pub kind: ErrorKind,
    pub strategy: RecoveryStrategy,
}
