// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request handlers for both ends of the bridge.
//!
//! - [`PoolHandler`] runs inside `tessera serve` and answers presentation
//!   requests (status, search, inject) from the memory service.
//! - [`StoreHandler`] runs inside the persistence process and stores
//!   overflow records through any [`PersistenceAdapter`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use tessera_core::types::BlockAddress;
use tessera_core::PersistenceAdapter;
use tessera_memory::MemoryHandle;

use crate::message::{BridgeMessage, WireRecord};
use crate::server::BridgeHandler;

/// Serves the pool's read side.
#[derive(Debug, Clone)]
pub struct PoolHandler {
    memory: MemoryHandle,
}

impl PoolHandler {
    pub fn new(memory: MemoryHandle) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl BridgeHandler for PoolHandler {
    fn name(&self) -> &'static str {
        "pool"
    }

    async fn handle(&self, request: BridgeMessage) -> BridgeMessage {
        match request {
            BridgeMessage::Ping { request_id } => BridgeMessage::Pong { request_id },
            BridgeMessage::Status { request_id, .. } => match self.memory.status().await {
                Ok(report) => BridgeMessage::Status {
                    request_id,
                    report: Some(report),
                },
                Err(e) => BridgeMessage::nack(request_id, e.to_string()),
            },
            BridgeMessage::SearchMemory {
                request_id,
                query,
                filters,
                ..
            } => match self.memory.search(query.clone(), filters.clone()).await {
                Ok(hits) => BridgeMessage::SearchMemory {
                    request_id,
                    query,
                    filters,
                    hits,
                },
                Err(e) => BridgeMessage::nack(request_id, e.to_string()),
            },
            BridgeMessage::InjectMemory {
                request_id,
                address,
                ..
            } => {
                let block = match address.parse::<BlockAddress>() {
                    Ok(parsed) => self.memory.retrieve(parsed).await,
                    Err(e) => Err(e),
                };
                match block {
                    Ok(block) => BridgeMessage::InjectMemory {
                        request_id,
                        address,
                        block: Some(Box::new(block)),
                    },
                    Err(e) => BridgeMessage::nack(request_id, e.to_string()),
                }
            }
            other => unsupported(self.name(), other),
        }
    }
}

/// Stores records for a remote pool.
#[derive(Clone)]
pub struct StoreHandler {
    store: Arc<dyn PersistenceAdapter>,
}

impl std::fmt::Debug for StoreHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandler")
            .field("store", &self.store.name())
            .finish()
    }
}

impl StoreHandler {
    pub fn new(store: Arc<dyn PersistenceAdapter>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BridgeHandler for StoreHandler {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn handle(&self, request: BridgeMessage) -> BridgeMessage {
        match request {
            BridgeMessage::Ping { request_id } => BridgeMessage::Pong { request_id },
            BridgeMessage::Status { request_id, .. } => BridgeMessage::Status {
                request_id,
                report: None,
            },
            BridgeMessage::Overflow { request_id, record } => {
                match self.store.put(&record.id, &record.payload).await {
                    Ok(()) => BridgeMessage::ack(request_id),
                    Err(e) => BridgeMessage::nack(request_id, e.to_string()),
                }
            }
            BridgeMessage::SendAllMemory {
                request_id,
                records,
            } if records.is_empty() => match self.store.get_all().await {
                Ok(stored) => BridgeMessage::SendAllMemory {
                    request_id,
                    records: stored
                        .into_iter()
                        .map(|(id, payload)| WireRecord { id, payload })
                        .collect(),
                },
                Err(e) => BridgeMessage::nack(request_id, e.to_string()),
            },
            BridgeMessage::SendAllMemory {
                request_id,
                records,
            } => {
                for record in &records {
                    if let Err(e) = self.store.put(&record.id, &record.payload).await {
                        return BridgeMessage::nack(request_id, format!("{}: {e}", record.id));
                    }
                }
                BridgeMessage::ack(request_id)
            }
            other => unsupported(self.name(), other),
        }
    }
}

fn unsupported(handler: &str, request: BridgeMessage) -> BridgeMessage {
    warn!(handler, kind = request.kind(), "unsupported bridge request");
    BridgeMessage::nack(
        request.request_id(),
        format!("{} is not served by the {handler} process", request.kind()),
    )
}
