// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client side of the bridge.
//!
//! [`RemotePersistence`] implements [`PersistenceAdapter`] against a remote
//! store process, so the overflow manager can hand records across the
//! bridge exactly as it would to the local SQLite store. It opens one
//! connection per request and bounds every exchange by
//! `bridge.request_timeout_secs`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use tessera_config::model::BridgeConfig;
use tessera_core::types::{FatBlock, SearchFilters, SearchHit, StatusReport};
use tessera_core::{AdapterType, HealthStatus, PersistenceAdapter, PluginAdapter, TesseraError};

use crate::frame;
use crate::message::{BridgeMessage, WireRecord};

#[derive(Debug, Clone)]
pub struct RemotePersistence {
    address: String,
    max_frame_bytes: usize,
    timeout: Duration,
}

impl RemotePersistence {
    pub fn new(address: impl Into<String>, config: &BridgeConfig) -> Self {
        Self {
            address: address.into(),
            max_frame_bytes: config.max_frame_bytes,
            timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send one request and wait for its reply.
    pub async fn exchange(&self, request: BridgeMessage) -> Result<BridgeMessage, TesseraError> {
        let kind = request.kind();
        let exchange = async {
            let stream = TcpStream::connect(&self.address).await.map_err(|e| {
                TesseraError::transport(format!("cannot reach bridge at {}", self.address), e)
            })?;
            let mut framed = frame::framed(stream, self.max_frame_bytes);
            frame::send(&mut framed, &request).await?;
            frame::recv(&mut framed).await?.ok_or_else(|| TesseraError::Transport {
                message: format!("bridge closed the connection before answering {kind}"),
                source: None,
            })
        };
        let reply = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TesseraError::Timeout {
                duration: self.timeout,
            })??;

        if reply.request_id() != request.request_id() {
            return Err(TesseraError::Transport {
                message: format!(
                    "reply {} does not match request {}",
                    reply.request_id(),
                    request.request_id()
                ),
                source: None,
            });
        }
        Ok(reply)
    }

    /// Round-trip time of a ping.
    pub async fn ping(&self) -> Result<Duration, TesseraError> {
        let started = Instant::now();
        match self
            .exchange(BridgeMessage::Ping {
                request_id: BridgeMessage::new_request_id(),
            })
            .await?
        {
            BridgeMessage::Pong { .. } => Ok(started.elapsed()),
            other => Err(unexpected("ping", other)),
        }
    }

    /// Status of a remote pool. `None` when the peer is a store process.
    pub async fn status(&self) -> Result<Option<StatusReport>, TesseraError> {
        match self
            .exchange(BridgeMessage::Status {
                request_id: BridgeMessage::new_request_id(),
                report: None,
            })
            .await?
        {
            BridgeMessage::Status { report, .. } => Ok(report),
            other => Err(unexpected("status", other)),
        }
    }

    pub async fn search(
        &self,
        query: impl Into<String>,
        filters: SearchFilters,
    ) -> Result<Vec<SearchHit>, TesseraError> {
        match self
            .exchange(BridgeMessage::SearchMemory {
                request_id: BridgeMessage::new_request_id(),
                query: query.into(),
                filters,
                hits: Vec::new(),
            })
            .await?
        {
            BridgeMessage::SearchMemory { hits, .. } => Ok(hits),
            other => Err(unexpected("searchMemory", other)),
        }
    }

    /// Fetch a FatBlock from a remote pool for re-insertion.
    pub async fn inject(&self, address: impl Into<String>) -> Result<FatBlock, TesseraError> {
        match self
            .exchange(BridgeMessage::InjectMemory {
                request_id: BridgeMessage::new_request_id(),
                address: address.into(),
                block: None,
            })
            .await?
        {
            BridgeMessage::InjectMemory {
                block: Some(block), ..
            } => Ok(*block),
            other => Err(unexpected("inject_memory", other)),
        }
    }

    /// Push many records in one frame.
    pub async fn send_all(&self, records: Vec<WireRecord>) -> Result<(), TesseraError> {
        if records.is_empty() {
            return Ok(());
        }
        match self
            .exchange(BridgeMessage::SendAllMemory {
                request_id: BridgeMessage::new_request_id(),
                records,
            })
            .await?
        {
            BridgeMessage::Ack { ok: true, .. } => Ok(()),
            other => Err(unexpected("sendAllMemory", other)),
        }
    }
}

/// Maps a reply of the wrong shape, including a negative ack, to an error.
fn unexpected(request: &str, reply: BridgeMessage) -> TesseraError {
    let message = match reply {
        BridgeMessage::Ack {
            ok: false,
            error: Some(error),
            ..
        } => format!("{request} refused: {error}"),
        other => format!("unexpected {} reply to {request}", other.kind()),
    };
    TesseraError::Transport {
        message,
        source: None,
    }
}

#[async_trait]
impl PluginAdapter for RemotePersistence {
    fn name(&self) -> &str {
        "bridge-remote"
    }

    fn version(&self) -> semver::Version {
        semver::Version::new(0, 1, 0)
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Transport
    }

    async fn health_check(&self) -> Result<HealthStatus, TesseraError> {
        match self.ping().await {
            Ok(rtt) if rtt > self.timeout / 2 => Ok(HealthStatus::Degraded(format!(
                "slow bridge: {} ms",
                rtt.as_millis()
            ))),
            Ok(_) => Ok(HealthStatus::Healthy),
            Err(e) => Ok(HealthStatus::Unhealthy(e.to_string())),
        }
    }

    async fn shutdown(&self) -> Result<(), TesseraError> {
        debug!(address = %self.address, "remote persistence closed");
        Ok(())
    }
}

#[async_trait]
impl PersistenceAdapter for RemotePersistence {
    async fn put(&self, id: &str, payload: &[u8]) -> Result<(), TesseraError> {
        let reply = self
            .exchange(BridgeMessage::Overflow {
                request_id: BridgeMessage::new_request_id(),
                record: WireRecord {
                    id: id.to_string(),
                    payload: payload.to_vec(),
                },
            })
            .await
            .map_err(|e| TesseraError::StorageWriteFailed {
                message: format!("remote put failed for {id}"),
                source: Some(Box::new(e)),
            })?;
        match reply {
            BridgeMessage::Ack { ok: true, .. } => Ok(()),
            other => Err(TesseraError::StorageWriteFailed {
                message: format!("remote put failed for {id}"),
                source: Some(Box::new(unexpected("overflow", other))),
            }),
        }
    }

    async fn get_all(&self) -> Result<Vec<(String, Vec<u8>)>, TesseraError> {
        match self
            .exchange(BridgeMessage::SendAllMemory {
                request_id: BridgeMessage::new_request_id(),
                records: Vec::new(),
            })
            .await?
        {
            BridgeMessage::SendAllMemory { records, .. } => Ok(records
                .into_iter()
                .map(|record| (record.id, record.payload))
                .collect()),
            other => Err(unexpected("sendAllMemory", other)),
        }
    }
}
