// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Framed TCP server.
//!
//! Accepts connections on the configured address and answers each decoded
//! frame through a [`BridgeHandler`]. Every connection runs on its own task
//! and stops when the shared [`CancellationToken`] fires.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tessera_config::model::BridgeConfig;
use tessera_core::TesseraError;

use crate::frame;
use crate::message::BridgeMessage;

/// Produces exactly one reply per request.
#[async_trait]
pub trait BridgeHandler: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn handle(&self, request: BridgeMessage) -> BridgeMessage;
}

pub struct BridgeServer {
    listener: TcpListener,
    max_frame_bytes: usize,
    handler: Arc<dyn BridgeHandler>,
}

impl BridgeServer {
    /// Bind to `address` (usually `bridge.listen_address`).
    pub async fn bind(
        address: &str,
        config: &BridgeConfig,
        handler: Arc<dyn BridgeHandler>,
    ) -> Result<Self, TesseraError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| TesseraError::transport(format!("failed to bind bridge to {address}"), e))?;
        Ok(Self {
            listener,
            max_frame_bytes: config.max_frame_bytes,
            handler,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TesseraError> {
        self.listener
            .local_addr()
            .map_err(|e| TesseraError::transport("bridge listener has no local address", e))
    }

    /// Accept connections until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), TesseraError> {
        let local = self.local_addr()?;
        info!(address = %local, handler = self.handler.name(), "bridge listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("bridge listener stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "bridge connection accepted");
                        tokio::spawn(serve_connection(
                            stream,
                            peer,
                            self.handler.clone(),
                            self.max_frame_bytes,
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "bridge accept failed"),
                },
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn BridgeHandler>,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) {
    let mut framed = frame::framed(stream, max_frame_bytes);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = frame::recv(&mut framed) => next,
        };
        let reply = match next {
            Ok(Some(request)) => {
                debug!(%peer, kind = request.kind(), request_id = request.request_id(), "bridge request");
                handler.handle(request).await
            }
            Ok(None) => break,
            Err(e) => {
                // Bad frames end the connection.
                warn!(%peer, error = %e, "rejecting bridge frame, closing connection");
                let _ = frame::send(&mut framed, &BridgeMessage::nack("", e.to_string())).await;
                break;
            }
        };
        if let Err(e) = frame::send(&mut framed, &reply).await {
            warn!(%peer, error = %e, "failed to send bridge reply");
            break;
        }
    }
    debug!(%peer, "bridge connection closed");
}
