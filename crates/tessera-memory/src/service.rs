// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single-writer actor around [`MemoryContext`].
//!
//! Callers hold a cloneable [`MemoryHandle`]; every command travels over an
//! mpsc channel and is answered on a oneshot, so commands are applied one at
//! a time in arrival order. The actor also drives the periodic queue drain
//! and stops between commands when its [`CancellationToken`] fires.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tessera_core::types::{
    BlockAddress, FatBlock, Fragment, FragmentId, FragmentMeta, SearchFilters, SearchHit, SessionId,
    Square, StatusReport, ThinTag,
};
use tessera_core::TesseraError;
use tessera_router::message::{ContextDelivery, SessionNotice};

use crate::context::{MemoryContext, Placement};
use crate::overflow::DrainReport;

const COMMAND_BUFFER: usize = 256;

type Reply<T> = oneshot::Sender<Result<T, TesseraError>>;

enum Command {
    Capture {
        text: String,
        meta: FragmentMeta,
        reply: Reply<Placement>,
    },
    Revise {
        fragment_id: FragmentId,
        text: String,
        reply: Reply<Square>,
    },
    Finalize {
        fragment_id: FragmentId,
        reply: Reply<ThinTag>,
    },
    Admit {
        fragment: Box<Fragment>,
        reply: Reply<Placement>,
    },
    Touch {
        fragment_id: FragmentId,
        reply: Reply<Placement>,
    },
    Search {
        query: String,
        filters: SearchFilters,
        reply: Reply<Vec<SearchHit>>,
    },
    Context {
        session_id: Option<SessionId>,
        query: String,
        filters: SearchFilters,
        reply: Reply<Option<ContextDelivery>>,
    },
    Retrieve {
        address: BlockAddress,
        reply: Reply<FatBlock>,
    },
    Clear {
        filters: SearchFilters,
        reply: Reply<usize>,
    },
    Drain {
        reply: Reply<DrainReport>,
    },
    Status {
        reply: Reply<StatusReport>,
    },
    Subscribe {
        reply: Reply<broadcast::Receiver<SessionNotice>>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Capture { .. } => "capture",
            Command::Revise { .. } => "revise",
            Command::Finalize { .. } => "finalize",
            Command::Admit { .. } => "admit",
            Command::Touch { .. } => "touch",
            Command::Search { .. } => "search",
            Command::Context { .. } => "context",
            Command::Retrieve { .. } => "retrieve",
            Command::Clear { .. } => "clear",
            Command::Drain { .. } => "drain",
            Command::Status { .. } => "status",
            Command::Subscribe { .. } => "subscribe",
        }
    }
}

/// The actor. Owns the context until it stops.
pub struct MemoryService {
    context: MemoryContext,
    commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    drain_interval: Duration,
}

impl MemoryService {
    pub fn new(context: MemoryContext, cancel: CancellationToken) -> (Self, MemoryHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let drain_interval = Duration::from_secs(context.config().overflow.drain_interval_secs.max(1));
        (
            Self {
                context,
                commands,
                cancel,
                drain_interval,
            },
            MemoryHandle { commands: tx },
        )
    }

    /// Start the actor on the current runtime.
    pub fn spawn(
        context: MemoryContext,
        cancel: CancellationToken,
    ) -> (MemoryHandle, JoinHandle<Result<(), TesseraError>>) {
        let (service, handle) = Self::new(context, cancel);
        (handle, tokio::spawn(service.run()))
    }

    /// Process commands until cancelled or every handle is dropped, then
    /// shut the context down.
    pub async fn run(mut self) -> Result<(), TesseraError> {
        let mut drain = tokio::time::interval(self.drain_interval);
        drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
        drain.tick().await;
        info!(drain_interval_secs = self.drain_interval.as_secs(), "memory service started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("memory service cancelled");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.dispatch(command).await,
                    None => {
                        debug!("all memory handles dropped");
                        break;
                    }
                },
                _ = drain.tick() => {
                    if let Err(e) = self.context.drain_queue().await {
                        warn!(error = %e, "periodic queue drain failed");
                    }
                }
            }
        }

        self.context.shutdown().await
    }

    async fn dispatch(&mut self, command: Command) {
        let name = command.name();
        let delivered = match command {
            Command::Capture { text, meta, reply } => {
                reply.send(self.context.capture(&text, meta).await).is_ok()
            }
            Command::Revise {
                fragment_id,
                text,
                reply,
            } => reply
                .send(self.context.revise(&fragment_id, &text).await)
                .is_ok(),
            Command::Finalize { fragment_id, reply } => {
                reply.send(self.context.finalize(&fragment_id).await).is_ok()
            }
            Command::Admit { fragment, reply } => {
                reply.send(self.context.admit(*fragment).await).is_ok()
            }
            Command::Touch { fragment_id, reply } => {
                reply.send(self.context.touch(&fragment_id).await).is_ok()
            }
            Command::Search {
                query,
                filters,
                reply,
            } => reply.send(Ok(self.context.search(&query, &filters))).is_ok(),
            Command::Context {
                session_id,
                query,
                filters,
                reply,
            } => reply
                .send(Ok(self.context.context_for(session_id, &query, &filters).await))
                .is_ok(),
            Command::Retrieve { address, reply } => {
                reply.send(self.context.retrieve(address).await).is_ok()
            }
            Command::Clear { filters, reply } => {
                reply.send(self.context.clear(&filters).await).is_ok()
            }
            Command::Drain { reply } => reply.send(self.context.drain_queue().await).is_ok(),
            Command::Status { reply } => reply.send(self.context.status().await).is_ok(),
            Command::Subscribe { reply } => reply.send(Ok(self.context.subscribe())).is_ok(),
        };
        if !delivered {
            debug!(command = name, "caller went away before the reply");
        }
    }
}

/// Cloneable client of the memory service.
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl MemoryHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, TesseraError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn capture(&self, text: impl Into<String>, meta: FragmentMeta) -> Result<Placement, TesseraError> {
        let text = text.into();
        self.request(|reply| Command::Capture { text, meta, reply }).await
    }

    pub async fn revise(&self, fragment_id: FragmentId, text: impl Into<String>) -> Result<Square, TesseraError> {
        let text = text.into();
        self.request(|reply| Command::Revise {
            fragment_id,
            text,
            reply,
        })
        .await
    }

    pub async fn finalize(&self, fragment_id: FragmentId) -> Result<ThinTag, TesseraError> {
        self.request(|reply| Command::Finalize { fragment_id, reply }).await
    }

    pub async fn admit(&self, fragment: Fragment) -> Result<Placement, TesseraError> {
        self.request(|reply| Command::Admit {
            fragment: Box::new(fragment),
            reply,
        })
        .await
    }

    pub async fn touch(&self, fragment_id: FragmentId) -> Result<Placement, TesseraError> {
        self.request(|reply| Command::Touch { fragment_id, reply }).await
    }

    pub async fn search(&self, query: impl Into<String>, filters: SearchFilters) -> Result<Vec<SearchHit>, TesseraError> {
        let query = query.into();
        self.request(|reply| Command::Search {
            query,
            filters,
            reply,
        })
        .await
    }

    pub async fn context_for(
        &self,
        session_id: Option<SessionId>,
        query: impl Into<String>,
        filters: SearchFilters,
    ) -> Result<Option<ContextDelivery>, TesseraError> {
        let query = query.into();
        self.request(|reply| Command::Context {
            session_id,
            query,
            filters,
            reply,
        })
        .await
    }

    pub async fn retrieve(&self, address: BlockAddress) -> Result<FatBlock, TesseraError> {
        self.request(|reply| Command::Retrieve { address, reply }).await
    }

    pub async fn clear(&self, filters: SearchFilters) -> Result<usize, TesseraError> {
        self.request(|reply| Command::Clear { filters, reply }).await
    }

    pub async fn drain_queue(&self) -> Result<DrainReport, TesseraError> {
        self.request(|reply| Command::Drain { reply }).await
    }

    pub async fn status(&self) -> Result<StatusReport, TesseraError> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn subscribe(&self) -> Result<broadcast::Receiver<SessionNotice>, TesseraError> {
        self.request(|reply| Command::Subscribe { reply }).await
    }
}

fn stopped() -> TesseraError {
    TesseraError::Internal("memory service is not running".to_string())
}
