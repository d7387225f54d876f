// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `tessera serve` and `tessera store` command implementations.
//!
//! `serve` opens the memory pool, starts the memory service (which also
//! drains the retry queue on its own interval) and answers bridge requests
//! until SIGINT/SIGTERM. Evicted fragments go to the remote persistence
//! process when `bridge.persistence_address` is set, otherwise to the local
//! SQLite cold store.
//!
//! `store` is the persistence process: a bridge listener that keeps overflow
//! records in SQLite.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tessera_bridge::{BridgeServer, PoolHandler, RemotePersistence, StoreHandler};
use tessera_config::model::{StorageConfig, TesseraConfig};
use tessera_core::{HealthStatus, PersistenceAdapter, PluginAdapter, TesseraError};
use tessera_memory::{MemoryContext, MemoryHandle, MemoryService};
use tessera_storage::{Database, RecordTable, SqlitePersistence};

use crate::shutdown;

/// Address `tessera store` listens on when neither `--listen` nor
/// `bridge.persistence_address` is given.
const DEFAULT_STORE_ADDRESS: &str = "127.0.0.1:7421";

/// Runs the `tessera serve` command.
pub async fn run_serve(config: TesseraConfig) -> Result<(), TesseraError> {
    init_tracing(&config.instance.log_level);
    info!(instance = %config.instance.name, "starting tessera serve");

    let cancel = shutdown::install_signal_handler();
    let running = start_pool(config, cancel).await?;
    info!(address = %running.address, "tessera ready");
    running.wait().await
}

/// Runs the `tessera store` command.
pub async fn run_store(
    config: TesseraConfig,
    listen: Option<String>,
    database: Option<String>,
) -> Result<(), TesseraError> {
    init_tracing(&config.instance.log_level);

    let listen = listen
        .or_else(|| config.bridge.persistence_address.clone())
        .unwrap_or_else(|| DEFAULT_STORE_ADDRESS.to_string());
    let storage = StorageConfig {
        database_path: database.unwrap_or_else(|| config.storage.database_path.clone()),
        ..config.storage.clone()
    };
    info!(address = %listen, database = %storage.database_path, "starting tessera store");

    let cancel = shutdown::install_signal_handler();
    let (address, listener, store) = start_store(&config, &listen, &storage, cancel).await?;
    info!(%address, "tessera store ready");

    let result = join_listener(listener).await;
    if let Err(e) = store.shutdown().await {
        warn!(error = %e, "store shutdown failed");
    }
    info!("tessera store stopped");
    result
}

/// A started pool: memory service plus bridge listener.
pub struct RunningPool {
    pub address: SocketAddr,
    pub memory: MemoryHandle,
    cancel: CancellationToken,
    service: JoinHandle<Result<(), TesseraError>>,
    listener: JoinHandle<Result<(), TesseraError>>,
}

impl RunningPool {
    /// Wait for the service to stop (on cancellation), then stop the listener.
    pub async fn wait(self) -> Result<(), TesseraError> {
        let service = self
            .service
            .await
            .map_err(|e| TesseraError::Internal(format!("memory service task failed: {e}")));
        self.cancel.cancel();
        if let Err(e) = join_listener(self.listener).await {
            warn!(error = %e, "bridge listener stopped with an error");
        }
        service??;
        info!("tessera serve stopped");
        Ok(())
    }
}

/// Open the pool and start serving it on `bridge.listen_address`.
pub async fn start_pool(config: TesseraConfig, cancel: CancellationToken) -> Result<RunningPool, TesseraError> {
    let cold = open_cold(&config).await?;
    let context = MemoryContext::open(config.clone(), cold).await?;
    let (memory, service) = MemoryService::spawn(context, cancel.clone());

    let handler = Arc::new(PoolHandler::new(memory.clone()));
    let server = match BridgeServer::bind(&config.bridge.listen_address, &config.bridge, handler).await {
        Ok(server) => server,
        Err(e) => {
            cancel.cancel();
            if let Ok(Err(stop)) = service.await {
                warn!(error = %stop, "memory service shutdown failed");
            }
            return Err(e);
        }
    };
    let address = server.local_addr()?;
    let listener = tokio::spawn(server.run(cancel.clone()));

    Ok(RunningPool {
        address,
        memory,
        cancel,
        service,
        listener,
    })
}

/// Bind the store listener over a SQLite cold table.
pub async fn start_store(
    config: &TesseraConfig,
    listen: &str,
    storage: &StorageConfig,
    cancel: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<Result<(), TesseraError>>, Arc<SqlitePersistence>), TesseraError> {
    let db = Database::from_config(storage).await?;
    let store = Arc::new(SqlitePersistence::new(db, RecordTable::Cold));
    let server = BridgeServer::bind(listen, &config.bridge, Arc::new(StoreHandler::new(store.clone()))).await?;
    let address = server.local_addr()?;
    Ok((address, tokio::spawn(server.run(cancel)), store))
}

/// The persistence collaborator evicted fragments are handed to.
async fn open_cold(config: &TesseraConfig) -> Result<Arc<dyn PersistenceAdapter>, TesseraError> {
    match &config.bridge.persistence_address {
        Some(address) => {
            let remote = RemotePersistence::new(address.clone(), &config.bridge);
            match remote.health_check().await? {
                HealthStatus::Healthy => info!(%address, "persistence process reachable"),
                status => warn!(
                    %address,
                    ?status,
                    "persistence process not healthy, evictions will queue until it answers"
                ),
            }
            Ok(Arc::new(remote))
        }
        None => {
            let db = Database::from_config(&config.storage).await?;
            info!(path = %config.storage.database_path, "using local cold store");
            Ok(Arc::new(SqlitePersistence::new(db, RecordTable::Cold)))
        }
    }
}

async fn join_listener(listener: JoinHandle<Result<(), TesseraError>>) -> Result<(), TesseraError> {
    listener
        .await
        .map_err(|e| TesseraError::Internal(format!("bridge listener task failed: {e}")))?
}

/// Initializes the tracing subscriber with the given log level.
fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tessera={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::types::{FragmentMeta, SearchFilters};

    fn test_config(dir: &tempfile::TempDir) -> TesseraConfig {
        let mut config = TesseraConfig::default();
        config.storage.database_path = dir.path().join("pool.db").to_string_lossy().into_owned();
        config.bridge.listen_address = "127.0.0.1:0".to_string();
        config.crypto.passphrase_env = "TESSERA_TEST_UNSET_PASSPHRASE".to_string();
        config
    }

    #[tokio::test]
    async fn pool_answers_over_the_bridge_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let cancel = CancellationToken::new();
        let running = start_pool(config.clone(), cancel.clone()).await.unwrap();

        running
            .memory
            .capture("Deploy window moved to Thursday.", FragmentMeta::new("claude", "s1"))
            .await
            .unwrap();

        let client = RemotePersistence::new(running.address.to_string(), &config.bridge);
        client.ping().await.unwrap();
        let report = client.status().await.unwrap().unwrap();
        assert_eq!(report.hot_fragments, 1);
        assert!(client.search("thursday", SearchFilters::default()).await.unwrap().is_empty());

        cancel.cancel();
        running.wait().await.unwrap();
        assert!(client.ping().await.is_err());
    }

    #[tokio::test]
    async fn pool_hands_evictions_to_a_store_process() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();

        let store_storage = StorageConfig {
            database_path: dir.path().join("store.db").to_string_lossy().into_owned(),
            wal_mode: true,
        };
        let mut config = test_config(&dir);
        let (store_address, _listener, store) = start_store(&config, "127.0.0.1:0", &store_storage, cancel.clone())
            .await
            .unwrap();

        config.pool.max_slots = 1;
        config.pool.slot_capacity_bytes = 64;
        config.bridge.persistence_address = Some(store_address.to_string());
        let running = start_pool(config, cancel.clone()).await.unwrap();

        let first = running
            .memory
            .capture("first fragment with a bit of padding", FragmentMeta::new("claude", "s1"))
            .await
            .unwrap();
        let second = running
            .memory
            .capture("second fragment with a bit of padding", FragmentMeta::new("claude", "s1"))
            .await
            .unwrap();
        assert_eq!(second.evicted, vec![first.fragment_id.clone()]);
        assert_eq!(second.queued, 0);

        let stored = store.get_all().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].0, first.fragment_id.to_string());

        cancel.cancel();
        running.wait().await.unwrap();
    }

    #[tokio::test]
    async fn bind_failure_stops_the_service() {
        let dir = tempfile::tempdir().unwrap();
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config(&dir);
        config.bridge.listen_address = taken.local_addr().unwrap().to_string();

        let err = start_pool(config, CancellationToken::new()).await.err().unwrap();
        assert_eq!(err.kind(), tessera_core::ErrorKind::Transport);
    }
}
