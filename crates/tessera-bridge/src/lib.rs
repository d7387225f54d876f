// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Framed TCP bridge between the Tessera pool and a persistence process.
//!
//! Frames are a 4-byte little-endian length header followed by a UTF-8 JSON
//! [`BridgeMessage`]. The same contract serves two directions: the pool
//! hands overflow records to a store process through [`RemotePersistence`],
//! and presentation clients query the pool through [`PoolHandler`].

pub mod client;
pub mod frame;
pub mod handlers;
pub mod message;
pub mod server;

pub use client::RemotePersistence;
pub use handlers::{PoolHandler, StoreHandler};
pub use message::{BridgeMessage, WireRecord};
pub use server::{BridgeHandler, BridgeServer};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tessera_config::model::{BridgeConfig, TesseraConfig};
    use tessera_core::types::{FragmentMeta, SearchFilters};
    use tessera_core::{ErrorKind, PersistenceAdapter};
    use tessera_memory::{MemoryContext, MemoryService};
    use tessera_storage::{Database, RecordTable, SqlitePersistence};
    use tokio_util::sync::CancellationToken;

    async fn start(
        handler: Arc<dyn BridgeHandler>,
        config: &BridgeConfig,
    ) -> (RemotePersistence, CancellationToken) {
        let server = BridgeServer::bind("127.0.0.1:0", config, handler).await.unwrap();
        let address = server.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));
        (RemotePersistence::new(address, config), cancel)
    }

    async fn store(dir: &tempfile::TempDir) -> Arc<SqlitePersistence> {
        let db = Database::open(dir.path().join("store.db").to_str().unwrap())
            .await
            .unwrap();
        Arc::new(SqlitePersistence::new(db, RecordTable::Cold))
    }

    #[tokio::test]
    async fn store_process_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::default();
        let (client, cancel) = start(Arc::new(StoreHandler::new(store(&dir).await)), &config).await;

        client.ping().await.unwrap();
        assert!(client.status().await.unwrap().is_none());

        client.put("f1", b"one").await.unwrap();
        client.put("f1", b"uno").await.unwrap();
        client
            .send_all(vec![WireRecord {
                id: "f2".into(),
                payload: b"two".to_vec(),
            }])
            .await
            .unwrap();

        let mut all = client.get_all().await.unwrap();
        all.sort();
        assert_eq!(
            all,
            vec![
                ("f1".to_string(), b"uno".to_vec()),
                ("f2".to_string(), b"two".to_vec())
            ]
        );
        assert_eq!(client.get("f2").await.unwrap(), Some(b"two".to_vec()));
        cancel.cancel();
    }

    #[tokio::test]
    async fn store_refuses_pool_requests() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::default();
        let (client, cancel) = start(Arc::new(StoreHandler::new(store(&dir).await)), &config).await;

        let err = client.search("redis", SearchFilters::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("refused"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn oversized_put_fails_as_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig {
            max_frame_bytes: 256,
            ..BridgeConfig::default()
        };
        let (client, cancel) = start(Arc::new(StoreHandler::new(store(&dir).await)), &config).await;

        let err = client.put("big", &[0u8; 1024]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageWriteFailed);
        cancel.cancel();
    }

    #[tokio::test]
    async fn unreachable_bridge_is_a_transport_error() {
        let config = BridgeConfig::default();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = RemotePersistence::new(address, &config);
        let err = client.get_all().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Transport | ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn pool_answers_search_and_inject() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TesseraConfig::default();
        config.storage.database_path = dir.path().join("pool.db").to_string_lossy().into_owned();
        let context = MemoryContext::open_with_passphrase(config.clone(), store(&dir).await, None)
            .await
            .unwrap();
        let service_cancel = CancellationToken::new();
        let (memory, _join) = MemoryService::spawn(context, service_cancel.clone());

        let placement = memory
            .capture("Redis failover drill on Friday.", FragmentMeta::new("claude", "s1"))
            .await
            .unwrap();
        memory.finalize(placement.fragment_id.clone()).await.unwrap();

        let (client, cancel) = start(Arc::new(PoolHandler::new(memory)), &config.bridge).await;
        let hits = client.search("redis", SearchFilters::default()).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tag.fragment_id, placement.fragment_id);

        let block = client.inject(placement.address.to_string()).await.unwrap();
        assert_eq!(block.fragment_id, placement.fragment_id);

        let report = client.status().await.unwrap().unwrap();
        assert_eq!(report.thin_tags, 1);

        let err = client.inject("9999.999").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        cancel.cancel();
        service_cancel.cancel();
    }
}
