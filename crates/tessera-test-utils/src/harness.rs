// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test harness for end-to-end integration testing.
//!
//! `TestHarness` assembles a running memory service over a temp SQLite
//! database with a [`MockPersistence`] collaborator. Tests drive the pool
//! through `harness.memory` exactly as the binary and the bridge do.

use std::sync::Arc;

use secrecy::SecretString;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tessera_config::model::TesseraConfig;
use tessera_core::{PersistenceAdapter, TesseraError};
use tessera_memory::{MemoryContext, MemoryHandle, MemoryService};

use crate::mock_persistence::MockPersistence;

/// Builder for creating test environments with configurable options.
pub struct TestHarnessBuilder {
    config: TesseraConfig,
    passphrase: Option<String>,
    cold: Arc<MockPersistence>,
}

impl TestHarnessBuilder {
    fn new() -> Self {
        let mut config = TesseraConfig::default();
        // Minimal KDF cost for tests.
        config.crypto.kdf_memory_cost = 1024;
        config.crypto.kdf_iterations = 1;
        config.crypto.kdf_parallelism = 1;
        Self {
            config,
            passphrase: None,
            cold: Arc::new(MockPersistence::new()),
        }
    }

    pub fn with_max_slots(mut self, max_slots: u8) -> Self {
        self.config.pool.max_slots = max_slots;
        self
    }

    pub fn with_slot_capacity(mut self, bytes: u64) -> Self {
        self.config.pool.slot_capacity_bytes = bytes;
        self
    }

    /// Persist keys under this passphrase so restarts can read old blocks.
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Use a shared collaborator, e.g. one that starts offline.
    pub fn with_cold(mut self, cold: Arc<MockPersistence>) -> Self {
        self.cold = cold;
        self
    }

    /// Adjust any other setting before the pool opens.
    pub fn with_config(mut self, edit: impl FnOnce(&mut TesseraConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    /// Build the harness and start the memory service.
    pub async fn build(self) -> Result<TestHarness, TesseraError> {
        let temp_dir = tempfile::TempDir::new().map_err(|e| TesseraError::Storage { source: e.into() })?;
        let mut config = self.config;
        config.storage.database_path = temp_dir
            .path()
            .join("tessera.db")
            .to_string_lossy()
            .into_owned();

        let cancel = CancellationToken::new();
        let (memory, join) = start(&config, &self.cold, self.passphrase.as_deref(), &cancel).await?;
        Ok(TestHarness {
            memory,
            join: Some(join),
            cancel,
            cold: self.cold,
            config,
            passphrase: self.passphrase,
            _temp_dir: temp_dir,
        })
    }
}

/// A running memory service with a mock collaborator and temp storage.
pub struct TestHarness {
    /// Handle to the running memory service. Calls fail once it stops.
    pub memory: MemoryHandle,
    join: Option<JoinHandle<Result<(), TesseraError>>>,
    cancel: CancellationToken,
    /// The mock persistence collaborator.
    pub cold: Arc<MockPersistence>,
    /// Configuration the pool was opened with (temp database path filled in).
    pub config: TesseraConfig,
    passphrase: Option<String>,
    /// Temp directory kept alive for cleanup on drop.
    _temp_dir: tempfile::TempDir,
}

impl TestHarness {
    /// Create a new builder for configuring the test harness.
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::new()
    }

    /// Stop the service, writing its final snapshot.
    pub async fn shutdown(&mut self) -> Result<(), TesseraError> {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            join.await
                .map_err(|e| TesseraError::Internal(format!("memory service panicked: {e}")))??;
        }
        Ok(())
    }

    /// Stop the service and open a fresh one over the same database and
    /// collaborator.
    pub async fn restart(&mut self) -> Result<(), TesseraError> {
        self.shutdown().await?;
        self.cancel = CancellationToken::new();
        let (memory, join) =
            start(&self.config, &self.cold, self.passphrase.as_deref(), &self.cancel).await?;
        self.memory = memory;
        self.join = Some(join);
        Ok(())
    }
}

async fn start(
    config: &TesseraConfig,
    cold: &Arc<MockPersistence>,
    passphrase: Option<&str>,
    cancel: &CancellationToken,
) -> Result<(MemoryHandle, JoinHandle<Result<(), TesseraError>>), TesseraError> {
    let cold: Arc<dyn PersistenceAdapter> = cold.clone();
    let passphrase = passphrase.map(|p| SecretString::from(p.to_string()));
    let context = MemoryContext::open_with_passphrase(config.clone(), cold, passphrase).await?;
    Ok(MemoryService::spawn(context, cancel.clone()))
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
