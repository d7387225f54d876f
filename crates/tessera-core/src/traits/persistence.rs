// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persistence adapter trait for durable external stores.

use async_trait::async_trait;

use crate::error::TesseraError;
use crate::traits::adapter::PluginAdapter;

/// A durable store that receives evicted fragments.
///
/// Payloads are opaque bytes (a sealed FatBlock plus its ThinTag). Writes are
/// upserts keyed by fragment id, so delivering the same fragment twice never
/// creates a duplicate record.
#[async_trait]
pub trait PersistenceAdapter: PluginAdapter {
    /// Upserts the payload for `id`.
    async fn put(&self, id: &str, payload: &[u8]) -> Result<(), TesseraError>;

    /// Returns the payload stored for `id`, if any.
    ///
    /// The default implementation scans [`PersistenceAdapter::get_all`].
    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>, TesseraError> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .find(|(stored, _)| stored == id)
            .map(|(_, payload)| payload))
    }

    /// Returns every stored record, for cold-start reload.
    async fn get_all(&self) -> Result<Vec<(String, Vec<u8>)>, TesseraError>;
}
