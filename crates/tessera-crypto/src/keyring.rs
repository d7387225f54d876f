// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session key ring with interval rotation and bounded key history.
//!
//! New blocks are always sealed with the current key. Retired keys stay in
//! the history so older blocks remain readable until they are rewritten
//! (lazy re-encryption). The history is bounded, but a retired key that is
//! pinned (still referenced by a stored block) is never dropped, so the
//! bound only limits keys nothing needs any more.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tessera_config::model::CryptoConfig;
use tessera_core::TesseraError;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::crypto::{self, KEY_LEN, NONCE_LEN};

/// One AES-256-GCM key with its id and creation time.
pub struct SessionKey {
    id: u32,
    material: Zeroizing<[u8; KEY_LEN]>,
    created_at: DateTime<Utc>,
}

impl SessionKey {
    /// Wrap existing key material, e.g. a key restored from storage.
    pub fn new(id: u32, material: [u8; KEY_LEN], created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            material: Zeroizing::new(material),
            created_at,
        }
    }

    fn generate(id: u32, created_at: DateTime<Utc>) -> Result<Self, TesseraError> {
        Ok(Self::new(id, crypto::generate_random_key()?, created_at))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn material(&self) -> &[u8; KEY_LEN] {
        &self.material
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// An encrypted block: key id, nonce and ciphertext with appended GCM tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlock {
    pub key_id: u32,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

impl SealedBlock {
    /// JSON encoding used when a sealed block is stored or sent on the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TesseraError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TesseraError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn nonce_array(&self) -> Option<[u8; NONCE_LEN]> {
        self.nonce.as_slice().try_into().ok()
    }
}

pub(crate) mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// The process-wide key ring.
#[derive(Debug)]
pub struct KeyRing {
    current: SessionKey,
    history: VecDeque<SessionKey>,
    pinned: BTreeSet<u32>,
    rotation_interval: Duration,
    max_history: usize,
}

impl KeyRing {
    /// Start a fresh ring with a newly generated key (id 1).
    pub fn generate(config: &CryptoConfig, now: DateTime<Utc>) -> Result<Self, TesseraError> {
        let current = SessionKey::generate(1, now)?;
        info!(key_id = current.id, "generated session key");
        Ok(Self::with_current(current, config))
    }

    /// Rebuild a ring from persisted keys. The key with the highest id becomes
    /// current; the rest form the history. An empty list generates a fresh key.
    ///
    /// Nothing is trimmed here: which keys are still in use is only known
    /// once stored blocks are loaded, after which the caller calls
    /// [`KeyRing::pin`].
    pub fn restore(
        mut keys: Vec<SessionKey>,
        config: &CryptoConfig,
        now: DateTime<Utc>,
    ) -> Result<Self, TesseraError> {
        keys.sort_by_key(|k| k.id);
        let Some(current) = keys.pop() else {
            return Self::generate(config, now);
        };
        let mut ring = Self::with_current(current, config);
        // Newest retired key first.
        ring.history = keys.into_iter().rev().collect();
        info!(
            key_id = ring.current.id,
            history = ring.history.len(),
            "restored session keys"
        );
        Ok(ring)
    }

    fn with_current(current: SessionKey, config: &CryptoConfig) -> Self {
        let seconds = i64::try_from(config.key_rotation_secs).unwrap_or(i64::MAX);
        Self {
            current,
            history: VecDeque::new(),
            pinned: BTreeSet::new(),
            rotation_interval: Duration::try_seconds(seconds).unwrap_or(Duration::MAX),
            max_history: config.max_key_history,
        }
    }

    pub fn active_key_id(&self) -> u32 {
        self.current.id
    }

    pub fn current(&self) -> &SessionKey {
        &self.current
    }

    /// Number of retired keys still available for decryption.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Current key followed by the history, newest first.
    pub fn keys(&self) -> impl Iterator<Item = &SessionKey> {
        std::iter::once(&self.current).chain(self.history.iter())
    }

    /// Rotate if the current key is older than the rotation interval.
    /// Returns the new key id when a rotation happened.
    pub fn rotate_if_due(&mut self, now: DateTime<Utc>) -> Result<Option<u32>, TesseraError> {
        if now - self.current.created_at < self.rotation_interval {
            return Ok(None);
        }
        self.rotate(now).map(Some)
    }

    /// Unconditionally install a new current key, retiring the old one.
    pub fn rotate(&mut self, now: DateTime<Utc>) -> Result<u32, TesseraError> {
        let next_id = self.keys().map(|k| k.id).max().unwrap_or(0) + 1;
        let fresh = SessionKey::generate(next_id, now)?;
        let retired = std::mem::replace(&mut self.current, fresh);
        debug!(retired = retired.id, key_id = next_id, "rotated session key");
        self.history.push_front(retired);
        self.trim_history();
        Ok(next_id)
    }

    /// Replace the current key after it failed to seal. Identical to
    /// [`KeyRing::rotate`] but logged as a recovery action.
    pub fn regenerate(&mut self, now: DateTime<Utc>) -> Result<u32, TesseraError> {
        let id = self.rotate(now)?;
        warn!(key_id = id, "session key regenerated by recovery");
        Ok(id)
    }

    /// Replace the set of retired key ids that stored blocks still reference,
    /// then trim the history. Returns the number of keys dropped.
    pub fn pin(&mut self, key_ids: impl IntoIterator<Item = u32>) -> usize {
        self.pinned = key_ids.into_iter().collect();
        let before = self.history.len();
        self.trim_history();
        before - self.history.len()
    }

    /// Drops the oldest unpinned keys until the history fits its bound.
    fn trim_history(&mut self) {
        while self.history.len() > self.max_history {
            let Some(oldest) = self
                .history
                .iter()
                .rposition(|k| !self.pinned.contains(&k.id))
            else {
                debug!(history = self.history.len(), "every retired key is pinned, history over bound");
                return;
            };
            if let Some(dropped) = self.history.remove(oldest) {
                debug!(key_id = dropped.id, "key fell out of history");
            }
        }
    }

    /// Seal `plaintext` with the current key, bound to `address`.
    pub fn encrypt_block(&self, address: &str, plaintext: &[u8]) -> Result<SealedBlock, TesseraError> {
        let (ciphertext, nonce) = crypto::seal(&self.current.material, address.as_bytes(), plaintext)?;
        Ok(SealedBlock {
            key_id: self.current.id,
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Seal a fresh block with the current key and open it again. Only a
    /// failure here justifies regenerating the key.
    pub fn verify_current(&self) -> Result<(), TesseraError> {
        const CHECK: &[u8] = b"tessera key check";
        let (ciphertext, nonce) = crypto::seal(&self.current.material, CHECK, CHECK)?;
        let opened = crypto::open(&self.current.material, &nonce, CHECK, &ciphertext)?;
        if opened.as_slice() != CHECK {
            return Err(TesseraError::Crypto(format!(
                "key {} does not reopen its own block",
                self.current.id
            )));
        }
        Ok(())
    }

    /// Open a sealed block. Tries the recorded key first, then every other
    /// key in the ring.
    pub fn decrypt_block(&self, address: &str, sealed: &SealedBlock) -> Result<Vec<u8>, TesseraError> {
        let failed = |message: &str| TesseraError::DecryptionFailed {
            context: address.to_string(),
            message: message.to_string(),
        };
        let nonce = sealed.nonce_array().ok_or_else(|| failed("malformed nonce"))?;

        let recorded = self.keys().find(|k| k.id == sealed.key_id);
        let others = self.keys().filter(|k| k.id != sealed.key_id);
        for key in recorded.into_iter().chain(others) {
            if let Ok(plaintext) =
                crypto::open(&key.material, &nonce, address.as_bytes(), &sealed.ciphertext)
            {
                if key.id != sealed.key_id {
                    debug!(address, recorded = sealed.key_id, opened_with = key.id, "key id mismatch");
                }
                return Ok(plaintext);
            }
        }
        Err(failed(&format!(
            "no key in history (key id {}) opens the block",
            sealed.key_id
        )))
    }
}
