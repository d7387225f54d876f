// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Passphrase-wrapped session keys.
//!
//! A wrapping key is derived once from the passphrase via Argon2id. Each
//! session key is sealed with it (key id as associated data) so the ring can
//! be rebuilt after a restart. Without a passphrase, keys stay in memory and
//! sealed snapshots die with the process.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tessera_config::model::CryptoConfig;
use tessera_core::TesseraError;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::crypto::{self, KEY_LEN, NONCE_LEN};
use crate::kdf::{KdfParams, SaltPolicy};
use crate::keyring::SessionKey;

pub use crate::kdf::SALT_LEN;

/// A session key sealed under a passphrase-derived wrapping key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub key_id: u32,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Holds the derived wrapping key. Debug output omits the key.
pub struct KeyWrapper {
    wrapping_key: Zeroizing<[u8; KEY_LEN]>,
    salt: [u8; SALT_LEN],
}

impl std::fmt::Debug for KeyWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyWrapper")
            .field("wrapping_key", &"[REDACTED]")
            .finish()
    }
}

impl KeyWrapper {
    /// Derive a wrapper from the passphrase with the `[crypto]` KDF costs.
    pub fn derive(
        passphrase: &SecretString,
        salt: SaltPolicy,
        config: &CryptoConfig,
    ) -> Result<Self, TesseraError> {
        let params = KdfParams::from_config(config)?;
        let salt = salt.resolve()?;
        let wrapping_key = params.derive(passphrase, &salt)?;
        debug!("derived key wrapping key");
        Ok(Self { wrapping_key, salt })
    }

    /// Derive a wrapper able to reopen `stored`, reusing their salt.
    pub fn for_stored(
        passphrase: &SecretString,
        stored: &[WrappedKey],
        config: &CryptoConfig,
    ) -> Result<Self, TesseraError> {
        let policy = SaltPolicy::for_stored(stored.iter().map(|k| &k.salt));
        Self::derive(passphrase, policy, config)
    }

    /// Read the passphrase from the environment variable named in the config.
    /// Returns `None` when it is unset or empty.
    pub fn passphrase_from_env(config: &CryptoConfig) -> Option<SecretString> {
        std::env::var(&config.passphrase_env)
            .ok()
            .filter(|value| !value.is_empty())
            .map(SecretString::from)
    }

    pub fn salt(&self) -> [u8; SALT_LEN] {
        self.salt
    }

    pub fn wrap(&self, key: &SessionKey) -> Result<WrappedKey, TesseraError> {
        let (ciphertext, nonce) = crypto::seal(
            &self.wrapping_key,
            &key.id().to_le_bytes(),
            key.material(),
        )?;
        Ok(WrappedKey {
            key_id: key.id(),
            salt: self.salt,
            nonce,
            ciphertext,
            created_at: key.created_at(),
        })
    }

    pub fn unwrap_key(&self, wrapped: &WrappedKey) -> Result<SessionKey, TesseraError> {
        let plain = Zeroizing::new(
            crypto::open(
                &self.wrapping_key,
                &wrapped.nonce,
                &wrapped.key_id.to_le_bytes(),
                &wrapped.ciphertext,
            )
            .map_err(|_| TesseraError::DecryptionFailed {
                context: format!("key {}", wrapped.key_id),
                message: "wrong passphrase or corrupted key record".to_string(),
            })?,
        );
        let material: [u8; KEY_LEN] = plain.as_slice().try_into().map_err(|_| {
            TesseraError::Crypto(format!("key {} has invalid length", wrapped.key_id))
        })?;
        Ok(SessionKey::new(wrapped.key_id, material, wrapped.created_at))
    }

    /// Unwrap every record that shares this wrapper's salt. Records that fail
    /// are skipped with a warning; blocks sealed under them become unreadable.
    pub fn unwrap_all(&self, records: &[WrappedKey]) -> Vec<SessionKey> {
        records
            .iter()
            .filter_map(|record| {
                if record.salt != self.salt {
                    warn!(key_id = record.key_id, "skipping key wrapped under another salt");
                    return None;
                }
                match self.unwrap_key(record) {
                    Ok(key) => Some(key),
                    Err(e) => {
                        warn!(key_id = record.key_id, error = %e, "failed to unwrap stored key");
                        None
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Low-cost parameters for fast tests.
    fn config() -> CryptoConfig {
        CryptoConfig {
            kdf_memory_cost: 32768,
            kdf_iterations: 2,
            kdf_parallelism: 1,
            ..CryptoConfig::default()
        }
    }

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    fn key(id: u32) -> SessionKey {
        SessionKey::new(id, [id as u8; KEY_LEN], Utc::now())
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let wrapper = KeyWrapper::derive(&secret("pass"), SaltPolicy::Fresh, &config()).unwrap();
        let wrapped = wrapper.wrap(&key(7)).unwrap();
        let restored = wrapper.unwrap_key(&wrapped).unwrap();
        assert_eq!(restored.id(), 7);
        assert_eq!(restored.material(), &[7u8; KEY_LEN]);
    }

    #[test]
    fn same_salt_and_passphrase_reopen_keys() {
        let first = KeyWrapper::derive(&secret("pass"), SaltPolicy::Fresh, &config()).unwrap();
        let wrapped = first.wrap(&key(3)).unwrap();
        let second = KeyWrapper::for_stored(&secret("pass"), &[wrapped.clone()], &config()).unwrap();
        assert_eq!(second.salt(), first.salt());
        assert_eq!(second.unwrap_all(&[wrapped]).len(), 1);
    }

    #[test]
    fn wrong_passphrase_is_decryption_failure() {
        let good = KeyWrapper::derive(&secret("right"), SaltPolicy::Fresh, &config()).unwrap();
        let wrapped = good.wrap(&key(1)).unwrap();
        let bad = KeyWrapper::derive(&secret("wrong"), SaltPolicy::Reuse(good.salt()), &config())
            .unwrap();
        let err = bad.unwrap_key(&wrapped).unwrap_err();
        assert!(matches!(err, TesseraError::DecryptionFailed { .. }));
        assert!(bad.unwrap_all(&[wrapped]).is_empty());
    }

    #[test]
    fn swapped_key_id_fails_authentication() {
        let wrapper = KeyWrapper::derive(&secret("pass"), SaltPolicy::Fresh, &config()).unwrap();
        let mut wrapped = wrapper.wrap(&key(1)).unwrap();
        wrapped.key_id = 2;
        assert!(wrapper.unwrap_key(&wrapped).is_err());
    }
}
