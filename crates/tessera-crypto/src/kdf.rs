// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Passphrase key derivation (Argon2id v0x13).
//!
//! [`KdfParams`] carries the `[crypto]` cost settings, checked once so every
//! caller derives with the same validated values. [`SaltPolicy`] decides
//! which salt a wrapper derives with: the salt already recorded next to
//! stored keys, or a fresh one when nothing is stored yet.

use ring::rand::{SecureRandom, SystemRandom};
use secrecy::{ExposeSecret, SecretString};
use tessera_config::model::CryptoConfig;
use tessera_core::TesseraError;
use tracing::warn;
use zeroize::Zeroizing;

use crate::crypto::KEY_LEN;

/// Length of an Argon2id salt.
pub const SALT_LEN: usize = 16;

/// Validated Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_cost: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    pub fn from_config(config: &CryptoConfig) -> Result<Self, TesseraError> {
        Self::new(config.kdf_memory_cost, config.kdf_iterations, config.kdf_parallelism)
    }

    pub fn new(memory_cost: u32, iterations: u32, parallelism: u32) -> Result<Self, TesseraError> {
        let params = Self {
            memory_cost,
            iterations,
            parallelism,
        };
        params.argon2_params()?;
        Ok(params)
    }

    fn argon2_params(&self) -> Result<argon2::Params, TesseraError> {
        argon2::Params::new(self.memory_cost, self.iterations, self.parallelism, Some(KEY_LEN))
            .map_err(|e| TesseraError::Crypto(format!("invalid Argon2id parameters: {e}")))
    }

    /// Derive a 32-byte key from `passphrase`. Empty passphrases are refused.
    pub fn derive(
        &self,
        passphrase: &SecretString,
        salt: &[u8; SALT_LEN],
    ) -> Result<Zeroizing<[u8; KEY_LEN]>, TesseraError> {
        let secret = passphrase.expose_secret().as_bytes();
        if secret.is_empty() {
            return Err(TesseraError::Crypto("passphrase is empty".to_string()));
        }
        let argon2 = argon2::Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            self.argon2_params()?,
        );
        let mut output = Zeroizing::new([0u8; KEY_LEN]);
        argon2
            .hash_password_into(secret, salt, output.as_mut())
            .map_err(|e| TesseraError::Crypto(format!("Argon2id key derivation failed: {e}")))?;
        Ok(output)
    }
}

/// Which salt to derive with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaltPolicy {
    /// Reuse the salt recorded with stored keys so they can be reopened.
    Reuse([u8; SALT_LEN]),
    /// Nothing stored yet: start with a random salt.
    Fresh,
}

impl SaltPolicy {
    /// Pick the salt of the most recently stored key. Salts are expected to
    /// agree; a mismatch is logged and the older keys become unreadable.
    pub fn for_stored<'a>(salts: impl DoubleEndedIterator<Item = &'a [u8; SALT_LEN]>) -> Self {
        let mut salts = salts.rev();
        let Some(newest) = salts.next() else {
            return SaltPolicy::Fresh;
        };
        let mismatched = salts.filter(|salt| *salt != newest).count();
        if mismatched > 0 {
            warn!(mismatched, "stored keys use more than one salt, keeping the newest");
        }
        SaltPolicy::Reuse(*newest)
    }

    pub fn resolve(self) -> Result<[u8; SALT_LEN], TesseraError> {
        match self {
            SaltPolicy::Reuse(salt) => Ok(salt),
            SaltPolicy::Fresh => {
                let mut salt = [0u8; SALT_LEN];
                SystemRandom::new()
                    .fill(&mut salt)
                    .map_err(|_| TesseraError::Crypto("failed to generate random salt".to_string()))?;
                Ok(salt)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> KdfParams {
        KdfParams::new(1024, 1, 1).unwrap()
    }

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[test]
    fn same_inputs_same_key() {
        let salt = [1u8; SALT_LEN];
        let a = cheap().derive(&secret("pass"), &salt).unwrap();
        let b = cheap().derive(&secret("pass"), &salt).unwrap();
        assert_eq!(*a, *b);
        let other = cheap().derive(&secret("pass"), &[2u8; SALT_LEN]).unwrap();
        assert_ne!(*a, *other);
    }

    #[test]
    fn config_costs_are_validated_up_front() {
        let config = CryptoConfig {
            kdf_memory_cost: 1,
            ..CryptoConfig::default()
        };
        let err = KdfParams::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("Argon2id"));
        assert!(KdfParams::from_config(&CryptoConfig::default()).is_ok());
    }

    #[test]
    fn empty_passphrase_is_refused() {
        assert!(cheap().derive(&secret(""), &[0u8; SALT_LEN]).is_err());
    }

    #[test]
    fn stored_salt_is_reused() {
        let salts = [[3u8; SALT_LEN], [3u8; SALT_LEN]];
        assert_eq!(SaltPolicy::for_stored(salts.iter()), SaltPolicy::Reuse([3u8; SALT_LEN]));
        assert_eq!(SaltPolicy::for_stored(std::iter::empty()), SaltPolicy::Fresh);
    }

    #[test]
    fn newest_salt_wins_on_mismatch() {
        let salts = [[1u8; SALT_LEN], [9u8; SALT_LEN]];
        assert_eq!(SaltPolicy::for_stored(salts.iter()), SaltPolicy::Reuse([9u8; SALT_LEN]));
    }

    #[test]
    fn fresh_salts_differ() {
        let a = SaltPolicy::Fresh.resolve().unwrap();
        let b = SaltPolicy::Fresh.resolve().unwrap();
        assert_ne!(a, b);
    }
}
