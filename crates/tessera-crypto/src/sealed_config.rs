// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Passphrase-sealed configuration files.
//!
//! Layout: magic (8) | memory cost, iterations, parallelism (u32 LE each) |
//! salt (16) | nonce (12) | AES-256-GCM ciphertext. Everything before the
//! nonce is authenticated as associated data, so the KDF costs cannot be
//! swapped without failing to open.

use secrecy::SecretString;
use tessera_core::TesseraError;
use zeroize::Zeroizing;

use crate::crypto::{self, NONCE_LEN};
use crate::kdf::{KdfParams, SALT_LEN, SaltPolicy};

/// Leading bytes of every sealed config file.
pub const MAGIC: &[u8; 8] = b"TSRCFG\x00\x01";

const HEADER_LEN: usize = MAGIC.len() + 12 + SALT_LEN;

/// Upper bound on the memory cost accepted from a file header (4 GiB).
const MAX_MEMORY_COST: u32 = 4 * 1024 * 1024;

/// Whether `bytes` starts with the sealed config magic.
pub fn is_sealed(bytes: &[u8]) -> bool {
    bytes.starts_with(MAGIC)
}

/// Seal `plaintext` under a key derived from `passphrase` with a fresh salt.
pub fn seal(
    plaintext: &[u8],
    passphrase: &SecretString,
    params: &KdfParams,
) -> Result<Vec<u8>, TesseraError> {
    let salt = SaltPolicy::Fresh.resolve()?;
    let key = params.derive(passphrase, &salt)?;

    let mut out = Vec::with_capacity(HEADER_LEN + NONCE_LEN + plaintext.len() + 16);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&params.memory_cost.to_le_bytes());
    out.extend_from_slice(&params.iterations.to_le_bytes());
    out.extend_from_slice(&params.parallelism.to_le_bytes());
    out.extend_from_slice(&salt);

    let (ciphertext, nonce) = crypto::seal(&key, &out, plaintext)?;
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed config produced by [`seal`].
pub fn open(sealed: &[u8], passphrase: &SecretString) -> Result<Zeroizing<Vec<u8>>, TesseraError> {
    if !is_sealed(sealed) {
        return Err(TesseraError::Crypto("not a sealed config file".to_string()));
    }
    if sealed.len() < HEADER_LEN + NONCE_LEN {
        return Err(TesseraError::Crypto("sealed config file is truncated".to_string()));
    }
    let (header, body) = sealed.split_at(HEADER_LEN);
    let costs = &header[MAGIC.len()..MAGIC.len() + 12];
    let word = |i: usize| u32::from_le_bytes([costs[i], costs[i + 1], costs[i + 2], costs[i + 3]]);
    let params = KdfParams::new(word(0), word(4), word(8))?;
    if params.memory_cost > MAX_MEMORY_COST {
        return Err(TesseraError::Crypto(format!(
            "sealed config asks for {} KiB of KDF memory",
            params.memory_cost
        )));
    }
    let salt: [u8; SALT_LEN] = header[MAGIC.len() + 12..]
        .try_into()
        .map_err(|_| TesseraError::Crypto("sealed config salt is malformed".to_string()))?;
    let (nonce, ciphertext) = body.split_at(NONCE_LEN);
    let nonce: [u8; NONCE_LEN] = nonce
        .try_into()
        .map_err(|_| TesseraError::Crypto("sealed config nonce is malformed".to_string()))?;

    let key = params.derive(passphrase, &salt)?;
    let plain = crypto::open(&key, &nonce, header, ciphertext).map_err(|_| {
        TesseraError::DecryptionFailed {
            context: "sealed config".to_string(),
            message: "wrong passphrase or corrupted file".to_string(),
        }
    })?;
    Ok(Zeroizing::new(plain))
}
