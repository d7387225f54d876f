// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Adaptive deflate compression for backup payloads.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::priority::Priority;

/// Payloads below this size are stored as-is.
pub const MIN_COMPRESS_BYTES: usize = 256;

/// Payloads above this size get the strongest level at medium priority.
pub const LARGE_PAYLOAD_BYTES: usize = 64 * 1024;

/// Deflate level for a payload, or `None` when it must stay uncompressed.
/// Critical content is never compressed.
pub fn choose_level(priority: Priority, size: usize, profile_allows: bool) -> Option<u32> {
    if !profile_allows || size < MIN_COMPRESS_BYTES {
        return None;
    }
    match priority {
        Priority::Critical => None,
        Priority::High => Some(1),
        Priority::Medium if size > LARGE_PAYLOAD_BYTES => Some(9),
        Priority::Medium => Some(6),
        Priority::Low => Some(9),
    }
}

pub fn compress(data: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
