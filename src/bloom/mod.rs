//! Fixed-size Bloom filter embedded in every SSTable.
//!
//! The filter is a plain bit array of `m` bits probed `k` times per key.
//! Probe positions come from double hashing over the two low 32-bit lanes
//! of a 128-bit hash of the key:
//!
//! ```text
//! pos_i = (h0 + i * h1) mod m        for i in 0..k   (wrapping u32 math)
//! ```
//!
//! A negative answer is exact, a positive one may be a false positive.
//!
//! # On-disk form
//!
//! Exactly `m / 8` bytes. Bit `i` lives in byte `i / 8` under the mask
//! `0x80 >> (i % 8)` (most significant bit first).

#[cfg(test)]
mod tests;

use thiserror::Error;
use xxhash_rust::xxh3::xxh3_128;

/// Errors returned when constructing or decoding a filter.
#[derive(Debug, Error)]
pub enum BloomError {
    /// `m` must be a positive multiple of eight.
    #[error("invalid bit count {0}: must be a positive multiple of 8")]
    InvalidBits(u32),

    /// `k` must be at least one.
    #[error("probe count must be >= 1")]
    InvalidHashes,

    /// Serialized bitmap does not match the configured size.
    #[error("bitmap is {actual} bytes, expected {expected}")]
    SizeMismatch {
        /// Bytes implied by `m`.
        expected: usize,
        /// Bytes supplied.
        actual: usize,
    },
}

/// Splits the 128-bit hash of `key` into the two probe lanes.
#[inline]
fn hash_lanes(key: u64) -> (u32, u32) {
    let h = xxh3_128(&key.to_le_bytes());
    (h as u32, (h >> 32) as u32)
}

/// A fixed-size bit array with `k` hash probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u32,
    num_hashes: u32,
}

impl BloomFilter {
    /// Creates an empty filter of `num_bits` bits and `num_hashes` probes.
    pub fn new(num_bits: u32, num_hashes: u32) -> Result<Self, BloomError> {
        if num_bits == 0 || num_bits % 8 != 0 {
            return Err(BloomError::InvalidBits(num_bits));
        }
        if num_hashes == 0 {
            return Err(BloomError::InvalidHashes);
        }
        Ok(Self {
            bits: vec![0u8; (num_bits / 8) as usize],
            num_bits,
            num_hashes,
        })
    }

    /// Rebuilds a filter from its serialized bitmap.
    pub fn from_bytes(bytes: &[u8], num_bits: u32, num_hashes: u32) -> Result<Self, BloomError> {
        let mut filter = Self::new(num_bits, num_hashes)?;
        if bytes.len() != filter.bits.len() {
            return Err(BloomError::SizeMismatch {
                expected: filter.bits.len(),
                actual: bytes.len(),
            });
        }
        filter.bits.copy_from_slice(bytes);
        Ok(filter)
    }

    /// Sets the `k` bits belonging to `key`.
    pub fn insert(&mut self, key: u64) {
        let (h0, h1) = hash_lanes(key);
        for i in 0..self.num_hashes {
            let pos = self.position(h0, h1, i);
            self.bits[pos / 8] |= 0x80 >> (pos % 8);
        }
    }

    /// Returns `false` only if `key` was definitely never inserted.
    pub fn may_contain(&self, key: u64) -> bool {
        let (h0, h1) = hash_lanes(key);
        (0..self.num_hashes).all(|i| {
            let pos = self.position(h0, h1, i);
            self.bits[pos / 8] & (0x80 >> (pos % 8)) != 0
        })
    }

    /// Serialized bitmap, exactly `m / 8` bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    #[inline]
    fn position(&self, h0: u32, h1: u32, i: u32) -> usize {
        (h0.wrapping_add(i.wrapping_mul(h1)) % self.num_bits) as usize
    }
}
