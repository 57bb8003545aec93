//! # Stored Keys
//!
//! A raw key shorter than `MAX_KEY_SIZE` is stored inline. Anything longer
//! is stored as exactly `MAX_KEY_SIZE` bytes: the first 249 raw bytes
//! followed by the 8-byte address of an overflow region holding the rest.
//! Comparison therefore runs on the inline prefix first and dereferences the
//! overflow only on a prefix tie.
//!
//! Range bounds are a tagged enum rather than in-band sentinel byte strings:
//! `Min` orders below every key and `Max` above, and both are resolved
//! against real records during range normalization.

use std::cmp::Ordering;

use eyre::Result;

use crate::storage::FileSpace;

use super::overflow::{create_overflow, free_overflow, read_overflow};

/// Stored size ceiling; at this length the last 8 bytes are an overflow
/// address.
pub const MAX_KEY_SIZE: usize = 257;
pub const KEY_PREFIX_SIZE: usize = MAX_KEY_SIZE - 8;

/// A lookup or range bound: a real key, or one of the two unbounded ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchBound<'a> {
    /// Before the smallest real key.
    Min,
    /// After the largest real key.
    Max,
    Key(&'a [u8]),
}

impl<'a> SearchBound<'a> {
    pub fn is_min(&self) -> bool {
        matches!(self, SearchBound::Min)
    }

    pub fn is_max(&self) -> bool {
        matches!(self, SearchBound::Max)
    }
}

/// Materializes the stored form of `raw`, spilling the tail of a long key
/// into an overflow region.
pub fn create_key(space: &mut FileSpace, raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < MAX_KEY_SIZE {
        return Ok(raw.to_vec());
    }

    let overflow_addr = create_overflow(space, &raw[KEY_PREFIX_SIZE..])?;
    let mut stored = Vec::with_capacity(MAX_KEY_SIZE);
    stored.extend_from_slice(&raw[..KEY_PREFIX_SIZE]);
    stored.extend_from_slice(&(overflow_addr as u64).to_be_bytes());
    Ok(stored)
}

/// Releases a stored key's overflow (if any) and returns the raw length.
pub fn destroy_key(space: &mut FileSpace, stored: &[u8]) -> Result<usize> {
    if stored.len() < MAX_KEY_SIZE {
        return Ok(stored.len());
    }

    let overflow_len = free_overflow(space, overflow_addr(stored))?;
    Ok(KEY_PREFIX_SIZE + overflow_len)
}

/// Reassembles the raw key bytes.
pub fn read_key(space: &FileSpace, stored: &[u8]) -> Result<Vec<u8>> {
    if stored.len() < MAX_KEY_SIZE {
        return Ok(stored.to_vec());
    }

    let overflow = read_overflow(space, overflow_addr(stored))?;
    let mut raw = Vec::with_capacity(KEY_PREFIX_SIZE + overflow.len());
    raw.extend_from_slice(&stored[..KEY_PREFIX_SIZE]);
    raw.extend_from_slice(overflow);
    Ok(raw)
}

/// Raw length of a stored key without materializing it.
pub fn key_size(space: &FileSpace, stored: &[u8]) -> Result<usize> {
    if stored.len() < MAX_KEY_SIZE {
        return Ok(stored.len());
    }
    Ok(KEY_PREFIX_SIZE + read_overflow(space, overflow_addr(stored))?.len())
}

/// Orders a stored key against a raw key, touching the overflow region only
/// when the inline prefix ties.
pub fn compare_stored(space: &FileSpace, stored: &[u8], raw: &[u8]) -> Result<Ordering> {
    if stored.len() < MAX_KEY_SIZE || raw.len() <= KEY_PREFIX_SIZE {
        return Ok(stored.cmp(raw));
    }

    let d = stored[..KEY_PREFIX_SIZE].cmp(&raw[..KEY_PREFIX_SIZE]);
    if d != Ordering::Equal {
        return Ok(d);
    }

    let overflow = read_overflow(space, overflow_addr(stored))?;
    Ok(overflow.cmp(&raw[KEY_PREFIX_SIZE..]))
}

fn overflow_addr(stored: &[u8]) -> i64 {
    let raw: [u8; 8] = stored[KEY_PREFIX_SIZE..MAX_KEY_SIZE].try_into().unwrap();
    u64::from_be_bytes(raw) as i64
}
