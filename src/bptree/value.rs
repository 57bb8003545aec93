//! # Stored Values
//!
//! Same inline-or-overflow scheme as stored keys, with a smaller inline
//! budget: a raw value shorter than `MAX_VALUE_SIZE` is inlined, anything
//! longer becomes a 121-byte prefix plus the 8-byte overflow address.
//! `read_value_at` serves partial reads across the inline/overflow seam so
//! callers can stream a value without materializing it.

use eyre::Result;

use crate::storage::FileSpace;

use super::overflow::{create_overflow, free_overflow, read_overflow};

pub const MAX_VALUE_SIZE: usize = 129;
pub const VALUE_PREFIX_SIZE: usize = MAX_VALUE_SIZE - 8;

/// Materializes the stored form of `raw`.
pub fn create_value(space: &mut FileSpace, raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < MAX_VALUE_SIZE {
        return Ok(raw.to_vec());
    }

    let overflow_addr = create_overflow(space, &raw[VALUE_PREFIX_SIZE..])?;
    let mut stored = Vec::with_capacity(MAX_VALUE_SIZE);
    stored.extend_from_slice(&raw[..VALUE_PREFIX_SIZE]);
    stored.extend_from_slice(&(overflow_addr as u64).to_be_bytes());
    Ok(stored)
}

/// Releases a stored value's overflow (if any) and returns the raw length.
pub fn destroy_value(space: &mut FileSpace, stored: &[u8]) -> Result<usize> {
    if stored.len() < MAX_VALUE_SIZE {
        return Ok(stored.len());
    }

    let overflow_len = free_overflow(space, overflow_addr(stored))?;
    Ok(VALUE_PREFIX_SIZE + overflow_len)
}

/// Reassembles the raw value bytes.
pub fn read_value(space: &FileSpace, stored: &[u8]) -> Result<Vec<u8>> {
    if stored.len() < MAX_VALUE_SIZE {
        return Ok(stored.to_vec());
    }

    let overflow = read_overflow(space, overflow_addr(stored))?;
    let mut raw = Vec::with_capacity(VALUE_PREFIX_SIZE + overflow.len());
    raw.extend_from_slice(&stored[..VALUE_PREFIX_SIZE]);
    raw.extend_from_slice(overflow);
    Ok(raw)
}

/// Copies value bytes starting at `offset` into `buf`, returning how many
/// were copied. Reads past the end copy nothing.
pub fn read_value_at(
    space: &FileSpace,
    stored: &[u8],
    offset: usize,
    buf: &mut [u8],
) -> Result<usize> {
    if stored.len() < MAX_VALUE_SIZE {
        if offset >= stored.len() {
            return Ok(0);
        }
        return Ok(copy_bytes(buf, &stored[offset..]));
    }

    if offset + buf.len() <= VALUE_PREFIX_SIZE {
        return Ok(copy_bytes(buf, &stored[offset..VALUE_PREFIX_SIZE]));
    }

    let overflow = read_overflow(space, overflow_addr(stored))?;
    if offset >= VALUE_PREFIX_SIZE + overflow.len() {
        return Ok(0);
    }

    if offset < VALUE_PREFIX_SIZE {
        let n = copy_bytes(buf, &stored[offset..VALUE_PREFIX_SIZE]);
        Ok(n + copy_bytes(&mut buf[n..], overflow))
    } else {
        Ok(copy_bytes(buf, &overflow[offset - VALUE_PREFIX_SIZE..]))
    }
}

/// Raw length of a stored value without materializing it.
pub fn value_size(space: &FileSpace, stored: &[u8]) -> Result<usize> {
    if stored.len() < MAX_VALUE_SIZE {
        return Ok(stored.len());
    }
    Ok(VALUE_PREFIX_SIZE + read_overflow(space, overflow_addr(stored))?.len())
}

fn overflow_addr(stored: &[u8]) -> i64 {
    let raw: [u8; 8] = stored[VALUE_PREFIX_SIZE..MAX_VALUE_SIZE].try_into().unwrap();
    u64::from_be_bytes(raw) as i64
}

fn copy_bytes(dst: &mut [u8], src: &[u8]) -> usize {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
    n
}
