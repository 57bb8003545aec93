//! # Overflow Regions
//!
//! Out-of-line storage for the tails of keys and values too large to inline
//! in a node page. A region holds a varint length prefix followed by the
//! payload bytes; the codecs in `key` and `value` point at it with an 8-byte
//! address embedded in the stored form.

use eyre::{ensure, Result};

use crate::encoding::varint::{decode_uvarint, encode_uvarint, uvarint_len};
use crate::storage::FileSpace;

/// Writes `payload` into a fresh region and returns its address.
pub fn create_overflow(space: &mut FileSpace, payload: &[u8]) -> Result<i64> {
    let prefix_len = uvarint_len(payload.len() as u64);
    let (addr, view) = space.allocate(prefix_len + payload.len())?;
    let n = encode_uvarint(payload.len() as u64, view);
    view[n..n + payload.len()].copy_from_slice(payload);
    Ok(addr)
}

/// Borrows the payload of the overflow region at `addr`.
pub fn read_overflow(space: &FileSpace, addr: i64) -> Result<&[u8]> {
    let view = space.access(addr)?;
    let (len, n) = decode_uvarint(view)?;
    let len = len as usize;
    ensure!(
        n + len <= view.len(),
        "overflow region at address {} overruns its allocation",
        addr
    );
    Ok(&view[n..n + len])
}

/// Releases the region and returns the payload length it held.
pub fn free_overflow(space: &mut FileSpace, addr: i64) -> Result<usize> {
    let len = read_overflow(space, addr)?.len();
    space.free(addr)?;
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_space() -> (tempfile::TempDir, FileSpace) {
        let dir = tempdir().unwrap();
        let space = FileSpace::open(dir.path().join("test.db"), true).unwrap();
        (dir, space)
    }

    #[test]
    fn create_and_read_roundtrip() {
        let (_dir, mut space) = create_space();

        let payload = vec![0x5A; 1000];
        let addr = create_overflow(&mut space, &payload).unwrap();

        assert_eq!(read_overflow(&space, addr).unwrap(), &payload[..]);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let (_dir, mut space) = create_space();
        let addr = create_overflow(&mut space, b"").unwrap();
        assert_eq!(read_overflow(&space, addr).unwrap(), b"");
    }

    #[test]
    fn free_returns_payload_length() {
        let (_dir, mut space) = create_space();

        let addr = create_overflow(&mut space, &[7u8; 321]).unwrap();
        assert_eq!(free_overflow(&mut space, addr).unwrap(), 321);
    }

    #[test]
    fn free_releases_backend_space() {
        let (_dir, mut space) = create_space();
        let baseline = space.stats().used_size;

        let addr = create_overflow(&mut space, &[1u8; 5000]).unwrap();
        assert!(space.stats().used_size > baseline);
        free_overflow(&mut space, addr).unwrap();

        assert_eq!(space.stats().used_size, baseline);
    }

    #[test]
    fn large_payload_spans_pages() {
        let (_dir, mut space) = create_space();

        let payload: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        let addr = create_overflow(&mut space, &payload).unwrap();

        assert_eq!(read_overflow(&space, addr).unwrap(), &payload[..]);
    }
}
