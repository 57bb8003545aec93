//! # File Header
//!
//! The first 8 KiB page of a store file holds a fixed 256-byte header; the
//! rest of that page is reserved. The header carries identification (magic,
//! format version, page size), the persistent primary address, and the whole
//! allocator state: free-list heads and usage counters. Every field is
//! written through the mmap as it changes, so closing a file never needs a
//! serialization pass.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  --------------------------------------------
//! 0       16    magic
//! 16      4     format version
//! 20      4     page size
//! 24      8     page count (pages beyond the header page)
//! 32      8     primary address (-1 = absent)
//! 40      8     free page list head (-1 = empty)
//! 48      8     free span list head (-1 = empty)
//! 56      72    chunk free list heads, one per size class
//! 128     8     used size (bytes of live allocations)
//! 136     8     allocation count
//! 144     112   reserved
//! ```
//!
//! Addresses are stored as two's-complement 64-bit values so that the −1
//! sentinel survives the unsigned on-disk representation. All multi-byte
//! fields are big-endian.

use eyre::{ensure, Result};
use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{NIL_ADDR, PAGE_SIZE};

pub const FILE_MAGIC: &[u8; 16] = b"bytedict file\x00\x00\x00";
pub const FORMAT_VERSION: u32 = 1;
pub const FILE_HEADER_SIZE: usize = 256;

/// Size classes for variable allocations at or below 4 KiB. Larger requests
/// are served from whole-page spans.
pub const CHUNK_CLASSES: [usize; 9] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];
pub const NUM_CHUNK_CLASSES: usize = CHUNK_CLASSES.len();
pub const MAX_CHUNK_SIZE: usize = CHUNK_CLASSES[NUM_CHUNK_CLASSES - 1];

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [u8; 16],
    version: U32,
    page_size: U32,
    page_count: U64,
    primary: U64,
    free_page_head: U64,
    free_span_head: U64,
    chunk_free_heads: [U64; NUM_CHUNK_CLASSES],
    used_size: U64,
    allocation_count: U64,
    reserved: [u8; 112],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);
const _: () = assert!(FILE_HEADER_SIZE <= PAGE_SIZE);

impl FileHeader {
    pub fn new() -> Self {
        Self {
            magic: *FILE_MAGIC,
            version: U32::new(FORMAT_VERSION),
            page_size: U32::new(PAGE_SIZE as u32),
            page_count: U64::new(0),
            primary: U64::new(NIL_ADDR as u64),
            free_page_head: U64::new(NIL_ADDR as u64),
            free_span_head: U64::new(NIL_ADDR as u64),
            chunk_free_heads: [U64::new(NIL_ADDR as u64); NUM_CHUNK_CLASSES],
            used_size: U64::new(0),
            allocation_count: U64::new(0),
            reserved: [0u8; 112],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse FileHeader: {:?}", e))?;

        ensure!(&header.magic == FILE_MAGIC, "invalid magic bytes in store file");
        ensure!(
            header.version.get() == FORMAT_VERSION,
            "unsupported format version: {} (expected {})",
            header.version.get(),
            FORMAT_VERSION
        );
        ensure!(
            header.page_size.get() == PAGE_SIZE as u32,
            "store file uses page size {} (expected {})",
            header.page_size.get(),
            PAGE_SIZE
        );

        Ok(header)
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse FileHeader: {:?}", e))
    }

    pub fn page_count(&self) -> u64 {
        self.page_count.get()
    }

    pub fn set_page_count(&mut self, count: u64) {
        self.page_count = U64::new(count);
    }

    pub fn primary(&self) -> i64 {
        self.primary.get() as i64
    }

    pub fn set_primary(&mut self, addr: i64) {
        self.primary = U64::new(addr as u64);
    }

    pub fn free_page_head(&self) -> i64 {
        self.free_page_head.get() as i64
    }

    pub fn set_free_page_head(&mut self, addr: i64) {
        self.free_page_head = U64::new(addr as u64);
    }

    pub fn free_span_head(&self) -> i64 {
        self.free_span_head.get() as i64
    }

    pub fn set_free_span_head(&mut self, addr: i64) {
        self.free_span_head = U64::new(addr as u64);
    }

    pub fn chunk_free_head(&self, class: usize) -> i64 {
        self.chunk_free_heads[class].get() as i64
    }

    pub fn set_chunk_free_head(&mut self, class: usize, addr: i64) {
        self.chunk_free_heads[class] = U64::new(addr as u64);
    }

    pub fn used_size(&self) -> u64 {
        self.used_size.get()
    }

    pub fn add_used(&mut self, bytes: u64) {
        self.used_size = U64::new(self.used_size.get() + bytes);
        self.allocation_count = U64::new(self.allocation_count.get() + 1);
    }

    pub fn sub_used(&mut self, bytes: u64) {
        self.used_size = U64::new(self.used_size.get() - bytes);
        self.allocation_count = U64::new(self.allocation_count.get() - 1);
    }

    pub fn allocation_count(&self) -> u64 {
        self.allocation_count.get()
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Smallest size class able to hold `size` bytes, or None above the chunk
/// range.
pub fn chunk_class(size: usize) -> Option<usize> {
    CHUNK_CLASSES.iter().position(|&class| size <= class)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_256() {
        assert_eq!(std::mem::size_of::<FileHeader>(), FILE_HEADER_SIZE);
    }

    #[test]
    fn new_header_has_nil_lists() {
        let header = FileHeader::new();

        assert_eq!(header.primary(), NIL_ADDR);
        assert_eq!(header.free_page_head(), NIL_ADDR);
        assert_eq!(header.free_span_head(), NIL_ADDR);
        for class in 0..NUM_CHUNK_CLASSES {
            assert_eq!(header.chunk_free_head(class), NIL_ADDR);
        }
        assert_eq!(header.used_size(), 0);
        assert_eq!(header.allocation_count(), 0);
    }

    #[test]
    fn header_roundtrip() {
        let mut header = FileHeader::new();
        header.set_page_count(12);
        header.set_primary(8200);
        header.set_free_page_head(16384);
        header.set_chunk_free_head(3, 24576);
        header.add_used(128);

        let bytes = header.as_bytes();
        let parsed = FileHeader::from_bytes(bytes).unwrap();

        assert_eq!(parsed.page_count(), 12);
        assert_eq!(parsed.primary(), 8200);
        assert_eq!(parsed.free_page_head(), 16384);
        assert_eq!(parsed.chunk_free_head(3), 24576);
        assert_eq!(parsed.used_size(), 128);
        assert_eq!(parsed.allocation_count(), 1);
    }

    #[test]
    fn negative_addresses_survive_storage() {
        let mut header = FileHeader::new();
        header.set_primary(-1);

        let parsed = FileHeader::from_bytes(header.as_bytes()).unwrap();
        assert_eq!(parsed.primary(), -1);
    }

    #[test]
    fn rejects_invalid_magic() {
        let mut bytes = [0u8; FILE_HEADER_SIZE];
        bytes[..16].copy_from_slice(b"not a bytedict f");

        assert!(FileHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_wrong_version() {
        let mut header = FileHeader::new();
        header.version = U32::new(99);

        assert!(FileHeader::from_bytes(header.as_bytes()).is_err());
    }

    #[test]
    fn chunk_class_selection() {
        assert_eq!(chunk_class(0), Some(0));
        assert_eq!(chunk_class(16), Some(0));
        assert_eq!(chunk_class(17), Some(1));
        assert_eq!(chunk_class(4096), Some(8));
        assert_eq!(chunk_class(4097), None);
    }
}
