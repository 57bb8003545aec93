//! # Unordered Dictionary
//!
//! `Dict` is the single-file unordered dictionary: a `FileSpace` backend
//! plus a linear-hashing index. Opening a fresh file creates an empty
//! index; reopening loads it from the metadata region recorded as the
//! backend's primary address. `close` is the durability point — it stores
//! the index metadata, records its address and flushes the file.

use std::path::Path;

use eyre::Result;

use crate::hashmap::{DictCursor, HashIndex};
use crate::storage::{FileSpace, SpaceStats, NIL_ADDR};

/// A persistent dictionary over arbitrary byte-string keys and values.
#[derive(Debug)]
pub struct Dict {
    space: FileSpace,
    index: HashIndex,
}

/// Combined backend and index counters.
#[derive(Debug, Clone, Copy)]
pub struct DictStats {
    pub space: SpaceStats,
    pub slot_dir_count: usize,
    pub slot_count: usize,
    pub item_count: usize,
    pub payload_size: usize,
}

impl Dict {
    /// Opens a dictionary file, creating it when `create_if_missing` is set
    /// and the file does not exist.
    pub fn open<P: AsRef<Path>>(path: P, create_if_missing: bool) -> Result<Self> {
        let mut space = FileSpace::open(path, create_if_missing)?;

        let info_addr = space.primary();
        let index = if info_addr < 0 {
            HashIndex::create(&mut space)?
        } else {
            HashIndex::load(&mut space, info_addr)?
        };

        Ok(Self { space, index })
    }

    /// Stores the index metadata and closes the file. Contents are only
    /// guaranteed to be recoverable after a clean close.
    pub fn close(self) -> Result<()> {
        let Dict { mut space, index } = self;
        let info_addr = index.store(&mut space)?;
        space.set_primary(info_addr);
        space.close()
    }

    /// Tears down an emptied dictionary and closes the file; reopening the
    /// file starts from a fresh index.
    pub fn destroy(self) -> Result<()> {
        let Dict { mut space, index } = self;
        index.destroy(&mut space)?;
        space.set_primary(NIL_ADDR);
        space.close()
    }

    /// Inserts the pair unless the key is already present. Returns the
    /// present value (when requested) and whether an insert happened.
    pub fn add(
        &mut self,
        key: &[u8],
        value: &[u8],
        want_present: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        self.index.add(&mut self.space, key, value, want_present)
    }

    /// Replaces the value of an existing key. Returns the replaced value
    /// (when requested) and whether the key existed.
    pub fn update(
        &mut self,
        key: &[u8],
        value: &[u8],
        want_replaced: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        self.index.update(&mut self.space, key, value, want_replaced)
    }

    /// Upsert: insert when absent, replace when present.
    pub fn add_or_update(
        &mut self,
        key: &[u8],
        value: &[u8],
        want_replaced: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        self.index
            .add_or_update(&mut self.space, key, value, want_replaced)
    }

    /// Deletes a key. Returns the removed value (when requested) and
    /// whether the key existed.
    pub fn delete(&mut self, key: &[u8], want_removed: bool) -> Result<(Option<Vec<u8>>, bool)> {
        self.index.delete(&mut self.space, key, want_removed)
    }

    /// Looks a key up. Returns the present value (when requested) and
    /// whether the key exists.
    pub fn has(&self, key: &[u8], want_present: bool) -> Result<(Option<Vec<u8>>, bool)> {
        self.index.has(&self.space, key, want_present)
    }

    /// Fetches the pair under the cursor and advances it; None when the
    /// scan is exhausted. A freshly defaulted cursor starts from the
    /// beginning, and a full scan of an unchanged dictionary visits every
    /// pair exactly once.
    pub fn scan(&self, cursor: &mut DictCursor) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.index.fetch(&self.space, cursor)
    }

    pub fn stats(&self) -> DictStats {
        DictStats {
            space: self.space.stats(),
            slot_dir_count: self.index.slot_dir_count(),
            slot_count: self.index.slot_count(),
            item_count: self.index.item_count(),
            payload_size: self.index.payload_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_missing_without_create_fails() {
        let dir = tempdir().unwrap();
        assert!(Dict::open(dir.path().join("absent.db"), false).is_err());
    }

    #[test]
    fn basic_operations_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dict.db");

        let mut dict = Dict::open(&path, true).unwrap();
        assert!(dict.add(b"foo", b"bar", false).unwrap().1);
        assert!(dict.add(b"hello", b"w0rd", false).unwrap().1);
        let (replaced, existed) = dict.update(b"hello", b"world", true).unwrap();
        assert!(existed);
        assert_eq!(replaced.unwrap(), b"w0rd");
        dict.close().unwrap();

        let dict = Dict::open(&path, false).unwrap();
        assert_eq!(dict.stats().item_count, 2);
        assert_eq!(dict.has(b"foo", true).unwrap().0.unwrap(), b"bar");
        assert_eq!(dict.has(b"hello", true).unwrap().0.unwrap(), b"world");
        dict.close().unwrap();
    }

    #[test]
    fn destroyed_dictionary_reopens_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dict.db");

        let mut dict = Dict::open(&path, true).unwrap();
        dict.add(b"k", b"v", false).unwrap();
        dict.delete(b"k", false).unwrap();
        dict.destroy().unwrap();

        let dict = Dict::open(&path, true).unwrap();
        assert_eq!(dict.stats().item_count, 0);
        assert!(!dict.has(b"k", false).unwrap().1);
        dict.close().unwrap();
    }
}
