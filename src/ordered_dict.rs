//! # Ordered Dictionary
//!
//! `OrderedDict` pairs the `FileSpace` backend with the B+ tree index:
//! everything `Dict` offers, in byte-lexicographic key order, plus range
//! iteration in either direction. Range bounds take `SearchBound`, whose
//! `Min`/`Max` variants stand for "before the smallest key" and "after the
//! largest key".

use std::path::Path;

use eyre::Result;

use crate::bptree::{BpTree, RangeIter, SearchBound};
use crate::storage::{FileSpace, SpaceStats, NIL_ADDR};

/// A persistent, order-preserving dictionary over arbitrary byte-string
/// keys and values.
#[derive(Debug)]
pub struct OrderedDict {
    space: FileSpace,
    index: BpTree,
}

/// Combined backend and index counters.
#[derive(Debug, Clone, Copy)]
pub struct OrderedDictStats {
    pub space: SpaceStats,
    pub height: usize,
    pub leaf_count: usize,
    pub non_leaf_count: usize,
    pub record_count: usize,
    pub payload_size: usize,
}

impl OrderedDict {
    /// Opens an ordered dictionary file, creating it when
    /// `create_if_missing` is set and the file does not exist.
    pub fn open<P: AsRef<Path>>(path: P, create_if_missing: bool) -> Result<Self> {
        let mut space = FileSpace::open(path, create_if_missing)?;

        let info_addr = space.primary();
        let index = if info_addr < 0 {
            BpTree::create(&mut space)?
        } else {
            BpTree::load(&mut space, info_addr)?
        };

        Ok(Self { space, index })
    }

    /// Stores the index metadata and closes the file. Contents are only
    /// guaranteed to be recoverable after a clean close.
    pub fn close(self) -> Result<()> {
        let OrderedDict { mut space, index } = self;
        let info_addr = index.store(&mut space)?;
        space.set_primary(info_addr);
        space.close()
    }

    /// Tears down an emptied dictionary and closes the file; reopening the
    /// file starts from a fresh index.
    pub fn destroy(self) -> Result<()> {
        let OrderedDict { mut space, index } = self;
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

    /// Ascending iteration over the records with keys in `[min, max]`.
    pub fn range_forward(&self, min: SearchBound, max: SearchBound) -> Result<RangeIter<'_>> {
        self.index.search_forward(&self.space, min, max)
    }

    /// Descending iteration over the records with keys in `[min, max]`.
    pub fn range_backward(&self, min: SearchBound, max: SearchBound) -> Result<RangeIter<'_>> {
        self.index.search_backward(&self.space, min, max)
    }

    pub fn stats(&self) -> OrderedDictStats {
        OrderedDictStats {
            space: self.space.stats(),
            height: self.index.height(),
            leaf_count: self.index.leaf_count(),
            non_leaf_count: self.index.non_leaf_count(),
            record_count: self.index.record_count(),
            payload_size: self.index.payload_size(),
        }
    }
}
