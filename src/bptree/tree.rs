//! # B+ Tree Engine
//!
//! Search, insert, delete and range iteration over fixed-size node pages,
//! with load-balancing via rotate/split/merge.
//!
//! ## Descent paths
//!
//! Every operation first resolves a `RecordPath`: the `(node address,
//! index)` pairs from the root down to a leaf slot. A miss still yields the
//! insertion point. Rebalancing steps that relocate the current record fix
//! the path up in place, so the steps that follow — key syncing, parent
//! rebalances — always operate against the post-move location.
//!
//! ## Load balancing
//!
//! A node whose load size leaves `[UNDERLOAD, OVERLOAD]` is repaired
//! bottom-up: try shifting entries to the right sibling, then to the left,
//! then split (when overloaded) — or borrow from the right, then the left,
//! then merge, preferring the right sibling (when underloaded). The root is
//! exempt from the lower bound; an overloaded root grows the tree by one
//! level and a root non-leaf with a single child is demoted.
//!
//! Whenever a sibling page is allocated, every node view taken before the
//! allocation is stale; the code re-accesses each page through the backend
//! at each step, which the borrow checker enforces anyway.

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::encoding::varint::{decode_uvarint, put_uvarint};
use crate::encoding::wire::{
    check_wire_type, put_int64_field, unknown_field, WireReader, WIRE_VARINT,
};
use crate::encoding::META_CRC;
use crate::storage::{FileSpace, NIL_ADDR, PAGE_SIZE};

use super::chain::LeafChain;
use super::iterator::RangeIter;
use super::key::{create_key, destroy_key, read_key, SearchBound};
use super::leaf::{LeafMut, LeafRef, Record, LEAF_OVERLOAD_THRESHOLD, LEAF_UNDERLOAD_THRESHOLD};
use super::nonleaf::{
    Child, NonLeafMut, NonLeafRef, NONLEAF_OVERLOAD_THRESHOLD, NONLEAF_UNDERLOAD_THRESHOLD,
};
use super::value::{create_value, destroy_value, read_value, value_size};

#[derive(Debug, Clone, Copy)]
struct PathEntry {
    node_addr: i64,
    /// Record index in a leaf; child index in a non-leaf.
    index: usize,
}

type RecordPath = SmallVec<[PathEntry; 8]>;

/// Persistent state of an ordered index. All mutating operations take the
/// backing `FileSpace` alongside.
#[derive(Debug)]
pub struct BpTree {
    root_addr: i64,
    height: usize,
    chain: LeafChain,
    leaf_count: usize,
    non_leaf_count: usize,
    record_count: usize,
    payload_size: usize,
}

impl BpTree {
    /// Creates an empty tree: a single leaf that is both root and the whole
    /// leaf chain.
    pub fn create(space: &mut FileSpace) -> Result<Self> {
        let (root_addr, view) = space.allocate_aligned(PAGE_SIZE)?;
        LeafMut::init(view)?;
        let chain = LeafChain::new(space, root_addr)?;

        Ok(Self {
            root_addr,
            height: 1,
            chain,
            leaf_count: 1,
            non_leaf_count: 0,
            record_count: 0,
            payload_size: 0,
        })
    }

    /// Tears down an emptied tree, releasing its root leaf.
    pub fn destroy(self, space: &mut FileSpace) -> Result<()> {
        space.free_aligned(self.root_addr)
    }

    /// Serializes the tree state into a fresh region and returns its
    /// address, to be recorded as the backend's primary.
    pub fn store(self, space: &mut FileSpace) -> Result<i64> {
        let mut body = Vec::with_capacity(64);
        put_int64_field(&mut body, 1, self.root_addr);
        put_int64_field(&mut body, 2, self.height as i64);
        put_int64_field(&mut body, 3, self.chain.head_addr());
        put_int64_field(&mut body, 4, self.chain.tail_addr());
        put_int64_field(&mut body, 5, self.leaf_count as i64);
        put_int64_field(&mut body, 6, self.non_leaf_count as i64);
        put_int64_field(&mut body, 7, self.record_count as i64);
        put_int64_field(&mut body, 8, self.payload_size as i64);

        let mut record = Vec::with_capacity(body.len() + 18);
        put_uvarint(&mut record, body.len() as u64);
        record.extend_from_slice(&body);
        record.extend_from_slice(&META_CRC.checksum(&body).to_be_bytes());

        let (addr, view) = space.allocate(record.len())?;
        view[..record.len()].copy_from_slice(&record);
        Ok(addr)
    }

    /// Loads a tree from its serialized state, consuming the region.
    pub fn load(space: &mut FileSpace, info_addr: i64) -> Result<Self> {
        let view = space.access(info_addr)?;
        let (body_len, prefix_len) = decode_uvarint(view)?;
        let body_len = body_len as usize;
        ensure!(
            prefix_len + body_len + 8 <= view.len(),
            "tree metadata record overruns its region"
        );

        let body = &view[prefix_len..prefix_len + body_len];
        let stored_crc = u64::from_be_bytes(
            view[prefix_len + body_len..prefix_len + body_len + 8]
                .try_into()
                .unwrap(),
        );
        ensure!(
            META_CRC.checksum(body) == stored_crc,
            "tree metadata record failed its checksum"
        );

        let mut root_addr = NIL_ADDR;
        let mut height = 0i64;
        let mut leaf_head_addr = NIL_ADDR;
        let mut leaf_tail_addr = NIL_ADDR;
        let mut leaf_count = 0i64;
        let mut non_leaf_count = 0i64;
        let mut record_count = 0i64;
        let mut payload_size = 0i64;

        let mut reader = WireReader::new(body);
        while let Some((field, wire_type)) = reader.next_tag()? {
            check_wire_type("tree metadata", field, wire_type, WIRE_VARINT)?;
            let value = reader.read_int64()?;
            match field {
                1 => root_addr = value,
                2 => height = value,
                3 => leaf_head_addr = value,
                4 => leaf_tail_addr = value,
                5 => leaf_count = value,
                6 => non_leaf_count = value,
                7 => record_count = value,
                8 => payload_size = value,
                _ => return Err(unknown_field("tree metadata", field)),
            }
        }

        ensure!(
            root_addr >= 0
                && height >= 1
                && leaf_head_addr >= 0
                && leaf_tail_addr >= 0
                && leaf_count >= 1
                && non_leaf_count >= 0
                && record_count >= 0
                && payload_size >= 0,
            "tree metadata record holds inconsistent counters"
        );

        space.free(info_addr)?;

        Ok(Self {
            root_addr,
            height: height as usize,
            chain: LeafChain::with_endpoints(leaf_head_addr, leaf_tail_addr),
            leaf_count: leaf_count as usize,
            non_leaf_count: non_leaf_count as usize,
            record_count: record_count as usize,
            payload_size: payload_size as usize,
        })
    }

    /// Inserts the record unless the key is already present. Returns the
    /// present value (when requested) and whether an insert happened.
    pub fn add(
        &mut self,
        space: &mut FileSpace,
        key: &[u8],
        value: &[u8],
        want_present: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        let (path, found) = self.find_record(space, SearchBound::Key(key))?;

        if found {
            return Ok((read_record_value(space, &path, want_present)?, false));
        }

        let record = self.create_record(space, key, value)?;
        self.insert_record(space, path, record)?;
        Ok((None, true))
    }

    /// Replaces the value of an existing key. Returns the replaced value
    /// (when requested) and whether the key existed.
    pub fn update(
        &mut self,
        space: &mut FileSpace,
        key: &[u8],
        value: &[u8],
        want_replaced: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        let (mut path, found) = self.find_record(space, SearchBound::Key(key))?;

        if !found {
            return Ok((None, false));
        }
        Ok((
            self.replace_value(space, &mut path, value, want_replaced)?,
            true,
        ))
    }

    /// Upsert: insert when absent, replace when present.
    pub fn add_or_update(
        &mut self,
        space: &mut FileSpace,
        key: &[u8],
        value: &[u8],
        want_replaced: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        let (mut path, found) = self.find_record(space, SearchBound::Key(key))?;

        if found {
            return Ok((
                self.replace_value(space, &mut path, value, want_replaced)?,
                false,
            ));
        }

        let record = self.create_record(space, key, value)?;
        self.insert_record(space, path, record)?;
        Ok((None, true))
    }

    /// Deletes a key. Returns the removed value (when requested) and whether
    /// the key existed.
    pub fn delete(
        &mut self,
        space: &mut FileSpace,
        key: &[u8],
        want_removed: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        let (path, found) = self.find_record(space, SearchBound::Key(key))?;

        if !found {
            return Ok((None, false));
        }

        let record = self.remove_record(space, path)?;
        let removed = self.destroy_record(space, record, want_removed)?;
        Ok((removed, true))
    }

    /// Looks a key up. Returns the present value (when requested) and
    /// whether the key exists.
    pub fn has(
        &self,
        space: &FileSpace,
        key: &[u8],
        want_present: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        let (path, found) = self.find_record(space, SearchBound::Key(key))?;

        if !found {
            return Ok((None, false));
        }
        Ok((read_record_value(space, &path, want_present)?, true))
    }

    /// Ascending iteration over the records in `[min, max]`.
    pub fn search_forward<'s>(
        &self,
        space: &'s FileSpace,
        min: SearchBound,
        max: SearchBound,
    ) -> Result<RangeIter<'s>> {
        Ok(RangeIter::forward(space, self.search(space, min, max)?))
    }

    /// Descending iteration over the records in `[min, max]`.
    pub fn search_backward<'s>(
        &self,
        space: &'s FileSpace,
        min: SearchBound,
        max: SearchBound,
    ) -> Result<RangeIter<'s>> {
        Ok(RangeIter::backward(space, self.search(space, min, max)?))
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn leaf_head_addr(&self) -> i64 {
        self.chain.head_addr()
    }

    pub fn leaf_tail_addr(&self) -> i64 {
        self.chain.tail_addr()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn non_leaf_count(&self) -> usize {
        self.non_leaf_count
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Descends from the root, returning the path to `bound`'s slot and
    /// whether an exact record was found.
    fn find_record(&self, space: &FileSpace, bound: SearchBound) -> Result<(RecordPath, bool)> {
        let mut path = RecordPath::new();

        if self.record_count == 0 {
            path.push(PathEntry {
                node_addr: self.root_addr,
                index: 0,
            });
            return Ok((path, false));
        }

        let mut node_addr = self.root_addr;
        loop {
            if path.len() + 1 == self.height {
                let leaf = LeafRef::from_page(space.access_aligned(node_addr)?)?;
                let (index, found) = leaf.locate_record(space, bound)?;
                path.push(PathEntry { node_addr, index });
                return Ok((path, found));
            }

            let node = NonLeafRef::from_page(space.access_aligned(node_addr)?)?;
            let (mut index, found) = node.locate_child(space, bound)?;
            if !found {
                index -= 1;
            }
            path.push(PathEntry { node_addr, index });
            node_addr = node.child_addr(index)?;
        }
    }

    fn create_record(
        &mut self,
        space: &mut FileSpace,
        raw_key: &[u8],
        raw_value: &[u8],
    ) -> Result<Record> {
        let key = create_key(space, raw_key)?;
        let value = create_value(space, raw_value)?;
        self.payload_size += raw_key.len() + raw_value.len();
        Ok(Record { key, value })
    }

    fn destroy_record(
        &mut self,
        space: &mut FileSpace,
        record: Record,
        want_value: bool,
    ) -> Result<Option<Vec<u8>>> {
        let key_size = destroy_key(space, &record.key)?;
        let value = if want_value {
            Some(read_value(space, &record.value)?)
        } else {
            None
        };
        let value_size = destroy_value(space, &record.value)?;
        self.payload_size -= key_size + value_size;
        Ok(value)
    }

    fn insert_record(
        &mut self,
        space: &mut FileSpace,
        mut path: RecordPath,
        record: Record,
    ) -> Result<()> {
        let entry = *path.last().unwrap();
        {
            let mut leaf = LeafMut::from_page(space.access_aligned_mut(entry.node_addr)?)?;
            leaf.insert_records(entry.index, std::slice::from_ref(&record))?;
        }
        self.sync_key(space, &mut path)?;
        self.ensure_not_overload_leaf(space, &mut path)?;
        self.record_count += 1;
        Ok(())
    }

    fn remove_record(&mut self, space: &mut FileSpace, mut path: RecordPath) -> Result<Record> {
        let entry = *path.last().unwrap();
        let record = {
            let mut leaf = LeafMut::from_page(space.access_aligned_mut(entry.node_addr)?)?;
            leaf.remove_records(entry.index, 1)?.pop().unwrap()
        };
        self.sync_key(space, &mut path)?;
        self.ensure_not_underload_leaf(space, &mut path)?;
        self.record_count -= 1;
        Ok(record)
    }

    fn replace_value(
        &mut self,
        space: &mut FileSpace,
        path: &mut RecordPath,
        raw_value: &[u8],
        want_replaced: bool,
    ) -> Result<Option<Vec<u8>>> {
        let entry = *path.last().unwrap();
        let stored = {
            let leaf = LeafRef::from_page(space.access_aligned(entry.node_addr)?)?;
            leaf.value_at(entry.index)?.to_vec()
        };

        let (replaced, old_size) = if want_replaced {
            let value = read_value(space, &stored)?;
            let size = value.len();
            (Some(value), size)
        } else {
            (None, value_size(space, &stored)?)
        };

        destroy_value(space, &stored)?;
        let new_stored = create_value(space, raw_value)?;
        {
            let mut leaf = LeafMut::from_page(space.access_aligned_mut(entry.node_addr)?)?;
            leaf.set_value(entry.index, &new_stored)?;
        }

        self.ensure_not_underload_leaf(space, path)?;
        self.ensure_not_overload_leaf(space, path)?;
        self.payload_size += raw_value.len();
        self.payload_size -= old_size;
        Ok(replaced)
    }

    /// After the record at index 0 of a leaf changed, rewrites the nearest
    /// ancestor separator that names this leaf's subtree. Ancestors entered
    /// through child 0 are transparent.
    fn sync_key(&mut self, space: &mut FileSpace, path: &mut RecordPath) -> Result<()> {
        let n = path.len();
        if n < 2 || path[n - 1].index >= 1 {
            return Ok(());
        }

        let first_key = {
            let leaf = LeafRef::from_page(space.access_aligned(path[n - 1].node_addr)?)?;
            leaf.key_at(0)?.to_vec()
        };

        for i in (0..n - 1).rev() {
            let child_index = path[i].index;
            if child_index >= 1 {
                {
                    let mut node =
                        NonLeafMut::from_page(space.access_aligned_mut(path[i].node_addr)?)?;
                    node.set_key(child_index, &first_key)?;
                }
                self.ensure_not_underload_nonleaf(space, path, i)?;
                self.ensure_not_overload_nonleaf(space, path, i)?;
                return Ok(());
            }
        }
        Ok(())
    }

    fn ensure_not_overload_leaf(
        &mut self,
        space: &mut FileSpace,
        path: &mut RecordPath,
    ) -> Result<()> {
        let mut i = path.len() - 1;
        let leaf_addr = path[i].node_addr;

        let load_size = LeafRef::from_page(space.access_aligned(leaf_addr)?)?.load_size();
        if load_size <= LEAF_OVERLOAD_THRESHOLD {
            return Ok(());
        }

        let record_index = path[i].index;

        if i == 0 {
            // The root leaf split grows the tree by one level first.
            self.increase_height(space)?;
            path.insert(
                0,
                PathEntry {
                    node_addr: self.root_addr,
                    index: 0,
                },
            );
            i = 1;
        }

        let parent_addr = path[i - 1].node_addr;
        let leaf_index = path[i - 1].index;
        let parent_child_count =
            NonLeafRef::from_page(space.access_aligned(parent_addr)?)?.child_count();

        if leaf_index < parent_child_count - 1 {
            let right_addr = NonLeafRef::from_page(space.access_aligned(parent_addr)?)?
                .child_addr(leaf_index + 1)?;
            let right_load = LeafRef::from_page(space.access_aligned(right_addr)?)?.load_size();
            let (move_count, kept) = {
                let leaf = LeafRef::from_page(space.access_aligned(leaf_addr)?)?;
                let count = leaf.count_records_for_shifting_right(right_load)?;
                (count, leaf.record_count().saturating_sub(count))
            };

            if move_count >= 1 {
                self.leaf_shift_to_right(
                    space, leaf_addr, parent_addr, leaf_index, right_addr, move_count,
                )?;

                if record_index >= kept {
                    path[i] = PathEntry {
                        node_addr: right_addr,
                        index: record_index - kept,
                    };
                    path[i - 1].index = leaf_index + 1;
                }

                self.ensure_not_underload_nonleaf(space, path, i - 1)?;
                self.ensure_not_overload_nonleaf(space, path, i - 1)?;
                return Ok(());
            }
        }

        if leaf_index >= 1 {
            let left_addr = NonLeafRef::from_page(space.access_aligned(parent_addr)?)?
                .child_addr(leaf_index - 1)?;
            let (left_load, left_count) = {
                let left = LeafRef::from_page(space.access_aligned(left_addr)?)?;
                (left.load_size(), left.record_count())
            };
            let move_count = LeafRef::from_page(space.access_aligned(leaf_addr)?)?
                .count_records_for_shifting_left(left_load)?;

            if move_count >= 1 {
                self.leaf_shift_to_left(
                    space, leaf_addr, parent_addr, leaf_index, left_addr, move_count,
                )?;

                if record_index < move_count {
                    path[i] = PathEntry {
                        node_addr: left_addr,
                        index: left_count + record_index,
                    };
                    path[i - 1].index = leaf_index - 1;
                } else {
                    path[i].index = record_index - move_count;
                }

                self.ensure_not_underload_nonleaf(space, path, i - 1)?;
                self.ensure_not_overload_nonleaf(space, path, i - 1)?;
                return Ok(());
            }
        }

        let (move_count, kept) = {
            let leaf = LeafRef::from_page(space.access_aligned(leaf_addr)?)?;
            let count = leaf.count_records_for_splitting()?;
            (count, leaf.record_count() - count)
        };
        let sibling_addr =
            self.leaf_split(space, leaf_addr, parent_addr, leaf_index, move_count)?;

        if record_index >= kept {
            path[i] = PathEntry {
                node_addr: sibling_addr,
                index: record_index - kept,
            };
            path[i - 1].index = leaf_index + 1;
        }

        self.ensure_not_overload_nonleaf(space, path, i - 1)
    }

    fn ensure_not_overload_nonleaf(
        &mut self,
        space: &mut FileSpace,
        path: &mut RecordPath,
        at: usize,
    ) -> Result<()> {
        let mut i = at;
        let node_addr = path[i].node_addr;

        let load_size = NonLeafRef::from_page(space.access_aligned(node_addr)?)?.load_size();
        if load_size <= NONLEAF_OVERLOAD_THRESHOLD {
            return Ok(());
        }

        let child_index = path[i].index;

        if i == 0 {
            self.increase_height(space)?;
            path.insert(
                0,
                PathEntry {
                    node_addr: self.root_addr,
                    index: 0,
                },
            );
            i = 1;
        }

        let parent_addr = path[i - 1].node_addr;
        let node_index = path[i - 1].index;
        let parent_child_count =
            NonLeafRef::from_page(space.access_aligned(parent_addr)?)?.child_count();

        if node_index < parent_child_count - 1 {
            let right_addr = NonLeafRef::from_page(space.access_aligned(parent_addr)?)?
                .child_addr(node_index + 1)?;
            let right_load = NonLeafRef::from_page(space.access_aligned(right_addr)?)?.load_size();
            let (move_count, kept) = {
                let node = NonLeafRef::from_page(space.access_aligned(node_addr)?)?;
                let count = node.count_children_for_shifting_right(right_load)?;
                (count, node.child_count().saturating_sub(count))
            };

            if move_count >= 1 {
                self.nonleaf_shift_to_right(
                    space, node_addr, parent_addr, node_index, right_addr, move_count,
                )?;

                if child_index >= kept {
                    path[i] = PathEntry {
                        node_addr: right_addr,
                        index: child_index - kept,
                    };
                    path[i - 1].index = node_index + 1;
                }

                self.ensure_not_underload_nonleaf(space, path, i - 1)?;
                self.ensure_not_overload_nonleaf(space, path, i - 1)?;
                return Ok(());
            }
        }

        if node_index >= 1 {
            let left_addr = NonLeafRef::from_page(space.access_aligned(parent_addr)?)?
                .child_addr(node_index - 1)?;
            let (left_load, left_count) = {
                let left = NonLeafRef::from_page(space.access_aligned(left_addr)?)?;
                (left.load_size(), left.child_count())
            };
            let move_count = NonLeafRef::from_page(space.access_aligned(node_addr)?)?
                .count_children_for_shifting_left(left_load)?;

            if move_count >= 1 {
                self.nonleaf_shift_to_left(
                    space, node_addr, parent_addr, node_index, left_addr, move_count,
                )?;

                if child_index < move_count {
                    path[i] = PathEntry {
                        node_addr: left_addr,
                        index: left_count + child_index,
                    };
                    path[i - 1].index = node_index - 1;
                } else {
                    path[i].index = child_index - move_count;
                }

                self.ensure_not_underload_nonleaf(space, path, i - 1)?;
                self.ensure_not_overload_nonleaf(space, path, i - 1)?;
                return Ok(());
            }
        }

        let (move_count, kept) = {
            let node = NonLeafRef::from_page(space.access_aligned(node_addr)?)?;
            let count = node.count_children_for_splitting()?;
            (count, node.child_count() - count)
        };
        let sibling_addr =
            self.nonleaf_split(space, node_addr, parent_addr, node_index, move_count)?;

        if child_index >= kept {
            path[i] = PathEntry {
                node_addr: sibling_addr,
                index: child_index - kept,
            };
            path[i - 1].index = node_index + 1;
        }

        self.ensure_not_overload_nonleaf(space, path, i - 1)
    }

    fn ensure_not_underload_leaf(
        &mut self,
        space: &mut FileSpace,
        path: &mut RecordPath,
    ) -> Result<()> {
        let i = path.len() - 1;
        if i == 0 {
            // The root leaf is exempt from the lower bound.
            return Ok(());
        }

        let leaf_addr = path[i].node_addr;
        let leaf_load = LeafRef::from_page(space.access_aligned(leaf_addr)?)?.load_size();
        if leaf_load >= LEAF_UNDERLOAD_THRESHOLD {
            return Ok(());
        }

        let record_index = path[i].index;
        let parent_addr = path[i - 1].node_addr;
        let leaf_index = path[i - 1].index;
        let parent_child_count =
            NonLeafRef::from_page(space.access_aligned(parent_addr)?)?.child_count();

        let right_addr = if leaf_index < parent_child_count - 1 {
            NonLeafRef::from_page(space.access_aligned(parent_addr)?)?.child_addr(leaf_index + 1)?
        } else {
            NIL_ADDR
        };
        if right_addr != NIL_ADDR {
            let move_count = LeafRef::from_page(space.access_aligned(right_addr)?)?
                .count_records_for_shifting_left(leaf_load)?;

            if move_count >= 1 {
                // Borrow from the right: the right sibling shifts leading
                // records into this leaf.
                self.leaf_shift_to_left(
                    space,
                    right_addr,
                    parent_addr,
                    leaf_index + 1,
                    leaf_addr,
                    move_count,
                )?;
                self.ensure_not_underload_nonleaf(space, path, i - 1)?;
                self.ensure_not_overload_nonleaf(space, path, i - 1)?;
                return Ok(());
            }
        }

        let left_addr = if leaf_index >= 1 {
            NonLeafRef::from_page(space.access_aligned(parent_addr)?)?.child_addr(leaf_index - 1)?
        } else {
            NIL_ADDR
        };
        if left_addr != NIL_ADDR {
            let move_count = LeafRef::from_page(space.access_aligned(left_addr)?)?
                .count_records_for_shifting_right(leaf_load)?;

            if move_count >= 1 {
                self.leaf_shift_to_right(
                    space,
                    left_addr,
                    parent_addr,
                    leaf_index - 1,
                    leaf_addr,
                    move_count,
                )?;
                path[i].index = move_count + record_index;
                self.ensure_not_underload_nonleaf(space, path, i - 1)?;
                self.ensure_not_overload_nonleaf(space, path, i - 1)?;
                return Ok(());
            }
        }

        if right_addr != NIL_ADDR {
            self.chain.remove(space, right_addr)?;
            self.leaf_merge_from_right(space, leaf_addr, parent_addr, leaf_index, right_addr)?;
            space.free_aligned(right_addr)?;
            self.leaf_count -= 1;
        } else {
            let left_count = LeafRef::from_page(space.access_aligned(left_addr)?)?.record_count();
            self.chain.remove(space, leaf_addr)?;
            self.leaf_merge_from_right(space, left_addr, parent_addr, leaf_index - 1, leaf_addr)?;
            space.free_aligned(leaf_addr)?;
            self.leaf_count -= 1;

            path[i] = PathEntry {
                node_addr: left_addr,
                index: left_count + record_index,
            };
            path[i - 1].index = leaf_index - 1;
        }

        self.ensure_not_underload_nonleaf(space, path, i - 1)
    }

    fn ensure_not_underload_nonleaf(
        &mut self,
        space: &mut FileSpace,
        path: &mut RecordPath,
        at: usize,
    ) -> Result<()> {
        let i = at;
        let node_addr = path[i].node_addr;

        if i == 0 {
            let child_count =
                NonLeafRef::from_page(space.access_aligned(node_addr)?)?.child_count();
            if child_count == 1 {
                self.decrease_height(space)?;
                path.remove(0);
            }
            return Ok(());
        }

        let node_load = NonLeafRef::from_page(space.access_aligned(node_addr)?)?.load_size();
        if node_load >= NONLEAF_UNDERLOAD_THRESHOLD {
            return Ok(());
        }

        let child_index = path[i].index;
        let parent_addr = path[i - 1].node_addr;
        let node_index = path[i - 1].index;
        let parent_child_count =
            NonLeafRef::from_page(space.access_aligned(parent_addr)?)?.child_count();

        let right_addr = if node_index < parent_child_count - 1 {
            NonLeafRef::from_page(space.access_aligned(parent_addr)?)?.child_addr(node_index + 1)?
        } else {
            NIL_ADDR
        };
        if right_addr != NIL_ADDR {
            let move_count = NonLeafRef::from_page(space.access_aligned(right_addr)?)?
                .count_children_for_shifting_left(node_load)?;

            if move_count >= 1 {
                self.nonleaf_shift_to_left(
                    space,
                    right_addr,
                    parent_addr,
                    node_index + 1,
                    node_addr,
                    move_count,
                )?;
                self.ensure_not_underload_nonleaf(space, path, i - 1)?;
                self.ensure_not_overload_nonleaf(space, path, i - 1)?;
                return Ok(());
            }
        }

        let left_addr = if node_index >= 1 {
            NonLeafRef::from_page(space.access_aligned(parent_addr)?)?.child_addr(node_index - 1)?
        } else {
            NIL_ADDR
        };
        if left_addr != NIL_ADDR {
            let move_count = NonLeafRef::from_page(space.access_aligned(left_addr)?)?
                .count_children_for_shifting_right(node_load)?;

            if move_count >= 1 {
                self.nonleaf_shift_to_right(
                    space,
                    left_addr,
                    parent_addr,
                    node_index - 1,
                    node_addr,
                    move_count,
                )?;
                path[i].index = move_count + child_index;
                self.ensure_not_underload_nonleaf(space, path, i - 1)?;
                self.ensure_not_overload_nonleaf(space, path, i - 1)?;
                return Ok(());
            }
        }

        if right_addr != NIL_ADDR {
            self.nonleaf_merge_from_right(space, node_addr, parent_addr, node_index, right_addr)?;
            space.free_aligned(right_addr)?;
            self.non_leaf_count -= 1;
        } else {
            let left_count =
                NonLeafRef::from_page(space.access_aligned(left_addr)?)?.child_count();
            self.nonleaf_merge_from_right(
                space,
                left_addr,
                parent_addr,
                node_index - 1,
                node_addr,
            )?;
            space.free_aligned(node_addr)?;
            self.non_leaf_count -= 1;

            path[i] = PathEntry {
                node_addr: left_addr,
                index: left_count + child_index,
            };
            path[i - 1].index = node_index - 1;
        }

        self.ensure_not_underload_nonleaf(space, path, i - 1)
    }

    /// Moves the leaf's trailing records to the front of its right sibling,
    /// rewriting the sibling's separator in the parent.
    fn leaf_shift_to_right(
        &mut self,
        space: &mut FileSpace,
        leaf_addr: i64,
        parent_addr: i64,
        leaf_index: usize,
        right_addr: i64,
        count: usize,
    ) -> Result<()> {
        let records = {
            let mut leaf = LeafMut::from_page(space.access_aligned_mut(leaf_addr)?)?;
            let n = leaf.record_count();
            leaf.remove_records(n - count, count)?
        };
        NonLeafMut::from_page(space.access_aligned_mut(parent_addr)?)?
            .set_key(leaf_index + 1, &records[0].key)?;
        LeafMut::from_page(space.access_aligned_mut(right_addr)?)?.insert_records(0, &records)?;
        Ok(())
    }

    /// Moves the leaf's leading records to the back of its left sibling,
    /// rewriting this leaf's separator in the parent.
    fn leaf_shift_to_left(
        &mut self,
        space: &mut FileSpace,
        leaf_addr: i64,
        parent_addr: i64,
        leaf_index: usize,
        left_addr: i64,
        count: usize,
    ) -> Result<()> {
        let records = {
            let mut leaf = LeafMut::from_page(space.access_aligned_mut(leaf_addr)?)?;
            leaf.remove_records(0, count)?
        };
        let new_first = {
            let leaf = LeafRef::from_page(space.access_aligned(leaf_addr)?)?;
            leaf.key_at(0)?.to_vec()
        };
        NonLeafMut::from_page(space.access_aligned_mut(parent_addr)?)?
            .set_key(leaf_index, &new_first)?;
        {
            let mut left = LeafMut::from_page(space.access_aligned_mut(left_addr)?)?;
            let left_count = left.record_count();
            left.insert_records(left_count, &records)?;
        }
        Ok(())
    }

    /// Splits off the leaf's trailing records into a fresh right sibling,
    /// giving the parent a new child entry and splicing the sibling into
    /// the chain.
    fn leaf_split(
        &mut self,
        space: &mut FileSpace,
        leaf_addr: i64,
        parent_addr: i64,
        leaf_index: usize,
        count: usize,
    ) -> Result<i64> {
        let (sibling_addr, view) = space.allocate_aligned(PAGE_SIZE)?;
        LeafMut::init(view)?;
        self.leaf_count += 1;

        let records = {
            let mut leaf = LeafMut::from_page(space.access_aligned_mut(leaf_addr)?)?;
            let n = leaf.record_count();
            leaf.remove_records(n - count, count)?
        };
        LeafMut::from_page(space.access_aligned_mut(sibling_addr)?)?
            .insert_records(0, &records)?;
        NonLeafMut::from_page(space.access_aligned_mut(parent_addr)?)?.insert_children(
            leaf_index + 1,
            &[Child {
                key: records[0].key.clone(),
                addr: sibling_addr,
            }],
        )?;
        self.chain.insert_after(space, sibling_addr, leaf_addr)?;
        Ok(sibling_addr)
    }

    /// Absorbs the right sibling's records and drops its child entry from
    /// the parent. The caller unlinks and frees the sibling.
    fn leaf_merge_from_right(
        &mut self,
        space: &mut FileSpace,
        leaf_addr: i64,
        parent_addr: i64,
        leaf_index: usize,
        right_addr: i64,
    ) -> Result<()> {
        NonLeafMut::from_page(space.access_aligned_mut(parent_addr)?)?
            .remove_children(leaf_index + 1, 1)?;
        let records = {
            let mut right = LeafMut::from_page(space.access_aligned_mut(right_addr)?)?;
            let n = right.record_count();
            right.remove_records(0, n)?
        };
        {
            let mut leaf = LeafMut::from_page(space.access_aligned_mut(leaf_addr)?)?;
            let n = leaf.record_count();
            leaf.insert_records(n, &records)?;
        }
        Ok(())
    }

    /// Moves the node's trailing children to the front of its right
    /// sibling. The sibling's old dummy key takes the parent separator and
    /// the moved run's first key is promoted in its place.
    fn nonleaf_shift_to_right(
        &mut self,
        space: &mut FileSpace,
        node_addr: i64,
        parent_addr: i64,
        node_index: usize,
        right_addr: i64,
        count: usize,
    ) -> Result<()> {
        let mut children = {
            let mut node = NonLeafMut::from_page(space.access_aligned_mut(node_addr)?)?;
            let n = node.child_count();
            node.remove_children(n - count, count)?
        };
        let separator = {
            let parent = NonLeafRef::from_page(space.access_aligned(parent_addr)?)?;
            parent.key_at(node_index + 1)?.to_vec()
        };
        NonLeafMut::from_page(space.access_aligned_mut(right_addr)?)?.set_key(0, &separator)?;
        NonLeafMut::from_page(space.access_aligned_mut(parent_addr)?)?
            .set_key(node_index + 1, &children[0].key)?;
        children[0].key = Vec::new();
        NonLeafMut::from_page(space.access_aligned_mut(right_addr)?)?
            .insert_children(0, &children)?;
        Ok(())
    }

    /// Moves the node's leading children to the back of its left sibling.
    /// The parent separator drops down onto the moved dummy child and the
    /// node's new first key is promoted in its place.
    fn nonleaf_shift_to_left(
        &mut self,
        space: &mut FileSpace,
        node_addr: i64,
        parent_addr: i64,
        node_index: usize,
        left_addr: i64,
        count: usize,
    ) -> Result<()> {
        let mut children = {
            let mut node = NonLeafMut::from_page(space.access_aligned_mut(node_addr)?)?;
            node.remove_children(0, count)?
        };
        children[0].key = {
            let parent = NonLeafRef::from_page(space.access_aligned(parent_addr)?)?;
            parent.key_at(node_index)?.to_vec()
        };
        let new_first = {
            let node = NonLeafRef::from_page(space.access_aligned(node_addr)?)?;
            node.key_at(0)?.to_vec()
        };
        NonLeafMut::from_page(space.access_aligned_mut(parent_addr)?)?
            .set_key(node_index, &new_first)?;
        NonLeafMut::from_page(space.access_aligned_mut(node_addr)?)?.set_key(0, &[])?;
        {
            let mut left = NonLeafMut::from_page(space.access_aligned_mut(left_addr)?)?;
            let left_count = left.child_count();
            left.insert_children(left_count, &children)?;
        }
        Ok(())
    }

    /// Splits off the node's trailing children into a fresh right sibling.
    /// The moved run's first key is promoted into the parent and the new
    /// sibling's child 0 keeps the dummy key.
    fn nonleaf_split(
        &mut self,
        space: &mut FileSpace,
        node_addr: i64,
        parent_addr: i64,
        node_index: usize,
        count: usize,
    ) -> Result<i64> {
        let (sibling_addr, view) = space.allocate_aligned(PAGE_SIZE)?;
        NonLeafMut::init(view)?;
        self.non_leaf_count += 1;

        let mut children = {
            let mut node = NonLeafMut::from_page(space.access_aligned_mut(node_addr)?)?;
            let n = node.child_count();
            node.remove_children(n - count, count)?
        };
        let promoted = std::mem::take(&mut children[0].key);
        NonLeafMut::from_page(space.access_aligned_mut(sibling_addr)?)?
            .insert_children(0, &children)?;
        NonLeafMut::from_page(space.access_aligned_mut(parent_addr)?)?.insert_children(
            node_index + 1,
            &[Child {
                key: promoted,
                addr: sibling_addr,
            }],
        )?;
        Ok(sibling_addr)
    }

    /// Absorbs the right sibling's children; the separator between the two
    /// drops down onto the sibling's dummy child.
    fn nonleaf_merge_from_right(
        &mut self,
        space: &mut FileSpace,
        node_addr: i64,
        parent_addr: i64,
        node_index: usize,
        right_addr: i64,
    ) -> Result<()> {
        let separator = NonLeafMut::from_page(space.access_aligned_mut(parent_addr)?)?
            .remove_children(node_index + 1, 1)?
            .pop()
            .unwrap()
            .key;
        let mut children = {
            let mut right = NonLeafMut::from_page(space.access_aligned_mut(right_addr)?)?;
            let n = right.child_count();
            right.remove_children(0, n)?
        };
        children[0].key = separator;
        {
            let mut node = NonLeafMut::from_page(space.access_aligned_mut(node_addr)?)?;
            let n = node.child_count();
            node.insert_children(n, &children)?;
        }
        Ok(())
    }

    fn increase_height(&mut self, space: &mut FileSpace) -> Result<()> {
        let old_root = self.root_addr;
        let (root_addr, view) = space.allocate_aligned(PAGE_SIZE)?;
        let mut root = NonLeafMut::init(view)?;
        root.insert_children(
            0,
            &[Child {
                key: Vec::new(),
                addr: old_root,
            }],
        )?;
        self.non_leaf_count += 1;
        self.root_addr = root_addr;
        self.height += 1;
        Ok(())
    }

    fn decrease_height(&mut self, space: &mut FileSpace) -> Result<()> {
        let child_addr =
            NonLeafRef::from_page(space.access_aligned(self.root_addr)?)?.child_addr(0)?;
        space.free_aligned(self.root_addr)?;
        self.non_leaf_count -= 1;
        self.root_addr = child_addr;
        self.height -= 1;
        Ok(())
    }

    /// Normalizes the range bounds against the actual records, returning
    /// the `(leaf, index)` endpoints of the non-empty range, or None.
    fn search(
        &self,
        space: &FileSpace,
        min: SearchBound,
        max: SearchBound,
    ) -> Result<Option<(i64, usize, i64, usize)>> {
        use std::cmp::Ordering;

        if self.record_count == 0 {
            return Ok(None);
        }

        let min_unbounded = min.is_min() || min.is_max();
        let max_unbounded = max.is_min() || max.is_max();

        let mut d;
        if min_unbounded || max_unbounded {
            if min_unbounded && max_unbounded {
                if min.is_max() && max.is_min() {
                    // Crossed unbounded ends select nothing.
                    return Ok(None);
                }
                d = if min.is_min() == max.is_min() {
                    Ordering::Equal
                } else {
                    Ordering::Less
                };
            } else {
                d = Ordering::Less;
            }
        } else {
            let (SearchBound::Key(min_raw), SearchBound::Key(max_raw)) = (min, max) else {
                unreachable!()
            };
            d = min_raw.cmp(max_raw);
            if d == Ordering::Greater {
                return Ok(None);
            }
        }

        let (min_path, min_found) = self.find_record(space, min)?;
        let mut min_leaf_addr = min_path.last().unwrap().node_addr;
        let mut min_index = min_path.last().unwrap().index;

        if !min_found {
            let leaf = LeafRef::from_page(space.access_aligned(min_leaf_addr)?)?;
            if min_index == leaf.record_count() {
                // The insertion point fell past this leaf's records.
                if min_leaf_addr == self.chain.tail_addr() {
                    return Ok(None);
                }
                min_leaf_addr = leaf.next_addr();
                min_index = 0;
            }
        }

        if d == Ordering::Equal {
            // Equal real bounds select their key only when it exists.
            if !min_unbounded && !min_found {
                return Ok(None);
            }
            return Ok(Some((min_leaf_addr, min_index, min_leaf_addr, min_index)));
        }

        // Resolve the effective minimum unless min was a real key found
        // exactly.
        let min_effective: Vec<u8> = if !(!min_unbounded && min_found) {
            let resolved = {
                let leaf = LeafRef::from_page(space.access_aligned(min_leaf_addr)?)?;
                read_key(space, leaf.key_at(min_index)?)?
            };
            if let SearchBound::Key(max_raw) = max {
                d = resolved.as_slice().cmp(max_raw);
                if d == Ordering::Greater {
                    return Ok(None);
                }
                if d == Ordering::Equal {
                    return Ok(Some((min_leaf_addr, min_index, min_leaf_addr, min_index)));
                }
            }
            resolved
        } else {
            match min {
                SearchBound::Key(raw) => raw.to_vec(),
                _ => unreachable!(),
            }
        };

        let (max_path, max_found) = self.find_record(space, max)?;
        let max_leaf_addr = max_path.last().unwrap().node_addr;
        let mut max_index = max_path.last().unwrap().index;

        if !max_found {
            if max_index == 0 {
                return Ok(None);
            }
            max_index -= 1;
        }

        if !(!max_unbounded && max_found) {
            let max_resolved = {
                let leaf = LeafRef::from_page(space.access_aligned(max_leaf_addr)?)?;
                read_key(space, leaf.key_at(max_index)?)?
            };
            if min_effective > max_resolved {
                return Ok(None);
            }
        }

        Ok(Some((min_leaf_addr, min_index, max_leaf_addr, max_index)))
    }
}

fn read_record_value(
    space: &FileSpace,
    path: &RecordPath,
    want: bool,
) -> Result<Option<Vec<u8>>> {
    if !want {
        return Ok(None);
    }
    let entry = path.last().unwrap();
    let leaf = LeafRef::from_page(space.access_aligned(entry.node_addr)?)?;
    let value = read_value(space, leaf.value_at(entry.index)?)?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_tree() -> (tempfile::TempDir, FileSpace, BpTree) {
        let dir = tempdir().unwrap();
        let mut space = FileSpace::open(dir.path().join("test.db"), true).unwrap();
        let tree = BpTree::create(&mut space).unwrap();
        (dir, space, tree)
    }

    fn forward_keys(space: &FileSpace, tree: &BpTree) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        let mut iter = tree
            .search_forward(space, SearchBound::Min, SearchBound::Max)
            .unwrap();
        while !iter.is_at_end() {
            keys.push(iter.read_key().unwrap());
            iter.advance().unwrap();
        }
        keys
    }

    /// Walks the whole tree checking load bounds, in-node key order, and
    /// that every separator equals the smallest key of its subtree.
    /// Returns the subtree's (smallest, largest) raw keys.
    fn verify_subtree(
        space: &FileSpace,
        tree: &BpTree,
        node_addr: i64,
        depth: usize,
    ) -> (Vec<u8>, Vec<u8>) {
        let is_root = node_addr == tree.root_addr;

        if depth == tree.height {
            let leaf = LeafRef::from_page(space.access_aligned(node_addr).unwrap()).unwrap();
            let load = leaf.load_size();
            assert!(load <= LEAF_OVERLOAD_THRESHOLD, "overloaded leaf");
            if !is_root {
                assert!(load >= LEAF_UNDERLOAD_THRESHOLD, "underloaded leaf");
            }

            let n = leaf.record_count();
            assert!(n >= 1, "empty non-root leaf");
            let mut keys = Vec::with_capacity(n);
            for i in 0..n {
                keys.push(read_key(space, leaf.key_at(i).unwrap()).unwrap());
            }
            assert!(
                keys.windows(2).all(|pair| pair[0] < pair[1]),
                "leaf keys out of order"
            );
            return (keys[0].clone(), keys[n - 1].clone());
        }

        let node = NonLeafRef::from_page(space.access_aligned(node_addr).unwrap()).unwrap();
        let load = node.load_size();
        assert!(load <= NONLEAF_OVERLOAD_THRESHOLD, "overloaded non-leaf");
        if !is_root {
            assert!(load >= NONLEAF_UNDERLOAD_THRESHOLD, "underloaded non-leaf");
        }

        let n = node.child_count();
        assert!(n >= 1);
        let mut subtree_min = None;
        let mut prev_max: Option<Vec<u8>> = None;
        for i in 0..n {
            let child_addr = node.child_addr(i).unwrap();
            let (child_min, child_max) = verify_subtree(space, tree, child_addr, depth + 1);

            if i >= 1 {
                let separator = read_key(space, node.key_at(i).unwrap()).unwrap();
                assert_eq!(separator, child_min, "separator differs from subtree minimum");
            }
            if let Some(prev) = &prev_max {
                assert!(prev < &child_min, "subtrees out of order");
            }

            subtree_min.get_or_insert(child_min);
            prev_max = Some(child_max);
        }
        (subtree_min.unwrap(), prev_max.unwrap())
    }

    fn verify_tree(space: &FileSpace, tree: &BpTree) {
        if tree.record_count() > 0 {
            verify_subtree(space, tree, tree.root_addr, 1);
        }
    }

    #[test]
    fn create_starts_with_one_empty_leaf() {
        let (_dir, _space, tree) = create_tree();

        assert_eq!(tree.height(), 1);
        assert_eq!(tree.leaf_count(), 1);
        assert_eq!(tree.non_leaf_count(), 0);
        assert_eq!(tree.record_count(), 0);
        assert_eq!(tree.payload_size(), 0);
    }

    #[test]
    fn add_and_has_roundtrip() {
        let (_dir, mut space, mut tree) = create_tree();

        let (_, inserted) = tree.add(&mut space, b"foo", b"bar", false).unwrap();
        assert!(inserted);

        let (value, present) = tree.has(&space, b"foo", true).unwrap();
        assert!(present);
        assert_eq!(value.unwrap(), b"bar");
        assert_eq!(tree.record_count(), 1);
    }

    #[test]
    fn add_existing_key_is_a_noop() {
        let (_dir, mut space, mut tree) = create_tree();

        tree.add(&mut space, b"k", b"first", false).unwrap();
        let (present, inserted) = tree.add(&mut space, b"k", b"second", true).unwrap();

        assert!(!inserted);
        assert_eq!(present.unwrap(), b"first");
        assert_eq!(tree.record_count(), 1);
    }

    #[test]
    fn update_and_delete_roundtrip() {
        let (_dir, mut space, mut tree) = create_tree();

        tree.add(&mut space, b"hello", b"w0rd", false).unwrap();
        let (replaced, existed) = tree.update(&mut space, b"hello", b"world", true).unwrap();
        assert!(existed);
        assert_eq!(replaced.unwrap(), b"w0rd");

        let (removed, existed) = tree.delete(&mut space, b"hello", true).unwrap();
        assert!(existed);
        assert_eq!(removed.unwrap(), b"world");
        assert_eq!(tree.record_count(), 0);
        assert_eq!(tree.payload_size(), 0);
    }

    #[test]
    fn update_missing_key_is_a_noop() {
        let (_dir, mut space, mut tree) = create_tree();
        let (_, existed) = tree.update(&mut space, b"ghost", b"v", false).unwrap();
        assert!(!existed);
    }

    #[test]
    fn delete_missing_key_reports_absent() {
        let (_dir, mut space, mut tree) = create_tree();
        tree.add(&mut space, b"k", b"v", false).unwrap();
        let (_, existed) = tree.delete(&mut space, b"nope", false).unwrap();
        assert!(!existed);
    }

    #[test]
    fn inserts_come_back_sorted() {
        let (_dir, mut space, mut tree) = create_tree();

        let mut keys: Vec<String> = (0..3000).map(|i| format!("key-{:05}", i * 7 % 3000)).collect();
        for key in &keys {
            tree.add(&mut space, key.as_bytes(), key.as_bytes(), false)
                .unwrap();
        }
        keys.sort();

        let scanned = forward_keys(&space, &tree);
        assert_eq!(scanned.len(), keys.len());
        for (scanned_key, key) in scanned.iter().zip(keys.iter()) {
            assert_eq!(scanned_key, key.as_bytes());
        }
        assert!(tree.height() >= 2);
        assert!(tree.non_leaf_count() >= 1);
        verify_tree(&space, &tree);
    }

    #[test]
    fn deletes_shrink_the_tree_back_to_a_leaf() {
        let (_dir, mut space, mut tree) = create_tree();

        let keys: Vec<String> = (0..3000).map(|i| format!("key-{:05}", i)).collect();
        for key in &keys {
            tree.add(&mut space, key.as_bytes(), key.as_bytes(), false)
                .unwrap();
        }
        assert!(tree.height() >= 2);

        for key in &keys {
            let (_, existed) = tree.delete(&mut space, key.as_bytes(), false).unwrap();
            assert!(existed, "missing {}", key);
        }

        assert_eq!(tree.record_count(), 0);
        assert_eq!(tree.height(), 1);
        assert_eq!(tree.leaf_count(), 1);
        assert_eq!(tree.non_leaf_count(), 0);
        assert_eq!(tree.payload_size(), 0);
    }

    #[test]
    fn destroy_after_emptying_releases_all_space() {
        let (_dir, mut space, mut tree) = create_tree();

        for i in 0..2000 {
            let key = format!("key-{:05}", i);
            tree.add(&mut space, key.as_bytes(), b"v", false).unwrap();
        }
        for i in 0..2000 {
            let key = format!("key-{:05}", i);
            tree.delete(&mut space, key.as_bytes(), false).unwrap();
        }

        tree.destroy(&mut space).unwrap();
        assert_eq!(space.stats().used_size, 0);
        assert_eq!(space.stats().allocation_count, 0);
    }

    #[test]
    fn long_keys_and_values_roundtrip() {
        let (_dir, mut space, mut tree) = create_tree();

        let key = vec![b'K'; 4096];
        let value = vec![b'V'; 4096];
        tree.add(&mut space, &key, &value, false).unwrap();

        let (found, present) = tree.has(&space, &key, true).unwrap();
        assert!(present);
        assert_eq!(found.unwrap(), value);

        let (removed, existed) = tree.delete(&mut space, &key, true).unwrap();
        assert!(existed);
        assert_eq!(removed.unwrap(), value);
    }

    #[test]
    fn overflow_space_is_reclaimed_on_delete() {
        let (_dir, mut space, mut tree) = create_tree();
        let baseline = space.stats().used_size;

        let key = vec![b'K'; 4096];
        let value = vec![b'V'; 4096];
        tree.add(&mut space, &key, &value, false).unwrap();
        assert!(space.stats().used_size > baseline);

        tree.delete(&mut space, &key, false).unwrap();
        assert_eq!(space.stats().used_size, baseline);
    }

    #[test]
    fn replacing_values_across_the_overflow_boundary() {
        let (_dir, mut space, mut tree) = create_tree();

        tree.add(&mut space, b"k", b"short", false).unwrap();
        tree.update(&mut space, b"k", &vec![b'L'; 500], false).unwrap();
        assert_eq!(tree.has(&space, b"k", true).unwrap().0.unwrap(), vec![b'L'; 500]);

        tree.update(&mut space, b"k", b"tiny", false).unwrap();
        assert_eq!(tree.has(&space, b"k", true).unwrap().0.unwrap(), b"tiny");
        assert_eq!(tree.payload_size(), 1 + 4);
    }

    #[test]
    fn range_forward_and_backward_are_mirrors() {
        let (_dir, mut space, mut tree) = create_tree();

        for i in 0..500 {
            let key = format!("key-{:04}", i);
            tree.add(&mut space, key.as_bytes(), b"v", false).unwrap();
        }

        let min = "key-0100".as_bytes();
        let max = "key-0299".as_bytes();
        let mut ascending = Vec::new();
        let mut iter = tree
            .search_forward(&space, SearchBound::Key(min), SearchBound::Key(max))
            .unwrap();
        while !iter.is_at_end() {
            ascending.push(iter.read_key().unwrap());
            iter.advance().unwrap();
        }
        assert_eq!(ascending.len(), 200);
        assert_eq!(ascending[0], min);
        assert_eq!(ascending[199], max);

        let mut descending = Vec::new();
        let mut iter = tree
            .search_backward(&space, SearchBound::Key(min), SearchBound::Key(max))
            .unwrap();
        while !iter.is_at_end() {
            descending.push(iter.read_key().unwrap());
            iter.advance().unwrap();
        }
        descending.reverse();
        assert_eq!(ascending, descending);
    }

    #[test]
    fn range_bounds_need_not_exist() {
        let (_dir, mut space, mut tree) = create_tree();

        for i in (0..100).step_by(2) {
            let key = format!("key-{:04}", i);
            tree.add(&mut space, key.as_bytes(), b"v", false).unwrap();
        }

        let mut iter = tree
            .search_forward(
                &space,
                SearchBound::Key(b"key-0001"),
                SearchBound::Key(b"key-0005"),
            )
            .unwrap();
        let mut keys = Vec::new();
        while !iter.is_at_end() {
            keys.push(iter.read_key().unwrap());
            iter.advance().unwrap();
        }
        assert_eq!(keys, vec![b"key-0002".to_vec(), b"key-0004".to_vec()]);
    }

    #[test]
    fn empty_and_inverted_ranges() {
        let (_dir, mut space, mut tree) = create_tree();

        tree.add(&mut space, b"b", b"2", false).unwrap();
        tree.add(&mut space, b"d", b"4", false).unwrap();

        let iter = tree
            .search_forward(&space, SearchBound::Max, SearchBound::Min)
            .unwrap();
        assert!(iter.is_at_end());

        let iter = tree
            .search_forward(&space, SearchBound::Key(b"d"), SearchBound::Key(b"b"))
            .unwrap();
        assert!(iter.is_at_end());

        let iter = tree
            .search_forward(&space, SearchBound::Key(b"e"), SearchBound::Key(b"z"))
            .unwrap();
        assert!(iter.is_at_end());

        let iter = tree
            .search_forward(&space, SearchBound::Key(b"c"), SearchBound::Key(b"c"))
            .unwrap();
        assert!(iter.is_at_end());
    }

    #[test]
    fn sentinel_singletons_resolve_to_the_extremes() {
        let (_dir, mut space, mut tree) = create_tree();

        tree.add(&mut space, b"foo", b"bar", false).unwrap();
        tree.add(&mut space, b"hello", b"world", false).unwrap();

        let iter = tree
            .search_forward(&space, SearchBound::Min, SearchBound::Min)
            .unwrap();
        assert_eq!(iter.read_key().unwrap(), b"foo");

        let iter = tree
            .search_backward(&space, SearchBound::Max, SearchBound::Max)
            .unwrap();
        assert_eq!(iter.read_key().unwrap(), b"hello");

        // The actual smallest key paired with the lower sentinel selects
        // exactly that record.
        let mut iter = tree
            .search_forward(&space, SearchBound::Key(b"foo"), SearchBound::Min)
            .unwrap();
        assert_eq!(iter.read_key().unwrap(), b"foo");
        iter.advance().unwrap();
        assert!(iter.is_at_end());
    }

    #[test]
    fn reading_an_exhausted_iterator_fails() {
        let (_dir, mut space, mut tree) = create_tree();
        tree.add(&mut space, b"k", b"v", false).unwrap();

        let mut iter = tree
            .search_forward(&space, SearchBound::Min, SearchBound::Max)
            .unwrap();
        iter.advance().unwrap();

        assert!(iter.is_at_end());
        assert!(iter.read_key().is_err());
        assert!(iter.read_value().is_err());
        assert!(iter.read_record().is_err());
    }

    #[test]
    fn store_and_load_preserve_order_and_counters() {
        let (_dir, mut space, mut tree) = create_tree();

        for i in 0..2000 {
            let key = format!("key-{:05}", i);
            tree.add(&mut space, key.as_bytes(), key.as_bytes(), false)
                .unwrap();
        }
        let record_count = tree.record_count();
        let height = tree.height();
        let leaf_count = tree.leaf_count();

        let info_addr = tree.store(&mut space).unwrap();
        let tree = BpTree::load(&mut space, info_addr).unwrap();

        assert_eq!(tree.record_count(), record_count);
        assert_eq!(tree.height(), height);
        assert_eq!(tree.leaf_count(), leaf_count);

        let keys = forward_keys(&space, &tree);
        assert_eq!(keys.len(), 2000);
        assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn load_rejects_corrupted_metadata() {
        let (_dir, mut space, mut tree) = create_tree();

        tree.add(&mut space, b"k", b"v", false).unwrap();
        let info_addr = tree.store(&mut space).unwrap();

        let view = space.access_mut(info_addr).unwrap();
        view[1] ^= 0xFF;

        assert!(BpTree::load(&mut space, info_addr).is_err());
    }

    #[test]
    fn leaf_chain_stays_sorted_under_churn() {
        let (_dir, mut space, mut tree) = create_tree();

        // Interleave inserts and deletes to force splits, shifts and merges.
        let mut live = Vec::new();
        for i in 0..4000u32 {
            let key = format!("key-{:08}", i.wrapping_mul(2654435761) % 100_000);
            let (_, inserted) = tree
                .add(&mut space, key.as_bytes(), key.as_bytes(), false)
                .unwrap();
            if inserted {
                live.push(key);
            }
            if i % 3 == 0 {
                if let Some(victim) = live.get((i as usize / 3) % live.len().max(1)).cloned() {
                    let (_, existed) = tree.delete(&mut space, victim.as_bytes(), false).unwrap();
                    if existed {
                        live.retain(|k| k != &victim);
                    }
                }
            }
        }

        live.sort();
        let keys = forward_keys(&space, &tree);
        assert_eq!(keys.len(), live.len());
        for (key, expected) in keys.iter().zip(live.iter()) {
            assert_eq!(key, expected.as_bytes());
        }
        verify_tree(&space, &tree);

        // Walk the chain head to tail and count the leaves.
        let mut leaf_addr = tree.leaf_head_addr();
        let mut visited = 1;
        while leaf_addr != tree.leaf_tail_addr() {
            let leaf = LeafRef::from_page(space.access_aligned(leaf_addr).unwrap()).unwrap();
            leaf_addr = leaf.next_addr();
            visited += 1;
            assert!(visited <= tree.leaf_count(), "leaf chain cycles");
        }
        assert_eq!(visited, tree.leaf_count());
    }
}
