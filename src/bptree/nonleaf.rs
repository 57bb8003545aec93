//! # Non-Leaf Pages
//!
//! A non-leaf is a fixed 8 KiB page of `(key, child address)` separators in
//! the same grow-from-ends layout as a leaf:
//!
//! ```text
//! +--------------------------------------------------+
//! | NonLeafHeader (4B): child_count                  |
//! | ChildDescriptor[0..n) (12B each, grows upward)   |
//! |   { key_offset, child_addr }                     |
//! |                free space                        |
//! | separator keys (grow downward from page end)     |
//! +--------------------------------------------------+
//! ```
//!
//! Child 0's key is a zero-length dummy; for `i >= 1`, child `i`'s key is
//! the smallest key reachable through that child. A key runs from its
//! descriptor's `key_offset` to the next descriptor's `key_offset` (the
//! last key ends at the page end).

use eyre::{bail, ensure, Result};
use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::storage::{FileSpace, PAGE_SIZE};

use super::key::{compare_stored, SearchBound};

pub const NONLEAF_SIZE: usize = PAGE_SIZE;
pub const NONLEAF_HEADER_SIZE: usize = 4;
pub const CHILD_HEADER_SIZE: usize = 12;

pub const MAX_NONLEAF_FREE_SIZE: usize = NONLEAF_SIZE - NONLEAF_HEADER_SIZE;
pub const MAX_CHILD_SIZE: usize = CHILD_HEADER_SIZE + super::key::MAX_KEY_SIZE;
pub const NONLEAF_OVERLOAD_THRESHOLD: usize = MAX_NONLEAF_FREE_SIZE - MAX_CHILD_SIZE;
pub const NONLEAF_UNDERLOAD_THRESHOLD: usize =
    (NONLEAF_OVERLOAD_THRESHOLD - MAX_CHILD_SIZE) / 2 + 1;

/// A child entry in its stored form. The key of the first child of a node
/// is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Child {
    pub key: Vec<u8>,
    pub addr: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct NonLeafHeader {
    child_count: U32,
}

const _: () = assert!(std::mem::size_of::<NonLeafHeader>() == NONLEAF_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct ChildDescriptor {
    key_offset: U32,
    child_addr: U64,
}

const _: () = assert!(std::mem::size_of::<ChildDescriptor>() == CHILD_HEADER_SIZE);

fn header(data: &[u8]) -> &NonLeafHeader {
    NonLeafHeader::ref_from_bytes(&data[..NONLEAF_HEADER_SIZE]).unwrap()
}

fn header_mut(data: &mut [u8]) -> &mut NonLeafHeader {
    NonLeafHeader::mut_from_bytes(&mut data[..NONLEAF_HEADER_SIZE]).unwrap()
}

fn descriptor(data: &[u8], index: usize) -> &ChildDescriptor {
    let offset = NONLEAF_HEADER_SIZE + index * CHILD_HEADER_SIZE;
    ChildDescriptor::ref_from_bytes(&data[offset..offset + CHILD_HEADER_SIZE]).unwrap()
}

fn descriptor_mut(data: &mut [u8], index: usize) -> &mut ChildDescriptor {
    let offset = NONLEAF_HEADER_SIZE + index * CHILD_HEADER_SIZE;
    ChildDescriptor::mut_from_bytes(&mut data[offset..offset + CHILD_HEADER_SIZE]).unwrap()
}

fn shift_descriptor(data: &mut [u8], index: usize, delta: isize) {
    let descriptor = descriptor_mut(data, index);
    let key_offset = descriptor.key_offset.get() as isize + delta;
    descriptor.key_offset = U32::new(key_offset as u32);
}

/// Read view over a non-leaf page.
#[derive(Debug)]
pub struct NonLeafRef<'a> {
    data: &'a [u8],
}

/// Write view over a non-leaf page.
pub struct NonLeafMut<'a> {
    data: &'a mut [u8],
}

impl<'a> NonLeafRef<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        ensure!(
            data.len() == NONLEAF_SIZE,
            "invalid non-leaf page size: {} != {}",
            data.len(),
            NONLEAF_SIZE
        );
        Ok(Self { data })
    }

    pub fn child_count(&self) -> usize {
        header(self.data).child_count.get() as usize
    }

    pub fn key_at(&self, index: usize) -> Result<&'a [u8]> {
        let n = self.child_count();
        ensure!(
            index < n,
            "child index {} out of range (child_count={})",
            index,
            n
        );
        let key_offset = descriptor(self.data, index).key_offset.get() as usize;
        let key_end = if index + 1 == n {
            NONLEAF_SIZE
        } else {
            descriptor(self.data, index + 1).key_offset.get() as usize
        };
        ensure!(
            key_offset <= key_end && key_end <= NONLEAF_SIZE,
            "child {} has a corrupted key extent",
            index
        );
        Ok(&self.data[key_offset..key_end])
    }

    pub fn child_addr(&self, index: usize) -> Result<i64> {
        let n = self.child_count();
        ensure!(
            index < n,
            "child index {} out of range (child_count={})",
            index,
            n
        );
        Ok(descriptor(self.data, index).child_addr.get() as i64)
    }

    /// Binary-searches children `1..n` for `bound` (child 0's key is
    /// dummy), returning `(index, found)`. On a miss the caller steps one
    /// child back.
    pub fn locate_child(&self, space: &FileSpace, bound: SearchBound) -> Result<(usize, bool)> {
        let n = self.child_count();
        let target = match bound {
            SearchBound::Min => return Ok((0, true)),
            SearchBound::Max => return Ok((n - 1, true)),
            SearchBound::Key(target) => target,
        };

        let (mut i, mut j) = (1, n - 1);
        while i < j {
            let k = (i + j) / 2;
            if compare_stored(space, self.key_at(k)?, target)? == std::cmp::Ordering::Less {
                i = k + 1;
            } else {
                j = k;
            }
        }

        match compare_stored(space, self.key_at(i)?, target)? {
            std::cmp::Ordering::Equal => Ok((i, true)),
            std::cmp::Ordering::Less if i == n - 1 => Ok((n, false)),
            _ => Ok((i, false)),
        }
    }

    /// Bytes consumed by descriptors plus separator keys.
    pub fn load_size(&self) -> usize {
        let n = self.child_count();
        let keys_offset = if n == 0 {
            NONLEAF_SIZE
        } else {
            descriptor(self.data, 0).key_offset.get() as usize
        };
        let headers_end = NONLEAF_HEADER_SIZE + n * CHILD_HEADER_SIZE;
        MAX_NONLEAF_FREE_SIZE - (keys_offset - headers_end)
    }

    /// How many trailing children a split should move into a fresh sibling.
    /// The moved run's first key is promoted, so the counter accounts the
    /// new sibling's child 0 as a bare descriptor.
    pub fn count_children_for_splitting(&self) -> Result<usize> {
        let n = self.child_count();
        let mut last_child_size = (CHILD_HEADER_SIZE + self.key_at(n - 1)?.len()) as i64;
        let mut load1 = self.load_size() as i64 - last_child_size;
        let mut load2 = CHILD_HEADER_SIZE as i64;
        let mut count = 0;

        let mut i = n as isize - 2;
        loop {
            if load1 < NONLEAF_UNDERLOAD_THRESHOLD as i64 {
                break;
            }
            count += 1;
            if load1 <= load2 {
                break;
            }
            let child_size = (CHILD_HEADER_SIZE + self.key_at(i as usize)?.len()) as i64;
            load1 -= child_size;
            load2 += last_child_size;
            last_child_size = child_size;
            i -= 1;
        }

        Ok(count)
    }

    /// How many trailing children can move to the right sibling so both
    /// nodes land inside the load bounds; 0 when no such transfer exists.
    pub fn count_children_for_shifting_right(&self, right_load_size: usize) -> Result<usize> {
        let n = self.child_count();
        let mut last_child_size = (CHILD_HEADER_SIZE + self.key_at(n - 1)?.len()) as i64;
        let mut load1 = self.load_size() as i64 - last_child_size;
        let mut load2 = right_load_size as i64 + CHILD_HEADER_SIZE as i64;
        let mut count = 0;

        let mut i = n as isize - 2;
        loop {
            if load1 < NONLEAF_UNDERLOAD_THRESHOLD as i64
                || load2 > NONLEAF_OVERLOAD_THRESHOLD as i64
            {
                break;
            }
            count += 1;
            if load1 <= load2 {
                break;
            }
            let child_size = (CHILD_HEADER_SIZE + self.key_at(i as usize)?.len()) as i64;
            load1 -= child_size;
            load2 += last_child_size;
            last_child_size = child_size;
            i -= 1;
        }

        if load1 > NONLEAF_OVERLOAD_THRESHOLD as i64 || load2 < NONLEAF_UNDERLOAD_THRESHOLD as i64 {
            return Ok(0);
        }
        Ok(count)
    }

    /// Mirror image of `count_children_for_shifting_right` for the left
    /// sibling, counting leading children.
    pub fn count_children_for_shifting_left(&self, left_load_size: usize) -> Result<usize> {
        let mut load1 = self.load_size() as i64 - (CHILD_HEADER_SIZE + self.key_at(0)?.len()) as i64;
        let mut load2 = left_load_size as i64 + CHILD_HEADER_SIZE as i64;
        let mut count = 0;

        let mut i = 1;
        loop {
            if load1 < NONLEAF_UNDERLOAD_THRESHOLD as i64
                || load2 > NONLEAF_OVERLOAD_THRESHOLD as i64
            {
                break;
            }
            count += 1;
            if load1 <= load2 {
                break;
            }
            let child_size = (CHILD_HEADER_SIZE + self.key_at(i)?.len()) as i64;
            load1 -= child_size;
            load2 += child_size;
            i += 1;
        }

        if load1 > NONLEAF_OVERLOAD_THRESHOLD as i64 || load2 < NONLEAF_UNDERLOAD_THRESHOLD as i64 {
            return Ok(0);
        }
        Ok(count)
    }
}

impl<'a> NonLeafMut<'a> {
    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() == NONLEAF_SIZE,
            "invalid non-leaf page size: {} != {}",
            data.len(),
            NONLEAF_SIZE
        );
        Ok(Self { data })
    }

    /// Initializes a fresh page as an empty non-leaf.
    pub fn init(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() == NONLEAF_SIZE,
            "invalid non-leaf page size: {} != {}",
            data.len(),
            NONLEAF_SIZE
        );
        data[..NONLEAF_HEADER_SIZE].fill(0);
        Ok(Self { data })
    }

    pub fn as_ref(&self) -> NonLeafRef<'_> {
        NonLeafRef { data: self.data }
    }

    pub fn child_count(&self) -> usize {
        header(self.data).child_count.get() as usize
    }

    /// Inserts `children` starting at index `first`.
    pub fn insert_children(&mut self, first: usize, children: &[Child]) -> Result<()> {
        let n = self.check_child_index(first)?;

        let headers_offset = NONLEAF_HEADER_SIZE + first * CHILD_HEADER_SIZE;
        let headers_end = NONLEAF_HEADER_SIZE + n * CHILD_HEADER_SIZE;
        let headers_size = children.len() * CHILD_HEADER_SIZE;

        let keys_offset_all = if n == 0 {
            NONLEAF_SIZE
        } else {
            descriptor(self.data, 0).key_offset.get() as usize
        };
        let keys_end = if headers_offset == headers_end {
            NONLEAF_SIZE
        } else {
            descriptor(self.data, first).key_offset.get() as usize
        };
        let keys_size: usize = children.iter().map(|child| child.key.len()).sum();

        ensure!(
            headers_size + keys_size <= keys_offset_all - headers_end,
            "non-leaf page cannot hold {} more bytes",
            headers_size + keys_size
        );

        self.data
            .copy_within(headers_offset..headers_end, headers_offset + headers_size);
        self.data
            .copy_within(keys_offset_all..keys_end, keys_offset_all - keys_size);
        for index in 0..first {
            shift_descriptor(self.data, index, -(keys_size as isize));
        }

        let mut keys_offset = keys_end - keys_size;
        for (j, child) in children.iter().enumerate() {
            let key_offset = keys_offset;
            self.data[keys_offset..keys_offset + child.key.len()].copy_from_slice(&child.key);
            keys_offset += child.key.len();

            let descriptor = descriptor_mut(self.data, first + j);
            descriptor.key_offset = U32::new(key_offset as u32);
            descriptor.child_addr = U64::new(child.addr as u64);
        }

        header_mut(self.data).child_count = U32::new((n + children.len()) as u32);
        Ok(())
    }

    /// Removes `count` children starting at `first`, returning them as
    /// owned stored forms.
    pub fn remove_children(&mut self, first: usize, count: usize) -> Result<Vec<Child>> {
        let n = self.check_child_index(first)?;
        if first + count > n {
            bail!(
                "child range {}..{} out of range (child_count={})",
                first,
                first + count,
                n
            );
        }

        let headers_offset = NONLEAF_HEADER_SIZE + first * CHILD_HEADER_SIZE;
        let headers_size = count * CHILD_HEADER_SIZE;
        let headers_end = headers_offset + headers_size;
        let headers_end_all = NONLEAF_HEADER_SIZE + n * CHILD_HEADER_SIZE;

        let keys_offset_all = descriptor(self.data, 0).key_offset.get() as usize;
        let keys_offset = descriptor(self.data, first).key_offset.get() as usize;
        let keys_end = if headers_end == headers_end_all {
            NONLEAF_SIZE
        } else {
            descriptor(self.data, first + count).key_offset.get() as usize
        };
        let keys_size = keys_end - keys_offset;

        let view = NonLeafRef { data: self.data };
        let mut children = Vec::with_capacity(count);
        for index in first..first + count {
            children.push(Child {
                key: view.key_at(index)?.to_vec(),
                addr: view.child_addr(index)?,
            });
        }

        self.data
            .copy_within(headers_end..headers_end_all, headers_offset);
        self.data
            .copy_within(keys_offset_all..keys_offset, keys_offset_all + keys_size);
        for index in 0..first {
            shift_descriptor(self.data, index, keys_size as isize);
        }

        header_mut(self.data).child_count = U32::new((n - count) as u32);
        Ok(children)
    }

    /// Replaces child `index`'s key in place.
    pub fn set_key(&mut self, index: usize, key: &[u8]) -> Result<()> {
        let n = self.check_child_index(index)?;
        ensure!(
            index < n,
            "child index {} out of range (child_count={})",
            index,
            n
        );

        let keys_offset_all = descriptor(self.data, 0).key_offset.get() as usize;
        let key_offset = descriptor(self.data, index).key_offset.get() as usize;
        let key_end = if index + 1 == n {
            NONLEAF_SIZE
        } else {
            descriptor(self.data, index + 1).key_offset.get() as usize
        };

        let delta = key.len() as isize - (key_end - key_offset) as isize;
        let headers_end = NONLEAF_HEADER_SIZE + n * CHILD_HEADER_SIZE;
        ensure!(
            delta <= (keys_offset_all - headers_end) as isize,
            "non-leaf page cannot grow child {}'s key by {} bytes",
            index,
            delta
        );

        self.data.copy_within(
            keys_offset_all..key_offset,
            (keys_offset_all as isize - delta) as usize,
        );
        let new_key_offset = (key_offset as isize - delta) as usize;
        self.data[new_key_offset..new_key_offset + key.len()].copy_from_slice(key);

        for i in 0..=index {
            shift_descriptor(self.data, i, -delta);
        }
        Ok(())
    }

    fn check_child_index(&self, index: usize) -> Result<usize> {
        let n = self.child_count();
        ensure!(
            index <= n,
            "child index {} out of range (child_count={})",
            index,
            n
        );
        Ok(n)
    }
}
