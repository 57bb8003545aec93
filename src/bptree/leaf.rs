//! # Leaf Pages
//!
//! A leaf is one fixed 8 KiB page storing records in key order. The page
//! grows from both ends toward the middle:
//!
//! ```text
//! +--------------------------------------------------+
//! | LeafHeader (20B): prev_addr, next_addr, count    |
//! | RecordDescriptor[0..n) (8B each, grows upward)   |
//! |   { key_offset, value_offset }                   |
//! |                                                  |
//! |                free space                        |
//! |                                                  |
//! | key/value bytes (grow downward from page end)    |
//! +--------------------------------------------------+
//! ```
//!
//! Record `i`'s key runs from `key_offset` to `value_offset`; its value
//! runs to the next record's `key_offset`, and the last record's value ends
//! at the page end — value lengths are implicit in the neighbouring
//! offsets. Inserting or removing records shifts the descriptor array and
//! the payload block by exact byte deltas and patches the offsets of the
//! descriptors whose payload moved.
//!
//! ## Load accounting
//!
//! A leaf's load size is the bytes its descriptors and payload consume. The
//! engine keeps every non-root leaf between `LEAF_UNDERLOAD_THRESHOLD` and
//! `LEAF_OVERLOAD_THRESHOLD`; the transfer counters here compute how many
//! records to move so that both sides of a shift or split land inside those
//! bounds.

use eyre::{bail, ensure, Result};
use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::storage::{FileSpace, PAGE_SIZE};

use super::key::{compare_stored, SearchBound};

pub const LEAF_SIZE: usize = PAGE_SIZE;
pub const LEAF_HEADER_SIZE: usize = 20;
pub const RECORD_HEADER_SIZE: usize = 8;

pub const MAX_LEAF_FREE_SIZE: usize = LEAF_SIZE - LEAF_HEADER_SIZE;
pub const MAX_RECORD_SIZE: usize =
    RECORD_HEADER_SIZE + super::key::MAX_KEY_SIZE + super::value::MAX_VALUE_SIZE;
pub const LEAF_OVERLOAD_THRESHOLD: usize = MAX_LEAF_FREE_SIZE - MAX_RECORD_SIZE;
pub const LEAF_UNDERLOAD_THRESHOLD: usize =
    (LEAF_OVERLOAD_THRESHOLD - MAX_RECORD_SIZE) / 2 + 1;

/// A record in its stored form (keys and values already inline-or-overflow
/// encoded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct LeafHeader {
    prev_addr: U64,
    next_addr: U64,
    record_count: U32,
}

const _: () = assert!(std::mem::size_of::<LeafHeader>() == LEAF_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct RecordDescriptor {
    key_offset: U32,
    value_offset: U32,
}

const _: () = assert!(std::mem::size_of::<RecordDescriptor>() == RECORD_HEADER_SIZE);

fn header(data: &[u8]) -> &LeafHeader {
    LeafHeader::ref_from_bytes(&data[..LEAF_HEADER_SIZE]).unwrap()
}

fn header_mut(data: &mut [u8]) -> &mut LeafHeader {
    LeafHeader::mut_from_bytes(&mut data[..LEAF_HEADER_SIZE]).unwrap()
}

fn descriptor(data: &[u8], index: usize) -> &RecordDescriptor {
    let offset = LEAF_HEADER_SIZE + index * RECORD_HEADER_SIZE;
    RecordDescriptor::ref_from_bytes(&data[offset..offset + RECORD_HEADER_SIZE]).unwrap()
}

fn descriptor_mut(data: &mut [u8], index: usize) -> &mut RecordDescriptor {
    let offset = LEAF_HEADER_SIZE + index * RECORD_HEADER_SIZE;
    RecordDescriptor::mut_from_bytes(&mut data[offset..offset + RECORD_HEADER_SIZE]).unwrap()
}

fn shift_descriptor(data: &mut [u8], index: usize, delta: isize) {
    let descriptor = descriptor_mut(data, index);
    let key_offset = descriptor.key_offset.get() as isize + delta;
    let value_offset = descriptor.value_offset.get() as isize + delta;
    descriptor.key_offset = U32::new(key_offset as u32);
    descriptor.value_offset = U32::new(value_offset as u32);
}

/// Read view over a leaf page.
#[derive(Debug)]
pub struct LeafRef<'a> {
    data: &'a [u8],
}

/// Write view over a leaf page.
pub struct LeafMut<'a> {
    data: &'a mut [u8],
}

impl<'a> LeafRef<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        ensure!(
            data.len() == LEAF_SIZE,
            "invalid leaf page size: {} != {}",
            data.len(),
            LEAF_SIZE
        );
        Ok(Self { data })
    }

    pub fn record_count(&self) -> usize {
        header(self.data).record_count.get() as usize
    }

    pub fn prev_addr(&self) -> i64 {
        header(self.data).prev_addr.get() as i64
    }

    pub fn next_addr(&self) -> i64 {
        header(self.data).next_addr.get() as i64
    }

    pub fn key_at(&self, index: usize) -> Result<&'a [u8]> {
        let n = self.record_count();
        ensure!(
            index < n,
            "record index {} out of range (record_count={})",
            index,
            n
        );
        let descriptor = descriptor(self.data, index);
        let key_offset = descriptor.key_offset.get() as usize;
        let key_end = descriptor.value_offset.get() as usize;
        ensure!(
            key_offset <= key_end && key_end <= LEAF_SIZE,
            "record {} has a corrupted key extent",
            index
        );
        Ok(&self.data[key_offset..key_end])
    }

    pub fn value_at(&self, index: usize) -> Result<&'a [u8]> {
        let n = self.record_count();
        ensure!(
            index < n,
            "record index {} out of range (record_count={})",
            index,
            n
        );
        let value_offset = descriptor(self.data, index).value_offset.get() as usize;
        let value_end = if index + 1 == n {
            LEAF_SIZE
        } else {
            descriptor(self.data, index + 1).key_offset.get() as usize
        };
        ensure!(
            value_offset <= value_end && value_end <= LEAF_SIZE,
            "record {} has a corrupted value extent",
            index
        );
        Ok(&self.data[value_offset..value_end])
    }

    /// Binary-searches for `bound`, returning `(index, found)`. A miss
    /// returns the insertion index, which may equal the record count.
    pub fn locate_record(&self, space: &FileSpace, bound: SearchBound) -> Result<(usize, bool)> {
        let n = self.record_count();
        let target = match bound {
            SearchBound::Min => return Ok((0, true)),
            SearchBound::Max => return Ok((n.saturating_sub(1), true)),
            SearchBound::Key(target) => target,
        };
        if n == 0 {
            return Ok((0, false));
        }

        let (mut i, mut j) = (0, n - 1);
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

    /// Bytes consumed by descriptors plus payload.
    pub fn load_size(&self) -> usize {
        let n = self.record_count();
        let kvs_offset = if n == 0 {
            LEAF_SIZE
        } else {
            descriptor(self.data, 0).key_offset.get() as usize
        };
        let headers_end = LEAF_HEADER_SIZE + n * RECORD_HEADER_SIZE;
        MAX_LEAF_FREE_SIZE - (kvs_offset - headers_end)
    }

    /// How many trailing records a split should move into a fresh sibling.
    pub fn count_records_for_splitting(&self) -> Result<usize> {
        let mut load1 = self.load_size() as i64;
        let mut load2 = 0i64;
        let mut count = 0;

        let mut i = self.record_count() - 1;
        loop {
            let record_size = (RECORD_HEADER_SIZE
                + self.key_at(i)?.len()
                + self.value_at(i)?.len()) as i64;
            load1 -= record_size;
            load2 += record_size;

            if load1 < LEAF_UNDERLOAD_THRESHOLD as i64 {
                break;
            }
            count += 1;
            if load1 <= load2 {
                break;
            }
            i -= 1;
        }

        Ok(count)
    }

    /// How many trailing records can move to the right sibling so both
    /// leaves land inside the load bounds; 0 when no such transfer exists.
    pub fn count_records_for_shifting_right(&self, right_load_size: usize) -> Result<usize> {
        let mut load1 = self.load_size() as i64;
        let mut load2 = right_load_size as i64;
        let mut count = 0;

        let mut i = self.record_count() - 1;
        loop {
            let record_size = (RECORD_HEADER_SIZE
                + self.key_at(i)?.len()
                + self.value_at(i)?.len()) as i64;
            load1 -= record_size;
            load2 += record_size;

            if load1 < LEAF_UNDERLOAD_THRESHOLD as i64 || load2 > LEAF_OVERLOAD_THRESHOLD as i64 {
                break;
            }
            count += 1;
            if load1 <= load2 {
                break;
            }
            i -= 1;
        }

        if load1 > LEAF_OVERLOAD_THRESHOLD as i64 || load2 < LEAF_UNDERLOAD_THRESHOLD as i64 {
            return Ok(0);
        }
        Ok(count)
    }

    /// Mirror image of `count_records_for_shifting_right` for the left
    /// sibling, counting leading records.
    pub fn count_records_for_shifting_left(&self, left_load_size: usize) -> Result<usize> {
        let mut load1 = self.load_size() as i64;
        let mut load2 = left_load_size as i64;
        let mut count = 0;

        let mut i = 0;
        loop {
            let record_size = (RECORD_HEADER_SIZE
                + self.key_at(i)?.len()
                + self.value_at(i)?.len()) as i64;
            load1 -= record_size;
            load2 += record_size;

            if load1 < LEAF_UNDERLOAD_THRESHOLD as i64 || load2 > LEAF_OVERLOAD_THRESHOLD as i64 {
                break;
            }
            count += 1;
            if load1 <= load2 {
                break;
            }
            i += 1;
        }

        if load1 > LEAF_OVERLOAD_THRESHOLD as i64 || load2 < LEAF_UNDERLOAD_THRESHOLD as i64 {
            return Ok(0);
        }
        Ok(count)
    }
}

impl<'a> LeafMut<'a> {
    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() == LEAF_SIZE,
            "invalid leaf page size: {} != {}",
            data.len(),
            LEAF_SIZE
        );
        Ok(Self { data })
    }

    /// Initializes a fresh page as an empty leaf.
    pub fn init(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() == LEAF_SIZE,
            "invalid leaf page size: {} != {}",
            data.len(),
            LEAF_SIZE
        );
        data[..LEAF_HEADER_SIZE].fill(0);
        Ok(Self { data })
    }

    pub fn as_ref(&self) -> LeafRef<'_> {
        LeafRef { data: self.data }
    }

    pub fn record_count(&self) -> usize {
        header(self.data).record_count.get() as usize
    }

    pub fn set_prev_addr(&mut self, addr: i64) {
        header_mut(self.data).prev_addr = U64::new(addr as u64);
    }

    pub fn set_next_addr(&mut self, addr: i64) {
        header_mut(self.data).next_addr = U64::new(addr as u64);
    }

    /// Inserts `records` starting at index `first`, shifting descriptors up
    /// and the payload block down.
    pub fn insert_records(&mut self, first: usize, records: &[Record]) -> Result<()> {
        let n = self.check_record_index(first)?;

        let headers_offset = LEAF_HEADER_SIZE + first * RECORD_HEADER_SIZE;
        let headers_end = LEAF_HEADER_SIZE + n * RECORD_HEADER_SIZE;
        let headers_size = records.len() * RECORD_HEADER_SIZE;

        let kvs_offset_all = if n == 0 {
            LEAF_SIZE
        } else {
            descriptor(self.data, 0).key_offset.get() as usize
        };
        let kvs_end = if headers_offset == headers_end {
            LEAF_SIZE
        } else {
            descriptor(self.data, first).key_offset.get() as usize
        };
        let kvs_size: usize = records
            .iter()
            .map(|record| record.key.len() + record.value.len())
            .sum();

        ensure!(
            headers_size + kvs_size <= kvs_offset_all - headers_end,
            "leaf page cannot hold {} more bytes",
            headers_size + kvs_size
        );

        self.data
            .copy_within(headers_offset..headers_end, headers_offset + headers_size);
        self.data
            .copy_within(kvs_offset_all..kvs_end, kvs_offset_all - kvs_size);
        for index in 0..first {
            shift_descriptor(self.data, index, -(kvs_size as isize));
        }

        let mut kvs_offset = kvs_end - kvs_size;
        for (j, record) in records.iter().enumerate() {
            let key_offset = kvs_offset;
            self.data[kvs_offset..kvs_offset + record.key.len()].copy_from_slice(&record.key);
            kvs_offset += record.key.len();
            let value_offset = kvs_offset;
            self.data[kvs_offset..kvs_offset + record.value.len()].copy_from_slice(&record.value);
            kvs_offset += record.value.len();

            let descriptor = descriptor_mut(self.data, first + j);
            descriptor.key_offset = U32::new(key_offset as u32);
            descriptor.value_offset = U32::new(value_offset as u32);
        }

        header_mut(self.data).record_count = U32::new((n + records.len()) as u32);
        Ok(())
    }

    /// Removes `count` records starting at `first`, returning them as owned
    /// stored forms.
    pub fn remove_records(&mut self, first: usize, count: usize) -> Result<Vec<Record>> {
        let n = self.check_record_index(first)?;
        if first + count > n {
            bail!(
                "record range {}..{} out of range (record_count={})",
                first,
                first + count,
                n
            );
        }

        let headers_offset = LEAF_HEADER_SIZE + first * RECORD_HEADER_SIZE;
        let headers_size = count * RECORD_HEADER_SIZE;
        let headers_end = headers_offset + headers_size;
        let headers_end_all = LEAF_HEADER_SIZE + n * RECORD_HEADER_SIZE;

        let kvs_offset_all = descriptor(self.data, 0).key_offset.get() as usize;
        let kvs_offset = descriptor(self.data, first).key_offset.get() as usize;
        let kvs_end = if headers_end == headers_end_all {
            LEAF_SIZE
        } else {
            descriptor(self.data, first + count).key_offset.get() as usize
        };
        let kvs_size = kvs_end - kvs_offset;

        let view = LeafRef { data: self.data };
        let mut records = Vec::with_capacity(count);
        for index in first..first + count {
            records.push(Record {
                key: view.key_at(index)?.to_vec(),
                value: view.value_at(index)?.to_vec(),
            });
        }

        self.data
            .copy_within(headers_end..headers_end_all, headers_offset);
        self.data
            .copy_within(kvs_offset_all..kvs_offset, kvs_offset_all + kvs_size);
        for index in 0..first {
            shift_descriptor(self.data, index, kvs_size as isize);
        }

        header_mut(self.data).record_count = U32::new((n - count) as u32);
        Ok(records)
    }

    /// Replaces record `index`'s value in place, sliding the payload between
    /// the page's kvs start and the value by the size delta.
    pub fn set_value(&mut self, index: usize, value: &[u8]) -> Result<()> {
        let n = self.check_record_index(index)?;
        ensure!(
            index < n,
            "record index {} out of range (record_count={})",
            index,
            n
        );

        let kvs_offset_all = descriptor(self.data, 0).key_offset.get() as usize;
        let value_offset = descriptor(self.data, index).value_offset.get() as usize;
        let value_end = if index + 1 == n {
            LEAF_SIZE
        } else {
            descriptor(self.data, index + 1).key_offset.get() as usize
        };

        let delta = value.len() as isize - (value_end - value_offset) as isize;
        let headers_end = LEAF_HEADER_SIZE + n * RECORD_HEADER_SIZE;
        ensure!(
            delta <= (kvs_offset_all - headers_end) as isize,
            "leaf page cannot grow record {}'s value by {} bytes",
            index,
            delta
        );

        self.data.copy_within(
            kvs_offset_all..value_offset,
            (kvs_offset_all as isize - delta) as usize,
        );
        let new_value_offset = (value_offset as isize - delta) as usize;
        self.data[new_value_offset..new_value_offset + value.len()].copy_from_slice(value);

        for i in 0..=index {
            shift_descriptor(self.data, i, -delta);
        }
        Ok(())
    }

    fn check_record_index(&self, index: usize) -> Result<usize> {
        let n = self.record_count();
        ensure!(
            index <= n,
            "record index {} out of range (record_count={})",
            index,
            n
        );
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_page() -> Vec<u8> {
        vec![0u8; LEAF_SIZE]
    }

    fn record(key: &[u8], value: &[u8]) -> Record {
        Record {
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn thresholds_match_the_page_geometry() {
        assert_eq!(MAX_LEAF_FREE_SIZE, 8172);
        assert_eq!(MAX_RECORD_SIZE, 394);
        assert_eq!(LEAF_OVERLOAD_THRESHOLD, 7778);
        assert_eq!(LEAF_UNDERLOAD_THRESHOLD, 3693);
    }

    #[test]
    fn init_makes_an_empty_leaf() {
        let mut page = make_page();
        let leaf = LeafMut::init(&mut page).unwrap();

        assert_eq!(leaf.record_count(), 0);
        assert_eq!(leaf.as_ref().load_size(), 0);
    }

    #[test]
    fn insert_and_read_single_record() {
        let mut page = make_page();
        let mut leaf = LeafMut::init(&mut page).unwrap();

        leaf.insert_records(0, &[record(b"key", b"value")]).unwrap();

        let view = leaf.as_ref();
        assert_eq!(view.record_count(), 1);
        assert_eq!(view.key_at(0).unwrap(), b"key");
        assert_eq!(view.value_at(0).unwrap(), b"value");
        assert_eq!(view.load_size(), RECORD_HEADER_SIZE + 8);
    }

    #[test]
    fn insert_at_front_shifts_existing_records() {
        let mut page = make_page();
        let mut leaf = LeafMut::init(&mut page).unwrap();

        leaf.insert_records(0, &[record(b"bravo", b"2")]).unwrap();
        leaf.insert_records(0, &[record(b"alpha", b"1")]).unwrap();

        let view = leaf.as_ref();
        assert_eq!(view.key_at(0).unwrap(), b"alpha");
        assert_eq!(view.value_at(0).unwrap(), b"1");
        assert_eq!(view.key_at(1).unwrap(), b"bravo");
        assert_eq!(view.value_at(1).unwrap(), b"2");
    }

    #[test]
    fn insert_in_middle_preserves_neighbours() {
        let mut page = make_page();
        let mut leaf = LeafMut::init(&mut page).unwrap();

        leaf.insert_records(0, &[record(b"alpha", b"1"), record(b"charlie", b"3")])
            .unwrap();
        leaf.insert_records(1, &[record(b"bravo", b"2")]).unwrap();

        let view = leaf.as_ref();
        assert_eq!(view.record_count(), 3);
        assert_eq!(view.key_at(0).unwrap(), b"alpha");
        assert_eq!(view.key_at(1).unwrap(), b"bravo");
        assert_eq!(view.key_at(2).unwrap(), b"charlie");
        assert_eq!(view.value_at(2).unwrap(), b"3");
    }

    #[test]
    fn insert_batch_at_end() {
        let mut page = make_page();
        let mut leaf = LeafMut::init(&mut page).unwrap();

        leaf.insert_records(0, &[record(b"a", b"1")]).unwrap();
        leaf.insert_records(1, &[record(b"b", b"2"), record(b"c", b"3")])
            .unwrap();

        let view = leaf.as_ref();
        assert_eq!(view.record_count(), 3);
        assert_eq!(view.value_at(0).unwrap(), b"1");
        assert_eq!(view.value_at(1).unwrap(), b"2");
        assert_eq!(view.value_at(2).unwrap(), b"3");
    }

    #[test]
    fn remove_returns_the_removed_records() {
        let mut page = make_page();
        let mut leaf = LeafMut::init(&mut page).unwrap();

        leaf.insert_records(
            0,
            &[
                record(b"a", b"1"),
                record(b"b", b"22"),
                record(b"c", b"333"),
            ],
        )
        .unwrap();

        let removed = leaf.remove_records(1, 1).unwrap();
        assert_eq!(removed, vec![record(b"b", b"22")]);

        let view = leaf.as_ref();
        assert_eq!(view.record_count(), 2);
        assert_eq!(view.key_at(0).unwrap(), b"a");
        assert_eq!(view.value_at(0).unwrap(), b"1");
        assert_eq!(view.key_at(1).unwrap(), b"c");
        assert_eq!(view.value_at(1).unwrap(), b"333");
    }

    #[test]
    fn remove_first_and_last() {
        let mut page = make_page();
        let mut leaf = LeafMut::init(&mut page).unwrap();

        leaf.insert_records(
            0,
            &[
                record(b"a", b"1"),
                record(b"b", b"2"),
                record(b"c", b"3"),
            ],
        )
        .unwrap();

        assert_eq!(leaf.remove_records(0, 1).unwrap(), vec![record(b"a", b"1")]);
        assert_eq!(leaf.remove_records(1, 1).unwrap(), vec![record(b"c", b"3")]);

        let view = leaf.as_ref();
        assert_eq!(view.record_count(), 1);
        assert_eq!(view.key_at(0).unwrap(), b"b");
        assert_eq!(view.value_at(0).unwrap(), b"2");
    }

    #[test]
    fn remove_everything_returns_to_empty() {
        let mut page = make_page();
        let mut leaf = LeafMut::init(&mut page).unwrap();

        leaf.insert_records(0, &[record(b"a", b"1"), record(b"b", b"2")])
            .unwrap();
        let removed = leaf.remove_records(0, 2).unwrap();

        assert_eq!(removed.len(), 2);
        assert_eq!(leaf.record_count(), 0);
        assert_eq!(leaf.as_ref().load_size(), 0);
    }

    #[test]
    fn remove_out_of_range_fails() {
        let mut page = make_page();
        let mut leaf = LeafMut::init(&mut page).unwrap();
        leaf.insert_records(0, &[record(b"a", b"1")]).unwrap();

        assert!(leaf.remove_records(0, 2).is_err());
        assert!(leaf.remove_records(2, 1).is_err());
    }

    #[test]
    fn set_value_grows_and_shrinks_in_place() {
        let mut page = make_page();
        let mut leaf = LeafMut::init(&mut page).unwrap();

        leaf.insert_records(
            0,
            &[
                record(b"a", b"one"),
                record(b"b", b"two"),
                record(b"c", b"three"),
            ],
        )
        .unwrap();

        leaf.set_value(1, b"a-much-longer-value").unwrap();
        {
            let view = leaf.as_ref();
            assert_eq!(view.value_at(0).unwrap(), b"one");
            assert_eq!(view.value_at(1).unwrap(), b"a-much-longer-value");
            assert_eq!(view.value_at(2).unwrap(), b"three");
        }

        leaf.set_value(1, b"t").unwrap();
        {
            let view = leaf.as_ref();
            assert_eq!(view.value_at(0).unwrap(), b"one");
            assert_eq!(view.value_at(1).unwrap(), b"t");
            assert_eq!(view.value_at(2).unwrap(), b"three");
        }
    }

    #[test]
    fn set_value_of_last_record() {
        let mut page = make_page();
        let mut leaf = LeafMut::init(&mut page).unwrap();

        leaf.insert_records(0, &[record(b"a", b"1"), record(b"z", b"last")])
            .unwrap();
        leaf.set_value(1, b"rewritten").unwrap();

        let view = leaf.as_ref();
        assert_eq!(view.value_at(0).unwrap(), b"1");
        assert_eq!(view.value_at(1).unwrap(), b"rewritten");
    }

    #[test]
    fn load_size_tracks_inserts_and_removes() {
        let mut page = make_page();
        let mut leaf = LeafMut::init(&mut page).unwrap();

        leaf.insert_records(0, &[record(b"abc", b"defgh")]).unwrap();
        assert_eq!(leaf.as_ref().load_size(), RECORD_HEADER_SIZE + 8);

        leaf.insert_records(1, &[record(b"x", b"y")]).unwrap();
        assert_eq!(leaf.as_ref().load_size(), 2 * RECORD_HEADER_SIZE + 10);

        leaf.remove_records(0, 1).unwrap();
        assert_eq!(leaf.as_ref().load_size(), RECORD_HEADER_SIZE + 2);
    }

    #[test]
    fn empty_keys_and_values_are_representable() {
        let mut page = make_page();
        let mut leaf = LeafMut::init(&mut page).unwrap();

        leaf.insert_records(0, &[record(b"", b""), record(b"k", b"")])
            .unwrap();

        let view = leaf.as_ref();
        assert_eq!(view.key_at(0).unwrap(), b"");
        assert_eq!(view.value_at(0).unwrap(), b"");
        assert_eq!(view.key_at(1).unwrap(), b"k");
        assert_eq!(view.value_at(1).unwrap(), b"");
    }

    #[test]
    fn locate_record_finds_and_misses() {
        let mut page = make_page();
        let mut leaf = LeafMut::init(&mut page).unwrap();
        leaf.insert_records(
            0,
            &[
                record(b"bravo", b"2"),
                record(b"delta", b"4"),
                record(b"foxtrot", b"6"),
            ],
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let space = FileSpace::open(dir.path().join("t.db"), true).unwrap();

        let view = leaf.as_ref();
        assert_eq!(
            view.locate_record(&space, SearchBound::Key(b"delta")).unwrap(),
            (1, true)
        );
        assert_eq!(
            view.locate_record(&space, SearchBound::Key(b"alpha")).unwrap(),
            (0, false)
        );
        assert_eq!(
            view.locate_record(&space, SearchBound::Key(b"echo")).unwrap(),
            (2, false)
        );
        assert_eq!(
            view.locate_record(&space, SearchBound::Key(b"zulu")).unwrap(),
            (3, false)
        );
        assert_eq!(
            view.locate_record(&space, SearchBound::Min).unwrap(),
            (0, true)
        );
        assert_eq!(
            view.locate_record(&space, SearchBound::Max).unwrap(),
            (2, true)
        );
    }

    #[test]
    fn split_counter_balances_halves() {
        let mut page = make_page();
        let mut leaf = LeafMut::init(&mut page).unwrap();

        let value = vec![b'v'; 100];
        let mut count = 0;
        loop {
            let key = format!("key-{:04}", count);
            let view = leaf.as_ref();
            if view.load_size() > LEAF_OVERLOAD_THRESHOLD {
                break;
            }
            leaf.insert_records(count, &[record(key.as_bytes(), &value)])
                .unwrap();
            count += 1;
        }

        let view = leaf.as_ref();
        let moved = view.count_records_for_splitting().unwrap();
        assert!(moved >= 1);

        let moved_size: usize = (view.record_count() - moved..view.record_count())
            .map(|i| {
                RECORD_HEADER_SIZE
                    + view.key_at(i).unwrap().len()
                    + view.value_at(i).unwrap().len()
            })
            .sum();
        let kept_size = view.load_size() - moved_size;
        assert!(kept_size >= LEAF_UNDERLOAD_THRESHOLD);
        assert!(kept_size <= LEAF_OVERLOAD_THRESHOLD);
        assert!(moved_size >= LEAF_UNDERLOAD_THRESHOLD);
    }

    #[test]
    fn shift_counter_refuses_hopeless_transfers() {
        let mut page = make_page();
        let mut leaf = LeafMut::init(&mut page).unwrap();
        leaf.insert_records(0, &[record(b"only", b"record")]).unwrap();

        // A nearly full sibling cannot take anything.
        let n = leaf
            .as_ref()
            .count_records_for_shifting_right(LEAF_OVERLOAD_THRESHOLD)
            .unwrap();
        assert_eq!(n, 0);
    }
}
