//! # Linear-Hashing Index
//!
//! An on-disk hash map that grows and shrinks one slot at a time. Slots are
//! addressed through a two-level table:
//!
//! ```text
//! slot_dirs (8 << max_shift bytes, grows geometrically)
//!   └── slot directory (4096 addresses each)
//!         └── slot record (varint-prefixed item list, or -1 when empty)
//! ```
//!
//! Only the outer pointer array is ever reallocated, so a slot that is not
//! being split keeps its on-disk record untouched while the table grows
//! around it.
//!
//! ## Addressing
//!
//! With `s = min_slot_count_shift`, a key probes index
//! `h & ((1 << (s+1)) - 1)`; indexes at or past `slot_count` fall into the
//! not-yet-split upper half and are remapped to their low sibling by
//! clearing bit `s`. Splitting slot `slot_count & !(1 << s)` into
//! `slot_count` keeps the load factor at or below φ; merging the last slot
//! back into its sibling keeps it at or above φ/2.

use eyre::{ensure, Result};

use crate::encoding::varint::{decode_uvarint, encode_uvarint, put_uvarint, uvarint_len};
use crate::encoding::wire::{
    check_wire_type, put_int64_field, unknown_field, WireReader, WIRE_VARINT,
};
use crate::encoding::META_CRC;
use crate::storage::{FileSpace, NIL_ADDR};

use super::slot::{
    match_item, merge_items, pack_slot, split_items, sum_key, unpack_slot, HashItem,
    MAX_SHORT_KEY_SIZE,
};

/// log2 of the slot-address count per directory.
pub const SLOT_DIR_LENGTH_SHIFT: u32 = 12;

/// Initial (and minimum) log2 capacity of the outer directory array.
pub const MIN_MAX_SLOT_DIR_COUNT_SHIFT: u32 = 3;

/// Load factor ceiling: the golden ratio.
pub const MAX_LOAD_FACTOR: f64 = 1.618033988749894848204586834365638117;
pub const MIN_LOAD_FACTOR: f64 = MAX_LOAD_FACTOR / 2.0;

/// Persistent state of a hash index. All mutating operations take the
/// backing `FileSpace` alongside, mirroring how the freelist walks its
/// storage.
#[derive(Debug)]
pub struct HashIndex {
    slot_dirs_addr: i64,
    max_slot_dir_count_shift: u32,
    slot_dir_count: usize,
    min_slot_count_shift: u32,
    slot_count: usize,
    item_count: usize,
    payload_size: usize,
}

/// A cursor over a full scan. The zero value starts from the beginning; the
/// cached items are stable byte copies, valid regardless of later backend
/// mutations.
#[derive(Debug, Default)]
pub struct DictCursor {
    items: Vec<HashItem>,
    item_index: usize,
    slot_index: usize,
}

/// A slot address cell inside an address array.
#[derive(Debug, Clone, Copy)]
struct AddrRef {
    array_addr: i64,
    index: usize,
}

impl AddrRef {
    fn get(self, space: &FileSpace) -> Result<i64> {
        let view = space.access(self.array_addr)?;
        let offset = self.index << 3;
        ensure!(
            offset + 8 <= view.len(),
            "address array at {} has no element {}",
            self.array_addr,
            self.index
        );
        let raw: [u8; 8] = view[offset..offset + 8].try_into().unwrap();
        Ok(u64::from_be_bytes(raw) as i64)
    }

    fn set(self, space: &mut FileSpace, value: i64) -> Result<()> {
        let view = space.access_mut(self.array_addr)?;
        let offset = self.index << 3;
        ensure!(
            offset + 8 <= view.len(),
            "address array at {} has no element {}",
            self.array_addr,
            self.index
        );
        view[offset..offset + 8].copy_from_slice(&(value as u64).to_be_bytes());
        Ok(())
    }
}

/// A loaded slot: where its address cell lives, its current record address,
/// and its unpacked items.
struct SlotItems {
    addr_ref: AddrRef,
    slot_addr: i64,
    items: Vec<HashItem>,
}

impl HashIndex {
    /// Creates an empty index: one slot directory whose first slot is empty.
    pub fn create(space: &mut FileSpace) -> Result<Self> {
        let (slot_dirs_addr, _) = space.allocate(8 << MIN_MAX_SLOT_DIR_COUNT_SHIFT)?;
        let (slot_dir_addr, _) = space.allocate(8 << SLOT_DIR_LENGTH_SHIFT)?;

        AddrRef {
            array_addr: slot_dirs_addr,
            index: 0,
        }
        .set(space, slot_dir_addr)?;
        AddrRef {
            array_addr: slot_dir_addr,
            index: 0,
        }
        .set(space, NIL_ADDR)?;

        Ok(Self {
            slot_dirs_addr,
            max_slot_dir_count_shift: MIN_MAX_SLOT_DIR_COUNT_SHIFT,
            slot_dir_count: 1,
            min_slot_count_shift: 0,
            slot_count: 1,
            item_count: 0,
            payload_size: 0,
        })
    }

    /// Tears down an emptied index, releasing its directory structures.
    pub fn destroy(self, space: &mut FileSpace) -> Result<()> {
        let slot_dir_addr = AddrRef {
            array_addr: self.slot_dirs_addr,
            index: 0,
        }
        .get(space)?;
        space.free(slot_dir_addr)?;
        space.free(self.slot_dirs_addr)?;
        Ok(())
    }

    /// Serializes the index state into a fresh region and returns its
    /// address, to be recorded as the backend's primary.
    pub fn store(self, space: &mut FileSpace) -> Result<i64> {
        let mut body = Vec::with_capacity(64);
        put_int64_field(&mut body, 1, self.slot_dirs_addr);
        put_int64_field(&mut body, 2, self.max_slot_dir_count_shift as i64);
        put_int64_field(&mut body, 3, self.slot_dir_count as i64);
        put_int64_field(&mut body, 4, self.min_slot_count_shift as i64);
        put_int64_field(&mut body, 5, self.slot_count as i64);
        put_int64_field(&mut body, 6, self.item_count as i64);
        put_int64_field(&mut body, 7, self.payload_size as i64);

        let mut record = Vec::with_capacity(body.len() + 18);
        put_uvarint(&mut record, body.len() as u64);
        record.extend_from_slice(&body);
        record.extend_from_slice(&META_CRC.checksum(&body).to_be_bytes());

        let (addr, view) = space.allocate(record.len())?;
        view[..record.len()].copy_from_slice(&record);
        Ok(addr)
    }

    /// Loads an index from its serialized state, consuming the region.
    pub fn load(space: &mut FileSpace, info_addr: i64) -> Result<Self> {
        let view = space.access(info_addr)?;
        let (body_len, prefix_len) = decode_uvarint(view)?;
        let body_len = body_len as usize;
        ensure!(
            prefix_len + body_len + 8 <= view.len(),
            "hash index metadata record overruns its region"
        );

        let body = &view[prefix_len..prefix_len + body_len];
        let stored_crc = u64::from_be_bytes(
            view[prefix_len + body_len..prefix_len + body_len + 8]
                .try_into()
                .unwrap(),
        );
        ensure!(
            META_CRC.checksum(body) == stored_crc,
            "hash index metadata record failed its checksum"
        );

        let mut slot_dirs_addr = NIL_ADDR;
        let mut max_slot_dir_count_shift = 0i64;
        let mut slot_dir_count = 0i64;
        let mut min_slot_count_shift = 0i64;
        let mut slot_count = 0i64;
        let mut item_count = 0i64;
        let mut payload_size = 0i64;

        let mut reader = WireReader::new(body);
        while let Some((field, wire_type)) = reader.next_tag()? {
            check_wire_type("hash index metadata", field, wire_type, WIRE_VARINT)?;
            let value = reader.read_int64()?;
            match field {
                1 => slot_dirs_addr = value,
                2 => max_slot_dir_count_shift = value,
                3 => slot_dir_count = value,
                4 => min_slot_count_shift = value,
                5 => slot_count = value,
                6 => item_count = value,
                7 => payload_size = value,
                _ => return Err(unknown_field("hash index metadata", field)),
            }
        }

        ensure!(
            slot_dirs_addr >= 0
                && slot_count >= 1
                && slot_dir_count >= 1
                && max_slot_dir_count_shift >= MIN_MAX_SLOT_DIR_COUNT_SHIFT as i64
                && min_slot_count_shift >= 0
                && item_count >= 0
                && payload_size >= 0,
            "hash index metadata record holds inconsistent counters"
        );

        space.free(info_addr)?;

        Ok(Self {
            slot_dirs_addr,
            max_slot_dir_count_shift: max_slot_dir_count_shift as u32,
            slot_dir_count: slot_dir_count as usize,
            min_slot_count_shift: min_slot_count_shift as u32,
            slot_count: slot_count as usize,
            item_count: item_count as usize,
            payload_size: payload_size as usize,
        })
    }

    /// Inserts the item unless the key is already present. Returns the
    /// present value (when requested) and whether an insert happened.
    pub fn add(
        &mut self,
        space: &mut FileSpace,
        key: &[u8],
        value: &[u8],
        want_present: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        let key_sum = sum_key(key);
        let (slot, found) = self.locate_item(space, key, key_sum)?;

        if let Some(i) = found {
            return Ok((present_value(&slot, i, want_present), false));
        }

        self.append_item(space, slot, key, value, key_sum)?;
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
        let key_sum = sum_key(key);
        let (slot, found) = self.locate_item(space, key, key_sum)?;

        match found {
            Some(i) => Ok((self.replace_value(space, slot, i, value, want_replaced)?, true)),
            None => Ok((None, false)),
        }
    }

    /// Upsert: insert when absent, replace when present.
    pub fn add_or_update(
        &mut self,
        space: &mut FileSpace,
        key: &[u8],
        value: &[u8],
        want_replaced: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        let key_sum = sum_key(key);
        let (slot, found) = self.locate_item(space, key, key_sum)?;

        if let Some(i) = found {
            return Ok((self.replace_value(space, slot, i, value, want_replaced)?, false));
        }

        self.append_item(space, slot, key, value, key_sum)?;
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
        let key_sum = sum_key(key);
        let (slot, found) = self.locate_item(space, key, key_sum)?;

        match found {
            Some(i) => Ok((self.remove_item(space, slot, i, want_removed)?, true)),
            None => Ok((None, false)),
        }
    }

    /// Looks a key up. Returns the present value (when requested) and
    /// whether the key exists.
    pub fn has(
        &self,
        space: &FileSpace,
        key: &[u8],
        want_present: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        let key_sum = sum_key(key);
        let (slot, found) = self.locate_item(space, key, key_sum)?;

        match found {
            Some(i) => Ok((present_value(&slot, i, want_present), true)),
            None => Ok((None, false)),
        }
    }

    /// Fetches the item under the cursor and advances it. Returns None when
    /// the scan is exhausted. For an unchanged index, a full scan visits
    /// every item exactly once, in a stable (but unspecified) order.
    pub fn fetch(
        &self,
        space: &FileSpace,
        cursor: &mut DictCursor,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if cursor.item_index < cursor.items.len() {
            let item = &cursor.items[cursor.item_index];
            cursor.item_index += 1;
            return Ok(Some((item.key.clone(), item.value.clone())));
        }

        while cursor.slot_index < self.slot_count {
            let slot_addr = self.locate_slot_addr(space, cursor.slot_index)?.get(space)?;
            cursor.items = Self::load_slot(space, slot_addr)?;
            cursor.slot_index += 1;

            if !cursor.items.is_empty() {
                cursor.item_index = 1;
                let item = &cursor.items[0];
                return Ok(Some((item.key.clone(), item.value.clone())));
            }
        }

        Ok(None)
    }

    pub fn max_slot_dir_count(&self) -> usize {
        1 << self.max_slot_dir_count_shift
    }

    pub fn slot_dir_count(&self) -> usize {
        self.slot_dir_count
    }

    pub fn min_slot_count(&self) -> usize {
        1 << self.min_slot_count_shift
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn item_count(&self) -> usize {
        self.item_count
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    fn locate_item(
        &self,
        space: &FileSpace,
        key: &[u8],
        key_sum: u64,
    ) -> Result<(SlotItems, Option<usize>)> {
        let addr_ref = self.locate_slot_addr(space, self.calculate_slot_index(key_sum))?;
        let slot_addr = addr_ref.get(space)?;
        let items = Self::load_slot(space, slot_addr)?;

        let found = items
            .iter()
            .position(|item| match_item(item, key, key_sum));

        Ok((
            SlotItems {
                addr_ref,
                slot_addr,
                items,
            },
            found,
        ))
    }

    fn append_item(
        &mut self,
        space: &mut FileSpace,
        mut slot: SlotItems,
        key: &[u8],
        value: &[u8],
        key_sum: u64,
    ) -> Result<()> {
        self.payload_size += key.len() + value.len();

        // Short keys suppress the stored sum; it is recomputed on demand.
        let stored_sum = if key.len() <= MAX_SHORT_KEY_SIZE { 0 } else { key_sum };
        slot.items.push(HashItem {
            key_sum: stored_sum,
            key: key.to_vec(),
            value: value.to_vec(),
        });

        self.flush_items(space, slot)?;
        self.item_count += 1;
        self.maybe_expand(space)
    }

    fn remove_item(
        &mut self,
        space: &mut FileSpace,
        mut slot: SlotItems,
        i: usize,
        want_removed: bool,
    ) -> Result<Option<Vec<u8>>> {
        let item = slot.items.remove(i);
        self.payload_size -= item.key.len() + item.value.len();
        let removed = want_removed.then_some(item.value);

        self.flush_items(space, slot)?;
        self.item_count -= 1;
        self.maybe_shrink(space)?;
        Ok(removed)
    }

    fn replace_value(
        &mut self,
        space: &mut FileSpace,
        mut slot: SlotItems,
        i: usize,
        value: &[u8],
        want_replaced: bool,
    ) -> Result<Option<Vec<u8>>> {
        let item = &mut slot.items[i];
        self.payload_size += value.len();
        self.payload_size -= item.value.len();
        let replaced = std::mem::replace(&mut item.value, value.to_vec());

        self.flush_items(space, slot)?;
        Ok(want_replaced.then_some(replaced))
    }

    fn flush_items(&mut self, space: &mut FileSpace, slot: SlotItems) -> Result<()> {
        let new_addr = self.restore_slot(space, slot.slot_addr, &slot.items)?;
        slot.addr_ref.set(space, new_addr)
    }

    fn restore_slot(
        &mut self,
        space: &mut FileSpace,
        slot_addr: i64,
        items: &[HashItem],
    ) -> Result<i64> {
        self.erase_slot(space, slot_addr)?;
        self.store_slot(space, items)
    }

    fn store_slot(&mut self, space: &mut FileSpace, items: &[HashItem]) -> Result<i64> {
        if items.is_empty() {
            return Ok(NIL_ADDR);
        }

        let body = pack_slot(items);
        let prefix_len = uvarint_len(body.len() as u64);
        let (addr, view) = space.allocate(prefix_len + body.len())?;
        let n = encode_uvarint(body.len() as u64, view);
        view[n..n + body.len()].copy_from_slice(&body);
        Ok(addr)
    }

    fn erase_slot(&mut self, space: &mut FileSpace, slot_addr: i64) -> Result<()> {
        if slot_addr < 0 {
            return Ok(());
        }
        space.free(slot_addr)
    }

    fn load_slot(space: &FileSpace, slot_addr: i64) -> Result<Vec<HashItem>> {
        if slot_addr < 0 {
            return Ok(Vec::new());
        }

        let view = space.access(slot_addr)?;
        let (body_len, prefix_len) = decode_uvarint(view)?;
        let body_len = body_len as usize;
        ensure!(
            prefix_len + body_len <= view.len(),
            "slot record at address {} overruns its region",
            slot_addr
        );

        unpack_slot(&view[prefix_len..prefix_len + body_len])
    }

    fn calculate_slot_index(&self, key_sum: u64) -> usize {
        let slot_index = (key_sum & (self.max_slot_count_plus_one() as u64 - 1)) as usize;

        if slot_index >= self.slot_count {
            self.low_slot_index(slot_index)
        } else {
            slot_index
        }
    }

    /// Clears the split bit: the low sibling of a high slot index.
    fn low_slot_index(&self, high_slot_index: usize) -> usize {
        high_slot_index & !self.min_slot_count()
    }

    fn locate_slot_addr(&self, space: &FileSpace, slot_index: usize) -> Result<AddrRef> {
        let dir_ref = AddrRef {
            array_addr: self.slot_dirs_addr,
            index: slot_index >> SLOT_DIR_LENGTH_SHIFT,
        };
        Ok(AddrRef {
            array_addr: dir_ref.get(space)?,
            index: slot_index & ((1 << SLOT_DIR_LENGTH_SHIFT) - 1),
        })
    }

    fn maybe_expand(&mut self, space: &mut FileSpace) -> Result<()> {
        while self.load_factor() > MAX_LOAD_FACTOR {
            let slot_index = self.low_slot_index(self.slot_count);
            let addr_ref = self.locate_slot_addr(space, slot_index)?;
            let slot_addr = addr_ref.get(space)?;
            let items = Self::load_slot(space, slot_addr)?;

            let (stayed, moved) = split_items(items, self.min_slot_count() as u64);
            let new_addr = self.restore_slot(space, slot_addr, &stayed)?;
            addr_ref.set(space, new_addr)?;
            self.add_slot(space, &moved)?;
        }
        Ok(())
    }

    fn maybe_shrink(&mut self, space: &mut FileSpace) -> Result<()> {
        while self.slot_count >= 2 && self.load_factor() < MIN_LOAD_FACTOR {
            let items1 = self.remove_slot(space)?;

            let slot_index = self.low_slot_index(self.slot_count);
            let addr_ref = self.locate_slot_addr(space, slot_index)?;
            let slot_addr = addr_ref.get(space)?;
            let items2 = Self::load_slot(space, slot_addr)?;

            let merged = merge_items(items1, items2);
            let new_addr = self.restore_slot(space, slot_addr, &merged)?;
            addr_ref.set(space, new_addr)?;
        }
        Ok(())
    }

    fn add_slot(&mut self, space: &mut FileSpace, items: &[HashItem]) -> Result<()> {
        if self.slot_count == self.slot_dir_count << SLOT_DIR_LENGTH_SHIFT {
            self.add_slot_dir(space)?;
        }

        let slot_addr = self.store_slot(space, items)?;
        self.locate_slot_addr(space, self.slot_count)?
            .set(space, slot_addr)?;
        self.slot_count += 1;

        if self.slot_count == self.max_slot_count_plus_one() {
            self.min_slot_count_shift += 1;
        }
        Ok(())
    }

    fn remove_slot(&mut self, space: &mut FileSpace) -> Result<Vec<HashItem>> {
        let addr_ref = self.locate_slot_addr(space, self.slot_count - 1)?;
        let slot_addr = addr_ref.get(space)?;
        let items = Self::load_slot(space, slot_addr)?;
        self.erase_slot(space, slot_addr)?;
        self.slot_count -= 1;

        if self.slot_count < self.min_slot_count() {
            self.min_slot_count_shift -= 1;
        }

        if self.slot_dir_count >= 2
            && self.slot_count == (self.slot_dir_count - 1) << SLOT_DIR_LENGTH_SHIFT
        {
            self.remove_slot_dir(space)?;
        }

        Ok(items)
    }

    fn add_slot_dir(&mut self, space: &mut FileSpace) -> Result<()> {
        if self.slot_dir_count == self.max_slot_dir_count() {
            self.adjust_slot_dirs(space, self.max_slot_dir_count_shift + 1)?;
        }

        let (slot_dir_addr, _) = space.allocate(8 << SLOT_DIR_LENGTH_SHIFT)?;
        AddrRef {
            array_addr: self.slot_dirs_addr,
            index: self.slot_dir_count,
        }
        .set(space, slot_dir_addr)?;
        self.slot_dir_count += 1;
        Ok(())
    }

    fn remove_slot_dir(&mut self, space: &mut FileSpace) -> Result<()> {
        let slot_dir_addr = AddrRef {
            array_addr: self.slot_dirs_addr,
            index: self.slot_dir_count - 1,
        }
        .get(space)?;
        space.free(slot_dir_addr)?;
        self.slot_dir_count -= 1;

        if self.max_slot_dir_count_shift > MIN_MAX_SLOT_DIR_COUNT_SHIFT
            && self.slot_dir_count == 1 << (self.max_slot_dir_count_shift - 2)
        {
            self.adjust_slot_dirs(space, self.max_slot_dir_count_shift - 1)?;
        }
        Ok(())
    }

    /// Reallocates the outer directory-pointer array at a new capacity,
    /// carrying the live pointers over.
    fn adjust_slot_dirs(&mut self, space: &mut FileSpace, new_shift: u32) -> Result<()> {
        let old = space.access(self.slot_dirs_addr)?.to_vec();
        space.free(self.slot_dirs_addr)?;

        let (new_addr, view) = space.allocate(8 << new_shift)?;
        let n = old.len().min(view.len());
        view[..n].copy_from_slice(&old[..n]);

        self.slot_dirs_addr = new_addr;
        self.max_slot_dir_count_shift = new_shift;
        Ok(())
    }

    fn load_factor(&self) -> f64 {
        self.item_count as f64 / self.slot_count as f64
    }

    fn max_slot_count_plus_one(&self) -> usize {
        1 << (self.min_slot_count_shift + 1)
    }
}

fn present_value(slot: &SlotItems, i: usize, want: bool) -> Option<Vec<u8>> {
    want.then(|| slot.items[i].value.clone())
}
