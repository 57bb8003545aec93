//! # Hash Slot Records
//!
//! A slot is one bucket of the linear-hashing index. Its on-disk form is a
//! varint-size-prefixed record holding every item of the bucket:
//!
//! ```text
//! uvarint body_size
//! body:
//!   repeated ItemInfo { key_sum: fixed64, key_size: varint, value_size: varint }
//!   bin: bytes             (key0 value0 key1 value1 ...)
//! ```
//!
//! Two size optimizations shape the record:
//!
//! - the last item's `value_size` is serialized as 0; its real length is
//!   whatever remains of `bin` after the preceding items;
//! - items whose key is at most 24 bytes store `key_sum` 0 — hashing a short
//!   key again is cheaper than eight bytes per item, so the sum is
//!   recomputed where it is needed.
//!
//! Splitting a slot partitions its items by one hash bit; merging two slots
//! interleaves them with a deterministic, content-derived parity so that a
//! split followed by a merge of the same content is a round trip.

use eyre::{ensure, Result};

use crate::encoding::wire::{
    check_wire_type, put_bytes_field, put_fixed64_field, put_uvarint_field, unknown_field,
    WireReader, WIRE_BYTES, WIRE_FIXED64, WIRE_VARINT,
};

/// Keys at or below this length store a zero `key_sum`.
pub const MAX_SHORT_KEY_SIZE: usize = 24;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a/64 of the key, the hash the slot addressing is built on.
pub fn sum_key(key: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in key {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashItem {
    pub key_sum: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl HashItem {
    /// The item's real hash, recomputing the suppressed sum of short keys.
    pub fn effective_sum(&self) -> u64 {
        if self.key.len() <= MAX_SHORT_KEY_SIZE {
            sum_key(&self.key)
        } else {
            self.key_sum
        }
    }
}

/// Whether the item holds `key`. The stored sum filters long keys before the
/// byte comparison; short keys skip the filter (their stored sum is 0).
pub fn match_item(item: &HashItem, key: &[u8], key_sum: u64) -> bool {
    if item.key.len() > MAX_SHORT_KEY_SIZE && item.key_sum != key_sum {
        return false;
    }
    item.key == key
}

/// Encodes the slot body (without the record's size prefix). Must not be
/// called with an empty item list; empty slots are stored as the −1 address.
pub fn pack_slot(items: &[HashItem]) -> Vec<u8> {
    let bin_size: usize = items
        .iter()
        .map(|item| item.key.len() + item.value.len())
        .sum();

    let mut body = Vec::with_capacity(items.len() * 12 + bin_size + 8);
    let last = items.len() - 1;

    for (j, item) in items.iter().enumerate() {
        let mut info = Vec::with_capacity(20);
        put_fixed64_field(&mut info, 1, item.key_sum);
        put_uvarint_field(&mut info, 2, item.key.len() as u64);
        let value_size = if j == last { 0 } else { item.value.len() };
        put_uvarint_field(&mut info, 3, value_size as u64);
        put_bytes_field(&mut body, 1, &info);
    }

    let mut bin = Vec::with_capacity(bin_size);
    for item in items {
        bin.extend_from_slice(&item.key);
        bin.extend_from_slice(&item.value);
    }
    put_bytes_field(&mut body, 2, &bin);

    body
}

/// Decodes a slot body back into its items.
pub fn unpack_slot(body: &[u8]) -> Result<Vec<HashItem>> {
    let mut infos: Vec<(u64, usize, usize)> = Vec::new();
    let mut bin: &[u8] = &[];

    let mut reader = WireReader::new(body);
    while let Some((field, wire_type)) = reader.next_tag()? {
        match field {
            1 => {
                check_wire_type("slot", field, wire_type, WIRE_BYTES)?;
                let info = reader.read_bytes()?;
                infos.push(decode_item_info(info)?);
            }
            2 => {
                check_wire_type("slot", field, wire_type, WIRE_BYTES)?;
                bin = reader.read_bytes()?;
            }
            _ => return Err(unknown_field("slot", field)),
        }
    }

    let n = infos.len();
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut items = Vec::with_capacity(n);
    let mut offset = 0;
    for (j, &(key_sum, key_size, value_size)) in infos.iter().enumerate() {
        ensure!(
            offset + key_size <= bin.len(),
            "slot item {} key overruns the blob ({} + {} > {})",
            j,
            offset,
            key_size,
            bin.len()
        );
        let key = bin[offset..offset + key_size].to_vec();
        offset += key_size;

        // The last item's stored value size is 0; its value is the blob tail.
        let value_end = if j == n - 1 {
            bin.len()
        } else {
            offset + value_size
        };
        ensure!(
            value_end <= bin.len() && value_end >= offset,
            "slot item {} value overruns the blob",
            j
        );
        let value = bin[offset..value_end].to_vec();
        offset = value_end;

        items.push(HashItem {
            key_sum,
            key,
            value,
        });
    }

    Ok(items)
}

fn decode_item_info(info: &[u8]) -> Result<(u64, usize, usize)> {
    let mut key_sum = 0u64;
    let mut key_size = 0usize;
    let mut value_size = 0usize;

    let mut reader = WireReader::new(info);
    while let Some((field, wire_type)) = reader.next_tag()? {
        match field {
            1 => {
                check_wire_type("item info", field, wire_type, WIRE_FIXED64)?;
                key_sum = reader.read_fixed64()?;
            }
            2 => {
                check_wire_type("item info", field, wire_type, WIRE_VARINT)?;
                key_size = reader.read_uvarint()? as usize;
            }
            3 => {
                check_wire_type("item info", field, wire_type, WIRE_VARINT)?;
                value_size = reader.read_uvarint()? as usize;
            }
            _ => return Err(unknown_field("item info", field)),
        }
    }

    Ok((key_sum, key_size, value_size))
}

/// Partitions a slot's items for a split: items whose hash has
/// `distinct_sum_bit` clear stay, the rest move to the new slot. Relative
/// order is preserved on both sides.
pub fn split_items(items: Vec<HashItem>, distinct_sum_bit: u64) -> (Vec<HashItem>, Vec<HashItem>) {
    let mut stayed = Vec::with_capacity(items.len());
    let mut moved = Vec::new();

    for item in items {
        if item.effective_sum() & distinct_sum_bit != 0 {
            moved.push(item);
        } else {
            stayed.push(item);
        }
    }

    (stayed, moved)
}

/// Interleaves two item lists deterministically: each paired index draws a
/// parity bit from a running product of the two key lengths, then the tail
/// of the longer list follows. Merging the two halves of a split
/// reconstructs a slot with the same content.
pub fn merge_items(items1: Vec<HashItem>, items2: Vec<HashItem>) -> Vec<HashItem> {
    let n = items1.len().min(items2.len());
    let mut merged = Vec::with_capacity(items1.len() + items2.len());

    let mut x: u64 = 1;
    let mut iter1 = items1.into_iter();
    let mut iter2 = items2.into_iter();

    for _ in 0..n {
        let item1 = iter1.next().unwrap();
        let item2 = iter2.next().unwrap();
        x = x.wrapping_mul(item1.key.len() as u64 + item2.key.len() as u64);

        if x & 1 == 0 {
            merged.push(item1);
            merged.push(item2);
        } else {
            merged.push(item2);
            merged.push(item1);
        }
    }

    merged.extend(iter1);
    merged.extend(iter2);
    merged
}
