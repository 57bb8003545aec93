//! # Hash Map Module
//!
//! The unordered dictionary's index: a linear-hashing map whose buckets are
//! variable-size slot records in the space backend.
//!
//! - `slot`: the slot record codec, FNV key sums, and the split/merge
//!   item-list transforms.
//! - `map`: the `HashIndex` engine — addressing, expansion/contraction, the
//!   scan cursor, and the persisted metadata record.

mod map;
mod slot;

pub use map::{
    DictCursor, HashIndex, MAX_LOAD_FACTOR, MIN_LOAD_FACTOR, MIN_MAX_SLOT_DIR_COUNT_SHIFT,
    SLOT_DIR_LENGTH_SHIFT,
};
pub use slot::{sum_key, HashItem, MAX_SHORT_KEY_SIZE};
