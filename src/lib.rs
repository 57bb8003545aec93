//! # bytedict — persistent single-file dictionaries
//!
//! A key/value store keeping everything in one file, usable as either an
//! unordered dictionary ([`Dict`], a linear-hashing index) or an
//! order-preserving dictionary ([`OrderedDict`], a disk-resident B+ tree).
//! Both hold arbitrary byte-string keys and values, support point
//! operations and scans, and the ordered variant adds range iteration in
//! either direction.
//!
//! ## Quick Start
//!
//! ```no_run
//! use bytedict::{Dict, OrderedDict, SearchBound};
//!
//! # fn main() -> eyre::Result<()> {
//! let mut dict = Dict::open("./data.db", true)?;
//! dict.add(b"foo", b"bar", false)?;
//! let (value, present) = dict.has(b"foo", true)?;
//! assert!(present);
//! assert_eq!(value.unwrap(), b"bar");
//! dict.close()?;
//!
//! let mut ordered = OrderedDict::open("./ordered.db", true)?;
//! ordered.add(b"alpha", b"1", false)?;
//! ordered.add(b"bravo", b"2", false)?;
//! let mut iter = ordered.range_forward(SearchBound::Min, SearchBound::Max)?;
//! while !iter.is_at_end() {
//!     let (key, value) = iter.read_record()?;
//!     println!("{:?} = {:?}", key, value);
//!     iter.advance()?;
//! }
//! ordered.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +-------------------------------------------+
//! |        Dict           |    OrderedDict    |
//! +-------------------------------------------+
//! |   hashmap (linear     |  bptree (nodes,   |
//! |   hashing, slots)     |  overflow, chain) |
//! +-------------------------------------------+
//! |        encoding (varints, wire fields)    |
//! +-------------------------------------------+
//! |   storage (FileSpace: mmap, allocator,    |
//! |   primary address, free lists)            |
//! +-------------------------------------------+
//! ```
//!
//! Each dictionary operation consults exactly one index, which reads and
//! writes regions through the space backend. On close, an index serializes
//! its metadata into a backend region whose address becomes the backend's
//! *primary*; on open, that address is how the index finds itself again.
//!
//! ## Concurrency
//!
//! The store is single-writer and not thread-safe by contract: operations
//! are synchronous, effects are visible to later operations immediately,
//! and a caller needing concurrent access must serialize externally.
//! Zero-copy views into the backing file are valid only until the next
//! allocation or free, which the borrow checker enforces at compile time.
//!
//! ## Module Overview
//!
//! - [`storage`]: the mmap'd file backend and its free-space allocator
//! - [`hashmap`]: the linear-hashing index behind [`Dict`]
//! - [`bptree`]: the B+ tree behind [`OrderedDict`]
//! - [`encoding`]: varints and wire-format helpers for the on-disk records

pub mod bptree;
pub mod dict;
pub mod encoding;
pub mod hashmap;
pub mod ordered_dict;
pub mod storage;

pub use bptree::{BpTree, RangeIter, SearchBound};
pub use dict::{Dict, DictStats};
pub use hashmap::{DictCursor, HashIndex};
pub use ordered_dict::{OrderedDict, OrderedDictStats};
pub use storage::{FileSpace, SpaceStats, NIL_ADDR, PAGE_SIZE};
