//! # Storage Module
//!
//! The space backend both dictionaries sit on: a single memory-mapped file
//! whose regions are allocated and reclaimed by address.
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------------------+
//! |  FileHeader (page 0)                     |
//! |    magic / version / primary address     |
//! |    free-list heads, usage counters       |
//! +------------------------------------------+
//! |  8 KiB pages:                            |
//! |    - node pages (tree leaves/non-leaves) |
//! |    - chunk pages (variable regions)      |
//! |    - span pages (large variable regions) |
//! +------------------------------------------+
//! ```
//!
//! The indexes never touch the file directly: they allocate, free and access
//! regions through `FileSpace` and persist exactly one address — the
//! *primary* — between sessions.
//!
//! ## Safety model
//!
//! Views into the mapping are plain slices borrowed from the backend.
//! Allocation and free may grow and remap the file, so they require
//! `&mut self`; the borrow checker therefore proves at compile time that no
//! view outlives the allocation that would invalidate it. This is the same
//! zero-runtime-cost discipline the mmap layer relies on for `grow()`.

mod header;
mod space;

pub use header::{FileHeader, CHUNK_CLASSES, FILE_HEADER_SIZE, FILE_MAGIC, FORMAT_VERSION};
pub use space::{FileSpace, SpaceStats};

/// Backend addresses are signed byte offsets; −1 means "absent".
pub const NIL_ADDR: i64 = -1;

/// Size of every page, and of every tree node.
pub const PAGE_SIZE: usize = 8192;
