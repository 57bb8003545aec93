//! # File Space Backend
//!
//! `FileSpace` manages a single memory-mapped store file and hands out byte
//! regions by address. It serves both kinds of region the indexes need:
//!
//! - **Variable regions** (`allocate`/`free`/`access`): slot records, slot
//!   directories, overflow payloads, serialized metadata. Requests at or
//!   below 4 KiB are rounded up to a size class and carved from dedicated
//!   chunk pages; larger requests get a contiguous page span.
//! - **Aligned regions** (`allocate_aligned`/`free_aligned`/
//!   `access_aligned`): exactly one 8 KiB page, page-aligned, used for tree
//!   nodes.
//!
//! An address is the byte offset of the region's payload within the file;
//! −1 is the "absent" sentinel. One address, the *primary*, is persisted in
//! the file header as the root pointer of whatever index lives in the file.
//!
//! ## Free lists
//!
//! All free-list state is intrusive and lives in the file itself:
//!
//! - free pages form a singly-linked list through their first 8 bytes;
//! - freed chunks link through their payload, one list per size class;
//! - freed spans link through their payload, first-fit on reuse.
//!
//! Every allocated variable region is preceded by an 8-byte tag recording
//! its size class (or span page count), which is how `free` and `access`
//! recover the region size from a bare address. List heads and usage
//! counters sit in the mmap'd header, so there is no allocator state to
//! serialize at close.
//!
//! ## View invalidation
//!
//! Zero-copy views borrow the backend: read views take `&self` and may
//! coexist, write views and any allocate/free take `&mut self`. Growing the
//! file remaps it, so a view held across an allocation would dangle; the
//! borrow checker makes that a compile error instead of a runtime hazard.

use std::fs::OpenOptions;
use std::path::Path;

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::MmapMut;
use zerocopy::{FromBytes, IntoBytes};

use super::header::{
    chunk_class, FileHeader, CHUNK_CLASSES, FILE_HEADER_SIZE, MAX_CHUNK_SIZE, NUM_CHUNK_CLASSES,
};
use super::{NIL_ADDR, PAGE_SIZE};

/// Tag prefix size of every variable allocation.
const REGION_TAG_SIZE: usize = 8;

/// Tags below this are chunk class indexes; `SPAN_TAG_BASE + n` marks an
/// n-page span.
const SPAN_TAG_BASE: u64 = 1 << 32;

/// Counters exposed through `stats()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceStats {
    pub file_size: u64,
    pub used_size: u64,
    pub allocation_count: u64,
}

#[derive(Debug)]
pub struct FileSpace {
    file: std::fs::File,
    mmap: MmapMut,
    page_count: u64,
}

impl FileSpace {
    /// Opens a store file, creating it when `create_if_missing` is set and
    /// the file does not exist.
    pub fn open<P: AsRef<Path>>(path: P, create_if_missing: bool) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            ensure!(
                create_if_missing,
                "store file '{}' does not exist",
                path.display()
            );
            return Self::create(path);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open store file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size >= PAGE_SIZE as u64 && file_size % PAGE_SIZE as u64 == 0,
            "store file '{}' size {} is not a positive multiple of the page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        // SAFETY: MmapMut::map_mut is unsafe because externally modified
        // mappings are undefined behavior. This is safe because:
        // 1. Store files are owned by a single FileSpace at a time
        // 2. The mmap lifetime is tied to FileSpace, preventing use-after-unmap
        // 3. All access goes through bounds-checked address validation
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let header = FileHeader::from_bytes(&mmap[..FILE_HEADER_SIZE])?;
        let page_count = header.page_count();

        ensure!(
            file_size == (1 + page_count) * PAGE_SIZE as u64,
            "store file '{}' header records {} pages but the file holds {}",
            path.display(),
            page_count,
            file_size / PAGE_SIZE as u64 - 1
        );

        Ok(Self {
            file,
            mmap,
            page_count,
        })
    }

    fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create store file '{}'", path.display()))?;

        file.set_len(PAGE_SIZE as u64)
            .wrap_err("failed to reserve the header page")?;

        // SAFETY: same argument as in open(); additionally the file was just
        // created with truncate, so no other mapping can exist.
        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let header = FileHeader::new();
        mmap[..FILE_HEADER_SIZE].copy_from_slice(header.as_bytes());

        Ok(Self {
            file,
            mmap,
            page_count: 0,
        })
    }

    /// Flushes and closes the file.
    pub fn close(self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to flush store file")
    }

    pub fn primary(&self) -> i64 {
        self.header().primary()
    }

    pub fn set_primary(&mut self, addr: i64) {
        self.header_mut().set_primary(addr);
    }

    pub fn stats(&self) -> SpaceStats {
        let header = self.header();
        SpaceStats {
            file_size: (1 + self.page_count) * PAGE_SIZE as u64,
            used_size: header.used_size(),
            allocation_count: header.allocation_count(),
        }
    }

    /// Reserves `size` bytes and returns the region address plus a writable
    /// view. The view may be larger than `size` (it spans the full size
    /// class or page span backing the region) and dies at the next
    /// allocation or free.
    pub fn allocate(&mut self, size: usize) -> Result<(i64, &mut [u8])> {
        if size <= MAX_CHUNK_SIZE {
            self.allocate_chunk(size)
        } else {
            self.allocate_span(size)
        }
    }

    /// Releases a region previously returned by `allocate`.
    pub fn free(&mut self, addr: i64) -> Result<()> {
        let offset = self.check_addr(addr)?;
        let tag = self.read_u64(offset - REGION_TAG_SIZE);

        if (tag as usize) < NUM_CHUNK_CLASSES {
            let class = tag as usize;
            let head = self.header().chunk_free_head(class);
            self.write_i64(offset, head);
            self.header_mut().set_chunk_free_head(class, addr);
            self.header_mut().sub_used(CHUNK_CLASSES[class] as u64);
        } else if tag >= SPAN_TAG_BASE {
            let pages = tag - SPAN_TAG_BASE;
            ensure!(
                pages >= 1 && pages <= self.page_count,
                "span tag at address {} names {} pages (file has {})",
                addr,
                pages,
                self.page_count
            );
            let head = self.header().free_span_head();
            self.write_i64(offset, head);
            self.header_mut().set_free_span_head(addr);
            self.header_mut().sub_used(pages * PAGE_SIZE as u64);
        } else {
            bail!("corrupted allocation tag {:#x} at address {}", tag, addr);
        }

        Ok(())
    }

    /// Reserves one page-aligned node region of exactly `size` bytes.
    pub fn allocate_aligned(&mut self, size: usize) -> Result<(i64, &mut [u8])> {
        ensure!(
            size == PAGE_SIZE,
            "aligned regions are fixed {}-byte node pages (requested {})",
            PAGE_SIZE,
            size
        );

        let addr = self.allocate_page()?;
        self.header_mut().add_used(PAGE_SIZE as u64);
        let offset = addr as usize;
        Ok((addr, &mut self.mmap[offset..offset + PAGE_SIZE]))
    }

    /// Releases a node region previously returned by `allocate_aligned`.
    pub fn free_aligned(&mut self, addr: i64) -> Result<()> {
        self.check_aligned_addr(addr)?;
        self.header_mut().sub_used(PAGE_SIZE as u64);
        self.free_page(addr);
        Ok(())
    }

    /// Read view over the live variable region at `addr`.
    pub fn access(&self, addr: i64) -> Result<&[u8]> {
        let (offset, len) = self.region_bounds(addr)?;
        Ok(&self.mmap[offset..offset + len])
    }

    /// Write view over the live variable region at `addr`.
    pub fn access_mut(&mut self, addr: i64) -> Result<&mut [u8]> {
        let (offset, len) = self.region_bounds(addr)?;
        Ok(&mut self.mmap[offset..offset + len])
    }

    /// Read view over the node page at `addr`.
    pub fn access_aligned(&self, addr: i64) -> Result<&[u8]> {
        let offset = self.check_aligned_addr(addr)?;
        Ok(&self.mmap[offset..offset + PAGE_SIZE])
    }

    /// Write view over the node page at `addr`.
    pub fn access_aligned_mut(&mut self, addr: i64) -> Result<&mut [u8]> {
        let offset = self.check_aligned_addr(addr)?;
        Ok(&mut self.mmap[offset..offset + PAGE_SIZE])
    }

    fn allocate_chunk(&mut self, size: usize) -> Result<(i64, &mut [u8])> {
        let class = chunk_class(size).unwrap();

        if self.header().chunk_free_head(class) == NIL_ADDR {
            self.carve_chunk_page(class)?;
        }

        let addr = self.header().chunk_free_head(class);
        let offset = addr as usize;
        let next = self.read_i64(offset);
        self.header_mut().set_chunk_free_head(class, next);
        self.header_mut().add_used(CHUNK_CLASSES[class] as u64);

        Ok((addr, &mut self.mmap[offset..offset + CHUNK_CLASSES[class]]))
    }

    /// Turns one fresh page into free chunks of the given class.
    fn carve_chunk_page(&mut self, class: usize) -> Result<()> {
        let page_offset = self.allocate_page()? as usize;
        let stride = CHUNK_CLASSES[class] + REGION_TAG_SIZE;
        let count = PAGE_SIZE / stride;

        let mut head = self.header().chunk_free_head(class);
        for i in 0..count {
            let tag_offset = page_offset + i * stride;
            self.write_u64(tag_offset, class as u64);
            let payload = tag_offset + REGION_TAG_SIZE;
            self.write_i64(payload, head);
            head = payload as i64;
        }
        self.header_mut().set_chunk_free_head(class, head);

        Ok(())
    }

    fn allocate_span(&mut self, size: usize) -> Result<(i64, &mut [u8])> {
        let pages = ((size + REGION_TAG_SIZE + PAGE_SIZE - 1) / PAGE_SIZE) as u64;

        // First fit over the freed spans.
        let mut prev = NIL_ADDR;
        let mut cursor = self.header().free_span_head();
        while cursor != NIL_ADDR {
            let offset = cursor as usize;
            let span_pages = self.read_u64(offset - REGION_TAG_SIZE) - SPAN_TAG_BASE;
            let next = self.read_i64(offset);

            if span_pages >= pages {
                if prev == NIL_ADDR {
                    self.header_mut().set_free_span_head(next);
                } else {
                    self.write_i64(prev as usize, next);
                }

                if span_pages > pages {
                    let remainder_offset = offset - REGION_TAG_SIZE + (pages as usize) * PAGE_SIZE;
                    self.write_u64(remainder_offset, SPAN_TAG_BASE + (span_pages - pages));
                    let remainder_payload = remainder_offset + REGION_TAG_SIZE;
                    let head = self.header().free_span_head();
                    self.write_i64(remainder_payload, head);
                    self.header_mut()
                        .set_free_span_head(remainder_payload as i64);
                    self.write_u64(offset - REGION_TAG_SIZE, SPAN_TAG_BASE + pages);
                }

                self.header_mut().add_used(pages * PAGE_SIZE as u64);
                let len = pages as usize * PAGE_SIZE - REGION_TAG_SIZE;
                return Ok((cursor, &mut self.mmap[offset..offset + len]));
            }

            prev = cursor;
            cursor = next;
        }

        // Nothing fits: extend the file with a fresh contiguous span.
        let span_offset = self.file_size();
        self.grow(pages)?;
        self.write_u64(span_offset, SPAN_TAG_BASE + pages);
        self.header_mut().add_used(pages * PAGE_SIZE as u64);

        let payload = span_offset + REGION_TAG_SIZE;
        let len = pages as usize * PAGE_SIZE - REGION_TAG_SIZE;
        Ok((payload as i64, &mut self.mmap[payload..payload + len]))
    }

    fn allocate_page(&mut self) -> Result<i64> {
        let head = self.header().free_page_head();
        if head != NIL_ADDR {
            let next = self.read_i64(head as usize);
            self.header_mut().set_free_page_head(next);
            return Ok(head);
        }

        let addr = self.file_size() as i64;
        self.grow(1)?;
        Ok(addr)
    }

    fn free_page(&mut self, addr: i64) {
        let head = self.header().free_page_head();
        self.write_i64(addr as usize, head);
        self.header_mut().set_free_page_head(addr);
    }

    fn grow(&mut self, additional_pages: u64) -> Result<()> {
        self.mmap
            .flush_async()
            .wrap_err("failed to flush mmap before grow")?;

        let new_size = self.file_size() as u64 + additional_pages * PAGE_SIZE as u64;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend store file to {} bytes", new_size))?;

        // SAFETY: grow() takes &mut self, so the borrow checker guarantees no
        // view into the old mapping survives this remap. The old mmap was
        // flushed above and the file extended before mapping again.
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap file after grow")? };

        self.page_count += additional_pages;
        let page_count = self.page_count;
        self.header_mut().set_page_count(page_count);

        Ok(())
    }

    fn file_size(&self) -> usize {
        (1 + self.page_count as usize) * PAGE_SIZE
    }

    fn region_bounds(&self, addr: i64) -> Result<(usize, usize)> {
        let offset = self.check_addr(addr)?;
        let tag = self.read_u64(offset - REGION_TAG_SIZE);

        let len = if (tag as usize) < NUM_CHUNK_CLASSES {
            CHUNK_CLASSES[tag as usize]
        } else if tag >= SPAN_TAG_BASE {
            let pages = tag - SPAN_TAG_BASE;
            ensure!(
                pages >= 1 && pages <= self.page_count,
                "span tag at address {} names {} pages (file has {})",
                addr,
                pages,
                self.page_count
            );
            pages as usize * PAGE_SIZE - REGION_TAG_SIZE
        } else {
            bail!("corrupted allocation tag {:#x} at address {}", tag, addr);
        };

        ensure!(
            offset + len <= self.file_size(),
            "region at address {} extends past the end of the file",
            addr
        );

        Ok((offset, len))
    }

    fn check_addr(&self, addr: i64) -> Result<usize> {
        ensure!(
            addr >= (PAGE_SIZE + REGION_TAG_SIZE) as i64 && (addr as usize) < self.file_size(),
            "address {} is outside the allocated file range",
            addr
        );
        Ok(addr as usize)
    }

    fn check_aligned_addr(&self, addr: i64) -> Result<usize> {
        ensure!(
            addr >= PAGE_SIZE as i64
                && addr as usize % PAGE_SIZE == 0
                && (addr as usize) + PAGE_SIZE <= self.file_size(),
            "address {} is not a live node page",
            addr
        );
        Ok(addr as usize)
    }

    fn header(&self) -> &FileHeader {
        FileHeader::ref_from_bytes(&self.mmap[..FILE_HEADER_SIZE]).unwrap()
    }

    fn header_mut(&mut self) -> &mut FileHeader {
        FileHeader::mut_from_bytes(&mut self.mmap[..FILE_HEADER_SIZE]).unwrap()
    }

    fn read_u64(&self, offset: usize) -> u64 {
        u64::from_be_bytes(self.mmap[offset..offset + 8].try_into().unwrap())
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        self.mmap[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
    }

    fn read_i64(&self, offset: usize) -> i64 {
        self.read_u64(offset) as i64
    }

    fn write_i64(&mut self, offset: usize, value: i64) {
        self.write_u64(offset, value as u64);
    }
}
