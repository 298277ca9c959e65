//! Slotted page layout.
//!
//! A page is a byte array with a small header, a line-pointer array growing
//! up, item data growing down, and an opaque trailer at the end:
//!
//! ```text
//! +--------+----------------+ ................ +-----------+---------+
//! | header | line pointers ->    free space    <- item data| trailer |
//! +--------+----------------+ ................ +-----------+---------+
//! 0        8                 free_start  free_end      special       len
//! ```
//!
//! Item offsets handed to callers are 1-based. Offset 0 never names an item;
//! the index engine reserves it as the look-ahead pointer sentinel inside
//! tuple identifiers.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use cola_utils::align_up;

/// Size of the page header in bytes.
pub const PAGE_HEADER_SIZE: usize = 8;
/// Size of the opaque trailer in bytes.
pub const PAGE_TRAILER_SIZE: usize = 8;
/// Size of one line pointer in bytes.
pub const LINE_PTR_SIZE: usize = 4;
/// Alignment of item data within a page.
pub const ITEM_ALIGN: usize = 8;
/// Smallest page size the layout supports.
pub const MIN_PAGE_SIZE: usize = 64;
/// Largest page size the layout supports (offsets are 16-bit).
pub const MAX_PAGE_SIZE: usize = 32 * 1024;

bitflags! {
    /// Flags stored in the opaque trailer of every page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        /// Page is the index meta page.
        const META = 1 << 0;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct PageHeader {
    /// First byte past the line-pointer array.
    free_start: u16,
    /// First byte of item data.
    free_end: u16,
    /// First byte of the opaque trailer.
    special: u16,
    reserved: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct PageTrailer {
    flags: u16,
    reserved: [u16; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct LinePointer {
    off: u16,
    len: u16,
}

/// An owned page image.
///
/// `PageBuf` is plain data; latching and persistence are the pool's job.
#[derive(Clone, Debug)]
pub struct PageBuf {
    data: Vec<u8>,
}

impl PageBuf {
    /// A zeroed, uninitialized page of `page_size` bytes.
    #[must_use]
    pub fn empty(page_size: usize) -> Self {
        Self { data: vec![0; page_size] }
    }

    /// Wrap raw page bytes (as returned by the pool).
    #[must_use]
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// A page that has never been initialized is all zeroes.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.header().free_end == 0
    }

    fn header(&self) -> PageHeader {
        bytemuck::pod_read_unaligned(&self.data[..PAGE_HEADER_SIZE])
    }

    fn set_header(&mut self, h: PageHeader) {
        self.data[..PAGE_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&h));
    }

    fn trailer(&self) -> PageTrailer {
        let special = self.header().special as usize;
        bytemuck::pod_read_unaligned(&self.data[special..special + PAGE_TRAILER_SIZE])
    }

    fn set_trailer(&mut self, t: PageTrailer) {
        let special = self.header().special as usize;
        self.data[special..special + PAGE_TRAILER_SIZE].copy_from_slice(bytemuck::bytes_of(&t));
    }

    fn line_pointer(&self, index: usize) -> LinePointer {
        let at = PAGE_HEADER_SIZE + index * LINE_PTR_SIZE;
        bytemuck::pod_read_unaligned(&self.data[at..at + LINE_PTR_SIZE])
    }

    fn set_line_pointer(&mut self, index: usize, lp: LinePointer) {
        let at = PAGE_HEADER_SIZE + index * LINE_PTR_SIZE;
        self.data[at..at + LINE_PTR_SIZE].copy_from_slice(bytemuck::bytes_of(&lp));
    }

    /// Initialize an empty item area and the opaque trailer.
    pub fn init(&mut self, flags: PageFlags) {
        let special = self.data.len() - PAGE_TRAILER_SIZE;
        self.data.fill(0);
        self.set_header(PageHeader {
            free_start: PAGE_HEADER_SIZE as u16,
            free_end: special as u16,
            special: special as u16,
            reserved: 0,
        });
        self.set_trailer(PageTrailer { flags: flags.bits(), reserved: [0; 3] });
    }

    /// Flags from the opaque trailer.
    #[must_use]
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.trailer().flags)
    }

    /// Number of items on the page.
    #[must_use]
    pub fn item_count(&self) -> u16 {
        let h = self.header();
        ((h.free_start as usize - PAGE_HEADER_SIZE) / LINE_PTR_SIZE) as u16
    }

    /// Free bytes available for one more item, line pointer accounted for.
    #[must_use]
    pub fn free_space(&self) -> usize {
        let h = self.header();
        (h.free_end as usize - h.free_start as usize).saturating_sub(LINE_PTR_SIZE)
    }

    /// Append an item, keeping at least `reserve` bytes of free space after
    /// the insertion. Returns the new item's 1-based offset, or `None` when
    /// the item does not fit.
    pub fn add_item(&mut self, item: &[u8], reserve: usize) -> Option<u16> {
        if item.is_empty() || item.len() > u16::MAX as usize {
            return None;
        }
        let aligned = align_up(item.len(), ITEM_ALIGN);
        if self.free_space() < aligned + reserve {
            return None;
        }
        let mut h = self.header();
        let off = h.free_end as usize - aligned;
        self.data[off..off + item.len()].copy_from_slice(item);
        let index = self.item_count() as usize;
        self.set_line_pointer(index, LinePointer { off: off as u16, len: item.len() as u16 });
        h.free_start += LINE_PTR_SIZE as u16;
        h.free_end = off as u16;
        self.set_header(h);
        Some(index as u16 + 1)
    }

    /// Item bytes at a 1-based offset.
    #[must_use]
    pub fn item(&self, offnum: u16) -> Option<&[u8]> {
        if offnum == 0 || offnum > self.item_count() {
            return None;
        }
        let lp = self.line_pointer(offnum as usize - 1);
        self.data.get(lp.off as usize..lp.off as usize + lp.len as usize)
    }

    /// Iterate items in offset order as `(offset, bytes)` pairs.
    pub fn items(&self) -> impl Iterator<Item = (u16, &[u8])> + '_ {
        (1..=self.item_count()).filter_map(move |off| self.item(off).map(|it| (off, it)))
    }

    /// Drop every item, keeping the trailer intact. Used when an array is
    /// drained by a merge: the page stays allocated so block numbers remain
    /// stable, it just reads as empty.
    pub fn clear(&mut self) {
        let mut h = self.header();
        h.free_start = PAGE_HEADER_SIZE as u16;
        h.free_end = h.special;
        self.set_header(h);
    }

    /// The area between header and trailer, for pages that carry a struct
    /// payload instead of items (the meta page).
    #[must_use]
    pub fn contents(&self) -> &[u8] {
        let special = self.header().special as usize;
        &self.data[PAGE_HEADER_SIZE..special]
    }

    /// Mutable access to the contents area.
    pub fn contents_mut(&mut self) -> &mut [u8] {
        let special = self.header().special as usize;
        &mut self.data[PAGE_HEADER_SIZE..special]
    }
}
