//! In-memory buffer pool with per-frame latches.
//!
//! The pool models the host buffer manager the index runs on: fixed-size
//! pages addressed by block number, extension by one page at a time, shared
//! latches for readers and exclusive latches for writers, and a dirty mark
//! per frame. Pages are exchanged as whole images (`PageBuf`), so a latch is
//! held only for the duration of one copy.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use cola_error::define_index_error;
use cola_utils::RwLock;

use crate::page::{ITEM_ALIGN, MAX_PAGE_SIZE, MIN_PAGE_SIZE, PageBuf};

/// Block numbers address pages within one index relation.
pub type BlockNumber = u32;

/// Sentinel for "no block".
pub const INVALID_BLOCK: BlockNumber = BlockNumber::MAX;

define_index_error! {
    /// Errors raised by the page store.
    pub enum StoreError(0x02) {
        /// Block number past the end of the relation
        OutOfRange = 0x01 => "Block number beyond relation end",
        /// Page size not supported by the slotted layout
        BadPageSize = 0x02 => "Unsupported page size",
    }
}

#[derive(Debug)]
struct Frame {
    data: RwLock<Vec<u8>>,
    dirty: AtomicBool,
}

/// A latched, growable array of page frames.
#[derive(Debug)]
pub struct BufferPool {
    page_size: usize,
    frames: RwLock<Vec<Arc<Frame>>>,
}

impl BufferPool {
    /// Create an empty pool of `page_size`-byte pages.
    pub fn new(page_size: usize) -> Result<Self, StoreError> {
        if page_size < MIN_PAGE_SIZE
            || page_size > MAX_PAGE_SIZE
            || !cola_utils::is_aligned(page_size, ITEM_ALIGN)
        {
            return Err(StoreError::BadPageSize);
        }
        Ok(Self { page_size, frames: RwLock::new(Vec::new()) })
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages in the relation.
    #[must_use]
    pub fn page_count(&self) -> BlockNumber {
        self.frames.read().len() as BlockNumber
    }

    /// Extend the relation by one zeroed page and return its block number.
    ///
    /// Extension is serialized by the frame-table lock, so two writers can
    /// never hand out the same block number.
    pub fn allocate(&self) -> BlockNumber {
        let mut frames = self.frames.write();
        let blkno = frames.len() as BlockNumber;
        frames.push(Arc::new(Frame {
            data: RwLock::new(vec![0; self.page_size]),
            dirty: AtomicBool::new(false),
        }));
        log::trace!("pool: extended relation to {} pages", frames.len());
        blkno
    }

    fn frame(&self, blkno: BlockNumber) -> Result<Arc<Frame>, StoreError> {
        self.frames
            .read()
            .get(blkno as usize)
            .cloned()
            .ok_or(StoreError::OutOfRange)
    }

    /// Copy a page out under a shared latch.
    pub fn read_page(&self, blkno: BlockNumber) -> Result<PageBuf, StoreError> {
        let frame = self.frame(blkno)?;
        let guard = frame.data.read();
        Ok(PageBuf::from_bytes(guard.clone()))
    }

    /// Copy a page image in under an exclusive latch and mark the frame
    /// dirty.
    pub fn write_page(&self, blkno: BlockNumber, page: &PageBuf) -> Result<(), StoreError> {
        if page.len() != self.page_size {
            return Err(StoreError::BadPageSize);
        }
        let frame = self.frame(blkno)?;
        let mut guard = frame.data.write();
        guard.copy_from_slice(page.as_bytes());
        frame.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Whether a frame has been written since allocation.
    pub fn is_dirty(&self, blkno: BlockNumber) -> Result<bool, StoreError> {
        Ok(self.frame(blkno)?.dirty.load(Ordering::Acquire))
    }
}
