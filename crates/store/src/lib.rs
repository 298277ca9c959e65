//! Paged storage for the COLA index engine.
//!
//! Two layers live here:
//!
//! ```text
//! +------------------+
//! |    BufferPool    |  fixed-size frames, per-frame latches, dirty marking
//! +------------------+
//!          |
//!          v
//! +------------------+
//! |     PageBuf      |  slotted item array + opaque trailer inside one page
//! +------------------+
//! ```
//!
//! The pool hands out whole-page images: readers copy a page out under a
//! shared latch, writers copy a page back in under an exclusive latch. A
//! reader therefore always observes a page as it was at some single point in
//! time, never a torn write.

#![no_std]

extern crate alloc;

pub mod page;
pub mod pool;

pub use page::{
    ITEM_ALIGN, LINE_PTR_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE, PAGE_HEADER_SIZE, PAGE_TRAILER_SIZE,
    PageBuf, PageFlags,
};
pub use pool::{BlockNumber, BufferPool, INVALID_BLOCK, StoreError};
