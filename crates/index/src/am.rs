//! Access-method surface.
//!
//! The host index machinery talks to the engine through the capability set
//! defined here: build, insert, and the scan family. Operations outside the
//! set (vacuum, mark/restore, ordered scans, cost estimation) fail with the
//! unsupported-operation error at the call site rather than being silently
//! ignored.
//!
//! Writes serialize on an index-level lock; scans run against meta-page
//! snapshots and need no lock at all.

use alloc::sync::Arc;
use core::cmp::Ordering;

use cola_store::{BufferPool, PAGE_HEADER_SIZE, PAGE_TRAILER_SIZE, PageBuf};
use cola_utils::Mutex;

use crate::error::{ColaError, ColaResult};
use crate::insert::{InsertState, RLP_PAGE_RESERVE};
use crate::meta::{self, META_BLOCK, META_MIN_PAGE_SIZE};
use crate::scan::ScanState;
use crate::tuple::{ComparatorRef, IndexTuple, KeyComparator, RLP_OFFSET, TupleId};

/// Row counts reported by an index build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub heap_tuples: u64,
    pub index_tuples: u64,
}

/// An open COLA index over a buffer pool.
pub struct ColaIndex {
    pool: Arc<BufferPool>,
    comparator: ComparatorRef,
    write_lock: Mutex<()>,
}

impl core::fmt::Debug for ColaIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ColaIndex").finish_non_exhaustive()
    }
}

impl ColaIndex {
    fn check_page_size(pool: &BufferPool) -> ColaResult<()> {
        if pool.page_size() < META_MIN_PAGE_SIZE {
            return Err(ColaError::Store(cola_store::StoreError::BadPageSize));
        }
        Ok(())
    }

    /// Build a new index: lay out the meta page on block 0, then feed every
    /// heap row through the insert engine.
    pub fn build<I>(
        pool: Arc<BufferPool>,
        comparator: ComparatorRef,
        heap: I,
    ) -> ColaResult<(Self, BuildStats)>
    where
        I: IntoIterator<Item = (alloc::vec::Vec<u8>, TupleId)>,
    {
        Self::check_page_size(&pool)?;
        if pool.page_count() != 0 {
            return Err(ColaError::NotEmpty);
        }
        let blkno = pool.allocate();
        if blkno != META_BLOCK {
            return Err(ColaError::Geometry);
        }
        let mut page = PageBuf::empty(pool.page_size());
        meta::init_meta_page(&mut page);
        pool.write_page(META_BLOCK, &page)?;

        let index = Self { pool, comparator, write_lock: Mutex::new(()) };
        let mut stats = BuildStats::default();
        for (key, tid) in heap {
            stats.heap_tuples += 1;
            if index.insert(&key, tid)? {
                stats.index_tuples += 1;
            }
        }
        Ok((index, stats))
    }

    /// Open an existing index, verifying the meta page.
    pub fn open(pool: Arc<BufferPool>, comparator: ComparatorRef) -> ColaResult<Self> {
        Self::check_page_size(&pool)?;
        meta::load_matrix(&pool)?;
        Ok(Self { pool, comparator, write_lock: Mutex::new(()) })
    }

    /// Insert one row. Returns `Ok(false)` when the tuple could not be
    /// placed even after merging; the index stays consistent, the row is
    /// simply not indexed (and the condition is logged).
    pub fn insert(&self, key: &[u8], heap_tid: TupleId) -> ColaResult<bool> {
        if heap_tid.offset == RLP_OFFSET {
            return Err(ColaError::BadTupleId);
        }
        let tuple = IndexTuple::new(key, heap_tid);
        let usable = self.pool.page_size() - PAGE_HEADER_SIZE - PAGE_TRAILER_SIZE;
        let needed = cola_utils::align_up(tuple.encoded_len(), cola_store::ITEM_ALIGN)
            + cola_store::LINE_PTR_SIZE
            + RLP_PAGE_RESERVE;
        if needed > usable {
            return Err(ColaError::KeyTooLarge);
        }

        let _writer = self.write_lock.lock();
        let mut st = InsertState::load(self)?;
        self.do_insert(&mut st, &tuple)
    }

    /// Release a scan's resources. Present for symmetry with the host's
    /// entry points; dropping the state does the same.
    pub fn end_scan(&self, scan: ScanState) {
        drop(scan);
    }

    /// Building an empty index is a no-op beyond the meta page.
    pub fn build_empty(&self) -> ColaResult<()> {
        Ok(())
    }

    /// Index-only scans are not supported, so nothing can be returned.
    #[must_use]
    pub fn can_return(&self) -> bool {
        false
    }

    pub fn bulk_delete(&self) -> ColaResult<()> {
        Err(ColaError::Unsupported)
    }

    pub fn vacuum_cleanup(&self) -> ColaResult<()> {
        Err(ColaError::Unsupported)
    }

    pub fn mark_pos(&self, _scan: &mut ScanState) -> ColaResult<()> {
        Err(ColaError::Unsupported)
    }

    pub fn restore_pos(&self, _scan: &mut ScanState) -> ColaResult<()> {
        Err(ColaError::Unsupported)
    }

    pub fn options(&self) -> ColaResult<()> {
        Err(ColaError::Unsupported)
    }

    pub fn cost_estimate(&self) -> ColaResult<()> {
        Err(ColaError::Unsupported)
    }

    /// The pool this index lives in.
    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn comparator(&self) -> ComparatorRef {
        self.comparator.clone()
    }

    pub(crate) fn comparator_dyn(&self) -> &dyn KeyComparator {
        &*self.comparator
    }

    /// Three-way key comparison through the operator-class procedure.
    pub(crate) fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.comparator.compare(a, b)
    }
}
