//! Sorter bridge for the level-0 merge.
//!
//! Level-0 pages are unordered, so the 0-to-1 merge spools both of them
//! (plus any look-ahead pointers drained from the destination) and writes
//! the sorted result out. Nothing else in the engine sorts; the deeper
//! merges rely on their inputs already being ordered.

use alloc::vec::Vec;

use cola_store::{BlockNumber, BufferPool};

use crate::error::ColaResult;
use crate::tuple::{ComparatorRef, IndexTuple};

/// A spool of tuples awaiting one sort.
pub struct Spool {
    tuples: Vec<IndexTuple>,
    comparator: ComparatorRef,
}

impl Spool {
    #[must_use]
    pub fn new(comparator: ComparatorRef) -> Self {
        Self { tuples: Vec::new(), comparator }
    }

    pub fn spool_tuple(&mut self, tuple: IndexTuple) {
        self.tuples.push(tuple);
    }

    /// Spool every item of a page.
    pub fn add_page(&mut self, pool: &BufferPool, blkno: BlockNumber) -> ColaResult<()> {
        let page = pool.read_page(blkno)?;
        for (_, item) in page.items() {
            if let Some(tuple) = IndexTuple::decode(item) {
                self.tuples.push(tuple);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Sort by key. The sort is stable, so equal keys keep spool order.
    pub fn perform_sort(&mut self) {
        let comparator = self.comparator.clone();
        self.tuples.sort_by(move |a, b| comparator.compare(&a.key, &b.key));
    }

    /// Consume the spool in its current order.
    pub fn drain(&mut self) -> impl Iterator<Item = IndexTuple> + '_ {
        self.tuples.drain(..)
    }
}
