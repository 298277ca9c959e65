//! Insert engine.
//!
//! New tuples always land on level 0. A level-0 page that refuses the tuple
//! marks its array FULL and the other array is tried; when both refuse, the
//! merge engine frees level 0 (cascading deeper if level 1 itself is
//! unsafe) and the insert is retried once.

use alloc::vec::Vec;

use cola_store::{LINE_PTR_SIZE, PageBuf, PageFlags};

use crate::am::ColaIndex;
use crate::error::{ColaError, ColaResult};
use crate::geometry::block_of;
use crate::merge;
use crate::meta;
use crate::state::{ArrayFlags, StateMatrix};
use crate::tuple::{IndexTuple, SIZE_OF_RLP};

/// Free space kept back on every level-0 page so that two look-ahead
/// pointers can always be appended later, even when the page is otherwise
/// full of user tuples.
pub(crate) const RLP_PAGE_RESERVE: usize = 2 * (SIZE_OF_RLP + LINE_PTR_SIZE);

/// Space reservation for a page at `level`.
pub(crate) fn reserve_for_level(level: usize) -> usize {
    if level == 0 { RLP_PAGE_RESERVE } else { 0 }
}

/// Append a tuple to a page under the placement policy of `level`.
pub(crate) fn page_add_tuple(page: &mut PageBuf, tuple: &IndexTuple, level: usize) -> Option<u16> {
    page.add_item(&tuple.encoded(), reserve_for_level(level))
}

/// Transient state of one insert, including the merge buffers the cascade
/// hands from level to level. The state matrix copy inside is authoritative
/// only between checkpoints; everything else dies with the call.
pub(crate) struct InsertState {
    pub(crate) matrix: StateMatrix,
    /// Set while the cascade performs the merge that opens a new level;
    /// makes the destination writer capture a pointer per page.
    pub(crate) last_merge: bool,
    /// Pointers captured by the last merge, awaiting link-up.
    pub(crate) new_rlps: Vec<IndexTuple>,
    /// Pointers drained from a merge destination, to be re-integrated.
    pub(crate) old_rlps: Vec<IndexTuple>,
    pub(crate) next_old_rlp: usize,
}

impl InsertState {
    pub(crate) fn load(index: &ColaIndex) -> ColaResult<Self> {
        Ok(Self {
            matrix: meta::load_matrix(index.pool())?,
            last_merge: false,
            new_rlps: Vec::new(),
            old_rlps: Vec::new(),
            next_old_rlp: 0,
        })
    }

    /// Re-read the matrix from the meta page. Called before a merge decides
    /// anything, matching the insert path's view to the committed state.
    pub(crate) fn reload(&mut self, index: &ColaIndex) -> ColaResult<()> {
        self.matrix = meta::load_matrix(index.pool())?;
        Ok(())
    }

    /// Publish the matrix on the meta page.
    pub(crate) fn checkpoint(&self, index: &ColaIndex) -> ColaResult<()> {
        meta::save_matrix(index.pool(), &self.matrix)
    }
}

impl ColaIndex {
    /// Try to place a tuple on level 0. Returns `Ok(false)` when both
    /// level-0 arrays are full, which is the caller's cue to merge.
    pub(crate) fn try_insert_level0(
        &self,
        st: &mut InsertState,
        tuple: &IndexTuple,
    ) -> ColaResult<bool> {
        loop {
            let mut slot = st.matrix.find_array(0);
            if !slot.is_valid() {
                return Ok(false);
            }

            let blkno = block_of(0, slot.arrnum(), 0)?;
            let mut page = if slot.contains(ArrayFlags::EXISTS) {
                self.pool().read_page(blkno)?
            } else {
                let allocated = self.pool().allocate();
                if allocated != blkno {
                    return Err(ColaError::Geometry);
                }
                let mut page = PageBuf::empty(self.pool().page_size());
                page.init(PageFlags::empty());
                page
            };

            if page_add_tuple(&mut page, tuple, 0).is_some() {
                self.pool().write_page(blkno, &page)?;
                if !slot.contains(ArrayFlags::EXISTS) || !slot.contains(ArrayFlags::VISIBLE) {
                    slot.insert(ArrayFlags::EXISTS | ArrayFlags::VISIBLE);
                    st.matrix.store(slot);
                    st.checkpoint(self)?;
                }
                return Ok(true);
            }

            if page.item_count() == 0 {
                // an empty page refused the tuple: no amount of merging helps
                return Err(ColaError::KeyTooLarge);
            }

            // page full: commit the FULL mark and try the other array
            slot.insert(ArrayFlags::FULL);
            st.matrix.store(slot);
            st.checkpoint(self)?;
        }
    }

    /// The COLA insertion loop.
    pub(crate) fn do_insert(&self, st: &mut InsertState, tuple: &IndexTuple) -> ColaResult<bool> {
        if self.try_insert_level0(st, tuple)? {
            return Ok(true);
        }

        if !merge::merge_zero_to_one(self, st)? {
            if !merge::cascade_merge(self, st)? {
                log::warn!("cola: cascade merge could not free level 0");
                return Ok(false);
            }
            if !merge::merge_zero_to_one(self, st)? {
                log::warn!("cola: level-0 merge failed after cascade");
                return Ok(false);
            }
        }

        if !self.try_insert_level0(st, tuple)? {
            log::warn!("cola: level-0 insert failed after merge; tuple not indexed");
            return Ok(false);
        }
        Ok(true)
    }
}
