//! Scan engine.
//!
//! A scan snapshots the state matrix and walks the visible arrays from
//! level 0 downward, arrays of one level in array order. While a LINKED
//! array is read, every look-ahead pointer that fails the scan keys tells
//! us something about the next level: a pointer past the upper bound caps
//! the block window, one below the lower bound raises its start. When the
//! scan descends, the accumulated window replaces a full sweep of the
//! deeper array's cells.

use alloc::vec::Vec;

use cola_store::BlockNumber;
use cola_utils::HashSet;

use crate::MAX_HEIGHT;
use crate::am::ColaIndex;
use crate::error::{ColaError, ColaResult};
use crate::geometry::{arrays_per_level, block_of, cells_per_array};
use crate::state::{ArrayFlags, ArrayState, StateMatrix};
use crate::tuple::{IndexTuple, KeyComparator, TupleId};

/// Comparison operator of one scan key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    Less,
    LessEqual,
    Equal,
    GreaterEqual,
    Greater,
}

impl Strategy {
    /// Whether `tuple_key <op> argument` holds, given the three-way
    /// comparison of tuple key against argument.
    #[must_use]
    pub fn satisfied_by(self, cmp: core::cmp::Ordering) -> bool {
        use core::cmp::Ordering::{Equal, Greater, Less};
        match self {
            Strategy::Less => cmp == Less,
            Strategy::LessEqual => cmp != Greater,
            Strategy::Equal => cmp == Equal,
            Strategy::GreaterEqual => cmp != Less,
            Strategy::Greater => cmp == Greater,
        }
    }

    fn is_upper_bound(self) -> bool {
        matches!(self, Strategy::Less | Strategy::LessEqual)
    }

    fn is_lower_bound(self) -> bool {
        matches!(self, Strategy::Greater | Strategy::GreaterEqual)
    }
}

/// One predicate over the indexed attribute.
#[derive(Clone, Debug)]
pub struct ScanKey {
    pub strategy: Strategy,
    pub argument: Vec<u8>,
}

impl ScanKey {
    #[must_use]
    pub fn new(strategy: Strategy, argument: &[u8]) -> Self {
        Self { strategy, argument: argument.to_vec() }
    }
}

/// Direction requested by the caller; only forward scans are supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanDirection {
    Forward,
    Backward,
}

/// Counters exposed for instrumentation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScanStats {
    /// Scans started through the pull interface.
    pub index_scans: u64,
    /// Pages fetched by the page-scan step.
    pub pages_scanned: u64,
}

/// Set of heap tuple identifiers produced by a bitmap scan.
#[derive(Default)]
pub struct TidBitmap {
    tids: HashSet<TupleId>,
}

impl TidBitmap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a TID; returns false if it was already present.
    pub fn add(&mut self, tid: TupleId) -> bool {
        self.tids.insert(tid)
    }

    #[must_use]
    pub fn contains(&self, tid: TupleId) -> bool {
        self.tids.contains(&tid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TupleId> + '_ {
        self.tids.iter()
    }
}

/// Per-scan state: the matrix snapshot, the traversal position, and the
/// block-window bookkeeping fed by look-ahead pointers.
pub struct ScanState {
    pub(crate) keys: Vec<ScanKey>,
    pub(crate) matrix: StateMatrix,
    pub(crate) cur_state: ArrayState,
    pub(crate) cur_blkno: BlockNumber,
    pub(crate) max_blkno: BlockNumber,
    pub(crate) search_from: BlockNumber,
    pub(crate) search_to: BlockNumber,
    /// Window for the next level, deduced from pointers at this one.
    pub(crate) rlp_from: BlockNumber,
    pub(crate) rlp_to: BlockNumber,
    pub(crate) continue_array_scan: bool,
    pub(crate) first_call: bool,
    pub(crate) matches: Vec<TupleId>,
    pub(crate) next_match: usize,
    pub stats: ScanStats,
}

impl ScanState {
    pub(crate) fn new(keys: Vec<ScanKey>, matrix: StateMatrix) -> Self {
        Self {
            keys,
            matrix,
            cur_state: ArrayState::INVALID,
            cur_blkno: 0,
            max_blkno: 0,
            search_from: 0,
            search_to: 0,
            rlp_from: 0,
            rlp_to: 0,
            continue_array_scan: true,
            first_call: true,
            matches: Vec::new(),
            next_match: 0,
            stats: ScanStats::default(),
        }
    }

    /// Point the scan at the first level-0 array (or nowhere, for an index
    /// that has never been inserted into).
    pub(crate) fn position_at_start(&mut self) -> ColaResult<()> {
        self.matches.clear();
        self.next_match = 0;
        self.rlp_from = 0;
        self.rlp_to = 0;
        self.continue_array_scan = true;

        let first = self.matrix.get(0, 0);
        if first.contains(ArrayFlags::VISIBLE) {
            self.cur_state = first;
            self.cur_blkno = block_of(0, 0, 0)?;
        } else {
            self.cur_state = ArrayState::INVALID;
            self.cur_blkno = 0;
        }
        self.max_blkno = self.cur_blkno;
        self.search_from = self.cur_blkno;
        self.search_to = self.cur_blkno;
        Ok(())
    }

    /// Run the scan keys against a tuple. A failing `<`/`<=` key means no
    /// later tuple of a sorted array can match either, so it also stops the
    /// array scan.
    pub(crate) fn check_keys(&mut self, comparator: &dyn KeyComparator, tuple: &IndexTuple) -> bool {
        for key in &self.keys {
            let cmp = comparator.compare(&tuple.key, &key.argument);
            if !key.strategy.satisfied_by(cmp) {
                if key.strategy.is_upper_bound() {
                    self.continue_array_scan = false;
                }
                return false;
            }
        }
        true
    }

    /// Fold one look-ahead pointer into the next-level window. Each key
    /// narrows the side it bounds; an equality key narrows whichever side
    /// the pointer falls on, and leaves an exactly-equal pointer alone so
    /// the next level can be explored around it.
    pub(crate) fn apply_rlp(&mut self, comparator: &dyn KeyComparator, rlp: &IndexTuple) {
        let block = rlp.tid.block;
        for key in &self.keys {
            let cmp = comparator.compare(&rlp.key, &key.argument);
            if key.strategy.is_upper_bound() {
                if !key.strategy.satisfied_by(cmp) {
                    self.rlp_to = block;
                    self.continue_array_scan = false;
                }
            } else if key.strategy.is_lower_bound() {
                if !key.strategy.satisfied_by(cmp) {
                    self.rlp_from = block;
                }
            } else {
                match cmp {
                    core::cmp::Ordering::Greater => self.rlp_to = block,
                    core::cmp::Ordering::Less => self.rlp_from = block,
                    core::cmp::Ordering::Equal => {}
                }
            }
        }
    }

    /// Move to the next array in traversal order: the rest of the current
    /// level first (visible arrays preferred, then a linked array still
    /// under construction), then the first visible array of a deeper
    /// level. Descending adopts the pointer-derived window.
    pub(crate) fn next_array(&mut self) -> ColaResult<ArrayState> {
        if !self.cur_state.is_valid() {
            return Ok(self.cur_state);
        }
        let cur_level = self.cur_state.level();
        let mut chosen = ArrayState::INVALID;

        for arrnum in self.cur_state.arrnum() + 1..arrays_per_level(cur_level) {
            let s = self.matrix.get(cur_level, arrnum);
            if s.contains(ArrayFlags::VISIBLE) {
                chosen = s;
                break;
            }
        }
        if !chosen.is_valid() {
            for arrnum in self.cur_state.arrnum() + 1..arrays_per_level(cur_level) {
                let s = self.matrix.get(cur_level, arrnum);
                if s.contains(ArrayFlags::EXISTS | ArrayFlags::LINKED)
                    && !s.contains(ArrayFlags::VISIBLE)
                {
                    chosen = s;
                    break;
                }
            }
        }

        let mut level = cur_level;
        while !chosen.is_valid() && level < MAX_HEIGHT - 1 {
            level += 1;
            for arrnum in 0..arrays_per_level(level) {
                let s = self.matrix.get(level, arrnum);
                if s.contains(ArrayFlags::VISIBLE) && !s.contains(ArrayFlags::EXISTS) {
                    return Err(ColaError::Geometry);
                }
                if s.contains(ArrayFlags::VISIBLE) {
                    chosen = s;
                    break;
                }
            }
        }

        let descended = chosen.is_valid() && chosen.level() > cur_level;
        self.cur_state = chosen;
        self.continue_array_scan = true;
        if !chosen.is_valid() {
            return Ok(chosen);
        }

        let level = chosen.level();
        let arrnum = chosen.arrnum();
        self.cur_blkno = block_of(level, arrnum, 0)?;
        self.max_blkno = block_of(level, arrnum, cells_per_array(level) - 1)?;
        self.search_from = self.cur_blkno;
        self.search_to = self.max_blkno;

        if descended {
            if self.rlp_from != 0 {
                self.search_from = self.rlp_from.max(self.cur_blkno);
                self.cur_blkno = self.search_from;
            }
            if self.rlp_to != 0 {
                self.search_to = self.rlp_to.min(self.max_blkno);
            }
            self.rlp_from = 0;
            self.rlp_to = 0;
        }
        Ok(chosen)
    }
}

impl ColaIndex {
    /// Start a scan over the matrix as of this moment.
    pub fn begin_scan(&self, keys: Vec<ScanKey>) -> ColaResult<ScanState> {
        let matrix = crate::meta::load_matrix(self.pool())?;
        let mut scan = ScanState::new(keys, matrix);
        scan.position_at_start()?;
        scan.first_call = true;
        Ok(scan)
    }

    /// Restart a scan with new keys. The traversal is fully reset, so a
    /// rescan followed by a drain always reproduces the same result set.
    pub fn rescan(&self, scan: &mut ScanState, keys: Vec<ScanKey>) -> ColaResult<()> {
        scan.keys = keys;
        scan.position_at_start()?;
        scan.first_call = true;
        Ok(())
    }

    /// Pull the next matching heap TID, forward direction only.
    pub fn get_tuple(
        &self,
        scan: &mut ScanState,
        direction: ScanDirection,
    ) -> ColaResult<Option<TupleId>> {
        if direction != ScanDirection::Forward {
            return Err(ColaError::Unsupported);
        }
        if scan.first_call {
            scan.stats.index_scans += 1;
            scan.first_call = false;
            scan.position_at_start()?;
        }
        loop {
            if scan.next_match < scan.matches.len() {
                let tid = scan.matches[scan.next_match];
                scan.next_match += 1;
                return Ok(Some(tid));
            }
            if scan.cur_state.is_valid() {
                if scan.cur_blkno <= scan.search_to && scan.continue_array_scan {
                    self.scan_page(scan)?;
                    scan.cur_blkno += 1;
                } else {
                    scan.next_array()?;
                }
            }
            if !scan.cur_state.is_valid() && scan.next_match >= scan.matches.len() {
                return Ok(None);
            }
        }
    }

    /// Feed every match into a bitmap; returns the number of matches.
    pub fn get_bitmap(&self, scan: &mut ScanState, bitmap: &mut TidBitmap) -> ColaResult<u64> {
        let mut ntids = 0;
        scan.matches.clear();
        scan.next_match = 0;
        while scan.cur_state.is_valid() {
            while scan.cur_blkno <= scan.search_to && scan.continue_array_scan {
                self.scan_page(scan)?;
                ntids += scan.matches.len() as u64;
                for tid in scan.matches.drain(..) {
                    bitmap.add(tid);
                }
                scan.cur_blkno += 1;
            }
            scan.next_array()?;
        }
        Ok(ntids)
    }

    /// Check every item of the current block against the scan keys,
    /// routing look-ahead pointers into the window bookkeeping.
    fn scan_page(&self, scan: &mut ScanState) -> ColaResult<()> {
        let page = self.pool().read_page(scan.cur_blkno)?;
        scan.stats.pages_scanned += 1;
        scan.matches.clear();
        scan.next_match = 0;
        let comparator = self.comparator_dyn();

        for (_, item) in page.items() {
            let Some(tuple) = IndexTuple::decode(item) else {
                continue;
            };

            if scan.cur_state.contains(ArrayFlags::LINKED) && tuple.is_rlp() {
                scan.apply_rlp(comparator, &tuple);
                continue;
            }

            let matched = scan.check_keys(comparator, &tuple);
            if !matched && !scan.continue_array_scan {
                // a pointer-only array keeps going until it finds its upper
                // bound, and level 0 is unsorted so pruning never applies
                if scan.cur_state.contains(ArrayFlags::LINKED)
                    && !scan.cur_state.contains(ArrayFlags::FULL)
                    && scan.rlp_to == 0
                {
                    scan.continue_array_scan = true;
                }
                if scan.cur_state.level() == 0 {
                    scan.continue_array_scan = true;
                }
                if !scan.continue_array_scan {
                    break;
                }
            }
            if !matched {
                continue;
            }
            scan.matches.push(tuple.tid);
        }
        Ok(())
    }
}
