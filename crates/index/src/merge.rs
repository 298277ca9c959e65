//! Merge engine: the cascading merge-down and the look-ahead link-up.
//!
//! A merge drains the two visible arrays of a level into one empty array a
//! level deeper. Level 0 is unordered and goes through the sorter; every
//! deeper merge is a two-way sorted merge over cells. A destination that
//! already carried look-ahead pointers has them drained first and woven
//! back into the output in key order, so linkage to the level below the
//! destination survives the rebuild.
//!
//! The merge that opens a brand-new level records one pointer per
//! destination page; `link_up` then installs those pointers into a drained
//! array one level up and makes it visible, which is what lets scans narrow
//! their block window on the way down.

use alloc::vec::Vec;
use core::cmp::Ordering;

use cola_store::{BlockNumber, PageBuf, PageFlags};

use crate::MAX_HEIGHT;
use crate::am::ColaIndex;
use crate::error::{ColaError, ColaResult};
use crate::geometry::{arrays_per_level, block_of, cells_per_array};
use crate::insert::{InsertState, page_add_tuple};
use crate::sort::Spool;
use crate::state::{ArrayFlags, ArrayState};
use crate::tuple::{IndexTuple, RLP_OFFSET, TupleId};

/// Drop every item of a page, keeping the page allocated so block numbers
/// stay stable. Concurrent readers of the page observe it empty.
pub(crate) fn clear_page(index: &ColaIndex, blkno: BlockNumber) -> ColaResult<()> {
    let mut page = index.pool().read_page(blkno)?;
    page.clear();
    index.pool().write_page(blkno, &page)?;
    Ok(())
}

/// Read the look-ahead pointers out of a LINKED destination, clearing each
/// drained page. For a level-1 destination the pointers go straight into
/// the sorter alongside the level-0 tuples; deeper destinations collect
/// them into the insert state for re-integration by the sorted merge.
fn drain_old_rlps(
    index: &ColaIndex,
    st: &mut InsertState,
    slot: ArrayState,
    mut spool: Option<&mut Spool>,
) -> ColaResult<usize> {
    let level = slot.level();
    let max_cell = cells_per_array(level);
    let mut count = 0;
    let mut cell = 0;

    loop {
        let blkno = block_of(level, slot.arrnum(), cell)?;
        let page = index.pool().read_page(blkno)?;
        let item_count = page.item_count();
        for (_, item) in page.items() {
            let Some(tuple) = IndexTuple::decode(item) else {
                continue;
            };
            count += 1;
            match spool.as_deref_mut() {
                Some(sp) => sp.spool_tuple(tuple),
                None => st.old_rlps.push(IndexTuple {
                    tid: TupleId::new(tuple.tid.block, RLP_OFFSET),
                    key: tuple.key,
                }),
            }
        }
        clear_page(index, blkno)?;
        cell += 1;
        if item_count == 0 || cell >= max_cell {
            break;
        }
    }
    Ok(count)
}

/// Make sure the third array of a level has its pages allocated before the
/// level is merged down, preserving block-number monotonicity for every
/// array allocated afterwards.
fn complete_level(index: &ColaIndex, st: &mut InsertState, level: usize) -> ColaResult<()> {
    let mut third = st.matrix.get(level, 2);
    if !third.contains(ArrayFlags::EXISTS) {
        for cell in 0..cells_per_array(level) {
            let blkno = index.pool().allocate();
            if blkno != block_of(level, 2, cell)? {
                return Err(ColaError::Geometry);
            }
            let mut page = PageBuf::empty(index.pool().page_size());
            page.init(PageFlags::empty());
            index.pool().write_page(blkno, &page)?;
        }
    }
    third.insert(ArrayFlags::EXISTS);
    st.matrix.store(third);
    st.checkpoint(index)
}

/// Writes merge output into a destination array cell by cell.
///
/// A fresh destination (EXISTS not yet set) allocates pages as it advances;
/// `finish` then allocates whatever cells were never reached, so the array
/// always ends up with its full complement of pages.
struct DestWriter<'a> {
    index: &'a ColaIndex,
    level: usize,
    arrnum: usize,
    cell: usize,
    max_cell: usize,
    blkno: BlockNumber,
    page: PageBuf,
    fresh: bool,
    capture_rlps: bool,
    new_rlps: Vec<IndexTuple>,
}

impl<'a> DestWriter<'a> {
    fn new(
        index: &'a ColaIndex,
        slot: ArrayState,
        fresh: bool,
        capture_rlps: bool,
    ) -> ColaResult<Self> {
        let level = slot.level();
        let arrnum = slot.arrnum();
        let (blkno, page) = Self::open_cell(index, level, arrnum, 0, fresh)?;
        Ok(Self {
            index,
            level,
            arrnum,
            cell: 0,
            max_cell: cells_per_array(level),
            blkno,
            page,
            fresh,
            capture_rlps,
            new_rlps: Vec::new(),
        })
    }

    fn open_cell(
        index: &ColaIndex,
        level: usize,
        arrnum: usize,
        cell: usize,
        fresh: bool,
    ) -> ColaResult<(BlockNumber, PageBuf)> {
        let expected = block_of(level, arrnum, cell)?;
        if fresh {
            let blkno = index.pool().allocate();
            if blkno != expected {
                return Err(ColaError::Geometry);
            }
            let mut page = PageBuf::empty(index.pool().page_size());
            page.init(PageFlags::empty());
            Ok((blkno, page))
        } else {
            Ok((expected, index.pool().read_page(expected)?))
        }
    }

    fn push(&mut self, tuple: &IndexTuple) -> ColaResult<()> {
        loop {
            if let Some(offnum) = page_add_tuple(&mut self.page, tuple, self.level) {
                if offnum == 1 && self.capture_rlps {
                    // first tuple of a destination page seeds its pointer
                    self.new_rlps.push(tuple.as_rlp(self.blkno));
                }
                return Ok(());
            }
            self.index.pool().write_page(self.blkno, &self.page)?;
            self.cell += 1;
            if self.cell >= self.max_cell {
                return Err(ColaError::Capacity);
            }
            let (blkno, page) =
                Self::open_cell(self.index, self.level, self.arrnum, self.cell, self.fresh)?;
            self.blkno = blkno;
            self.page = page;
        }
    }

    fn finish(self) -> ColaResult<Vec<IndexTuple>> {
        self.index.pool().write_page(self.blkno, &self.page)?;
        if self.fresh {
            for cell in self.cell + 1..self.max_cell {
                let blkno = self.index.pool().allocate();
                if blkno != block_of(self.level, self.arrnum, cell)? {
                    return Err(ColaError::Geometry);
                }
                let mut page = PageBuf::empty(self.index.pool().page_size());
                page.init(PageFlags::empty());
                self.index.pool().write_page(blkno, &page)?;
            }
        }
        Ok(self.new_rlps)
    }
}

/// Walks the user tuples of a source array in order, skipping look-ahead
/// pointers (they die with their array) and clearing each consumed page.
struct SourceCursor<'a> {
    index: &'a ColaIndex,
    level: usize,
    arrnum: usize,
    cell: usize,
    max_cell: usize,
    blkno: BlockNumber,
    page: PageBuf,
    next_off: u16,
    head: Option<IndexTuple>,
}

impl<'a> SourceCursor<'a> {
    fn new(index: &'a ColaIndex, slot: ArrayState) -> ColaResult<Self> {
        let level = slot.level();
        let arrnum = slot.arrnum();
        let blkno = block_of(level, arrnum, 0)?;
        let page = index.pool().read_page(blkno)?;
        let mut cursor = Self {
            index,
            level,
            arrnum,
            cell: 0,
            max_cell: cells_per_array(level),
            blkno,
            page,
            next_off: 1,
            head: None,
        };
        cursor.fill_head()?;
        Ok(cursor)
    }

    fn peek(&self) -> Option<&IndexTuple> {
        self.head.as_ref()
    }

    fn advance(&mut self) -> ColaResult<()> {
        self.fill_head()
    }

    fn fill_head(&mut self) -> ColaResult<()> {
        loop {
            while self.next_off <= self.page.item_count() {
                let item = self.page.item(self.next_off);
                self.next_off += 1;
                if let Some(tuple) = item.and_then(IndexTuple::decode) {
                    if !tuple.is_rlp() {
                        self.head = Some(tuple);
                        return Ok(());
                    }
                }
            }
            // page consumed: clear it and move on (an empty cell is legal)
            clear_page(self.index, self.blkno)?;
            self.cell += 1;
            if self.cell >= self.max_cell {
                self.head = None;
                return Ok(());
            }
            self.blkno = block_of(self.level, self.arrnum, self.cell)?;
            self.page = self.index.pool().read_page(self.blkno)?;
            self.next_off = 1;
        }
    }
}

/// Emit one element from `cursor`, letting the next pending old pointer cut
/// in when it orders strictly before the cursor head. Ties go to the
/// source tuple.
fn emit_from(
    index: &ColaIndex,
    st: &mut InsertState,
    writer: &mut DestWriter<'_>,
    cursor: &mut SourceCursor<'_>,
) -> ColaResult<()> {
    let emit_rlp = match (cursor.peek(), st.old_rlps.get(st.next_old_rlp)) {
        (Some(head), Some(rlp)) => index.compare(&head.key, &rlp.key) == Ordering::Greater,
        _ => false,
    };
    if emit_rlp {
        writer.push(&st.old_rlps[st.next_old_rlp])?;
        st.next_old_rlp += 1;
    } else if let Some(head) = cursor.peek() {
        writer.push(head)?;
        cursor.advance()?;
    }
    Ok(())
}

/// Merge the two full level-0 pages into a level-1 array through the
/// sorter. Returns `Ok(false)` when level 1 cannot take another run, which
/// sends the caller into the cascade.
pub(crate) fn merge_zero_to_one(index: &ColaIndex, st: &mut InsertState) -> ColaResult<bool> {
    st.reload(index)?;

    if !st.matrix.level_is_safe(1) {
        return Ok(false);
    }
    let mut dest = st.matrix.find_array(1);
    if !dest.is_valid() {
        return Ok(false);
    }
    let fresh = !dest.contains(ArrayFlags::EXISTS);

    let mut src_a = st.matrix.get(0, 0);
    let mut src_b = st.matrix.get(0, 1);
    src_a.insert(ArrayFlags::MERGE);
    src_b.insert(ArrayFlags::MERGE);
    dest.insert(ArrayFlags::MERGE);
    st.matrix.store(src_a);
    st.matrix.store(src_b);
    st.matrix.store(dest);
    st.checkpoint(index)?;

    let mut spool = Spool::new(index.comparator());
    spool.add_page(index.pool(), block_of(0, 0, 0)?)?;
    spool.add_page(index.pool(), block_of(0, 1, 0)?)?;

    let mut relinked = false;
    if dest.contains(ArrayFlags::LINKED) {
        relinked = drain_old_rlps(index, st, dest, Some(&mut spool))? > 0;
        dest.remove(ArrayFlags::LINKED);
        st.matrix.store(dest);
        st.checkpoint(index)?;
    }

    spool.perform_sort();
    log::debug!("cola: merging {} spooled tuples from level 0 into {:?}", spool.len(), dest);

    let mut writer = DestWriter::new(index, dest, fresh, false)?;
    for tuple in spool.drain() {
        writer.push(&tuple)?;
    }
    writer.finish()?;

    clear_page(index, block_of(0, 0, 0)?)?;
    clear_page(index, block_of(0, 1, 0)?)?;

    dest.insert(ArrayFlags::FULL | ArrayFlags::VISIBLE | ArrayFlags::EXISTS);
    dest.remove(ArrayFlags::MERGE);
    if relinked {
        dest.insert(ArrayFlags::LINKED);
    }
    src_a.remove(ArrayFlags::FULL | ArrayFlags::MERGE);
    src_b.remove(ArrayFlags::FULL | ArrayFlags::MERGE);
    st.matrix.store(dest);
    st.matrix.store(src_a);
    st.matrix.store(src_b);
    st.checkpoint(index)?;
    Ok(true)
}

/// Merge the two visible arrays at `level_from` into the free array one
/// level deeper.
fn merge_down(index: &ColaIndex, st: &mut InsertState, level_from: usize) -> ColaResult<()> {
    let level_to = level_from + 1;
    if level_to >= MAX_HEIGHT {
        return Err(ColaError::Capacity);
    }

    complete_level(index, st, level_from)?;

    let mut dest = st.matrix.find_array(level_to);
    if !dest.is_valid() {
        return Err(ColaError::NoFreeArray);
    }
    let fresh = !dest.contains(ArrayFlags::EXISTS);

    st.old_rlps.clear();
    st.next_old_rlp = 0;
    if dest.contains(ArrayFlags::LINKED) {
        drain_old_rlps(index, st, dest, None)?;
        dest.remove(ArrayFlags::LINKED);
        st.matrix.store(dest);
        st.checkpoint(index)?;
    }

    // the two visible arrays at this level are the sources
    let mut sources = [ArrayState::INVALID; 2];
    let mut found = 0;
    for arrnum in 0..arrays_per_level(level_from) {
        let s = st.matrix.get(level_from, arrnum);
        if s.contains(ArrayFlags::VISIBLE) && found < 2 {
            sources[found] = s;
            found += 1;
        }
    }
    if found != 2 {
        return Err(ColaError::Geometry);
    }
    let [mut src_a, mut src_b] = sources;

    src_a.insert(ArrayFlags::MERGE);
    src_b.insert(ArrayFlags::MERGE);
    dest.insert(ArrayFlags::MERGE);
    st.matrix.store(src_a);
    st.matrix.store(src_b);
    st.matrix.store(dest);
    st.checkpoint(index)?;

    log::debug!(
        "cola: merging level {} arrays {} and {} into {:?}",
        level_from,
        src_a.arrnum(),
        src_b.arrnum(),
        dest
    );

    let mut cur_a = SourceCursor::new(index, src_a)?;
    let mut cur_b = SourceCursor::new(index, src_b)?;
    let mut writer = DestWriter::new(index, dest, fresh, st.last_merge)?;

    loop {
        let pick_b = match (cur_a.peek(), cur_b.peek()) {
            (Some(a), Some(b)) => index.compare(&a.key, &b.key) == Ordering::Greater,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (None, None) => break,
        };
        if pick_b {
            emit_from(index, st, &mut writer, &mut cur_b)?;
        } else {
            emit_from(index, st, &mut writer, &mut cur_a)?;
        }
    }

    // pointers past both sources go in at the tail, already in key order
    while st.next_old_rlp < st.old_rlps.len() {
        writer.push(&st.old_rlps[st.next_old_rlp])?;
        st.next_old_rlp += 1;
    }

    let new_rlps = writer.finish()?;
    if st.last_merge {
        st.new_rlps = new_rlps;
    }

    src_a.remove(ArrayFlags::FULL | ArrayFlags::VISIBLE | ArrayFlags::MERGE);
    src_b.remove(ArrayFlags::FULL | ArrayFlags::VISIBLE | ArrayFlags::MERGE);
    dest.insert(ArrayFlags::FULL | ArrayFlags::VISIBLE | ArrayFlags::EXISTS);
    dest.remove(ArrayFlags::MERGE);
    if !st.old_rlps.is_empty() {
        dest.insert(ArrayFlags::LINKED);
    }
    st.matrix.store(src_a);
    st.matrix.store(src_b);
    st.matrix.store(dest);
    st.checkpoint(index)?;
    Ok(())
}

/// Merge levels downward until level 1 is safe again. The merge that lands
/// in an empty level captures look-ahead pointers, installed by `link_up`
/// once the cascade settles.
pub(crate) fn cascade_merge(index: &ColaIndex, st: &mut InsertState) -> ColaResult<bool> {
    let mut merged = false;
    let mut level_from = 1;

    while level_from < MAX_HEIGHT && !st.matrix.level_is_safe(level_from) {
        let level_to = level_from + 1;
        st.last_merge = level_to < MAX_HEIGHT && st.matrix.level_is_empty(level_to);
        if st.last_merge {
            st.new_rlps = Vec::with_capacity(cells_per_array(level_to));
        }
        merge_down(index, st, level_from)?;
        merged = true;
        level_from += 1;
    }

    if !st.new_rlps.is_empty() {
        st.last_merge = false;
        link_up(index, st, level_from)?;
    }
    st.last_merge = false;
    Ok(merged)
}

/// Install the pointers captured by the last merge into the drained array
/// one level above the new destination, then make it visible. The array
/// holds nothing but pointers, which is exactly the transient shape the
/// scan's LINKED-not-FULL handling reads.
fn link_up(index: &ColaIndex, st: &mut InsertState, level_link_from: usize) -> ColaResult<()> {
    if level_link_from == 0 {
        return Err(ColaError::Geometry);
    }
    let level_to = level_link_from - 1;

    let mut target = ArrayState::INVALID;
    for arrnum in 0..arrays_per_level(level_to) {
        let s = st.matrix.get(level_to, arrnum);
        if s.contains(ArrayFlags::EXISTS) && !s.contains(ArrayFlags::VISIBLE) {
            target = s;
        }
    }
    if !target.is_valid() {
        return Err(ColaError::Geometry);
    }

    let max_cell = cells_per_array(level_to);
    let mut cell = 0;
    let mut blkno = block_of(level_to, target.arrnum(), cell)?;
    let mut page = index.pool().read_page(blkno)?;
    let rlps = core::mem::take(&mut st.new_rlps);
    log::debug!(
        "cola: linking {} pointers into level {} array {}",
        rlps.len(),
        level_to,
        target.arrnum()
    );

    for rlp in &rlps {
        loop {
            if page_add_tuple(&mut page, rlp, level_to).is_some() {
                break;
            }
            index.pool().write_page(blkno, &page)?;
            cell += 1;
            if cell >= max_cell {
                return Err(ColaError::Capacity);
            }
            blkno = block_of(level_to, target.arrnum(), cell)?;
            page = index.pool().read_page(blkno)?;
        }
    }
    index.pool().write_page(blkno, &page)?;

    target.insert(ArrayFlags::VISIBLE | ArrayFlags::LINKED);
    st.matrix.store(target);
    st.checkpoint(index)
}
