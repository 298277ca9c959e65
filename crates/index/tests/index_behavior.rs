//! End-to-end behavior of the index over a small page size.
//!
//! A 192-byte page holds five tuples on a level-0 page (after the
//! look-ahead reservation) and eight on deeper pages, so a handful of
//! inserts is enough to drive merges several levels down.

use std::collections::BTreeMap;
use std::sync::Arc;

use cola_index::geometry::{arrays_per_level, block_of, cells_per_array};
use cola_index::meta::load_matrix;
use cola_index::{
    ArrayFlags, ColaError, ColaIndex, IndexTuple, Int32Ord, MAX_HEIGHT, ScanDirection, ScanKey,
    ScanState, Strategy, TidBitmap, TupleId,
};
use cola_store::BufferPool;

const PAGE_SIZE: usize = 192;

fn key(v: i32) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

fn key_of(tuple: &IndexTuple) -> i32 {
    i32::from_le_bytes(tuple.key[..4].try_into().unwrap())
}

fn heap_tid(n: u32) -> TupleId {
    TupleId::new(1000 + n / 100, (1 + n % 100) as u16)
}

fn empty_index() -> ColaIndex {
    let pool = Arc::new(BufferPool::new(PAGE_SIZE).unwrap());
    let (index, _) = ColaIndex::build(pool, Arc::new(Int32Ord), std::iter::empty()).unwrap();
    index
}

/// Insert keys 1..=n, each under a distinct heap TID.
fn index_with_sequential(n: u32) -> ColaIndex {
    let index = empty_index();
    for i in 1..=n {
        assert!(index.insert(&key(i as i32), heap_tid(i)).unwrap());
    }
    index
}

fn between(lo: i32, hi: i32) -> Vec<ScanKey> {
    vec![
        ScanKey::new(Strategy::GreaterEqual, &key(lo)),
        ScanKey::new(Strategy::LessEqual, &key(hi)),
    ]
}

fn bitmap_scan(index: &ColaIndex, keys: Vec<ScanKey>) -> (TidBitmap, ScanState) {
    let mut scan = index.begin_scan(keys).unwrap();
    let mut bitmap = TidBitmap::new();
    index.get_bitmap(&mut scan, &mut bitmap).unwrap();
    (bitmap, scan)
}

fn pull_all(index: &ColaIndex, scan: &mut ScanState) -> Vec<TupleId> {
    let mut tids = Vec::new();
    while let Some(tid) = index.get_tuple(scan, ScanDirection::Forward).unwrap() {
        tids.push(tid);
    }
    tids
}

/// Keys of every item in one array, cells concatenated, pointers split out.
fn array_contents(index: &ColaIndex, level: usize, arrnum: usize) -> (Vec<i32>, Vec<IndexTuple>) {
    let mut keys = Vec::new();
    let mut rlps = Vec::new();
    for cell in 0..cells_per_array(level) {
        let page = index.pool().read_page(block_of(level, arrnum, cell).unwrap()).unwrap();
        for (_, item) in page.items() {
            let tuple = IndexTuple::decode(item).unwrap();
            if tuple.is_rlp() {
                rlps.push(tuple);
            } else {
                keys.push(key_of(&tuple));
            }
        }
    }
    (keys, rlps)
}

fn assert_invariants(index: &ColaIndex) {
    let matrix = load_matrix(index.pool()).unwrap();
    // level 0 must always have room for the next insert's retry
    assert!(matrix.level_is_safe(0));
    for level in 0..MAX_HEIGHT {
        let mut committed = 0;
        for arrnum in 0..arrays_per_level(level) {
            let s = matrix.get(level, arrnum);
            assert_eq!(s.level(), level);
            assert_eq!(s.arrnum(), arrnum);
            // no merge is in flight between committed inserts
            assert!(!s.contains(ArrayFlags::MERGE));
            if s.contains(ArrayFlags::FULL) && s.contains(ArrayFlags::VISIBLE) {
                committed += 1;
                if level >= 1 {
                    let (keys, _) = array_contents(index, level, arrnum);
                    assert!(
                        keys.windows(2).all(|w| w[0] <= w[1]),
                        "level {level} unsorted: {keys:?}"
                    );
                }
            }
        }
        // a level never accumulates a third committed run
        assert!(committed <= 2, "level {level} has {committed} committed arrays");
    }
}

#[test]
fn test_empty_index_returns_nothing() {
    let index = empty_index();
    let (bitmap, _) = bitmap_scan(&index, between(0, 100));
    assert!(bitmap.is_empty());

    let mut scan = index.begin_scan(vec![ScanKey::new(Strategy::Equal, &key(1))]).unwrap();
    assert_eq!(index.get_tuple(&mut scan, ScanDirection::Forward).unwrap(), None);
}

#[test]
fn test_level_zero_inserts_are_scannable() {
    let index = empty_index();
    for (i, k) in [5, 2, 8, 1].into_iter().enumerate() {
        assert!(index.insert(&key(k), heap_tid(i as u32)).unwrap());
    }

    let (bitmap, _) = bitmap_scan(&index, vec![ScanKey::new(Strategy::GreaterEqual, &key(0))]);
    assert_eq!(bitmap.len(), 4);

    let (bitmap, _) = bitmap_scan(&index, vec![ScanKey::new(Strategy::Equal, &key(8))]);
    assert_eq!(bitmap.len(), 1);
    assert!(bitmap.contains(heap_tid(2)));
}

#[test]
fn test_first_merge_builds_sorted_level_one() {
    // ten tuples fill both level-0 pages; the eleventh forces the merge
    let index = index_with_sequential(11);
    let matrix = load_matrix(index.pool()).unwrap();

    let dest = matrix.get(1, 0);
    assert!(dest.contains(ArrayFlags::FULL | ArrayFlags::VISIBLE | ArrayFlags::EXISTS));
    assert!(!dest.contains(ArrayFlags::LINKED));

    let (keys, rlps) = array_contents(&index, 1, 0);
    assert_eq!(keys, (1..=10).collect::<Vec<_>>());
    assert!(rlps.is_empty());

    // level 0 kept its arrays, drained and reusable
    for arrnum in 0..2 {
        let s = matrix.get(0, arrnum);
        assert!(s.contains(ArrayFlags::EXISTS | ArrayFlags::VISIBLE));
        assert!(!s.contains(ArrayFlags::FULL));
    }

    // the eleventh tuple sits on level 0
    let page = index.pool().read_page(block_of(0, 0, 0).unwrap()).unwrap();
    assert_eq!(page.item_count(), 1);

    let (bitmap, _) = bitmap_scan(&index, between(1, 11));
    assert_eq!(bitmap.len(), 11);
    assert_invariants(&index);
}

#[test]
fn test_duplicate_keys_all_survive() {
    let index = empty_index();
    for i in 0..4 {
        assert!(index.insert(&key(3), heap_tid(i)).unwrap());
    }
    let (bitmap, _) = bitmap_scan(&index, vec![ScanKey::new(Strategy::Equal, &key(3))]);
    assert_eq!(bitmap.len(), 4);
    for i in 0..4 {
        assert!(bitmap.contains(heap_tid(i)));
    }
}

#[test]
fn test_duplicate_keys_survive_merges() {
    let index = empty_index();
    for i in 0..11 {
        assert!(index.insert(&key(3), heap_tid(i)).unwrap());
    }
    let (bitmap, _) = bitmap_scan(&index, vec![ScanKey::new(Strategy::Equal, &key(3))]);
    assert_eq!(bitmap.len(), 11);
    assert_invariants(&index);
}

#[test]
fn test_cascade_opens_level_two_and_links_up() {
    // 31 sequential inserts: two level-1 runs merge down to level 2, and
    // the pointers land in the third level-1 array
    let index = index_with_sequential(31);
    let matrix = load_matrix(index.pool()).unwrap();

    let deep = matrix.get(2, 0);
    assert!(deep.contains(ArrayFlags::FULL | ArrayFlags::VISIBLE));
    let (keys, _) = array_contents(&index, 2, 0);
    assert_eq!(keys, (1..=20).collect::<Vec<_>>());

    // exactly one level-1 slot is linked, and it is visible
    let linked: Vec<usize> = (0..3)
        .filter(|&a| matrix.get(1, a).contains(ArrayFlags::LINKED))
        .collect();
    assert_eq!(linked.len(), 1);
    let linked_state = matrix.get(1, linked[0]);
    assert!(linked_state.contains(ArrayFlags::VISIBLE));

    // every pointer names a level-2 block whose first tuple carries its key
    let (_, rlps) = array_contents(&index, 1, linked[0]);
    assert!(!rlps.is_empty());
    let first_block = block_of(2, 0, 0).unwrap();
    let last_block = block_of(2, 0, cells_per_array(2) - 1).unwrap();
    for rlp in &rlps {
        assert!(rlp.tid.block >= first_block && rlp.tid.block <= last_block);
        let page = index.pool().read_page(rlp.tid.block).unwrap();
        let (_, first_item) = page.items().next().expect("pointer into empty page");
        let first_tuple = IndexTuple::decode(first_item).unwrap();
        assert_eq!(first_tuple.key, rlp.key);
    }
    assert_invariants(&index);
}

#[test]
fn test_scan_narrows_through_lookahead_pointers() {
    let index = index_with_sequential(31);
    let (bitmap, scan) = bitmap_scan(&index, between(9, 12));

    assert_eq!(bitmap.len(), 4);
    for i in 9..=12 {
        assert!(bitmap.contains(heap_tid(i)));
    }
    // visible pages: two level-0 blocks, two level-1 cells, four level-2
    // cells; the pointer window must keep the scan off part of them
    assert!(scan.stats.pages_scanned < 8, "scanned {} pages", scan.stats.pages_scanned);
}

#[test]
fn test_deep_cascade_covers_level_three() {
    // 51 inserts push the first forty keys down to level 3
    let index = index_with_sequential(51);
    let matrix = load_matrix(index.pool()).unwrap();

    let deep = matrix.get(3, 0);
    assert!(deep.contains(ArrayFlags::FULL | ArrayFlags::VISIBLE));
    let (keys, _) = array_contents(&index, 3, 0);
    assert_eq!(keys, (1..=40).collect::<Vec<_>>());

    // one linked, visible, pointer-only array at level 2
    let linked: Vec<usize> = (0..3)
        .filter(|&a| {
            let s = matrix.get(2, a);
            s.contains(ArrayFlags::LINKED) && s.contains(ArrayFlags::VISIBLE)
        })
        .collect();
    assert_eq!(linked.len(), 1);
    let (user_keys, rlps) = array_contents(&index, 2, linked[0]);
    assert!(user_keys.is_empty());
    assert!(!rlps.is_empty());

    let first_block = block_of(3, 0, 0).unwrap();
    let last_block = block_of(3, 0, cells_per_array(3) - 1).unwrap();
    for rlp in &rlps {
        assert!(rlp.tid.block >= first_block && rlp.tid.block <= last_block);
        let page = index.pool().read_page(rlp.tid.block).unwrap();
        let (_, first_item) = page.items().next().expect("pointer into empty page");
        assert_eq!(IndexTuple::decode(first_item).unwrap().key, rlp.key);
    }

    let (bitmap, scan) = bitmap_scan(&index, between(7, 10));
    assert_eq!(bitmap.len(), 4);
    for i in 7..=10 {
        assert!(bitmap.contains(heap_tid(i)));
    }
    // eighteen pages are visible; the windows keep the scan well under that
    assert!(scan.stats.pages_scanned < 12, "scanned {} pages", scan.stats.pages_scanned);
    assert_invariants(&index);
}

#[test]
fn test_upper_bound_prunes_sorted_arrays() {
    let index = index_with_sequential(11);
    let (bitmap, scan) = bitmap_scan(&index, vec![ScanKey::new(Strategy::Less, &key(2))]);

    assert_eq!(bitmap.len(), 1);
    assert!(bitmap.contains(heap_tid(1)));
    // both level-0 blocks plus only the first level-1 cell: the failing
    // key stops the sorted array before its second cell
    assert_eq!(scan.stats.pages_scanned, 3);
}

#[test]
fn test_pull_and_bitmap_agree() {
    let index = index_with_sequential(31);

    let mut scan = index.begin_scan(between(5, 25)).unwrap();
    let mut pulled = pull_all(&index, &mut scan);
    pulled.sort();
    assert_eq!(pulled.len(), 21);

    let (bitmap, _) = bitmap_scan(&index, between(5, 25));
    assert_eq!(bitmap.len(), 21);
    for tid in &pulled {
        assert!(bitmap.contains(*tid));
    }
}

#[test]
fn test_rescan_is_idempotent() {
    let index = index_with_sequential(31);
    let mut scan = index.begin_scan(between(5, 25)).unwrap();

    let mut first = pull_all(&index, &mut scan);
    index.rescan(&mut scan, between(5, 25)).unwrap();
    let mut second = pull_all(&index, &mut scan);

    assert!(!first.is_empty());
    first.sort();
    second.sort();
    assert_eq!(first, second);

    // new keys take effect on rescan
    index.rescan(&mut scan, vec![ScanKey::new(Strategy::Equal, &key(7))]).unwrap();
    let third = pull_all(&index, &mut scan);
    assert_eq!(third, vec![heap_tid(7)]);
}

#[test]
fn test_round_trip_against_reference() {
    let index = empty_index();
    let mut reference = BTreeMap::new();
    // a permutation of 0..101, far from insertion order
    for i in 0u32..101 {
        let k = ((i * 37) % 101) as i32;
        let tid = TupleId::new(2000, k as u16 + 1);
        assert!(index.insert(&key(k), tid).unwrap());
        reference.insert(k, tid);
    }
    assert_invariants(&index);

    for (lo, hi) in [(0, 100), (10, 20), (50, 50), (90, 200), (-5, 3)] {
        let (bitmap, _) = bitmap_scan(&index, between(lo, hi));
        let expected: Vec<TupleId> =
            reference.range(lo..=hi).map(|(_, tid)| *tid).collect();
        assert_eq!(bitmap.len(), expected.len(), "range [{lo}, {hi}]");
        for tid in expected {
            assert!(bitmap.contains(tid), "missing tid in range [{lo}, {hi}]");
        }
    }
}

#[test]
fn test_structure_stays_sound_after_every_insert() {
    let index = empty_index();
    for i in 1..=80 {
        assert!(index.insert(&key(i), heap_tid(i as u32)).unwrap());
        assert_invariants(&index);
    }
    let (bitmap, _) = bitmap_scan(&index, between(1, 80));
    assert_eq!(bitmap.len(), 80);
}

#[test]
fn test_backward_scan_is_rejected() {
    let index = index_with_sequential(3);
    let mut scan = index.begin_scan(between(0, 10)).unwrap();
    assert_eq!(
        index.get_tuple(&mut scan, ScanDirection::Backward).unwrap_err(),
        ColaError::Unsupported
    );
}

#[test]
fn test_unsupported_operations_fail_loudly() {
    let index = empty_index();
    assert_eq!(index.bulk_delete().unwrap_err(), ColaError::Unsupported);
    assert_eq!(index.vacuum_cleanup().unwrap_err(), ColaError::Unsupported);
    assert_eq!(index.options().unwrap_err(), ColaError::Unsupported);
    assert_eq!(index.cost_estimate().unwrap_err(), ColaError::Unsupported);

    let mut scan = index.begin_scan(vec![]).unwrap();
    assert_eq!(index.mark_pos(&mut scan).unwrap_err(), ColaError::Unsupported);
    assert_eq!(index.restore_pos(&mut scan).unwrap_err(), ColaError::Unsupported);

    assert!(!index.can_return());
    assert!(index.build_empty().is_ok());
}

#[test]
fn test_build_counts_rows() {
    let pool = Arc::new(BufferPool::new(PAGE_SIZE).unwrap());
    let rows = (1..=25).map(|i| (key(i), heap_tid(i as u32)));
    let (index, stats) = ColaIndex::build(pool, Arc::new(Int32Ord), rows).unwrap();
    assert_eq!(stats.heap_tuples, 25);
    assert_eq!(stats.index_tuples, 25);

    let (bitmap, _) = bitmap_scan(&index, between(1, 25));
    assert_eq!(bitmap.len(), 25);
}

#[test]
fn test_build_requires_empty_relation() {
    let pool = Arc::new(BufferPool::new(PAGE_SIZE).unwrap());
    pool.allocate();
    let err = ColaIndex::build(pool, Arc::new(Int32Ord), std::iter::empty()).unwrap_err();
    assert_eq!(err, ColaError::NotEmpty);
}

#[test]
fn test_open_checks_magic() {
    let pool = Arc::new(BufferPool::new(PAGE_SIZE).unwrap());
    {
        let (index, _) =
            ColaIndex::build(pool.clone(), Arc::new(Int32Ord), std::iter::empty()).unwrap();
        assert!(index.insert(&key(1), heap_tid(1)).unwrap());
    }
    // a clean reopen sees the data
    let reopened = ColaIndex::open(pool.clone(), Arc::new(Int32Ord)).unwrap();
    let (bitmap, _) = bitmap_scan(&reopened, between(0, 10));
    assert_eq!(bitmap.len(), 1);

    // corrupt the magic word and the open fails
    let mut page = pool.read_page(0).unwrap();
    page.contents_mut()[0] ^= 0xff;
    pool.write_page(0, &page).unwrap();
    assert_eq!(
        ColaIndex::open(pool, Arc::new(Int32Ord)).unwrap_err(),
        ColaError::CorruptMeta
    );
}

#[test]
fn test_reserved_offset_tid_rejected() {
    let index = empty_index();
    let err = index.insert(&key(1), TupleId::new(5, 0)).unwrap_err();
    assert_eq!(err, ColaError::BadTupleId);
}

#[test]
fn test_oversized_key_rejected() {
    let index = empty_index();
    let huge = vec![0u8; PAGE_SIZE];
    let err = index.insert(&huge, heap_tid(1)).unwrap_err();
    assert_eq!(err, ColaError::KeyTooLarge);
}
