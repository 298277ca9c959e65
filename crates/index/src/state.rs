//! Array states and the state matrix.
//!
//! Every array slot is described by one 16-bit word: five status flags in
//! the low bits plus redundant array-number and level tags. The full
//! `MAX_HEIGHT x 3` matrix of words is the authoritative snapshot of the
//! index and is checkpointed to the meta page after every state transition.

use bitflags::bitflags;

use crate::MAX_HEIGHT;
use crate::geometry::arrays_per_level;

bitflags! {
    /// Status flags of one array slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ArrayFlags: u16 {
        /// Array is a source or destination of a merge in progress.
        const MERGE = 1 << 0;
        /// Array carries look-ahead pointers into the level below.
        const LINKED = 1 << 1;
        /// Array contains a committed run of user tuples.
        const FULL = 1 << 2;
        /// Array may be read by scans.
        const VISIBLE = 1 << 3;
        /// Array pages are allocated.
        const EXISTS = 1 << 4;
    }
}

const ARRNUM_SHIFT: u16 = 5;
const ARRNUM_MASK: u16 = 0x3;
const LEVEL_SHIFT: u16 = 7;
const LEVEL_MASK: u16 = 0x1f;

/// One array-state word. The embedded tags make the word self-describing,
/// so routines can pass a state around and still know which slot it names.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ArrayState(u16);

impl ArrayState {
    /// The impossible word (MERGE set on a slot that does not exist, with
    /// zero tags). Lookup routines return it to mean "no candidate".
    pub const INVALID: ArrayState = ArrayState(1);

    /// A flagless word tagged with its slot coordinates.
    #[must_use]
    pub fn tagged(level: usize, arrnum: usize) -> Self {
        debug_assert!(level < MAX_HEIGHT);
        debug_assert!(arrnum < 3);
        ArrayState(((level as u16 & LEVEL_MASK) << LEVEL_SHIFT) | ((arrnum as u16) << ARRNUM_SHIFT))
    }

    #[must_use]
    pub fn from_raw(word: u16) -> Self {
        ArrayState(word)
    }

    #[must_use]
    pub fn raw(self) -> u16 {
        self.0
    }

    #[must_use]
    pub fn level(self) -> usize {
        ((self.0 >> LEVEL_SHIFT) & LEVEL_MASK) as usize
    }

    #[must_use]
    pub fn arrnum(self) -> usize {
        ((self.0 >> ARRNUM_SHIFT) & ARRNUM_MASK) as usize
    }

    #[must_use]
    pub fn flags(self) -> ArrayFlags {
        ArrayFlags::from_bits_truncate(self.0)
    }

    #[must_use]
    pub fn contains(self, flags: ArrayFlags) -> bool {
        self.flags().contains(flags)
    }

    pub fn insert(&mut self, flags: ArrayFlags) {
        self.0 |= flags.bits();
    }

    pub fn remove(&mut self, flags: ArrayFlags) {
        self.0 &= !flags.bits();
    }

    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl core::fmt::Debug for ArrayState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if !self.is_valid() {
            return write!(f, "ArrayState(invalid)");
        }
        write!(f, "ArrayState[{}][{}]({:?})", self.level(), self.arrnum(), self.flags())
    }
}

/// The full matrix of array-state words.
#[derive(Clone, Debug)]
pub struct StateMatrix([[ArrayState; 3]; MAX_HEIGHT]);

impl StateMatrix {
    /// A matrix of flagless words, each tagged with its coordinates. This is
    /// the state written by meta-page initialization.
    #[must_use]
    pub fn new_tagged() -> Self {
        let mut words = [[ArrayState::INVALID; 3]; MAX_HEIGHT];
        for (level, row) in words.iter_mut().enumerate() {
            for (arrnum, slot) in row.iter_mut().enumerate() {
                *slot = ArrayState::tagged(level, arrnum);
            }
        }
        StateMatrix(words)
    }

    #[must_use]
    pub fn from_words(words: [[u16; 3]; MAX_HEIGHT]) -> Self {
        let mut matrix = [[ArrayState::INVALID; 3]; MAX_HEIGHT];
        for (level, row) in words.iter().enumerate() {
            for (arrnum, &word) in row.iter().enumerate() {
                matrix[level][arrnum] = ArrayState::from_raw(word);
            }
        }
        StateMatrix(matrix)
    }

    #[must_use]
    pub fn to_words(&self) -> [[u16; 3]; MAX_HEIGHT] {
        let mut words = [[0u16; 3]; MAX_HEIGHT];
        for (level, row) in self.0.iter().enumerate() {
            for (arrnum, &slot) in row.iter().enumerate() {
                words[level][arrnum] = slot.raw();
            }
        }
        words
    }

    #[must_use]
    pub fn get(&self, level: usize, arrnum: usize) -> ArrayState {
        self.0[level][arrnum]
    }

    /// Write a word back into the slot named by its embedded tags.
    pub fn store(&mut self, state: ArrayState) {
        self.0[state.level()][state.arrnum()] = state;
    }

    /// Find an array at `level` able to receive tuples, in priority order:
    /// an existing visible non-full slot, then an existing invisible one
    /// (a merge destination still under construction), then a slot whose
    /// pages have not been allocated yet. Returns the invalid word when the
    /// level has no candidate.
    #[must_use]
    pub fn find_array(&self, level: usize) -> ArrayState {
        let slots = &self.0[level][..arrays_per_level(level)];
        let free = |s: &ArrayState| !s.contains(ArrayFlags::MERGE) && !s.contains(ArrayFlags::FULL);

        if let Some(s) = slots.iter().find(|s| {
            free(s) && s.contains(ArrayFlags::EXISTS) && s.contains(ArrayFlags::VISIBLE)
        }) {
            return *s;
        }
        if let Some(s) = slots.iter().find(|s| {
            free(s) && s.contains(ArrayFlags::EXISTS) && !s.contains(ArrayFlags::VISIBLE)
        }) {
            return *s;
        }
        if let Some(s) = slots.iter().find(|s| free(s) && !s.contains(ArrayFlags::EXISTS)) {
            return *s;
        }
        ArrayState::INVALID
    }

    /// A level is safe while fewer than two of its arrays are committed
    /// (FULL and VISIBLE) or participating in a merge. An unsafe level must
    /// be merged down before it can accept another run.
    #[must_use]
    pub fn level_is_safe(&self, level: usize) -> bool {
        let count = self.0[level][..arrays_per_level(level)]
            .iter()
            .filter(|s| {
                (s.contains(ArrayFlags::FULL) && s.contains(ArrayFlags::VISIBLE))
                    || s.contains(ArrayFlags::MERGE)
            })
            .count();
        count < 2
    }

    /// A level is empty while it holds no committed array. The cascade uses
    /// this to detect the merge that opens a new level.
    #[must_use]
    pub fn level_is_empty(&self, level: usize) -> bool {
        !self.0[level][..arrays_per_level(level)]
            .iter()
            .any(|s| s.contains(ArrayFlags::FULL) && s.contains(ArrayFlags::VISIBLE))
    }
}
