//! Index tuples, the key comparator, and the look-ahead sentinel.
//!
//! A tuple is a heap tuple identifier plus the key bytes of the first
//! indexed attribute. On a page it is encoded as
//! `[block u32 le][offset u16 le][key bytes]`; the item length carried by
//! the page's line pointer bounds the key, so no length field is stored.
//!
//! An item whose offset equals [`RLP_OFFSET`] is a real look-ahead pointer:
//! its key is a copy of some user tuple's key and its block field names the
//! page one level deeper where that key run begins. Offset 0 never occurs
//! as a legitimate heap offset, which is what makes the sentinel safe.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::Ordering;

use cola_store::BlockNumber;

/// The offset value that marks a tuple as a real look-ahead pointer.
pub const RLP_OFFSET: u16 = 0;

/// Worst-case encoded size of a look-ahead pointer, used when reserving
/// page space for pointers that may arrive later.
pub const SIZE_OF_RLP: usize = 32;

/// Encoded size of the tuple identifier prefix.
pub const TUPLE_ID_LEN: usize = 6;

/// A heap (or look-ahead) tuple identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TupleId {
    pub block: BlockNumber,
    pub offset: u16,
}

impl TupleId {
    #[must_use]
    pub fn new(block: BlockNumber, offset: u16) -> Self {
        Self { block, offset }
    }

    #[must_use]
    pub fn is_rlp(self) -> bool {
        self.offset == RLP_OFFSET
    }
}

/// One index tuple: identifier plus key bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexTuple {
    pub tid: TupleId,
    pub key: Vec<u8>,
}

impl IndexTuple {
    #[must_use]
    pub fn new(key: &[u8], tid: TupleId) -> Self {
        Self { tid, key: key.to_vec() }
    }

    /// A look-ahead pointer carrying this tuple's key and naming `block`.
    #[must_use]
    pub fn as_rlp(&self, block: BlockNumber) -> IndexTuple {
        IndexTuple { tid: TupleId::new(block, RLP_OFFSET), key: self.key.clone() }
    }

    #[must_use]
    pub fn is_rlp(&self) -> bool {
        self.tid.is_rlp()
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        TUPLE_ID_LEN + self.key.len()
    }

    /// Item bytes for page storage.
    #[must_use]
    pub fn encoded(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.tid.block.to_le_bytes());
        buf.extend_from_slice(&self.tid.offset.to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf
    }

    /// Decode an item. Returns `None` for items too short to carry an
    /// identifier.
    #[must_use]
    pub fn decode(item: &[u8]) -> Option<IndexTuple> {
        if item.len() < TUPLE_ID_LEN {
            return None;
        }
        let block = BlockNumber::from_le_bytes([item[0], item[1], item[2], item[3]]);
        let offset = u16::from_le_bytes([item[4], item[5]]);
        Some(IndexTuple { tid: TupleId::new(block, offset), key: item[TUPLE_ID_LEN..].to_vec() })
    }
}

/// Three-way ordering over key bytes, supplied by the operator class of the
/// indexed attribute.
pub trait KeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Shared handle to a comparator.
pub type ComparatorRef = Arc<dyn KeyComparator>;

/// Ordering for 4-byte little-endian signed integer keys.
pub struct Int32Ord;

impl Int32Ord {
    fn value(bytes: &[u8]) -> i32 {
        bytes
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .map(i32::from_le_bytes)
            .unwrap_or(0)
    }
}

impl KeyComparator for Int32Ord {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        Self::value(a).cmp(&Self::value(b))
    }
}
