//! Engine error type.

use cola_error::define_index_error;
use cola_store::StoreError;

define_index_error! {
    /// Errors raised by the index engine.
    ///
    /// Everything except `Unsupported` signals either misuse of the API or a
    /// state the merge machinery treats as unreachable; none of them leave
    /// the on-disk index inconsistent.
    pub enum ColaError(0x01) {
        /// Operation outside the supported capability set
        Unsupported = 0x01 => "Operation not supported by this access method",
        /// Cell outside an array, or a merge state that cannot be reached
        Geometry = 0x02 => "Array geometry or merge state violated",
        /// Destination array ran out of cells mid-merge
        Capacity = 0x03 => "Destination array ran out of cells",
        /// No free array slot where the algorithm requires one
        NoFreeArray = 0x04 => "No free array slot at level",
        /// Meta page failed its magic check
        CorruptMeta = 0x05 => "Meta page magic mismatch",
        /// Key cannot fit a page alongside the look-ahead reservation
        KeyTooLarge = 0x06 => "Index key exceeds page capacity",
        /// Heap tuple identifier uses the reserved look-ahead offset
        BadTupleId = 0x07 => "Tuple identifier uses the reserved offset",
        /// Relation must be empty before an index build
        NotEmpty = 0x08 => "Index relation already contains data",
    }
    propagates {
        /// Page store failure
        Store(StoreError) = 0x09 => "Page store failure",
    }
}

/// Result type for engine operations.
pub type ColaResult<T> = Result<T, ColaError>;
