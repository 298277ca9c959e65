//! On-disk layout of levels, arrays and cells.
//!
//! Block 0 is the meta page. Blocks 1 and 2 are the two single-page level-0
//! arrays. From level 1 onward each level lays out its three arrays back to
//! back, `2^level` cells each, so the whole mapping is a pure function of
//! the coordinates. Drained arrays keep their pages, which is what keeps
//! this mapping valid for the lifetime of the index.

use cola_store::BlockNumber;

use crate::MAX_HEIGHT;
use crate::error::{ColaError, ColaResult};

/// Number of array slots at a level: level 0 has two, the rest have three.
#[must_use]
pub fn arrays_per_level(level: usize) -> usize {
    if level == 0 { 2 } else { 3 }
}

/// Number of single-page cells in one array at `level`.
#[must_use]
pub fn cells_per_array(level: usize) -> usize {
    1 << level
}

/// Block number of `cell` within array `arrnum` at `level`.
pub fn block_of(level: usize, arrnum: usize, cell: usize) -> ColaResult<BlockNumber> {
    if level >= MAX_HEIGHT || arrnum >= arrays_per_level(level) || cell >= cells_per_array(level) {
        return Err(ColaError::Geometry);
    }
    if level == 0 {
        return Ok(arrnum as BlockNumber + 1);
    }
    let width = (1usize << level) as BlockNumber;
    // levels 1..level sum to 3 * (2^level - 2) blocks
    Ok(3 + 3 * (width - 2) + arrnum as BlockNumber * width + cell as BlockNumber)
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::collections::BTreeSet;
    use std::vec::Vec;

    use super::*;

    #[test]
    fn test_level_zero_blocks() {
        assert_eq!(block_of(0, 0, 0).unwrap(), 1);
        assert_eq!(block_of(0, 1, 0).unwrap(), 2);
    }

    #[test]
    fn test_level_one_follows_level_zero() {
        assert_eq!(block_of(1, 0, 0).unwrap(), 3);
        assert_eq!(block_of(1, 0, 1).unwrap(), 4);
        assert_eq!(block_of(1, 1, 0).unwrap(), 5);
        assert_eq!(block_of(1, 2, 1).unwrap(), 8);
        // level 2 starts right after the six level-1 blocks
        assert_eq!(block_of(2, 0, 0).unwrap(), 9);
    }

    #[test]
    fn test_blocks_are_contiguous_and_unique() {
        let mut seen = BTreeSet::new();
        let mut blocks = Vec::new();
        for level in 0..6 {
            for arrnum in 0..arrays_per_level(level) {
                for cell in 0..cells_per_array(level) {
                    let blkno = block_of(level, arrnum, cell).unwrap();
                    assert!(seen.insert(blkno), "duplicate block {blkno}");
                    blocks.push(blkno);
                }
            }
        }
        // dense: 1..=n with no gaps
        let expected: Vec<BlockNumber> = (1..=blocks.len() as BlockNumber).collect();
        assert_eq!(blocks, expected);
    }

    #[test]
    fn test_out_of_range_coordinates() {
        assert_eq!(block_of(0, 2, 0).unwrap_err(), ColaError::Geometry);
        assert_eq!(block_of(1, 0, 2).unwrap_err(), ColaError::Geometry);
        assert_eq!(block_of(3, 3, 0).unwrap_err(), ColaError::Geometry);
        assert_eq!(block_of(MAX_HEIGHT, 0, 0).unwrap_err(), ColaError::Geometry);
        assert!(block_of(4, 2, 15).is_ok());
        assert_eq!(block_of(4, 2, 16).unwrap_err(), ColaError::Geometry);
    }
}
