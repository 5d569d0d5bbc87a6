//! Logical-block path resolution.
//!
//! Decomposes a file-relative block number into the sequence of slot
//! offsets through the inode's indirect tree. Pure arithmetic; no I/O.

use rime_error::{Result, RimeError};
use rime_types::{DIND_SLOT, DIR_BLOCKS, IND_SLOT, MAX_DEPTH, NTIND_SLOTS, TIND_SLOT};

/// What kind of slot layout an inode uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    Regular,
    /// Snapshot files extend the triple-indirect range with
    /// [`NTIND_SLOTS`] extra roots to map the full device block space.
    Snapshot,
}

/// A resolved indirect-tree path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Number of tree levels: 1 = direct slot .. 4 = triple indirect.
    pub depth: usize,
    /// Slot offsets, one per level; `offsets[0]` indexes the inode slot
    /// array, deeper entries index indirect blocks.
    pub offsets: [u32; MAX_DEPTH],
    /// Contiguous leaf slots remaining in the deepest indirect block
    /// starting at the mapped position; caps batched allocation so a run
    /// never crosses an indirect boundary.
    pub boundary: u32,
}

/// Decompose `iblock` for an inode of the given kind.
///
/// `addr_per_block` is the number of 32-bit slots per indirect block
/// (always a power of two).
pub fn resolve(kind: InodeKind, addr_per_block: u32, iblock: u64) -> Result<ResolvedPath> {
    let p = u64::from(addr_per_block);
    let p_bits = addr_per_block.trailing_zeros();
    let direct = DIR_BLOCKS as u64;
    let double = p * p;
    let triple = double * p;

    let mut offsets = [0u32; MAX_DEPTH];
    let mask = p - 1;

    #[allow(clippy::cast_possible_truncation)]
    let (depth, remainder) = if iblock < direct {
        offsets[0] = iblock as u32;
        // Boundary counts to the end of the direct area.
        let boundary = (direct - 1 - (iblock & mask)) as u32;
        return Ok(ResolvedPath {
            depth: 1,
            offsets,
            boundary,
        });
    } else if iblock - direct < p {
        let i = iblock - direct;
        offsets[0] = IND_SLOT as u32;
        offsets[1] = i as u32;
        (2, i)
    } else if iblock - direct - p < double {
        let i = iblock - direct - p;
        offsets[0] = DIND_SLOT as u32;
        offsets[1] = (i >> p_bits) as u32;
        offsets[2] = (i & mask) as u32;
        (3, i)
    } else if (iblock - direct - p - double) >> (2 * p_bits) < p {
        let i = iblock - direct - p - double;
        offsets[0] = TIND_SLOT as u32;
        offsets[1] = (i >> (2 * p_bits)) as u32;
        offsets[2] = ((i >> p_bits) & mask) as u32;
        offsets[3] = (i & mask) as u32;
        (4, i)
    } else if kind == InodeKind::Snapshot {
        // Extra triple-indirect roots follow the conventional one.
        let i = iblock - direct - p - double;
        let tind = i >> (3 * p_bits);
        if tind > NTIND_SLOTS as u64 {
            return Err(RimeError::Format(format!(
                "logical block {iblock} beyond snapshot tree range"
            )));
        }
        let i = i - (tind << (3 * p_bits));
        offsets[0] = TIND_SLOT as u32 + tind as u32;
        offsets[1] = (i >> (2 * p_bits)) as u32;
        offsets[2] = ((i >> p_bits) & mask) as u32;
        offsets[3] = (i & mask) as u32;
        (4, i)
    } else {
        return Err(RimeError::Format(format!(
            "logical block {iblock} beyond tree range"
        )));
    };

    #[allow(clippy::cast_possible_truncation)]
    let boundary = (p - 1 - (remainder & mask)) as u32;
    Ok(ResolvedPath {
        depth,
        offsets,
        boundary,
    })
}

/// Number of indirect levels hanging below an inode slot.
///
/// Direct slots carry data directly (0), the IND root one level, and so
/// on; every extended snapshot root is a triple-indirect.
#[must_use]
pub fn slot_depth(slot: usize) -> usize {
    match slot {
        s if s < DIR_BLOCKS => 0,
        IND_SLOT => 1,
        DIND_SLOT => 2,
        _ => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const P: u32 = 256; // 1024-byte blocks

    #[test]
    fn direct_range() {
        let r = resolve(InodeKind::Regular, P, 0).unwrap();
        assert_eq!((r.depth, r.offsets[0]), (1, 0));
        let r = resolve(InodeKind::Regular, P, 11).unwrap();
        assert_eq!((r.depth, r.offsets[0]), (1, 11));
        assert_eq!(r.boundary, 0);
    }

    #[test]
    fn single_indirect_range() {
        let r = resolve(InodeKind::Regular, P, 12).unwrap();
        assert_eq!(r.depth, 2);
        assert_eq!(&r.offsets[..2], &[12, 0]);
        assert_eq!(r.boundary, 255);

        let r = resolve(InodeKind::Regular, P, 12 + 255).unwrap();
        assert_eq!(&r.offsets[..2], &[12, 255]);
        assert_eq!(r.boundary, 0);
    }

    #[test]
    fn double_indirect_range() {
        let r = resolve(InodeKind::Regular, P, 12 + 256).unwrap();
        assert_eq!(r.depth, 3);
        assert_eq!(&r.offsets[..3], &[13, 0, 0]);

        let r = resolve(InodeKind::Regular, P, 12 + 256 + 256 * 256 - 1).unwrap();
        assert_eq!(&r.offsets[..3], &[13, 255, 255]);
        assert_eq!(r.boundary, 0);
    }

    #[test]
    fn triple_indirect_hole_fill_example() {
        // block_size = 1024: first triple-indirect block is 12 + 256 + 256^2.
        let r = resolve(InodeKind::Regular, P, 65804).unwrap();
        assert_eq!(r.depth, 4);
        assert_eq!(r.offsets, [14, 0, 0, 0]);
        assert_eq!(r.boundary, 255);
    }

    #[test]
    fn regular_tree_range_ends_after_tind() {
        let max = 12 + 256 + 256u64 * 256 + 256u64 * 256 * 256;
        assert!(resolve(InodeKind::Regular, P, max - 1).is_ok());
        assert!(resolve(InodeKind::Regular, P, max).is_err());
    }

    #[test]
    fn snapshot_extended_tind_roots() {
        let tind_base = 12 + 256 + 256u64 * 256;
        let p3 = 256u64 * 256 * 256;

        // Same block resolves identically below the extension.
        let r = resolve(InodeKind::Snapshot, P, tind_base).unwrap();
        assert_eq!(r.offsets[0], 14);

        // First extended root.
        let r = resolve(InodeKind::Snapshot, P, tind_base + p3).unwrap();
        assert_eq!(r.depth, 4);
        assert_eq!(r.offsets, [15, 0, 0, 0]);

        // Last extended root, last block.
        let r = resolve(InodeKind::Snapshot, P, tind_base + 4 * p3 + p3 - 1).unwrap();
        assert_eq!(r.offsets, [18, 255, 255, 255]);
        assert_eq!(r.boundary, 0);

        // Beyond the last extended root.
        assert!(resolve(InodeKind::Snapshot, P, tind_base + 5 * p3).is_err());
        // Regular inodes never see the extension.
        assert!(resolve(InodeKind::Regular, P, tind_base + p3).is_err());
    }

    #[test]
    fn boundary_counts_remaining_leaf_slots() {
        // Ten blocks before an indirect boundary.
        let r = resolve(InodeKind::Regular, P, 12 + 246).unwrap();
        assert_eq!(r.boundary, 9);
    }

    #[test]
    fn slot_depths() {
        assert_eq!(slot_depth(0), 0);
        assert_eq!(slot_depth(11), 0);
        assert_eq!(slot_depth(12), 1);
        assert_eq!(slot_depth(13), 2);
        assert_eq!(slot_depth(14), 3);
        assert_eq!(slot_depth(17), 3);
    }

    proptest! {
        /// The partition is exact: each depth's ranges tile the space.
        #[test]
        fn resolve_is_monotone_and_total(iblock in 0u64..(12 + 256 + 65536 + 16_777_216)) {
            let r = resolve(InodeKind::Regular, P, iblock).unwrap();
            prop_assert!(r.depth >= 1 && r.depth <= 4);
            for level in 1..r.depth {
                prop_assert!(r.offsets[level] < P);
            }
            prop_assert!(r.boundary < P.max(12));
        }

        /// Reconstructing the block number from offsets round-trips.
        #[test]
        fn resolve_round_trips(iblock in 0u64..(12 + 256 + 65536 + 16_777_216)) {
            let r = resolve(InodeKind::Regular, P, iblock).unwrap();
            let p = u64::from(P);
            let rebuilt = match r.depth {
                1 => u64::from(r.offsets[0]),
                2 => 12 + u64::from(r.offsets[1]),
                3 => 12 + p + u64::from(r.offsets[1]) * p + u64::from(r.offsets[2]),
                4 => {
                    12 + p
                        + p * p
                        + u64::from(r.offsets[1]) * p * p
                        + u64::from(r.offsets[2]) * p
                        + u64::from(r.offsets[3])
                }
                _ => unreachable!(),
            };
            prop_assert_eq!(rebuilt, iblock);
        }
    }
}
