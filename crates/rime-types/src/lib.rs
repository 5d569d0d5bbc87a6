#![forbid(unsafe_code)]
//! Shared identifier types and on-disk constants for RimeFS.
//!
//! Everything here is either a unit-carrying newtype (so block numbers,
//! byte offsets, and inode numbers cannot be mixed up) or a constant of
//! the on-disk indirect-block format.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Indirect-tree layout constants ──────────────────────────────────────────

/// Number of direct slots in the inode slot array.
pub const DIR_BLOCKS: usize = 12;
/// Slot index of the single-indirect root.
pub const IND_SLOT: usize = 12;
/// Slot index of the double-indirect root.
pub const DIND_SLOT: usize = 13;
/// Slot index of the triple-indirect root.
pub const TIND_SLOT: usize = 14;
/// Total slots in a regular inode's slot array.
pub const N_BLOCKS: usize = 15;
/// Extra triple-indirect roots available to snapshot inodes (slots 15..19).
///
/// Together with the conventional root at [`TIND_SLOT`] they map the full
/// 2^32 block space of the underlying device.
pub const NTIND_SLOTS: usize = 4;
/// Total slots in a snapshot inode's slot array.
pub const SNAP_N_BLOCKS: usize = N_BLOCKS + NTIND_SLOTS;
/// Maximum branch depth (direct = 1 .. triple indirect = 4).
pub const MAX_DEPTH: usize = 4;

/// Maximum fast-symlink target length (stored inside the slot array).
pub const FAST_SYMLINK_MAX: usize = N_BLOCKS * 4;

// ── Inode flags ─────────────────────────────────────────────────────────────

/// Set to each huge file (`blocks` counts filesystem blocks, not sectors).
pub const HUGE_FILE_FL: u32 = 0x0004_0000;
/// Inode is a snapshot file.
pub const SNAPFILE_FL: u32 = 0x0100_0000;
/// Snapshot is on the filesystem snapshot list.
pub const SNAPFILE_LIST_FL: u32 = 0x0200_0000;
/// Snapshot is the active snapshot.
pub const SNAPFILE_ACTIVE_FL: u32 = 0x0400_0000;
/// Snapshot is being deleted.
pub const SNAPFILE_DELETED_FL: u32 = 0x0800_0000;

// ── POSIX file mode constants ───────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;

// ── Newtypes ────────────────────────────────────────────────────────────────

/// Physical block number on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Logical block offset within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalBlock(pub u64);

/// Inode number (1-indexed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Journal transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

/// Block group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Byte offset on a byte-addressed device (pread/pwrite semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

/// Validated block size (power of two in 1024..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [1024, 65536].
    pub fn new(value: u32) -> Result<Self, FieldError> {
        if !value.is_power_of_two() || !(1024..=65536).contains(&value) {
            return Err(FieldError::Invalid {
                field: "block_size",
                reason: "must be power of two in 1024..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Number of 32-bit slots in one indirect block.
    #[must_use]
    pub fn addr_per_block(self) -> u32 {
        self.0 / 4
    }

    /// log2 of [`Self::addr_per_block`].
    #[must_use]
    pub fn addr_per_block_bits(self) -> u32 {
        self.addr_per_block().trailing_zeros()
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Convert a byte count to the number of blocks covering it (rounds up).
    #[must_use]
    pub fn blocks_for_bytes(self, bytes: u64) -> u64 {
        bytes.div_ceil(u64::from(self.0))
    }
}

impl InodeNumber {
    pub const ROOT: Self = Self(2);

    /// Narrow to the on-disk u32 representation.
    pub fn to_u32(self) -> Result<u32, FieldError> {
        u32::try_from(self.0).map_err(|_| FieldError::Conversion {
            field: "inode_number",
        })
    }
}

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Subtract a block count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, count: u64) -> Option<Self> {
        self.0.checked_sub(count).map(Self)
    }

    /// Byte offset of this block for the given block size, `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self, block_size: BlockSize) -> Option<ByteOffset> {
        self.0
            .checked_mul(u64::from(block_size.get()))
            .map(ByteOffset)
    }

    /// Narrow to the on-disk u32 slot representation.
    pub fn to_u32(self) -> Result<u32, FieldError> {
        u32::try_from(self.0).map_err(|_| FieldError::Conversion {
            field: "block_number",
        })
    }
}

impl LogicalBlock {
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

// ── Field errors ────────────────────────────────────────────────────────────

/// Validation failure for a single on-disk field.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FieldError {
    #[error("invalid field: {field} ({reason})")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    Conversion { field: &'static str },
}

// ── Little-endian field readers ─────────────────────────────────────────────

/// Slice `len` bytes at `offset`, or report how much was missing.
#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], FieldError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(FieldError::Invalid {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(FieldError::Invalid {
            field: "offset",
            reason: "out of bounds",
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, FieldError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, FieldError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, FieldError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Read slot `index` of an indirect block image as a little-endian u32.
#[inline]
pub fn read_slot(block: &[u8], index: usize) -> Result<u32, FieldError> {
    read_le_u32(block, index * 4)
}

/// Write slot `index` of an indirect block image as a little-endian u32.
pub fn write_slot(block: &mut [u8], index: usize, value: u32) -> Result<(), FieldError> {
    let offset = index * 4;
    if offset + 4 > block.len() {
        return Err(FieldError::Invalid {
            field: "slot_index",
            reason: "out of bounds",
        });
    }
    block[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

// ── Group math ──────────────────────────────────────────────────────────────

/// Compute the block group that contains a given block.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // group count is u32
pub fn block_to_group(
    block: BlockNumber,
    blocks_per_group: u32,
    first_data_block: u32,
) -> GroupNumber {
    let adjusted = block.0.saturating_sub(u64::from(first_data_block));
    GroupNumber((adjusted / u64::from(blocks_per_group)) as u32)
}

/// Compute the first block of a given block group.
#[must_use]
pub fn group_first_block(
    group: GroupNumber,
    blocks_per_group: u32,
    first_data_block: u32,
) -> Option<BlockNumber> {
    let offset = u64::from(group.0).checked_mul(u64::from(blocks_per_group))?;
    offset
        .checked_add(u64::from(first_data_block))
        .map(BlockNumber)
}

/// Compute the inode's block group from its inode number.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn inode_to_group(ino: InodeNumber, inodes_per_group: u32) -> GroupNumber {
    GroupNumber(((ino.0.saturating_sub(1)) / u64::from(inodes_per_group)) as u32)
}

/// Compute the index of an inode within its block group.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn inode_index_in_group(ino: InodeNumber, inodes_per_group: u32) -> u32 {
    ((ino.0.saturating_sub(1)) % u64::from(inodes_per_group)) as u32
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn block_size_validation() {
        assert!(BlockSize::new(1024).is_ok());
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(65536).is_ok());
        assert!(BlockSize::new(512).is_err());
        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(131_072).is_err());
        assert!(BlockSize::new(0).is_err());
    }

    #[test]
    fn addr_per_block_math() {
        let bs = BlockSize::new(1024).unwrap();
        assert_eq!(bs.addr_per_block(), 256);
        assert_eq!(bs.addr_per_block_bits(), 8);

        let bs = BlockSize::new(4096).unwrap();
        assert_eq!(bs.addr_per_block(), 1024);
        assert_eq!(bs.addr_per_block_bits(), 10);
    }

    #[test]
    fn blocks_for_bytes_rounds_up() {
        let bs = BlockSize::new(1024).unwrap();
        assert_eq!(bs.blocks_for_bytes(0), 0);
        assert_eq!(bs.blocks_for_bytes(1), 1);
        assert_eq!(bs.blocks_for_bytes(1024), 1);
        assert_eq!(bs.blocks_for_bytes(1025), 2);
    }

    #[test]
    fn slot_round_trip() {
        let mut block = vec![0u8; 1024];
        write_slot(&mut block, 0, 0xDEAD_BEEF).unwrap();
        write_slot(&mut block, 255, 42).unwrap();
        assert_eq!(read_slot(&block, 0).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_slot(&block, 255).unwrap(), 42);
        assert!(write_slot(&mut block, 256, 1).is_err());
        assert!(read_slot(&block, 256).is_err());
    }

    #[test]
    fn group_math() {
        assert_eq!(block_to_group(BlockNumber(0), 8192, 0), GroupNumber(0));
        assert_eq!(block_to_group(BlockNumber(8191), 8192, 0), GroupNumber(0));
        assert_eq!(block_to_group(BlockNumber(8192), 8192, 0), GroupNumber(1));
        // 1K blocks start at block 1.
        assert_eq!(block_to_group(BlockNumber(1), 8192, 1), GroupNumber(0));
        assert_eq!(block_to_group(BlockNumber(8193), 8192, 1), GroupNumber(1));
        assert_eq!(
            group_first_block(GroupNumber(1), 8192, 1),
            Some(BlockNumber(8193))
        );
    }

    #[test]
    fn inode_group_math() {
        assert_eq!(inode_to_group(InodeNumber(1), 2048), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(2048), 2048), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(2049), 2048), GroupNumber(1));
        assert_eq!(inode_index_in_group(InodeNumber(1), 2048), 0);
        assert_eq!(inode_index_in_group(InodeNumber(2049), 2048), 0);
    }

    #[test]
    fn slot_layout_constants() {
        assert_eq!(IND_SLOT, DIR_BLOCKS);
        assert_eq!(N_BLOCKS, TIND_SLOT + 1);
        assert_eq!(SNAP_N_BLOCKS, 19);
    }

    proptest! {
        #[test]
        fn slot_write_read_any(index in 0usize..256, value in any::<u32>()) {
            let mut block = vec![0u8; 1024];
            write_slot(&mut block, index, value).unwrap();
            prop_assert_eq!(read_slot(&block, index).unwrap(), value);
        }

        #[test]
        fn le_readers_agree_with_bytes(offset in 0usize..64, value in any::<u32>()) {
            let mut data = vec![0u8; 128];
            data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            prop_assert_eq!(read_le_u32(&data, offset).unwrap(), value);
        }
    }
}
