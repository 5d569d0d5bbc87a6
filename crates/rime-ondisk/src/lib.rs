#![forbid(unsafe_code)]
//! On-disk structures: raw inodes, group descriptors, superblock.
//!
//! All multi-byte fields are little-endian. Indirect blocks are plain
//! arrays of `block_size / 4` little-endian u32 slots where zero means
//! "hole"; they are read and written through `rime_types::{read_slot,
//! write_slot}` and need no codec of their own.

use rime_error::{Result, RimeError};
use rime_types::{
    read_le_u16, read_le_u32, read_le_u64, BlockNumber, BlockSize, FieldError, GroupNumber,
    InodeNumber, DIR_BLOCKS, N_BLOCKS, NTIND_SLOTS, SNAPFILE_FL, SNAP_N_BLOCKS,
};
use serde::{Deserialize, Serialize};

fn format_err(err: FieldError) -> RimeError {
    RimeError::Format(err.to_string())
}

// ── Raw inode ───────────────────────────────────────────────────────────────

/// Inode layout (fields within one `inode_size`-byte table entry):
///
/// ```text
/// 0x00  mode            u16
/// 0x02  links_count     u16
/// 0x04  size            u64
/// 0x0C  atime           u32
/// 0x10  ctime           u32
/// 0x14  mtime           u32
/// 0x18  dtime           u32
/// 0x1C  uid             u32
/// 0x20  gid             u32
/// 0x24  flags           u32
/// 0x28  slot array      15 x u32 (60 bytes)
/// 0x64  generation      u32
/// 0x68  blocks_lo       u32
/// 0x6C  blocks_high     u16
/// 0x6E  (reserved)      u16
/// 0x70  next_snapshot   u32
/// 0x74  extra TIND      4 x u32 (snapshot inodes only)
/// ```
pub const INODE_RECORD_BYTES: usize = 0x84;

const SLOT_ARRAY_OFFSET: usize = 0x28;
const EXTRA_TIND_OFFSET: usize = 0x74;

/// Set when `blocks_raw` counts filesystem blocks instead of 512-byte
/// sectors (needed once the 48-bit sector count would overflow).
pub use rime_types::HUGE_FILE_FL;

/// Parsed on-disk inode.
///
/// The slot array is held in logical order regardless of the on-disk
/// rotation applied to snapshot inodes; see [`slot_disk_index`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInode {
    pub mode: u16,
    pub links_count: u16,
    pub size: u64,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub uid: u32,
    pub gid: u32,
    pub flags: u32,
    pub generation: u32,
    /// Raw 48-bit block count; interpretation depends on [`HUGE_FILE_FL`].
    pub blocks_raw: u64,
    /// Next inode on the snapshot list (0 = none).
    pub next_snapshot: u32,
    /// Logical slot array: `DIR_BLOCKS` direct slots, IND, DIND, TIND,
    /// then `NTIND_SLOTS` extra triple-indirect roots (snapshot inodes).
    pub slots: [u32; SNAP_N_BLOCKS],
}

impl RawInode {
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            mode: 0,
            links_count: 0,
            size: 0,
            atime: 0,
            ctime: 0,
            mtime: 0,
            dtime: 0,
            uid: 0,
            gid: 0,
            flags: 0,
            generation: 0,
            blocks_raw: 0,
            next_snapshot: 0,
            slots: [0; SNAP_N_BLOCKS],
        }
    }

    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.flags & SNAPFILE_FL != 0
    }

    /// Block count in filesystem blocks.
    #[must_use]
    pub fn block_count(&self, block_size: BlockSize) -> u64 {
        if self.flags & HUGE_FILE_FL != 0 {
            self.blocks_raw
        } else {
            // Sector count; one block is block_size / 512 sectors.
            self.blocks_raw / u64::from(block_size.get() / 512)
        }
    }

    /// Store a block count, switching to huge representation on overflow
    /// of the 48-bit sector count.
    pub fn set_block_count(&mut self, blocks: u64, block_size: BlockSize) {
        let sectors_per_block = u64::from(block_size.get() / 512);
        match blocks.checked_mul(sectors_per_block) {
            Some(sectors) if sectors < (1 << 48) => {
                self.flags &= !HUGE_FILE_FL;
                self.blocks_raw = sectors;
            }
            _ => {
                self.flags |= HUGE_FILE_FL;
                self.blocks_raw = blocks;
            }
        }
    }

    /// Parse from one inode-table record.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < INODE_RECORD_BYTES {
            return Err(RimeError::Format(format!(
                "inode record too short: {} < {INODE_RECORD_BYTES}",
                raw.len()
            )));
        }
        let mode = read_le_u16(raw, 0x00).map_err(format_err)?;
        let links_count = read_le_u16(raw, 0x02).map_err(format_err)?;
        let size = read_le_u64(raw, 0x04).map_err(format_err)?;
        let atime = read_le_u32(raw, 0x0C).map_err(format_err)?;
        let ctime = read_le_u32(raw, 0x10).map_err(format_err)?;
        let mtime = read_le_u32(raw, 0x14).map_err(format_err)?;
        let dtime = read_le_u32(raw, 0x18).map_err(format_err)?;
        let uid = read_le_u32(raw, 0x1C).map_err(format_err)?;
        let gid = read_le_u32(raw, 0x20).map_err(format_err)?;
        let flags = read_le_u32(raw, 0x24).map_err(format_err)?;
        let generation = read_le_u32(raw, 0x64).map_err(format_err)?;
        let blocks_lo = read_le_u32(raw, 0x68).map_err(format_err)?;
        let blocks_high = read_le_u16(raw, 0x6C).map_err(format_err)?;
        let next_snapshot = read_le_u32(raw, 0x70).map_err(format_err)?;

        let snapshot = flags & SNAPFILE_FL != 0;
        let mut slots = [0u32; SNAP_N_BLOCKS];
        for logical in 0..N_BLOCKS {
            let word = slot_disk_index(snapshot, logical);
            slots[logical] =
                read_le_u32(raw, SLOT_ARRAY_OFFSET + word * 4).map_err(format_err)?;
        }
        if snapshot {
            for k in 0..NTIND_SLOTS {
                slots[N_BLOCKS + k] =
                    read_le_u32(raw, EXTRA_TIND_OFFSET + k * 4).map_err(format_err)?;
            }
        }

        Ok(Self {
            mode,
            links_count,
            size,
            atime,
            ctime,
            mtime,
            dtime,
            uid,
            gid,
            flags,
            generation,
            blocks_raw: u64::from(blocks_lo) | (u64::from(blocks_high) << 32),
            next_snapshot,
            slots,
        })
    }

    /// Serialize into an `inode_size`-byte record.
    pub fn serialize(&self, inode_size: usize) -> Result<Vec<u8>> {
        if inode_size < INODE_RECORD_BYTES {
            return Err(RimeError::Format(format!(
                "inode_size {inode_size} below record size {INODE_RECORD_BYTES}"
            )));
        }
        let mut raw = vec![0u8; inode_size];
        raw[0x00..0x02].copy_from_slice(&self.mode.to_le_bytes());
        raw[0x02..0x04].copy_from_slice(&self.links_count.to_le_bytes());
        raw[0x04..0x0C].copy_from_slice(&self.size.to_le_bytes());
        raw[0x0C..0x10].copy_from_slice(&self.atime.to_le_bytes());
        raw[0x10..0x14].copy_from_slice(&self.ctime.to_le_bytes());
        raw[0x14..0x18].copy_from_slice(&self.mtime.to_le_bytes());
        raw[0x18..0x1C].copy_from_slice(&self.dtime.to_le_bytes());
        raw[0x1C..0x20].copy_from_slice(&self.uid.to_le_bytes());
        raw[0x20..0x24].copy_from_slice(&self.gid.to_le_bytes());
        raw[0x24..0x28].copy_from_slice(&self.flags.to_le_bytes());
        raw[0x64..0x68].copy_from_slice(&self.generation.to_le_bytes());
        #[allow(clippy::cast_possible_truncation)]
        let blocks_lo = self.blocks_raw as u32;
        #[allow(clippy::cast_possible_truncation)]
        let blocks_high = ((self.blocks_raw >> 32) & 0xFFFF) as u16;
        raw[0x68..0x6C].copy_from_slice(&blocks_lo.to_le_bytes());
        raw[0x6C..0x6E].copy_from_slice(&blocks_high.to_le_bytes());
        raw[0x70..0x74].copy_from_slice(&self.next_snapshot.to_le_bytes());

        let snapshot = self.is_snapshot();
        for logical in 0..N_BLOCKS {
            let word = slot_disk_index(snapshot, logical);
            let off = SLOT_ARRAY_OFFSET + word * 4;
            raw[off..off + 4].copy_from_slice(&self.slots[logical].to_le_bytes());
        }
        if snapshot {
            for k in 0..NTIND_SLOTS {
                let off = EXTRA_TIND_OFFSET + k * 4;
                raw[off..off + 4].copy_from_slice(&self.slots[N_BLOCKS + k].to_le_bytes());
            }
        } else if self.slots[N_BLOCKS..].iter().any(|s| *s != 0) {
            return Err(RimeError::Format(
                "extended TIND slots set on a non-snapshot inode".to_owned(),
            ));
        }

        Ok(raw)
    }
}

/// On-disk word index of a logical slot within the 15-word slot array.
///
/// Regular inodes store slots in logical order. Snapshot inodes rotate the
/// array so the indirect roots come first and the conventional direct
/// slots land at the end; the extra triple-indirect roots live outside the
/// 60-byte array (at [`EXTRA_TIND_OFFSET`]).
#[must_use]
pub fn slot_disk_index(snapshot: bool, logical: usize) -> usize {
    debug_assert!(logical < N_BLOCKS);
    if snapshot {
        (logical + N_BLOCKS - DIR_BLOCKS) % N_BLOCKS
    } else {
        logical
    }
}

// ── Group descriptor ────────────────────────────────────────────────────────

/// Size of one group descriptor on disk.
pub const GROUP_DESC_BYTES: usize = 32;

/// Block group descriptor.
///
/// The snapshot COW bitmap block for a group is deliberately *not* stored
/// here: it is a volatile per-mount cache rebuilt on first access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDesc {
    pub block_bitmap: BlockNumber,
    pub inode_bitmap: BlockNumber,
    pub inode_table: BlockNumber,
    /// Exclude bitmap block (0 = none); blocks of excluded files are
    /// cleared from COW bitmaps at initialization.
    pub exclude_bitmap: BlockNumber,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
    pub flags: u16,
}

impl GroupDesc {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < GROUP_DESC_BYTES {
            return Err(RimeError::Format(format!(
                "group descriptor too short: {} < {GROUP_DESC_BYTES}",
                raw.len()
            )));
        }
        Ok(Self {
            block_bitmap: BlockNumber(u64::from(read_le_u32(raw, 0x00).map_err(format_err)?)),
            inode_bitmap: BlockNumber(u64::from(read_le_u32(raw, 0x04).map_err(format_err)?)),
            inode_table: BlockNumber(u64::from(read_le_u32(raw, 0x08).map_err(format_err)?)),
            exclude_bitmap: BlockNumber(u64::from(read_le_u32(raw, 0x0C).map_err(format_err)?)),
            free_blocks_count: read_le_u16(raw, 0x10).map_err(format_err)?,
            free_inodes_count: read_le_u16(raw, 0x12).map_err(format_err)?,
            used_dirs_count: read_le_u16(raw, 0x14).map_err(format_err)?,
            flags: read_le_u16(raw, 0x16).map_err(format_err)?,
        })
    }

    pub fn serialize(&self) -> Result<[u8; GROUP_DESC_BYTES]> {
        let mut raw = [0u8; GROUP_DESC_BYTES];
        raw[0x00..0x04].copy_from_slice(&self.block_bitmap.to_u32().map_err(format_err)?.to_le_bytes());
        raw[0x04..0x08].copy_from_slice(&self.inode_bitmap.to_u32().map_err(format_err)?.to_le_bytes());
        raw[0x08..0x0C].copy_from_slice(&self.inode_table.to_u32().map_err(format_err)?.to_le_bytes());
        raw[0x0C..0x10]
            .copy_from_slice(&self.exclude_bitmap.to_u32().map_err(format_err)?.to_le_bytes());
        raw[0x10..0x12].copy_from_slice(&self.free_blocks_count.to_le_bytes());
        raw[0x12..0x14].copy_from_slice(&self.free_inodes_count.to_le_bytes());
        raw[0x14..0x16].copy_from_slice(&self.used_dirs_count.to_le_bytes());
        raw[0x16..0x18].copy_from_slice(&self.flags.to_le_bytes());
        Ok(raw)
    }
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// Byte offset of the superblock on the device.
pub const SUPERBLOCK_OFFSET: usize = 1024;
/// Size of the superblock region.
pub const SUPERBLOCK_BYTES: usize = 1024;
/// RimeFS magic.
pub const RIME_MAGIC: u32 = 0x524D_4653; // "RMFS"

/// Mount-time filesystem parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub blocks_count: u64,
    pub inodes_count: u32,
    pub first_data_block: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub block_size: BlockSize,
    /// First block of the journal region.
    pub journal_start: BlockNumber,
    /// Length of the journal region in blocks.
    pub journal_blocks: u64,
    /// Head of the on-disk orphan list (0 = empty).
    pub orphan_head: u32,
    /// Active snapshot inode (0 = none).
    pub active_snapshot: u32,
    /// Head of the snapshot list, newest first (0 = empty).
    pub snapshot_list_head: u32,
}

impl Superblock {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 0x40 {
            return Err(RimeError::Format("superblock region too short".to_owned()));
        }
        let magic = read_le_u32(raw, 0x00).map_err(format_err)?;
        if magic != RIME_MAGIC {
            return Err(RimeError::Format(format!(
                "bad superblock magic: {magic:#x}"
            )));
        }
        let log_block_size = read_le_u32(raw, 0x04).map_err(format_err)?;
        let block_size = BlockSize::new(
            1024u32
                .checked_shl(log_block_size)
                .ok_or_else(|| RimeError::Format("log_block_size too large".to_owned()))?,
        )
        .map_err(format_err)?;
        Ok(Self {
            block_size,
            blocks_count: read_le_u64(raw, 0x08).map_err(format_err)?,
            inodes_count: read_le_u32(raw, 0x10).map_err(format_err)?,
            first_data_block: read_le_u32(raw, 0x14).map_err(format_err)?,
            blocks_per_group: read_le_u32(raw, 0x18).map_err(format_err)?,
            inodes_per_group: read_le_u32(raw, 0x1C).map_err(format_err)?,
            inode_size: read_le_u16(raw, 0x20).map_err(format_err)?,
            journal_start: BlockNumber(u64::from(
                read_le_u32(raw, 0x24).map_err(format_err)?,
            )),
            journal_blocks: u64::from(read_le_u32(raw, 0x28).map_err(format_err)?),
            orphan_head: read_le_u32(raw, 0x2C).map_err(format_err)?,
            active_snapshot: read_le_u32(raw, 0x30).map_err(format_err)?,
            snapshot_list_head: read_le_u32(raw, 0x34).map_err(format_err)?,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut raw = vec![0u8; SUPERBLOCK_BYTES];
        raw[0x00..0x04].copy_from_slice(&RIME_MAGIC.to_le_bytes());
        let log_block_size = self.block_size.get().trailing_zeros() - 10;
        raw[0x04..0x08].copy_from_slice(&log_block_size.to_le_bytes());
        raw[0x08..0x10].copy_from_slice(&self.blocks_count.to_le_bytes());
        raw[0x10..0x14].copy_from_slice(&self.inodes_count.to_le_bytes());
        raw[0x14..0x18].copy_from_slice(&self.first_data_block.to_le_bytes());
        raw[0x18..0x1C].copy_from_slice(&self.blocks_per_group.to_le_bytes());
        raw[0x1C..0x20].copy_from_slice(&self.inodes_per_group.to_le_bytes());
        raw[0x20..0x22].copy_from_slice(&self.inode_size.to_le_bytes());
        raw[0x24..0x28]
            .copy_from_slice(&self.journal_start.to_u32().map_err(format_err)?.to_le_bytes());
        let journal_blocks = u32::try_from(self.journal_blocks)
            .map_err(|_| RimeError::Format("journal region too large".to_owned()))?;
        raw[0x28..0x2C].copy_from_slice(&journal_blocks.to_le_bytes());
        raw[0x2C..0x30].copy_from_slice(&self.orphan_head.to_le_bytes());
        raw[0x30..0x34].copy_from_slice(&self.active_snapshot.to_le_bytes());
        raw[0x34..0x38].copy_from_slice(&self.snapshot_list_head.to_le_bytes());
        Ok(raw)
    }

    /// Number of block groups implied by the geometry.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn group_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        let data_blocks = self
            .blocks_count
            .saturating_sub(u64::from(self.first_data_block));
        data_blocks.div_ceil(u64::from(self.blocks_per_group)) as u32
    }
}

/// Compute the disk location of an inode record within its group's table.
#[must_use]
pub fn inode_location(
    ino: InodeNumber,
    inodes_per_group: u32,
    inode_size: u16,
    block_size: BlockSize,
    table_start: BlockNumber,
) -> (BlockNumber, usize) {
    let index = rime_types::inode_index_in_group(ino, inodes_per_group);
    let byte_in_table = u64::from(index) * u64::from(inode_size);
    let block_offset = byte_in_table / u64::from(block_size.get());
    #[allow(clippy::cast_possible_truncation)]
    let byte_offset = (byte_in_table % u64::from(block_size.get())) as usize;
    (BlockNumber(table_start.0 + block_offset), byte_offset)
}

/// Group number owning an inode.
#[must_use]
pub fn inode_group(ino: InodeNumber, inodes_per_group: u32) -> GroupNumber {
    rime_types::inode_to_group(ino, inodes_per_group)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rime_types::{DIND_SLOT, IND_SLOT, TIND_SLOT};

    #[test]
    fn regular_slot_layout_is_identity() {
        for logical in 0..N_BLOCKS {
            assert_eq!(slot_disk_index(false, logical), logical);
        }
    }

    #[test]
    fn snapshot_slot_layout_rotates_directs_to_end() {
        // Indirect roots first.
        assert_eq!(slot_disk_index(true, IND_SLOT), 0);
        assert_eq!(slot_disk_index(true, DIND_SLOT), 1);
        assert_eq!(slot_disk_index(true, TIND_SLOT), 2);
        // Direct slots occupy the tail of the array.
        assert_eq!(slot_disk_index(true, 0), 3);
        assert_eq!(slot_disk_index(true, 11), 14);
        // The rotation is a permutation.
        let mut seen = [false; N_BLOCKS];
        for logical in 0..N_BLOCKS {
            let word = slot_disk_index(true, logical);
            assert!(!seen[word]);
            seen[word] = true;
        }
    }

    fn sample_inode(snapshot: bool) -> RawInode {
        let mut inode = RawInode::zeroed();
        inode.mode = 0o100_644;
        inode.links_count = 1;
        inode.size = 70_000;
        inode.uid = 1000;
        inode.gid = 1000;
        inode.atime = 1_700_000_000;
        inode.ctime = 1_700_000_001;
        inode.mtime = 1_700_000_002;
        inode.generation = 7;
        if snapshot {
            inode.flags |= SNAPFILE_FL;
            inode.next_snapshot = 12;
            for k in 0..NTIND_SLOTS {
                inode.slots[N_BLOCKS + k] = 9000 + k as u32;
            }
        }
        for (i, slot) in inode.slots[..N_BLOCKS].iter_mut().enumerate() {
            *slot = 100 + i as u32;
        }
        inode
    }

    #[test]
    fn inode_round_trip_regular() {
        let inode = sample_inode(false);
        let raw = inode.serialize(256).unwrap();
        assert_eq!(raw.len(), 256);
        let parsed = RawInode::parse(&raw).unwrap();
        assert_eq!(parsed, inode);
    }

    #[test]
    fn inode_round_trip_snapshot() {
        let inode = sample_inode(true);
        let raw = inode.serialize(256).unwrap();
        let parsed = RawInode::parse(&raw).unwrap();
        assert_eq!(parsed, inode);
        // The on-disk words really are rotated: word 0 is the IND root.
        assert_eq!(
            read_le_u32(&raw, SLOT_ARRAY_OFFSET).unwrap(),
            inode.slots[IND_SLOT]
        );
    }

    #[test]
    fn extended_slots_refused_on_regular_inode() {
        let mut inode = sample_inode(false);
        inode.slots[N_BLOCKS] = 1;
        assert!(inode.serialize(256).is_err());
    }

    #[test]
    fn block_count_sector_and_huge() {
        let bs = BlockSize::new(1024).unwrap();
        let mut inode = RawInode::zeroed();

        inode.set_block_count(10, bs);
        assert_eq!(inode.flags & HUGE_FILE_FL, 0);
        assert_eq!(inode.blocks_raw, 20); // 2 sectors per 1K block
        assert_eq!(inode.block_count(bs), 10);

        // A count whose sector representation exceeds 48 bits flips HUGE.
        inode.set_block_count(1 << 47, bs);
        assert_ne!(inode.flags & HUGE_FILE_FL, 0);
        assert_eq!(inode.blocks_raw, 1 << 47);
        assert_eq!(inode.block_count(bs), 1 << 47);
    }

    #[test]
    fn group_desc_round_trip() {
        let gd = GroupDesc {
            block_bitmap: BlockNumber(101),
            inode_bitmap: BlockNumber(102),
            inode_table: BlockNumber(103),
            exclude_bitmap: BlockNumber(0),
            free_blocks_count: 8000,
            free_inodes_count: 2040,
            used_dirs_count: 3,
            flags: 0,
        };
        let raw = gd.serialize().unwrap();
        assert_eq!(GroupDesc::parse(&raw).unwrap(), gd);
    }

    #[test]
    fn superblock_round_trip() {
        let sb = Superblock {
            blocks_count: 32_768,
            inodes_count: 8192,
            first_data_block: 1,
            blocks_per_group: 8192,
            inodes_per_group: 2048,
            inode_size: 256,
            block_size: BlockSize::new(1024).unwrap(),
            journal_start: BlockNumber(24),
            journal_blocks: 256,
            orphan_head: 0,
            active_snapshot: 0,
            snapshot_list_head: 0,
        };
        let raw = sb.serialize().unwrap();
        let parsed = Superblock::parse(&raw).unwrap();
        assert_eq!(parsed, sb);
        assert_eq!(parsed.group_count(), 4);
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let mut raw = vec![0u8; SUPERBLOCK_BYTES];
        raw[0] = 0xFF;
        assert!(Superblock::parse(&raw).is_err());
    }

    #[test]
    fn inode_location_math() {
        let bs = BlockSize::new(1024).unwrap();
        // 4 inodes of 256 bytes per 1K block.
        let (block, offset) = inode_location(InodeNumber(1), 2048, 256, bs, BlockNumber(50));
        assert_eq!((block, offset), (BlockNumber(50), 0));
        let (block, offset) = inode_location(InodeNumber(5), 2048, 256, bs, BlockNumber(50));
        assert_eq!((block, offset), (BlockNumber(51), 0));
        let (block, offset) = inode_location(InodeNumber(6), 2048, 256, bs, BlockNumber(50));
        assert_eq!((block, offset), (BlockNumber(51), 256));
    }

    proptest! {
        #[test]
        fn inode_codec_round_trip_any_slots(
            slots in proptest::array::uniform32(any::<u32>()),
            snapshot in any::<bool>(),
            size in any::<u64>(),
        ) {
            let mut inode = RawInode::zeroed();
            inode.size = size;
            if snapshot {
                inode.flags |= SNAPFILE_FL;
            }
            for (i, slot) in inode.slots.iter_mut().enumerate() {
                let limit = if snapshot { SNAP_N_BLOCKS } else { N_BLOCKS };
                if i < limit {
                    *slot = slots[i];
                }
            }
            let raw = inode.serialize(256).unwrap();
            prop_assert_eq!(RawInode::parse(&raw).unwrap(), inode);
        }
    }
}
