#![forbid(unsafe_code)]
//! Block and inode allocation.
//!
//! Goal-directed best-effort block allocation over per-group bitmaps,
//! plus a small inode allocator for file creation. Every bitmap
//! modification routes through the journal's bitmap-access hook *before*
//! the group lock is taken, so the snapshot engine can materialize the
//! group's COW bitmap without re-entering the lock.

use asupersync::Cx;
use parking_lot::Mutex;
use rime_block::{BufferCache, BufferRef};
use rime_error::{Result, RimeError};
use rime_journal::{DeleteAccess, Handle, Journal};
use rime_ondisk::GroupDesc;
use rime_types::{BlockNumber, GroupNumber, InodeNumber};
use tracing::{debug, trace};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros().min(8);
    }
    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 0 {
                free += 1;
            }
        }
    }
    free
}

/// Find the first free bit at or after `start` within `count` bits,
/// wrapping around once.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    for idx in start..count {
        if !bitmap_get(bitmap, idx) {
            return Some(idx);
        }
    }
    (0..start).find(|&idx| !bitmap_get(bitmap, idx))
}

/// Find a run of free bits: starting exactly at `hint` if it is free,
/// otherwise at the first free bit at or after `hint` (wrapping).
/// Returns `(start, len)` with `1 <= len <= want`.
#[must_use]
pub fn bitmap_find_run(bitmap: &[u8], count: u32, hint: u32, want: u32) -> Option<(u32, u32)> {
    if want == 0 || count == 0 {
        return None;
    }
    let start = bitmap_find_free(bitmap, count, hint.min(count.saturating_sub(1)))?;
    let mut len = 1u32;
    while len < want && start + len < count && !bitmap_get(bitmap, start + len) {
        len += 1;
    }
    Some((start, len))
}

// ── Geometry and group state ────────────────────────────────────────────────

/// Cached filesystem geometry needed by the allocator and the mapping core.
#[derive(Debug, Clone)]
pub struct FsGeometry {
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub block_size: rime_types::BlockSize,
    pub total_blocks: u64,
    pub first_data_block: u32,
    pub group_count: u32,
    pub inode_size: u16,
}

impl FsGeometry {
    /// Derive geometry from a parsed superblock.
    #[must_use]
    pub fn from_superblock(sb: &rime_ondisk::Superblock) -> Self {
        Self {
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            block_size: sb.block_size,
            total_blocks: sb.blocks_count,
            first_data_block: sb.first_data_block,
            group_count: sb.group_count(),
            inode_size: sb.inode_size,
        }
    }

    /// Number of blocks in a specific group (the last group may be short).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        let group_start = u64::from(self.first_data_block)
            + u64::from(group.0) * u64::from(self.blocks_per_group);
        let remaining = self.total_blocks.saturating_sub(group_start);
        if remaining >= u64::from(self.blocks_per_group) {
            self.blocks_per_group
        } else {
            remaining as u32
        }
    }

    /// Absolute block number for a relative block within a group.
    #[must_use]
    pub fn group_block_to_absolute(&self, group: GroupNumber, rel: u32) -> BlockNumber {
        BlockNumber(
            u64::from(self.first_data_block)
                + u64::from(group.0) * u64::from(self.blocks_per_group)
                + u64::from(rel),
        )
    }

    /// Convert an absolute block to `(group, relative_block)`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn absolute_to_group_block(&self, block: BlockNumber) -> (GroupNumber, u32) {
        let rel = block.0.saturating_sub(u64::from(self.first_data_block));
        (
            GroupNumber((rel / u64::from(self.blocks_per_group)) as u32),
            (rel % u64::from(self.blocks_per_group)) as u32,
        )
    }

    /// First block of a group.
    #[must_use]
    pub fn group_first_block(&self, group: GroupNumber) -> BlockNumber {
        self.group_block_to_absolute(group, 0)
    }
}

/// Cached per-group statistics, mirroring the on-disk group descriptor.
#[derive(Debug, Clone)]
pub struct GroupStats {
    pub group: GroupNumber,
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub used_dirs: u32,
    pub block_bitmap_block: BlockNumber,
    pub inode_bitmap_block: BlockNumber,
    pub inode_table_block: BlockNumber,
    pub exclude_bitmap_block: BlockNumber,
}

impl GroupStats {
    /// Create from a parsed group descriptor.
    #[must_use]
    pub fn from_group_desc(group: GroupNumber, gd: &GroupDesc) -> Self {
        Self {
            group,
            free_blocks: u32::from(gd.free_blocks_count),
            free_inodes: u32::from(gd.free_inodes_count),
            used_dirs: u32::from(gd.used_dirs_count),
            block_bitmap_block: gd.block_bitmap,
            inode_bitmap_block: gd.inode_bitmap,
            inode_table_block: gd.inode_table,
            exclude_bitmap_block: gd.exclude_bitmap,
        }
    }
}

// ── Allocation results ──────────────────────────────────────────────────────

/// Result of a block allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAlloc {
    /// First allocated block.
    pub start: BlockNumber,
    /// Number of contiguous blocks allocated (best effort, >= 1).
    pub count: u64,
}

/// Result of an inode allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeAlloc {
    pub ino: InodeNumber,
    pub group: GroupNumber,
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Block and inode allocator for one mounted filesystem.
///
/// Per-group state is independently locked; the lock covers only the
/// bitmap read-modify-write, never hook invocation or journal I/O.
pub struct Allocator {
    geo: FsGeometry,
    groups: Vec<Mutex<GroupStats>>,
}

impl Allocator {
    #[must_use]
    pub fn new(geo: FsGeometry, groups: Vec<GroupStats>) -> Self {
        Self {
            geo,
            groups: groups.into_iter().map(Mutex::new).collect(),
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geo
    }

    /// Snapshot of one group's cached descriptor state.
    pub fn group_desc(&self, group: GroupNumber) -> Result<GroupStats> {
        self.groups
            .get(group.0 as usize)
            .map(|g| g.lock().clone())
            .ok_or_else(|| RimeError::Format(format!("group {group} out of range")))
    }

    /// Read a group's live block bitmap through the cache.
    pub fn read_block_bitmap(&self, cx: &Cx, cache: &BufferCache, group: GroupNumber) -> Result<BufferRef> {
        let desc = self.group_desc(group)?;
        cache.read(cx, desc.block_bitmap_block)
    }

    /// Total free blocks across all groups.
    #[must_use]
    pub fn free_block_count(&self) -> u64 {
        self.groups
            .iter()
            .map(|g| u64::from(g.lock().free_blocks))
            .sum()
    }

    /// Allocate up to `count` contiguous blocks near `goal`, best effort.
    ///
    /// Returns at least one block or `NoSpace`. The run never crosses a
    /// group boundary.
    pub fn new_blocks(
        &self,
        cx: &Cx,
        journal: &Journal,
        handle: &Handle,
        goal: BlockNumber,
        count: u64,
    ) -> Result<BlockAlloc> {
        if count == 0 {
            return Err(RimeError::Format("cannot allocate 0 blocks".into()));
        }
        let goal = if goal.0 >= self.geo.total_blocks {
            BlockNumber(u64::from(self.geo.first_data_block))
        } else {
            goal
        };
        let (goal_group, goal_rel) = self.geo.absolute_to_group_block(goal);

        if let Some(alloc) =
            self.try_group(cx, journal, handle, goal_group, goal_rel, count)?
        {
            return Ok(alloc);
        }
        // Nearby groups first, then a full scan.
        for delta in 1..=8u32 {
            for dir in [1i64, -1i64] {
                let g = i64::from(goal_group.0) + dir * i64::from(delta);
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                if g >= 0 && (g as u32) < self.geo.group_count {
                    let group = GroupNumber(g as u32);
                    if let Some(alloc) = self.try_group(cx, journal, handle, group, 0, count)? {
                        return Ok(alloc);
                    }
                }
            }
        }
        for g in 0..self.geo.group_count {
            let group = GroupNumber(g);
            if group == goal_group {
                continue;
            }
            if let Some(alloc) = self.try_group(cx, journal, handle, group, 0, count)? {
                return Ok(alloc);
            }
        }
        Err(RimeError::NoSpace)
    }

    fn try_group(
        &self,
        cx: &Cx,
        journal: &Journal,
        handle: &Handle,
        group: GroupNumber,
        rel_hint: u32,
        count: u64,
    ) -> Result<Option<BlockAlloc>> {
        let Some(slot) = self.groups.get(group.0 as usize) else {
            return Ok(None);
        };
        if slot.lock().free_blocks == 0 {
            return Ok(None);
        }
        let bitmap_block = slot.lock().block_bitmap_block;
        let buf = journal.cache().read(cx, bitmap_block)?;
        // The COW hook runs before the group lock so the snapshot engine
        // can allocate its bitmap copy without re-entering it.
        journal.get_bitmap_access(cx, handle, group, &buf)?;

        let bits = self.geo.blocks_in_group(group);
        let want = u32::try_from(count.min(u64::from(bits))).unwrap_or(u32::MAX);

        let found = {
            let mut stats = slot.lock();
            let run = buf.with_data(|data| bitmap_find_run(data, bits, rel_hint, want));
            if let Some((start, len)) = run {
                buf.update(|data| {
                    for idx in start..start + len {
                        bitmap_set(data, idx);
                    }
                });
                stats.free_blocks = stats.free_blocks.saturating_sub(len);
            }
            run
        };

        let Some((start_rel, len)) = found else {
            return Ok(None);
        };
        journal.dirty_metadata(cx, handle, &buf)?;
        let start = self.geo.group_block_to_absolute(group, start_rel);
        trace!(
            event = "blocks_allocated",
            group = group.0,
            start = start.0,
            count = len
        );
        Ok(Some(BlockAlloc {
            start,
            count: u64::from(len),
        }))
    }

    /// Return `count` blocks starting at `start` to the free pool.
    ///
    /// Each leading run is first offered to the snapshot engine through
    /// the delete-access hook; inherited runs keep their bitmap bits.
    pub fn free_blocks(
        &self,
        cx: &Cx,
        journal: &Journal,
        handle: &Handle,
        ino: InodeNumber,
        start: BlockNumber,
        count: u64,
    ) -> Result<()> {
        let mut pos = start;
        let mut remaining = count;
        while remaining > 0 {
            let (group, rel) = self.geo.absolute_to_group_block(pos);
            if group.0 >= self.geo.group_count {
                return Err(RimeError::Inconsistency {
                    block: pos.0,
                    detail: "freeing block beyond last group".into(),
                });
            }
            // Clamp the run to the group boundary.
            let bits = self.geo.blocks_in_group(group);
            if rel >= bits {
                return Err(RimeError::Inconsistency {
                    block: pos.0,
                    detail: "freeing block beyond group data area".into(),
                });
            }
            let in_group = u64::from(bits - rel).min(remaining);

            match journal.get_delete_access(cx, handle, ino, pos, in_group)? {
                DeleteAccess::Inherited(n) => {
                    let n = n.clamp(1, in_group);
                    debug!(
                        event = "blocks_inherited",
                        ino = ino.0,
                        start = pos.0,
                        count = n
                    );
                    pos = pos
                        .checked_add(n)
                        .ok_or_else(|| RimeError::Format("block range overflow".into()))?;
                    remaining -= n;
                }
                DeleteAccess::Freeable(n) => {
                    let n = n.clamp(1, in_group);
                    self.clear_run(cx, journal, handle, group, rel, n)?;
                    pos = pos
                        .checked_add(n)
                        .ok_or_else(|| RimeError::Format("block range overflow".into()))?;
                    remaining -= n;
                }
            }
        }
        Ok(())
    }

    fn clear_run(
        &self,
        cx: &Cx,
        journal: &Journal,
        handle: &Handle,
        group: GroupNumber,
        rel: u32,
        count: u64,
    ) -> Result<()> {
        let Some(slot) = self.groups.get(group.0 as usize) else {
            return Err(RimeError::Format(format!("group {group} out of range")));
        };
        let bitmap_block = slot.lock().block_bitmap_block;
        let buf = journal.cache().read(cx, bitmap_block)?;
        journal.get_bitmap_access(cx, handle, group, &buf)?;

        #[allow(clippy::cast_possible_truncation)]
        let count32 = count as u32;
        let double_free = {
            let mut stats = slot.lock();
            let double_free = buf.update(|data| {
                let mut double_free = None;
                for idx in rel..rel + count32 {
                    if !bitmap_get(data, idx) {
                        double_free = Some(idx);
                        break;
                    }
                    bitmap_clear(data, idx);
                }
                double_free
            });
            if double_free.is_none() {
                stats.free_blocks = stats.free_blocks.saturating_add(count32);
            }
            double_free
        };
        if let Some(idx) = double_free {
            let block = self.geo.group_block_to_absolute(group, idx);
            return Err(RimeError::Inconsistency {
                block: block.0,
                detail: "freeing a block that is already free".into(),
            });
        }
        journal.dirty_metadata(cx, handle, &buf)?;
        trace!(
            event = "blocks_freed",
            group = group.0,
            rel,
            count = count32
        );
        Ok(())
    }

    // ── Inodes ──────────────────────────────────────────────────────────

    /// Allocate an inode, preferring `parent_group`.
    pub fn alloc_inode(
        &self,
        cx: &Cx,
        journal: &Journal,
        handle: &Handle,
        parent_group: GroupNumber,
        is_dir: bool,
    ) -> Result<InodeAlloc> {
        let order = (0..self.geo.group_count)
            .map(|off| GroupNumber((parent_group.0 + off) % self.geo.group_count));
        for group in order {
            let Some(slot) = self.groups.get(group.0 as usize) else {
                continue;
            };
            if slot.lock().free_inodes == 0 {
                continue;
            }
            let bitmap_block = slot.lock().inode_bitmap_block;
            let buf = journal.cache().read(cx, bitmap_block)?;
            journal.get_write_access(cx, handle, &buf)?;

            let found = {
                let mut stats = slot.lock();
                let idx = buf.with_data(|data| bitmap_find_free(data, self.geo.inodes_per_group, 0));
                if let Some(idx) = idx {
                    buf.update(|data| bitmap_set(data, idx));
                    stats.free_inodes = stats.free_inodes.saturating_sub(1);
                    if is_dir {
                        stats.used_dirs += 1;
                    }
                }
                idx
            };
            let Some(idx) = found else { continue };
            journal.dirty_metadata(cx, handle, &buf)?;
            let ino = InodeNumber(
                u64::from(group.0) * u64::from(self.geo.inodes_per_group) + u64::from(idx) + 1,
            );
            return Ok(InodeAlloc { ino, group });
        }
        Err(RimeError::NoSpace)
    }

    /// Free an inode's bitmap bit.
    pub fn free_inode(
        &self,
        cx: &Cx,
        journal: &Journal,
        handle: &Handle,
        ino: InodeNumber,
        was_dir: bool,
    ) -> Result<()> {
        let group = rime_types::inode_to_group(ino, self.geo.inodes_per_group);
        let idx = rime_types::inode_index_in_group(ino, self.geo.inodes_per_group);
        let Some(slot) = self.groups.get(group.0 as usize) else {
            return Err(RimeError::Format(format!("inode {ino} out of range")));
        };
        let bitmap_block = slot.lock().inode_bitmap_block;
        let buf = journal.cache().read(cx, bitmap_block)?;
        journal.get_write_access(cx, handle, &buf)?;
        {
            let mut stats = slot.lock();
            buf.update(|data| bitmap_clear(data, idx));
            stats.free_inodes = stats.free_inodes.saturating_add(1);
            if was_dir {
                stats.used_dirs = stats.used_dirs.saturating_sub(1);
            }
        }
        journal.dirty_metadata(cx, handle, &buf)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rime_block::MemBlockDevice;
    use rime_journal::JournalRegion;
    use std::sync::Arc;

    fn test_cx() -> Cx {
        Cx::for_testing()
    }

    fn geometry() -> FsGeometry {
        FsGeometry {
            blocks_per_group: 1024,
            inodes_per_group: 256,
            block_size: rime_types::BlockSize::new(1024).unwrap(),
            total_blocks: 4096,
            first_data_block: 1,
            group_count: 4,
            inode_size: 256,
        }
    }

    fn setup() -> (Arc<BufferCache>, Journal, Allocator) {
        let dev = Arc::new(MemBlockDevice::new(1024, 8192));
        let cache = Arc::new(BufferCache::new(dev as Arc<dyn rime_block::BlockDevice>));
        let journal = Journal::new(
            Arc::clone(&cache),
            JournalRegion {
                start: BlockNumber(4200),
                blocks: 128,
            },
        );
        let geo = geometry();
        let groups = (0..geo.group_count)
            .map(|g| GroupStats {
                group: GroupNumber(g),
                free_blocks: geo.blocks_in_group(GroupNumber(g)),
                free_inodes: geo.inodes_per_group,
                used_dirs: 0,
                block_bitmap_block: BlockNumber(u64::from(g) * 100 + 4300),
                inode_bitmap_block: BlockNumber(u64::from(g) * 100 + 4301),
                inode_table_block: BlockNumber(u64::from(g) * 100 + 4302),
                exclude_bitmap_block: BlockNumber(0),
            })
            .collect();
        let alloc = Allocator::new(geo, groups);
        (cache, journal, alloc)
    }

    #[test]
    fn bitmap_basics() {
        let mut bm = vec![0u8; 16];
        assert!(!bitmap_get(&bm, 10));
        bitmap_set(&mut bm, 10);
        assert!(bitmap_get(&bm, 10));
        bitmap_clear(&mut bm, 10);
        assert!(!bitmap_get(&bm, 10));
        assert_eq!(bitmap_count_free(&bm, 128), 128);
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 127);
        assert_eq!(bitmap_count_free(&bm, 128), 126);
    }

    #[test]
    fn find_run_prefers_hint_and_caps_length() {
        let mut bm = vec![0u8; 16];
        bitmap_set(&mut bm, 5);
        // Hint lands on a used bit: first free after it is 6.
        assert_eq!(bitmap_find_run(&bm, 128, 5, 4), Some((6, 4)));
        // Run capped by next used bit.
        bitmap_set(&mut bm, 8);
        assert_eq!(bitmap_find_run(&bm, 128, 5, 4), Some((6, 2)));
        // Wrap-around search.
        assert_eq!(bitmap_find_run(&bm, 8, 7, 2), Some((0, 2)));
    }

    #[test]
    fn alloc_honors_goal() {
        let cx = test_cx();
        let (_cache, journal, alloc) = setup();
        let handle = journal.start(&cx, 8).unwrap();

        let got = alloc
            .new_blocks(&cx, &journal, &handle, BlockNumber(200), 4)
            .unwrap();
        assert_eq!(got.start, BlockNumber(200));
        assert_eq!(got.count, 4);
        journal.stop(&cx, &handle).unwrap();
    }

    #[test]
    fn alloc_is_best_effort_when_fragmented() {
        let cx = test_cx();
        let (_cache, journal, alloc) = setup();
        let handle = journal.start(&cx, 8).unwrap();

        // Occupy the block right after the goal so only 1 block fits there.
        let first = alloc
            .new_blocks(&cx, &journal, &handle, BlockNumber(101), 1)
            .unwrap();
        assert_eq!(first.start, BlockNumber(101));
        let got = alloc
            .new_blocks(&cx, &journal, &handle, BlockNumber(100), 8)
            .unwrap();
        assert_eq!(got.start, BlockNumber(100));
        assert_eq!(got.count, 1);
        journal.stop(&cx, &handle).unwrap();
    }

    #[test]
    fn free_round_trip_restores_count() {
        let cx = test_cx();
        let (_cache, journal, alloc) = setup();
        let handle = journal.start(&cx, 8).unwrap();

        let before = alloc.free_block_count();
        let got = alloc
            .new_blocks(&cx, &journal, &handle, BlockNumber(50), 6)
            .unwrap();
        assert_eq!(alloc.free_block_count(), before - got.count);

        alloc
            .free_blocks(&cx, &journal, &handle, InodeNumber(11), got.start, got.count)
            .unwrap();
        assert_eq!(alloc.free_block_count(), before);
        journal.stop(&cx, &handle).unwrap();
    }

    #[test]
    fn double_free_is_inconsistency() {
        let cx = test_cx();
        let (_cache, journal, alloc) = setup();
        let handle = journal.start(&cx, 8).unwrap();

        let got = alloc
            .new_blocks(&cx, &journal, &handle, BlockNumber(70), 1)
            .unwrap();
        alloc
            .free_blocks(&cx, &journal, &handle, InodeNumber(11), got.start, 1)
            .unwrap();
        let err = alloc
            .free_blocks(&cx, &journal, &handle, InodeNumber(11), got.start, 1)
            .unwrap_err();
        assert!(matches!(err, RimeError::Inconsistency { .. }));
        journal.stop(&cx, &handle).unwrap();
    }

    #[test]
    fn allocation_spills_to_other_groups() {
        let cx = test_cx();
        let (_cache, journal, alloc) = setup();
        let handle = journal.start(&cx, 64).unwrap();

        // Drain group 0 entirely (1023 data blocks; group 0 starts at 1).
        let mut left = u64::from(alloc.geometry().blocks_in_group(GroupNumber(0)));
        while left > 0 {
            let got = alloc
                .new_blocks(&cx, &journal, &handle, BlockNumber(1), left)
                .unwrap();
            let (group, _) = alloc.geometry().absolute_to_group_block(got.start);
            if group != GroupNumber(0) {
                break;
            }
            left -= got.count;
        }
        let got = alloc
            .new_blocks(&cx, &journal, &handle, BlockNumber(1), 1)
            .unwrap();
        let (group, _) = alloc.geometry().absolute_to_group_block(got.start);
        assert_ne!(group, GroupNumber(0));
        journal.stop(&cx, &handle).unwrap();
    }

    #[test]
    fn inode_alloc_and_free() {
        let cx = test_cx();
        let (_cache, journal, alloc) = setup();
        let handle = journal.start(&cx, 8).unwrap();

        let a = alloc
            .alloc_inode(&cx, &journal, &handle, GroupNumber(0), false)
            .unwrap();
        assert_eq!(a.ino, InodeNumber(1));
        let b = alloc
            .alloc_inode(&cx, &journal, &handle, GroupNumber(0), false)
            .unwrap();
        assert_eq!(b.ino, InodeNumber(2));
        // Second group allocations are offset by inodes_per_group.
        let c = alloc
            .alloc_inode(&cx, &journal, &handle, GroupNumber(1), false)
            .unwrap();
        assert_eq!(c.ino, InodeNumber(257));

        alloc
            .free_inode(&cx, &journal, &handle, a.ino, false)
            .unwrap();
        let again = alloc
            .alloc_inode(&cx, &journal, &handle, GroupNumber(0), false)
            .unwrap();
        assert_eq!(again.ino, a.ino);
        journal.stop(&cx, &handle).unwrap();
    }
}
