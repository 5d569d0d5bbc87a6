#![forbid(unsafe_code)]
//! End-to-end fixtures for RimeFS.
//!
//! Builds a small filesystem image in memory (mkfs), mounts it into a
//! full `FsCtx` (journal replay, allocator state from the on-disk
//! bitmaps, orphan recovery, snapshot restore), and provides the file
//! helpers the conformance scenarios drive. A fault-injecting device
//! wrapper simulates crashes at arbitrary write counts.

use asupersync::Cx;
use parking_lot::Mutex;
use rime::{FsCtx, MapMode};
use rime_alloc::{bitmap_count_free, bitmap_get, bitmap_set, Allocator, FsGeometry, GroupStats};
use rime_block::{BlockDevice, BufferCache, MemBlockDevice};
use rime_error::{Result, RimeError};
use rime_inode::{create_inode, write_inode, Inode, OrphanList};
use rime_journal::{Journal, JournalRegion, MAX_TRANS_DATA};
use rime_ondisk::{GroupDesc, Superblock, GROUP_DESC_BYTES};
use rime_types::{BlockNumber, BlockSize, GroupNumber, InodeNumber, DIR_BLOCKS, S_IFREG};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Fixture geometry: 4 MiB image, 1 KiB blocks, four groups.
pub const BLOCK_SIZE: u32 = 1024;
pub const TOTAL_BLOCKS: u64 = 4096;
pub const BLOCKS_PER_GROUP: u32 = 1024;
pub const INODES_PER_GROUP: u32 = 256;
pub const INODE_SIZE: u16 = 256;
pub const FIRST_DATA_BLOCK: u32 = 1;
/// Superblock and group-descriptor table blocks.
pub const SB_BLOCK: u64 = 1;
pub const GD_BLOCK: u64 = 2;
/// Journal region: the tail of the last group.
pub const JOURNAL_START: u64 = 3968;
pub const JOURNAL_BLOCKS: u64 = 128;
/// Inode table length in blocks per group.
const TABLE_BLOCKS: u64 = 64;

#[inline]
fn test_cx() -> Cx {
    Cx::for_testing()
}

// ── Fault-injecting device ──────────────────────────────────────────────────

/// Wraps the in-memory device and fails writes once an armed budget is
/// exhausted, simulating a crash mid-operation.
pub struct FaultDevice {
    inner: Arc<MemBlockDevice>,
    writes_left: Mutex<Option<u64>>,
}

impl FaultDevice {
    #[must_use]
    pub fn new(inner: Arc<MemBlockDevice>) -> Self {
        Self {
            inner,
            writes_left: Mutex::new(None),
        }
    }

    /// Fail every write after the next `budget` writes.
    pub fn arm(&self, budget: u64) {
        *self.writes_left.lock() = Some(budget);
    }

    pub fn disarm(&self) {
        *self.writes_left.lock() = None;
    }
}

impl BlockDevice for FaultDevice {
    fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<Vec<u8>> {
        self.inner.read_block(cx, block)
    }

    fn write_block(&self, cx: &Cx, block: BlockNumber, data: &[u8]) -> Result<()> {
        {
            let mut budget = self.writes_left.lock();
            if let Some(left) = budget.as_mut() {
                if *left == 0 {
                    return Err(RimeError::Io(std::io::Error::other(
                        "injected write failure",
                    )));
                }
                *left -= 1;
            }
        }
        self.inner.write_block(cx, block, data)
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        self.inner.sync(cx)
    }
}

// ── mkfs ────────────────────────────────────────────────────────────────────

fn group_layout(group: u32) -> GroupDesc {
    let start = u64::from(FIRST_DATA_BLOCK) + u64::from(group) * u64::from(BLOCKS_PER_GROUP);
    if group == 0 {
        // Boot block, superblock, and descriptor table precede group 0's
        // own metadata.
        GroupDesc {
            block_bitmap: BlockNumber(3),
            inode_bitmap: BlockNumber(4),
            inode_table: BlockNumber(5),
            exclude_bitmap: BlockNumber(0),
            free_blocks_count: 0,
            free_inodes_count: 0,
            used_dirs_count: 0,
            flags: 0,
        }
    } else {
        GroupDesc {
            block_bitmap: BlockNumber(start),
            inode_bitmap: BlockNumber(start + 1),
            inode_table: BlockNumber(start + 2),
            exclude_bitmap: BlockNumber(0),
            free_blocks_count: 0,
            free_inodes_count: 0,
            used_dirs_count: 0,
            flags: 0,
        }
    }
}

fn fixture_superblock() -> Superblock {
    Superblock {
        blocks_count: TOTAL_BLOCKS,
        inodes_count: INODES_PER_GROUP * 4,
        first_data_block: FIRST_DATA_BLOCK,
        blocks_per_group: BLOCKS_PER_GROUP,
        inodes_per_group: INODES_PER_GROUP,
        inode_size: INODE_SIZE,
        block_size: BlockSize::new(BLOCK_SIZE).expect("fixture block size"),
        journal_start: BlockNumber(JOURNAL_START),
        journal_blocks: JOURNAL_BLOCKS,
        orphan_head: 0,
        active_snapshot: 0,
        snapshot_list_head: 0,
    }
}

/// Initialize a fresh filesystem image on `dev`.
pub fn mkfs(cx: &Cx, dev: &MemBlockDevice) -> Result<()> {
    let sb = fixture_superblock();
    dev.write_block(cx, BlockNumber(SB_BLOCK), &sb.serialize()?)?;

    let mut gd_block = vec![0u8; BLOCK_SIZE as usize];
    for g in 0..4u32 {
        let desc = group_layout(g);
        let raw = desc.serialize()?;
        let off = g as usize * GROUP_DESC_BYTES;
        gd_block[off..off + GROUP_DESC_BYTES].copy_from_slice(&raw);
    }
    dev.write_block(cx, BlockNumber(GD_BLOCK), &gd_block)?;

    for g in 0..4u32 {
        let desc = group_layout(g);
        let start = u64::from(FIRST_DATA_BLOCK) + u64::from(g) * u64::from(BLOCKS_PER_GROUP);
        let mut bitmap = vec![0u8; BLOCK_SIZE as usize];

        // Metadata blocks of the group itself.
        let meta_end = if g == 0 {
            // sb, gd, block bitmap, inode bitmap, inode table.
            4 + TABLE_BLOCKS
        } else {
            2 + TABLE_BLOCKS
        };
        for rel in 0..meta_end {
            #[allow(clippy::cast_possible_truncation)]
            bitmap_set(&mut bitmap, rel as u32);
        }
        // Journal blocks live in the last group.
        if g == 3 {
            for abs in JOURNAL_START..JOURNAL_START + JOURNAL_BLOCKS {
                #[allow(clippy::cast_possible_truncation)]
                bitmap_set(&mut bitmap, (abs - start) as u32);
            }
        }
        dev.write_block(cx, desc.block_bitmap, &bitmap)?;
        dev.write_block(cx, desc.inode_bitmap, &vec![0u8; BLOCK_SIZE as usize])?;
    }
    Ok(())
}

// ── Fixture ─────────────────────────────────────────────────────────────────

/// A mounted fixture filesystem.
pub struct Fixture {
    pub cx: Cx,
    pub base: Arc<MemBlockDevice>,
    pub fault: Arc<FaultDevice>,
    pub fs: Arc<FsCtx>,
    cap: u32,
}

impl Fixture {
    /// mkfs + mount with the default credit cap.
    pub fn new() -> Result<Self> {
        Self::with_cap(MAX_TRANS_DATA)
    }

    /// mkfs + mount with a custom per-handle credit cap.
    pub fn with_cap(cap: u32) -> Result<Self> {
        let cx = test_cx();
        let base = Arc::new(MemBlockDevice::new(BLOCK_SIZE, TOTAL_BLOCKS));
        mkfs(&cx, &base)?;
        Self::mount(base, cap)
    }

    /// Mount an existing image: replay the journal, rebuild allocator
    /// state from the on-disk bitmaps, restore snapshot state, and run
    /// orphan recovery.
    pub fn mount(base: Arc<MemBlockDevice>, cap: u32) -> Result<Self> {
        let cx = test_cx();
        let fault = Arc::new(FaultDevice::new(Arc::clone(&base)));

        let sb_raw = base.read_block(&cx, BlockNumber(SB_BLOCK))?;
        let sb = Superblock::parse(&sb_raw)?;
        let region = JournalRegion {
            start: sb.journal_start,
            blocks: sb.journal_blocks,
        };

        let replay = rime_journal::replay(&cx, fault.as_ref() as &dyn BlockDevice, region)?;
        if replay.replayed_blocks > 0 {
            info!(
                event = "journal_replayed",
                blocks = replay.replayed_blocks,
                commits = replay.commit_blocks
            );
        }
        // Re-read: replay may have rewritten the superblock.
        let sb_raw = base.read_block(&cx, BlockNumber(SB_BLOCK))?;
        let sb = Superblock::parse(&sb_raw)?;

        let geo = FsGeometry::from_superblock(&sb);
        let gd_raw = base.read_block(&cx, BlockNumber(GD_BLOCK))?;
        let mut stats = Vec::new();
        for g in 0..geo.group_count {
            let off = g as usize * GROUP_DESC_BYTES;
            let desc = GroupDesc::parse(&gd_raw[off..off + GROUP_DESC_BYTES])?;
            let mut gs = GroupStats::from_group_desc(GroupNumber(g), &desc);
            // Free counts come from the bitmaps, not the (possibly
            // stale) descriptor fields.
            let bitmap = base.read_block(&cx, desc.block_bitmap)?;
            gs.free_blocks = bitmap_count_free(&bitmap, geo.blocks_in_group(GroupNumber(g)));
            let ibitmap = base.read_block(&cx, desc.inode_bitmap)?;
            gs.free_inodes = bitmap_count_free(&ibitmap, geo.inodes_per_group);
            stats.push(gs);
        }

        let cache = Arc::new(BufferCache::new(
            Arc::clone(&fault) as Arc<dyn BlockDevice>
        ));
        let journal = Arc::new(Journal::with_cap(Arc::clone(&cache), region, cap));
        let alloc = Arc::new(Allocator::new(geo, stats));
        let orphans = Arc::new(OrphanList::new(BlockNumber(SB_BLOCK), sb.orphan_head));
        let fs = FsCtx::assemble(cache, journal, alloc, orphans, BlockNumber(SB_BLOCK));

        let active = if sb.active_snapshot != 0 {
            Some(fs.inode(&cx, InodeNumber(u64::from(sb.active_snapshot)))?)
        } else {
            None
        };
        fs.snapshots.restore(active, sb.snapshot_list_head);

        let fixture = Self {
            cx,
            base,
            fault,
            fs,
            cap,
        };
        fixture.recover_orphans()?;
        Ok(fixture)
    }

    /// Cleanly unmount (commit + flush) and mount again.
    pub fn remount_clean(&self) -> Result<Self> {
        self.fs.journal.force_commit(&self.cx)?;
        self.fs.cache.flush(&self.cx)?;
        Self::mount(Arc::clone(&self.base), self.cap)
    }

    /// Simulate a crash: dirty cache contents are lost, the journal is
    /// replayed on the way back up.
    pub fn crash_remount(&self) -> Result<Self> {
        self.fault.disarm();
        Self::mount(Arc::clone(&self.base), self.cap)
    }

    /// Re-run truncates for every inode left on the orphan list.
    pub fn recover_orphans(&self) -> Result<usize> {
        let mut recovered = 0usize;
        loop {
            let head = self.fs.orphans.head();
            if head == 0 {
                break;
            }
            let inode = self.fs.inode(&self.cx, InodeNumber(u64::from(head)))?;
            let links = inode.with_state(|s| s.links_count);
            if links == 0 {
                rime::delete_inode(&self.cx, &self.fs, &inode)?;
            } else {
                // dtime doubles as the orphan chain pointer; a live
                // inode must not keep it.
                rime::truncate(&self.cx, &self.fs, &inode)?;
            }
            recovered += 1;
            if self.fs.orphans.head() == head {
                return Err(RimeError::Format(format!(
                    "orphan recovery made no progress at inode {head}"
                )));
            }
        }
        if recovered > 0 {
            info!(event = "orphans_recovered", count = recovered);
        }
        Ok(recovered)
    }

    // ── File helpers ────────────────────────────────────────────────────

    /// Create an empty regular file.
    pub fn create_file(&self) -> Result<Arc<Inode>> {
        let handle = self.fs.journal.start(&self.cx, 16)?;
        let inode = create_inode(
            &self.cx,
            &self.fs.journal,
            &handle,
            &self.fs.alloc,
            S_IFREG | 0o644,
            0,
            0,
            GroupNumber(0),
            rime_core_now(),
        )?;
        self.fs.journal.stop(&self.cx, &handle)?;
        self.fs.inodes.insert(Arc::clone(&inode));
        Ok(inode)
    }

    /// Write one logical block of a file, allocating as needed. Returns
    /// the physical block the data landed in.
    pub fn write_file_block(
        &self,
        inode: &Arc<Inode>,
        iblock: u64,
        data: &[u8],
    ) -> Result<BlockNumber> {
        let handle = self.fs.journal.start(&self.cx, 32)?;
        let mapped = rime::map_block(
            &self.cx,
            &self.fs,
            Some(&handle),
            inode,
            iblock,
            1,
            MapMode::WRITE.overwriting(),
        )?
        .ok_or_else(|| RimeError::Format("write mapping yielded no block".to_owned()))?;

        let mut block = vec![0u8; BLOCK_SIZE as usize];
        let n = data.len().min(block.len());
        block[..n].copy_from_slice(&data[..n]);
        self.fs.cache.getblk(mapped.block).fill(&block);

        let grow = (iblock + 1) * u64::from(BLOCK_SIZE);
        inode.update_state(|s| s.size = s.size.max(grow));
        write_inode(&self.cx, &self.fs.journal, &handle, &self.fs.alloc, inode)?;
        self.fs.journal.stop(&self.cx, &handle)?;
        self.fs.cache.flush(&self.cx)?;
        Ok(mapped.block)
    }

    /// Read one logical block of a regular file; `None` for holes.
    pub fn read_file_block(&self, inode: &Arc<Inode>, iblock: u64) -> Result<Option<Vec<u8>>> {
        match rime::bread(&self.cx, &self.fs, None, inode, iblock)? {
            Some(buf) => Ok(Some(buf.data())),
            None => Ok(None),
        }
    }

    /// Read one logical block of a snapshot file (read-through and
    /// pending-COW aware).
    pub fn read_snapshot_block(&self, snapshot: &Arc<Inode>, iblock: u64) -> Result<Vec<u8>> {
        self.fs
            .snapshots
            .read_snapshot_block(&self.cx, &self.fs, snapshot, iblock)
    }

    /// Total free blocks (allocator view).
    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.fs.alloc.free_block_count()
    }

    // ── Tree checking ───────────────────────────────────────────────────

    /// Walk a file's whole indirect tree, checking that every referenced
    /// block is marked allocated and referenced exactly once. Returns
    /// `(data_blocks, tree_blocks)`.
    pub fn verify_file_tree(&self, inode: &Arc<Inode>) -> Result<(u64, u64)> {
        let geo = self.fs.alloc.geometry().clone();
        let mut seen: HashSet<u64> = HashSet::new();
        let mut data_blocks = 0u64;
        let mut tree_blocks = 0u64;

        let root_limit = if inode.is_snapshot() {
            rime_types::SNAP_N_BLOCKS
        } else {
            rime_types::N_BLOCKS
        };
        for slot in 0..root_limit {
            let nr = inode.slot(slot);
            if nr == 0 {
                continue;
            }
            let depth = rime::path::slot_depth(slot);
            self.check_subtree(&geo, BlockNumber(u64::from(nr)), depth, &mut seen)?;
            if slot < DIR_BLOCKS {
                data_blocks += 1;
            } else {
                tree_blocks += 1;
                data_blocks += self.count_leaves(&geo, BlockNumber(u64::from(nr)), depth)?;
            }
        }
        Ok((data_blocks, tree_blocks))
    }

    fn check_block_allocated(&self, geo: &FsGeometry, block: BlockNumber) -> Result<()> {
        let (group, rel) = geo.absolute_to_group_block(block);
        let desc = self.fs.alloc.group_desc(group)?;
        let bitmap = self.fs.cache.read(&self.cx, desc.block_bitmap_block)?;
        let set = bitmap.with_data(|d| bitmap_get(d, rel));
        if !set {
            return Err(RimeError::Inconsistency {
                block: block.0,
                detail: "tree references a free block".into(),
            });
        }
        Ok(())
    }

    fn check_subtree(
        &self,
        geo: &FsGeometry,
        block: BlockNumber,
        depth: usize,
        seen: &mut HashSet<u64>,
    ) -> Result<()> {
        if !seen.insert(block.0) {
            return Err(RimeError::Inconsistency {
                block: block.0,
                detail: "block referenced twice in one tree".into(),
            });
        }
        self.check_block_allocated(geo, block)?;
        if depth == 0 {
            return Ok(());
        }
        let raw = self.fs.cache.read(&self.cx, block)?;
        let apb = geo.block_size.addr_per_block() as usize;
        for i in 0..apb {
            let nr = raw
                .with_data(|d| rime_types::read_slot(d, i))
                .map_err(|e| RimeError::Format(e.to_string()))?;
            if nr != 0 {
                self.check_subtree(geo, BlockNumber(u64::from(nr)), depth - 1, seen)?;
            }
        }
        Ok(())
    }

    fn count_leaves(&self, geo: &FsGeometry, block: BlockNumber, depth: usize) -> Result<u64> {
        if depth == 0 {
            return Ok(1);
        }
        let raw = self.fs.cache.read(&self.cx, block)?;
        let apb = geo.block_size.addr_per_block() as usize;
        let mut total = 0u64;
        for i in 0..apb {
            let nr = raw
                .with_data(|d| rime_types::read_slot(d, i))
                .map_err(|e| RimeError::Format(e.to_string()))?;
            if nr != 0 {
                total += self.count_leaves(geo, BlockNumber(u64::from(nr)), depth - 1)?;
            }
        }
        Ok(total)
    }
}

fn rime_core_now() -> u32 {
    rime::map::unix_now()
}

// ── Self-check report ───────────────────────────────────────────────────────

/// Summary emitted by the harness binary.
#[derive(Debug, Serialize)]
pub struct SelfCheckReport {
    pub scenario: &'static str,
    pub ok: bool,
    pub detail: String,
}

/// Run the single-indirect splice scenario end to end and report.
pub fn selfcheck() -> Result<SelfCheckReport> {
    let fx = Fixture::new()?;
    let file = fx.create_file()?;
    let phys = fx.write_file_block(&file, 12, b"selfcheck")?;
    let ind = file.slot(rime_types::IND_SLOT);
    let ok = ind != 0 && phys.0 != 0;
    Ok(SelfCheckReport {
        scenario: "single-indirect-splice",
        ok,
        detail: format!("indirect={ind} data={phys}"),
    })
}
