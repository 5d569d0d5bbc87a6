//! The snapshot COW engine.
//!
//! Sits behind the journal's access hooks: before any metadata buffer is
//! dirtied its pre-image is copied into the active snapshot
//! (`test_and_cow`); before a regular file overwrites or frees a data
//! block, the block itself is re-parented into the snapshot
//! (`test_and_move`). Per-group COW bitmaps record which blocks were in
//! use at snapshot-take time; pending-COW markers keep readers away from
//! half-copied buffers; a transaction-local tag makes each buffer's copy
//! happen at most once per transaction.

use crate::branch;
use crate::map::{self, MapMode};
use crate::path::{resolve, InodeKind};
use crate::{cx_checkpoint, FsCtx};
use asupersync::Cx;
use parking_lot::Mutex;
use rime_alloc::bitmap_get;
use rime_block::{BufferRef, BufferState};
use rime_error::{Result, RimeError};
use rime_inode::{write_inode, Inode};
use rime_journal::{AccessHooks, DeleteAccess, Handle};
use rime_types::{
    BlockNumber, GroupNumber, InodeNumber, SNAPFILE_ACTIVE_FL, SNAPFILE_FL, SNAPFILE_LIST_FL,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace};

/// Superblock field offsets the lifecycle operations patch in place.
const SB_ACTIVE_SNAPSHOT_OFFSET: usize = 0x30;
const SB_SNAPSHOT_LIST_OFFSET: usize = 0x34;

/// How a snapshot-file access is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapAccess {
    /// Ordinary mapping.
    Normal,
    /// A hole reads through: to the next newer snapshot, or (for the
    /// active snapshot) to the live device block.
    ReadThrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CowKind {
    /// Copy the pre-image if the snapshot needs it.
    Copy,
    /// Only test; a positive answer means the allocator handed out a
    /// block a snapshot still references.
    TestOnly,
}

/// Per-filesystem snapshot state and the COW engine itself.
pub struct SnapshotEngine {
    fs: Mutex<Weak<FsCtx>>,
    /// The one active snapshot, if any.
    active: Mutex<Option<Arc<Inode>>>,
    /// Head of the snapshot list (newest first, 0 = empty).
    list_head: Mutex<u32>,
    /// Serializes lifecycle operations (take, release). Never held
    /// during ordinary COW hooks.
    snapshot_mutex: Mutex<()>,
    /// Volatile per-group cache: physical block of the snapshot's COW
    /// bitmap copy (the `bg_cow_bitmap` slot). Reset when the active
    /// snapshot changes; never written to the group descriptor.
    cow_bitmaps: Mutex<HashMap<u32, BlockNumber>>,
    /// Per-group locks covering the bitmap copy window.
    group_locks: Vec<Mutex<()>>,
}

impl SnapshotEngine {
    #[must_use]
    pub fn new(group_count: u32) -> Self {
        Self {
            fs: Mutex::new(Weak::new()),
            active: Mutex::new(None),
            list_head: Mutex::new(0),
            snapshot_mutex: Mutex::new(()),
            cow_bitmaps: Mutex::new(HashMap::new()),
            group_locks: (0..group_count.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Late-bind the engine to its filesystem context.
    pub fn bind(&self, fs: &Arc<FsCtx>) {
        *self.fs.lock() = Arc::downgrade(fs);
    }

    fn fs(&self) -> Result<Arc<FsCtx>> {
        self.fs
            .lock()
            .upgrade()
            .ok_or_else(|| RimeError::Format("snapshot engine is not bound".to_owned()))
    }

    /// Restore snapshot state at mount time (no disk writes).
    pub fn restore(&self, active: Option<Arc<Inode>>, list_head: u32) {
        *self.active.lock() = active;
        *self.list_head.lock() = list_head;
        self.cow_bitmaps.lock().clear();
    }

    #[must_use]
    pub fn active_snapshot(&self) -> Option<Arc<Inode>> {
        self.active.lock().clone()
    }

    #[must_use]
    pub fn is_active(&self, inode: &Inode) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|a| a.ino() == inode.ino())
    }

    /// Whether writes to `inode` must preserve overwritten data blocks.
    #[must_use]
    pub fn should_move_data(&self, inode: &Inode) -> bool {
        self.active.lock().is_some()
            && inode.with_state(|s| s.is_regular() && !s.is_snapshot())
    }

    // ── Access control ──────────────────────────────────────────────────

    /// Gate snapshot-file accesses.
    ///
    /// Snapshot files are read-only to the host; only the engine's own
    /// mappings (a snapshot command, or any call under a cowing handle)
    /// may modify the active snapshot's tree. Reads resolve holes by
    /// reading through.
    pub fn inode_access(
        &self,
        handle: Option<&Handle>,
        inode: &Inode,
        mode: MapMode,
    ) -> Result<SnapAccess> {
        if !inode.is_snapshot() {
            return Ok(SnapAccess::Normal);
        }
        if mode.snap.is_some() || handle.is_some_and(Handle::is_cowing) {
            if !self.is_active(inode) {
                return Err(RimeError::Permission);
            }
            return Ok(SnapAccess::Normal);
        }
        if mode.create || mode.overwrite {
            return Err(RimeError::Permission);
        }
        Ok(SnapAccess::ReadThrough)
    }

    /// The snapshot a hole in `inode` cascades to: its next newer
    /// neighbor on the snapshot list.
    pub fn read_through_target(
        &self,
        cx: &Cx,
        fs: &FsCtx,
        inode: &Inode,
    ) -> Result<Option<Arc<Inode>>> {
        let head = *self.list_head.lock();
        let target = inode.ino().0;
        let mut cur = head;
        while cur != 0 {
            let node = fs.inode(cx, InodeNumber(u64::from(cur)))?;
            let next = node.with_state(|s| s.next_snapshot);
            if u64::from(next) == target {
                return Ok(Some(node));
            }
            cur = next;
        }
        Ok(None)
    }

    // ── COW bitmap lifecycle ────────────────────────────────────────────

    /// Physical block of the group's COW bitmap copy, materializing it
    /// on first access.
    fn ensure_cow_bitmap(
        &self,
        cx: &Cx,
        fs: &FsCtx,
        handle: &Handle,
        group: GroupNumber,
    ) -> Result<BlockNumber> {
        if let Some(block) = self.cow_bitmaps.lock().get(&group.0) {
            return Ok(*block);
        }
        let active = self
            .active_snapshot()
            .ok_or_else(|| RimeError::Format("COW bitmap without active snapshot".to_owned()))?;
        let desc = fs.alloc.group_desc(group)?;
        let bitmap_phys = desc.block_bitmap_block;

        // The copy lives at the snapshot's logical offset equal to the
        // bitmap's physical address. Its indirect blocks bypass the
        // journal so this bootstrap never reserves mapping credits.
        let mapped = handle.with_cowing(|| {
            map::map_block(
                cx,
                fs,
                Some(handle),
                &active,
                bitmap_phys.0,
                1,
                MapMode::snap_bitmap(),
            )
        })?
        .ok_or_else(|| RimeError::Format("COW bitmap mapping yielded no block".to_owned()))?;

        if !mapped.new {
            // Another task won the materialization race; wait for its
            // copy to land.
            if let Some(entry) = fs.cache.peek(mapped.block) {
                entry.wait_pending_cow(cx)?;
            }
            self.cow_bitmaps.lock().insert(group.0, mapped.block);
            return Ok(mapped.block);
        }
        let sbh = mapped
            .pending
            .ok_or_else(|| RimeError::Format("COW bitmap mapping without pending buffer".to_owned()))?;

        // Copy under the group lock: the only concurrent bitmap change
        // is the active snapshot's own allocation activity, which never
        // matters to older snapshots.
        let copy_result = (|| -> Result<()> {
            let lock_index = group.0 as usize % self.group_locks.len();
            let _group_lock = self.group_locks[lock_index].lock();
            let live = fs.cache.read(cx, bitmap_phys)?;
            let mut data = live.data();
            if desc.exclude_bitmap_block.0 != 0 {
                // Blocks of excluded files are never preserved.
                let exclude = fs.cache.read(cx, desc.exclude_bitmap_block)?;
                exclude.with_data(|ex| {
                    for (byte, mask) in data.iter_mut().zip(ex.iter()) {
                        *byte &= !mask;
                    }
                });
            }
            sbh.copy_in(&data);
            Ok(())
        })();
        if let Err(err) = copy_result {
            sbh.cancel_pending_cow();
            // A bitmap that cannot be read leaves snapshot consistency
            // undecidable; refuse further writes.
            return Err(match err {
                RimeError::Io(_) => fs.errors.mark(
                    bitmap_phys.0,
                    "I/O error reading block bitmap during COW bitmap init",
                ),
                other => other,
            });
        }

        sbh.end_pending_cow();
        fs.journal.dirty_metadata(cx, handle, &sbh)?;
        self.cow_bitmaps.lock().insert(group.0, mapped.block);
        info!(
            event = "cow_bitmap_init",
            group = group.0,
            bitmap = bitmap_phys.0,
            copy = mapped.block.0
        );
        Ok(mapped.block)
    }

    /// Whether `block` was in use at snapshot-take time.
    fn block_in_cow_bitmap(
        &self,
        cx: &Cx,
        fs: &FsCtx,
        handle: &Handle,
        block: BlockNumber,
    ) -> Result<bool> {
        let (group, rel) = fs.alloc.geometry().absolute_to_group_block(block);
        let copy_block = self.ensure_cow_bitmap(cx, fs, handle, group)?;
        let buf = fs.cache.read(cx, copy_block)?;
        Ok(buf.with_data(|data| bitmap_get(data, rel)))
    }

    /// Does the active snapshot already map logical offset `block`?
    ///
    /// A plain branch walk: read-through must not kick in here, a hole
    /// is exactly the answer "no".
    fn snapshot_mapped(
        &self,
        cx: &Cx,
        fs: &FsCtx,
        active: &Inode,
        block: BlockNumber,
    ) -> Result<Option<BlockNumber>> {
        let apb = fs.alloc.geometry().block_size.addr_per_block();
        let path = resolve(InodeKind::Snapshot, apb, block.0)?;
        let (chain, status) =
            branch::get_branch(cx, &fs.cache, active, path.depth, &path.offsets)?;
        match status {
            branch::BranchStatus::Complete => Ok(chain.leaf_block()),
            _ => Ok(None),
        }
    }

    // ── test_and_cow ────────────────────────────────────────────────────

    fn test_and_cow(
        &self,
        cx: &Cx,
        handle: &Handle,
        buf: &BufferRef,
        kind: CowKind,
    ) -> Result<()> {
        let Some(active) = self.active_snapshot() else {
            return Ok(());
        };
        // Hooks re-entered from inside a COW operation are no-ops:
        // splicing the snapshot's own tree must not recurse.
        if handle.is_cowing() {
            return Ok(());
        }
        cx_checkpoint(cx)?;
        let fs = self.fs()?;
        let block = buf.block();

        // Transaction-local cache: one copy per block per transaction.
        if kind == CowKind::Copy && buf.cow_tid() == Some(handle.tid()) {
            trace!(event = "cow_skip_tx_cache", block = block.0);
            return Ok(());
        }

        if !self.block_in_cow_bitmap(cx, &fs, handle, block)? {
            // Free at snapshot-take time: later writes need no copy.
            if kind == CowKind::Copy {
                buf.set_cow_tid(handle.tid());
            }
            return Ok(());
        }

        if self.snapshot_mapped(cx, &fs, &active, block)?.is_some() {
            if kind == CowKind::Copy {
                buf.set_cow_tid(handle.tid());
            }
            return Ok(());
        }

        if kind == CowKind::TestOnly {
            // A newly allocated block that a snapshot still needs means
            // the allocator and the COW bitmaps disagree on disk.
            return Err(fs.errors.mark(
                block.0,
                "freshly allocated block is still referenced by the active snapshot",
            ));
        }

        // Copy the pre-image. The mapping publishes a pending-COW
        // marker before the splice, so readers of the snapshot block
        // wait until the copy below lands.
        let src = buf.data();
        let mapped = handle.with_cowing(|| {
            map::map_block(
                cx,
                &fs,
                Some(handle),
                &active,
                block.0,
                1,
                MapMode::snap_cow(),
            )
        })?
        .ok_or_else(|| RimeError::Format("snapshot COW mapping yielded no block".to_owned()))?;

        if let Some(sbh) = &mapped.pending {
            sbh.copy_in(&src);
            sbh.end_pending_cow();
        }
        buf.set_cow_tid(handle.tid());
        debug!(
            event = "cow_copied",
            block = block.0,
            copy = mapped.block.0,
            tid = handle.tid().0
        );
        Ok(())
    }

    // ── test_and_move ───────────────────────────────────────────────────

    fn test_and_move(
        &self,
        cx: &Cx,
        handle: &Handle,
        ino: InodeNumber,
        block: BlockNumber,
        count: u64,
        adjust_source: bool,
    ) -> Result<u64> {
        let Some(active) = self.active_snapshot() else {
            return Ok(0);
        };
        if handle.is_cowing() {
            return Ok(0);
        }
        cx_checkpoint(cx)?;
        let fs = self.fs()?;

        if !self.block_in_cow_bitmap(cx, &fs, handle, block)? {
            return Ok(0);
        }
        if self.snapshot_mapped(cx, &fs, &active, block)?.is_some() {
            // Already preserved; nothing to move.
            return Ok(0);
        }

        let moved = handle.with_cowing(|| -> Result<u64> {
            let mapped = map::map_block(
                cx,
                &fs,
                Some(handle),
                &active,
                block.0,
                count,
                MapMode::snap_move(),
            )?
            .ok_or_else(|| RimeError::Format("snapshot move mapping yielded no block".to_owned()))?;
            Ok(mapped.count)
        })?;

        if adjust_source && moved > 0 {
            // Ownership accounting: the moved blocks now belong to the
            // snapshot (its splice charged them); release them from the
            // source inode.
            let source = fs.inode(cx, ino)?;
            source.update_state(|s| s.blocks = s.blocks.saturating_sub(moved));
            write_inode(cx, &fs.journal, handle, &fs.alloc, &source)?;
        }
        debug!(
            event = "blocks_moved_to_snapshot",
            ino = ino.0,
            block = block.0,
            moved
        );
        Ok(moved)
    }

    // ── Reading snapshot contents ───────────────────────────────────────

    /// Read one block of a snapshot file, honoring pending-COW markers:
    /// a copy still in flight is waited out, and a completed in-memory
    /// copy short-circuits the device read.
    pub fn read_snapshot_block(
        &self,
        cx: &Cx,
        fs: &FsCtx,
        snapshot: &Arc<Inode>,
        iblock: u64,
    ) -> Result<Vec<u8>> {
        let mapped = map::map_block(cx, fs, None, snapshot, iblock, 1, MapMode::READ)?
            .ok_or_else(|| RimeError::Format("snapshot read resolved to no mapping".to_owned()))?;
        if let Some(entry) = fs.cache.peek(mapped.block) {
            entry.wait_pending_cow(cx)?;
            match entry.state() {
                BufferState::Uptodate | BufferState::Dirty => return Ok(entry.data()),
                // A bare `New` entry has no contents worth reading;
                // fall through to the device.
                BufferState::New | BufferState::PendingCow => {}
            }
        }
        fs.cache.device().read_block(cx, mapped.block)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Turn `inode` into the active snapshot.
    ///
    /// The inode joins the snapshot list head, its size is set to span
    /// the whole device, the previous active snapshot (if any) is
    /// demoted, and the volatile COW bitmap cache resets.
    pub fn take(&self, cx: &Cx, fs: &FsCtx, inode: &Arc<Inode>) -> Result<()> {
        let _lifecycle = self.snapshot_mutex.lock();
        cx_checkpoint(cx)?;
        fs.errors.check()?;
        let handle = fs.journal.start(cx, 16)?;

        if let Some(prev) = self.active_snapshot() {
            prev.update_state(|s| s.flags &= !SNAPFILE_ACTIVE_FL);
            write_inode(cx, &fs.journal, &handle, &fs.alloc, &prev)?;
        }

        let geo = fs.alloc.geometry();
        let device_bytes = geo.total_blocks * u64::from(geo.block_size.get());
        let old_head = *self.list_head.lock();
        let ino32 = inode
            .ino()
            .to_u32()
            .map_err(|e| RimeError::Format(e.to_string()))?;

        inode.update_state(|s| {
            s.flags |= SNAPFILE_FL | SNAPFILE_LIST_FL | SNAPFILE_ACTIVE_FL;
            s.next_snapshot = old_head;
            s.size = device_bytes;
        });
        write_inode(cx, &fs.journal, &handle, &fs.alloc, inode)?;

        let sb = fs.cache.read(cx, fs.sb_block)?;
        fs.journal.get_write_access(cx, &handle, &sb)?;
        sb.update(|data| {
            data[SB_ACTIVE_SNAPSHOT_OFFSET..SB_ACTIVE_SNAPSHOT_OFFSET + 4]
                .copy_from_slice(&ino32.to_le_bytes());
            data[SB_SNAPSHOT_LIST_OFFSET..SB_SNAPSHOT_LIST_OFFSET + 4]
                .copy_from_slice(&ino32.to_le_bytes());
        });
        fs.journal.dirty_metadata(cx, &handle, &sb)?;
        fs.journal.stop(cx, &handle)?;
        fs.journal.force_commit(cx)?;

        *self.list_head.lock() = ino32;
        *self.active.lock() = Some(Arc::clone(inode));
        self.cow_bitmaps.lock().clear();
        info!(event = "snapshot_taken", ino = ino32);
        Ok(())
    }

    /// Demote the active snapshot; COW stops until another is taken.
    pub fn release_active(&self, cx: &Cx, fs: &FsCtx) -> Result<()> {
        let _lifecycle = self.snapshot_mutex.lock();
        let Some(active) = self.active_snapshot() else {
            return Ok(());
        };
        let handle = fs.journal.start(cx, 8)?;
        active.update_state(|s| s.flags &= !SNAPFILE_ACTIVE_FL);
        write_inode(cx, &fs.journal, &handle, &fs.alloc, &active)?;

        let sb = fs.cache.read(cx, fs.sb_block)?;
        fs.journal.get_write_access(cx, &handle, &sb)?;
        sb.update(|data| {
            data[SB_ACTIVE_SNAPSHOT_OFFSET..SB_ACTIVE_SNAPSHOT_OFFSET + 4]
                .copy_from_slice(&0u32.to_le_bytes());
        });
        fs.journal.dirty_metadata(cx, &handle, &sb)?;
        fs.journal.stop(cx, &handle)?;

        *self.active.lock() = None;
        self.cow_bitmaps.lock().clear();
        info!(event = "snapshot_released", ino = active.ino().0);
        Ok(())
    }
}

// ── Journal hook wiring ─────────────────────────────────────────────────────

impl AccessHooks for SnapshotEngine {
    fn on_write_access(&self, cx: &Cx, handle: &Handle, buf: &BufferRef) -> Result<()> {
        self.test_and_cow(cx, handle, buf, CowKind::Copy)
    }

    fn on_create_access(&self, cx: &Cx, handle: &Handle, buf: &BufferRef) -> Result<()> {
        self.test_and_cow(cx, handle, buf, CowKind::TestOnly)
    }

    fn on_bitmap_access(
        &self,
        cx: &Cx,
        handle: &Handle,
        group: GroupNumber,
        buf: &BufferRef,
    ) -> Result<()> {
        if self.active_snapshot().is_none() || handle.is_cowing() {
            return Ok(());
        }
        let fs = self.fs()?;
        self.ensure_cow_bitmap(cx, &fs, handle, group)?;
        self.test_and_cow(cx, handle, buf, CowKind::Copy)
    }

    fn on_move_access(
        &self,
        cx: &Cx,
        handle: &Handle,
        ino: InodeNumber,
        block: BlockNumber,
        count: u64,
    ) -> Result<u64> {
        self.test_and_move(cx, handle, ino, block, count, true)
    }

    fn on_delete_access(
        &self,
        cx: &Cx,
        handle: &Handle,
        ino: InodeNumber,
        block: BlockNumber,
        count: u64,
    ) -> Result<DeleteAccess> {
        let Some(active) = self.active_snapshot() else {
            return Ok(DeleteAccess::Freeable(count));
        };
        if handle.is_cowing() {
            return Ok(DeleteAccess::Freeable(count));
        }
        let fs = self.fs()?;

        // Maximal uniform prefix by COW bitmap state.
        let first_in_use = self.block_in_cow_bitmap(cx, &fs, handle, block)?;
        let mut n = 1u64;
        while n < count {
            let next = BlockNumber(block.0 + n);
            if self.block_in_cow_bitmap(cx, &fs, handle, next)? != first_in_use {
                break;
            }
            n += 1;
        }
        if !first_in_use {
            return Ok(DeleteAccess::Freeable(n));
        }

        match self.snapshot_mapped(cx, &fs, &active, block)? {
            // The block itself already belongs to the snapshot (an
            // earlier move); its bitmap bit must survive.
            Some(copy) if copy == block => Ok(DeleteAccess::Inherited(1)),
            // Preserved as a copy elsewhere; the original may go. Later
            // blocks of the run are re-examined by the caller.
            Some(_) => Ok(DeleteAccess::Freeable(1)),
            None => {
                // Inherit directly, no copy. The source's accounting is
                // the deleter's business.
                let moved = self.test_and_move(cx, handle, ino, block, n, false)?;
                if moved == 0 {
                    return Ok(DeleteAccess::Freeable(1));
                }
                Ok(DeleteAccess::Inherited(moved))
            }
        }
    }
}
