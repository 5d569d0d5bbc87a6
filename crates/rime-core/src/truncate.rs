//! Restart-consistent truncation.
//!
//! Frees every block strictly beyond the inode's size, bottom-up and
//! right-to-left, across as many sub-transactions as the credit budget
//! demands. Each restart leaves the on-disk tree reachable and acyclic;
//! the orphan list guarantees a crashed truncate is re-run on the next
//! mount with the same final state.

use crate::branch::{self, BranchStatus, ChainLink};
use crate::path::{resolve, slot_depth, InodeKind};
use crate::{cx_checkpoint, FsCtx};
use asupersync::Cx;
use parking_lot::MutexGuard;
use rime_block::BufferRef;
use rime_error::{Result, RimeError};
use rime_inode::{write_inode, Inode};
use rime_journal::{Handle, MAX_TRANS_DATA};
use rime_types::{
    read_slot, write_slot, BlockNumber, DIR_BLOCKS, N_BLOCKS, SNAPFILE_DELETED_FL,
    SNAPFILE_LIST_FL, SNAP_N_BLOCKS,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Credits left below which the engine extends or restarts.
const RESTART_RESERVE: u32 = 8;

/// Credit estimate for one truncate transaction leg.
///
/// Derived from the inode's block count, clamped to the per-handle cap,
/// with a floor of 2 so even a corrupt block count yields a usable
/// handle.
#[must_use]
pub fn blocks_for_truncate(inode: &Inode) -> u32 {
    let blocks = inode.with_state(|s| s.blocks);
    u32::try_from(blocks / 4 + 8)
        .unwrap_or(MAX_TRANS_DATA)
        .clamp(2, MAX_TRANS_DATA)
}

struct TruncCtx<'a> {
    cx: &'a Cx,
    fs: &'a FsCtx,
    inode: &'a Arc<Inode>,
    handle: Handle,
    guard: Option<MutexGuard<'a, ()>>,
    restarts: u32,
}

impl<'a> TruncCtx<'a> {
    /// Keep the handle viable: extend in place when possible, otherwise
    /// commit and reopen. Across the restart the tree lock is dropped so
    /// blocked writers can observe the intermediate consistent state.
    fn maybe_restart(&mut self) -> Result<()> {
        if self.handle.is_aborted() {
            return Err(RimeError::Aborted);
        }
        if self.handle.buffer_credits() >= RESTART_RESERVE {
            return Ok(());
        }
        let want = blocks_for_truncate(self.inode);
        if self.fs.journal.extend(self.cx, &self.handle, want)? {
            return Ok(());
        }
        write_inode(self.cx, &self.fs.journal, &self.handle, &self.fs.alloc, self.inode)?;
        self.guard = None;
        self.handle = self.fs.journal.restart(self.cx, &self.handle, want)?;
        self.guard = Some(self.inode.lock_tree());
        self.restarts += 1;
        debug!(
            event = "truncate_restart",
            ino = self.inode.ino().0,
            restarts = self.restarts
        );
        Ok(())
    }

    fn read_container_slot(&self, parent: Option<&BufferRef>, index: usize) -> Result<u32> {
        match parent {
            Some(buf) => buf
                .with_data(|data| read_slot(data, index))
                .map_err(|e| RimeError::Format(e.to_string())),
            None => Ok(self.inode.slot(index)),
        }
    }

    fn clear_container_slot(&self, parent: Option<&BufferRef>, index: usize) -> Result<()> {
        match parent {
            Some(buf) => {
                self.fs.journal.get_write_access(self.cx, &self.handle, buf)?;
                buf.update(|data| write_slot(data, index, 0))
                    .map_err(|e| RimeError::Format(e.to_string()))?;
                self.fs.journal.dirty_metadata(self.cx, &self.handle, buf)
            }
            None => {
                self.inode.set_slot(index, 0);
                Ok(())
            }
        }
    }

    /// Free the leaf pointers in `first..last` of a container,
    /// accumulating contiguous physical runs so each free touches the
    /// bitmap once.
    fn free_data(
        &mut self,
        parent: Option<&BufferRef>,
        first: usize,
        last: usize,
    ) -> Result<()> {
        cx_checkpoint(self.cx)?;
        // Gather runs up front; the tree lock keeps the slots stable.
        let mut runs: Vec<(usize, u64, u64)> = Vec::new(); // (slot, start, count)
        let mut current: Option<(usize, u64, u64)> = None;
        for index in first..last {
            let nr = u64::from(self.read_container_slot(parent, index)?);
            match current {
                Some((slot, start, count)) if nr != 0 && nr == start + count => {
                    current = Some((slot, start, count + 1));
                }
                _ => {
                    if let Some(run) = current.take() {
                        runs.push(run);
                    }
                    if nr != 0 {
                        current = Some((index, nr, 1));
                    }
                }
            }
        }
        if let Some(run) = current.take() {
            runs.push(run);
        }

        for (slot, start, count) in runs {
            self.maybe_restart()?;
            if let Some(buf) = parent {
                self.fs.journal.get_write_access(self.cx, &self.handle, buf)?;
                buf.update(|data| -> Result<()> {
                    #[allow(clippy::cast_possible_truncation)]
                    for i in 0..count as usize {
                        write_slot(data, slot + i, 0)
                            .map_err(|e| RimeError::Format(e.to_string()))?;
                    }
                    Ok(())
                })?;
                self.fs.journal.dirty_metadata(self.cx, &self.handle, buf)?;
            } else {
                #[allow(clippy::cast_possible_truncation)]
                for i in 0..count as usize {
                    self.inode.set_slot(slot + i, 0);
                }
            }
            self.fs.alloc.free_blocks(
                self.cx,
                &self.fs.journal,
                &self.handle,
                self.inode.ino(),
                BlockNumber(start),
                count,
            )?;
            self.inode
                .update_state(|state| state.blocks = state.blocks.saturating_sub(count));
        }
        Ok(())
    }

    /// Free every subtree referenced from `first..last` of a container,
    /// where each pointer has `depth` indirect levels below it.
    /// Right-to-left, bottom-up.
    fn free_branches(
        &mut self,
        parent: Option<&BufferRef>,
        first: usize,
        last: usize,
        depth: usize,
    ) -> Result<()> {
        if self.handle.is_aborted() {
            return Err(RimeError::Aborted);
        }
        if depth == 0 {
            return self.free_data(parent, first, last);
        }
        let addr_per_block = self.fs.alloc.geometry().block_size.addr_per_block() as usize;

        for index in (first..last).rev() {
            let nr = self.read_container_slot(parent, index)?;
            if nr == 0 {
                continue;
            }
            let child_block = BlockNumber(u64::from(nr));
            if parent.is_some_and(|buf| buf.block() == child_block) {
                return Err(self.fs.errors.mark(
                    child_block.0,
                    format!(
                        "circular indirect block detected, inode={}",
                        self.inode.ino()
                    ),
                ));
            }
            let child = self.fs.cache.read(self.cx, child_block)?;
            self.free_branches(Some(&child), 0, addr_per_block, depth - 1)?;

            self.maybe_restart()?;
            // The child's journal record is dead; revoke before its
            // bitmap bit clears so replay cannot resurrect it.
            self.fs.journal.forget(self.cx, &self.handle, &child)?;
            self.fs.alloc.free_blocks(
                self.cx,
                &self.fs.journal,
                &self.handle,
                self.inode.ino(),
                child_block,
                1,
            )?;
            self.inode
                .update_state(|state| state.blocks = state.blocks.saturating_sub(1));
            self.clear_container_slot(parent, index)?;
        }
        Ok(())
    }

    /// Whether every slot left of `link.index` in its container is zero,
    /// meaning the container itself dies with the cut.
    fn all_left_zero(&self, link: &ChainLink) -> Result<bool> {
        for i in 0..link.index {
            let v = match &link.buffer {
                Some(buf) => buf
                    .with_data(|data| read_slot(data, i))
                    .map_err(|e| RimeError::Format(e.to_string()))?,
                None => self.inode.slot(i),
            };
            if v != 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Truncate `inode` to its current size, freeing all blocks beyond.
/// Idempotent; restartable after a crash via the orphan list.
pub fn truncate(cx: &Cx, fs: &FsCtx, inode: &Arc<Inode>) -> Result<()> {
    cx_checkpoint(cx)?;
    fs.errors.check()?;

    let (fast_symlink, on_list, deleted) = inode.with_state(|s| {
        (
            s.is_fast_symlink(),
            s.flags & SNAPFILE_LIST_FL != 0,
            s.flags & SNAPFILE_DELETED_FL != 0,
        )
    });
    if fast_symlink {
        return Ok(());
    }
    // Snapshots on the list are immutable until flagged deleted.
    if on_list && !deleted {
        return Err(RimeError::Permission);
    }

    let geo = fs.alloc.geometry().clone();
    let block_size = u64::from(geo.block_size.get());
    let size = inode.size();
    let last_block = size.div_ceil(block_size);
    let kind = if inode.is_snapshot() {
        InodeKind::Snapshot
    } else {
        InodeKind::Regular
    };

    let handle = fs.journal.start(cx, blocks_for_truncate(inode))?;
    let guard = inode.lock_tree();
    let mut ctx = TruncCtx {
        cx,
        fs,
        inode,
        handle,
        guard: Some(guard),
        restarts: 0,
    };

    // From here the inode is recoverable: a crash replays the truncate.
    fs.orphans
        .add(cx, &fs.journal, &ctx.handle, &fs.alloc, &fs.inodes, inode)?;

    // Zero the tail of the last surviving block so stale bytes cannot
    // resurface when the file grows again. The write access hook COWs
    // the pre-image into the active snapshot first.
    let tail = size % block_size;
    if tail != 0 {
        if let Some(mapped) =
            crate::map::map_block(cx, fs, Some(&ctx.handle), inode, size / block_size, 1, crate::map::MapMode::READ)?
        {
            let buf = fs.cache.read(cx, mapped.block)?;
            fs.journal.get_write_access(cx, &ctx.handle, &buf)?;
            #[allow(clippy::cast_possible_truncation)]
            buf.update(|data| data[tail as usize..].fill(0));
            fs.journal.dirty_metadata(cx, &ctx.handle, &buf)?;
        }
    }

    let root_limit = if kind == InodeKind::Snapshot {
        SNAP_N_BLOCKS
    } else {
        N_BLOCKS
    };

    let freed = free_beyond(&mut ctx, kind, &geo, last_block, root_limit);
    if let Err(err) = &freed {
        warn!(event = "truncate_failed", ino = inode.ino().0, error = %err);
    }
    freed?;

    // Housekeeping under the final handle; make sure it has credit left.
    ctx.maybe_restart()?;
    inode.update_state(|state| {
        let now = crate::map::unix_now();
        state.mtime = now;
        state.ctime = now;
        state.last_alloc_logical = None;
        state.last_alloc_physical = 0;
    });
    write_inode(cx, &fs.journal, &ctx.handle, &fs.alloc, inode)?;

    let links = inode.with_state(|s| s.links_count);
    if links > 0 {
        fs.orphans
            .remove(cx, &fs.journal, &ctx.handle, &fs.alloc, &fs.inodes, inode)?;
    }

    let handle = ctx.handle.clone();
    drop(ctx);
    fs.journal.stop(cx, &handle)?;
    debug!(event = "truncate_done", ino = inode.ino().0, size);
    Ok(())
}

/// Free everything at or beyond `last_block`.
fn free_beyond(
    ctx: &mut TruncCtx<'_>,
    kind: InodeKind,
    geo: &rime_alloc::FsGeometry,
    last_block: u64,
    root_limit: usize,
) -> Result<()> {
    let apb = geo.block_size.addr_per_block();

    // Nothing representable beyond the cut: the tree ends sooner.
    let Ok(path) = resolve(kind, apb, last_block) else {
        return Ok(());
    };

    let start_root = if path.depth == 1 {
        ctx.free_data(None, path.offsets[0] as usize, DIR_BLOCKS)?;
        IND_START
    } else {
        // Trim trailing zero offsets: the cut coincides with a subtree
        // boundary at the deepest such level.
        let mut k = path.depth;
        while k > 1 && path.offsets[k - 1] == 0 {
            k -= 1;
        }
        let (chain, status) =
            branch::get_branch(ctx.cx, &ctx.fs.cache, ctx.inode, k, &path.offsets)?;
        if status == BranchStatus::Changed {
            // The walk raced nothing: we hold the tree lock.
            return Err(RimeError::Conflict {
                ino: ctx.inode.ino().0,
            });
        }

        // Find the deepest level whose container must survive (has live
        // pointers left of the cut). Everything below dies wholesale.
        let mut cut = chain.links.len() - 1;
        while cut > 0 && ctx.all_left_zero(&chain.links[cut])? {
            cut -= 1;
        }

        // The subtree rooted at the cut position.
        let cut_link = &chain.links[cut];
        let below = path.depth - cut - 1;
        if cut_link.read_current(ctx.inode)? != 0 {
            ctx.free_branches(
                cut_link.buffer.clone().as_ref(),
                cut_link.index,
                cut_link.index + 1,
                below,
            )?;
        }
        // Clear the ends of the surviving indirect blocks on the path.
        for level in (1..=cut).rev() {
            let link = chain.links[level].clone();
            ctx.free_branches(
                link.buffer.as_ref(),
                link.index + 1,
                apb as usize,
                path.depth - level - 1,
            )?;
        }
        path.offsets[0] as usize + 1
    };

    // Whole roots to the right of the cut's root slot.
    for slot in start_root.max(DIR_BLOCKS)..root_limit {
        ctx.free_branches(None, slot, slot + 1, slot_depth(slot))?;
    }
    Ok(())
}

const IND_START: usize = DIR_BLOCKS;

/// Truncate to zero and release the inode itself.
///
/// The caller has already dropped the last link. The inode stays on the
/// orphan list through the truncate and is removed here, after which the
/// inode is freed and evicted.
pub fn delete_inode(cx: &Cx, fs: &FsCtx, inode: &Arc<Inode>) -> Result<()> {
    inode.update_state(|state| {
        state.size = 0;
        state.links_count = 0;
    });
    truncate(cx, fs, inode)?;

    let handle = fs.journal.start(cx, 8)?;
    fs.orphans
        .remove(cx, &fs.journal, &handle, &fs.alloc, &fs.inodes, inode)?;
    let was_dir = inode.with_state(|s| s.mode & rime_types::S_IFMT == rime_types::S_IFDIR);
    inode.update_state(|state| {
        state.dtime = crate::map::unix_now();
    });
    write_inode(cx, &fs.journal, &handle, &fs.alloc, inode)?;
    fs.alloc
        .free_inode(cx, &fs.journal, &handle, inode.ino(), was_dir)?;
    fs.journal.stop(cx, &handle)?;
    fs.inodes.evict(inode.ino());
    debug!(event = "inode_deleted", ino = inode.ino().0);
    Ok(())
}
