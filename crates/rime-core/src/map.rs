//! The `map_block` entry point.
//!
//! Translates `(inode, logical block)` to a physical mapping, allocating
//! and splicing branches on demand. Snapshot files read through their
//! holes (to newer snapshots, then to the device); regular-file
//! overwrites under an active snapshot are routed through the
//! move-on-write hook before the old block may be touched.

use crate::branch::{self, BranchChain, BranchStatus, ChainLink};
use crate::path::{resolve, InodeKind};
use crate::snapshot::SnapAccess;
use crate::{cx_checkpoint, FsCtx};
use asupersync::Cx;
use rime_block::BufferRef;
use rime_error::{Result, RimeError};
use rime_inode::Inode;
use rime_journal::Handle;
use rime_types::{read_slot, BlockNumber, LogicalBlock};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// Snapshot-internal mapping commands, carried alongside `create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapMap {
    /// Allocate a private copy destination for a COWed block.
    Cow,
    /// Re-parent the caller's existing block; allocate only indirects.
    Move,
    /// Like `Cow`, but indirect blocks bypass the journal (synced
    /// directly) — used for the blocks that map COW bitmap copies.
    Bitmap,
}

/// How a mapping request may modify the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MapMode {
    /// Allocate on holes.
    pub create: bool,
    /// The caller will overwrite existing data in place; route the old
    /// block through the move hook first.
    pub overwrite: bool,
    /// The write does not cover the whole block; the old contents are
    /// read before any move so the caller can merge.
    pub partial: bool,
    /// Direct I/O: never fill holes inside the file or interleave with
    /// moves; such requests fall back to the buffered path.
    pub direct_io: bool,
    /// Snapshot-engine internal command.
    pub snap: Option<SnapMap>,
}

impl MapMode {
    pub const READ: Self = Self {
        create: false,
        overwrite: false,
        partial: false,
        direct_io: false,
        snap: None,
    };

    pub const WRITE: Self = Self {
        create: true,
        overwrite: false,
        partial: false,
        direct_io: false,
        snap: None,
    };

    #[must_use]
    pub fn overwriting(mut self) -> Self {
        self.overwrite = true;
        self
    }

    #[must_use]
    pub fn partial_write(mut self) -> Self {
        self.partial = true;
        self
    }

    #[must_use]
    pub fn direct(mut self) -> Self {
        self.direct_io = true;
        self
    }

    #[must_use]
    pub(crate) fn snap_cow() -> Self {
        Self {
            create: true,
            snap: Some(SnapMap::Cow),
            ..Self::READ
        }
    }

    #[must_use]
    pub(crate) fn snap_move() -> Self {
        Self {
            create: true,
            snap: Some(SnapMap::Move),
            ..Self::READ
        }
    }

    #[must_use]
    pub(crate) fn snap_bitmap() -> Self {
        Self {
            create: true,
            snap: Some(SnapMap::Bitmap),
            ..Self::READ
        }
    }
}

/// A successful mapping.
#[derive(Debug)]
pub struct Mapped {
    /// First physical block.
    pub block: BlockNumber,
    /// Contiguous blocks mapped (>= 1).
    pub count: u64,
    /// The mapping was created by this call.
    pub new: bool,
    /// The run ends at an indirect-block boundary.
    pub boundary: bool,
    /// Pending-COW destination buffer, pinned for the snapshot engine;
    /// set only for `SnapMap::{Cow, Bitmap}` mappings.
    pub pending: Option<BufferRef>,
    /// Pre-move contents of the replaced block, captured for partial
    /// overwrites.
    pub old_data: Option<Vec<u8>>,
}

/// Journal credits a caller should reserve for mapping one block:
/// a full branch of indirects, the parent splice, the inode, the
/// bitmap, and room for the COW copies the hooks may trigger.
#[must_use]
pub fn map_trans_blocks() -> u32 {
    let branch = rime_types::MAX_DEPTH as u32 + 2;
    2 * branch + 4
}

/// Seconds since the epoch, for ctime stamping.
#[must_use]
pub fn unix_now() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// Map `maxblocks` logical blocks of `inode` starting at `iblock`.
///
/// Returns `Ok(None)` for an unmapped hole without `create` (and for
/// direct-I/O requests that must fall back to the buffered path). A
/// `Conflict` from a concurrent tree mutation is retried once after
/// re-grabbing the inode's tree lock.
pub fn map_block(
    cx: &Cx,
    fs: &FsCtx,
    handle: Option<&Handle>,
    inode: &Arc<Inode>,
    iblock: u64,
    maxblocks: u64,
    mode: MapMode,
) -> Result<Option<Mapped>> {
    if mode.create && handle.is_none() {
        return Err(RimeError::Format("create mapping requires a handle".to_owned()));
    }
    fs.errors.check()?;
    match get_blocks(cx, fs, handle, inode, iblock, maxblocks, mode) {
        Err(RimeError::Conflict { .. }) => {
            // The chain changed under the walker. Taking and releasing
            // the tree lock waits out the mutator; then try once more.
            {
                let _barrier = inode.lock_tree();
            }
            get_blocks(cx, fs, handle, inode, iblock, maxblocks, mode)
        }
        other => other,
    }
}

fn get_blocks(
    cx: &Cx,
    fs: &FsCtx,
    handle: Option<&Handle>,
    inode: &Arc<Inode>,
    iblock: u64,
    maxblocks: u64,
    mode: MapMode,
) -> Result<Option<Mapped>> {
    cx_checkpoint(cx)?;
    let geo = fs.alloc.geometry();
    let kind = if inode.is_snapshot() {
        InodeKind::Snapshot
    } else {
        InodeKind::Regular
    };
    let path = resolve(kind, geo.block_size.addr_per_block(), iblock)?;
    let access = fs.snapshots.inode_access(handle, inode, mode)?;

    // Fast path: plain lookup without the tree lock.
    let (chain, status) = branch::get_branch(cx, &fs.cache, inode, path.depth, &path.offsets)?;
    match status {
        BranchStatus::Complete => {
            let wants_move = mode.overwrite && fs.snapshots.should_move_data(inode);
            if !wants_move {
                return map_found(cx, fs, inode, &chain, path.boundary, maxblocks, access, iblock)
                    .map(Some);
            }
        }
        BranchStatus::Changed => {
            if !mode.create {
                return Err(RimeError::Conflict { ino: inode.ino().0 });
            }
        }
        BranchStatus::Hole => {
            if access == SnapAccess::ReadThrough {
                return read_through(cx, fs, inode, iblock);
            }
            if !mode.create {
                return Ok(None);
            }
            if mode.direct_io {
                // Filling a hole inside the file is unsafe for the
                // async direct path; only size-extending writes proceed.
                let end = (iblock + maxblocks)
                    .checked_mul(u64::from(geo.block_size.get()))
                    .ok_or(RimeError::NoSpace)?;
                if end <= inode.size() {
                    return Ok(None);
                }
            }
        }
    }

    let Some(handle) = handle else {
        return Ok(None);
    };

    // Write path: everything below holds the tree lock. A COW of the
    // active snapshot nests its lock inside the regular inode's; that is
    // the one sanctioned nesting (regular before active-snapshot).
    let _tree = inode.lock_tree();
    let (chain, status) = branch::get_branch(cx, &fs.cache, inode, path.depth, &path.offsets)?;

    match status {
        BranchStatus::Changed => Err(RimeError::Conflict { ino: inode.ino().0 }),
        BranchStatus::Complete => {
            let wants_move = mode.overwrite && fs.snapshots.should_move_data(inode);
            if !wants_move {
                return map_found(cx, fs, inode, &chain, path.boundary, maxblocks, access, iblock)
                    .map(Some);
            }
            if mode.direct_io {
                // A move would interleave page-granularity copies with
                // the direct write; punt to the buffered path.
                return Ok(None);
            }
            let old_block = chain
                .leaf_block()
                .ok_or_else(|| RimeError::Format("complete chain without leaf".to_owned()))?;
            let old_data = if mode.partial {
                Some(fs.cache.read(cx, old_block)?.data())
            } else {
                None
            };
            let moved = fs
                .journal
                .get_move_access(cx, handle, inode.ino(), old_block, 1)?;
            if moved == 0 {
                // Already preserved (or no snapshot interest): write in
                // place.
                return map_found(cx, fs, inode, &chain, path.boundary, maxblocks, access, iblock)
                    .map(Some);
            }
            // The old block now belongs to the snapshot; allocate a
            // replacement leaf and splice it over the old pointer.
            debug!(
                event = "data_block_moved",
                ino = inode.ino().0,
                iblock,
                old_block = old_block.0
            );
            let leaf_offsets = [path.offsets[path.depth - 1]];
            allocate_and_splice(
                cx,
                fs,
                handle,
                inode,
                iblock,
                &chain,
                &leaf_offsets,
                1,
                path.boundary,
                mode,
                old_data,
            )
            .map(Some)
        }
        BranchStatus::Hole => {
            if access == SnapAccess::ReadThrough && !mode.create {
                return read_through(cx, fs, inode, iblock);
            }
            let partial_depth = chain.links.len();
            let missing = &path.offsets[partial_depth - 1..path.depth];
            let leaf_want = branch::blocks_to_allocate(
                inode,
                chain
                    .last()
                    .ok_or_else(|| RimeError::Format("empty chain".to_owned()))?,
                missing.len() - 1,
                maxblocks,
                path.boundary,
            )?;
            allocate_and_splice(
                cx,
                fs,
                handle,
                inode,
                iblock,
                &chain,
                missing,
                leaf_want,
                path.boundary,
                mode,
                None,
            )
            .map(Some)
        }
    }
}

/// Finish a lookup that found a complete chain: extend the run over
/// contiguous leaves, re-verifying the chain as it goes.
#[allow(clippy::too_many_arguments)]
fn map_found(
    cx: &Cx,
    fs: &FsCtx,
    inode: &Inode,
    chain: &BranchChain,
    boundary: u32,
    maxblocks: u64,
    access: SnapAccess,
    iblock: u64,
) -> Result<Mapped> {
    let first = chain
        .leaf_block()
        .ok_or_else(|| RimeError::Format("complete chain without leaf".to_owned()))?;
    let leaf = chain
        .last()
        .ok_or_else(|| RimeError::Format("empty chain".to_owned()))?;

    let mut count = 1u64;
    while count < maxblocks && count <= u64::from(boundary) {
        if !chain.verify(inode)? {
            // Concurrent truncate while extending; retry from scratch.
            return Err(RimeError::Conflict { ino: inode.ino().0 });
        }
        #[allow(clippy::cast_possible_truncation)]
        let next_index = leaf.index + count as usize;
        let next = match &leaf.buffer {
            Some(buf) => buf
                .with_data(|data| read_slot(data, next_index))
                .map_err(|e| RimeError::Format(e.to_string()))?,
            None => inode.slot(next_index),
        };
        if u64::from(next) == first.0 + count {
            count += 1;
        } else {
            break;
        }
    }

    // A mapped block on the active-snapshot read path may be a COW copy
    // still in flight; wait for the copy to land before handing the
    // mapping out.
    if access == SnapAccess::ReadThrough && first.0 != iblock {
        if let Some(entry) = fs.cache.peek(first) {
            entry.wait_pending_cow(cx)?;
        }
    }

    Ok(Mapped {
        block: first,
        count,
        new: false,
        boundary: count > u64::from(boundary),
        pending: None,
        old_data: None,
    })
}

/// Resolve a snapshot-file hole: cascade to the next newer snapshot, or
/// read through to the live device block for the active snapshot.
fn read_through(
    cx: &Cx,
    fs: &FsCtx,
    inode: &Arc<Inode>,
    iblock: u64,
) -> Result<Option<Mapped>> {
    if fs.snapshots.is_active(inode) {
        // The snapshot file's logical offset is the device block.
        trace!(event = "snapshot_read_device", iblock);
        return Ok(Some(Mapped {
            block: BlockNumber(iblock),
            count: 1,
            new: false,
            boundary: false,
            pending: None,
            old_data: None,
        }));
    }
    match fs.snapshots.read_through_target(cx, fs, inode)? {
        Some(newer) => map_block(cx, fs, None, &newer, iblock, 1, MapMode::READ),
        None => Err(RimeError::Inconsistency {
            block: iblock,
            detail: format!(
                "snapshot {} is neither active nor on the snapshot list",
                inode.ino()
            ),
        }),
    }
}

/// Allocate the missing branch, publish pending-COW markers for COW
/// destinations, and splice.
#[allow(clippy::too_many_arguments)]
fn allocate_and_splice(
    cx: &Cx,
    fs: &FsCtx,
    handle: &Handle,
    inode: &Arc<Inode>,
    iblock: u64,
    chain: &BranchChain,
    missing_offsets: &[u32],
    leaf_want: u64,
    boundary: u32,
    mode: MapMode,
    old_data: Option<Vec<u8>>,
) -> Result<Mapped> {
    let partial = chain
        .last()
        .ok_or_else(|| RimeError::Format("empty chain".to_owned()))?;
    let goal = branch::find_goal(fs, inode, LogicalBlock(iblock), partial, mode);
    let new = branch::alloc_branch(
        cx,
        fs,
        handle,
        inode,
        LogicalBlock(iblock),
        missing_offsets,
        goal,
        leaf_want,
        mode,
    )?;

    // COW destinations become visible the instant the splice lands, so
    // the pending marker must already be set for readers to wait on.
    let pending = if matches!(mode.snap, Some(SnapMap::Cow | SnapMap::Bitmap)) {
        let sbh = fs.cache.getblk(new.leaf_start);
        sbh.start_pending_cow();
        Some(sbh)
    } else {
        None
    };

    let result = branch::splice_branch(
        cx,
        fs,
        handle,
        inode,
        LogicalBlock(iblock),
        partial,
        &new,
        mode,
    );
    if let Err(err) = result {
        if let Some(sbh) = &pending {
            sbh.cancel_pending_cow();
        }
        return Err(err);
    }

    Ok(Mapped {
        block: new.leaf_start,
        count: new.leaf_count,
        new: true,
        boundary: new.leaf_count > u64::from(boundary),
        pending,
        old_data,
    })
}

// ── Single-block helpers ────────────────────────────────────────────────────

/// Map one block and return its (possibly fresh) cache buffer without
/// reading the device. New blocks come back zero-filled.
pub fn getblk(
    cx: &Cx,
    fs: &FsCtx,
    handle: Option<&Handle>,
    inode: &Arc<Inode>,
    iblock: u64,
    mode: MapMode,
) -> Result<Option<BufferRef>> {
    let Some(mapped) = map_block(cx, fs, handle, inode, iblock, 1, mode)? else {
        return Ok(None);
    };
    Ok(Some(fs.cache.getblk(mapped.block)))
}

/// Map one block and read it through the cache.
pub fn bread(
    cx: &Cx,
    fs: &FsCtx,
    handle: Option<&Handle>,
    inode: &Arc<Inode>,
    iblock: u64,
) -> Result<Option<BufferRef>> {
    let Some(mapped) = map_block(cx, fs, handle, inode, iblock, 1, MapMode::READ)? else {
        return Ok(None);
    };
    Ok(Some(fs.cache.read(cx, mapped.block)?))
}
