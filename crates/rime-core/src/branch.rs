//! Branch walking, verification, allocation, and splice.
//!
//! A branch is the chain of `⟨container, slot index, captured value⟩`
//! triples leading from the inode slot array down to a leaf. The walker
//! re-verifies captured values against their containers to detect
//! concurrent truncation; the allocator builds a detached branch and the
//! splice publishes it with a single pointer store.

use crate::cx_checkpoint;
use crate::map::{MapMode, SnapMap};
use crate::FsCtx;
use asupersync::Cx;
use rime_block::{BufferCache, BufferRef};
use rime_error::{Result, RimeError};
use rime_inode::Inode;
use rime_journal::Handle;
use rime_types::{read_slot, write_slot, BlockNumber, GroupNumber, LogicalBlock};
use tracing::{trace, warn};

/// One level of a branch: where a pointer lives and what it held when
/// the walker captured it.
#[derive(Debug, Clone)]
pub struct ChainLink {
    /// Owning indirect-block buffer; `None` for the root link, whose
    /// pointer lives in the inode slot array.
    pub buffer: Option<BufferRef>,
    /// Slot index within the container.
    pub index: usize,
    /// Captured slot value (0 = hole).
    pub key: u32,
}

impl ChainLink {
    /// Re-read the slot through its container.
    pub fn read_current(&self, inode: &Inode) -> Result<u32> {
        match &self.buffer {
            Some(buf) => buf
                .with_data(|data| read_slot(data, self.index))
                .map_err(|e| RimeError::Format(e.to_string())),
            None => Ok(inode.slot(self.index)),
        }
    }

    /// Store a value through the container (caller holds write access).
    pub fn write_through(&self, inode: &Inode, value: u32) -> Result<()> {
        match &self.buffer {
            Some(buf) => buf
                .update(|data| write_slot(data, self.index, value))
                .map_err(|e| RimeError::Format(e.to_string())),
            None => {
                inode.set_slot(self.index, value);
                Ok(())
            }
        }
    }
}

/// The walked (or under-construction) chain of links, root first.
#[derive(Debug, Clone, Default)]
pub struct BranchChain {
    pub links: Vec<ChainLink>,
}

impl BranchChain {
    #[must_use]
    pub fn last(&self) -> Option<&ChainLink> {
        self.links.last()
    }

    /// Physical block the deepest captured value names.
    #[must_use]
    pub fn leaf_block(&self) -> Option<BlockNumber> {
        self.last().map(|l| BlockNumber(u64::from(l.key)))
    }

    /// Re-read every slot and confirm it still equals its captured value.
    pub fn verify(&self, inode: &Inode) -> Result<bool> {
        for link in &self.links {
            if link.read_current(inode)? != link.key {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Outcome of a branch walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchStatus {
    /// Every level resolved; the chain reaches a leaf.
    Complete,
    /// A zero slot stopped the walk; the chain ends at the hole.
    Hole,
    /// A previously captured slot changed while reading deeper levels;
    /// the caller must retry from scratch.
    Changed,
}

/// Walk an existing branch of `depth` levels along `offsets`.
pub fn get_branch(
    cx: &Cx,
    cache: &BufferCache,
    inode: &Inode,
    depth: usize,
    offsets: &[u32],
) -> Result<(BranchChain, BranchStatus)> {
    cx_checkpoint(cx)?;
    let mut chain = BranchChain::default();
    let root = ChainLink {
        buffer: None,
        index: offsets[0] as usize,
        key: inode.slot(offsets[0] as usize),
    };
    let mut key = root.key;
    chain.links.push(root);
    if key == 0 {
        return Ok((chain, BranchStatus::Hole));
    }

    for level in 1..depth {
        let buf = cache.read(cx, BlockNumber(u64::from(key)))?;
        // The read may have suspended; confirm nothing moved under us.
        if !chain.verify(inode)? {
            return Ok((chain, BranchStatus::Changed));
        }
        key = buf
            .with_data(|data| read_slot(data, offsets[level] as usize))
            .map_err(|e| RimeError::Format(e.to_string()))?;
        chain.links.push(ChainLink {
            buffer: Some(buf),
            index: offsets[level] as usize,
            key,
        });
        if key == 0 {
            return Ok((chain, BranchStatus::Hole));
        }
    }
    Ok((chain, BranchStatus::Complete))
}

// ── Allocation locality ─────────────────────────────────────────────────────

/// Preferred allocation target when the sequential heuristic fails:
/// the nearest allocated block to the left, then the holding indirect
/// block itself, then a PID-coloured slice of the inode's group.
#[must_use]
pub fn find_near(fs: &FsCtx, inode: &Inode, partial: &ChainLink) -> BlockNumber {
    // Left-scan inside the holding container.
    let left = match &partial.buffer {
        Some(buf) => buf.with_data(|data| {
            (0..partial.index)
                .rev()
                .find_map(|i| match read_slot(data, i) {
                    Ok(v) if v != 0 => Some(v),
                    _ => None,
                })
        }),
        None => (0..partial.index)
            .rev()
            .map(|i| inode.slot(i))
            .find(|v| *v != 0),
    };
    if let Some(v) = left {
        return BlockNumber(u64::from(v));
    }
    if let Some(buf) = &partial.buffer {
        return buf.block();
    }
    // Root in the inode: colour the group start by PID so concurrent
    // writers of unrelated inodes spread out within the group.
    let geo = fs.alloc.geometry();
    let group = rime_types::inode_to_group(inode.ino(), geo.inodes_per_group);
    let group = GroupNumber(group.0 % geo.group_count.max(1));
    let bg_start = fs.alloc.geometry().group_first_block(group);
    let colour = u64::from(std::process::id() % 16) * u64::from(geo.blocks_per_group / 16);
    BlockNumber(bg_start.0 + colour)
}

/// Preferred allocation target for mapping `iblock`.
#[must_use]
pub fn find_goal(
    fs: &FsCtx,
    inode: &Inode,
    iblock: LogicalBlock,
    partial: &ChainLink,
    mode: MapMode,
) -> BlockNumber {
    let sequential = inode.with_state(|state| {
        match state.last_alloc_logical {
            Some(last) if iblock.0 == last + 1 && state.last_alloc_physical != 0 => {
                Some(BlockNumber(state.last_alloc_physical + 1))
            }
            _ => None,
        }
    });
    if let Some(goal) = sequential {
        return goal;
    }
    // Snapshot copies are placed near their sources, whose physical
    // address equals the snapshot-file logical offset.
    if inode.is_snapshot() && mode.snap.is_some() {
        return BlockNumber(iblock.0);
    }
    find_near(fs, inode, partial)
}

/// Count the leaf blocks worth allocating in one call: coalesces the run
/// of holes after the mapped position without crossing the indirect
/// boundary.
pub fn blocks_to_allocate(
    inode: &Inode,
    partial: &ChainLink,
    indirect_missing: usize,
    maxblocks: u64,
    boundary: u32,
) -> Result<u64> {
    if indirect_missing > 0 {
        // The whole sub-branch is absent; everything under it is holes.
        return Ok(maxblocks.min(u64::from(boundary) + 1));
    }
    let mut count = 1u64;
    while count < maxblocks && count <= u64::from(boundary) {
        #[allow(clippy::cast_possible_truncation)]
        let next_index = partial.index + count as usize;
        let slot = match &partial.buffer {
            Some(buf) => buf
                .with_data(|data| read_slot(data, next_index))
                .map_err(|e| RimeError::Format(e.to_string()))?,
            None => inode.slot(next_index),
        };
        if slot != 0 {
            break;
        }
        count += 1;
    }
    Ok(count)
}

// ── Branch allocation ───────────────────────────────────────────────────────

/// Outcome of `alloc_branch`: the new links (deepest last) plus the leaf
/// run that the splice will publish.
#[derive(Debug)]
pub struct NewBranch {
    /// Links for the newly allocated indirect blocks, shallowest first.
    /// Empty when only leaves were needed.
    pub links: Vec<ChainLink>,
    /// First leaf block of the run.
    pub leaf_start: BlockNumber,
    /// Number of leaf blocks mapped.
    pub leaf_count: u64,
    /// First new block (what the splice stores into the parent slot).
    pub subroot: u32,
}

fn alloc_pool(
    cx: &Cx,
    fs: &FsCtx,
    handle: &Handle,
    ino: rime_types::InodeNumber,
    goal: BlockNumber,
    indirect_count: usize,
    leaf_want: u64,
) -> Result<(Vec<BlockNumber>, Option<(BlockNumber, u64)>)> {
    let mut indirects: Vec<BlockNumber> = Vec::with_capacity(indirect_count);
    let mut leaves: Option<(BlockNumber, u64)> = None;
    let mut target = indirect_count as u64 + leaf_want;

    let result = loop {
        let got = match fs.alloc.new_blocks(cx, &fs.journal, handle, goal, target) {
            Ok(got) => got,
            Err(err) => break Err(err),
        };
        target = target.saturating_sub(got.count);
        let mut run_start = got.start;
        let mut run_len = got.count;
        while indirects.len() < indirect_count && run_len > 0 {
            indirects.push(run_start);
            run_start = BlockNumber(run_start.0 + 1);
            run_len -= 1;
        }
        if run_len > 0 {
            leaves = Some((run_start, run_len));
            break Ok(());
        }
        if leaf_want == 0 && indirects.len() == indirect_count {
            break Ok(());
        }
    };

    if let Err(err) = result {
        for block in &indirects {
            if let Err(free_err) = fs
                .alloc
                .free_blocks(cx, &fs.journal, handle, ino, *block, 1)
            {
                warn!(
                    event = "alloc_rollback_failed",
                    block = block.0,
                    error = %free_err
                );
            }
        }
        return Err(err);
    }
    Ok((indirects, leaves))
}

/// Allocate and wire up the missing part of a branch.
///
/// `missing_offsets` are the slot offsets for the absent levels, the
/// first of which indexes the parent (still-unset) slot. Each new
/// indirect is zeroed, given its downward pointer, granted journal
/// create access, and dirtied — or written synchronously to disk for
/// bitmap-bootstrap allocations, whose mapping must not reserve journal
/// credits. On failure everything allocated is forgotten and freed; the
/// on-disk tree is untouched.
#[allow(clippy::too_many_arguments)]
pub fn alloc_branch(
    cx: &Cx,
    fs: &FsCtx,
    handle: &Handle,
    inode: &Inode,
    iblock: LogicalBlock,
    missing_offsets: &[u32],
    goal: BlockNumber,
    leaf_want: u64,
    mode: MapMode,
) -> Result<NewBranch> {
    cx_checkpoint(cx)?;
    let indirect_count = missing_offsets.len().saturating_sub(1);
    let block_size = fs.cache.block_size() as usize;

    let (indirects, leaves) = if mode.snap == Some(SnapMap::Move) {
        // Moving: the caller's existing physical blocks become the
        // leaves; only indirect blocks may need allocating.
        let indirects = if indirect_count > 0 {
            alloc_pool(cx, fs, handle, inode.ino(), goal, indirect_count, 0)?.0
        } else {
            Vec::new()
        };
        (indirects, Some((BlockNumber(iblock.0), leaf_want)))
    } else {
        let (indirects, leaves) =
            alloc_pool(cx, fs, handle, inode.ino(), goal, indirect_count, leaf_want)?;
        (indirects, leaves)
    };

    let Some((leaf_start, leaf_count)) = leaves else {
        return Err(RimeError::NoSpace);
    };
    let sync_mode = mode.snap == Some(SnapMap::Bitmap);

    let subroot = indirects
        .first()
        .copied()
        .unwrap_or(leaf_start)
        .to_u32()
        .map_err(|e| RimeError::Format(e.to_string()))?;

    let mut links: Vec<ChainLink> = Vec::with_capacity(indirect_count);
    let mut failed: Option<RimeError> = None;

    for (n, block) in indirects.iter().enumerate() {
        let buf = fs.cache.getblk(*block);
        if !sync_mode {
            if let Err(err) = fs.journal.get_create_access(cx, handle, &buf) {
                failed = Some(err);
                break;
            }
        }
        let next_key = indirects
            .get(n + 1)
            .copied()
            .unwrap_or(leaf_start)
            .to_u32()
            .map_err(|e| RimeError::Format(e.to_string()))?;
        let slot_index = missing_offsets[n + 1] as usize;
        let write_result = buf.update(|data| -> Result<()> {
            data.fill(0);
            debug_assert_eq!(data.len(), block_size);
            write_slot(data, slot_index, next_key).map_err(|e| RimeError::Format(e.to_string()))?;
            if n + 1 == indirect_count {
                // Deepest indirect: publish the whole leaf run.
                for i in 1..leaf_count {
                    #[allow(clippy::cast_possible_truncation)]
                    let leaf = (leaf_start.0 + i) as u32;
                    write_slot(data, slot_index + i as usize, leaf)
                        .map_err(|e| RimeError::Format(e.to_string()))?;
                }
            }
            Ok(())
        });
        if let Err(err) = write_result {
            failed = Some(err);
            break;
        }
        let publish = if sync_mode {
            fs.cache.sync_write(cx, &buf)
        } else {
            fs.journal.dirty_metadata(cx, handle, &buf)
        };
        if let Err(err) = publish {
            failed = Some(err);
            break;
        }
        links.push(ChainLink {
            buffer: Some(buf),
            index: slot_index,
            key: next_key,
        });
    }

    if let Some(err) = failed {
        // Roll back: forget journal reservations, free the blocks.
        for link in &links {
            if let Some(buf) = &link.buffer {
                if !sync_mode {
                    if let Err(forget_err) = fs.journal.forget(cx, handle, buf) {
                        warn!(
                            event = "branch_rollback_forget_failed",
                            block = buf.block().0,
                            error = %forget_err
                        );
                    }
                }
            }
        }
        for block in &indirects {
            if let Err(free_err) = fs
                .alloc
                .free_blocks(cx, &fs.journal, handle, inode.ino(), *block, 1)
            {
                warn!(
                    event = "branch_rollback_free_failed",
                    block = block.0,
                    error = %free_err
                );
            }
        }
        if mode.snap != Some(SnapMap::Move) {
            if let Err(free_err) = fs.alloc.free_blocks(
                cx,
                &fs.journal,
                handle,
                inode.ino(),
                leaf_start,
                leaf_count,
            ) {
                warn!(
                    event = "branch_rollback_free_failed",
                    block = leaf_start.0,
                    error = %free_err
                );
            }
        }
        return Err(err);
    }

    trace!(
        event = "branch_allocated",
        ino = inode.ino().0,
        indirects = indirect_count,
        leaves = leaf_count,
        subroot
    );
    Ok(NewBranch {
        links,
        leaf_start,
        leaf_count,
        subroot,
    })
}

/// Splice a freshly allocated branch into the tree.
///
/// The store of `new.subroot` into the parent slot is the linearization
/// point publishing the branch. Housekeeping (allocation memory, block
/// accounting, ctime, inode dirty) follows under the same handle.
#[allow(clippy::too_many_arguments)]
pub fn splice_branch(
    cx: &Cx,
    fs: &FsCtx,
    handle: &Handle,
    inode: &Inode,
    iblock: LogicalBlock,
    parent: &ChainLink,
    new: &NewBranch,
    mode: MapMode,
) -> Result<()> {
    cx_checkpoint(cx)?;
    if let Some(buf) = &parent.buffer {
        fs.journal.get_write_access(cx, handle, buf)?;
    }

    let result = (|| -> Result<()> {
        parent.write_through(inode, new.subroot)?;
        if new.links.is_empty() && new.leaf_count > 1 {
            // The run lives directly in the parent container.
            for i in 1..new.leaf_count {
                let leaf = BlockNumber(new.leaf_start.0 + i)
                    .to_u32()
                    .map_err(|e| RimeError::Format(e.to_string()))?;
                #[allow(clippy::cast_possible_truncation)]
                let index = parent.index + i as usize;
                let sibling = ChainLink {
                    buffer: parent.buffer.clone(),
                    index,
                    key: 0,
                };
                sibling.write_through(inode, leaf)?;
            }
        }

        inode.update_state(|state| {
            if mode.snap != Some(SnapMap::Move) {
                state.last_alloc_logical = Some(iblock.0 + new.leaf_count - 1);
                state.last_alloc_physical = new.leaf_start.0 + new.leaf_count - 1;
            }
            // A replaced (moved-out) block was already released by the
            // move hook, so the fresh leaf is always charged in full.
            state.blocks += new.links.len() as u64 + new.leaf_count;
            state.ctime = crate::map::unix_now();
        });
        rime_inode::write_inode(cx, &fs.journal, handle, &fs.alloc, inode)?;

        if let Some(buf) = &parent.buffer {
            fs.journal.dirty_metadata(cx, handle, buf)?;
        }
        Ok(())
    })();

    if let Err(err) = result {
        // Undo what alloc_branch built; the tree was never published if
        // the parent store itself failed, and a failed parent dirty means
        // the transaction is going down anyway.
        for link in &new.links {
            if let Some(buf) = &link.buffer {
                if let Err(forget_err) = fs.journal.forget(cx, handle, buf) {
                    warn!(
                        event = "splice_rollback_forget_failed",
                        block = buf.block().0,
                        error = %forget_err
                    );
                }
                let _ = fs
                    .alloc
                    .free_blocks(cx, &fs.journal, handle, inode.ino(), buf.block(), 1);
            }
        }
        if mode.snap != Some(SnapMap::Move) {
            let _ = fs.alloc.free_blocks(
                cx,
                &fs.journal,
                handle,
                inode.ino(),
                new.leaf_start,
                new.leaf_count,
            );
        }
        return Err(err);
    }

    trace!(
        event = "branch_spliced",
        ino = inode.ino().0,
        iblock = iblock.0,
        subroot = new.subroot,
        leaves = new.leaf_count
    );
    Ok(())
}
