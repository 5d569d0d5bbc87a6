#![forbid(unsafe_code)]
//! Write-ahead journal service.
//!
//! The mapping and snapshot engines consume the journal through handles:
//! `start` opens (or joins) a compound transaction with a buffer-credit
//! budget, the access functions route every metadata modification through
//! the registered [`AccessHooks`] (where the snapshot COW engine lives),
//! and `stop`/`restart` drive commit. Commit writes descriptor, data,
//! revoke, and commit records into the journal region, syncs, and then
//! checkpoints the home blocks; `replay` applies committed transactions
//! after a crash, skipping revoked blocks.

use asupersync::Cx;
use parking_lot::Mutex;
use rime_block::{BufferCache, BufferRef};
use rime_error::{Result, RimeError};
use rime_types::{read_le_u32, BlockNumber, GroupNumber, InodeNumber, TxnId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| RimeError::Cancelled)
}

// ── Record format ───────────────────────────────────────────────────────────

const JOURNAL_MAGIC: u32 = 0x524A_4E4C; // "RJNL"
const BLOCKTYPE_DESCRIPTOR: u32 = 1;
const BLOCKTYPE_COMMIT: u32 = 2;
const BLOCKTYPE_REVOKE: u32 = 5;
const HEADER_SIZE: usize = 12;
const TAG_SIZE: usize = 8;
const TAG_FLAG_LAST: u32 = 0x0000_0008;

/// Journal region expressed in block coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalRegion {
    pub start: BlockNumber,
    pub blocks: u64,
}

impl JournalRegion {
    /// Resolve a region-relative index to an absolute block number.
    #[must_use]
    pub fn resolve(self, index: u64) -> Option<BlockNumber> {
        if index >= self.blocks {
            return None;
        }
        self.start.0.checked_add(index).map(BlockNumber)
    }
}

fn write_header(block: &mut [u8], block_type: u32, sequence: u64) {
    block[0..4].copy_from_slice(&JOURNAL_MAGIC.to_le_bytes());
    block[4..8].copy_from_slice(&block_type.to_le_bytes());
    #[allow(clippy::cast_possible_truncation)]
    let seq32 = sequence as u32;
    block[8..12].copy_from_slice(&seq32.to_le_bytes());
}

#[derive(Debug, Clone, Copy)]
struct Header {
    magic: u32,
    block_type: u32,
    sequence: u32,
}

fn parse_header(block: &[u8]) -> Option<Header> {
    Some(Header {
        magic: read_le_u32(block, 0).ok()?,
        block_type: read_le_u32(block, 4).ok()?,
        sequence: read_le_u32(block, 8).ok()?,
    })
}

// ── Access hooks ────────────────────────────────────────────────────────────

/// Disposition of a leading portion of a to-be-freed block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteAccess {
    /// The snapshot inherited the first `n` blocks; their bitmap bits stay
    /// set and ownership accounting transfers to the snapshot.
    Inherited(u64),
    /// The first `n` blocks need no preservation and may be freed.
    Freeable(u64),
}

/// Pre-modification hooks the snapshot COW engine registers on the journal.
///
/// Each hook receives the handle under which the modification will be
/// journaled, so the snapshot copy commits before or with the change it
/// protects. A handle marked `cowing` indicates the call is re-entering
/// from inside a COW operation; implementations must treat that as a no-op.
pub trait AccessHooks: Send + Sync {
    /// A metadata buffer is about to be dirtied.
    fn on_write_access(&self, cx: &Cx, handle: &Handle, buf: &BufferRef) -> Result<()>;

    /// A freshly allocated metadata block was obtained. A snapshot that
    /// still references the block signals allocator corruption.
    fn on_create_access(&self, cx: &Cx, handle: &Handle, buf: &BufferRef) -> Result<()>;

    /// A block bitmap is about to be modified.
    fn on_bitmap_access(
        &self,
        cx: &Cx,
        handle: &Handle,
        group: GroupNumber,
        buf: &BufferRef,
    ) -> Result<()>;

    /// `count` data blocks of `ino` starting at `block` are about to be
    /// overwritten in place. Returns the number of blocks that were moved
    /// into the snapshot (0 = nothing needed preserving).
    fn on_move_access(
        &self,
        cx: &Cx,
        handle: &Handle,
        ino: InodeNumber,
        block: BlockNumber,
        count: u64,
    ) -> Result<u64>;

    /// `count` blocks are about to be returned to the allocator. The
    /// snapshot may inherit a leading run directly instead of copying;
    /// the caller frees only runs reported [`DeleteAccess::Freeable`].
    fn on_delete_access(
        &self,
        cx: &Cx,
        handle: &Handle,
        ino: InodeNumber,
        block: BlockNumber,
        count: u64,
    ) -> Result<DeleteAccess>;
}

/// Hooks that do nothing; the journal runs with these until a snapshot
/// engine is registered.
#[derive(Debug, Default)]
pub struct NoopHooks;

impl AccessHooks for NoopHooks {
    fn on_write_access(&self, _cx: &Cx, _handle: &Handle, _buf: &BufferRef) -> Result<()> {
        Ok(())
    }

    fn on_create_access(&self, _cx: &Cx, _handle: &Handle, _buf: &BufferRef) -> Result<()> {
        Ok(())
    }

    fn on_bitmap_access(
        &self,
        _cx: &Cx,
        _handle: &Handle,
        _group: GroupNumber,
        _buf: &BufferRef,
    ) -> Result<()> {
        Ok(())
    }

    fn on_move_access(
        &self,
        _cx: &Cx,
        _handle: &Handle,
        _ino: InodeNumber,
        _block: BlockNumber,
        _count: u64,
    ) -> Result<u64> {
        Ok(0)
    }

    fn on_delete_access(
        &self,
        _cx: &Cx,
        _handle: &Handle,
        _ino: InodeNumber,
        _block: BlockNumber,
        count: u64,
    ) -> Result<DeleteAccess> {
        Ok(DeleteAccess::Freeable(count))
    }
}

// ── Handle ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct HandleInner {
    tid: TxnId,
    buffer_credits: Mutex<u32>,
    user_credits: Mutex<u32>,
    aborted: AtomicBool,
    cowing: AtomicBool,
}

/// Opaque token for one participant in a running transaction.
///
/// Cloning shares the same credit budget and flags.
#[derive(Debug, Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl Handle {
    fn new(tid: TxnId, buffer_credits: u32, user_credits: u32) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                tid,
                buffer_credits: Mutex::new(buffer_credits),
                user_credits: Mutex::new(user_credits),
                aborted: AtomicBool::new(false),
                cowing: AtomicBool::new(false),
            }),
        }
    }

    /// Transaction this handle currently belongs to.
    #[must_use]
    pub fn tid(&self) -> TxnId {
        self.inner.tid
    }

    /// Remaining metadata-buffer credits.
    #[must_use]
    pub fn buffer_credits(&self) -> u32 {
        *self.inner.buffer_credits.lock()
    }

    /// Remaining data-block credits.
    #[must_use]
    pub fn user_credits(&self) -> u32 {
        *self.inner.user_credits.lock()
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
    }

    /// Whether this handle is currently executing a COW operation.
    #[must_use]
    pub fn is_cowing(&self) -> bool {
        self.inner.cowing.load(Ordering::SeqCst)
    }

    /// Mark the handle as running a COW operation for the duration of
    /// `f`; hooks invoked recursively under the mark are suppressed.
    pub fn with_cowing<R>(&self, f: impl FnOnce() -> R) -> R {
        let prev = self.inner.cowing.swap(true, Ordering::SeqCst);
        let r = f();
        self.inner.cowing.store(prev, Ordering::SeqCst);
        r
    }

    fn take_buffer_credit(&self) -> Result<()> {
        let mut credits = self.inner.buffer_credits.lock();
        if *credits == 0 {
            warn!(event = "credits_exhausted", tid = self.inner.tid.0);
            return Err(RimeError::Aborted);
        }
        *credits -= 1;
        Ok(())
    }

    fn add_credits(&self, buffer: u32, user: u32) {
        *self.inner.buffer_credits.lock() += buffer;
        *self.inner.user_credits.lock() += user;
    }
}

// ── Journal ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct RunningTxn {
    tid: TxnId,
    /// Home block -> journaled payload (captured at dirty time and
    /// refreshed on every subsequent dirty).
    writes: BTreeMap<BlockNumber, Vec<u8>>,
    revokes: BTreeSet<BlockNumber>,
    /// Handles still attached.
    users: u32,
    /// Credits reserved against the region, to bound record growth.
    reserved: u32,
}

impl RunningTxn {
    fn open(tid: TxnId) -> Self {
        Self {
            tid,
            writes: BTreeMap::new(),
            revokes: BTreeSet::new(),
            users: 0,
            reserved: 0,
        }
    }
}

#[derive(Debug)]
struct JournalState {
    next_tid: u64,
    /// Next free region-relative index.
    head: u64,
    running: Option<RunningTxn>,
}

/// Write-ahead journal bound to a buffer cache and a device region.
pub struct Journal {
    cache: Arc<BufferCache>,
    region: JournalRegion,
    state: Mutex<JournalState>,
    hooks: Mutex<Arc<dyn AccessHooks>>,
    aborted: AtomicBool,
    /// Cap on buffer credits granted to one handle.
    max_trans_data: u32,
}

/// Default cap on per-handle buffer credits.
pub const MAX_TRANS_DATA: u32 = 64;

impl Journal {
    #[must_use]
    pub fn new(cache: Arc<BufferCache>, region: JournalRegion) -> Self {
        Self::with_cap(cache, region, MAX_TRANS_DATA)
    }

    /// Create a journal with a custom per-handle credit cap (fault
    /// injection and restart testing).
    #[must_use]
    pub fn with_cap(cache: Arc<BufferCache>, region: JournalRegion, cap: u32) -> Self {
        Self {
            cache,
            region,
            state: Mutex::new(JournalState {
                next_tid: 1,
                head: 0,
                running: None,
            }),
            hooks: Mutex::new(Arc::new(NoopHooks)),
            aborted: AtomicBool::new(false),
            max_trans_data: cap.max(2),
        }
    }

    /// Transaction id the next `start` on an idle journal would open.
    /// Lets tests measure how many transactions an operation consumed.
    #[must_use]
    pub fn next_tid(&self) -> TxnId {
        TxnId(self.state.lock().next_tid)
    }

    /// Replace the access hooks (registered once at mount by the snapshot
    /// engine).
    pub fn set_hooks(&self, hooks: Arc<dyn AccessHooks>) {
        *self.hooks.lock() = hooks;
    }

    fn hooks(&self) -> Arc<dyn AccessHooks> {
        Arc::clone(&self.hooks.lock())
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    /// Whether the journal has been aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Abort the journal: every subsequent operation fails with `Aborted`.
    pub fn abort(&self) {
        warn!(event = "journal_abort");
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn check_alive(&self, handle: Option<&Handle>) -> Result<()> {
        if self.is_aborted() || handle.is_some_and(Handle::is_aborted) {
            return Err(RimeError::Aborted);
        }
        Ok(())
    }

    /// Open a handle with `nblocks` buffer credits, joining the running
    /// transaction if one exists.
    pub fn start(&self, cx: &Cx, nblocks: u32) -> Result<Handle> {
        cx_checkpoint(cx)?;
        self.check_alive(None)?;
        let credits = nblocks.clamp(2, self.max_trans_data);
        let mut state = self.state.lock();
        if state.running.is_none() {
            let tid = TxnId(state.next_tid);
            state.next_tid += 1;
            trace!(event = "txn_open", tid = tid.0);
            state.running = Some(RunningTxn::open(tid));
        }
        let Some(txn) = state.running.as_mut() else {
            return Err(RimeError::Format("transaction vanished during start".to_owned()));
        };
        txn.users += 1;
        txn.reserved = txn.reserved.saturating_add(credits);
        Ok(Handle::new(txn.tid, credits, credits))
    }

    /// Request write access to a metadata buffer.
    ///
    /// Routes through the COW hook before the caller may modify the buffer.
    pub fn get_write_access(&self, cx: &Cx, handle: &Handle, buf: &BufferRef) -> Result<()> {
        self.check_alive(Some(handle))?;
        self.hooks().on_write_access(cx, handle, buf)
    }

    /// Request create access to a freshly allocated metadata buffer.
    pub fn get_create_access(&self, cx: &Cx, handle: &Handle, buf: &BufferRef) -> Result<()> {
        self.check_alive(Some(handle))?;
        self.hooks().on_create_access(cx, handle, buf)
    }

    /// Request write access to a block bitmap buffer.
    pub fn get_bitmap_access(
        &self,
        cx: &Cx,
        handle: &Handle,
        group: GroupNumber,
        buf: &BufferRef,
    ) -> Result<()> {
        self.check_alive(Some(handle))?;
        self.hooks().on_bitmap_access(cx, handle, group, buf)
    }

    /// Announce an in-place overwrite of data blocks; the snapshot engine
    /// may move the old blocks into the snapshot first.
    pub fn get_move_access(
        &self,
        cx: &Cx,
        handle: &Handle,
        ino: InodeNumber,
        block: BlockNumber,
        count: u64,
    ) -> Result<u64> {
        self.check_alive(Some(handle))?;
        self.hooks().on_move_access(cx, handle, ino, block, count)
    }

    /// Announce that blocks are about to be freed; the snapshot engine may
    /// inherit them directly.
    pub fn get_delete_access(
        &self,
        cx: &Cx,
        handle: &Handle,
        ino: InodeNumber,
        block: BlockNumber,
        count: u64,
    ) -> Result<DeleteAccess> {
        self.check_alive(Some(handle))?;
        self.hooks().on_delete_access(cx, handle, ino, block, count)
    }

    /// Record a modified metadata buffer in the running transaction.
    pub fn dirty_metadata(&self, cx: &Cx, handle: &Handle, buf: &BufferRef) -> Result<()> {
        cx_checkpoint(cx)?;
        self.check_alive(Some(handle))?;
        if handle.buffer_credits() == 0 {
            // One chance to grow in place; a refusal leaves the charge
            // below to fail and surface the exhausted budget.
            let _ = self.extend(cx, handle, (self.max_trans_data / 4).max(4))?;
        }
        let mut state = self.state.lock();
        let Some(txn) = state.running.as_mut() else {
            return Err(RimeError::Format("dirty_metadata outside transaction".to_owned()));
        };
        if txn.tid != handle.tid() {
            return Err(RimeError::Format(format!(
                "handle tid {} does not match running transaction {}",
                handle.tid(),
                txn.tid
            )));
        }
        handle.take_buffer_credit()?;
        txn.writes.insert(buf.block(), buf.data());
        buf.mark_dirty();
        trace!(
            event = "dirty_metadata",
            tid = txn.tid.0,
            block = buf.block().0
        );
        Ok(())
    }

    /// Forget a buffer: drop it from the running transaction, revoke any
    /// earlier journal record for it, and evict it from the cache.
    pub fn forget(&self, cx: &Cx, handle: &Handle, buf: &BufferRef) -> Result<()> {
        cx_checkpoint(cx)?;
        self.check_alive(Some(handle))?;
        let block = buf.block();
        {
            let mut state = self.state.lock();
            if let Some(txn) = state.running.as_mut() {
                txn.writes.remove(&block);
                txn.revokes.insert(block);
            }
        }
        self.cache.forget(block);
        trace!(event = "forget", block = block.0);
        Ok(())
    }

    /// Record a revoke for `block`: replay must ignore earlier records.
    pub fn revoke(&self, cx: &Cx, handle: &Handle, block: BlockNumber) -> Result<()> {
        cx_checkpoint(cx)?;
        self.check_alive(Some(handle))?;
        let mut state = self.state.lock();
        if let Some(txn) = state.running.as_mut() {
            txn.writes.remove(&block);
            txn.revokes.insert(block);
        }
        Ok(())
    }

    /// Try to add credits to the handle without committing. Returns true
    /// on success; false means the caller should restart instead.
    pub fn extend(&self, cx: &Cx, handle: &Handle, nblocks: u32) -> Result<bool> {
        cx_checkpoint(cx)?;
        self.check_alive(Some(handle))?;
        {
            let mut state = self.state.lock();
            let Some(txn) = state.running.as_mut() else {
                return Ok(false);
            };
            // Refuse once the transaction has grown past half the region
            // (or a few multiples of the handle cap, whichever is
            // smaller); the caller restarts and lets it commit.
            let room = (self.region.blocks / 2).min(u64::from(self.max_trans_data) * 4);
            if u64::from(txn.reserved) + u64::from(nblocks) > room {
                return Ok(false);
            }
            txn.reserved = txn.reserved.saturating_add(nblocks);
        }
        handle.add_credits(nblocks, 0);
        Ok(true)
    }

    /// Commit the running transaction and open a fresh one for `handle`
    /// with a new credit budget.
    pub fn restart(&self, cx: &Cx, handle: &Handle, nblocks: u32) -> Result<Handle> {
        cx_checkpoint(cx)?;
        self.check_alive(Some(handle))?;
        self.stop(cx, handle)?;
        self.start(cx, nblocks)
    }

    /// Detach the handle; the last detach commits the transaction.
    pub fn stop(&self, cx: &Cx, handle: &Handle) -> Result<()> {
        cx_checkpoint(cx)?;
        if self.is_aborted() {
            return Err(RimeError::Aborted);
        }
        let txn = {
            let mut state = self.state.lock();
            let Some(txn) = state.running.as_mut() else {
                return Ok(());
            };
            if txn.tid != handle.tid() {
                // The handle's transaction already committed (restart path).
                return Ok(());
            }
            txn.users = txn.users.saturating_sub(1);
            if txn.users > 0 {
                return Ok(());
            }
            state.running.take()
        };
        if let Some(txn) = txn {
            let result = self.commit(cx, &txn);
            if result.is_err() {
                self.abort();
                handle.abort();
            }
            result?;
        }
        Ok(())
    }

    /// Commit the running transaction (if any) and sync the device.
    pub fn force_commit(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)?;
        if self.is_aborted() {
            return Err(RimeError::Aborted);
        }
        let txn = {
            let mut state = self.state.lock();
            // Handles still attached will commit on stop.
            let busy = state.running.as_ref().is_some_and(|t| t.users > 0);
            if busy {
                None
            } else {
                state.running.take()
            }
        };
        if let Some(txn) = txn {
            self.commit(cx, &txn)?;
        }
        self.cache.device().sync(cx)
    }

    /// Write the transaction's records into the region, sync, then
    /// checkpoint home blocks.
    fn commit(&self, cx: &Cx, txn: &RunningTxn) -> Result<()> {
        if txn.writes.is_empty() && txn.revokes.is_empty() {
            trace!(event = "txn_commit_empty", tid = txn.tid.0);
            return Ok(());
        }
        let block_size = self.cache.block_size() as usize;
        let tags_per_descriptor = (block_size - HEADER_SIZE) / TAG_SIZE;
        let dev = Arc::clone(self.cache.device());

        let mut state = self.state.lock();

        // Records for this commit: descriptors+data, one revoke block, commit.
        let descriptors = txn.writes.len().div_ceil(tags_per_descriptor.max(1));
        let needed = (txn.writes.len() + descriptors + 2) as u64;
        if state.head + needed > self.region.blocks {
            // Checkpointed records are dead weight; recycle the region.
            debug!(event = "journal_wrap", head = state.head);
            state.head = 0;
            let zero = vec![0u8; block_size];
            for idx in 0..self.region.blocks {
                let block = self
                    .region
                    .resolve(idx)
                    .ok_or_else(|| RimeError::Format("journal region overflow".to_owned()))?;
                dev.write_block(cx, block, &zero)?;
            }
            if needed > self.region.blocks {
                return Err(RimeError::NoSpace);
            }
        }

        let mut head = state.head;
        let writes: Vec<(&BlockNumber, &Vec<u8>)> = txn.writes.iter().collect();
        for chunk in writes.chunks(tags_per_descriptor.max(1)) {
            let mut descriptor = vec![0u8; block_size];
            write_header(&mut descriptor, BLOCKTYPE_DESCRIPTOR, txn.tid.0);
            for (i, (home, _)) in chunk.iter().enumerate() {
                let off = HEADER_SIZE + i * TAG_SIZE;
                let home32 = home.to_u32().map_err(|e| RimeError::Format(e.to_string()))?;
                descriptor[off..off + 4].copy_from_slice(&home32.to_le_bytes());
                let flags = if i + 1 == chunk.len() { TAG_FLAG_LAST } else { 0 };
                descriptor[off + 4..off + 8].copy_from_slice(&flags.to_le_bytes());
            }
            let slot = self
                .region
                .resolve(head)
                .ok_or_else(|| RimeError::Format("journal region overflow".to_owned()))?;
            dev.write_block(cx, slot, &descriptor)?;
            head += 1;
            for (_, payload) in chunk {
                let slot = self
                    .region
                    .resolve(head)
                    .ok_or_else(|| RimeError::Format("journal region overflow".to_owned()))?;
                dev.write_block(cx, slot, payload)?;
                head += 1;
            }
        }

        if !txn.revokes.is_empty() {
            let mut revoke = vec![0u8; block_size];
            write_header(&mut revoke, BLOCKTYPE_REVOKE, txn.tid.0);
            let count = txn.revokes.len().min((block_size - HEADER_SIZE - 4) / 4);
            #[allow(clippy::cast_possible_truncation)]
            let count32 = count as u32;
            revoke[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&count32.to_le_bytes());
            for (i, block) in txn.revokes.iter().take(count).enumerate() {
                let off = HEADER_SIZE + 4 + i * 4;
                let b32 = block.to_u32().map_err(|e| RimeError::Format(e.to_string()))?;
                revoke[off..off + 4].copy_from_slice(&b32.to_le_bytes());
            }
            let slot = self
                .region
                .resolve(head)
                .ok_or_else(|| RimeError::Format("journal region overflow".to_owned()))?;
            dev.write_block(cx, slot, &revoke)?;
            head += 1;
        }

        let mut commit = vec![0u8; block_size];
        write_header(&mut commit, BLOCKTYPE_COMMIT, txn.tid.0);
        let slot = self
            .region
            .resolve(head)
            .ok_or_else(|| RimeError::Format("journal region overflow".to_owned()))?;
        dev.write_block(cx, slot, &commit)?;
        head += 1;
        state.head = head;
        drop(state);

        // The commit record is durable before any home write lands.
        dev.sync(cx)?;

        for (home, payload) in &txn.writes {
            dev.write_block(cx, *home, payload)?;
            if let Some(entry) = self.cache.peek(*home) {
                entry.mark_uptodate();
            }
        }
        debug!(
            event = "txn_commit",
            tid = txn.tid.0,
            writes = txn.writes.len(),
            revokes = txn.revokes.len()
        );
        Ok(())
    }
}

// ── Replay ──────────────────────────────────────────────────────────────────

/// Aggregate replay counters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplayStats {
    pub scanned_blocks: u64,
    pub descriptor_blocks: u64,
    pub commit_blocks: u64,
    pub revoke_blocks: u64,
    pub replayed_blocks: u64,
    pub skipped_revoked_blocks: u64,
    pub incomplete_transactions: u64,
}

#[derive(Debug, Default)]
struct PendingTxn {
    writes: Vec<(BlockNumber, Vec<u8>)>,
    revoked: BTreeSet<BlockNumber>,
}

/// Replay committed transactions from a journal region onto the device.
///
/// Descriptor blocks stage writes, revoke blocks mark targets
/// non-replayable for the same sequence, commit blocks apply staged
/// writes. Uncommitted transactions are ignored.
pub fn replay(
    cx: &Cx,
    dev: &dyn rime_block::BlockDevice,
    region: JournalRegion,
) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    let mut pending: BTreeMap<u32, PendingTxn> = BTreeMap::new();
    let block_size = dev.block_size() as usize;
    let tags_per_descriptor = (block_size - HEADER_SIZE) / TAG_SIZE;

    let mut idx = 0u64;
    while idx < region.blocks {
        let absolute = region
            .resolve(idx)
            .ok_or_else(|| RimeError::Format("journal region overflow".to_owned()))?;
        let raw = dev.read_block(cx, absolute)?;
        stats.scanned_blocks += 1;

        let Some(header) = parse_header(&raw) else {
            idx += 1;
            continue;
        };
        if header.magic != JOURNAL_MAGIC {
            idx += 1;
            continue;
        }

        match header.block_type {
            BLOCKTYPE_DESCRIPTOR => {
                stats.descriptor_blocks += 1;
                let mut tags = Vec::new();
                for i in 0..tags_per_descriptor {
                    let off = HEADER_SIZE + i * TAG_SIZE;
                    let home = read_le_u32(&raw, off)
                        .map_err(|e| RimeError::Format(e.to_string()))?;
                    let flags = read_le_u32(&raw, off + 4)
                        .map_err(|e| RimeError::Format(e.to_string()))?;
                    tags.push(BlockNumber(u64::from(home)));
                    if flags & TAG_FLAG_LAST != 0 {
                        break;
                    }
                }
                let txn = pending.entry(header.sequence).or_default();
                for (tag_idx, home) in tags.iter().enumerate() {
                    let data_index = idx + 1 + tag_idx as u64;
                    let data_block = region
                        .resolve(data_index)
                        .ok_or_else(|| RimeError::Format("journal region overflow".to_owned()))?;
                    let payload = dev.read_block(cx, data_block)?;
                    txn.writes.push((*home, payload));
                }
                idx += 1 + tags.len() as u64;
            }
            BLOCKTYPE_REVOKE => {
                stats.revoke_blocks += 1;
                let count = read_le_u32(&raw, HEADER_SIZE)
                    .map_err(|e| RimeError::Format(e.to_string()))?
                    as usize;
                let txn = pending.entry(header.sequence).or_default();
                for i in 0..count.min((block_size - HEADER_SIZE - 4) / 4) {
                    let off = HEADER_SIZE + 4 + i * 4;
                    let block = read_le_u32(&raw, off)
                        .map_err(|e| RimeError::Format(e.to_string()))?;
                    txn.revoked.insert(BlockNumber(u64::from(block)));
                }
                idx += 1;
            }
            BLOCKTYPE_COMMIT => {
                stats.commit_blocks += 1;
                if let Some(txn) = pending.remove(&header.sequence) {
                    for (home, payload) in txn.writes {
                        if txn.revoked.contains(&home) {
                            stats.skipped_revoked_blocks += 1;
                            continue;
                        }
                        dev.write_block(cx, home, &payload)?;
                        stats.replayed_blocks += 1;
                    }
                }
                idx += 1;
            }
            _ => {
                idx += 1;
            }
        }
    }

    stats.incomplete_transactions = pending.len() as u64;
    Ok(stats)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rime_block::{BlockDevice, MemBlockDevice};

    fn test_cx() -> Cx {
        Cx::for_testing()
    }

    fn setup() -> (Arc<MemBlockDevice>, Arc<BufferCache>, Journal) {
        let dev = Arc::new(MemBlockDevice::new(1024, 4096));
        let cache = Arc::new(BufferCache::new(
            Arc::<MemBlockDevice>::clone(&dev) as Arc<dyn rime_block::BlockDevice>
        ));
        let region = JournalRegion {
            start: BlockNumber(3900),
            blocks: 96,
        };
        let journal = Journal::new(Arc::clone(&cache), region);
        (dev, cache, journal)
    }

    #[test]
    fn start_grants_clamped_credits() {
        let cx = test_cx();
        let (_dev, _cache, journal) = setup();
        let handle = journal.start(&cx, 1000).unwrap();
        assert_eq!(handle.buffer_credits(), MAX_TRANS_DATA);
        let tiny = journal.start(&cx, 0).unwrap();
        assert_eq!(tiny.buffer_credits(), 2);
    }

    #[test]
    fn commit_checkpoints_home_blocks() {
        let cx = test_cx();
        let (dev, cache, journal) = setup();

        let handle = journal.start(&cx, 8).unwrap();
        let buf = cache.getblk(BlockNumber(100));
        journal.get_create_access(&cx, &handle, &buf).unwrap();
        buf.update(|d| d[0] = 0x5A);
        journal.dirty_metadata(&cx, &handle, &buf).unwrap();
        journal.stop(&cx, &handle).unwrap();

        assert_eq!(dev.raw_block(BlockNumber(100))[0], 0x5A);
    }

    #[test]
    fn every_dirty_call_charges_a_credit() {
        let cx = test_cx();
        let (_dev, cache, journal) = setup();
        let handle = journal.start(&cx, 8).unwrap();
        let before = handle.buffer_credits();
        let buf = cache.getblk(BlockNumber(200));
        journal.dirty_metadata(&cx, &handle, &buf).unwrap();
        journal.dirty_metadata(&cx, &handle, &buf).unwrap();
        assert_eq!(handle.buffer_credits(), before - 2);
        journal.stop(&cx, &handle).unwrap();
    }

    #[test]
    fn exhausted_credits_fail_dirty() {
        let cx = test_cx();
        let (_dev, cache, journal) = setup();
        let handle = journal.start(&cx, 0).unwrap(); // floor of 2

        // Auto-extension grows the budget a few times, but the region
        // bound eventually refuses and the charge fails.
        let mut failed = None;
        for i in 0..200u64 {
            let buf = cache.getblk(BlockNumber(300 + i));
            if let Err(err) = journal.dirty_metadata(&cx, &handle, &buf) {
                failed = Some((i, err));
                break;
            }
        }
        let (at, err) = failed.expect("budget must eventually be exhausted");
        assert!(matches!(err, RimeError::Aborted));
        assert!(at >= 2, "floor credits must be usable");
        assert!(at <= 96, "extension must stay within the region bound");
    }

    #[test]
    fn restart_opens_fresh_budget() {
        let cx = test_cx();
        let (dev, cache, journal) = setup();
        let handle = journal.start(&cx, 4).unwrap();
        let buf = cache.getblk(BlockNumber(400));
        buf.update(|d| d[0] = 1);
        journal.dirty_metadata(&cx, &handle, &buf).unwrap();

        let handle2 = journal.restart(&cx, &handle, 4).unwrap();
        // Restart committed the first transaction.
        assert_eq!(dev.raw_block(BlockNumber(400))[0], 1);
        assert_ne!(handle.tid(), handle2.tid());
        assert_eq!(handle2.buffer_credits(), 4);
        journal.stop(&cx, &handle2).unwrap();
    }

    #[test]
    fn forget_revokes_and_drops_from_commit() {
        let cx = test_cx();
        let (dev, cache, journal) = setup();
        let handle = journal.start(&cx, 8).unwrap();

        let keep = cache.getblk(BlockNumber(500));
        keep.update(|d| d[0] = 7);
        journal.dirty_metadata(&cx, &handle, &keep).unwrap();

        let dropped = cache.getblk(BlockNumber(501));
        dropped.update(|d| d[0] = 9);
        journal.dirty_metadata(&cx, &handle, &dropped).unwrap();
        journal.forget(&cx, &handle, &dropped).unwrap();

        journal.stop(&cx, &handle).unwrap();
        assert_eq!(dev.raw_block(BlockNumber(500))[0], 7);
        assert_eq!(dev.raw_block(BlockNumber(501))[0], 0);
    }

    #[test]
    fn abort_short_circuits_all_operations() {
        let cx = test_cx();
        let (_dev, cache, journal) = setup();
        let handle = journal.start(&cx, 8).unwrap();
        journal.abort();

        let buf = cache.getblk(BlockNumber(600));
        assert!(matches!(
            journal.get_write_access(&cx, &handle, &buf),
            Err(RimeError::Aborted)
        ));
        assert!(matches!(
            journal.dirty_metadata(&cx, &handle, &buf),
            Err(RimeError::Aborted)
        ));
        assert!(matches!(journal.start(&cx, 2), Err(RimeError::Aborted)));
    }

    #[test]
    fn cowing_mark_nests() {
        let cx = test_cx();
        let (_dev, _cache, journal) = setup();
        let handle = journal.start(&cx, 4).unwrap();
        assert!(!handle.is_cowing());
        handle.with_cowing(|| {
            assert!(handle.is_cowing());
            handle.with_cowing(|| assert!(handle.is_cowing()));
            assert!(handle.is_cowing());
        });
        assert!(!handle.is_cowing());
        journal.stop(&cx, &handle).unwrap();
    }

    #[test]
    fn replay_applies_committed_and_skips_revoked() {
        let cx = test_cx();
        let (dev, cache, journal) = setup();

        let handle = journal.start(&cx, 8).unwrap();
        let a = cache.getblk(BlockNumber(700));
        a.update(|d| d[0] = 1);
        journal.dirty_metadata(&cx, &handle, &a).unwrap();
        let b = cache.getblk(BlockNumber(701));
        b.update(|d| d[0] = 2);
        journal.dirty_metadata(&cx, &handle, &b).unwrap();
        journal.revoke(&cx, &handle, BlockNumber(701)).unwrap();
        journal.stop(&cx, &handle).unwrap();

        // Simulate losing the home writes: zero the home blocks, then
        // replay from the journal region.
        dev.write_block(&cx, BlockNumber(700), &vec![0u8; 1024])
            .unwrap();
        dev.write_block(&cx, BlockNumber(701), &vec![0u8; 1024])
            .unwrap();

        let region = JournalRegion {
            start: BlockNumber(3900),
            blocks: 96,
        };
        let stats = replay(&cx, dev.as_ref(), region).unwrap();
        assert_eq!(stats.commit_blocks, 1);
        assert_eq!(stats.replayed_blocks, 1);
        assert_eq!(dev.raw_block(BlockNumber(700))[0], 1);
        // 701 was revoked before commit, so it never had a record.
        assert_eq!(dev.raw_block(BlockNumber(701))[0], 0);
    }

    #[test]
    fn replay_ignores_uncommitted_transaction() {
        let cx = test_cx();
        let dev = MemBlockDevice::new(1024, 256);
        let region = JournalRegion {
            start: BlockNumber(0),
            blocks: 16,
        };
        // Hand-write a descriptor + data with no commit record.
        let mut descriptor = vec![0u8; 1024];
        write_header(&mut descriptor, BLOCKTYPE_DESCRIPTOR, 9);
        descriptor[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&200u32.to_le_bytes());
        descriptor[HEADER_SIZE + 4..HEADER_SIZE + 8].copy_from_slice(&TAG_FLAG_LAST.to_le_bytes());
        dev.write_block(&cx, BlockNumber(0), &descriptor).unwrap();
        dev.write_block(&cx, BlockNumber(1), &[0xEEu8; 1024].to_vec())
            .unwrap();

        let stats = replay(&cx, &dev, region).unwrap();
        assert_eq!(stats.incomplete_transactions, 1);
        assert_eq!(stats.replayed_blocks, 0);
        assert_eq!(dev.raw_block(BlockNumber(200))[0], 0);
    }
}
