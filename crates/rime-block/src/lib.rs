#![forbid(unsafe_code)]
//! Block devices and the shared buffer cache.
//!
//! Provides the `ByteDevice`/`BlockDevice` traits, a file-backed device
//! using pread/pwrite semantics, and the buffer cache the mapping and
//! snapshot engines share. Cache entries carry an explicit state machine
//! (`BufferState`) instead of parallel flag bits; the `PendingCow` state
//! is the synchronization point between snapshot writers and readers.

use asupersync::Cx;
use parking_lot::{Condvar, Mutex};
use rime_error::{Result, RimeError};
use rime_types::{BlockNumber, ByteOffset, TxnId};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| RimeError::Cancelled)
}

// ── Devices ─────────────────────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, cx: &Cx, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, cx: &Cx, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self, cx: &Cx) -> Result<()>;
}

/// File-backed byte device.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, cx: &Cx, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let end = offset
            .checked_add(u64::try_from(buf.len()).map_err(|_| RimeError::NoMem)?)
            .ok_or_else(|| RimeError::Format("read range overflows u64".to_owned()))?;
        if end.0 > self.len {
            return Err(RimeError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.read_exact_at(buf, offset.0)?;
        cx_checkpoint(cx)?;
        Ok(())
    }

    fn write_all_at(&self, cx: &Cx, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        if !self.writable {
            return Err(RimeError::Permission);
        }
        let end = offset
            .checked_add(u64::try_from(buf.len()).map_err(|_| RimeError::NoMem)?)
            .ok_or_else(|| RimeError::Format("write range overflows u64".to_owned()))?;
        if end.0 > self.len {
            return Err(RimeError::Format(format!(
                "write out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.write_all_at(buf, offset.0)?;
        cx_checkpoint(cx)?;
        Ok(())
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<Vec<u8>>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, cx: &Cx, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self, cx: &Cx) -> Result<()>;
}

/// Adapter exposing a [`ByteDevice`] as a [`BlockDevice`].
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(RimeError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        let len = inner.len_bytes();
        if len % u64::from(block_size) != 0 {
            return Err(RimeError::Format(format!(
                "image length {len} is not a multiple of block_size {block_size}"
            )));
        }
        let block_count = len / u64::from(block_size);
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<Vec<u8>> {
        if block.0 >= self.block_count {
            return Err(RimeError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        let offset = block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| RimeError::Format("block offset overflow".to_owned()))?;
        let mut buf = vec![0u8; self.block_size as usize];
        self.inner.read_exact_at(cx, ByteOffset(offset), &mut buf)?;
        Ok(buf)
    }

    fn write_block(&self, cx: &Cx, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(RimeError::Format(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        if block.0 >= self.block_count {
            return Err(RimeError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        let offset = block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| RimeError::Format("block offset overflow".to_owned()))?;
        self.inner.write_all_at(cx, ByteOffset(offset), data)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        self.inner.sync(cx)
    }
}

/// In-memory block device used by tests and the harness fixtures.
///
/// Unwritten blocks read as zeroes.
#[derive(Debug)]
pub struct MemBlockDevice {
    block_size: u32,
    block_count: u64,
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot the raw contents of a block (zeroes if never written).
    #[must_use]
    pub fn raw_block(&self, block: BlockNumber) -> Vec<u8> {
        self.blocks
            .lock()
            .get(&block.0)
            .cloned()
            .unwrap_or_else(|| vec![0u8; self.block_size as usize])
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<Vec<u8>> {
        cx_checkpoint(cx)?;
        if block.0 >= self.block_count {
            return Err(RimeError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        Ok(self.raw_block(block))
    }

    fn write_block(&self, cx: &Cx, block: BlockNumber, data: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        if data.len() != self.block_size as usize {
            return Err(RimeError::Format(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        if block.0 >= self.block_count {
            return Err(RimeError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        self.blocks.lock().insert(block.0, data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self, _cx: &Cx) -> Result<()> {
        Ok(())
    }
}

// ── Buffer state machine ────────────────────────────────────────────────────

/// Observable state of a cached buffer.
///
/// Transitions:
/// ```text
/// (insert on read)            -> Uptodate
/// (insert via getblk)         -> New
/// New -> PendingCow           snapshot block reserved, copy in flight
/// PendingCow -> Dirty         copy completed and dirtied
/// PendingCow -> New           copy cancelled
/// {New, Uptodate} -> Dirty    buffer modified
/// Dirty -> Uptodate           flushed to device
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Contents match the device (or are newer and already journaled).
    Uptodate,
    /// Modified in memory, not yet flushed.
    Dirty,
    /// Freshly created; contents never read from the device.
    New,
    /// Snapshot copy in flight; readers must wait for completion.
    PendingCow,
}

#[derive(Debug)]
struct EntryInner {
    state: BufferState,
    data: Vec<u8>,
    /// Transaction in which this buffer was last COWed (advisory cache).
    cow_tid: Option<TxnId>,
}

/// One cached block: data plus its state machine.
#[derive(Debug)]
pub struct BufferEntry {
    block: BlockNumber,
    inner: Mutex<EntryInner>,
    cond: Condvar,
}

/// Shared handle to a cache entry.
pub type BufferRef = Arc<BufferEntry>;

/// How long a pending-COW waiter sleeps between checks.
const PENDING_COW_WAIT: Duration = Duration::from_millis(10);
/// Number of waits after which a warning is logged (waiting continues).
const PENDING_COW_WARN_AFTER: u32 = 100;

impl BufferEntry {
    fn new(block: BlockNumber, state: BufferState, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            block,
            inner: Mutex::new(EntryInner {
                state,
                data,
                cow_tid: None,
            }),
            cond: Condvar::new(),
        })
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    #[must_use]
    pub fn state(&self) -> BufferState {
        self.inner.lock().state
    }

    /// Copy out the buffer contents.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }

    /// Run `f` over the buffer contents without copying.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner.lock().data)
    }

    /// Mutate the buffer contents and mark it dirty.
    pub fn update<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.lock();
        let r = f(&mut inner.data);
        inner.state = BufferState::Dirty;
        r
    }

    /// Replace the buffer contents and mark it dirty.
    pub fn fill(&self, data: &[u8]) {
        let mut inner = self.inner.lock();
        inner.data.clear();
        inner.data.extend_from_slice(data);
        inner.state = BufferState::Dirty;
    }

    /// Zero the buffer contents without changing its state.
    pub fn zero(&self) {
        let mut inner = self.inner.lock();
        inner.data.fill(0);
    }

    /// Replace the contents without changing the entry state.
    ///
    /// Used for pending-COW copies, whose `PendingCow -> Dirty`
    /// transition happens separately via [`Self::end_pending_cow`].
    pub fn copy_in(&self, data: &[u8]) {
        let mut inner = self.inner.lock();
        inner.data.clear();
        inner.data.extend_from_slice(data);
    }

    pub fn mark_dirty(&self) {
        self.inner.lock().state = BufferState::Dirty;
    }

    pub fn mark_uptodate(&self) {
        self.inner.lock().state = BufferState::Uptodate;
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().state == BufferState::Dirty
    }

    #[must_use]
    pub fn is_new(&self) -> bool {
        matches!(
            self.inner.lock().state,
            BufferState::New | BufferState::PendingCow
        )
    }

    // ── Pending COW ─────────────────────────────────────────────────────

    /// Mark the start of a COW into this buffer. The holder keeps a pinned
    /// reference until [`Self::end_pending_cow`] or
    /// [`Self::cancel_pending_cow`].
    pub fn start_pending_cow(&self) {
        let mut inner = self.inner.lock();
        inner.state = BufferState::PendingCow;
        trace!(event = "pending_cow_start", block = self.block.0);
    }

    /// Complete the COW: buffer holds the copied pre-image and is dirty.
    pub fn end_pending_cow(&self) {
        let mut inner = self.inner.lock();
        inner.state = BufferState::Dirty;
        trace!(event = "pending_cow_end", block = self.block.0);
        drop(inner);
        self.cond.notify_all();
    }

    /// Abandon the COW: the buffer reverts to a bare new block.
    pub fn cancel_pending_cow(&self) {
        let mut inner = self.inner.lock();
        inner.state = BufferState::New;
        trace!(event = "pending_cow_cancel", block = self.block.0);
        drop(inner);
        self.cond.notify_all();
    }

    #[must_use]
    pub fn is_pending_cow(&self) -> bool {
        self.inner.lock().state == BufferState::PendingCow
    }

    /// Block until any in-flight COW on this buffer completes.
    ///
    /// There is no timeout: a pending COW is bounded by device I/O. Past a
    /// threshold a warning is logged and waiting continues.
    pub fn wait_pending_cow(&self, cx: &Cx) -> Result<()> {
        let mut waits = 0u32;
        let mut inner = self.inner.lock();
        while inner.state == BufferState::PendingCow {
            self.cond.wait_for(&mut inner, PENDING_COW_WAIT);
            waits += 1;
            if waits == PENDING_COW_WARN_AFTER {
                warn!(
                    event = "pending_cow_slow",
                    block = self.block.0,
                    waits,
                    "pending COW outstanding past threshold; still waiting"
                );
            }
            drop(inner);
            cx_checkpoint(cx)?;
            inner = self.inner.lock();
        }
        Ok(())
    }

    // ── Transaction-local COW tag ───────────────────────────────────────

    #[must_use]
    pub fn cow_tid(&self) -> Option<TxnId> {
        self.inner.lock().cow_tid
    }

    pub fn set_cow_tid(&self, tid: TxnId) {
        self.inner.lock().cow_tid = Some(tid);
    }
}

// ── Buffer cache ────────────────────────────────────────────────────────────

/// Shared block buffer cache over a [`BlockDevice`].
///
/// Entries persist until explicitly forgotten; dirty entries are written
/// back by [`BufferCache::flush`]. The journal and the snapshot engine
/// address buffers exclusively through this cache so that state
/// transitions (dirty, pending COW, COW tags) are globally visible.
pub struct BufferCache {
    dev: Arc<dyn BlockDevice>,
    entries: Mutex<HashMap<BlockNumber, BufferRef>>,
}

impl BufferCache {
    #[must_use]
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.dev.block_size()
    }

    /// Read a block through the cache.
    pub fn read(&self, cx: &Cx, block: BlockNumber) -> Result<BufferRef> {
        if let Some(entry) = self.entries.lock().get(&block) {
            return Ok(Arc::clone(entry));
        }
        // Read outside the map lock; racing readers insert-or-reuse below.
        let data = self.dev.read_block(cx, block)?;
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(block)
            .or_insert_with(|| BufferEntry::new(block, BufferState::Uptodate, data));
        Ok(Arc::clone(entry))
    }

    /// Get or create an entry without reading the device.
    ///
    /// A created entry starts zero-filled in the `New` state.
    pub fn getblk(&self, block: BlockNumber) -> BufferRef {
        let mut entries = self.entries.lock();
        let entry = entries.entry(block).or_insert_with(|| {
            BufferEntry::new(
                block,
                BufferState::New,
                vec![0u8; self.dev.block_size() as usize],
            )
        });
        Arc::clone(entry)
    }

    /// Look up an entry without creating or reading.
    #[must_use]
    pub fn peek(&self, block: BlockNumber) -> Option<BufferRef> {
        self.entries.lock().get(&block).map(Arc::clone)
    }

    /// Drop a cache entry (journal revoke / branch rollback path).
    pub fn forget(&self, block: BlockNumber) {
        self.entries.lock().remove(&block);
        trace!(event = "cache_forget", block = block.0);
    }

    /// Write a buffer synchronously to the device, bypassing the journal.
    ///
    /// Used only for indirect blocks that map COW bitmap copies, whose
    /// journal credits are deliberately not reserved.
    pub fn sync_write(&self, cx: &Cx, entry: &BufferRef) -> Result<()> {
        let data = entry.data();
        self.dev.write_block(cx, entry.block(), &data)?;
        entry.mark_uptodate();
        Ok(())
    }

    /// Write all dirty buffers back to the device.
    pub fn flush(&self, cx: &Cx) -> Result<()> {
        let dirty: Vec<BufferRef> = {
            let entries = self.entries.lock();
            entries
                .values()
                .filter(|e| e.is_dirty())
                .map(Arc::clone)
                .collect()
        };
        for entry in dirty {
            let data = entry.data();
            self.dev.write_block(cx, entry.block(), &data)?;
            entry.mark_uptodate();
        }
        self.dev.sync(cx)
    }

    /// Number of resident entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
