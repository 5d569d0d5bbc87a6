#![forbid(unsafe_code)]
//! Inode management.
//!
//! In-memory inodes with the extended slot array and the per-inode
//! truncate mutex, inode-table I/O through the journal, a shared inode
//! cache (one in-memory inode per inumber so every task contends on the
//! same locks), and the on-disk orphan list that makes truncate
//! restartable after a crash.

use asupersync::Cx;
use parking_lot::{Mutex, MutexGuard};
use rime_alloc::Allocator;
use rime_block::BufferCache;
use rime_error::{Result, RimeError};
use rime_journal::{Handle, Journal};
use rime_ondisk::{inode_group, inode_location, RawInode};
use rime_types::{
    BlockNumber, BlockSize, GroupNumber, InodeNumber, SNAPFILE_FL, SNAP_N_BLOCKS, S_IFLNK, S_IFMT,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

// ── In-memory inode ─────────────────────────────────────────────────────────

/// Mutable inode fields, guarded by the inode's state lock.
#[derive(Debug, Clone)]
pub struct InodeState {
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
    /// Block count in filesystem blocks (charged quota).
    pub blocks: u64,
    pub next_snapshot: u32,
    /// Logical slot array; see `rime_ondisk::slot_disk_index` for the
    /// on-disk rotation of snapshot inodes.
    pub slots: [u32; SNAP_N_BLOCKS],
    /// Sequential-allocation memory: logical block of the last splice.
    pub last_alloc_logical: Option<u64>,
    /// Physical block of the last splice.
    pub last_alloc_physical: u64,
}

impl InodeState {
    #[must_use]
    pub fn from_raw(raw: &RawInode, block_size: BlockSize) -> Self {
        Self {
            mode: raw.mode,
            links_count: raw.links_count,
            size: raw.size,
            atime: raw.atime,
            ctime: raw.ctime,
            mtime: raw.mtime,
            dtime: raw.dtime,
            uid: raw.uid,
            gid: raw.gid,
            flags: raw.flags,
            generation: raw.generation,
            blocks: raw.block_count(block_size),
            next_snapshot: raw.next_snapshot,
            slots: raw.slots,
            last_alloc_logical: None,
            last_alloc_physical: 0,
        }
    }

    #[must_use]
    pub fn to_raw(&self, block_size: BlockSize) -> RawInode {
        let mut raw = RawInode::zeroed();
        raw.mode = self.mode;
        raw.links_count = self.links_count;
        raw.size = self.size;
        raw.atime = self.atime;
        raw.ctime = self.ctime;
        raw.mtime = self.mtime;
        raw.dtime = self.dtime;
        raw.uid = self.uid;
        raw.gid = self.gid;
        raw.flags = self.flags;
        raw.generation = self.generation;
        raw.next_snapshot = self.next_snapshot;
        raw.slots = self.slots;
        raw.set_block_count(self.blocks, block_size);
        raw
    }

    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.flags & SNAPFILE_FL != 0
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == rime_types::S_IFREG
    }

    /// A symlink whose target text lives in the slot array has no block
    /// tree to walk or truncate.
    #[must_use]
    pub fn is_fast_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK && self.blocks == 0
    }
}

/// One in-memory inode. Obtained through [`InodeCache`] so that all tasks
/// touching an inumber share the same lock instances.
#[derive(Debug)]
pub struct Inode {
    ino: InodeNumber,
    /// Serializes branch-tree mutations (alloc, splice, truncate).
    /// Released across journal restarts during long truncates.
    truncate_mutex: Mutex<()>,
    state: Mutex<InodeState>,
}

impl Inode {
    #[must_use]
    pub fn new(ino: InodeNumber, state: InodeState) -> Arc<Self> {
        Arc::new(Self {
            ino,
            truncate_mutex: Mutex::new(()),
            state: Mutex::new(state),
        })
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    /// Take the truncate mutex for the duration of a tree mutation.
    pub fn lock_tree(&self) -> MutexGuard<'_, ()> {
        self.truncate_mutex.lock()
    }

    /// Run `f` under the state lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&InodeState) -> R) -> R {
        f(&self.state.lock())
    }

    /// Run `f` under the state lock with mutable access.
    pub fn update_state<R>(&self, f: impl FnOnce(&mut InodeState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Read one slot of the slot array.
    #[must_use]
    pub fn slot(&self, index: usize) -> u32 {
        self.state.lock().slots.get(index).copied().unwrap_or(0)
    }

    /// Write one slot of the slot array.
    pub fn set_slot(&self, index: usize, value: u32) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(index) {
            *slot = value;
        }
    }

    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.state.lock().is_snapshot()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }
}

// ── Inode table I/O ─────────────────────────────────────────────────────────

/// Read an inode from the inode table.
pub fn read_inode(
    cx: &Cx,
    cache: &BufferCache,
    alloc: &Allocator,
    ino: InodeNumber,
) -> Result<InodeState> {
    let geo = alloc.geometry();
    let group = inode_group(ino, geo.inodes_per_group);
    let desc = alloc.group_desc(group)?;
    let (block, offset) = inode_location(
        ino,
        geo.inodes_per_group,
        geo.inode_size,
        geo.block_size,
        desc.inode_table_block,
    );
    let buf = cache.read(cx, block)?;
    let inode_size = usize::from(geo.inode_size);
    let raw = buf.with_data(|data| {
        if offset + inode_size > data.len() {
            return Err(RimeError::Inconsistency {
                block: block.0,
                detail: format!("inode {ino} extends beyond table block"),
            });
        }
        RawInode::parse(&data[offset..offset + inode_size])
    })?;
    Ok(InodeState::from_raw(&raw, geo.block_size))
}

/// Serialize an inode into its table block under the journal.
pub fn write_inode(
    cx: &Cx,
    journal: &Journal,
    handle: &Handle,
    alloc: &Allocator,
    inode: &Inode,
) -> Result<()> {
    let geo = alloc.geometry();
    let ino = inode.ino();
    let group = inode_group(ino, geo.inodes_per_group);
    let desc = alloc.group_desc(group)?;
    let (block, offset) = inode_location(
        ino,
        geo.inodes_per_group,
        geo.inode_size,
        geo.block_size,
        desc.inode_table_block,
    );
    let inode_size = usize::from(geo.inode_size);
    let raw = inode.with_state(|state| state.to_raw(geo.block_size));
    let record = raw.serialize(inode_size)?;

    let buf = journal.cache().read(cx, block)?;
    journal.get_write_access(cx, handle, &buf)?;
    buf.update(|data| {
        data[offset..offset + inode_size].copy_from_slice(&record);
    });
    journal.dirty_metadata(cx, handle, &buf)?;
    trace!(event = "inode_dirty", ino = ino.0, block = block.0);
    Ok(())
}

/// Create a fresh inode on disk and return its in-memory form.
pub fn create_inode(
    cx: &Cx,
    journal: &Journal,
    handle: &Handle,
    alloc: &Allocator,
    mode: u16,
    uid: u32,
    gid: u32,
    parent_group: GroupNumber,
    now: u32,
) -> Result<Arc<Inode>> {
    let is_dir = mode & S_IFMT == rime_types::S_IFDIR;
    let got = alloc.alloc_inode(cx, journal, handle, parent_group, is_dir)?;

    let state = InodeState {
        mode,
        links_count: if is_dir { 2 } else { 1 },
        size: 0,
        atime: now,
        ctime: now,
        mtime: now,
        dtime: 0,
        uid,
        gid,
        flags: 0,
        generation: 0,
        blocks: 0,
        next_snapshot: 0,
        slots: [0; SNAP_N_BLOCKS],
        last_alloc_logical: None,
        last_alloc_physical: 0,
    };
    let inode = Inode::new(got.ino, state);
    write_inode(cx, journal, handle, alloc, &inode)?;
    debug!(event = "inode_created", ino = got.ino.0, group = got.group.0);
    Ok(inode)
}

// ── Inode cache ─────────────────────────────────────────────────────────────

/// Shared inode cache: one `Arc<Inode>` per inumber per mount.
#[derive(Default)]
pub struct InodeCache {
    map: Mutex<HashMap<u64, Arc<Inode>>>,
}

impl InodeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an inode, reading it from the table on first access.
    pub fn get(
        &self,
        cx: &Cx,
        cache: &BufferCache,
        alloc: &Allocator,
        ino: InodeNumber,
    ) -> Result<Arc<Inode>> {
        if let Some(inode) = self.map.lock().get(&ino.0) {
            return Ok(Arc::clone(inode));
        }
        let state = read_inode(cx, cache, alloc, ino)?;
        let mut map = self.map.lock();
        let entry = map
            .entry(ino.0)
            .or_insert_with(|| Inode::new(ino, state));
        Ok(Arc::clone(entry))
    }

    /// Register a freshly created inode.
    pub fn insert(&self, inode: Arc<Inode>) {
        self.map.lock().insert(inode.ino().0, inode);
    }

    /// Drop an inode from the cache (after final delete).
    pub fn evict(&self, ino: InodeNumber) {
        self.map.lock().remove(&ino.0);
    }
}

// ── Orphan list ─────────────────────────────────────────────────────────────

/// The on-disk orphan list: a singly-linked list of inodes whose
/// truncate/delete is in flight, rooted in the superblock and chained
/// through the inodes' `dtime` field (the field is dead while the inode
/// is still linked).
///
/// Truncates of different inodes serialize only per inode, so they
/// finish in any order; removal must splice an inode out of any list
/// position, and linking must tolerate an inode that is already on the
/// chain. The head mutex covers every chain walk and mutation.
pub struct OrphanList {
    sb_block: BlockNumber,
    head: Mutex<u32>,
}

/// Byte offset of the orphan head inside the superblock block image.
const SB_ORPHAN_HEAD_OFFSET: usize = 0x2C;

/// Walk bound; a longer chain means the links form a cycle.
const ORPHAN_CHAIN_MAX: u32 = 65_536;

impl OrphanList {
    #[must_use]
    pub fn new(sb_block: BlockNumber, head: u32) -> Self {
        Self {
            sb_block,
            head: Mutex::new(head),
        }
    }

    /// Current head inumber (0 = empty).
    #[must_use]
    pub fn head(&self) -> u32 {
        *self.head.lock()
    }

    /// Whether `ino` is the current head.
    #[must_use]
    pub fn head_is(&self, ino: InodeNumber) -> bool {
        u64::from(self.head()) == ino.0
    }

    fn node(
        &self,
        cx: &Cx,
        journal: &Journal,
        alloc: &Allocator,
        inodes: &InodeCache,
        ino: u32,
    ) -> Result<Arc<Inode>> {
        inodes.get(cx, journal.cache(), alloc, InodeNumber(u64::from(ino)))
    }

    fn cycle_error(&self) -> RimeError {
        RimeError::Inconsistency {
            block: self.sb_block.0,
            detail: "orphan chain does not terminate".into(),
        }
    }

    /// Whether `ino32` appears anywhere on the chain starting at `head`.
    fn chain_contains(
        &self,
        cx: &Cx,
        journal: &Journal,
        alloc: &Allocator,
        inodes: &InodeCache,
        head: u32,
        ino32: u32,
    ) -> Result<bool> {
        let mut cur = head;
        let mut hops = 0u32;
        while cur != 0 {
            if cur == ino32 {
                return Ok(true);
            }
            let node = self.node(cx, journal, alloc, inodes, cur)?;
            cur = node.with_state(|state| state.dtime);
            hops += 1;
            if hops > ORPHAN_CHAIN_MAX {
                return Err(self.cycle_error());
            }
        }
        Ok(false)
    }

    /// Link `inode` at the head of the orphan list.
    ///
    /// An inode that is already on the chain (a truncate re-entered
    /// before an earlier one finished) is left where it is; relinking
    /// it would dangle its predecessor's pointer.
    pub fn add(
        &self,
        cx: &Cx,
        journal: &Journal,
        handle: &Handle,
        alloc: &Allocator,
        inodes: &InodeCache,
        inode: &Inode,
    ) -> Result<()> {
        let ino32 = inode.ino().to_u32().map_err(|e| RimeError::Format(e.to_string()))?;
        let mut head = self.head.lock();
        if self.chain_contains(cx, journal, alloc, inodes, *head, ino32)? {
            return Ok(());
        }
        inode.update_state(|state| state.dtime = *head);
        write_inode(cx, journal, handle, alloc, inode)?;
        self.write_head(cx, journal, handle, ino32)?;
        *head = ino32;
        debug!(event = "orphan_add", ino = ino32);
        Ok(())
    }

    /// Unlink `inode` from the orphan list, wherever it sits.
    ///
    /// Removing an inode that is not on the list is a no-op: replay and
    /// concurrent truncates make that a normal occurrence, not an error.
    pub fn remove(
        &self,
        cx: &Cx,
        journal: &Journal,
        handle: &Handle,
        alloc: &Allocator,
        inodes: &InodeCache,
        inode: &Inode,
    ) -> Result<()> {
        let ino32 = inode.ino().to_u32().map_err(|e| RimeError::Format(e.to_string()))?;
        let mut head = self.head.lock();

        if *head == ino32 {
            let next = inode.with_state(|state| state.dtime);
            inode.update_state(|state| state.dtime = 0);
            write_inode(cx, journal, handle, alloc, inode)?;
            self.write_head(cx, journal, handle, next)?;
            *head = next;
            debug!(event = "orphan_remove", ino = ino32, next);
            return Ok(());
        }

        // Splice out of the middle: find the predecessor and repoint it
        // past the target.
        let mut prev_ino = *head;
        let mut hops = 0u32;
        while prev_ino != 0 {
            let prev = self.node(cx, journal, alloc, inodes, prev_ino)?;
            let next = prev.with_state(|state| state.dtime);
            if next == ino32 {
                let after = inode.with_state(|state| state.dtime);
                prev.update_state(|state| state.dtime = after);
                write_inode(cx, journal, handle, alloc, &prev)?;
                inode.update_state(|state| state.dtime = 0);
                write_inode(cx, journal, handle, alloc, inode)?;
                debug!(event = "orphan_remove", ino = ino32, prev = prev_ino, next = after);
                return Ok(());
            }
            prev_ino = next;
            hops += 1;
            if hops > ORPHAN_CHAIN_MAX {
                return Err(self.cycle_error());
            }
        }
        Ok(())
    }

    fn write_head(&self, cx: &Cx, journal: &Journal, handle: &Handle, head: u32) -> Result<()> {
        let buf = journal.cache().read(cx, self.sb_block)?;
        journal.get_write_access(cx, handle, &buf)?;
        buf.update(|data| {
            data[SB_ORPHAN_HEAD_OFFSET..SB_ORPHAN_HEAD_OFFSET + 4]
                .copy_from_slice(&head.to_le_bytes());
        });
        journal.dirty_metadata(cx, handle, &buf)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rime_alloc::{FsGeometry, GroupStats};
    use rime_block::MemBlockDevice;
    use rime_journal::JournalRegion;
    use rime_types::S_IFREG;

    fn test_cx() -> Cx {
        Cx::for_testing()
    }

    fn setup() -> (Arc<BufferCache>, Journal, Allocator) {
        let dev = Arc::new(MemBlockDevice::new(1024, 8192));
        let cache = Arc::new(BufferCache::new(dev as Arc<dyn rime_block::BlockDevice>));
        let journal = Journal::new(
            Arc::clone(&cache),
            JournalRegion {
                start: BlockNumber(8000),
                blocks: 128,
            },
        );
        let geo = FsGeometry {
            blocks_per_group: 1024,
            inodes_per_group: 256,
            block_size: BlockSize::new(1024).unwrap(),
            total_blocks: 4096,
            first_data_block: 1,
            group_count: 4,
            inode_size: 256,
        };
        let groups = (0..geo.group_count)
            .map(|g| GroupStats {
                group: GroupNumber(g),
                free_blocks: geo.blocks_in_group(GroupNumber(g)),
                free_inodes: geo.inodes_per_group,
                used_dirs: 0,
                block_bitmap_block: BlockNumber(u64::from(g) * 100 + 4300),
                inode_bitmap_block: BlockNumber(u64::from(g) * 100 + 4301),
                inode_table_block: BlockNumber(u64::from(g) * 100 + 4310),
                exclude_bitmap_block: BlockNumber(0),
            })
            .collect();
        let alloc = Allocator::new(geo, groups);
        (cache, journal, alloc)
    }

    #[test]
    fn create_write_read_round_trip() {
        let cx = test_cx();
        let (cache, journal, alloc) = setup();
        let handle = journal.start(&cx, 16).unwrap();

        let inode = create_inode(
            &cx,
            &journal,
            &handle,
            &alloc,
            S_IFREG | 0o644,
            1000,
            1000,
            GroupNumber(0),
            1_700_000_000,
        )
        .unwrap();
        inode.update_state(|state| {
            state.size = 2048;
            state.blocks = 2;
            state.slots[0] = 333;
        });
        write_inode(&cx, &journal, &handle, &alloc, &inode).unwrap();
        journal.stop(&cx, &handle).unwrap();

        let state = read_inode(&cx, &cache, &alloc, inode.ino()).unwrap();
        assert_eq!(state.mode, S_IFREG | 0o644);
        assert_eq!(state.size, 2048);
        assert_eq!(state.blocks, 2);
        assert_eq!(state.slots[0], 333);
    }

    #[test]
    fn inode_cache_shares_instances() {
        let cx = test_cx();
        let (cache, journal, alloc) = setup();
        let handle = journal.start(&cx, 16).unwrap();
        let inode = create_inode(
            &cx,
            &journal,
            &handle,
            &alloc,
            S_IFREG | 0o644,
            0,
            0,
            GroupNumber(0),
            0,
        )
        .unwrap();
        journal.stop(&cx, &handle).unwrap();

        let icache = InodeCache::new();
        icache.insert(Arc::clone(&inode));
        let a = icache.get(&cx, &cache, &alloc, inode.ino()).unwrap();
        let b = icache.get(&cx, &cache, &alloc, inode.ino()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &inode));
    }

    #[test]
    fn fast_symlink_detection() {
        let mut state = InodeState {
            mode: S_IFLNK | 0o777,
            links_count: 1,
            size: 10,
            atime: 0,
            ctime: 0,
            mtime: 0,
            dtime: 0,
            uid: 0,
            gid: 0,
            flags: 0,
            generation: 0,
            blocks: 0,
            next_snapshot: 0,
            slots: [0; SNAP_N_BLOCKS],
            last_alloc_logical: None,
            last_alloc_physical: 0,
        };
        assert!(state.is_fast_symlink());
        state.blocks = 1;
        assert!(!state.is_fast_symlink());
    }

    /// Collect the orphan chain by walking the in-memory inodes' `dtime`
    /// links from the current head.
    fn orphan_chain(
        cx: &Cx,
        cache: &BufferCache,
        alloc: &Allocator,
        icache: &InodeCache,
        orphans: &OrphanList,
    ) -> Vec<u32> {
        let mut chain = Vec::new();
        let mut cur = orphans.head();
        while cur != 0 {
            chain.push(cur);
            let node = icache
                .get(cx, cache, alloc, InodeNumber(u64::from(cur)))
                .unwrap();
            cur = node.with_state(|s| s.dtime);
        }
        chain
    }

    #[test]
    fn orphan_list_add_remove() {
        let cx = test_cx();
        let (cache, journal, alloc) = setup();
        let handle = journal.start(&cx, 32).unwrap();

        let a = create_inode(&cx, &journal, &handle, &alloc, S_IFREG, 0, 0, GroupNumber(0), 0)
            .unwrap();
        let b = create_inode(&cx, &journal, &handle, &alloc, S_IFREG, 0, 0, GroupNumber(0), 0)
            .unwrap();
        let icache = InodeCache::new();
        icache.insert(Arc::clone(&a));
        icache.insert(Arc::clone(&b));

        let orphans = OrphanList::new(BlockNumber(1), 0);
        orphans
            .add(&cx, &journal, &handle, &alloc, &icache, &a)
            .unwrap();
        orphans
            .add(&cx, &journal, &handle, &alloc, &icache, &b)
            .unwrap();
        assert!(orphans.head_is(b.ino()));
        // b chains to a.
        assert_eq!(b.with_state(|s| s.dtime), a.ino().0 as u32);

        orphans
            .remove(&cx, &journal, &handle, &alloc, &icache, &b)
            .unwrap();
        assert!(orphans.head_is(a.ino()));
        orphans
            .remove(&cx, &journal, &handle, &alloc, &icache, &a)
            .unwrap();
        assert_eq!(orphans.head(), 0);
        journal.stop(&cx, &handle).unwrap();

        // The head survives on disk in the superblock image.
        let sb = cache.read(&cx, BlockNumber(1)).unwrap();
        sb.with_data(|d| {
            assert_eq!(
                u32::from_le_bytes([d[0x2C], d[0x2D], d[0x2E], d[0x2F]]),
                0
            );
        });
    }

    #[test]
    fn orphan_removal_out_of_order_splices_mid_chain() {
        // Truncates of different inodes may finish in any order; an
        // inode must come off the chain from any position.
        let cx = test_cx();
        let (cache, journal, alloc) = setup();
        let handle = journal.start(&cx, 64).unwrap();

        let a = create_inode(&cx, &journal, &handle, &alloc, S_IFREG, 0, 0, GroupNumber(0), 0)
            .unwrap();
        let b = create_inode(&cx, &journal, &handle, &alloc, S_IFREG, 0, 0, GroupNumber(0), 0)
            .unwrap();
        let c = create_inode(&cx, &journal, &handle, &alloc, S_IFREG, 0, 0, GroupNumber(0), 0)
            .unwrap();
        let icache = InodeCache::new();
        icache.insert(Arc::clone(&a));
        icache.insert(Arc::clone(&b));
        icache.insert(Arc::clone(&c));

        let orphans = OrphanList::new(BlockNumber(1), 0);
        for inode in [&a, &b, &c] {
            orphans
                .add(&cx, &journal, &handle, &alloc, &icache, inode)
                .unwrap();
        }
        let a32 = a.ino().0 as u32;
        let b32 = b.ino().0 as u32;
        let c32 = c.ino().0 as u32;
        assert_eq!(
            orphan_chain(&cx, &cache, &alloc, &icache, &orphans),
            vec![c32, b32, a32]
        );

        // Remove the tail first: c must now chain directly past b to a.
        orphans
            .remove(&cx, &journal, &handle, &alloc, &icache, &b)
            .unwrap();
        assert_eq!(
            orphan_chain(&cx, &cache, &alloc, &icache, &orphans),
            vec![c32, a32]
        );
        assert_eq!(b.with_state(|s| s.dtime), 0);

        // Removing an inode that is no longer linked is a no-op.
        orphans
            .remove(&cx, &journal, &handle, &alloc, &icache, &b)
            .unwrap();
        assert_eq!(
            orphan_chain(&cx, &cache, &alloc, &icache, &orphans),
            vec![c32, a32]
        );

        // Re-adding a mid-chain inode must not relink it: a sits behind
        // c and stays put, its chain pointer intact.
        orphans
            .add(&cx, &journal, &handle, &alloc, &icache, &a)
            .unwrap();
        assert_eq!(
            orphan_chain(&cx, &cache, &alloc, &icache, &orphans),
            vec![c32, a32]
        );

        orphans
            .remove(&cx, &journal, &handle, &alloc, &icache, &a)
            .unwrap();
        orphans
            .remove(&cx, &journal, &handle, &alloc, &icache, &c)
            .unwrap();
        assert_eq!(orphans.head(), 0);
        journal.stop(&cx, &handle).unwrap();
    }
}
