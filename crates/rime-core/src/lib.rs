#![forbid(unsafe_code)]
//! Block mapping and snapshot COW engine.
//!
//! The core of RimeFS: translating logical file offsets to physical
//! blocks through the inode's indirect-block tree, growing the tree with
//! transactional branch allocation, shrinking it with restartable
//! truncation, and preserving pre-modification images in the active
//! snapshot before anything is overwritten.
//!
//! Module map:
//! - [`path`] — logical block to indirect-tree path (pure).
//! - [`branch`] — branch walking, verification, allocation, splice.
//! - [`map`] — the `map_block` entry point the host layers call.
//! - [`truncate`] — restart-consistent freeing of block ranges.
//! - [`snapshot`] — the COW engine behind the journal's access hooks.

pub mod branch;
pub mod map;
pub mod path;
pub mod snapshot;
pub mod truncate;

use rime_alloc::Allocator;
use rime_block::BufferCache;
use rime_error::{FsErrorState, Result};
use rime_inode::{Inode, InodeCache, OrphanList};
use rime_journal::Journal;
use rime_types::BlockNumber;
use std::sync::Arc;

pub use branch::{BranchChain, BranchStatus, ChainLink};
pub use map::{bread, getblk, map_block, MapMode, Mapped, SnapMap};
pub use path::{resolve, InodeKind, ResolvedPath};
pub use snapshot::{SnapAccess, SnapshotEngine};
pub use truncate::{blocks_for_truncate, delete_inode, truncate};

/// Everything one mounted filesystem shares.
///
/// Constructed once at mount; the snapshot engine is bound to the
/// context and registered as the journal's access hooks before any
/// mapping request runs.
pub struct FsCtx {
    pub cache: Arc<BufferCache>,
    pub journal: Arc<Journal>,
    pub alloc: Arc<Allocator>,
    pub inodes: Arc<InodeCache>,
    pub orphans: Arc<OrphanList>,
    pub errors: Arc<FsErrorState>,
    pub snapshots: Arc<SnapshotEngine>,
    /// Block holding the superblock image.
    pub sb_block: BlockNumber,
}

impl FsCtx {
    /// Assemble a context and wire the snapshot engine into the journal.
    pub fn assemble(
        cache: Arc<BufferCache>,
        journal: Arc<Journal>,
        alloc: Arc<Allocator>,
        orphans: Arc<OrphanList>,
        sb_block: BlockNumber,
    ) -> Arc<Self> {
        let group_count = alloc.geometry().group_count;
        let fs = Arc::new(Self {
            cache,
            journal: Arc::clone(&journal),
            alloc,
            inodes: Arc::new(InodeCache::new()),
            orphans,
            errors: Arc::new(FsErrorState::new()),
            snapshots: Arc::new(SnapshotEngine::new(group_count)),
            sb_block,
        });
        fs.snapshots.bind(&fs);
        journal.set_hooks(Arc::clone(&fs.snapshots) as Arc<dyn rime_journal::AccessHooks>);
        fs
    }

    /// Look up an inode through the shared cache.
    pub fn inode(&self, cx: &asupersync::Cx, ino: rime_types::InodeNumber) -> Result<Arc<Inode>> {
        self.inodes.get(cx, &self.cache, &self.alloc, ino)
    }
}

#[inline]
pub(crate) fn cx_checkpoint(cx: &asupersync::Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| rime_error::RimeError::Cancelled)
}
