#![forbid(unsafe_code)]
//! Conformance scenarios for the mapping and snapshot engine.
//!
//! Covers: branch splices (single and triple indirect), stale-chain
//! detection, metadata COW (copied exactly once per transaction),
//! move-on-write of data blocks with quota transfer and persistence
//! across remount, COW bitmap materialization, and direct-I/O fallback.

use rime::path::{resolve, InodeKind};
use rime::{branch, MapMode};
use rime_types::{read_slot, BlockNumber, DIND_SLOT, IND_SLOT, TIND_SLOT};

use rime_harness::{Fixture, BLOCK_SIZE};

fn block_of(byte: u8) -> Vec<u8> {
    vec![byte; BLOCK_SIZE as usize]
}

// ── S1: single indirect splice ──────────────────────────────────────────────

#[test]
fn single_indirect_splice() {
    let fx = Fixture::new().unwrap();
    let file = fx.create_file().unwrap();

    let data_block = fx.write_file_block(&file, 12, &block_of(0xA1)).unwrap();

    let ind = file.slot(IND_SLOT);
    assert_ne!(ind, 0, "IND root must be spliced");
    assert_ne!(u64::from(ind), data_block.0);

    // Slot 0 of the new indirect names the data block.
    let ind_buf = fx.fs.cache.read(&fx.cx, BlockNumber(u64::from(ind))).unwrap();
    let slot0 = ind_buf.with_data(|d| read_slot(d, 0)).unwrap();
    assert_eq!(u64::from(slot0), data_block.0);

    // One indirect + one data block, both marked allocated.
    let (data, tree) = fx.verify_file_tree(&file).unwrap();
    assert_eq!((data, tree), (1, 1));
    assert_eq!(file.with_state(|s| s.blocks), 2);

    // The mapping is stable across lookups.
    assert_eq!(
        fx.read_file_block(&file, 12).unwrap().unwrap(),
        block_of(0xA1)
    );
}

// ── S2: triple-indirect hole fill ───────────────────────────────────────────

#[test]
fn triple_indirect_hole_fill() {
    let fx = Fixture::new().unwrap();
    let file = fx.create_file().unwrap();

    // 12 + 256 + 256^2 with 1 KiB blocks.
    let iblock = 65_804u64;
    let path = resolve(InodeKind::Regular, 256, iblock).unwrap();
    assert_eq!(path.depth, 4);
    assert_eq!(path.offsets, [14, 0, 0, 0]);

    let data_block = fx.write_file_block(&file, iblock, &block_of(0xB2)).unwrap();

    // Three new indirect blocks chain down to the data block.
    let tind = file.slot(TIND_SLOT);
    assert_ne!(tind, 0);
    let (chain, status) = branch::get_branch(
        &fx.cx,
        &fx.fs.cache,
        &file,
        path.depth,
        &path.offsets,
    )
    .unwrap();
    assert_eq!(status, branch::BranchStatus::Complete);
    assert_eq!(chain.leaf_block(), Some(data_block));

    let (data, tree) = fx.verify_file_tree(&file).unwrap();
    assert_eq!((data, tree), (1, 1)); // tree counts roots; walk checks the rest
    assert_eq!(file.with_state(|s| s.blocks), 4);

    assert_eq!(
        fx.read_file_block(&file, iblock).unwrap().unwrap(),
        block_of(0xB2)
    );
    // Nothing spliced into the shallower roots.
    assert_eq!(file.slot(IND_SLOT), 0);
    assert_eq!(file.slot(DIND_SLOT), 0);
}

// ── S3: stale chain detection ───────────────────────────────────────────────

#[test]
fn walk_detects_concurrent_truncate() {
    let fx = Fixture::new().unwrap();
    let file = fx.create_file().unwrap();

    let iblock = 65_804u64;
    fx.write_file_block(&file, iblock, &block_of(0xC3)).unwrap();
    let path = resolve(InodeKind::Regular, 256, iblock).unwrap();

    // Capture the chain, then truncate everything away under it.
    let (chain, status) =
        branch::get_branch(&fx.cx, &fx.fs.cache, &file, path.depth, &path.offsets).unwrap();
    assert_eq!(status, branch::BranchStatus::Complete);

    file.update_state(|s| s.size = 0);
    rime::truncate(&fx.cx, &fx.fs, &file).unwrap();

    // The captured chain no longer matches the tree.
    assert!(!chain.verify(&file).unwrap());

    // A retried lookup observes the hole.
    let mapped = rime::map_block(&fx.cx, &fx.fs, None, &file, iblock, 1, MapMode::READ).unwrap();
    assert!(mapped.is_none());
}

#[test]
fn concurrent_readers_survive_truncate() {
    let fx = std::sync::Arc::new(Fixture::new().unwrap());
    let file = fx.create_file().unwrap();
    for i in 0..32u64 {
        fx.write_file_block(&file, 12 + i, &block_of(0x11)).unwrap();
    }

    let reader_fx = std::sync::Arc::clone(&fx);
    let reader_file = std::sync::Arc::clone(&file);
    let reader = std::thread::spawn(move || {
        let cx = asupersync::Cx::for_testing();
        for _ in 0..200 {
            for i in 0..32u64 {
                match rime::map_block(
                    &cx,
                    &reader_fx.fs,
                    None,
                    &reader_file,
                    12 + i,
                    1,
                    MapMode::READ,
                ) {
                    Ok(_) => {}
                    Err(rime_error::RimeError::Conflict { .. }) => {}
                    Err(other) => panic!("reader saw unexpected error: {other}"),
                }
            }
        }
    });

    file.update_state(|s| s.size = 0);
    rime::truncate(&fx.cx, &fx.fs, &file).unwrap();
    reader.join().unwrap();

    let mapped = rime::map_block(&fx.cx, &fx.fs, None, &file, 12, 1, MapMode::READ).unwrap();
    assert!(mapped.is_none());
}

// ── S4: metadata COW, once per transaction ──────────────────────────────────

#[test]
fn metadata_cowed_once_per_transaction() {
    let fx = Fixture::new().unwrap();
    let file = fx.create_file().unwrap();
    fx.write_file_block(&file, 0, &block_of(0x44)).unwrap();

    let snap = fx.create_file().unwrap();
    fx.fs.snapshots.take(&fx.cx, &fx.fs, &snap).unwrap();

    // Pick a metadata block that predates the snapshot: the group-0
    // inode table block holding our inodes.
    let desc = fx.fs.alloc.group_desc(rime_types::GroupNumber(0)).unwrap();
    let meta = desc.inode_table_block;
    let buf = fx.fs.cache.read(&fx.cx, meta).unwrap();
    let original = buf.data();

    let handle = fx.fs.journal.start(&fx.cx, 16).unwrap();

    // First write access copies the pre-image into the snapshot.
    fx.fs.journal.get_write_access(&fx.cx, &handle, &buf).unwrap();
    buf.update(|d| d[0] ^= 0xFF);
    fx.fs.journal.dirty_metadata(&fx.cx, &handle, &buf).unwrap();

    // Second access in the same transaction must not re-copy: the
    // snapshot keeps the pre-first-modification image.
    fx.fs.journal.get_write_access(&fx.cx, &handle, &buf).unwrap();
    buf.update(|d| d[1] ^= 0xFF);
    fx.fs.journal.dirty_metadata(&fx.cx, &handle, &buf).unwrap();
    fx.fs.journal.stop(&fx.cx, &handle).unwrap();

    // The snapshot maps the metadata block's address to a private copy.
    let path = resolve(InodeKind::Snapshot, 256, meta.0).unwrap();
    let (chain, status) =
        branch::get_branch(&fx.cx, &fx.fs.cache, &snap, path.depth, &path.offsets).unwrap();
    assert_eq!(status, branch::BranchStatus::Complete);
    let copy = chain.leaf_block().unwrap();
    assert_ne!(copy, meta, "copy must not alias the live block");

    // The copy holds the bytes from before the first modification (the
    // second one never re-copied); the live block has both changes.
    let preserved = fx.read_snapshot_block(&snap, meta.0).unwrap();
    assert_eq!(preserved[0], original[0]);
    assert_eq!(preserved[1], original[1]);
    let live = buf.data();
    assert_ne!(live[0], original[0]);
    assert_ne!(live[1], original[1]);
}

// ── S5: move-on-write of a data block ───────────────────────────────────────

#[test]
fn move_on_write_preserves_data_block() {
    let fx = Fixture::new().unwrap();
    let file = fx.create_file().unwrap();
    let p = fx.write_file_block(&file, 5, &block_of(0x55)).unwrap();
    let file_blocks_before = file.with_state(|s| s.blocks);

    let snap = fx.create_file().unwrap();
    fx.fs.snapshots.take(&fx.cx, &fx.fs, &snap).unwrap();
    let snap_blocks_before = snap.with_state(|s| s.blocks);

    // Overwrite: the old block must migrate into the snapshot.
    let p_new = fx.write_file_block(&file, 5, &block_of(0x66)).unwrap();
    assert_ne!(p_new, p, "overwrite must land in a fresh block");
    assert_eq!(u64::from(file.slot(5)), p_new.0);

    // The snapshot's logical offset p maps physical p itself (a move,
    // not a copy) — confirmed by a raw branch walk, which cannot read
    // through holes.
    let path = resolve(InodeKind::Snapshot, 256, p.0).unwrap();
    let (chain, status) =
        branch::get_branch(&fx.cx, &fx.fs.cache, &snap, path.depth, &path.offsets).unwrap();
    assert_eq!(status, branch::BranchStatus::Complete);
    assert_eq!(chain.leaf_block(), Some(p));

    // Quota: the file swapped one block for another; the snapshot
    // gained the moved block (among its tree blocks).
    assert_eq!(file.with_state(|s| s.blocks), file_blocks_before);
    assert!(snap.with_state(|s| s.blocks) > snap_blocks_before);

    // Old contents via the snapshot, new contents via the file.
    assert_eq!(fx.read_snapshot_block(&snap, p.0).unwrap(), block_of(0x55));
    assert_eq!(fx.read_file_block(&file, 5).unwrap().unwrap(), block_of(0x66));

    // Both survive a clean unmount/mount cycle.
    let fx2 = fx.remount_clean().unwrap();
    let snap2 = fx2.fs.inode(&fx2.cx, snap.ino()).unwrap();
    let file2 = fx2.fs.inode(&fx2.cx, file.ino()).unwrap();
    assert_eq!(fx2.read_snapshot_block(&snap2, p.0).unwrap(), block_of(0x55));
    assert_eq!(
        fx2.read_file_block(&file2, 5).unwrap().unwrap(),
        block_of(0x66)
    );
}

#[test]
fn direct_io_overwrite_falls_back_under_snapshot() {
    let fx = Fixture::new().unwrap();
    let file = fx.create_file().unwrap();
    fx.write_file_block(&file, 3, &block_of(0x10)).unwrap();

    let snap = fx.create_file().unwrap();
    fx.fs.snapshots.take(&fx.cx, &fx.fs, &snap).unwrap();

    let handle = fx.fs.journal.start(&fx.cx, 16).unwrap();
    let mapped = rime::map_block(
        &fx.cx,
        &fx.fs,
        Some(&handle),
        &file,
        3,
        1,
        MapMode::WRITE.overwriting().direct(),
    )
    .unwrap();
    assert!(mapped.is_none(), "direct overwrite must punt to buffered path");
    fx.fs.journal.stop(&fx.cx, &handle).unwrap();
}

#[test]
fn writes_to_snapshot_files_are_refused() {
    let fx = Fixture::new().unwrap();
    let snap = fx.create_file().unwrap();
    fx.fs.snapshots.take(&fx.cx, &fx.fs, &snap).unwrap();

    let handle = fx.fs.journal.start(&fx.cx, 8).unwrap();
    let err = rime::map_block(
        &fx.cx,
        &fx.fs,
        Some(&handle),
        &snap,
        0,
        1,
        MapMode::WRITE,
    )
    .unwrap_err();
    assert!(matches!(err, rime_error::RimeError::Permission));
    fx.fs.journal.stop(&fx.cx, &handle).unwrap();
}

// ── S7: COW bitmap materialization ──────────────────────────────────────────

#[test]
fn first_group_access_materializes_cow_bitmap() {
    let fx = Fixture::new().unwrap();
    let snap = fx.create_file().unwrap();
    fx.fs.snapshots.take(&fx.cx, &fx.fs, &snap).unwrap();

    let group = rime_types::GroupNumber(2);
    let desc = fx.fs.alloc.group_desc(group).unwrap();
    let bitmap_phys = desc.block_bitmap_block;
    let live_before = fx.fs.cache.read(&fx.cx, bitmap_phys).unwrap().data();

    // First allocation in group 2 under the snapshot triggers the copy.
    let handle = fx.fs.journal.start(&fx.cx, 32).unwrap();
    let goal = fx.fs.alloc.geometry().group_first_block(group);
    let got = fx
        .fs
        .alloc
        .new_blocks(&fx.cx, &fx.fs.journal, &handle, BlockNumber(goal.0 + 200), 1)
        .unwrap();
    fx.fs.journal.stop(&fx.cx, &handle).unwrap();

    // The snapshot maps the bitmap's physical address to a private copy
    // holding the pre-allocation image.
    let path = resolve(InodeKind::Snapshot, 256, bitmap_phys.0).unwrap();
    let (chain, status) =
        branch::get_branch(&fx.cx, &fx.fs.cache, &snap, path.depth, &path.offsets).unwrap();
    assert_eq!(status, branch::BranchStatus::Complete);
    let copy_block = chain.leaf_block().unwrap();
    assert_ne!(copy_block, bitmap_phys);

    // Every block in use at take time is preserved in the copy. (The
    // copy may additionally show the snapshot's own tree blocks, whose
    // allocation is the one legitimate in-flight change during the
    // bitmap copy.)
    let copy = fx.read_snapshot_block(&snap, bitmap_phys.0).unwrap();
    for (i, before) in live_before.iter().enumerate() {
        assert_eq!(copy[i] & before, *before, "byte {i} lost in-use bits");
    }

    // The caller's allocation happened after the copy: set in the live
    // bitmap, clear in the copy.
    let (_, rel) = fx.fs.alloc.geometry().absolute_to_group_block(got.start);
    let live_after = fx.fs.cache.read(&fx.cx, bitmap_phys).unwrap();
    assert!(live_after.with_data(|d| rime_alloc::bitmap_get(d, rel)));
    assert!(!rime_alloc::bitmap_get(&copy, rel));

    // Subsequent allocations reuse the cached copy: the mapping stays
    // put.
    let handle = fx.fs.journal.start(&fx.cx, 32).unwrap();
    fx.fs
        .alloc
        .new_blocks(&fx.cx, &fx.fs.journal, &handle, BlockNumber(goal.0 + 300), 1)
        .unwrap();
    fx.fs.journal.stop(&fx.cx, &handle).unwrap();
    let (chain2, status2) =
        branch::get_branch(&fx.cx, &fx.fs.cache, &snap, path.depth, &path.offsets).unwrap();
    assert_eq!(status2, branch::BranchStatus::Complete);
    assert_eq!(chain2.leaf_block(), Some(copy_block));
}

// ── Truncate under an active snapshot: blocks are inherited ────────────────

#[test]
fn truncate_under_snapshot_inherits_blocks() {
    let fx = Fixture::new().unwrap();
    let file = fx.create_file().unwrap();
    let mut phys = Vec::new();
    for i in 0..8u64 {
        phys.push(fx.write_file_block(&file, i, &block_of(0x70 + i as u8)).unwrap());
    }

    let snap = fx.create_file().unwrap();
    fx.fs.snapshots.take(&fx.cx, &fx.fs, &snap).unwrap();

    file.update_state(|s| s.size = 0);
    rime::truncate(&fx.cx, &fx.fs, &file).unwrap();
    assert_eq!(file.with_state(|s| s.blocks), 0);
    for slot in 0..12 {
        assert_eq!(file.slot(slot), 0);
    }

    // Every pre-snapshot data block was inherited, not freed: the
    // snapshot maps it at its own address and serves the old bytes.
    for (i, p) in phys.iter().enumerate() {
        let path = resolve(InodeKind::Snapshot, 256, p.0).unwrap();
        let (chain, status) =
            branch::get_branch(&fx.cx, &fx.fs.cache, &snap, path.depth, &path.offsets).unwrap();
        assert_eq!(status, branch::BranchStatus::Complete, "block {i} not inherited");
        assert_eq!(chain.leaf_block(), Some(*p));
        assert_eq!(
            fx.read_snapshot_block(&snap, p.0).unwrap(),
            block_of(0x70 + i as u8)
        );
    }
}

// ── Mapping bijection across remounts ───────────────────────────────────────

#[test]
fn mapping_is_stable_across_remount() {
    let fx = Fixture::new().unwrap();
    let file = fx.create_file().unwrap();
    let mut mappings = Vec::new();
    for i in [0u64, 5, 12, 300, 65_804] {
        mappings.push((i, fx.write_file_block(&file, i, &block_of(0x31)).unwrap()));
    }

    let fx2 = fx.remount_clean().unwrap();
    let file2 = fx2.fs.inode(&fx2.cx, file.ino()).unwrap();
    for (iblock, phys) in mappings {
        let mapped = rime::map_block(&fx2.cx, &fx2.fs, None, &file2, iblock, 1, MapMode::READ)
            .unwrap()
            .unwrap();
        assert_eq!(mapped.block, phys, "iblock {iblock} moved across remount");
    }
    fx2.verify_file_tree(&file2).unwrap();
}
