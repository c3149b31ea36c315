//! End-to-end consistency scenarios: full operations against a volatile
//! region, simulated power loss via [`Pmfs::abandon`], and remounts that
//! must recover every invariant.

use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::errors::PmfsError;
use crate::fs::pmfs::balloc::BlockKind;
use crate::fs::pmfs::inode::{FileMode, ROOT_INO};
use crate::fs::pmfs::log::{self, FileWriteEntry, LOG_ENTRY_SIZE};
use crate::fs::pmfs::sb::SB_TRUNCATE_HEAD_FIELD;
use crate::fs::pmfs::{btree, MkfsOptions, Pmfs};
use crate::fs::SeekTarget;
use crate::mem::{PmRegion, PAGE_SHIFT};
use crate::time::UnixTimestamp32;

fn ticking_clock() -> UnixTimestamp32 {
    static TICK: AtomicU32 = AtomicU32::new(1);
    UnixTimestamp32(TICK.fetch_add(1, Ordering::Relaxed))
}

fn fresh_fs(len: usize) -> Arc<Pmfs> {
    let opts = MkfsOptions {
        clock: ticking_clock,
        ..MkfsOptions::default()
    };
    Pmfs::mkfs(PmRegion::new_volatile(len), opts).expect("mkfs failed")
}

fn crash(fs: Arc<Pmfs>) -> PmRegion {
    Arc::try_unwrap(fs).ok().unwrap().abandon()
}

fn clean_unmount(fs: Arc<Pmfs>) -> PmRegion {
    Arc::try_unwrap(fs).ok().unwrap().unmount()
}

fn remount(region: PmRegion) -> Arc<Pmfs> {
    Pmfs::mount(region, "", ticking_clock).expect("mount failed")
}

fn reg_mode() -> FileMode {
    FileMode(FileMode::S_IFREG | 0o644)
}

#[test]
fn create_write_crash_before_tail_publish() {
    let fs = fresh_fs(16 << 20);
    let ino = fs.create(ROOT_INO, b"victim", reg_mode(), 0).unwrap();
    let free_before = fs.free_blocks();

    // Hand-run an append up to, but not including, the tail publication.
    {
        let f: &Pmfs = &fs;
        let header = f.inode_header(ino).unwrap();
        let mut hdr = header.write();
        let pi_addr = hdr.pi_addr;

        let blocknr = f.allocator.allocate(1, BlockKind::Blk4K).unwrap();
        let data_off = blocknr << PAGE_SHIFT;
        {
            let _w = f.region.memunlock();
            f.region.bytes_mut(data_off, 4096).fill(0xAB);
            f.region.flush(data_off, 4096, false);
        }

        let curr = log::get_append_head(f, pi_addr, &mut hdr, 0, LOG_ENTRY_SIZE as u64, false, true)
            .unwrap();
        let _w = f.region.memunlock();
        *f.region.view_mut::<FileWriteEntry>(curr) = FileWriteEntry {
            block: data_off,
            pgoff: 0,
            num_pages: 1,
            invalid_pages: 0,
            mtime: ticking_clock(),
            size: 4096,
        };
        f.region.flush(curr, LOG_ENTRY_SIZE, true);
        // Power fails before update_tail.
    }

    let fs = remount(crash(fs));

    let pi_addr = fs.get_inode_addr(ino).unwrap();
    let pi = fs.inode(pi_addr);
    assert_eq!(pi.log_tail, 0);
    assert_eq!(pi.log_head, 0);
    assert_eq!(pi.i_size, 0);
    assert_eq!(pi.i_blocks, 0);

    let mut buf = [0u8; 16];
    assert_eq!(fs.read(ino, 0, &mut buf).unwrap(), 0);

    // The unpublished data block and log page are reclaimed by the scan.
    assert_eq!(fs.free_blocks(), free_before);
}

#[test]
fn readdir_orders_by_name_hash() {
    let fs = fresh_fs(16 << 20);
    let d = fs.mkdir(ROOT_INO, b"d", 0o755).unwrap();
    fs.create(d, b"a", reg_mode(), 0).unwrap();
    fs.create(d, b"b", reg_mode(), 0).unwrap();

    let mut names: Vec<Vec<u8>> = Vec::new();
    let mut hashes: Vec<u32> = Vec::new();
    let pos = fs
        .readdir(d, 0, &mut |name, _ino, _ftype| {
            names.push(name.to_vec());
            hashes.push(crate::fs::pmfs::dir::bkdr_hash(name));
            true
        })
        .unwrap();

    assert_eq!(pos, crate::fs::pmfs::READDIR_END);
    assert_eq!(names.len(), 4);
    assert!(names.contains(&b".".to_vec()));
    assert!(names.contains(&b"..".to_vec()));
    assert!(names.contains(&b"a".to_vec()));
    assert!(names.contains(&b"b".to_vec()));
    assert!(hashes.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn readdir_resumes_from_cookie() {
    let fs = fresh_fs(16 << 20);
    let d = fs.mkdir(ROOT_INO, b"dir", 0o755).unwrap();
    for name in [&b"one"[..], b"two", b"three", b"four", b"five"] {
        fs.create(d, name, reg_mode(), 0).unwrap();
    }

    // Stop after three entries, then resume from the returned cookie.
    let mut first: Vec<Vec<u8>> = Vec::new();
    let pos = fs
        .readdir(d, 0, &mut |name, _, _| {
            first.push(name.to_vec());
            first.len() < 3
        })
        .unwrap();
    assert_ne!(pos, crate::fs::pmfs::READDIR_END);

    let mut rest: Vec<Vec<u8>> = Vec::new();
    let end = fs
        .readdir(d, pos, &mut |name, _, _| {
            rest.push(name.to_vec());
            true
        })
        .unwrap();
    assert_eq!(end, crate::fs::pmfs::READDIR_END);

    // The resumed walk re-emits the cookie entry, then the remainder:
    // seven entries total (. and .. included) across both walks.
    assert_eq!(first.len() + rest.len() - 1, 7);
}

#[test]
fn unlink_defers_reclamation_to_evict() {
    let fs = fresh_fs(16 << 20);
    let d = fs.mkdir(ROOT_INO, b"d", 0o755).unwrap();
    let ino = fs.create(d, b"a", reg_mode(), 0).unwrap();
    fs.write(ino, 0, &[0x11u8; 8192]).unwrap();

    fs.unlink(d, b"a").unwrap();

    // The name is gone but the inode still holds its blocks, parked on
    // the truncate list until the last user is done.
    assert_eq!(fs.lookup(d, b"a"), Err(PmfsError::Invalid));
    assert!(fs.truncate_list.lock().contains(&ino));
    assert_ne!(fs.region.load_u64(SB_TRUNCATE_HEAD_FIELD), 0);

    fs.evict_inode(ino).unwrap();
    assert!(!fs.truncate_list.lock().contains(&ino));
    assert_eq!(fs.region.load_u64(SB_TRUNCATE_HEAD_FIELD), 0);
    assert_eq!(fs.inode_header(ino).err(), Some(PmfsError::Stale));

    // create -> unlink -> create of the same name yields a fresh inode.
    let again = fs.create(d, b"a", reg_mode(), 0).unwrap();
    assert_eq!(fs.lookup(d, b"a").unwrap(), again);
}

#[test]
fn unlinked_inode_is_reclaimed_after_crash() {
    let fs = fresh_fs(16 << 20);
    let ino = fs.create(ROOT_INO, b"gone", reg_mode(), 0).unwrap();
    fs.write(ino, 0, &[0x22u8; 4096]).unwrap();
    fs.unlink(ROOT_INO, b"gone").unwrap();

    // Power fails before the (still open) inode is evicted.
    let fs = remount(crash(fs));

    assert_eq!(fs.region.load_u64(SB_TRUNCATE_HEAD_FIELD), 0);
    assert_eq!(fs.inode_header(ino).err(), Some(PmfsError::Stale));
    assert_eq!(fs.lookup(ROOT_INO, b"gone"), Err(PmfsError::Invalid));
}

#[test]
fn triple_overwrite_leaves_one_live_entry() {
    let fs = fresh_fs(16 << 20);
    let ino = fs.create(ROOT_INO, b"f", reg_mode(), 0).unwrap();

    for fill in [0xAAu8, 0xBB, 0xCC] {
        fs.write(ino, 0, &[fill; 4096]).unwrap();
    }

    let mut buf = [0u8; 4096];
    fs.read(ino, 0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0xCC));

    let pi_addr = fs.get_inode_addr(ino).unwrap();
    let pi = fs.inode(pi_addr);
    assert_eq!(pi.i_blocks, 1);

    // Walk the log: exactly the first two entries are fully invalidated.
    let mut live = 0;
    let mut dead = 0;
    let mut curr = pi.log_head;
    while curr != pi.log_tail {
        let entry = fs.region.view::<FileWriteEntry>(curr);
        if u64::from(entry.num_pages) == log::get_invalid(entry.block) {
            dead += 1;
        } else {
            live += 1;
        }
        curr += LOG_ENTRY_SIZE as u64;
        if log::entry_loc(curr) == log::LAST_ENTRY {
            curr = log::next_log_page(&fs, curr);
        }
    }
    assert_eq!((live, dead), (1, 2));
}

#[test]
fn log_gc_collects_fully_invalidated_pages() {
    let fs = fresh_fs(32 << 20);
    let ino = fs.create(ROOT_INO, b"hot", reg_mode(), 0).unwrap();

    // Overwrite one block far more often than a page holds entries; GC
    // runs at every chain extension and must keep the chain short.
    for i in 0..600u32 {
        fs.write(ino, 0, &[(i % 251) as u8; 4096]).unwrap();
    }

    let pi_addr = fs.get_inode_addr(ino).unwrap();
    let pi = fs.inode(pi_addr);
    assert_eq!(pi.i_blocks, 1);
    assert!(
        pi.log_pages <= 4,
        "garbage collection left {} pages",
        pi.log_pages
    );

    let mut buf = [0u8; 1];
    fs.read(ino, 0, &mut buf).unwrap();
    assert_eq!(buf[0], (599 % 251) as u8);
}

#[test]
fn truncate_2m_file_collapses_to_height_zero() {
    let fs = fresh_fs(64 << 20);
    let ino = fs.create(ROOT_INO, b"big", reg_mode(), 0).unwrap();
    fs.set_blocksize_hint(ino, BlockKind::Blk2M).unwrap();

    let data = vec![0x3Cu8; 3 << 20];
    assert_eq!(fs.write(ino, 0, &data).unwrap(), data.len());

    {
        let header = fs.inode_header(ino).unwrap();
        let hdr = header.read();
        assert_eq!(hdr.map.height(), 1);
    }

    fs.set_size(ino, 1024).unwrap();

    let header = fs.inode_header(ino).unwrap();
    let hdr = header.read();
    assert_eq!(hdr.map.height(), 0);
    assert_ne!(hdr.map.root(), 0);

    let pi_addr = fs.get_inode_addr(ino).unwrap();
    let pi = fs.inode(pi_addr);
    assert_eq!(pi.i_size, 1024);
    // One surviving 2 MiB block is 512 four-KiB units.
    assert_eq!(pi.i_blocks, 512);
    drop(hdr);

    let mut buf = vec![0u8; 1024];
    assert_eq!(fs.read(ino, 0, &mut buf).unwrap(), 1024);
    assert!(buf.iter().all(|&b| b == 0x3C));
}

#[test]
fn pending_truncate_is_finished_at_mount() {
    let fs = fresh_fs(16 << 20);
    let ino = fs.create(ROOT_INO, b"t", reg_mode(), 0).unwrap();
    fs.write(ino, 0, &[0x5Au8; 16 * 4096]).unwrap();

    // The intent is published, then power fails before any freeing.
    fs.truncate_add(ino, 4096).unwrap();

    let fs = remount(crash(fs));

    let pi_addr = fs.get_inode_addr(ino).unwrap();
    let pi = fs.inode(pi_addr);
    assert_eq!(pi.i_size, 4096);
    assert_eq!(pi.i_blocks, 1);
    assert_eq!(fs.region.load_u64(SB_TRUNCATE_HEAD_FIELD), 0);

    let mut buf = [0u8; 4096];
    assert_eq!(fs.read(ino, 0, &mut buf).unwrap(), 4096);
    assert!(buf.iter().all(|&b| b == 0x5A));
}

#[test]
fn directory_replay_is_idempotent() {
    let fs = fresh_fs(16 << 20);
    let d = fs.mkdir(ROOT_INO, b"busy", 0o755).unwrap();

    for name in [&b"alpha"[..], b"beta", b"gamma", b"delta"] {
        fs.create(d, name, reg_mode(), 0).unwrap();
    }
    fs.unlink(d, b"beta").unwrap();
    fs.rename(d, b"gamma", b"omega").unwrap();

    let snapshot = |fs: &Pmfs| -> Vec<(u32, Vec<u8>, u64)> {
        let header = fs.inode_header(d).unwrap();
        let hdr = header.read();
        hdr.dir_index
            .iter()
            .map(|(k, n)| (k.hash, k.name.to_vec(), n.ino))
            .collect()
    };

    let before = snapshot(&fs);
    let fs = remount(crash(fs));
    let after = snapshot(&fs);

    assert_eq!(before, after);
    assert!(fs.lookup(d, b"beta").is_err());
    assert!(fs.lookup(d, b"omega").is_ok());
}

#[test]
fn write_read_round_trip_with_holes() {
    let fs = fresh_fs(16 << 20);
    let ino = fs.create(ROOT_INO, b"sparse", reg_mode(), 0).unwrap();

    // Block 5 only; everything before it is a hole.
    fs.write(ino, 5 * 4096, &[0x77u8; 4096]).unwrap();

    let mut buf = vec![0xFFu8; 3 * 4096];
    let read = fs.read(ino, 4 * 4096, &mut buf).unwrap();
    assert_eq!(read, 2 * 4096);
    assert!(buf[..4096].iter().all(|&b| b == 0));
    assert!(buf[4096..2 * 4096].iter().all(|&b| b == 0x77));

    assert_eq!(fs.seek_region(ino, 0, SeekTarget::Data).unwrap(), 5 * 4096);
    assert_eq!(fs.seek_region(ino, 0, SeekTarget::Hole).unwrap(), 0);
    assert_eq!(
        fs.seek_region(ino, 5 * 4096, SeekTarget::Hole).unwrap(),
        6 * 4096
    );
    assert_eq!(
        fs.seek_region(ino, 6 * 4096, SeekTarget::Data),
        Err(PmfsError::NoExtent)
    );
}

#[test]
fn height_ceiling_is_refused() {
    let fs = fresh_fs(16 << 20);
    let ino = fs.create(ROOT_INO, b"wide", reg_mode(), 0).unwrap();

    let header = fs.inode_header(ino).unwrap();
    let mut hdr = header.write();
    let pi_addr = hdr.pi_addr;

    // fanout^3 is the first index a height-3 tree cannot address.
    let over = 1u64 << 27;
    assert_eq!(
        btree::assign_blocks(&fs, pi_addr, &mut hdr.map, over, 1, 0x1000, false),
        Err(PmfsError::NoSpace)
    );
    assert_eq!(hdr.map.height(), 0);
}

#[test]
fn inode_table_grows_when_the_scan_exhausts_it() {
    let fs = fresh_fs(16 << 20);
    let before = fs.inode_table.lock().inodes_count;

    let mut inos = Vec::new();
    let mut names = Vec::new();
    for i in 0..(before + 10) {
        let mut name = b"f".to_vec();
        name.extend_from_slice(i.to_string().as_bytes());
        inos.push(fs.create(ROOT_INO, &name, reg_mode(), 0).unwrap());
        names.push(name);
    }

    let after = fs.inode_table.lock().inodes_count;
    assert!(after > before, "table never grew ({before} -> {after})");

    for (name, ino) in names.iter().zip(&inos) {
        assert_eq!(fs.lookup(ROOT_INO, name).unwrap(), *ino);
    }

    let mut sorted = inos.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), inos.len());
}

#[test]
fn clean_unmount_skips_the_scan_but_agrees_with_it() {
    let fs = fresh_fs(16 << 20);
    let d = fs.mkdir(ROOT_INO, b"keep", 0o755).unwrap();
    let ino = fs.create(d, b"data", reg_mode(), 0).unwrap();
    fs.write(ino, 0, &[0x42u8; 3 * 4096]).unwrap();

    let free_at_unmount = fs.free_blocks();
    let region = clean_unmount(fs);

    // A clean mount loads the saved ranges instead of scanning.
    let fs = remount(region);
    assert_eq!(fs.free_blocks(), free_at_unmount);

    let mut buf = [0u8; 3 * 4096];
    assert_eq!(fs.read(ino, 0, &mut buf).unwrap(), buf.len());
    assert!(buf.iter().all(|&b| b == 0x42));

    // And an unclean remount of the same state derives the same free
    // space from the scan bitmap.
    let fs = remount(crash(fs));
    assert_eq!(fs.free_blocks(), free_at_unmount);
}

#[test]
fn rmdir_requires_empty_and_reclaims() {
    let fs = fresh_fs(16 << 20);
    let d = fs.mkdir(ROOT_INO, b"d", 0o755).unwrap();
    fs.create(d, b"child", reg_mode(), 0).unwrap();

    assert_eq!(fs.rmdir(ROOT_INO, b"d"), Err(PmfsError::Invalid));

    let child = fs.lookup(d, b"child").unwrap();
    fs.unlink(d, b"child").unwrap();
    fs.evict_inode(child).unwrap();

    fs.rmdir(ROOT_INO, b"d").unwrap();
    fs.evict_inode(d).unwrap();
    assert_eq!(fs.lookup(ROOT_INO, b"d"), Err(PmfsError::Invalid));

    let root_addr = fs.get_inode_addr(ROOT_INO).unwrap();
    assert_eq!(fs.inode(root_addr).i_links_count, 2);
}

#[test]
fn dir_log_spills_across_pages_and_replays() {
    let fs = fresh_fs(16 << 20);
    let d = fs.mkdir(ROOT_INO, b"large", 0o755).unwrap();

    // Enough long names to outgrow the first log page several times.
    let count = 300u32;
    for i in 0..count {
        let mut name = vec![b'n'; 40];
        name.extend_from_slice(i.to_string().as_bytes());
        fs.create(d, &name, reg_mode(), 0).unwrap();
    }

    let list = |fs: &Pmfs| {
        let mut seen = 0usize;
        fs.readdir(d, 0, &mut |_, _, _| {
            seen += 1;
            true
        })
        .unwrap();
        seen
    };

    assert_eq!(list(&fs), count as usize + 2);

    let fs = remount(crash(fs));
    assert_eq!(list(&fs), count as usize + 2);
}

#[test]
fn setattr_on_directories_replays_from_the_log() {
    let fs = fresh_fs(16 << 20);
    let d = fs.mkdir(ROOT_INO, b"attrd", 0o755).unwrap();

    fs.set_attr(
        d,
        &crate::fs::pmfs::SetAttrs {
            mode: Some(FileMode::S_IFDIR | 0o700),
            uid: Some(1000),
            gid: Some(1000),
            ..Default::default()
        },
    )
    .unwrap();

    let fs = remount(crash(fs));

    let pi_addr = fs.get_inode_addr(d).unwrap();
    let pi = fs.inode(pi_addr);
    assert_eq!(pi.i_mode.0 & 0o777, 0o700);
    assert_eq!(pi.i_uid, 1000);
    assert_eq!(pi.i_gid, 1000);
}
