//! Public-API round trips against a volatile region.

use std::sync::atomic::{AtomicU32, Ordering};

use rand::Rng;

use pmfs::errors::PmfsError;
use pmfs::fs::pmfs::{FileMode, MkfsOptions, Pmfs, SetAttrs, ROOT_INO};
use pmfs::mem::PmRegion;
use pmfs::time::UnixTimestamp32;

fn clock() -> UnixTimestamp32 {
    static TICK: AtomicU32 = AtomicU32::new(1_700_000_000);
    UnixTimestamp32(TICK.fetch_add(1, Ordering::Relaxed))
}

fn mkfs_with_label(label: &[u8]) -> std::sync::Arc<Pmfs> {
    let mut opts = MkfsOptions {
        clock,
        ..MkfsOptions::default()
    };
    opts.volume_name[..label.len()].copy_from_slice(label);

    Pmfs::mkfs(PmRegion::new_volatile(32 << 20), opts).expect("mkfs failed")
}

fn reg_mode() -> FileMode {
    FileMode(FileMode::S_IFREG | 0o644)
}

#[test]
fn format_populate_remount() {
    let fs = mkfs_with_label(b"scratch");
    assert_eq!(fs.label(), "scratch");

    let dir = fs.mkdir(ROOT_INO, b"docs", 0o755).unwrap();
    let file = fs.create(dir, b"notes.txt", reg_mode(), 0).unwrap();

    let payload = b"the quick brown fox jumps over the lazy dog".repeat(200);
    assert_eq!(fs.write(file, 0, &payload).unwrap(), payload.len());

    let region = std::sync::Arc::try_unwrap(fs).ok().unwrap().unmount();
    let fs = Pmfs::mount(region, "", clock).expect("remount failed");

    assert_eq!(fs.label(), "scratch");
    let dir = fs.lookup(ROOT_INO, b"docs").unwrap();
    let file = fs.lookup(dir, b"notes.txt").unwrap();

    let mut back = vec![0u8; payload.len()];
    assert_eq!(fs.read(file, 0, &mut back).unwrap(), payload.len());
    assert_eq!(back, payload);
}

#[test]
fn unknown_mount_option_is_rejected() {
    let fs = mkfs_with_label(b"opts");
    let region = std::sync::Arc::try_unwrap(fs).ok().unwrap().unmount();

    assert!(matches!(
        Pmfs::mount(region, "journal=ordered", clock),
        Err(PmfsError::Invalid)
    ));
}

#[test]
fn duplicate_names_are_refused() {
    let fs = mkfs_with_label(b"dups");
    fs.create(ROOT_INO, b"once", reg_mode(), 0).unwrap();
    assert_eq!(
        fs.create(ROOT_INO, b"once", reg_mode(), 0),
        Err(PmfsError::Exists)
    );
    assert_eq!(
        fs.create(ROOT_INO, b"", reg_mode(), 0),
        Err(PmfsError::Invalid)
    );
}

#[test]
fn setattr_round_trip() {
    let fs = mkfs_with_label(b"attrs");
    let file = fs.create(ROOT_INO, b"f", reg_mode(), 0).unwrap();

    fs.set_attr(
        file,
        &SetAttrs {
            uid: Some(42),
            gid: Some(43),
            size: Some(12288),
            ..Default::default()
        },
    )
    .unwrap();

    // Sparse grow: readable, zero-filled.
    let mut buf = vec![0xEEu8; 12288];
    assert_eq!(fs.read(file, 0, &mut buf).unwrap(), 12288);
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn random_writes_match_a_shadow_model() {
    let fs = mkfs_with_label(b"fuzz");
    let file = fs.create(ROOT_INO, b"model", reg_mode(), 0).unwrap();

    const FILE_SIZE: usize = 1 << 20;
    let mut model = vec![0u8; FILE_SIZE];
    let mut rng = rand::thread_rng();

    for round in 0..64u32 {
        let offset = rng.gen_range(0..FILE_SIZE - 1);
        let len = rng.gen_range(1..(FILE_SIZE - offset).min(64 << 10));
        let byte = (round % 251) as u8 + 1;

        let data = vec![byte; len];
        assert_eq!(fs.write(file, offset as u64, &data).unwrap(), len);
        model[offset..offset + len].fill(byte);
    }

    let written = model.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    let mut back = vec![0u8; written];
    assert_eq!(fs.read(file, 0, &mut back).unwrap(), written);
    assert_eq!(back, model[..written]);

    // Still identical after an unclean remount.
    let region = std::sync::Arc::try_unwrap(fs).ok().unwrap().abandon();
    let fs = Pmfs::mount(region, "", clock).expect("recovery mount failed");

    let mut back = vec![0u8; written];
    assert_eq!(fs.read(file, 0, &mut back).unwrap(), written);
    assert_eq!(back, model[..written]);
}

#[test]
fn free_space_accounting_survives_delete_cycles() {
    let fs = mkfs_with_label(b"cycle");
    let free_blocks_before = fs.free_blocks();
    let free_inodes_before = fs.free_inodes();

    for round in 0..5u32 {
        let name = format!("cycle{round}");
        let file = fs.create(ROOT_INO, name.as_bytes(), reg_mode(), 0).unwrap();
        fs.write(file, 0, &vec![0xA5u8; 64 << 10]).unwrap();
        fs.unlink(ROOT_INO, name.as_bytes()).unwrap();
        fs.evict_inode(file).unwrap();
    }

    // Everything the cycles allocated came back; only the root directory
    // log may have grown by a page or two.
    let leaked = free_blocks_before - fs.free_blocks();
    assert!(leaked <= 2, "leaked {leaked} blocks");
    assert_eq!(fs.free_inodes(), free_inodes_before);
}
