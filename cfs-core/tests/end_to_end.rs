//! Integration-level scenarios from the format's "end-to-end scenarios"
//! list: format + mount a fresh image, then drive the POSIX surface the
//! way `mkfs.cfs` + `cfs`/`mount.cfs` would in sequence, across a single
//! `Filesystem` handle backed by a `NamedTempFile`.

use cfs_core::format::{self, S_IFDIR};
use cfs_core::{dentry, inode, posix, Filesystem};
use tempfile::NamedTempFile;

fn mkfs(image_bytes: u64, block_size: u64, label: &str) -> Filesystem {
    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();
    // Keep the backing file alive for the handle's lifetime by leaking the
    // NamedTempFile's guard; tests run in their own process and the OS
    // reclaims the file on exit.
    std::mem::forget(tmp);
    let (static_info, total_blocks) = format::plan_layout(image_bytes, block_size, label);
    let fs = Filesystem::format(&path, static_info, total_blocks * block_size).unwrap();
    let root = inode::alloc_inode(&fs, S_IFDIR | 0o755, 0, 0, 0, posix::now()).unwrap();
    let mut root_dir = dentry::DentryService::open_fresh(&fs, root, dentry::NON_ROOT_DENTRY_START);
    root_dir.flush().unwrap();
    fs.set_root_ino(root);
    fs
}

/// Scenario 1: format, mkdir, create+write+read, statfs block count.
#[test]
fn scenario1_format_mkdir_write_read_statfs() {
    let fs = mkfs(64 << 20, 512, "t");

    posix::mkdir(&fs, "/a", 0o755, 0, 0).unwrap();
    posix::create(&fs, "/a/f", 0o644, 0, 0).unwrap();
    posix::write(&fs, "/a/f", b"hello", 0).unwrap();

    let mut buf = [0u8; 5];
    let n = posix::read(&fs, "/a/f", &mut buf, 0).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf, b"hello");

    let sf = posix::statfs(&fs);
    assert_eq!(sf.f_blocks, fs.data_blocks);
}

/// Scenario 2: snapshot visibility — the frozen copy still reads the
/// pre-snapshot bytes while the live tree sees the new write.
#[test]
fn scenario2_snapshot_preserves_old_view() {
    let fs = mkfs(64 << 20, 512, "t");
    posix::mkdir(&fs, "/a", 0o755, 0, 0).unwrap();
    posix::create(&fs, "/a/f", 0o644, 0, 0).unwrap();
    posix::write(&fs, "/a/f", b"hello", 0).unwrap();

    posix::snapshot_create(&fs, "v1").unwrap();
    posix::write(&fs, "/a/f", b"world", 0).unwrap();

    let mut buf = [0u8; 5];
    posix::read(&fs, "/v1/a/f", &mut buf, 0).unwrap();
    assert_eq!(&buf, b"hello");

    let mut buf2 = [0u8; 5];
    posix::read(&fs, "/a/f", &mut buf2, 0).unwrap();
    assert_eq!(&buf2, b"world");
}

/// Scenario 3: rollback restores the pre-snapshot content and the
/// snapshot's own shadow directory does not reappear under the restored
/// root.
#[test]
fn scenario3_rollback_restores_content() {
    let fs = mkfs(64 << 20, 512, "t");
    posix::mkdir(&fs, "/a", 0o755, 0, 0).unwrap();
    posix::create(&fs, "/a/f", 0o644, 0, 0).unwrap();
    posix::write(&fs, "/a/f", b"hello", 0).unwrap();

    posix::snapshot_create(&fs, "v1").unwrap();
    posix::write(&fs, "/a/f", b"world", 0).unwrap();
    posix::snapshot_rollback(&fs, "v1").unwrap();

    let mut buf = [0u8; 5];
    posix::read(&fs, "/a/f", &mut buf, 0).unwrap();
    assert_eq!(&buf, b"hello");

    let names: Vec<String> = posix::readdir(&fs, "/").unwrap().into_iter().map(|(n, _)| n).collect();
    assert!(names.contains(&"a".to_string()));
    assert!(!names.contains(&"v1".to_string()));
}

/// Scenario 4: two snapshots, a live write, delete the older snapshot;
/// the surviving one and the live tree both read their own content.
#[test]
fn scenario4_delete_older_snapshot_keeps_others_intact() {
    let fs = mkfs(64 << 20, 512, "t");
    posix::mkdir(&fs, "/a", 0o755, 0, 0).unwrap();
    posix::create(&fs, "/a/f", 0o644, 0, 0).unwrap();
    posix::write(&fs, "/a/f", b"hello", 0).unwrap();

    posix::snapshot_create(&fs, "v1").unwrap();
    posix::snapshot_create(&fs, "v2").unwrap();
    posix::write(&fs, "/a/f", b"XXXXX", 0).unwrap();
    posix::snapshot_delete(&fs, "v1").unwrap();

    let mut buf = [0u8; 5];
    posix::read(&fs, "/v2/a/f", &mut buf, 0).unwrap();
    assert_eq!(&buf, b"hello");

    let mut buf2 = [0u8; 5];
    posix::read(&fs, "/a/f", &mut buf2, 0).unwrap();
    assert_eq!(&buf2, b"XXXXX");
}

/// Scenario 5: fill the data region to ENOSPC, unlink, and confirm an
/// equal-sized write succeeds afterwards (reclaim via deallocate, not
/// just the OOM redundancy-eviction path).
#[test]
fn scenario5_enospc_then_reclaim_after_unlink() {
    let fs = mkfs(1 << 20, 512, "t");
    posix::create(&fs, "/big", 0o644, 0, 0).unwrap();

    // Write in growing chunks until the allocator refuses.
    let chunk = vec![0x7Au8; 4096];
    let mut off = 0u64;
    loop {
        match posix::write(&fs, "/big", &chunk, off) {
            Ok(n) => off += n as u64,
            Err(_) => break,
        }
        if off > (fs.data_blocks * fs.block_size) * 2 {
            panic!("allocator never reported exhaustion");
        }
    }

    posix::unlink(&fs, "/big").unwrap();

    posix::create(&fs, "/big2", 0o644, 0, 0).unwrap();
    posix::write(&fs, "/big2", &chunk, 0).unwrap();
    let mut buf = vec![0u8; chunk.len()];
    posix::read(&fs, "/big2", &mut buf, 0).unwrap();
    assert_eq!(buf, chunk);
}

/// Scenario 6: rename with both no-replace and exchange semantics.
#[test]
fn scenario6_rename_no_replace_and_exchange() {
    let fs = mkfs(64 << 20, 512, "t");
    posix::mkdir(&fs, "/x", 0o755, 0, 0).unwrap();
    posix::mkdir(&fs, "/z", 0o755, 0, 0).unwrap();
    posix::create(&fs, "/x/y", 0o644, 0, 0).unwrap();
    posix::write(&fs, "/x/y", b"from-x", 0).unwrap();

    // flag=0, target absent: succeeds, old path now gone.
    posix::rename(&fs, "/x/y", "/z/y", 0).unwrap();
    assert!(matches!(posix::getattr(&fs, "/x/y"), Err(cfs_core::CfsError::Errno(e)) if e == libc::ENOENT));
    let mut buf = [0u8; 6];
    posix::read(&fs, "/z/y", &mut buf, 0).unwrap();
    assert_eq!(&buf, b"from-x");

    // Set up an exchange: recreate /x/y with different content.
    posix::create(&fs, "/x/y", 0o644, 0, 0).unwrap();
    posix::write(&fs, "/x/y", b"from-z", 0).unwrap();
    posix::rename(&fs, "/x/y", "/z/y", 1).unwrap();

    let mut a = [0u8; 6];
    posix::read(&fs, "/x/y", &mut a, 0).unwrap();
    assert_eq!(&a, b"from-x");
    let mut b = [0u8; 6];
    posix::read(&fs, "/z/y", &mut b, 0).unwrap();
    assert_eq!(&b, b"from-z");
}
