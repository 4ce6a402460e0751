//! Path resolver and POSIX call surface (C12): the only layer that knows
//! about hierarchical paths. Everything below (C8/C9/C10/C11) works in
//! terms of a single data-space inode index; this module walks a path down
//! to one, builds the `ParentFrame` chain C10 needs to propagate a CoW back
//! up, and wires the result to the handful of calls a FUSE bridge (or the
//! REPL) actually needs.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::cow::{self, ParentFrame};
use crate::dentry::{self, DentryService};
use crate::error::{CfsError, EResult};
use crate::format::{Stat, TimeSpec, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use crate::fs::Filesystem;
use crate::inode;
use crate::snapshot;

pub fn now() -> TimeSpec {
    let d = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    TimeSpec { sec: d.as_secs() as i64, nsec: d.subsec_nanos() as i64 }
}

fn normalize(path: &str) -> Vec<String> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".").map(|c| c.to_string()).collect()
}

/// Walk `comps` from the root, returning the inode landed on and the
/// root-first ancestor chain (not including that inode itself). `..`
/// pops the most recent chain frame rather than re-resolving a parent
/// pointer, since inodes here carry no backward link.
fn walk(fs: &Filesystem, comps: &[String]) -> EResult<(u64, Vec<ParentFrame>)> {
    let mut ino = fs.root_ino();
    let mut chain: Vec<ParentFrame> = Vec::new();
    for comp in comps {
        if comp == ".." {
            if let Some(frame) = chain.pop() {
                ino = frame.dir_ino;
            }
            continue;
        }
        let st = inode::stat(fs, ino);
        if !st.is_dir() {
            return Err(CfsError::Errno(libc::ENOTDIR));
        }
        let dir = DentryService::open(fs, ino)?;
        let child = dir.lookup(comp).ok_or(CfsError::Errno(libc::ENOENT))?;
        chain.push(ParentFrame { dir_ino: ino, name: comp.clone() });
        ino = child;
    }
    Ok((ino, chain))
}

/// Resolve `path` to its inode and the ancestor chain leading to it.
pub fn resolve(fs: &Filesystem, path: &str) -> EResult<(u64, Vec<ParentFrame>)> {
    walk(fs, &normalize(path))
}

/// Resolve `path`'s containing directory, its own ancestor chain, and the
/// final path component's name. Used by every call that creates, removes,
/// or renames an entry rather than reading through one.
pub fn resolve_parent(fs: &Filesystem, path: &str) -> EResult<(u64, Vec<ParentFrame>, String)> {
    let comps = normalize(path);
    let (last, rest) = comps.split_last().ok_or(CfsError::Errno(libc::EINVAL))?;
    let (ino, chain) = walk(fs, rest)?;
    Ok((ino, chain, last.clone()))
}

pub fn getattr(fs: &Filesystem, path: &str) -> EResult<Stat> {
    let (ino, _) = resolve(fs, path)?;
    Ok(inode::stat(fs, ino))
}

pub fn readdir(fs: &Filesystem, path: &str) -> EResult<Vec<(String, u64)>> {
    let (ino, _) = resolve(fs, path)?;
    let st = inode::stat(fs, ino);
    if !st.is_dir() {
        return Err(CfsError::Errno(libc::ENOTDIR));
    }
    Ok(DentryService::open(fs, ino)?.ls())
}

/// Shared body for `mkdir`/`create`/`mknod`: CoW the parent, allocate a
/// fresh inode of `mode`, link it under `name`.
fn make_entry(fs: &Filesystem, path: &str, mode: u32, uid: u32, gid: u32, rdev: u64) -> EResult<u64> {
    let (parent_ino, mut chain, name) = resolve_parent(fs, path)?;
    dentry::validate_name(&name)?;
    let parent_ino = cow::ensure_modifiable(fs, &mut chain, parent_ino)?;
    let mut parent_dir = DentryService::open(fs, parent_ino)?;
    if parent_dir.lookup(&name).is_some() {
        return Err(CfsError::Errno(libc::EEXIST));
    }
    let child = inode::alloc_inode(fs, mode, uid, gid, rdev, now())?;
    if mode & S_IFMT == S_IFDIR {
        let mut dir = DentryService::open_fresh(fs, child, dentry::NON_ROOT_DENTRY_START);
        dir.flush()?;
    }
    parent_dir.add_entry(&name, child)?;
    Ok(child)
}

pub fn mkdir(fs: &Filesystem, path: &str, mode: u32, uid: u32, gid: u32) -> EResult<u64> {
    make_entry(fs, path, S_IFDIR | (mode & 0o7777), uid, gid, 0)
}

pub fn create(fs: &Filesystem, path: &str, mode: u32, uid: u32, gid: u32) -> EResult<u64> {
    make_entry(fs, path, S_IFREG | (mode & 0o7777), uid, gid, 0)
}

pub fn mknod(fs: &Filesystem, path: &str, mode: u32, uid: u32, gid: u32, rdev: u64) -> EResult<u64> {
    make_entry(fs, path, mode, uid, gid, rdev)
}

pub fn chmod(fs: &Filesystem, path: &str, mode: u32) -> EResult<()> {
    let (ino, mut chain) = resolve(fs, path)?;
    let ino = cow::ensure_modifiable(fs, &mut chain, ino)?;
    let n = now();
    inode::set_stat(fs, ino, |s| {
        s.mode = (s.mode & S_IFMT) | (mode & 0o7777);
        s.ctim = n;
    });
    Ok(())
}

pub fn chown(fs: &Filesystem, path: &str, uid: Option<u32>, gid: Option<u32>) -> EResult<()> {
    let (ino, mut chain) = resolve(fs, path)?;
    let ino = cow::ensure_modifiable(fs, &mut chain, ino)?;
    let n = now();
    inode::set_stat(fs, ino, |s| {
        if let Some(u) = uid {
            s.uid = u;
        }
        if let Some(g) = gid {
            s.gid = g;
        }
        s.ctim = n;
    });
    Ok(())
}

pub fn utimens(fs: &Filesystem, path: &str, atime: Option<TimeSpec>, mtime: Option<TimeSpec>) -> EResult<()> {
    let (ino, mut chain) = resolve(fs, path)?;
    let ino = cow::ensure_modifiable(fs, &mut chain, ino)?;
    let n = now();
    inode::set_stat(fs, ino, |s| {
        if let Some(a) = atime {
            s.atim = a;
        }
        if let Some(m) = mtime {
            s.mtim = m;
        }
        s.ctim = n;
    });
    Ok(())
}

pub fn read(fs: &Filesystem, path: &str, dst: &mut [u8], off: u64) -> EResult<usize> {
    let (ino, _) = resolve(fs, path)?;
    let st = inode::stat(fs, ino);
    if st.is_dir() {
        return Err(CfsError::Errno(libc::EISDIR));
    }
    inode::read(fs, ino, dst, off)
}

pub fn write(fs: &Filesystem, path: &str, src: &[u8], off: u64) -> EResult<usize> {
    let (ino, mut chain) = resolve(fs, path)?;
    let st = inode::stat(fs, ino);
    if st.is_dir() {
        return Err(CfsError::Errno(libc::EISDIR));
    }
    let ino = cow::ensure_modifiable(fs, &mut chain, ino)?;
    let n = inode::write(fs, ino, src, off)?;
    let ts = now();
    inode::set_stat(fs, ino, |s| {
        s.mtim = ts;
        s.ctim = ts;
    });
    Ok(n)
}

pub fn truncate(fs: &Filesystem, path: &str, size: u64) -> EResult<()> {
    let (ino, mut chain) = resolve(fs, path)?;
    let ino = cow::ensure_modifiable(fs, &mut chain, ino)?;
    inode::resize(fs, ino, size)?;
    let ts = now();
    inode::set_stat(fs, ino, |s| {
        s.mtim = ts;
        s.ctim = ts;
    });
    Ok(())
}

/// Pre-allocate (or extend) a regular file's size to `off + len`. This
/// only touches `st_size`, the same as an extending `truncate`; holes
/// below the new EOF still fill in lazily on read.
pub fn fallocate(fs: &Filesystem, path: &str, off: u64, len: u64) -> EResult<()> {
    let (ino, mut chain) = resolve(fs, path)?;
    let st = inode::stat(fs, ino);
    if !st.is_reg() {
        return Err(CfsError::Errno(libc::EINVAL));
    }
    let target = off + len;
    if target <= st.size {
        return Ok(());
    }
    let ino = cow::ensure_modifiable(fs, &mut chain, ino)?;
    inode::resize(fs, ino, target)
}

pub fn unlink(fs: &Filesystem, path: &str) -> EResult<()> {
    let (parent_ino, mut chain, name) = resolve_parent(fs, path)?;
    let parent_ino = cow::ensure_modifiable(fs, &mut chain, parent_ino)?;
    let mut dir = DentryService::open(fs, parent_ino)?;
    let target = dir.lookup(&name).ok_or(CfsError::Errno(libc::ENOENT))?;
    if inode::stat(fs, target).is_dir() {
        return Err(CfsError::Errno(libc::EISDIR));
    }
    dir.unlink(&name)?;
    Ok(())
}

pub fn rmdir(fs: &Filesystem, path: &str) -> EResult<()> {
    let (parent_ino, mut chain, name) = resolve_parent(fs, path)?;
    let parent_ino = cow::ensure_modifiable(fs, &mut chain, parent_ino)?;
    let mut dir = DentryService::open(fs, parent_ino)?;
    let target = dir.lookup(&name).ok_or(CfsError::Errno(libc::ENOENT))?;
    if !inode::stat(fs, target).is_dir() {
        return Err(CfsError::Errno(libc::ENOTDIR));
    }
    if !DentryService::open(fs, target)?.ls().is_empty() {
        return Err(CfsError::Errno(libc::ENOTEMPTY));
    }
    dir.unlink(&name)?;
    Ok(())
}

/// `renameat2` flag meanings: `0` = ordinary replace-or-create, `1` =
/// atomic exchange of both endpoints. Any other value is rejected with
/// `EINVAL` rather than silently ignored, since the source this format
/// descends from treated unknown flag values as a no-op bug. See
/// `DESIGN.md`.
pub fn rename(fs: &Filesystem, old_path: &str, new_path: &str, flags: u32) -> EResult<()> {
    if flags > 1 {
        return Err(CfsError::Errno(libc::EINVAL));
    }
    let (old_parent0, mut old_chain, old_name) = resolve_parent(fs, old_path)?;
    let (new_parent0, _, new_name) = resolve_parent(fs, new_path)?;
    let same_dir = old_parent0 == new_parent0;

    let old_parent = cow::ensure_modifiable(fs, &mut old_chain, old_parent0)?;
    // Re-resolve the new side fresh rather than reuse the chain captured
    // above: the CoW just performed on the old side may have redirected
    // shared ancestors (e.g. a common grandparent directory), and ensuring
    // the new side from a stale chain would re-CoW those ancestors from
    // their pre-rename content, discarding the old side's update.
    let new_parent = if same_dir {
        old_parent
    } else {
        let (new_parent_fresh, mut new_chain_fresh, _) = resolve_parent(fs, new_path)?;
        cow::ensure_modifiable(fs, &mut new_chain_fresh, new_parent_fresh)?
    };

    let mut old_dir = DentryService::open(fs, old_parent)?;
    let src_ino = old_dir.lookup(&old_name).ok_or(CfsError::Errno(libc::ENOENT))?;

    if same_dir {
        match flags {
            0 => {
                if old_dir.lookup(&new_name).is_some() {
                    return Err(CfsError::Errno(libc::EEXIST));
                }
                old_dir.erase_entry(&old_name)?;
                old_dir.add_entry(&new_name, src_ino)?;
            }
            1 => {
                if let Some(existing) = old_dir.lookup(&new_name) {
                    old_dir.erase_entry(&new_name)?;
                    old_dir.erase_entry(&old_name)?;
                    old_dir.add_entry(&old_name, existing)?;
                    old_dir.add_entry(&new_name, src_ino)?;
                } else {
                    old_dir.erase_entry(&old_name)?;
                    old_dir.add_entry(&new_name, src_ino)?;
                }
            }
            _ => unreachable!("rejected above"),
        }
        return Ok(());
    }

    let mut new_dir = DentryService::open(fs, new_parent)?;
    match flags {
        0 => {
            if new_dir.lookup(&new_name).is_some() {
                return Err(CfsError::Errno(libc::EEXIST));
            }
            old_dir.erase_entry(&old_name)?;
            old_dir.flush()?;
            new_dir.add_entry(&new_name, src_ino)?;
        }
        1 => {
            if let Some(existing) = new_dir.lookup(&new_name) {
                new_dir.erase_entry(&new_name)?;
                old_dir.erase_entry(&old_name)?;
                new_dir.add_entry(&new_name, src_ino)?;
                old_dir.add_entry(&old_name, existing)?;
            } else {
                old_dir.erase_entry(&old_name)?;
                old_dir.flush()?;
                new_dir.add_entry(&new_name, src_ino)?;
            }
        }
        _ => unreachable!("rejected above"),
    }
    Ok(())
}

/// `target` is the literal text stored in the new link's body; `link_path`
/// is where the new symlink inode is created. The source this format
/// descends from resolved `link_path`'s parent from the *other* argument
/// (effectively the directory containing whatever `target` happened to
/// name); a faithful reimplementation instead resolves the link-containing
/// directory from `link_path` itself, as every other creating call does.
/// See `DESIGN.md`.
pub fn symlink(fs: &Filesystem, target: &str, link_path: &str) -> EResult<u64> {
    let (parent_ino, mut chain, name) = resolve_parent(fs, link_path)?;
    dentry::validate_name(&name)?;
    let parent_ino = cow::ensure_modifiable(fs, &mut chain, parent_ino)?;
    let mut parent_dir = DentryService::open(fs, parent_ino)?;
    if parent_dir.lookup(&name).is_some() {
        return Err(CfsError::Errno(libc::EEXIST));
    }
    let child = inode::alloc_inode(fs, S_IFLNK | 0o755, 0, 0, 0, now())?;
    inode::write(fs, child, target.as_bytes(), 0)?;
    parent_dir.add_entry(&name, child)?;
    Ok(child)
}

pub fn readlink(fs: &Filesystem, path: &str) -> EResult<String> {
    let (ino, _) = resolve(fs, path)?;
    let st = inode::stat(fs, ino);
    if !st.is_lnk() {
        return Err(CfsError::Errno(libc::EINVAL));
    }
    let mut buf = vec![0u8; st.size as usize];
    inode::read(fs, ino, &mut buf, 0)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[derive(Debug, Clone, Copy)]
pub struct Statfs {
    pub f_bsize: u64,
    pub f_blocks: u64,
    pub f_bfree: u64,
    pub f_bavail: u64,
    pub f_namemax: u64,
}

pub fn statfs(fs: &Filesystem) -> Statfs {
    let runtime = fs.header.lock().unwrap().runtime(&fs.image);
    let free = fs.data_blocks.saturating_sub(runtime.allocated_non_cow_blocks);
    Statfs {
        f_bsize: fs.block_size,
        f_blocks: fs.data_blocks,
        f_bfree: free,
        f_bavail: free,
        f_namemax: dentry::MAX_NAME_LEN as u64,
    }
}

pub const R_OK: u32 = 0b100;
pub const W_OK: u32 = 0b010;
pub const X_OK: u32 = 0b001;

/// Single-user access check, reproduced verbatim from the format's own
/// (slightly odd) formula: the owner bits are recomputed by folding the
/// "other" bits of `mode` back into the owner position and AND-ing with
/// the inode's actual owner bits, then a frozen inode has its write bit
/// masked off regardless of what that computation yielded. There is no
/// uid/gid comparison — every caller is treated as the owner.
pub fn access(fs: &Filesystem, path: &str, mask: u32) -> EResult<()> {
    let (ino, _) = resolve(fs, path)?;
    let st = inode::stat(fs, ino);
    let mut owner_view = (st.mode << 6) & 0o700;
    owner_view &= st.mode;
    let attr = fs.attributes.get(&fs.image, &fs.locks, ino);
    if attr.status() != crate::format::BlockStatus::Modifiable {
        owner_view &= !0o200;
    }
    let granted = (owner_view >> 6) & 0o7;
    if granted & mask == mask {
        Ok(())
    } else {
        Err(CfsError::Errno(libc::EACCES))
    }
}

pub fn snapshot_create(fs: &Filesystem, name: &str) -> EResult<()> {
    snapshot::create(fs, name, now())
}

pub fn snapshot_rollback(fs: &Filesystem, name: &str) -> EResult<()> {
    snapshot::rollback(fs, name)
}

pub fn snapshot_delete(fs: &Filesystem, name: &str) -> EResult<()> {
    snapshot::delete(fs, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tests::sample_layout;
    use tempfile::NamedTempFile;

    fn fresh(data_blocks: u64, block_size: u64) -> Filesystem {
        let tmp = NamedTempFile::new().unwrap();
        let (info, total_blocks) = sample_layout(data_blocks, block_size);
        let fs = Filesystem::format(tmp.path(), info, total_blocks * block_size).unwrap();
        let root = inode::alloc_inode(&fs, S_IFDIR | 0o755, 0, 0, 0, now()).unwrap();
        let mut dir = DentryService::open_fresh(&fs, root, dentry::NON_ROOT_DENTRY_START);
        dir.flush().unwrap();
        fs.set_root_ino(root);
        fs
    }

    #[test]
    fn mkdir_create_and_readdir_roundtrip() {
        let fs = fresh(4096, 512);
        mkdir(&fs, "/sub", 0o755, 0, 0).unwrap();
        create(&fs, "/sub/file.txt", 0o644, 0, 0).unwrap();
        let entries = readdir(&fs, "/sub").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "file.txt");
    }

    #[test]
    fn write_then_read_through_path() {
        let fs = fresh(4096, 512);
        create(&fs, "/a.txt", 0o644, 0, 0).unwrap();
        write(&fs, "/a.txt", b"hello", 0).unwrap();
        let mut buf = [0u8; 5];
        let n = read(&fs, "/a.txt", &mut buf, 0).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn unlink_removes_entry() {
        let fs = fresh(4096, 512);
        create(&fs, "/a.txt", 0o644, 0, 0).unwrap();
        unlink(&fs, "/a.txt").unwrap();
        assert_eq!(readdir(&fs, "/").unwrap().len(), 0);
    }

    #[test]
    fn rmdir_rejects_nonempty() {
        let fs = fresh(4096, 512);
        mkdir(&fs, "/d", 0o755, 0, 0).unwrap();
        create(&fs, "/d/f", 0o644, 0, 0).unwrap();
        assert!(rmdir(&fs, "/d").is_err());
        unlink(&fs, "/d/f").unwrap();
        rmdir(&fs, "/d").unwrap();
    }

    #[test]
    fn rename_moves_entry_across_directories() {
        let fs = fresh(4096, 512);
        mkdir(&fs, "/d1", 0o755, 0, 0).unwrap();
        mkdir(&fs, "/d2", 0o755, 0, 0).unwrap();
        create(&fs, "/d1/f", 0o644, 0, 0).unwrap();
        rename(&fs, "/d1/f", "/d2/f", 0).unwrap();
        assert!(readdir(&fs, "/d1").unwrap().is_empty());
        assert_eq!(readdir(&fs, "/d2").unwrap().len(), 1);
    }

    #[test]
    fn rename_rejects_unknown_flag() {
        let fs = fresh(4096, 512);
        create(&fs, "/a", 0o644, 0, 0).unwrap();
        assert!(matches!(rename(&fs, "/a", "/b", 2), Err(CfsError::Errno(e)) if e == libc::EINVAL));
    }

    #[test]
    fn symlink_and_readlink_roundtrip() {
        let fs = fresh(4096, 512);
        symlink(&fs, "/a", "/link").unwrap();
        assert_eq!(readlink(&fs, "/link").unwrap(), "/a");
    }

    #[test]
    fn statfs_reports_free_space() {
        let fs = fresh(4096, 512);
        let s = statfs(&fs);
        assert_eq!(s.f_bsize, 512);
        assert_eq!(s.f_blocks, 4096);
        assert!(s.f_bfree <= s.f_blocks);
    }

    #[test]
    fn snapshot_roundtrip_through_posix_surface() {
        let fs = fresh(8192, 512);
        create(&fs, "/f", 0o644, 0, 0).unwrap();
        write(&fs, "/f", b"v1", 0).unwrap();
        snapshot_create(&fs, "s1").unwrap();
        write(&fs, "/f", b"v2", 0).unwrap();
        snapshot_rollback(&fs, "s1").unwrap();
        let mut buf = [0u8; 2];
        read(&fs, "/f", &mut buf, 0).unwrap();
        assert_eq!(&buf, b"v1");
    }
}
