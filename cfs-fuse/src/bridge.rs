//! The `fuser::Filesystem` implementation: one method per kernel VFS
//! callback, each translating `(ino, name)` into a path and delegating to
//! `cfs_core::posix`. See the module doc in `main.rs` for why this keeps a
//! path table instead of trusting CFS's own inode numbers as FUSE inodes.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cfs_core::format::{Stat, TimeSpec};
use cfs_core::{posix, CfsError, Filesystem};
use fuser::{
    FileAttr, FileType, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyIoctl, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::{ENOENT, ENOTTY};

const FUSE_ROOT_ID: u64 = 1;
/// No attribute/entry caching: CoW can change what a path's underlying
/// data-space index is (on snapshot, rollback, or the first write after
/// either) without any notification channel back to the kernel, so every
/// lookup is revalidated rather than trusted for a TTL window.
const TTL: Duration = Duration::ZERO;

struct InodeTable {
    next: AtomicU64,
    path_of: Mutex<HashMap<u64, String>>,
    ino_of: Mutex<HashMap<String, u64>>,
    nlookup: Mutex<HashMap<u64, u64>>,
}

impl InodeTable {
    fn new() -> Self {
        let mut path_of = HashMap::new();
        let mut ino_of = HashMap::new();
        path_of.insert(FUSE_ROOT_ID, "/".to_string());
        ino_of.insert("/".to_string(), FUSE_ROOT_ID);
        Self { next: AtomicU64::new(FUSE_ROOT_ID + 1), path_of: Mutex::new(path_of), ino_of: Mutex::new(ino_of), nlookup: Mutex::new(HashMap::new()) }
    }

    fn path(&self, ino: u64) -> Option<String> {
        self.path_of.lock().unwrap().get(&ino).cloned()
    }

    /// Mint (or reuse) a FUSE inode for `path`, bumping its lookup count.
    fn intern(&self, path: &str) -> u64 {
        let mut ino_of = self.ino_of.lock().unwrap();
        let ino = *ino_of.entry(path.to_string()).or_insert_with(|| self.next.fetch_add(1, Ordering::SeqCst));
        self.path_of.lock().unwrap().insert(ino, path.to_string());
        *self.nlookup.lock().unwrap().entry(ino).or_insert(0) += 1;
        ino
    }

    fn forget(&self, ino: u64, n: u64) {
        if ino == FUSE_ROOT_ID {
            return;
        }
        let mut nlookup = self.nlookup.lock().unwrap();
        let remaining = nlookup.entry(ino).or_insert(0);
        *remaining = remaining.saturating_sub(n);
        if *remaining == 0 {
            nlookup.remove(&ino);
            if let Some(path) = self.path_of.lock().unwrap().remove(&ino) {
                self.ino_of.lock().unwrap().remove(&path);
            }
        }
    }

    fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        let parent_path = self.path(parent)?;
        Some(if parent_path == "/" { format!("/{name}") } else { format!("{parent_path}/{name}") })
    }
}

pub struct Bridge {
    fs: Filesystem,
    inodes: InodeTable,
}

impl Bridge {
    pub fn new(fs: Filesystem) -> Self {
        Self { fs, inodes: InodeTable::new() }
    }
}

fn to_systime(t: TimeSpec) -> SystemTime {
    UNIX_EPOCH + Duration::new(t.sec.max(0) as u64, t.nsec.max(0) as u32)
}

fn from_systime(t: SystemTime) -> TimeSpec {
    let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    TimeSpec { sec: d.as_secs() as i64, nsec: d.subsec_nanos() as i64 }
}

fn file_type(st: &Stat) -> FileType {
    use cfs_core::format::{S_IFBLK, S_IFCHR, S_IFDIR, S_IFLNK, S_IFREG};
    match st.file_type_bits() {
        S_IFDIR => FileType::Directory,
        S_IFLNK => FileType::Symlink,
        S_IFCHR => FileType::CharDevice,
        S_IFBLK => FileType::BlockDevice,
        S_IFREG => FileType::RegularFile,
        _ => FileType::RegularFile,
    }
}

fn attr_of(ino: u64, st: &Stat, block_size: u64) -> FileAttr {
    FileAttr {
        ino,
        size: st.size,
        blocks: st.blocks,
        atime: to_systime(st.atim),
        mtime: to_systime(st.mtim),
        ctime: to_systime(st.ctim),
        crtime: to_systime(st.ctim),
        kind: file_type(st),
        perm: (st.mode & 0o7777) as u16,
        nlink: st.nlink as u32,
        uid: st.uid,
        gid: st.gid,
        rdev: st.rdev as u32,
        blksize: block_size as u32,
        flags: 0,
    }
}

impl fuser::Filesystem for Bridge {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else { return reply.error(libc::EINVAL) };
        let Some(path) = self.inodes.child_path(parent, name) else { return reply.error(ENOENT) };
        match posix::getattr(&self.fs, &path) {
            Ok(st) => {
                let ino = self.inodes.intern(&path);
                reply.entry(&TTL, &attr_of(ino, &st, self.fs.block_size), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.inodes.path(ino) else { return reply.error(ENOENT) };
        match posix::getattr(&self.fs, &path) {
            Ok(st) => reply.attr(&TTL, &attr_of(ino, &st, self.fs.block_size)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.inodes.path(ino) else { return reply.error(ENOENT) };
        let result = (|| -> Result<(), CfsError> {
            if let Some(m) = mode {
                posix::chmod(&self.fs, &path, m)?;
            }
            if uid.is_some() || gid.is_some() {
                posix::chown(&self.fs, &path, uid, gid)?;
            }
            if let Some(n) = size {
                posix::truncate(&self.fs, &path, n)?;
            }
            if atime.is_some() || mtime.is_some() {
                let resolve = |t: TimeOrNow| match t {
                    TimeOrNow::Now => posix::now(),
                    TimeOrNow::SpecificTime(t) => from_systime(t),
                };
                posix::utimens(&self.fs, &path, atime.map(resolve), mtime.map(resolve))?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => match posix::getattr(&self.fs, &path) {
                Ok(st) => reply.attr(&TTL, &attr_of(ino, &st, self.fs.block_size)),
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.inodes.path(ino) else { return reply.error(ENOENT) };
        match posix::readlink(&self.fs, &path) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, rdev: u32, reply: ReplyEntry) {
        let Some(name) = name.to_str() else { return reply.error(libc::EINVAL) };
        let Some(path) = self.inodes.child_path(parent, name) else { return reply.error(ENOENT) };
        match posix::mknod(&self.fs, &path, mode, req.uid(), req.gid(), rdev as u64) {
            Ok(_) => match posix::getattr(&self.fs, &path) {
                Ok(st) => {
                    let ino = self.inodes.intern(&path);
                    reply.entry(&TTL, &attr_of(ino, &st, self.fs.block_size), 0);
                }
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let Some(name) = name.to_str() else { return reply.error(libc::EINVAL) };
        let Some(path) = self.inodes.child_path(parent, name) else { return reply.error(ENOENT) };
        match posix::mkdir(&self.fs, &path, mode, req.uid(), req.gid()) {
            Ok(_) => match posix::getattr(&self.fs, &path) {
                Ok(st) => {
                    let ino = self.inodes.intern(&path);
                    reply.entry(&TTL, &attr_of(ino, &st, self.fs.block_size), 0);
                }
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else { return reply.error(libc::EINVAL) };
        let Some(path) = self.inodes.child_path(parent, name) else { return reply.error(ENOENT) };
        match posix::unlink(&self.fs, &path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else { return reply.error(libc::EINVAL) };
        let Some(path) = self.inodes.child_path(parent, name) else { return reply.error(ENOENT) };
        match posix::rmdir(&self.fs, &path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(&mut self, _req: &Request<'_>, parent: u64, link_name: &OsStr, target: &Path, reply: ReplyEntry) {
        let (Some(link_name), Some(target)) = (link_name.to_str(), target.to_str()) else {
            return reply.error(libc::EINVAL);
        };
        let Some(link_path) = self.inodes.child_path(parent, link_name) else { return reply.error(ENOENT) };
        match posix::symlink(&self.fs, target, &link_path) {
            Ok(_) => match posix::getattr(&self.fs, &link_path) {
                Ok(st) => {
                    let ino = self.inodes.intern(&link_path);
                    reply.entry(&TTL, &attr_of(ino, &st, self.fs.block_size), 0);
                }
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, newparent: u64, newname: &OsStr, flags: u32, reply: ReplyEmpty) {
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else { return reply.error(libc::EINVAL) };
        let (Some(old), Some(new)) = (self.inodes.child_path(parent, name), self.inodes.child_path(newparent, newname)) else {
            return reply.error(ENOENT);
        };
        // FUSE's `RENAME_EXCHANGE`/`RENAME_NOREPLACE` use different bit
        // values than the core's 0/1 flag tuple; collapse to the two the
        // core understands.
        let core_flags = if flags & libc::RENAME_EXCHANGE as u32 != 0 { 1 } else { 0 };
        match posix::rename(&self.fs, &old, &new, core_flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn read(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, size: u32, _flags: i32, _lock_owner: Option<u64>, reply: ReplyData) {
        let Some(path) = self.inodes.path(ino) else { return reply.error(ENOENT) };
        let mut buf = vec![0u8; size as usize];
        match posix::read(&self.fs, &path, &mut buf, offset.max(0) as u64) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, data: &[u8], _write_flags: u32, _flags: i32, _lock_owner: Option<u64>, reply: ReplyWrite) {
        let Some(path) = self.inodes.path(ino) else { return reply.error(ENOENT) };
        match posix::write(&self.fs, &path, data, offset.max(0) as u64) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, _lock_owner: Option<u64>, _flush: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.sync() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(path) = self.inodes.path(ino) else { return reply.error(ENOENT) };
        let parent_path = if path == "/" {
            "/".to_string()
        } else {
            path.rsplit_once('/').map(|(p, _)| if p.is_empty() { "/".to_string() } else { p.to_string() }).unwrap_or_else(|| "/".to_string())
        };
        let parent_ino = self.inodes.intern(&parent_path);

        let mut entries = vec![(ino, FileType::Directory, ".".to_string()), (parent_ino, FileType::Directory, "..".to_string())];
        match posix::readdir(&self.fs, &path) {
            Ok(children) => {
                for (name, _) in children {
                    let child_path = if path == "/" { format!("/{name}") } else { format!("{path}/{name}") };
                    let Ok(st) = posix::getattr(&self.fs, &child_path) else { continue };
                    let child_ino = self.inodes.intern(&child_path);
                    entries.push((child_ino, file_type(&st), name));
                }
            }
            Err(e) => return reply.error(e.to_errno()),
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.sync() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let s = posix::statfs(&self.fs);
        reply.statfs(s.f_blocks, s.f_bfree, s.f_bavail, 0, 0, s.f_bsize as u32, s.f_namemax as u32, 0);
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.inodes.path(ino) else { return reply.error(ENOENT) };
        if mask == libc::F_OK {
            return match posix::getattr(&self.fs, &path) {
                Ok(_) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            };
        }
        match posix::access(&self.fs, &path, mask as u32) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, _flags: i32, reply: ReplyCreate) {
        let Some(name) = name.to_str() else { return reply.error(libc::EINVAL) };
        let Some(path) = self.inodes.child_path(parent, name) else { return reply.error(ENOENT) };
        match posix::create(&self.fs, &path, mode, req.uid(), req.gid()) {
            Ok(_) => match posix::getattr(&self.fs, &path) {
                Ok(st) => {
                    let ino = self.inodes.intern(&path);
                    reply.created(&TTL, &attr_of(ino, &st, self.fs.block_size), 0, 0, 0);
                }
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn fallocate(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, length: i64, _mode: i32, reply: ReplyEmpty) {
        let Some(path) = self.inodes.path(ino) else { return reply.error(ENOENT) };
        match posix::fallocate(&self.fs, &path, offset.max(0) as u64, length.max(0) as u64) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    /// The single device-wide snapshot IOCTL from spec.md §6:
    /// `_IOW('M', 0x42, struct { char name[255]; uint64_t action })` with
    /// `action` 0=create, 1=rollback, 2=delete. Only meaningful on a
    /// directory handle; anything else fails `ENOTTY` as the format
    /// requires.
    fn ioctl(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _flags: u32, _cmd: u32, in_data: &[u8], _out_size: u32, reply: ReplyIoctl) {
        let Some(path) = self.inodes.path(ino) else { return reply.error(ENOENT) };
        let st = match posix::getattr(&self.fs, &path) {
            Ok(st) => st,
            Err(e) => return reply.error(e.to_errno()),
        };
        if !st.is_dir() {
            return reply.error(ENOTTY);
        }
        if in_data.len() < 255 + 8 {
            return reply.error(libc::EINVAL);
        }
        let name_end = in_data[..255].iter().position(|&b| b == 0).unwrap_or(255);
        let Ok(name) = std::str::from_utf8(&in_data[..name_end]) else { return reply.error(libc::EINVAL) };
        let action = u64::from_le_bytes(in_data[255..263].try_into().unwrap());

        let result = match action {
            0 => posix::snapshot_create(&self.fs, name),
            1 => posix::snapshot_rollback(&self.fs, name),
            2 => posix::snapshot_delete(&self.fs, name),
            _ => Err(CfsError::Errno(libc::EINVAL)),
        };
        match result {
            Ok(()) => reply.ioctl(0, &[]),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}
