//! Directory entry service (C9): an in-inode, LZ4-compressed name→ino
//! map stored in the directory inode's body, `[dentry_start, st_size)`.
//!
//! The payload is a flat sequence of `name\0` followed by an 8-byte
//! little-endian ino, repeated once per entry; compressing that sequence
//! (rather than a structured format) is what the container format
//! specifies ("a magic word, then an LZ4-frame-compressed map of
//! `{name\0, ino(uint64)}` pairs"). Insertion order is explicitly not
//! preserved (the map is rebuilt from a `HashMap` on every save).

use std::collections::HashMap;

use crate::compress::{compress, decompress};
use crate::error::{CfsError, EResult};
use crate::format::{BlockStatus, S_IFDIR};
use crate::fs::Filesystem;
use crate::inode;

pub const MAX_NAME_LEN: usize = 255;
const DENTRY_MAGIC: u64 = 0x4446_4353_4D4150; // "CFSMAPDF" trimmed to 8 bytes, LE

/// Byte offset of the payload within a *non-root* directory's body. Root
/// additionally carries the root-metadata region before this point; see
/// `cow::ROOT_METADATA_HEADER_LEN`.
pub const NON_ROOT_DENTRY_START: u64 = 8;

pub struct DentryService<'a> {
    fs: &'a Filesystem,
    ino: u64,
    dentry_start: u64,
    entries: HashMap<String, u64>,
}

impl<'a> DentryService<'a> {
    /// Open the directory at `ino`, reading and decompressing its current
    /// payload. `dentry_start` is read from the inode body's leading
    /// 8-byte header word, per the container format.
    pub fn open(fs: &'a Filesystem, ino: u64) -> EResult<Self> {
        let st = inode::stat(fs, ino);
        if !st.is_dir() {
            return Err(CfsError::Errno(libc::ENOTDIR));
        }
        let mut header = [0u8; 8];
        inode::read(fs, ino, &mut header, 0)?;
        let dentry_start = u64::from_le_bytes(header);
        let entries = if st.size <= dentry_start {
            HashMap::new()
        } else {
            Self::load_payload(fs, ino, dentry_start, st.size)?
        };
        Ok(Self { fs, ino, dentry_start, entries })
    }

    fn load_payload(fs: &Filesystem, ino: u64, dentry_start: u64, size: u64) -> EResult<HashMap<String, u64>> {
        let mut buf = vec![0u8; (size - dentry_start) as usize];
        inode::read(fs, ino, &mut buf, dentry_start)?;
        if buf.len() < 8 {
            return Ok(HashMap::new());
        }
        let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        if magic != DENTRY_MAGIC {
            return Ok(HashMap::new());
        }
        let decompressed = decompress(&buf[8..])?;
        Ok(parse_pairs(&decompressed))
    }

    /// Create a directory service for a freshly allocated, still-empty
    /// directory inode (no payload to read).
    pub fn open_fresh(fs: &'a Filesystem, ino: u64, dentry_start: u64) -> Self {
        Self { fs, ino, dentry_start, entries: HashMap::new() }
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn ls(&self) -> Vec<(String, u64)> {
        self.entries.iter().map(|(n, i)| (n.clone(), *i)).collect()
    }

    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.entries.get(name).copied()
    }

    pub fn add_entry(&mut self, name: &str, ino: u64) -> EResult<()> {
        validate_name(name)?;
        self.entries.insert(name.to_string(), ino);
        self.save()
    }

    pub fn erase_entry(&mut self, name: &str) -> EResult<u64> {
        self.entries.remove(name).ok_or(CfsError::Errno(libc::ENOENT))
    }

    /// Remove `name` and release the inode it pointed at: a modifiable
    /// inode is resized to zero (freeing its whole block tree) and its own
    /// slot deallocated; a frozen one — still owned by a snapshot — only
    /// loses one reference per block, same as any other CoW demotion.
    pub fn unlink(&mut self, name: &str) -> EResult<u64> {
        let target = self.entries.get(name).copied().ok_or(CfsError::Errno(libc::ENOENT))?;
        let attr = self.fs.attributes.get(&self.fs.image, &self.fs.locks, target);
        if attr.status() == BlockStatus::Modifiable {
            inode::resize(self.fs, target, 0)?;
            let mgr = self.fs.block_manager();
            let mut header = self.fs.header.lock().unwrap();
            mgr.deallocate(&self.fs.image, &self.fs.locks, &self.fs.journal, &mut header, target)?;
        } else {
            let (lv1, lv2, lv3) = inode::linearize_all_blocks(self.fs, target);
            for b in lv1.into_iter().chain(lv2).chain(lv3) {
                self.fs.attributes.update(&self.fs.image, &self.fs.locks, &self.fs.journal, b, |a| a.refcount_dec());
            }
            self.fs.attributes.update(&self.fs.image, &self.fs.locks, &self.fs.journal, target, |a| a.refcount_dec());
        }
        self.entries.remove(name);
        self.save()?;
        Ok(target)
    }

    /// Persist `entries` back to `self.entries` and compress to disk.
    fn save(&mut self) -> EResult<()> {
        let mut flat = Vec::new();
        for (name, ino) in &self.entries {
            flat.extend_from_slice(name.as_bytes());
            flat.push(0);
            flat.extend_from_slice(&ino.to_le_bytes());
        }
        let compressed = compress(&flat);
        let mut payload = Vec::with_capacity(8 + compressed.len());
        payload.extend_from_slice(&DENTRY_MAGIC.to_le_bytes());
        payload.extend_from_slice(&compressed);

        let mut header = [0u8; 8];
        header.copy_from_slice(&self.dentry_start.to_le_bytes());
        inode::write(self.fs, self.ino, &header, 0)?;
        inode::write(self.fs, self.ino, &payload, self.dentry_start)?;
        inode::resize(self.fs, self.ino, self.dentry_start + payload.len() as u64)?;
        Ok(())
    }

    /// Persist without touching `entries`, used after a caller mutated
    /// the map directly (rename's exchange path).
    pub fn flush(&mut self) -> EResult<()> {
        self.save()
    }

    pub fn entries_mut(&mut self) -> &mut HashMap<String, u64> {
        &mut self.entries
    }

    pub fn dentry_start(&self) -> u64 {
        self.dentry_start
    }
}

fn parse_pairs(buf: &[u8]) -> HashMap<String, u64> {
    let mut map = HashMap::new();
    let mut i = 0;
    while i < buf.len() {
        let nul = match buf[i..].iter().position(|&b| b == 0) {
            Some(p) => i + p,
            None => break,
        };
        let name = String::from_utf8_lossy(&buf[i..nul]).into_owned();
        let ino_start = nul + 1;
        if ino_start + 8 > buf.len() {
            break;
        }
        let ino = u64::from_le_bytes(buf[ino_start..ino_start + 8].try_into().unwrap());
        map.insert(name, ino);
        i = ino_start + 8;
    }
    map
}

pub fn validate_name(name: &str) -> EResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(CfsError::Errno(libc::EINVAL));
    }
    if name.as_bytes().contains(&0) {
        return Err(CfsError::Errno(libc::EINVAL));
    }
    Ok(())
}

pub fn is_dir_mode(mode: u32) -> bool {
    mode & crate::format::S_IFMT == S_IFDIR
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tests::sample_layout;
    use crate::fs::Filesystem;
    use crate::inode::alloc_inode;
    use crate::format::{TimeSpec, S_IFDIR};
    use tempfile::NamedTempFile;

    fn fresh(data_blocks: u64, block_size: u64) -> Filesystem {
        let tmp = NamedTempFile::new().unwrap();
        let (info, total_blocks) = sample_layout(data_blocks, block_size);
        Filesystem::format(tmp.path(), info, total_blocks * block_size).unwrap()
    }

    fn now() -> TimeSpec {
        TimeSpec { sec: 0, nsec: 0 }
    }

    #[test]
    fn add_lookup_erase_roundtrip() {
        let fs = fresh(512, 512);
        let dir_ino = alloc_inode(&fs, S_IFDIR | 0o755, 0, 0, 0, now()).unwrap();
        let mut dir = DentryService::open_fresh(&fs, dir_ino, NON_ROOT_DENTRY_START);
        dir.add_entry("a", 42).unwrap();
        dir.add_entry("b", 43).unwrap();

        let reopened = DentryService::open(&fs, dir_ino).unwrap();
        assert_eq!(reopened.lookup("a"), Some(42));
        assert_eq!(reopened.lookup("b"), Some(43));
        assert_eq!(reopened.ls().len(), 2);

        let mut dir = DentryService::open(&fs, dir_ino).unwrap();
        assert_eq!(dir.erase_entry("a").unwrap(), 42);
        dir.flush().unwrap();
        let reopened = DentryService::open(&fs, dir_ino).unwrap();
        assert_eq!(reopened.lookup("a"), None);
        assert_eq!(reopened.lookup("b"), Some(43));
    }

    #[test]
    fn rejects_null_byte_and_overlong_names() {
        let fs = fresh(512, 512);
        let dir_ino = alloc_inode(&fs, S_IFDIR | 0o755, 0, 0, 0, now()).unwrap();
        let mut dir = DentryService::open_fresh(&fs, dir_ino, NON_ROOT_DENTRY_START);
        assert!(dir.add_entry("bad\0name", 1).is_err());
        let long = "a".repeat(256);
        assert!(dir.add_entry(&long, 1).is_err());
    }
}
