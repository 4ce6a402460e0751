//! Whole-file memory mapping (C1).
//!
//! The image is mapped once, read-write, for the lifetime of the
//! filesystem handle. Everything above this layer addresses the image by
//! byte offset or block index; `MappedImage` itself performs no locking —
//! mutual exclusion is the block-lock table's job (`block_lock`).

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::MmapMut;

use crate::error::{CfsError, EResult};
use crate::format::MIN_IMAGE_SIZE;

pub struct MappedImage {
    file: File,
    mmap: MmapMut,
}

impl MappedImage {
    /// Open an existing image file and map it whole.
    pub fn open(path: impl AsRef<Path>) -> EResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| CfsError::CannotOpen(format!("{}: {e}", path.as_ref().display())))?;

        let len = file
            .metadata()
            .map_err(|e| CfsError::CannotOpen(e.to_string()))?
            .len();
        if len < MIN_IMAGE_SIZE {
            return Err(CfsError::TooSmall);
        }

        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| CfsError::MmapFailed(e.to_string()))?;

        Ok(Self { file, mmap })
    }

    /// Create a new image file of exactly `len` bytes (zero-filled) and map
    /// it. Used by `mkfs`.
    pub fn create(path: impl AsRef<Path>, len: u64) -> EResult<Self> {
        if len < MIN_IMAGE_SIZE {
            return Err(CfsError::TooSmall);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())
            .map_err(|e| CfsError::CannotOpen(format!("{}: {e}", path.as_ref().display())))?;
        file.set_len(len).map_err(|e| CfsError::CannotOpen(e.to_string()))?;

        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| CfsError::MmapFailed(e.to_string()))?;

        Ok(Self { file, mmap })
    }

    pub fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Raw immutable view of `[offset, offset+len)`.
    pub fn slice(&self, offset: u64, len: usize) -> &[u8] {
        let off = offset as usize;
        &self.mmap[off..off + len]
    }

    /// Raw mutable view. Callers must hold the appropriate block lock(s)
    /// before calling this; `MappedImage` itself enforces nothing.
    ///
    /// # Safety
    /// The caller must ensure no other thread concurrently reads or writes
    /// an overlapping range without the matching block lock held; this is
    /// the mutual-exclusion contract of C2, not of this type.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: u64, len: usize) -> &mut [u8] {
        let off = offset as usize;
        let base = self.mmap.as_ptr() as *mut u8;
        std::slice::from_raw_parts_mut(base.add(off), len)
    }

    /// Flush the whole image to the backing file (msync).
    pub fn sync(&self) -> EResult<()> {
        self.mmap.flush().map_err(CfsError::from)
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

// `MmapMut` is `Send + Sync` given exclusive ownership is arbitrated
// elsewhere (the block-lock table); the filesystem handle shares this type
// across worker threads the same way a FUSE session does.
unsafe impl Send for MappedImage {}
unsafe impl Sync for MappedImage {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn create_then_open_roundtrips_bytes() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        {
            let img = MappedImage::create(&path, 2 << 20).unwrap();
            assert_eq!(img.size(), 2 << 20);
            unsafe {
                img.slice_mut(0, 4).copy_from_slice(b"CFS\0");
            }
            img.sync().unwrap();
        }
        let img = MappedImage::open(&path).unwrap();
        assert_eq!(img.slice(0, 4), b"CFS\0");
    }

    #[test]
    fn too_small_image_is_rejected() {
        let tmp = NamedTempFile::new().unwrap();
        assert!(matches!(
            MappedImage::create(tmp.path(), 1024),
            Err(CfsError::TooSmall)
        ));
    }
}
