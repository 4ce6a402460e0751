//! Filesystem handle: the bundle of global mutable state a mounted image
//! needs (mapped image, per-block lock table, header, journal, mirrored
//! bitmap, attribute table) plus the small set of atomic flags the format
//! calls out as global (`no_pointer_and_storage_cow`).
//!
//! Everything above this module (inode/dentry/CoW/snapshot/POSIX) is a
//! set of methods hung off `&Filesystem`; there is deliberately no nested
//! ownership graph of sub-objects borrowing each other, which would fight
//! the borrow checker for no benefit since every sub-component already
//! does its own internal locking.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::allocator::BlockManager;
use crate::attribute::AttributeTable;
use crate::bitmap::AllocationBitmap;
use crate::block_lock::BlockLockTable;
use crate::error::EResult;
use crate::format::{StaticInfo, MAGIC};
use crate::header::Header;
use crate::journal::Journal;
use crate::mapped_io::MappedImage;

/// Per-inode mutex table, keyed by the data-space index an inode
/// currently occupies at the moment a POSIX call resolves it. This is
/// the "per-inode mutex, held for the whole operation" layer from the
/// concurrency model; the per-block table (`BlockLockTable`, C2) is the
/// finer-grained layer underneath it. Because CoW can change an inode's
/// data-space index mid-operation, this table is keyed by the index the
/// operation *started* with — sufficient to serialize concurrent callers
/// that resolved the same path to the same starting inode, which is the
/// property the format asks for.
pub struct InodeLockTable {
    table: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl InodeLockTable {
    fn new() -> Self {
        Self { table: Mutex::new(HashMap::new()) }
    }

    pub fn lock(&self, ino: u64) -> InodeGuard {
        let entry = {
            let mut t = self.table.lock().unwrap();
            t.entry(ino).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        InodeGuard { _mutex: entry }
    }
}

pub struct InodeGuard {
    _mutex: Arc<Mutex<()>>,
}

pub struct Filesystem {
    pub image: MappedImage,
    pub locks: BlockLockTable,
    pub header: Mutex<Header>,
    pub journal: Journal,
    pub bitmap: AllocationBitmap,
    pub attributes: AttributeTable,
    pub block_size: u64,
    pub data_start: u64,
    pub data_blocks: u64,
    pub no_pointer_and_storage_cow: AtomicBool,
    pub inode_locks: InodeLockTable,
}

impl Filesystem {
    fn from_parts(image: MappedImage, header: Header, static_info: StaticInfo) -> EResult<Self> {
        let total_blocks = static_info.total_blocks;
        let block_size = static_info.block_size;
        let data_blocks = static_info.data_end - static_info.data_start;
        let locks = BlockLockTable::new(total_blocks);
        let bitmap = AllocationBitmap::new(
            static_info.bitmap_start,
            static_info.bitmap_mirror_start,
            data_blocks,
            block_size,
        );
        let attributes = AttributeTable::new(static_info.attr_start, data_blocks, block_size);
        let journal = Journal::new(static_info.journal_start, static_info.journal_end, block_size);
        Ok(Self {
            image,
            locks,
            header: Mutex::new(header),
            journal,
            bitmap,
            attributes,
            block_size,
            data_start: static_info.data_start,
            data_blocks,
            no_pointer_and_storage_cow: AtomicBool::new(false),
            inode_locks: InodeLockTable::new(),
        })
    }

    /// Mount an existing image: load/repair the header (C3), then wire up
    /// every other component from its static layout fields.
    pub fn mount(path: impl AsRef<Path>) -> EResult<Self> {
        let image = MappedImage::open(&path)?;
        // Bootstrap: we need `total_blocks`/`block_size` to size the lock
        // table before we can load the header through it, so peek at the
        // unlocked head copy first purely to read those two fields — safe
        // because nothing else can be mutating a freshly-opened image yet.
        let head: crate::format::CfsHead = *bytemuck::from_bytes(image.slice(0, crate::format::HEADER_SIZE));
        if head.magic != MAGIC {
            // Could still be recoverable from the tail; `Header::load`
            // re-validates using both copies. Use the image length to
            // estimate a tail position via 512 B minimum block size.
            let assumed_block_size = 512u64;
            let total_blocks = image.size() / assumed_block_size;
            let probe_locks = BlockLockTable::new(total_blocks);
            let header = Header::load(&image, &probe_locks, total_blocks, assumed_block_size)?;
            let static_info = header.static_info;
            drop(probe_locks);
            return Self::from_parts(image, header, static_info);
        }
        let static_info = head.static_copies[0].info;
        let total_blocks = static_info.total_blocks;
        let block_size = static_info.block_size;
        let bootstrap_locks = BlockLockTable::new(total_blocks);
        let header = Header::load(&image, &bootstrap_locks, total_blocks, block_size)?;
        let static_info = header.static_info;
        drop(bootstrap_locks);
        Self::from_parts(image, header, static_info)
    }

    /// Format a brand-new image (used by `mkfs.cfs`); the root inode is
    /// created by the caller (`format` module) once the handle exists.
    pub fn format(path: impl AsRef<Path>, static_info: StaticInfo, image_len: u64) -> EResult<Self> {
        let image = MappedImage::create(&path, image_len)?;
        let locks = BlockLockTable::new(static_info.total_blocks);
        let header = Header::format(&image, &locks, static_info.total_blocks, static_info.block_size, static_info)?;
        drop(locks);
        Self::from_parts(image, header, static_info)
    }

    pub fn block_manager(&self) -> BlockManager<'_> {
        BlockManager::new(&self.bitmap, &self.attributes)
    }

    /// Absolute (whole-image) block index of data-space index `i`.
    pub fn abs_block(&self, i: u64) -> u64 {
        self.data_start + i
    }

    pub fn root_ino(&self) -> u64 {
        self.header.lock().unwrap().runtime(&self.image).root_inode_pointer
    }

    pub fn set_root_ino(&self, i: u64) {
        self.header.lock().unwrap().update_runtime(&self.image, &self.locks, |r| r.root_inode_pointer = i);
    }

    pub fn sync(&self) -> EResult<()> {
        self.image.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::MAGIC;
    use tempfile::NamedTempFile;

    pub fn sample_layout(data_blocks: u64, block_size: u64) -> (StaticInfo, u64) {
        let bmp_span = (crate::bitmap::bytes_for_bits(data_blocks) + block_size - 1) / block_size;
        let attr_span = (data_blocks * 4 + block_size - 1) / block_size;
        let journal_span = 2;
        let total_blocks = 2 + 2 * bmp_span + attr_span + data_blocks + journal_span;

        let bitmap_start = 1;
        let bitmap_mirror_start = bitmap_start + bmp_span;
        let attr_start = bitmap_mirror_start + bmp_span;
        let data_start = attr_start + attr_span;
        let journal_start = data_start + data_blocks;

        let info = StaticInfo {
            magic: MAGIC,
            label: [0; 32],
            block_size,
            total_blocks,
            bitmap_start,
            bitmap_end: bitmap_mirror_start,
            bitmap_mirror_start,
            bitmap_mirror_end: attr_start,
            attr_start,
            attr_end: data_start,
            data_start,
            data_end: journal_start,
            journal_start,
            journal_end: total_blocks - 1,
        };
        (info, total_blocks)
    }

    #[test]
    fn format_then_mount_roundtrips() {
        let tmp = NamedTempFile::new().unwrap();
        let (info, total_blocks) = sample_layout(256, 512);
        {
            let fs = Filesystem::format(tmp.path(), info, total_blocks * 512).unwrap();
            fs.sync().unwrap();
        }
        let fs = Filesystem::mount(tmp.path()).unwrap();
        assert_eq!(fs.data_blocks, 256);
        assert_eq!(fs.block_size, 512);
    }
}
