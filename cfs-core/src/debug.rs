//! Introspection surface used by `fsck.cfs` and the `debug` REPL command:
//! read-only dumps of the mirrored structures plus a per-block hash
//! consistency check, none of which touch the journal or bitmap/attribute
//! mutation paths above.

use crate::format::{BlockAttribute, JournalRecord};
use crate::fs::Filesystem;

pub fn dump_bitmap(fs: &Filesystem) -> Vec<bool> {
    fs.bitmap.dump(&fs.image, &fs.locks)
}

pub fn dump_journal(fs: &Filesystem) -> Vec<JournalRecord> {
    fs.journal.dump_actions(&fs.image)
}

pub fn dump_attribute(fs: &Filesystem, i: u64) -> BlockAttribute {
    fs.attributes.get(&fs.image, &fs.locks, i)
}

/// Snapshot of the runtime header fields the `debug cat header` command
/// reports; deliberately a plain copy rather than a reference to avoid
/// exposing the lock guard.
#[derive(Debug, Clone, Copy)]
pub struct HeaderSnapshot {
    pub total_blocks: u64,
    pub data_start: u64,
    pub data_end: u64,
    pub mount_ts: i64,
    pub last_check_ts: i64,
    pub clean: bool,
    pub last_allocated_block: u64,
    pub allocated_non_cow_blocks: u64,
    pub root_inode_pointer: u64,
    pub allocation_bitmap_checksum: u64,
}

pub fn dump_header(fs: &Filesystem) -> HeaderSnapshot {
    let header = fs.header.lock().unwrap();
    let runtime = header.runtime(&fs.image);
    HeaderSnapshot {
        total_blocks: header.total_blocks(),
        data_start: header.data_start(),
        data_end: header.data_end(),
        mount_ts: runtime.mount_ts,
        last_check_ts: runtime.last_check_ts,
        clean: runtime.clean != 0,
        last_allocated_block: runtime.last_allocated_block,
        allocated_non_cow_blocks: runtime.allocated_non_cow_blocks,
        root_inode_pointer: runtime.root_inode_pointer,
        allocation_bitmap_checksum: runtime.allocation_bitmap_checksum,
    }
}

/// Recompute each live block's `checksum5` against the attribute table's
/// stored digest; returns `(index, matches)` for every allocated block, so
/// `fsck.cfs` can report which ones have drifted.
pub fn check_hash5(fs: &Filesystem) -> Vec<(u64, bool)> {
    let n = fs.bitmap.data_blocks();
    let header = fs.header.lock().unwrap();
    let mut out = Vec::new();
    for i in 0..n {
        let live = fs.bitmap.get(&fs.image, &fs.locks, &header, i).unwrap_or(false);
        if !live {
            continue;
        }
        let attr = fs.attributes.get(&fs.image, &fs.locks, i);
        let g = fs.locks.lock(&fs.image, fs.abs_block(i), fs.block_size);
        let actual = crate::format::checksum5(g.bytes(0));
        out.push((i, actual == attr.checksum5()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tests::sample_layout;
    use tempfile::NamedTempFile;

    fn fresh(data_blocks: u64, block_size: u64) -> Filesystem {
        let tmp = NamedTempFile::new().unwrap();
        let (info, total_blocks) = sample_layout(data_blocks, block_size);
        Filesystem::format(tmp.path(), info, total_blocks * block_size).unwrap()
    }

    #[test]
    fn dump_bitmap_matches_data_block_count() {
        let fs = fresh(256, 512);
        assert_eq!(dump_bitmap(&fs).len(), 256);
    }

    #[test]
    fn dump_header_reports_fresh_layout() {
        let fs = fresh(256, 512);
        let h = dump_header(&fs);
        assert!(h.clean);
        assert_eq!(h.allocated_non_cow_blocks, 0);
    }

    #[test]
    fn dump_attribute_reads_back_unallocated_default() {
        let fs = fresh(256, 512);
        let a = dump_attribute(&fs, 0);
        assert_eq!(a.refcount(), 0);
    }

    #[test]
    fn dump_journal_is_empty_on_fresh_image() {
        let fs = fresh(256, 512);
        assert!(dump_journal(&fs).is_empty());
    }
}
