//! Header block load/repair (C3).
//!
//! The header is replicated at block `0` (head) and block `N-1` (tail).
//! Each copy carries two independent `StaticInfo` candidates (each with two
//! CRC-64 tags of itself) plus a runtime section with a single-transition
//! shadow (`runtime_cow`) for crash safety across the update.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::block_lock::BlockLockTable;
use crate::error::{CfsError, EResult};
use crate::format::{CfsHead, RuntimeInfo, StaticInfo, StaticInfoCopy, HEADER_SIZE, MAGIC};
use crate::mapped_io::MappedImage;

pub struct Header {
    pub static_info: StaticInfo,
    block_size: u64,
    tail_block: u64,
}

fn head_at(image: &MappedImage) -> &CfsHead {
    bytemuck::from_bytes(image.slice(0, HEADER_SIZE))
}

fn tail_at(image: &MappedImage, tail_block: u64, block_size: u64) -> &CfsHead {
    bytemuck::from_bytes(image.slice(tail_block * block_size, HEADER_SIZE))
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Header {
    /// Load and, if necessary, repair the header. Consults all four
    /// `(copy, location)` static-info candidates; a distinct value survives
    /// verification only if both of its CRC tags recompute correctly. If
    /// more than one distinct survivor remains with no majority, the image
    /// is unrecoverable.
    pub fn load(
        image: &MappedImage,
        locks: &BlockLockTable,
        total_blocks: u64,
        block_size: u64,
    ) -> EResult<Self> {
        let tail_block = total_blocks - 1;
        let mut head_guard = locks.lock(image, 0, block_size);
        let mut tail_guard = locks.lock(image, tail_block, block_size);

        let head = *head_at(image);
        let tail = *tail_at(image, tail_block, block_size);

        if head.magic != MAGIC && tail.magic != MAGIC {
            return Err(CfsError::NotCfs);
        }

        let mut candidates: Vec<StaticInfo> = Vec::new();
        for copy in head.static_copies.iter().chain(tail.static_copies.iter()) {
            if copy.verified() {
                candidates.push(copy.info);
            }
        }
        if candidates.is_empty() {
            return Err(CfsError::HeaderCorrupt);
        }

        let winner = majority(&candidates).ok_or(CfsError::HeaderCorrupt)?;

        // Patch any zeroed runtime section from whichever side still has a
        // sane value, preferring the head.
        let runtime = if head.magic == MAGIC {
            head.runtime
        } else {
            tail.runtime
        };

        let mut header = Header { static_info: winner, block_size, tail_block };

        let mut new_runtime = runtime;
        new_runtime.clean = 0;
        new_runtime.mount_ts = now_secs();

        header.write_both(image, &mut head_guard, &mut tail_guard, winner, new_runtime, runtime);
        image.sync()?;
        Ok(header)
    }

    /// Format a fresh header (used by `mkfs`).
    pub fn format(
        image: &MappedImage,
        locks: &BlockLockTable,
        total_blocks: u64,
        block_size: u64,
        info: StaticInfo,
    ) -> EResult<Self> {
        let tail_block = total_blocks - 1;
        let mut head_guard = locks.lock(image, 0, block_size);
        let mut tail_guard = locks.lock(image, tail_block, block_size);

        let runtime = RuntimeInfo {
            mount_ts: now_secs(),
            last_check_ts: now_secs(),
            clean: 1,
            _pad: [0; 7],
            last_allocated_block: 0,
            allocated_non_cow_blocks: 0,
            root_inode_pointer: 0,
            allocation_bitmap_checksum: 0,
        };

        let mut header = Header { static_info: info, block_size, tail_block };
        header.write_both(image, &mut head_guard, &mut tail_guard, info, runtime, runtime);
        image.sync()?;
        Ok(header)
    }

    fn write_both(
        &mut self,
        _image: &MappedImage,
        head_guard: &mut crate::block_lock::Guard,
        tail_guard: &mut crate::block_lock::Guard,
        info: StaticInfo,
        runtime: RuntimeInfo,
        runtime_cow: RuntimeInfo,
    ) {
        let copy = StaticInfoCopy::new(info);
        let head = CfsHead {
            magic: MAGIC,
            static_copies: [copy, copy],
            runtime,
            runtime_cow,
            _reserved: [0; HEADER_SIZE
                - 8
                - 2 * std::mem::size_of::<StaticInfoCopy>()
                - 2 * std::mem::size_of::<RuntimeInfo>()],
        };
        head_guard.bytes_mut(0)[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&head));
        tail_guard.bytes_mut(0)[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&head));
    }

    pub fn runtime(&self, image: &MappedImage) -> RuntimeInfo {
        head_at(image).runtime
    }

    /// Update the runtime section under head+tail locks, preserving the
    /// previous value in `runtime_cow` for single-transition rollback.
    pub fn update_runtime<F>(
        &mut self,
        image: &MappedImage,
        locks: &BlockLockTable,
        f: F,
    ) where
        F: FnOnce(&mut RuntimeInfo),
    {
        let mut head_guard = locks.lock(image, 0, self.block_size);
        let mut tail_guard = locks.lock(image, self.tail_block, self.block_size);

        let current = head_at(image).runtime;
        let mut updated = current;
        f(&mut updated);

        self.write_both(image, &mut head_guard, &mut tail_guard, self.static_info, updated, current);
    }

    pub fn total_blocks(&self) -> u64 {
        self.static_info.total_blocks
    }

    pub fn data_start(&self) -> u64 {
        self.static_info.data_start
    }

    pub fn data_end(&self) -> u64 {
        self.static_info.data_end
    }
}

/// First static-info candidate with strictly more occurrences than any
/// other, comparing raw bytes (bytemuck structs are `Pod`, so byte
/// equality is structural equality here).
fn majority(candidates: &[StaticInfo]) -> Option<StaticInfo> {
    let mut counts: Vec<(StaticInfo, usize)> = Vec::new();
    'outer: for &c in candidates {
        for (v, n) in counts.iter_mut() {
            if bytemuck::bytes_of(v) == bytemuck::bytes_of(&c) {
                *n += 1;
                continue 'outer;
            }
        }
        counts.push((c, 1));
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    match counts.as_slice() {
        [] => None,
        [only] => Some(only.0),
        [first, second, ..] if first.1 > second.1 => Some(first.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample_info(total_blocks: u64) -> StaticInfo {
        StaticInfo {
            magic: MAGIC,
            label: {
                let mut l = [0u8; 32];
                l[..1].copy_from_slice(b"t");
                l
            },
            block_size: 512,
            total_blocks,
            bitmap_start: 1,
            bitmap_end: 2,
            bitmap_mirror_start: 2,
            bitmap_mirror_end: 3,
            attr_start: 3,
            attr_end: 4,
            data_start: 4,
            data_end: total_blocks - 2,
            journal_start: total_blocks - 2,
            journal_end: total_blocks - 1,
        }
    }

    #[test]
    fn format_then_load_roundtrips() {
        let tmp = NamedTempFile::new().unwrap();
        let total_blocks = 2048;
        let image = MappedImage::create(tmp.path(), 1 << 20).unwrap();
        let locks = BlockLockTable::new(total_blocks);
        let info = sample_info(total_blocks);
        Header::format(&image, &locks, total_blocks, 512, info).unwrap();

        let header = Header::load(&image, &locks, total_blocks, 512).unwrap();
        assert_eq!(header.static_info.block_size, 512);
        assert_eq!(header.static_info.total_blocks, total_blocks);
    }

    #[test]
    fn p10_zeroed_head_is_repaired_from_tail() {
        let tmp = NamedTempFile::new().unwrap();
        let total_blocks = 2048;
        let image = MappedImage::create(tmp.path(), 1 << 20).unwrap();
        let locks = BlockLockTable::new(total_blocks);
        let info = sample_info(total_blocks);
        Header::format(&image, &locks, total_blocks, 512, info).unwrap();

        // Zero the head copy in place, simulating partial corruption.
        unsafe {
            image.slice_mut(0, HEADER_SIZE).fill(0);
        }
        image.sync().unwrap();

        let header = Header::load(&image, &locks, total_blocks, 512).unwrap();
        assert_eq!(header.static_info.total_blocks, total_blocks);
        // Head should now be rewritten to match the tail.
        assert_eq!(head_at(&image).magic, MAGIC);
    }
}
