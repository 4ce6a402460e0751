//! Block manager (C7): allocate/deallocate, and the full-scan OOM path
//! that ages blocks and evicts the oldest CoW-redundancy copies.

use crate::attribute::AttributeTable;
use crate::bitmap::AllocationBitmap;
use crate::block_lock::BlockLockTable;
use crate::error::{CfsError, EResult};
use crate::format::{BlockAttribute, BlockType};
use crate::header::Header;
use crate::journal::{action, transaction, Journal};
use crate::mapped_io::MappedImage;

pub struct BlockManager<'a> {
    pub bitmap: &'a AllocationBitmap,
    pub attributes: &'a AttributeTable,
}

impl<'a> BlockManager<'a> {
    pub fn new(bitmap: &'a AllocationBitmap, attributes: &'a AttributeTable) -> Self {
        Self { bitmap, attributes }
    }

    /// Allocate a free data-space block. Scans from
    /// `last_allocated_block + 1`; on exhaustion runs the OOM reclaim pass
    /// once before giving up with `NoMoreFreeSpaces`.
    pub fn allocate(
        &self,
        image: &MappedImage,
        locks: &BlockLockTable,
        journal: &Journal,
        header: &mut Header,
    ) -> EResult<u64> {
        transaction(journal, image, action::ALLOCATE_BLOCK, [0; 5], || {
            if let Some(i) = self.scan_free(image, locks, header)? {
                return self.claim(image, locks, journal, header, i);
            }
            self.oom_reclaim(image, locks, journal, header)?;
            if let Some(i) = self.scan_free(image, locks, header)? {
                return self.claim(image, locks, journal, header, i);
            }
            Err(CfsError::NoMoreFreeSpaces)
        })
    }

    fn scan_free(&self, image: &MappedImage, locks: &BlockLockTable, header: &Header) -> EResult<Option<u64>> {
        let n = self.bitmap.data_blocks();
        if n == 0 {
            return Ok(None);
        }
        let start = (header.runtime(image).last_allocated_block + 1) % n;
        for k in 0..n {
            let i = (start + k) % n;
            if !self.bitmap.get(image, locks, header, i)? {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    fn claim(
        &self,
        image: &MappedImage,
        locks: &BlockLockTable,
        journal: &Journal,
        header: &mut Header,
        i: u64,
    ) -> EResult<u64> {
        self.bitmap.set(image, locks, journal, header, i, true)?;
        self.attributes.set(image, locks, journal, i, BlockAttribute(0));
        header.update_runtime(image, locks, |r| r.last_allocated_block = i);
        Ok(i)
    }

    /// Free a data-space block. `i == 0` would free the root inode's own
    /// slot in data-space-relative terms only by coincidence of layout;
    /// the format's real invariant is that the root's own block is never
    /// passed here, enforced by the `AssertionFailed` guard below.
    pub fn deallocate(
        &self,
        image: &MappedImage,
        locks: &BlockLockTable,
        journal: &Journal,
        header: &mut Header,
        i: u64,
    ) -> EResult<()> {
        transaction(journal, image, action::DEALLOCATE_BLOCK, [i, 0, 0, 0, 0], || {
            if i == 0 {
                return Err(CfsError::AssertionFailed("deallocate(0)"));
            }
            self.bitmap.set(image, locks, journal, header, i, false)
        })
    }

    /// Age every allocated block, then release the oldest half (by age)
    /// of CoW-redundancy blocks so the allocator can retry.
    fn oom_reclaim(
        &self,
        image: &MappedImage,
        locks: &BlockLockTable,
        journal: &Journal,
        header: &mut Header,
    ) -> EResult<()> {
        let n = self.bitmap.data_blocks();
        let mut oldest = 0u8;
        for i in 0..n {
            if self.bitmap.get(image, locks, header, i)? {
                self.attributes.update(image, locks, journal, i, |a| a.age_inc());
                let attr = self.attributes.get(image, locks, i);
                if attr.block_type() == BlockType::CowRedundancy {
                    oldest = oldest.max(attr.age());
                }
            }
        }
        let threshold = oldest / 2;
        for i in 0..n {
            if !self.bitmap.get(image, locks, header, i)? {
                continue;
            }
            let attr = self.attributes.get(image, locks, i);
            if attr.block_type() == BlockType::CowRedundancy && attr.age() >= threshold {
                self.deallocate(image, locks, journal, header, i)?;
            }
        }
        Ok(())
    }

    /// Recompute `allocated_non_cow_blocks` (I5) by scanning the live
    /// bitmap/attribute table. Called after operations that change block
    /// ownership in bulk (CoW, snapshot create/rollback/delete).
    pub fn recompute_allocated_non_cow(
        &self,
        image: &MappedImage,
        locks: &BlockLockTable,
        header: &Header,
    ) -> EResult<u64> {
        let n = self.bitmap.data_blocks();
        let mut count = 0u64;
        for i in 0..n {
            if self.bitmap.get(image, locks, header, i)? {
                if self.attributes.get(image, locks, i).block_type() != BlockType::CowRedundancy {
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{BlockStatus, StaticInfo, MAGIC};
    use tempfile::NamedTempFile;

    fn fresh(data_blocks: u64, block_size: u64) -> (MappedImage, BlockLockTable, Header, Journal, AllocationBitmap, AttributeTable) {
        let bmp_span = (crate::bitmap::bytes_for_bits(data_blocks) + block_size - 1) / block_size;
        let attr_span = (data_blocks * 4 + block_size - 1) / block_size;
        let journal_span = 2;
        let total_blocks = 2 + 2 * bmp_span + attr_span + data_blocks + journal_span;
        let tmp = NamedTempFile::new().unwrap();
        let image = MappedImage::create(tmp.path(), total_blocks * block_size).unwrap();
        let locks = BlockLockTable::new(total_blocks);

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
        let header = Header::format(&image, &locks, total_blocks, block_size, info).unwrap();
        let journal = Journal::new(journal_start, total_blocks - 1, block_size);
        let bitmap = AllocationBitmap::new(bitmap_start, bitmap_mirror_start, data_blocks, block_size);
        let attributes = AttributeTable::new(attr_start, data_blocks, block_size);
        (image, locks, header, journal, bitmap, attributes)
    }

    #[test]
    fn p2_concurrent_allocations_are_unique() {
        let (image, locks, mut header, journal, bitmap, attributes) = fresh(64, 512);
        let mgr = BlockManager::new(&bitmap, &attributes);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let i = mgr.allocate(&image, &locks, &journal, &mut header).unwrap();
            assert!(seen.insert(i));
            assert!(bitmap.get(&image, &locks, &header, i).unwrap());
        }
        assert!(matches!(
            mgr.allocate(&image, &locks, &journal, &mut header),
            Err(CfsError::NoMoreFreeSpaces)
        ));
    }

    #[test]
    fn p3_oom_reclaims_redundancy_blocks() {
        let (image, locks, mut header, journal, bitmap, attributes) = fresh(16, 512);
        let mgr = BlockManager::new(&bitmap, &attributes);
        for _ in 0..16 {
            let i = mgr.allocate(&image, &locks, &journal, &mut header).unwrap();
            let mut attr = BlockAttribute::new(BlockStatus::Modifiable, BlockType::CowRedundancy);
            if i % 2 == 0 {
                attr.set_age(5);
            }
            attributes.set(&image, &locks, &journal, i, attr);
        }
        // Every block is a CoW-redundancy block; OOM reclaim must free
        // at least the oldest half, so the next allocate succeeds.
        let freed = mgr.allocate(&image, &locks, &journal, &mut header).unwrap();
        assert!(bitmap.get(&image, &locks, &header, freed).unwrap());
    }
}
