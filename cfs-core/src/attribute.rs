//! Block attribute table (C6).
//!
//! 4 bytes per data-space block, packed into `block_size`-byte pages.
//! `get`/`set` lock only the page containing the requested record;
//! sub-field helpers do read-modify-write of the whole packed `u32` under
//! that same page lock so two concurrent field updates on the same block
//! can't race each other.

use crate::block_lock::BlockLockTable;
use crate::format::BlockAttribute;
use crate::journal::{action, Journal};
use crate::mapped_io::MappedImage;

const RECORD_SIZE: u64 = 4;

pub struct AttributeTable {
    table_start: u64, // block index
    data_blocks: u64,
    block_size: u64,
}

impl AttributeTable {
    pub fn new(table_start: u64, data_blocks: u64, block_size: u64) -> Self {
        Self { table_start, data_blocks, block_size }
    }

    fn page_and_offset(&self, i: u64) -> (u64, usize) {
        let byte = i * RECORD_SIZE;
        let page = byte / self.block_size;
        let off = (byte % self.block_size) as usize;
        (page, off)
    }

    pub fn get(&self, image: &MappedImage, locks: &BlockLockTable, i: u64) -> BlockAttribute {
        debug_assert!(i < self.data_blocks);
        let (page, off) = self.page_and_offset(i);
        let guard = locks.lock(image, self.table_start + page, self.block_size);
        let bytes = &guard.bytes(0)[off..off + 4];
        BlockAttribute(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Overwrite the full record, journaling old and new packed values.
    pub fn set(&self, image: &MappedImage, locks: &BlockLockTable, journal: &Journal, i: u64, attr: BlockAttribute) {
        debug_assert!(i < self.data_blocks);
        let (page, off) = self.page_and_offset(i);
        let guard = locks.lock(image, self.table_start + page, self.block_size);
        let old = u32::from_le_bytes(guard.bytes(0)[off..off + 4].try_into().unwrap());
        guard.bytes_mut(0)[off..off + 4].copy_from_slice(&attr.0.to_le_bytes());
        drop(guard);
        journal.push_action(
            image,
            action::ATTRIBUTE_MODIFICATION + action::ATTEMPT,
            [old as u64, attr.0 as u64, i, 0, 0],
        );
        journal.push_action(
            image,
            action::ATTRIBUTE_MODIFICATION + action::COMPLETED,
            [old as u64, attr.0 as u64, i, 0, 0],
        );
    }

    /// Read-modify-write a single record under one page lock acquisition,
    /// the `get<field>`/`set<field>` convenience the format describes.
    pub fn update(
        &self,
        image: &MappedImage,
        locks: &BlockLockTable,
        journal: &Journal,
        i: u64,
        f: impl FnOnce(&mut BlockAttribute),
    ) {
        let mut attr = self.get(image, locks, i);
        f(&mut attr);
        self.set(image, locks, journal, i, attr);
    }

    pub fn data_blocks(&self) -> u64 {
        self.data_blocks
    }

    /// Snapshot of every packed record, in data-space order; used for
    /// `debug cat attribute` and for embedding an attribute-table snapshot
    /// into a root-CoW tail.
    pub fn dump(&self, image: &MappedImage, locks: &BlockLockTable) -> Vec<BlockAttribute> {
        (0..self.data_blocks).map(|i| self.get(image, locks, i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{BlockStatus, BlockType};
    use tempfile::NamedTempFile;

    fn fresh(data_blocks: u64, block_size: u64) -> (MappedImage, BlockLockTable, AttributeTable, Journal, u64) {
        let span = (data_blocks * RECORD_SIZE + block_size - 1) / block_size;
        let total_blocks = span + 2;
        let tmp = NamedTempFile::new().unwrap();
        let image = MappedImage::create(tmp.path(), total_blocks * block_size).unwrap();
        let locks = BlockLockTable::new(total_blocks);
        let journal = Journal::new(span, total_blocks, block_size);
        (image, locks, AttributeTable::new(0, data_blocks, block_size), journal, total_blocks)
    }

    #[test]
    fn get_set_roundtrips_and_move_to_cow_shadows() {
        let (image, locks, table, journal, _total) = fresh(1024, 512);
        let mut attr = BlockAttribute::new(BlockStatus::Modifiable, BlockType::Storage);
        attr.set_refcount(3);
        table.set(&image, &locks, &journal, 5, attr);
        let got = table.get(&image, &locks, 5);
        assert_eq!(got.status(), BlockStatus::Modifiable);
        assert_eq!(got.block_type(), BlockType::Storage);
        assert_eq!(got.refcount(), 3);

        table.update(&image, &locks, &journal, 5, |a| a.move_type_to_cow(BlockType::CowRedundancy));
        let got = table.get(&image, &locks, 5);
        assert_eq!(got.block_type(), BlockType::CowRedundancy);
        assert_eq!(got.block_type_cow(), BlockType::Storage);
    }
}
