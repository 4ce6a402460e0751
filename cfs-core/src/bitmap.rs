//! Mirrored allocation bitmap (C5).
//!
//! Two identical on-disk bitmaps cover the data space, one bit per
//! data-space block index. An in-memory cache absorbs repeat reads; a
//! cache miss locks both mirror pages, and if they disagree the whole
//! bitmap span is locked and the mirror whose CRC-64 matches the header's
//! recorded checksum is copied over the other (I1).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::block_lock::BlockLockTable;
use crate::error::{CfsError, EResult};
use crate::format::crc64;
use crate::header::Header;
use crate::journal::{action, Journal};
use crate::mapped_io::MappedImage;

/// Cap on cached bit entries before the bottom half (by access count) is
/// evicted, per spec ("capped at 16 Mi entries").
const CACHE_CAP: usize = 16 * 1024 * 1024;

/// Read bit `i` out of a raw bitmap byte buffer. Free function so the
/// snapshot engine can apply the same bit semantics to an embedded bitmap
/// copy without going through a live `AllocationBitmap`.
pub fn bit_get(bytes: &[u8], i: u64) -> bool {
    let byte = (i / 8) as usize;
    let bit = (i % 8) as u32;
    byte < bytes.len() && (bytes[byte] >> bit) & 1 != 0
}

pub fn bit_set(bytes: &mut [u8], i: u64, v: bool) {
    let byte = (i / 8) as usize;
    let bit = (i % 8) as u32;
    if v {
        bytes[byte] |= 1 << bit;
    } else {
        bytes[byte] &= !(1 << bit);
    }
}

pub fn bytes_for_bits(n: u64) -> u64 {
    (n + 7) / 8
}

struct CacheEntry {
    value: bool,
    accesses: u64,
}

pub struct AllocationBitmap {
    primary_start: u64, // block index
    mirror_start: u64,
    data_blocks: u64,
    block_size: u64,
    cache: Mutex<HashMap<u64, CacheEntry>>,
}

impl AllocationBitmap {
    pub fn new(primary_start: u64, mirror_start: u64, data_blocks: u64, block_size: u64) -> Self {
        Self {
            primary_start,
            mirror_start,
            data_blocks,
            block_size,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn page_and_offset(&self, region_start_block: u64, i: u64) -> (u64, u64) {
        let byte = i / 8;
        let page = byte / self.block_size;
        let off = region_start_block * self.block_size + page * self.block_size + (byte % self.block_size);
        (page, off)
    }

    fn region_span_blocks(&self) -> u64 {
        (bytes_for_bits(self.data_blocks) + self.block_size - 1) / self.block_size
    }

    fn cache_get(&self, i: u64) -> Option<bool> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(e) = cache.get_mut(&i) {
            e.accesses += 1;
            return Some(e.value);
        }
        None
    }

    fn cache_put(&self, i: u64, value: bool) {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(i, CacheEntry { value, accesses: 1 });
        if cache.len() > CACHE_CAP {
            let mut by_access: Vec<(u64, u64)> = cache.iter().map(|(k, e)| (*k, e.accesses)).collect();
            by_access.sort_by_key(|(_, a)| *a);
            let evict = by_access.len() / 2;
            for (k, _) in by_access.into_iter().take(evict) {
                cache.remove(&k);
            }
            for e in cache.values_mut() {
                e.accesses = 0;
            }
        }
    }

    /// Read bit `i`, consulting the cache first and repairing the mirrors
    /// on disagreement (I1).
    pub fn get(&self, image: &MappedImage, locks: &BlockLockTable, header: &Header, i: u64) -> EResult<bool> {
        if let Some(v) = self.cache_get(i) {
            return Ok(v);
        }
        let (p_page, p_off) = self.page_and_offset(self.primary_start, i);
        let (m_page, m_off) = self.page_and_offset(self.mirror_start, i);
        let bit = (i % 8) as u32;

        let p_guard = locks.lock(image, self.primary_start + p_page, self.block_size);
        let m_guard = locks.lock(image, self.mirror_start + m_page, self.block_size);
        let p_byte_off = (p_off % self.block_size) as usize;
        let m_byte_off = (m_off % self.block_size) as usize;
        let p_val = (p_guard.bytes(0)[p_byte_off] >> bit) & 1 != 0;
        let m_val = (m_guard.bytes(0)[m_byte_off] >> bit) & 1 != 0;
        drop(p_guard);
        drop(m_guard);

        if p_val == m_val {
            self.cache_put(i, p_val);
            return Ok(p_val);
        }

        let winner = self.repair(image, locks, header)?;
        self.cache_put(i, bit_get(&winner, i));
        Ok(bit_get(&winner, i))
    }

    /// Lock the whole bitmap span, recompute both mirrors' CRC-64 against
    /// the header's recorded value and overwrite the loser. Returns the
    /// winning bitmap's raw bytes.
    fn repair(&self, image: &MappedImage, locks: &BlockLockTable, header: &Header) -> EResult<Vec<u8>> {
        let span = self.region_span_blocks();
        let guard = locks.lock_range(image, self.primary_start, self.primary_start + span, self.block_size);
        let mirror_guard = locks.lock_range(image, self.mirror_start, self.mirror_start + span, self.block_size);

        let total_bytes = bytes_for_bits(self.data_blocks) as usize;
        let mut primary = Vec::with_capacity(total_bytes);
        for n in 0..guard.indices().len() {
            primary.extend_from_slice(guard.bytes(n));
        }
        primary.truncate(total_bytes);
        let mut mirror = Vec::with_capacity(total_bytes);
        for n in 0..mirror_guard.indices().len() {
            mirror.extend_from_slice(mirror_guard.bytes(n));
        }
        mirror.truncate(total_bytes);

        let expected = header.runtime(image).allocation_bitmap_checksum;
        let primary_ok = crc64(&primary) == expected;
        let mirror_ok = crc64(&mirror) == expected;

        let winner = if primary_ok {
            primary
        } else if mirror_ok {
            mirror
        } else {
            return Err(CfsError::BitmapUnrecoverable);
        };

        for n in 0..guard.indices().len() {
            let start = n * self.block_size as usize;
            let end = (start + self.block_size as usize).min(winner.len());
            if start < winner.len() {
                guard.bytes_mut(n)[..end - start].copy_from_slice(&winner[start..end]);
            }
        }
        for n in 0..mirror_guard.indices().len() {
            let start = n * self.block_size as usize;
            let end = (start + self.block_size as usize).min(winner.len());
            if start < winner.len() {
                mirror_guard.bytes_mut(n)[..end - start].copy_from_slice(&winner[start..end]);
            }
        }
        Ok(winner)
    }

    /// Flip bit `i` to `value`, journaling the change and updating both
    /// mirrors plus the header's bitmap checksum.
    pub fn set(
        &self,
        image: &MappedImage,
        locks: &BlockLockTable,
        journal: &Journal,
        header: &mut Header,
        i: u64,
        value: bool,
    ) -> EResult<()> {
        let from = self.get(image, locks, header, i)? as u64;
        let to = value as u64;
        journal.push_action(image, action::BITMAP_MODIFICATION + action::ATTEMPT, [from, to, i, 0, 0]);

        let (p_page, p_off) = self.page_and_offset(self.primary_start, i);
        let (m_page, m_off) = self.page_and_offset(self.mirror_start, i);
        {
            let p_guard = locks.lock(image, self.primary_start + p_page, self.block_size);
            let m_guard = locks.lock(image, self.mirror_start + m_page, self.block_size);
            let p_byte_off = (p_off % self.block_size) as usize;
            let m_byte_off = (m_off % self.block_size) as usize;
            let mut p_byte = p_guard.bytes(0)[p_byte_off];
            let mut m_byte = m_guard.bytes(0)[m_byte_off];
            let bit = (i % 8) as u32;
            if value {
                p_byte |= 1 << bit;
                m_byte |= 1 << bit;
            } else {
                p_byte &= !(1 << bit);
                m_byte &= !(1 << bit);
            }
            p_guard.bytes_mut(0)[p_byte_off] = p_byte;
            m_guard.bytes_mut(0)[m_byte_off] = m_byte;
        }
        self.cache_put(i, value);

        let new_checksum = self.checksum(image, locks);
        header.update_runtime(image, locks, |r| r.allocation_bitmap_checksum = new_checksum);

        journal.push_action(image, action::BITMAP_MODIFICATION + action::COMPLETED, [from, to, i, 0, 0]);
        Ok(())
    }

    /// CRC-64 of the whole primary bitmap, as recorded in the header.
    pub fn checksum(&self, image: &MappedImage, locks: &BlockLockTable) -> u64 {
        let span = self.region_span_blocks();
        let guard = locks.lock_range(image, self.primary_start, self.primary_start + span, self.block_size);
        let total_bytes = bytes_for_bits(self.data_blocks) as usize;
        let mut buf = Vec::with_capacity(total_bytes);
        for n in 0..guard.indices().len() {
            buf.extend_from_slice(guard.bytes(n));
        }
        buf.truncate(total_bytes);
        crc64(&buf)
    }

    /// Snapshot of every bit, in data-space order; used for `debug cat
    /// bitmap` and for embedding a per-snapshot bitmap into a root-CoW
    /// tail.
    pub fn dump(&self, image: &MappedImage, locks: &BlockLockTable) -> Vec<bool> {
        let span = self.region_span_blocks();
        let guard = locks.lock_range(image, self.primary_start, self.primary_start + span, self.block_size);
        let mut buf = Vec::new();
        for n in 0..guard.indices().len() {
            buf.extend_from_slice(guard.bytes(n));
        }
        (0..self.data_blocks).map(|i| bit_get(&buf, i)).collect()
    }

    pub fn data_blocks(&self) -> u64 {
        self.data_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::StaticInfo;
    use tempfile::NamedTempFile;

    fn fresh(data_blocks: u64, block_size: u64) -> (MappedImage, BlockLockTable, Header, AllocationBitmap) {
        let span = (bytes_for_bits(data_blocks) + block_size - 1) / block_size;
        let total_blocks = 2 + 2 * span + 4;
        let tmp = NamedTempFile::new().unwrap();
        let image = MappedImage::create(tmp.path(), total_blocks * block_size).unwrap();
        let locks = BlockLockTable::new(total_blocks);
        let info = StaticInfo {
            magic: crate::format::MAGIC,
            label: [0; 32],
            block_size,
            total_blocks,
            bitmap_start: 1,
            bitmap_end: 1 + span,
            bitmap_mirror_start: 1 + span,
            bitmap_mirror_end: 1 + 2 * span,
            attr_start: 1 + 2 * span,
            attr_end: 1 + 2 * span + 1,
            data_start: 1 + 2 * span + 1,
            data_end: 1 + 2 * span + 1 + data_blocks,
            journal_start: total_blocks - 1,
            journal_end: total_blocks,
        };
        let header = Header::format(&image, &locks, total_blocks, block_size, info).unwrap();
        let bitmap = AllocationBitmap::new(1, 1 + span, data_blocks, block_size);
        (image, locks, header, bitmap)
    }

    #[test]
    fn p1_bitmap_roundtrip() {
        let (image, locks, header, bitmap) = fresh(4096, 512);
        let journal = Journal::new(0, 1, 512);
        let mut header = header;
        for i in [0u64, 1, 63, 64, 4095] {
            assert!(!bitmap.get(&image, &locks, &header, i).unwrap());
            bitmap.set(&image, &locks, &journal, &mut header, i, true).unwrap();
            assert!(bitmap.get(&image, &locks, &header, i).unwrap());
            bitmap.set(&image, &locks, &journal, &mut header, i, false).unwrap();
            assert!(!bitmap.get(&image, &locks, &header, i).unwrap());
        }
    }

    #[test]
    fn mirror_mismatch_is_repaired_from_checksum_match() {
        let (image, locks, mut header, bitmap) = fresh(4096, 512);
        let journal = Journal::new(0, 1, 512);
        bitmap.set(&image, &locks, &journal, &mut header, 10, true).unwrap();

        // Corrupt the mirror only.
        let (_, m_off) = bitmap.page_and_offset(bitmap.mirror_start, 10);
        unsafe {
            let byte = image.slice_mut(m_off, 1);
            byte[0] ^= 0xFF;
        }

        assert!(bitmap.get(&image, &locks, &header, 10).unwrap());
    }
}
