//! Journal ring of typed, CRC-tagged transaction records (C4).
//!
//! The ring lives inside `[journal_start, journal_end)` blocks. The first
//! 32 B of the region hold the live `JournalHeader` (head/tail/size); the
//! last 32 B hold a shadow copy written immediately before every header
//! update so a reader that observes a torn write during the transition can
//! fall back to whichever copy is internally consistent. Everything
//! between those two fixed 32 B windows is the record ring itself, sized
//! down to the nearest power of two so `size` can wrap with a mask instead
//! of a modulo.
//!
//! Records are advisory: they exist for `fsck`/debugging and for the
//! `dump_actions` scenario tests, not for automatic crash rollback. CoW
//! already guarantees old block graphs survive a failed mutation; the
//! journal is the human- (and `fsck`-) facing account of what was
//! attempted.

use std::sync::Mutex;

use crate::error::EResult;
use crate::format::{JournalHeader, JournalRecord, JOURNAL_MAGIC};
use crate::mapped_io::MappedImage;

/// Base codes from the action taxonomy table. Each transactional action
/// occupies three consecutive codes: `base` (attempt), `base+1`
/// (`_Completed`), `base+2` (`_Failed`).
pub mod action {
    pub const CORRUPTION_DETECTED: u64 = 0x2000;
    pub const BITMAP_MODIFICATION: u64 = 0x2010;
    pub const ATTEMPTED_FIX_ASSUMED_FINE: u64 = 0x2020;
    pub const ATTRIBUTE_MODIFICATION: u64 = 0x2030;
    pub const GLOBAL_TRANSACTION: u64 = 0x3000;
    pub const ALLOCATE_BLOCK: u64 = 0x3001;
    pub const DEALLOCATE_BLOCK: u64 = 0x3004;
    pub const CREATE_REDUNDANCY: u64 = 0x3007;
    pub const WRITE_INODE: u64 = 0x300A;
    pub const SNAPSHOT_CREATION: u64 = 0x3010;
    pub const SNAPSHOT_REVERT: u64 = 0x3013;
    pub const SNAPSHOT_DELETION: u64 = 0x3016;

    pub const ATTEMPT: u64 = 0;
    pub const COMPLETED: u64 = 1;
    pub const FAILED: u64 = 2;
}

struct Region {
    start_byte: u64,
    size_bytes: u64,
    capacity: u64, // power-of-two record count
}

/// Circular log of 64 B records, single-writer under an internal mutex as
/// spec'd ("single-writer-logical ring... under an internal mutex").
pub struct Journal {
    region: Region,
    mutex: Mutex<()>,
}

const RECORD_SIZE: u64 = std::mem::size_of::<JournalRecord>() as u64;
const HEADER_WINDOW: u64 = std::mem::size_of::<JournalHeader>() as u64;

impl Journal {
    pub fn new(journal_start_block: u64, journal_end_block: u64, block_size: u64) -> Self {
        let start_byte = journal_start_block * block_size;
        let size_bytes = (journal_end_block - journal_start_block) * block_size;
        let usable = size_bytes.saturating_sub(2 * HEADER_WINDOW);
        let max_records = usable / RECORD_SIZE;
        let capacity = max_records.next_power_of_two() / 2; // largest pow2 <= max_records
        let capacity = capacity.max(1);
        Self { region: Region { start_byte, size_bytes, capacity }, mutex: Mutex::new(()) }
    }

    fn header_off(&self) -> u64 {
        self.region.start_byte
    }

    fn shadow_off(&self) -> u64 {
        self.region.start_byte + self.region.size_bytes - HEADER_WINDOW
    }

    fn records_off(&self) -> u64 {
        self.region.start_byte + HEADER_WINDOW
    }

    fn load_header(&self, image: &MappedImage) -> JournalHeader {
        let primary: JournalHeader = *bytemuck::from_bytes(image.slice(self.header_off(), HEADER_WINDOW as usize));
        if primary.magic == JOURNAL_MAGIC {
            return primary;
        }
        let shadow: JournalHeader = *bytemuck::from_bytes(image.slice(self.shadow_off(), HEADER_WINDOW as usize));
        if shadow.magic == JOURNAL_MAGIC {
            return shadow;
        }
        JournalHeader { magic: JOURNAL_MAGIC, head: 0, tail: 0, size: 0 }
    }

    fn store_header(&self, image: &MappedImage, h: &JournalHeader) {
        // Write the shadow first so a crash mid-update always leaves one
        // fully-consistent copy to recover from.
        unsafe {
            image
                .slice_mut(self.shadow_off(), HEADER_WINDOW as usize)
                .copy_from_slice(bytemuck::bytes_of(h));
            image
                .slice_mut(self.header_off(), HEADER_WINDOW as usize)
                .copy_from_slice(bytemuck::bytes_of(h));
        }
    }

    fn slot_off(&self, slot: u64) -> u64 {
        self.records_off() + (slot % self.region.capacity) * RECORD_SIZE
    }

    /// Append one record, advancing `head`; advances `tail` too once the
    /// ring is full (oldest record silently overwritten, as P4 requires).
    pub fn push_action(&self, image: &MappedImage, action_code: u64, p: [u64; 5]) {
        let _guard = self.mutex.lock().unwrap();
        let mut h = self.load_header(image);
        let rec = JournalRecord::new(action_code, p);
        let off = self.slot_off(h.head);
        unsafe {
            image.slice_mut(off, RECORD_SIZE as usize).copy_from_slice(bytemuck::bytes_of(&rec));
        }
        let was_full = h.size >= self.region.capacity;
        h.head += 1;
        if was_full {
            h.tail += 1;
        } else {
            h.size += 1;
        }
        self.store_header(image, &h);
    }

    /// All records currently in the ring, chronological (tail to head).
    /// Slots whose magic doesn't match are skipped (partial-write
    /// recovery) rather than treated as a fatal error.
    pub fn dump_actions(&self, image: &MappedImage) -> Vec<JournalRecord> {
        let _guard = self.mutex.lock().unwrap();
        let h = self.load_header(image);
        let mut out = Vec::with_capacity(h.size as usize);
        for n in 0..h.size {
            let slot = h.tail + n;
            let off = self.slot_off(slot);
            let rec: JournalRecord = *bytemuck::from_bytes(image.slice(off, RECORD_SIZE as usize));
            if rec.crc_valid() {
                out.push(rec);
            }
        }
        out
    }

    pub fn capacity(&self) -> u64 {
        self.region.capacity
    }
}

/// Runs `f`, bracketing it with the attempt/`_Completed`/`_Failed` triple
/// the format describes for a "scoped transaction writer." Implemented as
/// a closure wrapper rather than a `Drop` guard: a `Drop`-based writer
/// can't distinguish "succeeded" from "panicked mid-scope" without extra
/// bookkeeping, and every call site here already has the natural
/// success/failure signal in `f`'s `Result`.
pub fn transaction<T>(
    journal: &Journal,
    image: &MappedImage,
    base_code: u64,
    p: [u64; 5],
    f: impl FnOnce() -> EResult<T>,
) -> EResult<T> {
    journal.push_action(image, base_code + action::ATTEMPT, p);
    match f() {
        Ok(v) => {
            journal.push_action(image, base_code + action::COMPLETED, p);
            Ok(v)
        }
        Err(e) => {
            journal.push_action(image, base_code + action::FAILED, p);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::RECORD_MAGIC;
    use tempfile::NamedTempFile;

    fn fresh(blocks: u64, block_size: u64) -> (MappedImage, Journal) {
        let tmp = NamedTempFile::new().unwrap();
        let image = MappedImage::create(tmp.path(), blocks * block_size).unwrap();
        let journal = Journal::new(0, blocks, block_size);
        (image, journal)
    }

    #[test]
    fn p4_ring_keeps_last_capacity_pushes() {
        let (image, journal) = fresh(4, 512);
        let cap = journal.capacity();
        let n = cap * 3 + 7;
        for i in 0..n {
            journal.push_action(&image, action::ALLOCATE_BLOCK, [i, 0, 0, 0, 0]);
        }
        let dumped = journal.dump_actions(&image);
        assert_eq!(dumped.len() as u64, cap);
        let first_expected = n - cap;
        for (k, rec) in dumped.iter().enumerate() {
            assert_eq!(rec.p[0], first_expected + k as u64);
            assert!(rec.crc_valid());
            assert_eq!(rec.magic, RECORD_MAGIC);
        }
    }

    #[test]
    fn transaction_emits_completed_on_success_and_failed_on_error() {
        let (image, journal) = fresh(4, 512);
        transaction(&journal, &image, action::DEALLOCATE_BLOCK, [1, 0, 0, 0, 0], || Ok(())).unwrap();
        let _ = transaction::<()>(&journal, &image, action::DEALLOCATE_BLOCK, [2, 0, 0, 0, 0], || {
            Err(crate::error::CfsError::NoMoreFreeSpaces)
        });
        let dumped = journal.dump_actions(&image);
        let codes: Vec<u64> = dumped.iter().map(|r| r.action_code).collect();
        assert!(codes.contains(&(action::DEALLOCATE_BLOCK + action::ATTEMPT)));
        assert!(codes.contains(&(action::DEALLOCATE_BLOCK + action::COMPLETED)));
        assert!(codes.contains(&(action::DEALLOCATE_BLOCK + action::FAILED)));
    }
}
