//! Per-block mutual exclusion (C2).
//!
//! A bit-per-block exclusive-lock vector sized to the image's total block
//! count. Locks are strictly non-reentrant: a thread that already holds
//! block `i` and calls `lock(i)` again deadlocks against itself exactly as
//! the format requires (no re-entrant fast path is provided). `lock_range`
//! acquires a contiguous run in ascending index order so that any two
//! callers locking overlapping ranges converge on the same order and never
//! deadlock against each other.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

use crate::mapped_io::MappedImage;

struct Inner {
    held: HashSet<u64>,
}

/// Condition-variable-backed table of per-block locks.
pub struct BlockLockTable {
    total_blocks: u64,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl BlockLockTable {
    pub fn new(total_blocks: u64) -> Self {
        Self {
            total_blocks,
            inner: Mutex::new(Inner { held: HashSet::new() }),
            cond: Condvar::new(),
        }
    }

    /// Block until index `i` is free, then mark it held.
    fn acquire(&self, i: u64) {
        debug_assert!(i < self.total_blocks, "block index {i} out of range");
        let mut guard = self.inner.lock().unwrap();
        while guard.held.contains(&i) {
            guard = self.cond.wait(guard).unwrap();
        }
        guard.held.insert(i);
    }

    fn release(&self, i: u64) {
        let mut guard = self.inner.lock().unwrap();
        guard.held.remove(&i);
        drop(guard);
        // Any number of waiters could be parked on distinct indices; wake
        // them all and let each recheck its own bit.
        self.cond.notify_all();
    }

    /// Lock a single block and hand back a scoped byte-range view into the
    /// mapped image.
    pub fn lock<'a>(&'a self, image: &'a MappedImage, i: u64, block_size: u64) -> Guard<'a> {
        self.acquire(i);
        Guard { table: self, indices: vec![i], image, block_size }
    }

    /// Lock a contiguous ascending run `[start, end)`.
    pub fn lock_range<'a>(
        &'a self,
        image: &'a MappedImage,
        start: u64,
        end: u64,
        block_size: u64,
    ) -> Guard<'a> {
        assert!(start <= end);
        let mut indices = Vec::with_capacity((end - start) as usize);
        for i in start..end {
            self.acquire(i);
            indices.push(i);
        }
        Guard { table: self, indices, image, block_size }
    }
}

/// Move-only RAII handle over one or more locked blocks. Unlocks every
/// index it holds on drop; concurrent access to the same block from two
/// guards is impossible by construction since a second `acquire` of the
/// same index blocks until this one drops.
pub struct Guard<'a> {
    table: &'a BlockLockTable,
    indices: Vec<u64>,
    image: &'a MappedImage,
    block_size: u64,
}

impl<'a> Guard<'a> {
    pub fn indices(&self) -> &[u64] {
        &self.indices
    }

    /// Byte view of the `n`th locked block (0-based within this guard).
    pub fn bytes(&self, n: usize) -> &[u8] {
        let idx = self.indices[n];
        self.image.slice(idx * self.block_size, self.block_size as usize)
    }

    /// Mutable byte view of the `n`th locked block. Safe because this
    /// guard is the sole holder of `indices[n]`.
    #[allow(clippy::mut_from_ref)]
    pub fn bytes_mut(&self, n: usize) -> &mut [u8] {
        let idx = self.indices[n];
        unsafe { self.image.slice_mut(idx * self.block_size, self.block_size as usize) }
    }
}

impl<'a> Drop for Guard<'a> {
    fn drop(&mut self) {
        for &i in &self.indices {
            self.table.release(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lock_excludes_concurrent_access() {
        let img = Arc::new(MappedImage::create(
            tempfile::NamedTempFile::new().unwrap().path(),
            1 << 20,
        ).unwrap());
        let table = Arc::new(BlockLockTable::new(16));
        let counter = Arc::new(Mutex::new(0i32));

        let mut handles = vec![];
        for _ in 0..8 {
            let img = img.clone();
            let table = table.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let _g = table.lock(&img, 3, 512);
                    let mut c = counter.lock().unwrap();
                    let before = *c;
                    *c += 1;
                    assert_eq!(*c, before + 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 400);
    }

    #[test]
    fn lock_range_is_ascending() {
        let img = MappedImage::create(
            tempfile::NamedTempFile::new().unwrap().path(),
            1 << 20,
        ).unwrap();
        let table = BlockLockTable::new(16);
        let g = table.lock_range(&img, 2, 5, 512);
        assert_eq!(g.indices(), &[2, 3, 4]);
    }
}
