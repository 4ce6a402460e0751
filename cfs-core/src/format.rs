//! On-disk binary layouts.
//!
//! Every struct here is `#[repr(C)]` and implements `bytemuck::Pod` so a
//! `&[u8]` window from the mapped image can be reinterpreted in place with
//! `bytemuck::from_bytes`/`bytemuck::cast_slice` — no serialization step, no
//! copy. Field order and widths match the wire format exactly; padding is
//! spelled out explicitly rather than left to the compiler so the layout
//! never depends on repr(C)'s platform-specific packing choices for
//! non-power-of-two runs.
//!
//! All multi-byte fields are little-endian on disk. Since every supported
//! host is little-endian already (cross-machine byte-order portability is
//! an explicit non-goal), the in-memory representation equals the on-disk
//! one; no byte-swapping layer exists.

use bytemuck::{Pod, Zeroable};

/// `0xCFADBEEF20251216`, read back from every header copy before anything
/// else is trusted.
pub const MAGIC: u64 = 0xCFAD_BEEF_2025_1216;

/// Journal ring magic, distinct from the header magic so a misread offset
/// can't be confused for a valid journal.
pub const JOURNAL_MAGIC: u64 = 0x434653_4A4E4C00;

/// Per-record magic stamped into every 64 B journal record.
pub const RECORD_MAGIC: u64 = 0x5246_4353_4A524E;

/// Minimum image size, enforced by C1.
pub const MIN_IMAGE_SIZE: u64 = 1 << 20;

/// Header occupies exactly one block at the head and one at the tail of the
/// image; within that block only the first 512 B are meaningful.
pub const HEADER_SIZE: usize = 512;

/// Stat structure embedded in every inode block.
pub const STAT_SIZE: usize = 120;

// ---------------------------------------------------------------------
// Static info (immutable after mkfs) and its CRC-tagged envelope
// ---------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct StaticInfo {
    pub magic: u64,
    pub label: [u8; 32],
    pub block_size: u64,
    pub total_blocks: u64,
    pub bitmap_start: u64,
    pub bitmap_end: u64,
    pub bitmap_mirror_start: u64,
    pub bitmap_mirror_end: u64,
    pub attr_start: u64,
    pub attr_end: u64,
    pub data_start: u64,
    pub data_end: u64,
    pub journal_start: u64,
    pub journal_end: u64,
}

impl StaticInfo {
    pub fn crc(&self) -> u64 {
        crate::format::crc64(bytemuck::bytes_of(self))
    }
}

/// One of the two on-disk copies of `StaticInfo`, each carrying two CRC-64
/// tags of itself (recomputed independently on load so a single flipped
/// byte in the CRC field doesn't mask a real mismatch and vice versa).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct StaticInfoCopy {
    pub info: StaticInfo,
    pub crc_a: u64,
    pub crc_b: u64,
}

impl StaticInfoCopy {
    pub fn new(info: StaticInfo) -> Self {
        let crc = info.crc();
        Self { info, crc_a: crc, crc_b: crc }
    }

    /// Both tags present and matching the recomputed CRC of `info`.
    pub fn verified(&self) -> bool {
        let crc = self.info.crc();
        self.crc_a == crc && self.crc_b == crc
    }
}

// ---------------------------------------------------------------------
// Runtime info (mutated on every mount / commit)
// ---------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct RuntimeInfo {
    pub mount_ts: i64,
    pub last_check_ts: i64,
    pub clean: u8,
    pub _pad: [u8; 7],
    pub last_allocated_block: u64,
    pub allocated_non_cow_blocks: u64,
    pub root_inode_pointer: u64,
    /// CRC-64 of the primary allocation bitmap as of the last verified
    /// write; used by C5 to pick the surviving mirror on mismatch.
    pub allocation_bitmap_checksum: u64,
}

// ---------------------------------------------------------------------
// Full header block
// ---------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct CfsHead {
    pub magic: u64,
    pub static_copies: [StaticInfoCopy; 2],
    pub runtime: RuntimeInfo,
    /// Previous `runtime` value, updated atomically alongside `runtime` so a
    /// reader observing a torn write during a power loss can fall back to a
    /// value that is still internally consistent.
    pub runtime_cow: RuntimeInfo,
    pub _reserved: [u8; HEADER_SIZE
        - 8
        - 2 * std::mem::size_of::<StaticInfoCopy>()
        - 2 * std::mem::size_of::<RuntimeInfo>()],
}

const _: () = assert!(std::mem::size_of::<CfsHead>() == HEADER_SIZE);

// ---------------------------------------------------------------------
// Block attribute (32 bits packed)
// ---------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockStatus {
    Modifiable = 0,
    SnapshotEntry = 1,
    SnapshotFrozen = 2,
}

impl TryFrom<u8> for BlockStatus {
    type Error = ();

    fn try_from(v: u8) -> Result<Self, ()> {
        match v {
            0 => Ok(BlockStatus::Modifiable),
            1 => Ok(BlockStatus::SnapshotEntry),
            2 => Ok(BlockStatus::SnapshotFrozen),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockType {
    CowRedundancy = 0,
    Index = 1,
    Pointer = 2,
    Storage = 3,
}

impl TryFrom<u8> for BlockType {
    type Error = ();

    fn try_from(v: u8) -> Result<Self, ()> {
        match v {
            0 => Ok(BlockType::CowRedundancy),
            1 => Ok(BlockType::Index),
            2 => Ok(BlockType::Pointer),
            3 => Ok(BlockType::Storage),
            _ => Err(()),
        }
    }
}

/// 32-bit packed per-block attribute record.
///
/// Layout (LSB first): `status`(2) `block_type`(2) `block_type_cow`(2)
/// `age`(4) `newly_allocated_no_cow`(1) `refcount`(16) `checksum`(5).
///
/// The format note describes a 17-bit reference count and a 33-bit total;
/// that doesn't fit 32 bits, so the count is carried here as 16 bits
/// (65535 simultaneous referencing snapshots is not a real limit) to land
/// on a true `u32`. See `DESIGN.md`.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct BlockAttribute(pub u32);

impl BlockAttribute {
    const STATUS_SHIFT: u32 = 0;
    const TYPE_SHIFT: u32 = 2;
    const TYPE_COW_SHIFT: u32 = 4;
    const AGE_SHIFT: u32 = 6;
    const NO_COW_SHIFT: u32 = 10;
    const REFCOUNT_SHIFT: u32 = 11;
    const CHECKSUM_SHIFT: u32 = 27;

    const STATUS_MASK: u32 = 0b11;
    const TYPE_MASK: u32 = 0b11;
    const AGE_MASK: u32 = 0b1111;
    const REFCOUNT_MASK: u32 = 0xFFFF;
    const CHECKSUM_MASK: u32 = 0b1_1111;

    pub fn new(status: BlockStatus, block_type: BlockType) -> Self {
        let mut a = BlockAttribute(0);
        a.set_status(status);
        a.set_block_type(block_type);
        a
    }

    pub fn status(&self) -> BlockStatus {
        BlockStatus::try_from(((self.0 >> Self::STATUS_SHIFT) & Self::STATUS_MASK) as u8)
            .unwrap_or(BlockStatus::Modifiable)
    }

    pub fn set_status(&mut self, v: BlockStatus) {
        self.0 = (self.0 & !(Self::STATUS_MASK << Self::STATUS_SHIFT))
            | ((v as u32) << Self::STATUS_SHIFT);
    }

    pub fn block_type(&self) -> BlockType {
        BlockType::try_from(((self.0 >> Self::TYPE_SHIFT) & Self::TYPE_MASK) as u8)
            .unwrap_or(BlockType::CowRedundancy)
    }

    pub fn set_block_type(&mut self, v: BlockType) {
        self.0 = (self.0 & !(Self::TYPE_MASK << Self::TYPE_SHIFT))
            | ((v as u32) << Self::TYPE_SHIFT);
    }

    pub fn block_type_cow(&self) -> BlockType {
        BlockType::try_from(((self.0 >> Self::TYPE_COW_SHIFT) & Self::TYPE_MASK) as u8)
            .unwrap_or(BlockType::CowRedundancy)
    }

    pub fn set_block_type_cow(&mut self, v: BlockType) {
        self.0 = (self.0 & !(Self::TYPE_MASK << Self::TYPE_COW_SHIFT))
            | ((v as u32) << Self::TYPE_COW_SHIFT);
    }

    pub fn age(&self) -> u8 {
        ((self.0 >> Self::AGE_SHIFT) & Self::AGE_MASK) as u8
    }

    pub fn set_age(&mut self, v: u8) {
        let v = v.min(Self::AGE_MASK as u8);
        self.0 = (self.0 & !(Self::AGE_MASK << Self::AGE_SHIFT)) | ((v as u32) << Self::AGE_SHIFT);
    }

    /// Saturating increment, as spec'd for the OOM aging pass.
    pub fn age_inc(&mut self) {
        self.set_age(self.age().saturating_add(1));
    }

    pub fn newly_allocated_no_cow(&self) -> bool {
        (self.0 >> Self::NO_COW_SHIFT) & 1 != 0
    }

    pub fn set_newly_allocated_no_cow(&mut self, v: bool) {
        if v {
            self.0 |= 1 << Self::NO_COW_SHIFT;
        } else {
            self.0 &= !(1 << Self::NO_COW_SHIFT);
        }
    }

    pub fn refcount(&self) -> u32 {
        (self.0 >> Self::REFCOUNT_SHIFT) & Self::REFCOUNT_MASK
    }

    pub fn set_refcount(&mut self, v: u32) {
        let v = v.min(Self::REFCOUNT_MASK);
        self.0 = (self.0 & !(Self::REFCOUNT_MASK << Self::REFCOUNT_SHIFT))
            | (v << Self::REFCOUNT_SHIFT);
    }

    pub fn refcount_dec(&mut self) {
        let v = self.refcount();
        if v > 0 {
            self.set_refcount(v - 1);
        }
    }

    pub fn checksum5(&self) -> u8 {
        ((self.0 >> Self::CHECKSUM_SHIFT) & Self::CHECKSUM_MASK) as u8
    }

    pub fn set_checksum5(&mut self, v: u8) {
        let v = (v as u32) & Self::CHECKSUM_MASK;
        self.0 = (self.0 & !(Self::CHECKSUM_MASK << Self::CHECKSUM_SHIFT))
            | (v << Self::CHECKSUM_SHIFT);
    }

    /// `move<from,to>` helper from the component note: push `block_type`
    /// into the shadow field and install a new live type, used on both CoW
    /// redundancy transitions and freeze/thaw.
    pub fn move_type_to_cow(&mut self, new_type: BlockType) {
        let old = self.block_type();
        self.set_block_type_cow(old);
        self.set_block_type(new_type);
    }
}

const _: () = assert!(std::mem::size_of::<BlockAttribute>() == 4);

/// Compute the 5-bit digest the attribute table stores per block.
pub fn checksum5(body: &[u8]) -> u8 {
    let full = crc64(body);
    // fold the 64-bit CRC down into 5 bits rather than truncate, so a
    // single flipped byte anywhere in a large block still moves the digest.
    let mut v = full;
    let mut acc = 0u8;
    while v != 0 {
        acc ^= (v & 0x1F) as u8;
        v >>= 5;
    }
    acc & 0x1F
}

// ---------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct JournalHeader {
    pub magic: u64,
    pub head: u64,
    pub tail: u64,
    pub size: u64,
}

const _: () = assert!(std::mem::size_of::<JournalHeader>() == 32);

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct JournalRecord {
    pub magic: u64,
    pub crc: u64,
    pub action_code: u64,
    pub p: [u64; 5],
}

const _: () = assert!(std::mem::size_of::<JournalRecord>() == 64);

impl JournalRecord {
    pub fn new(action_code: u64, p: [u64; 5]) -> Self {
        let mut r = JournalRecord { magic: RECORD_MAGIC, crc: 0, action_code, p };
        r.crc = r.recompute_crc();
        r
    }

    fn recompute_crc(&self) -> u64 {
        let mut tmp = *self;
        tmp.crc = 0;
        crc64(bytemuck::bytes_of(&tmp))
    }

    pub fn crc_valid(&self) -> bool {
        self.magic == RECORD_MAGIC && self.crc == self.recompute_crc()
    }
}

// ---------------------------------------------------------------------
// Stat
// ---------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub _pad0: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atim: TimeSpec,
    pub mtim: TimeSpec,
    pub ctim: TimeSpec,
}

const _: () = assert!(std::mem::size_of::<Stat>() == STAT_SIZE);

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFBLK: u32 = 0o060000;

impl Stat {
    pub fn file_type_bits(&self) -> u32 {
        self.mode & S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type_bits() == S_IFDIR
    }

    pub fn is_reg(&self) -> bool {
        self.file_type_bits() == S_IFREG
    }

    pub fn is_lnk(&self) -> bool {
        self.file_type_bits() == S_IFLNK
    }
}

/// CRC-64/XZ, used for every "CRC-64" in the format (header fields, bitmap
/// checksum, journal record CRC). The format doesn't name a polynomial;
/// XZ is the variant most Rust crates implement, so it's used uniformly.
pub fn crc64(data: &[u8]) -> u64 {
    const ALGO: crc::Crc<u64> = crc::Crc::<u64>::new(&crc::CRC_64_XZ);
    ALGO.checksum(data)
}

/// Lay out a fresh image of `image_bytes` total size with the given
/// `block_size`, returning the `StaticInfo` `mkfs.cfs` hands to
/// `Filesystem::format` and the image's total block count. Region order
/// follows §3's address map exactly: header, primary bitmap, mirror
/// bitmap, attribute table, data, journal, tail header. The data region is
/// sized to consume whatever remains once every fixed-ratio region is
/// accounted for, then all regions before it are independently pinned to
/// the block count that ratio implies.
pub fn plan_layout(image_bytes: u64, block_size: u64, label: &str) -> (StaticInfo, u64) {
    assert!(block_size >= 512 && block_size.is_power_of_two());
    let total_blocks = image_bytes / block_size;
    // Reserve head + tail header blocks and a minimal journal up front,
    // then solve for the data region size that makes the bitmap/attribute
    // regions (which are themselves sized off the data region) consistent.
    // Since bitmap/attribute costs are tiny fractions of data_blocks, solve
    // iteratively: a handful of fixed-point passes converge immediately
    // because each pass only perturbs region sizes by the ceil-rounding
    // remainder of the previous guess.
    let journal_span = (total_blocks / 64).max(8);
    let mut data_blocks = total_blocks.saturating_sub(2 + journal_span);
    for _ in 0..4 {
        let bmp_span = (bytes_for_bits(data_blocks) + block_size - 1) / block_size;
        let attr_span = (data_blocks * 4 + block_size - 1) / block_size;
        let overhead = 2 + 2 * bmp_span + attr_span + journal_span;
        data_blocks = total_blocks.saturating_sub(overhead);
    }
    let bmp_span = (bytes_for_bits(data_blocks) + block_size - 1) / block_size;
    let attr_span = (data_blocks * 4 + block_size - 1) / block_size;

    let bitmap_start = 1;
    let bitmap_mirror_start = bitmap_start + bmp_span;
    let attr_start = bitmap_mirror_start + bmp_span;
    let data_start = attr_start + attr_span;
    let journal_start = data_start + data_blocks;
    let journal_end = journal_start + journal_span;

    let mut label_bytes = [0u8; 32];
    let src = label.as_bytes();
    let n = src.len().min(31);
    label_bytes[..n].copy_from_slice(&src[..n]);

    let info = StaticInfo {
        magic: MAGIC,
        label: label_bytes,
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
        journal_end,
    };
    (info, total_blocks)
}

/// Bit-packed bits needed for `bytes_for_bits` to be usable from this
/// module without a circular `pub use` back into `bitmap`.
fn bytes_for_bits(n: u64) -> u64 {
    (n + 7) / 8
}
