//! CoW engine (C10): per-inode redirect, child→parent propagation up to
//! the root, and the root-CoW that embeds a bitmap+attribute-table
//! snapshot into the root's own body.
//!
//! Every mutating POSIX call resolves its target through
//! [`ensure_modifiable`] before touching inode content. Propagation is
//! bottom-up: the target dumps itself, asks its (already-modifiable)
//! parent to adopt a fresh copy, and the parent recurses to its own
//! parent first if it isn't modifiable yet. The recursion bottoms out
//! either at a block already flagged `newly_allocated_no_cow` (this
//! generation's private copy — propagation stops, nothing to do) or at
//! the root, which has no parent and instead redirects through
//! `root_cow`.

use crate::compress::compress;
use crate::dentry::DentryService;
use crate::error::{CfsError, EResult};
use crate::format::{BlockAttribute, BlockStatus, BlockType, STAT_SIZE};
use crate::fs::Filesystem;
use crate::inode;
use std::sync::atomic::Ordering;

/// One level of the path-resolution walk stack: the directory inode a
/// child was found in, and the name it was found under. Built by C12
/// while descending from root to the operation's target; consumed here
/// while propagating a CoW back up.
#[derive(Clone)]
pub struct ParentFrame {
    pub dir_ino: u64,
    pub name: String,
}

const DENTRY_MAGIC_BYTES: [u8; 8] = 0x4446_4353_4D41_50u64.to_le_bytes();

/// Ensure `ino` is modifiable, propagating the CoW redirect up through
/// `chain` (root-first, closest-parent-last) as needed. Returns the
/// (possibly new) data-space index to use from here on; `chain`'s
/// entries are updated in place so a caller holding the same Vec across
/// several operations stays consistent.
pub fn ensure_modifiable(fs: &Filesystem, chain: &mut [ParentFrame], ino: u64) -> EResult<u64> {
    let attr = fs.attributes.get(&fs.image, &fs.locks, ino);
    if attr.status() == BlockStatus::Modifiable && attr.newly_allocated_no_cow() {
        return Ok(ino);
    }
    if chain.is_empty() {
        return root_cow(fs);
    }

    let content = dump_inode_block(fs, ino);
    let parent_local_idx = chain.len() - 1;
    let parent_ino = chain[parent_local_idx].dir_ino;
    let new_parent_ino = ensure_modifiable(fs, &mut chain[..parent_local_idx], parent_ino)?;
    chain[parent_local_idx].dir_ino = new_parent_ino;

    let name = chain[parent_local_idx].name.clone();
    let new_ino = cow_invoked_from_child(fs, new_parent_ino, &name, ino, &content)?;

    if new_ino != ino {
        demote_old_block(fs, ino);
        inode::set_stat(fs, new_ino, |s| s.ino = new_ino);
    }
    Ok(new_ino)
}

/// The demotion half of a CoW redirect (C10 step 3): a block that a
/// generation is walking away from either becomes reclaimable
/// CoW-redundancy (if it was this generation's own private, modifiable
/// copy) or simply loses one reference (if it is still frozen and owned
/// by an older snapshot too). Shared by the generic per-inode redirect and
/// by root-CoW, which both demote their "old" block the same way.
fn demote_old_block(fs: &Filesystem, old_blk: u64) {
    let attr = fs.attributes.get(&fs.image, &fs.locks, old_blk);
    if attr.status() == BlockStatus::Modifiable {
        fs.attributes.update(&fs.image, &fs.locks, &fs.journal, old_blk, |a| a.move_type_to_cow(BlockType::CowRedundancy));
    } else {
        fs.attributes.update(&fs.image, &fs.locks, &fs.journal, old_blk, |a| a.refcount_dec());
    }
}

/// Dump an inode block verbatim (its full `block_size` bytes).
fn dump_inode_block(fs: &Filesystem, ino: u64) -> Vec<u8> {
    let g = fs.locks.lock(&fs.image, fs.abs_block(ino), fs.block_size);
    g.bytes(0).to_vec()
}

/// Parent-side half of a child CoW: allocate a fresh child block, adopt
/// the dumped content, replace the dentry entry, and persist. The parent
/// must already be modifiable (the caller guarantees this).
fn cow_invoked_from_child(fs: &Filesystem, parent_ino: u64, name: &str, old_child_ino: u64, content: &[u8]) -> EResult<u64> {
    let mgr = fs.block_manager();
    let new_ino = {
        let mut header = fs.header.lock().unwrap();
        mgr.allocate(&fs.image, &fs.locks, &fs.journal, &mut header)?
    };
    {
        let g = fs.locks.lock(&fs.image, fs.abs_block(new_ino), fs.block_size);
        g.bytes_mut(0).copy_from_slice(content);
    }
    let mut attr = BlockAttribute::new(BlockStatus::Modifiable, BlockType::Index);
    attr.set_newly_allocated_no_cow(true);
    fs.attributes.set(&fs.image, &fs.locks, &fs.journal, new_ino, attr);

    let mut dir = DentryService::open(fs, parent_ino)?;
    dir.entries_mut().insert(name.to_string(), new_ino);
    dir.flush()?;
    Ok(new_ino)
}

/// Root-CoW: allocate a new root inode, copy the current root verbatim,
/// then overwrite its body with a fresh root-metadata tail (compressed
/// bitmap+stat digest, raw attribute-table snapshot, raw bitmap
/// snapshot, compressed dentry map) so the new generation carries its
/// own point-in-time bitmap/attribute image. Skipped entirely when
/// `no_pointer_and_storage_cow` is set (test/maintenance mode).
pub fn root_cow(fs: &Filesystem) -> EResult<u64> {
    let old_root = fs.root_ino();
    if fs.no_pointer_and_storage_cow.load(Ordering::SeqCst) {
        return Ok(old_root);
    }

    let old_stat = inode::stat(fs, old_root);
    let old_dir = DentryService::open(fs, old_root)?;
    let entries: std::collections::HashMap<String, u64> = old_dir.ls().into_iter().collect();

    let mgr = fs.block_manager();
    let new_root = {
        let mut header = fs.header.lock().unwrap();
        mgr.allocate(&fs.image, &fs.locks, &fs.journal, &mut header)?
    };
    {
        let g = fs.locks.lock(&fs.image, fs.abs_block(new_root), fs.block_size);
        g.bytes_mut(0).fill(0);
    }
    let mut attr = BlockAttribute::new(BlockStatus::Modifiable, BlockType::Index);
    attr.set_newly_allocated_no_cow(true);
    fs.attributes.set(&fs.image, &fs.locks, &fs.journal, new_root, attr);

    let mut new_stat = old_stat;
    new_stat.ino = new_root;
    inode::set_stat(fs, new_root, |s| *s = new_stat);

    let bitmap_bits = fs.bitmap.dump(&fs.image, &fs.locks);
    let attrs = fs.attributes.dump(&fs.image, &fs.locks);
    let body = build_tail(fs, old_stat.mode, old_stat.size, &bitmap_bits, &attrs, &entries);
    inode::write(fs, new_root, &body, 0)?;
    inode::resize(fs, new_root, body.len() as u64)?;

    if old_stat.ino != 0 {
        demote_old_block(fs, old_root);
    }
    fs.set_root_ino(new_root);
    Ok(new_root)
}

/// Build the `[dentry_start][compressed(bitmap‖inode_metadata)][attr
/// snapshot][bitmap snapshot]` prefix shared by the root tail and every
/// snapshot-entry tail (the format's "per-inode tail layout"). Returns
/// the prefix bytes and the `dentry_start` value (where a caller should
/// append `[magic][compressed dentry map]`). `dentry_start` depends only
/// on `data_blocks` (fixed for the filesystem's lifetime), not on the
/// size of any particular dentry payload, so it is stable across root-CoW
/// and snapshot-entry creation alike.
pub(crate) fn build_prefix(inode_mode: u32, inode_size: u64, bitmap_bits: &[bool], attrs: &[BlockAttribute]) -> (Vec<u8>, u64) {
    let bitmap_dump = pack_bits(bitmap_bits);
    let attr_dump = pack_attrs(attrs);

    let mut meta = Vec::new();
    meta.extend_from_slice(&inode_mode.to_le_bytes());
    meta.extend_from_slice(&inode_size.to_le_bytes());
    meta.extend_from_slice(&bitmap_dump);
    let compressed_meta = compress(&meta);

    let dentry_start = 8 + compressed_meta.len() as u64 + attr_dump.len() as u64 + bitmap_dump.len() as u64;

    let mut out = Vec::with_capacity(dentry_start as usize);
    out.extend_from_slice(&dentry_start.to_le_bytes());
    out.extend_from_slice(&compressed_meta);
    out.extend_from_slice(&attr_dump);
    out.extend_from_slice(&bitmap_dump);
    (out, dentry_start)
}

/// Build the complete root/entry body tail (prefix plus magic-tagged
/// compressed dentry map) from a plain `{name: ino}` map.
fn build_tail(fs: &Filesystem, inode_mode: u32, inode_size: u64, bitmap_bits: &[bool], attrs: &[BlockAttribute], entries: &std::collections::HashMap<String, u64>) -> Vec<u8> {
    let (mut out, _dentry_start) = build_prefix(inode_mode, inode_size, bitmap_bits, attrs);
    let mut flat = Vec::new();
    for (name, ino) in entries {
        flat.extend_from_slice(name.as_bytes());
        flat.push(0);
        flat.extend_from_slice(&ino.to_le_bytes());
    }
    out.extend_from_slice(&DENTRY_MAGIC_BYTES);
    out.extend_from_slice(&compress(&flat));
    out
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; crate::bitmap::bytes_for_bits(bits.len() as u64) as usize];
    for (i, &b) in bits.iter().enumerate() {
        if b {
            crate::bitmap::bit_set(&mut out, i as u64, true);
        }
    }
    out
}

fn pack_attrs(attrs: &[BlockAttribute]) -> Vec<u8> {
    let mut out = Vec::with_capacity(attrs.len() * 4);
    for a in attrs {
        out.extend_from_slice(&a.0.to_le_bytes());
    }
    out
}

pub const ROOT_METADATA_FIELD_LEN: usize = STAT_SIZE;

/// Read back the bitmap/attribute-table snapshot embedded in a root or
/// snapshot-entry's own tail, used by the snapshot-deletion generation
/// timeline (the live root uses the in-memory bitmap/attributes directly
/// instead — this is only for entries and any non-live root copy).
pub(crate) fn read_embedded_snapshot(fs: &Filesystem, ino: u64) -> EResult<(Vec<bool>, Vec<BlockAttribute>)> {
    let st = inode::stat(fs, ino);
    let mut head8 = [0u8; 8];
    inode::read(fs, ino, &mut head8, 0)?;
    let dentry_start = u64::from_le_bytes(head8);
    let attr_len = fs.attributes.data_blocks() * 4;
    let bitmap_len = crate::bitmap::bytes_for_bits(fs.bitmap.data_blocks());
    if st.size < dentry_start || dentry_start < 8 + attr_len + bitmap_len {
        return Err(CfsError::AssertionFailed("malformed snapshot tail"));
    }
    let bitmap_off = dentry_start - bitmap_len;
    let attr_off = bitmap_off - attr_len;
    let mut bitmap_raw = vec![0u8; bitmap_len as usize];
    inode::read(fs, ino, &mut bitmap_raw, bitmap_off)?;
    let mut attr_raw = vec![0u8; attr_len as usize];
    inode::read(fs, ino, &mut attr_raw, attr_off)?;
    let bits = (0..fs.bitmap.data_blocks()).map(|i| crate::bitmap::bit_get(&bitmap_raw, i)).collect();
    let attrs = attr_raw.chunks_exact(4).map(|c| BlockAttribute(u32::from_le_bytes(c.try_into().unwrap()))).collect();
    Ok((bits, attrs))
}

/// Rewrite `ino`'s tail in place with a fresh bitmap/attribute snapshot,
/// keeping its current dentry map contents (read back via `DentryService`
/// first). Used by snapshot creation to overlay the post-freeze bitmap
/// once the entry's own dentry map has been stripped of stale entries.
pub(crate) fn overlay_tail(fs: &Filesystem, ino: u64, bitmap_bits: &[bool], attrs: &[BlockAttribute]) -> EResult<()> {
    let entries: std::collections::HashMap<String, u64> = DentryService::open(fs, ino)?.ls().into_iter().collect();
    overlay_tail_with_entries(fs, ino, bitmap_bits, attrs, &entries)
}

/// As [`overlay_tail`], but with the dentry map supplied by the caller
/// instead of re-read from disk — used once the snapshot engine has
/// already stripped stale entries out of an in-memory copy of the map and
/// wants that exact set written, not whatever is still on disk.
pub(crate) fn overlay_tail_with_entries(
    fs: &Filesystem,
    ino: u64,
    bitmap_bits: &[bool],
    attrs: &[BlockAttribute],
    entries: &std::collections::HashMap<String, u64>,
) -> EResult<()> {
    let st = inode::stat(fs, ino);
    let body = build_tail(fs, st.mode, st.size, bitmap_bits, attrs, entries);
    inode::write(fs, ino, &body, 0)?;
    inode::resize(fs, ino, body.len() as u64)
}

/// The allocation bitmap as of "now", with every CoW-redundancy block
/// stripped — the format's definition of a per-snapshot bitmap (§3
/// "Per-snapshot bitmap").
pub(crate) fn per_snapshot_bitmap(fs: &Filesystem, attrs: &[BlockAttribute]) -> Vec<bool> {
    let mut bits = fs.bitmap.dump(&fs.image, &fs.locks);
    for (i, b) in bits.iter_mut().enumerate() {
        if attrs[i].block_type() == BlockType::CowRedundancy {
            *b = false;
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tests::sample_layout;
    use crate::fs::Filesystem;
    use crate::format::{TimeSpec, S_IFDIR};
    use tempfile::NamedTempFile;

    fn fresh_with_root(data_blocks: u64, block_size: u64) -> Filesystem {
        let tmp = NamedTempFile::new().unwrap();
        let (info, total_blocks) = sample_layout(data_blocks, block_size);
        let fs = Filesystem::format(tmp.path(), info, total_blocks * block_size).unwrap();
        let now = TimeSpec { sec: 0, nsec: 0 };
        let root = inode::alloc_inode(&fs, S_IFDIR | 0o755, 0, 0, 0, now).unwrap();
        let mut dir = DentryService::open_fresh(&fs, root, crate::dentry::NON_ROOT_DENTRY_START);
        dir.flush().unwrap();
        fs.set_root_ino(root);
        fs
    }

    #[test]
    fn p6_root_cow_preserves_old_content_and_changes_index() {
        let fs = fresh_with_root(4096, 512);
        let old_root = fs.root_ino();
        // Clear the `newly_allocated_no_cow` flag to force a real redirect,
        // as a snapshot boundary would.
        fs.attributes.update(&fs.image, &fs.locks, &fs.journal, old_root, |a| a.set_newly_allocated_no_cow(false));

        let old_entries = DentryService::open(&fs, old_root).unwrap().ls();
        let new_root = root_cow(&fs).unwrap();
        assert_ne!(new_root, old_root);
        assert_eq!(fs.root_ino(), new_root);

        let old_attr = fs.attributes.get(&fs.image, &fs.locks, old_root);
        assert_eq!(old_attr.block_type(), BlockType::CowRedundancy);

        // Old block's content is untouched (still readable verbatim).
        let old_still_there = DentryService::open(&fs, old_root).unwrap().ls();
        assert_eq!(old_still_there, old_entries);
    }

    #[test]
    fn ensure_modifiable_skips_when_already_private_this_generation() {
        let fs = fresh_with_root(4096, 512);
        let root = fs.root_ino();
        let mut chain = Vec::new();
        let result = ensure_modifiable(&fs, &mut chain, root).unwrap();
        assert_eq!(result, root, "fresh block flagged newly_allocated_no_cow should not redirect");
    }
}
