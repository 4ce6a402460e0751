//! CFS: a single-file, copy-on-write filesystem core.
//!
//! This crate implements the on-disk container format, block allocator,
//! journal, inode/dentry/CoW graph and snapshot engine described by the
//! format's own design notes (see `DESIGN.md` at the workspace root for the
//! grounding ledger). It has no host-filesystem binding of its own; the
//! `cfs-fuse`, `mkfs-cfs`, `fsck-cfs` and `cfs-shell` binaries in this
//! workspace are thin callers over the [`Filesystem`] handle and the
//! [`posix`] surface this crate exposes.
//!
//! Module layout mirrors the component table: [`mapped_io`] (C1),
//! [`block_lock`] (C2), [`header`] (C3), [`journal`] (C4), [`bitmap`] (C5),
//! [`attribute`] (C6), [`allocator`] (C7), [`inode`] (C8), [`dentry`] (C9),
//! [`cow`] (C10), [`snapshot`] (C11), [`posix`] (C12).

pub mod allocator;
pub mod attribute;
pub mod bitmap;
pub mod block_lock;
pub mod compress;
pub mod cow;
pub mod debug;
pub mod dentry;
pub mod error;
pub mod format;
pub mod fs;
pub mod header;
pub mod inode;
pub mod journal;
pub mod mapped_io;
pub mod posix;
pub mod snapshot;

pub use error::{CfsError, EResult};
pub use fs::Filesystem;
