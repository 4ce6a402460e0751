//! `mkfs.cfs`: format a new CFS image.
//!
//! Lays out the container format (§3 of the design) over a freshly created
//! file, then creates the root inode and its (empty) directory payload so
//! the image is mountable the moment this command returns.

use std::path::PathBuf;

use anyhow::{bail, Context};
use cfs_core::format::{self, S_IFDIR};
use cfs_core::{dentry, inode, posix, Filesystem};
use clap::Parser;

/// Format a CFS image.
#[derive(Parser, Debug)]
#[command(name = "mkfs.cfs", version, about)]
struct Args {
    /// Path to the image file to create.
    #[arg(short = 'p', long = "path")]
    path: PathBuf,

    /// Volume label, truncated to 31 bytes.
    #[arg(short = 'L', long = "label", default_value = "")]
    label: String,

    /// Block size in bytes; must be a power of two and >= 512.
    #[arg(short = 'b', long = "block-size", default_value_t = 4096)]
    block_size: u64,

    /// Image size in bytes. Not part of the upstream CLI surface, but
    /// `mkfs` has to create the backing file from nothing rather than
    /// reuse an existing device's size, so this tool adds the flag every
    /// mkfs-over-a-regular-file workflow needs.
    #[arg(short = 's', long = "size", default_value_t = 64 << 20)]
    size: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if !args.block_size.is_power_of_two() || args.block_size < 512 {
        bail!("block size must be a power of two >= 512");
    }
    if args.size < cfs_core::format::MIN_IMAGE_SIZE {
        bail!("image size must be at least 1 MiB");
    }

    let (static_info, total_blocks) = format::plan_layout(args.size, args.block_size, &args.label);
    log::info!(
        "formatting {} ({} blocks of {} B, label {:?})",
        args.path.display(),
        total_blocks,
        args.block_size,
        args.label
    );

    let fs = Filesystem::format(&args.path, static_info, total_blocks * args.block_size)
        .with_context(|| format!("formatting {}", args.path.display()))?;

    let root = inode::alloc_inode(&fs, S_IFDIR | 0o755, 0, 0, 0, posix::now())
        .context("allocating root inode")?;
    let mut root_dir = dentry::DentryService::open_fresh(&fs, root, dentry::NON_ROOT_DENTRY_START);
    root_dir.flush().context("writing root directory payload")?;
    fs.set_root_ino(root);
    fs.sync().context("syncing image")?;

    println!("{}: {} blocks, {} B each, root ino {}", args.path.display(), total_blocks, args.block_size, root);
    Ok(())
}
