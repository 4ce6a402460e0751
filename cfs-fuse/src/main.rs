//! `mount.cfs`: the host-filesystem bridge (C12's only caller outside the
//! REPL). Translates FUSE's inode-number-keyed kernel VFS callbacks into
//! path-keyed `cfs_core::posix` calls.
//!
//! CFS's own inode numbers (a block's data-space index) are not stable
//! identifiers from a FUSE client's point of view: copy-on-write gives a
//! modified inode a *new* data-space index the moment it (or an ancestor)
//! needs to diverge from a frozen snapshot generation, and spec.md's own
//! design notes (§9) describe path resolution as a transient walk stack
//! rebuilt on every call rather than a cached inode graph. This bridge
//! therefore keeps its own path-keyed inode table: a FUSE `ino` is an
//! opaque handle onto a path string, and every operation re-resolves that
//! path through `cfs_core::posix` rather than trusting a stashed
//! data-space index across calls.

mod bridge;

use std::path::PathBuf;

use anyhow::Context;
use cfs_core::Filesystem;
use clap::Parser;
use fuser::MountOption;

/// Mount a CFS image through FUSE.
#[derive(Parser, Debug)]
#[command(name = "mount.cfs", version, about)]
struct Args {
    /// Path to the image file.
    #[arg(short = 'p', long = "path")]
    path: PathBuf,

    /// Mount point.
    #[arg(short = 'e', long = "mount-point")]
    mount_point: PathBuf,

    /// Extra whitespace-separated host filesystem mount options (e.g.
    /// `"-f \"allow_other ro\""`), forwarded as FUSE mount options.
    #[arg(short = 'f', long = "fs-args", default_value = "")]
    fs_args: String,
}

fn init_logging() {
    match std::env::var("LOG").as_deref() {
        Ok("stdout") => {
            env_logger::Builder::from_default_env().target(env_logger::Target::Stdout).init();
        }
        Ok("stderr") | Err(_) => env_logger::init(),
        Ok(path) => {
            if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
                env_logger::Builder::from_default_env()
                    .target(env_logger::Target::Pipe(Box::new(file)))
                    .init();
            } else {
                env_logger::init();
            }
        }
    }
}

fn parse_mount_option(token: &str) -> MountOption {
    match token {
        "ro" => MountOption::RO,
        "rw" => MountOption::RW,
        "dev" => MountOption::Dev,
        "nodev" => MountOption::NoDev,
        "suid" => MountOption::Suid,
        "nosuid" => MountOption::NoSuid,
        "exec" => MountOption::Exec,
        "noexec" => MountOption::NoExec,
        "atime" => MountOption::Atime,
        "noatime" => MountOption::NoAtime,
        "dirsync" => MountOption::DirSync,
        "sync" => MountOption::Sync,
        "async" => MountOption::Async,
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "auto_unmount" => MountOption::AutoUnmount,
        other => MountOption::CUSTOM(other.to_string()),
    }
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();

    let fs = Filesystem::mount(&args.path).with_context(|| format!("mounting {}", args.path.display()))?;

    let mut options = vec![MountOption::FSName("cfs".to_string())];
    options.extend(args.fs_args.split_whitespace().map(parse_mount_option));

    log::info!("serving {} at {}", args.path.display(), args.mount_point.display());
    fuser::mount2(bridge::Bridge::new(fs), &args.mount_point, &options)
        .with_context(|| format!("mounting FUSE session at {}", args.mount_point.display()))?;
    Ok(())
}
