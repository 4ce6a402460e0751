//! `cfs`: the interactive REPL over a mounted CFS image.
//!
//! This is the default binary (`cfs -p <image>`) from spec.md §6. It is a
//! thin line-oriented front end over `cfs_core::posix` and
//! `cfs_core::debug` — every command below maps to one or two core calls;
//! the REPL itself owns nothing but a current-working-directory string.

use std::io::{self, Write as _};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use cfs_core::{debug, posix, CfsError, Filesystem};

/// Interactive REPL over a CFS image.
#[derive(Parser, Debug)]
#[command(name = "cfs", version, about)]
struct Args {
    /// Path to the image file.
    #[arg(short = 'p', long = "path")]
    path: PathBuf,
}

/// Honor `LOG=stdout|stderr|<path>` (spec.md §6); falls back to stderr via
/// plain `env_logger::init()` when unset, same as every other binary here.
fn init_logging() {
    match std::env::var("LOG").as_deref() {
        Ok("stdout") => {
            env_logger::Builder::from_default_env().target(env_logger::Target::Stdout).init();
        }
        Ok("stderr") | Err(_) => {
            env_logger::init();
        }
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

/// Resolve a REPL argument against the current working directory: absolute
/// paths pass through unchanged, everything else is joined and normalized
/// by `cfs_core::posix::resolve`'s own component splitting (so `..` and
/// repeated slashes fall out for free).
fn resolve_arg(cwd: &str, arg: &str) -> String {
    if arg.starts_with('/') {
        arg.to_string()
    } else if cwd == "/" {
        format!("/{arg}")
    } else {
        format!("{cwd}/{arg}")
    }
}

fn columns() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| crossterm::terminal::size().ok().map(|(w, _)| w as usize))
        .unwrap_or(80)
}

fn print_columns(names: &[String]) {
    if names.is_empty() {
        return;
    }
    let width = names.iter().map(|n| n.len()).max().unwrap_or(0) + 2;
    let cols = (columns() / width).max(1);
    for chunk in names.chunks(cols) {
        let mut line = String::new();
        for name in chunk {
            line.push_str(&format!("{name:<width$}"));
        }
        println!("{}", line.trim_end());
    }
}

fn run_command(fs: &Filesystem, cwd: &mut String, line: &str) -> anyhow::Result<bool> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(&cmd) = parts.first() else { return Ok(true) };
    let args = &parts[1..];

    match cmd {
        "help" => {
            println!(
                "ls, cd, pwd, copy_from_host, copy_to_host, copy, cat, mkdir, rmdir, del, move, \
                 free, snapshot, revert, delsnapshot, sync, debug cat {{bitmap|journal|header|attribute N}}, \
                 debug check hash5, help, version, exit"
            );
        }
        "version" => println!("cfs {}", env!("CARGO_PKG_VERSION")),
        "exit" | "quit" => return Ok(false),
        "pwd" => println!("{cwd}"),
        "ls" => {
            let target = args.first().map(|a| resolve_arg(cwd, a)).unwrap_or_else(|| cwd.clone());
            let mut entries = posix::readdir(fs, &target)?;
            entries.sort();
            let names: Vec<String> = entries.into_iter().map(|(n, _)| n).collect();
            print_columns(&names);
        }
        "cd" => {
            let Some(arg) = args.first() else { bail!("usage: cd <path>") };
            let target = resolve_arg(cwd, arg);
            let st = posix::getattr(fs, &target)?;
            if !st.is_dir() {
                bail!("{target}: not a directory");
            }
            *cwd = target;
        }
        "cat" => {
            let Some(arg) = args.first() else { bail!("usage: cat <path>") };
            let target = resolve_arg(cwd, arg);
            let st = posix::getattr(fs, &target)?;
            let mut buf = vec![0u8; st.size as usize];
            posix::read(fs, &target, &mut buf, 0)?;
            io::stdout().write_all(&buf)?;
        }
        "mkdir" => {
            let Some(arg) = args.first() else { bail!("usage: mkdir <path>") };
            posix::mkdir(fs, &resolve_arg(cwd, arg), 0o755, 0, 0)?;
        }
        "rmdir" => {
            let Some(arg) = args.first() else { bail!("usage: rmdir <path>") };
            posix::rmdir(fs, &resolve_arg(cwd, arg))?;
        }
        "del" => {
            let Some(arg) = args.first() else { bail!("usage: del <path>") };
            posix::unlink(fs, &resolve_arg(cwd, arg))?;
        }
        "move" => {
            let (Some(src), Some(dst)) = (args.first(), args.get(1)) else { bail!("usage: move <src> <dst>") };
            posix::rename(fs, &resolve_arg(cwd, src), &resolve_arg(cwd, dst), 0)?;
        }
        "copy" => {
            let (Some(src), Some(dst)) = (args.first(), args.get(1)) else { bail!("usage: copy <src> <dst>") };
            let src = resolve_arg(cwd, src);
            let dst = resolve_arg(cwd, dst);
            let st = posix::getattr(fs, &src)?;
            let mut buf = vec![0u8; st.size as usize];
            posix::read(fs, &src, &mut buf, 0)?;
            posix::create(fs, &dst, 0o644, 0, 0)?;
            posix::write(fs, &dst, &buf, 0)?;
        }
        "copy_to_host" => {
            let (Some(img), Some(host)) = (args.first(), args.get(1)) else {
                bail!("usage: copy_to_host <image-path> <host-path>")
            };
            let img_path = resolve_arg(cwd, img);
            let st = posix::getattr(fs, &img_path)?;
            let mut buf = vec![0u8; st.size as usize];
            posix::read(fs, &img_path, &mut buf, 0)?;
            std::fs::write(host, &buf).with_context(|| format!("writing {host}"))?;
        }
        "copy_from_host" => {
            let (Some(host), Some(img)) = (args.first(), args.get(1)) else {
                bail!("usage: copy_from_host <host-path> <image-path>")
            };
            let img_path = resolve_arg(cwd, img);
            let buf = std::fs::read(host).with_context(|| format!("reading {host}"))?;
            if posix::getattr(fs, &img_path).is_err() {
                posix::create(fs, &img_path, 0o644, 0, 0)?;
            }
            posix::write(fs, &img_path, &buf, 0)?;
        }
        "free" => {
            let s = posix::statfs(fs);
            println!(
                "block size: {} B, total blocks: {}, free blocks: {}, available: {}",
                s.f_bsize, s.f_blocks, s.f_bfree, s.f_bavail
            );
        }
        "snapshot" => {
            let Some(name) = args.first() else { bail!("usage: snapshot <name>") };
            posix::snapshot_create(fs, name)?;
        }
        "revert" => {
            let Some(name) = args.first() else { bail!("usage: revert <name>") };
            posix::snapshot_rollback(fs, name)?;
        }
        "delsnapshot" => {
            let Some(name) = args.first() else { bail!("usage: delsnapshot <name>") };
            posix::snapshot_delete(fs, name)?;
        }
        "sync" => {
            fs.sync()?;
            println!("synced");
        }
        "debug" => run_debug(fs, args)?,
        other => println!("unknown command: {other} (try `help`)"),
    }
    Ok(true)
}

fn run_debug(fs: &Filesystem, args: &[&str]) -> anyhow::Result<()> {
    match args {
        ["cat", "bitmap"] => {
            let bits = debug::dump_bitmap(fs);
            let set: Vec<String> = bits.iter().enumerate().filter(|(_, b)| **b).map(|(i, _)| i.to_string()).collect();
            println!("allocated blocks ({}): {}", set.len(), set.join(","));
        }
        ["cat", "journal"] => {
            for rec in debug::dump_journal(fs) {
                println!("action={:#x} params={:?}", rec.action_code, rec.p);
            }
        }
        ["cat", "header"] => {
            let h = debug::dump_header(fs);
            println!("{h:#?}");
        }
        ["cat", "attribute", n] => {
            let i: u64 = n.parse().context("attribute index must be a number")?;
            let a = debug::dump_attribute(fs, i);
            println!(
                "status={:?} type={:?} age={} refcount={}",
                a.status(),
                a.block_type(),
                a.age(),
                a.refcount()
            );
        }
        ["check", "hash5"] => {
            let results = debug::check_hash5(fs);
            let bad = results.iter().filter(|(_, ok)| !ok).count();
            println!("{} block(s) checked, {bad} mismatch(es)", results.len());
        }
        _ => bail!("usage: debug cat {{bitmap|journal|header|attribute N}} | debug check hash5"),
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();
    let fs = Filesystem::mount(&args.path).with_context(|| format!("mounting {}", args.path.display()))?;

    let mut cwd = "/".to_string();
    let stdin = io::stdin();
    loop {
        print!("cfs:{cwd}> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match run_command(&fs, &mut cwd, line) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => match e.downcast_ref::<CfsError>() {
                Some(ce) => eprintln!("error: {ce}"),
                None => eprintln!("error: {e}"),
            },
        }
    }
    fs.sync()?;
    Ok(())
}
