//! fsh: interactive shell for capsulefs containers
//!
//! Mounts one container at a time and exposes the operations as a small
//! command vocabulary (`put`, `get`, `ls`, `mkdir`, `verify`, ...).

use capsulefs::{human_size, EntryInfo, EntryKind, FsError, Session};
use chrono::{Local, TimeZone};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fsh")]
#[command(version = capsulefs::VERSION)]
#[command(about = "Shell for capsulefs container files")]
struct Args {
    /// Container file to mount at startup
    container: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let args = Args::parse();

    let mut session: Option<Session> = match &args.container {
        Some(path) => {
            let s = Session::mount(path)?;
            info!(path = %path.display(), "mounted");
            Some(s)
        }
        None => None,
    };

    println!("fsh {} ('help' lists commands, 'quit' exits)", capsulefs::VERSION);

    let stdin = io::stdin();
    loop {
        match &session {
            Some(s) => print!("{}:{}> ", container_name(s.path()), s.pwd()),
            None => print!("(no container)> "),
        }
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((&cmd, rest)) = parts.split_first() else {
            continue;
        };

        if cmd == "quit" || cmd == "exit" {
            break;
        }
        if let Err(e) = dispatch(cmd, rest, &mut session) {
            eprintln!("error: {}", e);
        }
    }

    if let Some(s) = session {
        s.unmount()?;
        println!("unmounted");
    }
    Ok(())
}

fn dispatch(cmd: &str, args: &[&str], session: &mut Option<Session>) -> Result<(), FsError> {
    match cmd {
        "help" => {
            print_help();
            Ok(())
        }
        "create" => cmd_create(args, session),
        "mount" => cmd_mount(args, session),
        "unmount" => cmd_unmount(session),
        _ => {
            let s = session
                .as_mut()
                .ok_or_else(|| FsError::Config("no container mounted".into()))?;
            dispatch_mounted(cmd, args, s)
        }
    }
}

fn dispatch_mounted(cmd: &str, args: &[&str], s: &mut Session) -> Result<(), FsError> {
    match cmd {
        "ls" => {
            let entries = s.list(args.first().copied())?;
            for info in &entries {
                print_entry(info);
            }
            println!("{} entries", entries.len());
            Ok(())
        }
        "cd" => {
            let path = args
                .first()
                .ok_or_else(|| FsError::Config("usage: cd <path>".into()))?;
            let new = s.cd(path)?;
            println!("{}", new);
            Ok(())
        }
        "pwd" => {
            println!("{}", s.pwd());
            Ok(())
        }
        "mkdir" => {
            let path = args
                .first()
                .ok_or_else(|| FsError::Config("usage: mkdir <path>".into()))?;
            s.mkdir(path)
        }
        "rmdir" => match args {
            ["-r", path] => s.rmdir(path, true),
            [path] => s.rmdir(path, false),
            _ => Err(FsError::Config("usage: rmdir [-r] <path>".into())),
        },
        "put" => {
            let host = args
                .first()
                .ok_or_else(|| FsError::Config("usage: put <host-file> [dest]".into()))?;
            let dest = args.get(1).copied().unwrap_or("");
            let info = s.copy_in(Path::new(host), dest)?;
            println!(
                "{} ({}, {} blocks) sha256={}",
                info.path,
                human_size(info.size),
                info.blocks,
                info.content_hash.as_deref().unwrap_or("-")
            );
            Ok(())
        }
        "get" => match args {
            [src, host] => s.copy_out(src, Path::new(host), true),
            [src, host, "--no-verify"] => s.copy_out(src, Path::new(host), false),
            _ => Err(FsError::Config(
                "usage: get <path> <host-file> [--no-verify]".into(),
            )),
        },
        "rm" => {
            let path = args
                .first()
                .ok_or_else(|| FsError::Config("usage: rm <path>".into()))?;
            s.remove(path)
        }
        "mv" => match args {
            [src, target] => s.rename(src, target),
            _ => Err(FsError::Config("usage: mv <path> <target>".into())),
        },
        "protect" => {
            let path = args
                .first()
                .ok_or_else(|| FsError::Config("usage: protect <path>".into()))?;
            s.protect(path, true)
        }
        "unprotect" => {
            let path = args
                .first()
                .ok_or_else(|| FsError::Config("usage: unprotect <path>".into()))?;
            s.protect(path, false)
        }
        "verify" => {
            let path = args
                .first()
                .ok_or_else(|| FsError::Config("usage: verify <path>".into()))?;
            let report = s.verify(path)?;
            if report.matches {
                println!("{}: OK ({})", report.path, report.stored);
            } else {
                println!(
                    "{}: MISMATCH\n  stored   {}\n  computed {}",
                    report.path, report.stored, report.computed
                );
            }
            Ok(())
        }
        "stat" => {
            let path = args
                .first()
                .ok_or_else(|| FsError::Config("usage: stat <path>".into()))?;
            let info = s.stat(path)?;
            println!("path:      {}", info.path);
            println!(
                "type:      {}",
                match info.kind {
                    EntryKind::File => "file",
                    EntryKind::Directory => "directory",
                }
            );
            println!("size:      {} ({} bytes)", human_size(info.size), info.size);
            println!("blocks:    {}", info.blocks);
            println!("created:   {}", format_ts(info.created_at));
            println!("modified:  {}", format_ts(info.modified_at));
            println!("protected: {}", info.protected);
            if let Some(hash) = &info.content_hash {
                println!("sha256:    {}", hash);
            }
            Ok(())
        }
        "fatmap" => {
            let map = s.chain_map()?;
            for (path, blocks) in &map {
                let rendered: Vec<String> = blocks.iter().map(|b| b.to_string()).collect();
                println!("{}: {}", path, rendered.join(" -> "));
            }
            if map.is_empty() {
                println!("no allocated chains");
            }
            Ok(())
        }
        "df" => {
            let space = s.space();
            println!(
                "total:    {} ({} blocks of {})",
                human_size(space.total_bytes),
                space.total_blocks,
                human_size(space.block_size as u64)
            );
            println!("reserved: {}", human_size(space.reserved_bytes));
            println!(
                "used:     {} blocks ({})",
                space.used_blocks,
                human_size(space.used_blocks * space.block_size as u64)
            );
            println!(
                "free:     {} blocks ({})",
                space.free_blocks,
                human_size(space.free_bytes)
            );
            Ok(())
        }
        _ => Err(FsError::Config(format!(
            "unknown command {:?}, try 'help'",
            cmd
        ))),
    }
}

fn cmd_create(args: &[&str], session: &mut Option<Session>) -> Result<(), FsError> {
    let (path, size, block) = match args {
        [path, size, block] => (path, size, block),
        [path, size] => (path, size, &"4096"),
        _ => {
            return Err(FsError::Config(
                "usage: create <path> <size> [block-size]  (sizes accept K/M/G suffixes)".into(),
            ))
        }
    };
    if session.is_some() {
        return Err(FsError::Config("unmount the current container first".into()));
    }

    let total_size = parse_size(size)?;
    let block_size = parse_size(block)? as u32;
    let s = Session::create(Path::new(path), total_size, block_size, false)?;
    println!(
        "created {} ({}, {} blocks of {})",
        path,
        human_size(total_size),
        s.header().total_blocks,
        human_size(block_size as u64)
    );
    *session = Some(s);
    Ok(())
}

fn cmd_mount(args: &[&str], session: &mut Option<Session>) -> Result<(), FsError> {
    let path = args
        .first()
        .ok_or_else(|| FsError::Config("usage: mount <path>".into()))?;
    if session.is_some() {
        return Err(FsError::Config("unmount the current container first".into()));
    }
    let s = Session::mount(Path::new(path))?;
    println!(
        "mounted {} ({} free of {} blocks)",
        path,
        s.header().free_blocks,
        s.header().total_blocks
    );
    *session = Some(s);
    Ok(())
}

fn cmd_unmount(session: &mut Option<Session>) -> Result<(), FsError> {
    match session.take() {
        Some(s) => {
            s.unmount()?;
            println!("unmounted");
            Ok(())
        }
        None => Err(FsError::Config("no container mounted".into())),
    }
}

fn print_entry(info: &EntryInfo) {
    let marker = match info.kind {
        EntryKind::Directory => "d",
        EntryKind::File => "-",
    };
    let prot = if info.protected { "p" } else { "-" };
    println!(
        "{}{} {:>10}  {}  {}",
        marker,
        prot,
        human_size(info.size),
        format_ts(info.modified_at),
        info.name
    );
}

fn format_ts(secs: u64) -> String {
    match Local.timestamp_opt(secs as i64, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".to_string(),
    }
}

/// Parse a size like "512", "64K", "16M", "2G"
fn parse_size(text: &str) -> Result<u64, FsError> {
    let text = text.trim();
    let (digits, multiplier) = match text.chars().last() {
        Some('K') | Some('k') => (&text[..text.len() - 1], 1024u64),
        Some('M') | Some('m') => (&text[..text.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&text[..text.len() - 1], 1024 * 1024 * 1024),
        _ => (text, 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| FsError::Config(format!("invalid size {:?}", text)))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| FsError::Config(format!("size {:?} overflows", text)))
}

fn container_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn print_help() {
    println!("container:");
    println!("  create <path> <size> [block-size]   create and mount a new container");
    println!("  mount <path>                        mount an existing container");
    println!("  unmount                             flush and release the container");
    println!("files:");
    println!("  put <host-file> [dest]              copy a host file in");
    println!("  get <path> <host-file> [--no-verify] copy a file out (verified by default)");
    println!("  rm <path>                           remove a file");
    println!("  mv <path> <target>                  rename or move");
    println!("  verify <path>                       recompute and compare the digest");
    println!("  protect <path> / unprotect <path>   toggle write protection");
    println!("directories:");
    println!("  ls [path]  cd <path>  pwd  mkdir <path>  rmdir [-r] <path>");
    println!("info:");
    println!("  stat <path>  df  fatmap  help  quit");
}
