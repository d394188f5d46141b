#![forbid(unsafe_code)]
//! `raonfs` — inspect raonfs images from the command line.

use anyhow::{Context, Result, bail};
use raonfs_block::{BlockDevice, FileByteDevice, ReadCache};
use raonfs_core::{InodeHandle, Mount};
use raonfs_ondisk::FileType;
use std::env;
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    if command == "-h" || command == "--help" {
        print_usage();
        return Ok(());
    }

    let Some(image) = args.next() else {
        print_usage();
        bail!("{command} requires an image path");
    };
    let rest: Vec<String> = args.collect();
    let json = rest.iter().any(|a| a == "--json");
    let cache_blocks = flag_value(&rest, "--cache")?
        .map(|raw| {
            raw.parse::<NonZeroUsize>()
                .context("--cache requires a positive block count")
        })
        .transpose()?;

    let mount = open_mount(Path::new(&image), cache_blocks)?;

    match command.as_str() {
        "inspect" => inspect(&mount, json),
        "stat" => {
            let path = positional(&rest).context("stat requires a path inside the image")?;
            stat(&mount, path, json)
        }
        "ls" => {
            let path = positional(&rest).unwrap_or("/");
            ls(&mount, path)
        }
        "cat" => {
            let path = positional(&rest).context("cat requires a path inside the image")?;
            cat(&mount, path)
        }
        "names" => {
            let path = positional(&rest).unwrap_or("/");
            names(&mount, path)
        }
        other => {
            print_usage();
            bail!("unknown command: {other}");
        }
    }
}

fn print_usage() {
    println!("usage: raonfs <command> <image> [args] [--json] [--cache <blocks>]");
    println!();
    println!("commands:");
    println!("  inspect <image>          superblock summary");
    println!("  stat    <image> <path>   inode attributes");
    println!("  ls      <image> [path]   directory listing (defaults to /)");
    println!("  cat     <image> <path>   file content to stdout");
    println!("  names   <image> [path]   directory name-text region tokens");
}

/// First non-flag argument, if any.
fn positional(rest: &[String]) -> Option<&str> {
    let mut iter = rest.iter();
    while let Some(arg) = iter.next() {
        if arg == "--cache" {
            let _ = iter.next();
            continue;
        }
        if !arg.starts_with("--") {
            return Some(arg.as_str());
        }
    }
    None
}

/// Value of `--flag <value>`, if present.
fn flag_value<'a>(rest: &'a [String], flag: &str) -> Result<Option<&'a str>> {
    let mut iter = rest.iter();
    while let Some(arg) = iter.next() {
        if arg == flag {
            return match iter.next() {
                Some(value) => Ok(Some(value.as_str())),
                None => bail!("{flag} requires a value"),
            };
        }
    }
    Ok(None)
}

fn open_mount(path: &Path, cache_blocks: Option<NonZeroUsize>) -> Result<Mount> {
    let dev = FileByteDevice::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let dev: Arc<dyn raonfs_block::ByteDevice> = Arc::new(dev);

    let mount = match cache_blocks {
        Some(capacity) => Mount::from_device_wrapped(dev, &move |inner| {
            Arc::new(ReadCache::new(inner, capacity)) as Arc<dyn BlockDevice>
        }),
        None => Mount::from_device(dev),
    };
    mount.with_context(|| format!("mounting {}", path.display()))
}

fn inspect(mount: &Mount, json: bool) -> Result<()> {
    let sb = mount.superblock();
    if json {
        println!("{}", serde_json::to_string_pretty(sb)?);
        return Ok(());
    }
    println!("name:        {}", sb.fs_name);
    println!("block size:  {}", sb.block_size);
    println!("total size:  {} bytes", sb.fs_size);
    println!("root inode:  offset {}", sb.root_offset);
    Ok(())
}

fn lookup(mount: &Mount, path: &str) -> Result<InodeHandle> {
    mount
        .resolve_path(path)
        .with_context(|| format!("resolving {path}"))
}

fn stat(mount: &Mount, path: &str, json: bool) -> Result<()> {
    let handle = lookup(mount, path)?;
    let attr = mount.stat(&handle);
    if json {
        println!("{}", serde_json::to_string_pretty(&attr)?);
        return Ok(());
    }
    println!("path:   {path}");
    println!("offset: {}", handle.offset);
    println!("type:   {}", type_char(attr.file_type));
    println!("size:   {}", attr.size);
    println!("mode:   {:04o}", attr.mode & 0o7777);
    println!("owner:  {}:{}", attr.uid, attr.gid);
    println!("times:  ctime={} mtime={} atime={}", attr.ctime, attr.mtime, attr.atime);
    if matches!(attr.file_type, FileType::CharDev | FileType::BlockDev) {
        println!("rdev:   {:#x}", attr.rdev);
    }
    Ok(())
}

fn ls(mount: &Mount, path: &str) -> Result<()> {
    let dir = lookup(mount, path)?;
    for entry in mount.read_dir(&dir)? {
        let entry = entry?;
        let child = mount.read_inode(entry.inode_offset)?;
        println!(
            "{} {:>10}  {}",
            type_char(entry.file_type),
            child.inode.size,
            entry.name_str()
        );
    }
    Ok(())
}

fn cat(mount: &Mount, path: &str) -> Result<()> {
    let file = lookup(mount, path)?;
    let size = usize::try_from(file.inode.size).context("file size exceeds memory")?;
    let content = mount.read_file(&file, 0, size)?;
    std::io::stdout().write_all(&content)?;
    Ok(())
}

fn names(mount: &Mount, path: &str) -> Result<()> {
    let dir = lookup(mount, path)?;
    for token in mount.name_tokens(&dir)? {
        println!("{}", String::from_utf8_lossy(&token));
    }
    Ok(())
}

fn type_char(file_type: FileType) -> char {
    match file_type {
        FileType::Dir => 'd',
        FileType::Reg => '-',
        FileType::Symlink => 'l',
        FileType::BlockDev => 'b',
        FileType::CharDev => 'c',
        FileType::Fifo => 'p',
        FileType::Socket => 's',
        FileType::Unknown => '?',
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raonfs_mkfs::ImageBuilder;
    use std::io::Write as _;

    fn fixture() -> tempfile::NamedTempFile {
        let mut b = ImageBuilder::new(1024).expect("builder");
        let root = b.root();
        b.fs_name("cli-fixture");
        let etc = b.add_dir(root, "etc").expect("etc");
        b.add_file(etc, "hostname", b"raon\n".to_vec()).expect("hostname");
        let image = b.build().expect("build");

        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(&image).expect("write");
        tmp.flush().expect("flush");
        tmp
    }

    #[test]
    fn open_mount_without_cache() {
        let tmp = fixture();
        let mount = open_mount(tmp.path(), None).expect("mount");
        assert_eq!(mount.superblock().fs_name, "cli-fixture");
    }

    #[test]
    fn open_mount_with_cache_reads_identically() {
        let tmp = fixture();
        let plain = open_mount(tmp.path(), None).expect("mount");
        let cached = open_mount(tmp.path(), NonZeroUsize::new(8)).expect("mount");

        let a = plain.resolve_path("/etc/hostname").expect("resolve");
        let b = cached.resolve_path("/etc/hostname").expect("resolve");
        assert_eq!(a.offset, b.offset);
        assert_eq!(
            plain.read_file(&a, 0, 100).expect("read"),
            cached.read_file(&b, 0, 100).expect("read")
        );
    }

    #[test]
    fn positional_skips_flags() {
        let rest = vec![
            "--cache".to_owned(),
            "16".to_owned(),
            "/etc".to_owned(),
            "--json".to_owned(),
        ];
        assert_eq!(positional(&rest), Some("/etc"));
        assert_eq!(flag_value(&rest, "--cache").expect("ok"), Some("16"));
        assert_eq!(flag_value(&rest, "--missing").expect("ok"), None);
    }
}
