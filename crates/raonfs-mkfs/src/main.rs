#![forbid(unsafe_code)]
//! `mkraonfs` — pack a host directory tree into a raonfs image.

use anyhow::{Context, Result, bail};
use raonfs_mkfs::{ImageBuilder, NodeId};
use std::env;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut source = PathBuf::from(".");
    let mut target: Option<PathBuf> = None;
    let mut block_size = 4096_u32;
    let mut name = "RAON-FS".to_owned();

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-s" | "--source" => {
                source = PathBuf::from(args.next().context("--source requires a path")?);
            }
            "-t" | "--target" => {
                target = Some(PathBuf::from(args.next().context("--target requires a path")?));
            }
            "-b" | "--blocksize" => {
                block_size = args
                    .next()
                    .context("--blocksize requires a value")?
                    .parse()
                    .context("--blocksize must be an integer")?;
            }
            "-n" | "--name" => {
                name = args.next().context("--name requires a value")?;
            }
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            other => bail!("unknown argument: {other}"),
        }
    }

    let Some(target) = target else {
        print_usage();
        bail!("--target is required");
    };

    let mut builder = ImageBuilder::new(block_size)
        .with_context(|| format!("unusable block size {block_size}"))?;
    builder.fs_name(name);

    let root = builder.root();
    stamp_metadata(&mut builder, root, &source)?;
    pack_dir(&mut builder, root, &source)?;

    let image = builder.build().context("image layout failed")?;
    fs::write(&target, &image)
        .with_context(|| format!("writing image to {}", target.display()))?;

    println!(
        "packed {} into {} ({} bytes, block size {})",
        source.display(),
        target.display(),
        image.len(),
        block_size
    );
    Ok(())
}

fn print_usage() {
    println!("usage: mkraonfs -t <image> [-s <source-dir>] [-b <blocksize>] [-n <fs-name>]");
}

/// Copy mode bits, ownership, and timestamps from the host entry.
fn stamp_metadata(builder: &mut ImageBuilder, node: NodeId, path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path)
        .with_context(|| format!("reading metadata of {}", path.display()))?;
    builder.set_perm(node, clamp_u16(meta.mode()));
    builder.set_owner(node, clamp_u16(meta.uid()), clamp_u16(meta.gid()));
    builder.set_times(
        node,
        clamp_u32(meta.ctime()),
        clamp_u32(meta.mtime()),
        clamp_u32(meta.atime()),
    );
    Ok(())
}

fn clamp_u16(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

fn clamp_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn pack_dir(builder: &mut ImageBuilder, dir: NodeId, path: &Path) -> Result<()> {
    let entries =
        fs::read_dir(path).with_context(|| format!("listing {}", path.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("listing {}", path.display()))?;
        let child_path = entry.path();
        let name = entry.file_name();
        let name_bytes = name.as_encoded_bytes();
        let meta = fs::symlink_metadata(&child_path)
            .with_context(|| format!("reading metadata of {}", child_path.display()))?;
        let file_type = meta.file_type();

        let node = if file_type.is_symlink() {
            let link_target = fs::read_link(&child_path)
                .with_context(|| format!("reading link {}", child_path.display()))?;
            builder
                .add_symlink(dir, name_bytes, link_target.as_os_str().as_encoded_bytes())
                .with_context(|| format!("adding symlink {}", child_path.display()))?
        } else if file_type.is_dir() {
            let sub = builder
                .add_dir(dir, name_bytes)
                .with_context(|| format!("adding directory {}", child_path.display()))?;
            pack_dir(builder, sub, &child_path)?;
            sub
        } else if file_type.is_file() {
            let content = fs::read(&child_path)
                .with_context(|| format!("reading {}", child_path.display()))?;
            builder
                .add_file(dir, name_bytes, content)
                .with_context(|| format!("adding file {}", child_path.display()))?
        } else {
            let rdev = u32::try_from(meta.rdev()).unwrap_or(u32::MAX);
            if file_type.is_char_device() {
                builder.add_char_dev(dir, name_bytes, rdev)?
            } else if file_type.is_block_device() {
                builder.add_block_dev(dir, name_bytes, rdev)?
            } else if file_type.is_fifo() {
                builder.add_fifo(dir, name_bytes)?
            } else if file_type.is_socket() {
                builder.add_socket(dir, name_bytes)?
            } else {
                continue;
            }
        };

        stamp_metadata(builder, node, &child_path)?;
    }
    Ok(())
}
