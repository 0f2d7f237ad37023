use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local};
use clap::Args;
use liberofs::types::{
    Inode, SuperBlock, FEATURE_INCOMPAT_CHUNKED_FILE, FEATURE_INCOMPAT_COMPR_CFGS,
    FEATURE_INCOMPAT_DEVICE_TABLE, FEATURE_INCOMPAT_FRAGMENTS, FEATURE_INCOMPAT_XATTR_PREFIXES,
    FEATURE_INCOMPAT_ZERO_PADDING, FEATURE_INCOMPAT_ZTAILPACKING,
};
use crate::image::ImageArgs;

#[derive(Args, Debug)]
pub struct InfoArgs {
    #[command(flatten)]
    image: ImageArgs,
}

#[derive(Args, Debug)]
pub struct LsArgs {
    #[command(flatten)]
    image: ImageArgs,

    #[clap(default_value = "/")]
    path: String,
}

#[derive(Args, Debug)]
pub struct CatArgs {
    #[command(flatten)]
    image: ImageArgs,

    path: String,
}

#[derive(Args, Debug)]
pub struct StatArgs {
    #[command(flatten)]
    image: ImageArgs,

    path: String,
}

pub fn info(args: InfoArgs) -> Result<()> {
    let fs = args.image.mount()?;
    let sb = fs.super_block();

    println!("uuid:          {}", format_uuid(&sb.uuid));
    let volume = String::from_utf8_lossy(&sb.volume_name);
    let volume = volume.trim_end_matches('\0');
    if !volume.is_empty() {
        println!("volume:        {volume}");
    }
    println!(
        "blocks:        {} ({} bytes)",
        sb.blocks,
        (sb.blocks as u64) << 12
    );
    println!("inodes:        {}", sb.inos);
    println!("root nid:      {}", sb.root_nid);
    println!("meta blkaddr:  {}", sb.meta_blkaddr);
    println!(
        "build time:    {}",
        format_time(sb.build_time, sb.build_time_ns)
    );
    println!("features:      {}", format_features(sb));
    if sb.extra_devices > 0 {
        println!("extra devices: {}", sb.extra_devices);
    }
    if sb.packed_nid != 0 {
        println!("packed nid:    {}", sb.packed_nid);
    }
    Ok(())
}

pub fn ls(args: LsArgs) -> Result<()> {
    let fs = args.image.mount()?;
    let read_dir = fs
        .read_dir(&args.path)
        .with_context(|| format!("failed to read directory: {}", args.path))?;

    for entry in read_dir {
        let entry = entry.with_context(|| "failed to read directory entry")?;
        let inode = fs.get_inode(entry.nid())?;
        let (mtime, mtime_ns) = inode.mtime(fs.super_block());
        println!(
            "{} {:>8} {} {}",
            format_mode(&inode),
            format_size(inode.data_size()),
            format_time(mtime, mtime_ns),
            entry.file_name()
        );
    }
    Ok(())
}

pub fn cat(args: CatArgs) -> Result<()> {
    let fs = args.image.mount()?;
    let mut file = fs
        .open(&args.path)
        .with_context(|| format!("failed to open file: {}", args.path))?;
    std::io::copy(&mut file, &mut std::io::stdout())?;
    Ok(())
}

pub fn stat(args: StatArgs) -> Result<()> {
    let fs = args.image.mount()?;
    let inode = fs
        .ilookup(&args.path)
        .with_context(|| format!("failed to look up: {}", args.path))?;

    println!("path:    {}", args.path);
    println!("nid:     {}", inode.nid());
    println!("mode:    {} (0o{:o})", format_mode(&inode), inode.mode().bits());
    println!("size:    {}", inode.data_size());
    println!("layout:  {:?}", inode.layout()?);
    println!("uid/gid: {}/{}", inode.uid(), inode.gid());
    println!("links:   {}", inode.nlink());
    let (mtime, mtime_ns) = inode.mtime(fs.super_block());
    println!("mtime:   {}", format_time(mtime, mtime_ns));
    if inode.is_symlink() {
        println!("target:  {}", fs.readlink(&inode)?);
    }
    Ok(())
}

fn format_mode(inode: &Inode) -> String {
    let mut res = String::with_capacity(10);
    res.push(if inode.is_dir() {
        'd'
    } else if inode.is_symlink() {
        'l'
    } else {
        '-'
    });

    let masks = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'), // User
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'), // Group
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'), // Other
    ];

    let mode = inode.mode().bits();
    for (mask, char) in masks {
        if mode & mask != 0 {
            res.push(char);
        } else {
            res.push('-');
        }
    }

    res
}

fn format_size(size: u64) -> String {
    if size < 1024 {
        format!("{}B", size)
    } else if size < 1024 * 1024 {
        format!("{:.1}KiB", size as f64 / 1024.0)
    } else if size < 1024 * 1024 * 1024 {
        format!("{:.1}MiB", size as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1}GiB", size as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_time(secs: u64, nsecs: u32) -> String {
    let dt = match DateTime::from_timestamp(secs as i64, nsecs) {
        Some(dt) => dt.with_timezone(&Local),
        None => return String::new(),
    };

    let now = Local::now();
    if dt.year() == now.year() {
        dt.format("%b %e %H:%M").to_string()
    } else {
        dt.format("%b %e  %Y").to_string()
    }
}

fn format_uuid(uuid: &[u8; 16]) -> String {
    let hex: Vec<String> = uuid.iter().map(|b| format!("{b:02x}")).collect();
    let hex = hex.concat();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..]
    )
}

fn format_features(sb: &SuperBlock) -> String {
    let known = [
        (FEATURE_INCOMPAT_ZERO_PADDING, "zero-padding"),
        (FEATURE_INCOMPAT_COMPR_CFGS, "compr-cfgs"),
        (FEATURE_INCOMPAT_CHUNKED_FILE, "chunked-file"),
        (FEATURE_INCOMPAT_DEVICE_TABLE, "device-table"),
        (FEATURE_INCOMPAT_ZTAILPACKING, "ztailpacking"),
        (FEATURE_INCOMPAT_FRAGMENTS, "fragments"),
        (FEATURE_INCOMPAT_XATTR_PREFIXES, "xattr-prefixes"),
    ];
    let names: Vec<&str> = known
        .iter()
        .filter(|(bit, _)| sb.feature_incompat & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() {
        String::from("none")
    } else {
        names.join(", ")
    }
}
