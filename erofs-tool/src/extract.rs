use std::fs::{create_dir_all, File, Permissions};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use tracing::{debug, warn};

use crate::image::ImageArgs;

#[derive(Args, Debug)]
pub struct ExtractArgs {
    #[command(flatten)]
    image: ImageArgs,

    /// Directory inside the image to extract.
    #[clap(long, default_value = "/")]
    path: String,

    /// Destination directory.
    out: PathBuf,
}

pub fn extract(args: ExtractArgs) -> Result<()> {
    let fs = args.image.mount()?;
    create_dir_all(&args.out)
        .with_context(|| format!("failed to create: {}", args.out.display()))?;

    let mut count = 0usize;
    for entry in fs.walk_dir(&args.path)? {
        let entry = entry.with_context(|| "failed to read directory entry")?;
        let rel = entry
            .path()
            .strip_prefix(&args.path)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| entry.path());
        let dest = args.out.join(&rel);
        debug!(path = %entry.path().display(), "extracting");

        let file_type = entry.file_type();
        if file_type.is_dir() {
            create_dir_all(&dest)?;
        } else if file_type.is_file() {
            let inode = fs.get_inode(entry.nid())?;
            let mode = inode.mode().bits() as u32 & 0o777;
            let mut reader = fs.open_inode(inode)?;
            let mut writer = File::create(&dest)
                .with_context(|| format!("failed to create: {}", dest.display()))?;
            std::io::copy(&mut reader, &mut writer)?;
            writer.set_permissions(Permissions::from_mode(mode))?;
        } else if file_type.is_symlink() {
            let inode = fs.get_inode(entry.nid())?;
            let target = fs.readlink(&inode)?;
            symlink(&target, &dest)
                .with_context(|| format!("failed to create symlink: {}", dest.display()))?;
        } else {
            warn!(path = %entry.path().display(), "skipping special file");
            continue;
        }
        count += 1;
    }

    println!("extracted {count} entries to {}", args.out.display());
    Ok(())
}
