use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use liberofs::Filesystem;
use memmap2::Mmap;

#[derive(Args, Debug)]
pub struct ImageArgs {
    /// Path to the EROFS image.
    image: PathBuf,

    /// Backing file for an extra device of a multi-device image; repeat in
    /// device-table order.
    #[clap(long = "device")]
    devices: Vec<PathBuf>,
}

impl ImageArgs {
    pub fn mount(&self) -> Result<Filesystem<Mmap>> {
        let map = map_file(&self.image)?;
        let mut fs = Filesystem::mount(map)
            .with_context(|| format!("failed to mount image: {}", self.image.display()))?;
        for (i, path) in self.devices.iter().enumerate() {
            let map = map_file(path)?;
            fs.attach_device(i as u16 + 1, Box::new(map))?;
        }
        Ok(fs)
    }
}

fn map_file(path: &PathBuf) -> Result<Mmap> {
    let file =
        File::open(path).with_context(|| format!("failed to open: {}", path.display()))?;
    let map = unsafe { Mmap::map(&file) }?;
    Ok(map)
}
