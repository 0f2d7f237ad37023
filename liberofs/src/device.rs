//! The device-read primitive and multi-device translation.
//!
//! The only I/O surface the reader requires from its host is [`ReadAt`];
//! everything else (block slicing, metadata addressing) is layered on top.

use std::fs::File;

use memmap2::Mmap;

use crate::types::{DeviceSlot, BLKSZBITS};
use crate::{Error, Result};

/// Positional read into a backing store. Short reads are allowed; callers
/// needing exact lengths go through [`read_exact_at`].
pub trait ReadAt {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

impl ReadAt for [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let offset = offset as usize;
        if offset >= self.len() {
            return Ok(0);
        }
        let n = (self.len() - offset).min(buf.len());
        buf[..n].copy_from_slice(&self[offset..offset + n]);
        Ok(n)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.as_slice().read_at(offset, buf)
    }
}

impl ReadAt for Mmap {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self[..].read_at(offset, buf)
    }
}

impl ReadAt for File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            Ok(FileExt::read_at(self, buf, offset)?)
        }
        #[cfg(not(unix))]
        {
            let _ = (offset, buf);
            Err(Error::UnsupportedFeature("file-backed images".into()))
        }
    }
}

impl<T: ReadAt + ?Sized> ReadAt for &T {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        (**self).read_at(offset, buf)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Box<T> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        (**self).read_at(offset, buf)
    }
}

/// Fill `out` from `reader` at `offset`, treating a short read as a
/// truncated image.
pub(crate) fn read_exact_at<R: ReadAt + ?Sized>(
    reader: &R,
    offset: u64,
    out: &mut [u8],
) -> Result<()> {
    let mut filled = 0usize;
    while filled < out.len() {
        let read = reader.read_at(offset + filled as u64, &mut out[filled..])?;
        if read == 0 {
            return Err(Error::CorruptImage(format!(
                "unexpected end of image at byte {}",
                offset + filled as u64
            )));
        }
        filled += read;
    }
    Ok(())
}

/// Extra backing devices of a multi-device image, parsed from the on-disk
/// device table at mount time.
pub(crate) struct DeviceTable {
    /// `roundup_pow2(extra_devices + 1) - 1`; chunk indexes mask their
    /// device id with this before lookup.
    pub(crate) id_mask: u16,
    pub(crate) slots: Vec<DeviceSlot>,
}

impl DeviceTable {
    pub(crate) fn empty() -> Self {
        Self {
            id_mask: 0,
            slots: Vec::new(),
        }
    }

    pub(crate) fn new(slots: Vec<DeviceSlot>) -> Self {
        let id_mask = ((slots.len() as u32 + 1).next_power_of_two() - 1) as u16;
        Self { id_mask, slots }
    }

    /// Translate a (device id, physical byte address) pair to the device the
    /// bytes actually live on, subtracting that device's mapped base.
    ///
    /// A zero id with extra devices present means the address is in the
    /// unified mapped space and the owning device is found by range.
    pub(crate) fn map(&self, device_id: u16, pa: u64) -> Result<(u16, u64)> {
        if device_id != 0 {
            let slot = self.slots.get(device_id as usize - 1).ok_or_else(|| {
                Error::CorruptImage(format!("extent on unknown device {device_id}"))
            })?;
            let rebased = pa
                .checked_sub((slot.mapped_blkaddr as u64) << BLKSZBITS)
                .ok_or_else(|| {
                    Error::CorruptImage(format!(
                        "extent below mapped base of device {device_id}"
                    ))
                })?;
            return Ok((device_id, rebased));
        }
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.mapped_blkaddr == 0 {
                continue;
            }
            let start = (slot.mapped_blkaddr as u64) << BLKSZBITS;
            let end = (slot.mapped_blkaddr as u64 + slot.blocks as u64) << BLKSZBITS;
            if pa >= start && pa < end {
                return Ok((i as u16 + 1, pa - start));
            }
        }
        Ok((0, pa))
    }
}
