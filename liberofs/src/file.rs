//! Regular-file read handle.

use std::io::{self, Read, Seek, SeekFrom};

use bytes::Bytes;

use crate::device::ReadAt;
use crate::filesystem::Filesystem;
use crate::types::{Inode, BLOCK_SIZE};
use crate::Result;

/// A file opened for reading.
///
/// Carries a one-block cache so the small sequential reads typical of
/// `std::io::Read` consumers do not decode the same extent repeatedly.
pub struct File<'a, R: ReadAt> {
    fs: &'a Filesystem<R>,
    inode: Inode,
    offset: u64,
    cache: Bytes,
    cache_start: u64,
}

impl<'a, R: ReadAt> File<'a, R> {
    pub(crate) fn new(inode: Inode, fs: &'a Filesystem<R>) -> Self {
        Self {
            fs,
            inode,
            offset: 0,
            cache: Bytes::new(),
            cache_start: 0,
        }
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    pub fn size(&self) -> u64 {
        self.inode.data_size()
    }

    /// Positional read that bypasses the handle's cursor and cache.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.fs.pread(&self.inode, buf, offset)
    }

    fn cached_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let cache_end = self.cache_start + self.cache.len() as u64;
        if self.offset >= self.cache_start && self.offset < cache_end {
            let at = (self.offset - self.cache_start) as usize;
            let n = (self.cache.len() - at).min(buf.len());
            buf[..n].copy_from_slice(&self.cache[at..at + n]);
            return Ok(n);
        }
        if buf.len() >= BLOCK_SIZE {
            return self.fs.pread(&self.inode, buf, self.offset);
        }
        let mut block = vec![0u8; BLOCK_SIZE];
        let n = self.fs.pread(&self.inode, &mut block, self.offset)?;
        if n == 0 {
            return Ok(0);
        }
        block.truncate(n);
        self.cache = Bytes::from(block);
        self.cache_start = self.offset;
        let n = n.min(buf.len());
        buf[..n].copy_from_slice(&self.cache[..n]);
        Ok(n)
    }
}

impl<R: ReadAt> Read for File<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.cached_read(buf).map_err(io::Error::other)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl<R: ReadAt> Seek for File<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let offset = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.size().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.offset.checked_add_signed(delta),
        };
        match offset {
            Some(offset) => {
                self.offset = offset;
                Ok(offset)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the file",
            )),
        }
    }
}
