//! Directory entry decoding.
//!
//! Each directory block opens with an array of fixed 12-byte dirents whose
//! names are packed at the end of the block; the first entry's name offset
//! doubles as the entry count.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::device::ReadAt;
use crate::filesystem::Filesystem;
use crate::types::{Dirent, DirentFileType, Inode, BLOCK_SIZE, MAX_NAME_LEN};
use crate::{Error, Result};

/// Iterator over the dirents of a single directory block.
pub(crate) struct DirentBlock<'a> {
    data: &'a [u8],
    count: usize,
    index: usize,
}

impl<'a> DirentBlock<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self {
                data,
                count: 0,
                index: 0,
            });
        }
        let first = Dirent::read_from(data)?;
        let name_off = first.name_off as usize;
        if name_off < Dirent::size() || name_off >= BLOCK_SIZE || name_off > data.len() {
            return Err(Error::CorruptImage(format!(
                "invalid nameoff {name_off} of the first dirent"
            )));
        }
        Ok(Self {
            data,
            count: name_off / Dirent::size(),
            index: 0,
        })
    }

    fn entry(&self, i: usize) -> Result<(Dirent, &'a [u8])> {
        let de = Dirent::read_from(&self.data[i * Dirent::size()..])?;
        let start = de.name_off as usize;
        let end = if i + 1 < self.count {
            Dirent::read_from(&self.data[(i + 1) * Dirent::size()..])?.name_off as usize
        } else {
            // the last name runs to the end of the block, minus NUL padding
            let tail = &self.data[start.min(self.data.len())..];
            start + tail.iter().position(|&b| b == 0).unwrap_or(tail.len())
        };
        if start < self.count * Dirent::size()
            || end <= start
            || end > self.data.len()
            || end - start > MAX_NAME_LEN
        {
            return Err(Error::CorruptImage(format!(
                "bogus dirent name range {start}..{end}"
            )));
        }
        Ok((de, &self.data[start..end]))
    }
}

impl<'a> Iterator for DirentBlock<'a> {
    type Item = Result<(Dirent, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.count {
            return None;
        }
        let i = self.index;
        self.index += 1;
        Some(self.entry(i))
    }
}

/// Linear scan of one directory block for `name`.
pub(crate) fn find_in_block(data: &[u8], name: &str) -> Result<Option<Dirent>> {
    for entry in DirentBlock::new(data)? {
        let (de, bytes) = entry?;
        if bytes == name.as_bytes() {
            return Ok(Some(de));
        }
    }
    Ok(None)
}

/// One entry yielded by [`ReadDir`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    dir: PathBuf,
    name: String,
    nid: u64,
    file_type: DirentFileType,
}

impl DirEntry {
    pub fn file_name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }

    pub fn nid(&self) -> u64 {
        self.nid
    }

    pub fn file_type(&self) -> &DirentFileType {
        &self.file_type
    }
}

/// Iterator over the entries of one directory; `.` and `..` are skipped.
pub struct ReadDir<'a, R: ReadAt> {
    fs: &'a Filesystem<R>,
    inode: Inode,
    dir: PathBuf,
    offset: u64,
    queue: VecDeque<DirEntry>,
}

impl<'a, R: ReadAt> ReadDir<'a, R> {
    pub(crate) fn new(fs: &'a Filesystem<R>, inode: Inode, dir: &Path) -> Result<Self> {
        Ok(Self {
            fs,
            inode,
            dir: dir.to_path_buf(),
            offset: 0,
            queue: VecDeque::new(),
        })
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    fn refill(&mut self) -> Result<bool> {
        let mut block = vec![0u8; BLOCK_SIZE];
        while self.offset < self.inode.data_size() {
            let n = self.fs.pread(&self.inode, &mut block, self.offset)?;
            if n == 0 {
                return Ok(false);
            }
            self.offset += n as u64;
            for entry in DirentBlock::new(&block[..n])? {
                let (de, name) = entry?;
                if name == b"." || name == b".." {
                    continue;
                }
                let name = std::str::from_utf8(name)
                    .map_err(|_| Error::CorruptImage("dirent name is not UTF-8".into()))?
                    .to_string();
                self.queue.push_back(DirEntry {
                    dir: self.dir.clone(),
                    name,
                    nid: de.nid,
                    file_type: de.file_type.try_into()?,
                });
            }
            if !self.queue.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl<R: ReadAt> Iterator for ReadDir<'_, R> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.queue.pop_front() {
            return Some(Ok(entry));
        }
        match self.refill() {
            Ok(true) => self.queue.pop_front().map(Ok),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
