//! Recursive directory traversal.

use std::ops::Deref;
use std::path::{Path, PathBuf};

use crate::device::ReadAt;
use crate::dirent::{DirEntry, ReadDir};
use crate::filesystem::Filesystem;
use crate::Result;

/// Depth-first walk over a directory tree. Directories are yielded before
/// their contents.
pub struct WalkDir<'a, R: ReadAt> {
    fs: &'a Filesystem<R>,
    stack: Vec<ReadDir<'a, R>>,
    max_depth: usize,
}

/// A [`DirEntry`] paired with its depth below the walk root.
pub struct WalkDirEntry {
    entry: DirEntry,
    depth: usize,
}

impl WalkDirEntry {
    pub fn path(&self) -> PathBuf {
        self.entry.path()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn into_entry(self) -> DirEntry {
        self.entry
    }
}

impl Deref for WalkDirEntry {
    type Target = DirEntry;

    fn deref(&self) -> &DirEntry {
        &self.entry
    }
}

impl<'a, R: ReadAt> WalkDir<'a, R> {
    pub(crate) fn new<P: AsRef<Path>>(fs: &'a Filesystem<R>, path: P) -> Result<Self> {
        let root = fs.read_dir(path)?;
        Ok(Self {
            fs,
            stack: vec![root],
            max_depth: usize::MAX,
        })
    }

    /// Descend at most `depth` levels below the root (1 lists only the
    /// root's own entries).
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }
}

impl<R: ReadAt> Iterator for WalkDir<'_, R> {
    type Item = Result<WalkDirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let depth = self.stack.len();
            let dir = self.stack.last_mut()?;
            match dir.next() {
                Some(Ok(entry)) => {
                    if entry.file_type().is_dir() && depth < self.max_depth {
                        match self.fs.read_dir(entry.path()) {
                            Ok(sub) => self.stack.push(sub),
                            Err(e) => return Some(Err(e)),
                        }
                    }
                    return Some(Ok(WalkDirEntry { entry, depth }));
                }
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}
