use std::io;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::device::{read_exact_at, DeviceTable, ReadAt};
use crate::dirent::{self, ReadDir};
use crate::file::File;
use crate::types::*;
use crate::walkdir::WalkDir;
use crate::{Error, Result};

bitflags::bitflags! {
    /// Properties of a resolved extent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// The logical range is backed by physical bytes (unset: hole/EOF).
        const MAPPED = 0x0001;
        /// Physical bytes live in the metadata region (tail-packed data).
        const META = 0x0002;
        /// Physical bytes are encoded and need the decompression dispatcher.
        const ENCODED = 0x0004;
        /// The logical length covers the whole extent, not just the queried
        /// lcluster.
        const FULL_MAPPED = 0x0008;
        /// Data lives in the shared packed inode at the inode's fragment
        /// offset.
        const FRAGMENT = 0x0010;
        /// The pcluster is referenced partially (deduplication).
        const PARTIAL_REF = 0x0020;
    }
}

/// Result of mapping a logical byte address to a physical extent.
///
/// For uncompressed layouts logical and physical lengths agree; compressed
/// extents decouple them.
#[derive(Debug, Clone, Copy)]
pub struct BlockMap {
    pub logical_start: u64,
    pub logical_len: u64,
    pub physical_start: u64,
    pub physical_len: u64,
    pub device_id: u16,
    pub algorithm: Option<Algorithm>,
    pub flags: MapFlags,
}

impl BlockMap {
    pub(crate) fn unmapped(logical_start: u64, logical_len: u64) -> Self {
        Self {
            logical_start,
            logical_len,
            physical_start: 0,
            physical_len: 0,
            device_id: 0,
            algorithm: None,
            flags: MapFlags::empty(),
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.flags.contains(MapFlags::MAPPED)
    }
}

pub(crate) struct DecodedPcluster {
    pub(crate) nid: u64,
    pub(crate) logical_start: u64,
    pub(crate) data: Arc<Vec<u8>>,
}

/// A mounted EROFS image.
///
/// Created by [`Filesystem::mount`]; owns the backing reader and the parsed
/// superblock, both immutable for the lifetime of the mount. Every operation
/// takes `&self`, so a mounted image can be shared across threads.
pub struct Filesystem<R: ReadAt> {
    reader: R,
    super_block: SuperBlock,
    devices: DeviceTable,
    extra_readers: Vec<Option<Box<dyn ReadAt + Send + Sync>>>,
    pub(crate) decoded_cache: Mutex<Option<DecodedPcluster>>,
}

impl<R: ReadAt> Filesystem<R> {
    /// Read and validate the superblock, then hand back an owned filesystem
    /// handle.
    pub fn mount(reader: R) -> Result<Self> {
        let mut sb_buf = vec![0u8; SuperBlock::size()];
        read_exact_at(&reader, SUPER_BLOCK_OFFSET, &mut sb_buf)?;
        let super_block = SuperBlock::read_from(&sb_buf)?;

        if super_block.magic != MAGIC_NUMBER {
            return Err(Error::CorruptImage(format!(
                "invalid magic number 0x{:x}",
                super_block.magic
            )));
        }
        if super_block.blkszbits != BLKSZBITS {
            return Err(Error::UnsupportedFeature(format!(
                "block size bits {} (only {} supported)",
                super_block.blkszbits, BLKSZBITS
            )));
        }
        let unknown = super_block.feature_incompat & !FEATURE_INCOMPAT_SUPPORTED;
        if unknown != 0 {
            return Err(Error::UnsupportedFeature(format!(
                "unknown incompat feature bits 0x{unknown:x}"
            )));
        }

        let mut fs = Self {
            reader,
            super_block,
            devices: DeviceTable::empty(),
            extra_readers: Vec::new(),
            decoded_cache: Mutex::new(None),
        };
        if super_block.extra_devices > 0 {
            if super_block.feature_incompat & FEATURE_INCOMPAT_DEVICE_TABLE == 0 {
                return Err(Error::CorruptImage(
                    "extra devices without the device-table feature".into(),
                ));
            }
            fs.read_device_table()?;
        }
        debug!(
            blocks = fs.super_block.blocks,
            root_nid = fs.super_block.root_nid,
            extra_devices = fs.super_block.extra_devices,
            "mounted erofs image"
        );
        Ok(fs)
    }

    fn read_device_table(&mut self) -> Result<()> {
        let sb = &self.super_block;
        let mut slots = Vec::with_capacity(sb.extra_devices as usize);
        let mut pos = sb.devt_slot_off as u64 * DEVT_SLOT_SIZE;
        for _ in 0..sb.extra_devices {
            let mut buf = [0u8; DEVT_SLOT_SIZE as usize];
            read_exact_at(&self.reader, pos, &mut buf)?;
            slots.push(DeviceSlot::read_from(&buf)?);
            pos += DEVT_SLOT_SIZE;
        }
        self.extra_readers = (0..slots.len()).map(|_| None).collect();
        self.devices = DeviceTable::new(slots);
        Ok(())
    }

    /// Attach the backing reader for extra device `device_id` (1-based, in
    /// device-table order) of a multi-device image.
    pub fn attach_device(
        &mut self,
        device_id: u16,
        reader: Box<dyn ReadAt + Send + Sync>,
    ) -> Result<()> {
        let slot = self
            .extra_readers
            .get_mut(device_id.wrapping_sub(1) as usize)
            .ok_or_else(|| {
                Error::UnsupportedFeature(format!("device {device_id} is not in the device table"))
            })?;
        *slot = Some(reader);
        Ok(())
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    pub fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    #[inline]
    pub(crate) fn blk_pos(&self, blk: u32) -> u64 {
        (blk as u64) << BLKSZBITS
    }

    #[inline]
    pub(crate) fn blk_off(&self, pos: u64) -> u64 {
        pos & (BLOCK_SIZE as u64 - 1)
    }

    /// Byte offset of an inode within the metadata region.
    #[inline]
    pub(crate) fn iloc(&self, nid: u64) -> u64 {
        self.blk_pos(self.super_block.meta_blkaddr) + (nid << ISLOTBITS)
    }

    /// Exact positional read from one of the backing devices.
    pub(crate) fn dev_read(&self, device_id: u16, offset: u64, out: &mut [u8]) -> Result<()> {
        if device_id == 0 {
            return read_exact_at(&self.reader, offset, out);
        }
        match self.extra_readers.get(device_id as usize - 1) {
            Some(Some(reader)) => read_exact_at(reader, offset, out),
            _ => Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no reader attached for device {device_id}"),
            ))),
        }
    }

    /// Translate an extent's (device id, physical address) through the
    /// device table.
    pub(crate) fn map_device(&self, device_id: u16, pa: u64) -> Result<(u16, u64)> {
        self.devices.map(device_id, pa)
    }

    pub(crate) fn device_id_mask(&self) -> u16 {
        self.devices.id_mask
    }

    /// Decode the on-disk inode at `nid`.
    pub fn get_inode(&self, nid: u64) -> Result<Inode> {
        let offset = self.iloc(nid);
        let mut head = [0u8; InodeCompact::size()];
        read_exact_at(&self.reader, offset, &mut head)?;
        let format = u16::from_le_bytes([head[0], head[1]]);

        let inode = if Inode::is_compact_format(format) {
            Inode::Compact((nid, InodeCompact::read_from(&head)?))
        } else {
            let mut buf = [0u8; InodeExtended::size()];
            read_exact_at(&self.reader, offset, &mut buf)?;
            Inode::Extended((nid, InodeExtended::read_from(&buf)?))
        };

        let layout = inode.layout()?;
        if !inode.mode().is_valid_type() {
            return Err(Error::CorruptImage(format!(
                "bogus i_mode 0o{:o} @ nid {nid}",
                inode.mode().bits()
            )));
        }
        if layout == Layout::ChunkBased {
            if let InodeSpec::Chunk(format) = inode.spec()? {
                if !format.is_valid() {
                    return Err(Error::CorruptImage(format!(
                        "unsupported chunk format 0x{:x} @ nid {nid}",
                        format.0
                    )));
                }
            }
        }
        Ok(inode)
    }

    /// Resolve the extent covering logical byte `la` of an uncompressed
    /// inode; dispatches to the compressed mapper for compressed layouts.
    pub fn map_blocks(&self, inode: &Inode, la: u64) -> Result<BlockMap> {
        if inode.layout()?.is_compressed() {
            let info = self.zinfo(inode)?;
            return self.z_map_blocks(inode, &info, la);
        }
        if la >= inode.data_size() {
            // out-of-bounds access stays unmapped, it is not an error
            return Ok(BlockMap::unmapped(la, 0));
        }
        match inode.layout()? {
            Layout::FlatPlain => self.map_flat(inode, la, false),
            Layout::FlatInline => self.map_flat(inode, la, true),
            Layout::ChunkBased => self.map_chunk(inode, la),
            _ => unreachable!("compressed layouts handled above"),
        }
    }

    fn map_flat(&self, inode: &Inode, la: u64, tail_inline: bool) -> Result<BlockMap> {
        let blkaddr = match inode.spec()? {
            InodeSpec::RawBlock(addr) => addr,
            _ => {
                return Err(Error::CorruptImage(format!(
                    "flat inode without a raw block address @ nid {}",
                    inode.nid()
                )))
            }
        };
        let size = inode.data_size();
        let nblocks = size.div_ceil(BLOCK_SIZE as u64);
        let lastblk = if tail_inline { nblocks - 1 } else { nblocks };

        let mut flags = MapFlags::MAPPED;
        let (pa, plen);
        if la < lastblk << BLKSZBITS {
            pa = self.blk_pos(blkaddr) + la;
            plen = (lastblk << BLKSZBITS) - la;
        } else if tail_inline {
            pa = self.iloc(inode.nid()) + inode.inode_size() + inode.xattr_size() + self.blk_off(la);
            plen = size - la;
            if self.blk_off(pa) + plen > BLOCK_SIZE as u64 {
                warn!(nid = inode.nid(), "inline data crosses a block boundary");
                return Err(Error::CorruptImage(format!(
                    "inline data crosses a block boundary @ nid {}",
                    inode.nid()
                )));
            }
            flags |= MapFlags::META;
        } else {
            return Err(Error::CorruptImage(format!(
                "offset {la} past the last block of flat nid {}",
                inode.nid()
            )));
        }

        Ok(BlockMap {
            logical_start: la,
            logical_len: plen,
            physical_start: pa,
            physical_len: plen,
            device_id: 0,
            algorithm: None,
            flags,
        })
    }

    fn map_chunk(&self, inode: &Inode, la: u64) -> Result<BlockMap> {
        let format = match inode.spec()? {
            InodeSpec::Chunk(format) => format,
            _ => {
                return Err(Error::CorruptImage(format!(
                    "chunk-based inode without a chunk format @ nid {}",
                    inode.nid()
                )))
            }
        };
        let chunk_bits = format.chunk_bits() as u64;
        let chunknr = la >> chunk_bits;
        let unit = if format.is_indexes() {
            ChunkIndex::size() as u64
        } else {
            4
        };
        let base = self.iloc(inode.nid()) + inode.inode_size() + inode.xattr_size();
        let pos = base.next_multiple_of(unit) + unit * chunknr;

        let logical_start = chunknr << chunk_bits;
        let logical_len = (1u64 << chunk_bits).min(
            (inode.data_size() - logical_start).next_multiple_of(BLOCK_SIZE as u64),
        );

        if format.is_indexes() {
            let mut buf = [0u8; ChunkIndex::size()];
            self.dev_read(0, pos, &mut buf)?;
            let idx = ChunkIndex::read_from(&buf)?;
            if idx.blkaddr == NULL_ADDR {
                return Ok(BlockMap::unmapped(logical_start, logical_len));
            }
            Ok(BlockMap {
                logical_start,
                logical_len,
                physical_start: self.blk_pos(idx.blkaddr),
                physical_len: logical_len,
                device_id: idx.device_id & self.device_id_mask(),
                algorithm: None,
                flags: MapFlags::MAPPED,
            })
        } else {
            let mut buf = [0u8; 4];
            self.dev_read(0, pos, &mut buf)?;
            let blkaddr = u32::from_le_bytes(buf);
            if blkaddr == NULL_ADDR {
                return Ok(BlockMap::unmapped(logical_start, logical_len));
            }
            Ok(BlockMap {
                logical_start,
                logical_len,
                physical_start: self.blk_pos(blkaddr),
                physical_len: logical_len,
                device_id: 0,
                algorithm: None,
                flags: MapFlags::MAPPED,
            })
        }
    }

    /// Read up to `buf.len()` bytes of `inode`'s data starting at `offset`.
    ///
    /// Returns the number of bytes actually read: `min(buf.len(),
    /// size - offset)`, or 0 at and past EOF. Holes read as zeroes.
    pub fn pread(&self, inode: &Inode, buf: &mut [u8], offset: u64) -> Result<usize> {
        let size = inode.data_size();
        if buf.is_empty() || offset >= size {
            return Ok(0);
        }
        let count = (buf.len() as u64).min(size - offset) as usize;
        let buf = &mut buf[..count];

        match inode.layout()? {
            Layout::FlatPlain | Layout::FlatInline | Layout::ChunkBased => {
                self.read_raw_data(inode, buf, offset)?
            }
            Layout::CompressedFull | Layout::CompressedCompact => {
                self.z_read_data(inode, buf, offset)?
            }
        }
        Ok(count)
    }

    /// Forward extent walk for the uncompressed layouts.
    fn read_raw_data(&self, inode: &Inode, buf: &mut [u8], offset: u64) -> Result<()> {
        let end = offset + buf.len() as u64;
        let mut ptr = offset;
        while ptr < end {
            let map = self.map_blocks(inode, ptr)?;
            trace!(
                la = map.logical_start,
                llen = map.logical_len,
                mapped = map.is_mapped(),
                "raw extent"
            );
            let estart = (ptr - offset) as usize;

            if !map.is_mapped() {
                if map.logical_len == 0 {
                    // reached EOF: zero-fill whatever the caller asked past it
                    buf[estart..].fill(0);
                    break;
                }
                // sparse hole
                let eend = end.min(map.logical_start + map.logical_len);
                buf[estart..(eend - offset) as usize].fill(0);
                ptr = eend;
                continue;
            }

            if ptr < map.logical_start {
                return Err(Error::CorruptImage(format!(
                    "extent @ {} does not cover offset {ptr} of nid {}",
                    map.logical_start,
                    inode.nid()
                )));
            }
            let eend = end.min(map.logical_start + map.logical_len);
            let pa = map.physical_start + (ptr - map.logical_start);
            let (device_id, pa) = if map.flags.contains(MapFlags::META) {
                (0, pa)
            } else {
                self.map_device(map.device_id, pa)?
            };
            self.dev_read(device_id, pa, &mut buf[estart..(eend - offset) as usize])?;
            ptr = eend;
        }
        Ok(())
    }

    /// Resolve `path` (components separated by `/`; leading slashes are
    /// optional) to its inode, starting at the root directory.
    ///
    /// Symlinks encountered as intermediate components are not followed;
    /// resolve a terminal symlink explicitly with [`Filesystem::readlink`].
    pub fn ilookup(&self, path: &str) -> Result<Inode> {
        let mut nid = self.super_block.root_nid as u64;
        for component in path.split('/') {
            if component.is_empty() || component == "." {
                continue;
            }
            if component.len() > MAX_NAME_LEN {
                return Err(Error::NotFound(path.to_string()));
            }
            nid = self
                .namei(nid, component)?
                .ok_or_else(|| Error::NotFound(path.to_string()))?;
        }
        self.get_inode(nid)
    }

    /// Resolve one component within directory `dir_nid`.
    fn namei(&self, dir_nid: u64, name: &str) -> Result<Option<u64>> {
        let dir = self.get_inode(dir_nid)?;
        if !dir.is_dir() {
            return Err(Error::NotADirectory(format!("nid {dir_nid}")));
        }
        let size = dir.data_size();
        let mut block = vec![0u8; BLOCK_SIZE];
        let mut offset = 0u64;
        while offset < size {
            let n = self.pread(&dir, &mut block, offset)?;
            if n == 0 {
                break;
            }
            if let Some(entry) = dirent::find_in_block(&block[..n], name)? {
                return Ok(Some(entry.nid));
            }
            offset += n as u64;
        }
        Ok(None)
    }

    /// Read a symlink inode's target.
    pub fn readlink(&self, inode: &Inode) -> Result<String> {
        if !inode.is_symlink() {
            return Err(Error::NotAFile(format!(
                "nid {} is not a symlink",
                inode.nid()
            )));
        }
        let mut buf = vec![0u8; inode.data_size() as usize];
        self.pread(inode, &mut buf, 0)?;
        String::from_utf8(buf).map_err(|_| {
            Error::CorruptImage(format!("symlink target @ nid {} is not UTF-8", inode.nid()))
        })
    }

    /// Open a regular file for reading.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<File<'_, R>> {
        let path = path.as_ref().to_string_lossy();
        let inode = self.ilookup(&path)?;
        self.open_inode(inode)
    }

    pub fn open_inode(&self, inode: Inode) -> Result<File<'_, R>> {
        if !inode.is_file() {
            return Err(Error::NotAFile(format!(
                "nid {} is not a regular file",
                inode.nid()
            )));
        }
        Ok(File::new(inode, self))
    }

    /// Iterate the entries of a directory (`.` and `..` are skipped).
    pub fn read_dir<P: AsRef<Path>>(&self, path: P) -> Result<ReadDir<'_, R>> {
        let path = path.as_ref();
        let inode = self.ilookup(&path.to_string_lossy())?;
        if !inode.is_dir() {
            return Err(Error::NotADirectory(path.to_string_lossy().into_owned()));
        }
        ReadDir::new(self, inode, path)
    }

    /// Recursively walk a directory tree.
    pub fn walk_dir<P: AsRef<Path>>(&self, path: P) -> Result<WalkDir<'_, R>> {
        WalkDir::new(self, path)
    }
}
