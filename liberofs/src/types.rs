//! On-disk structures and their decoders.
//!
//! Everything here is a plain little-endian record read through
//! [`ReadCursor`]; bit-packed fields are exposed as accessor methods so the
//! decode functions are the single source of truth for the bit layout.

use core::mem::size_of;

use crate::read::ReadCursor;
use crate::{Error, Result};

pub const MAGIC_NUMBER: u32 = 0xe0f5e1e2;
pub const SUPER_BLOCK_OFFSET: u64 = 1024;

/// Fixed block-size shift for this reader (4096-byte blocks).
pub const BLKSZBITS: u8 = 12;
pub const BLOCK_SIZE: usize = 1 << BLKSZBITS;

/// Inodes live on 32-byte slots in the metadata region.
pub const ISLOTBITS: u8 = 5;

pub const NULL_ADDR: u32 = u32::MAX;
pub const MAX_NAME_LEN: usize = 255;

pub const FEATURE_COMPAT_SB_CHKSUM: u32 = 0x0000_0001;

pub const FEATURE_INCOMPAT_ZERO_PADDING: u32 = 0x0000_0001;
pub const FEATURE_INCOMPAT_COMPR_CFGS: u32 = 0x0000_0002;
pub const FEATURE_INCOMPAT_BIG_PCLUSTER: u32 = 0x0000_0002;
pub const FEATURE_INCOMPAT_CHUNKED_FILE: u32 = 0x0000_0004;
pub const FEATURE_INCOMPAT_DEVICE_TABLE: u32 = 0x0000_0008;
pub const FEATURE_INCOMPAT_COMPR_HEAD2: u32 = 0x0000_0008;
pub const FEATURE_INCOMPAT_ZTAILPACKING: u32 = 0x0000_0010;
pub const FEATURE_INCOMPAT_FRAGMENTS: u32 = 0x0000_0020;
pub const FEATURE_INCOMPAT_DEDUPE: u32 = 0x0000_0020;
pub const FEATURE_INCOMPAT_XATTR_PREFIXES: u32 = 0x0000_0040;

/// Every incompat bit this reader knows how to interpret. Unknown mandatory
/// bits may change on-disk semantics, so mount refuses them.
pub const FEATURE_INCOMPAT_SUPPORTED: u32 = 0x0000_007f;

pub const LAYOUT_CHUNK_FORMAT_BITS: u16 = 0x001f;
pub const LAYOUT_CHUNK_FORMAT_INDEXES: u16 = 0x0020;

pub const DEVT_SLOT_SIZE: u64 = 128;

pub const Z_EROFS_LCLUSTER_TYPE_PLAIN: u8 = 0;
pub const Z_EROFS_LCLUSTER_TYPE_HEAD1: u8 = 1;
pub const Z_EROFS_LCLUSTER_TYPE_NONHEAD: u8 = 2;
pub const Z_EROFS_LCLUSTER_TYPE_HEAD2: u8 = 3;
pub const Z_EROFS_LI_LCLUSTER_TYPE_MASK: u16 = 0x0003;
pub const Z_EROFS_LI_PARTIAL_REF: u16 = 1 << 15;
pub const Z_EROFS_LI_D0_CBLKCNT: u16 = 1 << 11;

pub const Z_EROFS_FRAGMENT_INODE_BIT: u8 = 7;

/// Compressed pclusters are bounded on disk; anything larger is corruption.
pub const Z_EROFS_PCLUSTER_MAX_SIZE: usize = 1024 * 1024;

/// Decompressed pclusters are bounded; a partial LZ4 decode that keeps
/// demanding more output than this is treated as corruption.
pub const Z_EROFS_PCLUSTER_MAX_DSIZE: usize = 4 << 20;

/// Compression algorithm of one extent, as resolved by the mapper.
///
/// `Shifted` and `Interlaced` are the two identity transforms used for
/// uncompressed (PLAIN) lclusters inside a compressed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Lz4,
    Lzma,
    Deflate,
    Zstd,
    Shifted,
    Interlaced,
}

impl Algorithm {
    pub(crate) fn from_format(format: u8) -> Result<Self> {
        match format {
            0 => Ok(Self::Lz4),
            1 => Ok(Self::Lzma),
            2 => Ok(Self::Deflate),
            3 => Ok(Self::Zstd),
            x => Err(Error::UnsupportedFeature(format!(
                "compression algorithm {x}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SuperBlock {
    pub magic: u32,
    pub checksum: u32,
    pub feature_compat: u32,
    pub blkszbits: u8,
    pub ext_slots: u8,
    pub root_nid: u16,
    pub inos: u64,
    pub build_time: u64,
    pub build_time_ns: u32,
    pub blocks: u32,
    pub meta_blkaddr: u32,
    pub xattr_blkaddr: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub feature_incompat: u32,
    pub compr_algs: u16,
    pub extra_devices: u16,
    pub devt_slot_off: u16,
    pub dir_blk_bits: u8,
    pub xattr_prefix_count: u8,
    pub xattr_prefix_start: u32,
    pub packed_nid: u64,
    pub xattr_filter_res: u8,
}

impl SuperBlock {
    #[inline]
    pub const fn size() -> usize {
        128
    }

    pub fn read_from(data: &[u8]) -> Result<Self> {
        let mut cursor = ReadCursor::new(data);
        Ok(Self {
            magic: cursor.read_u32_le()?,
            checksum: cursor.read_u32_le()?,
            feature_compat: cursor.read_u32_le()?,
            blkszbits: cursor.read_u8()?,
            ext_slots: cursor.read_u8()?,
            root_nid: cursor.read_u16_le()?,
            inos: cursor.read_u64_le()?,
            build_time: cursor.read_u64_le()?,
            build_time_ns: cursor.read_u32_le()?,
            blocks: cursor.read_u32_le()?,
            meta_blkaddr: cursor.read_u32_le()?,
            xattr_blkaddr: cursor.read_u32_le()?,
            uuid: cursor.read_array::<16>()?,
            volume_name: cursor.read_array::<16>()?,
            feature_incompat: cursor.read_u32_le()?,
            compr_algs: cursor.read_u16_le()?,
            extra_devices: cursor.read_u16_le()?,
            devt_slot_off: cursor.read_u16_le()?,
            dir_blk_bits: cursor.read_u8()?,
            xattr_prefix_count: cursor.read_u8()?,
            xattr_prefix_start: cursor.read_u32_le()?,
            packed_nid: cursor.read_u64_le()?,
            xattr_filter_res: cursor.read_u8()?,
        })
    }
}

/// Inode data layout, bits 1..=3 of the format word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Layout {
    FlatPlain = 0,
    CompressedFull = 1,
    FlatInline = 2,
    CompressedCompact = 3,
    ChunkBased = 4,
}

impl Layout {
    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::CompressedFull | Self::CompressedCompact)
    }
}

impl TryFrom<u8> for Layout {
    type Error = Error;
    fn try_from(x: u8) -> Result<Self> {
        use Layout::*;
        match x {
            0 => Ok(FlatPlain),
            1 => Ok(CompressedFull),
            2 => Ok(FlatInline),
            3 => Ok(CompressedCompact),
            4 => Ok(ChunkBased),
            x => Err(Error::UnsupportedLayout(x)),
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileMode: u16 {
        const READ = 0o400;
        const WRITE = 0o200;
        const EXEC = 0o100;
        const READ_GROUP = 0o040;
        const WRITE_GROUP = 0o020;
        const EXEC_GROUP = 0o010;
        const READ_OTHER = 0o004;
        const WRITE_OTHER = 0o002;
        const EXEC_OTHER = 0o001;
        const NAMED_PIPE = 0o010000;
        const CHAR_DEVICE = 0o020000;
        const DIR = 0o040000;
        const BLOCK_DEVICE = 0o060000;
        const REGULAR = 0o100000;
        const SYMLINK = 0o120000;
        const SOCKET = 0o140000;
        const SETUID = 0o004000;
        const SETGID = 0o002000;
        const STICKY = 0o001000;
    }
}

const S_IFMT: u16 = 0o170000;

impl FileMode {
    fn type_bits(&self) -> u16 {
        self.bits() & S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.type_bits() == Self::DIR.bits()
    }

    pub fn is_file(&self) -> bool {
        self.type_bits() == Self::REGULAR.bits()
    }

    pub fn is_symlink(&self) -> bool {
        self.type_bits() == Self::SYMLINK.bits()
    }

    /// True when the type bits name a recognized file type; a bogus mode is
    /// a corruption signal, not an unsupported feature.
    pub fn is_valid_type(&self) -> bool {
        matches!(
            self.type_bits(),
            0o010000 | 0o020000 | 0o040000 | 0o060000 | 0o100000 | 0o120000 | 0o140000
        )
    }
}

/// The layout-dependent payload at offset 0x10 of both inode encodings.
#[derive(Debug, Clone, Copy)]
pub enum InodeSpec {
    /// Starting block of flat file data.
    RawBlock(u32),
    /// Chunk-based format word.
    Chunk(ChunkFormat),
    /// rdev of a character/block device inode.
    Device(u32),
    /// Compressed layouts keep the pcluster count here; the mapper never
    /// needs it, the compression header is decoded lazily instead.
    Compressed(u32),
}

#[derive(Debug, Clone, Copy)]
pub enum Inode {
    Compact((u64, InodeCompact)),
    Extended((u64, InodeExtended)),
}

impl Inode {
    pub fn is_compact_format(format: u16) -> bool {
        (format & 0x01) == 0
    }

    pub fn nid(&self) -> u64 {
        match self {
            Self::Compact((nid, _)) => *nid,
            Self::Extended((nid, _)) => *nid,
        }
    }

    fn format(&self) -> u16 {
        match self {
            Self::Compact((_, n)) => n.format,
            Self::Extended((_, n)) => n.format,
        }
    }

    pub fn layout(&self) -> Result<Layout> {
        (((self.format() & 0x0e) >> 1) as u8).try_into()
    }

    /// Size of the fixed on-disk inode record (32 or 64 bytes).
    pub fn inode_size(&self) -> u64 {
        match self {
            Self::Compact(_) => size_of::<InodeCompact>() as u64,
            Self::Extended(_) => size_of::<InodeExtended>() as u64,
        }
    }

    #[inline]
    pub fn data_size(&self) -> u64 {
        match self {
            Self::Compact((_, n)) => n.size as u64,
            Self::Extended((_, n)) => n.size,
        }
    }

    fn raw_payload(&self) -> u32 {
        match self {
            Self::Compact((_, n)) => n.inode_data,
            Self::Extended((_, n)) => n.inode_data,
        }
    }

    pub fn spec(&self) -> Result<InodeSpec> {
        Ok(match self.mode().type_bits() {
            0o020000 | 0o060000 => InodeSpec::Device(self.raw_payload()),
            0o010000 | 0o140000 => InodeSpec::Device(0),
            _ => match self.layout()? {
                Layout::ChunkBased => InodeSpec::Chunk(ChunkFormat(self.raw_payload() as u16)),
                Layout::FlatPlain | Layout::FlatInline => InodeSpec::RawBlock(self.raw_payload()),
                Layout::CompressedFull | Layout::CompressedCompact => {
                    InodeSpec::Compressed(self.raw_payload())
                }
            },
        })
    }

    /// Size of the xattr area between the inode record and inline data.
    pub fn xattr_size(&self) -> u64 {
        let count = match self {
            Self::Compact((_, n)) => n.xattr_count,
            Self::Extended((_, n)) => n.xattr_count,
        };
        if count == 0 {
            0
        } else {
            // 12-byte header plus 4 bytes per shared entry slot
            12 + (count as u64 - 1) * 4
        }
    }

    pub fn mode(&self) -> FileMode {
        match self {
            Self::Compact((_, n)) => FileMode::from_bits_retain(n.mode),
            Self::Extended((_, n)) => FileMode::from_bits_retain(n.mode),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode().is_dir()
    }

    pub fn is_file(&self) -> bool {
        self.mode().is_file()
    }

    pub fn is_symlink(&self) -> bool {
        self.mode().is_symlink()
    }

    /// Modification time; compact inodes fall back to the image build time.
    pub fn mtime(&self, sb: &SuperBlock) -> (u64, u32) {
        match self {
            Self::Compact(_) => (sb.build_time, sb.build_time_ns),
            Self::Extended((_, n)) => (n.mtime, n.mtime_ns),
        }
    }

    pub fn uid(&self) -> u32 {
        match self {
            Self::Compact((_, n)) => n.uid as u32,
            Self::Extended((_, n)) => n.uid,
        }
    }

    pub fn gid(&self) -> u32 {
        match self {
            Self::Compact((_, n)) => n.gid as u32,
            Self::Extended((_, n)) => n.gid,
        }
    }

    pub fn nlink(&self) -> u32 {
        match self {
            Self::Compact((_, n)) => n.nlink as u32,
            Self::Extended((_, n)) => n.nlink,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InodeCompact {
    pub format: u16,
    pub xattr_count: u16,
    pub mode: u16,
    pub nlink: u16,
    pub size: u32,
    pub reserved: u32,
    pub inode_data: u32,
    pub ino: u32,
    pub uid: u16,
    pub gid: u16,
    pub reserved2: u32,
}

impl InodeCompact {
    #[inline]
    pub const fn size() -> usize {
        size_of::<Self>()
    }

    pub fn read_from(data: &[u8]) -> Result<Self> {
        let mut cursor = ReadCursor::new(data);
        Ok(Self {
            format: cursor.read_u16_le()?,
            xattr_count: cursor.read_u16_le()?,
            mode: cursor.read_u16_le()?,
            nlink: cursor.read_u16_le()?,
            size: cursor.read_u32_le()?,
            reserved: cursor.read_u32_le()?,
            inode_data: cursor.read_u32_le()?,
            ino: cursor.read_u32_le()?,
            uid: cursor.read_u16_le()?,
            gid: cursor.read_u16_le()?,
            reserved2: cursor.read_u32_le()?,
        })
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InodeExtended {
    pub format: u16,
    pub xattr_count: u16,
    pub mode: u16,
    pub reserved: u16,
    pub size: u64,
    pub inode_data: u32,
    pub ino: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    pub mtime_ns: u32,
    pub nlink: u32,
    pub reserved2: [u8; 16],
}

impl InodeExtended {
    #[inline]
    pub const fn size() -> usize {
        size_of::<Self>()
    }

    pub fn read_from(data: &[u8]) -> Result<Self> {
        let mut cursor = ReadCursor::new(data);
        Ok(Self {
            format: cursor.read_u16_le()?,
            xattr_count: cursor.read_u16_le()?,
            mode: cursor.read_u16_le()?,
            reserved: cursor.read_u16_le()?,
            size: cursor.read_u64_le()?,
            inode_data: cursor.read_u32_le()?,
            ino: cursor.read_u32_le()?,
            uid: cursor.read_u32_le()?,
            gid: cursor.read_u32_le()?,
            mtime: cursor.read_u64_le()?,
            mtime_ns: cursor.read_u32_le()?,
            nlink: cursor.read_u32_le()?,
            reserved2: cursor.read_array::<16>()?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DirentFileType {
    Unknown = 0,
    RegularFile = 1,
    Directory = 2,
    CharacterDevice = 3,
    BlockDevice = 4,
    Fifo = 5,
    Socket = 6,
    Symlink = 7,
}

impl DirentFileType {
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory)
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Self::RegularFile)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, Self::Symlink)
    }
}

impl TryFrom<u8> for DirentFileType {
    type Error = Error;
    fn try_from(x: u8) -> Result<Self> {
        use DirentFileType::*;
        match x {
            0 => Ok(Unknown),
            1 => Ok(RegularFile),
            2 => Ok(Directory),
            3 => Ok(CharacterDevice),
            4 => Ok(BlockDevice),
            5 => Ok(Fifo),
            6 => Ok(Socket),
            7 => Ok(Symlink),
            x => Err(Error::CorruptImage(format!("invalid dirent file type {x}"))),
        }
    }
}

/// Fixed-size directory entry header; the name lives out-of-line at
/// `name_off` within the same block, its length implied by the next entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dirent {
    pub nid: u64,
    pub name_off: u16,
    pub file_type: u8,
}

impl Dirent {
    #[inline]
    pub const fn size() -> usize {
        12
    }

    pub fn read_from(data: &[u8]) -> Result<Self> {
        let mut cursor = ReadCursor::new(data);
        let nid = cursor.read_u64_le()?;
        let name_off = cursor.read_u16_le()?;
        let file_type = cursor.read_u8()?;
        Ok(Self {
            nid,
            name_off,
            file_type,
        })
    }
}

/// Chunk-based format word: bits 0..5 are the chunk size as a shift on top
/// of the block size, bit 5 selects 8-byte chunk indexes over the flat
/// 4-byte block map.
#[derive(Debug, Clone, Copy)]
pub struct ChunkFormat(pub u16);

impl ChunkFormat {
    pub fn is_valid(&self) -> bool {
        let allowed = LAYOUT_CHUNK_FORMAT_BITS | LAYOUT_CHUNK_FORMAT_INDEXES;
        (self.0 & !allowed) == 0
    }

    pub fn is_indexes(&self) -> bool {
        (self.0 & LAYOUT_CHUNK_FORMAT_INDEXES) != 0
    }

    pub fn chunk_bits(&self) -> u8 {
        (self.0 & LAYOUT_CHUNK_FORMAT_BITS) as u8 + BLKSZBITS
    }
}

/// One 8-byte entry of a chunk index table.
#[derive(Debug, Clone, Copy)]
pub struct ChunkIndex {
    pub advise: u16,
    pub device_id: u16,
    pub blkaddr: u32,
}

impl ChunkIndex {
    #[inline]
    pub const fn size() -> usize {
        8
    }

    pub fn read_from(data: &[u8]) -> Result<Self> {
        let mut cursor = ReadCursor::new(data);
        Ok(Self {
            advise: cursor.read_u16_le()?,
            device_id: cursor.read_u16_le()?,
            blkaddr: cursor.read_u32_le()?,
        })
    }
}

/// One 128-byte slot of the on-disk device table.
#[derive(Debug, Clone)]
pub struct DeviceSlot {
    pub tag: [u8; 64],
    pub blocks: u32,
    pub mapped_blkaddr: u32,
}

impl DeviceSlot {
    pub fn read_from(data: &[u8]) -> Result<Self> {
        let mut cursor = ReadCursor::new(data);
        let tag = cursor.read_array::<64>()?;
        let blocks = cursor.read_u32_le()?;
        let mapped_blkaddr = cursor.read_u32_le()?;
        Ok(Self {
            tag,
            blocks,
            mapped_blkaddr,
        })
    }
}

bitflags::bitflags! {
    /// Per-inode compression advise flags from the map header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ZAdvise: u16 {
        const COMPACTED_2B = 0x0001;
        const BIG_PCLUSTER_1 = 0x0002;
        const BIG_PCLUSTER_2 = 0x0004;
        const INLINE_PCLUSTER = 0x0008;
        const INTERLACED_PCLUSTER = 0x0010;
        const FRAGMENT_PCLUSTER = 0x0020;
    }
}

/// The 8-byte compression map header at `align8(iloc + isize + xattrs)`.
#[derive(Debug, Clone, Copy)]
pub struct MapHeader {
    /// Low 32 bits of the fragment offset, overlapping `idata_size`.
    pub fragmentoff: u32,
    pub advise: ZAdvise,
    pub algorithmtype: u8,
    pub clusterbits: u8,
}

impl MapHeader {
    #[inline]
    pub const fn size() -> usize {
        8
    }

    pub fn read_from(data: &[u8]) -> Result<Self> {
        let mut cursor = ReadCursor::new(data);
        let fragmentoff = cursor.read_u32_le()?;
        let advise = ZAdvise::from_bits_retain(cursor.read_u16_le()?);
        let algorithmtype = cursor.read_u8()?;
        let clusterbits = cursor.read_u8()?;
        Ok(Self {
            fragmentoff,
            advise,
            algorithmtype,
            clusterbits,
        })
    }

    /// Inline (tail-packed) pcluster size, stored in the upper half of the
    /// fragment-offset union.
    pub fn idata_size(&self) -> u64 {
        (self.fragmentoff >> 16) as u64
    }

    pub fn lclusterbits(&self) -> u8 {
        BLKSZBITS + (self.clusterbits & 7)
    }

    /// Set when the whole file lives in the packed inode; the remaining
    /// header bytes then hold a 64-bit fragment offset instead.
    pub fn whole_file_fragment(&self) -> bool {
        (self.clusterbits >> Z_EROFS_FRAGMENT_INODE_BIT) != 0
    }

    pub fn algorithm_head1(&self) -> u8 {
        self.algorithmtype & 0x0f
    }

    pub fn algorithm_head2(&self) -> u8 {
        self.algorithmtype >> 4
    }
}

/// Decode the 64-bit fragment offset of a whole-file fragment from the raw
/// header bytes (bit 63 doubles as the marker bit and is masked off).
pub fn whole_fragment_off(raw_header: &[u8; 8]) -> u64 {
    u64::from_le_bytes(*raw_header) ^ (1u64 << 63)
}
