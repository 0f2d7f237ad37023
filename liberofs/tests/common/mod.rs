//! Synthetic image builder for the integration tests.
//!
//! Lays images out as: block 0 holds the superblock, blocks 1..=4 are the
//! metadata region (`meta_blkaddr` = 1), data blocks follow from block 5.
//! Inodes are always written in the extended (64-byte) encoding.

#![allow(dead_code)]

pub const BLKSZ: usize = 4096;
pub const META_BLOCKS: usize = 4;
pub const DATA_START_BLK: u32 = 1 + META_BLOCKS as u32;

pub const MAGIC: u32 = 0xe0f5e1e2;
pub const ZERO_PADDING: u32 = 0x01;
pub const CHUNKED_FILE: u32 = 0x04;
pub const DEVICE_TABLE: u32 = 0x08;
pub const ZTAILPACKING: u32 = 0x10;
pub const FRAGMENTS: u32 = 0x20;

pub const S_IFREG: u16 = 0o100644;
pub const S_IFDIR: u16 = 0o040755;
pub const S_IFLNK: u16 = 0o120777;

pub const LAYOUT_FLAT_PLAIN: u8 = 0;
pub const LAYOUT_COMPRESSED_FULL: u8 = 1;
pub const LAYOUT_FLAT_INLINE: u8 = 2;
pub const LAYOUT_COMPRESSED_COMPACT: u8 = 3;
pub const LAYOUT_CHUNK_BASED: u8 = 4;

pub const FT_FILE: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_SYMLINK: u8 = 7;

pub struct ImageBuilder {
    pub meta: Vec<u8>,
    pub data: Vec<u8>,
    pub feature_incompat: u32,
    pub root_nid: u16,
    pub packed_nid: u64,
    pub extra_devices: u16,
    pub devt_slot_off: u16,
    pub build_time: u64,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            meta: Vec::new(),
            data: Vec::new(),
            feature_incompat: 0,
            root_nid: 0,
            packed_nid: 0,
            extra_devices: 0,
            devt_slot_off: 0,
            build_time: 1_700_000_000,
        }
    }

    /// Pad the metadata arena so its next byte is `align`-aligned in the
    /// image (the arena starts at byte 4096).
    fn align_meta(&mut self, align: usize) {
        while (BLKSZ + self.meta.len()) % align != 0 {
            self.meta.push(0);
        }
    }

    /// The nid the next inode will get.
    pub fn next_nid(&mut self) -> u64 {
        self.align_meta(32);
        (self.meta.len() / 32) as u64
    }

    /// Append whole data blocks, padding the last one; returns the first
    /// block address.
    pub fn add_blocks(&mut self, content: &[u8]) -> u32 {
        let blk = DATA_START_BLK + (self.data.len() / BLKSZ) as u32;
        self.data.extend_from_slice(content);
        while self.data.len() % BLKSZ != 0 {
            self.data.push(0);
        }
        blk
    }

    /// Write an extended inode followed by `trailing` metadata bytes
    /// (inline data, chunk indexes, or a compression index).
    pub fn inode(
        &mut self,
        layout: u8,
        mode: u16,
        size: u64,
        inode_data: u32,
        trailing: &[u8],
    ) -> u64 {
        let nid = self.next_nid();
        let format: u16 = 1 | ((layout as u16) << 1);
        self.meta.extend_from_slice(&format.to_le_bytes());
        self.meta.extend_from_slice(&0u16.to_le_bytes()); // xattr count
        self.meta.extend_from_slice(&mode.to_le_bytes());
        self.meta.extend_from_slice(&0u16.to_le_bytes());
        self.meta.extend_from_slice(&size.to_le_bytes());
        self.meta.extend_from_slice(&inode_data.to_le_bytes());
        self.meta.extend_from_slice(&(nid as u32).to_le_bytes()); // ino
        self.meta.extend_from_slice(&1000u32.to_le_bytes()); // uid
        self.meta.extend_from_slice(&1000u32.to_le_bytes()); // gid
        self.meta.extend_from_slice(&1234u64.to_le_bytes()); // mtime
        self.meta.extend_from_slice(&0u32.to_le_bytes());
        self.meta.extend_from_slice(&1u32.to_le_bytes()); // nlink
        self.meta.extend_from_slice(&[0u8; 16]);
        self.meta.extend_from_slice(trailing);
        nid
    }

    /// Regular file in the flat-plain layout (block data only).
    pub fn file_flat(&mut self, content: &[u8]) -> u64 {
        let blkaddr = if content.is_empty() {
            0
        } else {
            self.add_blocks(content)
        };
        self.inode(LAYOUT_FLAT_PLAIN, S_IFREG, content.len() as u64, blkaddr, &[])
    }

    /// Inode in the flat-inline layout: full blocks in the data area, the
    /// tail inline after the inode.
    pub fn inode_flat_inline(&mut self, mode: u16, content: &[u8]) -> u64 {
        let tail_len = content.len() % BLKSZ;
        let (full, tail) = content.split_at(content.len() - tail_len);
        let blkaddr = if full.is_empty() { 0 } else { self.add_blocks(full) };
        self.inode(LAYOUT_FLAT_INLINE, mode, content.len() as u64, blkaddr, tail)
    }

    pub fn file_inline(&mut self, content: &[u8]) -> u64 {
        self.inode_flat_inline(S_IFREG, content)
    }

    pub fn symlink(&mut self, target: &str) -> u64 {
        self.inode_flat_inline(S_IFLNK, target.as_bytes())
    }

    /// Directory with the given entries; `.` and `..` are added here.
    pub fn dir(&mut self, parent_nid: u64, entries: &[(u64, &str, u8)]) -> u64 {
        let own_nid = self.next_nid();
        let mut all = vec![(own_nid, ".", FT_DIR), (parent_nid, "..", FT_DIR)];
        all.extend_from_slice(entries);
        let block = dirent_block(&all);
        self.inode_flat_inline(S_IFDIR, &block)
    }

    /// Append one 128-byte device table slot; slots are 128-byte aligned in
    /// the metadata arena and `devt_slot_off` is set from the first slot.
    pub fn device_slot(&mut self, blocks: u32, mapped_blkaddr: u32) {
        self.align_meta(128);
        if self.extra_devices == 0 {
            self.devt_slot_off = ((BLKSZ + self.meta.len()) / 128) as u16;
        }
        self.extra_devices += 1;
        self.meta.extend_from_slice(&[0u8; 64]); // tag
        self.meta.extend_from_slice(&blocks.to_le_bytes());
        self.meta.extend_from_slice(&mapped_blkaddr.to_le_bytes());
        self.meta.extend_from_slice(&[0u8; 56]);
    }

    pub fn build(self) -> Vec<u8> {
        assert!(
            self.meta.len() <= META_BLOCKS * BLKSZ,
            "metadata arena overflow"
        );
        let total_blocks = DATA_START_BLK + (self.data.len() / BLKSZ) as u32;
        let mut img = vec![0u8; BLKSZ * (1 + META_BLOCKS)];

        let sb = &mut img[1024..];
        sb[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        sb[12] = 12; // blkszbits
        sb[14..16].copy_from_slice(&self.root_nid.to_le_bytes());
        sb[24..32].copy_from_slice(&self.build_time.to_le_bytes());
        sb[36..40].copy_from_slice(&total_blocks.to_le_bytes());
        sb[40..44].copy_from_slice(&1u32.to_le_bytes()); // meta_blkaddr
        sb[80..84].copy_from_slice(&self.feature_incompat.to_le_bytes());
        sb[86..88].copy_from_slice(&self.extra_devices.to_le_bytes());
        sb[88..90].copy_from_slice(&self.devt_slot_off.to_le_bytes());
        sb[90] = 12; // dir_blk_bits
        sb[96..104].copy_from_slice(&self.packed_nid.to_le_bytes());

        img[BLKSZ..BLKSZ + self.meta.len()].copy_from_slice(&self.meta);
        img.extend_from_slice(&self.data);
        img
    }
}

/// Encode one directory block.
pub fn dirent_block(entries: &[(u64, &str, u8)]) -> Vec<u8> {
    let mut block = Vec::new();
    let mut name_off = entries.len() * 12;
    for (nid, name, ftype) in entries {
        block.extend_from_slice(&nid.to_le_bytes());
        block.extend_from_slice(&(name_off as u16).to_le_bytes());
        block.push(*ftype);
        block.push(0);
        name_off += name.len();
    }
    for (_, name, _) in entries {
        block.extend_from_slice(name.as_bytes());
    }
    assert!(block.len() <= BLKSZ, "dirent block overflow");
    block
}

/// The 8-byte compression map header.
pub fn zmap_header(fragmentoff: u32, advise: u16, algorithmtype: u8, clusterbits: u8) -> Vec<u8> {
    let mut h = Vec::with_capacity(8);
    h.extend_from_slice(&fragmentoff.to_le_bytes());
    h.extend_from_slice(&advise.to_le_bytes());
    h.push(algorithmtype);
    h.push(clusterbits);
    h
}

/// One 8-byte entry of a full (legacy) compression index.
pub fn full_index(advise: u16, clusterofs: u16, lo: u16, hi: u16) -> Vec<u8> {
    let mut e = Vec::with_capacity(8);
    e.extend_from_slice(&advise.to_le_bytes());
    e.extend_from_slice(&clusterofs.to_le_bytes());
    e.extend_from_slice(&lo.to_le_bytes());
    e.extend_from_slice(&hi.to_le_bytes());
    e
}

pub fn full_index_head(kind: u16, clusterofs: u16, blkaddr: u32) -> Vec<u8> {
    full_index(kind, clusterofs, blkaddr as u16, (blkaddr >> 16) as u16)
}

/// Right-align a compressed stream within `len` bytes of zero padding.
pub fn right_align(stream: &[u8], len: usize) -> Vec<u8> {
    assert!(stream.len() <= len, "stream does not fit its pcluster");
    let mut out = vec![0u8; len - stream.len()];
    out.extend_from_slice(stream);
    out
}

/// Deterministic mostly-incompressible bytes.
pub fn lcg_bytes(len: usize, mut seed: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
        out.push((seed >> 24) as u8);
    }
    out
}

/// Deterministic highly-compressible bytes.
pub fn text_bytes(len: usize) -> Vec<u8> {
    b"all work and no play makes jack a dull boy\n"
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}
