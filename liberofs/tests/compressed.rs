mod common;

use common::*;
use liberofs::types::Algorithm;
use liberofs::{Error, Filesystem, MapFlags};

const PLAIN: u16 = 0;
const HEAD1: u16 = 1;
const NONHEAD: u16 = 2;
const HEAD2: u16 = 3;
const CBLKCNT: u16 = 1 << 11;

const ADV_COMPACTED_2B: u16 = 0x0001;
const ADV_BIG_PCLUSTER_1: u16 = 0x0002;
const ADV_BIG_PCLUSTER_2: u16 = 0x0004;
const ADV_INLINE_PCLUSTER: u16 = 0x0008;
const ADV_INTERLACED_PCLUSTER: u16 = 0x0010;
const ADV_FRAGMENT_PCLUSTER: u16 = 0x0020;

const FT_BIG_PCLUSTER: u32 = 0x02;

fn mount(b: ImageBuilder) -> Filesystem<Vec<u8>> {
    Filesystem::mount(b.build()).unwrap()
}

fn root_only(b: &mut ImageBuilder) {
    let root = b.dir(0, &[]);
    b.root_nid = root as u16;
}

fn compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::block::compress(data)
}

fn read_all(fs: &Filesystem<Vec<u8>>, nid: u64, size: usize) -> Vec<u8> {
    let inode = fs.get_inode(nid).unwrap();
    let mut buf = vec![0u8; size];
    assert_eq!(fs.pread(&inode, &mut buf, 0).unwrap(), size);
    buf
}

/// One 4-byte-amortized compact pack: two 16-bit entries and a base block.
fn pack_4b(e0: u16, e1: u16, pblk_base: u32) -> Vec<u8> {
    let mut out = (e0 as u32 | (e1 as u32) << 16).to_le_bytes().to_vec();
    out.extend_from_slice(&pblk_base.to_le_bytes());
    out
}

/// One 2-byte-amortized compact pack: sixteen 14-bit entries and a base
/// block, 32 bytes in all.
fn pack_2b(entries: &[u16; 16], pblk_base: u32) -> Vec<u8> {
    let mut out = vec![0u8; 28];
    for (i, &e) in entries.iter().enumerate() {
        let bit = i * 14;
        let byte = bit / 8;
        let v = (e as u32) << (bit & 7);
        out[byte] |= v as u8;
        out[byte + 1] |= (v >> 8) as u8;
        if byte + 2 < 28 {
            out[byte + 2] |= (v >> 16) as u8;
        }
    }
    out.extend_from_slice(&pblk_base.to_le_bytes());
    out
}

#[test]
fn lz4_single_lcluster_extent() {
    let mut b = ImageBuilder::new();
    b.feature_incompat |= ZERO_PADDING;
    let content = text_bytes(3000);
    let c = compress(&content);
    assert!(c.len() <= BLKSZ);
    let p = b.add_blocks(&right_align(&c, BLKSZ));

    let mut trailing = zmap_header(0, 0, 0, 0);
    trailing.extend_from_slice(&[0u8; 8]);
    trailing.extend_from_slice(&full_index_head(HEAD1, 0, p));
    let nid = b.inode(LAYOUT_COMPRESSED_FULL, S_IFREG, 3000, 0, &trailing);
    root_only(&mut b);
    let fs = mount(b);
    let inode = fs.get_inode(nid).unwrap();

    let map = fs.map_blocks(&inode, 0).unwrap();
    assert!(map.flags.contains(MapFlags::ENCODED));
    assert_eq!(map.logical_start, 0);
    assert_eq!(map.logical_len, BLKSZ as u64);
    assert_eq!(map.physical_start, (p as u64) << 12);
    assert_eq!(map.physical_len, BLKSZ as u64);

    assert_eq!(read_all(&fs, nid, 3000), content);

    // mid-file read decodes through the cached pcluster
    let mut buf = vec![0u8; 500];
    assert_eq!(fs.pread(&inode, &mut buf, 1111).unwrap(), 500);
    assert_eq!(buf, &content[1111..1611]);
    assert_eq!(fs.pread(&inode, &mut buf, 1111).unwrap(), 500);
    assert_eq!(buf, &content[1111..1611]);
}

#[test]
fn big_pcluster_with_lookback() {
    let mut b = ImageBuilder::new();
    b.feature_incompat |= ZERO_PADDING | FT_BIG_PCLUSTER;
    let mut e1 = lcg_bytes(4396, 3);
    e1.extend_from_slice(&text_bytes(4396));
    let e2 = lcg_bytes(1200, 9);

    let c1 = compress(&e1);
    assert!(c1.len() > BLKSZ && c1.len() <= 2 * BLKSZ);
    let c2 = compress(&e2);
    assert!(c2.len() <= BLKSZ);
    let p = b.add_blocks(&right_align(&c1, 2 * BLKSZ));
    let q = b.add_blocks(&right_align(&c2, BLKSZ));

    // lcluster 1 carries the compressed block count of the first pcluster
    let mut trailing = zmap_header(0, ADV_BIG_PCLUSTER_1, 0, 0);
    trailing.extend_from_slice(&[0u8; 8]);
    trailing.extend_from_slice(&full_index_head(HEAD1, 0, p));
    trailing.extend_from_slice(&full_index(NONHEAD, 0, CBLKCNT | 2, 1));
    trailing.extend_from_slice(&full_index_head(HEAD1, 600, q));
    let size = 9992u64;
    let nid = b.inode(LAYOUT_COMPRESSED_FULL, S_IFREG, size, 0, &trailing);
    root_only(&mut b);
    let fs = mount(b);
    let inode = fs.get_inode(nid).unwrap();

    // backward walk tiles the file into exactly two extents
    let mut end = size;
    let mut extents = Vec::new();
    while end > 0 {
        let map = fs.map_blocks(&inode, end - 1).unwrap();
        assert!(map.is_mapped());
        extents.push((map.logical_start, map.logical_len, map.physical_len));
        end = map.logical_start;
    }
    assert_eq!(
        extents,
        [(8792, 3496, BLKSZ as u64), (0, 8792, 2 * BLKSZ as u64)]
    );
    // an offset past the first extent's lclusters resolves through the
    // lookback walk and is known to be fully mapped
    let map = fs.map_blocks(&inode, 8300).unwrap();
    assert!(map.flags.contains(MapFlags::FULL_MAPPED));
    assert_eq!(map.physical_start, (p as u64) << 12);

    let mut expected = e1.clone();
    expected.extend_from_slice(&e2);
    assert_eq!(read_all(&fs, nid, size as usize), expected);

    // a read spanning the extent boundary
    let mut buf = vec![0u8; 1500];
    assert_eq!(fs.pread(&inode, &mut buf, 8000).unwrap(), 1500);
    assert_eq!(buf, &expected[8000..9500]);
}

#[test]
fn compact_index_resolves_head_blocks() {
    let mut b = ImageBuilder::new();
    b.feature_incompat |= ZERO_PADDING;
    let content = text_bytes(8092);
    let c1 = compress(&content[..BLKSZ]);
    let c2 = compress(&content[BLKSZ..]);
    assert!(c1.len() <= BLKSZ && c2.len() <= BLKSZ);
    let b1 = b.add_blocks(&right_align(&c1, BLKSZ));
    let b2 = b.add_blocks(&right_align(&c2, BLKSZ));
    assert_eq!(b2, b1 + 1);

    // one 8-byte pack: two 16-bit entries (HEAD1, clusterofs 0), then the
    // base block address the head walk counts up from
    let entries: u32 = (1 << 12) | (1 << (12 + 16));
    let mut trailing = zmap_header(0, 0, 0, 0);
    trailing.extend_from_slice(&entries.to_le_bytes());
    trailing.extend_from_slice(&(b1 - 1).to_le_bytes());
    let nid = b.inode(LAYOUT_COMPRESSED_COMPACT, S_IFREG, 8092, 0, &trailing);
    root_only(&mut b);
    let fs = mount(b);
    let inode = fs.get_inode(nid).unwrap();

    let map = fs.map_blocks(&inode, 0).unwrap();
    assert_eq!(map.physical_start, (b1 as u64) << 12);
    let map = fs.map_blocks(&inode, BLKSZ as u64).unwrap();
    assert_eq!(map.logical_start, BLKSZ as u64);
    assert_eq!(map.physical_start, (b2 as u64) << 12);

    assert_eq!(read_all(&fs, nid, 8092), content);
}

#[test]
fn compact_2b_packs_with_big_pclusters() {
    let mut b = ImageBuilder::new();
    b.feature_incompat |= ZERO_PADDING | FT_BIG_PCLUSTER;

    // six single-block extents fill the 4-byte-amortized opening run
    let first = DATA_START_BLK;
    let mut openers = Vec::new();
    for k in 0..6u8 {
        let mut e = vec![k; 8];
        e.extend_from_slice(&text_bytes(BLKSZ - 8));
        let c = compress(&e);
        assert!(c.len() <= BLKSZ);
        b.add_blocks(&right_align(&c, BLKSZ));
        openers.push(e);
    }

    // the 2-byte pack then holds a two-block pcluster and a long extent
    // whose one-block pcluster is sized from a CBLKCNT entry
    let mut e6 = lcg_bytes(5000, 21);
    e6.extend_from_slice(&text_bytes(8088));
    let e9 = text_bytes(50352);
    let c6 = compress(&e6);
    assert!(c6.len() > BLKSZ && c6.len() <= 2 * BLKSZ);
    let c9 = compress(&e9);
    assert!(c9.len() <= BLKSZ);
    let p6 = b.add_blocks(&right_align(&c6, 2 * BLKSZ));
    let p9 = b.add_blocks(&right_align(&c9, BLKSZ));
    assert_eq!(p6, first + 6);
    assert_eq!(p9, p6 + 2);

    let head1 = |ofs: u16| (1u16 << 12) | ofs;
    let nonhead = |lo: u16| (2u16 << 12) | lo;
    let mut entries = [0u16; 16];
    entries[0] = head1(0);
    entries[1] = nonhead(CBLKCNT | 2);
    entries[2] = nonhead(2);
    entries[3] = head1(800);
    entries[4] = nonhead(CBLKCNT | 1);
    for d in 2..=11u16 {
        entries[3 + d as usize] = nonhead(d);
    }
    // the last slot carries the forward delta; its lookback distance is
    // recovered from the slot before it
    entries[15] = nonhead(0);

    let advise = ADV_COMPACTED_2B | ADV_BIG_PCLUSTER_1 | ADV_BIG_PCLUSTER_2;
    let mut trailing = zmap_header(0, advise, 0, 0);
    for k in 0..3u32 {
        trailing.extend_from_slice(&pack_4b(head1(0), head1(0), first + 2 * k));
    }
    trailing.extend_from_slice(&pack_2b(&entries, p6));
    let size = 88016u64;
    let nid = b.inode(LAYOUT_COMPRESSED_COMPACT, S_IFREG, size, 0, &trailing);
    root_only(&mut b);
    let fs = mount(b);
    let inode = fs.get_inode(nid).unwrap();

    // head block addresses are rebuilt by counting pcluster blocks
    // backward through each pack
    let map = fs.map_blocks(&inode, 5 * BLKSZ as u64 + 10).unwrap();
    assert_eq!(map.physical_start, ((first + 5) as u64) << 12);
    let map = fs.map_blocks(&inode, 24576 + 100).unwrap();
    assert_eq!(map.logical_start, 24576);
    assert_eq!(map.physical_start, (p6 as u64) << 12);
    assert_eq!(map.physical_len, 2 * BLKSZ as u64);
    let map = fs.map_blocks(&inode, 40000).unwrap();
    assert_eq!(map.logical_start, 9 * BLKSZ as u64 + 800);
    assert_eq!(map.physical_start, (p9 as u64) << 12);
    assert_eq!(map.physical_len, BLKSZ as u64);
    let map = fs.map_blocks(&inode, 87000).unwrap();
    assert_eq!(map.logical_start, 9 * BLKSZ as u64 + 800);
    assert_eq!(map.physical_start, (p9 as u64) << 12);

    let mut expected = Vec::new();
    for e in &openers {
        expected.extend_from_slice(e);
    }
    expected.extend_from_slice(&e6);
    expected.extend_from_slice(&e9);
    assert_eq!(read_all(&fs, nid, size as usize), expected);

    let mut buf = vec![0u8; 2000];
    assert_eq!(fs.pread(&inode, &mut buf, 60000).unwrap(), 2000);
    assert_eq!(buf, &expected[60000..62000]);
}

#[test]
fn interlaced_uncompressed_extent() {
    let mut b = ImageBuilder::new();
    b.feature_incompat |= ZERO_PADDING;
    let e1 = text_bytes(4696);
    let e2 = lcg_bytes(800, 13);
    let c1 = compress(&e1);
    assert!(c1.len() <= BLKSZ);
    let p = b.add_blocks(&right_align(&c1, BLKSZ));
    // interlaced: byte at logical offset la sits at la % 4096 in its block
    let mut rotated = vec![0u8; BLKSZ];
    rotated[600..1400].copy_from_slice(&e2);
    let q = b.add_blocks(&rotated);

    let mut trailing = zmap_header(0, ADV_INTERLACED_PCLUSTER, 0, 0);
    trailing.extend_from_slice(&[0u8; 8]);
    trailing.extend_from_slice(&full_index_head(HEAD1, 0, p));
    trailing.extend_from_slice(&full_index_head(PLAIN, 600, q));
    let size = 5496u64;
    let nid = b.inode(LAYOUT_COMPRESSED_FULL, S_IFREG, size, 0, &trailing);
    root_only(&mut b);
    let fs = mount(b);

    let mut expected = e1.clone();
    expected.extend_from_slice(&e2);
    assert_eq!(read_all(&fs, nid, size as usize), expected);

    let inode = fs.get_inode(nid).unwrap();
    let mut buf = vec![0u8; 400];
    assert_eq!(fs.pread(&inode, &mut buf, 4500).unwrap(), 400);
    assert_eq!(buf, &expected[4500..4900]);
}

#[test]
fn deflate_extent() {
    let mut b = ImageBuilder::new();
    let content = text_bytes(3000);
    let c = miniz_oxide::deflate::compress_to_vec(&content, 6);
    assert!(c.len() <= BLKSZ);
    let mut block = c;
    block.resize(BLKSZ, 0);
    let p = b.add_blocks(&block);

    let mut trailing = zmap_header(0, 0, 2, 0); // head1 algorithm: deflate
    trailing.extend_from_slice(&[0u8; 8]);
    trailing.extend_from_slice(&full_index_head(HEAD1, 0, p));
    let nid = b.inode(LAYOUT_COMPRESSED_FULL, S_IFREG, 3000, 0, &trailing);
    root_only(&mut b);
    let fs = mount(b);

    assert_eq!(read_all(&fs, nid, 3000), content);
}

#[test]
fn head2_extents_use_the_second_algorithm() {
    let mut b = ImageBuilder::new();
    b.feature_incompat |= ZERO_PADDING;
    let e1 = text_bytes(4596);
    let e2 = lcg_bytes(900, 5);
    let c1 = compress(&e1);
    assert!(c1.len() <= BLKSZ);
    let c2 = miniz_oxide::deflate::compress_to_vec(&e2, 6);
    assert!(c2.len() <= BLKSZ);
    let p = b.add_blocks(&right_align(&c1, BLKSZ));
    let mut block = c2;
    block.resize(BLKSZ, 0);
    let q = b.add_blocks(&block);

    // head1 algorithm lz4, head2 algorithm deflate
    let mut trailing = zmap_header(0, 0, 0x20, 0);
    trailing.extend_from_slice(&[0u8; 8]);
    trailing.extend_from_slice(&full_index_head(HEAD1, 0, p));
    trailing.extend_from_slice(&full_index_head(HEAD2, 500, q));
    let size = 5496u64;
    let nid = b.inode(LAYOUT_COMPRESSED_FULL, S_IFREG, size, 0, &trailing);
    root_only(&mut b);
    let fs = mount(b);
    let inode = fs.get_inode(nid).unwrap();

    let map = fs.map_blocks(&inode, 5000).unwrap();
    assert_eq!(map.logical_start, 4596);
    assert_eq!(map.algorithm, Some(Algorithm::Deflate));
    assert_eq!(map.physical_start, (q as u64) << 12);
    assert_eq!(map.physical_len, BLKSZ as u64);
    let map = fs.map_blocks(&inode, 100).unwrap();
    assert_eq!(map.algorithm, Some(Algorithm::Lz4));

    let mut expected = e1.clone();
    expected.extend_from_slice(&e2);
    assert_eq!(read_all(&fs, nid, size as usize), expected);

    // a read spanning the algorithm switch
    let mut buf = vec![0u8; 1000];
    assert_eq!(fs.pread(&inode, &mut buf, 4000).unwrap(), 1000);
    assert_eq!(buf, &expected[4000..5000]);
}

#[test]
fn tail_packed_pcluster_reads_from_metadata() {
    let mut b = ImageBuilder::new();
    b.feature_incompat |= ZERO_PADDING | ZTAILPACKING;
    let e1 = text_bytes(BLKSZ);
    let tail = text_bytes(300);
    let c1 = compress(&e1);
    assert!(c1.len() <= BLKSZ);
    let ct = compress(&tail);
    let p = b.add_blocks(&right_align(&c1, BLKSZ));

    let mut trailing = zmap_header((ct.len() as u32) << 16, ADV_INLINE_PCLUSTER, 0, 0);
    trailing.extend_from_slice(&[0u8; 8]);
    trailing.extend_from_slice(&full_index_head(HEAD1, 0, p));
    trailing.extend_from_slice(&full_index_head(HEAD1, 0, 0));
    trailing.extend_from_slice(&ct);
    let size = BLKSZ as u64 + 300;
    let nid = b.inode(LAYOUT_COMPRESSED_FULL, S_IFREG, size, 0, &trailing);
    root_only(&mut b);
    let fs = mount(b);
    let inode = fs.get_inode(nid).unwrap();

    // the tail extent resolves into the metadata area after the indexes
    let map = fs.map_blocks(&inode, BLKSZ as u64 + 10).unwrap();
    assert!(map.flags.contains(MapFlags::META));
    let iloc = BLKSZ as u64 + nid * 32;
    assert_eq!(map.physical_start, iloc + 96);
    assert_eq!(map.physical_len, ct.len() as u64);

    let mut expected = e1.clone();
    expected.extend_from_slice(&tail);
    assert_eq!(read_all(&fs, nid, size as usize), expected);
}

#[test]
fn whole_file_fragment_reads_the_packed_inode() {
    let mut b = ImageBuilder::new();
    b.feature_incompat |= FRAGMENTS;
    let packed_content = lcg_bytes(600, 11);
    let packed = b.file_inline(&packed_content);
    b.packed_nid = packed;

    // bit 63 marks a whole-file fragment; the rest is the packed offset
    let trailing = (100u64 | (1u64 << 63)).to_le_bytes();
    let nid = b.inode(LAYOUT_COMPRESSED_FULL, S_IFREG, 300, 0, &trailing);
    root_only(&mut b);
    let fs = mount(b);
    let inode = fs.get_inode(nid).unwrap();

    let map = fs.map_blocks(&inode, 0).unwrap();
    assert!(map.flags.contains(MapFlags::FRAGMENT));
    assert_eq!(map.logical_len, 300);

    assert_eq!(read_all(&fs, nid, 300), &packed_content[100..400]);
    let mut buf = vec![0u8; 100];
    assert_eq!(fs.pread(&inode, &mut buf, 50).unwrap(), 100);
    assert_eq!(buf, &packed_content[150..250]);
}

#[test]
fn fragment_tail_reads_the_packed_inode() {
    let mut b = ImageBuilder::new();
    b.feature_incompat |= ZERO_PADDING | FRAGMENTS;
    let packed_content = lcg_bytes(700, 17);
    let packed = b.file_inline(&packed_content);
    b.packed_nid = packed;

    let e1 = text_bytes(BLKSZ);
    let c1 = compress(&e1);
    assert!(c1.len() <= BLKSZ);
    let p = b.add_blocks(&right_align(&c1, BLKSZ));

    // only the tail extent is deduplicated into the packed inode
    let mut trailing = zmap_header(250, ADV_FRAGMENT_PCLUSTER, 0, 0);
    trailing.extend_from_slice(&[0u8; 8]);
    trailing.extend_from_slice(&full_index_head(HEAD1, 0, p));
    trailing.extend_from_slice(&full_index_head(HEAD1, 0, 0));
    let size = BLKSZ as u64 + 300;
    let nid = b.inode(LAYOUT_COMPRESSED_FULL, S_IFREG, size, 0, &trailing);
    root_only(&mut b);
    let fs = mount(b);
    let inode = fs.get_inode(nid).unwrap();

    let map = fs.map_blocks(&inode, BLKSZ as u64 + 10).unwrap();
    assert!(map.flags.contains(MapFlags::FRAGMENT));
    assert_eq!(map.logical_start, BLKSZ as u64);
    let map = fs.map_blocks(&inode, 100).unwrap();
    assert!(!map.flags.contains(MapFlags::FRAGMENT));

    let mut expected = e1.clone();
    expected.extend_from_slice(&packed_content[250..550]);
    assert_eq!(read_all(&fs, nid, size as usize), expected);

    // a read inside the tail lands at the matching packed offset
    let mut buf = vec![0u8; 100];
    assert_eq!(fs.pread(&inode, &mut buf, 4200).unwrap(), 100);
    assert_eq!(buf, &packed_content[354..454]);
}

#[test]
fn fragment_offset_high_bits_come_from_the_tail_index() {
    let mut b = ImageBuilder::new();
    b.feature_incompat |= FRAGMENTS;
    let packed = b.file_inline(&lcg_bytes(700, 17));
    b.packed_nid = packed;

    // a nonzero block field in the tail head lifts the 64-bit fragment
    // offset far past the packed inode
    let mut trailing = zmap_header(250, ADV_FRAGMENT_PCLUSTER, 0, 0);
    trailing.extend_from_slice(&[0u8; 8]);
    trailing.extend_from_slice(&full_index_head(HEAD1, 0, 0));
    trailing.extend_from_slice(&full_index_head(HEAD1, 0, 1));
    let size = BLKSZ as u64 + 300;
    let nid = b.inode(LAYOUT_COMPRESSED_FULL, S_IFREG, size, 0, &trailing);
    root_only(&mut b);
    let fs = mount(b);
    let inode = fs.get_inode(nid).unwrap();

    let mut buf = vec![0u8; 100];
    assert!(matches!(
        fs.pread(&inode, &mut buf, BLKSZ as u64 + 10),
        Err(Error::CorruptImage(_))
    ));
}

#[test]
fn lookback_at_the_first_lcluster_is_corrupt() {
    let mut b = ImageBuilder::new();
    let p = b.add_blocks(&[0u8; BLKSZ]);
    let mut trailing = zmap_header(0, 0, 0, 0);
    trailing.extend_from_slice(&[0u8; 8]);
    trailing.extend_from_slice(&full_index_head(HEAD1, 600, p));
    let nid = b.inode(LAYOUT_COMPRESSED_FULL, S_IFREG, 4096, 0, &trailing);
    root_only(&mut b);
    let fs = mount(b);
    let inode = fs.get_inode(nid).unwrap();

    assert!(matches!(
        fs.map_blocks(&inode, 100),
        Err(Error::CorruptImage(_))
    ));
}

#[test]
fn zero_lookback_delta_is_corrupt() {
    let mut b = ImageBuilder::new();
    let p = b.add_blocks(&[0u8; BLKSZ]);
    let mut trailing = zmap_header(0, 0, 0, 0);
    trailing.extend_from_slice(&[0u8; 8]);
    trailing.extend_from_slice(&full_index_head(HEAD1, 0, p));
    trailing.extend_from_slice(&full_index(NONHEAD, 0, 0, 0));
    let nid = b.inode(LAYOUT_COMPRESSED_FULL, S_IFREG, 8192, 0, &trailing);
    root_only(&mut b);
    let fs = mount(b);
    let inode = fs.get_inode(nid).unwrap();

    assert!(matches!(
        fs.map_blocks(&inode, 5000),
        Err(Error::CorruptImage(_))
    ));
}

#[test]
fn asymmetric_big_pcluster_advise_is_corrupt() {
    let mut b = ImageBuilder::new();
    b.feature_incompat |= FT_BIG_PCLUSTER;
    // compact indexes require the two big-pcluster bits to agree
    let entries: u32 = (1 << 12) | (1 << (12 + 16));
    let mut trailing = zmap_header(0, ADV_BIG_PCLUSTER_1, 0, 0);
    trailing.extend_from_slice(&entries.to_le_bytes());
    trailing.extend_from_slice(&DATA_START_BLK.to_le_bytes());
    let nid = b.inode(LAYOUT_COMPRESSED_COMPACT, S_IFREG, 4096, 0, &trailing);
    root_only(&mut b);
    let fs = mount(b);
    let inode = fs.get_inode(nid).unwrap();

    assert!(matches!(
        fs.map_blocks(&inode, 0),
        Err(Error::CorruptImage(_))
    ));
}

#[test]
fn block_count_without_big_pclusters_is_corrupt() {
    let mut b = ImageBuilder::new();
    let p = b.add_blocks(&[0u8; BLKSZ]);
    let mut trailing = zmap_header(0, 0, 0, 0);
    trailing.extend_from_slice(&[0u8; 8]);
    trailing.extend_from_slice(&full_index_head(HEAD1, 0, p));
    trailing.extend_from_slice(&full_index(NONHEAD, 0, CBLKCNT | 2, 1));
    let nid = b.inode(LAYOUT_COMPRESSED_FULL, S_IFREG, 8192, 0, &trailing);
    root_only(&mut b);
    let fs = mount(b);
    let inode = fs.get_inode(nid).unwrap();

    assert!(matches!(
        fs.map_blocks(&inode, 5000),
        Err(Error::CorruptImage(_))
    ));
}

#[test]
fn bogus_cluster_offset_is_corrupt() {
    let mut b = ImageBuilder::new();
    let p = b.add_blocks(&[0u8; BLKSZ]);
    let mut trailing = zmap_header(0, 0, 0, 0);
    trailing.extend_from_slice(&[0u8; 8]);
    trailing.extend_from_slice(&full_index_head(HEAD1, 5000, p));
    let nid = b.inode(LAYOUT_COMPRESSED_FULL, S_IFREG, 4096, 0, &trailing);
    root_only(&mut b);
    let fs = mount(b);
    let inode = fs.get_inode(nid).unwrap();

    assert!(matches!(
        fs.map_blocks(&inode, 100),
        Err(Error::CorruptImage(_))
    ));
}

#[test]
fn lzma_extents_are_unsupported() {
    let mut b = ImageBuilder::new();
    let p = b.add_blocks(&[0u8; BLKSZ]);
    let mut trailing = zmap_header(0, 0, 1, 0); // head1 algorithm: lzma
    trailing.extend_from_slice(&[0u8; 8]);
    trailing.extend_from_slice(&full_index_head(HEAD1, 0, p));
    let nid = b.inode(LAYOUT_COMPRESSED_FULL, S_IFREG, 3000, 0, &trailing);
    root_only(&mut b);
    let fs = mount(b);
    let inode = fs.get_inode(nid).unwrap();

    let mut buf = vec![0u8; 3000];
    assert!(matches!(
        fs.pread(&inode, &mut buf, 0),
        Err(Error::UnsupportedFeature(_))
    ));
}
