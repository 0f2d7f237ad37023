//! Extent mapping and data reads for the compressed layouts.
//!
//! Compressed inodes carry a per-lcluster index after their map header.
//! Mapping a logical address means locating its lcluster, walking back over
//! NONHEAD entries to the head of the pcluster, then sizing the compressed
//! extent. The full (8 bytes per lcluster) and compact (bit-packed) index
//! encodings both funnel into [`Lcluster`] so the walk is shared.

use std::sync::Arc;

use tracing::trace;

use crate::decompress::{self, DecompressRequest};
use crate::device::ReadAt;
use crate::filesystem::{BlockMap, DecodedPcluster, Filesystem, MapFlags};
use crate::types::*;
use crate::{Error, Result};

/// Per-inode compression state, decoded from the map header on the first
/// compressed operation.
pub(crate) struct ZInfo {
    advise: ZAdvise,
    algorithm: [u8; 2],
    lclusterbits: u8,
    inline: Option<InlineTail>,
    fragment: Option<Fragment>,
}

/// Tail-packed (inline) pcluster: the last extent's compressed bytes live
/// in the metadata region right after the inode's index.
struct InlineTail {
    headlcn: u64,
    off: u64,
    len: u64,
}

/// Tail data deduplicated into the image-wide packed inode.
struct Fragment {
    headlcn: u64,
    off: u64,
}

/// One decoded lcluster index entry, in either index encoding.
#[derive(Debug, Clone, Copy)]
struct Lcluster {
    kind: u8,
    partial_ref: bool,
    clusterofs: u64,
    pblk: u32,
    delta0: u64,
    compressedblks: Option<u64>,
    nextpackoff: u64,
}

/// Outcome of resolving a logical offset to its pcluster head.
struct HeadState {
    head_lcn: u64,
    head_kind: u8,
    clusterofs: u64,
    pblk: u32,
    partial_ref: bool,
    compressedblks: Option<u64>,
    initial_nextpackoff: u64,
    end: u64,
    full_mapped: bool,
}

fn decode_compactedbits(lobits: u32, pack: &[u8], bit_pos: usize) -> (u64, u8) {
    let byte = bit_pos / 8;
    let mut raw = [0u8; 4];
    let n = (pack.len() - byte).min(4);
    raw[..n].copy_from_slice(&pack[byte..byte + n]);
    let v = u32::from_le_bytes(raw) >> (bit_pos & 7);
    let lo = (v & ((1u32 << lobits) - 1)) as u64;
    let kind = ((v >> lobits) & 3) as u8;
    (lo, kind)
}

impl<R: ReadAt> Filesystem<R> {
    /// Decode the compression map header of `inode`.
    pub(crate) fn zinfo(&self, inode: &Inode) -> Result<ZInfo> {
        let pos = (self.iloc(inode.nid()) + inode.inode_size() + inode.xattr_size())
            .next_multiple_of(8);
        let mut raw = [0u8; MapHeader::size()];
        self.dev_read(0, pos, &mut raw)?;

        // a set fragment-inode bit means the whole file lives in the packed
        // inode and the header bytes hold a 64-bit offset instead
        if (raw[7] >> Z_EROFS_FRAGMENT_INODE_BIT) != 0 {
            return Ok(ZInfo {
                advise: ZAdvise::FRAGMENT_PCLUSTER,
                algorithm: [0, 0],
                lclusterbits: BLKSZBITS,
                inline: None,
                fragment: Some(Fragment {
                    headlcn: 0,
                    off: whole_fragment_off(&raw),
                }),
            });
        }

        let h = MapHeader::read_from(&raw)?;
        Algorithm::from_format(h.algorithm_head1())?;
        Algorithm::from_format(h.algorithm_head2())?;
        if inode.layout()? == Layout::CompressedCompact
            && h.advise.contains(ZAdvise::BIG_PCLUSTER_1)
                != h.advise.contains(ZAdvise::BIG_PCLUSTER_2)
        {
            return Err(Error::CorruptImage(format!(
                "big pcluster head1/head2 advise mismatch @ nid {}",
                inode.nid()
            )));
        }

        let mut info = ZInfo {
            advise: h.advise,
            algorithm: [h.algorithm_head1(), h.algorithm_head2()],
            lclusterbits: h.lclusterbits(),
            inline: None,
            fragment: None,
        };

        let tail_flags = ZAdvise::INLINE_PCLUSTER | ZAdvise::FRAGMENT_PCLUSTER;
        if info.advise.intersects(tail_flags) && inode.data_size() > 0 {
            // probe the index at the last byte to locate the tail extent
            let tail = self.z_find_head(inode, &info, inode.data_size() - 1)?;
            if info.advise.contains(ZAdvise::INLINE_PCLUSTER) {
                let len = h.idata_size();
                if len == 0 || len > BLOCK_SIZE as u64 {
                    return Err(Error::CorruptImage(format!(
                        "bogus inline pcluster size {len} @ nid {}",
                        inode.nid()
                    )));
                }
                info.inline = Some(InlineTail {
                    headlcn: tail.head_lcn,
                    off: tail.initial_nextpackoff,
                    len,
                });
            }
            if info.advise.contains(ZAdvise::FRAGMENT_PCLUSTER) {
                let mut off = h.fragmentoff as u64;
                // full indexes store the upper half in the head's block field
                if inode.layout()? == Layout::CompressedFull {
                    off |= (tail.pblk as u64) << 32;
                }
                info.fragment = Some(Fragment {
                    headlcn: tail.head_lcn,
                    off,
                });
            }
        }
        Ok(info)
    }

    /// Map logical byte `la` of a compressed inode to its extent.
    pub(crate) fn z_map_blocks(&self, inode: &Inode, info: &ZInfo, la: u64) -> Result<BlockMap> {
        let size = inode.data_size();
        if la >= size {
            // out-of-bounds access stays unmapped, it is not an error
            return Ok(BlockMap::unmapped(size, la + 1 - size));
        }
        if info.advise.contains(ZAdvise::FRAGMENT_PCLUSTER)
            && info.fragment.as_ref().is_some_and(|f| f.headlcn == 0)
        {
            let mut map = BlockMap::unmapped(0, size);
            map.flags = MapFlags::MAPPED | MapFlags::FULL_MAPPED | MapFlags::FRAGMENT;
            return Ok(map);
        }
        let map = self.z_do_map_blocks(inode, info, la)?;
        trace!(
            la,
            m_la = map.logical_start,
            m_llen = map.logical_len,
            m_plen = map.physical_len,
            "compressed extent"
        );
        Ok(map)
    }

    fn z_do_map_blocks(&self, inode: &Inode, info: &ZInfo, la: u64) -> Result<BlockMap> {
        let bits = info.lclusterbits;
        let h = self.z_find_head(inode, info, la)?;

        let mut flags = MapFlags::MAPPED | MapFlags::ENCODED;
        if h.full_mapped {
            flags |= MapFlags::FULL_MAPPED;
        }
        if h.partial_ref {
            flags |= MapFlags::PARTIAL_REF;
        }
        let logical_start = (h.head_lcn << bits) | h.clusterofs;
        let mut map = BlockMap {
            logical_start,
            logical_len: h.end - logical_start,
            physical_start: 0,
            physical_len: 0,
            device_id: 0,
            algorithm: None,
            flags,
        };

        if let Some(tail) = info.inline.as_ref().filter(|t| t.headlcn == h.head_lcn) {
            map.physical_start = tail.off;
            map.physical_len = tail.len;
            map.flags |= MapFlags::META;
            if self.blk_off(tail.off) + tail.len > BLOCK_SIZE as u64 {
                return Err(Error::CorruptImage(format!(
                    "inline pcluster crosses a block boundary @ nid {}",
                    inode.nid()
                )));
            }
        } else if info
            .fragment
            .as_ref()
            .is_some_and(|f| f.headlcn == h.head_lcn)
        {
            map.flags |= MapFlags::FRAGMENT;
            return Ok(map);
        } else {
            map.physical_start = (h.pblk as u64) << BLKSZBITS;
            map.physical_len = self.z_extent_compressed_len(inode, info, &h)?;
        }

        map.algorithm = Some(match h.head_kind {
            Z_EROFS_LCLUSTER_TYPE_PLAIN => {
                if map.logical_len > map.physical_len {
                    return Err(Error::CorruptImage(format!(
                        "uncompressed extent shorter than its logical range @ nid {}",
                        inode.nid()
                    )));
                }
                if info.advise.contains(ZAdvise::INTERLACED_PCLUSTER) {
                    Algorithm::Interlaced
                } else {
                    Algorithm::Shifted
                }
            }
            Z_EROFS_LCLUSTER_TYPE_HEAD2 => Algorithm::from_format(info.algorithm[1])?,
            _ => Algorithm::from_format(info.algorithm[0])?,
        });
        Ok(map)
    }

    /// Locate the pcluster head covering byte `ofs`: load the lcluster it
    /// falls in, then walk back over NONHEAD entries.
    fn z_find_head(&self, inode: &Inode, info: &ZInfo, ofs: u64) -> Result<HeadState> {
        let bits = info.lclusterbits;
        let initial_lcn = ofs >> bits;
        let endoff = ofs & ((1u64 << bits) - 1);

        let mut lcn = initial_lcn;
        let mut m = self.load_lcluster(inode, info, lcn)?;
        let initial_nextpackoff = m.nextpackoff;
        let mut compressedblks = m.compressedblks;
        let mut end = (lcn + 1) << bits;
        let mut full_mapped = false;

        let lookback = match m.kind {
            Z_EROFS_LCLUSTER_TYPE_NONHEAD => Some(m.delta0),
            _ if endoff >= m.clusterofs => None,
            _ => {
                // the head of this lcluster starts past ofs, so the covering
                // extent must begin in an earlier lcluster
                if lcn == 0 {
                    return Err(Error::CorruptImage(format!(
                        "invalid lookback at lcluster 0 of nid {}",
                        inode.nid()
                    )));
                }
                end = (lcn << bits) | m.clusterofs;
                full_mapped = true;
                Some(1)
            }
        };

        if let Some(mut dist) = lookback {
            loop {
                if dist == 0 || lcn < dist {
                    return Err(Error::CorruptImage(format!(
                        "bogus lookback distance {dist} @ lcluster {lcn} of nid {}",
                        inode.nid()
                    )));
                }
                lcn -= dist;
                m = self.load_lcluster(inode, info, lcn)?;
                if m.compressedblks.is_some() {
                    compressedblks = m.compressedblks;
                }
                if m.kind == Z_EROFS_LCLUSTER_TYPE_NONHEAD {
                    dist = m.delta0;
                } else {
                    break;
                }
            }
        }

        Ok(HeadState {
            head_lcn: lcn,
            head_kind: m.kind,
            clusterofs: m.clusterofs,
            pblk: m.pblk,
            partial_ref: m.partial_ref,
            compressedblks,
            initial_nextpackoff,
            end,
            full_mapped,
        })
    }

    /// Size the compressed extent of a resolved head.
    fn z_extent_compressed_len(&self, inode: &Inode, info: &ZInfo, h: &HeadState) -> Result<u64> {
        let bits = info.lclusterbits;
        let big = match h.head_kind {
            Z_EROFS_LCLUSTER_TYPE_HEAD1 => info.advise.contains(ZAdvise::BIG_PCLUSTER_1),
            Z_EROFS_LCLUSTER_TYPE_HEAD2 => info.advise.contains(ZAdvise::BIG_PCLUSTER_2),
            _ => false,
        };
        if !big {
            return Ok(1u64 << bits);
        }
        let cblks = if let Some(cblks) = h.compressedblks {
            cblks
        } else {
            // the block count lives in the first NONHEAD after the head
            let m = self.load_lcluster(inode, info, h.head_lcn + 1)?;
            match m.kind {
                Z_EROFS_LCLUSTER_TYPE_NONHEAD => {
                    if m.delta0 != 1 {
                        return Err(Error::CorruptImage(format!(
                            "bogus CBLKCNT @ lcluster {} of nid {}",
                            h.head_lcn + 1,
                            inode.nid()
                        )));
                    }
                    m.compressedblks.ok_or_else(|| {
                        Error::CorruptImage(format!(
                            "cannot find CBLKCNT @ lcluster {} of nid {}",
                            h.head_lcn + 1,
                            inode.nid()
                        ))
                    })?
                }
                // a head right after means a single-lcluster pcluster
                _ => 1u64 << (bits - BLKSZBITS),
            }
        };
        let plen = cblks << BLKSZBITS;
        if plen as usize > Z_EROFS_PCLUSTER_MAX_SIZE {
            return Err(Error::CorruptImage(format!(
                "pcluster of {plen} bytes @ nid {}",
                inode.nid()
            )));
        }
        Ok(plen)
    }

    fn load_lcluster(&self, inode: &Inode, info: &ZInfo, lcn: u64) -> Result<Lcluster> {
        match inode.layout()? {
            Layout::CompressedFull => self.load_full_lcluster(inode, info, lcn),
            Layout::CompressedCompact => self.load_compact_lcluster(inode, info, lcn),
            layout => Err(Error::CorruptImage(format!(
                "lcluster load on uncompressed layout {layout:?} @ nid {}",
                inode.nid()
            ))),
        }
    }

    fn load_full_lcluster(&self, inode: &Inode, info: &ZInfo, lcn: u64) -> Result<Lcluster> {
        let base = (self.iloc(inode.nid()) + inode.inode_size() + inode.xattr_size())
            .next_multiple_of(8)
            + MapHeader::size() as u64
            + 8;
        let pos = base + lcn * 8;
        let mut buf = [0u8; 8];
        self.dev_read(0, pos, &mut buf)?;

        let advise = u16::from_le_bytes([buf[0], buf[1]]);
        let clusterofs = u16::from_le_bytes([buf[2], buf[3]]);
        let kind = (advise & Z_EROFS_LI_LCLUSTER_TYPE_MASK) as u8;
        let nextpackoff = pos + 8;

        if kind == Z_EROFS_LCLUSTER_TYPE_NONHEAD {
            let delta0 = u16::from_le_bytes([buf[4], buf[5]]);
            let mut out = Lcluster {
                kind,
                partial_ref: false,
                clusterofs: 1u64 << info.lclusterbits,
                pblk: 0,
                delta0: delta0 as u64,
                compressedblks: None,
                nextpackoff,
            };
            if delta0 & Z_EROFS_LI_D0_CBLKCNT != 0 {
                if !info
                    .advise
                    .intersects(ZAdvise::BIG_PCLUSTER_1 | ZAdvise::BIG_PCLUSTER_2)
                {
                    return Err(Error::CorruptImage(format!(
                        "CBLKCNT without big pcluster @ lcluster {lcn} of nid {}",
                        inode.nid()
                    )));
                }
                out.compressedblks = Some((delta0 & !Z_EROFS_LI_D0_CBLKCNT) as u64);
                out.delta0 = 1;
            }
            Ok(out)
        } else {
            if (clusterofs as u64) >= 1u64 << info.lclusterbits {
                return Err(Error::CorruptImage(format!(
                    "bogus cluster offset {clusterofs} @ lcluster {lcn} of nid {}",
                    inode.nid()
                )));
            }
            Ok(Lcluster {
                kind,
                partial_ref: advise & Z_EROFS_LI_PARTIAL_REF != 0,
                clusterofs: clusterofs as u64,
                pblk: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
                delta0: 0,
                compressedblks: None,
                nextpackoff,
            })
        }
    }

    fn load_compact_lcluster(&self, inode: &Inode, info: &ZInfo, lcn: u64) -> Result<Lcluster> {
        let lclusterbits = info.lclusterbits as u32;
        if lclusterbits > 14 {
            return Err(Error::UnsupportedFeature(format!(
                "compact index with lclusterbits {lclusterbits}"
            )));
        }
        let totalidx = inode.data_size().div_ceil(BLOCK_SIZE as u64);
        if lcn >= totalidx {
            return Err(Error::CorruptImage(format!(
                "lcluster {lcn} out of range @ nid {}",
                inode.nid()
            )));
        }
        let ebase = (self.iloc(inode.nid()) + inode.inode_size() + inode.xattr_size())
            .next_multiple_of(8)
            + MapHeader::size() as u64;

        // the index opens with up to seven 4-byte-amortized entries so the
        // 2-byte-amortized packs that follow are 32-byte aligned
        let mut compacted_4b_initial = (32 - ebase % 32) / 4;
        if compacted_4b_initial == 8 {
            compacted_4b_initial = 0;
        }
        let compacted_2b = if info.advise.contains(ZAdvise::COMPACTED_2B)
            && compacted_4b_initial < totalidx
        {
            (totalidx - compacted_4b_initial) & !15u64
        } else {
            0
        };

        let mut pos = ebase;
        let mut l = lcn;
        let amortizedshift;
        if l < compacted_4b_initial {
            amortizedshift = 2;
        } else {
            pos += compacted_4b_initial * 4;
            l -= compacted_4b_initial;
            if l < compacted_2b {
                amortizedshift = 1;
            } else {
                pos += compacted_2b * 2;
                l -= compacted_2b;
                amortizedshift = 2;
            }
        }
        pos += l << amortizedshift;

        let vcnt: u64 = if amortizedshift == 2 {
            2
        } else if lclusterbits <= 12 {
            16
        } else {
            return Err(Error::UnsupportedFeature(format!(
                "2-byte compact index with lclusterbits {lclusterbits}"
            )));
        };
        let packsz = vcnt << amortizedshift;
        let base = pos & !(packsz - 1);
        let nextpackoff = base + packsz;
        let lobits = lclusterbits.max(12);
        let encodebits = ((packsz - 4) * 8 / vcnt) as usize;

        let mut raw = [0u8; 32];
        let pack = &mut raw[..packsz as usize];
        self.dev_read(0, base, pack)?;
        let i = ((pos - base) >> amortizedshift) as i64;
        let big = info
            .advise
            .intersects(ZAdvise::BIG_PCLUSTER_1 | ZAdvise::BIG_PCLUSTER_2);

        let (lo, kind) = decode_compactedbits(lobits, pack, encodebits * i as usize);
        if kind == Z_EROFS_LCLUSTER_TYPE_NONHEAD {
            let mut out = Lcluster {
                kind,
                partial_ref: false,
                clusterofs: 1u64 << lclusterbits,
                pblk: 0,
                delta0: 0,
                compressedblks: None,
                nextpackoff,
            };
            if lo & Z_EROFS_LI_D0_CBLKCNT as u64 != 0 {
                if !big {
                    return Err(Error::CorruptImage(format!(
                        "CBLKCNT without big pcluster @ lcluster {lcn} of nid {}",
                        inode.nid()
                    )));
                }
                out.compressedblks = Some(lo & !(Z_EROFS_LI_D0_CBLKCNT as u64));
                out.delta0 = 1;
            } else if i as u64 + 1 != vcnt {
                out.delta0 = lo;
            } else {
                // the pack's last slot stores delta[1]; recover delta[0]
                // from the previous slot instead
                let (plo, pkind) =
                    decode_compactedbits(lobits, pack, encodebits * (i - 1) as usize);
                let prev = if pkind != Z_EROFS_LCLUSTER_TYPE_NONHEAD {
                    0
                } else if plo & Z_EROFS_LI_D0_CBLKCNT as u64 != 0 {
                    1
                } else {
                    plo
                };
                out.delta0 = prev + 1;
            }
            return Ok(out);
        }

        // HEAD entries store no block address of their own; count the
        // pcluster heads between the pack base and this entry and add that
        // to the pack's base block
        let mut nblk: u64 = if big { 0 } else { 1 };
        let mut j = i;
        while j > 0 {
            j -= 1;
            let (lo, kind) = decode_compactedbits(lobits, pack, encodebits * j as usize);
            if kind == Z_EROFS_LCLUSTER_TYPE_NONHEAD {
                if !big {
                    j -= lo as i64;
                    if j >= 0 {
                        nblk += 1;
                    }
                } else if lo & Z_EROFS_LI_D0_CBLKCNT as u64 != 0 {
                    j -= 1;
                    nblk += lo & !(Z_EROFS_LI_D0_CBLKCNT as u64);
                } else if lo <= 1 {
                    return Err(Error::CorruptImage(format!(
                        "bogus lookback delta {lo} in compact index @ nid {}",
                        inode.nid()
                    )));
                } else {
                    j -= lo as i64 - 2;
                }
            } else {
                nblk += 1;
            }
        }
        let n = pack.len();
        let pblk_base = u32::from_le_bytes([pack[n - 4], pack[n - 3], pack[n - 2], pack[n - 1]]);
        Ok(Lcluster {
            kind,
            partial_ref: false,
            clusterofs: lo,
            pblk: pblk_base + nblk as u32,
            delta0: 0,
            compressedblks: None,
            nextpackoff,
        })
    }

    /// Backward extent walk for compressed data: resolve the extent holding
    /// the last requested byte, decode it, then continue with what precedes.
    pub(crate) fn z_read_data(&self, inode: &Inode, buf: &mut [u8], offset: u64) -> Result<()> {
        let info = self.zinfo(inode)?;
        let mut end = offset + buf.len() as u64;
        while end > offset {
            let map = self.z_map_blocks(inode, &info, end - 1)?;
            let extent_end = map.logical_start + map.logical_len;
            let (length, trimmed) = if end < extent_end {
                (end - map.logical_start, true)
            } else if end == extent_end {
                (map.logical_len, false)
            } else {
                return Err(Error::CorruptImage(format!(
                    "extent does not reach offset {} of nid {}",
                    end - 1,
                    inode.nid()
                )));
            };
            let partial = trimmed
                || !map.flags.contains(MapFlags::FULL_MAPPED)
                || map.flags.contains(MapFlags::PARTIAL_REF);
            let skip = if map.logical_start < offset {
                end = offset;
                offset - map.logical_start
            } else {
                end = map.logical_start;
                0
            };
            let start = (end - offset) as usize;
            let out = &mut buf[start..start + (length - skip) as usize];

            if !map.is_mapped() {
                out.fill(0);
                continue;
            }

            if map.flags.contains(MapFlags::FRAGMENT) {
                let frag_off = info.fragment.as_ref().map(|f| f.off).ok_or_else(|| {
                    Error::CorruptImage(format!(
                        "fragment extent without fragment metadata @ nid {}",
                        inode.nid()
                    ))
                })?;
                let packed = self.get_inode(self.super_block().packed_nid)?;
                let n = self.pread(&packed, out, frag_off + skip)?;
                if n != out.len() {
                    return Err(Error::CorruptImage(format!(
                        "truncated packed inode data @ nid {}",
                        inode.nid()
                    )));
                }
                continue;
            }

            self.z_read_extent(inode, &map, out, skip as usize, length as usize, partial)?;
        }
        Ok(())
    }

    /// Read and decode one compressed extent into `out` (which holds bytes
    /// `skip..length` of the decoded extent).
    fn z_read_extent(
        &self,
        inode: &Inode,
        map: &BlockMap,
        out: &mut [u8],
        skip: usize,
        length: usize,
        partial: bool,
    ) -> Result<()> {
        {
            let cache = self.decoded_cache.lock();
            if let Some(c) = cache.as_ref() {
                if c.nid == inode.nid()
                    && c.logical_start == map.logical_start
                    && c.data.len() >= length
                {
                    out.copy_from_slice(&c.data[skip..length]);
                    return Ok(());
                }
            }
        }

        let algorithm = map.algorithm.ok_or_else(|| {
            Error::CorruptImage(format!(
                "encoded extent without an algorithm @ nid {}",
                inode.nid()
            ))
        })?;
        let mut raw = vec![0u8; map.physical_len as usize];
        let (device_id, pa) = if map.flags.contains(MapFlags::META) {
            (0, map.physical_start)
        } else {
            self.map_device(map.device_id, map.physical_start)?
        };
        self.dev_read(device_id, pa, &mut raw)?;

        let scratch = decompress::decompress(DecompressRequest {
            input: &raw,
            out,
            decoded_skip: skip,
            decoded_len: length,
            interlaced_offset: if algorithm == Algorithm::Interlaced {
                self.blk_off(map.logical_start) as usize
            } else {
                0
            },
            algorithm,
            partial,
            zero_padding: self.super_block().feature_incompat & FEATURE_INCOMPAT_ZERO_PADDING != 0,
        })?;
        if let Some(data) = scratch {
            *self.decoded_cache.lock() = Some(DecodedPcluster {
                nid: inode.nid(),
                logical_start: map.logical_start,
                data: Arc::new(data),
            });
        }
        Ok(())
    }
}
