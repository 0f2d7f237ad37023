//! Decoders for compressed extents.
//!
//! Every request describes one pcluster: `input` holds the raw on-disk
//! bytes, `out` receives bytes `decoded_skip..decoded_len` of the decoded
//! extent. `partial` marks extents whose decoded size exceeds
//! `decoded_len`, so decoders must tolerate streams that keep going.

use lz4_flex::block::DecompressError;
use miniz_oxide::inflate::core::{decompress as inflate, inflate_flags, DecompressorOxide};
use miniz_oxide::inflate::TINFLStatus;

use crate::types::{Algorithm, BLOCK_SIZE, Z_EROFS_PCLUSTER_MAX_DSIZE};
use crate::{Error, Result};

pub(crate) struct DecompressRequest<'a, 'b> {
    pub(crate) input: &'a [u8],
    pub(crate) out: &'b mut [u8],
    pub(crate) decoded_skip: usize,
    pub(crate) decoded_len: usize,
    /// Block offset of the extent's logical start; only meaningful for
    /// interlaced extents.
    pub(crate) interlaced_offset: usize,
    pub(crate) algorithm: Algorithm,
    pub(crate) partial: bool,
    /// Whether compressed data is left-aligned with leading zero padding.
    pub(crate) zero_padding: bool,
}

/// Decode one extent. Returns the full decoded scratch buffer when one was
/// needed, so callers can cache it.
pub(crate) fn decompress(req: DecompressRequest<'_, '_>) -> Result<Option<Vec<u8>>> {
    match req.algorithm {
        Algorithm::Interlaced => interlaced(req).map(|()| None),
        Algorithm::Shifted => shifted(req).map(|()| None),
        Algorithm::Lz4 => lz4(req),
        Algorithm::Deflate => deflate(req),
        Algorithm::Lzma | Algorithm::Zstd => Err(Error::UnsupportedFeature(format!(
            "{:?} decompression",
            req.algorithm
        ))),
    }
}

/// An uncompressed pcluster stored rotated so its head is block-aligned;
/// decoding is a rotation by the extent's block offset.
fn interlaced(req: DecompressRequest<'_, '_>) -> Result<()> {
    if req.input.len() > BLOCK_SIZE
        || req.decoded_len > BLOCK_SIZE
        || req.decoded_len < req.decoded_skip
    {
        return Err(Error::CorruptImage("bogus interlaced extent shape".into()));
    }
    let count = req.decoded_len - req.decoded_skip;
    let skip = (req.interlaced_offset + req.decoded_skip) % BLOCK_SIZE;
    let right = (BLOCK_SIZE - skip).min(count);
    if skip + right > req.input.len() || count - right > req.input.len() {
        return Err(Error::CorruptImage(
            "interlaced extent overruns its input".into(),
        ));
    }
    req.out[..right].copy_from_slice(&req.input[skip..skip + right]);
    req.out[right..count].copy_from_slice(&req.input[..count - right]);
    Ok(())
}

/// An uncompressed pcluster stored as-is.
fn shifted(req: DecompressRequest<'_, '_>) -> Result<()> {
    if req.decoded_len > req.input.len() || req.decoded_len < req.decoded_skip {
        return Err(Error::CorruptImage(
            "bogus uncompressed extent shape".into(),
        ));
    }
    req.out
        .copy_from_slice(&req.input[req.decoded_skip..req.decoded_len]);
    Ok(())
}

fn lz4(req: DecompressRequest<'_, '_>) -> Result<Option<Vec<u8>>> {
    let mut margin = 0usize;
    if req.zero_padding {
        // compressed data is right-aligned within its blocks; skip the
        // leading padding, which never spans a whole block
        let limit = req.input.len().min(BLOCK_SIZE);
        while margin < limit && req.input[margin] == 0 {
            margin += 1;
        }
        if margin >= req.input.len() {
            return Err(Error::CorruptImage(
                "compressed extent is all padding".into(),
            ));
        }
    }
    let src = &req.input[margin..];
    let out = req.out;

    if !req.partial && req.decoded_skip == 0 {
        let n = lz4_flex::block::decompress_into(src, out)
            .map_err(|e| Error::DecompressionFailed(format!("lz4: {e}")))?;
        if n != req.decoded_len {
            return Err(Error::DecompressionFailed(format!(
                "lz4 produced {n} bytes, expected {}",
                req.decoded_len
            )));
        }
        return Ok(None);
    }

    let mut scratch = vec![0u8; req.decoded_len];
    let n = loop {
        match lz4_flex::block::decompress_into(src, &mut scratch) {
            Ok(n) => break n,
            Err(DecompressError::OutputTooSmall { expected, .. }) if req.partial => {
                if expected > Z_EROFS_PCLUSTER_MAX_DSIZE || expected <= scratch.len() {
                    return Err(Error::CorruptImage(format!(
                        "lz4 stream demands {expected} decoded bytes"
                    )));
                }
                scratch.resize(expected, 0);
            }
            Err(e) => return Err(Error::DecompressionFailed(format!("lz4: {e}"))),
        }
    };
    if n < req.decoded_len {
        return Err(Error::DecompressionFailed(format!(
            "lz4 produced {n} bytes, expected at least {}",
            req.decoded_len
        )));
    }
    out.copy_from_slice(&scratch[req.decoded_skip..req.decoded_len]);
    scratch.truncate(n);
    Ok(Some(scratch))
}

fn deflate(req: DecompressRequest<'_, '_>) -> Result<Option<Vec<u8>>> {
    let out = req.out;
    let run = |buf: &mut [u8]| -> Result<usize> {
        let mut state = DecompressorOxide::new();
        // raw deflate stream, decoded in one shot into a caller buffer
        let (status, _consumed, produced) = inflate(
            &mut state,
            req.input,
            buf,
            0,
            inflate_flags::TINFL_FLAG_USING_NON_WRAPPING_OUTPUT_BUF,
        );
        match status {
            TINFLStatus::Done => Ok(produced),
            TINFLStatus::HasMoreOutput if req.partial && produced == buf.len() => Ok(produced),
            status => Err(Error::DecompressionFailed(format!("deflate: {status:?}"))),
        }
    };

    if req.decoded_skip == 0 {
        let n = run(out)?;
        if n != req.decoded_len {
            return Err(Error::DecompressionFailed(format!(
                "deflate produced {n} bytes, expected {}",
                req.decoded_len
            )));
        }
        return Ok(None);
    }
    let mut scratch = vec![0u8; req.decoded_len];
    let n = run(&mut scratch)?;
    if n != req.decoded_len {
        return Err(Error::DecompressionFailed(format!(
            "deflate produced {n} bytes, expected {}",
            req.decoded_len
        )));
    }
    out.copy_from_slice(&scratch[req.decoded_skip..req.decoded_len]);
    Ok(Some(scratch))
}
