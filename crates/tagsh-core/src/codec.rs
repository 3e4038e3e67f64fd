//! Raw deflate codec for tag payloads.
//!
//! Compression is never load-bearing: the `safe_*` wrappers hand back the
//! input unchanged when the transform fails, so a tag written by an older or
//! non-conforming writer (plain, uncompressed script bytes) still reads back.
//!
//! Residual risk: if a payload compresses fine but that specific output later
//! fails to inflate (for example a future writer using an incompatible
//! format), `safe_decompress` returns the compressed bytes as if they were the
//! script. The fallback only protects the pass-through case.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Upper bound on inflated output. Tags hold a few hundred bytes; anything
/// that inflates past this is not a script we wrote.
pub const MAX_INFLATED_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("deflate failed: {0}")]
    Compress(#[from] flate2::CompressError),
    #[error("corrupt deflate stream: {0}")]
    Corrupt(#[from] flate2::DecompressError),
    #[error("deflate stream ended before its final block")]
    Truncated,
    #[error("{0} trailing bytes after end of deflate stream")]
    TrailingBytes(usize),
    #[error("inflated payload exceeds {MAX_INFLATED_BYTES} bytes")]
    TooLarge,
}

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut deflater = Compress::new(Compression::best(), false);
    let mut out = Vec::with_capacity(bytes.len() / 2 + 64);
    loop {
        reserve_spare(&mut out);
        let consumed = deflater.total_in() as usize;
        let status = deflater.compress_vec(&bytes[consumed..], &mut out, FlushCompress::Finish)?;
        if status == Status::StreamEnd {
            return Ok(out);
        }
    }
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut inflater = Decompress::new(false);
    let mut out = Vec::with_capacity(bytes.len().saturating_mul(3).max(64));
    loop {
        reserve_spare(&mut out);
        let consumed = inflater.total_in() as usize;
        let produced = inflater.total_out();
        let status =
            inflater.decompress_vec(&bytes[consumed..], &mut out, FlushDecompress::None)?;
        if out.len() > MAX_INFLATED_BYTES {
            return Err(CodecError::TooLarge);
        }
        if status == Status::StreamEnd {
            break;
        }
        // Spare capacity is always available, so no progress means the
        // input ran out before the final block.
        if inflater.total_in() as usize == consumed && inflater.total_out() == produced {
            return Err(CodecError::Truncated);
        }
    }
    let consumed = inflater.total_in() as usize;
    if consumed != bytes.len() {
        return Err(CodecError::TrailingBytes(bytes.len() - consumed));
    }
    Ok(out)
}

/// Compress, or return the input untouched if compression fails.
pub fn safe_compress(bytes: &[u8]) -> Vec<u8> {
    match compress(bytes) {
        Ok(packed) => packed,
        Err(err) => {
            tracing::debug!(error = %err, len = bytes.len(), "compression failed; storing raw bytes");
            bytes.to_vec()
        }
    }
}

/// Decompress, or return the input untouched if it is not a raw deflate
/// stream.
pub fn safe_decompress(bytes: &[u8]) -> Vec<u8> {
    match decompress(bytes) {
        Ok(unpacked) => unpacked,
        Err(err) => {
            tracing::debug!(error = %err, len = bytes.len(), "payload is not deflated; using raw bytes");
            bytes.to_vec()
        }
    }
}

fn reserve_spare(out: &mut Vec<u8>) {
    if out.capacity() - out.len() < 256 {
        out.reserve(out.capacity().max(1024));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(len: usize, mut seed: u64) -> Vec<u8> {
        (0..len)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                (seed >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn round_trips_text_empty_and_noise() {
        let script = b"#!/bin/sh\nfor i in 1 2 3; do echo \"line $i\"; done\n".repeat(20);
        let cases: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"echo hi\necho bye".to_vec(),
            script,
            noise(50, 0x9e37_79b9_7f4a_7c15),
            noise(70_000, 42),
        ];
        for case in cases {
            assert_eq!(safe_decompress(&safe_compress(&case)), case);
        }
    }

    #[test]
    fn repetitive_scripts_shrink() {
        let script = b"echo hello world\n".repeat(40);
        let packed = compress(&script).expect("compress");
        assert!(packed.len() < script.len() / 4, "packed {} bytes", packed.len());
    }

    #[test]
    fn plain_scripts_fall_back_to_raw_bytes() {
        let plain = b"echo written by an older writer\n";
        assert!(decompress(plain).is_err());
        assert_eq!(safe_decompress(plain), plain.to_vec());
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let packed = compress(&b"echo truncated\n".repeat(30)).expect("compress");
        let cut = &packed[..packed.len() / 2];
        assert!(matches!(decompress(cut), Err(CodecError::Truncated) | Err(CodecError::Corrupt(_))));
        assert_eq!(safe_decompress(cut), cut.to_vec());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut packed = compress(b"echo hi").expect("compress");
        packed.extend_from_slice(b"junk");
        match decompress(&packed) {
            Err(CodecError::TrailingBytes(n)) => assert!(n > 0 && n <= 4),
            other => panic!("expected trailing bytes error, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn empty_input_is_not_a_stream() {
        assert!(matches!(decompress(&[]), Err(CodecError::Truncated)));
        assert!(safe_decompress(&[]).is_empty());
    }
}
