//! Compression codec for cache payloads
//!
//! Every payload written to the disk tier is wrapped in a small
//! self-describing frame: one algorithm tag byte followed by the raw
//! (uncompressed) length and the payload. Decoding never has to guess which
//! algorithm produced a blob, and a payload compressed under one namespace
//! policy can be read back after the policy changes.
//!
//! Compression is applied only when it actually pays: if the compressed
//! payload is not smaller than the raw payload minus a configurable margin,
//! the raw bytes are stored with the `None` tag instead.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

/// Codec error types
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Compression failure
    #[error("Compression failed ({algo}): {message}")]
    Compress {
        /// Algorithm that failed
        algo: &'static str,
        /// Underlying failure
        message: String,
    },

    /// Decompression failure
    #[error("Decompression failed ({algo}): {message}")]
    Decompress {
        /// Algorithm that failed
        algo: &'static str,
        /// Underlying failure
        message: String,
    },

    /// Frame too short, unknown tag, or length mismatch
    #[error("Malformed compressed frame: {0}")]
    Malformed(String),
}

/// Compression algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// ZSTD (best ratio; default for large payloads)
    Zstd,
    /// LZ4 (fastest; default when latency-sensitive)
    Lz4,
    /// Gzip via flate2 (fallback, maximally portable)
    Gzip,
}

impl CompressionAlgorithm {
    fn tag(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Zstd => 1,
            CompressionAlgorithm::Lz4 => 2,
            CompressionAlgorithm::Gzip => 3,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Zstd),
            2 => Some(CompressionAlgorithm::Lz4),
            3 => Some(CompressionAlgorithm::Gzip),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Zstd => "zstd",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Gzip => "gzip",
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Codec configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// ZSTD compression level (1-22)
    pub zstd_level: i32,
    /// Minimum byte gain required before a compressed payload is kept
    pub min_gain_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            zstd_level: 3,
            min_gain_bytes: 64,
        }
    }
}

/// Pick an algorithm by payload size.
///
/// Small payloads are not worth the CPU, mid-size payloads favor LZ4
/// latency, large payloads favor ZSTD ratio.
pub fn auto_pick(size: usize) -> CompressionAlgorithm {
    if size < 4 * 1024 {
        CompressionAlgorithm::None
    } else if size < 256 * 1024 {
        CompressionAlgorithm::Lz4
    } else {
        CompressionAlgorithm::Zstd
    }
}

/// Compress `data` with `algo` into a self-describing frame.
///
/// Falls back to the `None` frame when compression does not beat the raw
/// size by at least `config.min_gain_bytes`.
pub fn compress(
    data: &[u8],
    algo: CompressionAlgorithm,
    config: &CodecConfig,
) -> Result<Vec<u8>, CodecError> {
    let compressed = match algo {
        CompressionAlgorithm::None => return Ok(frame(CompressionAlgorithm::None, data.len(), data)),
        CompressionAlgorithm::Zstd => zstd::stream::encode_all(data, config.zstd_level)
            .map_err(|e| CodecError::Compress {
                algo: "zstd",
                message: e.to_string(),
            })?,
        CompressionAlgorithm::Lz4 => lz4::block::compress(data, None, false).map_err(|e| {
            CodecError::Compress {
                algo: "lz4",
                message: e.to_string(),
            }
        })?,
        CompressionAlgorithm::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| CodecError::Compress {
                    algo: "gzip",
                    message: e.to_string(),
                })?
        }
    };

    if compressed.len() + config.min_gain_bytes >= data.len() {
        // Not worth it; store raw
        return Ok(frame(CompressionAlgorithm::None, data.len(), data));
    }

    Ok(frame(algo, data.len(), &compressed))
}

/// Decompress a self-describing frame produced by [`compress`].
pub fn decompress(framed: &[u8]) -> Result<Vec<u8>, CodecError> {
    let (algo, raw_len, payload) = parse_frame(framed)?;

    let data = match algo {
        CompressionAlgorithm::None => payload.to_vec(),
        CompressionAlgorithm::Zstd => {
            zstd::stream::decode_all(payload).map_err(|e| CodecError::Decompress {
                algo: "zstd",
                message: e.to_string(),
            })?
        }
        CompressionAlgorithm::Lz4 => {
            lz4::block::decompress(payload, Some(raw_len as i32)).map_err(|e| {
                CodecError::Decompress {
                    algo: "lz4",
                    message: e.to_string(),
                }
            })?
        }
        CompressionAlgorithm::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(payload);
            let mut out = Vec::with_capacity(raw_len);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| CodecError::Decompress {
                    algo: "gzip",
                    message: e.to_string(),
                })?;
            out
        }
    };

    if data.len() != raw_len {
        return Err(CodecError::Malformed(format!(
            "frame declared {} raw bytes but produced {}",
            raw_len,
            data.len()
        )));
    }

    Ok(data)
}

/// Read the algorithm tag from a frame without decoding it.
pub fn frame_algorithm(framed: &[u8]) -> Result<CompressionAlgorithm, CodecError> {
    parse_frame(framed).map(|(algo, _, _)| algo)
}

const FRAME_HEADER: usize = 1 + 8;

fn frame(algo: CompressionAlgorithm, raw_len: usize, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER + payload.len());
    out.push(algo.tag());
    out.extend_from_slice(&(raw_len as u64).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn parse_frame(framed: &[u8]) -> Result<(CompressionAlgorithm, usize, &[u8]), CodecError> {
    if framed.len() < FRAME_HEADER {
        return Err(CodecError::Malformed(format!(
            "frame shorter than header ({} bytes)",
            framed.len()
        )));
    }
    let algo = CompressionAlgorithm::from_tag(framed[0])
        .ok_or_else(|| CodecError::Malformed(format!("unknown algorithm tag {}", framed[0])))?;
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&framed[1..9]);
    let raw_len = u64::from_le_bytes(len_bytes) as usize;
    Ok((algo, raw_len, &framed[FRAME_HEADER..]))
}
