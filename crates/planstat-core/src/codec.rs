//! Wire format of the statistics a worker ships to the dispatcher.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ HEADER (20 bytes, little endian)             │
//! │   magic: [u8; 4]      = b"PSX1"              │
//! │   version: u16        = 1                    │
//! │   flags: u16          = 0                    │
//! │   payload_len: u32    (compressed bytes)     │
//! │   raw_len: u32        (decompressed bytes)   │
//! │   crc32: u32          (of the payload)       │
//! ├──────────────────────────────────────────────┤
//! │ PAYLOAD                                      │
//! │   zstd(postcard(WorkerStats))                │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The transport that moves these frames is not part of this crate.

use crate::explain::WorkerStats;
use std::fmt;
use std::io;
use tracing::warn;

const MAGIC: [u8; 4] = *b"PSX1";
const VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 20;
const COMPRESSION_LEVEL: i32 = 3;
/// Upper bound on a decompressed message.
const MAX_RAW_LEN: usize = 64 * 1024 * 1024;

/// Error type for statistics message framing.
#[derive(Debug)]
pub enum CodecError {
    /// Fewer bytes than the header or declared payload require.
    Truncated { needed: usize, got: usize },
    BadMagic([u8; 4]),
    UnsupportedVersion(u16),
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Declared raw size is out of range or does not match the payload.
    BadLength { declared: usize, actual: usize },
    Compress(io::Error),
    Decompress(io::Error),
    Serialize(postcard::Error),
    Deserialize(postcard::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Truncated { needed, got } => {
                write!(f, "message truncated: need {} bytes, got {}", needed, got)
            }
            CodecError::BadMagic(magic) => {
                write!(f, "invalid magic: expected PSX1, got {:?}", magic)
            }
            CodecError::UnsupportedVersion(v) => write!(f, "unsupported version: {}", v),
            CodecError::ChecksumMismatch { expected, actual } => write!(
                f,
                "payload checksum mismatch: expected {:08x}, got {:08x}",
                expected, actual
            ),
            CodecError::BadLength { declared, actual } => write!(
                f,
                "payload length mismatch: declared {}, actual {}",
                declared, actual
            ),
            CodecError::Compress(e) => write!(f, "compression failed: {}", e),
            CodecError::Decompress(e) => write!(f, "decompression failed: {}", e),
            CodecError::Serialize(e) => write!(f, "serialization failed: {}", e),
            CodecError::Deserialize(e) => write!(f, "deserialization failed: {}", e),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Compress(e) | CodecError::Decompress(e) => Some(e),
            CodecError::Serialize(e) | CodecError::Deserialize(e) => Some(e),
            _ => None,
        }
    }
}

/// Frames one worker's statistics.
pub fn encode_worker_stats(stats: &WorkerStats) -> Result<Vec<u8>, CodecError> {
    let raw = postcard::to_allocvec(stats).map_err(CodecError::Serialize)?;
    let payload = zstd::encode_all(&raw[..], COMPRESSION_LEVEL).map_err(CodecError::Compress)?;

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&(raw.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Validates and decodes a frame produced by [`encode_worker_stats`].
pub fn decode_worker_stats(data: &[u8]) -> Result<WorkerStats, CodecError> {
    if data.len() < HEADER_SIZE {
        return Err(CodecError::Truncated {
            needed: HEADER_SIZE,
            got: data.len(),
        });
    }

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&data[0..4]);
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }

    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let payload_len = read_u32(data, 8) as usize;
    let raw_len = read_u32(data, 12) as usize;
    let expected_crc = read_u32(data, 16);

    let end = HEADER_SIZE + payload_len;
    if data.len() < end {
        return Err(CodecError::Truncated {
            needed: end,
            got: data.len(),
        });
    }
    if raw_len > MAX_RAW_LEN {
        return Err(CodecError::BadLength {
            declared: raw_len,
            actual: MAX_RAW_LEN,
        });
    }

    let payload = &data[HEADER_SIZE..end];
    let actual_crc = crc32fast::hash(payload);
    if actual_crc != expected_crc {
        return Err(CodecError::ChecksumMismatch {
            expected: expected_crc,
            actual: actual_crc,
        });
    }

    let raw = zstd::bulk::decompress(payload, raw_len).map_err(CodecError::Decompress)?;
    if raw.len() != raw_len {
        return Err(CodecError::BadLength {
            declared: raw_len,
            actual: raw.len(),
        });
    }

    postcard::from_bytes(&raw).map_err(|e| {
        warn!(raw_len, error = %e, "worker stats deserialization failed");
        CodecError::Deserialize(e)
    })
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}
