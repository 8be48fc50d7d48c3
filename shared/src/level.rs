//! Level stream used during map transfer
//!
//! The block array is prefixed with its length as a big-endian `u32`,
//! gzip-compressed, and cut into 1024-byte map chunks.

use crate::error::LevelError;
use crate::packet::{ServerPacket, CHUNK_DATA_LEN};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Builds the compressed level stream for `blocks`.
pub fn compress_level(blocks: &[u8]) -> Result<Vec<u8>, LevelError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&(blocks.len() as u32).to_be_bytes())?;
    encoder.write_all(blocks)?;
    Ok(encoder.finish()?)
}

/// Inverse of [`compress_level`], checking the length header.
pub fn decompress_level(stream: &[u8]) -> Result<Vec<u8>, LevelError> {
    let mut raw = Vec::new();
    GzDecoder::new(stream).read_to_end(&mut raw)?;

    if raw.len() < 4 {
        return Err(LevelError::MissingHeader);
    }
    let declared = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    let blocks = raw.split_off(4);
    if blocks.len() != declared {
        return Err(LevelError::LengthMismatch {
            declared,
            actual: blocks.len(),
        });
    }
    Ok(blocks)
}

/// Number of map chunks needed for a stream of `len` bytes.
pub fn chunk_count(len: usize) -> usize {
    len.div_ceil(CHUNK_DATA_LEN)
}

/// Splits a compressed stream into `MapChunk` packets with progress.
pub fn level_chunks(stream: &[u8]) -> impl Iterator<Item = ServerPacket> + '_ {
    let total = stream.len().max(1);
    let mut sent = 0usize;
    stream.chunks(CHUNK_DATA_LEN).map(move |chunk| {
        sent += chunk.len();
        ServerPacket::MapChunk {
            data: chunk.to_vec(),
            percent: (sent * 100 / total) as u8,
        }
    })
}
