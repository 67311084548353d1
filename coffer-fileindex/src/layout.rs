use std::ops::Range;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::MAX_TOTAL_PIECES;

/// Erasure coding parameters of a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErasureParams {
    data_pieces: usize,
    parity_pieces: usize,
}

impl ErasureParams {
    pub fn new(data_pieces: usize, parity_pieces: usize) -> Result<ErasureParams> {
        if data_pieces == 0 {
            bail!("at least one data piece is required");
        }
        if data_pieces + parity_pieces > MAX_TOTAL_PIECES {
            bail!(
                "{} data + {} parity pieces exceeds the maximum of {}",
                data_pieces,
                parity_pieces,
                MAX_TOTAL_PIECES
            );
        }
        Ok(ErasureParams {
            data_pieces,
            parity_pieces,
        })
    }

    pub fn data_pieces(&self) -> usize {
        self.data_pieces
    }

    pub fn parity_pieces(&self) -> usize {
        self.parity_pieces
    }

    pub fn total_pieces(&self) -> usize {
        self.data_pieces + self.parity_pieces
    }

    /// Redundancy of a chunk with every piece available.
    pub fn full_redundancy(&self) -> f64 {
        self.total_pieces() as f64 / self.data_pieces as f64
    }
}

/// Part of a byte range that falls within one chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSlice {
    pub chunk_index: usize,
    pub offset: usize,
    pub length: usize,
}

impl ChunkSlice {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.length
    }
}

/// Maps logical file bytes onto chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLayout {
    length: u64,
    piece_size: usize,
    erasure: ErasureParams,
}

impl ChunkLayout {
    pub fn new(length: u64, piece_size: usize, erasure: ErasureParams) -> ChunkLayout {
        ChunkLayout {
            length,
            piece_size,
            erasure,
        }
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn piece_size(&self) -> usize {
        self.piece_size
    }

    pub fn erasure(&self) -> &ErasureParams {
        &self.erasure
    }

    /// Plaintext bytes carried by one full chunk.
    pub fn chunk_size(&self) -> usize {
        self.piece_size * self.erasure.data_pieces()
    }

    pub fn num_chunks(&self) -> usize {
        let chunk_size = self.chunk_size() as u64;
        (self.length / chunk_size + if self.length % chunk_size != 0 { 1 } else { 0 }) as usize
    }

    /// Logical byte range of a chunk within the file.
    pub fn chunk_range(&self, chunk_index: usize) -> Range<u64> {
        let chunk_size = self.chunk_size() as u64;
        let start = (chunk_index as u64 * chunk_size).min(self.length);
        let end = (start + chunk_size).min(self.length);
        start..end
    }

    /// Logical length of a chunk; only the last chunk may be short.
    pub fn chunk_len(&self, chunk_index: usize) -> usize {
        let range = self.chunk_range(chunk_index);
        (range.end - range.start) as usize
    }

    /// Split `[from, to)` into per-chunk slices, in file order.
    pub fn slices(&self, range: Range<u64>) -> Result<Vec<ChunkSlice>> {
        if range.start >= range.end || range.end > self.length {
            bail!(
                "invalid range [{}, {}) for file of length {}",
                range.start,
                range.end,
                self.length
            );
        }
        let chunk_size = self.chunk_size() as u64;
        let first = (range.start / chunk_size) as usize;
        let last = ((range.end - 1) / chunk_size) as usize;
        Ok((first..=last)
            .map(|chunk_index| {
                let chunk = self.chunk_range(chunk_index);
                let start = range.start.max(chunk.start);
                let end = range.end.min(chunk.end);
                ChunkSlice {
                    chunk_index,
                    offset: (start - chunk.start) as usize,
                    length: (end - start) as usize,
                }
            })
            .collect())
    }
}
