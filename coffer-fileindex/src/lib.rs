//! Chunk layout and local file indexing for coffer.
//!
//! A file is cut into fixed-size chunks of `piece_size * data_pieces` bytes.
//! Each chunk is erasure-coded into `data_pieces + parity_pieces` pieces of
//! `piece_size` bytes. This crate knows nothing about hosts or contracts; it
//! answers "which bytes live in which chunk" and "do the local bytes still
//! match what was uploaded".

mod indexer;
mod layout;

pub use indexer::{read_chunk, Index, Indexer, Progress};
pub use layout::{ChunkLayout, ChunkSlice, ErasureParams};

/// Default size of a single erasure-coded piece, matching a host sector.
pub const DEFAULT_PIECE_SIZE_BYTES: usize = 1 << 22;

/// Upper bound on `data_pieces + parity_pieces` imposed by GF(2^8) coding.
pub const MAX_TOTAL_PIECES: usize = 256;

pub type Digest = [u8; 32];


#[cfg(test)]
mod from_file_tests;
