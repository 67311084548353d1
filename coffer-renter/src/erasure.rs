use coffer_fileindex::ErasureParams;
use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::{error::InvalidInput, Error, Result};

/// Reed-Solomon coding of one chunk into equally sized pieces.
///
/// Any `data_pieces` of the `data_pieces + parity_pieces` pieces recover the
/// chunk. With no parity the pieces are plain stripes of the chunk.
pub struct ErasureCoder {
    params: ErasureParams,
    rs: Option<ReedSolomon>,
}

impl ErasureCoder {
    pub fn new(params: ErasureParams) -> Result<ErasureCoder> {
        let rs = if params.parity_pieces() == 0 {
            None
        } else {
            Some(
                ReedSolomon::new(params.data_pieces(), params.parity_pieces())
                    .map_err(|e| InvalidInput::new(&format!("erasure params: {:?}", e)))?,
            )
        };
        Ok(ErasureCoder { params, rs })
    }

    pub fn params(&self) -> &ErasureParams {
        &self.params
    }

    /// Split `chunk` into data pieces of `piece_size` bytes, zero-padding the
    /// tail, and compute parity.
    pub fn encode(&self, chunk: &[u8], piece_size: usize) -> Result<Vec<Vec<u8>>> {
        let data = self.params.data_pieces();
        if piece_size == 0 || chunk.len() > piece_size * data {
            return Err(InvalidInput::new(&format!(
                "chunk of {} bytes does not fit {} pieces of {} bytes",
                chunk.len(),
                data,
                piece_size
            ))
            .into());
        }
        let mut pieces: Vec<Vec<u8>> = (0..self.params.total_pieces())
            .map(|i| {
                let start = (i * piece_size).min(chunk.len());
                let end = ((i + 1) * piece_size).min(chunk.len());
                let mut piece = if i < data {
                    chunk[start..end].to_vec()
                } else {
                    vec![]
                };
                piece.resize(piece_size, 0);
                piece
            })
            .collect();
        if let Some(rs) = &self.rs {
            rs.encode(&mut pieces)
                .map_err(|e| Error::msg(format!("erasure encode: {:?}", e)))?;
        }
        Ok(pieces)
    }

    /// Recover the first `chunk_len` bytes of a chunk from any `data_pieces`
    /// of its pieces.
    pub fn decode(&self, mut pieces: Vec<Option<Vec<u8>>>, chunk_len: usize) -> Result<Vec<u8>> {
        self.check_shape(&pieces)?;
        let data = self.params.data_pieces();
        if pieces[..data].iter().any(|p| p.is_none()) {
            match &self.rs {
                Some(rs) => rs
                    .reconstruct_data(&mut pieces)
                    .map_err(|e| Error::msg(format!("erasure decode: {:?}", e)))?,
                None => return Err(Error::msg("missing data pieces and no parity")),
            }
        }
        let mut chunk = Vec::with_capacity(chunk_len);
        for piece in pieces.into_iter().take(data).flatten() {
            chunk.extend_from_slice(&piece);
            if chunk.len() >= chunk_len {
                break;
            }
        }
        if chunk.len() < chunk_len {
            return Err(Error::msg(format!(
                "decoded {} bytes, expected {}",
                chunk.len(),
                chunk_len
            )));
        }
        chunk.truncate(chunk_len);
        Ok(chunk)
    }

    fn check_shape(&self, pieces: &[Option<Vec<u8>>]) -> Result<()> {
        if pieces.len() != self.params.total_pieces() {
            return Err(Error::msg(format!(
                "expected {} pieces, got {}",
                self.params.total_pieces(),
                pieces.len()
            )));
        }
        let present = pieces.iter().filter(|p| p.is_some()).count();
        if present < self.params.data_pieces() {
            return Err(Error::msg(format!(
                "need {} pieces, have {}",
                self.params.data_pieces(),
                present
            )));
        }
        Ok(())
    }
}
