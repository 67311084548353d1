use std::fmt;

use crate::types::HostKey;

pub type Error = anyhow::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub struct CancelError;

impl std::error::Error for CancelError {}

impl fmt::Display for CancelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cancelled")
    }
}

impl fmt::Debug for CancelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cancelled")
    }
}

/// A failure that may succeed if attempted again: an unreachable host, a
/// timed out exchange, an interrupted session.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Transient(String);

impl Transient {
    pub fn new(msg: &str) -> Transient {
        Transient(msg.to_owned())
    }
}

/// A failure that retrying against the same contract will not fix.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Permanent(String);

impl Permanent {
    pub fn new(msg: &str) -> Permanent {
        Permanent(msg.to_owned())
    }
}

/// Caller error, rejected before any host is contacted.
#[derive(Debug, thiserror::Error)]
#[error("invalid input: {0}")]
pub struct InvalidInput(String);

impl InvalidInput {
    pub fn new(msg: &str) -> InvalidInput {
        InvalidInput(msg.to_owned())
    }
}

/// Fewer than the data piece count could be retrieved for a chunk.
#[derive(Debug, thiserror::Error)]
#[error("chunk {chunk_index} unrecoverable: {available} of {needed} pieces retrievable")]
pub struct ChunkUnrecoverable {
    pub chunk_index: usize,
    pub available: usize,
    pub needed: usize,
}

/// A piece that could not be placed on any eligible contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PieceFailure {
    pub chunk_index: usize,
    pub piece_index: usize,
    pub hosts: Vec<HostKey>,
    pub reason: String,
}

impl fmt::Display for PieceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk {} piece {} ({} hosts tried): {}",
            self.chunk_index,
            self.piece_index,
            self.hosts.len(),
            self.reason
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("upload failed: {} pieces could not be placed", failures.len())]
pub struct UploadFailed {
    pub failures: Vec<PieceFailure>,
}

fn caused_by<T: std::error::Error + Send + Sync + 'static>(e: &Error) -> bool {
    if e.downcast_ref::<T>().is_some() {
        return true;
    }
    for cause in e.chain() {
        if cause.downcast_ref::<T>().is_some() {
            return true;
        }
    }
    false
}

pub fn is_cancelled(e: &Error) -> bool {
    caused_by::<CancelError>(e)
}

pub fn is_transient(e: &Error) -> bool {
    caused_by::<Transient>(e)
}

pub fn is_permanent(e: &Error) -> bool {
    caused_by::<Permanent>(e) || caused_by::<InvalidInput>(e)
}

pub fn is_invalid_input(e: &Error) -> bool {
    caused_by::<InvalidInput>(e)
}

pub fn is_unrecoverable(e: &Error) -> bool {
    caused_by::<ChunkUnrecoverable>(e)
}

/// Mark an error as worth retrying, keeping its message and chain.
pub fn transient(e: Error) -> Error {
    if is_transient(&e) || is_permanent(&e) || is_cancelled(&e) {
        return e;
    }
    let msg = e.to_string();
    e.context(Transient(msg))
}
