mod actor;
mod contract_set;
mod contractor;
mod download;
mod erasure;
mod error;
mod file;
mod hostdb;
mod persist;
mod ratelimit;
mod redundancy;
mod renter;
mod repair;
mod retry;
mod ring;
mod stream_cache;
mod transport;
mod upload;

pub mod config;
pub mod consensus;
pub mod host;
pub mod types;
pub mod wallet;

pub use actor::{Actor, ChanClient, ChanServer, Operator, Runner, UntilCancelled};
pub use config::{Allowance, RenterConfig};
pub use contract_set::{Contract, ContractEvent, ContractState};
pub use contractor::{MaintainReport, MaintainerRequest};
pub use download::{DownloadHandle, DownloadProgress};
pub use error::{
    is_cancelled, is_invalid_input, is_permanent, is_transient, is_unrecoverable, CancelError,
    ChunkUnrecoverable, Error, InvalidInput, PieceFailure, Result, UploadFailed,
};
pub use hostdb::HostDb;
pub use ratelimit::{Direction, RateLimiter};
pub use renter::{Background, Collaborators, ContractInfo, FileInfo, Renter};
pub use redundancy::TrackerRequest;
pub use repair::RepairReport;
pub use retry::Retry;
pub use ring::RecentRing;
pub use stream_cache::{CacheStats, DEFAULT_STREAM_CACHE_SIZE};
pub use transport::{FailureInjector, Interrupt, InterruptPoint, NoFailures, TransferKind};
pub use upload::UploadHandle;

#[cfg(test)]
pub mod tests;
