use std::time::Duration;

use coffer_fileindex::DEFAULT_PIECE_SIZE_BYTES;

use crate::{
    retry::Retry,
    types::{BlockHeight, Currency},
};

/// How much the renter is willing to spend, and over how long.
#[derive(Clone, Debug, PartialEq)]
pub struct Allowance {
    /// Funds placed in each newly formed contract.
    pub funds: Currency,
    /// Number of good-for-renew contracts to maintain.
    pub hosts: usize,
    /// Contract duration, in blocks.
    pub period: BlockHeight,
    /// Renewal starts this many blocks before a contract ends.
    pub renew_window: BlockHeight,
}

impl Default for Allowance {
    fn default() -> Self {
        Allowance {
            funds: 1 << 40,
            hosts: 10,
            period: 4320,
            renew_window: 1440,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenterConfig {
    pub allowance: Allowance,
    /// Bytes per erasure-coded piece.
    pub piece_size: usize,
    /// Chunks held by the stream cache.
    pub stream_cache_size: usize,
    /// Chunks uploaded or downloaded at once per file.
    pub max_concurrent_chunks: usize,
    /// Failed renewals tolerated before a contract is given up on.
    pub max_renew_failures: u32,
    /// Consecutive failed piece uploads before a contract stops receiving
    /// new data.
    pub max_upload_failures: u32,
    /// Remote repair brings chunks back to `(1 - threshold)` of full health
    /// rather than all the way, to save bandwidth.
    pub remote_repair_threshold: f64,
    /// Periodic redundancy check interval.
    pub repair_interval: Duration,
    /// A single revision exchange must finish within this time.
    pub transfer_timeout: Duration,
    pub retry: Retry,
}

impl Default for RenterConfig {
    fn default() -> Self {
        RenterConfig {
            allowance: Allowance::default(),
            piece_size: DEFAULT_PIECE_SIZE_BYTES,
            stream_cache_size: 2,
            max_concurrent_chunks: 4,
            max_renew_failures: 12,
            max_upload_failures: 5,
            remote_repair_threshold: 0.25,
            repair_interval: Duration::from_secs(60),
            transfer_timeout: Duration::from_secs(120),
            retry: Retry::default(),
        }
    }
}

impl RenterConfig {
    /// Piece count a remote repair restores a chunk to.
    pub fn remote_repair_target(&self, total_pieces: usize) -> usize {
        let t = self.remote_repair_threshold.clamp(0.0, 1.0);
        ((1.0 - t) * total_pieces as f64).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_repair_target() {
        let config = RenterConfig::default();
        assert_eq!(config.remote_repair_target(2), 2);
        assert_eq!(config.remote_repair_target(30), 23);

        let config = RenterConfig {
            remote_repair_threshold: 0.5,
            ..Default::default()
        };
        assert_eq!(config.remote_repair_target(2), 1);
        assert_eq!(config.remote_repair_target(3), 2);
    }
}
