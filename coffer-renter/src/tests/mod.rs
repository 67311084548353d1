mod scenarios;

use std::{path::PathBuf, sync::Arc, time::Duration};

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub use stub_hosts::StubHosts;

use crate::{
    config::{Allowance, RenterConfig},
    consensus::{HostAnnouncement, LocalChain},
    host::{HostEntry, LocalHosts},
    renter::{Collaborators, Renter},
    retry::Retry,
    transport::{FailureInjector, Interrupt, InterruptPoint, TransferKind},
    types::HostKey,
    wallet::KeyWallet,
    Result,
};

/// Interrupts for each kind of transfer at each injection point.
pub struct Interrupts {
    pub upload_before: Interrupt,
    pub upload_after: Interrupt,
    pub download_before: Interrupt,
    pub download_after: Interrupt,
}

impl Default for Interrupts {
    fn default() -> Self {
        use InterruptPoint::*;
        Interrupts {
            upload_before: Interrupt::new(TransferKind::Upload, BeforeSendingRevision),
            upload_after: Interrupt::new(TransferKind::Upload, AfterSendingRevision),
            download_before: Interrupt::new(TransferKind::Download, BeforeSendingRevision),
            download_after: Interrupt::new(TransferKind::Download, AfterSendingRevision),
        }
    }
}

impl FailureInjector for Interrupts {
    fn interrupt(&self, kind: TransferKind, point: InterruptPoint) -> bool {
        [
            &self.upload_before,
            &self.upload_after,
            &self.download_before,
            &self.download_after,
        ]
        .iter()
        .any(|i| i.interrupt(kind, point))
    }
}

pub const TEST_PIECE_SIZE: usize = 64;

/// Route test logs through the test harness, filtered by `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small pieces, short contracts and fast retries.
pub fn test_config(allowance_hosts: usize) -> RenterConfig {
    RenterConfig {
        allowance: Allowance {
            funds: 1 << 30,
            hosts: allowance_hosts,
            period: 20,
            renew_window: 10,
        },
        piece_size: TEST_PIECE_SIZE,
        stream_cache_size: 2,
        max_concurrent_chunks: 4,
        max_renew_failures: 2,
        max_upload_failures: 5,
        remote_repair_threshold: 0.25,
        repair_interval: Duration::from_millis(50),
        transfer_timeout: Duration::from_secs(5),
        retry: Retry {
            max_attempts: 2,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
        },
    }
}

/// A renter with an in-process host farm and chain.
pub struct TestGroup {
    pub dir: TempDir,
    pub hosts: LocalHosts,
    pub chain: LocalChain,
    pub wallet: Arc<KeyWallet>,
    pub interrupts: Arc<Interrupts>,
    pub config: RenterConfig,
    pub renter: Renter<LocalHosts>,
    pub cancel: CancellationToken,
}

impl TestGroup {
    /// Start `n_hosts` announced hosts and form up to `allowance_hosts`
    /// contracts with them.
    pub async fn new(n_hosts: usize, allowance_hosts: usize) -> Result<TestGroup> {
        TestGroup::with_config(n_hosts, test_config(allowance_hosts)).await
    }

    pub async fn with_config(n_hosts: usize, config: RenterConfig) -> Result<TestGroup> {
        init_logging();
        let dir = tempfile::tempdir()?;
        let hosts = LocalHosts::new();
        let chain = LocalChain::new();
        let announced: Vec<HostEntry> = (0..n_hosts).map(|_| hosts.add_host()).collect();
        chain.mine_block(announcements(&announced));
        let wallet = Arc::new(KeyWallet::generate());
        let interrupts = Arc::new(Interrupts::default());
        let renter = open_renter(&dir, &hosts, &chain, &wallet, &interrupts, &config).await?;
        let group = TestGroup {
            dir,
            hosts,
            chain,
            wallet,
            interrupts,
            config,
            renter,
            cancel: CancellationToken::new(),
        };
        group.renter.maintain_contracts(&group.cancel).await?;
        Ok(group)
    }

    /// Drop the renter and open it again from its state directory.
    pub async fn reopen(mut self) -> Result<TestGroup> {
        self.renter = open_renter(
            &self.dir,
            &self.hosts,
            &self.chain,
            &self.wallet,
            &self.interrupts,
            &self.config,
        )
        .await?;
        Ok(self)
    }

    /// Start and announce a new host.
    pub fn add_host(&self) -> HostKey {
        let entry = self.hosts.add_host();
        self.chain.mine_block(announcements(&[entry.clone()]));
        entry.key
    }

    /// Mine `n` blocks, maintaining contracts after each.
    pub async fn advance(&self, n: usize) -> Result<()> {
        for _ in 0..n {
            self.chain.mine_blocks(1);
            self.renter.maintain_contracts(&self.cancel).await?;
        }
        Ok(())
    }

    /// Write `len` bytes of random data to a local file.
    pub async fn write_file(&self, name: &str, len: usize) -> Result<(PathBuf, Vec<u8>)> {
        let path = self.dir.path().join(name);
        let contents: Vec<u8> = (0..len).map(|_| rand::random::<u8>()).collect();
        tokio::fs::write(&path, &contents).await?;
        Ok((path, contents))
    }

    pub fn contract_hosts(&self) -> Vec<HostKey> {
        self.renter
            .list_contracts()
            .into_iter()
            .map(|c| c.host)
            .collect()
    }
}

fn announcements(entries: &[HostEntry]) -> Vec<HostAnnouncement> {
    entries
        .iter()
        .map(|h| HostAnnouncement {
            key: h.key,
            net_address: h.net_address.clone(),
        })
        .collect()
}

async fn open_renter(
    dir: &TempDir,
    hosts: &LocalHosts,
    chain: &LocalChain,
    wallet: &Arc<KeyWallet>,
    interrupts: &Arc<Interrupts>,
    config: &RenterConfig,
) -> Result<Renter<LocalHosts>> {
    let collaborators =
        Collaborators::new(hosts.clone(), Arc::new(chain.clone()), wallet.clone())
            .with_failures(interrupts.clone());
    Renter::new(collaborators, config.clone(), &dir.path().join("renter")).await
}
