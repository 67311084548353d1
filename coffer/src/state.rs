use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Error, Result};
use coffer_renter::{
    consensus::{HostAnnouncement, LocalChain},
    host::{HostEntry, LocalHosts},
    types::{FileId, HostKey},
    wallet::KeyWallet,
    Collaborators, Renter, RenterConfig,
};
use path_absolutize::Absolutize;
use tracing::debug;

/// Everything a renter runs against, kept under one state directory.
pub struct State {
    dir: PathBuf,
    pub hosts: LocalHosts,
    pub chain: LocalChain,
    pub wallet: Arc<KeyWallet>,
}

impl State {
    pub async fn open(dir: &Path) -> Result<State> {
        tokio::fs::create_dir_all(dir).await?;
        let hosts = LocalHosts::open(&dir.join("hosts")).await?;
        let chain = LocalChain::open(dir.join("chain.json")).await?;
        let wallet = Arc::new(KeyWallet::open(&dir.join("wallet")).await?);
        debug!(dir = %dir.display(), "state opened");
        Ok(State {
            dir: dir.to_owned(),
            hosts,
            chain,
            wallet,
        })
    }

    pub async fn renter(&self, config: RenterConfig) -> Result<Renter<LocalHosts>> {
        let collaborators = Collaborators::new(
            self.hosts.clone(),
            Arc::new(self.chain.clone()),
            self.wallet.clone(),
        );
        Renter::new(collaborators, config, &self.dir.join("renter")).await
    }

    /// Start `count` hosts and announce them in a new block.
    pub fn add_hosts(&self, count: usize) -> Vec<HostEntry> {
        let added: Vec<HostEntry> = (0..count).map(|_| self.hosts.add_host()).collect();
        self.chain.mine_block(
            added
                .iter()
                .map(|h| HostAnnouncement {
                    key: h.key,
                    net_address: h.net_address.clone(),
                })
                .collect(),
        );
        added
    }

    pub async fn save(&self) -> Result<()> {
        self.hosts.save().await?;
        self.chain.save().await
    }
}

pub fn parse_host(key: &str) -> Result<HostKey> {
    key.parse()
        .map_err(|e| Error::msg(format!("invalid host key {:?}: {}", key, e)))
}

/// Resolve a file argument: either a file id or the path it was uploaded
/// from.
pub fn resolve_file(renter: &Renter<LocalHosts>, file: &str) -> Result<FileId> {
    if let Ok(id) = file.parse::<FileId>() {
        return Ok(id);
    }
    let path = Path::new(file);
    let full_path = match std::fs::canonicalize(path) {
        Ok(path) => path,
        Err(_) => path.absolutize()?.to_path_buf(),
    };
    renter
        .find_file(&full_path.to_string_lossy())
        .ok_or(Error::msg(format!("no such file: {}", file)))
}
