use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail};
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    persist::{read_json, write_json},
    types::{ContractId, HostKey, PieceRoot, Revision, Signature},
    Error, Result,
};

use super::{HostEntry, HostProtocol, HostSettings};

const HOSTS_FILE: &str = "hosts.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct HostContract {
    revision: Revision,
    roots: Vec<PieceRoot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HostState {
    seed: String,
    settings: HostSettings,
    online: bool,
    wallet_locked: bool,
    contracts: HashMap<ContractId, HostContract>,
    #[serde(skip)]
    staged: HashMap<ContractId, Vec<u8>>,
    #[serde(skip)]
    pending: HashMap<ContractId, Revision>,
    #[serde(skip)]
    pieces: HashMap<PieceRoot, Vec<u8>>,
}

impl HostState {
    fn signing_key(&self) -> Result<SigningKey> {
        let seed: [u8; 32] = hex::decode(&self.seed)?
            .try_into()
            .map_err(|_| Error::msg("host seed must be 32 bytes"))?;
        Ok(SigningKey::from_bytes(&seed))
    }

    fn check_online(&self, key: &HostKey) -> Result<()> {
        if !self.online {
            bail!("host {} is offline", key);
        }
        Ok(())
    }

    fn contract(&self, id: &ContractId) -> Result<&HostContract> {
        self.contracts
            .get(id)
            .ok_or_else(|| anyhow!("no contract {}", id))
    }
}

/// A farm of hosts running inside the renter's process.
///
/// Pieces are kept in memory, or under a directory when opened with
/// [`LocalHosts::open`]. Hosts can be taken offline, have their wallets
/// locked, or be removed outright.
#[derive(Clone, Default)]
pub struct LocalHosts {
    hosts: Arc<Mutex<HashMap<HostKey, HostState>>>,
    dir: Option<PathBuf>,
}

impl LocalHosts {
    pub fn new() -> LocalHosts {
        LocalHosts::default()
    }

    /// Load hosts saved under `dir`, storing piece data there too.
    pub async fn open(dir: &Path) -> Result<LocalHosts> {
        tokio::fs::create_dir_all(dir.join("pieces")).await?;
        let hosts: HashMap<HostKey, HostState> = read_json(&dir.join(HOSTS_FILE))
            .await?
            .unwrap_or_default();
        Ok(LocalHosts {
            hosts: Arc::new(Mutex::new(hosts)),
            dir: Some(dir.to_owned()),
        })
    }

    pub async fn save(&self) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let contents = {
            let hosts = self.hosts.lock();
            serde_json::to_value(&*hosts)?
        };
        write_json(&dir.join(HOSTS_FILE), &contents).await
    }

    /// Start a new host with default pricing.
    pub fn add_host(&self) -> HostEntry {
        let seed: [u8; 32] = rand::random();
        let key: HostKey = (&SigningKey::from_bytes(&seed)).into();
        let mut hosts = self.hosts.lock();
        let net_address = format!("local:{}", &key.to_string()[..16]);
        hosts.insert(
            key,
            HostState {
                seed: hex::encode(seed),
                settings: HostSettings {
                    net_address: net_address.clone(),
                    accepting_contracts: true,
                    upload_price: 1,
                    download_price: 1,
                },
                online: true,
                wallet_locked: false,
                contracts: HashMap::new(),
                staged: HashMap::new(),
                pending: HashMap::new(),
                pieces: HashMap::new(),
            },
        );
        info!(host = %key, "added host");
        HostEntry { key, net_address }
    }

    pub fn hosts(&self) -> Vec<HostEntry> {
        let mut hosts: Vec<HostEntry> = self
            .hosts
            .lock()
            .iter()
            .map(|(key, st)| HostEntry {
                key: *key,
                net_address: st.settings.net_address.clone(),
            })
            .collect();
        hosts.sort_by_key(|h| h.key);
        hosts
    }

    pub fn set_online(&self, key: &HostKey, online: bool) -> bool {
        self.with_host(key, |st| st.online = online).is_some()
    }

    pub fn set_wallet_locked(&self, key: &HostKey, locked: bool) -> bool {
        self.with_host(key, |st| st.wallet_locked = locked).is_some()
    }

    /// Shut a host down for good, discarding everything it stored.
    pub async fn remove_host(&self, key: &HostKey) -> bool {
        let removed = self.hosts.lock().remove(key).is_some();
        if removed {
            if let Some(dir) = &self.dir {
                let _ = tokio::fs::remove_dir_all(self.piece_dir(dir, key)).await;
            }
            info!(host = %key, "removed host");
        }
        removed
    }

    /// Pieces committed across every contract on a host.
    pub fn stored_pieces(&self, key: &HostKey) -> usize {
        self.with_host(key, |st| st.contracts.values().map(|c| c.roots.len()).sum())
            .unwrap_or(0)
    }

    /// The latest revision a host has committed for a contract.
    pub fn revision(&self, key: &HostKey, contract: &ContractId) -> Option<Revision> {
        self.with_host(key, |st| st.contracts.get(contract).map(|c| c.revision.clone()))
            .flatten()
    }

    fn with_host<T>(&self, key: &HostKey, f: impl FnOnce(&mut HostState) -> T) -> Option<T> {
        self.hosts.lock().get_mut(key).map(f)
    }

    fn piece_dir(&self, dir: &Path, key: &HostKey) -> PathBuf {
        dir.join("pieces").join(key.to_string())
    }

    fn verify_renter(revision: &Revision, renter_signature: &Signature) -> Result<()> {
        revision
            .renter_key
            .verify(&revision.sig_hash(), renter_signature)
    }
}

impl HostProtocol for LocalHosts {
    async fn settings(&self, host: &HostKey) -> Result<HostSettings> {
        let hosts = self.hosts.lock();
        let st = hosts
            .get(host)
            .ok_or_else(|| anyhow!("unknown host {}", host))?;
        st.check_online(host)?;
        Ok(st.settings.clone())
    }

    async fn form_contract(
        &self,
        host: &HostKey,
        revision: &Revision,
        renter_signature: &Signature,
    ) -> Result<Signature> {
        let mut hosts = self.hosts.lock();
        let st = hosts
            .get_mut(host)
            .ok_or_else(|| anyhow!("unknown host {}", host))?;
        st.check_online(host)?;
        if !st.settings.accepting_contracts {
            bail!("host {} is not accepting contracts", host);
        }
        if st.wallet_locked {
            bail!("host {} wallet is locked", host);
        }
        if revision.host_key != *host || revision.number != 0 || revision.piece_count != 0 {
            bail!("malformed contract proposal");
        }
        Self::verify_renter(revision, renter_signature)?;
        if st.contracts.contains_key(&revision.contract_id) {
            bail!("contract {} already exists", revision.contract_id);
        }
        let key = st.signing_key()?;
        st.contracts.insert(
            revision.contract_id,
            HostContract {
                revision: revision.clone(),
                roots: vec![],
            },
        );
        debug!(host = %host, contract = %revision.contract_id, "formed contract");
        Ok(Signature::sign(&key, &revision.sig_hash()))
    }

    async fn send_piece(&self, host: &HostKey, contract: &ContractId, piece: &[u8]) -> Result<()> {
        let mut hosts = self.hosts.lock();
        let st = hosts
            .get_mut(host)
            .ok_or_else(|| anyhow!("unknown host {}", host))?;
        st.check_online(host)?;
        st.contract(contract)?;
        st.staged.insert(*contract, piece.to_vec());
        Ok(())
    }

    async fn send_revision(
        &self,
        host: &HostKey,
        revision: &Revision,
        renter_signature: &Signature,
    ) -> Result<()> {
        let mut hosts = self.hosts.lock();
        let st = hosts
            .get_mut(host)
            .ok_or_else(|| anyhow!("unknown host {}", host))?;
        st.check_online(host)?;
        let current = &st.contract(&revision.contract_id)?.revision;
        if revision.renter_key != current.renter_key || revision.host_key != *host {
            bail!("revision parties do not match contract");
        }
        Self::verify_renter(revision, renter_signature)?;
        if revision.number <= current.number {
            bail!(
                "stale revision {}, host is at {}",
                revision.number,
                current.number
            );
        }
        if revision.end_height < current.end_height {
            bail!("revision shortens contract");
        }
        let renewing = revision.end_height > current.end_height;
        if renewing && st.wallet_locked {
            bail!("host {} wallet is locked, cannot renew", host);
        }
        if !renewing
            && revision.renter_funds + revision.host_funds
                != current.renter_funds + current.host_funds
        {
            bail!("revision does not conserve funds");
        }
        if revision.host_funds < current.host_funds {
            bail!("revision takes funds from host");
        }
        if revision.piece_count == current.piece_count + 1 {
            let staged = st
                .staged
                .get(&revision.contract_id)
                .ok_or_else(|| anyhow!("revision appends a piece that was not sent"))?;
            let root = PieceRoot::of(staged);
            if revision.commitment != current.commitment.extend(&root)
                || revision.data_size != current.data_size + staged.len() as u64
            {
                bail!("revision does not commit to the staged piece");
            }
            let owed = st.settings.upload_price * staged.len() as u64;
            if revision.host_funds - current.host_funds < owed {
                bail!("revision underpays for upload");
            }
        } else if revision.piece_count != current.piece_count
            || revision.commitment != current.commitment
        {
            bail!("revision changes stored data unexpectedly");
        }
        st.pending.insert(revision.contract_id, revision.clone());
        Ok(())
    }

    async fn recv_countersignature(&self, host: &HostKey, contract: &ContractId) -> Result<Signature> {
        let (revision, piece, key) = {
            let mut hosts = self.hosts.lock();
            let st = hosts
                .get_mut(host)
                .ok_or_else(|| anyhow!("unknown host {}", host))?;
            st.check_online(host)?;
            let revision = st
                .pending
                .remove(contract)
                .ok_or_else(|| anyhow!("no pending revision for {}", contract))?;
            let current = &st.contract(contract)?.revision;
            let piece = if revision.piece_count > current.piece_count {
                st.staged.remove(contract)
            } else {
                None
            };
            (revision, piece, st.signing_key()?)
        };

        let mut root = None;
        if let Some(piece) = piece {
            let piece_root = PieceRoot::of(&piece);
            match &self.dir {
                Some(dir) => {
                    let piece_dir = self.piece_dir(dir, host);
                    tokio::fs::create_dir_all(&piece_dir).await?;
                    tokio::fs::write(piece_dir.join(piece_root.to_string()), &piece).await?;
                }
                None => {
                    self.with_host(host, |st| st.pieces.insert(piece_root, piece));
                }
            }
            root = Some(piece_root);
        }

        let mut hosts = self.hosts.lock();
        let st = hosts
            .get_mut(host)
            .ok_or_else(|| anyhow!("host {} went away", host))?;
        let hc = st
            .contracts
            .get_mut(contract)
            .ok_or_else(|| anyhow!("no contract {}", contract))?;
        if revision.number <= hc.revision.number {
            bail!("revision {} already superseded", revision.number);
        }
        hc.roots.extend(root);
        hc.revision = revision;
        Ok(Signature::sign(&key, &hc.revision.sig_hash()))
    }

    async fn recv_piece(
        &self,
        host: &HostKey,
        contract: &ContractId,
        root: &PieceRoot,
    ) -> Result<Vec<u8>> {
        {
            let hosts = self.hosts.lock();
            let st = hosts
                .get(host)
                .ok_or_else(|| anyhow!("unknown host {}", host))?;
            st.check_online(host)?;
            if !st.contract(contract)?.roots.contains(root) {
                bail!("host {} does not store piece {}", host, root);
            }
            if self.dir.is_none() {
                return st
                    .pieces
                    .get(root)
                    .cloned()
                    .ok_or_else(|| anyhow!("piece {} lost", root));
            }
        }
        match &self.dir {
            Some(dir) => Ok(tokio::fs::read(self.piece_dir(dir, host).join(root.to_string())).await?),
            None => Err(anyhow!("piece {} lost", root)),
        }
    }
}
