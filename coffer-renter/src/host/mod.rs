use std::{collections::HashSet, future::Future};

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::{
    types::{ContractId, Currency, HostKey, PieceRoot, Revision, Signature},
    Result,
};

mod local;
pub use local::LocalHosts;

/// Terms a host currently offers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSettings {
    pub net_address: String,
    pub accepting_contracts: bool,
    /// Price per byte stored.
    pub upload_price: Currency,
    /// Price per byte retrieved.
    pub download_price: Currency,
}

/// A host the renter could form a contract with.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostEntry {
    pub key: HostKey,
    pub net_address: String,
}

/// The renter's side of the host protocol.
///
/// A transfer stages its piece data, sends the renter-signed revision, then
/// asks for the host's countersignature. The host commits the revision, and
/// any staged piece, only when it countersigns; a session abandoned before
/// that leaves the host at its previous revision.
pub trait HostProtocol: Clone + Send + Sync + 'static {
    /// Current settings. Doubles as a reachability check.
    fn settings(&self, host: &HostKey) -> impl Future<Output = Result<HostSettings>> + Send;

    /// Propose a new contract at revision 0. Returns the host's signature.
    fn form_contract(
        &self,
        host: &HostKey,
        revision: &Revision,
        renter_signature: &Signature,
    ) -> impl Future<Output = Result<Signature>> + Send;

    /// Stage a piece to be appended by the next revision.
    fn send_piece(
        &self,
        host: &HostKey,
        contract: &ContractId,
        piece: &[u8],
    ) -> impl Future<Output = Result<()>> + Send;

    fn send_revision(
        &self,
        host: &HostKey,
        revision: &Revision,
        renter_signature: &Signature,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Ask the host to commit the pending revision and return its signature.
    fn recv_countersignature(
        &self,
        host: &HostKey,
        contract: &ContractId,
    ) -> impl Future<Output = Result<Signature>> + Send;

    fn recv_piece(
        &self,
        host: &HostKey,
        contract: &ContractId,
        root: &PieceRoot,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Hosts known to be announced on chain.
pub trait HostDiscovery: Send + Sync {
    fn candidate_hosts(&self) -> Vec<HostEntry>;
}

/// Which of `hosts` answer a settings request right now.
pub async fn probe_hosts<H: HostProtocol>(
    protocol: &H,
    hosts: impl IntoIterator<Item = HostKey>,
) -> HashSet<HostKey> {
    let mut probes = JoinSet::new();
    for host in hosts.into_iter().collect::<HashSet<_>>() {
        let protocol = protocol.clone();
        probes.spawn(async move { (host, protocol.settings(&host).await.is_ok()) });
    }
    let mut online = HashSet::new();
    while let Some(res) = probes.join_next().await {
        if let Ok((host, true)) = res {
            online.insert(host);
        }
    }
    online
}
