use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    error::Permanent,
    types::{Address, BlockHeight, ContractId, HostKey, Revision, Signature},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractState {
    Active,
    Renewing,
    /// Will not be renewed; still serves reads until it expires.
    NotGoodForRenew,
    /// Not good for renew, and a new contract has been formed in its place.
    Replaced,
}

/// Changes to the contract set that other components react to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContractEvent {
    Formed { id: ContractId, host: HostKey },
    Renewed { id: ContractId, end_height: BlockHeight },
    RenewFailed { id: ContractId, failures: u32 },
    NotGoodForRenew { id: ContractId },
    Replaced { id: ContractId, by: ContractId },
    UploadDisabled { id: ContractId },
    UploadRestored { id: ContractId },
    Expired { id: ContractId, host: HostKey },
}

/// A renter's view of a storage agreement with one host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub host: HostKey,
    pub refund_address: Address,
    pub start_height: BlockHeight,
    pub revision: Revision,
    pub renter_signature: Signature,
    pub host_signature: Signature,
    pub state: ContractState,
    pub good_for_renew: bool,
    pub good_for_upload: bool,
    pub renew_failures: u32,
    pub upload_failures: u32,
}

impl Contract {
    pub fn id(&self) -> ContractId {
        self.revision.contract_id
    }

    pub fn end_height(&self) -> BlockHeight {
        self.revision.end_height
    }

    pub fn revision_number(&self) -> u64 {
        self.revision.number
    }

    pub fn is_expired(&self, height: BlockHeight) -> bool {
        height >= self.revision.end_height
    }
}

struct Entry {
    session: Arc<Mutex<()>>,
    contract: RwLock<Contract>,
}

/// Exclusive access to one contract for the length of a revision exchange.
///
/// Readers of the contract set are never blocked by a session; they see the
/// last committed revision until [`ContractSession::commit`] publishes the
/// next one.
pub struct ContractSession {
    entry: Arc<Entry>,
    _permit: OwnedMutexGuard<()>,
}

impl ContractSession {
    pub fn contract(&self) -> Contract {
        self.entry.contract.read().clone()
    }

    /// Publish a revision signed by both parties.
    pub fn commit(
        &self,
        revision: Revision,
        renter_signature: Signature,
        host_signature: Signature,
    ) -> Result<()> {
        let mut contract = self.entry.contract.write();
        if revision.contract_id != contract.id() {
            return Err(Permanent::new("revision is for another contract").into());
        }
        if revision.number <= contract.revision.number {
            return Err(Permanent::new(&format!(
                "revision {} does not advance contract past {}",
                revision.number, contract.revision.number
            ))
            .into());
        }
        contract.revision = revision;
        contract.renter_signature = renter_signature;
        contract.host_signature = host_signature;
        Ok(())
    }

    pub fn update<T>(&self, f: impl FnOnce(&mut Contract) -> T) -> T {
        f(&mut self.entry.contract.write())
    }
}

/// Every contract the renter holds, each behind its own session lock.
#[derive(Default)]
pub struct ContractSet {
    contracts: DashMap<ContractId, Arc<Entry>>,
}

impl ContractSet {
    pub fn new() -> ContractSet {
        ContractSet::default()
    }

    pub fn from_contracts(contracts: impl IntoIterator<Item = Contract>) -> ContractSet {
        let set = ContractSet::new();
        for contract in contracts {
            set.insert(contract);
        }
        set
    }

    pub fn insert(&self, contract: Contract) {
        self.contracts.insert(
            contract.id(),
            Arc::new(Entry {
                session: Arc::new(Mutex::new(())),
                contract: RwLock::new(contract),
            }),
        );
    }

    pub fn remove(&self, id: &ContractId) -> Option<Contract> {
        self.contracts
            .remove(id)
            .map(|(_, entry)| entry.contract.read().clone())
    }

    /// Wait for exclusive use of a contract. Sessions on different contracts
    /// proceed in parallel.
    pub async fn acquire(&self, id: &ContractId) -> Option<ContractSession> {
        // Clone the entry out so the map shard is not held across the await.
        let entry = self.contracts.get(id).map(|e| e.value().clone())?;
        let permit = entry.session.clone().lock_owned().await;
        Some(ContractSession {
            entry,
            _permit: permit,
        })
    }

    pub fn get(&self, id: &ContractId) -> Option<Contract> {
        self.contracts
            .get(id)
            .map(|e| e.value().contract.read().clone())
    }

    pub fn contains(&self, id: &ContractId) -> bool {
        self.contracts.contains_key(id)
    }

    /// Change a contract's bookkeeping outside of a revision exchange.
    pub fn update<T>(&self, id: &ContractId, f: impl FnOnce(&mut Contract) -> T) -> Option<T> {
        let entry = self.contracts.get(id).map(|e| e.value().clone())?;
        let mut contract = entry.contract.write();
        Some(f(&mut contract))
    }

    pub fn contracts(&self) -> Vec<Contract> {
        let mut contracts: Vec<Contract> = self
            .contracts
            .iter()
            .map(|e| e.value().contract.read().clone())
            .collect();
        contracts.sort_by_key(|c| (c.start_height, c.id()));
        contracts
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Contracts currently accepting new pieces.
    pub fn good_for_upload(&self) -> Vec<Contract> {
        self.contracts()
            .into_iter()
            .filter(|c| c.good_for_upload)
            .collect()
    }
}
