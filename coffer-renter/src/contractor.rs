use std::{collections::HashSet, sync::Arc};

use tokio::{
    select,
    sync::broadcast::{self, error::RecvError},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    actor::{Actor, ChanServer},
    config::RenterConfig,
    consensus::{Consensus, ConsensusChange},
    contract_set::{Contract, ContractEvent, ContractSet, ContractState},
    error::{is_cancelled, CancelError, Permanent},
    host::{probe_hosts, HostDiscovery, HostEntry, HostProtocol},
    hostdb::HostDb,
    persist::StateStore,
    transport::{OpOutput, PieceOp, PieceTransport},
    types::{BlockHeight, Commitment, ContractId, Revision},
    wallet::Wallet,
    Result,
};

/// What one maintenance pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MaintainReport {
    pub height: BlockHeight,
    pub expired: Vec<ContractId>,
    pub renewed: Vec<ContractId>,
    pub renew_failed: Vec<ContractId>,
    pub not_good_for_renew: Vec<ContractId>,
    pub formed: Vec<ContractId>,
    pub replaced: Vec<(ContractId, ContractId)>,
    pub upload_restored: Vec<ContractId>,
}

impl MaintainReport {
    pub fn changed(&self) -> bool {
        !(self.expired.is_empty()
            && self.renewed.is_empty()
            && self.renew_failed.is_empty()
            && self.formed.is_empty()
            && self.upload_restored.is_empty())
    }
}

/// Drives every contract through formation, renewal, replacement and
/// expiry as the chain advances.
pub struct ContractManager<H> {
    hosts: H,
    hostdb: HostDb,
    wallet: Arc<dyn Wallet>,
    contracts: Arc<ContractSet>,
    store: Arc<StateStore>,
    transport: PieceTransport<H>,
    events: broadcast::Sender<ContractEvent>,
    config: RenterConfig,
}

impl<H: Clone> Clone for ContractManager<H> {
    fn clone(&self) -> Self {
        ContractManager {
            hosts: self.hosts.clone(),
            hostdb: self.hostdb.clone(),
            wallet: self.wallet.clone(),
            contracts: self.contracts.clone(),
            store: self.store.clone(),
            transport: self.transport.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
        }
    }
}

impl<H: HostProtocol> ContractManager<H> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hosts: H,
        hostdb: HostDb,
        wallet: Arc<dyn Wallet>,
        contracts: Arc<ContractSet>,
        store: Arc<StateStore>,
        transport: PieceTransport<H>,
        events: broadcast::Sender<ContractEvent>,
        config: RenterConfig,
    ) -> ContractManager<H> {
        ContractManager {
            hosts,
            hostdb,
            wallet,
            contracts,
            store,
            transport,
            events,
            config,
        }
    }

    pub fn height(&self) -> BlockHeight {
        self.hostdb.height()
    }

    /// Apply a consensus change and bring contracts up to date with the
    /// resulting height.
    pub async fn process_change(
        &self,
        change: &ConsensusChange,
        cancel: &CancellationToken,
    ) -> Result<MaintainReport> {
        self.hostdb.process_change(change);
        self.maintain(cancel).await
    }

    /// Rebuild host and height knowledge from the full chain, then maintain.
    pub async fn resync(
        &self,
        consensus: &dyn Consensus,
        cancel: &CancellationToken,
    ) -> Result<MaintainReport> {
        let (history, _) = consensus.subscribe();
        self.hostdb.resync(&history);
        self.maintain(cancel).await
    }

    /// Expire, renew and replace contracts at the current height.
    #[tracing::instrument(skip_all, fields(height = self.height()), err)]
    pub async fn maintain(&self, cancel: &CancellationToken) -> Result<MaintainReport> {
        let height = self.height();
        let mut report = MaintainReport {
            height,
            ..Default::default()
        };

        for contract in self.contracts.contracts() {
            if contract.is_expired(height) {
                self.contracts.remove(&contract.id());
                info!(contract = %contract.id(), host = %contract.host, "contract expired");
                report.expired.push(contract.id());
                self.emit(ContractEvent::Expired {
                    id: contract.id(),
                    host: contract.host,
                });
            }
        }

        self.renew_due(height, cancel, &mut report).await?;
        self.restore_uploads(&mut report).await;
        self.form_replacements(height, cancel, &mut report).await?;

        // Failure counters change between passes too.
        self.store.save_contracts(&self.contracts).await?;
        Ok(report)
    }

    /// Put reachable good-for-renew contracts back into upload rotation and
    /// clear their failure counts.
    async fn restore_uploads(&self, report: &mut MaintainReport) {
        let disabled: Vec<Contract> = self
            .contracts
            .contracts()
            .into_iter()
            .filter(|c| c.good_for_renew && (!c.good_for_upload || c.upload_failures > 0))
            .collect();
        if disabled.is_empty() {
            return;
        }
        let online = probe_hosts(&self.hosts, disabled.iter().map(|c| c.host)).await;
        for contract in disabled.iter().filter(|c| online.contains(&c.host)) {
            let id = contract.id();
            let restored = self
                .contracts
                .update(&id, |c| {
                    c.upload_failures = 0;
                    if c.good_for_renew && !c.good_for_upload {
                        c.good_for_upload = true;
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
            if restored {
                info!(contract = %id, "contract good for upload again");
                report.upload_restored.push(id);
                self.emit(ContractEvent::UploadRestored { id });
            }
        }
    }

    async fn renew_due(
        &self,
        height: BlockHeight,
        cancel: &CancellationToken,
        report: &mut MaintainReport,
    ) -> Result<()> {
        let window = self.config.allowance.renew_window;
        let due: Vec<Contract> = self
            .contracts
            .contracts()
            .into_iter()
            .filter(|c| c.good_for_renew && height + window >= c.end_height())
            .collect();

        let mut renewals = JoinSet::new();
        for contract in due {
            let manager = self.clone();
            let cancel = cancel.clone();
            renewals.spawn(async move {
                let id = contract.id();
                (id, manager.renew(contract, &cancel).await)
            });
        }
        while let Some(joined) = renewals.join_next().await {
            let (id, res) = joined?;
            match res {
                Ok(end_height) => {
                    self.contracts.update(&id, |c| {
                        c.state = ContractState::Active;
                        c.renew_failures = 0;
                    });
                    info!(contract = %id, end_height, "contract renewed");
                    report.renewed.push(id);
                    self.emit(ContractEvent::Renewed { id, end_height });
                }
                Err(e) if is_cancelled(&e) => {
                    self.contracts
                        .update(&id, |c| c.state = ContractState::Active);
                    return Err(e);
                }
                Err(e) => {
                    let failures = self
                        .contracts
                        .update(&id, |c| {
                            c.state = ContractState::Active;
                            c.renew_failures += 1;
                            c.renew_failures
                        })
                        .unwrap_or(0);
                    warn!(contract = %id, failures, err = %e, "renewal failed");
                    report.renew_failed.push(id);
                    self.emit(ContractEvent::RenewFailed { id, failures });
                    if self.mark_not_good_for_renew(&id, height) {
                        report.not_good_for_renew.push(id);
                    }
                }
            }
        }
        Ok(())
    }

    async fn renew(&self, contract: Contract, cancel: &CancellationToken) -> Result<BlockHeight> {
        let id = contract.id();
        self.contracts
            .update(&id, |c| c.state = ContractState::Renewing);
        let op = PieceOp::Renew {
            end_height: contract.end_height() + self.config.allowance.period,
            funds: self.config.allowance.funds,
        };
        let transport = &self.transport;
        let out = self
            .config
            .retry
            .run(cancel, move || {
                let op = op.clone();
                async move { transport.transfer(&id, op, cancel).await }
            })
            .await?;
        match out {
            OpOutput::Renewed(end_height) => Ok(end_height),
            other => Err(Permanent::new(&format!("unexpected renewal output {:?}", other)).into()),
        }
    }

    /// Give up on renewing a contract once it has failed too often or its
    /// end is too close. Happens at most once per contract; returns whether
    /// it happened now.
    fn mark_not_good_for_renew(&self, id: &ContractId, height: BlockHeight) -> bool {
        let max_failures = self.config.max_renew_failures;
        let half_window = self.config.allowance.renew_window / 2;
        let marked = self
            .contracts
            .update(id, |c| {
                if !c.good_for_renew {
                    return false;
                }
                if c.renew_failures < max_failures && height + half_window < c.end_height() {
                    return false;
                }
                c.good_for_renew = false;
                c.good_for_upload = false;
                c.state = ContractState::NotGoodForRenew;
                true
            })
            .unwrap_or(false);
        if marked {
            warn!(contract = %id, "contract no longer good for renew");
            self.emit(ContractEvent::NotGoodForRenew { id: *id });
        }
        marked
    }

    /// Form contracts with new hosts until the good-for-renew count is back
    /// at the allowance.
    async fn form_replacements(
        &self,
        height: BlockHeight,
        cancel: &CancellationToken,
        report: &mut MaintainReport,
    ) -> Result<()> {
        let contracts = self.contracts.contracts();
        let good = contracts.iter().filter(|c| c.good_for_renew).count();
        let wanted = self.config.allowance.hosts.saturating_sub(good);
        if wanted == 0 {
            return Ok(());
        }
        let used: HashSet<_> = contracts.iter().map(|c| c.host).collect();
        let candidates: Vec<HostEntry> = self
            .hostdb
            .candidate_hosts()
            .into_iter()
            .filter(|h| !used.contains(&h.key))
            .collect();
        let online = probe_hosts(&self.hosts, candidates.iter().map(|h| h.key)).await;

        let mut formed = vec![];
        for candidate in candidates.into_iter().filter(|h| online.contains(&h.key)) {
            if formed.len() == wanted {
                break;
            }
            if cancel.is_cancelled() {
                return Err(CancelError.into());
            }
            match self.form_contract(&candidate, height).await {
                Ok(id) => formed.push(id),
                Err(e) => warn!(host = %candidate.key, err = %e, "contract formation failed"),
            }
        }
        if formed.len() < wanted {
            warn!(
                formed = formed.len(),
                wanted, "not enough hosts to meet the allowance"
            );
        }

        // Pair each given-up contract with a new one.
        let mut replacements = formed.iter().copied();
        for contract in contracts
            .iter()
            .filter(|c| c.state == ContractState::NotGoodForRenew)
        {
            let Some(by) = replacements.next() else {
                break;
            };
            let id = contract.id();
            self.contracts
                .update(&id, |c| c.state = ContractState::Replaced);
            debug!(contract = %id, by = %by, "contract replaced");
            report.replaced.push((id, by));
            self.emit(ContractEvent::Replaced { id, by });
        }
        report.formed.extend(formed);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(host = %host.key), err)]
    pub async fn form_contract(&self, host: &HostEntry, height: BlockHeight) -> Result<ContractId> {
        let settings = self.hosts.settings(&host.key).await?;
        if !settings.accepting_contracts {
            return Err(Permanent::new("host is not accepting contracts").into());
        }
        let allowance = &self.config.allowance;
        let revision = Revision {
            contract_id: ContractId::random(),
            renter_key: self.wallet.public_key(),
            host_key: host.key,
            number: 0,
            end_height: height + allowance.period,
            renter_funds: allowance.funds,
            host_funds: 0,
            piece_count: 0,
            data_size: 0,
            commitment: Commitment::default(),
        };
        let renter_signature = self.wallet.sign(&revision)?;
        let host_signature = self
            .hosts
            .form_contract(&host.key, &revision, &renter_signature)
            .await?;
        host.key.verify(&revision.sig_hash(), &host_signature)?;

        let id = revision.contract_id;
        self.contracts.insert(Contract {
            host: host.key,
            refund_address: self.wallet.new_address()?,
            start_height: height,
            revision,
            renter_signature,
            host_signature,
            state: ContractState::Active,
            good_for_renew: true,
            good_for_upload: true,
            renew_failures: 0,
            upload_failures: 0,
        });
        info!(contract = %id, net_address = %host.net_address, "contract formed");
        self.emit(ContractEvent::Formed { id, host: host.key });
        Ok(id)
    }

    fn emit(&self, event: ContractEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[derive(Debug)]
pub enum MaintainerRequest {
    MaintainNow,
}

/// Follows consensus and maintains contracts after every change.
pub struct ContractMaintainer<H> {
    manager: ContractManager<H>,
    consensus: Arc<dyn Consensus>,
    cancel: CancellationToken,
}

impl<H: HostProtocol> ContractMaintainer<H> {
    pub fn new(manager: ContractManager<H>, consensus: Arc<dyn Consensus>) -> ContractMaintainer<H> {
        ContractMaintainer {
            manager,
            consensus,
            cancel: CancellationToken::new(),
        }
    }

    fn logged(res: Result<MaintainReport>) -> Result<MaintainReport> {
        match res {
            Ok(report) => {
                if report.changed() {
                    info!(?report, "contracts maintained");
                }
                Ok(report)
            }
            Err(e) if is_cancelled(&e) => Err(e),
            Err(e) => {
                warn!(err = %e, "contract maintenance failed, will retry on next block");
                Ok(MaintainReport::default())
            }
        }
    }
}

impl<H: HostProtocol> Actor for ContractMaintainer<H> {
    type Request = MaintainerRequest;
    type Response = MaintainReport;

    async fn run(
        &mut self,
        cancel: CancellationToken,
        mut server_ch: ChanServer<MaintainerRequest, MaintainReport>,
    ) -> Result<()> {
        self.cancel = cancel.clone();
        let (history, mut changes) = self.consensus.subscribe();
        self.manager.hostdb.resync(&history);
        let res = self.manager.maintain(&cancel).await;
        Self::logged(res)?;
        loop {
            select! {
                _ = cancel.cancelled() => {
                    return Err(CancelError.into());
                }
                res = server_ch.recv() => {
                    let req = res.ok_or(CancelError)?;
                    let report = self.handle(&req).await?;
                    server_ch.send(report).await?;
                }
                res = changes.recv() => {
                    let res = match res {
                        Ok(change) => self.manager.process_change(&change, &cancel).await,
                        Err(RecvError::Lagged(n)) => {
                            warn!(n, "consensus changes missed, resyncing");
                            let (history, rx) = self.consensus.subscribe();
                            changes = rx;
                            self.manager.hostdb.resync(&history);
                            self.manager.maintain(&cancel).await
                        }
                        Err(RecvError::Closed) => return Err(CancelError.into()),
                    };
                    Self::logged(res)?;
                }
            }
        }
    }

    async fn handle(&mut self, req: &MaintainerRequest) -> Result<MaintainReport> {
        match req {
            MaintainerRequest::MaintainNow => {
                let res = self.manager.maintain(&self.cancel).await;
                Self::logged(res)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::{
        consensus::{HostAnnouncement, LocalChain},
        host::LocalHosts,
        ratelimit::RateLimiter,
        tests::{init_logging, test_config},
        transport::NoFailures,
        types::HostKey,
        wallet::KeyWallet,
    };

    struct Fixture {
        _dir: TempDir,
        hosts: LocalHosts,
        chain: LocalChain,
        contracts: Arc<ContractSet>,
        store: Arc<StateStore>,
        manager: ContractManager<LocalHosts>,
        events: broadcast::Receiver<ContractEvent>,
        cancel: CancellationToken,
    }

    impl Fixture {
        async fn new(n_hosts: usize, config: RenterConfig) -> Fixture {
            init_logging();
            let dir = tempfile::tempdir().expect("tempdir");
            let hosts = LocalHosts::new();
            let chain = LocalChain::new();
            let announced = (0..n_hosts)
                .map(|_| {
                    let entry = hosts.add_host();
                    HostAnnouncement {
                        key: entry.key,
                        net_address: entry.net_address,
                    }
                })
                .collect();
            chain.mine_block(announced);

            let wallet: Arc<dyn Wallet> = Arc::new(KeyWallet::generate());
            let contracts = Arc::new(ContractSet::new());
            let store = Arc::new(StateStore::open(dir.path()).await.expect("store"));
            let transport = PieceTransport::new(
                hosts.clone(),
                wallet.clone(),
                contracts.clone(),
                RateLimiter::default(),
                Arc::new(NoFailures),
                Duration::from_secs(5),
            )
            .with_store(store.clone());
            let (tx, events) = broadcast::channel(256);
            let manager = ContractManager::new(
                hosts.clone(),
                HostDb::default(),
                wallet,
                contracts.clone(),
                store.clone(),
                transport,
                tx,
                config,
            );
            let f = Fixture {
                _dir: dir,
                hosts,
                chain,
                contracts,
                store,
                manager,
                events,
                cancel: CancellationToken::new(),
            };
            f.manager
                .resync(&f.chain, &f.cancel)
                .await
                .expect("initial maintenance");
            f
        }

        /// Mine `n` blocks, maintaining after each.
        async fn advance(&self, n: usize) -> Vec<MaintainReport> {
            let mut reports = vec![];
            for _ in 0..n {
                self.chain.mine_blocks(1);
                reports.push(
                    self.manager
                        .resync(&self.chain, &self.cancel)
                        .await
                        .expect("maintain"),
                );
            }
            reports
        }

        fn only_contract(&self) -> Contract {
            let contracts = self.contracts.contracts();
            assert_eq!(contracts.len(), 1);
            contracts[0].clone()
        }

        fn not_good_for_renew_events(&mut self) -> Vec<ContractId> {
            let mut ids = vec![];
            while let Ok(event) = self.events.try_recv() {
                if let ContractEvent::NotGoodForRenew { id } = event {
                    ids.push(id);
                }
            }
            ids
        }
    }

    #[tokio::test]
    async fn renewal_extends_and_refills() {
        let config = test_config(1);
        let funds = config.allowance.funds;
        let f = Fixture::new(1, config).await;
        let contract = f.only_contract();
        assert_eq!(contract.end_height(), 21);

        f.manager
            .transport
            .transfer(&contract.id(), PieceOp::Write(Arc::new(vec![1u8; 64])), &f.cancel)
            .await
            .expect("write");
        let spent = f.contracts.get(&contract.id()).expect("contract");
        assert_eq!(spent.revision.renter_funds, funds - 64);

        // Renewal is due once the end is within the renew window.
        let reports = f.advance(10).await;
        let renewed: Vec<BlockHeight> = reports
            .iter()
            .filter(|r| !r.renewed.is_empty())
            .map(|r| r.height)
            .collect();
        assert_eq!(renewed, vec![11]);

        let renewed = f.contracts.get(&contract.id()).expect("contract");
        assert_eq!(renewed.end_height(), 41);
        assert_eq!(renewed.revision.renter_funds, funds);
        assert_eq!(renewed.revision.host_funds, 64);
        assert_eq!(renewed.revision.number, 2);
        assert!(renewed.good_for_renew && renewed.good_for_upload);
    }

    #[tokio::test]
    async fn locked_host_wallet_gives_up_at_half_window() {
        let config = RenterConfig {
            max_renew_failures: 100,
            ..test_config(1)
        };
        let mut f = Fixture::new(2, config).await;
        let contract = f.only_contract();
        assert!(f.hosts.set_wallet_locked(&contract.host, true));

        // Renewals fail from height 11; the contract is given up on once its
        // end is within half the renew window.
        let reports = f.advance(19).await;
        let failed: Vec<BlockHeight> = reports
            .iter()
            .filter(|r| r.renew_failed.contains(&contract.id()))
            .map(|r| r.height)
            .collect();
        assert_eq!(failed, (11..=16).collect::<Vec<_>>());
        let given_up: Vec<BlockHeight> = reports
            .iter()
            .filter(|r| !r.not_good_for_renew.is_empty())
            .map(|r| r.height)
            .collect();
        assert_eq!(given_up, vec![16]);
        assert_eq!(f.not_good_for_renew_events(), vec![contract.id()]);

        let old = f.contracts.get(&contract.id()).expect("still readable");
        assert_eq!(old.state, ContractState::Replaced);
        assert!(!old.good_for_renew && !old.good_for_upload);
        assert_eq!(old.end_height(), 21);

        let replacement: Vec<Contract> = f
            .contracts
            .contracts()
            .into_iter()
            .filter(|c| c.good_for_renew)
            .collect();
        assert_eq!(replacement.len(), 1);
        assert_ne!(replacement[0].host, contract.host);
    }

    #[tokio::test]
    async fn renew_failure_limit_gives_up_early() {
        let mut f = Fixture::new(1, test_config(1)).await;
        let contract = f.only_contract();
        f.hosts.set_wallet_locked(&contract.host, true);

        let reports = f.advance(12).await;
        let given_up: Vec<BlockHeight> = reports
            .iter()
            .filter(|r| !r.not_good_for_renew.is_empty())
            .map(|r| r.height)
            .collect();
        assert_eq!(given_up, vec![12]);
        assert_eq!(f.not_good_for_renew_events().len(), 1);
        let contract = f.only_contract();
        assert_eq!(contract.renew_failures, 2);
        assert_eq!(contract.state, ContractState::NotGoodForRenew);
    }

    #[tokio::test]
    async fn maintenance_restores_upload_for_reachable_hosts() {
        let f = Fixture::new(2, test_config(2)).await;
        let contracts = f.contracts.contracts();
        assert_eq!(contracts.len(), 2);
        for c in contracts.iter() {
            f.contracts.update(&c.id(), |c| {
                c.good_for_upload = false;
                c.upload_failures = 5;
            });
        }
        let (up, down): (HostKey, HostKey) = (contracts[0].host, contracts[1].host);
        f.hosts.set_online(&down, false);

        let report = f.manager.maintain(&f.cancel).await.expect("maintain");
        assert_eq!(report.upload_restored, vec![contracts[0].id()]);
        let restored = f.contracts.get(&contracts[0].id()).expect("contract");
        assert!(restored.good_for_upload);
        assert_eq!(restored.upload_failures, 0);
        assert_eq!(restored.host, up);
        assert!(!f.contracts.get(&contracts[1].id()).expect("contract").good_for_upload);

        let saved = f.store.load_contracts().await.expect("load");
        let saved = saved
            .iter()
            .find(|c| c.id() == contracts[0].id())
            .expect("saved");
        assert!(saved.good_for_upload);

        f.hosts.set_online(&down, true);
        let report = f.manager.maintain(&f.cancel).await.expect("maintain");
        assert_eq!(report.upload_restored, vec![contracts[1].id()]);
        assert_eq!(f.contracts.good_for_upload().len(), 2);
    }
}
