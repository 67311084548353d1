use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use tokio::{
    select,
    sync::broadcast::{self, error::RecvError},
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    actor::{Actor, ChanServer},
    contract_set::{ContractEvent, ContractSet},
    error::CancelError,
    file::{PieceLocation, RemoteFile},
    host::{probe_hosts, HostProtocol},
    repair::{RepairReport, RepairScheduler},
    types::{BlockHeight, ContractId, HostKey},
    Result,
};

/// Which piece locations can be read right now.
#[derive(Clone, Debug, Default)]
pub struct Availability {
    height: BlockHeight,
    online: HashSet<HostKey>,
    end_heights: HashMap<ContractId, BlockHeight>,
}

impl Availability {
    /// Check reachability of every host under contract.
    pub async fn probe<H: HostProtocol>(
        hosts: &H,
        contracts: &ContractSet,
        height: BlockHeight,
    ) -> Availability {
        let contracts = contracts.contracts();
        let online = probe_hosts(hosts, contracts.iter().map(|c| c.host)).await;
        Availability {
            height,
            online,
            end_heights: contracts
                .iter()
                .map(|c| (c.id(), c.end_height()))
                .collect(),
        }
    }

    /// A location counts if its contract is held and unexpired and its host
    /// answers.
    pub fn is_usable(&self, loc: &PieceLocation) -> bool {
        self.online.contains(&loc.host)
            && self
                .end_heights
                .get(&loc.contract)
                .map(|end| self.height < *end)
                .unwrap_or(false)
    }

    pub fn is_online(&self, host: &HostKey) -> bool {
        self.online.contains(host)
    }

    pub fn height(&self) -> BlockHeight {
        self.height
    }

    pub fn redundancy(&self, file: &RemoteFile) -> f64 {
        file.redundancy(|loc| self.is_usable(loc))
    }

    pub fn chunk_health(&self, file: &RemoteFile) -> Vec<usize> {
        file.chunks
            .iter()
            .map(|c| c.health(|loc| self.is_usable(loc)))
            .collect()
    }
}

#[derive(Debug)]
pub enum TrackerRequest {
    /// Check every file now rather than waiting for the next trigger.
    RepairNow,
}

/// Background redundancy maintenance. Runs a repair pass on each contract
/// event and on a fixed interval.
pub struct RedundancyTracker<H> {
    scheduler: RepairScheduler<H>,
    events: broadcast::Receiver<ContractEvent>,
    period: Duration,
    cancel: CancellationToken,
}

impl<H: HostProtocol> RedundancyTracker<H> {
    pub fn new(
        scheduler: RepairScheduler<H>,
        events: broadcast::Receiver<ContractEvent>,
        period: Duration,
    ) -> RedundancyTracker<H> {
        RedundancyTracker {
            scheduler,
            events,
            period,
            cancel: CancellationToken::new(),
        }
    }

    async fn repair(&self, cancel: &CancellationToken) -> Result<RepairReport> {
        match self.scheduler.repair_all(cancel).await {
            Ok(report) => {
                if report.changed() {
                    info!(?report, "repair pass");
                } else {
                    debug!(?report, "repair pass");
                }
                Ok(report)
            }
            Err(e) if crate::error::is_cancelled(&e) => Err(e),
            Err(e) => {
                warn!(err = %e, "repair pass failed, will retry on next trigger");
                Ok(RepairReport::default())
            }
        }
    }

    /// Collapse a burst of queued events into one trigger.
    fn drain_events(&mut self) -> Result<()> {
        loop {
            match self.events.try_recv() {
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return Ok(()),
                Err(broadcast::error::TryRecvError::Closed) => return Err(CancelError.into()),
            }
        }
    }
}

impl<H: HostProtocol> Actor for RedundancyTracker<H> {
    type Request = TrackerRequest;
    type Response = RepairReport;

    async fn run(
        &mut self,
        cancel: CancellationToken,
        mut server_ch: ChanServer<TrackerRequest, RepairReport>,
    ) -> Result<()> {
        self.cancel = cancel.clone();
        let mut ticks = interval(self.period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
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
                res = self.events.recv() => {
                    match res {
                        Ok(event) => debug!(?event, "contract event"),
                        Err(RecvError::Lagged(n)) => debug!(n, "contract events lagged"),
                        Err(RecvError::Closed) => return Err(CancelError.into()),
                    }
                    self.drain_events()?;
                    self.repair(&cancel).await?;
                }
                _ = ticks.tick() => {
                    self.repair(&cancel).await?;
                }
            }
        }
    }

    async fn handle(&mut self, req: &TrackerRequest) -> Result<RepairReport> {
        match req {
            TrackerRequest::RepairNow => self.repair(&self.cancel).await,
        }
    }
}
