use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    contract_set::{ContractSession, ContractSet},
    error::{transient, CancelError, Permanent, Transient},
    host::HostProtocol,
    persist::StateStore,
    ratelimit::{Direction, RateLimiter},
    types::{BlockHeight, ContractId, Currency, PieceRoot},
    wallet::Wallet,
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Upload,
    Download,
    Renew,
}

/// Points in a revision exchange where a session can be cut short.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InterruptPoint {
    BeforeSendingRevision,
    AfterSendingRevision,
}

/// Decides whether a transfer session is interrupted at a given point.
/// Production code runs with [`NoFailures`].
pub trait FailureInjector: Send + Sync {
    fn interrupt(&self, kind: TransferKind, point: InterruptPoint) -> bool;
}

pub struct NoFailures;

impl FailureInjector for NoFailures {
    fn interrupt(&self, _kind: TransferKind, _point: InterruptPoint) -> bool {
        false
    }
}

const DISARMED: u8 = 0;
const ONCE: u8 = 1;
const ALWAYS: u8 = 2;

/// Interrupts one kind of transfer at one point, once or until disarmed.
pub struct Interrupt {
    kind: TransferKind,
    point: InterruptPoint,
    mode: AtomicU8,
}

impl Interrupt {
    pub fn new(kind: TransferKind, point: InterruptPoint) -> Interrupt {
        Interrupt {
            kind,
            point,
            mode: AtomicU8::new(DISARMED),
        }
    }

    /// Interrupt the next matching session.
    pub fn fail(&self) {
        self.mode.store(ONCE, Ordering::SeqCst);
    }

    /// Interrupt every matching session until disarmed.
    pub fn fail_always(&self) {
        self.mode.store(ALWAYS, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.mode.store(DISARMED, Ordering::SeqCst);
    }
}

impl FailureInjector for Interrupt {
    fn interrupt(&self, kind: TransferKind, point: InterruptPoint) -> bool {
        if kind != self.kind || point != self.point {
            return false;
        }
        match self.mode.load(Ordering::SeqCst) {
            ALWAYS => true,
            ONCE => self
                .mode
                .compare_exchange(ONCE, DISARMED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok(),
            _ => false,
        }
    }
}

/// What a transfer session does to its contract.
#[derive(Clone, Debug)]
pub enum PieceOp {
    /// Append a piece.
    Write(Arc<Vec<u8>>),
    /// Pay for and retrieve a stored piece of known length.
    Read { root: PieceRoot, length: usize },
    /// Extend the contract, topping renter funds up to at least `funds`.
    Renew {
        end_height: BlockHeight,
        funds: Currency,
    },
}

impl PieceOp {
    pub fn kind(&self) -> TransferKind {
        match self {
            PieceOp::Write(_) => TransferKind::Upload,
            PieceOp::Read { .. } => TransferKind::Download,
            PieceOp::Renew { .. } => TransferKind::Renew,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpOutput {
    Written(PieceRoot),
    Read(Vec<u8>),
    Renewed(BlockHeight),
}

/// Runs revision exchanges with hosts.
///
/// Each call holds its contract's session for the whole exchange, so at most
/// one revision per contract is ever in flight. The contract's revision only
/// changes once the host's countersignature has been verified; a session
/// that fails or is interrupted anywhere before that leaves it untouched.
pub struct PieceTransport<H> {
    hosts: H,
    wallet: Arc<dyn Wallet>,
    contracts: Arc<ContractSet>,
    limiter: RateLimiter,
    failures: Arc<dyn FailureInjector>,
    timeout: Duration,
    store: Option<Arc<StateStore>>,
}

impl<H: Clone> Clone for PieceTransport<H> {
    fn clone(&self) -> Self {
        PieceTransport {
            hosts: self.hosts.clone(),
            wallet: self.wallet.clone(),
            contracts: self.contracts.clone(),
            limiter: self.limiter.clone(),
            failures: self.failures.clone(),
            timeout: self.timeout,
            store: self.store.clone(),
        }
    }
}

impl<H: HostProtocol> PieceTransport<H> {
    pub fn new(
        hosts: H,
        wallet: Arc<dyn Wallet>,
        contracts: Arc<ContractSet>,
        limiter: RateLimiter,
        failures: Arc<dyn FailureInjector>,
        timeout: Duration,
    ) -> PieceTransport<H> {
        PieceTransport {
            hosts,
            wallet,
            contracts,
            limiter,
            failures,
            timeout,
            store: None,
        }
    }

    /// Save the contract set to `store` after every committed revision.
    pub fn with_store(mut self, store: Arc<StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn hosts(&self) -> &H {
        &self.hosts
    }

    #[tracing::instrument(skip_all, fields(contract = %contract_id, kind = ?op.kind()), err)]
    pub async fn transfer(
        &self,
        contract_id: &ContractId,
        op: PieceOp,
        cancel: &CancellationToken,
    ) -> Result<OpOutput> {
        let session = select! {
            biased;
            _ = cancel.cancelled() => return Err(CancelError.into()),
            session = self.contracts.acquire(contract_id) => session,
        }
        .ok_or_else(|| Permanent::new(&format!("no contract {}", contract_id)))?;
        let before = session.contract().revision_number();

        let res = select! {
            biased;
            _ = cancel.cancelled() => Err(CancelError.into()),
            res = tokio::time::timeout(self.timeout, self.exchange(&session, op)) => {
                match res {
                    Ok(res) => res,
                    Err(_) => Err(Transient::new("revision exchange timed out").into()),
                }
            }
        };

        // A read commits before its piece is checked, so save on any advance.
        if session.contract().revision_number() != before {
            self.save().await;
        }
        res
    }

    async fn save(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_contracts(&self.contracts).await {
                warn!(err = %e, "failed to save contracts");
            }
        }
    }

    async fn exchange(&self, session: &ContractSession, op: PieceOp) -> Result<OpOutput> {
        let contract = session.contract();
        let host = contract.host;
        let kind = op.kind();

        let settings = self.hosts.settings(&host).await.map_err(transient)?;
        let mut proposed = contract.revision.next();
        match &op {
            PieceOp::Write(piece) => {
                let root = PieceRoot::of(piece);
                proposed.pay(settings.upload_price * piece.len() as Currency)?;
                proposed.append(&root, piece.len());
                self.limiter.acquire(Direction::Upload, piece.len()).await;
                self.hosts
                    .send_piece(&host, &contract.id(), piece)
                    .await
                    .map_err(transient)?;
            }
            PieceOp::Read { length, .. } => {
                proposed.pay(settings.download_price * *length as Currency)?;
            }
            PieceOp::Renew { end_height, funds } => {
                proposed.end_height = *end_height;
                proposed.renter_funds = proposed.renter_funds.max(*funds);
            }
        }

        let renter_signature = self.wallet.sign(&proposed)?;
        if self
            .failures
            .interrupt(kind, InterruptPoint::BeforeSendingRevision)
        {
            warn!(?kind, "interrupted before sending revision");
            return Err(Transient::new("interrupted before sending revision").into());
        }
        self.hosts
            .send_revision(&host, &proposed, &renter_signature)
            .await
            .map_err(transient)?;
        if self
            .failures
            .interrupt(kind, InterruptPoint::AfterSendingRevision)
        {
            warn!(?kind, "interrupted after sending revision");
            return Err(Transient::new("interrupted after sending revision").into());
        }
        let host_signature = self
            .hosts
            .recv_countersignature(&host, &contract.id())
            .await
            .map_err(transient)?;
        host.verify(&proposed.sig_hash(), &host_signature)?;

        let number = proposed.number;
        let end_height = proposed.end_height;
        session.commit(proposed, renter_signature, host_signature)?;
        trace!(revision = number, "committed revision");

        match op {
            PieceOp::Write(piece) => Ok(OpOutput::Written(PieceRoot::of(&piece))),
            PieceOp::Read { root, length } => {
                self.limiter.acquire(Direction::Download, length).await;
                let piece = self
                    .hosts
                    .recv_piece(&host, &contract.id(), &root)
                    .await
                    .map_err(transient)?;
                if PieceRoot::of(&piece) != root {
                    return Err(Error::new(Permanent::new(&format!(
                        "host {} returned a piece not matching {}",
                        host, root
                    ))));
                }
                debug!(root = %root, "piece received");
                Ok(OpOutput::Read(piece))
            }
            PieceOp::Renew { .. } => Ok(OpOutput::Renewed(end_height)),
        }
    }
}
