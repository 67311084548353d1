use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use coffer_fileindex::{ChunkLayout, ErasureParams, Index, Indexer};
use tokio::{sync::broadcast, task::JoinError};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    actor::{Operator, UntilCancelled},
    config::RenterConfig,
    consensus::Consensus,
    contract_set::{ContractEvent, ContractSet, ContractState},
    contractor::{ContractMaintainer, ContractManager, MaintainReport, MaintainerRequest},
    download::{DownloadHandle, DownloadPipeline},
    error::InvalidInput,
    file::{FileSet, RemoteFile},
    host::HostProtocol,
    hostdb::HostDb,
    persist::StateStore,
    ratelimit::RateLimiter,
    redundancy::{Availability, RedundancyTracker, TrackerRequest},
    repair::{RepairReport, RepairScheduler},
    stream_cache::{CacheStats, StreamCache},
    transport::{FailureInjector, NoFailures, PieceTransport},
    types::{BlockHeight, ContractId, FileId, HostKey},
    upload::{UploadHandle, UploadPipeline},
    wallet::Wallet,
    Result,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The outside world a renter talks to.
pub struct Collaborators<H> {
    pub hosts: H,
    pub consensus: Arc<dyn Consensus>,
    pub wallet: Arc<dyn Wallet>,
    pub failures: Arc<dyn FailureInjector>,
}

impl<H> Collaborators<H> {
    pub fn new(hosts: H, consensus: Arc<dyn Consensus>, wallet: Arc<dyn Wallet>) -> Self {
        Collaborators {
            hosts,
            consensus,
            wallet,
            failures: Arc::new(NoFailures),
        }
    }

    pub fn with_failures(mut self, failures: Arc<dyn FailureInjector>) -> Self {
        self.failures = failures;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    pub id: FileId,
    pub path: String,
    pub size: u64,
    pub data_pieces: usize,
    pub parity_pieces: usize,
    pub redundancy: f64,
    /// Redundancy with every piece of every chunk retrievable.
    pub full_redundancy: f64,
    pub chunk_health: Vec<usize>,
    pub uploaded_bytes: u64,
    pub local: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractInfo {
    pub id: ContractId,
    pub host: HostKey,
    pub state: ContractState,
    pub good_for_renew: bool,
    pub good_for_upload: bool,
    pub end_height: BlockHeight,
    pub revision_number: u64,
}

/// Background loops started by [`Renter::spawn_background`].
pub struct Background {
    pub contracts: Operator<MaintainerRequest, MaintainReport>,
    pub redundancy: Operator<TrackerRequest, RepairReport>,
}

impl Background {
    pub fn cancel(&self) {
        self.contracts.cancel();
        self.redundancy.cancel();
    }

    pub async fn join(self) -> std::result::Result<Result<()>, JoinError> {
        let contracts = self.contracts.join().await?;
        let redundancy = self.redundancy.join().await?;
        Ok(contracts.and(redundancy))
    }
}

/// Stores files on hosts under contract and keeps them retrievable.
pub struct Renter<H> {
    config: RenterConfig,
    hosts: H,
    consensus: Arc<dyn Consensus>,
    hostdb: HostDb,
    contracts: Arc<ContractSet>,
    files: Arc<FileSet>,
    store: Arc<StateStore>,
    limiter: RateLimiter,
    cache: Arc<StreamCache>,
    events: broadcast::Sender<ContractEvent>,
    manager: ContractManager<H>,
    upload: UploadPipeline<H>,
    download: DownloadPipeline<H>,
    repair: RepairScheduler<H>,
}

impl<H: HostProtocol> Renter<H> {
    /// Open the renter state in `state_dir` and catch up with consensus.
    #[tracing::instrument(skip_all, err)]
    pub async fn new(
        collaborators: Collaborators<H>,
        config: RenterConfig,
        state_dir: &Path,
    ) -> Result<Renter<H>> {
        let Collaborators {
            hosts,
            consensus,
            wallet,
            failures,
        } = collaborators;
        if config.piece_size == 0 {
            return Err(InvalidInput::new("piece size must be at least one byte").into());
        }
        let store = Arc::new(StateStore::open(state_dir).await?);
        let contracts = Arc::new(ContractSet::from_contracts(store.load_contracts().await?));
        let files = Arc::new(FileSet::from_files(store.load_files().await?));
        let hostdb = HostDb::default();
        hostdb.resync(&consensus.subscribe().0);

        let limiter = RateLimiter::default();
        let cache = Arc::new(StreamCache::new(config.stream_cache_size));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let transport = PieceTransport::new(
            hosts.clone(),
            wallet.clone(),
            contracts.clone(),
            limiter.clone(),
            failures,
            config.transfer_timeout,
        )
        .with_store(store.clone());
        let manager = ContractManager::new(
            hosts.clone(),
            hostdb.clone(),
            wallet,
            contracts.clone(),
            store.clone(),
            transport.clone(),
            events.clone(),
            config.clone(),
        );
        let upload = UploadPipeline::new(
            transport.clone(),
            contracts.clone(),
            files.clone(),
            store.clone(),
            events.clone(),
            config.retry.clone(),
            config.max_upload_failures,
            config.max_concurrent_chunks,
        );
        let download = DownloadPipeline::new(
            transport,
            contracts.clone(),
            cache.clone(),
            config.retry.clone(),
            config.max_concurrent_chunks,
        );
        let repair = RepairScheduler::new(
            hosts.clone(),
            hostdb.clone(),
            contracts.clone(),
            files.clone(),
            store.clone(),
            upload.clone(),
            download.clone(),
            config.clone(),
        );
        info!(
            dir = %state_dir.display(),
            contracts = contracts.len(),
            files = files.ids().len(),
            height = hostdb.height(),
            "renter opened"
        );
        Ok(Renter {
            config,
            hosts,
            consensus,
            hostdb,
            contracts,
            files,
            store,
            limiter,
            cache,
            events,
            manager,
            upload,
            download,
            repair,
        })
    }

    pub fn config(&self) -> &RenterConfig {
        &self.config
    }

    pub fn height(&self) -> BlockHeight {
        self.hostdb.height()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ContractEvent> {
        self.events.subscribe()
    }

    /// Index a local file and register it for upload.
    async fn prepare(&self, path: &Path, data_pieces: usize, parity_pieces: usize) -> Result<FileId> {
        let erasure = ErasureParams::new(data_pieces, parity_pieces)
            .map_err(|e| InvalidInput::new(&e.to_string()))?;
        let piece_size = self.config.piece_size;
        let index = Indexer::from_file(path, piece_size * data_pieces)
            .await
            .map_err(|e| InvalidInput::new(&format!("{}: {}", path.display(), e)))?
            .index()
            .await?;
        if index.length() == 0 {
            return Err(InvalidInput::new("cannot upload an empty file").into());
        }
        let layout = ChunkLayout::new(index.length(), piece_size, erasure);
        let remote_path = index.full_path().to_string_lossy().into_owned();
        let id = self
            .upload
            .register(RemoteFile::new(&remote_path, layout, Some(index)))?;
        self.store.save_files(&self.files).await?;
        Ok(id)
    }

    /// Upload a local file and wait until every piece is placed.
    #[tracing::instrument(skip_all, fields(path = %path.display()), err)]
    pub async fn upload_file(
        &self,
        path: &Path,
        data_pieces: usize,
        parity_pieces: usize,
        cancel: &CancellationToken,
    ) -> Result<FileId> {
        let id = self.prepare(path, data_pieces, parity_pieces).await?;
        self.upload.upload_file(id, cancel).await?;
        Ok(id)
    }

    /// Register a local file and upload it in the background.
    pub async fn start_upload(
        &self,
        path: &Path,
        data_pieces: usize,
        parity_pieces: usize,
        cancel: CancellationToken,
    ) -> Result<UploadHandle> {
        let id = self.prepare(path, data_pieces, parity_pieces).await?;
        Ok(self.upload.spawn_upload(id, cancel))
    }

    fn file(&self, id: &FileId) -> Result<RemoteFile> {
        self.files
            .get(id)
            .ok_or_else(|| InvalidInput::new(&format!("no file {}", id)).into())
    }

    #[cfg(test)]
    pub(crate) fn remote_file(&self, id: &FileId) -> Option<RemoteFile> {
        self.files.get(id)
    }

    pub fn find_file(&self, path: &str) -> Option<FileId> {
        self.files.find(path).map(|f| f.id)
    }

    pub async fn download_to_buffer(
        &self,
        id: &FileId,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let file = self.file(id)?;
        let length = file.length();
        self.stream_range(id, 0, length, cancel).await
    }

    /// Download a whole file to `dest`, returning the bytes written.
    pub async fn download_to_disk(
        &self,
        id: &FileId,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let file = Arc::new(self.file(id)?);
        self.download.download_to_path(file, dest, cancel, None).await
    }

    /// Download a whole file to `dest` in the background.
    pub fn start_download(
        &self,
        id: &FileId,
        dest: &Path,
        cancel: CancellationToken,
    ) -> Result<DownloadHandle> {
        let file = Arc::new(self.file(id)?);
        Ok(self.download.spawn_download_to_path(file, dest, cancel))
    }

    /// Bytes `[from, to)` of a file, served through the stream cache.
    pub async fn stream_range(
        &self,
        id: &FileId,
        from: u64,
        to: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let file = Arc::new(self.file(id)?);
        if from >= to || to > file.length() {
            return Err(InvalidInput::new(&format!(
                "invalid range [{}, {}) for file of length {}",
                from,
                to,
                file.length()
            ))
            .into());
        }
        let mut buf = Vec::with_capacity((to - from) as usize);
        self.download
            .download_range(file, from..to, &mut buf, cancel, None)
            .await?;
        Ok(buf)
    }

    /// Limit transfer rates in bytes per second; 0 is unlimited.
    pub fn set_bandwidth_limit(&self, download: u64, upload: u64) {
        self.limiter.set_limits(download, upload);
    }

    pub fn bandwidth_limit(&self) -> (u64, u64) {
        self.limiter.limits()
    }

    /// Resize the stream cache, in chunks. Zero is ignored.
    pub fn set_stream_cache_size(&self, chunks: usize) -> bool {
        self.cache.set_capacity(chunks)
    }

    pub fn stream_cache_size(&self) -> usize {
        self.cache.capacity()
    }

    pub fn stream_cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn info_of(file: &RemoteFile, avail: &Availability) -> FileInfo {
        FileInfo {
            id: file.id,
            path: file.path.clone(),
            size: file.length(),
            data_pieces: file.layout.erasure().data_pieces(),
            parity_pieces: file.layout.erasure().parity_pieces(),
            redundancy: avail.redundancy(file),
            full_redundancy: file.layout.erasure().full_redundancy(),
            chunk_health: avail.chunk_health(file),
            uploaded_bytes: file.uploaded_bytes(),
            local: file.local.as_ref().map(Index::full_path),
        }
    }

    /// Current redundancy and health, checked against live hosts.
    pub async fn file_info(&self, id: &FileId) -> Result<FileInfo> {
        let file = self.file(id)?;
        let avail = self.repair.availability().await;
        Ok(Self::info_of(&file, &avail))
    }

    pub async fn files(&self) -> Vec<FileInfo> {
        let avail = self.repair.availability().await;
        self.files
            .list()
            .iter()
            .map(|f| Self::info_of(f, &avail))
            .collect()
    }

    /// Forget a file. Its pieces stay on hosts until their contracts end.
    pub async fn delete_file(&self, id: &FileId) -> Result<()> {
        let file = self
            .files
            .remove(id)
            .ok_or_else(|| InvalidInput::new(&format!("no file {}", id)))?;
        self.cache.invalidate(id);
        self.store.save_files(&self.files).await?;
        info!(path = %file.path, "file deleted");
        Ok(())
    }

    pub fn list_contracts(&self) -> Vec<ContractInfo> {
        self.contracts
            .contracts()
            .into_iter()
            .map(|c| ContractInfo {
                id: c.id(),
                host: c.host,
                state: c.state,
                good_for_renew: c.good_for_renew,
                good_for_upload: c.good_for_upload,
                end_height: c.end_height(),
                revision_number: c.revision_number(),
            })
            .collect()
    }

    /// Catch up with consensus and run one contract maintenance pass.
    pub async fn maintain_contracts(&self, cancel: &CancellationToken) -> Result<MaintainReport> {
        self.manager.resync(self.consensus.as_ref(), cancel).await
    }

    /// Run one repair pass over every file.
    pub async fn repair(&self, cancel: &CancellationToken) -> Result<RepairReport> {
        self.repair.repair_all(cancel).await
    }

    /// Start contract maintenance and redundancy tracking; both stop when
    /// `cancel` is cancelled.
    pub fn spawn_background(&self, cancel: CancellationToken) -> Background {
        let maintainer = ContractMaintainer::new(self.manager.clone(), self.consensus.clone());
        let tracker = RedundancyTracker::new(
            self.repair.clone(),
            self.events.subscribe(),
            self.config.repair_interval,
        );
        Background {
            contracts: Operator::new(cancel.clone(), maintainer, UntilCancelled::default()),
            redundancy: Operator::new(cancel, tracker, UntilCancelled::default()),
        }
    }

    pub fn hosts(&self) -> &H {
        &self.hosts
    }
}
