use std::{collections::HashSet, sync::Arc};

use coffer_fileindex::read_chunk;
use parking_lot::Mutex;
use tokio::{
    sync::broadcast,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    contract_set::{ContractEvent, ContractSet},
    erasure::ErasureCoder,
    error::{is_cancelled, is_permanent, InvalidInput, PieceFailure, UploadFailed},
    file::{FileSet, PieceLocation, RemoteFile},
    host::HostProtocol,
    persist::StateStore,
    retry::Retry,
    transport::{OpOutput, PieceOp, PieceTransport},
    types::{ContractId, FileId, HostKey},
    Error, Result,
};

/// An upload running in the background. The file is already registered and
/// gains health as pieces land.
pub struct UploadHandle {
    file: FileId,
    task: JoinHandle<Result<()>>,
}

impl UploadHandle {
    pub fn file_id(&self) -> FileId {
        self.file
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<()> {
        self.task.await?
    }
}

/// Pieces of one chunk to place.
pub struct ChunkUpload {
    pub chunk_index: usize,
    pub pieces: Vec<(usize, Arc<Vec<u8>>)>,
}

/// Places pieces on contracts and records where they went.
pub struct UploadPipeline<H> {
    transport: PieceTransport<H>,
    contracts: Arc<ContractSet>,
    files: Arc<FileSet>,
    store: Arc<StateStore>,
    events: broadcast::Sender<ContractEvent>,
    retry: Retry,
    max_upload_failures: u32,
    max_concurrent_chunks: usize,
}

impl<H: Clone> Clone for UploadPipeline<H> {
    fn clone(&self) -> Self {
        UploadPipeline {
            transport: self.transport.clone(),
            contracts: self.contracts.clone(),
            files: self.files.clone(),
            store: self.store.clone(),
            events: self.events.clone(),
            retry: self.retry.clone(),
            max_upload_failures: self.max_upload_failures,
            max_concurrent_chunks: self.max_concurrent_chunks,
        }
    }
}

impl<H: HostProtocol> UploadPipeline<H> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: PieceTransport<H>,
        contracts: Arc<ContractSet>,
        files: Arc<FileSet>,
        store: Arc<StateStore>,
        events: broadcast::Sender<ContractEvent>,
        retry: Retry,
        max_upload_failures: u32,
        max_concurrent_chunks: usize,
    ) -> UploadPipeline<H> {
        UploadPipeline {
            transport,
            contracts,
            files,
            store,
            events,
            retry,
            max_upload_failures,
            max_concurrent_chunks: max_concurrent_chunks.max(1),
        }
    }

    /// Encode and upload every chunk of a registered file from its local
    /// copy. Fails with [`UploadFailed`] if any piece could not be placed.
    #[tracing::instrument(skip_all, fields(file = %file_id), err)]
    pub async fn upload_file(&self, file_id: FileId, cancel: &CancellationToken) -> Result<()> {
        let file = self
            .files
            .get(&file_id)
            .ok_or_else(|| InvalidInput::new(&format!("no file {}", file_id)))?;
        let local = Arc::new(
            file.local
                .clone()
                .ok_or_else(|| InvalidInput::new("file has no local copy to upload"))?,
        );
        let layout = file.layout;
        let coder = Arc::new(ErasureCoder::new(*layout.erasure())?);
        let online = Arc::new(self.online_contracts().await);

        let mut chunks = JoinSet::new();
        let mut failures = vec![];
        let mut next = 0;
        while next < layout.num_chunks() || !chunks.is_empty() {
            while next < layout.num_chunks() && chunks.len() < self.max_concurrent_chunks {
                let pipeline = self.clone();
                let local = local.clone();
                let coder = coder.clone();
                let online = online.clone();
                let cancel = cancel.clone();
                let chunk_index = next;
                chunks.spawn(async move {
                    let contents =
                        read_chunk(&local.full_path(), layout.chunk_size(), chunk_index).await?;
                    if !local.verify_chunk(chunk_index, &contents) {
                        return Err(Error::new(InvalidInput::new(&format!(
                            "local file changed since it was indexed (chunk {})",
                            chunk_index
                        ))));
                    }
                    let pieces = coder.encode(&contents, layout.piece_size())?;
                    let job = ChunkUpload {
                        chunk_index,
                        pieces: pieces.into_iter().map(Arc::new).enumerate().collect(),
                    };
                    Ok(pipeline.upload_chunk(file_id, job, &online, &cancel).await)
                });
                next += 1;
            }
            if let Some(res) = chunks.join_next().await {
                failures.extend(res??);
            }
        }
        if cancel.is_cancelled() {
            return Err(crate::error::CancelError.into());
        }
        if !failures.is_empty() {
            return Err(UploadFailed { failures }.into());
        }
        info!(path = %file.path, chunks = layout.num_chunks(), "upload complete");
        Ok(())
    }

    /// Run [`UploadPipeline::upload_file`] in the background.
    pub fn spawn_upload(&self, file_id: FileId, cancel: CancellationToken) -> UploadHandle {
        let pipeline = self.clone();
        let task = tokio::spawn(async move { pipeline.upload_file(file_id, &cancel).await });
        UploadHandle {
            file: file_id,
            task,
        }
    }

    /// Good-for-upload contracts whose hosts answer right now.
    pub async fn online_contracts(&self) -> Vec<(ContractId, HostKey)> {
        let candidates = self.contracts.good_for_upload();
        let online =
            crate::host::probe_hosts(self.transport.hosts(), candidates.iter().map(|c| c.host))
                .await;
        candidates
            .into_iter()
            .filter(|c| online.contains(&c.host))
            .map(|c| (c.id(), c.host))
            .collect()
    }

    /// Place the given pieces of one chunk, each on a different host that
    /// holds no other piece of the chunk. Returns the pieces that could not
    /// be placed anywhere.
    pub async fn upload_chunk(
        &self,
        file_id: FileId,
        job: ChunkUpload,
        candidates: &[(ContractId, HostKey)],
        cancel: &CancellationToken,
    ) -> Vec<PieceFailure> {
        let claimed: HashSet<HostKey> = self
            .files
            .get(&file_id)
            .and_then(|f| f.chunks.get(job.chunk_index).map(|c| c.hosts()))
            .unwrap_or_default();
        let claimed = Arc::new(Mutex::new(claimed));

        // Spread chunks over contracts rather than always starting at the first.
        let mut order = candidates.to_vec();
        if !order.is_empty() {
            let shift = job.chunk_index % order.len();
            order.rotate_left(shift);
        }
        let order = Arc::new(order);

        let mut pieces = JoinSet::new();
        for (piece_index, data) in job.pieces {
            let pipeline = self.clone();
            let claimed = claimed.clone();
            let order = order.clone();
            let cancel = cancel.clone();
            let chunk_index = job.chunk_index;
            pieces.spawn(async move {
                pipeline
                    .place_piece(file_id, chunk_index, piece_index, data, &order, &claimed, &cancel)
                    .await
            });
        }
        let mut failures = vec![];
        while let Some(res) = pieces.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => failures.push(failure),
                Err(e) => warn!(err = %e, "piece task failed"),
            }
        }
        failures
    }

    #[allow(clippy::too_many_arguments)]
    async fn place_piece(
        &self,
        file_id: FileId,
        chunk_index: usize,
        piece_index: usize,
        data: Arc<Vec<u8>>,
        order: &[(ContractId, HostKey)],
        claimed: &Mutex<HashSet<HostKey>>,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), PieceFailure> {
        let mut tried = vec![];
        let mut reason = "no eligible contract".to_owned();
        loop {
            let next = {
                let mut claimed = claimed.lock();
                let next = order.iter().copied().find(|(id, host)| {
                    !claimed.contains(host)
                        && self
                            .contracts
                            .get(id)
                            .map(|c| c.good_for_upload)
                            .unwrap_or(false)
                });
                if let Some((_, host)) = next {
                    claimed.insert(host);
                }
                next
            };
            let Some((contract_id, host)) = next else {
                return Err(PieceFailure {
                    chunk_index,
                    piece_index,
                    hosts: tried,
                    reason,
                });
            };
            tried.push(host);

            let transport = &self.transport;
            let op = PieceOp::Write(data.clone());
            let res = self
                .retry
                .run(cancel, move || {
                    let op = op.clone();
                    async move { transport.transfer(&contract_id, op, cancel).await }
                })
                .await;
            match res {
                Ok(OpOutput::Written(root)) => {
                    self.contracts.update(&contract_id, |c| c.upload_failures = 0);
                    self.files.update(&file_id, |f| {
                        f.add_piece(
                            chunk_index,
                            piece_index,
                            PieceLocation {
                                host,
                                contract: contract_id,
                                root,
                            },
                        )
                    });
                    if let Err(e) = self.store.save_files(&self.files).await {
                        warn!(err = %e, "failed to persist files");
                    }
                    debug!(chunk = chunk_index, piece = piece_index, host = %host, "piece stored");
                    return Ok(());
                }
                Ok(other) => {
                    reason = format!("unexpected transfer output {:?}", other);
                }
                Err(e) if is_cancelled(&e) => {
                    return Err(PieceFailure {
                        chunk_index,
                        piece_index,
                        hosts: tried,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(chunk = chunk_index, piece = piece_index, host = %host, err = %e, "piece upload failed, trying another contract");
                    self.record_failure(&contract_id, is_permanent(&e));
                    reason = e.to_string();
                }
            }
        }
    }

    /// Count an upload failure against a contract, taking it out of upload
    /// rotation at the configured limit or on a permanent failure.
    fn record_failure(&self, contract_id: &ContractId, permanent: bool) {
        let disabled = self
            .contracts
            .update(contract_id, |c| {
                c.upload_failures += 1;
                if c.good_for_upload && (permanent || c.upload_failures >= self.max_upload_failures)
                {
                    c.good_for_upload = false;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if disabled {
            warn!(contract = %contract_id, "contract no longer good for upload");
            let _ = self
                .events
                .send(ContractEvent::UploadDisabled { id: *contract_id });
        }
    }

    pub fn register(&self, file: RemoteFile) -> Result<FileId> {
        let id = file.id;
        let path = file.path.clone();
        if !self.files.insert(file) {
            return Err(InvalidInput::new(&format!("{} already exists", path)).into());
        }
        Ok(id)
    }
}
