use std::{collections::HashSet, sync::Arc};

use coffer_fileindex::read_chunk;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::RenterConfig,
    contract_set::ContractSet,
    download::DownloadPipeline,
    erasure::ErasureCoder,
    error::is_cancelled,
    file::{FileSet, PieceLocation, RemoteFile},
    host::HostProtocol,
    hostdb::HostDb,
    persist::StateStore,
    redundancy::Availability,
    types::{ContractId, HostKey},
    upload::{ChunkUpload, UploadPipeline},
    Result,
};

/// What a repair pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub files_checked: usize,
    pub locations_pruned: usize,
    pub local_repairs: usize,
    pub remote_repairs: usize,
    /// Degraded chunks left alone because they are at the remote repair
    /// target already.
    pub chunks_skipped: usize,
    pub chunks_unrecoverable: usize,
    pub pieces_uploaded: usize,
    pub pieces_failed: usize,
}

impl RepairReport {
    pub fn changed(&self) -> bool {
        self.locations_pruned > 0 || self.pieces_uploaded > 0
    }

    fn merge(&mut self, other: RepairReport) {
        self.files_checked += other.files_checked;
        self.locations_pruned += other.locations_pruned;
        self.local_repairs += other.local_repairs;
        self.remote_repairs += other.remote_repairs;
        self.chunks_skipped += other.chunks_skipped;
        self.chunks_unrecoverable += other.chunks_unrecoverable;
        self.pieces_uploaded += other.pieces_uploaded;
        self.pieces_failed += other.pieces_failed;
    }
}

/// Restores chunk health by uploading missing pieces, from the local copy
/// when it is unchanged and otherwise from the network.
///
/// Repair only ever adds piece locations. Locations are dropped only for
/// contracts that have left the contract set.
pub struct RepairScheduler<H> {
    hosts: H,
    hostdb: HostDb,
    contracts: Arc<ContractSet>,
    files: Arc<FileSet>,
    store: Arc<StateStore>,
    upload: UploadPipeline<H>,
    download: DownloadPipeline<H>,
    config: RenterConfig,
}

impl<H: Clone> Clone for RepairScheduler<H> {
    fn clone(&self) -> Self {
        RepairScheduler {
            hosts: self.hosts.clone(),
            hostdb: self.hostdb.clone(),
            contracts: self.contracts.clone(),
            files: self.files.clone(),
            store: self.store.clone(),
            upload: self.upload.clone(),
            download: self.download.clone(),
            config: self.config.clone(),
        }
    }
}

impl<H: HostProtocol> RepairScheduler<H> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hosts: H,
        hostdb: HostDb,
        contracts: Arc<ContractSet>,
        files: Arc<FileSet>,
        store: Arc<StateStore>,
        upload: UploadPipeline<H>,
        download: DownloadPipeline<H>,
        config: RenterConfig,
    ) -> RepairScheduler<H> {
        RepairScheduler {
            hosts,
            hostdb,
            contracts,
            files,
            store,
            upload,
            download,
            config,
        }
    }

    pub async fn availability(&self) -> Availability {
        Availability::probe(&self.hosts, &self.contracts, self.hostdb.height()).await
    }

    /// Prune locations on dropped contracts, then repair every file.
    #[tracing::instrument(skip_all, err)]
    pub async fn repair_all(&self, cancel: &CancellationToken) -> Result<RepairReport> {
        let live: HashSet<ContractId> = self.contracts.contracts().iter().map(|c| c.id()).collect();
        let mut report = RepairReport {
            locations_pruned: self.files.prune_contracts(&live),
            ..Default::default()
        };
        if report.locations_pruned > 0 {
            debug!(n = report.locations_pruned, "pruned locations on dropped contracts");
            self.store.save_files(&self.files).await?;
        }

        let avail = self.availability().await;
        let candidates = self.upload.online_contracts().await;
        for file in self.files.list() {
            match self.repair_file(&file, &avail, &candidates, cancel).await {
                Ok(file_report) => report.merge(file_report),
                Err(e) if is_cancelled(&e) => return Err(e),
                Err(e) => {
                    warn!(path = %file.path, err = %e, "file repair failed");
                    report.files_checked += 1;
                }
            }
        }
        Ok(report)
    }

    #[tracing::instrument(skip_all, fields(path = %file.path), err)]
    pub async fn repair_file(
        &self,
        file: &RemoteFile,
        avail: &Availability,
        candidates: &[(ContractId, HostKey)],
        cancel: &CancellationToken,
    ) -> Result<RepairReport> {
        let mut report = RepairReport {
            files_checked: 1,
            ..Default::default()
        };
        let erasure = *file.layout.erasure();
        let total = erasure.total_pieces();
        let needed = erasure.data_pieces();
        let target = self.config.remote_repair_target(total).max(needed);
        let coder = ErasureCoder::new(erasure)?;
        let usable = |loc: &PieceLocation| avail.is_usable(loc);

        for (chunk_index, chunk) in file.chunks.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(crate::error::CancelError.into());
            }
            let health = chunk.health(usable);
            if health >= total {
                continue;
            }
            let missing = chunk.missing(usable);

            if let Some(contents) = self.read_local(file, chunk_index).await {
                let pieces = coder.encode(&contents, file.layout.piece_size())?;
                let job = select_pieces(chunk_index, pieces, &missing, missing.len());
                debug!(chunk = chunk_index, health, missing = missing.len(), "local repair");
                report.local_repairs += 1;
                self.upload_pieces(file, job, candidates, cancel, &mut report)
                    .await;
                continue;
            }

            if health >= target {
                report.chunks_skipped += 1;
                continue;
            }
            if health < needed {
                warn!(chunk = chunk_index, health, needed, "chunk cannot be recovered");
                report.chunks_unrecoverable += 1;
                continue;
            }
            let contents = match self
                .download
                .fetch_chunk_uncached(file, chunk_index, cancel)
                .await
            {
                Ok(contents) => contents,
                Err(e) if is_cancelled(&e) => return Err(e),
                Err(e) => {
                    warn!(chunk = chunk_index, err = %e, "remote repair download failed");
                    report.chunks_unrecoverable += 1;
                    continue;
                }
            };
            let pieces = coder.encode(&contents, file.layout.piece_size())?;
            let job = select_pieces(chunk_index, pieces, &missing, target - health);
            debug!(chunk = chunk_index, health, target, "remote repair");
            report.remote_repairs += 1;
            self.upload_pieces(file, job, candidates, cancel, &mut report)
                .await;
        }
        if report.pieces_uploaded > 0 {
            info!(
                local = report.local_repairs,
                remote = report.remote_repairs,
                pieces = report.pieces_uploaded,
                "repaired"
            );
        }
        Ok(report)
    }

    /// Chunk bytes from the local copy, if it still matches what was indexed.
    async fn read_local(&self, file: &RemoteFile, chunk_index: usize) -> Option<Vec<u8>> {
        let local = file.local.as_ref()?;
        let contents = match read_chunk(&local.full_path(), file.layout.chunk_size(), chunk_index)
            .await
        {
            Ok(contents) => contents,
            Err(e) => {
                debug!(err = %e, "local copy unreadable, repairing remotely");
                return None;
            }
        };
        if !local.verify_chunk(chunk_index, &contents) {
            warn!(chunk = chunk_index, "local copy changed, repairing remotely");
            return None;
        }
        Some(contents)
    }

    async fn upload_pieces(
        &self,
        file: &RemoteFile,
        job: ChunkUpload,
        candidates: &[(ContractId, HostKey)],
        cancel: &CancellationToken,
        report: &mut RepairReport,
    ) {
        let attempted = job.pieces.len();
        let failures = self
            .upload
            .upload_chunk(file.id, job, candidates, cancel)
            .await;
        for failure in failures.iter() {
            warn!(%failure, "repair piece not placed");
        }
        report.pieces_failed += failures.len();
        report.pieces_uploaded += attempted - failures.len();
    }
}

fn select_pieces(
    chunk_index: usize,
    pieces: Vec<Vec<u8>>,
    missing: &[usize],
    count: usize,
) -> ChunkUpload {
    let wanted: HashSet<usize> = missing.iter().copied().take(count).collect();
    ChunkUpload {
        chunk_index,
        pieces: pieces
            .into_iter()
            .enumerate()
            .filter(|(i, _)| wanted.contains(i))
            .map(|(i, piece)| (i, Arc::new(piece)))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_first_missing_pieces() {
        let pieces: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 2]).collect();
        let job = select_pieces(3, pieces, &[1, 3, 4], 2);
        assert_eq!(job.chunk_index, 3);
        let indices: Vec<usize> = job.pieces.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![1, 3]);
        assert_eq!(*job.pieces[1].1, vec![3u8; 2]);
    }
}
