use std::{
    collections::{BTreeMap, VecDeque},
    future::Future,
    ops::Range,
    path::Path,
    sync::Arc,
};

use tokio::{
    io::AsyncWriteExt,
    sync::watch,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    contract_set::ContractSet,
    erasure::ErasureCoder,
    error::{ChunkUnrecoverable, InvalidInput},
    file::{PieceLocation, RemoteFile},
    host::HostProtocol,
    retry::Retry,
    stream_cache::StreamCache,
    transport::{OpOutput, PieceOp, PieceTransport},
    Error, Result,
};

/// Destination for downloaded bytes, written in file order.
pub trait DownloadSink: Send {
    fn put(&mut self, bytes: &[u8]) -> impl Future<Output = Result<()>> + Send;
}

impl DownloadSink for Vec<u8> {
    async fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

impl DownloadSink for tokio::fs::File {
    async fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all(bytes).await?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DownloadProgress {
    pub received: u64,
    pub length: u64,
}

/// A download to disk running in the background.
pub struct DownloadHandle {
    progress: watch::Receiver<DownloadProgress>,
    task: JoinHandle<Result<u64>>,
}

impl DownloadHandle {
    pub fn progress(&self) -> DownloadProgress {
        *self.progress.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the download to complete; returns bytes written.
    pub async fn wait(self) -> Result<u64> {
        self.task.await?
    }
}

/// Fetches pieces, decodes chunks and delivers byte ranges.
pub struct DownloadPipeline<H> {
    transport: PieceTransport<H>,
    contracts: Arc<ContractSet>,
    cache: Arc<StreamCache>,
    retry: Retry,
    max_concurrent_chunks: usize,
}

impl<H: Clone> Clone for DownloadPipeline<H> {
    fn clone(&self) -> Self {
        DownloadPipeline {
            transport: self.transport.clone(),
            contracts: self.contracts.clone(),
            cache: self.cache.clone(),
            retry: self.retry.clone(),
            max_concurrent_chunks: self.max_concurrent_chunks,
        }
    }
}

impl<H: HostProtocol> DownloadPipeline<H> {
    pub fn new(
        transport: PieceTransport<H>,
        contracts: Arc<ContractSet>,
        cache: Arc<StreamCache>,
        retry: Retry,
        max_concurrent_chunks: usize,
    ) -> DownloadPipeline<H> {
        DownloadPipeline {
            transport,
            contracts,
            cache,
            retry,
            max_concurrent_chunks: max_concurrent_chunks.max(1),
        }
    }

    /// A decoded chunk, from the cache when possible.
    pub async fn fetch_chunk(
        &self,
        file: &RemoteFile,
        chunk_index: usize,
        cancel: &CancellationToken,
    ) -> Result<Arc<Vec<u8>>> {
        self.cache
            .get_or_fetch((file.id, chunk_index), || {
                self.fetch_chunk_uncached(file, chunk_index, cancel)
            })
            .await
    }

    /// Fetch `data_pieces` pieces of a chunk from distinct hosts and decode.
    #[tracing::instrument(skip_all, fields(file = %file.id, chunk = chunk_index), err)]
    pub async fn fetch_chunk_uncached(
        &self,
        file: &RemoteFile,
        chunk_index: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let chunk = file
            .chunks
            .get(chunk_index)
            .ok_or_else(|| InvalidInput::new(&format!("no chunk {}", chunk_index)))?;
        let erasure = *file.layout.erasure();
        let needed = erasure.data_pieces();
        let piece_size = file.layout.piece_size();

        // Data pieces first: a chunk rebuilt from them needs no decoding.
        let mut candidates: VecDeque<(usize, Vec<PieceLocation>)> = chunk
            .pieces
            .iter()
            .enumerate()
            .map(|(i, locs)| {
                let live: Vec<PieceLocation> = locs
                    .iter()
                    .filter(|loc| self.contracts.contains(&loc.contract))
                    .cloned()
                    .collect();
                (i, live)
            })
            .filter(|(_, locs)| !locs.is_empty())
            .collect();
        if candidates.len() < needed {
            return Err(ChunkUnrecoverable {
                chunk_index,
                available: candidates.len(),
                needed,
            }
            .into());
        }

        let mut pieces: Vec<Option<Vec<u8>>> = vec![None; erasure.total_pieces()];
        let mut received = 0;
        let mut fetches = JoinSet::new();
        loop {
            while received + fetches.len() < needed {
                let Some((piece_index, locs)) = candidates.pop_front() else {
                    break;
                };
                let transport = self.transport.clone();
                let retry = self.retry.clone();
                let cancel = cancel.clone();
                fetches.spawn(async move {
                    let res = fetch_piece(&transport, &retry, &locs, piece_size, &cancel).await;
                    (piece_index, res)
                });
            }
            let Some(joined) = fetches.join_next().await else {
                break;
            };
            match joined? {
                (piece_index, Ok(piece)) => {
                    pieces[piece_index] = Some(piece);
                    received += 1;
                    if received == needed {
                        fetches.abort_all();
                        break;
                    }
                }
                (piece_index, Err(e)) => {
                    if crate::error::is_cancelled(&e) {
                        return Err(e);
                    }
                    warn!(piece = piece_index, err = %e, "piece unavailable, trying another");
                }
            }
        }
        if received < needed {
            return Err(ChunkUnrecoverable {
                chunk_index,
                available: received,
                needed,
            }
            .into());
        }
        let coder = ErasureCoder::new(erasure)?;
        let decoded = coder.decode(pieces, file.layout.chunk_len(chunk_index))?;
        debug!(len = decoded.len(), "chunk decoded");
        Ok(decoded)
    }

    /// Write bytes `range` of `file` to `sink`, fetching covering chunks
    /// concurrently and delivering them in order. Returns bytes written.
    pub async fn download_range<S: DownloadSink>(
        &self,
        file: Arc<RemoteFile>,
        range: Range<u64>,
        sink: &mut S,
        cancel: &CancellationToken,
        progress: Option<&watch::Sender<DownloadProgress>>,
    ) -> Result<u64> {
        let length = range.end.saturating_sub(range.start);
        let slices = file
            .layout
            .slices(range)
            .map_err(|e| InvalidInput::new(&e.to_string()))?;

        let mut fetches = JoinSet::new();
        let mut ready = BTreeMap::new();
        let (mut next_spawn, mut next_write) = (0, 0);
        let mut written = 0u64;
        while next_write < slices.len() {
            while next_spawn < slices.len() && fetches.len() < self.max_concurrent_chunks {
                let pipeline = self.clone();
                let file = file.clone();
                let cancel = cancel.clone();
                let i = next_spawn;
                let chunk_index = slices[i].chunk_index;
                fetches.spawn(async move {
                    (i, pipeline.fetch_chunk(&file, chunk_index, &cancel).await)
                });
                next_spawn += 1;
            }
            let (i, res) = fetches
                .join_next()
                .await
                .ok_or_else(|| Error::msg("chunk fetches ended early"))??;
            ready.insert(i, res?);
            while let Some(chunk) = ready.remove(&next_write) {
                let slice = slices[next_write];
                sink.put(&chunk[slice.range()]).await?;
                written += slice.length as u64;
                next_write += 1;
                if let Some(tx) = progress {
                    tx.send_replace(DownloadProgress {
                        received: written,
                        length,
                    });
                }
            }
        }
        Ok(written)
    }

    /// Download a whole file to `dest`.
    pub async fn download_to_path(
        &self,
        file: Arc<RemoteFile>,
        dest: &Path,
        cancel: &CancellationToken,
        progress: Option<&watch::Sender<DownloadProgress>>,
    ) -> Result<u64> {
        let mut out = tokio::fs::File::create(dest).await?;
        let length = file.length();
        let written = self
            .download_range(file, 0..length, &mut out, cancel, progress)
            .await?;
        out.flush().await?;
        Ok(written)
    }

    /// Start downloading a whole file to `dest` in the background.
    pub fn spawn_download_to_path(
        &self,
        file: Arc<RemoteFile>,
        dest: &Path,
        cancel: CancellationToken,
    ) -> DownloadHandle {
        let (tx, rx) = watch::channel(DownloadProgress {
            received: 0,
            length: file.length(),
        });
        let pipeline = self.clone();
        let dest = dest.to_owned();
        let task = tokio::spawn(async move {
            pipeline
                .download_to_path(file, &dest, &cancel, Some(&tx))
                .await
        });
        DownloadHandle { progress: rx, task }
    }
}

/// Read one piece, trying each known copy in turn.
async fn fetch_piece<H: HostProtocol>(
    transport: &PieceTransport<H>,
    retry: &Retry,
    locs: &[PieceLocation],
    piece_size: usize,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let mut last_err = Error::msg("no locations");
    for loc in locs {
        let op = PieceOp::Read {
            root: loc.root,
            length: piece_size,
        };
        let res = retry
            .run(cancel, move || {
                let op = op.clone();
                async move { transport.transfer(&loc.contract, op, cancel).await }
            })
            .await;
        match res {
            Ok(OpOutput::Read(piece)) => return Ok(piece),
            Ok(other) => last_err = Error::msg(format!("unexpected transfer output {:?}", other)),
            Err(e) => {
                if crate::error::is_cancelled(&e) {
                    return Err(e);
                }
                debug!(host = %loc.host, err = %e, "piece copy unavailable");
                last_err = e;
            }
        }
    }
    Err(last_err)
}
