use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::Digest;

/// Indexing progress, in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub position: u64,
    pub length: u64,
}

/// Digests of a local file, taken chunk by chunk.
///
/// The renter keeps the index of a file's local copy so that repair can tell
/// whether the bytes on disk are still the bytes that were uploaded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub(crate) root: PathBuf,
    pub(crate) path: PathBuf,
    pub(crate) length: u64,
    pub(crate) chunk_size: usize,
    pub(crate) digest: Digest,
    pub(crate) chunk_digests: Vec<Digest>,
}

impl Index {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn full_path(&self) -> PathBuf {
        self.root.join(&self.path)
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// SHA-256 of the entire file contents.
    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn chunk_digests(&self) -> &[Digest] {
        &self.chunk_digests
    }

    /// Whether `contents` hash to the digest recorded for `chunk_index`.
    pub fn verify_chunk(&self, chunk_index: usize, contents: &[u8]) -> bool {
        match self.chunk_digests.get(chunk_index) {
            Some(expected) => {
                let actual: Digest = Sha256::digest(contents).into();
                *expected == actual
            }
            None => false,
        }
    }
}

pub struct Indexer {
    root: PathBuf,
    path: PathBuf,
    chunk_size: usize,
    index_progress_tx: watch::Sender<Progress>,
    digest_progress_tx: watch::Sender<Progress>,
}

impl Indexer {
    pub async fn from_file(file: &Path, chunk_size: usize) -> Result<Indexer> {
        if chunk_size == 0 {
            return Err(Error::msg("chunk size must be positive"));
        }
        let file = tokio::fs::canonicalize(file).await?;
        let root = file
            .parent()
            .ok_or(Error::msg("expected parent directory"))?
            .to_path_buf();
        let path = PathBuf::from(
            file.file_name()
                .ok_or(Error::msg("expected file name"))?,
        );
        let (index_progress_tx, _) = watch::channel(Progress::default());
        let (digest_progress_tx, _) = watch::channel(Progress::default());
        Ok(Indexer {
            root,
            path,
            chunk_size,
            index_progress_tx,
            digest_progress_tx,
        })
    }

    pub fn subscribe_index_progress(&self) -> watch::Receiver<Progress> {
        self.index_progress_tx.subscribe()
    }

    pub fn subscribe_digest_progress(&self) -> watch::Receiver<Progress> {
        self.digest_progress_tx.subscribe()
    }

    /// Hash the file: chunk digests in parallel, whole-file digest alongside.
    pub async fn index(&self) -> Result<Index> {
        let full_path = self.root.join(&self.path);
        let length = tokio::fs::metadata(&full_path).await?.len();
        let chunk_size = self.chunk_size as u64;
        let n_chunks =
            (length / chunk_size + if length % chunk_size != 0 { 1 } else { 0 }) as usize;

        let digest_task = {
            let path = full_path.clone();
            let progress_tx = self.digest_progress_tx.clone();
            tokio::spawn(async move { file_digest(&path, length, progress_tx).await })
        };

        let (job_tx, job_rx) = flume::unbounded::<usize>();
        for chunk_index in 0..n_chunks {
            job_tx.send(chunk_index)?;
        }
        drop(job_tx);

        let (result_tx, result_rx) = flume::unbounded::<(usize, Digest)>();
        let mut workers = JoinSet::new();
        for _ in 0..num_cpus::get().min(n_chunks).max(1) {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let path = full_path.clone();
            let chunk_size = self.chunk_size;
            workers.spawn(async move {
                let mut fh = File::open(&path).await?;
                while let Ok(chunk_index) = job_rx.recv_async().await {
                    let contents =
                        read_at(&mut fh, chunk_index as u64 * chunk_size as u64, chunk_size)
                            .await?;
                    result_tx
                        .send_async((chunk_index, Sha256::digest(&contents).into()))
                        .await?;
                }
                Ok::<(), Error>(())
            });
        }
        drop(result_tx);

        let mut chunk_digests = vec![[0u8; 32]; n_chunks];
        let mut position = 0u64;
        while let Ok((chunk_index, digest)) = result_rx.recv_async().await {
            chunk_digests[chunk_index] = digest;
            position = (position + chunk_size).min(length);
            self.index_progress_tx.send_replace(Progress { position, length });
        }
        while let Some(res) = workers.join_next().await {
            res??;
        }
        let digest = digest_task.await??;

        Ok(Index {
            root: self.root.clone(),
            path: self.path.clone(),
            length,
            chunk_size: self.chunk_size,
            digest,
            chunk_digests,
        })
    }
}

/// Read the logical bytes of a chunk from a local file.
pub async fn read_chunk(path: &Path, chunk_size: usize, chunk_index: usize) -> Result<Vec<u8>> {
    let mut fh = File::open(path).await?;
    read_at(&mut fh, chunk_index as u64 * chunk_size as u64, chunk_size).await
}

async fn read_at(fh: &mut File, offset: u64, max_len: usize) -> Result<Vec<u8>> {
    fh.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; max_len];
    let mut filled = 0;
    while filled < max_len {
        let rd = fh.read(&mut buf[filled..]).await?;
        if rd == 0 {
            break;
        }
        filled += rd;
    }
    buf.truncate(filled);
    Ok(buf)
}

async fn file_digest(
    path: &Path,
    length: u64,
    progress_tx: watch::Sender<Progress>,
) -> Result<Digest> {
    const READ_BUF_BYTES: usize = 1 << 16;
    let mut fh = File::open(path).await?;
    let mut buf = vec![0u8; READ_BUF_BYTES];
    let mut digest = Sha256::new();
    let mut position = 0u64;
    loop {
        let rd = fh.read(&mut buf[..]).await?;
        if rd == 0 {
            break;
        }
        digest.update(&buf[..rd]);
        position += rd as u64;
        progress_tx.send_replace(Progress { position, length });
    }
    Ok(digest.finalize().into())
}
