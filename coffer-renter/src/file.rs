use std::collections::{HashMap, HashSet};

use coffer_fileindex::{ChunkLayout, Index};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{ContractId, FileId, HostKey, PieceRoot};

/// Where one copy of a piece is stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceLocation {
    pub host: HostKey,
    pub contract: ContractId,
    pub root: PieceRoot,
}

/// Known locations of every piece of one chunk, indexed by piece number.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPieces {
    pub pieces: Vec<Vec<PieceLocation>>,
}

impl ChunkPieces {
    fn new(total_pieces: usize) -> ChunkPieces {
        ChunkPieces {
            pieces: vec![vec![]; total_pieces],
        }
    }

    /// Hosts holding any piece of this chunk.
    pub fn hosts(&self) -> HashSet<HostKey> {
        self.pieces.iter().flatten().map(|loc| loc.host).collect()
    }

    /// Distinct piece indices with at least one usable location.
    pub fn health(&self, usable: impl Fn(&PieceLocation) -> bool) -> usize {
        self.pieces
            .iter()
            .filter(|locs| locs.iter().any(&usable))
            .count()
    }

    /// Piece indices with no usable location.
    pub fn missing(&self, usable: impl Fn(&PieceLocation) -> bool) -> Vec<usize> {
        self.pieces
            .iter()
            .enumerate()
            .filter(|(_, locs)| !locs.iter().any(&usable))
            .map(|(i, _)| i)
            .collect()
    }
}

/// A file stored on hosts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: FileId,
    pub path: String,
    pub layout: ChunkLayout,
    pub chunks: Vec<ChunkPieces>,
    /// Index of the local copy, if the renter still has one.
    pub local: Option<Index>,
}

impl RemoteFile {
    pub fn new(path: &str, layout: ChunkLayout, local: Option<Index>) -> RemoteFile {
        let total = layout.erasure().total_pieces();
        RemoteFile {
            id: FileId::random(),
            path: path.to_owned(),
            layout,
            chunks: (0..layout.num_chunks())
                .map(|_| ChunkPieces::new(total))
                .collect(),
            local,
        }
    }

    pub fn length(&self) -> u64 {
        self.layout.length()
    }

    pub fn data_pieces(&self) -> usize {
        self.layout.erasure().data_pieces()
    }

    /// Record a stored piece. Returns false if the location was already known.
    pub fn add_piece(&mut self, chunk_index: usize, piece_index: usize, loc: PieceLocation) -> bool {
        let Some(locs) = self
            .chunks
            .get_mut(chunk_index)
            .and_then(|c| c.pieces.get_mut(piece_index))
        else {
            return false;
        };
        if locs.iter().any(|l| l.contract == loc.contract && l.root == loc.root) {
            return false;
        }
        locs.push(loc);
        true
    }

    /// Forget locations whose contract is no longer held. Returns how many
    /// were removed.
    pub fn prune_contracts(&mut self, live: &HashSet<ContractId>) -> usize {
        let mut removed = 0;
        for locs in self.chunks.iter_mut().flat_map(|c| c.pieces.iter_mut()) {
            let before = locs.len();
            locs.retain(|l| live.contains(&l.contract));
            removed += before - locs.len();
        }
        removed
    }

    /// Minimum chunk health over the data piece count. A file is
    /// recoverable while this is at least 1.
    pub fn redundancy(&self, usable: impl Fn(&PieceLocation) -> bool) -> f64 {
        let min = self.chunks.iter().map(|c| c.health(&usable)).min();
        match min {
            Some(min) => min as f64 / self.data_pieces() as f64,
            None => 0.0,
        }
    }

    /// Bytes stored across every known piece location.
    pub fn uploaded_bytes(&self) -> u64 {
        let pieces: usize = self
            .chunks
            .iter()
            .flat_map(|c| c.pieces.iter())
            .map(|locs| locs.len())
            .sum();
        pieces as u64 * self.layout.piece_size() as u64
    }
}

/// Registry of remote files, keyed by id and unique by path.
#[derive(Default)]
pub struct FileSet {
    files: RwLock<HashMap<FileId, RemoteFile>>,
}

impl FileSet {
    pub fn from_files(files: impl IntoIterator<Item = RemoteFile>) -> FileSet {
        FileSet {
            files: RwLock::new(files.into_iter().map(|f| (f.id, f)).collect()),
        }
    }

    /// Add a file; fails if its path is taken.
    pub fn insert(&self, file: RemoteFile) -> bool {
        let mut files = self.files.write();
        if files.values().any(|f| f.path == file.path) {
            return false;
        }
        files.insert(file.id, file);
        true
    }

    pub fn get(&self, id: &FileId) -> Option<RemoteFile> {
        self.files.read().get(id).cloned()
    }

    pub fn find(&self, path: &str) -> Option<RemoteFile> {
        self.files.read().values().find(|f| f.path == path).cloned()
    }

    pub fn update<T>(&self, id: &FileId, f: impl FnOnce(&mut RemoteFile) -> T) -> Option<T> {
        self.files.write().get_mut(id).map(f)
    }

    pub fn remove(&self, id: &FileId) -> Option<RemoteFile> {
        self.files.write().remove(id)
    }

    pub fn ids(&self) -> Vec<FileId> {
        self.files.read().keys().copied().collect()
    }

    pub fn list(&self) -> Vec<RemoteFile> {
        let mut files: Vec<RemoteFile> = self.files.read().values().cloned().collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }

    /// Drop locations on contracts not in `live` from every file.
    pub fn prune_contracts(&self, live: &HashSet<ContractId>) -> usize {
        self.files
            .write()
            .values_mut()
            .map(|f| f.prune_contracts(live))
            .sum()
    }
}
