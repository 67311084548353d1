use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tracing::trace;

use crate::{
    contract_set::{Contract, ContractSet},
    file::{FileSet, RemoteFile},
    Result,
};

const CONTRACTS_FILE: &str = "contracts.json";
const FILES_FILE: &str = "files.json";

/// Replace `path` with the JSON encoding of `value`, never leaving a partly
/// written file behind.
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension(format!("tmp.{:08x}", rand::random::<u32>()));
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Read JSON from `path`; `None` if the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(contents) => Ok(Some(serde_json::from_slice(&contents)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Renter state on disk: the contract set and the file registry.
pub struct StateStore {
    dir: PathBuf,
    contracts_lock: Mutex<()>,
    files_lock: Mutex<()>,
}

impl StateStore {
    pub async fn open(dir: &Path) -> Result<StateStore> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(StateStore {
            dir: dir.to_owned(),
            contracts_lock: Mutex::new(()),
            files_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn load_contracts(&self) -> Result<Vec<Contract>> {
        Ok(read_json(&self.dir.join(CONTRACTS_FILE))
            .await?
            .unwrap_or_default())
    }

    pub async fn load_files(&self) -> Result<Vec<RemoteFile>> {
        Ok(read_json(&self.dir.join(FILES_FILE))
            .await?
            .unwrap_or_default())
    }

    /// Write the contract set as it is once any earlier save has finished.
    pub async fn save_contracts(&self, contracts: &ContractSet) -> Result<()> {
        let _guard = self.contracts_lock.lock().await;
        let snapshot = contracts.contracts();
        trace!(n = snapshot.len(), "saving contracts");
        write_json(&self.dir.join(CONTRACTS_FILE), &snapshot).await
    }

    /// Write the file registry as it is once any earlier save has finished.
    pub async fn save_files(&self, files: &FileSet) -> Result<()> {
        let _guard = self.files_lock.lock().await;
        let snapshot = files.list();
        trace!(n = snapshot.len(), "saving files");
        write_json(&self.dir.join(FILES_FILE), &snapshot).await
    }
}
