use std::{path::PathBuf, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    persist::write_json,
    types::{BlockHeight, BlockId, HostKey},
    Error, Result,
};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAnnouncement {
    pub key: HostKey,
    pub net_address: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub parent: BlockId,
    pub announcements: Vec<HostAnnouncement>,
}

impl Block {
    pub fn is_genesis(&self) -> bool {
        self.parent == BlockId::default()
    }
}

/// Blocks removed from and added to the chain tip, in order: reverted
/// blocks newest first, then applied blocks oldest first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsensusChange {
    pub reverted: Vec<Block>,
    pub applied: Vec<Block>,
}

/// Source of chain state for the renter.
pub trait Consensus: Send + Sync {
    fn current_height(&self) -> BlockHeight;

    /// The current chain as a single change from an empty state, and a
    /// receiver for every change after it. Changes are delivered in order.
    fn subscribe(&self) -> (ConsensusChange, broadcast::Receiver<ConsensusChange>);
}

/// An in-process chain that advances when told to.
#[derive(Clone)]
pub struct LocalChain {
    blocks: Arc<Mutex<Vec<Block>>>,
    tx: broadcast::Sender<ConsensusChange>,
    path: Option<PathBuf>,
}

impl Default for LocalChain {
    fn default() -> Self {
        LocalChain::new()
    }
}

impl LocalChain {
    pub fn new() -> LocalChain {
        let genesis = Block {
            id: BlockId::random(),
            parent: BlockId::default(),
            announcements: vec![],
        };
        LocalChain::from_blocks(vec![genesis], None)
    }

    fn from_blocks(blocks: Vec<Block>, path: Option<PathBuf>) -> LocalChain {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        LocalChain {
            blocks: Arc::new(Mutex::new(blocks)),
            tx,
            path,
        }
    }

    /// Load a chain saved at `path`, or start a new one there.
    pub async fn open(path: PathBuf) -> Result<LocalChain> {
        match tokio::fs::read(&path).await {
            Ok(contents) => {
                let blocks: Vec<Block> = serde_json::from_slice(&contents)?;
                if blocks.first().map(|b| !b.is_genesis()).unwrap_or(true) {
                    return Err(Error::msg(format!("{:?}: chain has no genesis block", path)));
                }
                Ok(LocalChain::from_blocks(blocks, Some(path)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut chain = LocalChain::new();
                chain.path = Some(path);
                chain.save().await?;
                Ok(chain)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let blocks = self.blocks.lock().clone();
            write_json(path, &blocks).await?;
        }
        Ok(())
    }

    /// Append a block carrying `announcements` and notify subscribers.
    pub fn mine_block(&self, announcements: Vec<HostAnnouncement>) -> Block {
        let mut blocks = self.blocks.lock();
        let parent = blocks.last().map(|b| b.id).unwrap_or_default();
        let block = Block {
            id: BlockId::random(),
            parent,
            announcements,
        };
        blocks.push(block.clone());
        debug!(height = blocks.len() - 1, id = %block.id, "mined block");
        let _ = self.tx.send(ConsensusChange {
            reverted: vec![],
            applied: vec![block.clone()],
        });
        block
    }

    pub fn mine_blocks(&self, n: usize) {
        for _ in 0..n {
            self.mine_block(vec![]);
        }
    }

    /// Remove the top `n` blocks. Genesis cannot be reverted.
    pub fn revert_blocks(&self, n: usize) -> Result<Vec<Block>> {
        let mut blocks = self.blocks.lock();
        if n >= blocks.len() {
            return Err(Error::msg("cannot revert the genesis block"));
        }
        let keep = blocks.len() - n;
        let mut reverted = blocks.split_off(keep);
        reverted.reverse();
        let _ = self.tx.send(ConsensusChange {
            reverted: reverted.clone(),
            applied: vec![],
        });
        Ok(reverted)
    }
}

impl Consensus for LocalChain {
    fn current_height(&self) -> BlockHeight {
        (self.blocks.lock().len() - 1) as BlockHeight
    }

    fn subscribe(&self) -> (ConsensusChange, broadcast::Receiver<ConsensusChange>) {
        let blocks = self.blocks.lock();
        let rx = self.tx.subscribe();
        (
            ConsensusChange {
                reverted: vec![],
                applied: blocks.clone(),
            },
            rx,
        )
    }
}
