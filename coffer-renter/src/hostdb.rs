use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{
    consensus::ConsensusChange,
    host::{HostDiscovery, HostEntry},
    ring::RecentRing,
    types::{BlockHeight, BlockId, HostKey},
};

/// Blocks remembered for unwinding announcements on revert.
pub const RECENT_BLOCKS: usize = 144;

struct Inner {
    height: BlockHeight,
    hosts: BTreeMap<HostKey, HostEntry>,
    recent: RecentRing<BlockId, Vec<HostKey>>,
    /// Hosts announced in a block too old to be unwound.
    settled: HashSet<HostKey>,
}

impl Inner {
    /// Whether any block still on chain announced `key`.
    fn still_announced(&self, key: &HostKey) -> bool {
        self.settled.contains(key) || self.recent.values().any(|keys| keys.contains(key))
    }
}

/// Hosts announced on chain, maintained from consensus changes.
#[derive(Clone)]
pub struct HostDb {
    inner: Arc<RwLock<Inner>>,
}

impl Default for HostDb {
    fn default() -> Self {
        HostDb::new(RECENT_BLOCKS)
    }
}

impl HostDb {
    pub fn new(recent_blocks: usize) -> HostDb {
        HostDb {
            inner: Arc::new(RwLock::new(Inner {
                height: 0,
                hosts: BTreeMap::new(),
                recent: RecentRing::new(recent_blocks),
                settled: HashSet::new(),
            })),
        }
    }

    pub fn height(&self) -> BlockHeight {
        self.inner.read().height
    }

    /// Apply a consensus change. Genesis does not advance the height.
    pub fn process_change(&self, change: &ConsensusChange) {
        let mut inner = self.inner.write();
        for block in change.reverted.iter() {
            if block.is_genesis() {
                continue;
            }
            inner.height = inner.height.saturating_sub(1);
            match inner.recent.remove(&block.id) {
                Some(announced) => {
                    for key in announced {
                        if !inner.still_announced(&key) {
                            inner.hosts.remove(&key);
                        }
                    }
                }
                None => {
                    warn!(block = %block.id, "reverted block no longer remembered, announcements kept");
                }
            }
        }
        for block in change.applied.iter() {
            if !block.is_genesis() {
                inner.height += 1;
            }
            let mut announced = vec![];
            for ann in block.announcements.iter() {
                debug!(host = %ann.key, address = %ann.net_address, "host announced");
                inner.hosts.insert(
                    ann.key,
                    HostEntry {
                        key: ann.key,
                        net_address: ann.net_address.clone(),
                    },
                );
                announced.push(ann.key);
            }
            if let Some((_, forgotten)) = inner.recent.insert(block.id, announced) {
                inner.settled.extend(forgotten);
            }
        }
    }

    /// Forget everything and replay `history`, the chain as a single change
    /// from empty. Used after missing changes.
    pub fn resync(&self, history: &ConsensusChange) {
        {
            let mut inner = self.inner.write();
            let capacity = inner.recent.capacity();
            inner.height = 0;
            inner.hosts.clear();
            inner.recent = RecentRing::new(capacity);
            inner.settled.clear();
        }
        self.process_change(history);
    }

    pub fn host(&self, key: &HostKey) -> Option<HostEntry> {
        self.inner.read().hosts.get(key).cloned()
    }
}

impl HostDiscovery for HostDb {
    fn candidate_hosts(&self) -> Vec<HostEntry> {
        self.inner.read().hosts.values().cloned().collect()
    }
}
