//! sled persistence for the mirror
//!
//! one sled tree, keys namespaced by prefix so a snapshot and the nodes it
//! covers land in a single atomic batch:
//!
//! ```text
//! l ‖ index (u64 be)               → LeafRecord (bincode), append-only log
//! n ‖ level (u8) ‖ index (u64 be)  → 32-byte complete node
//! meta:snapshot                    → Snapshot (bincode)
//! ```

use crate::error::{Result, ShoaldError};
use crate::mirror::{LeafRecord, TreeMirror};
use serde::{Deserialize, Serialize};
use shoal_core::{zero_hashes, Felt, TREE_DEPTH};
use std::path::Path;
use tracing::{debug, info};

const LEAF_PREFIX: u8 = b'l';
const NODE_PREFIX: u8 = b'n';
const SNAPSHOT_KEY: &[u8] = b"meta:snapshot";

/// point the node cache is known to be complete up to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub leaf_count: u64,
    pub root: Felt,
    /// next ledger block to scan
    pub cursor: u64,
}

impl Snapshot {
    pub fn genesis(cursor: u64) -> Self {
        Self {
            leaf_count: 0,
            root: zero_hashes()[TREE_DEPTH],
            cursor,
        }
    }
}

pub struct Storage {
    db: sled::Db,
    /// makes leaf writes fail, for exercising error paths
    #[cfg(test)]
    pub(crate) fail_writes: std::sync::atomic::AtomicBool,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("opening storage at {}", path.display());
        let db = sled::open(path)?;
        Ok(Self {
            db,
            #[cfg(test)]
            fail_writes: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// log one applied leaf
    pub fn put_leaf(&self, index: u64, record: &LeafRecord) -> Result<()> {
        #[cfg(test)]
        {
            if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(ShoaldError::Storage(format!("write of leaf {} failed", index)));
            }
        }
        self.db.insert(leaf_key(index), bincode::serialize(record)?)?;
        Ok(())
    }

    pub fn get_leaf(&self, index: u64) -> Result<Option<LeafRecord>> {
        match self.db.get(leaf_key(index))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn leaf_count(&self) -> Result<u64> {
        match self.db.scan_prefix([LEAF_PREFIX]).keys().next_back() {
            Some(key) => Ok(index_from(&key?[1..])? + 1),
            None => Ok(0),
        }
    }

    pub fn snapshot(&self) -> Result<Option<Snapshot>> {
        match self.db.get(SNAPSHOT_KEY)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// write the snapshot and the complete nodes it covers in one batch
    pub fn write_snapshot(&self, snapshot: &Snapshot, nodes: &[(u8, u64, Felt)]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for (level, index, node) in nodes {
            batch.insert(node_key(*level, *index).to_vec(), node.as_bytes().to_vec());
        }
        batch.insert(SNAPSHOT_KEY, bincode::serialize(snapshot)?);
        self.db.apply_batch(batch)?;
        self.db.flush()?;

        debug!(
            "snapshot at {} leaves ({} nodes), cursor {}",
            snapshot.leaf_count,
            nodes.len(),
            snapshot.cursor
        );
        Ok(())
    }

    /// drop every leaf and cached node beyond `leaf_count`; a snapshot past
    /// that point is rewritten to `fallback`
    pub fn truncate(&self, leaf_count: u64, fallback: &Snapshot) -> Result<()> {
        let mut batch = sled::Batch::default();

        for key in self.db.range(leaf_key(leaf_count).to_vec()..leaf_key(u64::MAX).to_vec()).keys() {
            batch.remove(key?);
        }
        for level in 0..TREE_DEPTH as u8 {
            let start = node_key(level, leaf_count >> level);
            let end = node_key(level, u64::MAX);
            for key in self.db.range(start.to_vec()..end.to_vec()).keys() {
                batch.remove(key?);
            }
        }

        if let Some(snapshot) = self.snapshot()? {
            if snapshot.leaf_count > leaf_count {
                batch.insert(SNAPSHOT_KEY, bincode::serialize(fallback)?);
            }
        }

        self.db.apply_batch(batch)?;
        self.db.flush()?;
        info!("storage truncated to {} leaves", leaf_count);
        Ok(())
    }

    /// rebuild the mirror: node cache up to the snapshot, then the log tail
    pub fn load_mirror(&self) -> Result<(TreeMirror, Option<Snapshot>)> {
        let snapshot = self.snapshot()?;

        let mut leaves = Vec::new();
        for (expected, item) in self.db.scan_prefix([LEAF_PREFIX]).enumerate() {
            let (key, value) = item?;
            let index = index_from(&key[1..])?;
            if index != expected as u64 {
                return Err(ShoaldError::Storage(format!(
                    "leaf log gap: expected {}, found {}",
                    expected, index
                )));
            }
            leaves.push(bincode::deserialize::<LeafRecord>(&value)?);
        }

        let mut levels = vec![Vec::new(); TREE_DEPTH];
        for (level, nodes) in levels.iter_mut().enumerate() {
            for item in self.db.scan_prefix([NODE_PREFIX, level as u8]) {
                let (key, value) = item?;
                let index = index_from(&key[2..])?;
                if index != nodes.len() as u64 {
                    return Err(ShoaldError::Storage(format!(
                        "node cache gap at level {}: expected {}, found {}",
                        level,
                        nodes.len(),
                        index
                    )));
                }
                nodes.push(felt_from(&value)?);
            }
        }

        let (count, root) = match &snapshot {
            Some(s) => (s.leaf_count, s.root),
            None => (0, zero_hashes()[TREE_DEPTH]),
        };
        let mirror = TreeMirror::restore(levels, leaves, count, root)?;
        Ok((mirror, snapshot))
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn leaf_key(index: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = LEAF_PREFIX;
    key[1..].copy_from_slice(&index.to_be_bytes());
    key
}

fn node_key(level: u8, index: u64) -> [u8; 10] {
    let mut key = [0u8; 10];
    key[0] = NODE_PREFIX;
    key[1] = level;
    key[2..].copy_from_slice(&index.to_be_bytes());
    key
}

fn index_from(bytes: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| ShoaldError::Storage(format!("bad index key length {}", bytes.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn felt_from(bytes: &[u8]) -> Result<Felt> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ShoaldError::Storage(format!("bad node length {}", bytes.len())))?;
    Ok(Felt::from_bytes(bytes)?)
}
