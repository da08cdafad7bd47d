//! off-chain mirror of the commitment tree
//!
//! complete nodes live in one flat array per level and never change once
//! written (until a rollback truncates them). the rightmost, partially filled
//! node of each level is not stored there; it belongs to the version that
//! produced it. a version is therefore a handful of hashes:
//!
//! ```text
//! level 2   [ n0 ][ n1 ]  (partial: frontier[2])
//! level 1   [ n0 ][ n1 ][ n2 ][ n3 ][ n4 ]  (partial: frontier[1])
//! level 0   [ l0 ][ l1 ][ l2 ][ l3 ][ l4 ][ l5 ][ l6 ][ l7 ][ l8 ][ l9 ][ l10 ]
//! ```
//!
//! the single writer ([`TreeMirror`]) appends and publishes a new
//! [`TreeVersion`] through a watch channel. readers ([`MirrorReader`]) pin one
//! version per request and only touch complete nodes below its leaf count, so
//! later appends are invisible to them. a rollback bumps the generation; a
//! reader that pinned an older generation re-pins the latest version.

use crate::error::{Result, ShoaldError};
use serde::{Deserialize, Serialize};
use shoal_core::{
    hash_leaf, hash_node, zero_hashes, EventId, EventPosition, Felt, LedgerEvent, MerkleProof,
    TREE_CAPACITY, TREE_DEPTH,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use tracing::{debug, info};

/// attempts a reader makes to pin a version that survived concurrent rollbacks
const MAX_PIN_ATTEMPTS: usize = 3;

/// where a leaf came from on the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOrigin {
    pub id: EventId,
    pub position: EventPosition,
}

/// one applied leaf, as written to the leaf log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafRecord {
    pub commitment: Felt,
    pub origin: Option<EventOrigin>,
    /// mirror root right after this leaf was appended
    pub root_after: Felt,
}

/// immutable view of the tree at one leaf count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeVersion {
    pub leaf_count: u64,
    pub root: Felt,
    /// partial node per level, `None` where the level has no partial node
    pub frontier: Vec<Option<Felt>>,
    pub generation: u64,
}

impl TreeVersion {
    fn empty() -> Self {
        Self {
            leaf_count: 0,
            root: zero_hashes()[TREE_DEPTH],
            frontier: vec![None; TREE_DEPTH],
            generation: 0,
        }
    }
}

/// proof plus the leaf count of the version it was built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedProof {
    pub proof: MerkleProof,
    pub leaf_count: u64,
}

#[derive(Debug, Default)]
struct Nodes {
    /// complete nodes, `levels[l][i]` covers leaves `i << l .. (i + 1) << l`
    levels: Vec<Vec<Felt>>,
    leaves: Vec<LeafRecord>,
    by_commitment: HashMap<Felt, u64>,
    generation: u64,
}

impl Nodes {
    fn new() -> Self {
        Self {
            levels: vec![Vec::new(); TREE_DEPTH],
            ..Default::default()
        }
    }

    /// node `(level, index)` as seen by a tree of `leaf_count` leaves
    fn lookup(
        &self,
        frontier: &[Option<Felt>],
        level: usize,
        index: u64,
        leaf_count: u64,
    ) -> Result<Felt> {
        if index << level >= leaf_count {
            return Ok(zero_hashes()[level]);
        }
        if (index + 1) << level <= leaf_count {
            return self.levels[level].get(index as usize).copied().ok_or_else(|| {
                ShoaldError::Storage(format!("missing node ({}, {})", level, index))
            });
        }
        frontier[level]
            .ok_or_else(|| ShoaldError::Storage(format!("missing frontier node at level {}", level)))
    }

    /// frontier and root of the first `leaf_count` leaves, from complete nodes only
    fn rebuild_frontier(&self, leaf_count: u64) -> Result<(Vec<Option<Felt>>, Felt)> {
        let mut frontier = vec![None; TREE_DEPTH];

        for level in 1..TREE_DEPTH {
            if leaf_count % (1u64 << level) == 0 {
                continue;
            }
            let index = leaf_count >> level;
            let left = self.lookup(&frontier, level - 1, 2 * index, leaf_count)?;
            let right = self.lookup(&frontier, level - 1, 2 * index + 1, leaf_count)?;
            frontier[level] = Some(hash_node(&left, &right));
        }

        let top = TREE_DEPTH - 1;
        let left = self.lookup(&frontier, top, 0, leaf_count)?;
        let right = self.lookup(&frontier, top, 1, leaf_count)?;
        Ok((frontier, hash_node(&left, &right)))
    }

    fn proof(&self, version: &TreeVersion, index: u64) -> Result<PinnedProof> {
        if index >= version.leaf_count {
            return Err(ShoaldError::NotFound(format!(
                "leaf {} (tree has {} leaves)",
                index, version.leaf_count
            )));
        }

        let mut path_elements = Vec::with_capacity(TREE_DEPTH);
        let mut path_indices = Vec::with_capacity(TREE_DEPTH);
        for level in 0..TREE_DEPTH {
            let position = index >> level;
            let sibling = position ^ 1;
            path_elements.push(self.lookup(&version.frontier, level, sibling, version.leaf_count)?);
            path_indices.push((position & 1) as u8);
        }

        Ok(PinnedProof {
            proof: MerkleProof {
                leaf: self.leaves[index as usize].commitment,
                index,
                root: version.root,
                path_elements,
                path_indices,
            },
            leaf_count: version.leaf_count,
        })
    }

    fn truncate(&mut self, leaf_count: u64) {
        for (level, nodes) in self.levels.iter_mut().enumerate() {
            nodes.truncate((leaf_count >> level) as usize);
        }
        for (index, record) in self.leaves.iter().enumerate().skip(leaf_count as usize) {
            if self.by_commitment.get(&record.commitment) == Some(&(index as u64)) {
                self.by_commitment.remove(&record.commitment);
            }
        }
        self.leaves.truncate(leaf_count as usize);
        self.generation += 1;
    }
}

/// the writer side, owned by the syncer
pub struct TreeMirror {
    nodes: Arc<RwLock<Nodes>>,
    versions: watch::Sender<Arc<TreeVersion>>,
}

impl TreeMirror {
    pub fn new() -> Self {
        let (versions, _) = watch::channel(Arc::new(TreeVersion::empty()));
        Self {
            nodes: Arc::new(RwLock::new(Nodes::new())),
            versions,
        }
    }

    /// rebuild from persisted state
    ///
    /// `levels` holds the complete nodes of the first `snapshot_count` leaves,
    /// `leaves` the whole leaf log. the frontier is rebuilt from the node
    /// cache, checked against the snapshot root and the log, and the log tail
    /// is then replayed.
    pub fn restore(
        levels: Vec<Vec<Felt>>,
        leaves: Vec<LeafRecord>,
        snapshot_count: u64,
        snapshot_root: Felt,
    ) -> Result<Self> {
        if levels.len() != TREE_DEPTH {
            return Err(ShoaldError::Storage(format!(
                "node cache has {} levels, expected {}",
                levels.len(),
                TREE_DEPTH
            )));
        }
        if snapshot_count > leaves.len() as u64 {
            return Err(ShoaldError::Storage(format!(
                "snapshot at {} leaves but log has {}",
                snapshot_count,
                leaves.len()
            )));
        }

        let mut nodes = Nodes {
            levels,
            ..Nodes::new()
        };
        for (level, level_nodes) in nodes.levels.iter_mut().enumerate() {
            let expected = (snapshot_count >> level) as usize;
            if level_nodes.len() < expected {
                return Err(ShoaldError::Storage(format!(
                    "node cache level {} has {} nodes, snapshot needs {}",
                    level,
                    level_nodes.len(),
                    expected
                )));
            }
            level_nodes.truncate(expected);
        }

        let (frontier, root) = nodes.rebuild_frontier(snapshot_count)?;
        let logged_root = match snapshot_count {
            0 => zero_hashes()[TREE_DEPTH],
            n => leaves[n as usize - 1].root_after,
        };
        if root != snapshot_root || root != logged_root {
            return Err(ShoaldError::RootMismatch {
                index: snapshot_count,
                expected: snapshot_root.to_hex(),
                computed: root.to_hex(),
            });
        }

        let mut applied = leaves;
        let replay = applied.split_off(snapshot_count as usize);
        for (index, record) in applied.iter().enumerate() {
            nodes.by_commitment.entry(record.commitment).or_insert(index as u64);
        }
        nodes.leaves = applied;

        let version = TreeVersion {
            leaf_count: snapshot_count,
            root,
            frontier,
            generation: 0,
        };
        let (versions, _) = watch::channel(Arc::new(version));
        let mut mirror = Self {
            nodes: Arc::new(RwLock::new(nodes)),
            versions,
        };

        let replayed = replay.len();
        for record in replay {
            let (index, root) = mirror.append_leaf(record.commitment, record.origin)?;
            if root != record.root_after {
                return Err(ShoaldError::RootMismatch {
                    index,
                    expected: record.root_after.to_hex(),
                    computed: root.to_hex(),
                });
            }
        }

        info!(
            "mirror restored: {} leaves ({} from snapshot, {} replayed)",
            mirror.leaf_count(),
            snapshot_count,
            replayed
        );
        Ok(mirror)
    }

    pub fn reader(&self) -> MirrorReader {
        MirrorReader {
            nodes: Arc::clone(&self.nodes),
            versions: self.versions.subscribe(),
        }
    }

    pub fn version(&self) -> Arc<TreeVersion> {
        self.versions.borrow().clone()
    }

    pub fn leaf_count(&self) -> u64 {
        self.versions.borrow().leaf_count
    }

    pub fn get_root(&self) -> Felt {
        self.versions.borrow().root
    }

    /// append a bare commitment, returns `(index, new_root)`
    pub fn append(&mut self, commitment: Felt) -> Result<(u64, Felt)> {
        self.append_leaf(commitment, None)
    }

    /// append the leaf of a ledger event; the caller compares the root
    pub fn append_event(&mut self, event: &LedgerEvent) -> Result<(u64, Felt)> {
        self.append_leaf(
            event.commitment,
            Some(EventOrigin {
                id: event.id,
                position: event.position,
            }),
        )
    }

    fn append_leaf(&mut self, commitment: Felt, origin: Option<EventOrigin>) -> Result<(u64, Felt)> {
        let current = self.version();
        let index = current.leaf_count;
        if index >= TREE_CAPACITY {
            return Err(ShoaldError::Validation(format!(
                "tree full ({} leaves)",
                TREE_CAPACITY
            )));
        }

        let zeros = zero_hashes();
        let new_count = index + 1;
        let mut frontier = current.frontier.clone();
        let mut nodes = self.write()?;

        let mut node = hash_leaf(&commitment);
        for level in 0..TREE_DEPTH {
            let position = index >> level;
            if (position + 1) << level <= new_count {
                nodes.levels[level].push(node);
                frontier[level] = None;
            } else {
                frontier[level] = Some(node);
            }

            node = if position % 2 == 0 {
                hash_node(&node, &zeros[level])
            } else {
                hash_node(&nodes.levels[level][position as usize - 1], &node)
            };
        }

        nodes.leaves.push(LeafRecord {
            commitment,
            origin,
            root_after: node,
        });
        nodes.by_commitment.entry(commitment).or_insert(index);

        self.versions.send_replace(Arc::new(TreeVersion {
            leaf_count: new_count,
            root: node,
            frontier,
            generation: nodes.generation,
        }));

        debug!("mirror leaf {} appended, root {}", index, node);
        Ok((index, node))
    }

    /// roll back to the first `leaf_count` leaves
    pub fn truncate(&mut self, leaf_count: u64) -> Result<()> {
        let current = self.version();
        if leaf_count > current.leaf_count {
            return Err(ShoaldError::Validation(format!(
                "cannot truncate {} leaves to {}",
                current.leaf_count, leaf_count
            )));
        }
        if leaf_count == current.leaf_count {
            return Ok(());
        }

        let mut nodes = self.write()?;
        nodes.truncate(leaf_count);
        let (frontier, root) = nodes.rebuild_frontier(leaf_count)?;

        // published under the lock so a reader that sees the new generation
        // also sees the version that goes with it
        self.versions.send_replace(Arc::new(TreeVersion {
            leaf_count,
            root,
            frontier,
            generation: nodes.generation,
        }));

        info!(
            "mirror truncated from {} to {} leaves (generation {})",
            current.leaf_count, leaf_count, nodes.generation
        );
        Ok(())
    }

    pub fn leaf(&self, index: u64) -> Option<LeafRecord> {
        self.read().ok()?.leaves.get(index as usize).copied()
    }

    /// complete nodes that exist at `to_count` leaves but not at `from_count`
    pub fn complete_nodes_between(&self, from_count: u64, to_count: u64) -> Result<Vec<(u8, u64, Felt)>> {
        let nodes = self.read()?;
        let mut out = Vec::new();
        for (level, level_nodes) in nodes.levels.iter().enumerate() {
            let start = (from_count >> level) as usize;
            let end = ((to_count >> level) as usize).min(level_nodes.len());
            for index in start..end {
                out.push((level as u8, index as u64, level_nodes[index]));
            }
        }
        Ok(out)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Nodes>> {
        self.nodes
            .read()
            .map_err(|_| ShoaldError::Storage("mirror lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Nodes>> {
        self.nodes
            .write()
            .map_err(|_| ShoaldError::Storage("mirror lock poisoned".into()))
    }
}

impl Default for TreeMirror {
    fn default() -> Self {
        Self::new()
    }
}

/// read-only handle, one per server task
#[derive(Clone)]
pub struct MirrorReader {
    nodes: Arc<RwLock<Nodes>>,
    versions: watch::Receiver<Arc<TreeVersion>>,
}

impl MirrorReader {
    pub fn version(&self) -> Arc<TreeVersion> {
        self.versions.borrow().clone()
    }

    pub fn leaf_count(&self) -> u64 {
        self.versions.borrow().leaf_count
    }

    pub fn get_root(&self) -> Felt {
        self.versions.borrow().root
    }

    pub fn get_proof(&self, index: u64) -> Result<PinnedProof> {
        self.pinned(|version, nodes| nodes.proof(version, index))
    }

    pub fn find(&self, commitment: &Felt) -> Result<Option<u64>> {
        self.pinned(|version, nodes| {
            Ok(nodes
                .by_commitment
                .get(commitment)
                .copied()
                .filter(|index| *index < version.leaf_count))
        })
    }

    pub fn get_proof_by_commitment(&self, commitment: &Felt) -> Result<PinnedProof> {
        self.pinned(|version, nodes| {
            let index = nodes
                .by_commitment
                .get(commitment)
                .copied()
                .filter(|index| *index < version.leaf_count)
                .ok_or_else(|| ShoaldError::NotFound(format!("commitment {}", commitment)))?;
            nodes.proof(version, index)
        })
    }

    /// the last `n` roots, newest first; the empty-tree root is the oldest
    pub fn get_root_history(&self, n: usize) -> Result<Vec<Felt>> {
        self.pinned(|version, nodes| {
            let applied = nodes.leaves[..version.leaf_count as usize]
                .iter()
                .rev()
                .map(|record| record.root_after);
            Ok(applied
                .chain(std::iter::once(zero_hashes()[TREE_DEPTH]))
                .take(n)
                .collect())
        })
    }

    pub fn leaf(&self, index: u64) -> Result<Option<LeafRecord>> {
        self.pinned(|version, nodes| {
            Ok(nodes
                .leaves
                .get(index as usize)
                .copied()
                .filter(|_| index < version.leaf_count))
        })
    }

    fn pinned<T>(&self, read: impl Fn(&TreeVersion, &Nodes) -> Result<T>) -> Result<T> {
        for _ in 0..MAX_PIN_ATTEMPTS {
            let version = self.version();
            let nodes = self
                .nodes
                .read()
                .map_err(|_| ShoaldError::Storage("mirror lock poisoned".into()))?;
            if nodes.generation == version.generation {
                return read(&version, &nodes);
            }
        }
        Err(ShoaldError::TemporarilyUnavailable(
            "mirror is being rolled back".into(),
        ))
    }
}
