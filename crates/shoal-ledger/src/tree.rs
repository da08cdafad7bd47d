//! append-only commitment tree held by the ledger
//!
//! only the frontier is kept: the last left-child hash seen at every level.
//! that is enough to compute the next root in `TREE_DEPTH` hashes, and the
//! ledger never has to serve inclusion paths.

use crate::error::{LedgerError, Result};
use shoal_core::{hash_leaf, hash_node, zero_hashes, Felt, TREE_CAPACITY, TREE_DEPTH};

#[derive(Debug, Clone)]
pub struct CommitmentTree {
    /// left sibling per level for the next insertion
    filled_subtrees: [Felt; TREE_DEPTH],
    next_index: u64,
    root: Felt,
}

impl CommitmentTree {
    pub fn new() -> Self {
        let zeros = zero_hashes();
        let mut filled_subtrees = [Felt::ZERO; TREE_DEPTH];
        filled_subtrees.copy_from_slice(&zeros[..TREE_DEPTH]);

        Self {
            filled_subtrees,
            next_index: 0,
            root: zeros[TREE_DEPTH],
        }
    }

    /// append at the next free index, returns `(index, new_root)`
    pub fn append(&mut self, commitment: Felt) -> Result<(u64, Felt)> {
        if self.next_index >= TREE_CAPACITY {
            return Err(LedgerError::TreeFull { capacity: TREE_CAPACITY });
        }

        let zeros = zero_hashes();
        let index = self.next_index;
        let mut current_index = index;
        let mut current = hash_leaf(&commitment);

        for level in 0..TREE_DEPTH {
            current = if current_index % 2 == 0 {
                self.filled_subtrees[level] = current;
                hash_node(&current, &zeros[level])
            } else {
                hash_node(&self.filled_subtrees[level], &current)
            };
            current_index /= 2;
        }

        self.root = current;
        self.next_index += 1;

        Ok((index, current))
    }

    pub fn root(&self) -> Felt {
        self.root
    }

    pub fn len(&self) -> u64 {
        self.next_index
    }

    pub fn is_empty(&self) -> bool {
        self.next_index == 0
    }

    pub fn is_full(&self) -> bool {
        self.next_index >= TREE_CAPACITY
    }

    #[cfg(test)]
    pub(crate) fn with_next_index(next_index: u64) -> Self {
        Self {
            next_index,
            ..Self::new()
        }
    }
}

impl Default for CommitmentTree {
    fn default() -> Self {
        Self::new()
    }
}
