//! canonical accumulator
//!
//! owns the commitment tree, the window of accepted roots and the spent
//! nullifier set. every mutating call either applies completely and emits
//! its insertion events, or fails and changes nothing.
//!
//! spend checks run in a fixed order:
//!
//! ```text
//! decode inputs ─▶ nullifier spent? ─▶ verify proof ─▶ root known? ─▶ capacity ─▶ apply
//!   Validation       DoubleSpend        InvalidProof     StaleRoot      TreeFull
//! ```

use crate::error::{LedgerError, Result};
use crate::nullifier::NullifierSet;
use crate::root_history::{RootHistory, DEFAULT_ROOT_WINDOW};
use crate::tree::CommitmentTree;
use crate::verifier::{ProofVerifier, SpendInputs};
use serde::{Deserialize, Serialize};
use shoal_core::Felt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumulatorConfig {
    /// how many recent roots a spend proof may be built against
    pub root_window: usize,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            root_window: DEFAULT_ROOT_WINDOW,
        }
    }
}

/// emitted once per inserted leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insertion {
    pub commitment: Felt,
    pub index: u64,
    pub new_root: Felt,
}

/// result of an accepted spend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeReceipt {
    pub nullifier: Felt,
    /// `(index, new_root)` of the output note, if the spend created one
    pub output: Option<(u64, Felt)>,
}

pub struct Accumulator<V> {
    tree: CommitmentTree,
    roots: RootHistory,
    nullifiers: NullifierSet,
    verifier: V,
    config: AccumulatorConfig,
    events: Vec<Insertion>,
}

impl<V: ProofVerifier> Accumulator<V> {
    pub fn new(verifier: V, config: AccumulatorConfig) -> Self {
        let tree = CommitmentTree::new();
        let roots = RootHistory::new(config.root_window, tree.root());

        Self {
            tree,
            roots,
            nullifiers: NullifierSet::new(),
            verifier,
            config,
            events: Vec::new(),
        }
    }

    /// append a deposit commitment, returns `(index, new_root)`
    pub fn insert_leaf(&mut self, commitment: Felt) -> Result<(u64, Felt)> {
        if commitment.is_zero() {
            return Err(LedgerError::Validation("zero commitment".into()));
        }
        self.append(commitment)
    }

    /// consume a note: check everything, then mark its nullifier spent and
    /// insert the output commitment (if any)
    pub fn consume(&mut self, proof: &[u8], public_inputs: &[Felt]) -> Result<ConsumeReceipt> {
        let inputs = SpendInputs::decode(proof, public_inputs)?;

        if self.nullifiers.is_spent(&inputs.nullifier) {
            warn!("double spend attempt: {}", inputs.nullifier);
            return Err(LedgerError::DoubleSpend(inputs.nullifier));
        }

        self.verifier
            .verify(proof, public_inputs)
            .map_err(|e| LedgerError::InvalidProof(e.to_string()))?;

        if !self.roots.contains(&inputs.root) {
            debug!("spend against unknown root {}", inputs.root);
            return Err(LedgerError::StaleRoot(inputs.root));
        }

        if inputs.output.is_some() && self.tree.is_full() {
            return Err(LedgerError::TreeFull {
                capacity: shoal_core::TREE_CAPACITY,
            });
        }

        // nothing below can fail
        let output = match inputs.output {
            Some(commitment) => Some(self.append(commitment)?),
            None => None,
        };
        self.nullifiers.insert(inputs.nullifier);

        info!(
            "consumed nullifier {} (spent: {})",
            inputs.nullifier,
            self.nullifiers.len()
        );

        Ok(ConsumeReceipt {
            nullifier: inputs.nullifier,
            output,
        })
    }

    fn append(&mut self, commitment: Felt) -> Result<(u64, Felt)> {
        let (index, new_root) = self.tree.append(commitment)?;
        self.roots.push(new_root);
        self.events.push(Insertion {
            commitment,
            index,
            new_root,
        });
        debug!("leaf {} inserted, root {}", index, new_root);
        Ok((index, new_root))
    }
}

impl<V> Accumulator<V> {
    pub fn get_root(&self) -> Felt {
        self.tree.root()
    }

    pub fn is_known_root(&self, root: &Felt) -> bool {
        self.roots.contains(root)
    }

    pub fn is_nullifier_spent(&self, nullifier: &Felt) -> bool {
        self.nullifiers.is_spent(nullifier)
    }

    pub fn leaf_count(&self) -> u64 {
        self.tree.len()
    }

    pub fn config(&self) -> &AccumulatorConfig {
        &self.config
    }

    pub fn verifier(&self) -> &V {
        &self.verifier
    }

    /// drain insertion events emitted since the last call
    pub fn take_events(&mut self) -> Vec<Insertion> {
        std::mem::take(&mut self.events)
    }

    #[cfg(test)]
    pub(crate) fn with_tree(mut self, tree: CommitmentTree) -> Self {
        self.roots = RootHistory::new(self.config.root_window, tree.root());
        self.tree = tree;
        self
    }
}
