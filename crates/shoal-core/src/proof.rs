//! merkle inclusion proof in the shape the circuit consumes

use crate::error::{CoreError, Result};
use crate::felt::Felt;
use crate::hash::{hash_leaf, hash_node};
use crate::TREE_DEPTH;
use serde::{Deserialize, Serialize};

/// inclusion proof for one leaf
///
/// `path_elements[l]` is the sibling at level `l` (bottom-up) and
/// `path_indices[l]` is 1 when the path node is the right child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// the commitment (not its leaf hash)
    pub leaf: Felt,
    pub index: u64,
    pub root: Felt,
    pub path_elements: Vec<Felt>,
    pub path_indices: Vec<u8>,
}

impl MerkleProof {
    /// root implied by the path
    pub fn compute_root(&self) -> Result<Felt> {
        if self.path_elements.len() != TREE_DEPTH {
            return Err(CoreError::PathLength {
                expected: TREE_DEPTH,
                actual: self.path_elements.len(),
            });
        }
        if self.path_indices.len() != TREE_DEPTH {
            return Err(CoreError::PathLength {
                expected: TREE_DEPTH,
                actual: self.path_indices.len(),
            });
        }

        let mut current = hash_leaf(&self.leaf);
        for (sibling, bit) in self.path_elements.iter().zip(&self.path_indices) {
            current = if *bit == 0 {
                hash_node(&current, sibling)
            } else {
                hash_node(sibling, &current)
            };
        }
        Ok(current)
    }

    /// path hashes to `root` and the indicator bits spell `index`
    pub fn verify(&self) -> bool {
        let bits_match = self
            .path_indices
            .iter()
            .enumerate()
            .all(|(level, bit)| *bit as u64 == (self.index >> level) & 1);

        bits_match && self.index >> TREE_DEPTH == 0 && self.compute_root().ok() == Some(self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{reference_root, zero_hashes};

    fn single_leaf_proof(leaf: Felt) -> MerkleProof {
        MerkleProof {
            leaf,
            index: 0,
            root: reference_root(&[leaf]),
            path_elements: zero_hashes()[..TREE_DEPTH].to_vec(),
            path_indices: vec![0; TREE_DEPTH],
        }
    }

    #[test]
    fn test_single_leaf_proof_verifies() {
        let proof = single_leaf_proof(Felt::from_u64(9));
        assert!(proof.verify());
    }

    #[test]
    fn test_short_path_never_verifies() {
        let mut proof = single_leaf_proof(Felt::from_u64(9));
        proof.path_elements.pop();
        assert!(!proof.verify());
        assert_eq!(
            proof.compute_root(),
            Err(CoreError::PathLength { expected: TREE_DEPTH, actual: TREE_DEPTH - 1 })
        );
    }

    #[test]
    fn test_index_bits_must_match() {
        let mut proof = single_leaf_proof(Felt::from_u64(9));
        proof.index = 1;
        assert!(!proof.verify());
    }
}
