//! the hash contract: Mask, HashLeaf, HashNode, commitment and nullifier derivation

use crate::felt::Felt;
use crate::{COMMITMENT_DOMAIN, LEAF_DOMAIN, NODE_DOMAIN, NULLIFIER_DOMAIN, TREE_DEPTH};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// truncate a digest to a field element
pub fn mask(digest: [u8; 32]) -> Felt {
    Felt::from_bytes_masked(digest)
}

fn hash_parts(domain: &[u8], parts: &[&[u8]]) -> Felt {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(part);
    }
    mask(hasher.finalize().into())
}

/// note commitment: binds secret, nullifier and amount
pub fn commitment(secret: &Felt, nullifier: &Felt, amount: u128) -> Felt {
    hash_parts(
        COMMITMENT_DOMAIN,
        &[secret.as_bytes(), nullifier.as_bytes(), &amount.to_be_bytes()],
    )
}

/// public nullifier revealed when the note is spent
pub fn spend_nullifier(nullifier: &Felt) -> Felt {
    hash_parts(NULLIFIER_DOMAIN, &[nullifier.as_bytes()])
}

/// leaf node value for a commitment
pub fn hash_leaf(commitment: &Felt) -> Felt {
    hash_parts(LEAF_DOMAIN, &[commitment.as_bytes()])
}

/// parent of two children
pub fn hash_node(left: &Felt, right: &Felt) -> Felt {
    hash_parts(NODE_DOMAIN, &[left.as_bytes(), right.as_bytes()])
}

/// roots of empty subtrees, `zero_hashes()[l]` is an empty node at level `l`
///
/// level 0 is the empty leaf (`Felt::ZERO`), so `zero_hashes()[TREE_DEPTH]`
/// is the root of an empty tree.
pub fn zero_hashes() -> &'static [Felt; TREE_DEPTH + 1] {
    static ZEROS: OnceLock<[Felt; TREE_DEPTH + 1]> = OnceLock::new();
    ZEROS.get_or_init(|| {
        let mut zeros = [Felt::ZERO; TREE_DEPTH + 1];
        for level in 0..TREE_DEPTH {
            zeros[level + 1] = hash_node(&zeros[level], &zeros[level]);
        }
        zeros
    })
}

/// full-tree root over an ordered commitment sequence
///
/// hashes every level from scratch. this is the reference the incremental
/// implementations are checked against, not something to call per insert.
pub fn reference_root(commitments: &[Felt]) -> Felt {
    let zeros = zero_hashes();
    let mut level: Vec<Felt> = commitments.iter().map(hash_leaf).collect();

    for height in 0..TREE_DEPTH {
        if level.is_empty() {
            return zeros[TREE_DEPTH];
        }
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&zeros[height]);
            next.push(hash_node(&pair[0], right));
        }
        level = next;
    }

    level.first().copied().unwrap_or(zeros[TREE_DEPTH])
}
