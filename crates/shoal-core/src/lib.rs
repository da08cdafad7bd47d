//! shoal core
//!
//! the one hash contract shared by the ledger accumulator, the proof circuit
//! and the off-chain mirror. every value that crosses a component boundary is a
//! [`Felt`]: 32 big-endian bytes masked to 250 bits.
//!
//! ```text
//! note (secret, nullifier, amount)
//!   │
//!   ├─ commitment = Mask(H("shoal.commitment.v1" ‖ secret ‖ nullifier ‖ amount))
//!   │     └─ leaf node = Mask(H("shoal.merkle.leaf.v1" ‖ commitment))
//!   │           └─ parent = Mask(H("shoal.merkle.node.v1" ‖ left ‖ right))   (D = 25 levels)
//!   │
//!   └─ spend nullifier = Mask(H("shoal.nullifier.v1" ‖ nullifier))
//! ```
//!
//! any divergence between implementations of these functions is a correctness
//! failure. the vectors in [`vectors::CONFORMANCE_JSON`] pin the exact outputs.

pub mod error;
pub mod event;
pub mod felt;
pub mod hash;
pub mod note;
pub mod proof;
pub mod vectors;

pub use error::{CoreError, Result};
pub use event::{EventId, EventPosition, LedgerEvent};
pub use felt::Felt;
pub use hash::{commitment, hash_leaf, hash_node, mask, reference_root, spend_nullifier, zero_hashes};
pub use note::Note;
pub use proof::MerkleProof;

/// depth of the commitment tree
pub const TREE_DEPTH: usize = 25;

/// number of leaves the tree can hold
pub const TREE_CAPACITY: u64 = 1 << TREE_DEPTH;

/// bit width every hash output is truncated to
pub const FELT_BITS: u32 = 250;

/// domain separator for note commitments
pub const COMMITMENT_DOMAIN: &[u8] = b"shoal.commitment.v1";
/// domain separator for spend nullifiers
pub const NULLIFIER_DOMAIN: &[u8] = b"shoal.nullifier.v1";
/// domain separator for merkle leaves
pub const LEAF_DOMAIN: &[u8] = b"shoal.merkle.leaf.v1";
/// domain separator for merkle inner nodes
pub const NODE_DOMAIN: &[u8] = b"shoal.merkle.node.v1";

/// default number of recent roots the ledger accepts spend proofs against;
/// the mirror refuses to serve proofs once it lags the ledger by this many leaves
pub const DEFAULT_ROOT_WINDOW: usize = 100;
