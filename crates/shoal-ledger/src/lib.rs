//! shoal ledger
//!
//! the canonical side of the pool: an append-only commitment tree, a bounded
//! window of recently valid roots and a grow-only nullifier set, mutated
//! atomically by deposits and spends.
//!
//! ```text
//! deposit(commitment) ──▶ insert_leaf ──▶ Insertion { commitment, index, new_root }
//! spend(proof, [root, nullifier, output]) ──▶ consume ──▶ nullifier spent (+ output leaf)
//! ```

pub mod accumulator;
pub mod chain;
pub mod error;
pub mod nullifier;
pub mod root_history;
pub mod tree;
pub mod verifier;

pub use accumulator::{Accumulator, AccumulatorConfig, ConsumeReceipt, Insertion};
pub use chain::{Block, Chain, PendingTx, SharedVerifier, Transaction, TxReceipt};
pub use error::{LedgerError, Result};
pub use nullifier::NullifierSet;
pub use root_history::{RootHistory, DEFAULT_ROOT_WINDOW};
pub use tree::CommitmentTree;
pub use verifier::{DigestVerifier, ProofVerifier, Rejection, SpendInputs, MAX_PROOF_SIZE, SPEND_PUBLIC_INPUTS};
