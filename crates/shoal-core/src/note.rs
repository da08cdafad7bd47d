//! client-side notes
//!
//! never stored by the ledger; the ledger only sees the commitment on
//! deposit and the spend nullifier on spend.

use crate::felt::Felt;
use crate::hash::{commitment, spend_nullifier};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub secret: Felt,
    pub nullifier: Felt,
    pub amount: u128,
    pub commitment: Felt,
    /// leaf index once the deposit has been observed
    pub index: Option<u64>,
}

impl Note {
    pub fn new(secret: Felt, nullifier: Felt, amount: u128) -> Self {
        Self {
            commitment: commitment(&secret, &nullifier, amount),
            secret,
            nullifier,
            amount,
            index: None,
        }
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }

    /// value revealed to the ledger when this note is consumed
    pub fn spend_nullifier(&self) -> Felt {
        spend_nullifier(&self.nullifier)
    }
}
