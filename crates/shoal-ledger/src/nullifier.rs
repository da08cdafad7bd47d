//! spent nullifier set
//!
//! grows only. a nullifier that is present has been consumed exactly once.

use shoal_core::Felt;
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct NullifierSet {
    spent: HashSet<Felt>,
}

impl NullifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_spent(&self, nullifier: &Felt) -> bool {
        self.spent.contains(nullifier)
    }

    /// mark spent, returns false if it already was
    pub fn insert(&mut self, nullifier: Felt) -> bool {
        self.spent.insert(nullifier)
    }

    pub fn len(&self) -> usize {
        self.spent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spent.is_empty()
    }
}
