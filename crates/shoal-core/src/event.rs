//! ledger events emitted on every leaf insertion

use crate::felt::Felt;
use serde::{Deserialize, Serialize};
use std::fmt;

/// canonical ordering key of an event
///
/// field order gives the derived `Ord` the `(block, tx, event)` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct EventPosition {
    pub block: u64,
    pub tx: u32,
    pub event: u32,
}

impl EventPosition {
    pub fn new(block: u64, tx: u32, event: u32) -> Self {
        Self { block, tx, event }
    }
}

impl fmt::Display for EventPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.block, self.tx, self.event)
    }
}

/// globally unique event identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    pub tx_hash: Felt,
    pub event_index: u32,
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tx_hash, self.event_index)
    }
}

/// `{commitment, index, new_root}` plus where and by whom it was emitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: EventId,
    pub position: EventPosition,
    pub commitment: Felt,
    pub index: u64,
    pub new_root: Felt,
}

impl LedgerEvent {
    /// same leaf, same resulting root (ids may differ after re-inclusion)
    pub fn same_insertion(&self, other: &LedgerEvent) -> bool {
        self.index == other.index
            && self.commitment == other.commitment
            && self.new_root == other.new_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_ordering() {
        let a = EventPosition::new(10, 2, 0);
        let b = EventPosition::new(10, 2, 1);
        let c = EventPosition::new(10, 3, 0);
        let d = EventPosition::new(11, 0, 0);
        assert!(a < b && b < c && c < d);
    }
}
