//! window of recently accepted roots
//!
//! a client fetches a proof, builds a witness and only then submits; the
//! tree may have moved in between. proofs against any of the last `capacity`
//! roots are accepted, older ones fail with `StaleRoot`.

pub use shoal_core::DEFAULT_ROOT_WINDOW;
use shoal_core::Felt;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct RootHistory {
    roots: VecDeque<Felt>,
    capacity: usize,
}

impl RootHistory {
    /// window of `capacity` roots (at least one) seeded with `initial`
    pub fn new(capacity: usize, initial: Felt) -> Self {
        let capacity = capacity.max(1);
        let mut roots = VecDeque::with_capacity(capacity);
        roots.push_back(initial);
        Self { roots, capacity }
    }

    pub fn push(&mut self, root: Felt) {
        if self.roots.len() == self.capacity {
            self.roots.pop_front();
        }
        self.roots.push_back(root);
    }

    /// the zero root is never known
    pub fn contains(&self, root: &Felt) -> bool {
        !root.is_zero() && self.roots.iter().rev().any(|r| r == root)
    }

    pub fn latest(&self) -> Option<Felt> {
        self.roots.back().copied()
    }

    /// newest first
    pub fn iter(&self) -> impl Iterator<Item = &Felt> {
        self.roots.iter().rev()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_evicts_oldest() {
        let mut history = RootHistory::new(3, Felt::from_u64(1));
        for i in 2..=4 {
            history.push(Felt::from_u64(i));
        }

        assert!(!history.contains(&Felt::from_u64(1)));
        for i in 2..=4 {
            assert!(history.contains(&Felt::from_u64(i)));
        }
        assert_eq!(history.latest(), Some(Felt::from_u64(4)));
        assert_eq!(history.iter().count(), 3);
    }

    #[test]
    fn test_zero_root_never_known() {
        let history = RootHistory::new(4, Felt::ZERO);
        assert!(!history.contains(&Felt::ZERO));
    }

    #[test]
    fn test_zero_capacity_keeps_latest() {
        let mut history = RootHistory::new(0, Felt::from_u64(1));
        history.push(Felt::from_u64(2));
        assert_eq!(history.capacity(), 1);
        assert!(history.contains(&Felt::from_u64(2)));
        assert!(!history.contains(&Felt::from_u64(1)));
    }
}
