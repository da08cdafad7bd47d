#![allow(dead_code)]

use async_trait::async_trait;
use shoal_core::{Felt, LedgerEvent, Note};
use shoal_ledger::{AccumulatorConfig, Chain, DigestVerifier, Transaction};
use shoald::{LedgerSource, Result, ShoaldError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// the in-process ledger behind the syncer's source trait
pub struct ChainSource {
    pub chain: Mutex<Chain>,
    pub offline: AtomicBool,
}

impl ChainSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            chain: Mutex::new(Chain::new(Arc::new(DigestVerifier), AccumulatorConfig::default())),
            offline: AtomicBool::new(false),
        })
    }

    /// one deposit per block
    pub fn deposit_blocks(&self, seeds: impl IntoIterator<Item = u64>) {
        let mut chain = self.chain.lock().unwrap();
        for seed in seeds {
            chain.submit(Transaction::Deposit {
                commitment: note(seed).commitment,
            });
            chain.mine();
        }
    }

    pub fn root(&self) -> Felt {
        self.chain.lock().unwrap().accumulator().get_root()
    }

    pub fn leaf_count(&self) -> u64 {
        self.chain.lock().unwrap().accumulator().leaf_count()
    }

    fn online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ShoaldError::Rpc("connection refused".into()));
        }
        Ok(())
    }

    pub fn all_events(&self) -> Vec<LedgerEvent> {
        let chain = self.chain.lock().unwrap();
        chain.events(0, chain.head())
    }
}

#[async_trait]
impl LedgerSource for ChainSource {
    async fn head(&self) -> Result<u64> {
        self.online()?;
        Ok(self.chain.lock().unwrap().head())
    }

    async fn events(&self, from_block: u64, to_block: u64) -> Result<Vec<LedgerEvent>> {
        self.online()?;
        Ok(self.chain.lock().unwrap().events(from_block, to_block))
    }

    async fn ledger_root(&self) -> Result<Felt> {
        self.online()?;
        Ok(self.chain.lock().unwrap().accumulator().get_root())
    }

    async fn is_root_known(&self, root: &Felt) -> Result<bool> {
        self.online()?;
        Ok(self.chain.lock().unwrap().accumulator().is_known_root(root))
    }

    async fn is_nullifier_spent(&self, nullifier: &Felt) -> Result<bool> {
        self.online()?;
        Ok(self.chain.lock().unwrap().accumulator().is_nullifier_spent(nullifier))
    }
}

pub fn note(seed: u64) -> Note {
    Note::new(Felt::from_u64(seed), Felt::from_u64(seed + 100_000), seed as u128)
}
