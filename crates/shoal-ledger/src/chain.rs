//! in-process ledger
//!
//! a minimal block producer around the accumulator: transactions are queued,
//! `mine` seals them into a block and applies each one atomically. failed
//! transactions stay in the block with their error and emit nothing. used by
//! tests and local runs as the source a mirror syncs from, including reorgs.

use crate::accumulator::{Accumulator, AccumulatorConfig};
use crate::error::LedgerError;
use crate::verifier::ProofVerifier;
use sha2::{Digest, Sha256};
use shoal_core::{EventId, EventPosition, Felt, LedgerEvent};
use std::sync::Arc;
use tracing::{debug, info, warn};

const TX_DOMAIN: &[u8] = b"shoal.tx.v1";
const BLOCK_DOMAIN: &[u8] = b"shoal.block.v1";

pub type SharedVerifier = Arc<dyn ProofVerifier>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    Deposit { commitment: Felt },
    Spend { proof: Vec<u8>, public_inputs: Vec<Felt> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTx {
    pub hash: Felt,
    pub tx: Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub hash: Felt,
    pub result: Result<(), LedgerError>,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub number: u64,
    pub hash: Felt,
    pub parent: Felt,
    pub txs: Vec<PendingTx>,
    pub receipts: Vec<TxReceipt>,
    pub events: Vec<LedgerEvent>,
}

pub struct Chain {
    accumulator: Accumulator<SharedVerifier>,
    config: AccumulatorConfig,
    blocks: Vec<Block>,
    mempool: Vec<PendingTx>,
    nonce: u64,
}

impl Chain {
    pub fn new(verifier: SharedVerifier, config: AccumulatorConfig) -> Self {
        let genesis = Block {
            number: 0,
            hash: block_hash(&Felt::ZERO, 0, &[], 0),
            parent: Felt::ZERO,
            txs: Vec::new(),
            receipts: Vec::new(),
            events: Vec::new(),
        };

        Self {
            accumulator: Accumulator::new(verifier, config),
            config,
            blocks: vec![genesis],
            mempool: Vec::new(),
            nonce: 0,
        }
    }

    /// queue a transaction, returns its hash
    pub fn submit(&mut self, tx: Transaction) -> Felt {
        self.nonce += 1;
        let hash = tx_hash(self.nonce, &tx);
        self.mempool.push(PendingTx { hash, tx });
        hash
    }

    /// queue a transaction that was orphaned by a reorg, keeping its hash
    pub fn resubmit(&mut self, tx: PendingTx) {
        self.mempool.push(tx);
    }

    /// seal the mempool into a new block, returns its number
    pub fn mine(&mut self) -> u64 {
        let number = self.head() + 1;
        let parent = self.blocks[self.blocks.len() - 1].hash;
        let txs = std::mem::take(&mut self.mempool);

        let mut receipts = Vec::with_capacity(txs.len());
        let mut events = Vec::new();

        for (tx_index, pending) in txs.iter().enumerate() {
            let result = apply(&mut self.accumulator, &pending.tx);
            let insertions = self.accumulator.take_events();

            if let Err(e) = &result {
                debug!("tx {} failed in block {}: {}", pending.hash, number, e);
            }

            for (event_index, insertion) in insertions.into_iter().enumerate() {
                events.push(LedgerEvent {
                    id: EventId {
                        tx_hash: pending.hash,
                        event_index: event_index as u32,
                    },
                    position: EventPosition::new(number, tx_index as u32, event_index as u32),
                    commitment: insertion.commitment,
                    index: insertion.index,
                    new_root: insertion.new_root,
                });
            }
            receipts.push(TxReceipt {
                hash: pending.hash,
                result,
            });
        }

        self.nonce += 1;
        let hash = block_hash(&parent, number, &txs, self.nonce);
        self.blocks.push(Block {
            number,
            hash,
            parent,
            txs,
            receipts,
            events,
        });
        number
    }

    /// drop every block above `fork_block` and rebuild state from genesis
    ///
    /// returns the orphaned transactions so a caller can re-include some of
    /// them on the new branch.
    pub fn reorg(&mut self, fork_block: u64) -> Vec<PendingTx> {
        if fork_block >= self.head() {
            return Vec::new();
        }

        let orphaned_blocks = self.blocks.split_off(fork_block as usize + 1);
        let orphaned: Vec<PendingTx> = orphaned_blocks.into_iter().flat_map(|b| b.txs).collect();

        let verifier = Arc::clone(self.accumulator.verifier());
        let mut accumulator = Accumulator::new(verifier, self.config);
        for block in &self.blocks {
            for (pending, receipt) in block.txs.iter().zip(&block.receipts) {
                let result = apply(&mut accumulator, &pending.tx);
                if result != receipt.result {
                    warn!(
                        "replay of tx {} in block {} diverged: {:?}, recorded {:?}",
                        pending.hash, block.number, result, receipt.result
                    );
                }
                debug_assert_eq!(result, receipt.result, "replay of tx {}", pending.hash);
            }
        }
        accumulator.take_events();
        self.accumulator = accumulator;

        info!(
            "reorg to block {}: {} txs orphaned, {} leaves",
            fork_block,
            orphaned.len(),
            self.accumulator.leaf_count()
        );
        orphaned
    }

    pub fn head(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }

    pub fn block(&self, number: u64) -> Option<&Block> {
        self.blocks.get(number as usize)
    }

    /// events of blocks `from..=to`, in canonical order
    pub fn events(&self, from: u64, to: u64) -> Vec<LedgerEvent> {
        self.blocks
            .iter()
            .filter(|b| b.number >= from && b.number <= to)
            .flat_map(|b| b.events.iter().cloned())
            .collect()
    }

    pub fn accumulator(&self) -> &Accumulator<SharedVerifier> {
        &self.accumulator
    }
}

fn apply(accumulator: &mut Accumulator<SharedVerifier>, tx: &Transaction) -> Result<(), LedgerError> {
    match tx {
        Transaction::Deposit { commitment } => accumulator.insert_leaf(*commitment).map(|_| ()),
        Transaction::Spend { proof, public_inputs } => {
            accumulator.consume(proof, public_inputs).map(|_| ())
        }
    }
}

fn tx_hash(nonce: u64, tx: &Transaction) -> Felt {
    let mut hasher = Sha256::new();
    hasher.update(TX_DOMAIN);
    hasher.update(nonce.to_be_bytes());
    match tx {
        Transaction::Deposit { commitment } => {
            hasher.update([0u8]);
            hasher.update(commitment.as_bytes());
        }
        Transaction::Spend { proof, public_inputs } => {
            hasher.update([1u8]);
            hasher.update((proof.len() as u64).to_be_bytes());
            hasher.update(proof);
            for input in public_inputs {
                hasher.update(input.as_bytes());
            }
        }
    }
    Felt::from_bytes_masked(hasher.finalize().into())
}

fn block_hash(parent: &Felt, number: u64, txs: &[PendingTx], nonce: u64) -> Felt {
    let mut hasher = Sha256::new();
    hasher.update(BLOCK_DOMAIN);
    hasher.update(parent.as_bytes());
    hasher.update(number.to_be_bytes());
    hasher.update(nonce.to_be_bytes());
    for tx in txs {
        hasher.update(tx.hash.as_bytes());
    }
    Felt::from_bytes_masked(hasher.finalize().into())
}
