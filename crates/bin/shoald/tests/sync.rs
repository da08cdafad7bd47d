//! syncer against the in-process ledger

mod common;

use common::{note, ChainSource};
use proptest::prelude::*;
use shoal_core::{reference_root, Felt};
use shoal_ledger::{DigestVerifier, SpendInputs, Transaction};
use shoald::{
    Ingested, LedgerSource, ShoaldError, Storage, SyncConfig, SyncInput, SyncPhase, Syncer,
    TreeMirror,
};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::watch;

fn config() -> SyncConfig {
    SyncConfig {
        poll_interval: Duration::from_millis(10),
        retry_base_delay: Duration::from_millis(1),
        max_fetch_retries: 2,
        ..SyncConfig::default()
    }
}

fn syncer(config: SyncConfig) -> Syncer {
    Syncer::new(TreeMirror::new(), None, config)
}

#[tokio::test]
async fn test_follows_chain() {
    let source = ChainSource::new();
    source.deposit_blocks(1..=6);

    let mut s = syncer(config());
    s.poll(source.as_ref()).await.unwrap();

    assert_eq!(s.mirror().leaf_count(), 6);
    assert_eq!(s.mirror().get_root(), source.root());
    assert_eq!(s.cursor(), 7);

    let reader = s.mirror().reader();
    for index in 0..6 {
        assert!(reader.get_proof(index).unwrap().proof.verify());
    }
}

#[tokio::test]
async fn test_late_predecessor_applied_in_order() {
    let source = ChainSource::new();
    source.deposit_blocks(1..=3);
    let events = source.all_events();

    let mut s = syncer(config());
    for i in [0, 2, 1] {
        s.handle(SyncInput::NewEvent(events[i].clone())).unwrap();
    }

    let in_order: Vec<Felt> = events.iter().map(|e| e.commitment).collect();
    assert_eq!(s.mirror().get_root(), reference_root(&in_order));
    assert_eq!(s.mirror().get_root(), source.root());
    assert_eq!(s.status().buffered, 0);
}

#[tokio::test]
async fn test_reorg_recovered_end_to_end() {
    let source = ChainSource::new();
    source.deposit_blocks(1..=5);

    let mut s = syncer(SyncConfig {
        reorg_window_blocks: 1,
        ..config()
    });
    s.poll(source.as_ref()).await.unwrap();
    assert_eq!(s.mirror().leaf_count(), 5);

    {
        let mut chain = source.chain.lock().unwrap();
        let orphaned = chain.reorg(3);
        assert_eq!(orphaned.len(), 2);
        // one orphaned deposit comes back, in a different slot
        chain.submit(Transaction::Deposit {
            commitment: note(50).commitment,
        });
        chain.mine();
        chain.resubmit(orphaned[1].clone());
        chain.mine();
        chain.submit(Transaction::Deposit {
            commitment: note(51).commitment,
        });
        chain.mine();
    }

    // the last mirrored leaf is gone from block 5: reconciled in the same poll
    s.poll(source.as_ref()).await.unwrap();
    assert_eq!(s.phase(), &SyncPhase::Following);
    assert_eq!(s.mirror().leaf_count(), source.leaf_count());
    assert_eq!(s.mirror().get_root(), source.root());
    assert_eq!(s.status().reorgs, 1);

    let reader = s.mirror().reader();
    assert_eq!(reader.find(&note(4).commitment).unwrap(), None);
    assert_eq!(reader.find(&note(5).commitment).unwrap(), Some(4));
}

#[tokio::test]
async fn test_reorg_too_deep_halts() {
    let source = ChainSource::new();
    source.deposit_blocks(1..=5);

    let mut s = syncer(SyncConfig {
        reorg_window_blocks: 1,
        max_reorg_depth: 1,
        ..config()
    });
    s.poll(source.as_ref()).await.unwrap();

    {
        let mut chain = source.chain.lock().unwrap();
        chain.reorg(1);
        for seed in 60..65 {
            chain.submit(Transaction::Deposit {
                commitment: note(seed).commitment,
            });
            chain.mine();
        }
    }

    let result = s.poll(source.as_ref()).await;
    assert!(matches!(result, Err(ShoaldError::ReorgTooDeep { max_depth: 1 })));
    assert!(matches!(s.phase(), SyncPhase::Halted { .. }));
}

#[tokio::test]
async fn test_confirmations_hold_back_recent_events() {
    let source = ChainSource::new();
    source.deposit_blocks(1..=5);

    let mut s = syncer(SyncConfig {
        confirmations: 2,
        ..config()
    });
    s.poll(source.as_ref()).await.unwrap();

    let status = s.status();
    assert_eq!(status.leaf_count, 3);
    assert_eq!(status.canonical_leaf_count, 5);
    assert_eq!(status.lag(), 2);
    assert_eq!(s.cursor(), 4);
}

#[tokio::test]
async fn test_unreachable_ledger_halts_then_resumes() {
    let source = ChainSource::new();
    source.offline.store(true, Ordering::SeqCst);

    let mut s = syncer(config());
    let result = s.poll(source.as_ref()).await;
    assert!(matches!(result, Err(ShoaldError::LedgerUnreachable(_))));
    assert!(matches!(s.phase(), SyncPhase::Halted { retryable: true, .. }));
    assert!(!s.status().is_following());

    // still down: stays halted
    assert!(s.poll(source.as_ref()).await.is_err());
    assert!(matches!(s.phase(), SyncPhase::Halted { .. }));

    source.offline.store(false, Ordering::SeqCst);
    source.deposit_blocks(1..=2);
    s.poll(source.as_ref()).await.unwrap();
    assert_eq!(s.phase(), &SyncPhase::Following);
    assert_eq!(s.mirror().leaf_count(), 2);
    assert_eq!(s.mirror().get_root(), source.root());
}

#[tokio::test]
async fn test_run_recovers_from_outage() {
    let source = ChainSource::new();
    source.deposit_blocks(1..=2);
    source.offline.store(true, Ordering::SeqCst);

    let s = syncer(SyncConfig {
        max_retry_delay: Duration::from_millis(20),
        ..config()
    });
    let mut status = s.subscribe_status();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task_source = source.clone();
    let task = tokio::spawn(async move { s.run(task_source.as_ref(), shutdown_rx).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while status.borrow().is_following() {
            status.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    source.offline.store(false, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(5), async {
        while status.borrow().leaf_count < 2 {
            status.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
    assert!(status.borrow().is_following());

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reorg_onto_shorter_branch_detected() {
    let source = ChainSource::new();
    source.deposit_blocks(1..=5);

    let mut s = syncer(config());
    s.poll(source.as_ref()).await.unwrap();
    assert_eq!(s.mirror().leaf_count(), 5);

    // no new deposit follows the reorg, only empty blocks
    {
        let mut chain = source.chain.lock().unwrap();
        chain.reorg(3);
        for _ in 0..4 {
            chain.mine();
        }
    }

    s.poll(source.as_ref()).await.unwrap();
    assert_eq!(s.phase(), &SyncPhase::Following);
    assert_eq!(s.mirror().leaf_count(), 3);
    assert_eq!(s.mirror().get_root(), source.root());
    assert_eq!(s.status().reorgs, 1);
    assert_eq!(s.status().mirror_root_known, Some(true));

    let reader = s.mirror().reader();
    assert!(matches!(reader.get_proof(4), Err(ShoaldError::NotFound(_))));
}

#[tokio::test]
async fn test_catching_up_reports_evicted_root() {
    let source = ChainSource::new();
    source.deposit_blocks(1..=300);

    let mut s = syncer(SyncConfig {
        max_blocks_per_fetch: 50,
        ..config()
    });
    s.poll(source.as_ref()).await.unwrap();

    // 49 of 300 leaves: the ledger's 100-root window is long past this root
    let status = s.status();
    assert_eq!(status.leaf_count, 49);
    assert_eq!(status.mirror_root_known, Some(false));
    assert_eq!(status.ledger_root, Some(source.root()));

    while s.mirror().leaf_count() < 300 {
        s.poll(source.as_ref()).await.unwrap();
    }
    let status = s.status();
    assert_eq!(status.mirror_root_known, Some(true));
    assert_eq!(status.ledger_root, Some(s.mirror().get_root()));
}

#[tokio::test]
async fn test_ledger_queries() {
    let source = ChainSource::new();
    source.deposit_blocks(1..=2);
    let early_root = source.root();

    let spent = note(1);
    let inputs = SpendInputs::new(source.root(), spent.spend_nullifier(), None).to_public_inputs();
    {
        let mut chain = source.chain.lock().unwrap();
        chain.submit(Transaction::Spend {
            proof: DigestVerifier::prove(&inputs),
            public_inputs: inputs,
        });
        chain.mine();
    }

    assert_eq!(source.ledger_root().await.unwrap(), source.root());
    assert!(source.is_root_known(&early_root).await.unwrap());
    assert!(!source.is_root_known(&Felt::from_u64(99)).await.unwrap());
    assert!(source.is_nullifier_spent(&spent.spend_nullifier()).await.unwrap());
    assert!(!source.is_nullifier_spent(&note(2).spend_nullifier()).await.unwrap());
}

#[tokio::test]
async fn test_restart_resumes_from_storage() {
    let dir = tempfile::tempdir().unwrap();
    let source = ChainSource::new();
    source.deposit_blocks(1..=7);
    let config = SyncConfig {
        snapshot_interval: 3,
        ..config()
    };

    {
        let storage = Storage::open(dir.path()).unwrap();
        let mut s = Syncer::open(storage, config.clone()).unwrap();
        s.poll(source.as_ref()).await.unwrap();
        assert_eq!(s.mirror().leaf_count(), 7);
    }

    source.deposit_blocks(8..=9);

    let storage = Storage::open(dir.path()).unwrap();
    let mut s = Syncer::open(storage, config).unwrap();
    assert_eq!(s.mirror().leaf_count(), 7);
    assert_eq!(s.mirror().get_root(), reference_root(
        &source.all_events()[..7].iter().map(|e| e.commitment).collect::<Vec<_>>(),
    ));

    s.poll(source.as_ref()).await.unwrap();
    assert_eq!(s.mirror().leaf_count(), 9);
    assert_eq!(s.mirror().get_root(), source.root());
}

#[tokio::test]
async fn test_run_until_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let source = ChainSource::new();
    source.deposit_blocks(1..=4);

    let storage = Storage::open(dir.path()).unwrap();
    let s = Syncer::open(storage, config()).unwrap();
    let mut status = s.subscribe_status();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task_source = source.clone();
    let task = tokio::spawn(async move { s.run(task_source.as_ref(), shutdown_rx).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while status.borrow().leaf_count < 4 {
            status.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    // shutdown writes a final snapshot
    let storage = Storage::open(dir.path()).unwrap();
    let snapshot = storage.snapshot().unwrap().unwrap();
    assert_eq!(snapshot.leaf_count, 4);
    assert_eq!(snapshot.root, source.root());
}

#[test]
fn test_duplicate_batch_is_noop() {
    let source = ChainSource::new();
    source.deposit_blocks(1..=4);
    let events = source.all_events();

    let mut s = syncer(config());
    for e in &events {
        s.ingest(e.clone()).unwrap();
    }
    let root = s.mirror().get_root();
    for e in &events {
        assert_eq!(s.ingest(e.clone()).unwrap(), Ingested::Duplicate);
    }
    assert_eq!(s.mirror().get_root(), root);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_rollback_and_reapply_matches_direct_build(
        seeds in prop::collection::vec(1u64..1_000_000, 1..24),
        cut in 0usize..24,
        extra in prop::collection::vec(1_000_000u64..2_000_000, 0..8),
    ) {
        let cut = cut.min(seeds.len());
        let leaves: Vec<Felt> = seeds.iter().map(|s| Felt::from_u64(*s)).collect();
        let mut expected: Vec<Felt> = leaves[..cut].to_vec();
        expected.extend(extra.iter().map(|s| Felt::from_u64(*s)));

        let mut mirror = TreeMirror::new();
        for c in &leaves {
            mirror.append(*c).unwrap();
        }
        mirror.truncate(cut as u64).unwrap();
        for c in &expected[cut..] {
            mirror.append(*c).unwrap();
        }

        prop_assert_eq!(mirror.get_root(), reference_root(&expected));
        let reader = mirror.reader();
        for index in 0..expected.len() as u64 {
            prop_assert!(reader.get_proof(index).unwrap().proof.verify());
        }
    }

    #[test]
    fn prop_replay_matches_reference(seeds in prop::collection::vec(1u64..u64::MAX, 0..40)) {
        let leaves: Vec<Felt> = seeds.iter().map(|s| Felt::from_u64(*s)).collect();
        let mut mirror = TreeMirror::new();
        for c in &leaves {
            mirror.append(*c).unwrap();
        }

        prop_assert_eq!(mirror.get_root(), reference_root(&leaves));
        let reader = mirror.reader();
        for index in 0..leaves.len() as u64 {
            let proof = reader.get_proof(index).unwrap().proof;
            prop_assert!(proof.verify());
            prop_assert_eq!(proof.root, mirror.get_root());
        }
    }
}
