//! HTTP surface of the proof server

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use common::ChainSource;
use serde_json::Value;
use shoal_core::{MerkleProof, TREE_DEPTH};
use shoald::server::ProofResponse;
use shoald::{router, AppState, SyncConfig, SyncInput, Syncer, TreeMirror};
use tower::ServiceExt;

async fn get(state: &AppState, uri: &str) -> Response {
    router(state.clone())
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// a syncer that has applied `blocks` single-deposit blocks
async fn synced(blocks: u64, root_window: u64) -> (Syncer, AppState, std::sync::Arc<ChainSource>) {
    let source = ChainSource::new();
    source.deposit_blocks(1..=blocks);

    let mut syncer = Syncer::new(TreeMirror::new(), None, SyncConfig::default());
    syncer.poll(source.as_ref()).await.unwrap();

    let state = AppState::new(syncer.mirror().reader(), syncer.subscribe_status(), root_window);
    (syncer, state, source)
}

#[tokio::test]
async fn test_proof_by_index() {
    let (_syncer, state, source) = synced(3, 100).await;

    let response = get(&state, "/proof/1").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: ProofResponse = serde_json::from_value(json(response).await).unwrap();
    assert_eq!(body.index, 1);
    assert_eq!(body.leaf_count, 3);
    assert_eq!(body.root, source.root());
    assert_eq!(body.path_elements.len(), TREE_DEPTH);

    let proof = MerkleProof {
        leaf: body.leaf,
        index: body.index,
        root: body.root,
        path_elements: body.path_elements,
        path_indices: body.path_indices,
    };
    assert!(proof.verify());
}

#[tokio::test]
async fn test_proof_by_commitment() {
    let (_syncer, state, _source) = synced(4, 100).await;
    let commitment = common::note(3).commitment;

    let response = get(&state, &format!("/proof/commitment/{}", commitment.to_hex())).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["index"], 2);

    let unknown = get(&state, "/proof/commitment/0x1234").await;
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let malformed = get(&state, "/proof/commitment/not-hex").await;
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_index_not_found() {
    let (_syncer, state, _source) = synced(2, 100).await;
    let response = get(&state, "/proof/2").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(json(response).await["error"].as_str().unwrap().contains("leaf 2"));
}

#[tokio::test]
async fn test_refuses_when_lagging_a_full_window() {
    let (mut syncer, state, source) = synced(2, 3).await;

    // three more leaves exist but are not yet applied
    source.deposit_blocks(10..=12);
    let unapplied = source.all_events()[2..].to_vec();
    syncer.observe_unconfirmed(&unapplied);
    syncer.publish_status();

    let response = get(&state, "/proof/0").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // one leaf closer and it is inside the window again
    syncer.ingest(unapplied[0].clone()).unwrap();
    syncer.publish_status();
    assert_eq!(get(&state, "/proof/0").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_refuses_until_caught_up_with_ledger_window() {
    let source = ChainSource::new();
    source.deposit_blocks(1..=300);

    let mut syncer = Syncer::new(
        TreeMirror::new(),
        None,
        SyncConfig {
            max_blocks_per_fetch: 50,
            ..SyncConfig::default()
        },
    );
    let state = AppState::new(syncer.mirror().reader(), syncer.subscribe_status(), 100);

    syncer.poll(source.as_ref()).await.unwrap();
    assert_eq!(syncer.mirror().leaf_count(), 49);
    let response = get(&state, "/proof/0").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(json(response).await["error"].as_str().unwrap().contains("no longer accepts"));
    assert_eq!(get(&state, "/root").await.status(), StatusCode::SERVICE_UNAVAILABLE);

    while syncer.mirror().leaf_count() < 300 {
        syncer.poll(source.as_ref()).await.unwrap();
    }
    let response = get(&state, "/proof/0").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: ProofResponse = serde_json::from_value(json(response).await).unwrap();
    assert_eq!(body.root, source.root());
}

#[tokio::test]
async fn test_shorter_reorg_withdraws_orphaned_leaves() {
    let (mut syncer, state, source) = synced(5, 100).await;
    assert_eq!(get(&state, "/proof/4").await.status(), StatusCode::OK);

    {
        let mut chain = source.chain.lock().unwrap();
        chain.reorg(3);
        chain.mine();
        chain.mine();
    }
    syncer.poll(source.as_ref()).await.unwrap();

    assert_eq!(get(&state, "/proof/4").await.status(), StatusCode::NOT_FOUND);
    let root = json(get(&state, "/root").await).await;
    assert_eq!(root["root"], source.root().to_hex());
    assert_eq!(root["leaf_count"], 3);
}

#[tokio::test]
async fn test_refuses_while_not_following() {
    let (mut syncer, state, _source) = synced(2, 100).await;
    syncer.handle(SyncInput::DivergenceDetected(1)).unwrap();
    syncer.publish_status();

    assert_eq!(get(&state, "/proof/0").await.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(get(&state, "/root").await.status(), StatusCode::SERVICE_UNAVAILABLE);

    // informational endpoints stay up
    let status = get(&state, "/status").await;
    assert_eq!(status.status(), StatusCode::OK);
    let body = json(status).await;
    assert_eq!(body["phase"], "reconciling");
    assert_eq!(body["divergent_index"], 1);
    assert_eq!(get(&state, "/health").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_root_roots_and_info() {
    let (_syncer, state, source) = synced(3, 100).await;

    let root = json(get(&state, "/root").await).await;
    assert_eq!(root["root"], source.root().to_hex());
    assert_eq!(root["leaf_count"], 3);

    let roots = json(get(&state, "/roots?n=2").await).await;
    let roots = roots["roots"].as_array().unwrap();
    assert_eq!(roots.len(), 2);
    assert_eq!(roots[0], source.root().to_hex());

    let all = json(get(&state, "/roots?n=50").await).await;
    assert_eq!(all["roots"].as_array().unwrap().len(), 4);

    let info = json(get(&state, "/info").await).await;
    assert_eq!(info["leaf_count"], 3);
    assert_eq!(info["depth"], TREE_DEPTH);
}
