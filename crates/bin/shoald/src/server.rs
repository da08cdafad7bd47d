//! proof server
//!
//! pure in-memory reads. every handler pins one mirror version, so a proof
//! and the root it is returned with always belong together.

use crate::config::ServerConfig;
use crate::error::{Result, ShoaldError};
use crate::mirror::{MirrorReader, PinnedProof};
use crate::syncer::{SyncPhase, SyncStatus};
use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use shoal_core::{Felt, TREE_DEPTH};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// default and upper bound for `GET /roots?n=`
const DEFAULT_ROOTS: usize = 10;
const MAX_ROOTS: usize = 1024;

#[derive(Clone)]
pub struct AppState {
    pub reader: MirrorReader,
    pub status: watch::Receiver<SyncStatus>,
    pub root_window: u64,
}

impl AppState {
    pub fn new(reader: MirrorReader, status: watch::Receiver<SyncStatus>, root_window: u64) -> Self {
        Self {
            reader,
            status,
            root_window,
        }
    }

    /// refuse while the syncer is not following, once the ledger has dropped
    /// the mirror root from its window, or once the mirror lags the ledger by
    /// a full root window
    fn ensure_fresh(&self) -> Result<()> {
        let status = self.status.borrow().clone();
        match &status.phase {
            SyncPhase::Following => {}
            SyncPhase::Reconciling { divergent_index } => {
                return Err(ShoaldError::ReorgDetected(*divergent_index));
            }
            SyncPhase::Halted { reason, .. } => {
                return Err(ShoaldError::Halted(reason.clone()));
            }
        }

        if status.mirror_root_known == Some(false) {
            return Err(ShoaldError::TemporarilyUnavailable(format!(
                "ledger no longer accepts root {} ({} leaves mirrored)",
                self.reader.get_root(),
                self.reader.leaf_count()
            )));
        }

        let lag = status.canonical_leaf_count.saturating_sub(self.reader.leaf_count());
        if lag >= self.root_window {
            return Err(ShoaldError::TemporarilyUnavailable(format!(
                "mirror is {} leaves behind (window {})",
                lag, self.root_window
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProofResponse {
    pub leaf: Felt,
    pub index: u64,
    pub root: Felt,
    pub leaf_count: u64,
    pub path_elements: Vec<Felt>,
    pub path_indices: Vec<u8>,
}

impl From<PinnedProof> for ProofResponse {
    fn from(pinned: PinnedProof) -> Self {
        Self {
            leaf: pinned.proof.leaf,
            index: pinned.proof.index,
            root: pinned.proof.root,
            leaf_count: pinned.leaf_count,
            path_elements: pinned.proof.path_elements,
            path_indices: pinned.proof.path_indices,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RootResponse {
    pub root: Felt,
    pub leaf_count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RootsResponse {
    /// newest first
    pub roots: Vec<Felt>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InfoResponse {
    pub leaf_count: u64,
    pub root: Felt,
    pub depth: usize,
}

#[derive(Debug, Deserialize)]
pub struct RootsQuery {
    pub n: Option<usize>,
}

async fn proof_by_index(
    State(state): State<AppState>,
    Path(index): Path<u64>,
) -> Result<Json<ProofResponse>> {
    counter!("shoald_proof_requests_total", "endpoint" => "index").increment(1);
    state.ensure_fresh()?;
    Ok(Json(state.reader.get_proof(index)?.into()))
}

async fn proof_by_commitment(
    State(state): State<AppState>,
    Path(commitment): Path<String>,
) -> Result<Json<ProofResponse>> {
    counter!("shoald_proof_requests_total", "endpoint" => "commitment").increment(1);
    let commitment = Felt::from_hex(&commitment)
        .map_err(|e| ShoaldError::Validation(format!("bad commitment: {}", e)))?;
    state.ensure_fresh()?;
    Ok(Json(state.reader.get_proof_by_commitment(&commitment)?.into()))
}

async fn root(State(state): State<AppState>) -> Result<Json<RootResponse>> {
    state.ensure_fresh()?;
    let version = state.reader.version();
    Ok(Json(RootResponse {
        root: version.root,
        leaf_count: version.leaf_count,
    }))
}

async fn roots(
    State(state): State<AppState>,
    Query(query): Query<RootsQuery>,
) -> Result<Json<RootsResponse>> {
    state.ensure_fresh()?;
    let n = query.n.unwrap_or(DEFAULT_ROOTS).min(MAX_ROOTS);
    Ok(Json(RootsResponse {
        roots: state.reader.get_root_history(n)?,
    }))
}

async fn tree_info(State(state): State<AppState>) -> Json<InfoResponse> {
    let version = state.reader.version();
    Json(InfoResponse {
        leaf_count: version.leaf_count,
        root: version.root,
        depth: TREE_DEPTH,
    })
}

async fn status(State(state): State<AppState>) -> Json<SyncStatus> {
    Json(state.status.borrow().clone())
}

async fn health() -> &'static str {
    "ok"
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/proof/{index}", get(proof_by_index))
        .route("/proof/commitment/{commitment}", get(proof_by_commitment))
        .route("/root", get(root))
        .route("/roots", get(roots))
        .route("/info", get(tree_info))
        .route("/status", get(status))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// serve until `shutdown` flips
pub async fn serve(
    config: &ServerConfig,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    info!("proof server listening on {}", config.listen);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}
