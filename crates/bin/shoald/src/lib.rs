//! shoald - shoal tree mirror
//!
//! follows the ledger's leaf insertion events, keeps an incremental copy of
//! the commitment tree and serves inclusion proofs over HTTP.
//!
//! ```text
//! ledger RPC ──▶ syncer (single writer) ──▶ TreeMirror ──▶ versions (watch)
//!                   │                                          │
//!                   └─▶ sled (leaf log, node cache, snapshot)  └─▶ proof server (readers)
//! ```

pub mod config;
pub mod error;
pub mod mirror;
pub mod server;
pub mod source;
pub mod storage;
pub mod syncer;

pub use config::{ServerConfig, SyncConfig};
pub use error::{Result, ShoaldError};
pub use mirror::{EventOrigin, LeafRecord, MirrorReader, PinnedProof, TreeMirror, TreeVersion};
pub use server::{router, AppState};
pub use source::{LedgerSource, RpcLedgerSource};
pub use storage::{Snapshot, Storage};
pub use syncer::{Ingested, Reconciled, SyncInput, SyncPhase, SyncStatus, Syncer};
