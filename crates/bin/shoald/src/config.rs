//! runtime configuration, filled from cli args in `main` and from defaults in tests

use shoal_core::DEFAULT_ROOT_WINDOW;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// first ledger block to scan on a fresh database
    pub start_block: u64,
    /// blocks an event must be buried under before it is applied
    pub confirmations: u64,
    pub poll_interval: Duration,
    /// longest a missing index may hold back buffered events
    pub max_gap_wait: Duration,
    /// fetch attempts per poll before the syncer halts
    pub max_fetch_retries: u32,
    /// first backoff delay, doubled per retry
    pub retry_base_delay: Duration,
    /// cap on the delay between retries against an unreachable ledger
    pub max_retry_delay: Duration,
    /// largest block range requested at once
    pub max_blocks_per_fetch: u64,
    /// block window walked backwards per step while reconciling
    pub reorg_window_blocks: u64,
    /// deepest reorg recovered from before halting
    pub max_reorg_depth: u64,
    /// leaves between persisted snapshots
    pub snapshot_interval: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            start_block: 0,
            confirmations: 0,
            poll_interval: Duration::from_secs(2),
            max_gap_wait: Duration::from_secs(30),
            max_fetch_retries: 5,
            retry_base_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(60),
            max_blocks_per_fetch: 1000,
            reorg_window_blocks: 64,
            max_reorg_depth: 1024,
            snapshot_interval: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// refuse proofs once the mirror lags the ledger by this many leaves
    pub root_window: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8645)),
            root_window: DEFAULT_ROOT_WINDOW as u64,
        }
    }
}
