use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use shoald::source::DEPOSIT_EVENT_SELECTOR;
use shoald::{server, AppState, LedgerSource, RpcLedgerSource, ServerConfig, Storage, SyncConfig, Syncer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "shoald")]
#[command(about = "shoal tree mirror and merkle proof server", long_about = None)]
#[command(version)]
struct Args {
    /// ledger JSON-RPC endpoint
    #[arg(long, env = "SHOALD_RPC_URL", default_value = "http://127.0.0.1:5050")]
    rpc_url: String,

    /// pool contract address
    #[arg(long, env = "SHOALD_CONTRACT")]
    contract: String,

    /// selector of the leaf insertion event
    #[arg(long, env = "SHOALD_EVENT_SELECTOR", default_value = DEPOSIT_EVENT_SELECTOR)]
    event_selector: String,

    /// sled database path
    #[arg(long, env = "SHOALD_DB_PATH", default_value = "./shoald.db")]
    db_path: String,

    /// HTTP listen address
    #[arg(long, env = "SHOALD_LISTEN", default_value = "127.0.0.1:8645")]
    listen: SocketAddr,

    /// prometheus exporter port (disabled if unset)
    #[arg(long, env = "SHOALD_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// first block to scan on a fresh database (pool deployment block)
    #[arg(long, env = "SHOALD_START_BLOCK", default_value_t = 0)]
    start_block: u64,

    /// confirmations before an event is applied
    #[arg(long, env = "SHOALD_CONFIRMATIONS", default_value_t = 0)]
    confirmations: u64,

    /// poll interval in milliseconds
    #[arg(long, env = "SHOALD_POLL_INTERVAL_MS", default_value_t = 2000)]
    poll_interval_ms: u64,

    /// seconds a missing event may hold back later ones before halting
    #[arg(long, env = "SHOALD_MAX_GAP_WAIT_SECS", default_value_t = 30)]
    max_gap_wait_secs: u64,

    /// fetch attempts per poll before halting
    #[arg(long, env = "SHOALD_MAX_FETCH_RETRIES", default_value_t = 5)]
    max_fetch_retries: u32,

    /// longest wait, in seconds, between retries against an unreachable ledger
    #[arg(long, env = "SHOALD_MAX_RETRY_DELAY_SECS", default_value_t = 60)]
    max_retry_delay_secs: u64,

    /// largest block range requested at once
    #[arg(long, env = "SHOALD_MAX_BLOCKS_PER_FETCH", default_value_t = 1000)]
    max_blocks_per_fetch: u64,

    /// blocks fetched per step when walking back through a reorg
    #[arg(long, env = "SHOALD_REORG_WINDOW_BLOCKS", default_value_t = 64)]
    reorg_window_blocks: u64,

    /// deepest reorg recovered from before halting
    #[arg(long, env = "SHOALD_MAX_REORG_DEPTH", default_value_t = 1024)]
    max_reorg_depth: u64,

    /// leaves between persisted snapshots
    #[arg(long, env = "SHOALD_SNAPSHOT_INTERVAL", default_value_t = 1024)]
    snapshot_interval: u64,

    /// stale-root window of the ledger; proofs are refused once the mirror
    /// lags by this many leaves
    #[arg(long, env = "SHOALD_ROOT_WINDOW", default_value_t = shoal_core::DEFAULT_ROOT_WINDOW as u64)]
    root_window: u64,
}

impl Args {
    fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            start_block: self.start_block,
            confirmations: self.confirmations,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_gap_wait: Duration::from_secs(self.max_gap_wait_secs),
            max_fetch_retries: self.max_fetch_retries,
            max_retry_delay: Duration::from_secs(self.max_retry_delay_secs),
            max_blocks_per_fetch: self.max_blocks_per_fetch,
            reorg_window_blocks: self.reorg_window_blocks,
            max_reorg_depth: self.max_reorg_depth,
            snapshot_interval: self.snapshot_interval,
            ..SyncConfig::default()
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen: self.listen,
            root_window: self.root_window,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shoald=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    info!("starting shoald v{}", env!("CARGO_PKG_VERSION"));
    info!("ledger RPC: {}", args.rpc_url);
    info!("contract: {}", args.contract);
    info!("database: {}", args.db_path);
    info!("listen: {}", args.listen);
    info!("confirmations: {}", args.confirmations);
    info!("root window: {}", args.root_window);

    if let Some(port) = args.metrics_port {
        let addr = SocketAddr::new(args.listen.ip(), port);
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install prometheus exporter")?;
        info!("metrics: {}", addr);
    }

    let storage = Storage::open(&args.db_path)?;
    let syncer = Syncer::open(storage, args.sync_config())?;
    let source = RpcLedgerSource::new(&args.rpc_url, &args.contract, &args.event_selector)?;

    match source.head().await {
        Ok(head) => info!("connected to ledger, head block {}", head),
        Err(e) => warn!("ledger not reachable yet: {}", e),
    }

    let state = AppState::new(
        syncer.mirror().reader(),
        syncer.subscribe_status(),
        args.root_window,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let source = Arc::new(source);
    let sync_shutdown = shutdown_rx.clone();
    let mut sync_task =
        tokio::spawn(async move { syncer.run(source.as_ref(), sync_shutdown).await });

    let server_config = args.server_config();
    let mut server_task =
        tokio::spawn(async move { server::serve(&server_config, state, shutdown_rx).await });

    // whichever ends first: ctrl-c, or a task that died on its own
    let mut sync_result = None;
    let mut server_result = None;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("shutting down");
        }
        result = &mut sync_task => {
            error!("syncer exited unexpectedly");
            sync_result = Some(result);
        }
        result = &mut server_task => {
            error!("proof server exited unexpectedly");
            server_result = Some(result);
        }
    }
    let _ = shutdown_tx.send(true);

    let sync_result = match sync_result {
        Some(result) => result,
        None => sync_task.await,
    };
    let server_result = match server_result {
        Some(result) => result,
        None => server_task.await,
    };

    if let Err(e) = sync_result? {
        error!("syncer stopped with error: {}", e);
        return Err(e.into());
    }
    if let Err(e) = server_result? {
        error!("server stopped with error: {}", e);
        return Err(e.into());
    }
    Ok(())
}
