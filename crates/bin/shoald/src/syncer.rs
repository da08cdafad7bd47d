//! event syncer
//!
//! the only writer of the mirror. events are applied strictly in leaf index
//! order; everything else is a duplicate, a future event to buffer, or a sign
//! that the ledger reorganized under us.
//!
//! ```text
//!              NewEvent (index == leaf_count, root matches)
//!             ┌──────┐
//!             ▼      │
//!        ┌───────────┴─┐  DivergenceDetected   ┌──────────────┐
//!  ─────▶│  Following  ├──────────────────────▶│ Reconciling  │
//!        └──────┬──────┘◀──────────────────────┴──────┬───────┘
//!               │ FatalGap        recovered           │ too deep / root mismatch
//!               ▼                                     ▼
//!        ┌─────────────────────────────────────────────────────┐
//!        │                       Halted                        │
//!        └─────────────────────────────────────────────────────┘
//! ```
//!
//! a halt caused by an unreachable ledger is retryable: `run` keeps probing
//! the ledger with capped backoff and resumes following once it answers.
//! gap, reorg-depth and root-mismatch halts stay until an operator restarts.

use crate::config::SyncConfig;
use crate::error::{Result, ShoaldError};
use crate::mirror::TreeMirror;
use crate::source::LedgerSource;
use crate::storage::{Snapshot, Storage};
use metrics::{counter, gauge};
use serde::Serialize;
use shoal_core::{Felt, LedgerEvent};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SyncPhase {
    Following,
    Reconciling { divergent_index: u64 },
    Halted { reason: String, retryable: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncInput {
    NewEvent(LedgerEvent),
    DivergenceDetected(u64),
    FatalGap { expected: u64, buffered: u64 },
}

/// what happened to one ingested event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    Applied { index: u64 },
    Duplicate,
    Buffered,
    Diverged { index: u64 },
    /// not following; the event will be fetched again
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// rolled back to `agreed` leaves and reapplied the canonical suffix
    Recovered { agreed: u64 },
    /// no agreement inside the events given; fetch further back
    NeedMoreHistory,
}

/// published after every poll for the server and operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    #[serde(flatten)]
    pub phase: SyncPhase,
    pub leaf_count: u64,
    /// best known ledger leaf count, unconfirmed events included
    pub canonical_leaf_count: u64,
    pub cursor: u64,
    pub head: u64,
    pub buffered: usize,
    pub reorgs: u64,
    /// ledger root seen at the last check
    pub ledger_root: Option<Felt>,
    /// whether the ledger still accepts the current mirror root; `None` until
    /// the current root has been checked
    pub mirror_root_known: Option<bool>,
}

impl SyncStatus {
    pub fn lag(&self) -> u64 {
        self.canonical_leaf_count.saturating_sub(self.leaf_count)
    }

    pub fn is_following(&self) -> bool {
        self.phase == SyncPhase::Following
    }
}

/// the ledger's answer for one mirror root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RootCheck {
    root: Felt,
    ledger_root: Felt,
    known: bool,
}

pub struct Syncer {
    mirror: TreeMirror,
    storage: Option<Storage>,
    config: SyncConfig,
    phase: SyncPhase,
    /// future events keyed by leaf index
    pending: BTreeMap<u64, LedgerEvent>,
    /// when the current gap opened
    gap_since: Option<Instant>,
    canonical_hint: u64,
    /// next ledger block to scan
    cursor: u64,
    head: u64,
    last_snapshot: u64,
    reorgs: u64,
    root_check: Option<RootCheck>,
    status: watch::Sender<SyncStatus>,
}

impl Syncer {
    pub fn new(mirror: TreeMirror, storage: Option<Storage>, config: SyncConfig) -> Self {
        let leaf_count = mirror.leaf_count();
        let cursor = config.start_block;
        let (status, _) = watch::channel(SyncStatus {
            phase: SyncPhase::Following,
            leaf_count,
            canonical_leaf_count: leaf_count,
            cursor,
            head: 0,
            buffered: 0,
            reorgs: 0,
            ledger_root: None,
            mirror_root_known: None,
        });

        Self {
            mirror,
            storage,
            config,
            phase: SyncPhase::Following,
            pending: BTreeMap::new(),
            gap_since: None,
            canonical_hint: leaf_count,
            cursor,
            head: 0,
            last_snapshot: 0,
            reorgs: 0,
            root_check: None,
            status,
        }
    }

    /// restore mirror and cursor from `storage`
    pub fn open(storage: Storage, config: SyncConfig) -> Result<Self> {
        let (mirror, snapshot) = storage.load_mirror()?;

        let mut cursor = config.start_block;
        if let Some(s) = &snapshot {
            cursor = cursor.max(s.cursor);
        }
        if let Some(block) = last_leaf_block(&mirror) {
            cursor = cursor.max(block);
        }
        let last_snapshot = snapshot.map(|s| s.leaf_count).unwrap_or(0);

        let mut syncer = Self::new(mirror, Some(storage), config);
        syncer.cursor = cursor;
        syncer.last_snapshot = last_snapshot;
        syncer.publish_status();

        info!(
            "syncer resuming at block {} with {} leaves",
            cursor,
            syncer.mirror.leaf_count()
        );
        Ok(syncer)
    }

    pub fn mirror(&self) -> &TreeMirror {
        &self.mirror
    }

    pub fn phase(&self) -> &SyncPhase {
        &self.phase
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        let root = self.mirror.get_root();
        SyncStatus {
            phase: self.phase.clone(),
            leaf_count: self.mirror.leaf_count(),
            canonical_leaf_count: self.canonical_hint.max(self.mirror.leaf_count()),
            cursor: self.cursor,
            head: self.head,
            buffered: self.pending.len(),
            reorgs: self.reorgs,
            ledger_root: self.root_check.map(|c| c.ledger_root),
            mirror_root_known: self.root_check.filter(|c| c.root == root).map(|c| c.known),
        }
    }

    /// push the current status to subscribers
    pub fn publish_status(&self) {
        self.status.send_replace(self.status());
    }

    /// drive the state machine with one input
    pub fn handle(&mut self, input: SyncInput) -> Result<()> {
        match input {
            SyncInput::NewEvent(event) => self.ingest(event).map(|_| ()),
            SyncInput::DivergenceDetected(index) => {
                if self.phase == SyncPhase::Following {
                    warn!("divergence at leaf {}, reconciling", index);
                    self.phase = SyncPhase::Reconciling {
                        divergent_index: index,
                    };
                    self.reorgs += 1;
                    counter!("shoald_reorgs_total").increment(1);
                }
                Ok(())
            }
            SyncInput::FatalGap { expected, buffered } => {
                let err = ShoaldError::SyncGap { expected, buffered };
                self.halt(&err);
                Err(err)
            }
        }
    }

    pub fn ingest(&mut self, event: LedgerEvent) -> Result<Ingested> {
        if self.phase != SyncPhase::Following {
            return Ok(Ingested::Ignored);
        }
        self.canonical_hint = self.canonical_hint.max(event.index + 1);

        let leaf_count = self.mirror.leaf_count();
        if event.index < leaf_count {
            let applied = self.mirror.leaf(event.index);
            let same = applied
                .map(|r| r.commitment == event.commitment && r.root_after == event.new_root)
                .unwrap_or(false);
            if same {
                return Ok(Ingested::Duplicate);
            }
            self.handle(SyncInput::DivergenceDetected(event.index))?;
            return Ok(Ingested::Diverged { index: event.index });
        }

        if event.index > leaf_count {
            if self.pending.contains_key(&event.index) {
                return Ok(Ingested::Duplicate);
            }
            debug!(
                "buffering leaf {} (waiting for {}) from {}",
                event.index, leaf_count, event.position
            );
            self.pending.insert(event.index, event);
            self.gap_since.get_or_insert_with(Instant::now);
            return Ok(Ingested::Buffered);
        }

        let index = event.index;
        if !self.apply(&event)? {
            return Ok(Ingested::Diverged { index });
        }
        self.drain_pending()?;
        Ok(Ingested::Applied { index })
    }

    /// append one in-order event; false (and nothing kept) on a root mismatch
    fn apply(&mut self, event: &LedgerEvent) -> Result<bool> {
        let (index, root) = self.mirror.append_event(event)?;
        if root != event.new_root {
            warn!(
                "root mismatch at leaf {}: ledger {}, mirror {}",
                index, event.new_root, root
            );
            self.mirror.truncate(index)?;
            self.handle(SyncInput::DivergenceDetected(index))?;
            return Ok(false);
        }

        self.persist(index)?;
        counter!("shoald_events_applied_total").increment(1);
        gauge!("shoald_leaf_count").set((index + 1) as f64);
        Ok(true)
    }

    /// log leaf `index`; if the write fails the leaf is taken back out of the
    /// mirror, so the mirror never holds a leaf the log does not
    fn persist(&mut self, index: u64) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let Some(record) = self.mirror.leaf(index) else {
            return Ok(());
        };
        if let Err(e) = storage.put_leaf(index, &record) {
            error!("failed to log leaf {}: {}", index, e);
            self.mirror.truncate(index)?;
            return Err(e);
        }
        Ok(())
    }

    fn drain_pending(&mut self) -> Result<()> {
        loop {
            let next = self.mirror.leaf_count();
            let Some(event) = self.pending.remove(&next) else {
                break;
            };
            if !self.apply(&event)? {
                return Ok(());
            }
        }

        // anything still buffered is behind a new gap
        self.gap_since = if self.pending.is_empty() {
            None
        } else {
            Some(Instant::now())
        };
        Ok(())
    }

    /// halt if a gap has been open longer than `max_gap_wait`
    pub fn check_gap(&mut self, now: Instant) -> Result<()> {
        if self.phase != SyncPhase::Following {
            return Ok(());
        }
        let Some(since) = self.gap_since else {
            return Ok(());
        };
        if now.saturating_duration_since(since) < self.config.max_gap_wait {
            return Ok(());
        }

        let expected = self.mirror.leaf_count();
        let buffered = self.pending.keys().next_back().copied().unwrap_or(expected);
        self.handle(SyncInput::FatalGap { expected, buffered })
    }

    /// roll back to the last leaf the canonical events agree with and
    /// reapply the canonical suffix
    ///
    /// `canonical` is every insertion event of a contiguous block range ending
    /// at the scanned tip; `from_genesis` says the range starts at the first
    /// block that can hold leaves.
    pub fn reconcile(&mut self, canonical: &[LedgerEvent], from_genesis: bool) -> Result<Reconciled> {
        let SyncPhase::Reconciling { divergent_index } = self.phase else {
            return Err(ShoaldError::Validation("not reconciling".into()));
        };

        let mut canonical = canonical.to_vec();
        canonical.sort_by_key(|e| e.index);
        canonical.dedup_by_key(|e| e.index);

        let leaf_count = self.mirror.leaf_count();
        let agreement = canonical
            .iter()
            .rev()
            .filter(|e| e.index < leaf_count)
            .find(|e| {
                self.mirror
                    .leaf(e.index)
                    .map(|r| r.commitment == e.commitment && r.root_after == e.new_root)
                    .unwrap_or(false)
            })
            .map(|e| e.index + 1);

        let from_genesis = from_genesis || canonical.first().map(|e| e.index == 0).unwrap_or(false);
        let agreed = match agreement {
            Some(agreed) => agreed,
            None if from_genesis => 0,
            None => return Ok(Reconciled::NeedMoreHistory),
        };

        info!(
            "reconciling: divergence at {}, rolling back {} -> {} leaves",
            divergent_index, leaf_count, agreed
        );
        self.rollback(agreed)?;
        self.phase = SyncPhase::Following;

        for event in canonical.into_iter().filter(|e| e.index >= agreed) {
            let index = event.index;
            if index > self.mirror.leaf_count() {
                self.pending.insert(index, event);
                self.gap_since.get_or_insert_with(Instant::now);
                continue;
            }

            let (_, root) = self.mirror.append_event(&event)?;
            if root != event.new_root {
                self.mirror.truncate(index)?;
                let err = ShoaldError::RootMismatch {
                    index,
                    expected: event.new_root.to_hex(),
                    computed: root.to_hex(),
                };
                self.halt(&err);
                return Err(err);
            }
            if let Err(e) = self.persist(index) {
                // reconcile again on the next poll
                self.phase = SyncPhase::Reconciling {
                    divergent_index: index,
                };
                self.publish_status();
                return Err(e);
            }
            counter!("shoald_events_applied_total").increment(1);
        }
        gauge!("shoald_leaf_count").set(self.mirror.leaf_count() as f64);

        self.canonical_hint = self.mirror.leaf_count();
        self.publish_status();
        Ok(Reconciled::Recovered { agreed })
    }

    fn rollback(&mut self, leaf_count: u64) -> Result<()> {
        self.mirror.truncate(leaf_count)?;
        self.pending.clear();
        self.gap_since = None;

        if let Some(storage) = &self.storage {
            let fallback = Snapshot {
                leaf_count,
                root: self.mirror.get_root(),
                cursor: last_leaf_block(&self.mirror).unwrap_or(self.config.start_block),
            };
            storage.truncate(leaf_count, &fallback)?;
        }
        self.last_snapshot = self.last_snapshot.min(leaf_count);
        Ok(())
    }

    fn halt(&mut self, err: &ShoaldError) {
        let retryable = matches!(err, ShoaldError::LedgerUnreachable(_));
        error!("syncer halted (retryable: {}): {}", retryable, err);
        self.phase = SyncPhase::Halted {
            reason: err.to_string(),
            retryable,
        };
        self.publish_status();
    }

    /// unconfirmed events are never applied, they only tell the server how
    /// far behind the mirror is
    pub fn observe_unconfirmed(&mut self, events: &[LedgerEvent]) {
        if let Some(max) = events.iter().map(|e| e.index + 1).max() {
            self.canonical_hint = self.canonical_hint.max(max);
        }
    }

    fn snapshot_if_due(&mut self, force: bool) -> Result<()> {
        let leaf_count = self.mirror.leaf_count();
        let due = leaf_count.saturating_sub(self.last_snapshot) >= self.config.snapshot_interval;
        if !(due || force) {
            return Ok(());
        }
        let Some(storage) = &self.storage else {
            return Ok(());
        };

        let nodes = self.mirror.complete_nodes_between(self.last_snapshot, leaf_count)?;
        let snapshot = Snapshot {
            leaf_count,
            root: self.mirror.get_root(),
            cursor: self.cursor,
        };
        storage.write_snapshot(&snapshot, &nodes)?;
        self.last_snapshot = leaf_count;
        Ok(())
    }

    /// one fetch/apply round against `source`
    pub async fn poll<S: LedgerSource + ?Sized>(&mut self, source: &S) -> Result<()> {
        if let SyncPhase::Halted { retryable, .. } = &self.phase {
            if !*retryable {
                return Ok(());
            }
            self.resume(source).await?;
        }

        let head = self.with_retry("head", || source.head()).await?;
        self.head = head;
        self.check_gap(Instant::now())?;

        if self.phase == SyncPhase::Following {
            self.verify_tip(source).await?;
        }
        if let SyncPhase::Reconciling { .. } = self.phase {
            self.reconcile_from(source).await?;
        }

        let safe = head.saturating_sub(self.config.confirmations);
        self.canonical_hint = self.mirror.leaf_count();
        if let Some(&last) = self.pending.keys().next_back() {
            self.canonical_hint = self.canonical_hint.max(last + 1);
        }

        if self.cursor <= safe {
            let to = safe.min(self.cursor + self.config.max_blocks_per_fetch.max(1) - 1);
            let from = self.cursor;
            let events = self.with_retry("events", || source.events(from, to)).await?;

            for event in events {
                if let Ingested::Diverged { .. } = self.ingest(event)? {
                    break;
                }
            }

            if self.phase == SyncPhase::Following {
                self.cursor = if self.pending.is_empty() {
                    to + 1
                } else {
                    // do not scan past an event we have not applied yet
                    last_leaf_block(&self.mirror).unwrap_or(from).min(to + 1)
                };
            }
        }

        if self.config.confirmations > 0 && safe < head && self.phase == SyncPhase::Following {
            let from = (safe + 1).max(self.cursor);
            if from <= head {
                let unconfirmed = self.with_retry("events", || source.events(from, head)).await?;
                self.observe_unconfirmed(&unconfirmed);
            }
        }

        if self.phase == SyncPhase::Following {
            self.check_root(source).await?;
        }

        self.snapshot_if_due(false)?;
        self.publish_status();
        Ok(())
    }

    /// one head request against a ledger that was unreachable
    async fn resume<S: LedgerSource + ?Sized>(&mut self, source: &S) -> Result<()> {
        match source.head().await {
            Ok(head) => {
                info!("ledger reachable again at block {}, resuming", head);
                self.phase = SyncPhase::Following;
                // the outage does not count against an open gap
                if self.gap_since.is_some() {
                    self.gap_since = Some(Instant::now());
                }
                Ok(())
            }
            Err(e) => {
                debug!("ledger still unreachable: {}", e);
                Err(ShoaldError::LedgerUnreachable(e.to_string()))
            }
        }
    }

    /// the last applied leaf must still be where we found it; a ledger that
    /// reorganized onto a shorter branch emits no event that would contradict
    /// the mirror otherwise
    async fn verify_tip<S: LedgerSource + ?Sized>(&mut self, source: &S) -> Result<()> {
        let leaf_count = self.mirror.leaf_count();
        if leaf_count == 0 {
            return Ok(());
        }
        let index = leaf_count - 1;
        let Some(record) = self.mirror.leaf(index) else {
            return Ok(());
        };
        let Some(origin) = record.origin else {
            return Ok(());
        };

        let block = origin.position.block;
        let events = self.with_retry("events", || source.events(block, block)).await?;
        let present = events.iter().any(|e| {
            e.index == index && e.commitment == record.commitment && e.new_root == record.root_after
        });
        if !present {
            warn!("leaf {} is no longer in block {}", index, block);
            self.handle(SyncInput::DivergenceDetected(index))?;
        }
        Ok(())
    }

    /// ask the ledger whether it still accepts the mirror root
    async fn check_root<S: LedgerSource + ?Sized>(&mut self, source: &S) -> Result<()> {
        let root = self.mirror.get_root();
        let ledger_root = self.with_retry("root", || source.ledger_root()).await?;
        let known = if ledger_root == root {
            true
        } else {
            self.with_retry("root", || source.is_root_known(&root)).await?
        };

        let was_known = self.root_check.map(|c| c.known).unwrap_or(true);
        if !known && was_known {
            warn!(
                "ledger no longer accepts mirror root {} at {} leaves, refusing proofs",
                root,
                self.mirror.leaf_count()
            );
        }
        self.root_check = Some(RootCheck {
            root,
            ledger_root,
            known,
        });
        Ok(())
    }

    /// walk back from the scanned tip in `reorg_window_blocks` steps until
    /// the canonical events agree with the mirror somewhere
    async fn reconcile_from<S: LedgerSource + ?Sized>(&mut self, source: &S) -> Result<()> {
        let safe = self.head.saturating_sub(self.config.confirmations);
        let tip = self.cursor.saturating_sub(1).min(safe);
        let window = self.config.reorg_window_blocks.max(1);
        let mut from = tip.saturating_sub(window - 1).max(self.config.start_block);

        loop {
            let events = self.with_retry("events", || source.events(from, tip)).await?;
            let from_genesis = from <= self.config.start_block;

            match self.reconcile(&events, from_genesis)? {
                Reconciled::Recovered { agreed } => {
                    info!("reorg recovered at {} leaves, rescanning from block {}", agreed, tip + 1);
                    self.cursor = tip + 1;
                    return Ok(());
                }
                Reconciled::NeedMoreHistory => {
                    if tip.saturating_sub(from) >= self.config.max_reorg_depth {
                        let err = ShoaldError::ReorgTooDeep {
                            max_depth: self.config.max_reorg_depth,
                        };
                        self.halt(&err);
                        return Err(err);
                    }
                    from = from.saturating_sub(window).max(self.config.start_block);
                    debug!("no agreement yet, fetching back to block {}", from);
                }
            }
        }
    }

    async fn with_retry<T, F, Fut>(&mut self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.max_fetch_retries.max(1);
        let mut last_err = None;

        for attempt in 0..attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("{} fetch failed (attempt {}/{}): {}", what, attempt + 1, attempts, e);
                    last_err = Some(e);
                    if attempt + 1 < attempts {
                        // exponential backoff: base, 2x base, 4x base, ...
                        tokio::time::sleep(self.config.retry_base_delay * (1 << attempt.min(16))).await;
                    }
                }
            }
        }

        let reason = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts".into());
        let err = ShoaldError::LedgerUnreachable(reason);
        self.halt(&err);
        Err(err)
    }

    /// poll until `shutdown` flips; a halted syncer stays up so its status
    /// remains visible, and an unreachable ledger is retried with capped
    /// backoff
    pub async fn run<S: LedgerSource + ?Sized>(
        mut self,
        source: &S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("syncer started at block {}", self.cursor);
        let mut backoff = self.config.poll_interval;

        loop {
            if let Err(e) = self.poll(source).await {
                warn!("poll failed: {}", e);
            }

            let delay = match &self.phase {
                SyncPhase::Halted { retryable: true, .. } => {
                    let delay = backoff;
                    backoff = (backoff * 2).min(self.config.max_retry_delay);
                    delay
                }
                _ => {
                    backoff = self.config.poll_interval;
                    self.config.poll_interval
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }

        info!("syncer stopping at {} leaves", self.mirror.leaf_count());
        self.snapshot_if_due(true)?;
        if let Some(storage) = &self.storage {
            storage.flush()?;
        }
        Ok(())
    }
}

fn last_leaf_block(mirror: &TreeMirror) -> Option<u64> {
    let count = mirror.leaf_count();
    if count == 0 {
        return None;
    }
    mirror
        .leaf(count - 1)
        .and_then(|r| r.origin)
        .map(|o| o.position.block)
}
