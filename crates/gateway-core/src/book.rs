//! Per-symbol depth-synchronization engine.
//!
//! Fuses a one-shot REST snapshot with a live stream of incremental diffs
//! into a gap-free local book, following the exchange recipe
//! (https://developers.binance.com/docs/derivatives/usds-margined-futures/websocket-market-streams/How-to-manage-a-local-order-book-correctly):
//! buffer diffs while a snapshot is in flight, discard buffered events fully
//! covered by the snapshot, require the first applied event to straddle
//! `snapshot.last_update_id + 1`, then apply in order. A sequence gap after
//! sync moves the book back into a buffering state until the next snapshot
//! commit; the existing levels are kept so readers never see the book drop
//! to zero.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::{BOOK_IDLE_GRACE, MAX_BACKOFF_MS, MAX_BUFFER, MIN_BACKOFF_MS};
use crate::types::{BookLevel, DepthDiff, DepthSnapshot, PriceLevel};

/// Gap warnings for one symbol are throttled to this interval.
const GAP_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// Share of the buffer dropped (oldest first) when it overflows.
const OVERFLOW_DROP: usize = MAX_BUFFER / 10;

/// Externally visible synchronization state of one book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookState {
    /// No events received, no snapshot attempted.
    Init,
    /// A snapshot is in flight; diffs are buffering.
    Buffering,
    /// Seeded from a diff before any snapshot succeeded.
    Degraded,
    /// Snapshot fused, diffs applying in sequence.
    Synced,
    /// A gap was detected after sync; waiting for a new snapshot.
    Gapped,
}

/// What the engine did with one incoming diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Applied to the live book.
    Applied,
    /// Stored for replay after the pending snapshot.
    Buffered,
    /// Already covered by the current book; ignored.
    Dropped,
    /// First diff seeded an approximate book (no snapshot yet).
    Seeded,
    /// Sequence gap detected; diff buffered and a resync scheduled.
    Gapped,
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("snapshot for {symbol} has unparseable levels")]
    BadSnapshot { symbol: String },

    #[error(
        "first buffered event for {symbol} (U={first_update_id}) is ahead of \
         snapshot id {snapshot_id}"
    )]
    SnapshotTooOld {
        symbol: String,
        snapshot_id: u64,
        first_update_id: u64,
    },

    #[error(
        "gap inside buffered events for {symbol}: expected U <= {expected}, \
         got U={first_update_id}"
    )]
    GapInBuffer {
        symbol: String,
        expected: u64,
        first_update_id: u64,
    },
}

/// A local order book for one symbol.
///
/// Single-writer: all mutation goes through `BookManager`, which holds the
/// book behind a write lock. Reads observe a consistent snapshot of both
/// sides and `last_update_id`.
#[derive(Debug)]
pub struct LocalBook {
    symbol: String,

    /// Bid levels, iterated in reverse for best-first order.
    bids: BTreeMap<Decimal, Decimal>,

    /// Ask levels, naturally best-first.
    asks: BTreeMap<Decimal, Decimal>,

    last_update_id: u64,

    /// Pending diffs awaiting snapshot replay, capped at `MAX_BUFFER`.
    buffer: VecDeque<DepthDiff>,

    /// Initial sync completed at least once.
    synced: bool,

    /// A snapshot fetch is in progress.
    resync_in_flight: bool,

    /// A gap or initial state requires a new snapshot.
    needs_resync: bool,

    /// Book was seeded from a diff because no snapshot has succeeded yet.
    degraded: bool,

    /// Resync backoff, doubled on failure, reset on commit.
    backoff_ms: u64,

    last_resync_at: Option<Instant>,

    /// Book was referenced by the subscription union at this time.
    last_active: Instant,

    last_gap_log: Option<Instant>,

    seed_from_diff: bool,
}

impl LocalBook {
    pub fn new(symbol: String, seed_from_diff: bool) -> Self {
        Self {
            symbol,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            buffer: VecDeque::new(),
            synced: false,
            resync_in_flight: false,
            needs_resync: true,
            degraded: false,
            backoff_ms: MIN_BACKOFF_MS,
            last_resync_at: None,
            last_active: Instant::now(),
            last_gap_log: None,
            seed_from_diff,
        }
    }

    /// Feed one incremental diff through the state machine.
    pub fn on_diff(&mut self, diff: DepthDiff) -> DiffOutcome {
        if self.resync_in_flight {
            self.buffer_diff(diff);
            return DiffOutcome::Buffered;
        }

        if self.synced && !self.needs_resync {
            if !self.buffer.is_empty() {
                tracing::error!(
                    symbol = %self.symbol,
                    buffered = self.buffer.len(),
                    "invariant violation: non-empty buffer while synced"
                );
            }

            if diff.final_update_id <= self.last_update_id {
                return DiffOutcome::Dropped;
            }
            if diff.first_update_id <= self.last_update_id + 1 {
                self.apply_levels(&diff);
                self.last_update_id = diff.final_update_id;
                return DiffOutcome::Applied;
            }

            // Gap: U jumped past last_update_id + 1. Keep the book for
            // last-good readers, buffer from here and request a snapshot.
            self.log_gap(&diff);
            self.needs_resync = true;
            self.buffer_diff(diff);
            return DiffOutcome::Gapped;
        }

        if self.synced {
            // Gapped: hold post-gap diffs until the next snapshot commit.
            self.buffer_diff(diff);
            return DiffOutcome::Buffered;
        }

        if self.degraded {
            if diff.final_update_id > self.last_update_id {
                self.apply_levels(&diff);
                self.last_update_id = diff.final_update_id;
                return DiffOutcome::Applied;
            }
            return DiffOutcome::Dropped;
        }

        // Init: either seed an approximate book so consumers can compute
        // non-absolute metrics while snapshots recover, or plain-buffer.
        if self.seed_from_diff {
            self.apply_levels(&diff);
            self.last_update_id = diff.final_update_id;
            self.degraded = true;
            tracing::info!(
                symbol = %self.symbol,
                last_update_id = self.last_update_id,
                "book seeded from diff (degraded until first snapshot)"
            );
            return DiffOutcome::Seeded;
        }

        self.buffer_diff(diff);
        DiffOutcome::Buffered
    }

    /// Mark a snapshot fetch as started; diffs buffer until it resolves.
    pub fn begin_resync(&mut self) {
        self.resync_in_flight = true;
        self.last_resync_at = Some(Instant::now());
    }

    /// A snapshot fetch failed before producing a payload. Stays in the
    /// previous state, doubles the resync backoff.
    pub fn fail_resync(&mut self) {
        self.resync_in_flight = false;
        self.backoff_ms = (self.backoff_ms * 2).min(MAX_BACKOFF_MS);
    }

    /// Fuse a successful snapshot with the buffered diffs.
    ///
    /// Returns the number of replayed buffered events, or an error when the
    /// buffer cannot be stitched to the snapshot; in that case the buffer is
    /// cleared, the backoff doubled, and the previous book content kept for
    /// last-good readers.
    pub fn commit_snapshot(&mut self, snapshot: &DepthSnapshot) -> Result<usize, ReplayError> {
        let (snap_bids, snap_asks) = match (
            DepthSnapshot::parse_side(&snapshot.bids),
            DepthSnapshot::parse_side(&snapshot.asks),
        ) {
            (Some(bids), Some(asks)) => (bids, asks),
            _ => {
                self.abort_replay();
                return Err(ReplayError::BadSnapshot {
                    symbol: self.symbol.clone(),
                });
            }
        };

        let mut bids = BTreeMap::new();
        for level in &snap_bids {
            if level.quantity > Decimal::ZERO {
                bids.insert(level.price, level.quantity);
            }
        }
        let mut asks = BTreeMap::new();
        for level in &snap_asks {
            if level.quantity > Decimal::ZERO {
                asks.insert(level.price, level.quantity);
            }
        }

        let mut last_update_id = snapshot.last_update_id;

        let mut events: Vec<DepthDiff> = self.buffer.drain(..).collect();
        events.sort_by_key(|event| event.final_update_id);
        events.retain(|event| event.final_update_id > snapshot.last_update_id);

        let mut replayed = 0usize;
        if let Some(first) = events.first() {
            // The first surviving event must straddle snapshot_id + 1;
            // anything later means updates were lost between snapshot and
            // buffer and the snapshot must be refetched.
            if first.first_update_id > snapshot.last_update_id + 1 {
                let first_update_id = first.first_update_id;
                self.abort_replay();
                return Err(ReplayError::SnapshotTooOld {
                    symbol: self.symbol.clone(),
                    snapshot_id: snapshot.last_update_id,
                    first_update_id,
                });
            }

            for event in &events {
                if event.first_update_id > last_update_id + 1
                    || event.final_update_id <= last_update_id
                {
                    let first_update_id = event.first_update_id;
                    let expected = last_update_id + 1;
                    self.abort_replay();
                    return Err(ReplayError::GapInBuffer {
                        symbol: self.symbol.clone(),
                        expected,
                        first_update_id,
                    });
                }
                Self::apply_levels_to(&mut bids, &event.bids);
                Self::apply_levels_to(&mut asks, &event.asks);
                last_update_id = event.final_update_id;
                replayed += 1;
            }
        }

        self.bids = bids;
        self.asks = asks;
        self.last_update_id = last_update_id;
        self.synced = true;
        self.needs_resync = false;
        self.degraded = false;
        self.resync_in_flight = false;
        self.backoff_ms = MIN_BACKOFF_MS;

        tracing::info!(
            symbol = %self.symbol,
            last_update_id,
            replayed,
            bid_levels = self.bids.len(),
            ask_levels = self.asks.len(),
            "snapshot committed"
        );
        Ok(replayed)
    }

    /// Top `depth` levels per side with cumulative sizes. Bids descend,
    /// asks ascend; cumulative sums run from the best level outward.
    pub fn top_levels(&self, depth: usize) -> (Vec<BookLevel>, Vec<BookLevel>) {
        let mut bid_cum = Decimal::ZERO;
        let bids = self
            .bids
            .iter()
            .rev()
            .take(depth)
            .map(|(price, size)| {
                bid_cum += *size;
                BookLevel {
                    price: *price,
                    size: *size,
                    cumulative_size: bid_cum,
                }
            })
            .collect();

        let mut ask_cum = Decimal::ZERO;
        let asks = self
            .asks
            .iter()
            .take(depth)
            .map(|(price, size)| {
                ask_cum += *size;
                BookLevel {
                    price: *price,
                    size: *size,
                    cumulative_size: ask_cum,
                }
            })
            .collect();

        (bids, asks)
    }

    /// Contract with downstream consumers: the book may be used for
    /// absolute metrics only when synced, not mid-resync, and not crossed.
    pub fn is_valid(&self) -> bool {
        if !self.synced || self.resync_in_flight {
            return false;
        }
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => {
                bid > Decimal::ZERO && ask > Decimal::ZERO && bid < ask
            }
            _ => false,
        }
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    pub fn resync_in_flight(&self) -> bool {
        self.resync_in_flight
    }

    pub fn backoff_ms(&self) -> u64 {
        self.backoff_ms
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Eligible for a scheduler dispatch: needs a snapshot, none in flight,
    /// and the backoff window since the last attempt has elapsed.
    pub fn resync_due(&self) -> bool {
        if !self.needs_resync || self.resync_in_flight {
            return false;
        }
        match self.last_resync_at {
            Some(at) => at.elapsed() >= Duration::from_millis(self.backoff_ms),
            None => true,
        }
    }

    pub fn state(&self) -> BookState {
        if self.resync_in_flight {
            BookState::Buffering
        } else if self.synced && !self.needs_resync {
            BookState::Synced
        } else if self.synced {
            BookState::Gapped
        } else if self.degraded {
            BookState::Degraded
        } else {
            BookState::Init
        }
    }

    fn mark_active(&mut self) {
        self.last_active = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    fn buffer_diff(&mut self, diff: DepthDiff) {
        if self.buffer.len() >= MAX_BUFFER {
            // Sustained overflow means the scheduler is not making
            // progress; surface it and keep the newest events.
            self.buffer.drain(..OVERFLOW_DROP);
            tracing::warn!(
                symbol = %self.symbol,
                dropped = OVERFLOW_DROP,
                "diff buffer overflow, dropped oldest events"
            );
        }
        self.buffer.push_back(diff);
    }

    fn apply_levels(&mut self, diff: &DepthDiff) {
        Self::apply_levels_to(&mut self.bids, &diff.bids);
        Self::apply_levels_to(&mut self.asks, &diff.asks);
    }

    fn apply_levels_to(side: &mut BTreeMap<Decimal, Decimal>, levels: &[PriceLevel]) {
        for level in levels {
            if level.quantity == Decimal::ZERO {
                side.remove(&level.price);
            } else {
                side.insert(level.price, level.quantity);
            }
        }
    }

    fn abort_replay(&mut self) {
        self.buffer.clear();
        self.resync_in_flight = false;
        self.needs_resync = true;
        self.backoff_ms = (self.backoff_ms * 2).min(MAX_BACKOFF_MS);
    }

    fn log_gap(&mut self, diff: &DepthDiff) {
        let due = self
            .last_gap_log
            .map(|at| at.elapsed() >= GAP_LOG_INTERVAL)
            .unwrap_or(true);
        if due {
            tracing::warn!(
                symbol = %self.symbol,
                expected = self.last_update_id + 1,
                first_update_id = diff.first_update_id,
                final_update_id = diff.final_update_id,
                "depth sequence gap, scheduling resync"
            );
            self.last_gap_log = Some(Instant::now());
        }
    }
}

/// Counters for manager-level diagnostics.
#[derive(Debug, Default)]
struct ManagerStats {
    applied: AtomicU64,
    buffered: AtomicU64,
    dropped: AtomicU64,
    gaps: AtomicU64,
}

/// Point-in-time view of the manager counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookStats {
    pub applied: u64,
    pub buffered: u64,
    pub dropped: u64,
    pub gaps: u64,
}

/// Holds one `LocalBook` per symbol, created lazily on first reference.
///
/// All mutation happens under the write lock, which serializes diff-apply
/// and snapshot-commit per symbol as the engine requires.
pub struct BookManager {
    books: RwLock<HashMap<String, LocalBook>>,
    seed_from_diff: bool,
    stats: ManagerStats,
}

impl BookManager {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            seed_from_diff: true,
            stats: ManagerStats::default(),
        }
    }

    pub fn with_seed_policy(seed_from_diff: bool) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            seed_from_diff,
            stats: ManagerStats::default(),
        }
    }

    /// Route a diff to its symbol's book, creating the book if needed.
    pub async fn on_diff(&self, diff: DepthDiff) -> DiffOutcome {
        let mut books = self.books.write().await;
        let book = books
            .entry(diff.symbol.clone())
            .or_insert_with(|| LocalBook::new(diff.symbol.clone(), self.seed_from_diff));
        let outcome = book.on_diff(diff);
        match outcome {
            DiffOutcome::Applied | DiffOutcome::Seeded => {
                self.stats.applied.fetch_add(1, Ordering::Relaxed);
            }
            DiffOutcome::Buffered => {
                self.stats.buffered.fetch_add(1, Ordering::Relaxed);
            }
            DiffOutcome::Dropped => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
            DiffOutcome::Gapped => {
                self.stats.gaps.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    /// Symbols whose books are due for a snapshot attempt.
    pub async fn resync_due(&self) -> Vec<String> {
        let books = self.books.read().await;
        books
            .values()
            .filter(|book| book.resync_due())
            .map(|book| book.symbol().to_string())
            .collect()
    }

    /// Mark a snapshot fetch as started. Returns false if the symbol has no
    /// book or one is already in flight.
    pub async fn begin_resync(&self, symbol: &str) -> bool {
        let mut books = self.books.write().await;
        match books.get_mut(symbol) {
            Some(book) if !book.resync_in_flight() => {
                book.begin_resync();
                true
            }
            _ => false,
        }
    }

    pub async fn commit_snapshot(
        &self,
        symbol: &str,
        snapshot: &DepthSnapshot,
    ) -> Option<Result<usize, ReplayError>> {
        let mut books = self.books.write().await;
        books.get_mut(symbol).map(|book| book.commit_snapshot(snapshot))
    }

    pub async fn fail_resync(&self, symbol: &str) {
        let mut books = self.books.write().await;
        if let Some(book) = books.get_mut(symbol) {
            book.fail_resync();
        }
    }

    /// Ensure books exist for every subscribed symbol and refresh their
    /// activity stamps.
    pub async fn sync_symbols(&self, symbols: &HashSet<String>) {
        let mut books = self.books.write().await;
        for symbol in symbols {
            books
                .entry(symbol.clone())
                .or_insert_with(|| LocalBook::new(symbol.clone(), self.seed_from_diff))
                .mark_active();
        }
    }

    /// Drop books that left the subscription union longer than the grace
    /// period ago.
    pub async fn prune_idle(&self, active: &HashSet<String>) {
        let mut books = self.books.write().await;
        books.retain(|symbol, book| {
            if active.contains(symbol) {
                book.mark_active();
                return true;
            }
            if book.idle_for() < BOOK_IDLE_GRACE {
                return true;
            }
            tracing::info!(symbol, "dropping idle book");
            false
        });
    }

    pub async fn top_levels(
        &self,
        symbol: &str,
        depth: usize,
    ) -> Option<(Vec<BookLevel>, Vec<BookLevel>)> {
        let books = self.books.read().await;
        books.get(symbol).map(|book| book.top_levels(depth))
    }

    pub async fn is_valid(&self, symbol: &str) -> bool {
        let books = self.books.read().await;
        books.get(symbol).map(|book| book.is_valid()).unwrap_or(false)
    }

    pub async fn state(&self, symbol: &str) -> Option<BookState> {
        let books = self.books.read().await;
        books.get(symbol).map(|book| book.state())
    }

    pub async fn symbols(&self) -> Vec<String> {
        let books = self.books.read().await;
        books.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.books.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.books.read().await.is_empty()
    }

    pub fn stats(&self) -> BookStats {
        BookStats {
            applied: self.stats.applied.load(Ordering::Relaxed),
            buffered: self.stats.buffered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            gaps: self.stats.gaps.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn diff(first: u64, last: u64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> DepthDiff {
        DepthDiff {
            symbol: "BTCUSDT".to_string(),
            first_update_id: first,
            final_update_id: last,
            bids: bids
                .iter()
                .map(|(p, q)| PriceLevel::from_pair(p, q).unwrap())
                .collect(),
            asks: asks
                .iter()
                .map(|(p, q)| PriceLevel::from_pair(p, q).unwrap())
                .collect(),
            event_time: 0,
        }
    }

    fn snapshot(last_update_id: u64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> DepthSnapshot {
        DepthSnapshot {
            symbol: "BTCUSDT".to_string(),
            last_update_id,
            bids: bids
                .iter()
                .map(|(p, q)| (p.to_string(), q.to_string()))
                .collect(),
            asks: asks
                .iter()
                .map(|(p, q)| (p.to_string(), q.to_string()))
                .collect(),
            cached_at: Utc::now(),
        }
    }

    fn buffering_book() -> LocalBook {
        let mut book = LocalBook::new("BTCUSDT".to_string(), false);
        book.begin_resync();
        book
    }

    #[test]
    fn test_clean_sync() {
        let mut book = buffering_book();
        assert_eq!(book.state(), BookState::Buffering);

        book.commit_snapshot(&snapshot(100, &[("10", "1")], &[("11", "1")]))
            .unwrap();
        assert_eq!(book.state(), BookState::Synced);

        assert_eq!(
            book.on_diff(diff(101, 101, &[("10", "2")], &[])),
            DiffOutcome::Applied
        );
        assert_eq!(
            book.on_diff(diff(102, 102, &[], &[("11", "0")])),
            DiffOutcome::Applied
        );

        assert_eq!(book.last_update_id(), 102);
        let (bids, asks) = book.top_levels(10);
        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].price, dec!(10));
        assert_eq!(bids[0].size, dec!(2));
        assert!(asks.is_empty());
    }

    #[test]
    fn test_buffered_replay_discards_stale_and_straddles() {
        let mut book = buffering_book();
        book.on_diff(diff(99, 99, &[("9", "5")], &[]));
        book.on_diff(diff(101, 101, &[("10", "2")], &[]));
        book.on_diff(diff(102, 102, &[], &[("11", "3")]));

        let replayed = book
            .commit_snapshot(&snapshot(100, &[("10", "1")], &[("11", "1")]))
            .unwrap();

        // u=99 discarded; 101 straddles 101; 102 follows.
        assert_eq!(replayed, 2);
        assert_eq!(book.last_update_id(), 102);
        assert_eq!(book.state(), BookState::Synced);
        let (bids, _) = book.top_levels(10);
        // Stale event's level never applied.
        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].price, dec!(10));
    }

    #[test]
    fn test_replay_fails_when_buffer_is_ahead_of_snapshot() {
        let mut book = buffering_book();
        book.on_diff(diff(205, 206, &[("10", "2")], &[]));

        let err = book
            .commit_snapshot(&snapshot(200, &[("10", "1")], &[("11", "1")]))
            .unwrap_err();
        assert!(matches!(err, ReplayError::SnapshotTooOld { .. }));

        assert_eq!(book.buffered(), 0);
        assert!(book.needs_resync());
        assert!(!book.resync_in_flight());
        assert_eq!(book.backoff_ms(), 2 * MIN_BACKOFF_MS);
    }

    #[test]
    fn test_replay_with_fully_stale_buffer_equals_snapshot() {
        let mut book = buffering_book();
        book.on_diff(diff(95, 95, &[("9", "9")], &[]));
        book.on_diff(diff(96, 96, &[("9.5", "9")], &[]));
        book.on_diff(diff(97, 97, &[], &[("12", "9")]));

        let replayed = book
            .commit_snapshot(&snapshot(200, &[("10", "1")], &[("11", "1")]))
            .unwrap();

        assert_eq!(replayed, 0);
        assert_eq!(book.last_update_id(), 200);
        let (bids, asks) = book.top_levels(10);
        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].price, dec!(10));
        assert_eq!(asks.len(), 1);
        assert_eq!(asks[0].price, dec!(11));
    }

    #[test]
    fn test_gap_inside_buffer_fails_replay() {
        let mut book = buffering_book();
        book.on_diff(diff(101, 101, &[("10", "2")], &[]));
        book.on_diff(diff(105, 106, &[("10", "3")], &[]));

        let err = book
            .commit_snapshot(&snapshot(100, &[("10", "1")], &[("11", "1")]))
            .unwrap_err();
        assert!(matches!(err, ReplayError::GapInBuffer { .. }));
        assert!(book.needs_resync());
    }

    #[test]
    fn test_gap_after_sync() {
        let mut book = buffering_book();
        book.commit_snapshot(&snapshot(500, &[("10", "1")], &[("11", "1")]))
            .unwrap();

        assert_eq!(
            book.on_diff(diff(503, 504, &[("10", "2")], &[])),
            DiffOutcome::Gapped
        );
        assert_eq!(book.state(), BookState::Gapped);
        assert!(book.needs_resync());
        assert_eq!(book.buffered(), 1);

        // Subsequent diffs keep buffering until the next snapshot.
        assert_eq!(
            book.on_diff(diff(505, 505, &[], &[])),
            DiffOutcome::Buffered
        );

        // Existing levels are retained for last-good readers.
        let (bids, _) = book.top_levels(10);
        assert_eq!(bids.len(), 1);

        // Re-fuse: snapshot covering the gap, buffer replays.
        book.begin_resync();
        let replayed = book
            .commit_snapshot(&snapshot(502, &[("10", "5")], &[("11", "5")]))
            .unwrap();
        assert_eq!(replayed, 2);
        assert_eq!(book.last_update_id(), 505);
        assert_eq!(book.state(), BookState::Synced);
    }

    #[test]
    fn test_duplicate_diff_is_dropped() {
        let mut book = buffering_book();
        book.commit_snapshot(&snapshot(100, &[("10", "1")], &[("11", "1")]))
            .unwrap();

        let event = diff(101, 101, &[("10", "7")], &[]);
        assert_eq!(book.on_diff(event.clone()), DiffOutcome::Applied);
        let (bids_before, asks_before) = book.top_levels(10);

        // Re-applying the same diff is a no-op.
        assert_eq!(book.on_diff(event), DiffOutcome::Dropped);
        let (bids_after, asks_after) = book.top_levels(10);
        assert_eq!(bids_before, bids_after);
        assert_eq!(asks_before, asks_after);
        assert_eq!(book.last_update_id(), 101);
    }

    #[test]
    fn test_overlapping_diff_applies() {
        let mut book = buffering_book();
        book.commit_snapshot(&snapshot(100, &[("10", "1")], &[("11", "1")]))
            .unwrap();

        // U <= last+1 <= u: overlap around the snapshot boundary applies.
        assert_eq!(
            book.on_diff(diff(99, 103, &[("10", "4")], &[])),
            DiffOutcome::Applied
        );
        assert_eq!(book.last_update_id(), 103);
    }

    #[test]
    fn test_degraded_seeding_and_recovery() {
        let mut book = LocalBook::new("BTCUSDT".to_string(), true);

        assert_eq!(
            book.on_diff(diff(50, 52, &[("10", "1")], &[("11", "2")])),
            DiffOutcome::Seeded
        );
        assert_eq!(book.state(), BookState::Degraded);
        assert!(book.needs_resync());
        assert!(!book.is_valid());
        assert_eq!(book.last_update_id(), 52);

        // Degraded books keep applying forward diffs.
        assert_eq!(
            book.on_diff(diff(53, 54, &[("10", "3")], &[])),
            DiffOutcome::Applied
        );
        assert_eq!(
            book.on_diff(diff(40, 41, &[], &[])),
            DiffOutcome::Dropped
        );

        // The next successful snapshot supersedes the seeded book entirely.
        book.begin_resync();
        book.commit_snapshot(&snapshot(100, &[("20", "1")], &[("21", "1")]))
            .unwrap();
        assert_eq!(book.state(), BookState::Synced);
        assert!(book.is_valid());
        let (bids, _) = book.top_levels(10);
        assert_eq!(bids[0].price, dec!(20));
    }

    #[test]
    fn test_buffer_overflow_drops_oldest_tenth() {
        let mut book = buffering_book();
        for i in 0..MAX_BUFFER as u64 {
            book.on_diff(diff(i + 1, i + 1, &[], &[]));
        }
        assert_eq!(book.buffered(), MAX_BUFFER);

        // Next insert drops the oldest 10% and appends.
        book.on_diff(diff(9_001, 9_001, &[], &[]));
        assert_eq!(book.buffered(), MAX_BUFFER - OVERFLOW_DROP + 1);
    }

    #[test]
    fn test_validity_gate_rejects_crossed_book() {
        let mut book = buffering_book();
        book.commit_snapshot(&snapshot(100, &[("12", "1")], &[("11", "1")]))
            .unwrap();
        // Crossed: best bid 12 >= best ask 11.
        assert!(!book.is_valid());

        let mut healthy = buffering_book();
        healthy
            .commit_snapshot(&snapshot(100, &[("10", "1")], &[("11", "1")]))
            .unwrap();
        assert!(healthy.is_valid());
    }

    #[test]
    fn test_validity_gate_requires_both_sides() {
        let mut book = buffering_book();
        book.commit_snapshot(&snapshot(100, &[("10", "1")], &[]))
            .unwrap();
        assert!(!book.is_valid());
    }

    #[test]
    fn test_no_zero_quantity_levels_after_replay() {
        let mut book = buffering_book();
        book.on_diff(diff(101, 101, &[("10", "0"), ("9", "4")], &[]));
        book.commit_snapshot(&snapshot(100, &[("10", "1")], &[("11", "1")]))
            .unwrap();

        let (bids, _) = book.top_levels(10);
        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].price, dec!(9));
    }

    #[test]
    fn test_cumulative_sizes() {
        let mut book = buffering_book();
        book.commit_snapshot(&snapshot(
            100,
            &[("10", "1"), ("9", "2"), ("8", "3")],
            &[("11", "4"), ("12", "5")],
        ))
        .unwrap();

        let (bids, asks) = book.top_levels(2);
        assert_eq!(bids.len(), 2);
        assert_eq!(bids[0].price, dec!(10));
        assert_eq!(bids[0].cumulative_size, dec!(1));
        assert_eq!(bids[1].price, dec!(9));
        assert_eq!(bids[1].cumulative_size, dec!(3));

        assert_eq!(asks[0].price, dec!(11));
        assert_eq!(asks[0].cumulative_size, dec!(4));
        assert_eq!(asks[1].cumulative_size, dec!(9));
    }

    #[test]
    fn test_fail_resync_backoff_doubles_and_caps() {
        let mut book = LocalBook::new("BTCUSDT".to_string(), false);
        assert!(book.resync_due());

        for _ in 0..10 {
            book.begin_resync();
            book.fail_resync();
        }
        assert_eq!(book.backoff_ms(), MAX_BACKOFF_MS);
        // Just attempted: not due until the backoff elapses.
        assert!(!book.resync_due());
    }

    #[test]
    fn test_price_format_identity() {
        let mut book = buffering_book();
        book.commit_snapshot(&snapshot(100, &[("10.0", "1")], &[("11", "1")]))
            .unwrap();

        // "10" and "10.0" address the same level, so the delete lands.
        book.on_diff(diff(101, 101, &[("10", "0")], &[]));
        let (bids, _) = book.top_levels(10);
        assert!(bids.is_empty());
    }

    #[tokio::test]
    async fn test_manager_creates_books_lazily() {
        let manager = BookManager::new();
        assert!(manager.is_empty().await);

        manager.on_diff(diff(10, 11, &[("10", "1")], &[])).await;
        assert_eq!(manager.len().await, 1);
        assert_eq!(
            manager.state("BTCUSDT").await,
            Some(BookState::Degraded)
        );
    }

    #[tokio::test]
    async fn test_manager_resync_cycle() {
        let manager = BookManager::with_seed_policy(false);
        manager.on_diff(diff(101, 101, &[("10", "2")], &[])).await;

        let due = manager.resync_due().await;
        assert_eq!(due, vec!["BTCUSDT".to_string()]);

        assert!(manager.begin_resync("BTCUSDT").await);
        // Already in flight: a second begin is refused.
        assert!(!manager.begin_resync("BTCUSDT").await);

        let replayed = manager
            .commit_snapshot("BTCUSDT", &snapshot(100, &[("10", "1")], &[("11", "1")]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replayed, 1);
        assert!(manager.is_valid("BTCUSDT").await);
        assert!(manager.resync_due().await.is_empty());
    }

    #[tokio::test]
    async fn test_manager_prunes_only_idle_books() {
        let manager = BookManager::new();
        let mut active = HashSet::new();
        active.insert("BTCUSDT".to_string());
        manager.sync_symbols(&active).await;
        manager
            .on_diff(DepthDiff {
                symbol: "ETHUSDT".to_string(),
                first_update_id: 1,
                final_update_id: 1,
                bids: vec![],
                asks: vec![],
                event_time: 0,
            })
            .await;
        assert_eq!(manager.len().await, 2);

        // ETHUSDT is not in the union but still inside the grace period.
        manager.prune_idle(&active).await;
        assert_eq!(manager.len().await, 2);
    }
}
