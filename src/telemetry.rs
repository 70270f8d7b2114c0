// =============================================================================
// Telemetry Store — bounded rolling pool state
// =============================================================================
//
// Per-pool ring buffers of hydrated snapshots and swap events. Memory is
// hard-capped: short windows (the metrics layer uses finite differences and
// small rolling windows), a bounded pool count with least-recently-inserted
// eviction, and a same-pool throttle so over-eager hydration cannot flood a
// buffer. All reads return owned copies so no lock is held by callers.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Snapshot window length per pool (minimum for slope estimation).
pub const H_SNAP: usize = 3;
/// Swap-event window length per pool.
pub const H_SWAP: usize = 10;
/// Upper bound on tracked pools; exceeding it evicts the least-recently
/// inserted pool.
pub const MAX_POOLS: usize = 15;
/// Same-pool snapshots closer together than this are silently ignored.
pub const SNAP_MIN_INTERVAL_SECS: i64 = 8;

/// One hydrated observation of a pool's on-chain state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub pool: String,
    pub active_bin: i32,
    pub bin_step: u32,
    /// Total pool liquidity in USD. Snapshots with a non-positive value are
    /// rejected at the door.
    pub liquidity_usd: f64,
    pub inventory_base: f64,
    pub inventory_quote: f64,
    pub fee_rate_bps: u32,
    /// Raw velocity reading supplied by the hydration path.
    pub velocity: f64,
    /// Trades observed since the previous poll.
    pub recent_trades: u32,
    pub fetched_at: DateTime<Utc>,
}

/// Direction of a swap through the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapDirection {
    BaseToQuote,
    QuoteToBase,
}

/// A single swap observed against a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapEvent {
    pub pool: String,
    pub amount_in: f64,
    pub amount_out: f64,
    pub bin_before: i32,
    pub bin_after: i32,
    pub fee_paid: f64,
    pub ts: DateTime<Utc>,
    pub direction: SwapDirection,
}

struct PoolBuffers {
    snapshots: VecDeque<PoolSnapshot>,
    swaps: VecDeque<SwapEvent>,
    /// Monotone sequence stamped at first insertion, used for eviction order.
    inserted_seq: u64,
}

impl PoolBuffers {
    fn new(seq: u64) -> Self {
        Self {
            snapshots: VecDeque::with_capacity(H_SNAP + 1),
            swaps: VecDeque::with_capacity(H_SWAP + 1),
            inserted_seq: seq,
        }
    }
}

struct Inner {
    pools: HashMap<String, PoolBuffers>,
    insert_seq: u64,
}

/// Thread-safe bounded telemetry store.
pub struct TelemetryStore {
    inner: RwLock<Inner>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                pools: HashMap::new(),
                insert_seq: 0,
            }),
        }
    }

    /// Record a snapshot. Returns `true` if it was accepted.
    ///
    /// Rejection rules:
    /// * `liquidity_usd <= 0` — rejected with a warning.
    /// * `fetched_at` not strictly after the previous snapshot — rejected.
    /// * within [`SNAP_MIN_INTERVAL_SECS`] of the previous snapshot —
    ///   silently ignored (throttle).
    pub fn record_snapshot(&self, snapshot: PoolSnapshot) -> bool {
        if snapshot.liquidity_usd <= 0.0 {
            warn!(
                pool = %snapshot.pool,
                liquidity_usd = snapshot.liquidity_usd,
                "[TELEMETRY] rejecting snapshot with non-positive liquidity"
            );
            return false;
        }

        let mut inner = self.inner.write();
        let buffers = Self::ensure_pool(&mut inner, &snapshot.pool);

        if let Some(last) = buffers.snapshots.back() {
            let delta = snapshot
                .fetched_at
                .signed_duration_since(last.fetched_at);
            if delta.num_milliseconds() <= 0 {
                warn!(
                    pool = %snapshot.pool,
                    last = %last.fetched_at,
                    incoming = %snapshot.fetched_at,
                    "[TELEMETRY] rejecting non-monotone snapshot timestamp"
                );
                return false;
            }
            if delta.num_seconds() < SNAP_MIN_INTERVAL_SECS {
                debug!(
                    pool = %snapshot.pool,
                    delta_s = delta.num_seconds(),
                    "[TELEMETRY] snapshot throttled"
                );
                return false;
            }
        }

        buffers.snapshots.push_back(snapshot);
        while buffers.snapshots.len() > H_SNAP {
            buffers.snapshots.pop_front();
        }
        true
    }

    /// Record a swap event for its pool.
    pub fn record_swap(&self, event: SwapEvent) {
        let mut inner = self.inner.write();
        let buffers = Self::ensure_pool(&mut inner, &event.pool);
        buffers.swaps.push_back(event);
        while buffers.swaps.len() > H_SWAP {
            buffers.swaps.pop_front();
        }
    }

    /// Copy of a pool's snapshot window, oldest first.
    pub fn snapshots(&self, pool: &str) -> Vec<PoolSnapshot> {
        self.inner
            .read()
            .pools
            .get(pool)
            .map(|b| b.snapshots.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Copy of a pool's swap window, oldest first.
    pub fn swaps(&self, pool: &str) -> Vec<SwapEvent> {
        self.inner
            .read()
            .pools
            .get(pool)
            .map(|b| b.swaps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Latest snapshot for a pool, if any.
    pub fn latest_snapshot(&self, pool: &str) -> Option<PoolSnapshot> {
        self.inner
            .read()
            .pools
            .get(pool)
            .and_then(|b| b.snapshots.back().cloned())
    }

    /// Drop buffers for every pool not in `active`.
    pub fn prune_inactive(&self, active: &HashSet<String>) {
        let mut inner = self.inner.write();
        let before = inner.pools.len();
        inner.pools.retain(|pool, _| active.contains(pool));
        let dropped = before - inner.pools.len();
        if dropped > 0 {
            info!(dropped, remaining = inner.pools.len(), "[TELEMETRY] pruned inactive pools");
        }
    }

    /// Addresses of all currently tracked pools.
    pub fn tracked_pools(&self) -> Vec<String> {
        self.inner.read().pools.keys().cloned().collect()
    }

    fn ensure_pool<'a>(inner: &'a mut Inner, pool: &str) -> &'a mut PoolBuffers {
        if !inner.pools.contains_key(pool) {
            // Enforce the pool cap before inserting a new entry.
            if inner.pools.len() >= MAX_POOLS {
                if let Some(victim) = inner
                    .pools
                    .iter()
                    .min_by_key(|(_, b)| b.inserted_seq)
                    .map(|(k, _)| k.clone())
                {
                    inner.pools.remove(&victim);
                    info!(
                        evicted = %victim,
                        inserted = %pool,
                        cap = MAX_POOLS,
                        "[TELEMETRY] pool cap reached — evicted least-recently-inserted pool"
                    );
                }
            }
            inner.insert_seq += 1;
        }
        let seq = inner.insert_seq;
        inner
            .pools
            .entry(pool.to_string())
            .or_insert_with(|| PoolBuffers::new(seq))
    }
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn snap(pool: &str, at: DateTime<Utc>, liq: f64, bin: i32) -> PoolSnapshot {
        PoolSnapshot {
            pool: pool.to_string(),
            active_bin: bin,
            bin_step: 25,
            liquidity_usd: liq,
            inventory_base: 100.0,
            inventory_quote: 100.0,
            fee_rate_bps: 30,
            velocity: 0.0,
            recent_trades: 4,
            fetched_at: at,
        }
    }

    fn swap(pool: &str, at: DateTime<Utc>) -> SwapEvent {
        SwapEvent {
            pool: pool.to_string(),
            amount_in: 10.0,
            amount_out: 9.9,
            bin_before: 0,
            bin_after: 1,
            fee_paid: 0.03,
            ts: at,
            direction: SwapDirection::BaseToQuote,
        }
    }

    #[test]
    fn snapshot_window_is_bounded() {
        let store = TelemetryStore::new();
        let t0 = Utc::now();
        for i in 0..6 {
            assert!(store.record_snapshot(snap("p", t0 + Duration::seconds(10 * i), 1000.0, i as i32)));
        }
        let window = store.snapshots("p");
        assert_eq!(window.len(), H_SNAP);
        // Oldest entries were dropped; the newest survives.
        assert_eq!(window.last().unwrap().active_bin, 5);
    }

    #[test]
    fn rejects_non_positive_liquidity() {
        let store = TelemetryStore::new();
        assert!(!store.record_snapshot(snap("p", Utc::now(), 0.0, 0)));
        assert!(store.snapshots("p").is_empty());
    }

    #[test]
    fn rejects_non_monotone_timestamps() {
        let store = TelemetryStore::new();
        let t0 = Utc::now();
        assert!(store.record_snapshot(snap("p", t0, 1000.0, 0)));
        assert!(!store.record_snapshot(snap("p", t0, 1000.0, 1)));
        assert!(!store.record_snapshot(snap("p", t0 - Duration::seconds(5), 1000.0, 2)));
        assert_eq!(store.snapshots("p").len(), 1);
    }

    #[test]
    fn throttles_rapid_snapshots() {
        let store = TelemetryStore::new();
        let t0 = Utc::now();
        assert!(store.record_snapshot(snap("p", t0, 1000.0, 0)));
        // 5 s later: inside the 8 s window — ignored.
        assert!(!store.record_snapshot(snap("p", t0 + Duration::seconds(5), 1000.0, 1)));
        // 8 s later: accepted.
        assert!(store.record_snapshot(snap("p", t0 + Duration::seconds(8), 1000.0, 2)));
        assert_eq!(store.snapshots("p").len(), 2);
    }

    #[test]
    fn swap_window_is_bounded() {
        let store = TelemetryStore::new();
        let t0 = Utc::now();
        for i in 0..(H_SWAP + 5) {
            store.record_swap(swap("p", t0 + Duration::seconds(i as i64)));
        }
        assert_eq!(store.swaps("p").len(), H_SWAP);
    }

    #[test]
    fn pool_cap_evicts_least_recently_inserted() {
        let store = TelemetryStore::new();
        let t0 = Utc::now();
        for i in 0..MAX_POOLS {
            store.record_snapshot(snap(&format!("pool{i}"), t0, 1000.0, 0));
        }
        assert_eq!(store.tracked_pools().len(), MAX_POOLS);

        // One more pool pushes out pool0 (the earliest insert).
        store.record_snapshot(snap("fresh", t0, 1000.0, 0));
        let tracked = store.tracked_pools();
        assert_eq!(tracked.len(), MAX_POOLS);
        assert!(!tracked.contains(&"pool0".to_string()));
        assert!(tracked.contains(&"fresh".to_string()));
    }

    #[test]
    fn prune_drops_inactive_pools() {
        let store = TelemetryStore::new();
        let t0 = Utc::now();
        store.record_snapshot(snap("a", t0, 1000.0, 0));
        store.record_snapshot(snap("b", t0, 1000.0, 0));

        let active: HashSet<String> = ["a".to_string()].into_iter().collect();
        store.prune_inactive(&active);

        assert_eq!(store.tracked_pools(), vec!["a".to_string()]);
        assert!(store.latest_snapshot("b").is_none());
    }

    #[test]
    fn reads_are_copies() {
        let store = TelemetryStore::new();
        let t0 = Utc::now();
        store.record_snapshot(snap("p", t0, 1000.0, 7));
        let mut copy = store.snapshots("p");
        copy[0].active_bin = 99;
        assert_eq!(store.latest_snapshot("p").unwrap().active_bin, 7);
    }
}
