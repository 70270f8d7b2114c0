// =============================================================================
// Metrics Engine — microstructure readings over a snapshot window
// =============================================================================
//
// Every function takes a pool's snapshot window (oldest first, as returned by
// the telemetry store) and returns `None` when its preconditions fail:
// insufficient history, non-positive liquidity, or a degenerate time delta.
// Callers must propagate `None` as "no decision" — nothing in this module, or
// downstream of it, assigns defaults.
// =============================================================================

use chrono::{DateTime, Utc};

use crate::telemetry::{PoolSnapshot, SwapEvent};
use crate::types::MigrationDirection;

/// Bin velocity saturates at this many bins per second.
const BIN_VELOCITY_SCALE: f64 = 0.10;
/// Swap velocity saturates at this many trades per second.
const SWAP_VELOCITY_SCALE: f64 = 0.50;
/// Liquidity-flow normalization window, as fractions.
const LIQ_FLOW_LO: f64 = -0.10;
const LIQ_FLOW_HI: f64 = 0.05;
/// Entropy component weights and scales.
const ENTROPY_RATIO_WEIGHT: f64 = 0.6;
const ENTROPY_BIN_WEIGHT: f64 = 0.4;
const ENTROPY_RATIO_SCALE: f64 = 0.25;
const ENTROPY_BIN_SCALE: f64 = 5.0;
/// Migration classifier thresholds on the per-minute liquidity slope.
const MIGRATION_THRESHOLD: f64 = 0.40;
/// Swap-history integration window for the 3-minute fee intensity.
const FEE_INTENSITY_WINDOW_SECS: i64 = 180;

/// The four normalized microstructure readings the health index consumes.
#[derive(Debug, Clone, Copy)]
pub struct MetricSet {
    pub bin_velocity: f64,
    pub swap_velocity: f64,
    pub liquidity_flow: f64,
    pub entropy: f64,
}

/// First-derivative slopes per second over the snapshot window.
#[derive(Debug, Clone, Copy)]
pub struct SlopeSet {
    pub velocity: f64,
    pub liquidity: f64,
    pub entropy: f64,
}

fn dt_secs(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Option<f64> {
    let dt = later.signed_duration_since(earlier).num_milliseconds() as f64 / 1000.0;
    (dt > 0.0).then_some(dt)
}

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// Normalized bin velocity: `|Δ active_bin| / Δt`, saturating at 0.10 bins/s.
pub fn bin_velocity(window: &[PoolSnapshot]) -> Option<f64> {
    let [.., prev, last] = window else {
        return None;
    };
    let dt = dt_secs(prev.fetched_at, last.fetched_at)?;
    let raw = (last.active_bin - prev.active_bin).unsigned_abs() as f64 / dt;
    Some((raw / BIN_VELOCITY_SCALE).min(1.0))
}

/// Normalized swap velocity: `recent_trades / Δt`, saturating at 0.50 trades/s.
pub fn swap_velocity(window: &[PoolSnapshot]) -> Option<f64> {
    let [.., prev, last] = window else {
        return None;
    };
    let dt = dt_secs(prev.fetched_at, last.fetched_at)?;
    let raw = last.recent_trades as f64 / dt;
    Some((raw / SWAP_VELOCITY_SCALE).min(1.0))
}

/// Raw liquidity flow as a fraction: `(L_t − L_{t−1}) / L_{t−1}`.
pub fn liquidity_flow_pct(window: &[PoolSnapshot]) -> Option<f64> {
    let [.., prev, last] = window else {
        return None;
    };
    if prev.liquidity_usd <= 0.0 || last.liquidity_usd <= 0.0 {
        return None;
    }
    Some((last.liquidity_usd - prev.liquidity_usd) / prev.liquidity_usd)
}

/// Liquidity flow mapped linearly from [−10%, +5%] onto [0, 1].
pub fn liquidity_flow_norm(window: &[PoolSnapshot]) -> Option<f64> {
    let raw = liquidity_flow_pct(window)?;
    Some(clamp01((raw - LIQ_FLOW_LO) / (LIQ_FLOW_HI - LIQ_FLOW_LO)))
}

/// Inventory/positioning entropy over the window.
///
/// Weighted sum of the variance of the per-snapshot inventory ratio
/// `base / (base + quote)` (scaled by 1/0.25) and the mean absolute bin delta
/// (scaled by 1/5), both clamped to [0, 1].
pub fn entropy(window: &[PoolSnapshot]) -> Option<f64> {
    if window.len() < 2 {
        return None;
    }

    let mut ratios = Vec::with_capacity(window.len());
    for s in window {
        let total = s.inventory_base + s.inventory_quote;
        if total <= 0.0 {
            return None;
        }
        ratios.push(s.inventory_base / total);
    }

    let mean = ratios.iter().sum::<f64>() / ratios.len() as f64;
    let variance =
        ratios.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / ratios.len() as f64;
    let ratio_component = clamp01(variance / ENTROPY_RATIO_SCALE);

    let bin_deltas: f64 = window
        .windows(2)
        .map(|pair| (pair[1].active_bin - pair[0].active_bin).unsigned_abs() as f64)
        .sum();
    let mean_delta = bin_deltas / (window.len() - 1) as f64;
    let bin_component = clamp01(mean_delta / ENTROPY_BIN_SCALE);

    Some(ENTROPY_RATIO_WEIGHT * ratio_component + ENTROPY_BIN_WEIGHT * bin_component)
}

/// Per-unit-liquidity fee accrual proxy:
/// `(fee_pct · liquidity · 0.001) / liquidity`.
pub fn fee_intensity(snapshot: &PoolSnapshot) -> Option<f64> {
    if snapshot.liquidity_usd <= 0.0 {
        return None;
    }
    let fee_pct = snapshot.fee_rate_bps as f64 / 10_000.0;
    Some(fee_pct * snapshot.liquidity_usd * 0.001 / snapshot.liquidity_usd)
}

/// Fee intensity integrated over the last three minutes of swap history:
/// total fees paid within the window per unit of current liquidity.
pub fn fee_intensity_3m(
    swaps: &[SwapEvent],
    liquidity_usd: f64,
    now: DateTime<Utc>,
) -> Option<f64> {
    if liquidity_usd <= 0.0 {
        return None;
    }
    let cutoff = now - chrono::Duration::seconds(FEE_INTENSITY_WINDOW_SECS);
    let total_fees: f64 = swaps
        .iter()
        .filter(|s| s.ts >= cutoff)
        .map(|s| s.fee_paid)
        .sum();
    Some(total_fees / liquidity_usd)
}

/// All four normalized readings at once; `None` if any is unavailable.
pub fn metric_set(window: &[PoolSnapshot]) -> Option<MetricSet> {
    Some(MetricSet {
        bin_velocity: bin_velocity(window)?,
        swap_velocity: swap_velocity(window)?,
        liquidity_flow: liquidity_flow_norm(window)?,
        entropy: entropy(window)?,
    })
}

/// First-derivative slopes for velocity, liquidity, and entropy.
///
/// Needs at least three snapshots: each slope is the change between the last
/// two adjacent readings of the underlying metric, per second.
pub fn slopes(window: &[PoolSnapshot]) -> Option<SlopeSet> {
    if window.len() < 3 {
        return None;
    }
    let older = &window[..window.len() - 1];
    let prev = &window[window.len() - 2];
    let last = &window[window.len() - 1];
    let dt = dt_secs(prev.fetched_at, last.fetched_at)?;

    let velocity_now = raw_bin_velocity(window)?;
    let velocity_prev = raw_bin_velocity(older)?;

    if prev.liquidity_usd <= 0.0 {
        return None;
    }
    let liquidity =
        (last.liquidity_usd - prev.liquidity_usd) / prev.liquidity_usd / dt;

    let entropy_now = entropy(window)?;
    let entropy_prev = entropy(older)?;

    Some(SlopeSet {
        velocity: (velocity_now - velocity_prev) / dt,
        liquidity,
        entropy: (entropy_now - entropy_prev) / dt,
    })
}

/// Per-minute relative liquidity slope used by the migration classifier.
pub fn liquidity_slope_per_minute(window: &[PoolSnapshot]) -> Option<f64> {
    let [.., prev, last] = window else {
        return None;
    };
    let dt = dt_secs(prev.fetched_at, last.fetched_at)?;
    if prev.liquidity_usd <= 0.0 {
        return None;
    }
    let rel = (last.liquidity_usd - prev.liquidity_usd) / prev.liquidity_usd;
    Some(rel * 60.0 / dt)
}

/// Classify liquidity migration from the per-minute slope (thresholds ±0.40).
pub fn classify_migration(per_minute_slope: f64) -> MigrationDirection {
    if per_minute_slope > MIGRATION_THRESHOLD {
        MigrationDirection::In
    } else if per_minute_slope < -MIGRATION_THRESHOLD {
        MigrationDirection::Out
    } else {
        MigrationDirection::Neutral
    }
}

fn raw_bin_velocity(window: &[PoolSnapshot]) -> Option<f64> {
    let [.., prev, last] = window else {
        return None;
    };
    let dt = dt_secs(prev.fetched_at, last.fetched_at)?;
    Some((last.active_bin - prev.active_bin).unsigned_abs() as f64 / dt)
}
