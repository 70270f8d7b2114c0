// =============================================================================
// Composite Scorer — tier-4 pool score from microstructure + regime
// =============================================================================
//
// Aggregates the normalized microstructure readings into a 0..100-ish base
// score, applies the regime multiplier and a migration adjustment, and
// attaches the policy thresholds and bin-width band the engine needs for
// entry and exit decisions.
//
// The constructor returns `None` whenever any input metric is unavailable —
// an invalid score never opens or closes a position.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::metrics;
use crate::regime::{bin_width_for, policy_for, BinWidth};
use crate::telemetry::PoolSnapshot;
use crate::types::{MigrationDirection, Regime};

/// Base-score weights over the normalized readings.
const W_SWAP_VELOCITY: f64 = 0.35;
const W_BIN_VELOCITY: f64 = 0.25;
const W_LIQUIDITY_FLOW: f64 = 0.25;
const W_ENTROPY: f64 = 0.15;

/// Migration adjustments to the multiplied base score.
const MIGRATION_IN_BONUS: f64 = 4.0;
const MIGRATION_OUT_PENALTY: f64 = -6.0;

/// Composite (tier-4) score for one pool. Derived, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeScore {
    pub tier4_score: f64,
    pub base_score: f64,
    pub regime: Regime,
    pub regime_multiplier: f64,
    pub migration_direction: MigrationDirection,
    pub velocity_slope: f64,
    pub liquidity_slope: f64,
    pub entropy_slope: f64,
    pub bin_width: BinWidth,
    pub entry_threshold: f64,
    pub exit_threshold: f64,
}

impl CompositeScore {
    /// Whether this score clears its regime's entry threshold.
    pub fn clears_entry(&self) -> bool {
        self.tier4_score >= self.entry_threshold
    }

    /// Whether this score has fallen below its regime's exit threshold.
    pub fn below_exit(&self) -> bool {
        self.tier4_score < self.exit_threshold
    }
}

/// Multiplier applied to the base score per regime.
pub fn regime_multiplier(regime: Regime) -> f64 {
    match regime {
        Regime::Bull => 1.15,
        Regime::Neutral => 1.00,
        Regime::Bear => 0.85,
    }
}

/// Build the composite score for a pool's snapshot window under `regime`.
///
/// Requires a full metric set, slopes (≥ 3 snapshots), and a per-minute
/// liquidity slope; otherwise returns `None`.
pub fn composite_score(window: &[PoolSnapshot], regime: Regime) -> Option<CompositeScore> {
    let m = metrics::metric_set(window)?;
    let slopes = metrics::slopes(window)?;
    let per_minute = metrics::liquidity_slope_per_minute(window)?;
    let migration = metrics::classify_migration(per_minute);

    let base_score = 100.0
        * (W_SWAP_VELOCITY * m.swap_velocity
            + W_BIN_VELOCITY * m.bin_velocity
            + W_LIQUIDITY_FLOW * m.liquidity_flow
            + W_ENTROPY * m.entropy);

    let multiplier = regime_multiplier(regime);
    let migration_adjust = match migration {
        MigrationDirection::In => MIGRATION_IN_BONUS,
        MigrationDirection::Neutral => 0.0,
        MigrationDirection::Out => MIGRATION_OUT_PENALTY,
    };

    let tier4_score = (base_score * multiplier + migration_adjust).max(0.0);
    let policy = policy_for(regime);

    Some(CompositeScore {
        tier4_score,
        base_score,
        regime,
        regime_multiplier: multiplier,
        migration_direction: migration,
        velocity_slope: slopes.velocity,
        liquidity_slope: slopes.liquidity,
        entropy_slope: slopes.entropy,
        bin_width: bin_width_for(regime, tier4_score),
        entry_threshold: policy.entry_threshold,
        exit_threshold: policy.exit_threshold,
    })
}
