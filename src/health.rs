// =============================================================================
// Health Index — static-weight composite that governs position sizing
// =============================================================================
//
// HI = Σ w_i · m_i − Wd · slope_penalty, clamped to [0, 1]. The weights are
// static and explicitly not regime-dependent; regime influence belongs to the
// composite score and its thresholds, never here.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::metrics::{MetricSet, SlopeSet};

/// Below this HI a pool is blocked from entry entirely.
pub const HARD_FLOOR: f64 = 0.20;
/// Observability-only floor; crossing it is logged, never acted on.
pub const SOFT_FLOOR: f64 = 0.35;

/// Weight of each of the four microstructure readings.
const METRIC_WEIGHT: f64 = 0.25;
/// Weight of the aggregate slope penalty (Wd).
const SLOPE_PENALTY_WEIGHT: f64 = 0.20;
/// Per-signal penalty ramp start points.
const VELOCITY_PENALTY_START: f64 = -0.05;
const LIQUIDITY_PENALTY_START: f64 = -0.03;
const ENTROPY_PENALTY_START: f64 = -0.02;
/// All three ramps saturate here.
const PENALTY_SATURATION: f64 = -0.15;
/// Component weights within the aggregate penalty.
const PENALTY_WEIGHTS: [f64; 3] = [0.33, 0.34, 0.33];

/// Sizing tier derived from the health index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizingTier {
    Max,
    High,
    Medium,
    Low,
    Micro,
    Blocked,
}

impl SizingTier {
    /// Position-size multiplier for this tier.
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Max => 1.00,
            Self::High => 0.85,
            Self::Medium => 0.65,
            Self::Low => 0.45,
            Self::Micro => 0.25,
            Self::Blocked => 0.0,
        }
    }
}

impl std::fmt::Display for SizingTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Max => write!(f, "MAX"),
            Self::High => write!(f, "HIGH"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::Low => write!(f, "LOW"),
            Self::Micro => write!(f, "MICRO"),
            Self::Blocked => write!(f, "BLOCKED"),
        }
    }
}

/// Computed health index with its tier and penalty breakdown.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthIndex {
    pub value: f64,
    pub tier: SizingTier,
    pub slope_penalty: f64,
}

impl HealthIndex {
    pub fn can_enter(&self) -> bool {
        self.value >= HARD_FLOOR
    }

    pub fn can_scale(&self) -> bool {
        matches!(self.tier, SizingTier::Max | SizingTier::High)
    }
}

/// Map an HI value onto its sizing tier.
pub fn tier_for(hi: f64) -> SizingTier {
    if hi >= 0.60 {
        SizingTier::Max
    } else if hi >= 0.50 {
        SizingTier::High
    } else if hi >= 0.40 {
        SizingTier::Medium
    } else if hi >= 0.35 {
        SizingTier::Low
    } else if hi >= HARD_FLOOR {
        SizingTier::Micro
    } else {
        SizingTier::Blocked
    }
}

/// Compute the health index from the metric readings and slopes.
pub fn health_index(metrics: &MetricSet, slopes: &SlopeSet) -> HealthIndex {
    let weighted = METRIC_WEIGHT
        * (metrics.bin_velocity + metrics.swap_velocity + metrics.entropy + metrics.liquidity_flow);

    let penalty = slope_penalty(slopes);
    let value = (weighted - SLOPE_PENALTY_WEIGHT * penalty).clamp(0.0, 1.0);
    let tier = tier_for(value);

    if value < SOFT_FLOOR && value >= HARD_FLOOR {
        debug!(hi = value, tier = %tier, "[HEALTH] soft floor crossed");
    }

    HealthIndex {
        value,
        tier,
        slope_penalty: penalty,
    }
}

/// Aggregate slope penalty in [0, 1].
///
/// Each signal contributes a piecewise-linear ramp: zero until its start
/// point, saturating to one at −0.15.
fn slope_penalty(slopes: &SlopeSet) -> f64 {
    let components = [
        ramp(slopes.velocity, VELOCITY_PENALTY_START),
        ramp(slopes.liquidity, LIQUIDITY_PENALTY_START),
        ramp(slopes.entropy, ENTROPY_PENALTY_START),
    ];
    components
        .iter()
        .zip(PENALTY_WEIGHTS.iter())
        .map(|(c, w)| c * w)
        .sum()
}

fn ramp(slope: f64, start: f64) -> f64 {
    if slope >= start {
        0.0
    } else if slope <= PENALTY_SATURATION {
        1.0
    } else {
        (start - slope) / (start - PENALTY_SATURATION)
    }
}
