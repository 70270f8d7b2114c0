// =============================================================================
// Harmonic Decay Evaluator — volatility-adjusted exit bands
// =============================================================================
//
// Compares a position's current microstructure against the baselines frozen
// at entry. Each band is a remaining-fraction floor: the position exits when
// the current reading has decayed to less than `floor · baseline`. The
// volatility governor's band multiplier widens every band — floors are
// divided by it, the liquidity-outflow tolerance is multiplied by it — so a
// noisy pool must decay further before a FULL_EXIT verdict fires.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Remaining-fraction floor for fee intensity vs entry.
const FEE_REMAINING_FLOOR: f64 = 0.35;
/// Remaining-fraction floor for swap velocity vs entry.
const SWAP_REMAINING_FLOOR: f64 = 0.50;
/// Absolute minimum health index.
const MIN_HEALTH: f64 = 0.30;
/// Liquidity-flow tolerance (fraction per snapshot interval).
const LIQ_OUTFLOW_TOLERANCE: f64 = -0.08;
/// Warn when a reading sits within this factor above its floor.
const WARN_MARGIN: f64 = 1.2;

/// Microstructure baselines frozen at entry time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EntryBaselines {
    pub fee_intensity: f64,
    pub swap_velocity: f64,
    pub velocity_slope: f64,
    pub liquidity_slope: f64,
}

/// Fresh readings for the same position.
#[derive(Debug, Clone, Copy)]
pub struct CurrentReadings {
    pub fee_intensity: f64,
    pub swap_velocity: f64,
    pub health: f64,
    pub liquidity_flow_pct: f64,
}

/// Evaluator verdict. `FullExit` preempts every other exit consideration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HarmonicVerdict {
    FullExit { reason: String },
    Warn { reason: String },
    Hold,
}

impl HarmonicVerdict {
    pub fn is_full_exit(&self) -> bool {
        matches!(self, Self::FullExit { .. })
    }
}

/// Evaluate the harmonic bands for one position.
///
/// `band_multiplier` comes from the volatility governor and is already
/// clamped to [0.5, 2.0].
pub fn evaluate(
    baselines: &EntryBaselines,
    current: &CurrentReadings,
    band_multiplier: f64,
) -> HarmonicVerdict {
    let fee_floor = FEE_REMAINING_FLOOR / band_multiplier;
    let swap_floor = SWAP_REMAINING_FLOOR / band_multiplier;
    let health_floor = MIN_HEALTH / band_multiplier;
    let outflow_tolerance = LIQ_OUTFLOW_TOLERANCE * band_multiplier;

    // Health floor is checked first: a position below minimum health exits
    // regardless of how its individual bands look.
    if current.health < health_floor {
        return HarmonicVerdict::FullExit {
            reason: format!(
                "HARMONIC_HEALTH_FLOOR health={:.3} floor={:.3}",
                current.health, health_floor
            ),
        };
    }

    if let Some(remaining) = remaining_fraction(baselines.fee_intensity, current.fee_intensity) {
        if remaining < fee_floor {
            return HarmonicVerdict::FullExit {
                reason: format!(
                    "HARMONIC_FEE_DECAY remaining={:.3} floor={:.3}",
                    remaining, fee_floor
                ),
            };
        }
        if remaining < fee_floor * WARN_MARGIN {
            return HarmonicVerdict::Warn {
                reason: format!("fee intensity nearing floor ({remaining:.3})"),
            };
        }
    }

    if let Some(remaining) = remaining_fraction(baselines.swap_velocity, current.swap_velocity) {
        if remaining < swap_floor {
            return HarmonicVerdict::FullExit {
                reason: format!(
                    "HARMONIC_SWAP_DECAY remaining={:.3} floor={:.3}",
                    remaining, swap_floor
                ),
            };
        }
        if remaining < swap_floor * WARN_MARGIN {
            return HarmonicVerdict::Warn {
                reason: format!("swap velocity nearing floor ({remaining:.3})"),
            };
        }
    }

    if current.liquidity_flow_pct < outflow_tolerance {
        return HarmonicVerdict::FullExit {
            reason: format!(
                "HARMONIC_LIQUIDITY_OUTFLOW flow={:.3} tolerance={:.3}",
                current.liquidity_flow_pct, outflow_tolerance
            ),
        };
    }

    debug!(
        health = current.health,
        fee = current.fee_intensity,
        swap = current.swap_velocity,
        flow = current.liquidity_flow_pct,
        mult = band_multiplier,
        "harmonic bands clear"
    );
    HarmonicVerdict::Hold
}

/// Fraction of the entry baseline still present, or `None` when the baseline
/// was zero (nothing to decay from).
fn remaining_fraction(baseline: f64, current: f64) -> Option<f64> {
    (baseline > 0.0).then(|| (current / baseline).max(0.0))
}
