// =============================================================================
// Sizing Engine — tiered percentage-of-wallet entries with volatility trim
// =============================================================================
//
// Two independent admission gates feed the final size: the composite score
// picks the base percentage tier, the health index contributes its tier
// multiplier. Multiplying them means the smaller gate always wins. The
// exposure cap is the authoritative admission predicate and is checked before
// any capital is allocated.
// =============================================================================

use tracing::debug;

use crate::exit::harmonic::EntryBaselines;
use crate::health::HealthIndex;

/// Composite scores below this are refused outright.
pub const MIN_ENTRY_SCORE: f64 = 32.0;
/// Scale entries require at least this score.
pub const MIN_SCALE_SCORE: f64 = 45.0;

/// Volatility trim bounds.
const TRIM_FLOOR: f64 = 0.8;
const TRIM_CEIL: f64 = 1.1;

/// Scale sizing interpolation anchors: 6% at score 45 up to 12% at score 75.
const SCALE_PCT_LO: f64 = 0.06;
const SCALE_PCT_HI: f64 = 0.12;
const SCALE_SCORE_HI: f64 = 75.0;

/// Base entry percentage for a composite score, or `None` below the floor.
pub fn base_pct(score: f64) -> Option<f64> {
    if score >= 60.0 {
        Some(0.04)
    } else if score >= MIN_SCALE_SCORE {
        Some(0.03)
    } else if score >= MIN_ENTRY_SCORE {
        Some(0.02)
    } else {
        None
    }
}

/// Volatility trim factor: `clamp(1.1 − 0.3·volatility, 0.8, 1.1)`.
pub fn volatility_trim(volatility: f64) -> f64 {
    (1.1 - 0.3 * volatility).clamp(TRIM_FLOOR, TRIM_CEIL)
}

/// Entry size in USD, or `None` when either admission gate refuses.
///
/// `wallet` is the total working capital (available + locked).
pub fn entry_size(
    wallet: f64,
    score: f64,
    volatility: f64,
    health: &HealthIndex,
) -> Option<f64> {
    if !health.can_enter() {
        debug!(hi = health.value, "sizing refused: health below hard floor");
        return None;
    }
    let base = base_pct(score)?;
    let adjusted = base * volatility_trim(volatility);
    let size = wallet * adjusted * health.tier.multiplier();
    (size > 0.0).then_some(size)
}

/// Scale-in size in USD. Permitted only when the score clears the scale
/// floor, the health tier allows scaling, and both slopes have improved past
/// their entry baselines.
pub fn scale_size(
    wallet: f64,
    score: f64,
    velocity_slope: f64,
    liquidity_slope: f64,
    baselines: &EntryBaselines,
    health: &HealthIndex,
) -> Option<f64> {
    if score < MIN_SCALE_SCORE || !health.can_scale() {
        return None;
    }
    if velocity_slope <= baselines.velocity_slope
        || liquidity_slope <= baselines.liquidity_slope
    {
        return None;
    }
    let t = ((score - MIN_SCALE_SCORE) / (SCALE_SCORE_HI - MIN_SCALE_SCORE)).clamp(0.0, 1.0);
    let pct = SCALE_PCT_LO + t * (SCALE_PCT_HI - SCALE_PCT_LO);
    Some(wallet * pct)
}

/// Authoritative admission predicate for the exposure cap:
/// `current_exposure + size ≤ max_exposure_pct · wallet`.
pub fn can_add_position(
    current_exposure: f64,
    size: f64,
    wallet: f64,
    max_exposure_pct: f64,
) -> bool {
    current_exposure + size <= max_exposure_pct * wallet
}
