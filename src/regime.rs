// =============================================================================
// Regime & Threshold Oracle
// =============================================================================
//
// Classifies the overall market into BULL / NEUTRAL / BEAR from aggregate
// telemetry and emits the policy triple downstream entry/exit decisions use:
// entry threshold, exit threshold, and the bin-width band for new clusters.
//
// Regime transitions affect future entry and exit decisions only; open
// positions are never retroactively re-scored.
// =============================================================================

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Regime;

/// Aggregate liquidity-flow fraction above which the market reads bullish.
const BULL_FLOW_THRESHOLD: f64 = 0.01;
/// Swap velocity floor that must accompany bullish flow.
const BULL_VELOCITY_FLOOR: f64 = 0.25;
/// Aggregate flow below which the market reads bearish.
const BEAR_FLOW_THRESHOLD: f64 = -0.02;

/// Width band for a position's bin cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinWidth {
    pub min: u32,
    pub max: u32,
    pub label: BinWidthLabel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BinWidthLabel {
    Narrow,
    Medium,
    Wide,
}

impl BinWidthLabel {
    fn band(self) -> BinWidth {
        match self {
            Self::Narrow => BinWidth {
                min: 5,
                max: 12,
                label: Self::Narrow,
            },
            Self::Medium => BinWidth {
                min: 8,
                max: 18,
                label: Self::Medium,
            },
            Self::Wide => BinWidth {
                min: 12,
                max: 26,
                label: Self::Wide,
            },
        }
    }
}

impl std::fmt::Display for BinWidthLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Narrow => write!(f, "narrow"),
            Self::Medium => write!(f, "medium"),
            Self::Wide => write!(f, "wide"),
        }
    }
}

/// Entry/exit thresholds plus bin-width band for one regime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimePolicy {
    pub entry_threshold: f64,
    pub exit_threshold: f64,
    pub bin_width: BinWidth,
}

/// Policy table keyed by regime.
pub fn policy_for(regime: Regime) -> RegimePolicy {
    match regime {
        Regime::Bull => RegimePolicy {
            entry_threshold: 28.0,
            exit_threshold: 18.0,
            bin_width: BinWidthLabel::Narrow.band(),
        },
        Regime::Neutral => RegimePolicy {
            entry_threshold: 32.0,
            exit_threshold: 22.0,
            bin_width: BinWidthLabel::Medium.band(),
        },
        Regime::Bear => RegimePolicy {
            entry_threshold: 36.0,
            exit_threshold: 30.0,
            bin_width: BinWidthLabel::Wide.band(),
        },
    }
}

/// Per-pool bin width: the tighter of the regime's policy band and the band
/// the pool's composite score earns (> 45 narrow, > 35 medium, else wide).
pub fn bin_width_for(regime: Regime, composite_score: f64) -> BinWidth {
    let score_label = if composite_score > 45.0 {
        BinWidthLabel::Narrow
    } else if composite_score > 35.0 {
        BinWidthLabel::Medium
    } else {
        BinWidthLabel::Wide
    };
    let regime_label = policy_for(regime).bin_width.label;
    score_label.min(regime_label).band()
}

/// Thread-safe oracle caching the current regime.
pub struct RegimeOracle {
    current: RwLock<Regime>,
}

impl RegimeOracle {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Regime::Neutral),
        }
    }

    /// Re-classify from market aggregates: mean liquidity-flow fraction and
    /// mean swap velocity across tracked pools. Returns the (possibly
    /// unchanged) regime.
    pub fn update(&self, mean_liquidity_flow: f64, mean_swap_velocity: f64) -> Regime {
        let next = classify(mean_liquidity_flow, mean_swap_velocity);
        let mut current = self.current.write();
        if *current != next {
            info!(
                from = %*current,
                to = %next,
                mean_flow = mean_liquidity_flow,
                mean_velocity = mean_swap_velocity,
                "regime transition"
            );
            *current = next;
        }
        next
    }

    pub fn current(&self) -> Regime {
        *self.current.read()
    }
}

impl Default for RegimeOracle {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(mean_liquidity_flow: f64, mean_swap_velocity: f64) -> Regime {
    if mean_liquidity_flow > BULL_FLOW_THRESHOLD && mean_swap_velocity >= BULL_VELOCITY_FLOOR {
        Regime::Bull
    } else if mean_liquidity_flow < BEAR_FLOW_THRESHOLD {
        Regime::Bear
    } else {
        Regime::Neutral
    }
}
