// =============================================================================
// Volatility Governor — rolling dispersion → band-width multiplier
// =============================================================================
//
// Keeps short rolling windows of the entropy, swap-velocity, and
// liquidity-flow readings and maps their combined standard deviation onto a
// band-width multiplier. The harmonic exit evaluator widens its thresholds by
// this multiplier so choppy pools are not shaken out by noise.
// =============================================================================

use std::collections::VecDeque;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Rolling window length per signal.
pub const VOL_WINDOW: usize = 15;

/// Combined-score weights: entropy / swap velocity / liquidity flow.
const W_ENTROPY: f64 = 0.40;
const W_SWAP_VELOCITY: f64 = 0.35;
const W_LIQUIDITY_FLOW: f64 = 0.25;

/// Level cutoffs on the combined dispersion score.
const HIGH_CUTOFF: f64 = 0.25;
const MEDIUM_CUTOFF: f64 = 0.12;
const LOW_CUTOFF: f64 = 0.05;

/// Multiplier clamp range.
const MULT_MIN: f64 = 0.5;
const MULT_MAX: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolatilityLevel {
    High,
    Medium,
    Low,
    Minimal,
}

impl VolatilityLevel {
    pub fn multiplier(self) -> f64 {
        let raw: f64 = match self {
            Self::High => 1.5,
            Self::Medium => 1.2,
            Self::Low => 1.0,
            Self::Minimal => 0.8,
        };
        raw.clamp(MULT_MIN, MULT_MAX)
    }
}

impl std::fmt::Display for VolatilityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "HIGH"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::Low => write!(f, "LOW"),
            Self::Minimal => write!(f, "MINIMAL"),
        }
    }
}

#[derive(Default)]
struct Windows {
    entropy: VecDeque<f64>,
    swap_velocity: VecDeque<f64>,
    liquidity_flow: VecDeque<f64>,
}

/// Thread-safe rolling-volatility tracker.
pub struct VolatilityGovernor {
    windows: RwLock<Windows>,
}

impl VolatilityGovernor {
    pub fn new() -> Self {
        Self {
            windows: RwLock::new(Windows::default()),
        }
    }

    /// Record one set of readings.
    pub fn record(&self, entropy: f64, swap_velocity: f64, liquidity_flow: f64) {
        let mut w = self.windows.write();
        push_bounded(&mut w.entropy, entropy);
        push_bounded(&mut w.swap_velocity, swap_velocity);
        push_bounded(&mut w.liquidity_flow, liquidity_flow);
    }

    /// Combined dispersion score: weighted sum of the per-signal standard
    /// deviations. Zero until at least two samples exist.
    pub fn combined(&self) -> f64 {
        let w = self.windows.read();
        W_ENTROPY * stddev(&w.entropy)
            + W_SWAP_VELOCITY * stddev(&w.swap_velocity)
            + W_LIQUIDITY_FLOW * stddev(&w.liquidity_flow)
    }

    /// Current band level and its clamped multiplier.
    pub fn band(&self) -> (VolatilityLevel, f64) {
        let score = self.combined();
        let level = if score >= HIGH_CUTOFF {
            VolatilityLevel::High
        } else if score >= MEDIUM_CUTOFF {
            VolatilityLevel::Medium
        } else if score >= LOW_CUTOFF {
            VolatilityLevel::Low
        } else {
            VolatilityLevel::Minimal
        };
        (level, level.multiplier())
    }
}

impl Default for VolatilityGovernor {
    fn default() -> Self {
        Self::new()
    }
}

fn push_bounded(window: &mut VecDeque<f64>, value: f64) {
    window.push_back(value);
    while window.len() > VOL_WINDOW {
        window.pop_front();
    }
}

fn stddev(window: &VecDeque<f64>) -> f64 {
    if window.len() < 2 {
        return 0.0;
    }
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}
