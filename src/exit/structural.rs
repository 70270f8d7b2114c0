// =============================================================================
// Structural Decay Detector — consecutive negative-slope exit trigger
// =============================================================================
//
// Tracks, per registered position, how many consecutive snapshots have shown
// a negative entropy slope and a negative liquidity slope. When both streaks
// reach three the position must exit with reason STRUCTURAL_DECAY. A single
// non-negative reading resets its streak.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Both streaks must reach this count to trigger.
pub const TRIGGER_STREAK: u32 = 3;

/// Exit reason emitted when the trigger fires.
pub const STRUCTURAL_DECAY_REASON: &str = "STRUCTURAL_DECAY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecaySeverity {
    None,
    Mild,
    Moderate,
    Severe,
}

impl std::fmt::Display for DecaySeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Mild => write!(f, "MILD"),
            Self::Moderate => write!(f, "MODERATE"),
            Self::Severe => write!(f, "SEVERE"),
        }
    }
}

/// Result of one observation.
#[derive(Debug, Clone, Copy)]
pub struct DecayStatus {
    pub entropy_streak: u32,
    pub liquidity_streak: u32,
    pub severity: DecaySeverity,
    pub triggered: bool,
}

#[derive(Default)]
struct Streaks {
    entropy: u32,
    liquidity: u32,
}

/// Per-position decay state keyed by position id.
pub struct StructuralDecayDetector {
    states: RwLock<HashMap<String, Streaks>>,
}

impl StructuralDecayDetector {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Start tracking a position (streaks at zero).
    pub fn register(&self, position_id: &str) {
        self.states
            .write()
            .insert(position_id.to_string(), Streaks::default());
    }

    /// Stop tracking a position.
    pub fn unregister(&self, position_id: &str) {
        self.states.write().remove(position_id);
    }

    /// Feed one snapshot's slopes for a position and return the updated
    /// status. Unregistered ids return `None`.
    pub fn observe(
        &self,
        position_id: &str,
        entropy_slope: f64,
        liquidity_slope: f64,
    ) -> Option<DecayStatus> {
        let mut states = self.states.write();
        let streaks = states.get_mut(position_id)?;

        streaks.entropy = if entropy_slope < 0.0 {
            streaks.entropy + 1
        } else {
            0
        };
        streaks.liquidity = if liquidity_slope < 0.0 {
            streaks.liquidity + 1
        } else {
            0
        };

        let status = DecayStatus {
            entropy_streak: streaks.entropy,
            liquidity_streak: streaks.liquidity,
            severity: severity_for(streaks.entropy.min(streaks.liquidity)),
            triggered: streaks.entropy >= TRIGGER_STREAK
                && streaks.liquidity >= TRIGGER_STREAK,
        };

        if status.triggered {
            warn!(
                position_id,
                entropy_streak = status.entropy_streak,
                liquidity_streak = status.liquidity_streak,
                "structural decay trigger"
            );
        } else if status.severity != DecaySeverity::None {
            debug!(
                position_id,
                severity = %status.severity,
                entropy_streak = status.entropy_streak,
                liquidity_streak = status.liquidity_streak,
                "structural decay building"
            );
        }

        Some(status)
    }

    /// Read the current status without feeding an observation. Used by the
    /// advisory health evaluation, which must stay side-effect free.
    pub fn current(&self, position_id: &str) -> Option<DecayStatus> {
        let states = self.states.read();
        let streaks = states.get(position_id)?;
        Some(DecayStatus {
            entropy_streak: streaks.entropy,
            liquidity_streak: streaks.liquidity,
            severity: severity_for(streaks.entropy.min(streaks.liquidity)),
            triggered: streaks.entropy >= TRIGGER_STREAK
                && streaks.liquidity >= TRIGGER_STREAK,
        })
    }
}

impl Default for StructuralDecayDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Severity is keyed to the weaker of the two streaks.
fn severity_for(min_streak: u32) -> DecaySeverity {
    match min_streak {
        0 => DecaySeverity::None,
        1 => DecaySeverity::Mild,
        2 => DecaySeverity::Moderate,
        _ => DecaySeverity::Severe,
    }
}
