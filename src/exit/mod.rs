// =============================================================================
// Exit subsystem — decay detectors feeding the exit watcher
// =============================================================================

pub mod harmonic;
pub mod structural;

use serde::{Deserialize, Serialize};

use crate::health::HealthIndex;
use crate::scoring::CompositeScore;
use crate::types::ExitSignal;

/// Advisory result of a position-health evaluation. Pure data; the exit
/// watcher decides whether to act on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvaluation {
    pub exit_type: ExitSignal,
    pub should_exit: bool,
    pub exit_reason: Option<String>,
    /// Fresh composite score, when telemetry allowed one.
    pub composite: Option<CompositeScore>,
    /// Fresh health index, when telemetry allowed one.
    pub health: Option<HealthIndex>,
}

impl HealthEvaluation {
    pub fn hold() -> Self {
        Self {
            exit_type: ExitSignal::None,
            should_exit: false,
            exit_reason: None,
            composite: None,
            health: None,
        }
    }
}
