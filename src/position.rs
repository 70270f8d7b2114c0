// =============================================================================
// Position model + book — state machine for open / closing / closed trades
// =============================================================================
//
// Life-cycle:
//   Open  ->  Closing  ->  Closed
//
// The single legal reversion is Closing -> Open when the trade-exit row
// fails to persist; the position then stays open and re-eligible for future
// exits. The tagged state replaces separate closed / pending-exit flags, so
// "closed implies state Closed" holds by construction.
//
// Thread-safety: all mutable state is behind `parking_lot` locks; the exit
// lock registry is an atomic test-and-set keyed by position id.
// =============================================================================

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::regime::BinWidth;
use crate::types::{MigrationDirection, Regime};

/// Tagged exit state of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitState {
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for ExitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// A single tracked liquidity position.
///
/// Entry-time fields (everything prefixed `entry_`) are frozen at open and
/// never mutated by the monitoring loops; the loops touch only the derived
/// fields: `current_price`, `current_bin`, `bin_offset`, `pnl`, `pnl_percent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4) — also the trade-row primary key.
    pub id: String,
    pub pool: String,
    pub symbol: String,
    pub entry_price: f64,
    pub current_price: f64,
    pub size_usd: f64,
    pub pnl: f64,
    pub pnl_percent: f64,
    /// Bin cluster the liquidity was spread across.
    pub bins: Vec<i32>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
    pub entry_bin: i32,
    pub current_bin: i32,
    pub bin_offset: i32,
    pub entry_fee_intensity: f64,
    pub entry_swap_velocity: f64,
    pub entry_fee_intensity_3m: f64,
    pub entry_tier4_score: f64,
    pub entry_regime: Regime,
    pub entry_migration_direction: MigrationDirection,
    pub entry_velocity_slope: f64,
    pub entry_liquidity_slope: f64,
    pub entry_entropy_slope: f64,
    pub entry_bin_width: BinWidth,
    pub entry_threshold: f64,
    pub exit_threshold: f64,
    pub exit_state: ExitState,
}

impl Position {
    pub fn closed(&self) -> bool {
        self.exit_state == ExitState::Closed
    }

    pub fn pending_exit(&self) -> bool {
        self.exit_state == ExitState::Closing
    }
}

// ---------------------------------------------------------------------------
// Position book
// ---------------------------------------------------------------------------

/// Owner of the active and archived position sets plus the process-wide exit
/// lock registry.
pub struct PositionBook {
    open: RwLock<HashMap<String, Position>>,
    closed: RwLock<Vec<Position>>,
    exit_locks: Mutex<HashSet<String>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            open: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
            exit_locks: Mutex::new(HashSet::new()),
        }
    }

    /// Register a freshly opened position.
    pub fn insert(&self, position: Position) {
        self.open.write().insert(position.id.clone(), position);
    }

    /// Owned copy of a position, open or archived.
    pub fn get(&self, id: &str) -> Option<Position> {
        if let Some(p) = self.open.read().get(id) {
            return Some(p.clone());
        }
        self.closed.read().iter().find(|p| p.id == id).cloned()
    }

    /// Owned copies of all open positions.
    pub fn open_positions(&self) -> Vec<Position> {
        self.open.read().values().cloned().collect()
    }

    pub fn open_ids(&self) -> Vec<String> {
        self.open.read().keys().cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.open.read().len()
    }

    pub fn holds_pool(&self, pool: &str) -> bool {
        self.open.read().values().any(|p| p.pool == pool)
    }

    /// Sum of open-position sizes (exposure).
    pub fn open_exposure(&self) -> f64 {
        self.open.read().values().map(|p| p.size_usd).sum()
    }

    /// Most recent `count` archived positions, newest first.
    pub fn closed_positions(&self, count: usize) -> Vec<Position> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }

    /// Apply a mutation to an open position. Returns false when the id is not
    /// in the active set.
    pub fn mutate<F: FnOnce(&mut Position)>(&self, id: &str, f: F) -> bool {
        let mut open = self.open.write();
        match open.get_mut(id) {
            Some(position) => {
                f(position);
                true
            }
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Exit authority
    // -------------------------------------------------------------------------

    /// Atomic test-and-set on the exit lock for `id`. Exactly one caller in
    /// any race wins; everyone else gets `false`.
    pub fn acquire_exit_lock(&self, id: &str, caller: &str) -> bool {
        let mut locks = self.exit_locks.lock();
        if locks.insert(id.to_string()) {
            info!(id, caller, "[EXIT_AUTH] exit lock acquired");
            true
        } else {
            debug!(id, caller, "[EXIT_AUTH] exit lock already held");
            false
        }
    }

    pub fn release_exit_lock(&self, id: &str) {
        if self.exit_locks.lock().remove(id) {
            debug!(id, "[EXIT_AUTH] exit lock released");
        }
    }

    pub fn exit_lock_held(&self, id: &str) -> bool {
        self.exit_locks.lock().contains(id)
    }

    /// Transition an open position to `Closing`. The caller must hold the
    /// exit lock.
    pub fn begin_closing(&self, id: &str) -> bool {
        self.mutate(id, |p| p.exit_state = ExitState::Closing)
    }

    /// Revert a `Closing` position to `Open` (trade-exit persistence failed).
    pub fn revert_closing(&self, id: &str) -> bool {
        self.mutate(id, |p| p.exit_state = ExitState::Open)
    }

    /// Finalize a close: stamp the position, move it from the active set to
    /// the archive, and return the archived copy.
    pub fn finalize_close(
        &self,
        id: &str,
        reason: &str,
        closed_at: DateTime<Utc>,
    ) -> Option<Position> {
        let mut open = self.open.write();
        let mut position = open.remove(id)?;
        position.exit_state = ExitState::Closed;
        position.closed_at = Some(closed_at);
        position.exit_reason = Some(reason.to_string());

        let archived = position.clone();
        self.closed.write().push(position);
        Some(archived)
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionBook")
            .field("open", &self.open.read().len())
            .field("closed", &self.closed.read().len())
            .finish()
    }
}
