// =============================================================================
// Capital Manager — persistent USD ledger
// =============================================================================
//
// Source of truth for available / locked / realized capital. Every mutation
// persists the materialized row before returning and appends an action-log
// record, so a crash between persist and return at worst leaves a locked
// amount the reconciler neutralizes on the next boot.
//
// `allocate` answers with a plain bool: insufficient funds is an ordinary
// rejection on the entry path, never an error.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::store::{CapitalRow, Store, StoreError};

/// Consistent snapshot of the ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CapitalState {
    pub available_balance: f64,
    pub locked_balance: f64,
    pub total_realized_pnl: f64,
}

struct Inner {
    available: f64,
    locked: f64,
    realized: f64,
    /// Locked amount per position id.
    allocations: HashMap<String, f64>,
}

/// Thread-safe persistent ledger. All operations serialize behind one lock,
/// held across the persistence call so the stored row never runs ahead of or
/// behind memory.
pub struct CapitalManager {
    inner: Mutex<Inner>,
    store: Store,
}

impl CapitalManager {
    /// Load the ledger row, or bootstrap it from `initial_capital` when the
    /// row is absent.
    pub async fn bootstrap(store: Store, initial_capital: f64) -> Result<Self, StoreError> {
        let row = match store.load_capital().await? {
            Some(row) => {
                info!(
                    available = row.available_balance,
                    locked = row.locked_balance,
                    realized = row.total_realized_pnl,
                    "[CAPITAL] ledger recovered"
                );
                row
            }
            None => {
                let row = CapitalRow {
                    available_balance: initial_capital,
                    locked_balance: 0.0,
                    total_realized_pnl: 0.0,
                };
                store.safe_upsert_capital(&row).await?;
                info!(initial_capital, "[CAPITAL] ledger bootstrapped");
                row
            }
        };

        Ok(Self {
            inner: Mutex::new(Inner {
                available: row.available_balance,
                locked: row.locked_balance,
                realized: row.total_realized_pnl,
                allocations: HashMap::new(),
            }),
            store,
        })
    }

    /// Atomically debit available and credit locked under `id`.
    ///
    /// Returns `false` (never errors) on insufficient funds, a non-positive
    /// amount, a duplicate id, or a persistence failure (the mutation is
    /// reverted so memory and disk stay consistent).
    pub async fn allocate(&self, id: &str, usd: f64) -> bool {
        let mut inner = self.inner.lock().await;

        if usd <= 0.0 {
            warn!(id, usd, "[CAPITAL] rejecting non-positive allocation");
            return false;
        }
        if inner.allocations.contains_key(id) {
            warn!(id, "[CAPITAL] rejecting duplicate allocation");
            return false;
        }
        if usd > inner.available {
            info!(
                id,
                requested = usd,
                available = inner.available,
                "[CAPITAL] insufficient funds"
            );
            return false;
        }

        inner.available -= usd;
        inner.locked += usd;
        inner.allocations.insert(id.to_string(), usd);

        if let Err(e) = self.persist(&inner).await {
            warn!(id, error = %e, "[CAPITAL] allocation persist failed — reverting");
            inner.available += usd;
            inner.locked -= usd;
            inner.allocations.remove(id);
            return false;
        }

        self.log_action("CAPITAL_ALLOCATE", id, usd).await;
        info!(id, usd, available = inner.available, locked = inner.locked, "[CAPITAL] allocated");
        true
    }

    /// Reverse an allocation, returning the released amount.
    pub async fn release(&self, id: &str) -> Result<f64, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(amount) = inner.allocations.remove(id) else {
            warn!(id, "[CAPITAL] release for unknown allocation");
            return Ok(0.0);
        };

        inner.available += amount;
        inner.locked -= amount;
        self.persist(&inner).await?;

        self.log_action("CAPITAL_RELEASE", id, amount).await;
        info!(id, amount, "[CAPITAL] released");
        Ok(amount)
    }

    /// Settle a position: `available += locked(id) + pnl`, locked(id) → 0,
    /// `total_realized_pnl += pnl`.
    pub async fn apply_pnl(&self, id: &str, pnl: f64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let locked = inner.allocations.remove(id).unwrap_or_else(|| {
            warn!(id, "[CAPITAL] apply_pnl with no recorded allocation");
            0.0
        });

        inner.available += locked + pnl;
        inner.locked -= locked;
        inner.realized += pnl;
        self.persist(&inner).await?;

        self.log_action("CAPITAL_PNL", id, pnl).await;
        info!(
            id,
            pnl,
            available = inner.available,
            locked = inner.locked,
            realized = inner.realized,
            "[CAPITAL] pnl applied"
        );
        Ok(())
    }

    /// Consistent read of the full ledger.
    pub async fn get_full_state(&self) -> CapitalState {
        let inner = self.inner.lock().await;
        CapitalState {
            available_balance: inner.available,
            locked_balance: inner.locked,
            total_realized_pnl: inner.realized,
        }
    }

    /// Alias read used by the entry path.
    pub async fn get_balance(&self) -> CapitalState {
        self.get_full_state().await
    }

    /// Total working capital (available + locked).
    pub async fn wallet(&self) -> f64 {
        let inner = self.inner.lock().await;
        inner.available + inner.locked
    }

    /// Locked amount recorded under `id`, if any.
    pub async fn locked_for(&self, id: &str) -> Option<f64> {
        self.inner.lock().await.allocations.get(id).copied()
    }

    /// Re-adopt an allocation recovered from persistence (used by
    /// `initialize` when reloading open positions after a restart).
    pub async fn adopt_allocation(&self, id: &str, usd: f64) {
        let mut inner = self.inner.lock().await;
        inner.allocations.insert(id.to_string(), usd);
    }

    async fn persist(&self, inner: &Inner) -> Result<(), StoreError> {
        self.store
            .safe_upsert_capital(&CapitalRow {
                available_balance: inner.available,
                locked_balance: inner.locked,
                total_realized_pnl: inner.realized,
            })
            .await
    }

    async fn log_action(&self, kind: &str, id: &str, usd: f64) {
        // The materialized row is authoritative; a failed journal append is
        // logged by the store and otherwise ignored.
        let _ = self
            .store
            .safe_append_action(kind, serde_json::json!({ "id": id, "usd": usd }))
            .await;
    }
}
