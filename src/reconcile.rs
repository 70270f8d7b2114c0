// =============================================================================
// Reconciler — neutralize orphaned rows from prior crashes
// =============================================================================
//
// Runs once at boot, after the DB health check and before the engine starts.
// A crash mid-exit can leave the persistent record inconsistent with the
// in-memory truth, and the in-memory truth is gone on restart. Rows that form
// a mutually consistent open pair (open trade + open position under the same
// id) are left for `initialize()` to re-adopt; every other open row is an
// orphan and is force-closed at zero PnL.
//
// Idempotent: a second pass over a clean database touches nothing.
// =============================================================================

use std::collections::HashSet;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::store::{Store, StoreError};

/// Reason stamped on force-closed rows.
pub const FORCE_CLOSED_REASON: &str = "FORCE_CLOSED_ON_BOOT";

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    /// Orphan position rows force-closed.
    pub positions_closed: u32,
    /// Orphan trade rows force-closed.
    pub trades_closed: u32,
    /// Consistent open pairs left for recovery.
    pub recovered_pairs: u32,
    pub timestamp: String,
}

/// Run one boot-time reconciliation pass.
pub async fn reconcile_on_boot(store: &Store) -> Result<ReconcileSummary, StoreError> {
    let now = Utc::now();
    let now_millis = now.timestamp_millis();

    let open_trades = store.open_trades().await?;
    let open_positions = store.open_positions().await?;

    let trade_ids: HashSet<String> = open_trades.iter().map(|t| t.id.clone()).collect();
    let position_ids: HashSet<String> = open_positions
        .iter()
        .map(|p| p.trade_id.clone())
        .collect();

    let recovered_pairs = trade_ids.intersection(&position_ids).count() as u32;

    // Orphan position rows: open position with no open trade.
    let mut positions_closed = 0u32;
    for position in &open_positions {
        if trade_ids.contains(&position.trade_id) {
            continue;
        }
        warn!(
            id = %position.trade_id,
            pool = %position.pool,
            "orphan position row — force closing"
        );
        store
            .safe_close_position(&position.trade_id, 0.0, 0.0, FORCE_CLOSED_REASON, now_millis)
            .await?;
        let _ = store
            .safe_append_action(
                "FORCE_CLOSE",
                serde_json::json!({ "id": position.trade_id, "kind": "position" }),
            )
            .await;
        positions_closed += 1;
    }

    // Orphan trade rows: open trade with no open position.
    let mut trades_closed = 0u32;
    for trade in &open_trades {
        if position_ids.contains(&trade.id) {
            continue;
        }
        warn!(id = %trade.id, pool = %trade.pool, "orphan trade row — force closing");
        store
            .safe_update_trade_exit(
                &trade.id,
                trade.entry_price,
                trade.size_usd,
                0.0,
                0.0,
                FORCE_CLOSED_REASON,
                now_millis,
            )
            .await?;
        let _ = store
            .safe_append_action(
                "FORCE_CLOSE",
                serde_json::json!({ "id": trade.id, "kind": "trade" }),
            )
            .await;
        trades_closed += 1;
    }

    let summary = ReconcileSummary {
        positions_closed,
        trades_closed,
        recovered_pairs,
        timestamp: now.to_rfc3339(),
    };

    info!(
        positions_closed,
        trades_closed,
        recovered_pairs,
        "boot reconciliation completed"
    );
    Ok(summary)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PositionRow, TradeRow};

    fn trade(id: &str) -> TradeRow {
        TradeRow {
            id: id.to_string(),
            pool: "pool1".to_string(),
            pool_name: "SOL-USDC".to_string(),
            size_usd: 300.0,
            entry_price: 1.05,
            exit_price: None,
            entry_value_usd: 298.8,
            exit_value_usd: None,
            fees_usd: 0.9,
            slippage_usd: 0.3,
            score: 55.0,
            velocity_slope: 0.01,
            liquidity_slope: 0.005,
            entropy_slope: 0.0,
            regime: "NEUTRAL".to_string(),
            status: "open".to_string(),
            exit_reason: None,
            opened_at: 1_700_000_000_000,
            closed_at: None,
        }
    }

    fn position(id: &str) -> PositionRow {
        PositionRow {
            trade_id: id.to_string(),
            pool: "pool1".to_string(),
            symbol: "SOL-USDC".to_string(),
            entry_bin: 10,
            current_bin: 10,
            size_usd: 300.0,
            health_score: Some(0.7),
            regime: "NEUTRAL".to_string(),
            pnl_usd: 0.0,
            pnl_pct: 0.0,
            opened_at: 1_700_000_000_000,
            closed_at: None,
            exit_reason: None,
        }
    }

    #[tokio::test]
    async fn orphan_position_row_is_force_closed() {
        // Position row with no trade row at all.
        let store = Store::open_in_memory().unwrap();
        store.safe_insert_position(&position("p1")).await.unwrap();

        let summary = reconcile_on_boot(&store).await.unwrap();
        assert_eq!(summary.positions_closed, 1);
        assert_eq!(summary.trades_closed, 0);
        assert_eq!(summary.recovered_pairs, 0);

        let row = store.position("p1").await.unwrap().unwrap();
        assert!(row.closed_at.is_some());
        assert_eq!(row.exit_reason.as_deref(), Some(FORCE_CLOSED_REASON));
        assert!(row.pnl_usd.abs() < 1e-12);
    }

    #[tokio::test]
    async fn orphan_trade_row_is_force_closed() {
        let store = Store::open_in_memory().unwrap();
        store.safe_insert_trade(&trade("t1")).await.unwrap();

        let summary = reconcile_on_boot(&store).await.unwrap();
        assert_eq!(summary.trades_closed, 1);

        let row = store.trade("t1").await.unwrap().unwrap();
        assert_eq!(row.status, "closed");
        assert_eq!(row.exit_reason.as_deref(), Some(FORCE_CLOSED_REASON));
        // Zero-PnL close: exit price pinned to entry.
        assert_eq!(row.exit_price, Some(row.entry_price));
    }

    #[tokio::test]
    async fn consistent_pairs_are_left_for_recovery() {
        let store = Store::open_in_memory().unwrap();
        store.safe_insert_trade(&trade("t1")).await.unwrap();
        store.safe_insert_position(&position("t1")).await.unwrap();

        let summary = reconcile_on_boot(&store).await.unwrap();
        assert_eq!(summary.positions_closed, 0);
        assert_eq!(summary.trades_closed, 0);
        assert_eq!(summary.recovered_pairs, 1);

        assert_eq!(store.trade("t1").await.unwrap().unwrap().status, "open");
        assert!(store
            .position("t1")
            .await
            .unwrap()
            .unwrap()
            .closed_at
            .is_none());
    }

    #[tokio::test]
    async fn reconciler_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.safe_insert_trade(&trade("orphan")).await.unwrap();
        store.safe_insert_position(&position("pair")).await.unwrap();
        store.safe_insert_trade(&trade("pair")).await.unwrap();

        let first = reconcile_on_boot(&store).await.unwrap();
        assert_eq!(first.trades_closed, 1);

        // Second pass finds nothing left to neutralize.
        let second = reconcile_on_boot(&store).await.unwrap();
        assert_eq!(second.positions_closed, 0);
        assert_eq!(second.trades_closed, 0);
        assert_eq!(second.recovered_pairs, 1);
    }

    #[tokio::test]
    async fn clean_database_is_a_no_op() {
        let store = Store::open_in_memory().unwrap();
        let summary = reconcile_on_boot(&store).await.unwrap();
        assert_eq!(summary.positions_closed, 0);
        assert_eq!(summary.trades_closed, 0);
        assert_eq!(summary.recovered_pairs, 0);
    }

    #[tokio::test]
    async fn mixed_orphans_resolved_in_one_pass() {
        let store = Store::open_in_memory().unwrap();
        store.safe_insert_trade(&trade("orphan-trade")).await.unwrap();
        store
            .safe_insert_position(&position("orphan-pos"))
            .await
            .unwrap();
        store.safe_insert_trade(&trade("pair")).await.unwrap();
        store.safe_insert_position(&position("pair")).await.unwrap();

        let summary = reconcile_on_boot(&store).await.unwrap();
        assert_eq!(summary.trades_closed, 1);
        assert_eq!(summary.positions_closed, 1);
        assert_eq!(summary.recovered_pairs, 1);
        assert_eq!(store.action_count("FORCE_CLOSE").await.unwrap(), 2);
    }
}
