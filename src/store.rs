// =============================================================================
// Persistence Adapter — embedded SQL store for capital, trades, positions
// =============================================================================
//
// Every write goes through a safe wrapper that logs `[DB-ERROR]` with the
// operation tag, row id, and driver detail, then surfaces a typed error.
// Nothing here swallows a failure or retries; the caller decides (entry
// aborts and releases capital, exit-row failure preserves the open state,
// snapshot/log failures are logged and dropped).
//
// Layout invariants: `positions.trade_id = trades.id`, and
// `positions.closed_at IS NULL ⇔ trades.status = 'open'`.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Tables probed by the startup health check.
const REQUIRED_TABLES: [&str; 4] = ["capital_state", "trades", "positions", "action_log"];

/// Typed persistence failure. The `Write` variant carries the operation tag
/// and row id already logged under `[DB-ERROR]`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("db open failed: {0}")]
    Open(String),
    #[error("[DB-ERROR] {op} id={id}: {detail}")]
    Write {
        op: &'static str,
        id: String,
        detail: String,
    },
    #[error("db health check failed for table {table}: {detail}")]
    Health { table: String, detail: String },
}

/// One row per position lifetime in the `trades` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRow {
    pub id: String,
    pub pool: String,
    pub pool_name: String,
    pub size_usd: f64,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub entry_value_usd: f64,
    pub exit_value_usd: Option<f64>,
    pub fees_usd: f64,
    pub slippage_usd: f64,
    pub score: f64,
    pub velocity_slope: f64,
    pub liquidity_slope: f64,
    pub entropy_slope: f64,
    pub regime: String,
    /// "open" or "closed".
    pub status: String,
    pub exit_reason: Option<String>,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
}

/// Open-position view row, keyed by the owning trade id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRow {
    pub trade_id: String,
    pub pool: String,
    pub symbol: String,
    pub entry_bin: i32,
    pub current_bin: i32,
    pub size_usd: f64,
    pub health_score: Option<f64>,
    pub regime: String,
    pub pnl_usd: f64,
    pub pnl_pct: f64,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
    pub exit_reason: Option<String>,
}

/// Singleton capital ledger row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CapitalRow {
    pub available_balance: f64,
    pub locked_balance: f64,
    pub total_realized_pnl: f64,
}

/// Embedded SQL store shared across async tasks.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at `path` and ensure the schema exists.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Open(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init_schema(&conn)?;
        info!(path, "store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Open(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS capital_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                available_balance REAL NOT NULL,
                locked_balance REAL NOT NULL,
                total_realized_pnl REAL NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                pool TEXT NOT NULL,
                pool_name TEXT NOT NULL,
                size_usd REAL NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL,
                entry_value_usd REAL NOT NULL,
                exit_value_usd REAL,
                fees_usd REAL NOT NULL,
                slippage_usd REAL NOT NULL,
                score REAL NOT NULL,
                velocity_slope REAL NOT NULL,
                liquidity_slope REAL NOT NULL,
                entropy_slope REAL NOT NULL,
                regime TEXT NOT NULL,
                status TEXT NOT NULL,
                exit_reason TEXT,
                opened_at INTEGER NOT NULL,
                closed_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status);
            CREATE TABLE IF NOT EXISTS positions (
                trade_id TEXT PRIMARY KEY,
                pool TEXT NOT NULL,
                symbol TEXT NOT NULL,
                entry_bin INTEGER NOT NULL,
                current_bin INTEGER NOT NULL,
                size_usd REAL NOT NULL,
                health_score REAL,
                regime TEXT NOT NULL,
                pnl_usd REAL NOT NULL DEFAULT 0,
                pnl_pct REAL NOT NULL DEFAULT 0,
                opened_at INTEGER NOT NULL,
                closed_at INTEGER,
                exit_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_positions_closed ON positions(closed_at);
            CREATE TABLE IF NOT EXISTS action_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL
            );",
        )
        .map_err(|e| StoreError::Open(e.to_string()))
    }

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------

    /// Probe every required table. Bootstrap must abort on failure.
    pub async fn verify_db_health(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        for table in REQUIRED_TABLES {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get::<_, i64>(0)
            })
            .map_err(|e| {
                error!(table, detail = %e, "[DB-ERROR] health check failed");
                StoreError::Health {
                    table: table.to_string(),
                    detail: e.to_string(),
                }
            })?;
        }
        info!(tables = REQUIRED_TABLES.len(), "db health verified");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Capital state
    // -------------------------------------------------------------------------

    /// Upsert the singleton capital row.
    pub async fn safe_upsert_capital(&self, capital: &CapitalRow) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO capital_state (id, available_balance, locked_balance, total_realized_pnl, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                available_balance = excluded.available_balance,
                locked_balance = excluded.locked_balance,
                total_realized_pnl = excluded.total_realized_pnl,
                updated_at = excluded.updated_at",
            params![
                capital.available_balance,
                capital.locked_balance,
                capital.total_realized_pnl,
                Utc::now().timestamp_millis()
            ],
        );
        surface("upsert_capital", "capital_state", result.map(|_| ()))
    }

    pub async fn load_capital(&self) -> Result<Option<CapitalRow>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT available_balance, locked_balance, total_realized_pnl
             FROM capital_state WHERE id = 1",
            [],
            |row| {
                Ok(CapitalRow {
                    available_balance: row.get(0)?,
                    locked_balance: row.get(1)?,
                    total_realized_pnl: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(|e| write_error("load_capital", "capital_state", e.to_string()))
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    pub async fn safe_insert_trade(&self, trade: &TradeRow) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO trades (id, pool, pool_name, size_usd, entry_price, exit_price,
                entry_value_usd, exit_value_usd, fees_usd, slippage_usd, score,
                velocity_slope, liquidity_slope, entropy_slope, regime, status,
                exit_reason, opened_at, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                trade.id,
                trade.pool,
                trade.pool_name,
                trade.size_usd,
                trade.entry_price,
                trade.exit_price,
                trade.entry_value_usd,
                trade.exit_value_usd,
                trade.fees_usd,
                trade.slippage_usd,
                trade.score,
                trade.velocity_slope,
                trade.liquidity_slope,
                trade.entropy_slope,
                trade.regime,
                trade.status,
                trade.exit_reason,
                trade.opened_at,
                trade.closed_at
            ],
        );
        let out = surface("insert_trade", &trade.id, result.map(|_| ()));
        if out.is_ok() {
            debug!(id = %trade.id, pool = %trade.pool, "[DB-WRITE] trade row inserted");
        }
        out
    }

    /// Finalize a trade's exit columns and flip its status to closed.
    #[allow(clippy::too_many_arguments)]
    pub async fn safe_update_trade_exit(
        &self,
        id: &str,
        exit_price: f64,
        exit_value_usd: f64,
        fees_usd: f64,
        slippage_usd: f64,
        exit_reason: &str,
        closed_at: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "UPDATE trades SET exit_price = ?2, exit_value_usd = ?3, fees_usd = fees_usd + ?4,
                slippage_usd = slippage_usd + ?5, exit_reason = ?6, status = 'closed', closed_at = ?7
             WHERE id = ?1",
            params![id, exit_price, exit_value_usd, fees_usd, slippage_usd, exit_reason, closed_at],
        );
        let out = match result {
            Ok(0) => Err(write_error(
                "update_trade_exit",
                id,
                "no trade row matched".to_string(),
            )),
            other => surface("update_trade_exit", id, other.map(|_| ())),
        };
        if out.is_ok() {
            info!(id, exit_reason, "[DB-WRITE] trade exit recorded");
        }
        out
    }

    pub async fn trade(&self, id: &str) -> Result<Option<TradeRow>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("{TRADE_SELECT} WHERE id = ?1"),
            params![id],
            map_trade,
        )
        .optional()
        .map_err(|e| write_error("load_trade", id, e.to_string()))
    }

    pub async fn open_trades(&self) -> Result<Vec<TradeRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached(&format!("{TRADE_SELECT} WHERE status = 'open' ORDER BY opened_at ASC"))
            .map_err(|e| write_error("open_trades", "trades", e.to_string()))?;
        let rows = stmt
            .query_map([], map_trade)
            .map_err(|e| write_error("open_trades", "trades", e.to_string()))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    pub async fn safe_insert_position(&self, position: &PositionRow) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO positions (trade_id, pool, symbol, entry_bin, current_bin, size_usd,
                health_score, regime, pnl_usd, pnl_pct, opened_at, closed_at, exit_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                position.trade_id,
                position.pool,
                position.symbol,
                position.entry_bin,
                position.current_bin,
                position.size_usd,
                position.health_score,
                position.regime,
                position.pnl_usd,
                position.pnl_pct,
                position.opened_at,
                position.closed_at,
                position.exit_reason
            ],
        );
        surface("insert_position", &position.trade_id, result.map(|_| ()))
    }

    /// Regime-updater write: fresh health score and current regime only.
    /// Entry-time columns are never touched here.
    pub async fn safe_update_position_health(
        &self,
        trade_id: &str,
        health_score: f64,
        regime: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "UPDATE positions SET health_score = ?2, regime = ?3 WHERE trade_id = ?1",
            params![trade_id, health_score, regime],
        );
        match result {
            Ok(0) => Err(write_error(
                "update_position_health",
                trade_id,
                "no position row matched".to_string(),
            )),
            other => surface("update_position_health", trade_id, other.map(|_| ())),
        }
    }

    /// Bin-tracker write: current bin only.
    pub async fn safe_update_position_bin(
        &self,
        trade_id: &str,
        current_bin: i32,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "UPDATE positions SET current_bin = ?2 WHERE trade_id = ?1",
            params![trade_id, current_bin],
        );
        match result {
            Ok(0) => Err(write_error(
                "update_position_bin",
                trade_id,
                "no position row matched".to_string(),
            )),
            other => surface("update_position_bin", trade_id, other.map(|_| ())),
        }
    }

    /// Finalize a position row on exit.
    pub async fn safe_close_position(
        &self,
        trade_id: &str,
        pnl_usd: f64,
        pnl_pct: f64,
        exit_reason: &str,
        closed_at: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "UPDATE positions SET pnl_usd = ?2, pnl_pct = ?3, exit_reason = ?4, closed_at = ?5
             WHERE trade_id = ?1",
            params![trade_id, pnl_usd, pnl_pct, exit_reason, closed_at],
        );
        match result {
            Ok(0) => Err(write_error(
                "close_position",
                trade_id,
                "no position row matched".to_string(),
            )),
            other => surface("close_position", trade_id, other.map(|_| ())),
        }
    }

    pub async fn position(&self, trade_id: &str) -> Result<Option<PositionRow>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("{POSITION_SELECT} WHERE trade_id = ?1"),
            params![trade_id],
            map_position,
        )
        .optional()
        .map_err(|e| write_error("load_position", trade_id, e.to_string()))
    }

    pub async fn open_positions(&self) -> Result<Vec<PositionRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached(&format!(
                "{POSITION_SELECT} WHERE closed_at IS NULL ORDER BY opened_at ASC"
            ))
            .map_err(|e| write_error("open_positions", "positions", e.to_string()))?;
        let rows = stmt
            .query_map([], map_position)
            .map_err(|e| write_error("open_positions", "positions", e.to_string()))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Action log
    // -------------------------------------------------------------------------

    /// Append-only action record with a JSON payload.
    pub async fn safe_append_action(
        &self,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO action_log (ts, kind, payload) VALUES (?1, ?2, ?3)",
            params![Utc::now().timestamp_millis(), kind, payload.to_string()],
        );
        surface("append_action", kind, result.map(|_| ()))
    }

    pub async fn action_count(&self, kind: &str) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM action_log WHERE kind = ?1",
            params![kind],
            |row| row.get(0),
        )
        .map_err(|e| write_error("action_count", kind, e.to_string()))
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Raw statement passthrough for maintenance and fault-injection in tests.
    pub async fn execute_raw(&self, sql: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute_batch(sql)
            .map_err(|e| write_error("execute_raw", "-", e.to_string()))
    }
}

const TRADE_SELECT: &str = "SELECT id, pool, pool_name, size_usd, entry_price, exit_price,
    entry_value_usd, exit_value_usd, fees_usd, slippage_usd, score, velocity_slope,
    liquidity_slope, entropy_slope, regime, status, exit_reason, opened_at, closed_at
    FROM trades";

const POSITION_SELECT: &str = "SELECT trade_id, pool, symbol, entry_bin, current_bin, size_usd,
    health_score, regime, pnl_usd, pnl_pct, opened_at, closed_at, exit_reason
    FROM positions";

fn map_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRow> {
    Ok(TradeRow {
        id: row.get(0)?,
        pool: row.get(1)?,
        pool_name: row.get(2)?,
        size_usd: row.get(3)?,
        entry_price: row.get(4)?,
        exit_price: row.get(5)?,
        entry_value_usd: row.get(6)?,
        exit_value_usd: row.get(7)?,
        fees_usd: row.get(8)?,
        slippage_usd: row.get(9)?,
        score: row.get(10)?,
        velocity_slope: row.get(11)?,
        liquidity_slope: row.get(12)?,
        entropy_slope: row.get(13)?,
        regime: row.get(14)?,
        status: row.get(15)?,
        exit_reason: row.get(16)?,
        opened_at: row.get(17)?,
        closed_at: row.get(18)?,
    })
}

fn map_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<PositionRow> {
    Ok(PositionRow {
        trade_id: row.get(0)?,
        pool: row.get(1)?,
        symbol: row.get(2)?,
        entry_bin: row.get(3)?,
        current_bin: row.get(4)?,
        size_usd: row.get(5)?,
        health_score: row.get(6)?,
        regime: row.get(7)?,
        pnl_usd: row.get(8)?,
        pnl_pct: row.get(9)?,
        opened_at: row.get(10)?,
        closed_at: row.get(11)?,
        exit_reason: row.get(12)?,
    })
}

fn write_error(op: &'static str, id: &str, detail: String) -> StoreError {
    error!("[DB-ERROR] {op} id={id}: {detail}");
    StoreError::Write {
        op,
        id: id.to_string(),
        detail,
    }
}

fn surface(
    op: &'static str,
    id: &str,
    result: Result<(), rusqlite::Error>,
) -> Result<(), StoreError> {
    result.map_err(|e| write_error(op, id, e.to_string()))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

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
    async fn health_check_passes_on_fresh_schema() {
        let store = Store::open_in_memory().unwrap();
        store.verify_db_health().await.unwrap();
    }

    #[tokio::test]
    async fn health_check_fails_on_missing_table() {
        let store = Store::open_in_memory().unwrap();
        store.execute_raw("DROP TABLE trades").await.unwrap();
        let err = store.verify_db_health().await.unwrap_err();
        match err {
            StoreError::Health { table, .. } => assert_eq!(table, "trades"),
            other => panic!("expected health error, got {other}"),
        }
    }

    #[tokio::test]
    async fn trade_roundtrip_and_exit() {
        let store = Store::open_in_memory().unwrap();
        store.safe_insert_trade(&trade("t1")).await.unwrap();

        let loaded = store.trade("t1").await.unwrap().unwrap();
        assert_eq!(loaded.status, "open");
        assert!(loaded.closed_at.is_none());

        store
            .safe_update_trade_exit("t1", 1.05, 298.8, 0.9, 0.3, "MANUAL_CLOSE", 1_700_000_100_000)
            .await
            .unwrap();

        let closed = store.trade("t1").await.unwrap().unwrap();
        assert_eq!(closed.status, "closed");
        assert_eq!(closed.exit_reason.as_deref(), Some("MANUAL_CLOSE"));
        assert_eq!(closed.closed_at, Some(1_700_000_100_000));
        // Exit fees accumulate on top of entry fees.
        assert!((closed.fees_usd - 1.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn duplicate_trade_insert_is_an_error() {
        let store = Store::open_in_memory().unwrap();
        store.safe_insert_trade(&trade("t1")).await.unwrap();
        let err = store.safe_insert_trade(&trade("t1")).await.unwrap_err();
        match err {
            StoreError::Write { op, id, .. } => {
                assert_eq!(op, "insert_trade");
                assert_eq!(id, "t1");
            }
            other => panic!("expected write error, got {other}"),
        }
    }

    #[tokio::test]
    async fn updating_missing_trade_is_an_error() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .safe_update_trade_exit("ghost", 1.0, 1.0, 0.0, 0.0, "X", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
    }

    #[tokio::test]
    async fn open_trades_filters_by_status() {
        let store = Store::open_in_memory().unwrap();
        store.safe_insert_trade(&trade("t1")).await.unwrap();
        store.safe_insert_trade(&trade("t2")).await.unwrap();
        store
            .safe_update_trade_exit("t1", 1.0, 298.0, 0.9, 0.3, "X", 1)
            .await
            .unwrap();

        let open = store.open_trades().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "t2");
    }

    #[tokio::test]
    async fn position_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        store.safe_insert_position(&position("t1")).await.unwrap();

        store
            .safe_update_position_health("t1", 0.55, "BEAR")
            .await
            .unwrap();
        store.safe_update_position_bin("t1", 14).await.unwrap();

        let row = store.position("t1").await.unwrap().unwrap();
        assert_eq!(row.current_bin, 14);
        assert_eq!(row.regime, "BEAR");
        assert!((row.health_score.unwrap() - 0.55).abs() < 1e-12);
        // Entry bin untouched.
        assert_eq!(row.entry_bin, 10);

        store
            .safe_close_position("t1", -1.2, -0.004, "MANUAL_CLOSE", 99)
            .await
            .unwrap();
        let closed = store.position("t1").await.unwrap().unwrap();
        assert_eq!(closed.closed_at, Some(99));
        assert!(store.open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn capital_upsert_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.load_capital().await.unwrap().is_none());

        let row = CapitalRow {
            available_balance: 9_700.0,
            locked_balance: 300.0,
            total_realized_pnl: 0.0,
        };
        store.safe_upsert_capital(&row).await.unwrap();
        store
            .safe_upsert_capital(&CapitalRow {
                available_balance: 10_000.0,
                locked_balance: 0.0,
                total_realized_pnl: -1.2,
            })
            .await
            .unwrap();

        let loaded = store.load_capital().await.unwrap().unwrap();
        assert!((loaded.available_balance - 10_000.0).abs() < 1e-9);
        assert!((loaded.locked_balance).abs() < 1e-9);
        assert!((loaded.total_realized_pnl + 1.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn action_log_appends() {
        let store = Store::open_in_memory().unwrap();
        store
            .safe_append_action("ENTRY", serde_json::json!({"id": "t1"}))
            .await
            .unwrap();
        store
            .safe_append_action("ENTRY", serde_json::json!({"id": "t2"}))
            .await
            .unwrap();
        store
            .safe_append_action("TRADE_EXIT", serde_json::json!({"id": "t1"}))
            .await
            .unwrap();

        assert_eq!(store.action_count("ENTRY").await.unwrap(), 2);
        assert_eq!(store.action_count("TRADE_EXIT").await.unwrap(), 1);
        assert_eq!(store.action_count("PORTFOLIO_SNAPSHOT").await.unwrap(), 0);
    }
}
