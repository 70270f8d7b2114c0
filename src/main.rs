// =============================================================================
// Meridian — CLAMM liquidity-provision engine, main entry point
// =============================================================================
//
// Bootstrap order is load-bearing: configuration (fatal without an RPC
// endpoint), store + health check (fatal), boot reconciliation, capital
// ledger, engine initialize, then the six loops. Nothing trades until every
// earlier stage has succeeded.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod capital;
mod chain;
mod config;
mod engine;
mod exit;
mod health;
mod metrics;
mod normalize;
mod oracle;
mod position;
mod reconcile;
mod regime;
mod scoring;
mod sizing;
mod store;
mod telemetry;
mod types;
mod volatility;

use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::capital::CapitalManager;
use crate::chain::{hydrate_batch, PoolHydrator, RpcHydrator};
use crate::config::EngineConfig;
use crate::engine::ExecutionEngine;
use crate::normalize::ValueNormalizer;
use crate::oracle::HttpPriceOracle;
use crate::store::Store;

/// Default price-oracle endpoint; override with ORACLE_URL.
const DEFAULT_ORACLE_URL: &str = "https://lite-api.jup.ag/price/v2";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Meridian Liquidity Engine — Starting Up         ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // Configuration is fatal-on-failure: no RPC endpoint, no process.
    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration invalid — terminating");
            return Err(e);
        }
    };

    // ── 2. Store + health check ──────────────────────────────────────────
    let store = Store::open(&config.persistence_path)
        .context("failed to open persistence store")?;
    if let Err(e) = store.verify_db_health().await {
        error!(error = %e, "db health check failed — terminating");
        return Err(e.into());
    }

    // ── 3. Boot reconciliation ───────────────────────────────────────────
    let summary = reconcile::reconcile_on_boot(&store)
        .await
        .context("boot reconciliation failed")?;
    if summary.positions_closed > 0 || summary.trades_closed > 0 {
        warn!(
            positions = summary.positions_closed,
            trades = summary.trades_closed,
            "orphaned rows force-closed from a prior crash"
        );
    }

    // ── 4. Capital ledger ────────────────────────────────────────────────
    let capital = Arc::new(
        CapitalManager::bootstrap(store.clone(), config.initial_capital_usd)
            .await
            .context("capital ledger bootstrap failed")?,
    );

    // ── 5. External adapters ─────────────────────────────────────────────
    let normalizer = Arc::new(ValueNormalizer::new());
    let oracle_url =
        std::env::var("ORACLE_URL").unwrap_or_else(|_| DEFAULT_ORACLE_URL.to_string());
    let oracle = Arc::new(HttpPriceOracle::new(oracle_url));
    let hydrator: Arc<dyn PoolHydrator> = Arc::new(RpcHydrator::new(
        config.rpc_url.clone(),
        normalizer.clone(),
        oracle,
    ));

    // ── 6. Engine ────────────────────────────────────────────────────────
    let engine = Arc::new(ExecutionEngine::new(
        config.clone(),
        store,
        capital,
        normalizer,
    ));

    if !engine.initialize().await {
        error!("engine initialization failed — terminating");
        bail!("engine initialization failed");
    }
    engine.start();

    // ── 7. Hydration driver ──────────────────────────────────────────────
    // Keeps telemetry fresh for every pool the engine knows about. Candidate
    // pools arrive from the embedding scan driver via `place_pools`.
    let hydration_engine = engine.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(10));
        loop {
            ticker.tick().await;
            let pools = hydration_engine.known_pools();
            if pools.is_empty() {
                continue;
            }
            for hydrated in hydrate_batch(hydrator.as_ref(), &pools).await {
                hydration_engine.ingest(hydrated);
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");
    engine.stop().await;

    info!("Meridian shut down complete.");
    Ok(())
}
