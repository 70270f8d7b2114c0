// =============================================================================
// Engine Configuration — environment-driven settings
// =============================================================================
//
// All tunables come from the process environment (plus .env via dotenv at the
// call site in main). The RPC endpoint resolves through a three-level
// priority chain; if every level is absent the process must terminate loudly
// before any loop starts.
// =============================================================================

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

/// Helius-templated RPC endpoint used when only an API key is configured.
const HELIUS_RPC_TEMPLATE: &str = "https://mainnet.helius-rpc.com/?api-key=";

fn default_persistence_path() -> String {
    "meridian.db".to_string()
}

fn default_initial_capital_usd() -> f64 {
    10_000.0
}

fn default_max_concurrent_pools() -> usize {
    3
}

fn default_max_exposure_pct() -> f64 {
    0.30
}

/// Fixed cadences for the six monitoring loops, in seconds.
#[derive(Debug, Clone, Copy)]
pub struct LoopCadence {
    pub price_watcher_secs: u64,
    pub exit_watcher_secs: u64,
    pub snapshot_writer_secs: u64,
    pub pnl_drift_secs: u64,
    pub regime_updater_secs: u64,
    pub bin_tracker_secs: u64,
}

impl Default for LoopCadence {
    fn default() -> Self {
        Self {
            price_watcher_secs: 5,
            exit_watcher_secs: 10,
            snapshot_writer_secs: 60,
            pnl_drift_secs: 15,
            regime_updater_secs: 30,
            bin_tracker_secs: 5,
        }
    }
}

/// Top-level engine configuration resolved once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Resolved on-chain RPC endpoint.
    pub rpc_url: String,
    /// Path of the embedded persistence database.
    pub persistence_path: String,
    /// Capital used to bootstrap the ledger when no row exists yet.
    pub initial_capital_usd: f64,
    /// Cap on simultaneously open positions.
    pub max_concurrent_pools: usize,
    /// Cap on summed open-position USD as a fraction of the wallet.
    pub max_exposure_pct: f64,
    pub cadence: LoopCadence,
}

impl EngineConfig {
    /// Resolve the full configuration from the process environment.
    ///
    /// Fails (and the caller must terminate) when no RPC endpoint can be
    /// resolved or when a numeric variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Testable core: resolve from an arbitrary key lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let rpc_url = resolve_rpc_url(&get)?;

        if get("PERSISTENCE_KEY").is_some() {
            warn!("PERSISTENCE_KEY is set but unused — the embedded store takes no credential");
        }

        let persistence_path =
            get("PERSISTENCE_URL").unwrap_or_else(default_persistence_path);

        let initial_capital_usd = match get("INITIAL_CAPITAL_USD") {
            Some(raw) => raw
                .parse::<f64>()
                .with_context(|| format!("INITIAL_CAPITAL_USD is not a number: {raw:?}"))?,
            None => default_initial_capital_usd(),
        };

        let max_concurrent_pools = match get("MAX_CONCURRENT_POOLS") {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("MAX_CONCURRENT_POOLS is not an integer: {raw:?}"))?,
            None => default_max_concurrent_pools(),
        };

        let max_exposure_pct = match get("MAX_EXPOSURE_PCT") {
            Some(raw) => raw
                .parse::<f64>()
                .with_context(|| format!("MAX_EXPOSURE_PCT is not a number: {raw:?}"))?,
            None => default_max_exposure_pct(),
        };

        if initial_capital_usd < 0.0 {
            bail!("INITIAL_CAPITAL_USD must be non-negative");
        }
        if !(0.0..=1.0).contains(&max_exposure_pct) {
            bail!("MAX_EXPOSURE_PCT must be a fraction in [0, 1]");
        }

        let config = Self {
            rpc_url,
            persistence_path,
            initial_capital_usd,
            max_concurrent_pools,
            max_exposure_pct,
            cadence: LoopCadence::default(),
        };

        info!(
            rpc = %config.rpc_url,
            db = %config.persistence_path,
            initial_capital = config.initial_capital_usd,
            max_pools = config.max_concurrent_pools,
            max_exposure_pct = config.max_exposure_pct,
            "engine config resolved"
        );

        Ok(config)
    }
}

/// Resolve the RPC endpoint through the priority chain:
///   1. `RPC_URL` — direct endpoint.
///   2. `HELIUS_API_KEY` — provider-templated endpoint.
///   3. `SOLANA_RPC_URL` — backwards-compatible fallback.
///
/// Absence of all three is fatal for bootstrap.
fn resolve_rpc_url(get: &impl Fn(&str) -> Option<String>) -> Result<String> {
    if let Some(url) = get("RPC_URL").filter(|v| !v.trim().is_empty()) {
        return Ok(url);
    }
    if let Some(key) = get("HELIUS_API_KEY").filter(|v| !v.trim().is_empty()) {
        return Ok(format!("{HELIUS_RPC_TEMPLATE}{key}"));
    }
    if let Some(url) = get("SOLANA_RPC_URL").filter(|v| !v.trim().is_empty()) {
        warn!("using legacy SOLANA_RPC_URL — prefer RPC_URL");
        return Ok(url);
    }
    bail!("no RPC endpoint configured: set RPC_URL, HELIUS_API_KEY, or SOLANA_RPC_URL")
}
