// =============================================================================
// Chain adapter — RPC-backed pool hydration
// =============================================================================
//
// Hydration reads live pool state from the chain and composes it into a
// telemetry snapshot: raw inventories are normalized through the verified
// decimals registry, priced through the oracle, and summed into USD
// liquidity. Any failure along the way fails the hydration of that pool and
// nothing else; the telemetry layer simply sees no new snapshot.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::normalize::ValueNormalizer;
use crate::oracle::PriceOracle;
use crate::telemetry::{PoolSnapshot, SwapEvent};
use crate::types::PoolMeta;

/// One hydration result: the fresh snapshot plus any swaps observed since
/// the previous poll.
#[derive(Debug, Clone)]
pub struct HydratedPool {
    pub snapshot: PoolSnapshot,
    pub swaps: Vec<SwapEvent>,
}

#[async_trait]
pub trait PoolHydrator: Send + Sync {
    async fn hydrate(&self, pool: &PoolMeta) -> Result<HydratedPool>;
}

/// Hydrate a batch of pools concurrently. Per-pool failures are logged and
/// dropped; the successes are returned.
pub async fn hydrate_batch(
    hydrator: &dyn PoolHydrator,
    pools: &[PoolMeta],
) -> Vec<HydratedPool> {
    let results = join_all(pools.iter().map(|p| hydrator.hydrate(p))).await;
    results
        .into_iter()
        .zip(pools)
        .filter_map(|(result, pool)| match result {
            Ok(hydrated) => Some(hydrated),
            Err(e) => {
                warn!(pool = %pool.address, error = %e, "hydration failed");
                None
            }
        })
        .collect()
}

/// JSON-RPC hydrator reading indexed pool state from the configured endpoint.
pub struct RpcHydrator {
    client: reqwest::Client,
    rpc_url: String,
    normalizer: Arc<ValueNormalizer>,
    oracle: Arc<dyn PriceOracle>,
}

impl RpcHydrator {
    pub fn new(
        rpc_url: impl Into<String>,
        normalizer: Arc<ValueNormalizer>,
        oracle: Arc<dyn PriceOracle>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            rpc_url: rpc_url.into(),
            normalizer,
            oracle,
        }
    }

    async fn fetch_pool_state(&self, pool: &PoolMeta) -> Result<serde_json::Value> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getPoolState",
            "params": [pool.address],
        });
        let body: serde_json::Value = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("rpc request failed for pool {}", pool.address))?
            .error_for_status()
            .with_context(|| format!("rpc endpoint rejected pool {}", pool.address))?
            .json()
            .await
            .with_context(|| format!("rpc response unparsable for pool {}", pool.address))?;

        body.get("result")
            .cloned()
            .with_context(|| format!("rpc result missing for pool {}", pool.address))
    }
}

#[async_trait]
impl PoolHydrator for RpcHydrator {
    async fn hydrate(&self, pool: &PoolMeta) -> Result<HydratedPool> {
        let state = self.fetch_pool_state(pool).await?;

        let active_bin = state["activeBin"]
            .as_i64()
            .context("activeBin missing from pool state")? as i32;
        let raw_base = state["baseAmount"]
            .as_u64()
            .context("baseAmount missing from pool state")? as u128;
        let raw_quote = state["quoteAmount"]
            .as_u64()
            .context("quoteAmount missing from pool state")? as u128;
        let recent_trades = state["recentTrades"].as_u64().unwrap_or(0) as u32;
        let velocity = state["velocity"].as_f64().unwrap_or(0.0);

        let inventory_base = self.normalizer.normalize(raw_base, &pool.base_mint)?;
        let inventory_quote = self.normalizer.normalize(raw_quote, &pool.quote_mint)?;

        let base_quote = self.oracle.price_usd(&pool.base_mint).await?;
        let quote_quote = self.oracle.price_usd(&pool.quote_mint).await?;
        let base_usd = self.normalizer.to_usd(inventory_base, &base_quote)?;
        let quote_usd = self.normalizer.to_usd(inventory_quote, &quote_quote)?;

        let snapshot = PoolSnapshot {
            pool: pool.address.clone(),
            active_bin,
            bin_step: pool.bin_step,
            liquidity_usd: base_usd + quote_usd,
            inventory_base,
            inventory_quote,
            fee_rate_bps: pool.fee_rate_bps,
            velocity,
            recent_trades,
            fetched_at: Utc::now(),
        };

        debug!(
            pool = %pool.address,
            active_bin,
            liquidity_usd = snapshot.liquidity_usd,
            recent_trades,
            "pool hydrated"
        );

        Ok(HydratedPool {
            snapshot,
            swaps: Vec::new(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct ScriptedHydrator {
        results: Mutex<std::collections::HashMap<String, HydratedPool>>,
    }

    #[async_trait]
    impl PoolHydrator for ScriptedHydrator {
        async fn hydrate(&self, pool: &PoolMeta) -> Result<HydratedPool> {
            self.results
                .lock()
                .get(&pool.address)
                .cloned()
                .with_context(|| format!("no scripted state for {}", pool.address))
        }
    }

    fn meta(address: &str) -> PoolMeta {
        PoolMeta {
            address: address.to_string(),
            base_mint: "base".to_string(),
            quote_mint: "quote".to_string(),
            bin_step: 25,
            fee_rate_bps: 30,
            symbol: "SOL-USDC".to_string(),
        }
    }

    fn hydrated(address: &str) -> HydratedPool {
        HydratedPool {
            snapshot: PoolSnapshot {
                pool: address.to_string(),
                active_bin: 10,
                bin_step: 25,
                liquidity_usd: 1_000.0,
                inventory_base: 100.0,
                inventory_quote: 100.0,
                fee_rate_bps: 30,
                velocity: 0.0,
                recent_trades: 3,
                fetched_at: Utc::now(),
            },
            swaps: Vec::new(),
        }
    }

    #[tokio::test]
    async fn batch_hydration_drops_failures() {
        let hydrator = ScriptedHydrator {
            results: Mutex::new(
                [("a".to_string(), hydrated("a")), ("c".to_string(), hydrated("c"))]
                    .into_iter()
                    .collect(),
            ),
        };

        let pools = vec![meta("a"), meta("b"), meta("c")];
        let results = hydrate_batch(&hydrator, &pools).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].snapshot.pool, "a");
        assert_eq!(results[1].snapshot.pool, "c");
    }
}
