// =============================================================================
// Price Oracle client
// =============================================================================
//
// Thin seam over the external price service. The engine only ever consumes
// quotes through the `PriceOracle` trait so tests can substitute a fixed
// oracle; the HTTP implementation speaks a Jupiter-style price endpoint.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::normalize::PriceQuote;

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Current USD quote for a mint. Errors propagate to the caller; a
    /// failed quote fails the specific trade, nothing else.
    async fn price_usd(&self, mint: &str) -> Result<PriceQuote>;
}

/// HTTP price oracle.
pub struct HttpPriceOracle {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPriceOracle {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn price_usd(&self, mint: &str) -> Result<PriceQuote> {
        let url = format!("{}/price?ids={}", self.base_url, mint);
        let body: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("price request failed for {mint}"))?
            .error_for_status()
            .with_context(|| format!("price endpoint rejected request for {mint}"))?
            .json()
            .await
            .with_context(|| format!("price response unparsable for {mint}"))?;

        let price = body["data"][mint]["price"]
            .as_f64()
            .with_context(|| format!("price missing from oracle response for {mint}"))?;

        Ok(PriceQuote {
            price_usd: price,
            quoted_at: Utc::now(),
        })
    }
}

/// Fixed-price oracle for tests and paper runs.
pub struct FixedPriceOracle {
    prices: RwLock<HashMap<String, f64>>,
}

impl FixedPriceOracle {
    pub fn new() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, mint: &str, price: f64) {
        self.prices.write().insert(mint.to_string(), price);
    }
}

impl Default for FixedPriceOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceOracle for FixedPriceOracle {
    async fn price_usd(&self, mint: &str) -> Result<PriceQuote> {
        let price = self
            .prices
            .read()
            .get(mint)
            .copied()
            .with_context(|| format!("no fixed price for {mint}"))?;
        Ok(PriceQuote {
            price_usd: price,
            quoted_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_oracle_quotes() {
        let oracle = FixedPriceOracle::new();
        oracle.set("mintA", 150.0);

        let quote = oracle.price_usd("mintA").await.unwrap();
        assert!((quote.price_usd - 150.0).abs() < 1e-12);
        assert!(oracle.price_usd("unknown").await.is_err());
    }
}
