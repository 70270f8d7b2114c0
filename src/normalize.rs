// =============================================================================
// Value Normalizer — raw on-chain integers to USD
// =============================================================================
//
// Token-unit multiplication and hard-coded decimals are the two categorical
// footguns of this domain; this module exists to make them unrepresentable.
// Every conversion requires a registered, chain-verified decimals value and a
// fresh oracle quote. Rejections fail the calling trade; no path substitutes
// a default.
// =============================================================================

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::types::TokenInfo;

/// Oracle quotes older than this are rejected.
const MAX_QUOTE_AGE_SECS: i64 = 60;
/// Flat fee fraction applied to entry/exit values.
const FEE_PCT: f64 = 0.003;
/// Slippage in basis points applied to entry/exit values.
const SLIPPAGE_BPS: f64 = 10.0;
/// Trades below this USD size are rejected outright.
const MIN_TRADE_USD: f64 = 1.0;
/// Chain-supported decimals never exceed this.
const MAX_DECIMALS: u8 = 18;

/// A USD price quote with its observation time.
#[derive(Debug, Clone)]
pub struct PriceQuote {
    pub price_usd: f64,
    pub quoted_at: DateTime<Utc>,
}

/// Gross value decomposed into fees, slippage, and net.
#[derive(Debug, Clone, Copy)]
pub struct NetValue {
    pub gross: f64,
    pub fees: f64,
    pub slippage: f64,
    pub net: f64,
}

/// Registry of verified token decimals plus the conversion operations.
pub struct ValueNormalizer {
    tokens: RwLock<HashMap<String, TokenInfo>>,
}

impl ValueNormalizer {
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Register a token whose decimals were verified against the chain.
    /// Decimals outside `0..=18` are rejected.
    pub fn register_token(&self, token: TokenInfo) -> Result<()> {
        if token.decimals > MAX_DECIMALS {
            bail!(
                "token {} has decimals {} outside 0..={MAX_DECIMALS}",
                token.mint,
                token.decimals
            );
        }
        debug!(mint = %token.mint, decimals = token.decimals, symbol = %token.symbol, "token registered");
        self.tokens.write().insert(token.mint.clone(), token);
        Ok(())
    }

    pub fn decimals(&self, mint: &str) -> Option<u8> {
        self.tokens.read().get(mint).map(|t| t.decimals)
    }

    /// Convert a raw on-chain integer amount into token units.
    /// Requires the mint's decimals to be registered.
    pub fn normalize(&self, raw_amount: u128, mint: &str) -> Result<f64> {
        let decimals = self
            .decimals(mint)
            .with_context(|| format!("decimals unresolved for mint {mint}"))?;
        Ok(raw_amount as f64 / 10f64.powi(decimals as i32))
    }

    /// Convert a normalized token amount to USD with a fresh oracle quote.
    /// Rejects non-positive prices and quotes older than 60 s.
    pub fn to_usd(&self, normalized: f64, quote: &PriceQuote) -> Result<f64> {
        if quote.price_usd <= 0.0 {
            bail!("rejecting non-positive oracle price {}", quote.price_usd);
        }
        let age = Utc::now()
            .signed_duration_since(quote.quoted_at)
            .num_seconds();
        if age > MAX_QUOTE_AGE_SECS {
            bail!("rejecting stale oracle quote ({age}s old, max {MAX_QUOTE_AGE_SECS}s)");
        }
        Ok(normalized * quote.price_usd)
    }

    /// USD value actually deployed on entry: `size − fees − slippage`.
    pub fn entry_value_usd(&self, size_usd: f64) -> Result<NetValue> {
        net_of_costs(size_usd)
    }

    /// USD value actually received on exit: `size − fees − slippage`.
    pub fn exit_value_usd(&self, size_usd: f64) -> Result<NetValue> {
        net_of_costs(size_usd)
    }
}

impl Default for ValueNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

fn net_of_costs(size_usd: f64) -> Result<NetValue> {
    if size_usd < MIN_TRADE_USD {
        bail!("trade size {size_usd} below minimum {MIN_TRADE_USD} USD");
    }
    let fees = size_usd * FEE_PCT;
    let slippage = size_usd * SLIPPAGE_BPS / 10_000.0;
    Ok(NetValue {
        gross: size_usd,
        fees,
        slippage,
        net: size_usd - fees - slippage,
    })
}
