// =============================================================================
// Shared types used across the Meridian liquidity engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Immutable token identity with chain-verified decimals.
///
/// Decimals are verified at registration time; a missing or out-of-range
/// value is fatal for the token, never defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Opaque mint address.
    pub mint: String,
    /// Verified on-chain decimals, 0..=18.
    pub decimals: u8,
    pub symbol: String,
}

/// Immutable pool metadata captured at discovery time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMeta {
    /// Pool account address.
    pub address: String,
    pub base_mint: String,
    pub quote_mint: String,
    /// Basis-point ratio between adjacent bin prices.
    pub bin_step: u32,
    /// Pool fee rate in basis points.
    pub fee_rate_bps: u32,
    /// Display symbol, e.g. "SOL-USDC".
    pub symbol: String,
}

/// Price of a bin under the pool's geometric bin ladder:
/// `price(i) = (1 + bin_step/10_000)^i`.
pub fn bin_price(bin_step: u32, bin: i32) -> f64 {
    (1.0 + bin_step as f64 / 10_000.0).powi(bin)
}

/// Overall market regime classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    Bull,
    Neutral,
    Bear,
}

impl Default for Regime {
    fn default() -> Self {
        Self::Neutral
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bull => write!(f, "BULL"),
            Self::Neutral => write!(f, "NEUTRAL"),
            Self::Bear => write!(f, "BEAR"),
        }
    }
}

impl Regime {
    /// Parse the persisted label; `None` for anything unrecognized.
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "BULL" => Some(Self::Bull),
            "NEUTRAL" => Some(Self::Neutral),
            "BEAR" => Some(Self::Bear),
            _ => None,
        }
    }
}

/// Direction liquidity is migrating for a pool, classified from the
/// per-minute liquidity slope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationDirection {
    In,
    Out,
    Neutral,
}

impl std::fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::In => write!(f, "in"),
            Self::Out => write!(f, "out"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// Which subsystem produced an exit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitSignal {
    /// Harmonic decay evaluator (volatility-adjusted bands) or structural decay.
    Harmonic,
    /// Composite-score exit conditions.
    Tier4,
    /// No exit indicated.
    None,
}

impl std::fmt::Display for ExitSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Harmonic => write!(f, "HARMONIC"),
            Self::Tier4 => write!(f, "TIER4"),
            Self::None => write!(f, "NONE"),
        }
    }
}
