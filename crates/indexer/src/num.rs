//! Fixed-point <-> decimal conversions.
//!
//! On-chain amounts are unsigned integers with an implied number of decimal
//! places defined by the deployed token (collateral) or the AMM (shares).
//! The scale is always passed in explicitly: inferring it from how large a
//! value looks is exactly how the ledger once ended up with every cost
//! stored `10^12` times too small (18 decimals applied to a 6-decimal token).
//!
//! Persisted amounts use a canonical string form, see [`to_canonical`].

use std::fmt::Write;

use alloy::primitives::U256;
use fastnum::{UD256, decimal::Context};

use crate::error::IndexerError;

/// Decimal places of the collateral token on current deployments.
pub const COLLATERAL_DECIMALS: u8 = 6;

/// Decimal places of outcome shares minted by the AMM.
pub const SHARE_DECIMALS: u8 = 18;

/// Magnitude of the historical scale defect: amounts were normalized with
/// [`SHARE_DECIMALS`] instead of [`COLLATERAL_DECIMALS`].
pub const SCALE_ERROR_EXPONENT: i32 = (SHARE_DECIMALS - COLLATERAL_DECIMALS) as i32;

/// Largest supported scale; `10^77` is the largest power of ten in 256 bits.
pub const MAX_DECIMALS: u8 = 77;

/// Digits kept after the point when deriving a ratio such as price per share.
pub const RATIO_DECIMALS: i16 = 18;

/// Converter between raw fixed-point integers and decimals for one scale.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Converter {
    decimals: u8,
}

impl Converter {
    pub fn new(decimals: u8) -> Self { Self { decimals } }

    pub fn decimals(&self) -> u8 { self.decimals }

    /// Converts a raw on-chain integer into its decimal value.
    pub fn from_unsigned(&self, raw: U256) -> UD256 {
        UD256::from_parts(to_fastnum(raw), -(self.decimals as i32), Context::default())
    }
}

/// Normalization scales of one deployment.
///
/// Both scales are mandatory; there is deliberately no default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Normalizer {
    shares: Converter,
    cost: Converter,
}

/// Normalized amounts of a single trade.
#[derive(Clone, Copy, derive_more::Debug, PartialEq)]
pub struct Amounts {
    #[debug("{}", to_canonical(*shares))]
    pub shares: UD256,
    #[debug("{}", to_canonical(*total_cost))]
    pub total_cost: UD256,
    #[debug("{}", to_canonical(*price_per_share))]
    pub price_per_share: UD256,
}

impl Normalizer {
    pub fn new(share_decimals: u8, cost_decimals: u8) -> Result<Self, IndexerError> {
        for (what, decimals) in [("share", share_decimals), ("cost", cost_decimals)] {
            if decimals > MAX_DECIMALS {
                return Err(IndexerError::ScaleAmbiguity(format!(
                    "{what} scale {decimals} exceeds {MAX_DECIMALS}"
                )));
            }
        }
        Ok(Self { shares: Converter::new(share_decimals), cost: Converter::new(cost_decimals) })
    }

    /// Builds a normalizer from optionally configured scales, refusing to
    /// guess a missing one.
    pub fn from_config(
        share_decimals: Option<u8>,
        cost_decimals: Option<u8>,
    ) -> Result<Self, IndexerError> {
        let shares = share_decimals.ok_or_else(|| {
            IndexerError::ScaleAmbiguity("share decimals are not configured".to_string())
        })?;
        let cost = cost_decimals.ok_or_else(|| {
            IndexerError::ScaleAmbiguity(
                "cost decimals are not configured; set them to the deployed collateral token's \
                 decimals"
                    .to_string(),
            )
        })?;
        Self::new(shares, cost)
    }

    pub fn shares(&self) -> Converter { self.shares }

    pub fn cost(&self) -> Converter { self.cost }

    pub fn normalize(&self, raw_shares: U256, raw_cost: U256) -> Amounts {
        let shares = self.shares.from_unsigned(raw_shares);
        let total_cost = self.cost.from_unsigned(raw_cost);
        Amounts { shares, total_cost, price_per_share: price_per_share(total_cost, shares) }
    }
}

/// `total_cost / shares`, zero when no shares changed hands.
pub fn price_per_share(total_cost: UD256, shares: UD256) -> UD256 {
    if shares.is_zero() {
        return UD256::ZERO;
    }
    (total_cost / shares).round(RATIO_DECIMALS).reduce()
}

/// `10^exp` as a decimal.
pub fn pow10(exp: i32) -> UD256 { UD256::from_parts(fastnum::U256::ONE, exp, Context::default()) }

/// Parses a decimal string (plain or exponent notation, no sign).
pub fn parse(s: &str) -> Result<UD256, IndexerError> {
    UD256::from_str(s.trim(), Context::default())
        .map_err(|e| IndexerError::Decimal(format!("cannot parse {s:?}: {e}")))
}

/// Canonical textual form used for every persisted amount: plain notation,
/// no trailing fractional zeros, at least one fractional digit.
///
/// `1` -> `"1.0"`, `0.650` -> `"0.65"`, `6.5e-13` -> `"0.00000000000065"`.
pub fn to_canonical(value: UD256) -> String {
    let value = value.reduce();
    let digits = value.digits().to_string();
    let fractional = value.fractional_digits_count();

    let mut out = String::with_capacity(digits.len() + 4);
    if fractional <= 0 {
        out.push_str(&digits);
        if digits != "0" {
            (0..-fractional).for_each(|_| out.push('0'));
        }
        out.push_str(".0");
        return out;
    }

    let fractional = fractional as usize;
    if digits.len() > fractional {
        let (int, frac) = digits.split_at(digits.len() - fractional);
        let _ = write!(out, "{int}.{frac}");
    } else {
        out.push_str("0.");
        (0..fractional - digits.len()).for_each(|_| out.push('0'));
        out.push_str(&digits);
    }
    out
}

fn to_fastnum(raw: U256) -> fastnum::U256 {
    fastnum::U256::from_be_slice(&raw.to_be_bytes::<32>())
        .expect("32 bytes always fit a 256-bit integer")
}
