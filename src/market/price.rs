use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::AssetId;

/// Basis-point denominator shared by every fee computation.
pub const FEE_DENOM: i64 = 10_000;

/// Marginal prices are quoted in quote-units per base-unit with this many
/// decimal places; the tail is truncated, never rounded up.
const PRICE_TICK_SCALE: u32 = 2;

// ── Public types ────────────────────────────────────────────────────

/// Quoting strategy of a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// Constant-product formula over the observed reserves.
    Balanced,
    /// Prices are fed externally by the operator (or a price plugin).
    Pluggable,
}

/// Fixed fee charged per swap, on top of the proportional one, expressed
/// in satoshis of each side of the pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedFee {
    pub base: u64,
    pub quote: u64,
}

/// The pair of prices attached to a preview: how much base one quote unit
/// buys, and how much quote one base unit buys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prices {
    pub base_price: Decimal,
    pub quote_price: Decimal,
}

/// Result of previewing a trade against a market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub price: Prices,
    pub amount: u64,
    pub asset: AssetId,
}

// ── Balanced strategy ───────────────────────────────────────────────

/// Amount the trader receives for sending `amount` satoshis of one side
/// into a constant-product market. The proportional fee is charged on the
/// way in; the receive-side fixed fee is subtracted from the output.
pub(crate) fn balanced_given_in(
    base_reserve: u64,
    quote_reserve: u64,
    amount: u64,
    in_is_base: bool,
    fee_bps: i64,
    fixed: FixedFee,
) -> Result<u64> {
    check_reserves(base_reserve, quote_reserve)?;
    check_amount_floor(amount, side_fee(fixed, in_is_base))?;

    let eff = floor_sats(d(amount) * fee_complement(fee_bps))?;
    if eff == 0 {
        return Err(Error::PreviewAmountTooLow);
    }

    let (gross, out_reserve) = if in_is_base {
        // Selling base for quote: price after the deposit, in quote/base.
        let price = price_tick(d(quote_reserve) / (d(base_reserve) + d(eff)));
        (floor_sats(d(eff) * price)?, quote_reserve)
    } else {
        // Selling quote for base.
        let price = price_tick((d(quote_reserve) + d(eff)) / d(base_reserve));
        if price.is_zero() {
            return Err(Error::PreviewAmountTooBig);
        }
        (floor_sats(d(eff) / price)?, base_reserve)
    };

    if gross >= out_reserve {
        return Err(Error::PreviewAmountTooBig);
    }
    net_of_fixed(gross, side_fee(fixed, !in_is_base))
}

/// Amount the trader must send to receive `amount` satoshis of one side
/// from a constant-product market. The proportional fee inflates the
/// required input; the send-side fixed fee is added on top.
pub(crate) fn balanced_given_out(
    base_reserve: u64,
    quote_reserve: u64,
    amount: u64,
    out_is_base: bool,
    fee_bps: i64,
    fixed: FixedFee,
) -> Result<u64> {
    check_reserves(base_reserve, quote_reserve)?;
    check_amount_floor(amount, side_fee(fixed, out_is_base))?;

    let out_reserve = if out_is_base {
        base_reserve
    } else {
        quote_reserve
    };
    if amount >= out_reserve {
        return Err(Error::PreviewAmountTooBig);
    }

    let raw = if out_is_base {
        // Withdrawing base: price after the withdrawal, in quote/base.
        let price = price_tick(d(quote_reserve) / (d(base_reserve) - d(amount)));
        floor_sats(d(amount) * price)?
    } else {
        let price = price_tick((d(quote_reserve) - d(amount)) / d(base_reserve));
        if price.is_zero() {
            return Err(Error::PreviewAmountTooBig);
        }
        floor_sats(d(amount) / price)?
    };
    if raw == 0 {
        return Err(Error::PreviewAmountTooLow);
    }

    let with_fee = d(raw) * fee_markup(fee_bps);
    floor_sats(with_fee + d(side_fee(fixed, !out_is_base)))
}

// ── Pluggable strategy ──────────────────────────────────────────────

/// Amount the trader receives for `amount` satoshis at externally fed
/// prices. The proportional fee is charged on the way out.
#[allow(clippy::too_many_arguments)]
pub(crate) fn pluggable_given_in(
    base_balance: u64,
    quote_balance: u64,
    amount: u64,
    in_is_base: bool,
    fee_bps: i64,
    fixed: FixedFee,
    prices: Prices,
) -> Result<u64> {
    check_prices(prices)?;
    check_amount_floor(amount, side_fee(fixed, in_is_base))?;

    // Converting base→quote multiplies by the quote price, quote→base by
    // the base price.
    let (rate, out_reserve) = if in_is_base {
        (prices.quote_price, quote_balance)
    } else {
        (prices.base_price, base_balance)
    };
    let gross = floor_sats(d(amount) * rate)?;
    if gross == 0 {
        return Err(Error::PreviewAmountTooLow);
    }
    if gross >= out_reserve {
        return Err(Error::PreviewAmountTooBig);
    }

    let after_fee = floor_sats(d(gross) * fee_complement(fee_bps))?;
    net_of_fixed(after_fee, side_fee(fixed, !in_is_base))
}

/// Amount the trader must send to receive `amount` satoshis at externally
/// fed prices.
#[allow(clippy::too_many_arguments)]
pub(crate) fn pluggable_given_out(
    base_balance: u64,
    quote_balance: u64,
    amount: u64,
    out_is_base: bool,
    fee_bps: i64,
    fixed: FixedFee,
    prices: Prices,
) -> Result<u64> {
    check_prices(prices)?;
    check_amount_floor(amount, side_fee(fixed, out_is_base))?;

    let out_reserve = if out_is_base {
        base_balance
    } else {
        quote_balance
    };
    if amount >= out_reserve {
        return Err(Error::PreviewAmountTooBig);
    }

    let rate = if out_is_base {
        prices.quote_price
    } else {
        prices.base_price
    };
    let raw = floor_sats(d(amount) * rate)?;
    if raw == 0 {
        return Err(Error::PreviewAmountTooLow);
    }

    let with_fee = d(raw) * fee_markup(fee_bps);
    floor_sats(with_fee + d(side_fee(fixed, !out_is_base)))
}

// ── Spot prices ─────────────────────────────────────────────────────

/// Spot prices implied by the reserves of a balanced market.
pub(crate) fn spot_prices(base_reserve: u64, quote_reserve: u64) -> Result<Prices> {
    check_reserves(base_reserve, quote_reserve)?;
    Ok(Prices {
        base_price: d(base_reserve) / d(quote_reserve),
        quote_price: d(quote_reserve) / d(base_reserve),
    })
}

// ── Internals ───────────────────────────────────────────────────────

fn d(v: u64) -> Decimal {
    Decimal::from(v)
}

/// `(10000 - bps) / 10000`
fn fee_complement(fee_bps: i64) -> Decimal {
    Decimal::from(FEE_DENOM - fee_bps) / Decimal::from(FEE_DENOM)
}

/// `(10000 + bps) / 10000`
fn fee_markup(fee_bps: i64) -> Decimal {
    Decimal::from(FEE_DENOM + fee_bps) / Decimal::from(FEE_DENOM)
}

/// Truncate a quote-per-base marginal price to the price tick.
fn price_tick(price: Decimal) -> Decimal {
    price.trunc_with_scale(PRICE_TICK_SCALE)
}

fn floor_sats(v: Decimal) -> Result<u64> {
    v.floor().to_u64().ok_or(Error::PreviewAmountTooBig)
}

fn side_fee(fixed: FixedFee, is_base: bool) -> u64 {
    if is_base {
        fixed.base
    } else {
        fixed.quote
    }
}

fn check_reserves(base_reserve: u64, quote_reserve: u64) -> Result<()> {
    if base_reserve == 0 || quote_reserve == 0 {
        return Err(Error::PreviewAmountTooBig);
    }
    Ok(())
}

fn check_prices(prices: Prices) -> Result<()> {
    if prices.base_price <= Decimal::ZERO || prices.quote_price <= Decimal::ZERO {
        return Err(Error::MarketNotPriced);
    }
    Ok(())
}

/// An amount of zero, or one that does not exceed its own side's fixed
/// fee, can never produce a meaningful trade.
fn check_amount_floor(amount: u64, own_side_fixed: u64) -> Result<()> {
    if amount == 0 || amount <= own_side_fixed {
        return Err(Error::PreviewAmountTooLow);
    }
    Ok(())
}

fn net_of_fixed(gross: u64, fixed_out: u64) -> Result<u64> {
    if gross <= fixed_out {
        return Err(Error::PreviewAmountTooLow);
    }
    Ok(gross - fixed_out)
}
