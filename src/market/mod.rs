//! Market entity and lifecycle.
//!
//! A market pairs the daemon-wide base asset with one quote asset and
//! moves through `new → funded → tradable`. Fee and strategy mutations
//! require the market to be closed; pricing previews require it to be
//! open.

pub mod history;
pub mod price;

use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{AccountIndex, AssetId};

use history::PriceHistory;
pub use price::{FixedFee, Preview, Prices, Strategy};

/// A funding outpoint together with the asset it carries, as unblinded by
/// the chain layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutpointWithAsset {
    pub asset: AssetId,
    pub txid: String,
    pub vout: u32,
}

/// One market of the liquidity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    account_index: AccountIndex,
    base_asset: Option<AssetId>,
    quote_asset: Option<AssetId>,
    fee_basis_points: i64,
    fixed_fee: FixedFee,
    fee_asset: Option<AssetId>,
    strategy: Strategy,
    base_price: PriceHistory,
    quote_price: PriceHistory,
    tradable: bool,
}

impl Market {
    /// Create an unfunded market bound to an account index with the given
    /// proportional fee.
    pub fn new(account_index: AccountIndex, fee_basis_points: i64) -> Result<Self> {
        validate_fee(fee_basis_points)?;
        Ok(Self {
            account_index,
            base_asset: None,
            quote_asset: None,
            fee_basis_points,
            fixed_fee: FixedFee::default(),
            fee_asset: None,
            strategy: Strategy::Balanced,
            base_price: PriceHistory::new(),
            quote_price: PriceHistory::new(),
            tradable: false,
        })
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn account_index(&self) -> AccountIndex {
        self.account_index
    }

    pub fn base_asset(&self) -> Option<AssetId> {
        self.base_asset
    }

    pub fn quote_asset(&self) -> Option<AssetId> {
        self.quote_asset
    }

    pub fn fee_basis_points(&self) -> i64 {
        self.fee_basis_points
    }

    pub fn fixed_fee(&self) -> FixedFee {
        self.fixed_fee
    }

    pub fn fee_asset(&self) -> Option<AssetId> {
        self.fee_asset
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn is_tradable(&self) -> bool {
        self.tradable
    }

    /// A market is funded once both assets of the pair are known.
    pub fn is_funded(&self) -> bool {
        self.base_asset.is_some() && self.quote_asset.is_some()
    }

    pub fn base_asset_price(&self) -> Decimal {
        self.base_price.latest_or_zero()
    }

    pub fn quote_asset_price(&self) -> Decimal {
        self.quote_price.latest_or_zero()
    }

    /// True when both pluggable prices have been fed.
    pub fn is_priced(&self) -> bool {
        !self.base_price.is_zero() && !self.quote_price.is_zero()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Derive the asset pair from the funding outpoints. The outpoints
    /// must carry exactly two distinct assets, one of them the daemon's
    /// base asset. Funding an already funded market is a no-op.
    pub fn fund(&mut self, outpoints: &[OutpointWithAsset], base_asset: &AssetId) -> Result<()> {
        if self.is_funded() {
            return Ok(());
        }

        let assets: BTreeSet<AssetId> = outpoints.iter().map(|o| o.asset).collect();
        if assets.len() > 2 {
            return Err(Error::MarketTooManyAssets);
        }
        if !assets.contains(base_asset) {
            return Err(Error::MarketMissingBaseAsset);
        }
        let quote = assets
            .iter()
            .find(|a| *a != base_asset)
            .copied()
            .ok_or(Error::MarketMissingQuoteAsset)?;

        self.base_asset = Some(*base_asset);
        self.quote_asset = Some(quote);
        if self.fee_asset.is_none() {
            self.fee_asset = Some(*base_asset);
        }
        Ok(())
    }

    /// Open the market for trading. A pluggable market must have both
    /// prices fed first.
    pub fn make_tradable(&mut self) -> Result<()> {
        self.ensure_funded()?;
        if self.strategy == Strategy::Pluggable && !self.is_priced() {
            return Err(Error::MarketNotPriced);
        }
        self.tradable = true;
        Ok(())
    }

    pub fn make_not_tradable(&mut self) -> Result<()> {
        self.ensure_funded()?;
        self.tradable = false;
        Ok(())
    }

    // ── Fees ────────────────────────────────────────────────────────

    pub fn change_fee_basis_points(&mut self, fee: i64) -> Result<()> {
        self.ensure_funded()?;
        self.ensure_closed()?;
        validate_fee(fee)?;
        self.fee_basis_points = fee;
        Ok(())
    }

    /// Update both fixed fees. They are set together: leaving exactly one
    /// of them at zero is treated as a missing value.
    pub fn change_fixed_fee(&mut self, base_fee: i64, quote_fee: i64) -> Result<()> {
        self.ensure_funded()?;
        self.ensure_closed()?;
        if base_fee < 0 || quote_fee < 0 {
            return Err(Error::InvalidFixedFee);
        }
        if (base_fee == 0) != (quote_fee == 0) {
            return Err(Error::MissingFixedFee);
        }
        self.fixed_fee = FixedFee {
            base: base_fee as u64,
            quote: quote_fee as u64,
        };
        Ok(())
    }

    pub fn change_fee_asset(&mut self, asset: &AssetId) -> Result<()> {
        self.ensure_funded()?;
        self.ensure_closed()?;
        if Some(*asset) != self.base_asset && Some(*asset) != self.quote_asset {
            return Err(Error::InvalidQuoteAsset);
        }
        self.fee_asset = Some(*asset);
        Ok(())
    }

    // ── Strategy & prices ───────────────────────────────────────────

    pub fn make_strategy_pluggable(&mut self) -> Result<()> {
        self.ensure_closed()?;
        self.strategy = Strategy::Pluggable;
        Ok(())
    }

    pub fn make_strategy_balanced(&mut self) -> Result<()> {
        self.ensure_closed()?;
        self.strategy = Strategy::Balanced;
        Ok(())
    }

    /// Feed a base-asset price point. Allowed while the market is open so
    /// that price plugins can run live.
    pub fn change_base_price(&mut self, price: Decimal, timestamp: u64) -> Result<()> {
        self.ensure_funded()?;
        validate_price(price)?;
        self.base_price.insert(timestamp, price)
    }

    pub fn change_quote_price(&mut self, price: Decimal, timestamp: u64) -> Result<()> {
        self.ensure_funded()?;
        validate_price(price)?;
        self.quote_price.insert(timestamp, price)
    }

    // ── Preview ─────────────────────────────────────────────────────

    /// Quote the counter-amount of a prospective trade against the given
    /// reserves. `is_base_asset` says which side `amount` refers to;
    /// `is_buy` is the trader's intent on the base asset.
    pub fn preview(
        &self,
        base_balance: u64,
        quote_balance: u64,
        amount: u64,
        is_base_asset: bool,
        is_buy: bool,
    ) -> Result<Preview> {
        if !self.tradable {
            return Err(Error::MarketIsClosed);
        }
        let base_asset = self.base_asset.ok_or(Error::MarketNotFunded)?;
        let quote_asset = self.quote_asset.ok_or(Error::MarketNotFunded)?;

        let prices = match self.strategy {
            Strategy::Balanced => price::spot_prices(base_balance, quote_balance)?,
            Strategy::Pluggable => Prices {
                base_price: self.base_price.latest_or_zero(),
                quote_price: self.quote_price.latest_or_zero(),
            },
        };

        // The amount the trader names is on one side; the preview answers
        // with the other. Buying base with a base amount (or selling base
        // with a quote amount) asks "what do I send to receive this", the
        // two remaining combinations ask "what do I receive for this".
        let given_out = is_buy == is_base_asset;
        let amount_result = match (self.strategy, given_out) {
            (Strategy::Balanced, true) => price::balanced_given_out(
                base_balance,
                quote_balance,
                amount,
                is_base_asset,
                self.fee_basis_points,
                self.fixed_fee,
            )?,
            (Strategy::Balanced, false) => price::balanced_given_in(
                base_balance,
                quote_balance,
                amount,
                is_base_asset,
                self.fee_basis_points,
                self.fixed_fee,
            )?,
            (Strategy::Pluggable, true) => price::pluggable_given_out(
                base_balance,
                quote_balance,
                amount,
                is_base_asset,
                self.fee_basis_points,
                self.fixed_fee,
                prices,
            )?,
            (Strategy::Pluggable, false) => price::pluggable_given_in(
                base_balance,
                quote_balance,
                amount,
                is_base_asset,
                self.fee_basis_points,
                self.fixed_fee,
                prices,
            )?,
        };

        Ok(Preview {
            price: prices,
            amount: amount_result,
            asset: if is_base_asset { quote_asset } else { base_asset },
        })
    }

    // ── Guards ──────────────────────────────────────────────────────

    fn ensure_funded(&self) -> Result<()> {
        if !self.is_funded() {
            return Err(Error::MarketNotFunded);
        }
        Ok(())
    }

    fn ensure_closed(&self) -> Result<()> {
        if self.tradable {
            return Err(Error::MarketMustBeClosed);
        }
        Ok(())
    }
}

fn validate_fee(basis_points: i64) -> Result<()> {
    if basis_points < 1 {
        return Err(Error::MarketFeeTooLow);
    }
    if basis_points > 9999 {
        return Err(Error::MarketFeeTooHigh);
    }
    Ok(())
}

fn validate_price(price: Decimal) -> Result<()> {
    if price <= Decimal::ZERO {
        return Err(Error::InvalidPrice);
    }
    Ok(())
}
