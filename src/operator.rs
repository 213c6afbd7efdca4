//! Operator control plane.
//!
//! Deposits, market open/close, fee/strategy/price updates, withdrawals
//! and the fee-account balance check. These flows mutate markets and the
//! vault inside storage transactions and keep the crawler's observable set
//! in sync with every address they derive.

use std::sync::Arc;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::config::Config;
use crate::crawler::{CrawlerHandle, Observable};
use crate::error::{Error, Result};
use crate::market::{Market, OutpointWithAsset, Strategy};
use crate::ports::{ChainClient, KeyStore, PsetBuilder, PsetOutput, TransferRequest};
use crate::storage::Stores;
use crate::trade::SwapInfo;
use crate::types::{AccountIndex, AssetId, Outpoint, FEE_ACCOUNT};
use crate::unix_now;
use crate::unspent::Unspent;
use crate::vault::AddressInfo;

/// Base-asset satoshis reserved from the fee account per withdrawal.
const NETWORK_FEE_RESERVE: u64 = 5_000;

/// Parameters of a market withdrawal.
#[derive(Debug, Clone)]
pub struct WithdrawMarketRequest {
    pub quote_asset: AssetId,
    pub base_amount: u64,
    pub quote_amount: u64,
    pub address: String,
    pub millisats_per_byte: u64,
    /// Broadcast the transaction once built.
    pub push: bool,
}

pub struct OperatorOps {
    stores: Stores,
    chain: Arc<dyn ChainClient>,
    pset: Arc<dyn PsetBuilder>,
    keystore: Arc<dyn KeyStore>,
    crawler: CrawlerHandle,
    base_asset: AssetId,
    default_fee_basis_points: i64,
    fee_balance_threshold: u64,
}

impl OperatorOps {
    pub fn new(
        stores: Stores,
        chain: Arc<dyn ChainClient>,
        pset: Arc<dyn PsetBuilder>,
        keystore: Arc<dyn KeyStore>,
        crawler: CrawlerHandle,
        config: &Config,
    ) -> Self {
        Self {
            stores,
            chain,
            pset,
            keystore,
            crawler,
            base_asset: config.base_asset,
            default_fee_basis_points: config.default_fee_basis_points(),
            fee_balance_threshold: config.fee_account_balance_threshold,
        }
    }

    // ── Deposits ────────────────────────────────────────────────────

    /// Next deposit address for the market trading `quote_asset`. Without
    /// a quote asset (or for an unknown one) a brand new market account is
    /// allocated.
    pub fn deposit_market(&self, quote_asset: Option<AssetId>) -> Result<AddressInfo> {
        let keystore = Arc::clone(&self.keystore);
        let default_fee = self.default_fee_basis_points;
        let info = self.stores.transact(move |tx| {
            let account = quote_asset
                .as_ref()
                .and_then(|q| tx.market_by_quote_asset(q))
                .map(|m| m.account_index())
                .unwrap_or_else(|| tx.next_free_market_account());
            tx.get_or_create_market(account, default_fee)?;

            let mut vault = tx.vault().ok_or(Error::WalletNotInitialized)?;
            let info = vault.derive_next_external(keystore.as_ref(), account)?;
            tx.set_vault(vault);
            Ok(info)
        })?;

        self.observe(&info);
        log::info!(
            "market deposit address derived for account {}",
            info.account
        );
        Ok(info)
    }

    /// Next deposit address of the fee account.
    pub fn deposit_fee_account(&self) -> Result<AddressInfo> {
        let keystore = Arc::clone(&self.keystore);
        let info = self.stores.transact(move |tx| {
            let mut vault = tx.vault().ok_or(Error::WalletNotInitialized)?;
            let info = vault.derive_next_external(keystore.as_ref(), FEE_ACCOUNT)?;
            tx.set_vault(vault);
            Ok(info)
        })?;

        self.observe(&info);
        Ok(info)
    }

    // ── Open / close ────────────────────────────────────────────────

    /// Fund the market with its account's observed outpoints and open it.
    pub fn open_market(&self, base_asset: &AssetId, quote_asset: &AssetId) -> Result<()> {
        self.ensure_base(base_asset)?;
        let base = self.base_asset;
        let quote = *quote_asset;
        self.stores.transact(move |tx| {
            let mut market = tx
                .market_by_quote_asset(&quote)
                .or_else(|| {
                    // A market deposited but never traded has no quote
                    // asset yet; fall back to the newest account.
                    tx.latest_market_account()
                        .and_then(|a| tx.market_by_account(a))
                        .filter(|m| m.quote_asset().is_none())
                })
                .ok_or(Error::MarketNotExist)?;

            if !market.is_funded() {
                let vault = tx.vault().ok_or(Error::WalletNotInitialized)?;
                let addresses: Vec<String> = vault
                    .addresses_for_account(market.account_index())
                    .into_iter()
                    .map(|a| a.address)
                    .collect();
                let outpoints: Vec<OutpointWithAsset> = tx
                    .unspents_for_addresses(&addresses)
                    .into_iter()
                    .filter(|u| !u.spent)
                    .map(|u| OutpointWithAsset {
                        asset: u.asset,
                        txid: u.outpoint.txid.clone(),
                        vout: u.outpoint.vout,
                    })
                    .collect();
                if outpoints.is_empty() {
                    return Err(Error::WalletNotFunded);
                }
                market.fund(&outpoints, &base)?;
            }

            market.make_tradable()?;
            tx.update_market(market);
            Ok(())
        })?;
        log::info!("market {quote_asset} opened");
        Ok(())
    }

    pub fn close_market(&self, base_asset: &AssetId, quote_asset: &AssetId) -> Result<()> {
        self.ensure_base(base_asset)?;
        self.with_market(quote_asset, |market| market.make_not_tradable())?;
        log::info!("market {quote_asset} closed");
        Ok(())
    }

    // ── Updates ─────────────────────────────────────────────────────

    pub fn update_market_fee(&self, quote_asset: &AssetId, basis_points: i64) -> Result<Market> {
        self.with_market(quote_asset, |market| {
            market.change_fee_basis_points(basis_points)
        })
    }

    pub fn update_market_fixed_fee(
        &self,
        quote_asset: &AssetId,
        base_fee: i64,
        quote_fee: i64,
    ) -> Result<Market> {
        self.with_market(quote_asset, |market| {
            market.change_fixed_fee(base_fee, quote_fee)
        })
    }

    pub fn update_market_fee_asset(
        &self,
        quote_asset: &AssetId,
        fee_asset: &AssetId,
    ) -> Result<Market> {
        self.with_market(quote_asset, |market| market.change_fee_asset(fee_asset))
    }

    /// Feed both sides of the price, stamped with the current time.
    pub fn update_market_price(
        &self,
        quote_asset: &AssetId,
        base_price: Decimal,
        quote_price: Decimal,
    ) -> Result<()> {
        let now = unix_now();
        self.with_market(quote_asset, |market| {
            market.change_base_price(base_price, now)?;
            market.change_quote_price(quote_price, now)
        })?;
        Ok(())
    }

    pub fn update_market_strategy(
        &self,
        quote_asset: &AssetId,
        strategy: Strategy,
    ) -> Result<()> {
        self.with_market(quote_asset, |market| match strategy {
            Strategy::Pluggable => market.make_strategy_pluggable(),
            Strategy::Balanced => market.make_strategy_balanced(),
        })?;
        Ok(())
    }

    // ── Listings ────────────────────────────────────────────────────

    pub fn list_markets(&self) -> Vec<Market> {
        self.stores.read(|tx| tx.markets())
    }

    /// All trades projected into their swap views, joined with the market
    /// fee at read time.
    pub fn list_swaps(&self) -> Vec<SwapInfo> {
        self.stores.read(|tx| {
            tx.trades()
                .into_iter()
                .map(|t| {
                    let fee = tx
                        .market_by_quote_asset(&t.market_quote_asset())
                        .map(|m| m.fee_basis_points())
                        .unwrap_or_default();
                    t.swap_info(fee)
                })
                .collect()
        })
    }

    // ── Withdraw ────────────────────────────────────────────────────

    /// Pay market funds out to an external address, network fees coming
    /// from the fee account. Change returns to fresh internal addresses on
    /// both accounts; spent inputs are reconciled by the crawler once the
    /// transaction confirms.
    pub async fn withdraw_market_funds(
        &self,
        request: WithdrawMarketRequest,
    ) -> Result<crate::ports::BuiltTransfer> {
        let market = self
            .stores
            .read(|tx| tx.market_by_quote_asset(&request.quote_asset))
            .ok_or(Error::MarketNotExist)?;
        let account = market.account_index();

        let market_addresses = self.account_address_strings(account)?;
        let fee_addresses = self.account_address_strings(FEE_ACCOUNT)?;

        let (base_inputs, base_total) =
            self.select_available(&market_addresses, &self.base_asset, request.base_amount);
        if base_total < request.base_amount {
            return Err(Error::WalletNotFunded);
        }
        let (quote_inputs, quote_total) =
            self.select_available(&market_addresses, &request.quote_asset, request.quote_amount);
        if quote_total < request.quote_amount {
            return Err(Error::WalletNotFunded);
        }
        let (fee_inputs, fee_total) =
            self.select_available(&fee_addresses, &self.base_asset, NETWORK_FEE_RESERVE);
        if fee_total < NETWORK_FEE_RESERVE {
            return Err(Error::WalletNotFunded);
        }

        // Internal change addresses on both touched accounts, and the
        // selected inputs locked under the withdrawal id so no concurrent
        // selection can double-spend them before the chain confirms.
        let withdrawal_id = Uuid::new_v4();
        let locked_keys: Vec<Outpoint> = base_inputs
            .iter()
            .chain(quote_inputs.iter())
            .chain(fee_inputs.iter())
            .map(Unspent::key)
            .collect();
        let keystore = Arc::clone(&self.keystore);
        let keys_to_lock = locked_keys.clone();
        let (market_change, fee_change) = self.stores.transact(move |tx| {
            let mut vault = tx.vault().ok_or(Error::WalletNotInitialized)?;
            let market_change = vault.derive_next_internal(keystore.as_ref(), account)?;
            let fee_change = vault.derive_next_internal(keystore.as_ref(), FEE_ACCOUNT)?;
            tx.lock_unspents(&keys_to_lock, withdrawal_id)?;
            tx.set_vault(vault);
            Ok((market_change, fee_change))
        })?;

        let mut outputs = Vec::new();
        if request.base_amount > 0 {
            outputs.push(PsetOutput {
                address: request.address.clone(),
                asset: self.base_asset,
                amount: request.base_amount,
                blinding_key: Vec::new(),
            });
        }
        if request.quote_amount > 0 {
            outputs.push(PsetOutput {
                address: request.address.clone(),
                asset: request.quote_asset,
                amount: request.quote_amount,
                blinding_key: Vec::new(),
            });
        }
        if outputs.is_empty() {
            return Err(Error::PreviewAmountTooLow);
        }

        let mut change_outputs = Vec::new();
        if base_total > request.base_amount {
            change_outputs.push(PsetOutput {
                address: market_change.address.clone(),
                asset: self.base_asset,
                amount: base_total - request.base_amount,
                blinding_key: market_change.blinding_key.clone(),
            });
        }
        if quote_total > request.quote_amount {
            change_outputs.push(PsetOutput {
                address: market_change.address.clone(),
                asset: request.quote_asset,
                amount: quote_total - request.quote_amount,
                blinding_key: market_change.blinding_key.clone(),
            });
        }
        if fee_total > NETWORK_FEE_RESERVE {
            change_outputs.push(PsetOutput {
                address: fee_change.address.clone(),
                asset: self.base_asset,
                amount: fee_total - NETWORK_FEE_RESERVE,
                blinding_key: fee_change.blinding_key.clone(),
            });
        }

        let inputs: Vec<Unspent> = base_inputs
            .into_iter()
            .chain(quote_inputs)
            .chain(fee_inputs)
            .collect();
        let built = match self
            .pset
            .build_transfer(&TransferRequest {
                inputs,
                outputs,
                change_outputs,
                millisats_per_byte: request.millisats_per_byte,
            })
            .await
        {
            Ok(built) => built,
            Err(e) => {
                self.release_locks(&locked_keys);
                return Err(e);
            }
        };

        if request.push {
            if let Err(e) = self.chain.broadcast(&built.tx_hex).await {
                self.release_locks(&locked_keys);
                return Err(e);
            }
            self.crawler.watch_tx(built.txid.clone());
        }

        self.observe(&market_change);
        self.observe(&fee_change);
        log::info!(
            "withdrawal of ({}, {}) from market {} built as tx {}",
            request.base_amount,
            request.quote_amount,
            request.quote_asset,
            built.txid
        );
        Ok(built)
    }

    // ── Fee account ─────────────────────────────────────────────────

    /// Confirmed base-asset balance of the fee account. Logs a warning
    /// when it drops under the configured threshold.
    pub fn fee_account_balance(&self) -> Result<u64> {
        let addresses = self.account_address_strings(FEE_ACCOUNT)?;
        let balance = self
            .stores
            .read(|tx| tx.balance(&addresses, &self.base_asset));
        if balance < self.fee_balance_threshold {
            log::warn!(
                "fee account balance {balance} is below the threshold {}",
                self.fee_balance_threshold
            );
        }
        Ok(balance)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn ensure_base(&self, base_asset: &AssetId) -> Result<()> {
        if *base_asset != self.base_asset {
            return Err(Error::InvalidBaseAsset);
        }
        Ok(())
    }

    /// Run one mutation against the market found by quote asset, inside a
    /// transaction keyed on its account.
    fn with_market(
        &self,
        quote_asset: &AssetId,
        mutate: impl Fn(&mut Market) -> Result<()>,
    ) -> Result<Market> {
        let quote = *quote_asset;
        self.stores.transact(move |tx| {
            let mut market = tx
                .market_by_quote_asset(&quote)
                .ok_or(Error::MarketNotExist)?;
            mutate(&mut market)?;
            tx.update_market(market.clone());
            Ok(market)
        })
    }

    fn account_address_strings(&self, account: AccountIndex) -> Result<Vec<String>> {
        let vault = self
            .stores
            .read(|tx| tx.vault())
            .ok_or(Error::WalletNotInitialized)?;
        Ok(vault
            .addresses_for_account(account)
            .into_iter()
            .map(|a| a.address)
            .collect())
    }

    fn select_available(
        &self,
        addresses: &[String],
        asset: &AssetId,
        target: u64,
    ) -> (Vec<Unspent>, u64) {
        if target == 0 {
            return (Vec::new(), 0);
        }
        let mut candidates: Vec<Unspent> = self.stores.read(|tx| {
            tx.available_for_addresses(addresses)
                .into_iter()
                .filter(|u| u.asset == *asset)
                .collect()
        });
        candidates.sort_by(|a, b| b.value.cmp(&a.value).then(a.outpoint.cmp(&b.outpoint)));

        let mut selected = Vec::new();
        let mut total = 0u64;
        for candidate in candidates {
            if total >= target {
                break;
            }
            total += candidate.value;
            selected.push(candidate);
        }
        (selected, total)
    }

    fn observe(&self, info: &AddressInfo) {
        self.crawler.add_observable(Observable {
            account: info.account,
            address: info.address.clone(),
            blinding_key: info.blinding_key.clone(),
        });
    }

    /// Release input locks after an aborted build or broadcast.
    fn release_locks(&self, keys: &[Outpoint]) {
        let keys = keys.to_vec();
        if let Err(e) = self.stores.transact(move |tx| tx.unlock_unspents(&keys)) {
            log::warn!("failed to release withdrawal input locks: {e}");
        }
    }
}
