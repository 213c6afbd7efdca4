//! Trade engine.
//!
//! Orchestrates one swap end to end: preview against the market, reserve
//! inputs, hand the heavy lifting to the PSet builder, and drive the trade
//! state machine inside storage transactions. Failures after a request was
//! parsed become swap-fail messages the counterparty can read; failures
//! before that surface as domain errors.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::config::Config;
use crate::crawler::CrawlerHandle;
use crate::error::{Error, Result};
use crate::market::Market;
use crate::ports::{
    ChainClient, KeyStore, PsetBuilder, PsetOutput, SwapAccept, SwapFail, SwapParser,
    SwapPsetRequest, SwapRequest,
};
use crate::storage::Stores;
use crate::trade::{SwapFailCode, Trade, TradeStatus};
use crate::types::{AssetId, Outpoint, FEE_ACCOUNT};
use crate::unix_now;
use crate::unspent::Unspent;
use crate::vault::AddressInfo;

/// Satoshis of the base asset reserved from the fee account to cover the
/// network fee of one swap; the builder returns the surplus as change.
const NETWORK_FEE_RESERVE: u64 = 5_000;
const DEFAULT_MILLISATS_PER_BYTE: u64 = 100;

/// Outcome of a propose/complete call once the swap protocol is engaged:
/// either the next protocol message, or a fail message with the reason.
#[derive(Debug, Clone)]
pub enum ProposeOutcome {
    Accept { trade_id: Uuid, accept: SwapAccept },
    Fail { trade_id: Uuid, fail: SwapFail },
}

#[derive(Debug, Clone)]
pub enum CompleteOutcome {
    Completed { trade_id: Uuid, txid: String },
    Fail { trade_id: Uuid, fail: SwapFail },
}

pub struct TradeEngine {
    stores: Stores,
    chain: Arc<dyn ChainClient>,
    pset: Arc<dyn PsetBuilder>,
    parser: Arc<dyn SwapParser>,
    keystore: Arc<dyn KeyStore>,
    crawler: CrawlerHandle,
    base_asset: AssetId,
    trade_expiry: Duration,
    slippage_fraction: Decimal,
}

impl TradeEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: Stores,
        chain: Arc<dyn ChainClient>,
        pset: Arc<dyn PsetBuilder>,
        parser: Arc<dyn SwapParser>,
        keystore: Arc<dyn KeyStore>,
        crawler: CrawlerHandle,
        config: &Config,
    ) -> Self {
        Self {
            stores,
            chain,
            pset,
            parser,
            keystore,
            crawler,
            base_asset: config.base_asset,
            trade_expiry: config.trade_expiry,
            slippage_fraction: config.trade_slippage_percent / Decimal::from(100),
        }
    }

    // ── Propose ─────────────────────────────────────────────────────

    /// Handle a trader's swap request against the market identified by its
    /// quote asset. On success the trade lands in `Accepted` with its
    /// inputs locked, and the accept message is returned.
    pub async fn propose(&self, quote_asset: AssetId, raw_request: &[u8]) -> Result<ProposeOutcome> {
        let (market, market_addresses) = self.tradable_market(&quote_asset)?;

        let request = match self.parser.parse_request(raw_request) {
            Ok(req) => req,
            Err(e) => {
                return self.fail_fresh_trade(
                    quote_asset,
                    None,
                    SwapFailCode::MessageMalformed,
                    e.to_string(),
                );
            }
        };

        // The request must trade exactly the market pair, in one of the
        // two directions.
        let buys_base = request.asset_r == self.base_asset && request.asset_p == quote_asset;
        let sells_base = request.asset_p == self.base_asset && request.asset_r == quote_asset;
        if !buys_base && !sells_base {
            return self.fail_fresh_trade(
                quote_asset,
                Some(request),
                SwapFailCode::AssetMismatch,
                "swap assets do not match the market pair",
            );
        }

        let addresses: Vec<String> = market_addresses.iter().map(|a| a.address.clone()).collect();
        let (base_reserve, quote_reserve) = self.stores.read(|tx| {
            (
                tx.balance(&addresses, &self.base_asset),
                tx.balance(&addresses, &quote_asset),
            )
        });

        // Re-quote the trade ourselves and reject requests that drift
        // beyond the configured slippage.
        let preview = if buys_base {
            market.preview(base_reserve, quote_reserve, request.amount_r, true, true)
        } else {
            market.preview(base_reserve, quote_reserve, request.amount_p, true, false)
        };
        let expected = match preview {
            Ok(p) => p.amount,
            Err(e) => {
                return self.fail_fresh_trade(
                    quote_asset,
                    Some(request),
                    SwapFailCode::AmountMismatch,
                    e.to_string(),
                );
            }
        };
        let actual = if buys_base {
            request.amount_p
        } else {
            request.amount_r
        };
        if !self.within_slippage(expected, actual) {
            return self.fail_fresh_trade(
                quote_asset,
                Some(request),
                SwapFailCode::AmountMismatch,
                format!("amount {actual} drifts too far from previewed {expected}"),
            );
        }

        // Reserve the provider legs: what the trader receives comes from
        // the market account, the network fee from the fee account.
        let outgoing_asset = request.asset_r;
        let outgoing_amount = request.amount_r;
        let (inputs, input_total) =
            self.select_inputs(&addresses, &outgoing_asset, outgoing_amount);
        if input_total < outgoing_amount {
            return self.fail_fresh_trade(
                quote_asset,
                Some(request),
                SwapFailCode::Aborted,
                "market account cannot cover the requested amount",
            );
        }
        let fee_addresses = self.account_addresses(FEE_ACCOUNT)?;
        let fee_addr_strings: Vec<String> =
            fee_addresses.iter().map(|a| a.address.clone()).collect();
        let (fee_inputs, fee_total) =
            self.select_inputs(&fee_addr_strings, &self.base_asset, NETWORK_FEE_RESERVE);
        if fee_total < NETWORK_FEE_RESERVE {
            return self.fail_fresh_trade(
                quote_asset,
                Some(request),
                SwapFailCode::Aborted,
                "fee account cannot cover the network fee",
            );
        }

        // Fresh addresses: one to receive the trader's payment, change for
        // the traded leg and for the fee account.
        let market_account = market.account_index();
        let keystore = Arc::clone(&self.keystore);
        let (receive_addr, change_addr, fee_change_addr) = self.stores.transact(move |tx| {
            let mut vault = tx.vault().ok_or(Error::WalletNotInitialized)?;
            let receive = vault.derive_next_external(keystore.as_ref(), market_account)?;
            let change = vault.derive_next_internal(keystore.as_ref(), market_account)?;
            let fee_change = vault.derive_next_internal(keystore.as_ref(), FEE_ACCOUNT)?;
            tx.set_vault(vault);
            Ok((receive, change, fee_change))
        })?;

        let mut outputs = vec![PsetOutput {
            address: receive_addr.address.clone(),
            asset: request.asset_p,
            amount: request.amount_p,
            blinding_key: receive_addr.blinding_key.clone(),
        }];
        if input_total > outgoing_amount {
            outputs.push(PsetOutput {
                address: change_addr.address.clone(),
                asset: outgoing_asset,
                amount: input_total - outgoing_amount,
                blinding_key: change_addr.blinding_key.clone(),
            });
        }
        let fee_change = (fee_total > NETWORK_FEE_RESERVE).then(|| PsetOutput {
            address: fee_change_addr.address.clone(),
            asset: self.base_asset,
            amount: fee_total - NETWORK_FEE_RESERVE,
            blinding_key: fee_change_addr.blinding_key.clone(),
        });

        let built = match self
            .pset
            .build_swap(&SwapPsetRequest {
                pset_base64: request.pset_base64.clone(),
                inputs: inputs.clone(),
                outputs,
                fee_inputs: fee_inputs.clone(),
                fee_change,
                millisats_per_byte: DEFAULT_MILLISATS_PER_BYTE,
            })
            .await
        {
            Ok(b) => b,
            Err(e) => {
                return self.fail_fresh_trade(
                    quote_asset,
                    Some(request),
                    SwapFailCode::Aborted,
                    e.to_string(),
                );
            }
        };

        let accept = SwapAccept {
            id: Uuid::new_v4().to_string(),
            request_id: request.id.clone(),
            pset_base64: built.pset_base64,
            input_blinding_keys: built.input_blinding_keys,
            output_blinding_keys: built.output_blinding_keys,
        };

        // Proposal, lock and accept land in one storage transaction so a
        // failure at any step leaves no half-negotiated state behind.
        let locked: Vec<Outpoint> = inputs
            .iter()
            .chain(fee_inputs.iter())
            .map(Unspent::key)
            .collect();
        let expiry_seconds = self.trade_expiry.as_secs();
        let accept_clone = accept.clone();
        let request_clone = request.clone();
        let trade_id = self.stores.transact(move |tx| {
            let now = unix_now();
            let mut trade = Trade::new(quote_asset);
            trade.propose(request_clone.clone(), now)?;
            tx.lock_unspents(&locked, trade.id())?;
            trade.accept(accept_clone.clone(), locked.clone(), now, expiry_seconds)?;
            let id = trade.id();
            tx.upsert_trade(trade);
            Ok(id)
        })?;

        // New addresses join the crawl set so funding and change show up.
        for info in [&receive_addr, &change_addr, &fee_change_addr] {
            self.observe(info);
        }

        log::info!("trade {trade_id} accepted for market {quote_asset}");
        Ok(ProposeOutcome::Accept { trade_id, accept })
    }

    // ── Complete ────────────────────────────────────────────────────

    /// Handle the trader's completion message: verify, broadcast, mark the
    /// trade completed and watch the txid for confirmation. Inputs remain
    /// locked until the crawler observes the spend.
    pub async fn complete(&self, raw_complete: &[u8]) -> Result<CompleteOutcome> {
        let complete = self.parser.parse_complete(raw_complete)?;

        let trade = self
            .stores
            .read(|tx| tx.trade_by_accept_id(&complete.accept_id))
            .ok_or(Error::TradeNotExist)?;
        let trade_id = trade.id();

        if trade.status() != TradeStatus::Accepted {
            return Err(Error::TradeStatusNotValid);
        }
        if trade.is_expired(unix_now()) {
            let fail = self.fail_and_unlock(trade_id, SwapFailCode::Expired, "trade expired")?;
            return Ok(CompleteOutcome::Fail { trade_id, fail });
        }

        let finalized = match self.pset.finalize_swap(&complete.tx_base64).await {
            Ok(tx) => tx,
            Err(e) => {
                let fail = self.fail_and_unlock(
                    trade_id,
                    SwapFailCode::FailedToComplete,
                    e.to_string(),
                )?;
                return Ok(CompleteOutcome::Fail { trade_id, fail });
            }
        };

        let txid = self.broadcast_with_retry(&finalized.tx_hex).await?;

        let complete_msg = complete.clone();
        let txid_for_store = txid.clone();
        self.stores.transact(move |tx| {
            let mut t = tx.trade(trade_id).ok_or(Error::TradeNotExist)?;
            t.complete(complete_msg.clone(), txid_for_store.clone(), unix_now())?;
            tx.upsert_trade(t);
            Ok(())
        })?;

        self.crawler.watch_tx(txid.clone());
        log::info!("trade {trade_id} completed in tx {txid}");
        Ok(CompleteOutcome::Completed { trade_id, txid })
    }

    // ── Expiry ──────────────────────────────────────────────────────

    /// Fail every accepted trade whose expiry has passed and release its
    /// locked inputs. Idempotent: a trade completed by a racing call is
    /// skipped.
    pub fn expire_stale(&self, now: u64) -> Result<Vec<Uuid>> {
        self.stores.transact(|tx| {
            let mut expired = Vec::new();
            for mut trade in tx.trades() {
                if !trade.is_expired(now) {
                    continue;
                }
                let keys: Vec<Outpoint> = trade.locked_outpoints().cloned().collect();
                trade.fail(SwapFailCode::Expired, "trade expired", now)?;
                tx.unlock_unspents(&keys)?;
                expired.push(trade.id());
                tx.upsert_trade(trade);
            }
            Ok(expired)
        })
    }

    /// Periodic wall-clock driver for [`Self::expire_stale`].
    pub fn spawn_expiry_timer(
        engine: Arc<TradeEngine>,
        period: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match engine.expire_stale(unix_now()) {
                    Ok(expired) if !expired.is_empty() => {
                        log::info!("expired {} stale trades", expired.len());
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("expiry sweep failed: {e}"),
                }
            }
        })
    }

    // ── Internals ───────────────────────────────────────────────────

    fn tradable_market(&self, quote_asset: &AssetId) -> Result<(Market, Vec<AddressInfo>)> {
        let market = self
            .stores
            .read(|tx| tx.market_by_quote_asset(quote_asset))
            .ok_or(Error::MarketNotExist)?;
        if !market.is_tradable() {
            return Err(Error::MarketIsClosed);
        }
        let addresses = self.account_addresses(market.account_index())?;
        Ok((market, addresses))
    }

    fn account_addresses(&self, account: crate::types::AccountIndex) -> Result<Vec<AddressInfo>> {
        let vault = self
            .stores
            .read(|tx| tx.vault())
            .ok_or(Error::WalletNotInitialized)?;
        Ok(vault.addresses_for_account(account))
    }

    /// Greedy, deterministic input selection: biggest value first, ties
    /// broken by outpoint order.
    fn select_inputs(
        &self,
        addresses: &[String],
        asset: &AssetId,
        target: u64,
    ) -> (Vec<Unspent>, u64) {
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

    fn within_slippage(&self, expected: u64, actual: u64) -> bool {
        let expected_d = Decimal::from(expected);
        let diff = Decimal::from(expected.abs_diff(actual));
        diff <= expected_d * self.slippage_fraction
    }

    /// Persist a trade that dies before (or at) the proposal stage and
    /// hand back its fail message.
    fn fail_fresh_trade(
        &self,
        quote_asset: AssetId,
        request: Option<SwapRequest>,
        code: SwapFailCode,
        message: impl Into<String>,
    ) -> Result<ProposeOutcome> {
        let message = message.into();
        let request_clone = request.clone();
        let msg = message.clone();
        let (trade_id, fail) = self.stores.transact(move |tx| {
            let now = unix_now();
            let mut trade = Trade::new(quote_asset);
            if let Some(req) = request_clone.clone() {
                trade.propose(req, now)?;
            }
            trade.fail(code, msg.clone(), now)?;
            let id = trade.id();
            let fail = trade.swap_fail().cloned().expect("fail blob just set");
            tx.upsert_trade(trade);
            Ok((id, fail))
        })?;
        log::warn!("trade {trade_id} failed during proposal: {message}");
        Ok(ProposeOutcome::Fail { trade_id, fail })
    }

    /// Fail an existing trade and release its locks in one transaction.
    fn fail_and_unlock(
        &self,
        trade_id: Uuid,
        code: SwapFailCode,
        message: impl Into<String>,
    ) -> Result<SwapFail> {
        let message = message.into();
        let msg = message.clone();
        self.stores.transact(move |tx| {
            let mut trade = tx.trade(trade_id).ok_or(Error::TradeNotExist)?;
            let keys: Vec<Outpoint> = trade.locked_outpoints().cloned().collect();
            trade.fail(code, msg.clone(), unix_now())?;
            tx.unlock_unspents(&keys)?;
            let fail = trade.swap_fail().cloned().expect("fail blob just set");
            tx.upsert_trade(trade);
            Ok(fail)
        })
    }

    async fn broadcast_with_retry(&self, tx_hex: &str) -> Result<String> {
        let mut last_err = None;
        for attempt in 0..3u32 {
            match self.chain.broadcast(tx_hex).await {
                Ok(txid) => return Ok(txid),
                Err(e) => {
                    log::warn!("broadcast attempt {} failed: {e}", attempt + 1);
                    last_err = Some(e);
                    let jitter = rand::thread_rng().gen_range(0..250u64);
                    tokio::time::sleep(Duration::from_millis(
                        (1u64 << attempt) * 500 + jitter,
                    ))
                    .await;
                }
            }
        }
        Err(last_err.unwrap_or(Error::Chain("broadcast failed".into())))
    }

    fn observe(&self, info: &AddressInfo) {
        self.crawler.add_observable(crate::crawler::Observable {
            account: info.account,
            address: info.address.clone(),
            blinding_key: info.blinding_key.clone(),
        });
    }

    /// Access to the preview path for the trader RPC surface.
    pub fn market_price(
        &self,
        quote_asset: &AssetId,
        amount: u64,
        is_base_asset: bool,
        is_buy: bool,
    ) -> Result<crate::market::Preview> {
        let (market, addresses) = self.tradable_market(quote_asset)?;
        let addrs: Vec<String> = addresses.iter().map(|a| a.address.clone()).collect();
        let (base_reserve, quote_reserve) = self.stores.read(|tx| {
            (
                tx.balance(&addrs, &self.base_asset),
                tx.balance(&addrs, quote_asset),
            )
        });
        market.preview(base_reserve, quote_reserve, amount, is_base_asset, is_buy)
    }

    /// Confirmed balances of the market pair, as the trader RPC reports
    /// them.
    pub fn market_balances(&self, quote_asset: &AssetId) -> Result<(u64, u64)> {
        let (_, addresses) = self.tradable_market(quote_asset)?;
        let addrs: Vec<String> = addresses.iter().map(|a| a.address.clone()).collect();
        Ok(self.stores.read(|tx| {
            (
                tx.balance(&addrs, &self.base_asset),
                tx.balance(&addrs, quote_asset),
            )
        }))
    }
}
