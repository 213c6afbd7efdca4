//! tidepool: core of a non-custodial liquidity-provider daemon for a
//! confidential-asset UTXO chain.
//!
//! The crate owns the market domain model and pricing engine, the swap
//! state machine, the blockchain crawler and the unspent/vault
//! coordination. Transport, the persistent key-value engine, transaction
//! construction/signing and key derivation are consumed through the
//! capability traits in [`ports`].

pub mod config;
pub mod crawler;
pub mod engine;
pub mod error;
pub mod market;
pub mod operator;
pub mod ports;
pub mod storage;
pub mod testing;
pub mod trade;
pub mod types;
pub mod unspent;
pub mod vault;
pub mod wallet;

// ── Core types ──────────────────────────────────────────────────────
pub use config::Config;
pub use error::{Error, Result};
pub use types::{
    AccountIndex, AssetId, Network, Outpoint, FEE_ACCOUNT, MARKET_ACCOUNT_START, WALLET_ACCOUNT,
};

// ── Domain entities ─────────────────────────────────────────────────
pub use market::{FixedFee, Market, OutpointWithAsset, Preview, Prices, Strategy};
pub use trade::{SwapFailCode, SwapInfo, Trade, TradeStatus};
pub use unspent::{balances_by_asset, BalanceInfo, Unspent};
pub use vault::{keystore::SoftwareKeyStore, AddressInfo, Vault, GAP_LIMIT};

// ── Services ────────────────────────────────────────────────────────
pub use crawler::{spawn_crawler, CrawlerConfig, CrawlerEvent, CrawlerHandle, Observable};
pub use engine::{CompleteOutcome, ProposeOutcome, TradeEngine};
pub use operator::{OperatorOps, WithdrawMarketRequest};
pub use storage::{StoreTx, Stores};
pub use wallet::{InitProgress, TxOut, WalletService, WalletStatus};

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch; the single wall clock the services use.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
