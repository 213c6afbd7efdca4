use std::env;
use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::{Error, Result};
use crate::types::{AssetId, Network};

const DEFAULT_ENV_PREFIX: &str = "TIDEPOOL";

/// Daemon configuration, constructed once at startup and threaded through
/// constructors. Every key can be overridden through `<PREFIX>_<KEY>`
/// environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the trader RPC surface binds to.
    pub trader_listening_port: u16,
    /// Port the operator RPC surface binds to.
    pub operator_listening_port: u16,
    /// Chain explorer endpoint consumed by the ChainClient implementation.
    pub explorer_endpoint: String,
    /// Root directory for persistent state.
    pub data_dir_path: PathBuf,
    /// Logging verbosity, syslog-style (5 = info).
    pub log_level: u8,
    /// Default market fee in percent; converted to basis points on market
    /// creation.
    pub default_fee_percent: Decimal,
    pub network: Network,
    /// The single daemon-wide base asset. Defaults to the network's native
    /// asset.
    pub base_asset: AssetId,
    /// Crawler poll period per observed address.
    pub crawl_interval: Duration,
    /// Below this confirmed fee-account balance a warning is logged.
    pub fee_account_balance_threshold: u64,
    /// Window between swap Accept and the expiry of the trade.
    pub trade_expiry: Duration,
    /// Tolerated drift, in percent, between a swap request's amounts and
    /// the daemon's own preview.
    pub trade_slippage_percent: Decimal,
}

impl Default for Config {
    fn default() -> Self {
        let network = Network::Regtest;
        Self {
            trader_listening_port: 9945,
            operator_listening_port: 9000,
            explorer_endpoint: "http://127.0.0.1:3001".to_string(),
            data_dir_path: default_data_dir(),
            log_level: 5,
            default_fee_percent: Decimal::new(25, 2), // 0.25%
            network,
            base_asset: network.base_asset(),
            crawl_interval: Duration::from_secs(1),
            fee_account_balance_threshold: 1000,
            trade_expiry: Duration::from_secs(120),
            trade_slippage_percent: Decimal::from(5),
        }
    }
}

impl Config {
    /// Read configuration from the environment with the default prefix.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with_prefix(DEFAULT_ENV_PREFIX)
    }

    /// Read configuration from `<prefix>_*` environment variables, falling
    /// back to defaults for unset keys. Fails fast on any invalid value.
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self> {
        let mut cfg = Config::default();

        if let Some(v) = lookup(prefix, "TRADER_LISTENING_PORT") {
            cfg.trader_listening_port = parse_key(&v, "TRADER_LISTENING_PORT")?;
        }
        if let Some(v) = lookup(prefix, "OPERATOR_LISTENING_PORT") {
            cfg.operator_listening_port = parse_key(&v, "OPERATOR_LISTENING_PORT")?;
        }
        if let Some(v) = lookup(prefix, "EXPLORER_ENDPOINT") {
            cfg.explorer_endpoint = v;
        }
        if let Some(v) = lookup(prefix, "DATA_DIR_PATH") {
            cfg.data_dir_path = PathBuf::from(v);
        }
        if let Some(v) = lookup(prefix, "LOG_LEVEL") {
            cfg.log_level = parse_key(&v, "LOG_LEVEL")?;
        }
        if let Some(v) = lookup(prefix, "DEFAULT_FEE") {
            cfg.default_fee_percent = v
                .parse::<Decimal>()
                .map_err(|_| Error::Config(format!("DEFAULT_FEE is not a number: {v}")))?;
        }
        if let Some(v) = lookup(prefix, "NETWORK") {
            cfg.network = Network::from_name(&v)?;
            cfg.base_asset = cfg.network.base_asset();
        }
        if let Some(v) = lookup(prefix, "BASE_ASSET") {
            cfg.base_asset = AssetId::from_hex(&v)
                .map_err(|_| Error::Config(format!("BASE_ASSET is not a 32-byte hex id: {v}")))?;
        }
        if let Some(v) = lookup(prefix, "CRAWL_INTERVAL") {
            let secs: u64 = parse_key(&v, "CRAWL_INTERVAL")?;
            cfg.crawl_interval = Duration::from_secs(secs);
        }
        if let Some(v) = lookup(prefix, "FEE_ACCOUNT_BALANCE_THRESHOLD") {
            cfg.fee_account_balance_threshold = parse_key(&v, "FEE_ACCOUNT_BALANCE_THRESHOLD")?;
        }
        if let Some(v) = lookup(prefix, "TRADE_EXPIRY_SECONDS") {
            let secs: u64 = parse_key(&v, "TRADE_EXPIRY_SECONDS")?;
            cfg.trade_expiry = Duration::from_secs(secs);
        }
        if let Some(v) = lookup(prefix, "TRADE_SLIPPAGE_PERCENT") {
            cfg.trade_slippage_percent = v
                .parse::<Decimal>()
                .map_err(|_| Error::Config(format!("TRADE_SLIPPAGE_PERCENT is not a number: {v}")))?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate cross-field constraints. Invalid configuration at startup
    /// is fatal for the daemon.
    pub fn validate(&self) -> Result<()> {
        validate_fee_percent(self.default_fee_percent)?;
        if self.crawl_interval.is_zero() {
            return Err(Error::Config("CRAWL_INTERVAL must be at least 1s".into()));
        }
        if self.trade_expiry.is_zero() {
            return Err(Error::Config("TRADE_EXPIRY_SECONDS must be positive".into()));
        }
        if self.trade_slippage_percent <= Decimal::ZERO
            || self.trade_slippage_percent >= Decimal::from(100)
        {
            return Err(Error::Config(
                "TRADE_SLIPPAGE_PERCENT must be in (0, 100)".into(),
            ));
        }
        Ok(())
    }

    /// The default market fee expressed in basis points.
    pub fn default_fee_basis_points(&self) -> i64 {
        (self.default_fee_percent * Decimal::from(100))
            .to_i64()
            .unwrap_or(0)
    }
}

/// Percentage of the fee on each swap must be > 0.01 and < 99.
fn validate_fee_percent(fee: Decimal) -> Result<()> {
    if fee < Decimal::new(1, 2) || fee > Decimal::from(99) {
        return Err(Error::Config(
            "percentage of the fee on each swap must be > 0.01 and < 99".into(),
        ));
    }
    Ok(())
}

fn lookup(prefix: &str, key: &str) -> Option<String> {
    env::var(format!("{prefix}_{key}")).ok()
}

fn parse_key<T: std::str::FromStr>(value: &str, key: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| Error::Config(format!("{key} has an invalid value: {value}")))
}

fn default_data_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tidepool")
}
