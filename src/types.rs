use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

// ── Asset ids ───────────────────────────────────────────────────────

/// Opaque 32-byte asset identifier, rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetId([u8; 32]);

impl AssetId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidAssetId(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidAssetId(s.to_string()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetId({})", self.to_hex())
    }
}

impl FromStr for AssetId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for AssetId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for AssetId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        AssetId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ── Outpoints ───────────────────────────────────────────────────────

/// Reference to a transaction output. Ordered so that input selection
/// and iteration over sets of outpoints are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Outpoint {
    pub txid: String,
    pub vout: u32,
}

impl Outpoint {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self {
            txid: txid.into(),
            vout,
        }
    }
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

// ── Accounts ────────────────────────────────────────────────────────

/// Opaque index of an HD wallet account. Markets never see the raw
/// number outside the core.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct AccountIndex(u32);

/// Network fees are paid out of this account.
pub const FEE_ACCOUNT: AccountIndex = AccountIndex(0);
/// Personal wallet funds (WalletAddress / SendToMany).
pub const WALLET_ACCOUNT: AccountIndex = AccountIndex(1);
/// Market N occupies account `MARKET_ACCOUNT_START + N`.
pub const MARKET_ACCOUNT_START: AccountIndex = AccountIndex(5);

impl AccountIndex {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn is_market_account(&self) -> bool {
        self.0 >= MARKET_ACCOUNT_START.0
    }

    pub fn next(&self) -> AccountIndex {
        AccountIndex(self.0 + 1)
    }
}

impl fmt::Display for AccountIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Networks ────────────────────────────────────────────────────────

/// Chain flavor; selects the native (base) asset id constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

const MAINNET_BASE_ASSET: &str = "6f0279e9ed041c3d710a9f57d0c02928416460c4b722ae3457a11eec381c526d";
const TESTNET_BASE_ASSET: &str = "144c654344aa716d6f3abcc1ca90e5641e4e2a7f633bc09fe3baf64585819a49";
const REGTEST_BASE_ASSET: &str = "5ac9f65c0efcc4775e0baec4ec03abdde22473cd3cf33c0419ca290e0751b225";

impl Network {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "mainnet" | "liquid" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(Error::Config(format!("unknown network: {other}"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    /// The native asset of the chain, used as the daemon-wide base asset
    /// unless overridden by configuration.
    pub fn base_asset(&self) -> AssetId {
        let hex_id = match self {
            Network::Mainnet => MAINNET_BASE_ASSET,
            Network::Testnet => TESTNET_BASE_ASSET,
            Network::Regtest => REGTEST_BASE_ASSET,
        };
        // The constants above are valid 64-char hex by construction.
        AssetId::from_hex(hex_id).expect("network base asset constant")
    }
}
