//! The wallet's view of one transaction output.
//!
//! Unspents are created by the crawler when a funding output is observed,
//! locked by the trade engine during swap negotiation, and marked spent
//! when the crawler sees the consuming transaction. They are never
//! deleted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ports::ChainUtxo;
use crate::types::{AssetId, Outpoint};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unspent {
    pub outpoint: Outpoint,
    pub value: u64,
    pub asset: AssetId,
    pub address: String,
    pub script_pubkey: Vec<u8>,
    pub confirmed: bool,
    pub spent: bool,
    pub locked_by: Option<Uuid>,
    pub nonce: Vec<u8>,
    pub range_proof: Vec<u8>,
}

impl Unspent {
    /// Build an unspent from a chain-observed utxo at a known address.
    pub fn from_chain(utxo: ChainUtxo, address: impl Into<String>) -> Self {
        Self {
            outpoint: Outpoint::new(utxo.txid, utxo.vout),
            value: utxo.value,
            asset: utxo.asset,
            address: address.into(),
            script_pubkey: utxo.script_pubkey,
            confirmed: utxo.confirmed,
            spent: false,
            locked_by: None,
            nonce: utxo.nonce,
            range_proof: utxo.range_proof,
        }
    }

    pub fn key(&self) -> Outpoint {
        self.outpoint.clone()
    }

    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    pub fn lock(&mut self, trade_id: Uuid) {
        self.locked_by = Some(trade_id);
    }

    pub fn unlock(&mut self) {
        self.locked_by = None;
    }

    /// Marking an output spent releases any trade lock on it.
    pub fn spend(&mut self) {
        self.spent = true;
        self.locked_by = None;
    }

    /// Spendable right now: confirmed, not spent, not reserved by a trade.
    pub fn is_available(&self) -> bool {
        self.confirmed && !self.spent && !self.is_locked()
    }
}

/// Confirmed/unconfirmed totals for one asset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub total: u64,
    pub confirmed: u64,
    pub unconfirmed: u64,
}

/// Group a set of unspents into per-asset balances.
pub fn balances_by_asset<'a, I>(unspents: I) -> HashMap<AssetId, BalanceInfo>
where
    I: IntoIterator<Item = &'a Unspent>,
{
    let mut balances: HashMap<AssetId, BalanceInfo> = HashMap::new();
    for u in unspents {
        let entry = balances.entry(u.asset).or_default();
        entry.total += u.value;
        if u.confirmed {
            entry.confirmed += u.value;
        } else {
            entry.unconfirmed += u.value;
        }
    }
    balances
}
