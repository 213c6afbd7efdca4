//! In-memory state snapshot backing the repositories.
//!
//! A transaction works on a deep copy of the snapshot and publishes it
//! atomically on commit. This mirrors the contract of an MVCC key-value
//! engine: a persistent backend can replace this module behind the same
//! `Stores` facade.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::market::Market;
use crate::trade::Trade;
use crate::types::Outpoint;
use crate::unspent::Unspent;
use crate::vault::Vault;

#[derive(Debug, Clone, Default)]
pub(crate) struct Snapshot {
    pub markets: BTreeMap<u32, Market>,
    pub trades: BTreeMap<Uuid, Trade>,
    pub vault: Option<Vault>,
    pub unspents: BTreeMap<Outpoint, Unspent>,
}

/// JSON projection of the snapshot, keyed the way the persisted layout
/// expects (`market:account`, `trade:uuid`, `vault`, `unspent:txid:vout`).
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedState {
    pub markets: Vec<Market>,
    pub trades: Vec<Trade>,
    pub vault: Option<Vault>,
    pub unspents: Vec<Unspent>,
}

impl Snapshot {
    pub(crate) fn to_persisted(&self) -> PersistedState {
        PersistedState {
            markets: self.markets.values().cloned().collect(),
            trades: self.trades.values().cloned().collect(),
            vault: self.vault.clone(),
            unspents: self.unspents.values().cloned().collect(),
        }
    }

    pub(crate) fn from_persisted(state: PersistedState) -> Self {
        Self {
            markets: state
                .markets
                .into_iter()
                .map(|m| (m.account_index().value(), m))
                .collect(),
            trades: state.trades.into_iter().map(|t| (t.id(), t)).collect(),
            vault: state.vault,
            unspents: state
                .unspents
                .into_iter()
                .map(|u| (u.key(), u))
                .collect(),
        }
    }
}
