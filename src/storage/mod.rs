//! Repository facade with closure-based transactions.
//!
//! All state-mutating paths run inside [`Stores::transact`]: the closure
//! receives a mutable snapshot, `Ok` publishes it atomically, `Err`
//! discards it. Concurrent committers race under first-committer-wins;
//! the loser retries on a fresh snapshot up to three times.

mod memory;

pub use memory::PersistedState;

use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::market::Market;
use crate::trade::Trade;
use crate::types::{AccountIndex, AssetId, Outpoint, MARKET_ACCOUNT_START};
use crate::unspent::Unspent;
use crate::vault::Vault;

use memory::Snapshot;

/// Commit attempts before a transaction gives up with `TxConflict`.
const MAX_TX_ATTEMPTS: usize = 3;

struct Versioned {
    snapshot: Snapshot,
    version: u64,
}

/// Shared, transactional repositories for markets, trades, the vault and
/// the unspent set.
#[derive(Clone)]
pub struct Stores {
    inner: Arc<RwLock<Versioned>>,
}

impl Default for Stores {
    fn default() -> Self {
        Self::new()
    }
}

impl Stores {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Versioned {
                snapshot: Snapshot::default(),
                version: 0,
            })),
        }
    }

    /// Run `f` against a private copy of the state. `Ok` commits if no
    /// other writer got there first, otherwise the closure is re-run on a
    /// fresh copy; `Err` rolls back immediately.
    pub fn transact<T>(&self, mut f: impl FnMut(&mut StoreTx) -> Result<T>) -> Result<T> {
        for _ in 0..MAX_TX_ATTEMPTS {
            let (mut tx, base_version) = {
                let guard = self.inner.read().expect("storage lock");
                (
                    StoreTx {
                        snap: guard.snapshot.clone(),
                    },
                    guard.version,
                )
            };

            let out = f(&mut tx)?;

            let mut guard = self.inner.write().expect("storage lock");
            if guard.version == base_version {
                guard.snapshot = tx.snap;
                guard.version += 1;
                return Ok(out);
            }
            log::debug!("storage commit conflict at version {base_version}, retrying");
        }
        Err(Error::TxConflict)
    }

    /// Read-only view of the last committed state.
    pub fn read<T>(&self, f: impl FnOnce(&StoreTx) -> T) -> T {
        let guard = self.inner.read().expect("storage lock");
        let tx = StoreTx {
            snap: guard.snapshot.clone(),
        };
        f(&tx)
    }

    /// JSON dump of the committed state, for the persistence layer.
    pub fn export_json(&self) -> Result<String> {
        let guard = self.inner.read().expect("storage lock");
        serde_json::to_string(&guard.snapshot.to_persisted())
            .map_err(|e| Error::Config(format!("state serialization failed: {e}")))
    }

    /// Restore a previously exported state.
    pub fn import_json(&self, json: &str) -> Result<()> {
        let state: PersistedState = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("state deserialization failed: {e}")))?;
        let mut guard = self.inner.write().expect("storage lock");
        guard.snapshot = Snapshot::from_persisted(state);
        guard.version += 1;
        Ok(())
    }
}

/// A private, mutable copy of the daemon state.
pub struct StoreTx {
    snap: Snapshot,
}

impl StoreTx {
    // ── Markets ─────────────────────────────────────────────────────

    pub fn market_by_account(&self, account: AccountIndex) -> Option<Market> {
        self.snap.markets.get(&account.value()).cloned()
    }

    pub fn market_by_quote_asset(&self, quote_asset: &AssetId) -> Option<Market> {
        self.snap
            .markets
            .values()
            .find(|m| m.quote_asset() == Some(*quote_asset))
            .cloned()
    }

    pub fn markets(&self) -> Vec<Market> {
        self.snap.markets.values().cloned().collect()
    }

    /// Highest market account in use, if any market exists.
    pub fn latest_market_account(&self) -> Option<AccountIndex> {
        self.snap
            .markets
            .keys()
            .next_back()
            .map(|v| AccountIndex::new(*v))
    }

    /// Fetch a market, creating an empty one with the default fee when the
    /// account has none yet.
    pub fn get_or_create_market(
        &mut self,
        account: AccountIndex,
        default_fee_basis_points: i64,
    ) -> Result<Market> {
        if !account.is_market_account() {
            return Err(Error::InvalidAccount);
        }
        if let Some(m) = self.snap.markets.get(&account.value()) {
            return Ok(m.clone());
        }
        let market = Market::new(account, default_fee_basis_points)?;
        self.snap.markets.insert(account.value(), market.clone());
        Ok(market)
    }

    pub fn update_market(&mut self, market: Market) {
        self.snap
            .markets
            .insert(market.account_index().value(), market);
    }

    /// First unused market account index (max existing + 1).
    pub fn next_free_market_account(&self) -> AccountIndex {
        self.latest_market_account()
            .map(|a| a.next())
            .unwrap_or(MARKET_ACCOUNT_START)
    }

    // ── Trades ──────────────────────────────────────────────────────

    pub fn trade(&self, id: Uuid) -> Option<Trade> {
        self.snap.trades.get(&id).cloned()
    }

    pub fn trades(&self) -> Vec<Trade> {
        self.snap.trades.values().cloned().collect()
    }

    pub fn trades_for_quote_asset(&self, quote_asset: &AssetId) -> Vec<Trade> {
        self.snap
            .trades
            .values()
            .filter(|t| t.market_quote_asset() == *quote_asset)
            .cloned()
            .collect()
    }

    pub fn trade_by_accept_id(&self, accept_id: &str) -> Option<Trade> {
        self.snap
            .trades
            .values()
            .find(|t| t.swap_accept().map(|a| a.id.as_str()) == Some(accept_id))
            .cloned()
    }

    pub fn upsert_trade(&mut self, trade: Trade) {
        self.snap.trades.insert(trade.id(), trade);
    }

    // ── Vault ───────────────────────────────────────────────────────

    pub fn vault(&self) -> Option<Vault> {
        self.snap.vault.clone()
    }

    pub fn set_vault(&mut self, vault: Vault) {
        self.snap.vault = Some(vault);
    }

    // ── Unspents ────────────────────────────────────────────────────

    /// Reconcile the full unspent set of one address: unknown outpoints
    /// are inserted, known outpoints of that address missing from
    /// `unspents` are marked spent, everything else is untouched.
    pub fn add_unspents(&mut self, address: &str, unspents: Vec<Unspent>) -> Result<()> {
        if unspents.iter().any(|u| u.address != address) {
            return Err(Error::UnspentAddressMismatch);
        }

        for incoming in &unspents {
            self.snap
                .unspents
                .entry(incoming.key())
                .or_insert_with(|| incoming.clone());
        }

        for existing in self.snap.unspents.values_mut() {
            if existing.address != address || existing.spent {
                continue;
            }
            let still_there = unspents.iter().any(|u| u.key() == existing.key());
            if !still_there {
                existing.spend();
            }
        }
        Ok(())
    }

    pub fn unspent(&self, key: &Outpoint) -> Option<Unspent> {
        self.snap.unspents.get(key).cloned()
    }

    /// Every entry that has not been spent.
    pub fn all_unspents(&self) -> Vec<Unspent> {
        self.snap
            .unspents
            .values()
            .filter(|u| !u.spent)
            .cloned()
            .collect()
    }

    /// Every entry that has been spent.
    pub fn all_spents(&self) -> Vec<Unspent> {
        self.snap
            .unspents
            .values()
            .filter(|u| u.spent)
            .cloned()
            .collect()
    }

    /// Every entry for the given addresses, spent ones included.
    pub fn unspents_for_addresses(&self, addresses: &[String]) -> Vec<Unspent> {
        self.snap
            .unspents
            .values()
            .filter(|u| addresses.iter().any(|a| *a == u.address))
            .cloned()
            .collect()
    }

    /// Spendable entries (confirmed, unspent, unlocked) for the addresses.
    pub fn available_for_addresses(&self, addresses: &[String]) -> Vec<Unspent> {
        self.snap
            .unspents
            .values()
            .filter(|u| u.is_available() && addresses.iter().any(|a| *a == u.address))
            .cloned()
            .collect()
    }

    /// Confirmed, unspent balance of one asset over the addresses. Locked
    /// entries still count: they are reserved, not gone.
    pub fn balance(&self, addresses: &[String], asset: &AssetId) -> u64 {
        self.snap
            .unspents
            .values()
            .filter(|u| {
                u.confirmed
                    && !u.spent
                    && u.asset == *asset
                    && addresses.iter().any(|a| *a == u.address)
            })
            .map(|u| u.value)
            .sum()
    }

    /// Spendable balance of one asset over the addresses.
    pub fn available_balance(&self, addresses: &[String], asset: &AssetId) -> u64 {
        self.available_for_addresses(addresses)
            .iter()
            .filter(|u| u.asset == *asset)
            .map(|u| u.value)
            .sum()
    }

    /// Lock every key to the trade, or none: a missing key fails the whole
    /// operation before any entry is touched.
    pub fn lock_unspents(&mut self, keys: &[Outpoint], trade_id: Uuid) -> Result<()> {
        for key in keys {
            if !self.snap.unspents.contains_key(key) {
                return Err(Error::UnspentNotFound(key.to_string()));
            }
        }
        for key in keys {
            if let Some(u) = self.snap.unspents.get_mut(key) {
                u.lock(trade_id);
            }
        }
        Ok(())
    }

    /// Release every key, or none.
    pub fn unlock_unspents(&mut self, keys: &[Outpoint]) -> Result<()> {
        for key in keys {
            if !self.snap.unspents.contains_key(key) {
                return Err(Error::UnspentNotFound(key.to_string()));
            }
        }
        for key in keys {
            if let Some(u) = self.snap.unspents.get_mut(key) {
                u.unlock();
            }
        }
        Ok(())
    }

    /// Mark keys spent (releasing any locks), or fail before touching
    /// anything.
    pub fn spend_unspents(&mut self, keys: &[Outpoint]) -> Result<()> {
        for key in keys {
            if !self.snap.unspents.contains_key(key) {
                return Err(Error::UnspentNotFound(key.to_string()));
            }
        }
        for key in keys {
            if let Some(u) = self.snap.unspents.get_mut(key) {
                u.spend();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ChainUtxo;

    fn asset(byte: u8) -> AssetId {
        AssetId::new([byte; 32])
    }

    fn unspent(txid: &str, vout: u32, addr: &str, value: u64) -> Unspent {
        Unspent::from_chain(
            ChainUtxo {
                txid: txid.into(),
                vout,
                value,
                asset: asset(1),
                script_pubkey: vec![],
                confirmed: true,
                nonce: vec![],
                range_proof: vec![],
            },
            addr,
        )
    }

    #[test]
    fn reconciliation_marks_stale_entries_spent() {
        let stores = Stores::new();
        stores
            .transact(|tx| {
                tx.add_unspents(
                    "a",
                    vec![unspent("tx1", 1, "a", 10), unspent("tx2", 2, "a", 20)],
                )
            })
            .unwrap();

        stores
            .transact(|tx| {
                tx.add_unspents(
                    "a",
                    vec![unspent("tx1", 1, "a", 10), unspent("tx4", 2, "a", 40)],
                )
            })
            .unwrap();

        stores.read(|tx| {
            let all = tx.unspents_for_addresses(&["a".to_string()]);
            assert_eq!(all.len(), 3);
            let spent: Vec<_> = all.iter().filter(|u| u.spent).collect();
            assert_eq!(spent.len(), 1);
            assert_eq!(spent[0].outpoint, Outpoint::new("tx2", 2));
        });
    }

    #[test]
    fn reconciliation_leaves_other_addresses_alone() {
        let stores = Stores::new();
        stores
            .transact(|tx| {
                tx.add_unspents("a", vec![unspent("tx1", 0, "a", 10)])?;
                tx.add_unspents("b", vec![unspent("tx2", 0, "b", 20)])
            })
            .unwrap();

        // Address a loses its only utxo; b must be untouched.
        stores.transact(|tx| tx.add_unspents("a", vec![])).unwrap();

        stores.read(|tx| {
            assert!(tx.unspent(&Outpoint::new("tx1", 0)).unwrap().spent);
            assert!(!tx.unspent(&Outpoint::new("tx2", 0)).unwrap().spent);
        });
    }

    #[test]
    fn reconciliation_rejects_mixed_addresses() {
        let stores = Stores::new();
        let err = stores
            .transact(|tx| {
                tx.add_unspents(
                    "a",
                    vec![unspent("tx1", 0, "a", 10), unspent("tx2", 0, "b", 20)],
                )
            })
            .unwrap_err();
        assert!(matches!(err, Error::UnspentAddressMismatch));
    }

    #[test]
    fn lock_is_all_or_nothing() {
        let stores = Stores::new();
        stores
            .transact(|tx| tx.add_unspents("a", vec![unspent("tx1", 0, "a", 10)]))
            .unwrap();

        let trade_id = Uuid::new_v4();
        let keys = vec![Outpoint::new("tx1", 0), Outpoint::new("missing", 9)];
        let err = stores
            .transact(|tx| tx.lock_unspents(&keys, trade_id))
            .unwrap_err();
        assert!(matches!(err, Error::UnspentNotFound(_)));

        // The failed lock left the store unchanged.
        stores.read(|tx| {
            assert!(!tx.unspent(&Outpoint::new("tx1", 0)).unwrap().is_locked());
        });

        stores
            .transact(|tx| tx.lock_unspents(&[Outpoint::new("tx1", 0)], trade_id))
            .unwrap();
        stores.read(|tx| {
            assert_eq!(
                tx.unspent(&Outpoint::new("tx1", 0)).unwrap().locked_by,
                Some(trade_id)
            );
        });
    }

    #[test]
    fn balances_exclude_locked_only_when_available() {
        let stores = Stores::new();
        stores
            .transact(|tx| {
                tx.add_unspents(
                    "a",
                    vec![unspent("tx1", 0, "a", 10), unspent("tx2", 0, "a", 20)],
                )
            })
            .unwrap();
        stores
            .transact(|tx| tx.lock_unspents(&[Outpoint::new("tx1", 0)], Uuid::new_v4()))
            .unwrap();

        stores.read(|tx| {
            let addrs = vec!["a".to_string()];
            assert_eq!(tx.balance(&addrs, &asset(1)), 30);
            assert_eq!(tx.available_balance(&addrs, &asset(1)), 20);
        });
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let stores = Stores::new();
        let err = stores
            .transact(|tx| -> Result<()> {
                tx.add_unspents("a", vec![unspent("tx1", 0, "a", 10)])?;
                Err(Error::WalletNotFunded)
            })
            .unwrap_err();
        assert!(matches!(err, Error::WalletNotFunded));
        stores.read(|tx| assert!(tx.unspent(&Outpoint::new("tx1", 0)).is_none()));
    }

    #[test]
    fn get_or_create_market_assigns_and_validates_accounts() {
        let stores = Stores::new();
        stores
            .transact(|tx| {
                assert!(matches!(
                    tx.get_or_create_market(AccountIndex::new(1), 25),
                    Err(Error::InvalidAccount)
                ));
                tx.get_or_create_market(MARKET_ACCOUNT_START, 25)
            })
            .unwrap();
        stores.read(|tx| {
            assert_eq!(tx.latest_market_account(), Some(MARKET_ACCOUNT_START));
            assert_eq!(
                tx.next_free_market_account(),
                MARKET_ACCOUNT_START.next()
            );
        });
    }

    #[test]
    fn export_import_round_trip() {
        let stores = Stores::new();
        stores
            .transact(|tx| {
                tx.get_or_create_market(MARKET_ACCOUNT_START, 25)?;
                tx.add_unspents("a", vec![unspent("tx1", 0, "a", 10)])
            })
            .unwrap();
        let json = stores.export_json().unwrap();

        let restored = Stores::new();
        restored.import_json(&json).unwrap();
        restored.read(|tx| {
            assert_eq!(tx.markets().len(), 1);
            assert_eq!(tx.all_unspents().len(), 1);
        });
    }
}
