//! Wallet lifecycle.
//!
//! The wallet is either uninitialized, syncing (initial restore scan in
//! flight), or ready with the vault locked or unlocked; every public
//! method pattern-matches on that status first. Initialization streams
//! progress events so a caller can render the gap-limit scan.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::crawler::{CrawlerHandle, Observable};
use crate::error::{Error, Result};
use crate::ports::{ChainClient, KeyStore, PsetBuilder, PsetOutput, TransferRequest};
use crate::storage::Stores;
use crate::types::{
    AccountIndex, AssetId, Outpoint, FEE_ACCOUNT, MARKET_ACCOUNT_START, WALLET_ACCOUNT,
};
use crate::unspent::{balances_by_asset, BalanceInfo, Unspent};
use crate::vault::{AddressInfo, Vault, CHAIN_EXTERNAL, CHAIN_INTERNAL, GAP_LIMIT};

use std::collections::HashMap;

/// Base-asset satoshis reserved per outgoing wallet transaction.
const NETWORK_FEE_RESERVE: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletStatus {
    Uninitialized,
    Syncing,
    Ready { locked: bool },
}

/// Progress of an `init_wallet` run.
#[derive(Debug, Clone)]
pub enum InitProgress {
    /// One address probed during the restore scan.
    Scanned {
        account: AccountIndex,
        chain: u32,
        index: u32,
        used: bool,
    },
    /// Scan finished for an account; counters are final.
    AccountRestored {
        account: AccountIndex,
        next_external: u32,
        next_internal: u32,
    },
    Done,
    Failed(String),
}

/// One requested output of `send_to_many`.
#[derive(Debug, Clone)]
pub struct TxOut {
    pub asset: AssetId,
    pub amount: u64,
    pub address: String,
}

#[derive(Clone)]
pub struct WalletService {
    stores: Stores,
    chain: Arc<dyn ChainClient>,
    pset: Arc<dyn PsetBuilder>,
    keystore: Arc<dyn KeyStore>,
    crawler: CrawlerHandle,
    base_asset: AssetId,
    syncing: Arc<AtomicBool>,
}

impl WalletService {
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
            syncing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn status(&self) -> WalletStatus {
        if self.syncing.load(Ordering::SeqCst) {
            return WalletStatus::Syncing;
        }
        match self.stores.read(|tx| tx.vault().map(|v| v.is_locked())) {
            None => WalletStatus::Uninitialized,
            Some(locked) => WalletStatus::Ready { locked },
        }
    }

    /// A fresh mnemonic for `init_wallet`.
    pub fn gen_seed(&self) -> Result<Vec<String>> {
        self.keystore.gen_seed()
    }

    // ── Initialization ──────────────────────────────────────────────

    /// Initialize the wallet from a mnemonic. With `restore` set, walks
    /// each account's chains until the gap limit and fast-forwards the
    /// derivation counters. Returns immediately with a progress stream;
    /// the wallet reports `Syncing` until the stream ends.
    pub fn init_wallet(
        &self,
        mnemonic: Vec<String>,
        passphrase: String,
        restore: bool,
    ) -> Result<mpsc::Receiver<InitProgress>> {
        match self.status() {
            WalletStatus::Uninitialized => {}
            WalletStatus::Syncing => return Err(Error::WalletIsSyncing),
            WalletStatus::Ready { .. } => return Err(Error::WalletAlreadyInitialized),
        }

        let (progress_tx, progress_rx) = mpsc::channel(64);
        self.syncing.store(true, Ordering::SeqCst);

        let service = self.clone();
        tokio::spawn(async move {
            let outcome = service
                .run_init(mnemonic.join(" "), passphrase, restore, &progress_tx)
                .await;
            service.syncing.store(false, Ordering::SeqCst);
            let final_event = match outcome {
                Ok(()) => InitProgress::Done,
                Err(e) => {
                    log::error!("wallet initialization failed: {e}");
                    InitProgress::Failed(e.to_string())
                }
            };
            let _ = progress_tx.send(final_event).await;
        });

        Ok(progress_rx)
    }

    async fn run_init(
        &self,
        mnemonic: String,
        passphrase: String,
        restore: bool,
        progress: &mpsc::Sender<InitProgress>,
    ) -> Result<()> {
        let mut vault = Vault::new(self.keystore.as_ref(), &mnemonic, &passphrase)?;

        if restore {
            // Fee and wallet accounts always exist; market accounts are
            // probed upward until one has no history at all.
            self.restore_account(&mut vault, FEE_ACCOUNT, progress).await?;
            self.restore_account(&mut vault, WALLET_ACCOUNT, progress).await?;
            let mut account = MARKET_ACCOUNT_START;
            loop {
                let (next_external, next_internal) =
                    self.restore_account(&mut vault, account, progress).await?;
                if next_external == 0 && next_internal == 0 {
                    break;
                }
                account = account.next();
            }
        } else {
            // Fresh wallet: one receive address per service account.
            vault.derive_next_external(self.keystore.as_ref(), FEE_ACCOUNT)?;
            vault.derive_next_external(self.keystore.as_ref(), WALLET_ACCOUNT)?;
        }

        let observables: Vec<Observable> = vault
            .accounts()
            .flat_map(|a| a.addresses().cloned().collect::<Vec<_>>())
            .map(|info| Observable {
                account: info.account,
                address: info.address,
                blinding_key: info.blinding_key,
            })
            .collect();

        self.stores.transact(|tx| {
            if tx.vault().is_some() {
                return Err(Error::WalletAlreadyInitialized);
            }
            tx.set_vault(vault.clone());
            Ok(())
        })?;

        for observable in observables {
            self.crawler.add_observable(observable);
        }
        log::info!("wallet initialized (restore={restore})");
        Ok(())
    }

    /// Walk one account's external and internal chains until `GAP_LIMIT`
    /// consecutive unused addresses, recording derivations along the way.
    /// Returns the restored counters.
    async fn restore_account(
        &self,
        vault: &mut Vault,
        account: AccountIndex,
        progress: &mpsc::Sender<InitProgress>,
    ) -> Result<(u32, u32)> {
        let mut counters = [0u32; 2];
        for (slot, chain) in [CHAIN_EXTERNAL, CHAIN_INTERNAL].into_iter().enumerate() {
            let mut unused_run = 0u32;
            let mut index = 0u32;
            let mut last_used: Option<u32> = None;
            while unused_run < GAP_LIMIT {
                let info = vault.derive_at(self.keystore.as_ref(), account, chain, index)?;
                let used = self
                    .chain
                    .has_history(&info.address, &info.blinding_key)
                    .await?;
                let _ = progress
                    .send(InitProgress::Scanned {
                        account,
                        chain,
                        index,
                        used,
                    })
                    .await;
                if used {
                    last_used = Some(index);
                    unused_run = 0;
                } else {
                    unused_run += 1;
                }
                index += 1;
            }
            counters[slot] = last_used.map(|i| i + 1).unwrap_or(0);
        }

        vault.set_account_counters(account, counters[0], counters[1]);
        let _ = progress
            .send(InitProgress::AccountRestored {
                account,
                next_external: counters[0],
                next_internal: counters[1],
            })
            .await;
        Ok((counters[0], counters[1]))
    }

    // ── Lock management ─────────────────────────────────────────────

    pub fn unlock_wallet(&self, passphrase: &str) -> Result<()> {
        self.ensure_ready()?;
        let keystore = Arc::clone(&self.keystore);
        let passphrase = passphrase.to_string();
        self.stores.transact(move |tx| {
            let mut vault = tx.vault().ok_or(Error::WalletNotInitialized)?;
            vault.unlock(keystore.as_ref(), &passphrase)?;
            tx.set_vault(vault);
            Ok(())
        })
    }

    pub fn lock_wallet(&self) -> Result<()> {
        self.ensure_ready()?;
        self.stores.transact(|tx| {
            let mut vault = tx.vault().ok_or(Error::WalletNotInitialized)?;
            vault.lock();
            tx.set_vault(vault);
            Ok(())
        })
    }

    pub fn change_password(&self, old_passphrase: &str, new_passphrase: &str) -> Result<()> {
        self.ensure_ready()?;
        let keystore = Arc::clone(&self.keystore);
        let old = old_passphrase.to_string();
        let new = new_passphrase.to_string();
        self.stores.transact(move |tx| {
            let mut vault = tx.vault().ok_or(Error::WalletNotInitialized)?;
            vault.change_passphrase(keystore.as_ref(), &old, &new)?;
            tx.set_vault(vault);
            Ok(())
        })
    }

    // ── Addresses & balances ────────────────────────────────────────

    /// Derive the next receive address of the personal wallet account and
    /// start observing it.
    pub fn wallet_address(&self) -> Result<AddressInfo> {
        self.ensure_ready()?;
        let keystore = Arc::clone(&self.keystore);
        let info = self.stores.transact(move |tx| {
            let mut vault = tx.vault().ok_or(Error::WalletNotInitialized)?;
            let info = vault.derive_next_external(keystore.as_ref(), WALLET_ACCOUNT)?;
            tx.set_vault(vault);
            Ok(info)
        })?;

        self.crawler.add_observable(Observable {
            account: info.account,
            address: info.address.clone(),
            blinding_key: info.blinding_key.clone(),
        });
        Ok(info)
    }

    /// Per-asset balances over the wallet account.
    pub fn wallet_balance(&self) -> Result<HashMap<AssetId, BalanceInfo>> {
        self.ensure_ready()?;
        let addresses = self.account_address_strings(WALLET_ACCOUNT)?;
        Ok(self.stores.read(|tx| {
            let unspents: Vec<Unspent> = tx
                .unspents_for_addresses(&addresses)
                .into_iter()
                .filter(|u| !u.spent)
                .collect();
            balances_by_asset(&unspents)
        }))
    }

    // ── Sending ─────────────────────────────────────────────────────

    /// Build (and optionally broadcast) a transaction paying the requested
    /// outputs out of the wallet account.
    pub async fn send_to_many(
        &self,
        outputs: Vec<TxOut>,
        millisats_per_byte: u64,
        push: bool,
    ) -> Result<crate::ports::BuiltTransfer> {
        self.ensure_ready()?;
        if outputs.is_empty() {
            return Err(Error::PreviewAmountTooLow);
        }

        let addresses = self.account_address_strings(WALLET_ACCOUNT)?;

        // Amount needed per asset, with the network fee reserve on top of
        // the base asset.
        let mut needed: HashMap<AssetId, u64> = HashMap::new();
        for out in &outputs {
            *needed.entry(out.asset).or_default() += out.amount;
        }
        *needed.entry(self.base_asset).or_default() += NETWORK_FEE_RESERVE;

        let mut inputs: Vec<Unspent> = Vec::new();
        let mut change_pairs: Vec<(AssetId, u64)> = Vec::new();
        for (asset, target) in &needed {
            let (selected, total) = self.select_available(&addresses, asset, *target);
            if total < *target {
                return Err(Error::WalletNotFunded);
            }
            if total > *target {
                change_pairs.push((*asset, total - *target));
            }
            inputs.extend(selected);
        }

        // Derive the change address and lock the selected inputs in one
        // transaction, so a concurrent caller cannot build against the
        // same outpoints while this transfer is in flight.
        let send_id = Uuid::new_v4();
        let locked_keys: Vec<Outpoint> = inputs.iter().map(Unspent::key).collect();
        let keystore = Arc::clone(&self.keystore);
        let keys_to_lock = locked_keys.clone();
        let change_info = self.stores.transact(move |tx| {
            let mut vault = tx.vault().ok_or(Error::WalletNotInitialized)?;
            let info = vault.derive_next_internal(keystore.as_ref(), WALLET_ACCOUNT)?;
            tx.lock_unspents(&keys_to_lock, send_id)?;
            tx.set_vault(vault);
            Ok(info)
        })?;
        let change_outputs: Vec<PsetOutput> = change_pairs
            .into_iter()
            .map(|(asset, amount)| PsetOutput {
                address: change_info.address.clone(),
                asset,
                amount,
                blinding_key: change_info.blinding_key.clone(),
            })
            .collect();

        let built = match self
            .pset
            .build_transfer(&TransferRequest {
                inputs,
                outputs: outputs
                    .into_iter()
                    .map(|o| PsetOutput {
                        address: o.address,
                        asset: o.asset,
                        amount: o.amount,
                        blinding_key: Vec::new(),
                    })
                    .collect(),
                change_outputs,
                millisats_per_byte,
            })
            .await
        {
            Ok(built) => built,
            Err(e) => {
                self.release_locks(&locked_keys);
                return Err(e);
            }
        };

        if push {
            if let Err(e) = self.chain.broadcast(&built.tx_hex).await {
                self.release_locks(&locked_keys);
                return Err(e);
            }
            self.crawler.watch_tx(built.txid.clone());
        }

        self.crawler.add_observable(Observable {
            account: change_info.account,
            address: change_info.address.clone(),
            blinding_key: change_info.blinding_key.clone(),
        });
        Ok(built)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn ensure_ready(&self) -> Result<()> {
        match self.status() {
            WalletStatus::Uninitialized => Err(Error::WalletNotInitialized),
            WalletStatus::Syncing => Err(Error::WalletIsSyncing),
            WalletStatus::Ready { .. } => Ok(()),
        }
    }

    /// Release input locks after an aborted build or broadcast.
    fn release_locks(&self, keys: &[Outpoint]) {
        let keys = keys.to_vec();
        if let Err(e) = self.stores.transact(move |tx| tx.unlock_unspents(&keys)) {
            log::warn!("failed to release transfer input locks: {e}");
        }
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
}
