//! HD accounts and the encrypted mnemonic.
//!
//! The vault never stores the mnemonic in clear: it keeps the ciphertext
//! plus, while unlocked, a short-lived decrypted copy in memory. Every
//! derivation goes through the [`KeyStore`] capability at the fixed path
//! pattern `m/account'/chain/child` and is recorded so scripts can be
//! mapped back to their derivation paths.

pub mod keystore;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ports::KeyStore;
use crate::types::AccountIndex;

/// External receive chain.
pub const CHAIN_EXTERNAL: u32 = 0;
/// Internal change chain.
pub const CHAIN_INTERNAL: u32 = 1;

/// BIP-44 style restore heuristic: this many consecutive unused addresses
/// mark the end of an account chain.
pub const GAP_LIMIT: u32 = 20;

/// One derived address, with everything callers need to observe or spend
/// from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfo {
    pub account: AccountIndex,
    pub address: String,
    pub script_pubkey: Vec<u8>,
    pub blinding_key: Vec<u8>,
    pub derivation_path: String,
}

/// Per-account derivation bookkeeping. Counters only ever grow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    index: AccountIndex,
    next_external: u32,
    next_internal: u32,
    /// script hex → derived address info, for both chains.
    by_script: HashMap<String, AddressInfo>,
}

impl Account {
    fn new(index: AccountIndex) -> Self {
        Self {
            index,
            next_external: 0,
            next_internal: 0,
            by_script: HashMap::new(),
        }
    }

    pub fn index(&self) -> AccountIndex {
        self.index
    }

    pub fn next_external_index(&self) -> u32 {
        self.next_external
    }

    pub fn next_internal_index(&self) -> u32 {
        self.next_internal
    }

    pub fn derivation_path_for_script(&self, script_hex: &str) -> Option<&str> {
        self.by_script
            .get(script_hex)
            .map(|i| i.derivation_path.as_str())
    }

    pub fn addresses(&self) -> impl Iterator<Item = &AddressInfo> {
        self.by_script.values()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vault {
    encrypted_mnemonic: Vec<u8>,
    accounts: BTreeMap<u32, Account>,
    /// Decrypted mnemonic while unlocked; never persisted.
    #[serde(skip)]
    unlocked_mnemonic: Option<String>,
}

impl Vault {
    /// Create a vault around a mnemonic, encrypting it immediately. The
    /// fresh vault is unlocked, since the caller is mid-initialization.
    pub fn new(keystore: &dyn KeyStore, mnemonic: &str, passphrase: &str) -> Result<Self> {
        let encrypted_mnemonic = keystore.encrypt_mnemonic(mnemonic, passphrase)?;
        Ok(Self {
            encrypted_mnemonic,
            accounts: BTreeMap::new(),
            unlocked_mnemonic: Some(mnemonic.to_string()),
        })
    }

    pub fn is_locked(&self) -> bool {
        self.unlocked_mnemonic.is_none()
    }

    /// Decrypt the mnemonic and keep it in memory. A wrong passphrase is
    /// rejected by the key store.
    pub fn unlock(&mut self, keystore: &dyn KeyStore, passphrase: &str) -> Result<()> {
        if self.unlocked_mnemonic.is_some() {
            return Ok(());
        }
        let mnemonic = keystore.decrypt_mnemonic(&self.encrypted_mnemonic, passphrase)?;
        self.unlocked_mnemonic = Some(mnemonic);
        Ok(())
    }

    pub fn lock(&mut self) {
        self.unlocked_mnemonic = None;
    }

    /// Re-encrypt the mnemonic under a new passphrase. Requires the vault
    /// to be locked so no derivation is in flight.
    pub fn change_passphrase(
        &mut self,
        keystore: &dyn KeyStore,
        old_passphrase: &str,
        new_passphrase: &str,
    ) -> Result<()> {
        if !self.is_locked() {
            return Err(Error::MustBeLocked);
        }
        let mnemonic = keystore.decrypt_mnemonic(&self.encrypted_mnemonic, old_passphrase)?;
        self.encrypted_mnemonic = keystore.encrypt_mnemonic(&mnemonic, new_passphrase)?;
        Ok(())
    }

    // ── Accounts ────────────────────────────────────────────────────

    pub fn account(&self, index: AccountIndex) -> Option<&Account> {
        self.accounts.get(&index.value())
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    pub fn get_or_create_account(&mut self, index: AccountIndex) -> &mut Account {
        self.accounts
            .entry(index.value())
            .or_insert_with(|| Account::new(index))
    }

    /// Account owning the given address, if any.
    pub fn account_by_address(&self, address: &str) -> Option<AccountIndex> {
        self.accounts.values().find_map(|a| {
            a.by_script
                .values()
                .any(|info| info.address == address)
                .then_some(a.index)
        })
    }

    /// Every address ever derived for an account, with blinding keys.
    pub fn addresses_for_account(&self, index: AccountIndex) -> Vec<AddressInfo> {
        self.account(index)
            .map(|a| a.by_script.values().cloned().collect())
            .unwrap_or_default()
    }

    // ── Derivation ──────────────────────────────────────────────────

    /// Derive the next external (receive) address of an account and bump
    /// its counter.
    pub fn derive_next_external(
        &mut self,
        keystore: &dyn KeyStore,
        account: AccountIndex,
    ) -> Result<AddressInfo> {
        self.derive_next(keystore, account, CHAIN_EXTERNAL)
    }

    /// Derive the next internal (change) address of an account and bump
    /// its counter.
    pub fn derive_next_internal(
        &mut self,
        keystore: &dyn KeyStore,
        account: AccountIndex,
    ) -> Result<AddressInfo> {
        self.derive_next(keystore, account, CHAIN_INTERNAL)
    }

    fn derive_next(
        &mut self,
        keystore: &dyn KeyStore,
        account: AccountIndex,
        chain: u32,
    ) -> Result<AddressInfo> {
        let child = {
            let acc = self.get_or_create_account(account);
            match chain {
                CHAIN_EXTERNAL => acc.next_external,
                _ => acc.next_internal,
            }
        };
        let info = self.derive_at(keystore, account, chain, child)?;
        let acc = self.get_or_create_account(account);
        match chain {
            CHAIN_EXTERNAL => acc.next_external = child + 1,
            _ => acc.next_internal = child + 1,
        }
        Ok(info)
    }

    /// Derive one child without touching the counters, recording the
    /// script → path mapping. Re-deriving a recorded index yields the same
    /// material.
    pub fn derive_at(
        &mut self,
        keystore: &dyn KeyStore,
        account: AccountIndex,
        chain: u32,
        child: u32,
    ) -> Result<AddressInfo> {
        let mnemonic = self
            .unlocked_mnemonic
            .clone()
            .ok_or(Error::MustBeUnlocked)?;
        let derived = keystore.derive_child(&mnemonic, account.value(), chain, child)?;
        let info = AddressInfo {
            account,
            address: derived.address,
            script_pubkey: derived.script_pubkey.clone(),
            blinding_key: derived.blinding_key,
            derivation_path: format!("{}'/{}/{}", account.value(), chain, child),
        };
        let acc = self.get_or_create_account(account);
        acc.by_script
            .insert(hex::encode(&derived.script_pubkey), info.clone());
        Ok(info)
    }

    /// Fast-forward an account's counters after a restore scan.
    pub fn set_account_counters(
        &mut self,
        account: AccountIndex,
        next_external: u32,
        next_internal: u32,
    ) {
        let acc = self.get_or_create_account(account);
        acc.next_external = acc.next_external.max(next_external);
        acc.next_internal = acc.next_internal.max(next_internal);
    }
}
