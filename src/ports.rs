//! External capabilities consumed by the core.
//!
//! The daemon treats the chain explorer, confidential-transaction
//! construction, key derivation and the swap wire format as opaque
//! collaborators behind these traits. Implementations live outside the
//! core (the in-repo ones under `testing` and `vault::keystore` exist for
//! tests and software wallets).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::AssetId;
use crate::unspent::Unspent;

// ── Chain client ────────────────────────────────────────────────────

/// One unspent output as reported by the chain explorer, already
/// unblinded with the address's blinding key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainUtxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub asset: AssetId,
    pub script_pubkey: Vec<u8>,
    pub confirmed: bool,
    pub nonce: Vec<u8>,
    pub range_proof: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    pub block_height: Option<u32>,
}

/// Read/broadcast access to the chain through an explorer.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Unspent outputs currently paying the address.
    async fn get_utxos(&self, address: &str, blinding_key: &[u8]) -> Result<Vec<ChainUtxo>>;

    /// Broadcast a raw transaction, returning its txid.
    async fn broadcast(&self, tx_hex: &str) -> Result<String>;

    /// Confirmation status of a transaction.
    async fn tx_status(&self, txid: &str) -> Result<TxStatus>;

    /// Whether the address appears anywhere in chain history. Drives the
    /// gap-limit walk on wallet restore.
    async fn has_history(&self, address: &str, blinding_key: &[u8]) -> Result<bool>;
}

// ── Swap wire format ────────────────────────────────────────────────

/// A counterparty's opening message: what they send, what they want back,
/// and the partially built transaction carrying their inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub id: String,
    pub amount_p: u64,
    pub asset_p: AssetId,
    pub amount_r: u64,
    pub asset_r: AssetId,
    pub pset_base64: String,
    pub input_blinding_keys: Vec<Vec<u8>>,
    pub output_blinding_keys: Vec<Vec<u8>>,
}

/// The daemon's answer: the same transaction completed with the provider's
/// inputs and blinded outputs, ready for the trader's signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapAccept {
    pub id: String,
    pub request_id: String,
    pub pset_base64: String,
    pub input_blinding_keys: Vec<Vec<u8>>,
    pub output_blinding_keys: Vec<Vec<u8>>,
}

/// The trader's closing message carrying the fully signed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapComplete {
    pub id: String,
    pub accept_id: String,
    pub tx_base64: String,
}

/// Terminal failure notice; `code` is one of the protocol fail codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapFail {
    pub id: String,
    pub message_id: String,
    pub code: u32,
    pub message: String,
}

/// Serialization of the four swap messages. Malformed input surfaces as
/// `Error::Swap` and becomes a fail message with the malformed code.
pub trait SwapParser: Send + Sync {
    fn parse_request(&self, raw: &[u8]) -> Result<SwapRequest>;
    fn parse_complete(&self, raw: &[u8]) -> Result<SwapComplete>;
    fn serialize_accept(&self, accept: &SwapAccept) -> Result<Vec<u8>>;
    fn serialize_fail(&self, fail: &SwapFail) -> Result<Vec<u8>>;
}

// ── PSet builder ────────────────────────────────────────────────────

/// One output the builder must add and blind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsetOutput {
    pub address: String,
    pub asset: AssetId,
    pub amount: u64,
    pub blinding_key: Vec<u8>,
}

/// Everything the builder needs to counter-fund a trader's swap request.
#[derive(Debug, Clone)]
pub struct SwapPsetRequest {
    /// The trader's partial transaction from the swap request.
    pub pset_base64: String,
    /// Provider inputs to attach.
    pub inputs: Vec<Unspent>,
    /// Provider outputs (trade leg and change), to be blinded.
    pub outputs: Vec<PsetOutput>,
    /// Inputs paying the network fee.
    pub fee_inputs: Vec<Unspent>,
    /// Change output for the fee account.
    pub fee_change: Option<PsetOutput>,
    pub millisats_per_byte: u64,
}

#[derive(Debug, Clone)]
pub struct BuiltPset {
    pub pset_base64: String,
    pub input_blinding_keys: Vec<Vec<u8>>,
    pub output_blinding_keys: Vec<Vec<u8>>,
}

/// A one-sided transfer (withdrawal, send-to-many) to build, blind and
/// sign in one go.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub inputs: Vec<Unspent>,
    pub outputs: Vec<PsetOutput>,
    pub change_outputs: Vec<PsetOutput>,
    pub millisats_per_byte: u64,
}

#[derive(Debug, Clone)]
pub struct BuiltTransfer {
    pub txid: String,
    pub tx_hex: String,
}

#[derive(Debug, Clone)]
pub struct CompletedTx {
    pub txid: String,
    pub tx_hex: String,
}

/// Confidential-transaction construction and signing, treated as opaque.
#[async_trait]
pub trait PsetBuilder: Send + Sync {
    /// Combine the trader's partial swap transaction with the provider's
    /// inputs/outputs and blind the result.
    async fn build_swap(&self, request: &SwapPsetRequest) -> Result<BuiltPset>;

    /// Verify the signatures of a completed swap and extract the final
    /// transaction.
    async fn finalize_swap(&self, tx_base64: &str) -> Result<CompletedTx>;

    /// Build, blind and sign a plain transfer.
    async fn build_transfer(&self, request: &TransferRequest) -> Result<BuiltTransfer>;
}

// ── Key store ───────────────────────────────────────────────────────

/// Address material derived at `m/account'/chain/index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedAddress {
    pub address: String,
    pub script_pubkey: Vec<u8>,
    pub blinding_key: Vec<u8>,
}

/// Mnemonic custody and deterministic derivation. `decrypt_mnemonic` with
/// a wrong passphrase must fail with `Error::InvalidPassphrase`, which is
/// how passphrases are validated.
pub trait KeyStore: Send + Sync {
    /// A fresh 24-word mnemonic.
    fn gen_seed(&self) -> Result<Vec<String>>;

    fn encrypt_mnemonic(&self, mnemonic: &str, passphrase: &str) -> Result<Vec<u8>>;

    fn decrypt_mnemonic(&self, ciphertext: &[u8], passphrase: &str) -> Result<String>;

    /// Derive the address, script and blinding key for one child of an
    /// account. `chain` 0 is external, 1 is internal.
    fn derive_child(
        &self,
        mnemonic: &str,
        account: u32,
        chain: u32,
        index: u32,
    ) -> Result<DerivedAddress>;
}
