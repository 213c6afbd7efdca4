//! Test support: scriptable in-memory implementations of the external
//! capabilities. Integration tests wire these into the engine and
//! services; they are not part of the stable API.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::ports::{
    BuiltPset, BuiltTransfer, ChainClient, ChainUtxo, CompletedTx, PsetBuilder, SwapAccept,
    SwapComplete, SwapFail, SwapParser, SwapPsetRequest, SwapRequest, TransferRequest, TxStatus,
};
use crate::types::AssetId;

/// Deterministic fake txid: hex of the payload's SHA-256.
pub fn fake_txid(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

// ── Chain client ────────────────────────────────────────────────────

/// Scriptable chain view: per-address utxo sets, per-address failure
/// injection, and a confirmed-txid set.
#[derive(Default)]
pub struct MockChainClient {
    utxos: Mutex<HashMap<String, Vec<ChainUtxo>>>,
    history: Mutex<HashSet<String>>,
    confirmed: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    broadcasts: Mutex<Vec<String>>,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the unspent set reported for an address.
    pub fn set_utxos(&self, address: &str, utxos: Vec<ChainUtxo>) {
        self.history.lock().unwrap().insert(address.to_string());
        self.utxos
            .lock()
            .unwrap()
            .insert(address.to_string(), utxos);
    }

    /// Mark an address as having on-chain history without any utxos.
    pub fn set_history(&self, address: &str) {
        self.history.lock().unwrap().insert(address.to_string());
    }

    pub fn confirm_tx(&self, txid: &str) {
        self.confirmed.lock().unwrap().insert(txid.to_string());
    }

    /// Make polls for the address error until cleared.
    pub fn fail_address(&self, address: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(address.to_string());
        } else {
            set.remove(address);
        }
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().unwrap().len()
    }

    /// Convenience: one confirmed utxo.
    pub fn utxo(txid: &str, vout: u32, value: u64, asset: AssetId) -> ChainUtxo {
        ChainUtxo {
            txid: txid.to_string(),
            vout,
            value,
            asset,
            script_pubkey: vec![0x00, 0x14],
            confirmed: true,
            nonce: Vec::new(),
            range_proof: Vec::new(),
        }
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn get_utxos(&self, address: &str, _blinding_key: &[u8]) -> Result<Vec<ChainUtxo>> {
        if self.failing.lock().unwrap().contains(address) {
            return Err(Error::Chain(format!("injected failure for {address}")));
        }
        Ok(self
            .utxos
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<String> {
        let txid = fake_txid(tx_hex.as_bytes());
        self.broadcasts.lock().unwrap().push(tx_hex.to_string());
        Ok(txid)
    }

    async fn tx_status(&self, txid: &str) -> Result<TxStatus> {
        let confirmed = self.confirmed.lock().unwrap().contains(txid);
        Ok(TxStatus {
            confirmed,
            block_height: confirmed.then_some(100),
        })
    }

    async fn has_history(&self, address: &str, _blinding_key: &[u8]) -> Result<bool> {
        Ok(self.history.lock().unwrap().contains(address))
    }
}

// ── PSet builder ────────────────────────────────────────────────────

/// PSet builder that fabricates deterministic blobs instead of real
/// confidential transactions.
#[derive(Default)]
pub struct MockPsetBuilder {
    fail_builds: Mutex<bool>,
    fail_finalize: Mutex<bool>,
}

impl MockPsetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_builds(&self, fail: bool) {
        *self.fail_builds.lock().unwrap() = fail;
    }

    pub fn fail_finalize(&self, fail: bool) {
        *self.fail_finalize.lock().unwrap() = fail;
    }
}

#[async_trait]
impl PsetBuilder for MockPsetBuilder {
    async fn build_swap(&self, request: &SwapPsetRequest) -> Result<BuiltPset> {
        if *self.fail_builds.lock().unwrap() {
            return Err(Error::Pset("injected build failure".into()));
        }
        let payload = format!(
            "{}:{}:{}",
            request.pset_base64,
            request.inputs.len(),
            request.outputs.len()
        );
        Ok(BuiltPset {
            pset_base64: BASE64.encode(payload),
            input_blinding_keys: request.inputs.iter().map(|u| u.nonce.clone()).collect(),
            output_blinding_keys: request
                .outputs
                .iter()
                .map(|o| o.blinding_key.clone())
                .collect(),
        })
    }

    async fn finalize_swap(&self, tx_base64: &str) -> Result<CompletedTx> {
        if *self.fail_finalize.lock().unwrap() {
            return Err(Error::Pset("injected signature failure".into()));
        }
        Ok(CompletedTx {
            txid: fake_txid(tx_base64.as_bytes()),
            tx_hex: hex::encode(tx_base64.as_bytes()),
        })
    }

    async fn build_transfer(&self, request: &TransferRequest) -> Result<BuiltTransfer> {
        if *self.fail_builds.lock().unwrap() {
            return Err(Error::Pset("injected build failure".into()));
        }
        let payload = format!(
            "transfer:{}:{}:{}",
            request.inputs.len(),
            request.outputs.len(),
            request.change_outputs.len()
        );
        Ok(BuiltTransfer {
            txid: fake_txid(payload.as_bytes()),
            tx_hex: hex::encode(payload.as_bytes()),
        })
    }
}

// ── Swap parser ─────────────────────────────────────────────────────

/// JSON encoding of the swap protocol messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSwapParser;

impl SwapParser for JsonSwapParser {
    fn parse_request(&self, raw: &[u8]) -> Result<SwapRequest> {
        serde_json::from_slice(raw).map_err(|e| Error::Swap(format!("malformed swap request: {e}")))
    }

    fn parse_complete(&self, raw: &[u8]) -> Result<SwapComplete> {
        serde_json::from_slice(raw)
            .map_err(|e| Error::Swap(format!("malformed swap complete: {e}")))
    }

    fn serialize_accept(&self, accept: &SwapAccept) -> Result<Vec<u8>> {
        serde_json::to_vec(accept).map_err(|e| Error::Swap(e.to_string()))
    }

    fn serialize_fail(&self, fail: &SwapFail) -> Result<Vec<u8>> {
        serde_json::to_vec(fail).map_err(|e| Error::Swap(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_chain_round_trip() {
        let chain = MockChainClient::new();
        let asset = AssetId::new([1; 32]);
        chain.set_utxos("addr", vec![MockChainClient::utxo("tx", 0, 42, asset)]);

        let utxos = chain.get_utxos("addr", &[]).await.unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].value, 42);
        assert!(chain.has_history("addr", &[]).await.unwrap());
        assert!(!chain.has_history("other", &[]).await.unwrap());

        chain.fail_address("addr", true);
        assert!(chain.get_utxos("addr", &[]).await.is_err());
    }

    #[tokio::test]
    async fn tx_status_follows_confirmations() {
        let chain = MockChainClient::new();
        let txid = chain.broadcast("00aabb").await.unwrap();
        assert!(!chain.tx_status(&txid).await.unwrap().confirmed);
        chain.confirm_tx(&txid);
        assert!(chain.tx_status(&txid).await.unwrap().confirmed);
    }

    #[test]
    fn json_parser_round_trip() {
        let parser = JsonSwapParser;
        let request = SwapRequest {
            id: "r".into(),
            amount_p: 1,
            asset_p: AssetId::new([1; 32]),
            amount_r: 2,
            asset_r: AssetId::new([2; 32]),
            pset_base64: "cA==".into(),
            input_blinding_keys: vec![],
            output_blinding_keys: vec![],
        };
        let raw = serde_json::to_vec(&request).unwrap();
        assert_eq!(parser.parse_request(&raw).unwrap(), request);
        assert!(parser.parse_request(b"not json").is_err());
    }
}
