//! Software key store.
//!
//! Encrypts the wallet mnemonic with a passphrase-derived key (argon2 →
//! AES-256-GCM) and derives address material deterministically from the
//! decrypted seed. Production deployments can swap in a hardware-backed
//! implementation of the same [`KeyStore`] trait.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::ports::{DerivedAddress, KeyStore};

const SEED_WORD_COUNT: usize = 24;

/// Compact word list for seed generation; real BIP-39 word lists are a
/// drop-in through an external KeyStore.
const WORDS: [&str; 64] = [
    "abandon", "ability", "able", "about", "above", "absent", "absorb", "abstract", "absurd",
    "abuse", "access", "accident", "account", "accuse", "achieve", "acid", "acoustic", "acquire",
    "across", "act", "action", "actor", "actress", "actual", "adapt", "add", "addict", "address",
    "adjust", "admit", "adult", "advance", "advice", "aerobic", "affair", "afford", "afraid",
    "again", "age", "agent", "agree", "ahead", "aim", "air", "airport", "aisle", "alarm", "album",
    "alcohol", "alert", "alien", "all", "alley", "allow", "almost", "alone", "alpha", "already",
    "also", "alter", "always", "amateur", "amazing", "among",
];

#[derive(Serialize, Deserialize)]
struct EncryptedEnvelope {
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// Deterministic in-process key store.
#[derive(Debug, Clone, Default)]
pub struct SoftwareKeyStore;

impl SoftwareKeyStore {
    pub fn new() -> Self {
        Self
    }

    fn derive_cipher_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32]> {
        let mut key = [0u8; 32];
        argon2::Argon2::default()
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| Error::KeyStore(e.to_string()))?;
        Ok(key)
    }
}

impl KeyStore for SoftwareKeyStore {
    fn gen_seed(&self) -> Result<Vec<String>> {
        let mut rng = rand::thread_rng();
        Ok((0..SEED_WORD_COUNT)
            .map(|_| {
                WORDS
                    .choose(&mut rng)
                    .expect("non-empty word list")
                    .to_string()
            })
            .collect())
    }

    fn encrypt_mnemonic(&self, mnemonic: &str, passphrase: &str) -> Result<Vec<u8>> {
        let salt: [u8; 16] = rand::random();
        let key = Self::derive_cipher_key(passphrase, &salt)?;

        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|e| Error::KeyStore(e.to_string()))?;
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, mnemonic.as_bytes())
            .map_err(|e| Error::KeyStore(e.to_string()))?;

        let envelope = EncryptedEnvelope {
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        };
        serde_json::to_vec(&envelope).map_err(|e| Error::KeyStore(e.to_string()))
    }

    fn decrypt_mnemonic(&self, ciphertext: &[u8], passphrase: &str) -> Result<String> {
        let envelope: EncryptedEnvelope =
            serde_json::from_slice(ciphertext).map_err(|e| Error::KeyStore(e.to_string()))?;

        let salt = BASE64
            .decode(&envelope.salt)
            .map_err(|e| Error::KeyStore(e.to_string()))?;
        let key = Self::derive_cipher_key(passphrase, &salt)?;

        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|e| Error::KeyStore(e.to_string()))?;
        let nonce_bytes = BASE64
            .decode(&envelope.nonce)
            .map_err(|e| Error::KeyStore(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let payload = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|e| Error::KeyStore(e.to_string()))?;

        let plaintext = cipher
            .decrypt(nonce, payload.as_ref())
            .map_err(|_| Error::InvalidPassphrase)?;
        String::from_utf8(plaintext).map_err(|e| Error::KeyStore(e.to_string()))
    }

    fn derive_child(
        &self,
        mnemonic: &str,
        account: u32,
        chain: u32,
        index: u32,
    ) -> Result<DerivedAddress> {
        let seed = Sha256::digest(mnemonic.as_bytes());

        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(b"child");
        hasher.update(account.to_le_bytes());
        hasher.update(chain.to_le_bytes());
        hasher.update(index.to_le_bytes());
        let child_secret = hasher.finalize();

        let program = Sha256::digest(child_secret);
        let mut script_pubkey = Vec::with_capacity(22);
        script_pubkey.push(0x00);
        script_pubkey.push(0x14);
        script_pubkey.extend_from_slice(&program[..20]);

        let mut blind_hasher = Sha256::new();
        blind_hasher.update(child_secret);
        blind_hasher.update(b"blind");
        let blinding_key = blind_hasher.finalize().to_vec();

        Ok(DerivedAddress {
            address: format!("tp1q{}", hex::encode(&program[..20])),
            script_pubkey,
            blinding_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let ks = SoftwareKeyStore::new();
        let cipher = ks.encrypt_mnemonic("abandon ability able", "hunter2").unwrap();
        let plain = ks.decrypt_mnemonic(&cipher, "hunter2").unwrap();
        assert_eq!(plain, "abandon ability able");
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let ks = SoftwareKeyStore::new();
        let cipher = ks.encrypt_mnemonic("abandon ability able", "hunter2").unwrap();
        assert!(matches!(
            ks.decrypt_mnemonic(&cipher, "hunter3"),
            Err(Error::InvalidPassphrase)
        ));
    }

    #[test]
    fn derivation_is_deterministic() {
        let ks = SoftwareKeyStore::new();
        let a = ks.derive_child("abandon ability able", 5, 0, 3).unwrap();
        let b = ks.derive_child("abandon ability able", 5, 0, 3).unwrap();
        assert_eq!(a, b);

        let c = ks.derive_child("abandon ability able", 5, 1, 3).unwrap();
        assert_ne!(a.address, c.address);
        assert_eq!(a.script_pubkey.len(), 22);
        assert_eq!(a.blinding_key.len(), 32);
    }

    #[test]
    fn gen_seed_produces_24_words() {
        let ks = SoftwareKeyStore::new();
        let words = ks.gen_seed().unwrap();
        assert_eq!(words.len(), 24);
        assert!(words.iter().all(|w| WORDS.contains(&w.as_str())));
    }
}
