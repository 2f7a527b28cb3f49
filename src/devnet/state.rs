//! Devnet chain state: deployed contracts, stored ciphertexts with their ACLs, and mined
//! receipts. Serializable so a node can be reopened from disk by a later process.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::blockchain::types::TxReceipt;
use crate::types::{Address, CiphertextHandle, ClearValue, GlucoseCheckError, GlucoseCheckResult, TxHash};

/// Storage of one deployed GlucoseCheck contract
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractState {
    pub deployer: Address,
    pub glucose: BTreeMap<Address, CiphertextHandle>,
    pub risk: BTreeMap<Address, CiphertextHandle>,
}

/// A ciphertext known to the co-processor and the accounts allowed to use it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCiphertext {
    pub value: ClearValue,
    pub acl: BTreeSet<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevnetState {
    pub block_number: u64,
    pub nonce: u64,
    pub contracts: BTreeMap<Address, ContractState>,
    pub ciphertexts: BTreeMap<CiphertextHandle, StoredCiphertext>,
    pub receipts: BTreeMap<TxHash, TxReceipt>,
}

impl DevnetState {
    pub fn load(path: &Path) -> GlucoseCheckResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| GlucoseCheckError::Storage(format!("read {}: {}", path.display(), e)))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> GlucoseCheckResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| GlucoseCheckError::Storage(format!("create {}: {}", parent.display(), e)))?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .map_err(|e| GlucoseCheckError::Storage(format!("write {}: {}", path.display(), e)))
    }

    /// Next value of the node-wide counter used to make hashes unique
    pub fn next_nonce(&mut self) -> u64 {
        self.nonce += 1;
        self.nonce
    }

    /// Derive a fresh 32-byte identifier under `domain`
    pub fn derive_word(&mut self, domain: &[u8], parts: &[&[u8]]) -> [u8; 32] {
        let nonce = self.next_nonce();
        let mut hasher = Keccak256::new();
        hasher.update(domain);
        for part in parts {
            hasher.update(part);
        }
        hasher.update(nonce.to_be_bytes());
        hasher.finalize().into()
    }

    /// Store a new ciphertext and return its handle
    pub fn store_ciphertext(&mut self, domain: &[u8], parts: &[&[u8]], value: ClearValue) -> CiphertextHandle {
        let handle = CiphertextHandle(self.derive_word(domain, parts));
        self.ciphertexts.insert(
            handle,
            StoredCiphertext {
                value,
                acl: BTreeSet::new(),
            },
        );
        handle
    }

    pub fn allow(&mut self, handle: &CiphertextHandle, accounts: &[Address]) {
        if let Some(ct) = self.ciphertexts.get_mut(handle) {
            ct.acl.extend(accounts.iter().copied());
        }
    }

    pub fn is_allowed(&self, handle: &CiphertextHandle, account: &Address) -> bool {
        self.ciphertexts
            .get(handle)
            .map(|ct| ct.acl.contains(account))
            .unwrap_or(false)
    }

    /// Mine a block holding one transaction
    pub fn mine(&mut self, receipt_for: impl FnOnce(TxHash, u64) -> TxReceipt, seed: &[&[u8]]) -> TxHash {
        let tx_hash = TxHash(self.derive_word(b"glucose-check tx", seed));
        self.block_number += 1;
        let receipt = receipt_for(tx_hash, self.block_number);
        self.receipts.insert(tx_hash, receipt);
        tx_hash
    }
}
