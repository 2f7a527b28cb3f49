// Decryption authorization - a user-signed, time-bounded capability
//
// One authorization covers a (user, chain, contract set). It is created once, cached in
// a string store and reused until `startTimestamp + durationDays` has passed. Creating
// one requires a wallet signature, which may block on user approval.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use tracing::{debug, info, warn};

use super::storage::GenericStringStorage;
use super::types::FhevmInstance;
use crate::blockchain::wallet::Signer;
use crate::types::{Address, ChainId, GlucoseCheckError, GlucoseCheckResult};

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;
const STORAGE_PREFIX: &str = "fhevm.decryptionSignature";

/// Signed authorization for user decryption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptionSignature {
    pub public_key: String,
    pub private_key: String,
    pub signature: String,
    pub contract_addresses: Vec<Address>,
    pub user_address: Address,
    pub start_timestamp: i64,
    pub duration_days: u32,
    pub chain_id: ChainId,
}

impl DecryptionSignature {
    /// Unix timestamp at which the authorization stops being accepted
    pub fn expires_at(&self) -> i64 {
        self.start_timestamp + self.duration_days as i64 * SECONDS_PER_DAY
    }

    pub fn is_valid_at(&self, now: i64) -> bool {
        now < self.expires_at()
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now().timestamp())
    }

    /// Canonical contract set: sorted and de-duplicated
    pub fn normalize_contracts(contract_addresses: &[Address]) -> Vec<Address> {
        let mut contracts = contract_addresses.to_vec();
        contracts.sort();
        contracts.dedup();
        contracts
    }

    /// Storage key for a (chain, user, contract set)
    pub fn storage_key(chain_id: ChainId, user_address: Address, contract_addresses: &[Address]) -> String {
        let contracts = Self::normalize_contracts(contract_addresses);
        let mut hasher = Keccak256::new();
        hasher.update(chain_id.to_be_bytes());
        hasher.update(user_address.as_bytes());
        for contract in &contracts {
            hasher.update(contract.as_bytes());
        }
        format!("{}.{}", STORAGE_PREFIX, hex::encode(hasher.finalize()))
    }

    /// Create a fresh authorization: new keypair, typed data, wallet signature
    pub async fn sign_new(
        instance: &dyn FhevmInstance,
        contract_addresses: &[Address],
        signer: &dyn Signer,
        duration_days: u32,
    ) -> GlucoseCheckResult<Self> {
        let user_address = signer
            .address()
            .ok_or_else(|| GlucoseCheckError::Signature("signer has no address".to_string()))?;
        let contracts = Self::normalize_contracts(contract_addresses);
        let keypair = instance.generate_keypair();
        let start_timestamp = Utc::now().timestamp();

        let typed = instance.create_eip712(&keypair.public_key, &contracts, start_timestamp, duration_days);
        let signature = signer.sign_digest(typed.digest()).await?;

        Ok(Self {
            public_key: keypair.public_key,
            private_key: keypair.private_key,
            signature,
            contract_addresses: contracts,
            user_address,
            start_timestamp,
            duration_days,
            chain_id: instance.chain_id(),
        })
    }

    /// Load a cached authorization. Unreadable, mismatched or expired entries are ignored.
    pub fn load(
        storage: &dyn GenericStringStorage,
        chain_id: ChainId,
        user_address: Address,
        contract_addresses: &[Address],
    ) -> Option<Self> {
        let key = Self::storage_key(chain_id, user_address, contract_addresses);
        let raw = match storage.get_item(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read decryption signature {}: {}", key, e);
                return None;
            }
        };

        let sig: Self = match serde_json::from_str(&raw) {
            Ok(sig) => sig,
            Err(e) => {
                warn!("Discarding unreadable decryption signature {}: {}", key, e);
                return None;
            }
        };

        if sig.user_address != user_address
            || sig.chain_id != chain_id
            || sig.contract_addresses != Self::normalize_contracts(contract_addresses)
        {
            debug!("Cached decryption signature {} does not match request", key);
            return None;
        }

        if !sig.is_valid() {
            debug!("Cached decryption signature {} expired at {}", key, sig.expires_at());
            return None;
        }

        Some(sig)
    }

    pub fn save(&self, storage: &dyn GenericStringStorage) -> GlucoseCheckResult<()> {
        let key = Self::storage_key(self.chain_id, self.user_address, &self.contract_addresses);
        storage.set_item(&key, &serde_json::to_string(self)?)
    }

    /// Load the cached authorization for `signer`, or sign and cache a new one.
    ///
    /// Returns `None` when no authorization can be produced (no signer address, wallet
    /// refused, storage failure while saving).
    pub async fn load_or_sign(
        instance: &dyn FhevmInstance,
        contract_addresses: &[Address],
        signer: &dyn Signer,
        storage: &dyn GenericStringStorage,
        duration_days: u32,
    ) -> Option<Self> {
        let user_address = signer.address()?;

        if let Some(sig) = Self::load(storage, instance.chain_id(), user_address, contract_addresses) {
            debug!("Reusing decryption signature for {}", user_address);
            return Some(sig);
        }

        let sig = match Self::sign_new(instance, contract_addresses, signer, duration_days).await {
            Ok(sig) => sig,
            Err(e) => {
                warn!("Failed to sign decryption authorization for {}: {}", user_address, e);
                return None;
            }
        };

        if let Err(e) = sig.save(storage) {
            warn!("Failed to cache decryption signature: {}", e);
            return None;
        }

        info!(
            "Created decryption signature for {} valid for {} days",
            user_address, sig.duration_days
        );
        Some(sig)
    }
}
