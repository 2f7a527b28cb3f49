// FHE Types - Encrypted inputs and the co-processor instance interface
//
// The client never touches FHE keys or ciphertexts directly. It asks an instance
// (relayer SDK, or the local devnet) to:
// - encrypt plaintext inputs bound to (contract, user), returning handles + a proof
// - produce an ephemeral decryption keypair and the typed data the user signs
// - perform user decryption of handles the user is allowed to read

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::eip712::UserDecryptTypedData;
use super::signature::DecryptionSignature;
use crate::types::{Address, ChainId, CiphertextHandle, ClearValue, GlucoseCheckError, GlucoseCheckResult};

/// Plaintext queued in an encrypted input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlainValue {
    U32(u32),
}

/// Builder for an encrypted input bound to a contract and a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedInput {
    contract_address: Address,
    user_address: Address,
    values: Vec<PlainValue>,
}

impl EncryptedInput {
    pub fn new(contract_address: Address, user_address: Address) -> Self {
        Self {
            contract_address,
            user_address,
            values: Vec::new(),
        }
    }

    /// Queue a 32-bit unsigned value. Values above `u32::MAX` are rejected.
    pub fn add32(&mut self, value: u64) -> GlucoseCheckResult<&mut Self> {
        let value = u32::try_from(value).map_err(|_| {
            GlucoseCheckError::InvalidInput(format!("value {} does not fit in an euint32", value))
        })?;
        self.values.push(PlainValue::U32(value));
        Ok(self)
    }

    pub fn contract_address(&self) -> Address {
        self.contract_address
    }

    pub fn user_address(&self) -> Address {
        self.user_address
    }

    pub fn values(&self) -> &[PlainValue] {
        &self.values
    }
}

/// Result of encrypting an input: one handle per queued value and a proof covering all of them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedInputs {
    pub handles: Vec<CiphertextHandle>,
    #[serde(with = "hex_bytes")]
    pub input_proof: Vec<u8>,
}

/// Ephemeral keypair the co-processor re-encrypts user decryptions to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptionKeypair {
    pub public_key: String,
    pub private_key: String,
}

/// One handle to decrypt and the contract it is stored under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleContractPair {
    pub handle: CiphertextHandle,
    pub contract_address: Address,
}

/// Client-side view of an FHE co-processor network
#[async_trait]
pub trait FhevmInstance: Send + Sync {
    /// Chain the instance was created for
    fn chain_id(&self) -> ChainId;

    /// Verifying contract of the user-decryption EIP-712 domain
    fn decryption_contract(&self) -> Address;

    /// Start building an input for `contract_address` on behalf of `user_address`
    fn create_encrypted_input(&self, contract_address: Address, user_address: Address) -> EncryptedInput {
        EncryptedInput::new(contract_address, user_address)
    }

    /// Encrypt all values queued in `input`
    async fn encrypt(&self, input: &EncryptedInput) -> GlucoseCheckResult<EncryptedInputs>;

    fn generate_keypair(&self) -> DecryptionKeypair;

    /// Typed data the user signs to authorize decryption for `contract_addresses`
    fn create_eip712(
        &self,
        public_key: &str,
        contract_addresses: &[Address],
        start_timestamp: i64,
        duration_days: u32,
    ) -> UserDecryptTypedData {
        UserDecryptTypedData::new(
            self.chain_id(),
            self.decryption_contract(),
            public_key,
            contract_addresses,
            start_timestamp,
            duration_days,
        )
    }

    /// Decrypt `requests` for the holder of `authorization`
    async fn user_decrypt(
        &self,
        requests: &[HandleContractPair],
        authorization: &DecryptionSignature,
    ) -> GlucoseCheckResult<HashMap<CiphertextHandle, ClearValue>>;
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add32_accepts_u32_range() {
        let mut input = EncryptedInput::new(Address([1; 20]), Address([2; 20]));
        input.add32(150).unwrap();
        input.add32(u32::MAX as u64).unwrap();
        assert_eq!(input.values(), &[PlainValue::U32(150), PlainValue::U32(u32::MAX)]);
    }

    #[test]
    fn test_add32_rejects_out_of_range() {
        let mut input = EncryptedInput::new(Address([1; 20]), Address([2; 20]));
        let err = input.add32(u32::MAX as u64 + 1).unwrap_err();
        assert!(matches!(err, GlucoseCheckError::InvalidInput(_)));
        assert!(input.values().is_empty());
    }

    #[test]
    fn test_encrypted_inputs_proof_is_hex() {
        let inputs = EncryptedInputs {
            handles: vec![CiphertextHandle([3; 32])],
            input_proof: vec![0xde, 0xad],
        };
        let json = serde_json::to_value(&inputs).unwrap();
        assert_eq!(json["inputProof"], "0xdead");
    }
}
