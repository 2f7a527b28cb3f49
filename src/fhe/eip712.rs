// EIP-712 typed data for user-decryption authorizations
//
// digest = keccak256(0x19 0x01 || domainSeparator || hashStruct(request))

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::types::{Address, ChainId};

pub const DOMAIN_NAME: &str = "Decryption";
pub const DOMAIN_VERSION: &str = "1";

const DOMAIN_TYPE: &str =
    "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";
const USER_DECRYPT_TYPE: &str = "UserDecryptRequestVerification(bytes publicKey,address[] contractAddresses,uint256 startTimestamp,uint256 durationDays)";

/// EIP-712 domain of the decryption verifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip712Domain {
    pub name: String,
    pub version: String,
    pub chain_id: ChainId,
    pub verifying_contract: Address,
}

impl Eip712Domain {
    pub fn separator(&self) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        hasher.update(Keccak256::digest(DOMAIN_TYPE.as_bytes()));
        hasher.update(Keccak256::digest(self.name.as_bytes()));
        hasher.update(Keccak256::digest(self.version.as_bytes()));
        hasher.update(u256_word(self.chain_id as u128));
        hasher.update(address_word(&self.verifying_contract));
        hasher.finalize().into()
    }
}

/// Message a wallet signs to let the co-processor decrypt for its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDecryptTypedData {
    pub domain: Eip712Domain,
    pub public_key: String,
    pub contract_addresses: Vec<Address>,
    pub start_timestamp: i64,
    pub duration_days: u32,
}

impl UserDecryptTypedData {
    pub fn new(
        chain_id: ChainId,
        verifying_contract: Address,
        public_key: &str,
        contract_addresses: &[Address],
        start_timestamp: i64,
        duration_days: u32,
    ) -> Self {
        Self {
            domain: Eip712Domain {
                name: DOMAIN_NAME.to_string(),
                version: DOMAIN_VERSION.to_string(),
                chain_id,
                verifying_contract,
            },
            public_key: public_key.to_string(),
            contract_addresses: contract_addresses.to_vec(),
            start_timestamp,
            duration_days,
        }
    }

    fn struct_hash(&self) -> [u8; 32] {
        let key_bytes = hex::decode(self.public_key.trim_start_matches("0x"))
            .unwrap_or_else(|_| self.public_key.as_bytes().to_vec());

        let mut addresses = Keccak256::new();
        for address in &self.contract_addresses {
            addresses.update(address_word(address));
        }

        let mut hasher = Keccak256::new();
        hasher.update(Keccak256::digest(USER_DECRYPT_TYPE.as_bytes()));
        hasher.update(Keccak256::digest(&key_bytes));
        hasher.update(addresses.finalize());
        hasher.update(u256_word(self.start_timestamp.max(0) as u128));
        hasher.update(u256_word(self.duration_days as u128));
        hasher.finalize().into()
    }

    /// The 32-byte digest that gets signed
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        hasher.update([0x19, 0x01]);
        hasher.update(self.domain.separator());
        hasher.update(self.struct_hash());
        hasher.finalize().into()
    }
}

fn u256_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

fn address_word(address: &Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    word
}
