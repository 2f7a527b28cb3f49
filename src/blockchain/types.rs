//! # Contract Types
//!
//! Rust types mirroring the GlucoseCheck contract ABI and transaction receipts.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::types::{Address, TxHash};

/// Function signatures exposed by the GlucoseCheck contract
pub mod signatures {
    pub const SUBMIT_GLUCOSE: &str = "submitGlucose(bytes32,bytes)";
    pub const CHECK_RISK: &str = "checkRisk()";
    pub const GET_GLUCOSE: &str = "getGlucose(address)";
    pub const GET_RISK_RESULT: &str = "getRiskResult(address)";
}

/// Compute the 4-byte function selector for a Solidity signature
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[..4]);
    out
}

/// State-changing methods of the contract, used to label transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractCall {
    SubmitGlucose,
    CheckRisk,
    Deploy,
}

impl ContractCall {
    pub fn signature(&self) -> &'static str {
        match self {
            ContractCall::SubmitGlucose => signatures::SUBMIT_GLUCOSE,
            ContractCall::CheckRisk => signatures::CHECK_RISK,
            ContractCall::Deploy => "constructor()",
        }
    }
}

/// Execution status recorded in a receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Reverted,
    Success,
}

impl TxStatus {
    /// Numeric status as reported by EVM receipts (1 = success)
    pub fn as_u8(&self) -> u8 {
        match self {
            TxStatus::Reverted => 0,
            TxStatus::Success => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TxStatus::Reverted),
            1 => Some(TxStatus::Success),
            _ => None,
        }
    }
}

/// Receipt of a mined transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub from: Address,
    pub to: Address,
    pub call: ContractCall,
    pub status: TxStatus,
    pub block_number: u64,
}

impl TxReceipt {
    pub fn is_success(&self) -> bool {
        self.status == TxStatus::Success
    }
}
