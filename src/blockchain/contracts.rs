//! # GlucoseCheck Contract Interface
//!
//! The client only sees the contract through this trait. The local devnet implements it
//! in-process; a JSON-RPC transport would implement the same surface.

use async_trait::async_trait;

use crate::blockchain::types::TxReceipt;
use crate::types::{Address, CiphertextHandle, GlucoseCheckResult, TxHash};

/// Contract surface consumed by the workflow coordinator
#[async_trait]
pub trait GlucoseCheckContract: Send + Sync {
    /// Send `submitGlucose(handle, proof)` from `sender`; returns once the transaction is accepted
    async fn submit_glucose(
        &self,
        contract: Address,
        sender: Address,
        handle: CiphertextHandle,
        input_proof: &[u8],
    ) -> GlucoseCheckResult<TxHash>;

    /// Send `checkRisk()` from `sender`
    async fn check_risk(&self, contract: Address, sender: Address) -> GlucoseCheckResult<TxHash>;

    /// Wait until the transaction is final and return its receipt
    async fn wait_for_receipt(&self, tx_hash: TxHash) -> GlucoseCheckResult<TxReceipt>;

    /// Read the stored glucose handle of `user` (zero when unset)
    async fn get_glucose(&self, contract: Address, user: Address) -> GlucoseCheckResult<CiphertextHandle>;

    /// Read the stored risk-result handle of `user` (zero when unset)
    async fn get_risk_result(&self, contract: Address, user: Address) -> GlucoseCheckResult<CiphertextHandle>;
}
