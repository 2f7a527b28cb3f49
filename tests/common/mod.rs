// Shared fixtures for the workflow integration tests
//
// `HookedNode` wraps the devnet so tests can pause sends and decrypts, or run a callback
// (typically a session switch) right after a suspension point.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use glucose_check::blockchain::types::TxReceipt;
use glucose_check::fhe::types::{DecryptionKeypair, EncryptedInput, EncryptedInputs, HandleContractPair};
use glucose_check::fhe::InMemoryStringStorage;
use glucose_check::{
    Address, ChainId, CiphertextHandle, ClearValue, CoordinatorOptions, DecryptionSignature, Deployment, Deployments,
    FhevmInstance, GlucoseCheckContract, GlucoseCheckError, GlucoseCheckResult, LocalFhevmNode, LocalWallet, Signer,
    TxHash, WorkflowCoordinator, LOCAL_CHAIN_ID,
};

pub type Hook = Box<dyn Fn() + Send + Sync>;

// =============================================================================
// Gate
// =============================================================================

/// Open/closed latch that async calls can wait on
#[derive(Default)]
pub struct Gate {
    closed: AtomicBool,
    notify: Notify,
}

impl Gate {
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub async fn pass(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.closed.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

// =============================================================================
// Hooked devnet
// =============================================================================

/// Devnet wrapper with pause points and post-suspension callbacks
pub struct HookedNode {
    pub node: Arc<LocalFhevmNode>,
    pub send_gate: Gate,
    pub decrypt_gate: Gate,
    after_encrypt: Mutex<Option<Hook>>,
    after_receipt: Mutex<Option<Hook>>,
    after_read: Mutex<Option<Hook>>,
}

impl HookedNode {
    pub fn new(node: Arc<LocalFhevmNode>) -> Self {
        Self {
            node,
            send_gate: Gate::default(),
            decrypt_gate: Gate::default(),
            after_encrypt: Mutex::new(None),
            after_receipt: Mutex::new(None),
            after_read: Mutex::new(None),
        }
    }

    pub fn after_encrypt(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.after_encrypt.lock() = Some(Box::new(hook));
    }

    pub fn after_receipt(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.after_receipt.lock() = Some(Box::new(hook));
    }

    pub fn after_read(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.after_read.lock() = Some(Box::new(hook));
    }

    fn fire(slot: &Mutex<Option<Hook>>) {
        if let Some(hook) = slot.lock().take() {
            hook();
        }
    }
}

#[async_trait]
impl GlucoseCheckContract for HookedNode {
    async fn submit_glucose(
        &self,
        contract: Address,
        sender: Address,
        handle: CiphertextHandle,
        input_proof: &[u8],
    ) -> GlucoseCheckResult<TxHash> {
        self.send_gate.pass().await;
        self.node.submit_glucose(contract, sender, handle, input_proof).await
    }

    async fn check_risk(&self, contract: Address, sender: Address) -> GlucoseCheckResult<TxHash> {
        self.send_gate.pass().await;
        self.node.check_risk(contract, sender).await
    }

    async fn wait_for_receipt(&self, tx_hash: TxHash) -> GlucoseCheckResult<TxReceipt> {
        let receipt = self.node.wait_for_receipt(tx_hash).await;
        Self::fire(&self.after_receipt);
        receipt
    }

    async fn get_glucose(&self, contract: Address, user: Address) -> GlucoseCheckResult<CiphertextHandle> {
        let handle = self.node.get_glucose(contract, user).await;
        Self::fire(&self.after_read);
        handle
    }

    async fn get_risk_result(&self, contract: Address, user: Address) -> GlucoseCheckResult<CiphertextHandle> {
        self.node.get_risk_result(contract, user).await
    }
}

#[async_trait]
impl FhevmInstance for HookedNode {
    fn chain_id(&self) -> ChainId {
        FhevmInstance::chain_id(self.node.as_ref())
    }

    fn decryption_contract(&self) -> Address {
        self.node.decryption_contract()
    }

    async fn encrypt(&self, input: &EncryptedInput) -> GlucoseCheckResult<EncryptedInputs> {
        let enc = self.node.encrypt(input).await;
        Self::fire(&self.after_encrypt);
        enc
    }

    fn generate_keypair(&self) -> DecryptionKeypair {
        self.node.generate_keypair()
    }

    async fn user_decrypt(
        &self,
        requests: &[HandleContractPair],
        authorization: &DecryptionSignature,
    ) -> GlucoseCheckResult<HashMap<CiphertextHandle, ClearValue>> {
        self.decrypt_gate.pass().await;
        self.node.user_decrypt(requests, authorization).await
    }
}

// =============================================================================
// Signers
// =============================================================================

/// Wallet that always rejects signature requests
pub struct RefusingSigner {
    pub address: Address,
}

#[async_trait]
impl Signer for RefusingSigner {
    fn address(&self) -> Option<Address> {
        Some(self.address)
    }

    async fn sign_digest(&self, _digest: [u8; 32]) -> GlucoseCheckResult<String> {
        Err(GlucoseCheckError::Signature("user rejected the request".into()))
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub node: Arc<LocalFhevmNode>,
    pub hooked: Arc<HookedNode>,
    pub contract: Address,
    pub alice: Arc<LocalWallet>,
    pub bob: Arc<LocalWallet>,
    pub storage: Arc<InMemoryStringStorage>,
    pub coordinator: WorkflowCoordinator,
}

impl Harness {
    /// Devnet with a deployed contract, connected as devnet account 0
    pub fn new() -> Self {
        Self::with_options(CoordinatorOptions::default())
    }

    pub fn with_options(options: CoordinatorOptions) -> Self {
        let node = Arc::new(LocalFhevmNode::in_memory());
        let alice = Arc::new(LocalWallet::devnet_account(0));
        let bob = Arc::new(LocalWallet::devnet_account(1));
        let (contract, _) = node.deploy(alice.address()).unwrap();

        let deployments: Deployments = vec![Deployment {
            address: contract,
            chain_id: LOCAL_CHAIN_ID,
            chain_name: Some("hardhat".into()),
        }]
        .into_iter()
        .collect();

        let hooked = Arc::new(HookedNode::new(node.clone()));
        let storage = Arc::new(InMemoryStringStorage::new());
        let coordinator = WorkflowCoordinator::new(options, deployments, storage.clone());
        coordinator.set_signer(Some(alice.clone()));
        coordinator.set_instance(Some(hooked.clone()));
        coordinator.connect_chain(LOCAL_CHAIN_ID, hooked.clone());

        Self {
            node,
            hooked,
            contract,
            alice,
            bob,
            storage,
            coordinator,
        }
    }

    /// Submit, check and decrypt; returns the decrypted risk flag
    pub async fn run_full_flow(&self, value: u64) -> bool {
        assert!(self.coordinator.submit_glucose(value).await.is_completed());
        assert!(self.coordinator.check_risk().await.is_completed());
        assert!(self.coordinator.decrypt_risk_result().await.is_completed());
        self.coordinator.clear_risk_result().unwrap()
    }
}

/// Yield until `cond` holds, bounded so a broken test fails instead of hanging
pub async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
