//! # Local Devnet
//!
//! An in-process stand-in for a local Hardhat node running the FHEVM mock co-processor.
//! It implements both the GlucoseCheck contract surface and the FHE instance interface:
//!
//! - `encrypt` registers plaintexts as ciphertexts and returns handles with a proof bound
//!   to the (contract, user) pair;
//! - `submitGlucose` verifies that proof and grants the contract and sender access;
//! - `checkRisk` derives an encrypted `glucose > 140` flag;
//! - `userDecrypt` checks the signed authorization and the per-handle ACL.
//!
//! Transactions are mined instantly. With a state file, every mutation is written through
//! so separate CLI invocations observe the same chain. No homomorphic encryption is
//! performed: ciphertexts are plaintexts behind opaque handles.

pub mod state;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use sha3::{Digest, Keccak256};
use tracing::{debug, info, warn};

use crate::blockchain::contracts::GlucoseCheckContract;
use crate::blockchain::types::{ContractCall, TxReceipt, TxStatus};
use crate::blockchain::wallet::recover_signer;
use crate::fhe::eip712::UserDecryptTypedData;
use crate::fhe::signature::DecryptionSignature;
use crate::fhe::types::{DecryptionKeypair, EncryptedInput, EncryptedInputs, FhevmInstance, HandleContractPair, PlainValue};
use crate::types::{
    Address, ChainId, CiphertextHandle, ClearValue, GlucoseCheckError, GlucoseCheckResult, TxHash, LOCAL_CHAIN_ID,
};

pub use state::{ContractState, DevnetState, StoredCiphertext};

/// Glucose readings strictly above this are flagged as risky
pub const RISK_THRESHOLD: u64 = 140;

/// Message of the transient relayer fault produced by fault injection
pub const RELAYER_TIMEOUT_MESSAGE: &str = "Relayer didn't response";

/// Revert reason for a proof that does not match (handle, contract, sender)
pub const INVALID_PROOF_REVERT: &str = "execution reverted: InvalidInputProof";

const PROOF_DOMAIN: &[u8] = b"glucose-check input proof";
const INPUT_DOMAIN: &[u8] = b"glucose-check input";
const RISK_DOMAIN: &[u8] = b"glucose-check risk";
const DEPLOY_DOMAIN: &[u8] = b"glucose-check deploy";

/// Counters of calls that reach the node, for asserting network usage
#[derive(Debug, Default)]
pub struct CallCounters {
    pub encrypt: AtomicU64,
    pub submit_glucose: AtomicU64,
    pub check_risk: AtomicU64,
    pub reads: AtomicU64,
    pub user_decrypt: AtomicU64,
}

/// Plain snapshot of [`CallCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub encrypt: u64,
    pub submit_glucose: u64,
    pub check_risk: u64,
    pub reads: u64,
    pub user_decrypt: u64,
}

/// In-process chain + FHE co-processor
pub struct LocalFhevmNode {
    chain_id: ChainId,
    decryption_contract: Address,
    state: Mutex<DevnetState>,
    state_path: Option<PathBuf>,
    pending_faults: AtomicU32,
    fault_message: Mutex<String>,
    counters: CallCounters,
}

impl LocalFhevmNode {
    /// Fresh node that keeps its state in memory only
    pub fn in_memory() -> Self {
        Self::with_state(DevnetState::default(), None)
    }

    /// Open (or create) a node persisted at `path`
    pub fn open(path: impl AsRef<Path>) -> GlucoseCheckResult<Self> {
        let path = path.as_ref().to_path_buf();
        let state = DevnetState::load(&path)?;
        info!(
            "Opened devnet state {} (block {}, {} contracts)",
            path.display(),
            state.block_number,
            state.contracts.len()
        );
        Ok(Self::with_state(state, Some(path)))
    }

    fn with_state(state: DevnetState, state_path: Option<PathBuf>) -> Self {
        let digest = Keccak256::digest(b"glucose-check decryption verifier");
        let mut verifier = [0u8; 20];
        verifier.copy_from_slice(&digest[12..]);
        Self {
            chain_id: LOCAL_CHAIN_ID,
            decryption_contract: Address(verifier),
            state: Mutex::new(state),
            state_path,
            pending_faults: AtomicU32::new(0),
            fault_message: Mutex::new(RELAYER_TIMEOUT_MESSAGE.to_string()),
            counters: CallCounters::default(),
        }
    }

    pub fn state_path(&self) -> Option<&Path> {
        self.state_path.as_deref()
    }

    pub fn block_number(&self) -> u64 {
        self.state.lock().block_number
    }

    pub fn is_deployed(&self, contract: Address) -> bool {
        self.state.lock().contracts.contains_key(&contract)
    }

    /// Make the next `count` transaction sends fail with the relayer timeout message
    pub fn inject_relayer_faults(&self, count: u32) {
        self.inject_send_faults(count, RELAYER_TIMEOUT_MESSAGE);
    }

    /// Make the next `count` transaction sends fail with `message`
    pub fn inject_send_faults(&self, count: u32, message: &str) {
        *self.fault_message.lock() = message.to_string();
        self.pending_faults.store(count, Ordering::SeqCst);
        debug!("Injected {} send faults: {}", count, message);
    }

    pub fn call_counts(&self) -> CallCounts {
        CallCounts {
            encrypt: self.counters.encrypt.load(Ordering::SeqCst),
            submit_glucose: self.counters.submit_glucose.load(Ordering::SeqCst),
            check_risk: self.counters.check_risk.load(Ordering::SeqCst),
            reads: self.counters.reads.load(Ordering::SeqCst),
            user_decrypt: self.counters.user_decrypt.load(Ordering::SeqCst),
        }
    }

    /// Deploy a new GlucoseCheck contract from `deployer`
    pub fn deploy(&self, deployer: Address) -> GlucoseCheckResult<(Address, TxHash)> {
        let (contract, tx_hash) = self.transact(|state| {
            let word = state.derive_word(DEPLOY_DOMAIN, &[deployer.as_bytes()]);
            let mut bytes = [0u8; 20];
            bytes.copy_from_slice(&word[12..]);
            let contract = Address(bytes);

            state.contracts.insert(
                contract,
                ContractState {
                    deployer,
                    ..Default::default()
                },
            );
            let tx_hash = state.mine(
                |tx_hash, block_number| TxReceipt {
                    tx_hash,
                    from: deployer,
                    to: contract,
                    call: ContractCall::Deploy,
                    status: TxStatus::Success,
                    block_number,
                },
                &[deployer.as_bytes(), contract.as_bytes()],
            );
            Ok((contract, tx_hash))
        })?;
        info!("Deployed GlucoseCheck at {} (tx {})", contract, tx_hash);
        Ok((contract, tx_hash))
    }

    /// Input proof binding `handles` to (contract, user)
    pub fn input_proof(contract: Address, user: Address, handles: &[CiphertextHandle]) -> Vec<u8> {
        let mut hasher = Keccak256::new();
        hasher.update(PROOF_DOMAIN);
        hasher.update(contract.as_bytes());
        hasher.update(user.as_bytes());
        for handle in handles {
            hasher.update(handle.as_bytes());
        }
        hasher.finalize().to_vec()
    }

    /// Apply `f` to a copy of the state and keep it only once it is persisted.
    /// A failed write leaves the node exactly as it was.
    fn transact<T>(&self, f: impl FnOnce(&mut DevnetState) -> GlucoseCheckResult<T>) -> GlucoseCheckResult<T> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let out = f(&mut next)?;
        if let Some(path) = &self.state_path {
            next.save(path)?;
        }
        *state = next;
        Ok(out)
    }

    fn take_fault(&self) -> Option<String> {
        let taken = self
            .pending_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if taken {
            let message = self.fault_message.lock().clone();
            warn!("Devnet injecting send fault: {}", message);
            Some(message)
        } else {
            None
        }
    }

    fn contract_state<'a>(state: &'a DevnetState, contract: &Address) -> GlucoseCheckResult<&'a ContractState> {
        state
            .contracts
            .get(contract)
            .ok_or_else(|| GlucoseCheckError::Contract(format!("no contract code at {}", contract)))
    }

    fn verify_authorization(&self, auth: &DecryptionSignature) -> GlucoseCheckResult<()> {
        if auth.chain_id != self.chain_id {
            return Err(GlucoseCheckError::Decryption(format!(
                "authorization is for chainId={}, node runs chainId={}",
                auth.chain_id, self.chain_id
            )));
        }
        if !auth.is_valid() {
            return Err(GlucoseCheckError::Decryption("authorization expired".to_string()));
        }
        let typed = UserDecryptTypedData::new(
            self.chain_id,
            self.decryption_contract,
            &auth.public_key,
            &auth.contract_addresses,
            auth.start_timestamp,
            auth.duration_days,
        );
        let signer = recover_signer(&typed.digest(), &auth.signature)?;
        if signer != auth.user_address {
            return Err(GlucoseCheckError::Decryption(format!(
                "authorization signed by {}, not {}",
                signer, auth.user_address
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl GlucoseCheckContract for LocalFhevmNode {
    async fn submit_glucose(
        &self,
        contract: Address,
        sender: Address,
        handle: CiphertextHandle,
        input_proof: &[u8],
    ) -> GlucoseCheckResult<TxHash> {
        self.counters.submit_glucose.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if let Some(message) = self.take_fault() {
            return Err(GlucoseCheckError::Relayer(message));
        }

        let tx_hash = self.transact(|state| {
            Self::contract_state(state, &contract)?;
            if !state.ciphertexts.contains_key(&handle)
                || input_proof != Self::input_proof(contract, sender, &[handle]).as_slice()
            {
                return Err(GlucoseCheckError::Contract(INVALID_PROOF_REVERT.to_string()));
            }

            state.allow(&handle, &[contract, sender]);
            if let Some(c) = state.contracts.get_mut(&contract) {
                c.glucose.insert(sender, handle);
            }
            Ok(state.mine(
                |tx_hash, block_number| TxReceipt {
                    tx_hash,
                    from: sender,
                    to: contract,
                    call: ContractCall::SubmitGlucose,
                    status: TxStatus::Success,
                    block_number,
                },
                &[sender.as_bytes(), handle.as_bytes()],
            ))
        })?;
        debug!("submitGlucose from {} mined as {}", sender, tx_hash);
        Ok(tx_hash)
    }

    async fn check_risk(&self, contract: Address, sender: Address) -> GlucoseCheckResult<TxHash> {
        self.counters.check_risk.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if let Some(message) = self.take_fault() {
            return Err(GlucoseCheckError::Relayer(message));
        }

        let tx_hash = self.transact(|state| {
            let glucose = Self::contract_state(state, &contract)?
                .glucose
                .get(&sender)
                .copied()
                .filter(|h| !h.is_zero())
                .ok_or_else(|| GlucoseCheckError::Contract("execution reverted: no glucose submitted".to_string()))?;

            let reading = state
                .ciphertexts
                .get(&glucose)
                .and_then(|ct| ct.value.as_u64())
                .ok_or_else(|| GlucoseCheckError::Contract(format!("unknown ciphertext {}", glucose)))?;

            let risky = reading > RISK_THRESHOLD;
            let risk = state.store_ciphertext(
                RISK_DOMAIN,
                &[contract.as_bytes(), sender.as_bytes(), glucose.as_bytes()],
                ClearValue::Bool(risky),
            );
            state.allow(&risk, &[contract, sender]);
            if let Some(c) = state.contracts.get_mut(&contract) {
                c.risk.insert(sender, risk);
            }
            Ok(state.mine(
                |tx_hash, block_number| TxReceipt {
                    tx_hash,
                    from: sender,
                    to: contract,
                    call: ContractCall::CheckRisk,
                    status: TxStatus::Success,
                    block_number,
                },
                &[sender.as_bytes(), risk.as_bytes()],
            ))
        })?;
        debug!("checkRisk from {} mined as {}", sender, tx_hash);
        Ok(tx_hash)
    }

    async fn wait_for_receipt(&self, tx_hash: TxHash) -> GlucoseCheckResult<TxReceipt> {
        tokio::task::yield_now().await;
        self.state
            .lock()
            .receipts
            .get(&tx_hash)
            .cloned()
            .ok_or_else(|| GlucoseCheckError::Network(format!("unknown transaction {}", tx_hash)))
    }

    async fn get_glucose(&self, contract: Address, user: Address) -> GlucoseCheckResult<CiphertextHandle> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        Ok(Self::contract_state(&state, &contract)?
            .glucose
            .get(&user)
            .copied()
            .unwrap_or(CiphertextHandle::ZERO))
    }

    async fn get_risk_result(&self, contract: Address, user: Address) -> GlucoseCheckResult<CiphertextHandle> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        Ok(Self::contract_state(&state, &contract)?
            .risk
            .get(&user)
            .copied()
            .unwrap_or(CiphertextHandle::ZERO))
    }
}

#[async_trait]
impl FhevmInstance for LocalFhevmNode {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn decryption_contract(&self) -> Address {
        self.decryption_contract
    }

    async fn encrypt(&self, input: &EncryptedInput) -> GlucoseCheckResult<EncryptedInputs> {
        self.counters.encrypt.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if input.values().is_empty() {
            return Err(GlucoseCheckError::Encryption("no values added to input".to_string()));
        }

        let contract = input.contract_address();
        let user = input.user_address();
        let handles: Vec<CiphertextHandle> = self.transact(|state| {
            Ok(input
                .values()
                .iter()
                .map(|value| {
                    let PlainValue::U32(v) = *value;
                    state.store_ciphertext(
                        INPUT_DOMAIN,
                        &[contract.as_bytes(), user.as_bytes()],
                        ClearValue::Uint(v as u64),
                    )
                })
                .collect())
        })?;

        Ok(EncryptedInputs {
            input_proof: Self::input_proof(contract, user, &handles),
            handles,
        })
    }

    fn generate_keypair(&self) -> DecryptionKeypair {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let public = Keccak256::digest(secret);
        DecryptionKeypair {
            public_key: format!("0x{}", hex::encode(public)),
            private_key: format!("0x{}", hex::encode(secret)),
        }
    }

    async fn user_decrypt(
        &self,
        requests: &[HandleContractPair],
        authorization: &DecryptionSignature,
    ) -> GlucoseCheckResult<HashMap<CiphertextHandle, ClearValue>> {
        self.counters.user_decrypt.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.verify_authorization(authorization)?;

        let user = authorization.user_address;
        let state = self.state.lock();
        let mut out = HashMap::with_capacity(requests.len());
        for request in requests {
            if !authorization.contract_addresses.contains(&request.contract_address) {
                return Err(GlucoseCheckError::Decryption(format!(
                    "contract {} is not covered by the authorization",
                    request.contract_address
                )));
            }
            let value = state
                .ciphertexts
                .get(&request.handle)
                .map(|ct| ct.value)
                .ok_or_else(|| GlucoseCheckError::Decryption(format!("unknown handle {}", request.handle)))?;
            if !state.is_allowed(&request.handle, &user)
                || !state.is_allowed(&request.handle, &request.contract_address)
            {
                return Err(GlucoseCheckError::Decryption(format!(
                    "{} is not allowed to decrypt {}",
                    user, request.handle
                )));
            }
            out.insert(request.handle, value);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::wallet::LocalWallet;
    use crate::fhe::storage::InMemoryStringStorage;

    async fn submit(node: &LocalFhevmNode, contract: Address, user: Address, value: u64) -> TxHash {
        let mut input = node.create_encrypted_input(contract, user);
        input.add32(value).unwrap();
        let enc = node.encrypt(&input).await.unwrap();
        node.submit_glucose(contract, user, enc.handles[0], &enc.input_proof)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_and_check_risk() {
        let node = LocalFhevmNode::in_memory();
        let wallet = LocalWallet::devnet_account(0);
        let (contract, _) = node.deploy(wallet.address()).unwrap();

        let tx = submit(&node, contract, wallet.address(), 150).await;
        assert!(node.wait_for_receipt(tx).await.unwrap().is_success());
        assert!(!node.get_glucose(contract, wallet.address()).await.unwrap().is_zero());
        assert!(node.get_risk_result(contract, wallet.address()).await.unwrap().is_zero());

        node.check_risk(contract, wallet.address()).await.unwrap();
        let risk = node.get_risk_result(contract, wallet.address()).await.unwrap();
        assert_eq!(node.state.lock().ciphertexts[&risk].value, ClearValue::Bool(true));
    }

    #[tokio::test]
    async fn test_proof_is_bound_to_sender() {
        let node = LocalFhevmNode::in_memory();
        let alice = LocalWallet::devnet_account(0).address();
        let bob = LocalWallet::devnet_account(1).address();
        let (contract, _) = node.deploy(alice).unwrap();

        let mut input = node.create_encrypted_input(contract, alice);
        input.add32(100).unwrap();
        let enc = node.encrypt(&input).await.unwrap();
        let err = node
            .submit_glucose(contract, bob, enc.handles[0], &enc.input_proof)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("InvalidInputProof"));
        assert!(!err.to_string().contains("Transaction rejected"));
    }

    #[tokio::test]
    async fn test_check_risk_without_glucose_reverts() {
        let node = LocalFhevmNode::in_memory();
        let alice = LocalWallet::devnet_account(0).address();
        let (contract, _) = node.deploy(alice).unwrap();
        assert!(node.check_risk(contract, alice).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let node = LocalFhevmNode::in_memory();
        let alice = LocalWallet::devnet_account(0).address();
        let (contract, _) = node.deploy(alice).unwrap();
        node.inject_relayer_faults(1);

        let mut input = node.create_encrypted_input(contract, alice);
        input.add32(100).unwrap();
        let enc = node.encrypt(&input).await.unwrap();
        let err = node
            .submit_glucose(contract, alice, enc.handles[0], &enc.input_proof)
            .await
            .unwrap_err();
        assert!(err.to_string().contains(RELAYER_TIMEOUT_MESSAGE));
        assert!(node
            .submit_glucose(contract, alice, enc.handles[0], &enc.input_proof)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_user_decrypt_checks_authorization_and_acl() {
        let node = LocalFhevmNode::in_memory();
        let alice = LocalWallet::devnet_account(0);
        let mallory = LocalWallet::devnet_account(1);
        let (contract, _) = node.deploy(alice.address()).unwrap();
        submit(&node, contract, alice.address(), 120).await;
        node.check_risk(contract, alice.address()).await.unwrap();
        let risk = node.get_risk_result(contract, alice.address()).await.unwrap();
        let request = [HandleContractPair { handle: risk, contract_address: contract }];

        let storage = InMemoryStringStorage::new();
        let auth = DecryptionSignature::load_or_sign(&node, &[contract], &alice, &storage, 365)
            .await
            .unwrap();
        let clear = node.user_decrypt(&request, &auth).await.unwrap();
        assert_eq!(clear[&risk], ClearValue::Bool(false));

        // Another account holds a valid authorization but is not on the handle's ACL
        let other = DecryptionSignature::load_or_sign(&node, &[contract], &mallory, &storage, 365)
            .await
            .unwrap();
        assert!(node.user_decrypt(&request, &other).await.is_err());

        // Authorization claiming someone else's address fails signature recovery
        let mut forged = other.clone();
        forged.user_address = alice.address();
        assert!(node.user_decrypt(&request, &forged).await.is_err());
    }

    #[tokio::test]
    async fn test_state_file_is_shared_between_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devnet.json");
        let alice = LocalWallet::devnet_account(0).address();

        let contract = {
            let node = LocalFhevmNode::open(&path).unwrap();
            let (contract, _) = node.deploy(alice).unwrap();
            submit(&node, contract, alice, 99).await;
            contract
        };

        let reopened = LocalFhevmNode::open(&path).unwrap();
        assert!(reopened.is_deployed(contract));
        assert!(!reopened.get_glucose(contract, alice).await.unwrap().is_zero());
        assert_eq!(reopened.block_number(), 2);
    }

    #[tokio::test]
    async fn test_failed_state_write_rolls_back_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devnet.json");
        let alice = LocalWallet::devnet_account(0).address();
        let node = LocalFhevmNode::open(&path).unwrap();
        let (contract, _) = node.deploy(alice).unwrap();

        let mut input = node.create_encrypted_input(contract, alice);
        input.add32(150).unwrap();
        let enc = node.encrypt(&input).await.unwrap();
        let before = node.state.lock().clone();

        // A directory in place of the state file makes every write fail
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let err = node
            .submit_glucose(contract, alice, enc.handles[0], &enc.input_proof)
            .await
            .unwrap_err();
        assert!(matches!(err, GlucoseCheckError::Storage(_)));
        assert!(node.get_glucose(contract, alice).await.unwrap().is_zero());
        assert_eq!(node.block_number(), 1);
        assert_eq!(*node.state.lock(), before);

        assert!(node.encrypt(&input).await.is_err());
        assert!(node.deploy(alice).is_err());
        assert_eq!(*node.state.lock(), before);
    }
}
