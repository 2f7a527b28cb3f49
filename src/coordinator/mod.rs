//! # Workflow Coordinator
//!
//! Client-side orchestration of the GlucoseCheck workflow:
//!
//! ```text
//! submit_glucose:  Encrypting -> Submitting -> Confirming -> Refreshing
//! check_risk:      Submitting -> Confirming -> Refreshing
//! decrypt:         Signing -> Decrypting
//! ```
//!
//! Each pipeline captures the [`SessionContext`] it started under and re-validates it
//! before every side effect and after every suspension. A changed chain, signer or
//! contract abandons the run with [`PipelineOutcome::Ignored`]; nothing it would have
//! written is applied. Unmet preconditions and same-kind re-entry are silent no-ops
//! reported as [`PipelineOutcome::Skipped`]. Errors never escape a pipeline; they become
//! a status message and [`PipelineOutcome::Failed`].

pub mod pipeline;
pub mod poller;
pub mod retry;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::blockchain::contracts::GlucoseCheckContract;
use crate::blockchain::deployments::Deployments;
use crate::blockchain::wallet::Signer;
use crate::fhe::signature::DecryptionSignature;
use crate::fhe::storage::GenericStringStorage;
use crate::fhe::types::{FhevmInstance, HandleContractPair};
use crate::types::{Address, ChainId, CiphertextHandle, GlucoseCheckError, TxHash};

pub use pipeline::{PipelineKind, PipelineOutcome, PipelineSlot, PipelineState, RunGuard, SkipReason, Stage};
pub use poller::AutoRefreshPoller;
pub use retry::{RetryError, RetryPolicy, TRANSIENT_PATTERNS};
pub use session::{SessionContext, SessionTracker};

/// Tunables for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub retry: RetryPolicy,
    /// Also wrap the `checkRisk` send in the retry policy
    pub retry_risk_check: bool,
    /// Validity of newly signed decryption authorizations
    pub decryption_duration_days: u32,
    pub poll_interval: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            retry_risk_check: false,
            decryption_duration_days: 365,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Cleartext of a risk handle, trusted only while the handle is current
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClearRiskResult {
    pub handle: CiphertextHandle,
    pub clear: bool,
}

/// Point-in-time view of the coordinator, with the flags a front end renders from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorSnapshot {
    pub chain_id: Option<ChainId>,
    pub contract_address: Option<Address>,
    pub signer_address: Option<Address>,
    /// `None` until a chain is connected
    pub is_deployed: Option<bool>,
    pub glucose_handle: Option<CiphertextHandle>,
    pub risk_result_handle: Option<CiphertextHandle>,
    pub clear_risk_result: Option<bool>,
    pub is_decrypted: bool,
    pub can_submit: bool,
    pub can_check_risk: bool,
    pub can_decrypt: bool,
    pub submit_state: PipelineState,
    pub risk_check_state: PipelineState,
    pub decrypt_state: PipelineState,
    pub message: String,
}

/// Result of one [`WorkflowCoordinator::refresh_handles`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Both handles were re-read and mirrored
    Updated,
    /// Contract, read provider or signer missing; mirrors cleared without reading
    Cleared,
    /// The session changed while reading; results dropped
    Discarded,
}

#[derive(Debug, Default)]
struct Mirror {
    glucose_handle: Option<CiphertextHandle>,
    risk_result_handle: Option<CiphertextHandle>,
    clear_risk_result: Option<ClearRiskResult>,
}

/// Why a running pipeline stopped early
enum Interrupt {
    Stale(&'static str),
    Failed(String),
    /// Failure whose status message is already final
    Declined(&'static str),
}

impl From<GlucoseCheckError> for Interrupt {
    fn from(e: GlucoseCheckError) -> Self {
        Interrupt::Failed(e.to_string())
    }
}

impl From<RetryError> for Interrupt {
    fn from(e: RetryError) -> Self {
        match e {
            RetryError::Aborted => Interrupt::Stale("Ignore submit: State changed before sending"),
            other => Interrupt::Failed(other.to_string()),
        }
    }
}

struct Inner {
    options: CoordinatorOptions,
    deployments: RwLock<Deployments>,
    contract_override: RwLock<Option<Address>>,
    session: SessionTracker,
    provider: RwLock<Option<Arc<dyn GlucoseCheckContract>>>,
    instance: RwLock<Option<Arc<dyn FhevmInstance>>>,
    signer: RwLock<Option<Arc<dyn Signer>>>,
    storage: Arc<dyn GenericStringStorage>,
    submit: PipelineSlot,
    risk_check: PipelineSlot,
    decrypt: PipelineSlot,
    mirror: RwLock<Mirror>,
    message: RwLock<String>,
}

/// Shared handle to the workflow state. Cloning is cheap.
#[derive(Clone)]
pub struct WorkflowCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WorkflowCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowCoordinator")
            .field("session", &self.inner.session.current())
            .finish()
    }
}

impl WorkflowCoordinator {
    pub fn new(
        options: CoordinatorOptions,
        deployments: Deployments,
        storage: Arc<dyn GenericStringStorage>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                deployments: RwLock::new(deployments),
                contract_override: RwLock::new(None),
                session: SessionTracker::new(),
                provider: RwLock::new(None),
                instance: RwLock::new(None),
                signer: RwLock::new(None),
                storage,
                submit: PipelineSlot::new(PipelineKind::Submit),
                risk_check: PipelineSlot::new(PipelineKind::RiskCheck),
                decrypt: PipelineSlot::new(PipelineKind::Decrypt),
                mirror: RwLock::new(Mirror::default()),
                message: RwLock::new(String::new()),
            }),
        }
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.inner.options
    }

    pub fn session(&self) -> SessionContext {
        self.inner.session.current()
    }

    pub fn message(&self) -> String {
        self.inner.message.read().clone()
    }

    fn set_message(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        *self.inner.message.write() = message;
    }

    // =========================================================================
    // Session wiring
    // =========================================================================

    /// Switch to `chain_id`, reading and sending through `provider`
    pub fn connect_chain(&self, chain_id: ChainId, provider: Arc<dyn GlucoseCheckContract>) {
        *self.inner.provider.write() = Some(provider);
        self.inner.session.set_chain(Some(chain_id));
        self.resolve_contract();
    }

    pub fn disconnect(&self) {
        *self.inner.provider.write() = None;
        *self.inner.instance.write() = None;
        self.inner.session.update(|s| {
            s.chain_id = None;
            s.contract_address = None;
        });
        debug!("Disconnected from chain");
    }

    pub fn set_instance(&self, instance: Option<Arc<dyn FhevmInstance>>) {
        *self.inner.instance.write() = instance;
    }

    pub fn set_signer(&self, signer: Option<Arc<dyn Signer>>) {
        let address = signer.as_ref().and_then(|s| s.address());
        *self.inner.signer.write() = signer;
        self.inner.session.set_signer(address);
    }

    /// Pin the contract address instead of using the deployments book
    pub fn set_contract_override(&self, address: Option<Address>) {
        *self.inner.contract_override.write() = address;
        self.resolve_contract();
    }

    pub fn set_deployments(&self, deployments: Deployments) {
        *self.inner.deployments.write() = deployments;
        self.resolve_contract();
    }

    fn resolve_contract(&self) {
        let Some(chain_id) = self.inner.session.current().chain_id else {
            self.inner.session.set_contract(None);
            return;
        };
        let resolved = self
            .inner
            .contract_override
            .read()
            .filter(|a| !a.is_zero())
            .or_else(|| self.inner.deployments.read().resolve(chain_id).map(|d| d.address));

        if resolved.is_none() {
            self.set_message(format!("{}.", GlucoseCheckError::NotDeployed(chain_id)));
        }
        self.inner.session.set_contract(resolved);
    }

    fn provider(&self) -> Option<Arc<dyn GlucoseCheckContract>> {
        self.inner.provider.read().clone()
    }

    fn instance(&self) -> Option<Arc<dyn FhevmInstance>> {
        self.inner.instance.read().clone()
    }

    fn signer(&self) -> Option<Arc<dyn Signer>> {
        self.inner.signer.read().clone()
    }

    fn is_stale(&self, captured: &SessionContext) -> bool {
        self.inner.session.is_stale(captured)
    }

    // =========================================================================
    // Derived state
    // =========================================================================

    pub fn glucose_handle(&self) -> Option<CiphertextHandle> {
        self.inner.mirror.read().glucose_handle
    }

    pub fn risk_result_handle(&self) -> Option<CiphertextHandle> {
        self.inner.mirror.read().risk_result_handle
    }

    /// Decrypted risk flag, if the cache matches the current handle
    pub fn clear_risk_result(&self) -> Option<bool> {
        let mirror = self.inner.mirror.read();
        match (mirror.risk_result_handle, mirror.clear_risk_result) {
            (Some(handle), Some(clear)) if clear.handle == handle => Some(clear.clear),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let session = self.inner.session.current();
        let has_instance = self.inner.instance.read().is_some();
        let submit_state = self.inner.submit.state();
        let risk_check_state = self.inner.risk_check.state();
        let decrypt_state = self.inner.decrypt.state();
        let mirror = self.inner.mirror.read();

        let has_contract = session.contract_address.is_some();
        let has_signer = session.signer_address.is_some();
        let cached_handle = mirror.clear_risk_result.map(|c| c.handle);
        let is_decrypted = mirror.risk_result_handle.is_some() && mirror.risk_result_handle == cached_handle;

        CoordinatorSnapshot {
            chain_id: session.chain_id,
            contract_address: session.contract_address,
            signer_address: session.signer_address,
            is_deployed: session.chain_id.map(|_| has_contract),
            glucose_handle: mirror.glucose_handle,
            risk_result_handle: mirror.risk_result_handle,
            clear_risk_result: mirror.clear_risk_result.map(|c| c.clear),
            is_decrypted,
            can_submit: has_contract
                && has_instance
                && has_signer
                && !submit_state.is_running()
                && !risk_check_state.is_running(),
            can_check_risk: has_contract
                && has_signer
                && !risk_check_state.is_running()
                && mirror.glucose_handle.is_some_and(|h| !h.is_zero()),
            can_decrypt: has_contract
                && has_instance
                && has_signer
                && !decrypt_state.is_running()
                && mirror.risk_result_handle.is_some_and(|h| !h.is_zero())
                && mirror.risk_result_handle != cached_handle,
            submit_state,
            risk_check_state,
            decrypt_state,
            message: self.inner.message.read().clone(),
        }
    }

    // =========================================================================
    // Submission pipeline
    // =========================================================================

    /// Encrypt `value`, send `submitGlucose`, wait for it and refresh the glucose handle
    #[instrument(skip(self))]
    pub async fn submit_glucose(&self, value: u64) -> PipelineOutcome {
        if self.inner.submit.is_running() || self.inner.risk_check.is_running() {
            debug!("Submit skipped: pipeline busy");
            return PipelineOutcome::Skipped(SkipReason::Busy);
        }

        let ctx = self.inner.session.current();
        let (Some(contract), Some(_), Some(provider), Some(instance), Some(signer)) = (
            ctx.contract_address,
            ctx.signer_address,
            self.provider(),
            self.instance(),
            self.signer(),
        ) else {
            return PipelineOutcome::Skipped(SkipReason::NotReady);
        };
        if value == 0 {
            return PipelineOutcome::Skipped(SkipReason::InvalidValue);
        }

        let Some(guard) = self
            .inner
            .submit
            .try_begin_unless(Stage::Encrypting, &self.inner.risk_check)
        else {
            return PipelineOutcome::Skipped(SkipReason::Busy);
        };
        self.set_message(format!("Encrypting glucose value {}...", value));

        let result = self
            .run_submit(&ctx, &guard, value, contract, provider, instance, signer)
            .await;

        match result {
            Ok(tx_hash) => {
                guard.complete();
                PipelineOutcome::Completed { tx_hash: Some(tx_hash) }
            }
            Err(Interrupt::Stale(message)) => {
                warn!("Submit abandoned: session changed");
                self.set_message(message);
                guard.abort();
                PipelineOutcome::Ignored(message.to_string())
            }
            Err(Interrupt::Failed(e)) => {
                error!("Submit failed: {}", e);
                self.set_message(format!("Submit failed: {}", e));
                guard.fail(e.clone());
                PipelineOutcome::Failed(e)
            }
            Err(Interrupt::Declined(message)) => {
                self.set_message(message);
                guard.fail(message);
                PipelineOutcome::Failed(message.to_string())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_submit(
        &self,
        ctx: &SessionContext,
        guard: &RunGuard<'_>,
        value: u64,
        contract: Address,
        provider: Arc<dyn GlucoseCheckContract>,
        instance: Arc<dyn FhevmInstance>,
        signer: Arc<dyn Signer>,
    ) -> Result<TxHash, Interrupt> {
        let user = signer
            .address()
            .ok_or(Interrupt::Declined("Submit failed: Signer address not available"))?;

        if self.is_stale(ctx) {
            return Err(Interrupt::Stale("Ignore submit: State changed before encryption"));
        }

        let mut input = instance.create_encrypted_input(contract, user);
        input.add32(value)?;
        let enc = instance.encrypt(&input).await?;

        if self.is_stale(ctx) {
            return Err(Interrupt::Stale("Ignore submit: State changed during encryption"));
        }

        let handle = enc
            .handles
            .first()
            .copied()
            .ok_or_else(|| GlucoseCheckError::Encryption("encryption returned no handles".to_string()))?;

        guard.advance(Stage::Submitting);
        self.set_message("Submitting encrypted glucose value...");

        let provider_ref = &provider;
        let proof = enc.input_proof.as_slice();
        let tx_hash = self
            .inner
            .options
            .retry
            .run(
                |_| async move { provider_ref.submit_glucose(contract, user, handle, proof).await },
                || self.is_stale(ctx),
                |left| self.set_message(format!("Relayer connection issue, retrying... ({} attempts left)", left)),
            )
            .await?;

        guard.advance(Stage::Confirming);
        self.set_message(format!("Wait for tx:{}...", tx_hash));
        let receipt = provider.wait_for_receipt(tx_hash).await?;
        self.set_message(format!("Glucose value submitted! status={}", receipt.status.as_u8()));

        if self.is_stale(ctx) {
            return Err(Interrupt::Stale("Ignore submit"));
        }

        guard.advance(Stage::Refreshing);
        let glucose = provider.get_glucose(contract, user).await?;
        if self.is_stale(ctx) {
            return Err(Interrupt::Stale("Ignore submit"));
        }
        self.inner.mirror.write().glucose_handle = Some(glucose);

        Ok(tx_hash)
    }

    // =========================================================================
    // Risk-check pipeline
    // =========================================================================

    /// Send `checkRisk`, wait for it and refresh the risk-result handle
    #[instrument(skip(self))]
    pub async fn check_risk(&self) -> PipelineOutcome {
        if self.inner.risk_check.is_running() {
            debug!("Risk check skipped: pipeline busy");
            return PipelineOutcome::Skipped(SkipReason::Busy);
        }

        let ctx = self.inner.session.current();
        let (Some(contract), Some(user), Some(provider)) = (ctx.contract_address, ctx.signer_address, self.provider())
        else {
            return PipelineOutcome::Skipped(SkipReason::NotReady);
        };
        if !self.glucose_handle().is_some_and(|h| !h.is_zero()) {
            return PipelineOutcome::Skipped(SkipReason::NotReady);
        }

        let Some(guard) = self.inner.risk_check.try_begin(Stage::Submitting) else {
            return PipelineOutcome::Skipped(SkipReason::Busy);
        };
        self.set_message("Checking risk assessment...");

        match self.run_check_risk(&ctx, &guard, contract, user, provider).await {
            Ok(tx_hash) => {
                guard.complete();
                PipelineOutcome::Completed { tx_hash: Some(tx_hash) }
            }
            Err(Interrupt::Stale(message)) => {
                warn!("Risk check abandoned: session changed");
                self.set_message(message);
                guard.abort();
                PipelineOutcome::Ignored(message.to_string())
            }
            Err(Interrupt::Failed(e)) => {
                error!("Check risk failed: {}", e);
                self.set_message(format!("Check risk failed: {}", e));
                guard.fail(e.clone());
                PipelineOutcome::Failed(e)
            }
            Err(Interrupt::Declined(message)) => {
                self.set_message(message);
                guard.fail(message);
                PipelineOutcome::Failed(message.to_string())
            }
        }
    }

    async fn run_check_risk(
        &self,
        ctx: &SessionContext,
        guard: &RunGuard<'_>,
        contract: Address,
        user: Address,
        provider: Arc<dyn GlucoseCheckContract>,
    ) -> Result<TxHash, Interrupt> {
        if self.is_stale(ctx) {
            return Err(Interrupt::Stale("Ignore check"));
        }

        let tx_hash = if self.inner.options.retry_risk_check {
            let provider_ref = &provider;
            self.inner
                .options
                .retry
                .run(
                    |_| async move { provider_ref.check_risk(contract, user).await },
                    || self.is_stale(ctx),
                    |left| self.set_message(format!("Relayer connection issue, retrying... ({} attempts left)", left)),
                )
                .await
                .map_err(|e| match e {
                    RetryError::Aborted => Interrupt::Stale("Ignore check"),
                    other => Interrupt::Failed(other.to_string()),
                })?
        } else {
            provider.check_risk(contract, user).await?
        };

        guard.advance(Stage::Confirming);
        self.set_message(format!("Wait for tx:{}...", tx_hash));
        let receipt = provider.wait_for_receipt(tx_hash).await?;
        self.set_message(format!("Risk assessment completed! status={}", receipt.status.as_u8()));

        if self.is_stale(ctx) {
            return Err(Interrupt::Stale("Ignore check"));
        }

        guard.advance(Stage::Refreshing);
        let risk = provider.get_risk_result(contract, user).await?;
        if self.is_stale(ctx) {
            return Err(Interrupt::Stale("Ignore check"));
        }
        self.inner.mirror.write().risk_result_handle = Some(risk);

        Ok(tx_hash)
    }

    // =========================================================================
    // Decryption pipeline
    // =========================================================================

    /// Decrypt the current risk-result handle into the cleartext cache
    #[instrument(skip(self))]
    pub async fn decrypt_risk_result(&self) -> PipelineOutcome {
        if self.inner.decrypt.is_running() {
            debug!("Decrypt skipped: pipeline busy");
            return PipelineOutcome::Skipped(SkipReason::Busy);
        }

        let ctx = self.inner.session.current();
        let (Some(contract), Some(_), Some(instance), Some(signer)) =
            (ctx.contract_address, ctx.signer_address, self.instance(), self.signer())
        else {
            return PipelineOutcome::Skipped(SkipReason::NotReady);
        };

        let handle = {
            let mut mirror = self.inner.mirror.write();
            let cached = mirror.clear_risk_result.map(|c| c.handle);
            match mirror.risk_result_handle {
                None => {
                    mirror.clear_risk_result = None;
                    return PipelineOutcome::Skipped(SkipReason::NotReady);
                }
                current if current == cached => return PipelineOutcome::Skipped(SkipReason::AlreadyDecrypted),
                Some(handle) if handle.is_zero() => {
                    mirror.clear_risk_result = Some(ClearRiskResult { handle, clear: false });
                    return PipelineOutcome::completed();
                }
                Some(handle) => handle,
            }
        };

        let Some(guard) = self.inner.decrypt.try_begin(Stage::Signing) else {
            return PipelineOutcome::Skipped(SkipReason::Busy);
        };
        self.set_message("Start decrypting risk result...");

        match self.run_decrypt(&ctx, &guard, contract, handle, instance, signer).await {
            Ok(clear) => {
                self.set_message(format!(
                    "Risk result: {}",
                    if clear { "High glucose (>140)" } else { "Normal glucose (<=140)" }
                ));
                guard.complete();
                PipelineOutcome::completed()
            }
            Err(Interrupt::Stale(message)) => {
                warn!("Decryption abandoned: session changed");
                self.set_message(message);
                guard.abort();
                PipelineOutcome::Ignored(message.to_string())
            }
            Err(Interrupt::Failed(e)) => {
                error!("Decryption failed: {}", e);
                self.set_message(format!("Decryption failed: {}", e));
                guard.fail(e.clone());
                PipelineOutcome::Failed(e)
            }
            Err(Interrupt::Declined(message)) => {
                warn!("{}", message);
                self.set_message(message);
                guard.fail(message);
                PipelineOutcome::Failed(message.to_string())
            }
        }
    }

    async fn run_decrypt(
        &self,
        ctx: &SessionContext,
        guard: &RunGuard<'_>,
        contract: Address,
        handle: CiphertextHandle,
        instance: Arc<dyn FhevmInstance>,
        signer: Arc<dyn Signer>,
    ) -> Result<bool, Interrupt> {
        let authorization = DecryptionSignature::load_or_sign(
            instance.as_ref(),
            &[contract],
            signer.as_ref(),
            self.inner.storage.as_ref(),
            self.inner.options.decryption_duration_days,
        )
        .await;

        let Some(authorization) = authorization else {
            return Err(Interrupt::Declined("Unable to build FHEVM decryption signature"));
        };

        if self.is_stale(ctx) {
            return Err(Interrupt::Stale("Ignore FHEVM decryption"));
        }

        guard.advance(Stage::Decrypting);
        self.set_message("Call FHEVM userDecrypt...");
        let request = [HandleContractPair {
            handle,
            contract_address: contract,
        }];
        let results = instance.user_decrypt(&request, &authorization).await?;
        self.set_message("FHEVM userDecrypt completed!");

        if self.is_stale(ctx) {
            return Err(Interrupt::Stale("Ignore FHEVM decryption"));
        }

        let clear = results
            .get(&handle)
            .and_then(|v| v.as_bool())
            .ok_or_else(|| GlucoseCheckError::Decryption(format!("no boolean cleartext for {}", handle)))?;

        self.inner.mirror.write().clear_risk_result = Some(ClearRiskResult { handle, clear });
        Ok(clear)
    }

    // =========================================================================
    // Auto-refresh
    // =========================================================================

    /// Re-read both handles for the current signer
    pub async fn refresh_handles(&self) -> Result<RefreshOutcome, GlucoseCheckError> {
        let ctx = self.inner.session.current();
        let (Some(contract), Some(user), Some(provider)) = (ctx.contract_address, ctx.signer_address, self.provider())
        else {
            let mut mirror = self.inner.mirror.write();
            mirror.glucose_handle = None;
            mirror.risk_result_handle = None;
            return Ok(RefreshOutcome::Cleared);
        };

        let glucose = provider.get_glucose(contract, user).await?;
        let risk = provider.get_risk_result(contract, user).await?;

        if self.is_stale(&ctx) {
            debug!("Discarding refresh for a previous session");
            return Ok(RefreshOutcome::Discarded);
        }

        let mut mirror = self.inner.mirror.write();
        mirror.glucose_handle = Some(glucose);
        mirror.risk_result_handle = Some(risk);
        Ok(RefreshOutcome::Updated)
    }

    /// Start the background poller at the configured interval
    pub fn start_auto_refresh(&self) -> AutoRefreshPoller {
        AutoRefreshPoller::spawn(self.clone(), self.inner.options.poll_interval)
    }
}
