// Workflow Coordinator Integration Tests
// Submit / check / decrypt against the local devnet, with busy and precondition handling

mod common;

use std::sync::Arc;

use common::{wait_until, Harness, RefusingSigner};
use glucose_check::coordinator::{PipelineState, Stage};
use glucose_check::{Deployments, LocalFhevmNode, PipelineOutcome, SkipReason, WorkflowCoordinator, LOCAL_CHAIN_ID};

// =============================================================================
// End-to-end
// =============================================================================

#[tokio::test]
async fn test_high_reading_is_risky() {
    let h = Harness::new();
    assert!(h.run_full_flow(150).await);
    assert_eq!(h.coordinator.message(), "Risk result: High glucose (>140)");
}

#[tokio::test]
async fn test_normal_reading_is_not_risky() {
    let h = Harness::new();
    assert!(!h.run_full_flow(120).await);
    assert_eq!(h.coordinator.message(), "Risk result: Normal glucose (<=140)");
}

#[tokio::test]
async fn test_threshold_is_strict() {
    let h = Harness::new();
    assert!(!h.run_full_flow(140).await);
    assert!(h.run_full_flow(141).await);
}

#[tokio::test]
async fn test_resubmission_invalidates_cached_cleartext() {
    let h = Harness::new();
    assert!(h.run_full_flow(180).await);

    assert!(h.coordinator.submit_glucose(90).await.is_completed());
    assert!(h.coordinator.check_risk().await.is_completed());
    // New risk handle: the old cleartext no longer applies
    assert_eq!(h.coordinator.clear_risk_result(), None);
    assert!(h.coordinator.snapshot().can_decrypt);

    assert!(h.coordinator.decrypt_risk_result().await.is_completed());
    assert_eq!(h.coordinator.clear_risk_result(), Some(false));
    // One authorization covers both decrypts
    assert_eq!(h.storage.len(), 1);
}

#[tokio::test]
async fn test_submit_reports_tx_and_refreshes_handle() {
    let h = Harness::new();
    let outcome = h.coordinator.submit_glucose(150).await;
    let tx_hash = outcome.tx_hash().expect("completed submit carries a tx hash");

    assert!(h.coordinator.message().starts_with("Glucose value submitted! status=1"));
    let handle = h.coordinator.glucose_handle().unwrap();
    assert!(!handle.is_zero());
    assert_eq!(h.coordinator.snapshot().submit_state, PipelineState::Idle);

    use glucose_check::GlucoseCheckContract;
    assert!(h.node.wait_for_receipt(tx_hash).await.unwrap().is_success());
}

// =============================================================================
// Decryption short-cuts
// =============================================================================

#[tokio::test]
async fn test_decrypt_is_idempotent_per_handle() {
    let h = Harness::new();
    h.run_full_flow(150).await;
    assert_eq!(h.node.call_counts().user_decrypt, 1);

    let again = h.coordinator.decrypt_risk_result().await;
    assert_eq!(again, PipelineOutcome::Skipped(SkipReason::AlreadyDecrypted));
    assert_eq!(h.node.call_counts().user_decrypt, 1);
    assert!(h.coordinator.snapshot().is_decrypted);
}

#[tokio::test]
async fn test_zero_risk_handle_decrypts_to_false_without_network() {
    let h = Harness::new();
    assert!(h.coordinator.submit_glucose(150).await.is_completed());
    h.coordinator.refresh_handles().await.unwrap();
    assert!(h.coordinator.risk_result_handle().unwrap().is_zero());

    let outcome = h.coordinator.decrypt_risk_result().await;
    assert!(outcome.is_completed());
    assert_eq!(h.coordinator.clear_risk_result(), Some(false));
    assert_eq!(h.node.call_counts().user_decrypt, 0);
    assert!(h.storage.is_empty());
}

#[tokio::test]
async fn test_refused_signature_fails_decrypt() {
    let h = Harness::new();
    h.coordinator.submit_glucose(150).await;
    h.coordinator.check_risk().await;

    h.coordinator.set_signer(Some(Arc::new(RefusingSigner { address: h.alice.address() })));
    let outcome = h.coordinator.decrypt_risk_result().await;

    assert!(outcome.is_failed());
    assert_eq!(h.coordinator.message(), "Unable to build FHEVM decryption signature");
    assert_eq!(h.node.call_counts().user_decrypt, 0);
    assert!(matches!(h.coordinator.snapshot().decrypt_state, PipelineState::Failed(_)));
}

// =============================================================================
// Busy pipelines
// =============================================================================

#[tokio::test]
async fn test_busy_submit_is_a_noop() {
    let h = Harness::new();
    h.hooked.send_gate.close();

    let coordinator = h.coordinator.clone();
    let first = tokio::spawn(async move { coordinator.submit_glucose(150).await });
    wait_until(|| h.coordinator.snapshot().submit_state == PipelineState::Running(Stage::Submitting)).await;

    assert_eq!(h.coordinator.submit_glucose(99).await, PipelineOutcome::Skipped(SkipReason::Busy));
    assert!(!h.coordinator.snapshot().can_submit);

    h.hooked.send_gate.open();
    assert!(first.await.unwrap().is_completed());
    let counts = h.node.call_counts();
    assert_eq!(counts.encrypt, 1);
    assert_eq!(counts.submit_glucose, 1);
}

#[tokio::test]
async fn test_submit_blocked_while_risk_check_runs() {
    let h = Harness::new();
    h.coordinator.submit_glucose(150).await;
    h.hooked.send_gate.close();

    let coordinator = h.coordinator.clone();
    let check = tokio::spawn(async move { coordinator.check_risk().await });
    wait_until(|| h.coordinator.snapshot().risk_check_state.is_running()).await;

    assert_eq!(h.coordinator.submit_glucose(120).await, PipelineOutcome::Skipped(SkipReason::Busy));
    assert_eq!(h.coordinator.check_risk().await, PipelineOutcome::Skipped(SkipReason::Busy));

    h.hooked.send_gate.open();
    assert!(check.await.unwrap().is_completed());
    assert_eq!(h.node.call_counts().check_risk, 1);
}

#[tokio::test]
async fn test_busy_decrypt_is_a_noop() {
    let h = Harness::new();
    h.coordinator.submit_glucose(150).await;
    h.coordinator.check_risk().await;
    h.hooked.decrypt_gate.close();

    let coordinator = h.coordinator.clone();
    let first = tokio::spawn(async move { coordinator.decrypt_risk_result().await });
    wait_until(|| h.coordinator.snapshot().decrypt_state == PipelineState::Running(Stage::Decrypting)).await;

    assert_eq!(
        h.coordinator.decrypt_risk_result().await,
        PipelineOutcome::Skipped(SkipReason::Busy)
    );

    h.hooked.decrypt_gate.open();
    assert!(first.await.unwrap().is_completed());
    assert_eq!(h.node.call_counts().user_decrypt, 1);
}

// =============================================================================
// Preconditions
// =============================================================================

#[tokio::test]
async fn test_unmet_preconditions_are_skipped() {
    let h = Harness::new();

    assert_eq!(h.coordinator.submit_glucose(0).await, PipelineOutcome::Skipped(SkipReason::InvalidValue));
    assert_eq!(h.coordinator.check_risk().await, PipelineOutcome::Skipped(SkipReason::NotReady));

    h.coordinator.set_signer(None);
    assert_eq!(h.coordinator.submit_glucose(150).await, PipelineOutcome::Skipped(SkipReason::NotReady));
    assert_eq!(h.coordinator.decrypt_risk_result().await, PipelineOutcome::Skipped(SkipReason::NotReady));

    h.coordinator.set_signer(Some(h.alice.clone()));
    h.coordinator.set_instance(None);
    assert_eq!(h.coordinator.submit_glucose(150).await, PipelineOutcome::Skipped(SkipReason::NotReady));

    assert_eq!(h.node.call_counts().encrypt, 0);
}

#[tokio::test]
async fn test_out_of_range_value_fails_without_sending() {
    let h = Harness::new();
    let outcome = h.coordinator.submit_glucose(u32::MAX as u64 + 1).await;
    assert!(outcome.is_failed());
    assert!(h.coordinator.message().starts_with("Submit failed:"));
    assert_eq!(h.node.call_counts().submit_glucose, 0);
}

#[tokio::test]
async fn test_missing_deployment_is_reported() {
    let node = Arc::new(LocalFhevmNode::in_memory());
    let coordinator = WorkflowCoordinator::new(
        Default::default(),
        Deployments::new(),
        Arc::new(glucose_check::fhe::InMemoryStringStorage::new()),
    );
    coordinator.set_signer(Some(Arc::new(glucose_check::LocalWallet::devnet_account(0))));
    coordinator.set_instance(Some(node.clone()));
    coordinator.connect_chain(LOCAL_CHAIN_ID, node.clone());

    let snapshot = coordinator.snapshot();
    assert_eq!(snapshot.is_deployed, Some(false));
    assert!(!snapshot.can_submit);
    assert_eq!(snapshot.message, "GlucoseCheck deployment not found for chainId=31337.");
    assert_eq!(
        coordinator.submit_glucose(150).await,
        PipelineOutcome::Skipped(SkipReason::NotReady)
    );
}

#[tokio::test]
async fn test_snapshot_flags_follow_the_workflow() {
    let h = Harness::new();
    let s = h.coordinator.snapshot();
    assert_eq!(s.is_deployed, Some(true));
    assert!(s.can_submit);
    assert!(!s.can_check_risk);
    assert!(!s.can_decrypt);

    h.coordinator.submit_glucose(150).await;
    let s = h.coordinator.snapshot();
    assert!(s.can_check_risk);
    assert!(!s.can_decrypt);

    h.coordinator.check_risk().await;
    assert!(h.coordinator.snapshot().can_decrypt);

    h.coordinator.decrypt_risk_result().await;
    let s = h.coordinator.snapshot();
    assert!(s.is_decrypted);
    assert!(!s.can_decrypt);
    assert_eq!(s.clear_risk_result, Some(true));
}
