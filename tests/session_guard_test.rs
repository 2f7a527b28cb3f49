// Session Guard Integration Tests
// Pipelines started under one chain/signer/contract must not apply results to another

mod common;

use std::time::Duration;

use common::{wait_until, Harness};
use glucose_check::coordinator::{PipelineState, Stage};
use glucose_check::{Address, PipelineOutcome, RefreshOutcome, SEPOLIA_CHAIN_ID};

// =============================================================================
// Submit
// =============================================================================

#[tokio::test]
async fn test_signer_switch_during_encryption_drops_submit() {
    let h = Harness::new();
    let coordinator = h.coordinator.clone();
    let bob = h.bob.clone();
    h.hooked.after_encrypt(move || coordinator.set_signer(Some(bob.clone())));

    let outcome = h.coordinator.submit_glucose(150).await;

    assert_eq!(
        outcome,
        PipelineOutcome::Ignored("Ignore submit: State changed during encryption".into())
    );
    assert_eq!(h.coordinator.message(), "Ignore submit: State changed during encryption");
    assert_eq!(h.node.call_counts().submit_glucose, 0);
    assert_eq!(h.coordinator.glucose_handle(), None);
    assert_eq!(h.coordinator.snapshot().submit_state, PipelineState::Aborted);
}

#[tokio::test]
async fn test_chain_switch_after_receipt_skips_refresh() {
    let h = Harness::new();
    let coordinator = h.coordinator.clone();
    let hooked = h.hooked.clone();
    h.hooked
        .after_receipt(move || coordinator.connect_chain(SEPOLIA_CHAIN_ID, hooked.clone()));

    let outcome = h.coordinator.submit_glucose(150).await;

    assert_eq!(outcome, PipelineOutcome::Ignored("Ignore submit".into()));
    // The transaction itself went through
    assert_eq!(h.node.call_counts().submit_glucose, 1);
    assert_eq!(h.node.call_counts().reads, 0);
    assert_eq!(h.coordinator.glucose_handle(), None);

    let snapshot = h.coordinator.snapshot();
    assert_eq!(snapshot.chain_id, Some(SEPOLIA_CHAIN_ID));
    assert_eq!(snapshot.is_deployed, Some(false));
    assert!(!snapshot.can_submit);
}

#[tokio::test(start_paused = true)]
async fn test_signer_switch_during_backoff_abandons_retries() {
    let h = Harness::new();
    h.node.inject_relayer_faults(1);

    let coordinator = h.coordinator.clone();
    let run = tokio::spawn(async move { coordinator.submit_glucose(150).await });

    // First attempt has failed; the policy is sleeping before the second
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(h.coordinator.message().starts_with("Relayer connection issue, retrying..."));
    h.coordinator.set_signer(Some(h.bob.clone()));

    let outcome = run.await.unwrap();
    assert!(outcome.is_ignored());
    assert_eq!(h.node.call_counts().submit_glucose, 1);
    assert_eq!(h.coordinator.glucose_handle(), None);
}

// =============================================================================
// Risk check
// =============================================================================

#[tokio::test]
async fn test_contract_switch_during_check_discards_handle() {
    let h = Harness::new();
    assert!(h.coordinator.submit_glucose(150).await.is_completed());

    let coordinator = h.coordinator.clone();
    h.hooked
        .after_receipt(move || coordinator.set_contract_override(Some(Address([0x42; 20]))));

    let outcome = h.coordinator.check_risk().await;

    assert_eq!(outcome, PipelineOutcome::Ignored("Ignore check".into()));
    assert_eq!(h.node.call_counts().check_risk, 1);
    assert_eq!(h.coordinator.risk_result_handle(), None);
    assert_eq!(h.coordinator.snapshot().contract_address, Some(Address([0x42; 20])));
}

// =============================================================================
// Decrypt
// =============================================================================

#[tokio::test]
async fn test_signer_switch_during_decrypt_drops_cleartext() {
    let h = Harness::new();
    h.coordinator.submit_glucose(150).await;
    h.coordinator.check_risk().await;
    h.hooked.decrypt_gate.close();

    let coordinator = h.coordinator.clone();
    let run = tokio::spawn(async move { coordinator.decrypt_risk_result().await });
    wait_until(|| h.coordinator.snapshot().decrypt_state == PipelineState::Running(Stage::Decrypting)).await;

    h.coordinator.set_signer(Some(h.bob.clone()));
    h.hooked.decrypt_gate.open();

    let outcome = run.await.unwrap();
    assert_eq!(outcome, PipelineOutcome::Ignored("Ignore FHEVM decryption".into()));
    assert_eq!(h.coordinator.clear_risk_result(), None);
    assert!(!h.coordinator.snapshot().is_decrypted);
}

#[tokio::test]
async fn test_unchanged_session_is_not_stale_after_round_trip() {
    let h = Harness::new();
    let coordinator = h.coordinator.clone();
    let alice = h.alice.clone();
    // Re-selecting the same account does not change the session
    h.hooked
        .after_encrypt(move || coordinator.set_signer(Some(alice.clone())));

    assert!(h.coordinator.submit_glucose(150).await.is_completed());
    assert!(h.coordinator.glucose_handle().is_some());
}

#[tokio::test]
async fn test_each_signer_sees_only_its_own_handles() {
    let h = Harness::new();
    assert!(h.run_full_flow(150).await);

    h.coordinator.set_signer(Some(h.bob.clone()));
    assert_eq!(h.coordinator.refresh_handles().await.unwrap(), RefreshOutcome::Updated);
    assert!(h.coordinator.glucose_handle().unwrap().is_zero());
    assert_eq!(h.coordinator.clear_risk_result(), None);

    assert!(!h.run_full_flow(100).await);
    // A second account signs its own authorization
    assert_eq!(h.storage.len(), 2);

    h.coordinator.set_signer(Some(h.alice.clone()));
    h.coordinator.refresh_handles().await.unwrap();
    assert!(!h.coordinator.glucose_handle().unwrap().is_zero());
}

// =============================================================================
// Refresh
// =============================================================================

#[tokio::test]
async fn test_signer_switch_during_refresh_discards_reads() {
    let h = Harness::new();
    assert!(h.coordinator.submit_glucose(150).await.is_completed());
    let alice_glucose = h.coordinator.glucose_handle();

    let coordinator = h.coordinator.clone();
    let bob = h.bob.clone();
    h.hooked.after_read(move || coordinator.set_signer(Some(bob.clone())));

    assert_eq!(h.coordinator.refresh_handles().await.unwrap(), RefreshOutcome::Discarded);
    assert_eq!(h.coordinator.glucose_handle(), alice_glucose);
    assert_eq!(h.coordinator.risk_result_handle(), None);

    // Reads under the new session are applied
    assert_eq!(h.coordinator.refresh_handles().await.unwrap(), RefreshOutcome::Updated);
    assert!(h.coordinator.glucose_handle().unwrap().is_zero());
}

#[tokio::test]
async fn test_refresh_without_signer_clears_mirrors() {
    let h = Harness::new();
    assert!(h.coordinator.submit_glucose(150).await.is_completed());

    h.coordinator.set_signer(None);
    assert_eq!(h.coordinator.refresh_handles().await.unwrap(), RefreshOutcome::Cleared);
    assert_eq!(h.coordinator.glucose_handle(), None);
}
