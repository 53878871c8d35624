//! End-to-end verification flows against the file store

mod common;

use common::{init_test_logging, ssh_key, temp_store, FP_A, FP_B};
use hostward_core::trust::{
    Fingerprint, IdentityKind, Policy, RejectReason, Rejection, Scope, TrustStore, TrustVerifier,
    VerificationOutcome, Verdict,
};
use hostward_core::TrustConfig;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn file_verifier(policy: Policy) -> (tempfile::TempDir, Arc<hostward_core::trust::FileTrustStore>, TrustVerifier) {
    let (dir, store) = temp_store();
    let store = Arc::new(store);
    let verifier = TrustVerifier::with_policy(store.clone(), policy);
    (dir, store, verifier)
}

#[tokio::test]
async fn test_tofu_repeated_contact_never_prompts() {
    init_test_logging();
    let (_dir, store, verifier) = file_verifier(Policy::Tofu);

    for _ in 0..5 {
        let outcome = verifier
            .verify(None, IdentityKind::Ssh, "Host.Example.", 22, FP_A)
            .await
            .unwrap();
        assert_eq!(outcome.label(), "accepted");
    }

    let records = store.list(&Scope::Global).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].host, "host.example");
}

#[tokio::test]
async fn test_tofu_mismatch_leaves_store_unchanged_until_confirmed() {
    init_test_logging();
    let (_dir, store, verifier) = file_verifier(Policy::Tofu);
    verifier
        .verify(None, IdentityKind::Ssh, "host", 22, FP_A)
        .await
        .unwrap();

    let path = store.scope_path(&Scope::Global);
    let before = std::fs::read(&path).unwrap();

    let outcome = verifier
        .verify(None, IdentityKind::Ssh, "host", 22, FP_B)
        .await
        .unwrap();
    let VerificationOutcome::Pending(pending) = outcome else {
        panic!("expected pending");
    };
    assert_eq!(std::fs::read(&path).unwrap(), before);

    let confirmer = {
        let verifier = verifier.clone();
        let request_id = pending.request_id();
        tokio::spawn(async move { verifier.confirm(request_id, true).await })
    };

    let verdict = pending.outcome().await;
    assert!(verdict.is_accepted());
    assert_eq!(confirmer.await.unwrap().unwrap(), verdict);

    let record = store.get(&Scope::Global, &ssh_key("host")).await.unwrap().unwrap();
    assert_eq!(record.fingerprint(), &Fingerprint::parse(FP_B).unwrap());
    assert_eq!(record.history.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_first_contact_creates_one_record() {
    init_test_logging();
    let (_dir, store, verifier) = file_verifier(Policy::Tofu);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let verifier = verifier.clone();
            tokio::spawn(async move {
                verifier
                    .verify(None, IdentityKind::Ssh, "race", 22, FP_A)
                    .await
                    .unwrap()
            })
        })
        .collect();

    for task in tasks {
        let outcome = task.await.unwrap();
        let VerificationOutcome::Accepted(accepted) = outcome else {
            panic!("expected accepted");
        };
        assert_eq!(accepted.fingerprint(), &Fingerprint::parse(FP_A).unwrap());
    }

    assert_eq!(store.list(&Scope::Global).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pending_confirmation_does_not_block_other_hosts() {
    init_test_logging();
    let (_dir, _store, verifier) = file_verifier(Policy::Tofu);
    verifier
        .verify(None, IdentityKind::Ssh, "slow", 22, FP_A)
        .await
        .unwrap();
    let outcome = verifier
        .verify(None, IdentityKind::Ssh, "slow", 22, FP_B)
        .await
        .unwrap();
    assert_eq!(outcome.label(), "pending");

    let other = tokio::time::timeout(
        Duration::from_secs(2),
        verifier.verify(None, IdentityKind::Ssh, "fast", 22, FP_A),
    )
    .await
    .expect("unrelated host must not wait on a pending confirmation")
    .unwrap();
    assert_eq!(other.label(), "accepted");

    // Same key is not blocked either: the lock is released while pending
    let same = tokio::time::timeout(
        Duration::from_secs(2),
        verifier.verify(None, IdentityKind::Ssh, "slow", 22, FP_A),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(same.label(), "accepted");
    assert_eq!(verifier.pending_count(), 1);
}

#[tokio::test]
async fn test_connection_override_policy() {
    init_test_logging();
    let (_dir, store) = temp_store();
    let config = TrustConfig::from_yaml(
        "policies:\n  ssh: tofu\nconnections:\n  prod-db:\n    ssh: strict\n",
    )
    .unwrap();
    let verifier = TrustVerifier::new(Arc::new(store), &config);

    let outcome = verifier
        .verify(Some("prod-db"), IdentityKind::Ssh, "db", 22, FP_A)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        VerificationOutcome::Rejected(Rejection {
            reason: RejectReason::PolicyRejected {
                policy: Policy::Strict
            },
            ..
        })
    ));

    let outcome = verifier
        .verify(Some("dev"), IdentityKind::Ssh, "db", 22, FP_A)
        .await
        .unwrap();
    assert_eq!(outcome.label(), "accepted");
}

#[tokio::test]
async fn test_history_cap_evicts_oldest() {
    init_test_logging();
    let (_dir, store) = temp_store();
    let config = TrustConfig {
        history_cap: 2,
        policies: hostward_core::trust::policy::KindPolicies {
            tls: Policy::AlwaysTrust,
            ssh: Policy::AlwaysTrust,
        },
        ..TrustConfig::default()
    };
    let store = Arc::new(store);
    let verifier = TrustVerifier::new(store.clone(), &config);

    let fingerprints: Vec<Fingerprint> = (1u8..=4).map(|b| Fingerprint::from_digest(&[b; 32])).collect();
    for fp in &fingerprints {
        let verdict = verifier
            .verify(None, IdentityKind::Ssh, "rotating", 22, fp.as_str())
            .await
            .unwrap()
            .verdict()
            .await;
        assert!(matches!(verdict, Verdict::Accepted(_)));
    }

    let record = store.get(&Scope::Global, &ssh_key("rotating")).await.unwrap().unwrap();
    let history: Vec<_> = record.history.entries().iter().map(|e| e.fingerprint.clone()).collect();
    assert_eq!(history, vec![fingerprints[1].clone(), fingerprints[2].clone()]);
    assert_eq!(record.fingerprint(), &fingerprints[3]);
}
