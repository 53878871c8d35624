//! Verification API - the runtime enforcement of host identity trust
//!
//! Connection code calls [`TrustVerifier::verify`] with the identity a host
//! presented. The outcome is immediate (`Accepted` / `Rejected`) unless the
//! effective policy asks the user, in which case a [`PendingVerification`]
//! is returned and resolved later by [`TrustVerifier::confirm`] or by the
//! confirmation timeout.

use chrono::Utc;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::TrustConfig;
use crate::trust::error::TrustError;
use crate::trust::events::{EventBus, TrustEvent};
use crate::trust::fingerprint::{fingerprint_material, Fingerprint};
use crate::trust::locks::{lookup_scopes, LockRegistry};
use crate::trust::manager::TrustManager;
use crate::trust::pending::{PendingRegistry, PendingRequest, PendingVerification};
use crate::trust::policy::{evaluate, resolve_lookup, Decision, Lookup, Policy, PolicyTable};
use crate::trust::record::{IdentityKind, RecordKey, Scope, TrustRecord};
use crate::trust::store::TrustStore;

/// An identity that was accepted, with the record as stored afterwards
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedIdentity {
    pub scope: Scope,
    pub record: TrustRecord,
}

impl AcceptedIdentity {
    pub fn fingerprint(&self) -> &Fingerprint {
        self.record.fingerprint()
    }
}

/// Why an identity was refused
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    PolicyRejected { policy: Policy },
    UserRejected,
    ConfirmationTimeout { request_id: Uuid, timeout: Duration },
    /// The record changed while the confirmation was pending
    Superseded,
    /// The store failed while the confirmation was being applied
    StoreFailure {
        path: PathBuf,
        message: String,
        /// Scope whose document failed its seal, if that was the failure
        tampered: Option<Scope>,
    },
}

impl RejectReason {
    /// Capture a store failure so it can travel through the pending channel
    fn from_store_error(error: &TrustError) -> Option<Self> {
        let (path, message, tampered) = match error {
            TrustError::StoreIo { path, source } => (path, source.to_string(), None),
            TrustError::StoreParse { path, source } => (path, source.to_string(), None),
            TrustError::StoreTampered { path, scope } => (path, error.to_string(), Some(scope.clone())),
            _ => return None,
        };
        Some(RejectReason::StoreFailure {
            path: path.clone(),
            message,
            tampered,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub key: RecordKey,
    pub reason: RejectReason,
}

impl Rejection {
    pub fn into_error(self) -> TrustError {
        let RecordKey { kind, host, port } = self.key;
        match self.reason {
            RejectReason::PolicyRejected { policy } => TrustError::PolicyRejected {
                kind,
                host,
                port,
                policy,
            },
            RejectReason::UserRejected => TrustError::UserRejected { kind, host, port },
            RejectReason::ConfirmationTimeout {
                request_id,
                timeout,
            } => TrustError::ConfirmationTimeout {
                request_id,
                timeout,
            },
            RejectReason::Superseded => TrustError::Superseded { kind, host, port },
            RejectReason::StoreFailure {
                path,
                tampered: Some(scope),
                ..
            } => TrustError::StoreTampered { path, scope },
            RejectReason::StoreFailure { path, message, .. } => TrustError::StoreIo {
                path,
                source: io::Error::other(message),
            },
        }
    }
}

/// Final answer for one verification
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted(AcceptedIdentity),
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted(_))
    }

    /// Map every refusal to its [`TrustError`] so callers can `?` and abort
    pub fn into_result(self) -> Result<AcceptedIdentity, TrustError> {
        match self {
            Verdict::Accepted(accepted) => Ok(accepted),
            Verdict::Rejected(rejection) => Err(rejection.into_error()),
        }
    }
}

/// What `verify` returned
#[derive(Debug)]
pub enum VerificationOutcome {
    Accepted(AcceptedIdentity),
    Rejected(Rejection),
    Pending(PendingVerification),
}

impl VerificationOutcome {
    /// Wait for a final verdict (pending outcomes are awaited)
    pub async fn verdict(self) -> Verdict {
        match self {
            VerificationOutcome::Accepted(accepted) => Verdict::Accepted(accepted),
            VerificationOutcome::Rejected(rejection) => Verdict::Rejected(rejection),
            VerificationOutcome::Pending(pending) => pending.outcome().await,
        }
    }

    pub async fn into_result(self) -> Result<AcceptedIdentity, TrustError> {
        self.verdict().await.into_result()
    }

    pub fn label(&self) -> &'static str {
        match self {
            VerificationOutcome::Accepted(_) => "accepted",
            VerificationOutcome::Rejected(_) => "rejected",
            VerificationOutcome::Pending(_) => "pending",
        }
    }
}

/// State shared by the verifier, its manager and timeout tasks
pub(crate) struct TrustContext {
    pub store: Arc<dyn TrustStore>,
    pub policies: PolicyTable,
    pub history_cap: usize,
    pub confirmation_timeout: Duration,
    pub locks: LockRegistry,
    pub pending: PendingRegistry,
    pub events: EventBus,
}

/// Trust verifier - evaluates observed identities against the store
#[derive(Clone)]
pub struct TrustVerifier {
    ctx: Arc<TrustContext>,
}

impl TrustVerifier {
    pub fn new(store: Arc<dyn TrustStore>, config: &TrustConfig) -> Self {
        debug!(
            "Trust verifier created: tls={}, ssh={}, {} connection overrides",
            config.policies.tls,
            config.policies.ssh,
            config.connections.len()
        );
        TrustVerifier {
            ctx: Arc::new(TrustContext {
                store,
                policies: config.policy_table(),
                history_cap: config.effective_history_cap(),
                confirmation_timeout: config.confirmation_timeout(),
                locks: LockRegistry::new(),
                pending: PendingRegistry::new(),
                events: EventBus::new(),
            }),
        }
    }

    /// Verifier with one policy for every kind (for embedding and tests)
    pub fn with_policy(store: Arc<dyn TrustStore>, policy: Policy) -> Self {
        let config = TrustConfig {
            policies: PolicyTable::uniform(policy).defaults,
            ..TrustConfig::default()
        };
        Self::new(store, &config)
    }

    /// Management view over the same store, locks and events
    pub fn manager(&self) -> TrustManager {
        TrustManager::from_context(self.ctx.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrustEvent> {
        self.ctx.events.subscribe()
    }

    /// Policy that applies to `kind` on `connection_id`
    pub fn effective_policy(&self, connection_id: Option<&str>, kind: IdentityKind) -> Policy {
        self.ctx
            .policies
            .effective(normalize_connection_id(connection_id), kind)
    }

    /// Confirmations still awaiting an answer
    pub fn pending_count(&self) -> usize {
        self.ctx.pending.open_count()
    }

    /// Verify an already-computed fingerprint
    pub async fn verify(
        &self,
        connection_id: Option<&str>,
        kind: IdentityKind,
        host: &str,
        port: u16,
        observed: &str,
    ) -> Result<VerificationOutcome, TrustError> {
        let observed = Fingerprint::parse(observed)?;
        let key = RecordKey::new(kind, host, port)?;
        self.verify_fingerprint(connection_id, key, observed).await
    }

    /// Fingerprint raw certificate / host key material, then verify it
    pub async fn verify_material(
        &self,
        connection_id: Option<&str>,
        kind: IdentityKind,
        host: &str,
        port: u16,
        material: &[u8],
    ) -> Result<VerificationOutcome, TrustError> {
        let observed = fingerprint_material(kind, material)?;
        let key = RecordKey::new(kind, host, port)?;
        self.verify_fingerprint(connection_id, key, observed).await
    }

    async fn verify_fingerprint(
        &self,
        connection_id: Option<&str>,
        key: RecordKey,
        observed: Fingerprint,
    ) -> Result<VerificationOutcome, TrustError> {
        let ctx = &self.ctx;
        let connection_id = normalize_connection_id(connection_id);
        let policy = ctx.policies.effective(connection_id, key.kind);

        let scopes = lookup_scopes(connection_id);
        let guard = ctx.locks.lock_keys(&scopes, &key).await;

        let lookup = resolve_lookup(ctx.store.as_ref(), connection_id, &key, &observed).await?;
        let decision = evaluate(policy, &lookup);
        debug!(
            "Verifying {} ({}): policy={}, lookup={}, decision={:?}",
            key,
            observed.short(),
            policy,
            lookup.label(),
            decision
        );

        if let Lookup::Mismatch { record, .. } = &lookup {
            warn!(
                "Identity mismatch for {}: stored {}, presented {}",
                key,
                record.fingerprint().short(),
                observed.short()
            );
        }

        let now = Utc::now();
        match (decision, lookup) {
            (Decision::CreateAndAccept, _) => {
                let scope = Scope::from_connection_id(connection_id);
                let record = TrustRecord::new(&key, observed, now);
                ctx.store.upsert(&scope, record.clone()).await?;
                info!("Trusted new identity for {} in {}: {}", key, scope, record.fingerprint());
                ctx.events.publish(TrustEvent::RecordCreated {
                    scope: scope.clone(),
                    key,
                    fingerprint: record.fingerprint().clone(),
                    user_approved: false,
                });
                Ok(VerificationOutcome::Accepted(AcceptedIdentity { scope, record }))
            }

            (Decision::Accept, Lookup::Match { scope, mut record }) => {
                record.touch(now);
                ctx.store.upsert(&scope, record.clone()).await?;
                ctx.events.publish(TrustEvent::RecordSeen {
                    scope: scope.clone(),
                    key,
                });
                Ok(VerificationOutcome::Accepted(AcceptedIdentity { scope, record }))
            }

            (Decision::ReplaceAndAccept, Lookup::Mismatch { scope, mut record }) => {
                let previous = record.fingerprint().clone();
                record.replace_fingerprint(observed, now, ctx.history_cap);
                record.user_approved = false;
                ctx.store.upsert(&scope, record.clone()).await?;
                warn!(
                    "Replaced identity for {} in {} without confirmation ({} policy)",
                    key, scope, policy
                );
                ctx.events.publish(TrustEvent::FingerprintReplaced {
                    scope: scope.clone(),
                    key,
                    previous,
                    current: record.fingerprint().clone(),
                    user_approved: false,
                });
                Ok(VerificationOutcome::Accepted(AcceptedIdentity { scope, record }))
            }

            (Decision::Reject, _) => {
                let rejection = Rejection {
                    key,
                    reason: RejectReason::PolicyRejected { policy },
                };
                rejection.clone().into_error().log_if_security_critical();
                Ok(VerificationOutcome::Rejected(rejection))
            }

            (Decision::AskUser, lookup) => {
                let generations = scopes
                    .iter()
                    .map(|scope| (scope.clone(), ctx.locks.generation(scope)))
                    .collect();
                drop(guard);
                Ok(VerificationOutcome::Pending(self.request_confirmation(
                    connection_id,
                    key,
                    observed,
                    policy,
                    lookup,
                    generations,
                )))
            }

            // evaluate() only yields Accept for Match and ReplaceAndAccept for Mismatch
            (decision, lookup) => {
                warn!(
                    "Inconsistent decision {:?} for lookup {} on {}, rejecting",
                    decision,
                    lookup.label(),
                    key
                );
                Ok(VerificationOutcome::Rejected(Rejection {
                    key,
                    reason: RejectReason::PolicyRejected { policy },
                }))
            }
        }
    }

    fn request_confirmation(
        &self,
        connection_id: Option<&str>,
        key: RecordKey,
        observed: Fingerprint,
        policy: Policy,
        lookup: Lookup,
        generations: Vec<(Scope, u64)>,
    ) -> PendingVerification {
        let ctx = &self.ctx;
        let request_id = Uuid::now_v7();
        let stored = lookup.record().map(|record| record.fingerprint().clone());
        let slot = ctx.pending.register(PendingRequest {
            request_id,
            connection_id: connection_id.map(str::to_string),
            key: key.clone(),
            observed: observed.clone(),
            policy,
            lookup,
            generations,
            requested_at: Utc::now(),
        });

        let timeout = ctx.confirmation_timeout;
        let timer = {
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                expire(&ctx, request_id, timeout).await;
            })
        };
        slot.set_timer(timer.abort_handle());

        info!(
            "Confirmation {} requested for {} ({} policy)",
            request_id, key, policy
        );
        ctx.events.publish(TrustEvent::ConfirmationRequested {
            request_id,
            key,
            observed,
            stored,
        });
        ctx.pending.handle(&slot, timeout)
    }

    /// Answer a pending confirmation. Safe to call any number of times; once
    /// resolved, later calls return the original verdict.
    ///
    /// Settled requests are remembered for the last 256 settlements only;
    /// confirming an id older than that returns `UnknownRequest`.
    ///
    /// If the store fails while an acceptance is applied, this call returns
    /// the store error and the request settles as a store failure, which the
    /// original caller sees as a store-class error rather than a rejection.
    pub async fn confirm(&self, request_id: Uuid, accept: bool) -> Result<Verdict, TrustError> {
        let ctx = &self.ctx;
        let slot = ctx
            .pending
            .get(&request_id)
            .ok_or(TrustError::UnknownRequest { request_id })?;

        let _resolution = slot.begin_resolution().await;
        if let Some(verdict) = slot.verdict() {
            debug!("Confirmation {} already resolved", request_id);
            return Ok(verdict);
        }

        let verdict = if accept {
            match apply_confirmation(ctx, &slot.request).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    if let Some(reason) = RejectReason::from_store_error(&e) {
                        error!("Confirmation {} could not be stored: {}", request_id, e);
                        let failure = Verdict::Rejected(Rejection {
                            key: slot.request.key.clone(),
                            reason,
                        });
                        let (_, first) = ctx.pending.settle(&slot, failure);
                        if first {
                            ctx.events.publish(TrustEvent::ConfirmationResolved {
                                request_id,
                                key: slot.request.key.clone(),
                                accepted: false,
                            });
                        }
                    }
                    return Err(e);
                }
            }
        } else {
            info!("User rejected identity for {}", slot.request.key);
            Verdict::Rejected(Rejection {
                key: slot.request.key.clone(),
                reason: RejectReason::UserRejected,
            })
        };

        let (verdict, first) = ctx.pending.settle(&slot, verdict);
        if first {
            ctx.events.publish(TrustEvent::ConfirmationResolved {
                request_id,
                key: slot.request.key.clone(),
                accepted: verdict.is_accepted(),
            });
        }
        Ok(verdict)
    }
}

/// Blank connection ids mean "no connection"
fn normalize_connection_id(connection_id: Option<&str>) -> Option<&str> {
    connection_id.filter(|id| !id.trim().is_empty())
}

/// Persist a user's acceptance, re-validating against the current store
async fn apply_confirmation(
    ctx: &TrustContext,
    request: &PendingRequest,
) -> Result<Verdict, TrustError> {
    let connection_id = request.connection_id.as_deref();
    let key = &request.key;
    let observed = &request.observed;
    let scopes = lookup_scopes(connection_id);
    let _guard = ctx.locks.lock_keys(&scopes, key).await;

    let superseded = || -> Result<Verdict, TrustError> {
        warn!(
            "Confirmation {} for {} superseded by a concurrent change",
            request.request_id, key
        );
        Ok(Verdict::Rejected(Rejection {
            key: key.clone(),
            reason: RejectReason::Superseded,
        }))
    };

    let cleared = request
        .generations
        .iter()
        .any(|(scope, generation)| ctx.locks.generation(scope) != *generation);
    if cleared {
        return superseded();
    }

    let now = Utc::now();
    let current = resolve_lookup(ctx.store.as_ref(), connection_id, key, observed).await?;
    match (&request.lookup, current) {
        (Lookup::NoRecord, Lookup::NoRecord) => {
            let scope = Scope::from_connection_id(connection_id);
            let mut record = TrustRecord::new(key, observed.clone(), now);
            record.user_approved = true;
            ctx.store.upsert(&scope, record.clone()).await?;
            info!("User approved new identity for {} in {}", key, scope);
            ctx.events.publish(TrustEvent::RecordCreated {
                scope: scope.clone(),
                key: key.clone(),
                fingerprint: observed.clone(),
                user_approved: true,
            });
            Ok(Verdict::Accepted(AcceptedIdentity { scope, record }))
        }

        // Either the plain AlwaysAsk match, or another request already
        // stored this same fingerprint
        (original, Lookup::Match { scope, mut record })
            if original.scope().map_or(true, |s| s == &scope) =>
        {
            record.touch(now);
            record.user_approved = true;
            ctx.store.upsert(&scope, record.clone()).await?;
            info!("User approved identity for {} in {}", key, scope);
            ctx.events.publish(TrustEvent::RecordApproved {
                scope: scope.clone(),
                key: key.clone(),
                fingerprint: observed.clone(),
            });
            Ok(Verdict::Accepted(AcceptedIdentity { scope, record }))
        }

        (
            Lookup::Mismatch {
                scope: original_scope,
                record: snapshot,
            },
            Lookup::Mismatch { scope, mut record },
        ) if original_scope == &scope && record.fingerprint() == snapshot.fingerprint() => {
            let previous = record.fingerprint().clone();
            record.replace_fingerprint(observed.clone(), now, ctx.history_cap);
            record.user_approved = true;
            ctx.store.upsert(&scope, record.clone()).await?;
            info!(
                "User accepted changed identity for {} in {}: {} -> {}",
                key,
                scope,
                previous.short(),
                observed.short()
            );
            ctx.events.publish(TrustEvent::FingerprintReplaced {
                scope: scope.clone(),
                key: key.clone(),
                previous,
                current: observed.clone(),
                user_approved: true,
            });
            Ok(Verdict::Accepted(AcceptedIdentity { scope, record }))
        }

        _ => superseded(),
    }
}

/// Timeout task body: reject the request if nobody answered
async fn expire(ctx: &TrustContext, request_id: Uuid, timeout: Duration) {
    let Some(slot) = ctx.pending.get(&request_id) else {
        return;
    };
    let _resolution = slot.begin_resolution().await;
    if slot.verdict().is_some() {
        return;
    }

    slot.disarm_timer();
    let (_, first) = ctx.pending.settle(
        &slot,
        Verdict::Rejected(Rejection {
            key: slot.request.key.clone(),
            reason: RejectReason::ConfirmationTimeout {
                request_id,
                timeout,
            },
        }),
    );
    if first {
        warn!(
            "Confirmation {} for {} timed out after {}s (requested {})",
            request_id,
            slot.request.key,
            timeout.as_secs(),
            slot.request.requested_at.to_rfc3339()
        );
        ctx.events.publish(TrustEvent::ConfirmationResolved {
            request_id,
            key: slot.request.key.clone(),
            accepted: false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::store::MemoryTrustStore;
    use pretty_assertions::assert_eq;

    const FP_A: &str = "sha256:1111111111111111111111111111111111111111111111111111111111111111";
    const FP_B: &str = "sha256:2222222222222222222222222222222222222222222222222222222222222222";
    const FP_C: &str = "sha256:3333333333333333333333333333333333333333333333333333333333333333";

    fn fp(value: &str) -> Fingerprint {
        Fingerprint::parse(value).unwrap()
    }

    fn key() -> RecordKey {
        RecordKey::new(IdentityKind::Ssh, "host", 22).unwrap()
    }

    fn verifier(policy: Policy) -> (TrustVerifier, Arc<MemoryTrustStore>) {
        let store = Arc::new(MemoryTrustStore::new());
        (TrustVerifier::with_policy(store.clone(), policy), store)
    }

    async fn verify(v: &TrustVerifier, conn: Option<&str>, observed: &str) -> VerificationOutcome {
        v.verify(conn, IdentityKind::Ssh, "host", 22, observed)
            .await
            .unwrap()
    }

    fn pending(outcome: VerificationOutcome) -> PendingVerification {
        match outcome {
            VerificationOutcome::Pending(p) => p,
            other => panic!("expected pending, got {}", other.label()),
        }
    }

    #[tokio::test]
    async fn test_tofu_first_contact_creates_record() {
        let (v, store) = verifier(Policy::Tofu);
        let outcome = verify(&v, None, FP_A).await;

        let VerificationOutcome::Accepted(accepted) = outcome else {
            panic!("expected accepted");
        };
        assert_eq!(accepted.scope, Scope::Global);
        assert_eq!(accepted.record.identity.first_seen, accepted.record.identity.last_seen);
        assert!(!accepted.record.user_approved);

        let stored = store.get(&Scope::Global, &key()).await.unwrap().unwrap();
        assert_eq!(stored.fingerprint(), &fp(FP_A));
    }

    #[tokio::test]
    async fn test_fp_a_fp_b_confirmation_flow() {
        let (v, store) = verifier(Policy::Tofu);
        assert_eq!(verify(&v, None, FP_A).await.label(), "accepted");

        let first = pending(verify(&v, None, FP_B).await);
        assert_eq!(first.stored(), Some(&fp(FP_A)));
        let verdict = v.confirm(first.request_id(), false).await.unwrap();
        assert!(matches!(
            verdict,
            Verdict::Rejected(Rejection {
                reason: RejectReason::UserRejected,
                ..
            })
        ));
        let stored = store.get(&Scope::Global, &key()).await.unwrap().unwrap();
        assert_eq!(stored.fingerprint(), &fp(FP_A));
        assert!(stored.history.is_empty());

        let second = pending(verify(&v, None, FP_B).await);
        let verdict = v.confirm(second.request_id(), true).await.unwrap();
        assert!(verdict.is_accepted());
        assert_eq!(second.outcome().await, verdict);

        let stored = store.get(&Scope::Global, &key()).await.unwrap().unwrap();
        assert_eq!(stored.fingerprint(), &fp(FP_B));
        assert_eq!(stored.history.len(), 1);
        assert_eq!(stored.history.entries()[0].fingerprint, fp(FP_A));
        assert!(stored.user_approved);
    }

    #[tokio::test]
    async fn test_confirm_is_idempotent() {
        let (v, store) = verifier(Policy::Tofu);
        verify(&v, None, FP_A).await;
        let request = pending(verify(&v, None, FP_B).await);

        let first = v.confirm(request.request_id(), true).await.unwrap();
        let writes = store.write_count();
        let second = v.confirm(request.request_id(), false).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_unknown_request_id() {
        let (v, _) = verifier(Policy::Tofu);
        let err = v.confirm(Uuid::now_v7(), true).await.unwrap_err();
        assert!(matches!(err, TrustError::UnknownRequest { .. }));
    }

    #[tokio::test]
    async fn test_strict_requires_approval() {
        let (v, store) = verifier(Policy::Strict);
        let outcome = verify(&v, None, FP_A).await;
        assert!(matches!(
            outcome,
            VerificationOutcome::Rejected(Rejection {
                reason: RejectReason::PolicyRejected {
                    policy: Policy::Strict
                },
                ..
            })
        ));
        assert!(store.list(&Scope::Global).await.unwrap().is_empty());

        v.manager()
            .approve(&Scope::Global, &key(), &fp(FP_A))
            .await
            .unwrap();
        assert_eq!(verify(&v, None, FP_A).await.label(), "accepted");
        assert_eq!(verify(&v, None, FP_B).await.label(), "rejected");
    }

    #[tokio::test]
    async fn test_always_trust_replaces_without_approval() {
        let (v, store) = verifier(Policy::AlwaysTrust);
        verify(&v, None, FP_A).await;
        let outcome = verify(&v, None, FP_B).await;
        assert_eq!(outcome.label(), "accepted");

        let stored = store.get(&Scope::Global, &key()).await.unwrap().unwrap();
        assert_eq!(stored.fingerprint(), &fp(FP_B));
        assert_eq!(stored.history.len(), 1);
        assert!(!stored.user_approved);
    }

    #[tokio::test]
    async fn test_always_trust_match_still_records_last_seen() {
        let (v, store) = verifier(Policy::AlwaysTrust);
        verify(&v, None, FP_A).await;
        let before = store.get(&Scope::Global, &key()).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(verify(&v, None, FP_A).await.label(), "accepted");

        let after = store.get(&Scope::Global, &key()).await.unwrap().unwrap();
        assert!(after.identity.last_seen > before.identity.last_seen);
        assert_eq!(after.identity.first_seen, before.identity.first_seen);
        assert!(after.history.is_empty());
        assert!(!after.user_approved);
    }

    #[tokio::test]
    async fn test_always_ask_reprompts_on_match() {
        let (v, store) = verifier(Policy::AlwaysAsk);
        let first = pending(verify(&v, None, FP_A).await);
        assert!(first.stored().is_none());
        assert!(store.list(&Scope::Global).await.unwrap().is_empty());

        v.confirm(first.request_id(), true).await.unwrap();
        let stored = store.get(&Scope::Global, &key()).await.unwrap().unwrap();
        assert!(stored.user_approved);

        let second = pending(verify(&v, None, FP_A).await);
        let verdict = v.confirm(second.request_id(), true).await.unwrap();
        assert!(verdict.is_accepted());
        let stored = store.get(&Scope::Global, &key()).await.unwrap().unwrap();
        assert!(stored.history.is_empty());
    }

    #[tokio::test]
    async fn test_new_records_go_to_connection_scope() {
        let (v, store) = verifier(Policy::Tofu);
        let outcome = verify(&v, Some("prod"), FP_A).await;
        let VerificationOutcome::Accepted(accepted) = outcome else {
            panic!("expected accepted");
        };
        assert_eq!(accepted.scope, Scope::connection("prod"));
        assert!(store.get(&Scope::Global, &key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connection_falls_back_to_global_record() {
        let (v, store) = verifier(Policy::Tofu);
        verify(&v, None, FP_A).await;

        let outcome = verify(&v, Some("prod"), FP_A).await;
        let VerificationOutcome::Accepted(accepted) = outcome else {
            panic!("expected accepted");
        };
        assert_eq!(accepted.scope, Scope::Global);
        assert!(store.list(&Scope::connection("prod")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connection_record_shadows_global() {
        let (v, _) = verifier(Policy::Tofu);
        verify(&v, None, FP_A).await;
        v.manager()
            .approve(&Scope::connection("prod"), &key(), &fp(FP_B))
            .await
            .unwrap();

        assert_eq!(verify(&v, Some("prod"), FP_B).await.label(), "accepted");
        assert_eq!(verify(&v, Some("prod"), FP_A).await.label(), "pending");
        assert_eq!(verify(&v, None, FP_A).await.label(), "accepted");
    }

    #[tokio::test]
    async fn test_confirm_after_clear_is_superseded() {
        let (v, store) = verifier(Policy::Tofu);
        verify(&v, None, FP_A).await;
        let request = pending(verify(&v, None, FP_B).await);

        v.manager().clear(&Scope::Global).await.unwrap();
        let verdict = v.confirm(request.request_id(), true).await.unwrap();

        assert!(matches!(
            verdict,
            Verdict::Rejected(Rejection {
                reason: RejectReason::Superseded,
                ..
            })
        ));
        assert!(store.list(&Scope::Global).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_competing_confirmations() {
        let (v, store) = verifier(Policy::Tofu);
        verify(&v, None, FP_A).await;
        let to_b = pending(verify(&v, None, FP_B).await);
        let also_b = pending(verify(&v, None, FP_B).await);
        let to_c = pending(verify(&v, None, FP_C).await);

        assert!(v.confirm(to_b.request_id(), true).await.unwrap().is_accepted());
        // Same fingerprint already stored: accepted, no second history entry
        assert!(v.confirm(also_b.request_id(), true).await.unwrap().is_accepted());
        // Record moved on since this request was issued
        let verdict = v.confirm(to_c.request_id(), true).await.unwrap();
        assert!(!verdict.is_accepted());

        let stored = store.get(&Scope::Global, &key()).await.unwrap().unwrap();
        assert_eq!(stored.fingerprint(), &fp(FP_B));
        assert_eq!(stored.history.len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let (v, store) = verifier(Policy::Tofu);
        store.set_fail_writes(true);

        let err = v
            .verify(None, IdentityKind::Ssh, "host", 22, FP_A)
            .await
            .unwrap_err();
        assert!(err.is_store_failure());

        store.set_fail_writes(false);
        assert!(store.list(&Scope::Global).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_during_confirm_reaches_waiter() {
        let (v, store) = verifier(Policy::Tofu);
        verify(&v, None, FP_A).await;
        let request = pending(verify(&v, None, FP_B).await);

        store.set_fail_writes(true);
        let err = v.confirm(request.request_id(), true).await.unwrap_err();
        assert!(err.is_store_failure());

        let verdict = request.outcome().await;
        assert!(matches!(
            verdict,
            Verdict::Rejected(Rejection {
                reason: RejectReason::StoreFailure { tampered: None, .. },
                ..
            })
        ));
        let err = verdict.into_result().unwrap_err();
        assert!(err.is_store_failure());
        assert!(!err.is_rejection());
        assert_eq!(v.pending_count(), 0);

        // Settled for good: no late acceptance, the timeout changes nothing
        store.set_fail_writes(false);
        tokio::time::sleep(Duration::from_secs(600)).await;
        let again = v.confirm(request.request_id(), true).await.unwrap();
        assert!(!again.is_accepted());
        let stored = store.get(&Scope::Global, &key()).await.unwrap().unwrap();
        assert_eq!(stored.fingerprint(), &fp(FP_A));
    }

    #[tokio::test]
    async fn test_invalid_identity_is_rejected() {
        let (v, _) = verifier(Policy::AlwaysTrust);
        let err = v
            .verify(None, IdentityKind::Ssh, "host", 22, "not-a-fingerprint")
            .await
            .unwrap_err();
        assert!(matches!(err, TrustError::InvalidIdentity { .. }));

        let err = v
            .verify(None, IdentityKind::Ssh, "", 22, FP_A)
            .await
            .unwrap_err();
        assert!(matches!(err, TrustError::InvalidIdentity { .. }));
    }

    #[tokio::test]
    async fn test_into_result_maps_rejections() {
        let (v, _) = verifier(Policy::Strict);
        let err = verify(&v, None, FP_A).await.into_result().await.unwrap_err();
        assert!(matches!(err, TrustError::PolicyRejected { .. }));
        assert!(err.is_rejection());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_times_out() {
        let store = Arc::new(MemoryTrustStore::new());
        let config = TrustConfig {
            confirmation_timeout_seconds: 30,
            ..TrustConfig::default()
        };
        let v = TrustVerifier::new(store, &config);
        verify(&v, None, FP_A).await;
        let before = Utc::now();
        let request = pending(verify(&v, None, FP_B).await);
        assert!(request.requested_at() >= before);
        assert!(request.requested_at() <= Utc::now());

        let verdict = request.outcome().await;
        let err = verdict.into_result().unwrap_err();
        assert!(matches!(
            err,
            TrustError::ConfirmationTimeout { timeout, .. } if timeout == Duration::from_secs(30)
        ));

        // Late confirm returns the timeout verdict
        let late = v.confirm(request.request_id(), true).await.unwrap();
        assert!(!late.is_accepted());
        assert_eq!(v.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_events_follow_mutations() {
        let (v, _) = verifier(Policy::Tofu);
        let mut events = v.subscribe();

        verify(&v, None, FP_A).await;
        assert!(matches!(
            events.recv().await.unwrap(),
            TrustEvent::RecordCreated { .. }
        ));

        let request = pending(verify(&v, None, FP_B).await);
        assert!(matches!(
            events.recv().await.unwrap(),
            TrustEvent::ConfirmationRequested { .. }
        ));

        v.confirm(request.request_id(), true).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            TrustEvent::FingerprintReplaced {
                user_approved: true,
                ..
            }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            TrustEvent::ConfirmationResolved { accepted: true, .. }
        ));
    }
}
