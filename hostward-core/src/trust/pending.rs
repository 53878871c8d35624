//! Pending user confirmations
//!
//! Every `AskUser` decision registers a slot keyed by a fresh request id.
//! A slot settles exactly once, either through `confirm` or its timeout
//! task, and wakes the original caller. Settled slots are retained for a
//! while so repeated confirms return the original verdict.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tokio::task::AbortHandle;
use tracing::debug;
use uuid::Uuid;

use crate::trust::fingerprint::Fingerprint;
use crate::trust::policy::{Lookup, Policy};
use crate::trust::record::{RecordKey, Scope};
use crate::trust::verifier::{RejectReason, Rejection, Verdict};

/// Settled slots kept around for idempotent confirms
const SETTLED_RETENTION: usize = 256;

/// Everything captured when a confirmation was requested
#[derive(Debug, Clone)]
pub(crate) struct PendingRequest {
    pub request_id: Uuid,
    pub connection_id: Option<String>,
    pub key: RecordKey,
    pub observed: Fingerprint,
    pub policy: Policy,
    pub lookup: Lookup,
    /// Generation of each consulted scope at request time
    pub generations: Vec<(Scope, u64)>,
    pub requested_at: DateTime<Utc>,
}

pub(crate) struct PendingSlot {
    pub request: PendingRequest,
    verdict: OnceCell<Verdict>,
    notify: watch::Sender<Option<Verdict>>,
    resolution: tokio::sync::Mutex<()>,
    timer: Mutex<Option<AbortHandle>>,
}

impl PendingSlot {
    fn new(request: PendingRequest) -> Self {
        let (notify, _) = watch::channel(None);
        PendingSlot {
            request,
            verdict: OnceCell::new(),
            notify,
            resolution: tokio::sync::Mutex::new(()),
            timer: Mutex::new(None),
        }
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict.get().cloned()
    }

    /// Serializes confirm and timeout for this slot
    pub async fn begin_resolution(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.resolution.lock().await
    }

    pub fn set_timer(&self, handle: AbortHandle) {
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Forget the timer without aborting it (called from the timer itself)
    pub fn disarm_timer(&self) {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn waiter(&self) -> watch::Receiver<Option<Verdict>> {
        self.notify.subscribe()
    }

    /// Store the verdict if none exists yet. Returns the effective verdict
    /// and whether this call settled the slot.
    fn settle(&self, verdict: Verdict) -> (Verdict, bool) {
        if self.verdict.set(verdict).is_err() {
            let existing = self.verdict().unwrap_or_else(|| unreachable!());
            return (existing, false);
        }
        let settled = self.verdict().unwrap_or_else(|| unreachable!());
        self.notify.send_replace(Some(settled.clone()));

        if let Some(timer) = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
        (settled, true)
    }
}

#[derive(Default)]
struct Slots {
    by_id: HashMap<Uuid, Arc<PendingSlot>>,
    settled: VecDeque<Uuid>,
}

#[derive(Default)]
pub(crate) struct PendingRegistry {
    slots: Mutex<Slots>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request: PendingRequest) -> Arc<PendingSlot> {
        let slot = Arc::new(PendingSlot::new(request));
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.by_id.insert(slot.request.request_id, slot.clone());
        debug!(
            "Registered confirmation request {} for {}",
            slot.request.request_id, slot.request.key
        );
        slot
    }

    pub fn get(&self, request_id: &Uuid) -> Option<Arc<PendingSlot>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.by_id.get(request_id).cloned()
    }

    /// Settle a slot and account for its retention
    pub fn settle(&self, slot: &PendingSlot, verdict: Verdict) -> (Verdict, bool) {
        let (verdict, first) = slot.settle(verdict);
        if first {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.settled.push_back(slot.request.request_id);
            while slots.settled.len() > SETTLED_RETENTION {
                if let Some(oldest) = slots.settled.pop_front() {
                    slots.by_id.remove(&oldest);
                }
            }
        }
        (verdict, first)
    }

    /// Requests still awaiting an answer
    pub fn open_count(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .by_id
            .values()
            .filter(|slot| slot.verdict.get().is_none())
            .count()
    }

    pub fn handle(&self, slot: &PendingSlot, timeout: Duration) -> PendingVerification {
        let request = &slot.request;
        PendingVerification {
            request_id: request.request_id,
            key: request.key.clone(),
            observed: request.observed.clone(),
            stored: request.lookup.record().map(|r| r.fingerprint().clone()),
            scope: request.lookup.scope().cloned(),
            policy: request.policy,
            timeout,
            requested_at: request.requested_at,
            receiver: slot.waiter(),
        }
    }
}

/// Handle returned to the caller of `verify` while the user decides
#[derive(Debug)]
pub struct PendingVerification {
    request_id: Uuid,
    key: RecordKey,
    observed: Fingerprint,
    stored: Option<Fingerprint>,
    scope: Option<Scope>,
    policy: Policy,
    timeout: Duration,
    requested_at: DateTime<Utc>,
    receiver: watch::Receiver<Option<Verdict>>,
}

impl PendingVerification {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    /// Fingerprint presented by the host
    pub fn observed(&self) -> &Fingerprint {
        &self.observed
    }

    /// Fingerprint currently on record, if any
    pub fn stored(&self) -> Option<&Fingerprint> {
        self.stored.as_ref()
    }

    /// Scope of the consulted record, if any
    pub fn scope(&self) -> Option<&Scope> {
        self.scope.as_ref()
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// When the host presented the unconfirmed identity
    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }

    /// Verdict if already settled
    pub fn try_outcome(&self) -> Option<Verdict> {
        self.receiver.borrow().clone()
    }

    /// Wait until the request is confirmed or times out
    pub async fn outcome(&self) -> Verdict {
        let mut receiver = self.receiver.clone();
        let settled = match receiver.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };

        settled.unwrap_or_else(|| {
            Verdict::Rejected(Rejection {
                key: self.key.clone(),
                reason: RejectReason::ConfirmationTimeout {
                    request_id: self.request_id,
                    timeout: self.timeout,
                },
            })
        })
    }
}
