//! Change notifications for management UIs

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::trust::fingerprint::Fingerprint;
use crate::trust::record::{RecordKey, Scope};

const EVENT_CAPACITY: usize = 256;

/// Something changed in the trust state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrustEvent {
    RecordCreated {
        scope: Scope,
        key: RecordKey,
        fingerprint: Fingerprint,
        user_approved: bool,
    },
    RecordSeen {
        scope: Scope,
        key: RecordKey,
    },
    FingerprintReplaced {
        scope: Scope,
        key: RecordKey,
        previous: Fingerprint,
        current: Fingerprint,
        user_approved: bool,
    },
    RecordApproved {
        scope: Scope,
        key: RecordKey,
        fingerprint: Fingerprint,
    },
    RecordRemoved {
        scope: Scope,
        key: RecordKey,
    },
    RecordRenamed {
        scope: Scope,
        key: RecordKey,
        nickname: Option<String>,
    },
    ScopeCleared {
        scope: Scope,
        removed: usize,
    },
    ConfirmationRequested {
        request_id: Uuid,
        key: RecordKey,
        observed: Fingerprint,
        stored: Option<Fingerprint>,
    },
    ConfirmationResolved {
        request_id: Uuid,
        key: RecordKey,
        accepted: bool,
    },
}

/// Fan-out of [`TrustEvent`]s to any number of subscribers
#[derive(Clone)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<TrustEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrustEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: TrustEvent) {
        trace!("Trust event: {:?}", event);
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::record::IdentityKind;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let key = RecordKey::new(IdentityKind::Tls, "example.com", 443).unwrap();

        bus.publish(TrustEvent::RecordRemoved {
            scope: Scope::Global,
            key: key.clone(),
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            TrustEvent::RecordRemoved {
                scope: Scope::Global,
                key
            }
        );
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::new().publish(TrustEvent::ScopeCleared {
            scope: Scope::Global,
            removed: 0,
        });
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(TrustEvent::ScopeCleared {
            scope: Scope::connection("prod"),
            removed: 2,
        })
        .unwrap();
        assert_eq!(json["event"], "scope_cleared");
        assert_eq!(json["removed"], 2);
    }
}
