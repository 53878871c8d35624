//! Management API for settings screens and the CLI
//!
//! Shares locks, scope generations and the event bus with the verifier it
//! was created from, so management mutations and verifications never
//! interleave on the same key.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::TrustConfig;
use crate::trust::error::TrustError;
use crate::trust::events::TrustEvent;
use crate::trust::fingerprint::{self, Fingerprint, FingerprintStyle};
use crate::trust::history::HistoryEntry;
use crate::trust::record::{RecordKey, Scope, TrustRecord};
use crate::trust::store::TrustStore;
use crate::trust::verifier::{TrustContext, TrustVerifier};

#[derive(Clone)]
pub struct TrustManager {
    ctx: Arc<TrustContext>,
}

impl TrustManager {
    /// Standalone manager (no verifier in this process)
    pub fn new(store: Arc<dyn TrustStore>, config: &TrustConfig) -> Self {
        TrustVerifier::new(store, config).manager()
    }

    pub(crate) fn from_context(ctx: Arc<TrustContext>) -> Self {
        TrustManager { ctx }
    }

    pub async fn list(&self, scope: &Scope) -> Result<Vec<TrustRecord>, TrustError> {
        self.ctx.store.list(scope).await
    }

    /// Every non-empty scope with its records
    pub async fn list_all(&self) -> Result<Vec<(Scope, Vec<TrustRecord>)>, TrustError> {
        use futures::future::join_all;

        let scopes = self.ctx.store.scopes().await?;
        let loads = scopes.iter().map(|scope| self.ctx.store.list(scope));
        let results = join_all(loads).await;

        scopes
            .into_iter()
            .zip(results)
            .map(|(scope, records)| Ok((scope, records?)))
            .collect()
    }

    pub async fn get(&self, scope: &Scope, key: &RecordKey) -> Result<Option<TrustRecord>, TrustError> {
        self.ctx.store.get(scope, key).await
    }

    pub async fn scopes(&self) -> Result<Vec<Scope>, TrustError> {
        self.ctx.store.scopes().await
    }

    /// Remove one record. Removing a missing record succeeds and returns false.
    pub async fn remove(&self, scope: &Scope, key: &RecordKey) -> Result<bool, TrustError> {
        let _guard = self.ctx.locks.lock_key(scope, key).await;
        let removed = self.ctx.store.remove(scope, key).await?;
        if removed {
            info!("Removed trust record {} from {}", key, scope);
            self.ctx.events.publish(TrustEvent::RecordRemoved {
                scope: scope.clone(),
                key: key.clone(),
            });
        } else {
            debug!("No trust record {} in {} to remove", key, scope);
        }
        Ok(removed)
    }

    /// Remove every record of exactly `scope`. Pending confirmations issued
    /// against this scope are superseded.
    pub async fn clear(&self, scope: &Scope) -> Result<usize, TrustError> {
        let _gate = self.ctx.locks.exclusive(scope).await;
        let removed = self.ctx.store.clear(scope).await?;
        self.ctx.locks.bump_generation(scope);

        warn!("Cleared {} trust records from {}", removed, scope);
        self.ctx.events.publish(TrustEvent::ScopeCleared {
            scope: scope.clone(),
            removed,
        });
        Ok(removed)
    }

    /// Set or clear a record's nickname. Missing records are a no-op
    /// returning false.
    pub async fn rename(
        &self,
        scope: &Scope,
        key: &RecordKey,
        nickname: Option<&str>,
    ) -> Result<bool, TrustError> {
        let nickname = nickname
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        let _guard = self.ctx.locks.lock_key(scope, key).await;
        let Some(mut record) = self.ctx.store.get(scope, key).await? else {
            debug!("No trust record {} in {} to rename", key, scope);
            return Ok(false);
        };

        if record.nickname == nickname {
            return Ok(true);
        }
        record.nickname = nickname.clone();
        self.ctx.store.upsert(scope, record).await?;

        self.ctx.events.publish(TrustEvent::RecordRenamed {
            scope: scope.clone(),
            key: key.clone(),
            nickname,
        });
        Ok(true)
    }

    /// Pin `fingerprint` for `key` in `scope` as user-approved
    pub async fn approve(
        &self,
        scope: &Scope,
        key: &RecordKey,
        fingerprint: &Fingerprint,
    ) -> Result<TrustRecord, TrustError> {
        let _guard = self.ctx.locks.lock_key(scope, key).await;
        let now = Utc::now();

        let record = match self.ctx.store.get(scope, key).await? {
            Some(mut record) if record.matches(fingerprint) => {
                record.user_approved = true;
                self.ctx.store.upsert(scope, record.clone()).await?;
                self.ctx.events.publish(TrustEvent::RecordApproved {
                    scope: scope.clone(),
                    key: key.clone(),
                    fingerprint: fingerprint.clone(),
                });
                record
            }
            Some(mut record) => {
                let previous = record.fingerprint().clone();
                record.replace_fingerprint(fingerprint.clone(), now, self.ctx.history_cap);
                record.user_approved = true;
                self.ctx.store.upsert(scope, record.clone()).await?;
                self.ctx.events.publish(TrustEvent::FingerprintReplaced {
                    scope: scope.clone(),
                    key: key.clone(),
                    previous,
                    current: fingerprint.clone(),
                    user_approved: true,
                });
                record
            }
            None => {
                let mut record = TrustRecord::new(key, fingerprint.clone(), now);
                record.user_approved = true;
                self.ctx.store.upsert(scope, record.clone()).await?;
                self.ctx.events.publish(TrustEvent::RecordCreated {
                    scope: scope.clone(),
                    key: key.clone(),
                    fingerprint: fingerprint.clone(),
                    user_approved: true,
                });
                record
            }
        };

        info!("Approved {} for {} in {}", fingerprint, key, scope);
        Ok(record)
    }

    /// Superseded identities of a record, oldest first
    pub async fn history(&self, scope: &Scope, key: &RecordKey) -> Result<Vec<HistoryEntry>, TrustError> {
        match self.ctx.store.get(scope, key).await? {
            Some(record) => Ok(record.history.entries().to_vec()),
            None => Err(TrustError::RecordNotFound {
                kind: key.kind,
                host: key.host.clone(),
                port: key.port,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrustEvent> {
        self.ctx.events.subscribe()
    }

    pub fn format_fingerprint(&self, fingerprint: &Fingerprint, style: FingerprintStyle) -> String {
        fingerprint::format_fingerprint(fingerprint, style)
    }
}
