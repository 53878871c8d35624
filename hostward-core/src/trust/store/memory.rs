//! In-memory trust store for tests and embedders that persist elsewhere

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

use super::{ScopeRecords, TrustStore};
use crate::trust::error::TrustError;
use crate::trust::record::{RecordKey, Scope, TrustRecord};

/// Volatile store. Writes can be made to fail on demand.
#[derive(Default)]
pub struct MemoryTrustStore {
    scopes: RwLock<HashMap<Scope, ScopeRecords>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent mutation fail with [`TrustError::StoreIo`]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful mutations so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_writable(&self, scope: &Scope) -> Result<(), TrustError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TrustError::StoreIo {
                path: PathBuf::from(format!("memory://{scope}")),
                source: std::io::Error::other("writes disabled"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TrustStore for MemoryTrustStore {
    async fn get(&self, scope: &Scope, key: &RecordKey) -> Result<Option<TrustRecord>, TrustError> {
        let scopes = self.scopes.read().await;
        Ok(scopes.get(scope).and_then(|records| records.get(key)).cloned())
    }

    async fn upsert(&self, scope: &Scope, record: TrustRecord) -> Result<(), TrustError> {
        self.check_writable(scope)?;
        let mut scopes = self.scopes.write().await;
        scopes
            .entry(scope.clone())
            .or_default()
            .insert(record.key(), record);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, scope: &Scope, key: &RecordKey) -> Result<bool, TrustError> {
        self.check_writable(scope)?;
        let mut scopes = self.scopes.write().await;
        let removed = scopes
            .get_mut(scope)
            .map(|records| records.remove(key).is_some())
            .unwrap_or(false);
        if removed {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    async fn clear(&self, scope: &Scope) -> Result<usize, TrustError> {
        self.check_writable(scope)?;
        let mut scopes = self.scopes.write().await;
        let count = scopes.remove(scope).map(|records| records.len()).unwrap_or(0);
        if count > 0 {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(count)
    }

    async fn list(&self, scope: &Scope) -> Result<Vec<TrustRecord>, TrustError> {
        let scopes = self.scopes.read().await;
        Ok(scopes
            .get(scope)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn scopes(&self) -> Result<Vec<Scope>, TrustError> {
        let scopes = self.scopes.read().await;
        let mut result: Vec<Scope> = scopes
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(scope, _)| scope.clone())
            .collect();
        result.sort();
        Ok(result)
    }
}
