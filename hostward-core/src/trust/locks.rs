//! Per-key and per-scope synchronization
//!
//! Lock order is fixed: connection gate, global gate, connection key,
//! global key. Key mutexes are dropped from the registry once idle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::trust::record::{RecordKey, Scope, ScopedKey};

#[derive(Default)]
struct ScopeControl {
    gate: Arc<RwLock<()>>,
    generation: AtomicU64,
}

/// Registry of key mutexes, scope gates and scope generations
#[derive(Default)]
pub(crate) struct LockRegistry {
    keys: Mutex<HashMap<ScopedKey, Weak<tokio::sync::Mutex<()>>>>,
    scopes: Mutex<HashMap<Scope, Arc<ScopeControl>>>,
}

/// Guards held by one mutation across its scopes. Released on drop.
pub(crate) struct MutationGuard {
    _keys: Vec<OwnedMutexGuard<()>>,
    _gates: Vec<OwnedRwLockReadGuard<()>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn scope_control(&self, scope: &Scope) -> Arc<ScopeControl> {
        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
        scopes.entry(scope.clone()).or_default().clone()
    }

    fn key_mutex(&self, key: &ScopedKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = keys.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        keys.retain(|_, weak| weak.strong_count() > 0);
        let mutex = Arc::new(tokio::sync::Mutex::new(()));
        keys.insert(key.clone(), Arc::downgrade(&mutex));
        mutex
    }

    /// Current generation of a scope; bumped by every clear
    pub fn generation(&self, scope: &Scope) -> u64 {
        self.scope_control(scope).generation.load(Ordering::SeqCst)
    }

    pub fn bump_generation(&self, scope: &Scope) -> u64 {
        self.scope_control(scope)
            .generation
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    /// Take the scope gate exclusively (used by clear)
    pub async fn exclusive(&self, scope: &Scope) -> OwnedRwLockWriteGuard<()> {
        self.scope_control(scope).gate.clone().write_owned().await
    }

    /// Lock the key in every listed scope, taking each scope gate shared
    /// first. Scopes must be given connection first, global last.
    pub async fn lock_keys(&self, scopes: &[Scope], key: &RecordKey) -> MutationGuard {
        let mut gates = Vec::with_capacity(scopes.len());
        for scope in scopes {
            gates.push(self.scope_control(scope).gate.clone().read_owned().await);
        }

        let mut keys = Vec::with_capacity(scopes.len());
        for scope in scopes {
            let mutex = self.key_mutex(&ScopedKey::new(scope.clone(), key.clone()));
            keys.push(mutex.lock_owned().await);
        }

        MutationGuard {
            _keys: keys,
            _gates: gates,
        }
    }

    /// Lock a single key in a single scope
    pub async fn lock_key(&self, scope: &Scope, key: &RecordKey) -> MutationGuard {
        self.lock_keys(std::slice::from_ref(scope), key).await
    }

    #[cfg(test)]
    fn live_keys(&self) -> usize {
        let keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.values().filter(|weak| weak.strong_count() > 0).count()
    }
}

/// Scopes consulted by a verification, in lock order
pub(crate) fn lookup_scopes(connection_id: Option<&str>) -> Vec<Scope> {
    match connection_id {
        Some(id) => vec![Scope::connection(id), Scope::Global],
        None => vec![Scope::Global],
    }
}
