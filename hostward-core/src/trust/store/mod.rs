//! Trust record store
//!
//! The store is a plain keyed container partitioned by [`Scope`]. It never
//! resolves across scopes and never decides trust; that is the job of
//! [`crate::trust::policy`]. Every mutation returns only after the change is
//! durable.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::trust::error::TrustError;
use crate::trust::record::{RecordKey, Scope, TrustRecord};

pub use file::FileTrustStore;
pub use memory::MemoryTrustStore;

/// Durable, keyed storage of trust records
#[async_trait]
pub trait TrustStore: Send + Sync {
    /// Fetch one record from exactly `scope`
    async fn get(&self, scope: &Scope, key: &RecordKey) -> Result<Option<TrustRecord>, TrustError>;

    /// Atomically create or replace the record under its natural key
    async fn upsert(&self, scope: &Scope, record: TrustRecord) -> Result<(), TrustError>;

    /// Remove a record. Missing records are not an error; returns whether
    /// anything was removed.
    async fn remove(&self, scope: &Scope, key: &RecordKey) -> Result<bool, TrustError>;

    /// Remove every record in exactly `scope`. Returns how many were removed.
    async fn clear(&self, scope: &Scope) -> Result<usize, TrustError>;

    /// All records of `scope`, ordered by key
    async fn list(&self, scope: &Scope) -> Result<Vec<TrustRecord>, TrustError>;

    /// Every scope currently holding at least one record
    async fn scopes(&self) -> Result<Vec<Scope>, TrustError>;
}

/// Records of one scope, ordered by key
pub(crate) type ScopeRecords = BTreeMap<RecordKey, TrustRecord>;

/// On-disk form of one scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeDocument {
    /// Document format version
    pub version: u32,

    /// Scope this document holds
    pub scope: Scope,

    /// When this document was last written
    pub updated_at: DateTime<Utc>,

    /// Records ordered by key
    pub records: Vec<TrustRecord>,
}

impl ScopeDocument {
    pub(crate) fn from_records(scope: &Scope, records: &ScopeRecords) -> Self {
        ScopeDocument {
            version: crate::trust::STORE_VERSION,
            scope: scope.clone(),
            updated_at: Utc::now(),
            records: records.values().cloned().collect(),
        }
    }

    pub(crate) fn into_records(self) -> ScopeRecords {
        self.records
            .into_iter()
            .map(|record| (record.key(), record))
            .collect()
    }
}
