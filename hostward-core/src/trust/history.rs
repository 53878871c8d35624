//! Superseded identity log
//!
//! Entries are only appended when a record's fingerprint is replaced. The log
//! is capped; the oldest entry goes first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::trust::fingerprint::Fingerprint;

/// Default number of superseded identities kept per record
pub const DEFAULT_HISTORY_CAP: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub fingerprint: Fingerprint,
    pub replaced_at: DateTime<Utc>,
}

/// Append-only, size-capped history of a record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub(crate) fn record_replacement(
        &mut self,
        old: Fingerprint,
        replaced_at: DateTime<Utc>,
        cap: usize,
    ) {
        self.entries.push(HistoryEntry {
            fingerprint: old,
            replaced_at,
        });
        self.enforce_cap(cap);
    }

    /// Drop oldest entries until at most `cap` remain (never below one)
    pub(crate) fn enforce_cap(&mut self, cap: usize) {
        let cap = cap.max(1);
        if self.entries.len() > cap {
            let excess = self.entries.len() - cap;
            self.entries.drain(..excess);
        }
    }

    /// Oldest first
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether this fingerprint was ever replaced on the record
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.iter().any(|e| &e.fingerprint == fingerprint)
    }
}
