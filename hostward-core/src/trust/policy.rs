//! Trust policies and the evaluator state machine
//!
//! ```text
//! Start -> Lookup -> {NoRecord, Match, Mismatch} -> Decision -> {Accepted, Rejected, PendingUser}
//! ```
//!
//! Lookup resolution and evaluation are separate, explicit steps:
//! [`resolve_lookup`] consults the connection scope and then the global
//! scope; [`evaluate`] is a pure function of the effective policy and the
//! lookup result.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::trust::error::TrustError;
use crate::trust::fingerprint::Fingerprint;
use crate::trust::record::{IdentityKind, RecordKey, Scope, TrustRecord};
use crate::trust::store::TrustStore;

/// How unknown and changed identities are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Policy {
    /// Trust on first use, ask on change
    #[default]
    Tofu,
    /// Ask for every connection
    AlwaysAsk,
    /// Accept everything, but keep the audit trail
    AlwaysTrust,
    /// Only pre-approved identities are accepted
    Strict,
}

impl Policy {
    /// Parse a policy name. Missing or unrecognized names fall back to
    /// [`Policy::Tofu`].
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "tofu" | "trust_on_first_use" => Policy::Tofu,
            "always_ask" | "alwaysask" | "ask" => Policy::AlwaysAsk,
            "always_trust" | "alwaystrust" | "trust" => Policy::AlwaysTrust,
            "strict" => Policy::Strict,
            other => {
                warn!("Unrecognized trust policy '{}', falling back to tofu", other);
                Policy::Tofu
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Tofu => "tofu",
            Policy::AlwaysAsk => "always_ask",
            Policy::AlwaysTrust => "always_trust",
            Policy::Strict => "strict",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Policy {
    fn from(value: String) -> Self {
        Policy::parse(&value)
    }
}

impl From<Policy> for String {
    fn from(policy: Policy) -> Self {
        policy.as_str().to_string()
    }
}

/// Global default policy per identity kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KindPolicies {
    #[serde(default)]
    pub tls: Policy,
    #[serde(default)]
    pub ssh: Policy,
}

impl KindPolicies {
    pub fn get(&self, kind: IdentityKind) -> Policy {
        match kind {
            IdentityKind::Tls => self.tls,
            IdentityKind::Ssh => self.ssh,
        }
    }
}

/// Optional per-connection overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KindOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<Policy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<Policy>,
}

impl KindOverrides {
    pub fn get(&self, kind: IdentityKind) -> Option<Policy> {
        match kind {
            IdentityKind::Tls => self.tls,
            IdentityKind::Ssh => self.ssh,
        }
    }
}

/// All configured policies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyTable {
    #[serde(default)]
    pub defaults: KindPolicies,
    #[serde(default)]
    pub connections: BTreeMap<String, KindOverrides>,
}

impl PolicyTable {
    /// Same policy for every kind, no overrides
    pub fn uniform(policy: Policy) -> Self {
        PolicyTable {
            defaults: KindPolicies {
                tls: policy,
                ssh: policy,
            },
            connections: BTreeMap::new(),
        }
    }

    /// Per-connection override, else the global default
    pub fn effective(&self, connection_id: Option<&str>, kind: IdentityKind) -> Policy {
        connection_id
            .and_then(|id| self.connections.get(id))
            .and_then(|overrides| overrides.get(kind))
            .unwrap_or_else(|| self.defaults.get(kind))
    }

    pub fn set_override(&mut self, connection_id: &str, kind: IdentityKind, policy: Policy) {
        let entry = self.connections.entry(connection_id.to_string()).or_default();
        match kind {
            IdentityKind::Tls => entry.tls = Some(policy),
            IdentityKind::Ssh => entry.ssh = Some(policy),
        }
    }
}

/// Result of the two-tier lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Neither scope holds a record for the key
    NoRecord,
    /// A record exists and its fingerprint equals the observed one
    Match { scope: Scope, record: TrustRecord },
    /// A record exists with a different fingerprint
    Mismatch { scope: Scope, record: TrustRecord },
}

impl Lookup {
    pub fn record(&self) -> Option<&TrustRecord> {
        match self {
            Lookup::NoRecord => None,
            Lookup::Match { record, .. } | Lookup::Mismatch { record, .. } => Some(record),
        }
    }

    pub fn scope(&self) -> Option<&Scope> {
        match self {
            Lookup::NoRecord => None,
            Lookup::Match { scope, .. } | Lookup::Mismatch { scope, .. } => Some(scope),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Lookup::NoRecord => "no_record",
            Lookup::Match { .. } => "match",
            Lookup::Mismatch { .. } => "mismatch",
        }
    }
}

/// Consult the connection-scoped record first, then the global one
pub async fn resolve_lookup(
    store: &dyn TrustStore,
    connection_id: Option<&str>,
    key: &RecordKey,
    observed: &Fingerprint,
) -> Result<Lookup, TrustError> {
    let mut tiers = Vec::with_capacity(2);
    if let Some(id) = connection_id {
        tiers.push(Scope::connection(id));
    }
    tiers.push(Scope::Global);

    for scope in tiers {
        if let Some(record) = store.get(&scope, key).await? {
            debug!("Lookup for {} resolved in scope {}", key, scope);
            return Ok(if record.matches(observed) {
                Lookup::Match { scope, record }
            } else {
                Lookup::Mismatch { scope, record }
            });
        }
    }

    debug!("Lookup for {} found no record", key);
    Ok(Lookup::NoRecord)
}

/// What the evaluator decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Persist a new record, then accept
    CreateAndAccept,
    /// Bump `last_seen` on the matching record, then accept
    Accept,
    /// Replace the stored fingerprint (history appended), then accept
    ReplaceAndAccept,
    /// Suspend and ask the user
    AskUser,
    /// Refuse without changing the store
    Reject,
}

/// Pure transition function of the evaluator
pub fn evaluate(policy: Policy, lookup: &Lookup) -> Decision {
    match (policy, lookup) {
        (Policy::Tofu, Lookup::NoRecord) => Decision::CreateAndAccept,
        (Policy::Tofu, Lookup::Match { .. }) => Decision::Accept,
        (Policy::Tofu, Lookup::Mismatch { .. }) => Decision::AskUser,

        (Policy::AlwaysAsk, _) => Decision::AskUser,

        (Policy::AlwaysTrust, Lookup::NoRecord) => Decision::CreateAndAccept,
        (Policy::AlwaysTrust, Lookup::Match { .. }) => Decision::Accept,
        (Policy::AlwaysTrust, Lookup::Mismatch { .. }) => Decision::ReplaceAndAccept,

        (Policy::Strict, Lookup::Match { record, .. }) if record.user_approved => Decision::Accept,
        (Policy::Strict, _) => Decision::Reject,
    }
}
