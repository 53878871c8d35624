//! Trust record data model
//!
//! A record remembers one identity for one `(kind, host, port)` endpoint
//! inside one scope. Records never merge across scopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::trust::error::TrustError;
use crate::trust::fingerprint::Fingerprint;
use crate::trust::history::History;

/// What kind of cryptographic identity a record holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    /// TLS server certificate
    Tls,
    /// SSH host key
    Ssh,
}

impl IdentityKind {
    pub const ALL: [IdentityKind; 2] = [IdentityKind::Tls, IdentityKind::Ssh];

    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKind::Tls => "tls",
            IdentityKind::Ssh => "ssh",
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentityKind {
    type Err = TrustError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tls" | "ssl" | "x509" => Ok(IdentityKind::Tls),
            "ssh" => Ok(IdentityKind::Ssh),
            other => Err(TrustError::invalid(format!("unknown identity kind '{other}'"))),
        }
    }
}

/// Partition a record belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "lowercase")]
pub enum Scope {
    Global,
    Connection(String),
}

impl Scope {
    pub fn connection(id: impl Into<String>) -> Self {
        Scope::Connection(id.into())
    }

    /// Connection scope when an id is given, global otherwise
    pub fn from_connection_id(connection_id: Option<&str>) -> Self {
        match connection_id {
            Some(id) => Scope::Connection(id.to_string()),
            None => Scope::Global,
        }
    }

    pub fn connection_id(&self) -> Option<&str> {
        match self {
            Scope::Global => None,
            Scope::Connection(id) => Some(id),
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Scope::Global)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => f.write_str("global"),
            Scope::Connection(id) => write!(f, "connection:{id}"),
        }
    }
}

/// Natural key of a record inside one scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub kind: IdentityKind,
    pub host: String,
    pub port: u16,
}

impl RecordKey {
    /// Build a key, normalizing the host. Empty hosts and port 0 are invalid.
    pub fn new(kind: IdentityKind, host: &str, port: u16) -> Result<Self, TrustError> {
        if port == 0 {
            return Err(TrustError::invalid("port must be between 1 and 65535"));
        }
        Ok(RecordKey {
            kind,
            host: normalize_host(host)?,
            port,
        })
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{} [{}]:{}", self.kind, self.host, self.port)
        } else {
            write!(f, "{} {}:{}", self.kind, self.host, self.port)
        }
    }
}

/// Record key qualified by its scope. Unit of mutual exclusion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopedKey {
    pub scope: Scope,
    pub key: RecordKey,
}

impl ScopedKey {
    pub fn new(scope: Scope, key: RecordKey) -> Self {
        ScopedKey { scope, key }
    }
}

/// Lowercase, trim, strip a trailing dot and IPv6 brackets
pub fn normalize_host(host: &str) -> Result<String, TrustError> {
    let mut host = host.trim();
    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        host = inner;
    }
    let host = host.strip_suffix('.').unwrap_or(host);

    if host.is_empty() {
        return Err(TrustError::invalid("host must not be empty"));
    }
    if host.chars().any(|c| c.is_whitespace() || c == '/' || c == '@') {
        return Err(TrustError::invalid(format!("malformed host '{host}'")));
    }

    Ok(host.to_ascii_lowercase())
}

/// Current identity of a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub fingerprint: Fingerprint,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// One remembered identity decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub kind: IdentityKind,
    pub host: String,
    pub port: u16,
    pub identity: Identity,
    #[serde(default)]
    pub history: History,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default)]
    pub user_approved: bool,
}

impl TrustRecord {
    /// First sighting: `first_seen == last_seen`
    pub fn new(key: &RecordKey, fingerprint: Fingerprint, now: DateTime<Utc>) -> Self {
        TrustRecord {
            kind: key.kind,
            host: key.host.clone(),
            port: key.port,
            identity: Identity {
                fingerprint,
                first_seen: now,
                last_seen: now,
            },
            history: History::default(),
            nickname: None,
            user_approved: false,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            kind: self.kind,
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.identity.fingerprint
    }

    pub fn matches(&self, observed: &Fingerprint) -> bool {
        &self.identity.fingerprint == observed
    }

    /// Bump `last_seen` without touching the fingerprint
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.identity.last_seen = now;
    }

    /// Replace the fingerprint, pushing the previous one into history.
    /// A replacement with the same fingerprint only bumps `last_seen`.
    pub fn replace_fingerprint(&mut self, new: Fingerprint, now: DateTime<Utc>, history_cap: usize) {
        if self.identity.fingerprint == new {
            self.touch(now);
            return;
        }
        let old = std::mem::replace(&mut self.identity.fingerprint, new);
        self.history.record_replacement(old, now, history_cap);
        self.identity.first_seen = now;
        self.identity.last_seen = now;
    }
}
