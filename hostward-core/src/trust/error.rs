//! Trust system error types with clear, actionable messages

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::trust::policy::Policy;
use crate::trust::record::{IdentityKind, Scope};

/// Trust system specific errors
#[derive(Error, Debug)]
pub enum TrustError {
    /// Observed identity could not be normalized into a fingerprint
    #[error("Invalid identity: {reason}")]
    InvalidIdentity { reason: String },

    /// No record exists for the requested key
    #[error("No trust record for {kind} {host}:{port}")]
    RecordNotFound {
        kind: IdentityKind,
        host: String,
        port: u16,
    },

    /// `confirm` was called with a request id that was never issued
    #[error("Unknown confirmation request: {request_id}")]
    UnknownRequest { request_id: Uuid },

    /// Policy refused the identity without asking the user
    #[error("{kind} identity for {host}:{port} rejected by {policy} policy.\n\nThe host has no pre-approved identity matching the one it presented.\n\nTo pre-approve it, run:\n  hostward approve --kind {kind} --host {host} --port {port} --fingerprint <FINGERPRINT>")]
    PolicyRejected {
        kind: IdentityKind,
        host: String,
        port: u16,
        policy: Policy,
    },

    /// User declined the identity
    #[error("{kind} identity for {host}:{port} was rejected by the user")]
    UserRejected {
        kind: IdentityKind,
        host: String,
        port: u16,
    },

    /// Nobody answered the confirmation request in time
    #[error("Confirmation request {request_id} timed out after {}s", .timeout.as_secs())]
    ConfirmationTimeout { request_id: Uuid, timeout: Duration },

    /// The stored record changed while a confirmation was pending
    #[error("Trust record for {kind} {host}:{port} changed while awaiting confirmation; verify again")]
    Superseded {
        kind: IdentityKind,
        host: String,
        port: u16,
    },

    /// Failed to read or write the trust store
    #[error("Trust store I/O failure at {path}")]
    StoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse a trust store document
    #[error("Failed to parse trust store document {path} (corrupted or invalid format)")]
    StoreParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Store document seal did not verify
    #[error("SECURITY ALERT: Trust store document has been tampered with!\n\nScope: {scope}\nDocument: {path}\n\nThe document's HMAC seal verification failed. Every host in this scope is\nrejected until the scope is reviewed.\n\nRecommended actions:\n1. Check for unauthorized access to your system\n2. Review recent changes to {path}\n3. Reset the scope with: {reset}", reset = clear_command(.scope))]
    StoreTampered { path: PathBuf, scope: Scope },

    /// Failed to read the configuration file
    #[error("Failed to read configuration from {path}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse the configuration file
    #[error("Failed to parse configuration {path}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },
}

impl TrustError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        TrustError::InvalidIdentity {
            reason: reason.into(),
        }
    }

    /// True for outcomes a user or policy decided. Connection code treats
    /// these identically and aborts the handshake.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            TrustError::PolicyRejected { .. }
                | TrustError::UserRejected { .. }
                | TrustError::ConfirmationTimeout { .. }
                | TrustError::Superseded { .. }
        )
    }

    /// True for persistence failures, which operators diagnose separately
    /// from trust problems.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            TrustError::StoreIo { .. } | TrustError::StoreParse { .. } | TrustError::StoreTampered { .. }
        )
    }
}

/// CLI invocation that resets `scope`
fn clear_command(scope: &Scope) -> String {
    match scope.connection_id() {
        Some(id) => format!("hostward clear --connection {id} --force"),
        None => "hostward clear --force".to_string(),
    }
}

/// Log security-critical trust errors
impl TrustError {
    pub fn log_if_security_critical(&self) {
        match self {
            TrustError::StoreTampered { .. } | TrustError::PolicyRejected { .. } => {
                tracing::error!(target: "security", "TRUST VIOLATION: {}", self);
            }
            _ => {}
        }
    }
}
