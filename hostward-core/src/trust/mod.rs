//! Hostward Trust System - identity verification for remote connections
//!
//! Remembers which TLS certificate or SSH host key each endpoint presented
//! and decides, per policy, whether a newly observed identity is accepted,
//! rejected or needs the user's confirmation.
//!
//! Design Principles:
//! - Explicit store handle, injected into both verifier and manager
//! - Two-tier lookup: connection scope first, then global
//! - Fail closed: malformed identities and store failures never accept
//! - Durable before accepted: nothing is reported trusted before it is stored

pub mod error;
pub mod events;
pub mod fingerprint;
pub mod hasher;
pub mod history;
mod locks;
pub mod manager;
mod pending;
pub mod policy;
pub mod record;
pub mod store;
pub mod verifier;

pub use error::TrustError;
pub use events::TrustEvent;
pub use fingerprint::{
    decode_material, fingerprint_material, format_fingerprint, Fingerprint, FingerprintStyle,
};
pub use history::{History, HistoryEntry};
pub use manager::TrustManager;
pub use pending::PendingVerification;
pub use policy::{Policy, PolicyTable};
pub use record::{IdentityKind, RecordKey, Scope, TrustRecord};
pub use store::{FileTrustStore, MemoryTrustStore, TrustStore};
pub use verifier::{AcceptedIdentity, RejectReason, Rejection, TrustVerifier, VerificationOutcome, Verdict};

/// Store document format version
pub const STORE_VERSION: u32 = 1;
