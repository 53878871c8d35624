//! Test helpers shared by the integration tests

#![allow(dead_code)]

use hostward_core::trust::{FileTrustStore, IdentityKind, RecordKey};
use std::sync::Once;
use tempfile::TempDir;

/// Initialize logging for tests (only once per test run)
static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_level(true),
            )
            .with(tracing_subscriber::filter::EnvFilter::from_default_env())
            .try_init();
    });
}

pub const FP_A: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const FP_B: &str = "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

/// File store in a fresh temporary directory
pub fn temp_store() -> (TempDir, FileTrustStore) {
    let dir = TempDir::new().expect("create temp dir");
    let store = FileTrustStore::open(dir.path().join("trust")).expect("open store");
    (dir, store)
}

pub fn ssh_key(host: &str) -> RecordKey {
    RecordKey::new(IdentityKind::Ssh, host, 22).expect("valid key")
}
