//! Cryptographic hashing utilities for the trust system
//!
//! Uses SHA-256 for identity fingerprints and HMAC-SHA256 to seal store
//! documents against out-of-band edits.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

const SEAL_PREFIX: &str = "hmac-sha256:";

/// SHA-256 digest of arbitrary bytes
pub fn sha256_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Derive the sealing key for a store rooted at `store_root`
///
/// The key is unique per machine, user and store location without requiring
/// external key management. Moving a store to another machine invalidates
/// its seals.
pub fn derive_store_key(store_root: &Path) -> [u8; 32] {
    let mut hasher = Sha256::new();

    hasher.update(b"HOSTWARD_TRUST_STORE_V1");

    // Fixed inputs so sealed fixtures are reproducible in tests
    #[cfg(feature = "deterministic-tests")]
    {
        let _ = store_root;
        hasher.update(b"TEST_MODE_FIXED_STORE");
        hasher.update(b"TEST_MODE_ENTROPY");
    }

    #[cfg(not(feature = "deterministic-tests"))]
    {
        #[cfg(target_os = "linux")]
        {
            if let Ok(machine_id) = std::fs::read_to_string("/etc/machine-id") {
                hasher.update(machine_id.trim().as_bytes());
            }
        }

        #[cfg(target_os = "macos")]
        {
            if let Ok(output) = std::process::Command::new("ioreg")
                .args(["-rd1", "-c", "IOPlatformExpertDevice"])
                .output()
            {
                hasher.update(&output.stdout);
            }
        }

        if let Ok(username) = std::env::var("USER").or_else(|_| std::env::var("USERNAME")) {
            hasher.update(username.as_bytes());
        }

        hasher.update(store_root.to_string_lossy().as_bytes());
    }

    hasher.finalize().into()
}

/// Compute the seal for a store document
pub fn compute_seal(message: &[u8], key: &[u8; 32]) -> String {
    // HMAC accepts keys of any length
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).unwrap_or_else(|_| unreachable!());
    mac.update(message);
    format!("{SEAL_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a seal in constant time. Malformed seals never verify.
pub fn verify_seal(message: &[u8], seal: &str, key: &[u8; 32]) -> bool {
    let hex_seal = seal.strip_prefix(SEAL_PREFIX).unwrap_or(seal);
    let Ok(seal_bytes) = hex::decode(hex_seal) else {
        return false;
    };
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(&seal_bytes).is_ok()
}
