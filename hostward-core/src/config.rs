//! Trust configuration
//!
//! ## Configuration Sources (in precedence order)
//!
//! 1. An explicit path (`--config`)
//! 2. `$HOSTWARD_HOME/config.yml`
//! 3. `<platform config dir>/hostward/config.yml`
//! 4. Built-in defaults
//!
//! ```yaml
//! policies:
//!   tls: tofu          # tofu | always_ask | always_trust | strict
//!   ssh: strict
//! connections:
//!   prod-db:
//!     ssh: always_ask
//! history_cap: 10
//! confirmation_timeout_seconds: 120
//! store:
//!   write_retries: 3
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::trust::error::TrustError;
use crate::trust::history::DEFAULT_HISTORY_CAP;
use crate::trust::policy::{KindOverrides, KindPolicies, PolicyTable};
use crate::trust::store::file::DEFAULT_WRITE_RETRIES;

/// Environment variable pointing at a self-contained hostward home
pub const HOME_ENV: &str = "HOSTWARD_HOME";

const CONFIG_FILE: &str = "config.yml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Default policy per identity kind
    #[serde(default)]
    pub policies: KindPolicies,

    /// Per-connection policy overrides
    #[serde(default)]
    pub connections: BTreeMap<String, KindOverrides>,

    /// Superseded identities kept per record (minimum 1)
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,

    /// How long a pending confirmation waits before it is rejected
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_seconds: u64,

    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            policies: KindPolicies::default(),
            connections: BTreeMap::new(),
            history_cap: default_history_cap(),
            confirmation_timeout_seconds: default_confirmation_timeout(),
            store: StoreConfig::default(),
        }
    }
}

/// Store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Retries for a failed durable write before it is surfaced
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            write_retries: default_write_retries(),
        }
    }
}

fn default_history_cap() -> usize {
    DEFAULT_HISTORY_CAP
}

fn default_confirmation_timeout() -> u64 {
    120
}

fn default_write_retries() -> u32 {
    DEFAULT_WRITE_RETRIES
}

impl TrustConfig {
    /// Parse a configuration file
    pub fn load(path: &Path) -> Result<Self, TrustError> {
        let content = std::fs::read_to_string(path).map_err(|source| TrustError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&content).map_err(|source| TrustError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded trust configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml_ng::Error> {
        // An empty file is an empty mapping
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut config: TrustConfig = serde_yaml_ng::from_str(content)?;
        if config.history_cap == 0 {
            warn!("history_cap must be at least 1, using 1");
            config.history_cap = 1;
        }
        Ok(config)
    }

    /// Load from the first configuration source that exists
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path)
                .with_context(|| format!("Failed to load configuration {}", path.display()));
        }

        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path)
                .with_context(|| format!("Failed to load configuration {}", path.display())),
            Some(path) => {
                debug!("No configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            None => {
                debug!("No configuration directory available, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Effective policy table (defaults plus overrides)
    pub fn policy_table(&self) -> PolicyTable {
        PolicyTable {
            defaults: self.policies,
            connections: self.connections.clone(),
        }
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_seconds)
    }

    pub fn effective_history_cap(&self) -> usize {
        self.history_cap.max(1)
    }
}

/// `$HOSTWARD_HOME` when set and non-empty
fn hostward_home() -> Option<PathBuf> {
    std::env::var_os(HOME_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Where the configuration file is looked up when no path is given
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(home) = hostward_home() {
        return Some(home.join(CONFIG_FILE));
    }
    directories::ProjectDirs::from("", "", "hostward")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
        .or_else(|| dirs::config_dir().map(|dir| dir.join("hostward").join(CONFIG_FILE)))
}

/// Default trust store directory
pub fn default_store_dir() -> Result<PathBuf> {
    if let Some(home) = hostward_home() {
        return Ok(home.join("trust"));
    }
    directories::ProjectDirs::from("", "", "hostward")
        .map(|dirs| dirs.data_dir().join("trust"))
        .or_else(|| dirs::data_dir().map(|dir| dir.join("hostward").join("trust")))
        .context("Could not determine data directory for the trust store")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::policy::Policy;
    use crate::trust::record::IdentityKind;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = TrustConfig::from_yaml("policies:\n  ssh: strict\n").unwrap();
        assert_eq!(config.policies.ssh, Policy::Strict);
        assert_eq!(config.policies.tls, Policy::Tofu);
        assert_eq!(config.history_cap, 10);
        assert_eq!(config.confirmation_timeout(), Duration::from_secs(120));
        assert_eq!(config.store.write_retries, 3);
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(TrustConfig::from_yaml("").unwrap(), TrustConfig::default());
    }

    #[test]
    fn test_connection_overrides_reach_policy_table() {
        let yaml = r#"
policies:
  tls: always_trust
connections:
  prod-db:
    ssh: always_ask
"#;
        let table = TrustConfig::from_yaml(yaml).unwrap().policy_table();
        assert_eq!(table.effective(Some("prod-db"), IdentityKind::Ssh), Policy::AlwaysAsk);
        assert_eq!(table.effective(Some("prod-db"), IdentityKind::Tls), Policy::AlwaysTrust);
        assert_eq!(table.effective(None, IdentityKind::Ssh), Policy::Tofu);
    }

    #[test]
    fn test_zero_history_cap_is_raised() {
        let config = TrustConfig::from_yaml("history_cap: 0\n").unwrap();
        assert_eq!(config.history_cap, 1);
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "history_cap: [not, a, number]\n").unwrap();

        let err = TrustConfig::load(&path).unwrap_err();
        assert!(matches!(err, TrustError::ConfigParse { .. }));
    }

    #[test]
    #[serial(home_env)]
    fn test_discover_uses_hostward_home() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.yml"),
            "confirmation_timeout_seconds: 5\n",
        )
        .unwrap();

        std::env::set_var(HOME_ENV, dir.path());
        let config = TrustConfig::discover(None);
        let store_dir = default_store_dir();
        std::env::remove_var(HOME_ENV);

        assert_eq!(config.unwrap().confirmation_timeout_seconds, 5);
        assert_eq!(store_dir.unwrap(), dir.path().join("trust"));
    }

    #[test]
    #[serial(home_env)]
    fn test_discover_without_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        std::env::set_var(HOME_ENV, dir.path());
        let config = TrustConfig::discover(None);
        std::env::remove_var(HOME_ENV);

        assert_eq!(config.unwrap(), TrustConfig::default());
    }
}
