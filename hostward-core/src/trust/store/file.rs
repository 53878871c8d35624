//! File-backed trust store
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/
//! ├── global.json
//! └── connections/
//!     └── <sanitized-id>-<hash>.json
//! ```
//!
//! Each document is pretty JSON followed by an HMAC trailer
//! (`/* HMAC: hmac-sha256:... */`). Documents are written to a temporary
//! file, fsynced and renamed into place. A scope with no records has no file.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{ScopeDocument, ScopeRecords, TrustStore};
use crate::trust::error::TrustError;
use crate::trust::hasher::{compute_seal, derive_store_key, sha256_digest, verify_seal};
use crate::trust::record::{RecordKey, Scope, TrustRecord};

/// Default number of retries for a failed durable write
pub const DEFAULT_WRITE_RETRIES: u32 = 3;

const RETRY_BACKOFF: Duration = Duration::from_millis(50);
const SEAL_OPEN: &str = "/* HMAC: ";
const SEAL_CLOSE: &str = " */";

/// Cached contents of one scope; `None` until first loaded
#[derive(Default)]
struct ScopeSlot {
    records: Option<ScopeRecords>,
}

/// Trust store persisting one sealed JSON document per scope
pub struct FileTrustStore {
    root: PathBuf,
    seal_key: [u8; 32],
    write_retries: u32,
    slots: Mutex<HashMap<Scope, Arc<RwLock<ScopeSlot>>>>,
}

impl FileTrustStore {
    /// Open (or create) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, TrustError> {
        let root = root.into();
        let connections = root.join("connections");
        std::fs::create_dir_all(&connections).map_err(|source| TrustError::StoreIo {
            path: connections.clone(),
            source,
        })?;

        info!("Opened trust store at {}", root.display());
        Ok(FileTrustStore {
            seal_key: derive_store_key(&root),
            root,
            write_retries: DEFAULT_WRITE_RETRIES,
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Override how many times a failed write is retried before surfacing
    pub fn with_write_retries(mut self, retries: u32) -> Self {
        self.write_retries = retries;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Document path for a scope
    pub fn scope_path(&self, scope: &Scope) -> PathBuf {
        match scope {
            Scope::Global => self.root.join("global.json"),
            Scope::Connection(id) => self
                .root
                .join("connections")
                .join(format!("{}.json", connection_file_stem(id))),
        }
    }

    /// Drop cached scopes so the next access re-reads from disk
    pub fn reload(&self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!("Trust store cache dropped");
    }

    fn slot(&self, scope: &Scope) -> Arc<RwLock<ScopeSlot>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(scope.clone()).or_default().clone()
    }

    async fn read<R>(
        &self,
        scope: &Scope,
        f: impl FnOnce(&ScopeRecords) -> R,
    ) -> Result<R, TrustError> {
        let slot = self.slot(scope);
        {
            let guard = slot.read().await;
            if let Some(records) = guard.records.as_ref() {
                return Ok(f(records));
            }
        }

        let mut guard = slot.write().await;
        if guard.records.is_none() {
            guard.records = Some(self.load_scope(scope).await?);
        }
        match guard.records.as_ref() {
            Some(records) => Ok(f(records)),
            None => Ok(f(&ScopeRecords::new())),
        }
    }

    /// Apply `f` to a copy of the scope; persist and commit only if it
    /// reports a change. On a failed write the cache keeps the old contents.
    async fn mutate<R>(
        &self,
        scope: &Scope,
        f: impl FnOnce(&mut ScopeRecords) -> (bool, R),
    ) -> Result<R, TrustError> {
        let slot = self.slot(scope);
        let mut guard = slot.write().await;

        let mut records = match guard.records.take() {
            Some(records) => records,
            None => self.load_scope(scope).await?,
        };
        let original = records.clone();

        let (changed, result) = f(&mut records);
        if !changed {
            guard.records = Some(original);
            return Ok(result);
        }

        match self.persist(scope, &records).await {
            Ok(()) => {
                guard.records = Some(records);
                Ok(result)
            }
            Err(e) => {
                guard.records = Some(original);
                Err(e)
            }
        }
    }

    async fn load_scope(&self, scope: &Scope) -> Result<ScopeRecords, TrustError> {
        let path = self.scope_path(scope);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No document for scope {} yet", scope);
                return Ok(ScopeRecords::new());
            }
            Err(source) => return Err(TrustError::StoreIo { path, source }),
        };

        let document = self.parse_document(scope, &path, &content)?;
        if &document.scope != scope {
            let err = TrustError::StoreTampered {
                path,
                scope: scope.clone(),
            };
            err.log_if_security_critical();
            return Err(err);
        }
        if document.version > crate::trust::STORE_VERSION {
            warn!(
                "Trust store document {} has newer format version {} (supported: {})",
                path.display(),
                document.version,
                crate::trust::STORE_VERSION
            );
        }

        debug!(
            "Loaded {} records for scope {} from {}",
            document.records.len(),
            scope,
            path.display()
        );
        Ok(document.into_records())
    }

    /// Verify and parse a document read for `scope`
    fn parse_document(&self, scope: &Scope, path: &Path, content: &str) -> Result<ScopeDocument, TrustError> {
        let Some((json, seal)) = extract_seal(content) else {
            let err = TrustError::StoreTampered {
                path: path.to_path_buf(),
                scope: scope.clone(),
            };
            err.log_if_security_critical();
            return Err(err);
        };

        // Verify against the bytes on disk, not a re-serialization
        if !verify_seal(json.as_bytes(), seal, &self.seal_key) {
            let err = TrustError::StoreTampered {
                path: path.to_path_buf(),
                scope: scope.clone(),
            };
            err.log_if_security_critical();
            return Err(err);
        }

        serde_json::from_str(json).map_err(|source| TrustError::StoreParse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn render(&self, scope: &Scope, records: &ScopeRecords) -> Result<Vec<u8>, TrustError> {
        let document = ScopeDocument::from_records(scope, records);
        let json = serde_json::to_string_pretty(&document).map_err(|source| TrustError::StoreParse {
            path: self.scope_path(scope),
            source,
        })?;
        let seal = compute_seal(json.as_bytes(), &self.seal_key);
        Ok(format!("{json}\n\n{SEAL_OPEN}{seal}{SEAL_CLOSE}\n").into_bytes())
    }

    /// Durably write (or delete, when empty) the document for `scope`
    async fn persist(&self, scope: &Scope, records: &ScopeRecords) -> Result<(), TrustError> {
        let path = self.scope_path(scope);
        let contents = if records.is_empty() {
            None
        } else {
            Some(self.render(scope, records)?)
        };

        let mut attempt = 0;
        loop {
            let target = path.clone();
            let bytes = contents.clone();
            let result = tokio::task::spawn_blocking(move || match bytes {
                Some(bytes) => write_atomic(&target, &bytes),
                None => remove_durably(&target),
            })
            .await
            .unwrap_or_else(|join_err| Err(io::Error::other(join_err)));

            match result {
                Ok(()) => {
                    debug!("Persisted scope {} ({} records)", scope, records.len());
                    return Ok(());
                }
                Err(e) if attempt < self.write_retries => {
                    attempt += 1;
                    warn!(
                        "Write to {} failed (attempt {}/{}): {}",
                        path.display(),
                        attempt,
                        self.write_retries + 1,
                        e
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(source) => {
                    error!("Giving up on write to {}: {}", path.display(), source);
                    return Err(TrustError::StoreIo { path, source });
                }
            }
        }
    }
}

#[async_trait]
impl TrustStore for FileTrustStore {
    async fn get(&self, scope: &Scope, key: &RecordKey) -> Result<Option<TrustRecord>, TrustError> {
        self.read(scope, |records| records.get(key).cloned()).await
    }

    async fn upsert(&self, scope: &Scope, record: TrustRecord) -> Result<(), TrustError> {
        self.mutate(scope, |records| {
            let key = record.key();
            let changed = records.get(&key) != Some(&record);
            records.insert(key, record);
            (changed, ())
        })
        .await
    }

    async fn remove(&self, scope: &Scope, key: &RecordKey) -> Result<bool, TrustError> {
        self.mutate(scope, |records| {
            let removed = records.remove(key).is_some();
            (removed, removed)
        })
        .await
    }

    /// Clearing also discards a document that fails its seal or parse,
    /// which is the only way to recover such a scope.
    async fn clear(&self, scope: &Scope) -> Result<usize, TrustError> {
        let slot = self.slot(scope);
        let mut guard = slot.write().await;

        let loaded = match guard.records.take() {
            Some(records) => Ok(records),
            None => self.load_scope(scope).await,
        };
        let count = match loaded {
            Ok(records) if records.is_empty() => {
                guard.records = Some(records);
                return Ok(0);
            }
            Ok(records) => records.len(),
            Err(TrustError::StoreTampered { path, .. } | TrustError::StoreParse { path, .. }) => {
                warn!("Discarding unreadable trust store document {}", path.display());
                0
            }
            Err(e) => return Err(e),
        };

        // On failure the cache stays empty so the next access reloads from disk
        self.persist(scope, &ScopeRecords::new()).await?;
        guard.records = Some(ScopeRecords::new());
        Ok(count)
    }

    async fn list(&self, scope: &Scope) -> Result<Vec<TrustRecord>, TrustError> {
        self.read(scope, |records| records.values().cloned().collect())
            .await
    }

    async fn scopes(&self) -> Result<Vec<Scope>, TrustError> {
        let mut scopes = Vec::new();
        if !self.list(&Scope::Global).await?.is_empty() {
            scopes.push(Scope::Global);
        }

        let dir = self.root.join("connections");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(scopes),
            Err(source) => return Err(TrustError::StoreIo { path: dir, source }),
        };

        let mut connections = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(TrustError::StoreIo {
                        path: dir.clone(),
                        source,
                    })
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| TrustError::StoreIo {
                    path: path.clone(),
                    source,
                })?;

            // One unreadable document must not hide the healthy scopes
            let Some(claimed) = claimed_scope(&content) else {
                warn!("Skipping unreadable trust store document {}", path.display());
                continue;
            };
            match self.parse_document(&claimed, &path, &content) {
                Ok(document) if self.scope_path(&document.scope) != path => {
                    let err = TrustError::StoreTampered {
                        path: path.clone(),
                        scope: claimed,
                    };
                    err.log_if_security_critical();
                    warn!("Skipping trust store document {} stored under the wrong name", path.display());
                }
                Ok(document) => {
                    if !document.records.is_empty() {
                        connections.push(document.scope);
                    }
                }
                Err(e) => {
                    warn!("Skipping trust store document {} of {}: {}", path.display(), claimed, e);
                }
            }
        }

        connections.sort();
        scopes.extend(connections);
        Ok(scopes)
    }
}

/// Scope a document says it belongs to, read without verifying the seal.
/// Only used to name the scope in diagnostics.
fn claimed_scope(content: &str) -> Option<Scope> {
    #[derive(serde::Deserialize)]
    struct Header {
        scope: Scope,
    }

    let json = extract_seal(content).map_or(content, |(json, _)| json);
    serde_json::from_str::<Header>(json).ok().map(|header| header.scope)
}

/// File stem for a connection id: readable prefix plus a digest so distinct
/// ids never collide after sanitizing
fn connection_file_stem(id: &str) -> String {
    let readable: String = id
        .chars()
        .take(48)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = hex::encode(sha256_digest(id.as_bytes()));
    format!("{readable}-{}", &digest[..12])
}

/// Split a stored document into its JSON body and seal
fn extract_seal(content: &str) -> Option<(&str, &str)> {
    let start = content.rfind(SEAL_OPEN)?;
    let rest = &content[start + SEAL_OPEN.len()..];
    let end = rest.find(SEAL_CLOSE)?;
    Some((content[..start].trim(), &rest[..end]))
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::other("store path has no parent directory"))?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    sync_dir(dir)
}

fn remove_durably(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => match path.parent() {
            Some(dir) => sync_dir(dir),
            None => Ok(()),
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
