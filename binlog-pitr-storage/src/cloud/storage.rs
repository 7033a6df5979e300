use crate::cloud::storage_config::BackendConfig;
use async_trait::async_trait;
use binlog_pitr_core::{PitrError, StorageBackend};
use opendal::{ErrorKind, Operator};
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Default number of in-backend retries for transient provider errors.
pub const DEFAULT_BACKEND_RETRIES: usize = 3;

/// `StorageBackend` over an opendal operator (S3, Azure Blob, fs, memory).
#[derive(Debug, Clone)]
pub struct ObjectStore {
    /// Optional extra prefix for key joining (used by Local backends)
    root_prefix: String,
    /// Opendal operator
    op: Operator,
    provider: &'static str,
    /// Serializes stat-then-write for providers without conditional writes.
    write_lock: Arc<Mutex<()>>,
}

impl ObjectStore {
    pub fn new(cfg: BackendConfig) -> Result<Self, PitrError> {
        Self::with_retries(cfg, DEFAULT_BACKEND_RETRIES)
    }

    pub fn with_retries(cfg: BackendConfig, max_retries: usize) -> Result<Self, PitrError> {
        let (op, root_prefix) = cfg.build_operator(max_retries)?;
        Ok(Self {
            root_prefix,
            op,
            provider: cfg.provider(),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    #[inline]
    fn join(&self, path: &str) -> String {
        let p = path.trim_matches('/');
        if self.root_prefix.is_empty() {
            p.to_string()
        } else {
            format!("{}/{}", self.root_prefix, p)
        }
    }

    /// Inverse of `join` for keys returned by listings.
    fn strip_root<'a>(&self, path: &'a str) -> &'a str {
        let path = path.trim_start_matches('/');
        if self.root_prefix.is_empty() {
            return path;
        }
        path.strip_prefix(self.root_prefix.as_str())
            .map(|p| p.trim_start_matches('/'))
            .unwrap_or(path)
    }
}

/// Map opendal errors onto the shared taxonomy.
fn map_err(op: &str, key: &str, e: opendal::Error) -> PitrError {
    match e.kind() {
        ErrorKind::NotFound => PitrError::NotFound(key.to_string()),
        ErrorKind::AlreadyExists | ErrorKind::ConditionNotMatch => {
            PitrError::conflict(key, format!("{}: {}", op, e))
        }
        ErrorKind::PermissionDenied | ErrorKind::ConfigInvalid | ErrorKind::Unsupported => {
            PitrError::Fatal(format!("{} {}: {}", op, key, e))
        }
        _ => PitrError::transient(key, format!("{}: {}", op, e)),
    }
}

#[async_trait]
impl StorageBackend for ObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), PitrError> {
        let path = self.join(key);
        let len = bytes.len();
        if self.op.info().full_capability().write_with_if_not_exists {
            self.op
                .write_with(&path, bytes)
                .if_not_exists(true)
                .await
                .map_err(|e| map_err("write", key, e))?;
        } else {
            // stat and write must not interleave with another put from this process
            let _guard = self.write_lock.lock().await;
            match self.op.stat(&path).await {
                Ok(_) => {
                    return Err(PitrError::conflict(key, "object already exists"));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(map_err("stat", key, e)),
            }
            self.op
                .write(&path, bytes)
                .await
                .map_err(|e| map_err("write", key, e))?;
        }
        debug!(target: "object_store", provider = self.provider, key = %key, size = len, "object written");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, PitrError> {
        let trimmed = prefix.trim_matches('/');
        let dir = if trimmed.is_empty() && self.root_prefix.is_empty() {
            "/".to_string()
        } else if trimmed.is_empty() {
            format!("{}/", self.root_prefix)
        } else {
            format!("{}/", self.join(trimmed))
        };
        // opendal pages through the provider listing internally and returns all entries.
        let entries = match self.op.list_with(&dir).recursive(true).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(map_err("list", prefix, e)),
        };
        let mut keys: Vec<String> = entries
            .into_iter()
            .filter(|entry| !entry.metadata().mode().is_dir() && !entry.path().ends_with('/'))
            .map(|entry| self.strip_root(entry.path()).to_string())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, PitrError> {
        let path = self.join(key);
        let data = self
            .op
            .read(&path)
            .await
            .map_err(|e| map_err("read", key, e))?;
        Ok(data.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), PitrError> {
        let path = self.join(key);
        self.op
            .delete(&path)
            .await
            .map_err(|e| map_err("delete", key, e))
    }

    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Vec<u8>, PitrError> {
        let path = self.join(key);
        let data = self
            .op
            .read_with(&path)
            .range(range)
            .await
            .map_err(|e| map_err("read_range", key, e))?;
        Ok(data.to_vec())
    }

    fn provider(&self) -> &str {
        self.provider
    }
}
