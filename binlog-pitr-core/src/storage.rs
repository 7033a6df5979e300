use async_trait::async_trait;
use std::ops::Range;

use crate::errors::PitrError;

/// Provider-neutral object storage capability.
///
/// Keys are `/`-separated relative paths. Implementations own their retry and
/// backoff policy and report failures with the shared taxonomy:
/// `NotFound` for missing keys, `TransientIo` for retryable provider or network
/// errors, `Fatal` for authorization and configuration errors.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Write a new object. Readers never observe a partial object.
    /// Fails with `Conflict` if the key already exists.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), PitrError>;

    /// Complete, lexicographically ordered listing of the object keys under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, PitrError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, PitrError>;

    /// Best-effort removal, reserved for retention tooling.
    async fn delete(&self, key: &str) -> Result<(), PitrError>;

    /// Read a byte range of an object. The default downloads the whole object;
    /// providers with native ranged reads override it.
    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Vec<u8>, PitrError> {
        let bytes = self.get(key).await?;
        let len = bytes.len() as u64;
        let start = range.start.min(len) as usize;
        let end = range.end.min(len) as usize;
        Ok(bytes[start..end.max(start)].to_vec())
    }

    /// Provider label for logs and metrics.
    fn provider(&self) -> &str {
        "unknown"
    }
}
