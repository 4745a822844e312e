//! Claim-check artifact storage
//!
//! Payloads too large to ride inside an event are replaced by an
//! [`ArtifactUri`] and parked in an [`ArtifactStore`]. Writes are durable on
//! return, retrieval of an absent uri fails with `NotFound`, and deletion is
//! idempotent. Artifacts are content-addressed: storing identical bytes in
//! the same category yields the same uri.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::{JournalError, Result};
use crate::signal::CancelSignal;

const URI_SCHEME: &str = "artifact://";

/// Reference to a stored artifact: `artifact://<category>/<sha256-hex>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactUri(String);

impl ArtifactUri {
    pub fn new(category: &str, digest: &str) -> Self {
        Self(format!("{URI_SCHEME}{category}/{digest}"))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| JournalError::NotFound(format!("malformed artifact uri: {raw}")))?;
        match rest.split_once('/') {
            Some((category, digest)) if !category.is_empty() && !digest.is_empty() => {
                Ok(Self(raw.to_string()))
            }
            _ => Err(JournalError::NotFound(format!(
                "malformed artifact uri: {raw}"
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parts(&self) -> (&str, &str) {
        // Constructed through new/parse, so the shape is guaranteed.
        let rest = &self.0[URI_SCHEME.len()..];
        rest.split_once('/').unwrap_or((rest, ""))
    }

    pub fn category(&self) -> &str {
        self.parts().0
    }

    pub fn digest(&self) -> &str {
        self.parts().1
    }
}

impl std::fmt::Display for ArtifactUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Byte-oriented claim-check store
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist bytes under a category; durable on return
    async fn store(&self, bytes: &[u8], category: &str, cancel: &CancelSignal)
        -> Result<ArtifactUri>;

    /// Fetch previously stored bytes; `NotFound` if absent
    async fn retrieve(&self, uri: &ArtifactUri, cancel: &CancelSignal) -> Result<Vec<u8>>;

    /// Remove an artifact; deleting an absent uri succeeds silently
    async fn delete(&self, uri: &ArtifactUri, cancel: &CancelSignal) -> Result<()>;
}

/// Store any serde value as a JSON artifact
pub async fn store_json<T: Serialize + Sync>(
    store: &dyn ArtifactStore,
    value: &T,
    category: &str,
    cancel: &CancelSignal,
) -> Result<ArtifactUri> {
    let bytes = serde_json::to_vec(value)?;
    store.store(&bytes, category, cancel).await
}

/// Fetch and decode a JSON artifact
pub async fn retrieve_json<T: DeserializeOwned>(
    store: &dyn ArtifactStore,
    uri: &ArtifactUri,
    cancel: &CancelSignal,
) -> Result<T> {
    let bytes = store.retrieve(uri, cancel).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Artifact store backed by process memory
pub struct MemoryArtifactStore {
    blobs: Arc<RwLock<HashMap<ArtifactUri, Vec<u8>>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self {
            blobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }
}

impl Default for MemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn store(
        &self,
        bytes: &[u8],
        category: &str,
        cancel: &CancelSignal,
    ) -> Result<ArtifactUri> {
        if cancel.is_cancelled() {
            return Err(JournalError::Cancelled);
        }
        let uri = ArtifactUri::new(category, &digest_hex(bytes));
        self.blobs.write().await.insert(uri.clone(), bytes.to_vec());
        Ok(uri)
    }

    async fn retrieve(&self, uri: &ArtifactUri, cancel: &CancelSignal) -> Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(JournalError::Cancelled);
        }
        self.blobs
            .read()
            .await
            .get(uri)
            .cloned()
            .ok_or_else(|| JournalError::NotFound(uri.to_string()))
    }

    async fn delete(&self, uri: &ArtifactUri, cancel: &CancelSignal) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(JournalError::Cancelled);
        }
        self.blobs.write().await.remove(uri);
        Ok(())
    }
}

/// Artifact store laid out on the filesystem as `<root>/<category>/<digest>`
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, uri: &ArtifactUri) -> PathBuf {
        self.root.join(uri.category()).join(uri.digest())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn store(
        &self,
        bytes: &[u8],
        category: &str,
        cancel: &CancelSignal,
    ) -> Result<ArtifactUri> {
        if cancel.is_cancelled() {
            return Err(JournalError::Cancelled);
        }
        let uri = ArtifactUri::new(category, &digest_hex(bytes));
        let path = self.path_for(&uri);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write-then-rename keeps partially written blobs invisible.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(uri)
    }

    async fn retrieve(&self, uri: &ArtifactUri, cancel: &CancelSignal) -> Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(JournalError::Cancelled);
        }
        match tokio::fs::read(self.path_for(uri)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(JournalError::NotFound(uri.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, uri: &ArtifactUri, cancel: &CancelSignal) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(JournalError::Cancelled);
        }
        match tokio::fs::remove_file(self.path_for(uri)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryArtifactStore::new();
        let cancel = CancelSignal::never();

        let uri = store.store(b"hello", "reports", &cancel).await.unwrap();
        assert_eq!(uri.category(), "reports");

        let bytes = store.retrieve(&uri, &cancel).await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn test_content_addressing_dedupes() {
        let store = MemoryArtifactStore::new();
        let cancel = CancelSignal::never();

        let first = store.store(b"same", "blobs", &cancel).await.unwrap();
        let second = store.store(b"same", "blobs", &cancel).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_retrieve_absent_is_not_found() {
        let store = MemoryArtifactStore::new();
        let cancel = CancelSignal::never();
        let uri = ArtifactUri::new("reports", "deadbeef");

        let err = store.retrieve(&uri, &cancel).await.unwrap_err();
        assert!(matches!(err, JournalError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryArtifactStore::new();
        let cancel = CancelSignal::never();

        let uri = store.store(b"bytes", "tmp", &cancel).await.unwrap();
        store.delete(&uri, &cancel).await.unwrap();
        store.delete(&uri, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let cancel = CancelSignal::never();

        let uri = store_json(&store, &json!({"answer": 42}), "state", &cancel)
            .await
            .unwrap();
        let value: serde_json::Value = retrieve_json(&store, &uri, &cancel).await.unwrap();
        assert_eq!(value, json!({"answer": 42}));

        store.delete(&uri, &cancel).await.unwrap();
        let err = store.retrieve(&uri, &cancel).await.unwrap_err();
        assert!(matches!(err, JournalError::NotFound(_)));
        // Second delete of the now-absent uri still succeeds.
        store.delete(&uri, &cancel).await.unwrap();
    }

    #[test]
    fn test_uri_parse_rejects_malformed() {
        assert!(ArtifactUri::parse("artifact://reports/abc123").is_ok());
        assert!(ArtifactUri::parse("file://reports/abc123").is_err());
        assert!(ArtifactUri::parse("artifact://reports").is_err());
        assert!(ArtifactUri::parse("artifact:///abc").is_err());
    }
}
