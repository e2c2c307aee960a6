//! Remote object storage for uploaded dumps.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;

#[cfg(feature = "s3")]
mod s3;

#[cfg(feature = "s3")]
pub use s3::{S3Config, S3RemoteStorage};

/// Errors raised by remote storage operations
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum RemoteError {
    #[error("Upload of {key} to {bucket} failed: {message}")]
    Upload {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("Download of {key} from {bucket} failed: {message}")]
    Download {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("Listing {bucket}/{prefix} failed: {message}")]
    List {
        bucket: String,
        prefix: String,
        message: String,
    },

    #[error("Deleting {key} from {bucket} failed: {message}")]
    Delete {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("Object {key} not found in {bucket}")]
    NotFound { bucket: String, key: String },

    /// An upload or download was requested without a configured store
    #[error("Remote storage is not configured")]
    NotConfigured,
}

/// An object listed from the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    /// Full object key
    pub key: String,
    /// `None` when the store did not report a usable time
    pub last_modified: Option<DateTime<Utc>>,
    /// Object size
    pub size_bytes: u64,
}

impl RemoteObject {
    /// Last path component of the key
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Object store operations used by the backup pipeline
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Upload the file at `local_path` as `key`
    async fn put(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), RemoteError>;

    /// Download `key` into `local_path`, replacing any existing file.
    /// A failed download may leave a partial file behind.
    async fn get(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), RemoteError>;

    /// All objects whose key starts with `prefix`
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObject>, RemoteError>;

    /// Delete `key`; deleting a missing key succeeds
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), RemoteError>;
}

/// Join the configured prefix and a file name into an object key
pub fn object_key(prefix: &str, file_name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        file_name.to_string()
    } else {
        format!("{}/{}", prefix, file_name)
    }
}

/// Listing prefix for a configured prefix, so `databases` does not match `databases-old`
pub fn list_prefix(prefix: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        String::new()
    } else {
        format!("{}/", prefix)
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: Option<DateTime<Utc>>,
}

/// In-process object store, for tests and local runs
#[derive(Debug, Clone, Default)]
pub struct MemoryRemoteStorage {
    objects: Arc<DashMap<(String, String), StoredObject>>,
}

impl MemoryRemoteStorage {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object with an explicit modification time
    pub fn insert(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Bytes>,
        last_modified: DateTime<Utc>,
    ) {
        self.store(bucket, key, data.into(), Some(last_modified));
    }

    /// Insert an object the listing reports without a modification time
    pub fn insert_undated(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.store(bucket, key, data.into(), None);
    }

    fn store(&self, bucket: &str, key: &str, data: Bytes, last_modified: Option<DateTime<Utc>>) {
        self.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject { data, last_modified },
        );
    }

    /// Whether `key` exists in `bucket`
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects.contains_key(&(bucket.to_string(), key.to_string()))
    }

    /// Object content
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.data.clone())
    }

    /// Keys in `bucket`, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == bucket)
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl RemoteStorage for MemoryRemoteStorage {
    async fn put(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), RemoteError> {
        let data = fs::read(local_path).await.map_err(|e| RemoteError::Upload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.insert(bucket, key, data, Utc::now());
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), RemoteError> {
        let data = self.object(bucket, key).ok_or_else(|| RemoteError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;
        fs::write(local_path, &data).await.map_err(|e| RemoteError::Download {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObject>, RemoteError> {
        let mut objects: Vec<RemoteObject> = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == bucket && entry.key().1.starts_with(prefix))
            .map(|entry| RemoteObject {
                key: entry.key().1.clone(),
                last_modified: entry.value().last_modified,
                size_bytes: entry.value().data.len() as u64,
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), RemoteError> {
        self.objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}
