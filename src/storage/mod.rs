pub mod local;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub use local::LocalStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub size: u64,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Entry returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedObject {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {container}/{path}")]
    NotFound { container: String, path: String },

    #[error("invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("{op} failed for {target}: {source}")]
    Io {
        op: &'static str,
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object metadata for {target} is unreadable: {source}")]
    Metadata {
        target: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Blocking object-storage operations the orchestrator relies on.
pub trait ObjectStore {
    fn list(&self, container: &str, prefix: Option<&str>) -> Result<Vec<ListedObject>, StorageError>;
    fn head(&self, container: &str, path: &str) -> Result<ObjectMeta, StorageError>;
    fn get(&self, container: &str, path: &str) -> Result<Vec<u8>, StorageError>;
    fn put(
        &self,
        container: &str,
        path: &str,
        body: &[u8],
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), StorageError>;
}

impl<T: ObjectStore + ?Sized> ObjectStore for &T {
    fn list(&self, container: &str, prefix: Option<&str>) -> Result<Vec<ListedObject>, StorageError> {
        (**self).list(container, prefix)
    }

    fn head(&self, container: &str, path: &str) -> Result<ObjectMeta, StorageError> {
        (**self).head(container, path)
    }

    fn get(&self, container: &str, path: &str) -> Result<Vec<u8>, StorageError> {
        (**self).get(container, path)
    }

    fn put(
        &self,
        container: &str,
        path: &str,
        body: &[u8],
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), StorageError> {
        (**self).put(container, path, body, content_type, metadata)
    }
}
