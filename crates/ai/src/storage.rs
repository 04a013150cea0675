//! Object storage seam (opaque byte read/write).

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("cannot derive an object key from url: {0}")]
    InvalidUrl(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Byte-level object store used by the staging client.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Store `bytes` under `key` and return the object's location
    /// (e.g. `s3://bucket/key`).
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, StorageError>;
}

/// Extract the object key embedded in a source location.
///
/// Accepts `s3://bucket/key`, `http(s)://host/key` (query and fragment are
/// ignored) or a bare `key`.
pub fn object_key_from_url(url: &str) -> Result<String, StorageError> {
    let trimmed = url.trim();

    let path = match reqwest::Url::parse(trimmed) {
        Ok(parsed) if parsed.has_host() => parsed.path().to_string(),
        Ok(_) => return Err(StorageError::InvalidUrl(url.to_string())),
        // Not an absolute URL: treat the whole string as a key.
        Err(_) => trimmed.to_string(),
    };

    let key = path.trim_start_matches('/');
    if key.is_empty() {
        return Err(StorageError::InvalidUrl(url.to_string()));
    }
    Ok(key.to_string())
}

/// Content type guessed from a key's extension.
pub fn content_type_for(key: &str) -> &'static str {
    match extension_of(key).as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/png",
    }
}

/// Lower-cased extension of the last path segment, if any.
pub fn extension_of(key: &str) -> Option<String> {
    let segment = key.rsplit('/').next()?;
    let segment = segment.split(['?', '#']).next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() { None } else { Some(ext.to_ascii_lowercase()) }
}

/// In-memory object store for tests/dev.
#[derive(Debug)]
pub struct InMemoryObjectStore {
    bucket: String,
    objects: RwLock<HashMap<String, (Vec<u8>, String)>>,
}

impl InMemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: impl Into<String>, bytes: Vec<u8>) {
        let key = key.into();
        let content_type = content_type_for(&key).to_string();
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, (bytes, content_type));
    }

    /// Bytes and content type stored under `key`.
    pub fn object(&self, key: &str) -> Option<(Vec<u8>, String)> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn location(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.object(key)
            .map(|(bytes, _)| bytes)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, StorageError> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(self.location(key))
    }
}
