//! Object store over a path-style S3-compatible HTTP endpoint.
//!
//! Objects live at `{endpoint}/{bucket}/{key}`. Requests are unsigned, so the
//! endpoint is expected to be a gateway that handles auth (MinIO with a
//! bucket policy, a presigning proxy, ...).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::storage::{ObjectStore, StorageError};

#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    http: reqwest::Client,
    endpoint: String,
    bucket: String,
}

impl HttpObjectStore {
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>, request_timeout: Duration) -> Result<Self, StorageError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key.trim_start_matches('/'))
    }
}

fn backend(e: reqwest::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.http.get(self.object_url(key)).send().await.map_err(backend)?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(key.to_string())),
            status if status.is_success() => Ok(response.bytes().await.map_err(backend)?.to_vec()),
            status => Err(StorageError::Backend(format!("GET {key} returned HTTP {}", status.as_u16()))),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, StorageError> {
        debug!(key, size = bytes.len(), "uploading object");
        let response = self
            .http
            .put(self.object_url(key))
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(backend)?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Backend(format!("PUT {key} returned HTTP {}", status.as_u16())));
        }
        Ok(format!("s3://{}/{}", self.bucket, key.trim_start_matches('/')))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_path_style_urls() {
        let store = HttpObjectStore::new("http://minio:9000/", "roomstage", Duration::from_secs(5)).unwrap();
        assert_eq!(store.object_url("uploads/a.jpg"), "http://minio:9000/roomstage/uploads/a.jpg");
        assert_eq!(store.object_url("/staged/b.png"), "http://minio:9000/roomstage/staged/b.png");
    }
}
