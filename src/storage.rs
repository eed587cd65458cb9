//! Object storage collaborator

use crate::config::StorageSettings;
use crate::{format_bytes, WorkerError};
use async_trait::async_trait;
use tracing::{info, warn};

/// Upload boundary. Only a success flag crosses it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_bytes(&self, object_key: &str, bytes: Vec<u8>) -> bool;
}

/// Uploads with `PUT {endpoint}/{bucket}/{object_key}`, using basic auth when
/// an access id is configured.
pub struct HttpObjectStore {
    client: reqwest::Client,
    settings: StorageSettings,
}

impl HttpObjectStore {
    pub fn new(settings: StorageSettings) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| WorkerError::Configuration(e.to_string()))?;

        Ok(Self { client, settings })
    }

    pub fn object_url(&self, object_key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.settings.endpoint.trim_end_matches('/'),
            self.settings.bucket,
            object_key
        )
    }

    async fn upload(&self, object_key: &str, bytes: Vec<u8>) -> Result<(), WorkerError> {
        let mut request = self
            .client
            .put(self.object_url(object_key))
            .header(reqwest::header::CONTENT_TYPE, content_type(object_key))
            .body(bytes);

        if !self.settings.access_id.is_empty() {
            request = request.basic_auth(&self.settings.access_id, Some(&self.settings.access_key));
        }

        request
            .send()
            .await
            .map_err(|e| WorkerError::Storage(e.to_string()))?
            .error_for_status()
            .map_err(|e| WorkerError::Storage(e.to_string()))?;
        Ok(())
    }
}

fn content_type(object_key: &str) -> &'static str {
    if object_key.ends_with(".jpeg") || object_key.ends_with(".jpg") {
        "image/jpeg"
    } else if object_key.ends_with(".png") {
        "image/png"
    } else {
        "application/octet-stream"
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put_bytes(&self, object_key: &str, bytes: Vec<u8>) -> bool {
        let size = bytes.len();
        match self.upload(object_key, bytes).await {
            Ok(()) => {
                info!("Upload {} ({}) to storage, success", object_key, format_bytes(size));
                true
            }
            Err(e) => {
                warn!("Upload of {} failed: {}", object_key, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(endpoint: &str) -> StorageSettings {
        StorageSettings {
            endpoint: endpoint.to_string(),
            bucket: "snapshots".to_string(),
            access_id: String::new(),
            access_key: String::new(),
            timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_object_url() {
        let store = HttpObjectStore::new(settings("http://storage.local/")).unwrap();
        assert_eq!(
            store.object_url("ebay_US_B000123_20240309140507.png"),
            "http://storage.local/snapshots/ebay_US_B000123_20240309140507.png"
        );
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type("a.png"), "image/png");
        assert_eq!(content_type("a.jpeg"), "image/jpeg");
        assert_eq!(content_type("a"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_unreachable_storage_reports_failure() {
        let store = HttpObjectStore::new(settings("http://127.0.0.1:9")).unwrap();
        assert!(!store.put_bytes("a.png", vec![1, 2, 3]).await);
    }
}
