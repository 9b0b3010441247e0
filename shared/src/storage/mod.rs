pub mod factory;
pub mod memory;
pub mod postgres;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use factory::StorageFactory;
pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;
pub use s3::S3Storage;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage configuration error: {0}")]
    Config(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Object not found: {0}")]
    NotFound(String),
}

/// Handle returned for an uploaded object. `public_id` is what `destroy`
/// takes; `secure_url` is what gets shown to people.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub secure_url: String,
    pub public_id: String,
}

#[derive(Debug, Clone)]
pub struct DownloadedObject {
    pub content: Bytes,
    pub media_type: Option<String>,
    pub filename: String,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(
        &self,
        content: Bytes,
        folder: &str,
        filename: &str,
        media_type: Option<&str>,
    ) -> Result<StoredObject, StorageError>;

    async fn download(&self, public_id: &str) -> Result<DownloadedObject, StorageError>;

    async fn destroy(&self, public_id: &str) -> Result<(), StorageError>;

    fn backend_name(&self) -> &'static str;
}

/// Joins a base URL and path segments with single slashes.
pub(crate) fn join_url(base: &str, segments: &[&str]) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    for segment in segments {
        url.push('/');
        url.push_str(segment.trim_matches('/'));
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url_collapses_slashes() {
        assert_eq!(
            join_url("https://cdn.example.com/", &["crm_attachments/", "abc", "a.pdf"]),
            "https://cdn.example.com/crm_attachments/abc/a.pdf"
        );
        assert_eq!(join_url("/files", &["x"]), "/files/x");
    }
}
