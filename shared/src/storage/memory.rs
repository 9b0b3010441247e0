use super::{join_url, DownloadedObject, ObjectStorage, StorageError, StoredObject};
use crate::utils::generate_ulid;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct MemoryObject {
    pub folder: String,
    pub filename: String,
    pub media_type: Option<String>,
    pub content: Bytes,
}

/// Process-local object store for tests and local runs. Individual filenames
/// can be set to fail so partial-failure paths can be exercised.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    objects: Arc<DashMap<String, MemoryObject>>,
    failing_filenames: Arc<DashSet<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_uploads_named(&self, filename: &str) {
        self.failing_filenames.insert(filename.to_string());
    }

    pub fn get(&self, public_id: &str) -> Option<MemoryObject> {
        self.objects.get(public_id).map(|o| o.value().clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn filenames(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .objects
            .iter()
            .map(|entry| entry.value().filename.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn upload(
        &self,
        content: Bytes,
        folder: &str,
        filename: &str,
        media_type: Option<&str>,
    ) -> Result<StoredObject, StorageError> {
        if self.failing_filenames.contains(filename) {
            return Err(StorageError::Backend(format!(
                "upload rejected for {}",
                filename
            )));
        }

        let public_id = format!("{}/{}", folder, generate_ulid());
        self.objects.insert(
            public_id.clone(),
            MemoryObject {
                folder: folder.to_string(),
                filename: filename.to_string(),
                media_type: media_type.map(str::to_string),
                content,
            },
        );

        Ok(StoredObject {
            secure_url: join_url("/files", &[&public_id, filename]),
            public_id,
        })
    }

    async fn download(&self, public_id: &str) -> Result<DownloadedObject, StorageError> {
        self.get(public_id)
            .map(|object| DownloadedObject {
                content: object.content,
                media_type: object.media_type,
                filename: object.filename,
            })
            .ok_or_else(|| StorageError::NotFound(public_id.to_string()))
    }

    async fn destroy(&self, public_id: &str) -> Result<(), StorageError> {
        self.objects
            .remove(public_id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(public_id.to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_then_destroy() {
        let storage = MemoryStorage::new();
        let stored = storage
            .upload(Bytes::from_static(b"%PDF"), "crm_attachments", "a.pdf", Some("application/pdf"))
            .await
            .unwrap();

        assert!(stored.secure_url.ends_with("/a.pdf"));
        assert_eq!(storage.get(&stored.public_id).unwrap().content.as_ref(), b"%PDF");

        storage.destroy(&stored.public_id).await.unwrap();
        assert!(storage.is_empty());
        assert!(matches!(
            storage.destroy(&stored.public_id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_filename_is_rejected() {
        let storage = MemoryStorage::new();
        storage.fail_uploads_named("broken.png");

        let result = storage
            .upload(Bytes::from_static(b"x"), "f", "broken.png", None)
            .await;
        assert!(matches!(result, Err(StorageError::Backend(_))));

        storage
            .upload(Bytes::from_static(b"x"), "f", "fine.png", None)
            .await
            .unwrap();
        assert_eq!(storage.filenames(), vec!["fine.png".to_string()]);
    }
}
