use super::{join_url, DownloadedObject, ObjectStorage, StorageError, StoredObject};
use crate::utils::generate_ulid;
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};

/// Keeps object bytes in the `content_blobs` table. URLs point at
/// `{public_base_url}/{id}/{filename}`, served by whatever fronts the table.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PgPool,
    public_base_url: String,
}

impl PostgresStorage {
    pub fn new(pool: PgPool, public_base_url: impl Into<String>) -> Self {
        Self {
            pool,
            public_base_url: public_base_url.into(),
        }
    }
}

#[async_trait]
impl ObjectStorage for PostgresStorage {
    async fn upload(
        &self,
        content: Bytes,
        folder: &str,
        filename: &str,
        media_type: Option<&str>,
    ) -> Result<StoredObject, StorageError> {
        let content_id = generate_ulid();
        let size_bytes = content.len() as i64;

        let mut hasher = Sha256::new();
        hasher.update(&content);
        let hash = format!("{:x}", hasher.finalize());

        sqlx::query(
            r#"
            INSERT INTO content_blobs (id, folder, filename, content, content_type, size_bytes, sha256_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&content_id)
        .bind(folder)
        .bind(filename)
        .bind(content.as_ref())
        .bind(media_type)
        .bind(size_bytes)
        .bind(&hash)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(format!("Failed to store content: {}", e)))?;

        Ok(StoredObject {
            secure_url: join_url(&self.public_base_url, &[&content_id, filename]),
            public_id: content_id,
        })
    }

    async fn download(&self, public_id: &str) -> Result<DownloadedObject, StorageError> {
        let row = sqlx::query("SELECT content, content_type, filename FROM content_blobs WHERE id = $1")
            .bind(public_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to read content: {}", e)))?
            .ok_or_else(|| StorageError::NotFound(public_id.to_string()))?;

        let content: Vec<u8> = row.get("content");
        Ok(DownloadedObject {
            content: Bytes::from(content),
            media_type: row.get("content_type"),
            filename: row.get("filename"),
        })
    }

    async fn destroy(&self, public_id: &str) -> Result<(), StorageError> {
        let rows_affected = sqlx::query("DELETE FROM content_blobs WHERE id = $1")
            .bind(public_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to delete content: {}", e)))?
            .rows_affected();

        if rows_affected == 0 {
            return Err(StorageError::NotFound(public_id.to_string()));
        }

        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
