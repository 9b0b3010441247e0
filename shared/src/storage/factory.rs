use super::{postgres::PostgresStorage, s3::S3Storage, ObjectStorage, StorageError};
use crate::config::{StorageBackendKind, StorageConfig};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

pub struct StorageFactory;

impl StorageFactory {
    /// Builds the backend selected by `STORAGE_BACKEND` ("postgres" by default, or "s3").
    pub async fn create(
        config: &StorageConfig,
        pool: PgPool,
    ) -> Result<Arc<dyn ObjectStorage>, StorageError> {
        match config.backend {
            StorageBackendKind::Postgres => {
                info!("Initializing PostgreSQL storage backend");
                Ok(Arc::new(PostgresStorage::new(
                    pool,
                    config.public_base_url.clone(),
                )))
            }
            StorageBackendKind::S3 => {
                let bucket = config.s3_bucket.clone().ok_or_else(|| {
                    StorageError::Config(
                        "S3_BUCKET environment variable is required when STORAGE_BACKEND=s3"
                            .to_string(),
                    )
                })?;

                if let Some(ref endpoint_url) = config.s3_endpoint {
                    info!(
                        "Using S3 storage with custom endpoint: bucket={}, endpoint={}",
                        bucket, endpoint_url
                    );
                } else {
                    info!("Using S3 storage: bucket={}", bucket);
                }

                // The postgres default base only makes sense for blobs; S3 derives its own.
                let public_base_url = Some(config.public_base_url.clone())
                    .filter(|url| url.starts_with("http://") || url.starts_with("https://"));

                let storage = S3Storage::new(
                    bucket,
                    config.s3_region.clone(),
                    config.s3_endpoint.clone(),
                    public_base_url,
                )
                .await?;
                Ok(Arc::new(storage))
            }
        }
    }
}
