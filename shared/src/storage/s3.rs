use super::{join_url, DownloadedObject, ObjectStorage, StorageError, StoredObject};
use crate::utils::generate_ulid;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    public_base_url: String,
}

impl S3Storage {
    /// `endpoint` targets S3-compatible stores (MinIO, LocalStack) and
    /// switches to path-style addressing.
    pub async fn new(
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
        public_base_url: Option<String>,
    ) -> Result<Self, StorageError> {
        if bucket.trim().is_empty() {
            return Err(StorageError::Config("S3 bucket name is empty".to_string()));
        }

        let mut loader = aws_config::from_env();
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let shared_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);
        if let Some(ref endpoint_url) = endpoint {
            builder = builder.endpoint_url(endpoint_url).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        let public_base_url = match (public_base_url, endpoint) {
            (Some(url), _) => url,
            (None, Some(endpoint_url)) => join_url(&endpoint_url, &[&bucket]),
            (None, None) => format!("https://{}.s3.amazonaws.com", bucket),
        };

        Ok(Self {
            client,
            bucket,
            public_base_url,
        })
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn upload(
        &self,
        content: Bytes,
        folder: &str,
        filename: &str,
        media_type: Option<&str>,
    ) -> Result<StoredObject, StorageError> {
        let key = format!("{}/{}/{}", folder.trim_matches('/'), generate_ulid(), filename);

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(content));
        if let Some(media_type) = media_type {
            request = request.content_type(media_type);
        }

        request.send().await.map_err(|e| {
            StorageError::Backend(format!("upload s3://{}/{}: {}", self.bucket, key, e))
        })?;

        debug!("Uploaded s3://{}/{}", self.bucket, key);

        Ok(StoredObject {
            secure_url: join_url(&self.public_base_url, &[&key]),
            public_id: key,
        })
    }

    async fn download(&self, public_id: &str) -> Result<DownloadedObject, StorageError> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(public_id)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StorageError::NotFound(public_id.to_string())
                } else {
                    StorageError::Backend(format!("get s3://{}/{}: {}", self.bucket, public_id, e))
                }
            })?;

        let media_type = object.content_type().map(str::to_string);
        let content = object.body.collect().await.map_err(|e| {
            StorageError::Backend(format!("read s3://{}/{}: {}", self.bucket, public_id, e))
        })?;

        Ok(DownloadedObject {
            content: content.into_bytes(),
            media_type,
            filename: public_id.rsplit('/').next().unwrap_or(public_id).to_string(),
        })
    }

    async fn destroy(&self, public_id: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(public_id)
            .send()
            .await
            .map_err(|e| {
                StorageError::Backend(format!("delete s3://{}/{}: {}", self.bucket, public_id, e))
            })?;

        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}
