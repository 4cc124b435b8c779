// ABOUTME: S3-compatible object store backed by aws-sdk-s3
// ABOUTME: Works against AWS as well as custom endpoints such as MinIO

use super::{ObjectStore, ObjectStoreError, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services; enables path-style addressing
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Build a client from static credentials, or the SDK default chain when none are set
    pub async fn connect(config: &S3Config) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => {
                loader = loader.credentials_provider(Credentials::new(
                    access_key_id,
                    secret_access_key,
                    None,
                    None,
                    "netlab",
                ));
            }
            (None, None) => {}
            _ => {
                return Err(ObjectStoreError::Configuration(
                    "S3 access key id and secret access key must be set together".to_string(),
                ))
            }
        }

        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.endpoint.is_some())
            .build();

        Ok(Self::new(Client::from_conf(s3_config), config.bucket.clone()))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn upload_bytes(&self, key: &str, content: Vec<u8>) -> Result<()> {
        debug!("Uploading {} bytes to s3://{}/{}", content.len(), self.bucket, key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(content))
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| ObjectStoreError::Provider(format!("Failed to upload {}: {}", key, e)))?;

        Ok(())
    }

    async fn presigned_url(&self, key: &str, expires_in: Duration) -> Result<String> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| ObjectStoreError::Configuration(e.to_string()))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| ObjectStoreError::Provider(format!("Failed to presign {}: {}", key, e)))?;

        Ok(request.uri().to_string())
    }
}
