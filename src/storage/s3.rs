// S3 Remote Storage Implementation
// Works against AWS S3 or any S3-compatible service (MinIO, LocalStack)

use super::{RemoteError, RemoteObject, RemoteStorage};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// S3 client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// AWS region
    pub region: String,
    /// Custom endpoint for S3-compatible services
    pub endpoint_url: Option<String>,
    /// Path-style addressing, needed by most MinIO setups
    pub force_path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl From<&crate::config::RemoteConfig> for S3Config {
    fn from(remote: &crate::config::RemoteConfig) -> Self {
        Self {
            region: remote.region.clone(),
            endpoint_url: remote.endpoint_url.clone(),
            force_path_style: remote.force_path_style,
        }
    }
}

/// S3-backed remote storage
#[derive(Clone)]
pub struct S3RemoteStorage {
    client: Client,
}

impl S3RemoteStorage {
    /// Create a client from the default AWS credential chain
    pub async fn new(config: S3Config) -> Self {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        // Support for LocalStack/MinIO with custom endpoint
        if let Some(ref endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Self {
            client: Client::from_conf(s3_config_builder.build()),
        }
    }

    /// Wrap an existing client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn to_chrono(timestamp: Option<&aws_sdk_s3::primitives::DateTime>) -> Option<DateTime<Utc>> {
    timestamp.and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
}

#[async_trait]
impl RemoteStorage for S3RemoteStorage {
    async fn put(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), RemoteError> {
        let upload_error = |message: String| RemoteError::Upload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message,
        };

        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| upload_error(e.to_string()))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| upload_error(e.into_service_error().to_string()))?;

        debug!(bucket = bucket, key = key, "uploaded object");
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), RemoteError> {
        let download_error = |message: String| RemoteError::Download {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message,
        };

        let response = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(resp) => resp,
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Err(RemoteError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    });
                }
                return Err(download_error(service_error.to_string()));
            }
        };

        let mut body = response.body.into_async_read();
        let mut file = fs::File::create(local_path)
            .await
            .map_err(|e| download_error(e.to_string()))?;
        tokio::io::copy(&mut body, &mut file)
            .await
            .map_err(|e| download_error(e.to_string()))?;
        file.flush().await.map_err(|e| download_error(e.to_string()))?;

        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObject>, RemoteError> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| RemoteError::List {
                    bucket: bucket.to_string(),
                    prefix: prefix.to_string(),
                    message: e.into_service_error().to_string(),
                })?;

            objects.extend(response.contents().iter().filter_map(|object| {
                object.key().map(|key| RemoteObject {
                    key: key.to_string(),
                    last_modified: to_chrono(object.last_modified()),
                    size_bytes: object.size().unwrap_or(0).max(0) as u64,
                })
            }));

            match response.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(objects)
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), RemoteError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| RemoteError::Delete {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: e.into_service_error().to_string(),
            })?;

        Ok(())
    }
}
