//! MinIO/S3 content source for test data

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::Client;
use tracing::{debug, info};

use super::{ContentSource, Locator};

/// S3/MinIO storage client
#[derive(Clone)]
pub struct StorageClient {
    client: Client,
    bucket: String,
}

impl StorageClient {
    /// Create a new storage client from environment variables
    pub async fn from_env() -> Result<Self> {
        let endpoint = std::env::var("MINIO_ENDPOINT").unwrap_or_else(|_| "localhost".into());
        let port = std::env::var("MINIO_PORT").unwrap_or_else(|_| "9000".into());
        let access_key = std::env::var("MINIO_ACCESS_KEY").unwrap_or_else(|_| "minioadmin".into());
        let secret_key = std::env::var("MINIO_SECRET_KEY").unwrap_or_else(|_| "minioadmin".into());
        let bucket = std::env::var("MINIO_BUCKET").unwrap_or_else(|_| "judge-data".into());
        let use_ssl = std::env::var("MINIO_USE_SSL")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let protocol = if use_ssl { "https" } else { "http" };
        let endpoint_url = format!("{}://{}:{}", protocol, endpoint, port);

        info!("Connecting to object storage at {} (bucket {})", endpoint_url, bucket);

        let credentials = Credentials::new(access_key, secret_key, None, None, "minio");

        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(&endpoint_url)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(config),
            bucket,
        })
    }

    /// Download an object
    pub async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        debug!("Downloading s3://{}/{}", bucket, key);
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download s3://{}/{}", bucket, key))?;

        let data = response
            .body
            .collect()
            .await
            .with_context(|| format!("Failed to read body of s3://{}/{}", bucket, key))?;
        Ok(data.into_bytes().to_vec())
    }
}

/// Split `s3://bucket/key` into its parts; a bare key uses the default bucket
fn object_location<'a>(url: &'a str, default_bucket: &'a str) -> Result<(&'a str, &'a str)> {
    match url.strip_prefix("s3://") {
        Some(rest) => match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok((bucket, key)),
            _ => anyhow::bail!("Malformed object locator: {}", url),
        },
        None if url.contains("://") => anyhow::bail!("Unsupported locator: {}", url),
        None => Ok((default_bucket, url.trim_start_matches('/'))),
    }
}

#[async_trait]
impl ContentSource for StorageClient {
    async fn fetch(&self, locator: &Locator) -> Result<Vec<u8>> {
        match locator {
            Locator::Inline(bytes) => Ok(bytes.clone()),
            Locator::Url(url) => {
                let (bucket, key) = object_location(url, &self.bucket)?;
                self.download(bucket, key).await
            }
        }
    }
}
