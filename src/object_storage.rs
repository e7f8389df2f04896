use crate::config::StorageConfig;
use crate::error::{DeliveryError, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client as S3Client;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Object storage backend for asset sources and renditions.
///
/// This service never reads or writes object bytes; it only signs
/// time-limited download URLs.
pub struct ObjectStorage {
    client: S3Client,
    bucket: String,
    presigned_url_expiry: Duration,
}

impl ObjectStorage {
    /// Create a new object storage client
    pub async fn new(config: &StorageConfig) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let s3_config = s3_config_builder.build();
        let client = S3Client::from_conf(s3_config);

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "Object storage client initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            presigned_url_expiry: Duration::from_secs(config.presigned_url_expiry_secs),
        })
    }

    /// Generate a signed, time-limited, publicly fetchable URL for a stored
    /// object. Backend failures surface as `StorageUnavailable`.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn presign_download(&self, key: &str) -> Result<String> {
        let presigning_config = PresigningConfig::expires_in(self.presigned_url_expiry)
            .map_err(|e| DeliveryError::StorageUnavailable(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| DeliveryError::StorageUnavailable(e.to_string()))?;

        debug!("Presigned download URL generated");
        metrics::counter!("storage.urls_signed").increment(1);

        Ok(presigned.uri().to_string())
    }
}
