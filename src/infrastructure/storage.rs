use crate::config::StorageConfig;
use crate::services::storage::{S3StorageService, StorageService, UnconfiguredStorage};
use aws_sdk_s3::config::Region;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

pub async fn setup_storage(config: &StorageConfig) -> Arc<dyn StorageService> {
    let (Some(endpoint_url), Some(access_key), Some(secret_key)) = (
        config.endpoint.clone(),
        config.access_key.clone(),
        config.secret_key.clone(),
    ) else {
        let missing = config.missing_settings();
        for setting in &missing {
            warn!("⚠️  {} is not set", setting);
        }
        warn!("⚠️  Storage is not configured: uploads will fail until the settings above are provided");
        return Arc::new(UnconfiguredStorage::new(missing));
    };

    let public_base_url = config.public_url.as_deref().unwrap_or(endpoint_url.as_str());
    let public_base = match Url::parse(public_base_url) {
        Ok(url) => url,
        Err(e) => {
            warn!("⚠️  Invalid storage URL '{}': {}", public_base_url, e);
            return Arc::new(UnconfiguredStorage::new(vec!["a valid STORAGE_ENDPOINT"]));
        }
    };

    info!(
        "☁️  S3 Storage: {} (Bucket: {}, Prefix: '{}')",
        endpoint_url, config.bucket, config.prefix
    );

    let aws_config = aws_config::from_env()
        .endpoint_url(&endpoint_url)
        .region(Region::new(config.region.clone()))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            access_key, secret_key, None, None, "static",
        ))
        .load()
        .await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(true)
        .build();

    let s3_client = aws_sdk_s3::Client::from_conf(s3_config);

    // The bucket is owned by the storage provider; only report its state
    match s3_client.head_bucket().bucket(&config.bucket).send().await {
        Ok(_) => info!("✅ Bucket '{}' is ready", config.bucket),
        Err(e) => warn!(
            "⚠️  Bucket '{}' is not reachable yet: {}",
            config.bucket,
            e.into_service_error()
        ),
    }

    Arc::new(S3StorageService::new(
        s3_client,
        config.bucket.clone(),
        config.prefix.clone(),
        public_base,
    ))
}
