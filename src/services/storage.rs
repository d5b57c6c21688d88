use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use thiserror::Error;
use url::Url;

/// An object persisted in the bucket by `put`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Name relative to the configured prefix
    pub name: String,
    /// Full key inside the bucket
    pub storage_path: String,
    pub public_url: String,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object '{0}' already exists")]
    AlreadyExists(String),

    #[error("storage backend is not configured (missing {0})")]
    NotConfigured(String),
}

#[async_trait]
pub trait StorageService: Send + Sync {
    /// Store a new object. Existing objects are never overwritten.
    async fn put(&self, name: &str, data: Bytes, content_type: &str) -> Result<StoredObject>;
    /// Every object key currently in the bucket, in storage order
    async fn list(&self) -> Result<Vec<String>>;
    async fn download(&self, key: &str) -> Result<Bytes>;
    fn public_url(&self, storage_path: &str) -> String;
    async fn health(&self) -> bool;
}

pub struct S3StorageService {
    client: Client,
    bucket: String,
    prefix: String,
    public_base: Url,
}

impl S3StorageService {
    pub fn new(client: Client, bucket: String, prefix: String, public_base: Url) -> Self {
        Self {
            client,
            bucket,
            prefix,
            public_base,
        }
    }

    fn key_for(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        let res = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match res {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(anyhow::anyhow!(service_error))
                }
            }
        }
    }
}

#[async_trait]
impl StorageService for S3StorageService {
    async fn put(&self, name: &str, data: Bytes, content_type: &str) -> Result<StoredObject> {
        let key = self.key_for(name);

        if self.object_exists(&key).await? {
            return Err(StorageError::AlreadyExists(key).into());
        }

        // If-None-Match closes the window between the head check and the write
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(content_type)
            .if_none_match("*")
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|| format!("put_object failed for '{}'", key))?;

        Ok(StoredObject {
            name: name.to_string(),
            public_url: self.public_url(&key),
            storage_path: key,
        })
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut objects = Vec::new();
        let mut continuation_token = None;

        loop {
            let res = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.prefix)
                .set_continuation_token(continuation_token)
                .send()
                .await
                .with_context(|| format!("list_objects_v2 failed for bucket '{}'", self.bucket))?;

            if let Some(contents) = res.contents {
                for object in contents {
                    if let Some(key) = object.key {
                        objects.push(key);
                    }
                }
            }

            if res.is_truncated.unwrap_or(false) {
                continuation_token = res.next_continuation_token;
            } else {
                break;
            }
        }

        Ok(objects)
    }

    async fn download(&self, key: &str) -> Result<Bytes> {
        let res = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("get_object failed for '{}'", key))?;
        let data = res.body.collect().await?.into_bytes();
        Ok(data)
    }

    fn public_url(&self, storage_path: &str) -> String {
        public_object_url(&self.public_base, &self.bucket, storage_path)
    }

    async fn health(&self) -> bool {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
    }
}

/// `<base>/<bucket>/<path>` with every path segment percent-encoded
pub fn public_object_url(base: &Url, bucket: &str, storage_path: &str) -> String {
    let mut url = base.clone();
    match url.path_segments_mut() {
        Ok(mut segments) => {
            segments.pop_if_empty().push(bucket);
            for segment in storage_path.split('/').filter(|s| !s.is_empty()) {
                segments.push(segment);
            }
        }
        Err(()) => {
            return format!(
                "{}/{}/{}",
                base.as_str().trim_end_matches('/'),
                bucket,
                storage_path
            );
        }
    }
    url.to_string()
}

/// Stand-in used when storage credentials are absent. The process keeps
/// running; every storage call fails at request time.
pub struct UnconfiguredStorage {
    missing: Vec<&'static str>,
}

impl UnconfiguredStorage {
    pub fn new(missing: Vec<&'static str>) -> Self {
        Self { missing }
    }

    fn error(&self) -> anyhow::Error {
        StorageError::NotConfigured(self.missing.join(", ")).into()
    }
}

#[async_trait]
impl StorageService for UnconfiguredStorage {
    async fn put(&self, _name: &str, _data: Bytes, _content_type: &str) -> Result<StoredObject> {
        Err(self.error())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Err(self.error())
    }

    async fn download(&self, _key: &str) -> Result<Bytes> {
        Err(self.error())
    }

    fn public_url(&self, storage_path: &str) -> String {
        storage_path.to_string()
    }

    async fn health(&self) -> bool {
        false
    }
}
