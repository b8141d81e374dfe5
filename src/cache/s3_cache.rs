//! S3-backed remote cache node.
//!
//! Adapts the chain interface to an S3 bucket. `get()` is unsupported -
//! a remote node has no local place to put a fetched file, so it always
//! sits behind a local node that calls `get_stream` and materializes the
//! result. Uses the standard AWS credential chain.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ObjectCannedAcl};
use bytes::Bytes;
use tracing::debug;

use super::multipart::{MultipartSink, PartUploader, UploadedPart};
use super::{
    Cache, CacheReader, CacheSink, Error, ListEntry, Location, META_CONTENT_HASH, Metadata, Result,
};

/// Lifetime of a pre-signed URL.
const SIGNED_URL_TTL: Duration = Duration::from_secs(300);

/// Stored keys never carry the compression suffix; the compression layer's
/// renaming is undone here so bucket layouts stay uniform and sniffing on
/// read decides the actual encoding.
const GZIP_SUFFIX: &str = ".gz";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for [`S3Cache`].
#[derive(Debug, Clone)]
pub struct S3CacheConfig {
    /// S3 bucket name.
    pub bucket: String,
    /// Optional key prefix within the bucket.
    pub prefix: Option<String>,
    /// Optional custom endpoint URL (for LocalStack, MinIO, etc.).
    pub endpoint_url: Option<String>,
    /// Optional region override.
    pub region: Option<String>,
    /// Optional CDN base URL fronting the bucket; when set, `path()` returns
    /// CDN URLs instead of pre-signed S3 URLs.
    pub cdn_url: Option<String>,
    /// Make uploaded objects publicly readable after completion.
    pub public: bool,
}

impl S3CacheConfig {
    /// Create a new config with just a bucket name.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: None,
            endpoint_url: None,
            region: None,
            cdn_url: None,
            public: false,
        }
    }

    /// Set the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set a custom endpoint URL (for LocalStack, MinIO, etc.).
    pub fn with_endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    /// Set a region override.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set a CDN base URL.
    pub fn with_cdn_url(mut self, url: impl Into<String>) -> Self {
        self.cdn_url = Some(url.into());
        self
    }

    /// Make uploads publicly readable.
    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }
}

// =============================================================================
// S3Cache
// =============================================================================

/// A cache node backed by an S3 bucket.
pub struct S3Cache {
    client: Client,
    config: S3CacheConfig,
}

impl S3Cache {
    /// Create a new S3 cache with the given configuration.
    ///
    /// Uses the standard AWS credential chain (env vars, ~/.aws, IAM roles).
    pub async fn new(config: S3CacheConfig) -> Self {
        let mut aws_config_loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(ref region) = config.region {
            aws_config_loader =
                aws_config_loader.region(aws_sdk_s3::config::Region::new(region.clone()));
        }

        let aws_config = aws_config_loader.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if let Some(ref endpoint) = config.endpoint_url {
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint)
                .force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());
        Self { client, config }
    }

    /// Map a chain key to a bucket key: strip any compression suffix, apply
    /// the configured prefix.
    fn to_key(&self, key: &str) -> String {
        let key = key.strip_suffix(GZIP_SUFFIX).unwrap_or(key);
        match &self.config.prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
            None => key.to_string(),
        }
    }

    /// Map a bucket key back to a chain key.
    fn to_relative(&self, key: &str) -> String {
        let stripped = match &self.config.prefix {
            Some(prefix) => {
                let stripped = key.strip_prefix(prefix.trim_end_matches('/')).unwrap_or(key);
                stripped.strip_prefix('/').unwrap_or(stripped)
            }
            None => key,
        };
        stripped.to_string()
    }

    /// Whether a relative bucket key is a dataset-level entry.
    ///
    /// Keys with more than one extra path segment are partition sub-files,
    /// and keys whose final segment starts with `_` are reserved.
    fn is_dataset_entry(relative: &str) -> bool {
        let segments: Vec<&str> = relative.split('/').filter(|s| !s.is_empty()).collect();
        match segments.last() {
            None => false,
            Some(last) if last.starts_with('_') => false,
            Some(_) => segments.len() <= 2,
        }
    }
}

fn is_not_found<E>(err: &SdkError<E>) -> bool {
    matches!(err, SdkError::ServiceError(e) if e.raw().status().as_u16() == 404)
}

fn remote_err<E: std::fmt::Debug>(err: SdkError<E>) -> Error {
    Error::Remote(format!("{:?}", err))
}

#[async_trait]
impl Cache for S3Cache {
    async fn path(&self, key: &str) -> Result<Option<Location>> {
        let bucket_key = self.to_key(key);

        if let Some(cdn) = &self.config.cdn_url {
            return Ok(Some(Location::Url(format!(
                "{}/{}",
                cdn.trim_end_matches('/'),
                bucket_key
            ))));
        }

        let presigning = PresigningConfig::expires_in(SIGNED_URL_TTL)
            .map_err(|e| Error::Remote(e.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(&bucket_key)
            .presigned(presigning)
            .await
            .map_err(remote_err)?;

        Ok(Some(Location::Url(request.uri().to_string())))
    }

    async fn has(&self, key: &str, content_hash: Option<&str>) -> Result<bool> {
        let bucket_key = self.to_key(key);

        let head = self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(&bucket_key)
            .send()
            .await;

        let output = match head {
            Ok(output) => output,
            Err(err) if is_not_found(&err) => return Ok(false),
            Err(err) => return Err(remote_err(err)),
        };

        match content_hash {
            None => Ok(true),
            // Multipart uploads do not produce a content-hash ETag, so the
            // hash is checked against explicitly stored object metadata.
            Some(expected) => Ok(output
                .metadata()
                .and_then(|m| m.get(META_CONTENT_HASH))
                .is_some_and(|stored| stored == expected)),
        }
    }

    async fn get(&self, _key: &str) -> Result<Option<PathBuf>> {
        Err(Error::Unsupported(
            "get on a remote cache; use get_stream behind a local cache",
        ))
    }

    async fn get_stream(&self, key: &str) -> Result<Option<CacheReader>> {
        let bucket_key = self.to_key(key);

        let response = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(&bucket_key)
            .send()
            .await;

        let output = match response {
            Ok(output) => output,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(remote_err(err)),
        };

        // Buffer the object and hand it back seekable from position 0.
        let aggregated = output
            .body
            .collect()
            .await
            .map_err(|e| Error::Remote(e.to_string()))?;
        let bytes = aggregated.into_bytes();
        debug!(key, size = bytes.len(), "fetched object from remote");

        Ok(Some(Box::new(std::io::Cursor::new(bytes))))
    }

    async fn put_stream(&self, key: &str, metadata: Option<Metadata>) -> Result<Box<dyn CacheSink>> {
        let bucket_key = self.to_key(key);
        let metadata = metadata.unwrap_or_default();

        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(&bucket_key)
            .set_metadata(Some(metadata.into_iter().collect()))
            .send()
            .await
            .map_err(remote_err)?;

        let upload_id = create
            .upload_id()
            .ok_or_else(|| Error::Remote("multipart upload created without an id".to_string()))?
            .to_string();
        debug!(key, upload_id, "multipart upload started");

        let uploader = S3PartUploader {
            client: self.client.clone(),
            bucket: self.config.bucket.clone(),
            key: bucket_key,
            upload_id,
            public: self.config.public,
        };
        Ok(Box::new(MultipartSink::new(Arc::new(uploader))))
    }

    async fn metadata(&self, key: &str) -> Result<Metadata> {
        let bucket_key = self.to_key(key);

        let head = self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(&bucket_key)
            .send()
            .await;

        match head {
            Ok(output) => Ok(output
                .metadata()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default()),
            Err(err) if is_not_found(&err) => Ok(Metadata::new()),
            Err(err) => Err(remote_err(err)),
        }
    }

    async fn remove(&self, key: &str, _propagate: bool) -> Result<()> {
        let bucket_key = self.to_key(key);

        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&bucket_key)
            .send()
            .await
            .map_err(remote_err)?;
        Ok(())
    }

    async fn list(&self) -> Result<BTreeMap<String, ListEntry>> {
        let mut entries = BTreeMap::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.config.bucket);
            if let Some(prefix) = &self.config.prefix {
                request = request.prefix(format!("{}/", prefix.trim_end_matches('/')));
            }
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(remote_err)?;

            for obj in response.contents() {
                let Some(bucket_key) = obj.key() else {
                    continue;
                };
                let relative = self.to_relative(bucket_key);
                if !Self::is_dataset_entry(&relative) {
                    continue;
                }
                let display = relative
                    .strip_suffix(GZIP_SUFFIX)
                    .unwrap_or(&relative)
                    .to_string();
                entries.insert(
                    display,
                    ListEntry {
                        size: obj.size().unwrap_or(0) as u64,
                        metadata: Metadata::new(),
                    },
                );
            }

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        Ok(entries)
    }

    async fn clean(&self) -> Result<()> {
        // A remote bucket is shared, authoritative storage; a local clean
        // never wipes it.
        debug!("clean is a no-op on a remote cache");
        Ok(())
    }
}

// =============================================================================
// S3PartUploader
// =============================================================================

/// The S3 side of a multipart upload, driven by [`MultipartSink`].
struct S3PartUploader {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    public: bool,
}

#[async_trait]
impl PartUploader for S3PartUploader {
    async fn upload_part(&self, part_number: i32, data: Bytes) -> Result<UploadedPart> {
        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(remote_err)?;

        let etag = response
            .e_tag()
            .ok_or_else(|| Error::Remote(format!("part {} acknowledged without etag", part_number)))?
            .to_string();
        Ok(UploadedPart { part_number, etag })
    }

    async fn complete(&self, parts: Vec<UploadedPart>) -> Result<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|p| {
                        CompletedPart::builder()
                            .part_number(p.part_number)
                            .e_tag(p.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(remote_err)?;

        if self.public {
            self.client
                .put_object_acl()
                .bucket(&self.bucket)
                .key(&self.key)
                .acl(ObjectCannedAcl::PublicRead)
                .send()
                .await
                .map_err(remote_err)?;
        }
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(remote_err)?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
