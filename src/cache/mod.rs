//! Cache chain traits and types.
//!
//! A cache chain is a singly linked list of nodes, each implementing the
//! [`Cache`] interface and optionally holding one upstream node:
//!
//! - [`FsCache`] - local disk cache, misses delegated to the upstream
//! - [`FsLimitedCache`] - local disk cache with a size bound and eviction
//! - [`FsCompressionCache`] - gzip pass-through decorator
//! - [`S3Cache`] - S3-backed remote cache, always the end of a chain
//! - [`ReadOnlyCache`] - wrapper that rejects writes
//!
//! Calls enter at the outermost node and recurse toward the upstream until
//! satisfied or the chain is exhausted. `put` always writes locally first,
//! then propagates to the upstream synchronously (write-through).

mod compression;
mod factory;
mod fs_cache;
mod index;
mod kv;
mod limited_cache;
mod multipart;
mod readonly;
mod s3_cache;

pub use compression::FsCompressionCache;
pub use factory::new_cache;
pub use fs_cache::FsCache;
pub use index::{CacheIndex, IndexRecord};
pub use kv::{KeyValueDb, KeyValueDbError, LmdbKeyValueDb};
pub use limited_cache::FsLimitedCache;
pub use multipart::{MultipartSink, PartUploader, UploadedPart};
pub use readonly::ReadOnlyCache;
pub use s3_cache::{S3Cache, S3CacheConfig};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in cache operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache index error: {0}")]
    Index(#[from] KeyValueDbError),

    #[error("metadata encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("invalid cache key: '{0}'")]
    InvalidKey(String),

    #[error("cache is read-only")]
    ReadOnly,

    #[error("invalid cache configuration: {0}")]
    Config(String),

    #[error("transfer integrity failure for '{key}': {message}")]
    Integrity { key: String, message: String },

    #[error("cache inconsistency: {0}")]
    Inconsistent(String),
}

// =============================================================================
// Metadata
// =============================================================================

/// Open-ended key/value metadata associated with a cache key.
///
/// Persisted as a JSON sidecar by filesystem caches and as object metadata
/// by remote caches.
pub type Metadata = BTreeMap<String, String>;

/// Metadata key holding the hex-encoded SHA-256 hash of the content.
///
/// Stored explicitly because multipart uploads do not produce a content
/// hash ETag.
pub const META_CONTENT_HASH: &str = "content-hash";

/// Metadata key holding the content encoding (`gzip` for compressed writes).
pub const META_CONTENT_ENCODING: &str = "content-encoding";

// =============================================================================
// Locations, readers, sinks
// =============================================================================

/// Where a cached artifact can be read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// An absolute path on the local filesystem.
    Local(PathBuf),
    /// A URL (pre-signed or CDN-fronted) for a remote object.
    Url(String),
}

/// A streamed read of a cached artifact.
pub type CacheReader = Box<dyn AsyncRead + Send + Unpin>;

/// An entry returned by [`Cache::list`].
#[derive(Debug, Clone, Default)]
pub struct ListEntry {
    /// Size of the stored object in bytes.
    pub size: u64,
    /// Metadata available without fetching the object body.
    pub metadata: Metadata,
}

/// An incremental write into a cache.
///
/// Data handed to [`write`](CacheSink::write) is not visible under the key
/// until [`close`](CacheSink::close) settles it. Dropping a sink without
/// closing discards the partial write.
#[async_trait]
pub trait CacheSink: Send {
    /// Append data to the pending write.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Settle the write: make it visible, record bookkeeping, and propagate
    /// to the upstream. Returns the local path for filesystem caches.
    async fn close(self: Box<Self>) -> Result<Option<PathBuf>>;
}

/// The source of a [`Cache::put`]: a local file or a readable stream.
pub enum PutSource {
    Path(PathBuf),
    Reader(CacheReader),
}

impl PutSource {
    async fn into_reader(self) -> Result<CacheReader> {
        match self {
            PutSource::Path(path) => {
                let file = tokio::fs::File::open(&path).await?;
                Ok(Box::new(file))
            }
            PutSource::Reader(reader) => Ok(reader),
        }
    }
}

impl From<PathBuf> for PutSource {
    fn from(path: PathBuf) -> Self {
        PutSource::Path(path)
    }
}

impl From<Vec<u8>> for PutSource {
    fn from(data: Vec<u8>) -> Self {
        PutSource::Reader(Box::new(std::io::Cursor::new(data)))
    }
}

/// Copy buffer size for `put` and upstream pulls.
const COPY_BUF_SIZE: usize = 64 * 1024;

// =============================================================================
// Cache Trait
// =============================================================================

/// The capability interface shared by every node in a cache chain.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Where the artifact can be read from, if anywhere in the chain.
    ///
    /// Read-only: never copies data between levels.
    async fn path(&self, key: &str) -> Result<Option<Location>>;

    /// Whether the key is present (and, if `content_hash` is given, whether
    /// the stored content matches it).
    async fn has(&self, key: &str, content_hash: Option<&str>) -> Result<bool>;

    /// Materialize the artifact locally, pulling it from the upstream on a
    /// local miss. Returns `None` if the key is nowhere in the chain.
    async fn get(&self, key: &str) -> Result<Option<PathBuf>>;

    /// Stream the artifact without materializing it locally.
    async fn get_stream(&self, key: &str) -> Result<Option<CacheReader>>;

    /// Store an artifact under the key, writing through to the upstream.
    ///
    /// Returns the local path for filesystem caches.
    async fn put(
        &self,
        source: PutSource,
        key: &str,
        metadata: Option<Metadata>,
    ) -> Result<Option<PathBuf>> {
        let mut reader = source.into_reader().await?;
        let mut sink = self.put_stream(key, metadata).await?;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            sink.write(&buf[..n]).await?;
        }
        sink.close().await
    }

    /// Open an incremental write under the key.
    async fn put_stream(&self, key: &str, metadata: Option<Metadata>) -> Result<Box<dyn CacheSink>>;

    /// Metadata stored for the key, or an empty map if none.
    async fn metadata(&self, key: &str) -> Result<Metadata>;

    /// Remove the key if present. Removing an absent key is a no-op.
    ///
    /// With `propagate`, also removes from the upstream.
    async fn remove(&self, key: &str, propagate: bool) -> Result<()>;

    /// List stored entries. Authoritative on remote nodes; local nodes
    /// delegate to their upstream.
    async fn list(&self) -> Result<BTreeMap<String, ListEntry>>;

    /// Delete all cached content, recursing to the upstream.
    async fn clean(&self) -> Result<()>;

    /// Consistency check between bookkeeping and stored files.
    ///
    /// A maintenance operation; nodes without bookkeeping return `Ok(())`.
    async fn verify(&self) -> Result<()> {
        Ok(())
    }
}
