//! Size-bounded local cache.
//!
//! Extends the local disk cache with space accounting backed by an embedded
//! index of `(path, size, time)` records. When the tracked total would
//! exceed the configured maximum, the oldest-by-insertion-time entries are
//! evicted until there is headroom. Eviction is greedy and approximate: the
//! scan stops as soon as the accumulated sizes cover the overage, and a
//! failed deletion is logged and skipped rather than aborting the write
//! that triggered it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tracing::{info, warn};

use super::fs_cache::{
    self, FsCache, FsFileSink, INDEX_DIR, object_path, write_sidecar,
};
use super::index::CacheIndex;
use super::kv::LmdbKeyValueDb;
use super::{
    Cache, CacheReader, CacheSink, Error, ListEntry, Location, META_CONTENT_HASH, Metadata,
    PutSource, Result,
};

// =============================================================================
// Eviction
// =============================================================================

/// Evict oldest entries until the tracked total fits under `maxsize`.
///
/// The entry whose write triggered the eviction (`exempt`) is never evicted
/// to make room for itself, so a single file larger than the whole bound
/// still lands.
async fn free_up_space(index: &CacheIndex, root: &Path, maxsize: u64, exempt: &str) -> Result<()> {
    let tracked = index.total_size().await?;
    if tracked <= maxsize {
        return Ok(());
    }
    let overage = tracked - maxsize;

    let mut freed = 0u64;
    for record in index.oldest_first().await? {
        if freed >= overage {
            break;
        }
        if record.path == exempt {
            continue;
        }

        index.remove_record(&record.path).await?;
        let path = object_path(root, &record.path)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = %record.path, size = record.size, "evicted from cache");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %record.path, error = %e, "failed to delete evicted file");
            }
        }
        fs_cache::remove_sidecar(root, &record.path).await?;
        freed += record.size;
    }

    Ok(())
}

// =============================================================================
// FsLimitedCache
// =============================================================================

/// A local disk cache bounded to a maximum tracked size.
pub struct FsLimitedCache {
    fs: FsCache,
    index: CacheIndex,
    maxsize: u64,
}

impl FsLimitedCache {
    /// Create a size-bounded cache rooted at the given directory.
    ///
    /// `maxsize` is in bytes. The index lives in a reserved subdirectory of
    /// the cache root, excluded from content accounting.
    pub fn new(root: impl Into<PathBuf>, maxsize: u64) -> Result<Self> {
        let root = root.into();
        let fs = FsCache::new(&root)?;
        let db = Arc::new(LmdbKeyValueDb::new(&root.join(INDEX_DIR))?);
        Ok(Self {
            fs,
            index: CacheIndex::new(db),
            maxsize,
        })
    }

    /// Create a size-bounded cache with an upstream node.
    pub fn with_upstream(
        root: impl Into<PathBuf>,
        maxsize: u64,
        upstream: Arc<dyn Cache>,
    ) -> Result<Self> {
        let root = root.into();
        let mut cache = Self::new(root.clone(), maxsize)?;
        cache.fs = FsCache::with_upstream(root, upstream)?;
        Ok(cache)
    }

    /// Mark the upstream as read-only: puts settle locally but are not
    /// propagated.
    pub fn upstream_readonly(mut self) -> Self {
        self.fs = self.fs.upstream_readonly();
        self
    }

    /// The configured maximum tracked size in bytes.
    pub fn maxsize(&self) -> u64 {
        self.maxsize
    }

    /// The eviction index.
    pub fn index(&self) -> &CacheIndex {
        &self.index
    }
}

#[async_trait]
impl Cache for FsLimitedCache {
    async fn path(&self, key: &str) -> Result<Option<Location>> {
        self.fs.path(key).await
    }

    async fn has(&self, key: &str, content_hash: Option<&str>) -> Result<bool> {
        self.fs.has(key, content_hash).await
    }

    async fn get(&self, key: &str) -> Result<Option<PathBuf>> {
        if let Some(path) = self.fs.local_path(key).await? {
            return Ok(Some(path));
        }
        let Some((path, size)) = self.fs.pull_from_upstream(key).await? else {
            return Ok(None);
        };
        self.index.add_record(key, size).await?;
        free_up_space(&self.index, self.fs.root(), self.maxsize, key).await?;
        Ok(Some(path))
    }

    async fn get_stream(&self, key: &str) -> Result<Option<CacheReader>> {
        self.fs.get_stream(key).await
    }

    async fn put_stream(&self, key: &str, metadata: Option<Metadata>) -> Result<Box<dyn CacheSink>> {
        let inner = FsFileSink::create(object_path(self.fs.root(), key)?).await?;
        Ok(Box::new(LimitedCacheSink {
            inner,
            key: key.to_string(),
            metadata: metadata.unwrap_or_default(),
            root: self.fs.root().to_path_buf(),
            index: self.index.clone(),
            maxsize: self.maxsize,
            upstream: self.fs.upstream().cloned(),
            upstream_writable: self.fs.upstream_writable(),
        }))
    }

    async fn metadata(&self, key: &str) -> Result<Metadata> {
        self.fs.metadata(key).await
    }

    async fn remove(&self, key: &str, propagate: bool) -> Result<()> {
        // The index row goes first so accounting never claims a file that is
        // already gone.
        self.index.remove_record(key).await?;
        self.fs.remove(key, propagate).await
    }

    async fn list(&self) -> Result<BTreeMap<String, ListEntry>> {
        self.fs.list().await
    }

    async fn clean(&self) -> Result<()> {
        self.index.clear().await?;

        // Remove content while leaving the live index database in place.
        let mut entries = fs::read_dir(self.fs.root()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == INDEX_DIR {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(entry.path()).await?;
            } else {
                fs::remove_file(entry.path()).await?;
            }
        }

        if let Some(upstream) = self.fs.upstream() {
            upstream.clean().await?;
        }
        Ok(())
    }

    async fn verify(&self) -> Result<()> {
        let on_disk = fs_cache::collect_files(self.fs.root()).await?;
        let indexed = self.index.paths().await?;

        let unindexed: Vec<&String> = on_disk.difference(&indexed).collect();
        let missing: Vec<&String> = indexed.difference(&on_disk).collect();

        if !unindexed.is_empty() || !missing.is_empty() {
            return Err(Error::Inconsistent(format!(
                "files not in index: {:?}; indexed paths with no file: {:?}",
                unindexed, missing
            )));
        }
        Ok(())
    }
}

// =============================================================================
// LimitedCacheSink
// =============================================================================

/// Sink for [`FsLimitedCache`]: on close, settles the file, evicts to make
/// room, records the new entry, and then propagates upstream.
struct LimitedCacheSink {
    inner: FsFileSink,
    key: String,
    metadata: Metadata,
    root: PathBuf,
    index: CacheIndex,
    maxsize: u64,
    upstream: Option<Arc<dyn Cache>>,
    upstream_writable: bool,
}

#[async_trait]
impl CacheSink for LimitedCacheSink {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write(data).await
    }

    async fn close(mut self: Box<Self>) -> Result<Option<PathBuf>> {
        let (path, size, hash) = self.inner.finish().await?;
        self.index.add_record(&self.key, size).await?;

        self.metadata
            .entry(META_CONTENT_HASH.to_string())
            .or_insert(hash);
        write_sidecar(&self.root, &self.key, &self.metadata).await?;

        // Local eviction must not run until the write is durable upstream.
        if let Some(upstream) = &self.upstream
            && self.upstream_writable
        {
            upstream
                .put(
                    PutSource::Path(path.clone()),
                    &self.key,
                    Some(self.metadata.clone()),
                )
                .await?;
        }

        free_up_space(&self.index, &self.root, self.maxsize, &self.key).await?;

        Ok(Some(path))
    }
}

// =============================================================================
// Tests
// =============================================================================
