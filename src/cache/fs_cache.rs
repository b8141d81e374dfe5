//! Local disk cache node.
//!
//! FsCache stores files under a root directory and delegates misses to an
//! optional upstream node. Writes are write-through: a put settles locally
//! first, then propagates to the upstream before the call returns.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::{
    Cache, CacheReader, CacheSink, Error, ListEntry, Location, META_CONTENT_HASH, Metadata,
    PutSource, Result,
};

/// Subdirectory holding metadata sidecars. Excluded from content accounting.
pub(crate) const META_DIR: &str = ".meta";

/// Subdirectory holding the eviction index. Excluded from content accounting.
pub(crate) const INDEX_DIR: &str = ".index";

/// Suffix for in-flight writes. A file only appears at its final key once
/// the write settles; dropped sinks leave nothing behind.
pub(crate) const PARTIAL_SUFFIX: &str = ".partial";

const COPY_BUF_SIZE: usize = 64 * 1024;

// =============================================================================
// Key and path helpers
// =============================================================================

/// Validate a cache key: relative, non-empty, no parent traversal, and not
/// reaching into the reserved dot-directories.
pub(crate) fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') {
        return Err(Error::InvalidKey(key.to_string()));
    }
    let mut components = key.split('/');
    if components.clone().any(|c| c.is_empty() || c == "..") {
        return Err(Error::InvalidKey(key.to_string()));
    }
    if components.next().is_some_and(|first| first.starts_with('.')) {
        return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Absolute on-disk path for a key under a cache root.
pub(crate) fn object_path(root: &Path, key: &str) -> Result<PathBuf> {
    check_key(key)?;
    Ok(root.join(key))
}

fn sidecar_path(root: &Path, key: &str) -> Result<PathBuf> {
    check_key(key)?;
    Ok(root.join(META_DIR).join(format!("{}.json", key)))
}

/// Persist a metadata sidecar for a key.
pub(crate) async fn write_sidecar(root: &Path, key: &str, metadata: &Metadata) -> Result<()> {
    let path = sidecar_path(root, key)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let encoded = serde_json::to_vec_pretty(metadata)?;
    fs::write(&path, encoded).await?;
    Ok(())
}

/// Read the metadata sidecar for a key, if present.
pub(crate) async fn read_sidecar(root: &Path, key: &str) -> Result<Option<Metadata>> {
    let path = sidecar_path(root, key)?;
    match fs::read(&path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn remove_sidecar(root: &Path, key: &str) -> Result<()> {
    let path = sidecar_path(root, key)?;
    match fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Hex-encoded SHA-256 of a file's contents.
pub(crate) async fn file_hash(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Collect the relative POSIX paths of all content files under a cache root,
/// excluding the reserved dot-directories and in-flight partial writes.
pub(crate) async fn collect_files(root: &Path) -> Result<BTreeSet<String>> {
    let mut files = BTreeSet::new();
    collect_dir(root, root, &mut files).await?;
    Ok(files)
}

async fn collect_dir(root: &Path, dir: &Path, files: &mut BTreeSet<String>) -> Result<()> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            if path.parent() == Some(root) && name.starts_with('.') {
                continue;
            }
            Box::pin(collect_dir(root, &path, files)).await?;
        } else if file_type.is_file() {
            if name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let relative = path
                .strip_prefix(root)
                .map_err(|_| Error::Inconsistent(format!("path escapes root: {:?}", path)))?;
            files.insert(relative.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

// =============================================================================
// FsFileSink
// =============================================================================

/// Low-level file sink: writes to a temp path, renames into place on finish.
///
/// If the sink is dropped without finishing, the temp file is removed so no
/// partial artifact is ever visible at the final key.
pub(crate) struct FsFileSink {
    final_path: PathBuf,
    temp_path: PathBuf,
    file: Option<fs::File>,
    hasher: Sha256,
    written: u64,
    settled: bool,
}

impl FsFileSink {
    pub(crate) async fn create(final_path: PathBuf) -> Result<Self> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut temp_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        temp_name.push_str(PARTIAL_SUFFIX);
        let temp_path = final_path.with_file_name(temp_name);
        let file = fs::File::create(&temp_path).await?;
        Ok(Self {
            final_path,
            temp_path,
            file: Some(file),
            hasher: Sha256::new(),
            written: 0,
            settled: false,
        })
    }

    pub(crate) async fn write(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Inconsistent("write after finish".to_string()))?;
        file.write_all(data).await?;
        self.hasher.update(data);
        self.written += data.len() as u64;
        Ok(())
    }

    /// Settle the write: flush, rename into place, and return
    /// `(path, size, content_hash)`.
    pub(crate) async fn finish(&mut self) -> Result<(PathBuf, u64, String)> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        fs::rename(&self.temp_path, &self.final_path).await?;
        self.settled = true;
        let hash = format!("{:x}", self.hasher.finalize_reset());
        Ok((self.final_path.clone(), self.written, hash))
    }
}

impl Drop for FsFileSink {
    fn drop(&mut self) {
        if !self.settled {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

// =============================================================================
// FsCache
// =============================================================================

/// A cache node backed by a local directory.
pub struct FsCache {
    root: PathBuf,
    upstream: Option<Arc<dyn Cache>>,
    upstream_writable: bool,
}

impl FsCache {
    /// Create a cache rooted at the given directory, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            upstream: None,
            upstream_writable: true,
        })
    }

    /// Create a cache with an upstream node to delegate misses to.
    pub fn with_upstream(root: impl Into<PathBuf>, upstream: Arc<dyn Cache>) -> Result<Self> {
        let mut cache = Self::new(root)?;
        cache.upstream = Some(upstream);
        Ok(cache)
    }

    /// Mark the upstream as read-only: puts settle locally but are not
    /// propagated.
    pub fn upstream_readonly(mut self) -> Self {
        self.upstream_writable = false;
        self
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn upstream(&self) -> Option<&Arc<dyn Cache>> {
        self.upstream.as_ref()
    }

    pub(crate) fn upstream_writable(&self) -> bool {
        self.upstream_writable
    }

    /// The on-disk path for a key if the file exists locally.
    pub(crate) async fn local_path(&self, key: &str) -> Result<Option<PathBuf>> {
        let path = object_path(&self.root, key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(path)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a key from the upstream into the local directory.
    ///
    /// Returns the local path and size, or `None` if there is no upstream or
    /// the upstream does not have the key.
    pub(crate) async fn pull_from_upstream(&self, key: &str) -> Result<Option<(PathBuf, u64)>> {
        let Some(upstream) = &self.upstream else {
            return Ok(None);
        };
        let Some(mut stream) = upstream.get_stream(key).await? else {
            return Ok(None);
        };
        debug!(key, "cache miss, copying from upstream");

        let mut sink = FsFileSink::create(object_path(&self.root, key)?).await?;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            sink.write(&buf[..n]).await?;
        }
        let (path, size, _hash) = sink.finish().await?;

        // Post-copy existence check, guarding against partial writes.
        if fs::metadata(&path).await.is_err() {
            return Err(Error::Integrity {
                key: key.to_string(),
                message: "file missing after copy from upstream".to_string(),
            });
        }

        let metadata = upstream.metadata(key).await.unwrap_or_default();
        if !metadata.is_empty() {
            write_sidecar(&self.root, key, &metadata).await?;
        }

        Ok(Some((path, size)))
    }

    /// Remove the local file and its sidecar. Returns whether a file existed.
    pub(crate) async fn remove_local(&self, key: &str) -> Result<bool> {
        let path = object_path(&self.root, key)?;
        remove_sidecar(&self.root, key).await?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the entire cache directory tree and recreate it empty.
    pub(crate) async fn wipe(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }
}

#[async_trait]
impl Cache for FsCache {
    async fn path(&self, key: &str) -> Result<Option<Location>> {
        if let Some(path) = self.local_path(key).await? {
            return Ok(Some(Location::Local(path)));
        }
        match &self.upstream {
            Some(upstream) => upstream.path(key).await,
            None => Ok(None),
        }
    }

    async fn has(&self, key: &str, content_hash: Option<&str>) -> Result<bool> {
        if let Some(path) = self.local_path(key).await? {
            return match content_hash {
                None => Ok(true),
                Some(expected) => Ok(file_hash(&path).await? == expected),
            };
        }
        match &self.upstream {
            Some(upstream) => upstream.has(key, content_hash).await,
            None => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<PathBuf>> {
        if let Some(path) = self.local_path(key).await? {
            debug!(key, "cache hit");
            return Ok(Some(path));
        }
        Ok(self.pull_from_upstream(key).await?.map(|(path, _)| path))
    }

    async fn get_stream(&self, key: &str) -> Result<Option<CacheReader>> {
        if let Some(path) = self.local_path(key).await? {
            let file = fs::File::open(&path).await?;
            return Ok(Some(Box::new(file)));
        }
        match &self.upstream {
            Some(upstream) => upstream.get_stream(key).await,
            None => Ok(None),
        }
    }

    async fn put_stream(&self, key: &str, metadata: Option<Metadata>) -> Result<Box<dyn CacheSink>> {
        let inner = FsFileSink::create(object_path(&self.root, key)?).await?;
        Ok(Box::new(FsCacheSink {
            inner,
            key: key.to_string(),
            metadata: metadata.unwrap_or_default(),
            root: self.root.clone(),
            upstream: self.upstream.clone(),
            upstream_writable: self.upstream_writable,
        }))
    }

    async fn metadata(&self, key: &str) -> Result<Metadata> {
        if let Some(metadata) = read_sidecar(&self.root, key).await? {
            return Ok(metadata);
        }
        if self.local_path(key).await?.is_none()
            && let Some(upstream) = &self.upstream
        {
            return upstream.metadata(key).await;
        }
        Ok(Metadata::new())
    }

    async fn remove(&self, key: &str, propagate: bool) -> Result<()> {
        let existed = self.remove_local(key).await?;
        if existed {
            debug!(key, "removed from cache");
        }
        if propagate && let Some(upstream) = &self.upstream {
            upstream.remove(key, propagate).await?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<BTreeMap<String, ListEntry>> {
        match &self.upstream {
            Some(upstream) => upstream.list().await,
            None => Err(Error::Unsupported("list on a local cache with no upstream")),
        }
    }

    async fn clean(&self) -> Result<()> {
        self.wipe().await?;
        if let Some(upstream) = &self.upstream {
            upstream.clean().await?;
        }
        Ok(())
    }

    async fn verify(&self) -> Result<()> {
        match &self.upstream {
            Some(upstream) => upstream.verify().await,
            None => Ok(()),
        }
    }
}

// =============================================================================
// FsCacheSink
// =============================================================================

/// Write-through sink for [`FsCache`]: settles the local file on close, then
/// propagates to the upstream unless the upstream is read-only.
struct FsCacheSink {
    inner: FsFileSink,
    key: String,
    metadata: Metadata,
    root: PathBuf,
    upstream: Option<Arc<dyn Cache>>,
    upstream_writable: bool,
}

#[async_trait]
impl CacheSink for FsCacheSink {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write(data).await
    }

    async fn close(mut self: Box<Self>) -> Result<Option<PathBuf>> {
        let (path, _size, hash) = self.inner.finish().await?;

        self.metadata
            .entry(META_CONTENT_HASH.to_string())
            .or_insert(hash);
        write_sidecar(&self.root, &self.key, &self.metadata).await?;

        if let Some(upstream) = &self.upstream
            && self.upstream_writable
        {
            debug!(key = %self.key, "propagating write to upstream");
            upstream
                .put(
                    PutSource::Path(path.clone()),
                    &self.key,
                    Some(self.metadata.clone()),
                )
                .await?;
        }

        Ok(Some(path))
    }
}

// =============================================================================
// Tests
// =============================================================================
