//! Read-only cache view.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::{
    Cache, CacheReader, CacheSink, Error, ListEntry, Location, Metadata, PutSource, Result,
};

/// A wrapper that delegates reads and rejects every mutation.
pub struct ReadOnlyCache {
    inner: Arc<dyn Cache>,
}

impl ReadOnlyCache {
    /// Wrap a cache in a read-only view.
    pub fn new(inner: Arc<dyn Cache>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Cache for ReadOnlyCache {
    async fn path(&self, key: &str) -> Result<Option<Location>> {
        self.inner.path(key).await
    }

    async fn has(&self, key: &str, content_hash: Option<&str>) -> Result<bool> {
        self.inner.has(key, content_hash).await
    }

    async fn get(&self, key: &str) -> Result<Option<PathBuf>> {
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str) -> Result<Option<CacheReader>> {
        self.inner.get_stream(key).await
    }

    async fn put(
        &self,
        _source: PutSource,
        _key: &str,
        _metadata: Option<Metadata>,
    ) -> Result<Option<PathBuf>> {
        Err(Error::ReadOnly)
    }

    async fn put_stream(
        &self,
        _key: &str,
        _metadata: Option<Metadata>,
    ) -> Result<Box<dyn CacheSink>> {
        Err(Error::ReadOnly)
    }

    async fn metadata(&self, key: &str) -> Result<Metadata> {
        self.inner.metadata(key).await
    }

    async fn remove(&self, _key: &str, _propagate: bool) -> Result<()> {
        Err(Error::ReadOnly)
    }

    async fn list(&self) -> Result<BTreeMap<String, ListEntry>> {
        self.inner.list().await
    }

    async fn clean(&self) -> Result<()> {
        Err(Error::ReadOnly)
    }

    async fn verify(&self) -> Result<()> {
        self.inner.verify().await
    }
}
