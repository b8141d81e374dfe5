//! Gzip pass-through decorator.
//!
//! No independent storage: every operation delegates to a single upstream
//! after key renaming (`key` -> `key.gz`) and stream wrapping. Reads sniff
//! the gzip magic number rather than trusting the suffix, because content
//! may have been stored uncompressed despite the naming convention.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::fs_cache::FsFileSink;
use super::{
    Cache, CacheReader, CacheSink, ListEntry, Location, META_CONTENT_ENCODING, Metadata, Result,
};

/// Gzip stream magic number.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Suffix appended to stored keys.
const GZIP_SUFFIX: &str = ".gz";

fn is_gzip(head: &[u8]) -> bool {
    head.len() >= 2 && head[..2] == GZIP_MAGIC
}

/// Read up to two bytes from a stream, tolerating short reads.
async fn read_head(reader: &mut CacheReader) -> Result<Vec<u8>> {
    let mut head = [0u8; 2];
    let mut filled = 0;
    while filled < head.len() {
        let n = reader.read(&mut head[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(head[..filled].to_vec())
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    MultiGzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

// =============================================================================
// FsCompressionCache
// =============================================================================

/// A cache decorator that stores content gzip-compressed in its upstream.
pub struct FsCompressionCache {
    upstream: Arc<dyn Cache>,
}

impl FsCompressionCache {
    /// Wrap an upstream cache with transparent gzip compression.
    pub fn new(upstream: Arc<dyn Cache>) -> Self {
        Self { upstream }
    }

    /// The stored key for a logical key.
    fn rename(key: &str) -> String {
        if key.ends_with(GZIP_SUFFIX) {
            key.to_string()
        } else {
            format!("{}{}", key, GZIP_SUFFIX)
        }
    }
}

#[async_trait]
impl Cache for FsCompressionCache {
    async fn path(&self, key: &str) -> Result<Option<Location>> {
        self.upstream.path(&Self::rename(key)).await
    }

    async fn has(&self, key: &str, content_hash: Option<&str>) -> Result<bool> {
        let Some(expected) = content_hash else {
            return self.upstream.has(&Self::rename(key), None).await;
        };

        // The upstream's stored hash covers the compressed bytes; a logical
        // content hash has to be checked against the decompressed stream.
        let Some(mut stream) = self.get_stream(key).await? else {
            return Ok(false);
        };
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()) == expected)
    }

    async fn get(&self, key: &str) -> Result<Option<PathBuf>> {
        let Some(stored) = self.upstream.get(&Self::rename(key)).await? else {
            return Ok(None);
        };

        let data = tokio::fs::read(&stored).await?;
        if !is_gzip(&data) {
            // Stored uncompressed despite the suffix convention.
            return Ok(Some(stored));
        }

        // Materialize an uncompressed copy next to the stored file.
        let materialized = match stored.to_str() {
            Some(s) if s.ends_with(GZIP_SUFFIX) => {
                PathBuf::from(&s[..s.len() - GZIP_SUFFIX.len()])
            }
            _ => return Ok(Some(stored)),
        };
        let plain = decompress(&data)?;
        let mut sink = FsFileSink::create(materialized).await?;
        sink.write(&plain).await?;
        let (path, _, _) = sink.finish().await?;
        Ok(Some(path))
    }

    async fn get_stream(&self, key: &str) -> Result<Option<CacheReader>> {
        let Some(mut stream) = self.upstream.get_stream(&Self::rename(key)).await? else {
            return Ok(None);
        };

        let head = read_head(&mut stream).await?;
        if !is_gzip(&head) {
            // Already-uncompressed passthrough case.
            let chained = tokio::io::AsyncReadExt::chain(std::io::Cursor::new(head), stream);
            return Ok(Some(Box::new(chained)));
        }

        let mut compressed = head;
        stream.read_to_end(&mut compressed).await?;
        let plain = decompress(&compressed)?;
        Ok(Some(Box::new(std::io::Cursor::new(plain))))
    }

    async fn put_stream(&self, key: &str, metadata: Option<Metadata>) -> Result<Box<dyn CacheSink>> {
        let mut metadata = metadata.unwrap_or_default();
        metadata.insert(META_CONTENT_ENCODING.to_string(), "gzip".to_string());

        let upstream_sink = self
            .upstream
            .put_stream(&Self::rename(key), Some(metadata))
            .await?;
        Ok(Box::new(CompressionSink {
            upstream: upstream_sink,
            state: SinkState::Sniffing(Vec::new()),
        }))
    }

    async fn metadata(&self, key: &str) -> Result<Metadata> {
        self.upstream.metadata(&Self::rename(key)).await
    }

    async fn remove(&self, key: &str, propagate: bool) -> Result<()> {
        let renamed = Self::rename(key);

        // Clean up the uncompressed materialized copy left by get().
        if let Some(Location::Local(stored)) = self.upstream.path(&renamed).await?
            && let Some(s) = stored.to_str()
            && s.ends_with(GZIP_SUFFIX)
        {
            let materialized = &s[..s.len() - GZIP_SUFFIX.len()];
            match tokio::fs::remove_file(materialized).await {
                Ok(()) => debug!(key, "removed materialized copy"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.upstream.remove(&renamed, propagate).await
    }

    async fn list(&self) -> Result<BTreeMap<String, ListEntry>> {
        self.upstream.list().await
    }

    async fn clean(&self) -> Result<()> {
        self.upstream.clean().await
    }

    async fn verify(&self) -> Result<()> {
        self.upstream.verify().await
    }
}

// =============================================================================
// CompressionSink
// =============================================================================

enum SinkState {
    /// Buffering until enough bytes arrive to sniff the magic number.
    Sniffing(Vec<u8>),
    /// Source is already gzip; forward unchanged.
    Passthrough,
    /// Compressing into a buffer drained to the upstream sink per write.
    Compressing(GzEncoder<Vec<u8>>),
}

struct CompressionSink {
    upstream: Box<dyn CacheSink>,
    state: SinkState,
}

impl CompressionSink {
    async fn drain_encoder(&mut self) -> Result<()> {
        if let SinkState::Compressing(encoder) = &mut self.state {
            let pending = std::mem::take(encoder.get_mut());
            if !pending.is_empty() {
                self.upstream.write(&pending).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CacheSink for CompressionSink {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if let SinkState::Sniffing(buffered) = &mut self.state {
            buffered.extend_from_slice(data);
            if buffered.len() < GZIP_MAGIC.len() {
                return Ok(());
            }
            let buffered = std::mem::take(buffered);
            if is_gzip(&buffered) {
                self.state = SinkState::Passthrough;
                return self.upstream.write(&buffered).await;
            }
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&buffered)?;
            self.state = SinkState::Compressing(encoder);
            return self.drain_encoder().await;
        }

        match &mut self.state {
            SinkState::Passthrough => self.upstream.write(data).await,
            SinkState::Compressing(encoder) => {
                encoder.write_all(data)?;
                self.drain_encoder().await
            }
            SinkState::Sniffing(_) => unreachable!(),
        }
    }

    async fn close(self: Box<Self>) -> Result<Option<PathBuf>> {
        let mut upstream = self.upstream;
        match self.state {
            SinkState::Sniffing(buffered) => {
                // Too short to be gzip; compress whatever arrived.
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&buffered)?;
                let compressed = encoder.finish()?;
                upstream.write(&compressed).await?;
            }
            SinkState::Passthrough => {}
            SinkState::Compressing(encoder) => {
                let remaining = encoder.finish()?;
                if !remaining.is_empty() {
                    upstream.write(&remaining).await?;
                }
            }
        }
        upstream.close().await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::super::fs_cache::FsCache;
    use super::super::PutSource;
    use super::*;
    use tempfile::TempDir;

    fn gzip_bytes(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    async fn read_stream(cache: &dyn Cache, key: &str) -> Option<Vec<u8>> {
        let mut stream = cache.get_stream(key).await.unwrap()?;
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        Some(out)
    }

    fn create_chain() -> (TempDir, Arc<dyn Cache>, FsCompressionCache) {
        let temp = TempDir::new().unwrap();
        let upstream: Arc<dyn Cache> = Arc::new(FsCache::new(temp.path()).unwrap());
        let cache = FsCompressionCache::new(Arc::clone(&upstream));
        (temp, upstream, cache)
    }

    #[tokio::test]
    async fn test_round_trip_and_raw_storage_is_gzip() {
        let (temp, _upstream, cache) = create_chain();

        cache
            .put(PutSource::from(b"hello world".to_vec()), "k", None)
            .await
            .unwrap();

        // The raw stored object lives under the renamed key and starts with
        // the gzip magic number.
        let raw = std::fs::read(temp.path().join("k.gz")).unwrap();
        assert_eq!(&raw[..2], &GZIP_MAGIC);
        assert_eq!(decompress(&raw).unwrap(), b"hello world");

        // Reads are transparent.
        assert_eq!(read_stream(&cache, "k").await.unwrap(), b"hello world");
        assert!(cache.has("k", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_materializes_uncompressed_copy() {
        let (temp, _upstream, cache) = create_chain();

        cache
            .put(PutSource::from(b"bundle bytes".to_vec()), "d/b.db", None)
            .await
            .unwrap();

        let path = cache.get("d/b.db").await.unwrap().unwrap();
        assert_eq!(path, temp.path().join("d/b.db"));
        assert_eq!(std::fs::read(&path).unwrap(), b"bundle bytes");

        // remove() cleans both the stored object and the materialized copy.
        cache.remove("d/b.db", false).await.unwrap();
        assert!(!temp.path().join("d/b.db.gz").exists());
        assert!(!temp.path().join("d/b.db").exists());
    }

    #[tokio::test]
    async fn test_already_gzip_source_passes_through() {
        let (temp, _upstream, cache) = create_chain();

        let compressed = gzip_bytes(b"payload");
        cache
            .put(PutSource::from(compressed.clone()), "k", None)
            .await
            .unwrap();

        // Stored bytes are identical, not double-compressed.
        let raw = std::fs::read(temp.path().join("k.gz")).unwrap();
        assert_eq!(raw, compressed);
        assert_eq!(read_stream(&cache, "k").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_uncompressed_despite_suffix_is_returned_as_is() {
        let (_temp, upstream, cache) = create_chain();

        // Someone stored plain bytes under the .gz key.
        upstream
            .put(PutSource::from(b"plain text".to_vec()), "k.gz", None)
            .await
            .unwrap();

        assert_eq!(read_stream(&cache, "k").await.unwrap(), b"plain text");
    }

    #[tokio::test]
    async fn test_short_input_still_round_trips() {
        let (_temp, _upstream, cache) = create_chain();

        cache
            .put(PutSource::from(b"x".to_vec()), "tiny", None)
            .await
            .unwrap();
        assert_eq!(read_stream(&cache, "tiny").await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_content_encoding_metadata_is_set() {
        let (_temp, upstream, cache) = create_chain();

        cache
            .put(PutSource::from(b"hello".to_vec()), "k", None)
            .await
            .unwrap();

        let stored = upstream.metadata("k.gz").await.unwrap();
        assert_eq!(stored.get(META_CONTENT_ENCODING).unwrap(), "gzip");
    }

    #[tokio::test]
    async fn test_key_already_suffixed_not_doubled() {
        assert_eq!(FsCompressionCache::rename("a/b.gz"), "a/b.gz");
        assert_eq!(FsCompressionCache::rename("a/b"), "a/b.gz");
    }
}
