//! End-to-end tests over assembled cache chains.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

use bundlecache::{
    Cache, FsCache, FsCompressionCache, FsLimitedCache, Metadata, PutSource,
};

fn hex_sha256(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

async fn put_bytes(cache: &dyn Cache, key: &str, data: &[u8]) {
    cache
        .put(PutSource::from(data.to_vec()), key, None)
        .await
        .unwrap();
}

async fn read_back(cache: &dyn Cache, key: &str) -> Option<Vec<u8>> {
    let path = cache.get(key).await.unwrap()?;
    Some(std::fs::read(path).unwrap())
}

/// Local -> compressed remote store, the standard two-level layout.
fn compressed_chain(local: &TempDir, store: &TempDir) -> FsCache {
    let store: Arc<dyn Cache> = Arc::new(FsCache::new(store.path()).unwrap());
    let compressed: Arc<dyn Cache> = Arc::new(FsCompressionCache::new(store));
    FsCache::with_upstream(local.path(), compressed).unwrap()
}

#[tokio::test]
async fn round_trip_through_compressed_chain() {
    let local_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let cache = compressed_chain(&local_dir, &store_dir);

    let data = b"tabular bundle payload".repeat(100);
    put_bytes(&cache, "census/2010.db", &data).await;

    // Visible at both levels: plain locally, gzip in the store.
    assert_eq!(read_back(&cache, "census/2010.db").await.unwrap(), data);
    let raw = std::fs::read(store_dir.path().join("census/2010.db.gz")).unwrap();
    assert_eq!(&raw[..2], [0x1f, 0x8b]);

    assert!(
        cache
            .has("census/2010.db", Some(&hex_sha256(&data)))
            .await
            .unwrap()
    );

    // Drop the local copy; the chain restores the original bytes.
    std::fs::remove_file(local_dir.path().join("census/2010.db")).unwrap();
    assert_eq!(read_back(&cache, "census/2010.db").await.unwrap(), data);
}

#[tokio::test]
async fn get_stream_decompresses_through_the_chain() {
    let local_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let cache = compressed_chain(&local_dir, &store_dir);

    put_bytes(&cache, "k", b"stream me").await;
    std::fs::remove_file(local_dir.path().join("k")).unwrap();

    let mut stream = cache.get_stream("k").await.unwrap().unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"stream me");
}

#[tokio::test]
async fn limited_front_evicts_while_upstream_keeps_everything() {
    let local_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();

    let store: Arc<dyn Cache> = Arc::new(FsCache::new(store_dir.path()).unwrap());
    let cache =
        FsLimitedCache::with_upstream(local_dir.path(), 4 * 1024, Arc::clone(&store)).unwrap();

    for i in 0..8 {
        put_bytes(&cache, &format!("part_{}", i), &[i as u8; 1024]).await;
    }

    // The front stayed under its bound; the store kept every artifact.
    assert!(cache.index().total_size().await.unwrap() <= 4 * 1024);
    cache.verify().await.unwrap();
    for i in 0..8 {
        assert!(store.has(&format!("part_{}", i), None).await.unwrap());
    }

    // An evicted artifact comes back through the chain, evicting again.
    assert!(!local_dir.path().join("part_0").exists());
    assert_eq!(read_back(&cache, "part_0").await.unwrap(), [0u8; 1024]);
    assert!(cache.index().total_size().await.unwrap() <= 4 * 1024);
    cache.verify().await.unwrap();
}

#[tokio::test]
async fn metadata_propagates_with_the_write() {
    let local_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();

    let store: Arc<dyn Cache> = Arc::new(FsCache::new(store_dir.path()).unwrap());
    let cache = FsCache::with_upstream(local_dir.path(), Arc::clone(&store)).unwrap();

    let mut metadata = Metadata::new();
    metadata.insert("identity".to_string(), "census-2010-p5".to_string());
    cache
        .put(
            PutSource::from(b"bundle".to_vec()),
            "census/2010.db",
            Some(metadata),
        )
        .await
        .unwrap();

    // Both levels can answer metadata queries without the object body.
    for level in [&cache as &dyn Cache, store.as_ref()] {
        let stored = level.metadata("census/2010.db").await.unwrap();
        assert_eq!(stored.get("identity").unwrap(), "census-2010-p5");
    }
}

#[tokio::test]
async fn remove_propagation_reaches_the_store() {
    let local_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let cache = compressed_chain(&local_dir, &store_dir);

    put_bytes(&cache, "k", b"x").await;
    assert!(store_dir.path().join("k.gz").is_file());

    cache.remove("k", true).await.unwrap();
    assert!(!local_dir.path().join("k").exists());
    assert!(!store_dir.path().join("k.gz").exists());
    assert!(!cache.has("k", None).await.unwrap());
}
