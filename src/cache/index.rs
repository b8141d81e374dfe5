//! Eviction index for size-bounded caches.
//!
//! One record per cached file, keyed by the cache key. A record's existence
//! is the source of truth for "this cache believes it has this file";
//! agreement with the filesystem is checked separately by `verify()`.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::kv::KeyValueDb;
use super::{Error, Result};

// =============================================================================
// IndexRecord
// =============================================================================

/// A single eviction index record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexRecord {
    /// Cache key (relative POSIX path).
    pub path: String,
    /// Size of the cached file in bytes.
    pub size: u64,
    /// Insertion time, unix microseconds. Ordering only; never refreshed
    /// on access.
    pub time: i64,
}

/// The serialized value stored under the path key.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    size: u64,
    time: i64,
}

// =============================================================================
// CacheIndex
// =============================================================================

/// The eviction index: insert, delete-by-key, oldest-first scan, size sum.
///
/// Totals are recomputed from a full scan on each call. That is O(n) per
/// operation, which is acceptable at the scale of a local cache directory
/// (thousands of files).
#[derive(Clone)]
pub struct CacheIndex {
    db: Arc<dyn KeyValueDb>,
}

impl CacheIndex {
    /// Create an index over the given database.
    pub fn new(db: Arc<dyn KeyValueDb>) -> Self {
        Self { db }
    }

    /// Record a file at the current time, replacing any existing record.
    pub async fn add_record(&self, path: &str, size: u64) -> Result<()> {
        self.record(path, size, Utc::now().timestamp_micros()).await
    }

    /// Record a file at an explicit time.
    pub async fn record(&self, path: &str, size: u64, time: i64) -> Result<()> {
        let value = serde_json::to_vec(&StoredRecord { size, time })?;
        self.db.set(path.as_bytes(), &value).await?;
        Ok(())
    }

    /// Delete the record for a path. Absent records are a no-op.
    pub async fn remove_record(&self, path: &str) -> Result<()> {
        self.db.del(path.as_bytes()).await?;
        Ok(())
    }

    /// Whether a record exists for the path.
    pub async fn contains(&self, path: &str) -> Result<bool> {
        Ok(self.db.get(path.as_bytes()).await?.is_some())
    }

    /// Sum of recorded sizes.
    pub async fn total_size(&self) -> Result<u64> {
        let records = self.records().await?;
        Ok(records.iter().map(|r| r.size).sum())
    }

    /// All records, oldest first. Ties break by path so the order is
    /// deterministic.
    pub async fn oldest_first(&self) -> Result<Vec<IndexRecord>> {
        let mut records = self.records().await?;
        records.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.path.cmp(&b.path)));
        Ok(records)
    }

    /// The set of recorded paths.
    pub async fn paths(&self) -> Result<BTreeSet<String>> {
        let records = self.records().await?;
        Ok(records.into_iter().map(|r| r.path).collect())
    }

    /// Delete every record.
    pub async fn clear(&self) -> Result<()> {
        self.db.clear().await?;
        Ok(())
    }

    async fn records(&self) -> Result<Vec<IndexRecord>> {
        let entries = self.db.entries().await?;
        let mut records = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let path = String::from_utf8(key)
                .map_err(|e| Error::Inconsistent(format!("non-UTF-8 index key: {}", e)))?;
            let stored: StoredRecord = serde_json::from_slice(&value)?;
            records.push(IndexRecord {
                path,
                size: stored.size,
                time: stored.time,
            });
        }
        Ok(records)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::super::kv::LmdbKeyValueDb;
    use super::*;
    use tempfile::TempDir;

    fn create_test_index() -> (TempDir, CacheIndex) {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(LmdbKeyValueDb::new(temp.path()).unwrap());
        (temp, CacheIndex::new(db))
    }

    #[tokio::test]
    async fn test_add_and_total() {
        let (_temp, index) = create_test_index();

        index.record("a", 100, 1).await.unwrap();
        index.record("b", 200, 2).await.unwrap();
        assert_eq!(index.total_size().await.unwrap(), 300);

        // Replacing a record replaces its size, not adds to it.
        index.record("a", 150, 3).await.unwrap();
        assert_eq!(index.total_size().await.unwrap(), 350);
    }

    #[tokio::test]
    async fn test_oldest_first_ordering() {
        let (_temp, index) = create_test_index();

        index.record("newer", 1, 30).await.unwrap();
        index.record("oldest", 1, 10).await.unwrap();
        index.record("middle", 1, 20).await.unwrap();

        let order: Vec<String> = index
            .oldest_first()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(order, vec!["oldest", "middle", "newer"]);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (_temp, index) = create_test_index();

        index.record("a", 10, 1).await.unwrap();
        assert!(index.contains("a").await.unwrap());

        index.remove_record("a").await.unwrap();
        assert!(!index.contains("a").await.unwrap());

        index.remove_record("a").await.unwrap();
        assert_eq!(index.total_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_paths() {
        let (_temp, index) = create_test_index();

        index.record("x/y", 1, 1).await.unwrap();
        index.record("z", 1, 2).await.unwrap();

        let paths = index.paths().await.unwrap();
        assert!(paths.contains("x/y"));
        assert!(paths.contains("z"));
        assert_eq!(paths.len(), 2);
    }
}
