//! Key-value database trait and LMDB implementation.
//!
//! The eviction index stores its records through this interface so the
//! index logic stays independent of the embedded store behind it.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during key-value database operations.
#[derive(Debug)]
pub enum KeyValueDbError {
    /// An I/O error occurred.
    Io(std::io::Error),
    /// Database error (e.g., from LMDB).
    Database(String),
}

impl fmt::Display for KeyValueDbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValueDbError::Io(e) => write!(f, "I/O error: {}", e),
            KeyValueDbError::Database(msg) => write!(f, "database error: {}", msg),
        }
    }
}

impl std::error::Error for KeyValueDbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KeyValueDbError::Io(e) => Some(e),
            KeyValueDbError::Database(_) => None,
        }
    }
}

impl From<std::io::Error> for KeyValueDbError {
    fn from(e: std::io::Error) -> Self {
        KeyValueDbError::Io(e)
    }
}

/// Result type for key-value database operations.
pub type Result<T> = std::result::Result<T, KeyValueDbError>;

// =============================================================================
// KeyValueDb Trait
// =============================================================================

/// A key-value database interface.
#[async_trait]
pub trait KeyValueDb: Send + Sync {
    /// Get the value for a key, returning `None` if not found.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Set a key to a value, replacing any existing value.
    async fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Delete a key. Deleting an absent key is a no-op.
    async fn del(&self, key: &[u8]) -> Result<()>;

    /// Return every key-value pair in the database.
    async fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Delete every key in the database.
    async fn clear(&self) -> Result<()>;
}

// =============================================================================
// LmdbKeyValueDb
// =============================================================================

/// Maximum size of the LMDB map. The index stores one small record per
/// cached file, so this is far more than ever needed.
const LMDB_MAP_SIZE: usize = 256 * 1024 * 1024;

/// An LMDB-backed key-value database.
///
/// LMDB's own locking makes the database safe to share between processes
/// building bundles against the same cache directory.
pub struct LmdbKeyValueDb {
    env: Arc<Env>,
    db: Database<Bytes, Bytes>,
}

impl LmdbKeyValueDb {
    /// Create a new LMDB database at the given path.
    ///
    /// Creates the directory if it doesn't exist.
    pub fn new(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(LMDB_MAP_SIZE)
                .max_dbs(1)
                .open(path)
                .map_err(|e| KeyValueDbError::Database(e.to_string()))?
        };

        let mut wtxn = env
            .write_txn()
            .map_err(|e| KeyValueDbError::Database(e.to_string()))?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| KeyValueDbError::Database(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| KeyValueDbError::Database(e.to_string()))?;

        Ok(Self {
            env: Arc::new(env),
            db,
        })
    }
}

#[async_trait]
impl KeyValueDb for LmdbKeyValueDb {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let env = self.env.clone();
        let db = self.db;
        let key = key.to_vec();

        tokio::task::spawn_blocking(move || {
            let rtxn = env
                .read_txn()
                .map_err(|e| KeyValueDbError::Database(e.to_string()))?;
            let value = db
                .get(&rtxn, &key)
                .map_err(|e| KeyValueDbError::Database(e.to_string()))?
                .map(|v| v.to_vec());
            Ok(value)
        })
        .await
        .map_err(|e| KeyValueDbError::Database(e.to_string()))?
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let env = self.env.clone();
        let db = self.db;
        let key = key.to_vec();
        let value = value.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut wtxn = env
                .write_txn()
                .map_err(|e| KeyValueDbError::Database(e.to_string()))?;
            db.put(&mut wtxn, &key, &value)
                .map_err(|e| KeyValueDbError::Database(e.to_string()))?;
            wtxn.commit()
                .map_err(|e| KeyValueDbError::Database(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| KeyValueDbError::Database(e.to_string()))?
    }

    async fn del(&self, key: &[u8]) -> Result<()> {
        let env = self.env.clone();
        let db = self.db;
        let key = key.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut wtxn = env
                .write_txn()
                .map_err(|e| KeyValueDbError::Database(e.to_string()))?;
            db.delete(&mut wtxn, &key)
                .map_err(|e| KeyValueDbError::Database(e.to_string()))?;
            wtxn.commit()
                .map_err(|e| KeyValueDbError::Database(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| KeyValueDbError::Database(e.to_string()))?
    }

    async fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let env = self.env.clone();
        let db = self.db;

        tokio::task::spawn_blocking(move || {
            let rtxn = env
                .read_txn()
                .map_err(|e| KeyValueDbError::Database(e.to_string()))?;
            let mut entries = Vec::new();
            let iter = db
                .iter(&rtxn)
                .map_err(|e| KeyValueDbError::Database(e.to_string()))?;
            for item in iter {
                let (key, value) =
                    item.map_err(|e| KeyValueDbError::Database(e.to_string()))?;
                entries.push((key.to_vec(), value.to_vec()));
            }
            Ok(entries)
        })
        .await
        .map_err(|e| KeyValueDbError::Database(e.to_string()))?
    }

    async fn clear(&self) -> Result<()> {
        let env = self.env.clone();
        let db = self.db;

        tokio::task::spawn_blocking(move || {
            let mut wtxn = env
                .write_txn()
                .map_err(|e| KeyValueDbError::Database(e.to_string()))?;
            db.clear(&mut wtxn)
                .map_err(|e| KeyValueDbError::Database(e.to_string()))?;
            wtxn.commit()
                .map_err(|e| KeyValueDbError::Database(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| KeyValueDbError::Database(e.to_string()))?
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_set_get_del() {
        let temp = TempDir::new().unwrap();
        let db = LmdbKeyValueDb::new(temp.path()).unwrap();

        assert_eq!(db.get(b"a").await.unwrap(), None);

        db.set(b"a", b"1").await.unwrap();
        assert_eq!(db.get(b"a").await.unwrap(), Some(b"1".to_vec()));

        db.set(b"a", b"2").await.unwrap();
        assert_eq!(db.get(b"a").await.unwrap(), Some(b"2".to_vec()));

        db.del(b"a").await.unwrap();
        assert_eq!(db.get(b"a").await.unwrap(), None);

        // Deleting an absent key is a no-op.
        db.del(b"a").await.unwrap();
    }

    #[tokio::test]
    async fn test_entries_and_clear() {
        let temp = TempDir::new().unwrap();
        let db = LmdbKeyValueDb::new(temp.path()).unwrap();

        db.set(b"x", b"1").await.unwrap();
        db.set(b"y", b"2").await.unwrap();

        let mut entries = db.entries().await.unwrap();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                (b"x".to_vec(), b"1".to_vec()),
                (b"y".to_vec(), b"2".to_vec())
            ]
        );

        db.clear().await.unwrap();
        assert!(db.entries().await.unwrap().is_empty());
    }
}
