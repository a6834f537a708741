use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;

/// Storage-layer errors surfaced by a KV backend
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record serialization failed: {0}")]
    Serialization(String),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

/// An ordered, asynchronous key/value namespace.
///
/// Keys are cache paths; values are opaque encoded records. `keys` and
/// `iterate` visit entries in key order. Implementations must be safe to
/// call concurrently; the cache controller is the only mutator.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Visits every `(key, value)` pair in key order.
    async fn iterate(
        &self,
        visit: &mut (dyn for<'a> FnMut(&'a str, &'a [u8]) + Send),
    ) -> Result<(), StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;

    /// Serialized footprint estimate for one pair.
    fn approximate_size(&self, key: &str, value: &[u8]) -> u64 {
        (key.len() + value.len()) as u64
    }
}

/// A sled database holding the durable namespaces.
///
/// One tree per namespace; values are bincode-encoded records written by
/// the codec.
pub struct SledDatabase {
    db: sled::Db,
}

impl SledDatabase {
    /// Opens (or creates) the database under the platform cache directory.
    pub fn open(db_name: &str) -> Result<Self, StorageError> {
        let base = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
        Self::open_at(&base.join(db_name))
    }

    /// Opens (or creates) the database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Opens a named namespace backed by one sled tree.
    pub fn namespace(&self, name: &str) -> Result<SledBackend, StorageError> {
        let tree = self.db.open_tree(name)?;
        Ok(SledBackend { tree })
    }

    /// Forces buffered writes to disk.
    pub async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

/// Durable namespace on top of one sled tree
pub struct SledBackend {
    tree: sled::Tree,
}

#[async_trait]
impl KvBackend for SledBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.tree.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.tree.insert(key.as_bytes(), value)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for item in self.tree.iter() {
            let (key, _) = item?;
            keys.push(String::from_utf8_lossy(&key).to_string());
        }
        Ok(keys)
    }

    async fn iterate(
        &self,
        visit: &mut (dyn for<'a> FnMut(&'a str, &'a [u8]) + Send),
    ) -> Result<(), StorageError> {
        for item in self.tree.iter() {
            let (key, value) = item?;
            visit(&String::from_utf8_lossy(&key), &value);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.tree.clear()?;
        Ok(())
    }
}

/// Ephemeral namespace for tests and cache-less embedding
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.keys().cloned().collect())
    }

    async fn iterate(
        &self,
        visit: &mut (dyn for<'a> FnMut(&'a str, &'a [u8]) + Send),
    ) -> Result<(), StorageError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        for (key, value) in entries.iter() {
            visit(key, value);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.clear();
        Ok(())
    }
}

/// Fallback namespace used when durable storage is disabled or unavailable.
///
/// Reads always return absent and writes succeed silently, so consumers
/// degrade to filesystem-only operation without code changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackend;

#[async_trait]
impl KvBackend for NoopBackend {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(None)
    }

    async fn put(&self, _key: &str, _value: Vec<u8>) -> Result<(), StorageError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(Vec::new())
    }

    async fn iterate(
        &self,
        _visit: &mut (dyn for<'a> FnMut(&'a str, &'a [u8]) + Send),
    ) -> Result<(), StorageError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_backend_roundtrip() {
        let backend = MemoryBackend::new();

        backend.put("/a", vec![1, 2, 3]).await.unwrap();
        backend.put("/b", vec![4]).await.unwrap();

        assert_eq!(backend.get("/a").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(backend.get("/missing").await.unwrap(), None);
        assert_eq!(backend.keys().await.unwrap(), vec!["/a", "/b"]);

        backend.delete("/a").await.unwrap();
        assert_eq!(backend.get("/a").await.unwrap(), None);

        backend.clear().await.unwrap();
        assert!(backend.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_backend_iterates_in_key_order() {
        let backend = MemoryBackend::new();
        backend.put("/c", vec![3]).await.unwrap();
        backend.put("/a", vec![1]).await.unwrap();
        backend.put("/b", vec![2]).await.unwrap();

        let mut seen = Vec::new();
        backend
            .iterate(&mut |key, value| seen.push((key.to_string(), value.to_vec())))
            .await
            .unwrap();

        assert_eq!(
            seen,
            vec![
                ("/a".to_string(), vec![1]),
                ("/b".to_string(), vec![2]),
                ("/c".to_string(), vec![3]),
            ]
        );
    }

    #[tokio::test]
    async fn test_sled_backend_roundtrip() {
        let dir = TempDir::new().unwrap();
        let db = SledDatabase::open_at(&dir.path().join("kv")).unwrap();
        let backend = db.namespace("directories").unwrap();

        backend.put("/src", b"record".to_vec()).await.unwrap();
        assert_eq!(backend.get("/src").await.unwrap(), Some(b"record".to_vec()));

        backend.delete("/src").await.unwrap();
        assert_eq!(backend.get("/src").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sled_namespaces_are_isolated() {
        let dir = TempDir::new().unwrap();
        let db = SledDatabase::open_at(&dir.path().join("kv")).unwrap();
        let dirs = db.namespace("directories").unwrap();
        let roots = db.namespace("directories.roots").unwrap();

        dirs.put("/src", vec![1]).await.unwrap();
        assert_eq!(roots.get("/src").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_noop_backend_swallows_everything() {
        let backend = NoopBackend;
        backend.put("/a", vec![1]).await.unwrap();
        assert_eq!(backend.get("/a").await.unwrap(), None);
        assert!(backend.keys().await.unwrap().is_empty());
        backend.clear().await.unwrap();
    }

    #[test]
    fn test_approximate_size_counts_key_and_value() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.approximate_size("/ab", &[0u8; 10]), 13);
    }
}
