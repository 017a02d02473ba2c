//! Optimized storage layer using RocksDB

use crate::config::{CompressionType, StorageConfig};
use crate::errors::{SpinwireResult, StorageError};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct OptimizedStorage {
    db: Arc<DB>,
}

impl OptimizedStorage {
    /// Open (or create) a database with default tuning
    pub fn new<P: AsRef<Path>>(path: P) -> SpinwireResult<Self> {
        Self::open(path, &StorageConfig::default())
    }

    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> SpinwireResult<Self> {
        let mut opts = Self::options(config);
        opts.create_if_missing(true);

        let db = DB::open(&opts, path.as_ref()).map_err(|e| {
            StorageError::DatabaseOpenFailed(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Open without taking the write lock, so a running writer is not disturbed
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> SpinwireResult<Self> {
        let opts = Options::default();
        let db = DB::open_for_read_only(&opts, path.as_ref(), false).map_err(|e| {
            StorageError::DatabaseOpenFailed(format!("{} (read-only): {}", path.as_ref().display(), e))
        })?;
        Ok(Self { db: Arc::new(db) })
    }

    fn options(config: &StorageConfig) -> Options {
        let mut opts = Options::default();
        opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        opts.set_max_write_buffer_number(config.max_write_buffer_number);
        opts.set_target_file_size_base(64 * 1024 * 1024);
        opts.set_compression_type(match config.compression_type {
            CompressionType::None => rocksdb::DBCompressionType::None,
            CompressionType::Snappy => rocksdb::DBCompressionType::Snappy,
            CompressionType::Lz4 => rocksdb::DBCompressionType::Lz4,
            CompressionType::Zstd => rocksdb::DBCompressionType::Zstd,
        });
        opts
    }

    pub fn get(&self, key: &[u8]) -> SpinwireResult<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map_err(|e| StorageError::ReadFailed(e.to_string()).into())
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> SpinwireResult<()> {
        self.db
            .put(key, value)
            .map_err(|e| StorageError::WriteFailed(e.to_string()).into())
    }

    pub fn delete(&self, key: &[u8]) -> SpinwireResult<()> {
        self.db
            .delete(key)
            .map_err(|e| StorageError::WriteFailed(e.to_string()).into())
    }

    /// Write all items atomically
    pub fn batch_write<K, V>(&self, items: &[(K, V)]) -> SpinwireResult<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut batch = WriteBatch::default();
        for (key, value) in items {
            batch.put(key, value);
        }
        self.db
            .write(batch)
            .map_err(|e| StorageError::WriteFailed(e.to_string()).into())
    }

    /// Ordered scan of keys under `prefix`.
    ///
    /// `after` is an exclusive cursor (the last key of the previous page).
    pub fn scan_prefix(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> SpinwireResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let start = after.unwrap_or(prefix);
        let iter = self.db.iterator(IteratorMode::From(start, Direction::Forward));

        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            if after.is_some_and(|cursor| &key[..] == cursor) {
                continue;
            }
            rows.push((key.to_vec(), value.to_vec()));
            if rows.len() >= limit {
                break;
            }
        }
        Ok(rows)
    }

    /// Visit every row under `prefix` without materializing them all
    pub fn for_each_prefix<F>(&self, prefix: &[u8], mut f: F) -> SpinwireResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> SpinwireResult<()>,
    {
        let iter = self.db.iterator(IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            f(&key, &value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let storage = OptimizedStorage::new(dir.path()).unwrap();

        storage.put(b"k1", b"v1").unwrap();
        assert_eq!(storage.get(b"k1").unwrap(), Some(b"v1".to_vec()));

        storage.delete(b"k1").unwrap();
        assert_eq!(storage.get(b"k1").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix_with_cursor() {
        let dir = TempDir::new().unwrap();
        let storage = OptimizedStorage::new(dir.path()).unwrap();

        let items: Vec<(Vec<u8>, Vec<u8>)> = (0..5u8)
            .map(|i| (format!("p:{}", i).into_bytes(), vec![i]))
            .chain(std::iter::once((b"q:0".to_vec(), vec![9])))
            .collect();
        storage.batch_write(&items).unwrap();

        let page1 = storage.scan_prefix(b"p:", None, 3).unwrap();
        assert_eq!(page1.len(), 3);
        assert_eq!(page1[0].0, b"p:0".to_vec());

        let cursor = page1.last().unwrap().0.clone();
        let page2 = storage.scan_prefix(b"p:", Some(&cursor), 10).unwrap();
        assert_eq!(page2.len(), 2);
        assert_eq!(page2[0].0, b"p:3".to_vec());
        assert!(page2.iter().all(|(k, _)| k.starts_with(b"p:")));
    }

    #[test]
    fn test_read_only_sees_committed_data() {
        let dir = TempDir::new().unwrap();
        {
            let storage = OptimizedStorage::new(dir.path()).unwrap();
            storage.put(b"stats:daily:2024-01-01", b"{}").unwrap();
        }

        let reader = OptimizedStorage::open_read_only(dir.path()).unwrap();
        assert!(reader.get(b"stats:daily:2024-01-01").unwrap().is_some());
    }

    #[test]
    fn test_for_each_prefix_visits_only_prefix() {
        let dir = TempDir::new().unwrap();
        let storage = OptimizedStorage::new(dir.path()).unwrap();
        storage.put(b"a:1", b"1").unwrap();
        storage.put(b"a:2", b"2").unwrap();
        storage.put(b"b:1", b"3").unwrap();

        let mut seen = Vec::new();
        storage
            .for_each_prefix(b"a:", |k, _| {
                seen.push(k.to_vec());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![b"a:1".to_vec(), b"a:2".to_vec()]);
    }
}
