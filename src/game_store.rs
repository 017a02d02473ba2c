//! Persistent game result records stored in RocksDB.

use crate::{
    errors::{SpinwireError, SpinwireResult, StorageError},
    games::types::GameResult,
    storage::OptimizedStorage,
};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const GAME_RESULT_PREFIX: &str = "game:result:";
const RECENT_GAMES_PREFIX: &[u8] = b"game:index:recent:";

/// Durable home of game results. Records are immutable once written.
pub trait ResultStore: Send + Sync {
    /// Persist a new result, assigning an id (and a timestamp if unset).
    ///
    /// Fails with `StorageError::AlreadyExists` rather than overwrite.
    fn persist(&self, result: GameResult) -> SpinwireResult<GameResult>;

    fn load(&self, id: &str) -> SpinwireResult<Option<GameResult>>;
}

fn game_result_key(id: &str) -> Vec<u8> {
    format!("{}{}", GAME_RESULT_PREFIX, id).into_bytes()
}

fn recent_game_index_key(timestamp: f64, id: &str) -> Vec<u8> {
    // Newest first: prefix | inv_micros(be) | id
    let micros = (timestamp * 1e6) as u64;
    let inv = u64::MAX - micros;
    let mut key = Vec::with_capacity(RECENT_GAMES_PREFIX.len() + 8 + id.len());
    key.extend_from_slice(RECENT_GAMES_PREFIX);
    key.extend_from_slice(&inv.to_be_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn decode(id: &str, bytes: &[u8]) -> SpinwireResult<GameResult> {
    serde_json::from_slice(bytes).map_err(|e| {
        SpinwireError::Storage(StorageError::CorruptedData(format!(
            "Failed to decode game result {}: {}",
            id, e
        )))
    })
}

#[derive(Clone)]
pub struct RocksResultStore {
    storage: OptimizedStorage,
    /// Serializes the existence check with the write in `persist`
    write_lock: Arc<Mutex<()>>,
}

impl RocksResultStore {
    pub fn new(storage: OptimizedStorage) -> Self {
        Self {
            storage,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn storage(&self) -> &OptimizedStorage {
        &self.storage
    }

    /// Newest results first, paged by an opaque hex cursor
    pub fn recent(
        &self,
        cursor_hex: Option<&str>,
        limit: usize,
    ) -> SpinwireResult<(Vec<GameResult>, Option<String>)> {
        let cursor_bytes = match cursor_hex {
            Some(c) => Some(hex::decode(c).map_err(|e| {
                SpinwireError::Storage(StorageError::CorruptedData(format!(
                    "Invalid cursor hex: {}",
                    e
                )))
            })?),
            None => None,
        };

        let rows = self
            .storage
            .scan_prefix(RECENT_GAMES_PREFIX, cursor_bytes.as_deref(), limit.max(1))?;

        let mut results = Vec::with_capacity(rows.len());
        let mut next_cursor = None;
        let id_offset = RECENT_GAMES_PREFIX.len() + 8;

        for (key, _value) in rows {
            if key.len() <= id_offset {
                continue;
            }
            let id = String::from_utf8_lossy(&key[id_offset..]).to_string();
            match self.load(&id)? {
                Some(result) => results.push(result),
                None => tracing::warn!(id = %id, "Recent index points at a missing game result"),
            }
            next_cursor = Some(hex::encode(&key));
        }

        Ok((results, next_cursor))
    }

    /// Visit every stored result in key order
    pub fn for_each_result<F>(&self, mut f: F) -> SpinwireResult<()>
    where
        F: FnMut(GameResult) -> SpinwireResult<()>,
    {
        self.storage
            .for_each_prefix(GAME_RESULT_PREFIX.as_bytes(), |key, value| {
                let id = String::from_utf8_lossy(&key[GAME_RESULT_PREFIX.len()..]).to_string();
                f(decode(&id, value)?)
            })
    }
}

impl ResultStore for RocksResultStore {
    fn persist(&self, mut result: GameResult) -> SpinwireResult<GameResult> {
        let id = result
            .id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        if result.timestamp == 0.0 {
            result.timestamp = now_secs();
        }

        let key = game_result_key(&id);
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.storage.get(&key)?.is_some() {
            return Err(StorageError::AlreadyExists(id).into());
        }

        let bytes = serde_json::to_vec(&result).map_err(|e| {
            SpinwireError::Storage(StorageError::WriteFailed(format!(
                "Failed to encode game result {}: {}",
                id, e
            )))
        })?;

        let items: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (key, bytes),
            (recent_game_index_key(result.timestamp, &id), Vec::new()),
        ];
        self.storage.batch_write(&items)?;

        tracing::debug!(id = %id, user = %result.user_id, win = result.win(), "Stored game result");
        Ok(result)
    }

    fn load(&self, id: &str) -> SpinwireResult<Option<GameResult>> {
        let Some(bytes) = self.storage.get(&game_result_key(id))? else {
            return Ok(None);
        };
        decode(id, &bytes).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::types::Symbol;
    use tempfile::TempDir;

    fn store() -> (TempDir, RocksResultStore) {
        let dir = TempDir::new().unwrap();
        let storage = OptimizedStorage::new(dir.path()).unwrap();
        (dir, RocksResultStore::new(storage))
    }

    fn spin(user: &str, timestamp: f64) -> GameResult {
        GameResult {
            id: None,
            user_id: user.to_string(),
            bet: 10.0,
            payout: 0.0,
            symbols: [Symbol::Cherry, Symbol::Grape, Symbol::Star],
            timestamp,
        }
    }

    #[test]
    fn test_persist_assigns_id_and_loads_back() {
        let (_dir, store) = store();
        let stored = store.persist(spin("p1", 100.0)).unwrap();

        let id = stored.id.clone().unwrap();
        assert!(!id.is_empty());
        assert_eq!(store.load(&id).unwrap(), Some(stored));
        assert_eq!(store.load("missing").unwrap(), None);
    }

    #[test]
    fn test_persist_stamps_missing_timestamp() {
        let (_dir, store) = store();
        let stored = store.persist(spin("p1", 0.0)).unwrap();
        assert!(stored.timestamp > 1_600_000_000.0);
    }

    #[test]
    fn test_persist_refuses_overwrite() {
        let (_dir, store) = store();
        let mut result = spin("p1", 100.0);
        result.id = Some("fixed".to_string());

        store.persist(result.clone()).unwrap();
        let err = store.persist(result).unwrap_err();
        assert!(matches!(err, SpinwireError::Storage(StorageError::AlreadyExists(_))));
    }

    #[test]
    fn test_concurrent_persist_of_same_id_writes_once() {
        let (_dir, store) = store();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut result = spin(&format!("writer-{}", i), 100.0 + i as f64);
                    result.id = Some("contended".to_string());
                    store.persist(result)
                })
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<&GameResult> = outcomes.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert!(outcomes.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(
            e,
            SpinwireError::Storage(StorageError::AlreadyExists(_))
        )));

        let stored = store.load("contended").unwrap().unwrap();
        assert_eq!(&stored, winners[0]);
    }

    #[test]
    fn test_recent_is_newest_first_with_cursor() {
        let (_dir, store) = store();
        for ts in [100.0, 300.0, 200.0] {
            store.persist(spin(&format!("p{}", ts), ts)).unwrap();
        }

        let (page, cursor) = store.recent(None, 2).unwrap();
        let stamps: Vec<f64> = page.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![300.0, 200.0]);

        let (rest, _) = store.recent(cursor.as_deref(), 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].timestamp, 100.0);
    }

    #[test]
    fn test_for_each_result_visits_all() {
        let (_dir, store) = store();
        for i in 1..=4 {
            store.persist(spin("p1", i as f64)).unwrap();
        }

        let mut count = 0;
        store
            .for_each_result(|_| {
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 4);
    }
}
