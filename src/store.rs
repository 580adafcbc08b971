use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;

/// Versioned document envelope. Versions start at 1 and only grow, so they
/// double as a monotone ordering token for change snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub version: u64,
    pub value: Value,
}

#[derive(Debug)]
pub enum StoreError {
    /// `compare_and_put` lost a race: the key moved past the expected version.
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },
    AlreadyExists(String),
    NotFound(String),
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::VersionConflict { key, expected, actual } => {
                write!(f, "version conflict on {key}: expected {expected}, found {actual}")
            }
            StoreError::AlreadyExists(key) => write!(f, "already exists: {key}"),
            StoreError::NotFound(key) => write!(f, "not found: {key}"),
            StoreError::Backend(e) => write!(f, "backend error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Document/key-value backend. The three write primitives (`put`, `create`,
/// `compare_and_put`) must each be atomic per key with respect to every other
/// write on the same key; writes on different keys need no coordination.
///
/// `compare_and_put` is the primitive the availability counters depend on:
/// a backend that cannot do a version check-and-swap atomically cannot host
/// this subsystem correctly.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Document>, StoreError>;

    /// Unconditional write. Returns the new version.
    async fn put(&self, key: &str, value: Value) -> Result<u64, StoreError>;

    /// Put-if-absent. `AlreadyExists` if the key is live.
    async fn create(&self, key: &str, value: Value) -> Result<u64, StoreError>;

    /// Atomic version check-and-swap. Succeeds only if the key's current
    /// version equals `expected`; returns the new version.
    async fn compare_and_put(&self, key: &str, expected: u64, value: Value) -> Result<u64, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All documents whose key starts with `prefix`, sorted by key.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Document)>, StoreError>;
}

/// Reference backend over `DashMap`. Entry locking makes each write atomic
/// per key, which is exactly the contract remote document stores provide via
/// their own transactional primitives.
pub struct MemoryStore {
    docs: DashMap<String, Document>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { docs: DashMap::new() }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.docs.get(key).map(|e| e.value().clone()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<u64, StoreError> {
        match self.docs.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let doc = e.get_mut();
                doc.version += 1;
                doc.value = value;
                Ok(doc.version)
            }
            Entry::Vacant(e) => {
                e.insert(Document { version: 1, value });
                Ok(1)
            }
        }
    }

    async fn create(&self, key: &str, value: Value) -> Result<u64, StoreError> {
        match self.docs.entry(key.to_string()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(key.to_string())),
            Entry::Vacant(e) => {
                e.insert(Document { version: 1, value });
                Ok(1)
            }
        }
    }

    async fn compare_and_put(&self, key: &str, expected: u64, value: Value) -> Result<u64, StoreError> {
        match self.docs.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let doc = e.get_mut();
                if doc.version != expected {
                    return Err(StoreError::VersionConflict {
                        key: key.to_string(),
                        expected,
                        actual: doc.version,
                    });
                }
                doc.version += 1;
                doc.value = value;
                Ok(doc.version)
            }
            Entry::Vacant(_) => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.docs.remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Document)>, StoreError> {
        let mut out: Vec<(String, Document)> = self
            .docs
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get() {
        let store = MemoryStore::new();
        let v1 = store.put("a/1", json!({"n": 1})).await.unwrap();
        assert_eq!(v1, 1);
        let doc = store.get("a/1").await.unwrap().unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.value, json!({"n": 1}));

        let v2 = store.put("a/1", json!({"n": 2})).await.unwrap();
        assert_eq!(v2, 2);
    }

    #[tokio::test]
    async fn create_is_put_if_absent() {
        let store = MemoryStore::new();
        store.create("k", json!(1)).await.unwrap();
        let err = store.create("k", json!(2)).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        // losing create must not clobber the winner
        assert_eq!(store.get("k").await.unwrap().unwrap().value, json!(1));
    }

    #[tokio::test]
    async fn cas_rejects_stale_version() {
        let store = MemoryStore::new();
        store.put("k", json!(1)).await.unwrap();
        store.put("k", json!(2)).await.unwrap(); // version 2

        let err = store.compare_and_put("k", 1, json!(99)).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { actual: 2, .. }));
        assert_eq!(store.get("k").await.unwrap().unwrap().value, json!(2));

        let v = store.compare_and_put("k", 2, json!(3)).await.unwrap();
        assert_eq!(v, 3);
    }

    #[tokio::test]
    async fn cas_missing_key_is_not_found() {
        let store = MemoryStore::new();
        let err = store.compare_and_put("nope", 1, json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_prefix_sorted() {
        let store = MemoryStore::new();
        store.put("b/2", json!(2)).await.unwrap();
        store.put("b/1", json!(1)).await.unwrap();
        store.put("a/1", json!(0)).await.unwrap();

        let listed = store.list_prefix("b/").await.unwrap();
        let keys: Vec<&str> = listed.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b/1", "b/2"]);
    }

    #[tokio::test]
    async fn concurrent_cas_admits_exactly_one_writer_per_version() {
        use std::sync::Arc;

        let store = Arc::new(MemoryStore::new());
        store.put("counter", json!(0)).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.compare_and_put("counter", 1, json!(i)).await.is_ok()
            }));
        }

        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(store.get("counter").await.unwrap().unwrap().version, 2);
    }
}
