use crate::error::{ApiError, ErrorCode, MuxResult};
use crate::session::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tempfile::NamedTempFile;

/// Durable string store with per-key expiry. Expired keys read as absent.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> MuxResult<Option<String>>;
    fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> MuxResult<()>;
    fn remove(&self, key: &str) -> MuxResult<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredValue {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
}

impl StoredValue {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at_ms: ttl.map(|ttl| now_ms().saturating_add(ttl.as_millis() as u64)),
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_live(entries: &mut BTreeMap<String, StoredValue>, key: &str) -> Option<String> {
    let now = now_ms();
    match entries.get(key) {
        Some(stored) if stored.is_expired(now) => {
            entries.remove(key);
            None
        }
        Some(stored) => Some(stored.value.clone()),
        None => None,
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> MuxResult<Option<String>> {
        Ok(read_live(&mut lock(&self.entries), key))
    }

    fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> MuxResult<()> {
        lock(&self.entries).insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    fn remove(&self, key: &str) -> MuxResult<()> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    entries: BTreeMap<String, StoredValue>,
}

#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, StoredValue>>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> MuxResult<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<StoreDocument>(&content) {
                Ok(document) => document.entries,
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "State file is corrupt; starting empty"
                    );
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(storage_error("Failed to read state file", &path, err));
            }
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, entries: &mut BTreeMap<String, StoredValue>) -> MuxResult<()> {
        let now = now_ms();
        entries.retain(|_, stored| !stored.is_expired(now));
        let document = StoreDocument {
            entries: entries.clone(),
        };
        let content = serde_json::to_vec_pretty(&document)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .map_err(|err| storage_error("Failed to create state directory", &dir, err))?;
        let mut file = NamedTempFile::new_in(&dir)
            .map_err(|err| storage_error("Failed to create temp state file", &dir, err))?;
        file.write_all(&content)
            .and_then(|_| file.as_file().sync_all())
            .map_err(|err| storage_error("Failed to write state file", &self.path, err))?;
        file.persist(&self.path)
            .map_err(|err| storage_error("Failed to replace state file", &self.path, err.error))?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> MuxResult<Option<String>> {
        Ok(read_live(&mut lock(&self.entries), key))
    }

    fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> MuxResult<()> {
        let mut entries = lock(&self.entries);
        entries.insert(key.to_string(), StoredValue::new(value, ttl));
        self.write(&mut entries)
    }

    fn remove(&self, key: &str) -> MuxResult<()> {
        let mut entries = lock(&self.entries);
        if entries.remove(key).is_none() {
            return Ok(());
        }
        self.write(&mut entries)
    }
}

fn storage_error(message: &str, path: &Path, err: std::io::Error) -> crate::error::MuxError {
    ApiError::new(ErrorCode::StorageError, message)
        .with_details(format!("{}: {}", path.display(), err))
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_values_read_as_absent() {
        let store = MemoryStore::new();
        store
            .set("flag", "1".into(), Some(Duration::from_millis(0)))
            .expect("set");
        assert_eq!(store.get("flag").expect("get"), None);
        store.set("tabs", "[]".into(), None).expect("set");
        assert_eq!(store.get("tabs").expect("get").as_deref(), Some("[]"));
        store.remove("tabs").expect("remove");
        assert_eq!(store.get("tabs").expect("get"), None);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");
        {
            let store = FileStore::open(&path).expect("open");
            store.set("tabmux.tabs", "{}".into(), None).expect("set");
            store
                .set("short", "x".into(), Some(Duration::from_millis(0)))
                .expect("set");
        }
        let reopened = FileStore::open(&path).expect("reopen");
        assert_eq!(
            reopened.get("tabmux.tabs").expect("get").as_deref(),
            Some("{}")
        );
        assert_eq!(reopened.get("short").expect("get"), None);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").expect("write");
        let store = FileStore::open(&path).expect("open");
        assert_eq!(store.get("tabmux.tabs").expect("get"), None);
        store.set("k", "v".into(), None).expect("set");
        let content = fs::read_to_string(&path).expect("read");
        assert!(content.contains("\"k\""));
    }
}
