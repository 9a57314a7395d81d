use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use serde_json::{Map, Value};

use crate::{AppError, AppResult};

pub const SOURCE_KEY: &str = "migrationSourcePath";
pub const DESTINATION_KEY: &str = "migrationDestinationPath";
pub const ERROR_TEXT_KEY: &str = "migrationErrorText";
pub const TOTAL_BYTES_KEY: &str = "migrationTotalBytesToTransfer";

/// Keys whose validity ends when a migration attempt succeeds.
pub const RUN_SCOPED_KEYS: &[&str] = &[DESTINATION_KEY, SOURCE_KEY, TOTAL_BYTES_KEY];

/// Minimal persisted key/value store. Implementations must make
/// [`KeyValueStore::get_or_set_u64`] atomic with respect to every other
/// writer of the same store.
pub trait KeyValueStore: Send + Sync {
    fn get_string(&self, key: &str) -> AppResult<Option<String>>;
    fn put_string(&self, key: &str, value: &str) -> AppResult<()>;
    fn remove(&self, key: &str) -> AppResult<()>;
    fn get_u64(&self, key: &str) -> AppResult<Option<u64>>;
    fn put_u64(&self, key: &str, value: u64) -> AppResult<()>;
    /// Returns the stored value, storing `candidate` first if none exists.
    fn get_or_set_u64(&self, key: &str, candidate: u64) -> AppResult<u64>;
}

#[derive(Debug, Clone, PartialEq)]
enum MemoryValue {
    Text(String),
    Number(u64),
}

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, MemoryValue>>,
}

impl MemoryStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryValue>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get_string(&self, key: &str) -> AppResult<Option<String>> {
        match self.lock().get(key) {
            Some(MemoryValue::Text(value)) => Ok(Some(value.clone())),
            Some(MemoryValue::Number(_)) => Err(type_mismatch(key, "string")),
            None => Ok(None),
        }
    }

    fn put_string(&self, key: &str, value: &str) -> AppResult<()> {
        self.lock()
            .insert(key.to_string(), MemoryValue::Text(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        self.lock().remove(key);
        Ok(())
    }

    fn get_u64(&self, key: &str) -> AppResult<Option<u64>> {
        match self.lock().get(key) {
            Some(MemoryValue::Number(value)) => Ok(Some(*value)),
            Some(MemoryValue::Text(_)) => Err(type_mismatch(key, "integer")),
            None => Ok(None),
        }
    }

    fn put_u64(&self, key: &str, value: u64) -> AppResult<()> {
        self.lock().insert(key.to_string(), MemoryValue::Number(value));
        Ok(())
    }

    fn get_or_set_u64(&self, key: &str, candidate: u64) -> AppResult<u64> {
        let mut guard = self.lock();
        match guard.get(key) {
            Some(MemoryValue::Number(value)) => Ok(*value),
            Some(MemoryValue::Text(_)) => Err(type_mismatch(key, "integer")),
            None => {
                guard.insert(key.to_string(), MemoryValue::Number(candidate));
                Ok(candidate)
            }
        }
    }
}

/// JSON object on disk. Every access takes an advisory lock on a sidecar
/// `.lock` file so separate processes observe each other's writes, and
/// writes land through a synced temp file plus rename.
pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
}

impl JsonFileStore {
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "store_create_dir")
                    .with_context("path", parent.display().to_string())
            })?;
        }
        let lock_path = sidecar_path(&path, "lock");
        Ok(Self {
            path,
            lock_path,
            guard: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_lock(&self) -> AppResult<File> {
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "store_lock_open")
                    .with_context("path", self.lock_path.display().to_string())
            })
    }

    fn read(&self) -> AppResult<Map<String, Value>> {
        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        let lock = self.open_lock()?;
        lock.lock_shared().map_err(|err| {
            AppError::from(err).with_context("operation", "store_lock_shared")
        })?;
        let result = load_map(&self.path);
        let _ = lock.unlock();
        result
    }

    /// Runs `f` against the current contents under an exclusive lock and
    /// persists the map when `f` reports a change.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut Map<String, Value>) -> AppResult<(T, bool)>,
    ) -> AppResult<T> {
        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        let lock = self.open_lock()?;
        lock.lock_exclusive().map_err(|err| {
            AppError::from(err).with_context("operation", "store_lock_exclusive")
        })?;
        let result = (|| {
            let mut map = load_map(&self.path)?;
            let (value, dirty) = f(&mut map)?;
            if dirty {
                write_map(&self.path, &map)?;
            }
            Ok(value)
        })();
        let _ = lock.unlock();
        result
    }
}

impl KeyValueStore for JsonFileStore {
    fn get_string(&self, key: &str) -> AppResult<Option<String>> {
        let map = self.read()?;
        match map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(type_mismatch(key, "string")),
        }
    }

    fn put_string(&self, key: &str, value: &str) -> AppResult<()> {
        self.update(|map| {
            map.insert(key.to_string(), Value::String(value.to_string()));
            Ok(((), true))
        })
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        self.update(|map| {
            let removed = map.remove(key).is_some();
            Ok(((), removed))
        })
    }

    fn get_u64(&self, key: &str) -> AppResult<Option<u64>> {
        let map = self.read()?;
        number_at(&map, key)
    }

    fn put_u64(&self, key: &str, value: u64) -> AppResult<()> {
        self.update(|map| {
            map.insert(key.to_string(), Value::from(value));
            Ok(((), true))
        })
    }

    fn get_or_set_u64(&self, key: &str, candidate: u64) -> AppResult<u64> {
        self.update(|map| match number_at(map, key)? {
            Some(existing) => Ok((existing, false)),
            None => {
                map.insert(key.to_string(), Value::from(candidate));
                Ok((candidate, true))
            }
        })
    }
}

fn number_at(map: &Map<String, Value>, key: &str) -> AppResult<Option<u64>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| type_mismatch(key, "integer")),
    }
}

fn type_mismatch(key: &str, expected: &str) -> AppError {
    AppError::new("STORE/TYPE_MISMATCH", "Stored value has an unexpected type.")
        .with_context("key", key.to_string())
        .with_context("expected", expected.to_string())
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    if let Some(name) = path.file_name() {
        path.with_file_name(format!("{}.{}", name.to_string_lossy(), suffix))
    } else {
        path.with_extension(suffix)
    }
}

fn load_map(path: &Path) -> AppResult<Map<String, Value>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(err) => {
            return Err(AppError::from(err)
                .with_context("operation", "store_read")
                .with_context("path", path.display().to_string()))
        }
    };
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    serde_json::from_slice(&data).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "store_decode")
            .with_context("path", path.display().to_string())
    })
}

fn write_map(path: &Path, map: &Map<String, Value>) -> AppResult<()> {
    let tmp_path = sidecar_path(path, "tmp");
    let serialized = serde_json::to_vec_pretty(map)
        .map_err(|err| AppError::from(err).with_context("operation", "store_encode"))?;
    let mut tmp = File::create(&tmp_path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "store_tmp_create")
            .with_context("path", tmp_path.display().to_string())
    })?;
    tmp.write_all(&serialized).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "store_tmp_write")
            .with_context("path", tmp_path.display().to_string())
    })?;
    tmp.sync_all().map_err(|err| {
        AppError::from(err)
            .with_context("operation", "store_tmp_sync")
            .with_context("path", tmp_path.display().to_string())
    })?;
    fs::rename(&tmp_path, path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "store_rename")
            .with_context("from", tmp_path.display().to_string())
            .with_context("to", path.display().to_string())
    })?;
    Ok(())
}

/// Source and destination markers of the ongoing migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPaths {
    pub source: PathBuf,
    pub destination: PathBuf,
}

#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<dyn KeyValueStore>,
}

impl StoreHandle {
    pub fn new(store: impl KeyValueStore + 'static) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryStore::default())
    }

    pub fn json_file(path: impl AsRef<Path>) -> AppResult<Self> {
        Ok(Self::new(JsonFileStore::open(path)?))
    }

    pub fn raw(&self) -> &dyn KeyValueStore {
        self.inner.as_ref()
    }

    /// Both markers present, or `None` while no migration is underway.
    pub fn migration_paths(&self) -> AppResult<Option<MigrationPaths>> {
        let source = self.inner.get_string(SOURCE_KEY)?;
        let destination = self.inner.get_string(DESTINATION_KEY)?;
        Ok(match (source, destination) {
            (Some(source), Some(destination)) => Some(MigrationPaths {
                source: PathBuf::from(source),
                destination: PathBuf::from(destination),
            }),
            _ => None,
        })
    }

    pub fn set_migration_paths(&self, paths: &MigrationPaths) -> AppResult<()> {
        self.inner
            .put_string(SOURCE_KEY, &paths.source.to_string_lossy())?;
        self.inner
            .put_string(DESTINATION_KEY, &paths.destination.to_string_lossy())
    }

    pub fn migration_ongoing(&self) -> AppResult<bool> {
        Ok(self.migration_paths()?.is_some())
    }

    pub fn error_text(&self) -> AppResult<Option<String>> {
        self.inner.get_string(ERROR_TEXT_KEY)
    }

    pub fn set_error_text(&self, text: &str) -> AppResult<()> {
        self.inner.put_string(ERROR_TEXT_KEY, text)
    }

    pub fn clear_error_text(&self) -> AppResult<()> {
        self.inner.remove(ERROR_TEXT_KEY)
    }

    pub fn total_bytes(&self) -> AppResult<Option<u64>> {
        self.inner.get_u64(TOTAL_BYTES_KEY)
    }

    pub fn clear_run_keys(&self) -> AppResult<()> {
        for key in RUN_SCOPED_KEYS {
            self.inner.remove(key)?;
        }
        Ok(())
    }
}
