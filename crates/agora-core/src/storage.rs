//! Asynchronous key-value storage.
//!
//! [`Storage`] is the only persistence contract the coordination components
//! depend on. Values are JSON documents; [`StorageExt`] converts them to and from
//! typed records.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StorageError;

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Storage handle shared between components.
pub type SharedStorage = Arc<dyn Storage>;

/// Key-value store consumed by the dedup cache, the request registry and the job
/// scheduler.
///
/// Implementations must be safe to share across tasks. No component assumes a
/// particular backend.
pub trait Storage: Send + Sync {
    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot persist the value.
    fn set<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StorageError>>;

    /// Removes `key`, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot persist the removal.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StorageError>>;

    /// Returns every stored `(key, value)` pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn entries(&self) -> BoxFuture<'_, Result<Vec<(String, Value)>, StorageError>>;
}

/// Typed helpers over any [`Storage`].
pub trait StorageExt: Storage {
    /// Reads and deserializes the value under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the value has the wrong shape.
    fn get_json<'a, T>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<T>, StorageError>>
    where
        T: DeserializeOwned + Send + 'a,
    {
        Box::pin(async move {
            match self.get(key).await? {
                Some(value) => Ok(Some(serde_json::from_value(value)?)),
                None => Ok(None),
            }
        })
    }

    /// Serializes `value` and stores it under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    fn set_json<'a, T>(&'a self, key: &'a str, value: &T) -> BoxFuture<'a, Result<(), StorageError>>
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_value(value) {
            Ok(value) => self.set(key, value),
            Err(e) => Box::pin(async move { Err::<(), _>(StorageError::from(e)) }),
        }
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}

// ─────────────────────────────────────────────────────────────
// Memory Storage
// ─────────────────────────────────────────────────────────────

/// Ordered in-memory storage.
///
/// Reads and writes can be made to fail on demand, which is how the error paths
/// of the components built on top are exercised.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: RwLock<BTreeMap<String, Value>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store behind a [`SharedStorage`] handle.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Makes every subsequent `get`/`entries` fail (or succeed again).
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent `set`/`delete` fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    fn check_read(&self) -> Result<(), StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("reads are disabled".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("writes are disabled".to_string()));
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn set<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.check_write()?;
            self.values.write().insert(key.to_string(), value);
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StorageError>> {
        Box::pin(async move {
            self.check_read()?;
            Ok(self.values.read().get(key).cloned())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StorageError>> {
        Box::pin(async move {
            self.check_write()?;
            Ok(self.values.write().remove(key).is_some())
        })
    }

    fn entries(&self) -> BoxFuture<'_, Result<Vec<(String, Value)>, StorageError>> {
        Box::pin(async move {
            self.check_read()?;
            Ok(self
                .values
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        })
    }
}

// ─────────────────────────────────────────────────────────────
// JSON File Storage
// ─────────────────────────────────────────────────────────────

/// Storage backed by a single JSON document on disk.
///
/// The whole map is held in memory and rewritten through a temporary file and a
/// rename on every mutation, so a crash leaves either the old or the new snapshot.
#[derive(Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStorage {
    /// Opens the store at `path`, loading existing contents if the file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let values = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), keys = values.len(), "opened json file storage");
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_snapshot(&self, values: &BTreeMap<String, Value>) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(values)?;
        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

impl Storage for JsonFileStorage {
    fn set<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let mut values = self.values.lock().await;
            let mut next = values.clone();
            next.insert(key.to_string(), value);
            self.write_snapshot(&next).await?;
            *values = next;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StorageError>> {
        Box::pin(async move { Ok(self.values.lock().await.get(key).cloned()) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StorageError>> {
        Box::pin(async move {
            let mut values = self.values.lock().await;
            if !values.contains_key(key) {
                return Ok(false);
            }
            let mut next = values.clone();
            next.remove(key);
            self.write_snapshot(&next).await?;
            *values = next;
            Ok(true)
        })
    }

    fn entries(&self) -> BoxFuture<'_, Result<Vec<(String, Value)>, StorageError>> {
        Box::pin(async move {
            Ok(self
                .values
                .lock()
                .await
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        })
    }
}

// ─────────────────────────────────────────────────────────────
// Scoped Storage
// ─────────────────────────────────────────────────────────────

/// A key namespace inside another store.
///
/// Keys are stored as `"{scope}/{key}"`; [`Storage::entries`] only yields keys of
/// this scope, with the prefix stripped.
#[derive(Clone)]
pub struct ScopedStorage {
    inner: SharedStorage,
    prefix: String,
}

impl ScopedStorage {
    /// Creates a namespace called `scope` inside `inner`.
    #[must_use]
    pub fn new(inner: SharedStorage, scope: &str) -> Self {
        Self {
            inner,
            prefix: format!("{scope}/"),
        }
    }

    /// Creates the namespace behind a [`SharedStorage`] handle.
    #[must_use]
    pub fn shared(inner: SharedStorage, scope: &str) -> SharedStorage {
        Arc::new(Self::new(inner, scope))
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

impl std::fmt::Debug for ScopedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedStorage")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl Storage for ScopedStorage {
    fn set<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move { self.inner.set(&self.scoped(key), value).await })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StorageError>> {
        Box::pin(async move { self.inner.get(&self.scoped(key)).await })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StorageError>> {
        Box::pin(async move { self.inner.delete(&self.scoped(key)).await })
    }

    fn entries(&self) -> BoxFuture<'_, Result<Vec<(String, Value)>, StorageError>> {
        Box::pin(async move {
            Ok(self
                .inner
                .entries()
                .await?
                .into_iter()
                .filter_map(|(key, value)| {
                    key.strip_prefix(&self.prefix)
                        .map(|k| (k.to_string(), value))
                })
                .collect())
        })
    }
}
