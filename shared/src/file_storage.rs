//! File-backed persistence.
//!
//! A [`FileStorageKey`] encodes the value with a [`Codec`] and writes it to a
//! path through a [`FileStorage`] backend:
//!
//! - Writes are coalesced. A save schedules one write after the configured
//!   debounce and later saves only replace the pending bytes. Pending bytes
//!   are flushed when the key is dropped.
//! - External edits are observed through the backend's watcher. A change
//!   whose contents equal the last write from this key is its own write
//!   and is ignored.
//!
//! [`LiveFileStorage`] talks to the file system and watches it with
//! `notify`. [`InMemoryFileStorage`], the test and preview default, keeps
//! files in a map and runs scheduled writes immediately.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use composable_arch_core::{DependencyKey, DependencyValues};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::PersistenceError;
use crate::persistence::{CacheId, DidSet, PersistenceKey, Subscription};

/// Deferred work handed to [`FileStorage::schedule`].
pub type Work = Box<dyn FnOnce() + Send>;

/// Change callback handed to [`FileStorage::watch`].
pub type OnChange = Arc<dyn Fn() + Send + Sync>;

/// Reads, writes and watches files.
pub trait FileStorage: Send + Sync + 'static {
    /// Read the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::NotFound`] when nothing is stored there,
    /// or the I/O error.
    fn load(&self, path: &Path) -> Result<Vec<u8>, PersistenceError>;

    /// Replace the file at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns the I/O error.
    fn save(&self, path: &Path, bytes: &[u8]) -> Result<(), PersistenceError>;

    /// Run `work` after `delay`.
    fn schedule(&self, delay: Duration, work: Work);

    /// Call `on_change` whenever the file at `path` changes, until the
    /// subscription drops.
    ///
    /// # Errors
    ///
    /// Returns an error when the watch cannot be set up.
    fn watch(&self, path: &Path, on_change: OnChange) -> Result<Subscription, PersistenceError>;
}

/// File storage in scope: live storage in the live context, in-memory
/// storage in previews and tests.
pub struct DefaultFileStorageKey;

impl DependencyKey for DefaultFileStorageKey {
    type Value = Arc<dyn FileStorage>;

    fn live_value() -> Option<Self::Value> {
        Some(Arc::new(LiveFileStorage::default()))
    }

    fn preview_value() -> Option<Self::Value> {
        Some(Arc::new(InMemoryFileStorage::new()))
    }

    fn test_value() -> Option<Self::Value> {
        Some(Arc::new(InMemoryFileStorage::new()))
    }
}

// ============================================================================
// Codecs
// ============================================================================

/// Converts values to and from stored bytes.
pub trait Codec<V>: Send + Sync + 'static {
    /// Encode `value`.
    ///
    /// # Errors
    ///
    /// Returns the serializer's error.
    fn encode(&self, value: &V) -> Result<Vec<u8>, PersistenceError>;

    /// Decode `bytes`.
    ///
    /// # Errors
    ///
    /// Returns the deserializer's error.
    fn decode(&self, bytes: &[u8]) -> Result<V, PersistenceError>;
}

/// Pretty-printed JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<V: Serialize + DeserializeOwned> Codec<V> for JsonCodec {
    fn encode(&self, value: &V) -> Result<Vec<u8>, PersistenceError> {
        Ok(serde_json::to_vec_pretty(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<V, PersistenceError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compact binary encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl<V: Serialize + DeserializeOwned> Codec<V> for BincodeCodec {
    fn encode(&self, value: &V) -> Result<Vec<u8>, PersistenceError> {
        Ok(bincode::serialize(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<V, PersistenceError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

// ============================================================================
// Key
// ============================================================================

/// Configuration for [`FileStorageKey`].
#[derive(Debug, Clone)]
pub struct FileStorageConfig {
    /// How long after a save the write happens. Saves in between replace
    /// the pending value.
    pub write_debounce: Duration,
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        Self {
            write_debounce: Duration::from_secs(1),
        }
    }
}

impl FileStorageConfig {
    /// Set the write debounce.
    #[must_use]
    pub const fn with_write_debounce(mut self, write_debounce: Duration) -> Self {
        self.write_debounce = write_debounce;
        self
    }
}

/// Pending and last-written bytes for one path.
struct Writer {
    path: PathBuf,
    storage: Arc<dyn FileStorage>,
    pending: Mutex<Option<Vec<u8>>>,
    last_written: Mutex<Option<Vec<u8>>>,
    scheduled: AtomicBool,
}

impl Writer {
    fn flush(&self) {
        self.scheduled.store(false, Ordering::Release);
        let Some(bytes) = self.pending.lock().take() else { return };

        *self.last_written.lock() = Some(bytes.clone());
        match self.storage.save(&self.path, &bytes) {
            Ok(()) => tracing::trace!(path = %self.path.display(), bytes = bytes.len(), "Wrote shared value"),
            Err(error) => tracing::error!(path = %self.path.display(), %error, "Failed to write shared value"),
        }
    }

    fn is_own_write(&self, bytes: &[u8]) -> bool {
        self.last_written.lock().as_deref() == Some(bytes)
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Persists a value to a file.
///
/// ```
/// use composable_arch_shared::{FileStorageKey, InMemoryFileStorage, Shared};
/// use std::sync::Arc;
///
/// let storage = Arc::new(InMemoryFileStorage::new());
/// let settings = Shared::with_key(
///     vec!["dark-mode".to_string()],
///     FileStorageKey::with_storage("/settings.json", storage.clone()),
/// );
/// settings.with_lock(|flags| flags.push("compact".into()));
///
/// let stored = storage.contents("/settings.json").unwrap();
/// let decoded: Vec<String> = serde_json::from_slice(&stored).unwrap();
/// assert_eq!(decoded, ["dark-mode", "compact"]);
/// ```
pub struct FileStorageKey<V, C = JsonCodec> {
    codec: Arc<C>,
    config: FileStorageConfig,
    writer: Arc<Writer>,
    _value: PhantomData<fn() -> V>,
}

impl<V> FileStorageKey<V> {
    /// A JSON-encoded key for `path` in the file storage in scope.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_storage(path, DependencyValues::current().get::<DefaultFileStorageKey>())
    }

    /// A JSON-encoded key for `path` in `storage`.
    pub fn with_storage(path: impl Into<PathBuf>, storage: Arc<dyn FileStorage>) -> Self {
        Self {
            codec: Arc::new(JsonCodec),
            config: FileStorageConfig::default(),
            writer: Arc::new(Writer {
                path: path.into(),
                storage,
                pending: Mutex::new(None),
                last_written: Mutex::new(None),
                scheduled: AtomicBool::new(false),
            }),
            _value: PhantomData,
        }
    }
}

impl<V, C> FileStorageKey<V, C> {
    /// Encode with `codec` instead.
    pub fn with_codec<C2>(self, codec: C2) -> FileStorageKey<V, C2> {
        FileStorageKey {
            codec: Arc::new(codec),
            config: self.config,
            writer: self.writer,
            _value: PhantomData,
        }
    }

    /// Use `config`.
    #[must_use]
    pub fn with_config(mut self, config: FileStorageConfig) -> Self {
        self.config = config;
        self
    }

    /// The path written to.
    pub fn path(&self) -> &Path {
        &self.writer.path
    }
}

impl<V, C> fmt::Debug for FileStorageKey<V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStorageKey")
            .field("path", &self.writer.path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<V, C> PersistenceKey<V> for FileStorageKey<V, C>
where
    V: Clone + Send + 'static,
    C: Codec<V>,
{
    fn cache_id(&self) -> CacheId {
        let storage = Arc::as_ptr(&self.writer.storage).cast::<()>() as usize;
        CacheId::new::<FileStorageKey<(), ()>>(format!("{}#{storage:x}", self.writer.path.display()))
    }

    fn load(&self, initial: Option<&V>) -> Option<V> {
        let loaded = self
            .writer
            .storage
            .load(&self.writer.path)
            .and_then(|bytes| self.codec.decode(&bytes));
        match loaded {
            Ok(value) => Some(value),
            Err(PersistenceError::NotFound(_)) => initial.cloned(),
            Err(error) => {
                tracing::warn!(path = %self.writer.path.display(), %error, "Failed to load shared value");
                initial.cloned()
            },
        }
    }

    fn save(&self, value: &V) {
        let bytes = match self.codec.encode(value) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::error!(path = %self.writer.path.display(), %error, "Failed to encode shared value");
                return;
            },
        };
        *self.writer.pending.lock() = Some(bytes);

        if !self.writer.scheduled.swap(true, Ordering::AcqRel) {
            let writer: Weak<Writer> = Arc::downgrade(&self.writer);
            self.writer.storage.schedule(
                self.config.write_debounce,
                Box::new(move || {
                    if let Some(writer) = writer.upgrade() {
                        writer.flush();
                    }
                }),
            );
        }
    }

    fn subscribe(&self, initial: Option<V>, did_set: DidSet<V>) -> Subscription {
        let writer = Arc::downgrade(&self.writer);
        let codec = Arc::clone(&self.codec);
        let initial = Mutex::new(initial);
        let on_change: OnChange = Arc::new(move || {
            let Some(writer) = writer.upgrade() else { return };
            let bytes = match writer.storage.load(&writer.path) {
                Ok(bytes) if writer.is_own_write(&bytes) => return,
                Ok(bytes) => bytes,
                Err(PersistenceError::NotFound(_)) => {
                    tracing::debug!(path = %writer.path.display(), "Shared file removed, using the initial value");
                    did_set(initial.lock().clone());
                    return;
                },
                Err(error) => {
                    tracing::warn!(path = %writer.path.display(), %error, "Failed to reload shared file");
                    return;
                },
            };
            match codec.decode(&bytes) {
                Ok(value) => did_set(Some(value)),
                Err(error) => {
                    tracing::warn!(path = %writer.path.display(), %error, "Shared file changed but did not decode, using the initial value");
                    did_set(initial.lock().clone());
                },
            }
        });

        match self.writer.storage.watch(&self.writer.path, on_change) {
            Ok(subscription) => subscription,
            Err(error) => {
                tracing::warn!(path = %self.writer.path.display(), %error, "Failed to watch shared file");
                Subscription::empty()
            },
        }
    }
}

// ============================================================================
// Live storage
// ============================================================================

/// The file system, watched with `notify`.
#[derive(Debug, Clone)]
pub struct LiveFileStorage {
    /// Events for the same file closer together than this are reported
    /// once.
    pub event_debounce: Duration,
}

impl Default for LiveFileStorage {
    fn default() -> Self {
        Self {
            event_debounce: Duration::from_millis(50),
        }
    }
}

impl FileStorage for LiveFileStorage {
    fn load(&self, path: &Path) -> Result<Vec<u8>, PersistenceError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(PersistenceError::NotFound(path.to_path_buf()))
            },
            Err(error) => Err(error.into()),
        }
    }

    fn save(&self, path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn schedule(&self, delay: Duration, work: Work) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                // Writes block, keep them off the async workers.
                if let Err(error) = tokio::task::spawn_blocking(work).await {
                    tracing::warn!(%error, "Scheduled shared file write did not finish");
                }
            });
        } else {
            thread::spawn(move || {
                thread::sleep(delay);
                work();
            });
        }
    }

    fn watch(&self, path: &Path, on_change: OnChange) -> Result<Subscription, PersistenceError> {
        let directory = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .ok_or_else(|| PersistenceError::InvalidPath(path.to_path_buf()))?;
        let file_name = path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .ok_or_else(|| PersistenceError::InvalidPath(path.to_path_buf()))?;
        std::fs::create_dir_all(directory)?;

        let (raw_tx, raw_rx) = mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                if let Ok(event) = result {
                    let _ = raw_tx.send(event);
                }
            },
            notify::Config::default(),
        )?;
        // The directory, so the file can be deleted and recreated.
        watcher.watch(directory, RecursiveMode::NonRecursive)?;

        let debounce = self.event_debounce;
        thread::spawn(move || debounce_events(&raw_rx, &file_name, debounce, on_change.as_ref()));
        tracing::debug!(path = %path.display(), "Watching shared file");

        // Dropping the watcher disconnects the channel and ends the thread.
        Ok(Subscription::new(move || drop(watcher)))
    }
}

fn debounce_events(
    events: &mpsc::Receiver<Event>,
    file_name: &OsString,
    debounce: Duration,
    on_change: &(dyn Fn() + Send + Sync),
) {
    let mut pending: Option<Instant> = None;
    loop {
        let timeout = pending.map_or(Duration::from_secs(60), |_| debounce);
        match events.recv_timeout(timeout) {
            Ok(event) => {
                if affects(&event, file_name) {
                    pending = Some(Instant::now());
                }
            },
            Err(RecvTimeoutError::Timeout) => {
                if pending.is_some_and(|last| last.elapsed() >= debounce) {
                    pending = None;
                    on_change();
                }
            },
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn affects(event: &Event, file_name: &OsString) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|path| path.file_name().is_some_and(|name| name == file_name))
}

// ============================================================================
// In-memory storage
// ============================================================================

/// Files kept in a map. Scheduled work runs immediately, so saves are
/// visible as soon as they are made.
#[derive(Default)]
pub struct InMemoryFileStorage {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    watchers: Arc<Mutex<HashMap<PathBuf, BTreeMap<u64, OnChange>>>>,
    next_watcher: AtomicU64,
}

impl InMemoryFileStorage {
    /// Empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The bytes stored at `path`.
    #[must_use]
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files.lock().get(path.as_ref()).cloned()
    }

    /// Replace the file at `path` as another process would, notifying
    /// watchers.
    pub fn simulate_external_write(&self, path: impl AsRef<Path>, bytes: impl Into<Vec<u8>>) {
        let path = path.as_ref();
        self.files.lock().insert(path.to_path_buf(), bytes.into());
        self.notify(path);
    }

    /// Delete the file at `path`, notifying watchers.
    pub fn remove(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        if self.files.lock().remove(path).is_some() {
            self.notify(path);
        }
    }

    fn notify(&self, path: &Path) {
        let handlers: Vec<OnChange> = self
            .watchers
            .lock()
            .get(path)
            .map(|handlers| handlers.values().cloned().collect())
            .unwrap_or_default();
        for handler in handlers {
            handler();
        }
    }
}

impl fmt::Debug for InMemoryFileStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryFileStorage")
            .field("files", &self.files.lock().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl FileStorage for InMemoryFileStorage {
    fn load(&self, path: &Path) -> Result<Vec<u8>, PersistenceError> {
        self.contents(path)
            .ok_or_else(|| PersistenceError::NotFound(path.to_path_buf()))
    }

    fn save(&self, path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.files.lock().insert(path.to_path_buf(), bytes.to_vec());
        self.notify(path);
        Ok(())
    }

    fn schedule(&self, _delay: Duration, work: Work) {
        work();
    }

    fn watch(&self, path: &Path, on_change: OnChange) -> Result<Subscription, PersistenceError> {
        let id = self.next_watcher.fetch_add(1, Ordering::Relaxed);
        self.watchers
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .insert(id, on_change);

        let watchers = Arc::downgrade(&self.watchers);
        let path = path.to_path_buf();
        Ok(Subscription::new(move || {
            if let Some(watchers) = watchers.upgrade() {
                let mut watchers = watchers.lock();
                if let Some(handlers) = watchers.get_mut(&path) {
                    handlers.remove(&id);
                    if handlers.is_empty() {
                        watchers.remove(&path);
                    }
                }
            }
        }))
    }
}
