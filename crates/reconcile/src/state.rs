//! Persisted resource state
//!
//! The store keeps one [`ResourceState`] per logical name plus bookkeeping
//! for interrupted work (pending operations and retired instances awaiting
//! deletion). Every mutation is flushed to the backend immediately so a crash
//! mid-run keeps the state of completed operations.

use crate::error::StateStoreError;
use crate::provider::ProviderConfig;
use crate::types::OperationKind;
use crate::value::{Arguments, AttrPath, Json, Outputs};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const STATE_VERSION: u32 = 1;
const STATE_FILE: &str = "state.json";
const STATE_BACKUP: &str = "state.json.backup";
const STATE_TMP: &str = "state.json.tmp";
const LOCK_FILE: &str = "lock.json";

// ============================================================================
// State Structures
// ============================================================================

/// Last applied state of one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub name: String,
    pub kind: String,
    /// Identifier assigned by the provider
    pub provider_id: String,
    /// Fully resolved arguments of the last successful create/update
    #[serde(default)]
    pub arguments: Arguments,
    /// Attributes reported by the provider
    #[serde(default)]
    pub outputs: Outputs,
    /// Resources this one referenced when last applied
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Provider the resource was applied through, if not the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceState {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        provider_id: impl Into<String>,
        arguments: Arguments,
        outputs: Outputs,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            kind: kind.into(),
            provider_id: provider_id.into(),
            arguments,
            outputs,
            dependencies: Vec::new(),
            provider: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_provider(mut self, provider: Option<String>) -> Self {
        self.provider = provider;
        self
    }

    /// Copy of this state after an in-place update
    pub fn updated(&self, arguments: Arguments, outputs: Outputs, dependencies: Vec<String>) -> Self {
        Self {
            arguments,
            outputs,
            dependencies,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Value of an attribute path; `id` falls back to the provider id
    pub fn attribute(&self, path: &AttrPath) -> Option<Json> {
        if let Some(value) = path.lookup_in(&self.outputs) {
            return Some(value.clone());
        }
        if path.first_key() == Some("id") && path.segments().len() == 1 {
            return Some(Json::String(self.provider_id.clone()));
        }
        None
    }
}

/// Marker for a provider call that was dispatched but not yet recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub operation: OperationKind,
    pub kind: String,
    /// Known identifier of the instance being touched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl PendingOperation {
    pub fn new(operation: OperationKind, kind: impl Into<String>, provider_id: Option<String>) -> Self {
        Self {
            operation,
            kind: kind.into(),
            provider_id,
            started_at: Utc::now(),
        }
    }
}

/// Whole persisted document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
    /// Replaced instances whose deletion has not happened yet
    #[serde(default)]
    pub retired: Vec<ResourceState>,
    #[serde(default)]
    pub pending: BTreeMap<String, PendingOperation>,
    /// Last resolved configuration of each provider
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            resources: BTreeMap::new(),
            retired: Vec::new(),
            pending: BTreeMap::new(),
            providers: BTreeMap::new(),
        }
    }
}

impl StateSnapshot {
    pub fn get(&self, name: &str) -> Option<&ResourceState> {
        self.resources.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.retired.is_empty() && self.pending.is_empty()
    }
}

// ============================================================================
// Locking
// ============================================================================

/// Who holds the run lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder: String,
    pub operation: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn current(operation: &str) -> Self {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("HOST"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            holder: format!("{host}:{}", std::process::id()),
            operation: operation.to_string(),
            acquired_at: Utc::now(),
        }
    }
}

/// RAII guard for the run-level lock
pub struct StateLock {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl StateLock {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Release the lock now instead of at drop
    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for StateLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateLock")
            .field("held", &self.release.is_some())
            .finish()
    }
}

// ============================================================================
// Backends
// ============================================================================

/// Durable storage for the state document
pub trait StateBackend: Send + Sync {
    /// Human-readable location, for messages
    fn describe(&self) -> String;

    /// Read the stored document, `None` when nothing was stored yet
    fn read(&self) -> Result<Option<StateSnapshot>, StateStoreError>;

    /// Replace the stored document atomically
    fn write(&self, snapshot: &StateSnapshot) -> Result<(), StateStoreError>;

    /// Acquire the run-level lock
    fn lock(&self, operation: &str) -> Result<StateLock, StateStoreError>;
}

/// JSON document in a directory, with a backup and a lock file
pub struct FileBackend {
    dir: PathBuf,
    stale_after: Duration,
    backed_up: AtomicBool,
}

impl FileBackend {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            stale_after: Duration::hours(1),
            backed_up: AtomicBool::new(false),
        }
    }

    /// Age after which a lock left by a dead run may be broken
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.dir.join(STATE_BACKUP)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    fn ensure_dir(&self) -> Result<(), StateStoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StateStoreError::Write {
            path: self.dir.clone(),
            source,
        })
    }

    fn try_create_lock(&self, info: &LockInfo) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path())?;
        let content = serde_json::to_vec_pretty(info).map_err(std::io::Error::other)?;
        file.write_all(&content)
    }

    fn read_lock(&self) -> Option<LockInfo> {
        read_lock_file(&self.lock_path())
    }

    /// Moves the lock file aside and deletes it only if it is still the
    /// lock that was judged stale. A lock another process created in the
    /// meantime is put back. Returns whether the stale lock is gone.
    fn break_stale_lock(&self, seen: Option<&LockInfo>) -> bool {
        static ASIDE: AtomicUsize = AtomicUsize::new(0);
        let lock_path = self.lock_path();
        let aside = self.dir.join(format!(
            "{LOCK_FILE}.stale-{}-{}",
            std::process::id(),
            ASIDE.fetch_add(1, Ordering::Relaxed)
        ));
        match fs::rename(&lock_path, &aside) {
            Ok(()) => {}
            // Someone else already broke it.
            Err(e) if e.kind() == ErrorKind::NotFound => return true,
            Err(e) => {
                log::warn!("Failed to move stale lock {}: {}", lock_path.display(), e);
                return false;
            }
        }

        if read_lock_file(&aside).as_ref() == seen {
            let _ = fs::remove_file(&aside);
            return true;
        }

        log::debug!("State lock changed hands while breaking it, restoring");
        // hard_link never replaces a lock created since the rename.
        if let Err(e) = fs::hard_link(&aside, &lock_path) {
            log::warn!("Failed to restore state lock {}: {}", lock_path.display(), e);
        }
        let _ = fs::remove_file(&aside);
        false
    }
}

fn read_lock_file(path: &Path) -> Option<LockInfo> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

impl StateBackend for FileBackend {
    fn describe(&self) -> String {
        self.state_path().display().to_string()
    }

    fn read(&self) -> Result<Option<StateSnapshot>, StateStoreError> {
        let path = self.state_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("State file {} does not exist, starting empty", path.display());
                return Ok(None);
            }
            Err(source) => return Err(StateStoreError::Read { path, source }),
        };
        let snapshot: StateSnapshot = serde_json::from_str(&content)
            .map_err(|source| StateStoreError::Parse { path: path.clone(), source })?;
        log::debug!(
            "Loaded state with {} resources from {}",
            snapshot.resources.len(),
            path.display()
        );
        Ok(Some(snapshot))
    }

    fn write(&self, snapshot: &StateSnapshot) -> Result<(), StateStoreError> {
        self.ensure_dir()?;
        let path = self.state_path();

        // Keep the document as it was before this process first touched it.
        if !self.backed_up.swap(true, Ordering::SeqCst) && path.exists() {
            fs::copy(&path, self.backup_path()).map_err(|source| StateStoreError::Write {
                path: self.backup_path(),
                source,
            })?;
            log::debug!("Created state backup");
        }

        let content = serde_json::to_vec_pretty(snapshot).map_err(StateStoreError::Serialize)?;
        let tmp = self.dir.join(STATE_TMP);
        fs::write(&tmp, content).map_err(|source| StateStoreError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StateStoreError::Write {
            path: path.clone(),
            source,
        })?;
        log::trace!("Wrote state with {} resources", snapshot.resources.len());
        Ok(())
    }

    fn lock(&self, operation: &str) -> Result<StateLock, StateStoreError> {
        self.ensure_dir()?;
        let info = LockInfo::current(operation);
        let lock_path = self.lock_path();

        for attempt in 0..2 {
            match self.try_create_lock(&info) {
                Ok(()) => {
                    log::debug!("Acquired state lock {}", lock_path.display());
                    let path = lock_path.clone();
                    return Ok(StateLock::new(move || {
                        if let Err(e) = fs::remove_file(&path) {
                            log::warn!("Failed to remove state lock {}: {}", path.display(), e);
                        } else {
                            log::debug!("Released state lock");
                        }
                    }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let existing = self.read_lock();
                    let stale = existing
                        .as_ref()
                        .is_none_or(|l| Utc::now() - l.acquired_at > self.stale_after);
                    if stale && attempt == 0 {
                        if self.break_stale_lock(existing.as_ref()) {
                            log::warn!(
                                "Removed stale state lock held by {}",
                                existing.as_ref().map_or("unknown", |l| l.holder.as_str())
                            );
                        }
                        continue;
                    }
                    let (holder, since) = existing
                        .map(|l| (l.holder, l.acquired_at))
                        .unwrap_or_else(|| ("unknown".to_string(), Utc::now()));
                    return Err(StateStoreError::Locked { holder, since });
                }
                Err(source) => {
                    return Err(StateStoreError::Write {
                        path: lock_path,
                        source,
                    });
                }
            }
        }
        Err(StateStoreError::Unavailable(format!(
            "could not acquire {}",
            lock_path.display()
        )))
    }
}

/// In-process backend, shared by clones
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    snapshot: Mutex<Option<StateSnapshot>>,
    locked: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-filled with a snapshot
    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        let backend = Self::default();
        *lock_ignoring_poison(&backend.inner.snapshot) = Some(snapshot);
        backend
    }

    /// Make every following write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Currently stored document
    pub fn stored(&self) -> Option<StateSnapshot> {
        lock_ignoring_poison(&self.inner.snapshot).clone()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.locked.load(Ordering::SeqCst)
    }
}

impl StateBackend for MemoryBackend {
    fn describe(&self) -> String {
        "in-memory state".to_string()
    }

    fn read(&self) -> Result<Option<StateSnapshot>, StateStoreError> {
        Ok(self.stored())
    }

    fn write(&self, snapshot: &StateSnapshot) -> Result<(), StateStoreError> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(StateStoreError::Unavailable("writes disabled".to_string()));
        }
        *lock_ignoring_poison(&self.inner.snapshot) = Some(snapshot.clone());
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn lock(&self, operation: &str) -> Result<StateLock, StateStoreError> {
        if self
            .inner
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StateStoreError::Locked {
                holder: "in-process run".to_string(),
                since: Utc::now(),
            });
        }
        log::debug!("Acquired in-memory state lock for {operation}");
        let inner = Arc::clone(&self.inner);
        Ok(StateLock::new(move || inner.locked.store(false, Ordering::SeqCst)))
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Store
// ============================================================================

/// Handle to persisted state
///
/// Holds the working snapshot in memory and flushes it to the backend after
/// each mutation. The engine is the only writer during a run.
pub struct StateStore {
    backend: Box<dyn StateBackend>,
    snapshot: Mutex<StateSnapshot>,
}

impl StateStore {
    pub fn new(backend: impl StateBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            snapshot: Mutex::new(StateSnapshot::default()),
        }
    }

    /// Store backed by `<dir>/state.json`
    pub fn open_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(FileBackend::new(dir))
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    pub fn describe(&self) -> String {
        self.backend.describe()
    }

    pub fn lock(&self, operation: &str) -> Result<StateLock, StateStoreError> {
        self.backend.lock(operation)
    }

    /// Read the persisted document (or start empty) and make it current
    pub fn load(&self) -> Result<StateSnapshot, StateStoreError> {
        let snapshot = self.backend.read()?.unwrap_or_default();
        if snapshot.version > STATE_VERSION {
            return Err(StateStoreError::UnsupportedVersion {
                found: snapshot.version,
                supported: STATE_VERSION,
            });
        }
        *lock_ignoring_poison(&self.snapshot) = snapshot.clone();
        Ok(snapshot)
    }

    /// Copy of the working snapshot
    pub fn snapshot(&self) -> StateSnapshot {
        lock_ignoring_poison(&self.snapshot).clone()
    }

    pub fn get(&self, name: &str) -> Option<ResourceState> {
        lock_ignoring_poison(&self.snapshot).resources.get(name).cloned()
    }

    /// Record a resource; clears its pending marker in the same write
    pub fn put(&self, state: ResourceState) -> Result<(), StateStoreError> {
        self.mutate(|s| {
            s.pending.remove(&state.name);
            s.resources.insert(state.name.clone(), state);
        })
    }

    /// Forget a resource; clears its pending marker in the same write
    pub fn remove(&self, name: &str) -> Result<Option<ResourceState>, StateStoreError> {
        self.mutate(|s| {
            s.pending.remove(name);
            s.resources.remove(name)
        })
    }

    pub fn mark_pending(&self, name: &str, pending: PendingOperation) -> Result<(), StateStoreError> {
        self.mutate(|s| {
            s.pending.insert(name.to_string(), pending);
        })
    }

    pub fn clear_pending(&self, name: &str) -> Result<(), StateStoreError> {
        if !lock_ignoring_poison(&self.snapshot).pending.contains_key(name) {
            return Ok(());
        }
        self.mutate(|s| {
            s.pending.remove(name);
        })
    }

    /// Record a replacement and keep the old instance until it is deleted
    ///
    /// Both changes land in a single write, so the old identifier is never
    /// lost and never tracked twice.
    pub fn put_replacing(
        &self,
        state: ResourceState,
        retired: ResourceState,
    ) -> Result<(), StateStoreError> {
        self.mutate(|s| {
            s.pending.remove(&state.name);
            s.retired.push(retired);
            s.resources.insert(state.name.clone(), state);
        })
    }

    /// Forget a retired instance once deleted, with its pending marker
    pub fn remove_retired(&self, name: &str, provider_id: &str) -> Result<(), StateStoreError> {
        self.mutate(|s| {
            s.retired
                .retain(|r| !(r.name == name && r.provider_id == provider_id));
            if s.pending.get(name).and_then(|p| p.provider_id.as_deref()) == Some(provider_id) {
                s.pending.remove(name);
            }
        })
    }

    /// Remember a provider configuration; no write when unchanged
    pub fn put_provider(&self, config: &ProviderConfig) -> Result<(), StateStoreError> {
        if lock_ignoring_poison(&self.snapshot).providers.get(&config.name) == Some(config) {
            return Ok(());
        }
        self.mutate(|s| {
            s.providers.insert(config.name.clone(), config.clone());
        })
    }

    pub fn provider(&self, name: &str) -> Option<ProviderConfig> {
        lock_ignoring_poison(&self.snapshot).providers.get(name).cloned()
    }

    /// Drop provider configurations for which `keep` is false
    pub fn retain_providers(&self, keep: impl Fn(&str) -> bool) -> Result<(), StateStoreError> {
        let unchanged = lock_ignoring_poison(&self.snapshot)
            .providers
            .keys()
            .all(|name| keep(name));
        if unchanged {
            return Ok(());
        }
        self.mutate(|s| s.providers.retain(|name, _| keep(name)))
    }

    /// Write the working snapshot as is
    pub fn flush(&self) -> Result<(), StateStoreError> {
        self.mutate(|_| ())
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut StateSnapshot) -> R) -> Result<R, StateStoreError> {
        let mut snapshot = lock_ignoring_poison(&self.snapshot);
        let mut next = snapshot.clone();
        let result = f(&mut next);
        next.updated_at = Utc::now();
        // Memory only moves once the backend has the same document.
        self.backend.write(&next)?;
        *snapshot = next;
        Ok(result)
    }
}

// ============================================================================
// Tests
// ============================================================================
