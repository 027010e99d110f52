//! Authoritative set of active shares
//!
//! The registry is the only writer to the share store. Every operation runs
//! under a single lock, so adds, removals, resets and expiry sweeps are
//! linearised. File inspection and copying happen before the lock is taken.

use crate::config::{ShareSettings, StorageMode};
use crate::daemon::clock::Clock;
use crate::daemon::protocol::{AccessMode, AccessModes, ErrorKind, Selector, ShareId, ShareRecord};
use crate::daemon::store::{ShareStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Registry error types
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Share duration must be between 1 and {max_hours} hours")]
    InvalidDuration { max_hours: i64 },

    #[error("At least one access mode must be enabled")]
    NoAccessModes,

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Not a regular file: {0}")]
    NotAFile(PathBuf),

    #[error("Cannot read {path}: {source}")]
    FileUnreadable { path: PathBuf, source: io::Error },

    #[error("File is {size} bytes, the limit is {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("No active share matches {0}")]
    NotFound(String),

    #[error("Share {0} has expired")]
    Expired(ShareId),

    #[error("Share {id} does not allow {mode} access")]
    ModeNotEnabled { id: ShareId, mode: AccessMode },

    #[error("Generated share id {0} collided twice")]
    DuplicateId(ShareId),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to acquire lock")]
    LockError,
}

impl RegistryError {
    /// Category reported to the cli.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::InvalidDuration { .. }
            | RegistryError::NoAccessModes
            | RegistryError::FileNotFound(_)
            | RegistryError::NotAFile(_)
            | RegistryError::FileUnreadable { .. }
            | RegistryError::TooLarge { .. } => ErrorKind::InvalidInput,
            RegistryError::NotFound(_) => ErrorKind::NotFound,
            RegistryError::Expired(_) => ErrorKind::Expired,
            RegistryError::ModeNotEnabled { .. } => ErrorKind::ModeNotEnabled,
            RegistryError::DuplicateId(_) => ErrorKind::DuplicateId,
            RegistryError::Io(_) => ErrorKind::Io,
            RegistryError::Store(_) | RegistryError::LockError => ErrorKind::Internal,
        }
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Limits and storage behaviour applied to new shares.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub max_duration: Duration,
    pub size_limit_bytes: u64,
    pub storage: StorageMode,
    /// Destination of private copies in `StorageMode::Copy`
    pub copy_dir: PathBuf,
}

impl RegistryOptions {
    pub fn from_settings(settings: &ShareSettings) -> Self {
        Self {
            max_duration: duration_from_hours(settings.max_hours).unwrap_or(Duration::MAX),
            size_limit_bytes: settings.size_limit_bytes,
            storage: settings.storage,
            copy_dir: settings.effective_copy_dir(),
        }
    }
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self::from_settings(&ShareSettings::default())
    }
}

/// Convert a whole number of hours, `None` on overflow.
pub fn duration_from_hours(hours: i64) -> Option<Duration> {
    Duration::try_hours(hours)
}

/// Parameters of a new share.
#[derive(Debug, Clone)]
pub struct AddShare {
    pub owner: String,
    pub path: PathBuf,
    pub name: Option<String>,
    pub duration: Duration,
    pub modes: AccessModes,
}

/// A file that passed validation, ready to be recorded.
struct PreparedFile {
    path: PathBuf,
    size: u64,
    owned_copy: bool,
}

/// Concurrency-safe share registry
pub struct Registry {
    store: Mutex<Box<dyn ShareStore>>,
    clock: Arc<dyn Clock>,
    options: RegistryOptions,
    expiry_changed: Arc<Notify>,
}

impl Registry {
    pub fn new(store: Box<dyn ShareStore>, clock: Arc<dyn Clock>, options: RegistryOptions) -> Self {
        Self {
            store: Mutex::new(store),
            clock,
            options,
            expiry_changed: Arc::new(Notify::new()),
        }
    }

    /// Current time as seen by the registry
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Signalled whenever a share is added, so the scheduler can shorten its sleep.
    pub fn expiry_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.expiry_changed)
    }

    fn lock_store(&self) -> RegistryResult<MutexGuard<'_, Box<dyn ShareStore>>> {
        self.store.lock().map_err(|_| RegistryError::LockError)
    }

    /// Validate a file and create a share for it.
    pub fn add(&self, request: AddShare) -> RegistryResult<ShareRecord> {
        if request.duration <= Duration::zero() || request.duration > self.options.max_duration {
            return Err(RegistryError::InvalidDuration {
                max_hours: self.options.max_duration.num_hours(),
            });
        }
        if request.modes.is_empty() {
            return Err(RegistryError::NoAccessModes);
        }

        let canonical = self.inspect_file(&request.path)?;
        let name = request
            .name
            .filter(|name| !name.trim().is_empty())
            .or_else(|| {
                canonical
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "file".to_string());
        let file_type = canonical
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let prepared = self.prepare_file(canonical)?;

        let created_at = self.clock.now();
        let mut record = ShareRecord {
            id: ShareId::new(),
            owner: request.owner,
            path: prepared.path,
            name,
            size: prepared.size,
            file_type,
            created_at,
            expires_at: created_at + request.duration,
            modes: request.modes,
            owned_copy: prepared.owned_copy,
        };

        if let Err(e) = self.insert(&mut record) {
            discard_copy(&record);
            return Err(e);
        }

        self.expiry_changed.notify_one();
        info!(
            share_id = %record.id,
            owner = %record.owner,
            name = %record.name,
            size = record.size,
            expires_at = %record.expires_at,
            modes = %record.modes,
            "Share added"
        );
        Ok(record)
    }

    /// Persist a record, regenerating its id once if it collides.
    fn insert(&self, record: &mut ShareRecord) -> RegistryResult<()> {
        let mut store = self.lock_store()?;
        match store.put(record) {
            Err(StoreError::DuplicateId(id)) => {
                warn!(share_id = %id, "Share id collision, regenerating");
                record.id = ShareId::new();
                match store.put(record) {
                    Err(StoreError::DuplicateId(id)) => {
                        error!(share_id = %id, "Share id collided twice");
                        Err(RegistryError::DuplicateId(id))
                    }
                    other => Ok(other?),
                }
            }
            other => Ok(other?),
        }
    }

    /// Check that `path` names a readable regular file within the size limit.
    fn inspect_file(&self, path: &Path) -> RegistryResult<PathBuf> {
        let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => RegistryError::FileNotFound(path.to_path_buf()),
            _ => RegistryError::FileUnreadable {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        if !metadata.is_file() {
            return Err(RegistryError::NotAFile(path.to_path_buf()));
        }
        if metadata.len() > self.options.size_limit_bytes {
            return Err(RegistryError::TooLarge {
                size: metadata.len(),
                limit: self.options.size_limit_bytes,
            });
        }

        File::open(path).map_err(|e| RegistryError::FileUnreadable {
            path: path.to_path_buf(),
            source: e,
        })?;

        path.canonicalize()
            .map_err(|e| RegistryError::FileUnreadable {
                path: path.to_path_buf(),
                source: e,
            })
    }

    /// Stat the file once, copying it first in copy storage mode.
    fn prepare_file(&self, path: PathBuf) -> RegistryResult<PreparedFile> {
        match self.options.storage {
            StorageMode::Reference => {
                let size = std::fs::metadata(&path)?.len();
                Ok(PreparedFile {
                    path,
                    size,
                    owned_copy: false,
                })
            }
            StorageMode::Copy => {
                std::fs::create_dir_all(&self.options.copy_dir)?;
                let destination = self.options.copy_dir.join(uuid::Uuid::new_v4().to_string());
                let size = match std::fs::copy(&path, &destination) {
                    Ok(size) => size,
                    Err(e) => {
                        discard_partial_copy(&destination);
                        return Err(e.into());
                    }
                };
                if size > self.options.size_limit_bytes {
                    discard_partial_copy(&destination);
                    return Err(RegistryError::TooLarge {
                        size,
                        limit: self.options.size_limit_bytes,
                    });
                }
                debug!(source = %path.display(), copy = %destination.display(), "Copied shared file");
                Ok(PreparedFile {
                    path: destination,
                    size,
                    owned_copy: true,
                })
            }
        }
    }

    /// Active shares of `owner`, oldest first.
    pub fn list(&self, owner: &str) -> RegistryResult<Vec<ShareRecord>> {
        let store = self.lock_store()?;
        self.active_for(&**store, owner)
    }

    fn active_for(&self, store: &dyn ShareStore, owner: &str) -> RegistryResult<Vec<ShareRecord>> {
        let now = self.clock.now();
        Ok(store
            .list_all()?
            .into_iter()
            .filter(|record| record.owner == owner && !record.is_expired_at(now))
            .collect())
    }

    /// Look up a share that has not yet expired.
    pub fn get_active(&self, id: ShareId) -> RegistryResult<ShareRecord> {
        let record = {
            let store = self.lock_store()?;
            match store.get(id) {
                Ok(record) => record,
                Err(StoreError::NotFound(_)) => return Err(RegistryError::NotFound(id.to_string())),
                Err(e) => return Err(e.into()),
            }
        };

        if record.is_expired_at(self.clock.now()) {
            return Err(RegistryError::Expired(id));
        }
        Ok(record)
    }

    /// Look up an active share and check that it allows `mode`.
    pub fn get_for_access(&self, id: ShareId, mode: AccessMode) -> RegistryResult<ShareRecord> {
        let record = self.get_active(id)?;
        if !record.modes.allows(mode) {
            return Err(RegistryError::ModeNotEnabled { id, mode });
        }
        Ok(record)
    }

    /// Remove one of `owner`'s active shares.
    ///
    /// Index selectors are resolved against the owner's listing at the moment
    /// of removal.
    pub fn remove(&self, owner: &str, selector: Selector) -> RegistryResult<ShareRecord> {
        let record = {
            let mut store = self.lock_store()?;
            let active = self.active_for(&**store, owner)?;
            let record = match selector {
                Selector::ById(id) => active.into_iter().find(|record| record.id == id),
                Selector::ByIndex(index) => active.into_iter().nth(index),
            }
            .ok_or_else(|| RegistryError::NotFound(selector.to_string()))?;

            store.delete(record.id)?;
            record
        };

        discard_copy(&record);
        info!(share_id = %record.id, owner = %owner, "Share removed");
        Ok(record)
    }

    /// Remove every share regardless of owner or expiry.
    pub fn reset(&self) -> RegistryResult<usize> {
        let records = {
            let mut store = self.lock_store()?;
            let records = store.list_all()?;
            store.clear()?;
            records
        };

        for record in &records {
            discard_copy(record);
        }
        info!(removed = records.len(), "Registry reset");
        Ok(records.len())
    }

    /// Delete every share whose expiry time has been reached.
    pub fn sweep(&self) -> RegistryResult<Vec<ShareRecord>> {
        let now = self.clock.now();
        let mut deleted = Vec::new();
        let result = {
            let mut store = self.lock_store()?;
            let expired: Vec<ShareRecord> = store
                .list_all()?
                .into_iter()
                .filter(|record| record.is_expired_at(now))
                .collect();

            let mut result = Ok(());
            for record in expired {
                if let Err(e) = store.delete(record.id) {
                    result = Err(RegistryError::from(e));
                    break;
                }
                deleted.push(record);
            }
            result
        };

        // Copies of records already deleted are unreachable once the store
        // forgets them, so discard them before reporting a failure.
        for record in &deleted {
            discard_copy(record);
            info!(share_id = %record.id, expired_at = %record.expires_at, "Share expired");
        }
        result.map(|()| deleted)
    }

    /// Earliest expiry among stored shares.
    pub fn next_expiry(&self) -> RegistryResult<Option<DateTime<Utc>>> {
        let store = self.lock_store()?;
        Ok(store.list_all()?.iter().map(|record| record.expires_at).min())
    }
}

/// Delete the agent's private copy of a share's bytes, if it made one.
fn discard_copy(record: &ShareRecord) {
    if !record.owned_copy {
        return;
    }
    match std::fs::remove_file(&record.path) {
        Ok(()) => debug!(share_id = %record.id, "Removed share copy"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(share_id = %record.id, path = %record.path.display(), "Failed to remove share copy: {}", e),
    }
}

/// Remove a copy that never made it into a record.
fn discard_partial_copy(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed partial copy"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove partial copy: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::clock::ManualClock;
    use crate::daemon::store::{MemoryStore, SqliteStore};
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const OWNER: &str = "uid:1000";

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn create_registry() -> (Registry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_time()));
        let registry = Registry::new(
            Box::new(MemoryStore::new()),
            clock.clone(),
            RegistryOptions::default(),
        );
        (registry, clock)
    }

    fn write_file(dir: &TempDir, name: &str, len: usize) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, vec![b'x'; len]).unwrap();
        path
    }

    fn add_request(path: &Path, hours: i64, modes: AccessModes) -> AddShare {
        AddShare {
            owner: OWNER.to_string(),
            path: path.to_path_buf(),
            name: None,
            duration: Duration::hours(hours),
            modes,
        }
    }

    #[test]
    fn test_add_records_file_metadata() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "Report.PDF", 50_000);
        let (registry, _clock) = create_registry();

        let record = registry
            .add(add_request(&path, 1, AccessModes::only(AccessMode::Wget)))
            .unwrap();

        assert_eq!(record.name, "Report.PDF");
        assert_eq!(record.file_type, "pdf");
        assert_eq!(record.size, 50_000);
        assert_eq!(record.expires_at - record.created_at, Duration::hours(1));
        assert!(record.path.is_absolute());
        assert!(!record.owned_copy);
        assert_eq!(registry.get_active(record.id).unwrap(), record);
    }

    #[test]
    fn test_add_uses_custom_name() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", 3);
        let (registry, _clock) = create_registry();

        let mut request = add_request(&path, 1, AccessModes::ALL);
        request.name = Some("notes.txt".to_string());
        assert_eq!(registry.add(request).unwrap().name, "notes.txt");
    }

    #[test]
    fn test_add_rejects_invalid_duration() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", 3);
        let (registry, _clock) = create_registry();

        for hours in [0, -5, 8761] {
            let err = registry
                .add(add_request(&path, hours, AccessModes::ALL))
                .unwrap_err();
            assert!(matches!(err, RegistryError::InvalidDuration { .. }));
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
        }
        assert!(registry.list(OWNER).unwrap().is_empty());
    }

    #[test]
    fn test_add_rejects_bad_input() {
        let dir = TempDir::new().unwrap();
        let (registry, _clock) = create_registry();
        let path = write_file(&dir, "a.txt", 3);

        let err = registry
            .add(add_request(
                &path,
                1,
                AccessModes {
                    website: false,
                    wget: false,
                },
            ))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NoAccessModes));

        let err = registry
            .add(add_request(&dir.path().join("missing"), 1, AccessModes::ALL))
            .unwrap_err();
        assert!(matches!(err, RegistryError::FileNotFound(_)));

        let err = registry
            .add(add_request(dir.path(), 1, AccessModes::ALL))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotAFile(_)));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_add_rejects_oversized_file() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "big.bin", 2048);
        let registry = Registry::new(
            Box::new(MemoryStore::new()),
            Arc::new(ManualClock::new(start_time())),
            RegistryOptions {
                size_limit_bytes: 1024,
                ..RegistryOptions::default()
            },
        );

        let err = registry
            .add(add_request(&path, 1, AccessModes::ALL))
            .unwrap_err();
        assert!(matches!(err, RegistryError::TooLarge { size: 2048, limit: 1024 }));
    }

    #[test]
    fn test_get_active_unknown_id() {
        let (registry, _clock) = create_registry();
        let err = registry.get_active(ShareId::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_expiry_lazy_then_sweep() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", 3);
        let (registry, clock) = create_registry();

        let record = registry.add(add_request(&path, 2, AccessModes::ALL)).unwrap();
        assert_eq!(registry.next_expiry().unwrap(), Some(record.expires_at));

        clock.advance(Duration::hours(2) - Duration::seconds(1));
        assert!(registry.get_active(record.id).is_ok());
        assert!(registry.sweep().unwrap().is_empty());

        clock.advance(Duration::seconds(1));
        assert!(matches!(
            registry.get_active(record.id),
            Err(RegistryError::Expired(_))
        ));
        assert!(registry.list(OWNER).unwrap().is_empty());

        let swept = registry.sweep().unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, record.id);
        assert_eq!(
            registry.get_active(record.id).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(registry.next_expiry().unwrap(), None);
    }

    #[test]
    fn test_mode_not_enabled() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "report.pdf", 50_000);
        let (registry, _clock) = create_registry();

        let record = registry
            .add(add_request(&path, 1, AccessModes::only(AccessMode::Wget)))
            .unwrap();

        assert!(registry.get_for_access(record.id, AccessMode::Wget).is_ok());
        let err = registry
            .get_for_access(record.id, AccessMode::Website)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModeNotEnabled);
    }

    #[test]
    fn test_list_is_per_owner_and_ordered() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", 3);
        let (registry, clock) = create_registry();

        let first = registry.add(add_request(&path, 1, AccessModes::ALL)).unwrap();
        clock.advance(Duration::minutes(1));
        let second = registry.add(add_request(&path, 1, AccessModes::ALL)).unwrap();

        let mut other = add_request(&path, 1, AccessModes::ALL);
        other.owner = "uid:2000".to_string();
        registry.add(other).unwrap();

        let ids: Vec<ShareId> = registry.list(OWNER).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert_eq!(registry.list("uid:2000").unwrap().len(), 1);
    }

    #[test]
    fn test_remove_by_index_removes_oldest() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", 3);
        let (registry, clock) = create_registry();

        let first = registry.add(add_request(&path, 1, AccessModes::ALL)).unwrap();
        clock.advance(Duration::minutes(1));
        let second = registry.add(add_request(&path, 1, AccessModes::ALL)).unwrap();

        let removed = registry.remove(OWNER, Selector::ByIndex(0)).unwrap();
        assert_eq!(removed.id, first.id);

        let remaining = registry.list(OWNER).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, second.id);

        assert_eq!(
            registry
                .remove(OWNER, Selector::ByIndex(1))
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_remove_by_id() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", 3);
        let (registry, _clock) = create_registry();

        let record = registry.add(add_request(&path, 1, AccessModes::ALL)).unwrap();

        // Other users cannot remove the share
        assert_eq!(
            registry
                .remove("uid:2000", Selector::ById(record.id))
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );

        registry.remove(OWNER, Selector::ById(record.id)).unwrap();
        assert!(registry.get_active(record.id).is_err());
        assert!(registry.remove(OWNER, Selector::ById(record.id)).is_err());
    }

    #[test]
    fn test_remove_skips_expired() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", 3);
        let (registry, clock) = create_registry();

        let record = registry.add(add_request(&path, 1, AccessModes::ALL)).unwrap();
        clock.advance(Duration::hours(1));
        assert_eq!(
            registry
                .remove(OWNER, Selector::ById(record.id))
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_reset() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", 3);
        let (registry, _clock) = create_registry();

        registry.add(add_request(&path, 1, AccessModes::ALL)).unwrap();
        let mut other = add_request(&path, 1, AccessModes::ALL);
        other.owner = "uid:2000".to_string();
        registry.add(other).unwrap();

        assert_eq!(registry.reset().unwrap(), 2);
        assert!(registry.list(OWNER).unwrap().is_empty());
        assert!(registry.list("uid:2000").unwrap().is_empty());
    }

    #[test]
    fn test_copy_storage_owns_and_discards_copy() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", 10);
        let copy_dir = dir.path().join("copies");
        let registry = Registry::new(
            Box::new(MemoryStore::new()),
            Arc::new(ManualClock::new(start_time())),
            RegistryOptions {
                storage: StorageMode::Copy,
                copy_dir: copy_dir.clone(),
                ..RegistryOptions::default()
            },
        );

        let record = registry.add(add_request(&path, 1, AccessModes::ALL)).unwrap();
        assert!(record.owned_copy);
        assert!(record.path.starts_with(&copy_dir));
        assert_eq!(std::fs::read(&record.path).unwrap().len(), 10);

        registry.remove(OWNER, Selector::ById(record.id)).unwrap();
        assert!(!record.path.exists());
        assert!(path.exists());
    }

    /// Memory store that can be told to collide on puts or fail deletes.
    struct FlakyStore {
        inner: MemoryStore,
        collisions: usize,
        puts: Arc<AtomicUsize>,
        deletes_before_failure: Option<usize>,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                collisions: 0,
                puts: Arc::new(AtomicUsize::new(0)),
                deletes_before_failure: None,
            }
        }
    }

    impl ShareStore for FlakyStore {
        fn put(&mut self, record: &ShareRecord) -> Result<(), StoreError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self.collisions > 0 {
                self.collisions -= 1;
                return Err(StoreError::DuplicateId(record.id));
            }
            self.inner.put(record)
        }

        fn get(&self, id: ShareId) -> Result<ShareRecord, StoreError> {
            self.inner.get(id)
        }

        fn delete(&mut self, id: ShareId) -> Result<(), StoreError> {
            match self.deletes_before_failure {
                Some(0) => Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
                    None,
                ))),
                Some(remaining) => {
                    self.deletes_before_failure = Some(remaining - 1);
                    self.inner.delete(id)
                }
                None => self.inner.delete(id),
            }
        }

        fn list_all(&self) -> Result<Vec<ShareRecord>, StoreError> {
            self.inner.list_all()
        }

        fn clear(&mut self) -> Result<usize, StoreError> {
            self.inner.clear()
        }

        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    fn copy_registry(
        store: Box<dyn ShareStore>,
        copy_dir: &Path,
    ) -> (Registry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_time()));
        let registry = Registry::new(
            store,
            clock.clone(),
            RegistryOptions {
                storage: StorageMode::Copy,
                copy_dir: copy_dir.to_path_buf(),
                ..RegistryOptions::default()
            },
        );
        (registry, clock)
    }

    fn copies_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
    }

    #[test]
    fn test_id_collision_is_retried_once() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", 3);
        let mut store = FlakyStore::new();
        store.collisions = 1;
        let puts = Arc::clone(&store.puts);
        let (registry, _clock) = copy_registry(Box::new(store), &dir.path().join("copies"));

        let record = registry.add(add_request(&path, 1, AccessModes::ALL)).unwrap();
        assert_eq!(puts.load(Ordering::SeqCst), 2);
        assert_eq!(registry.get_active(record.id).unwrap(), record);
        assert!(record.path.exists());
    }

    #[test]
    fn test_second_id_collision_fails() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", 3);
        let copy_dir = dir.path().join("copies");
        let mut store = FlakyStore::new();
        store.collisions = 2;
        let puts = Arc::clone(&store.puts);
        let (registry, _clock) = copy_registry(Box::new(store), &copy_dir);

        let err = registry
            .add(add_request(&path, 1, AccessModes::ALL))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(_)));
        assert_eq!(err.kind(), ErrorKind::DuplicateId);
        assert_eq!(puts.load(Ordering::SeqCst), 2);
        assert!(registry.list(OWNER).unwrap().is_empty());
        assert_eq!(copies_in(&copy_dir), 0);
    }

    #[test]
    fn test_sweep_discards_copies() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", 10);
        let copy_dir = dir.path().join("copies");
        let (registry, clock) = copy_registry(Box::new(MemoryStore::new()), &copy_dir);

        let first = registry.add(add_request(&path, 1, AccessModes::ALL)).unwrap();
        let second = registry.add(add_request(&path, 1, AccessModes::ALL)).unwrap();
        assert_eq!(copies_in(&copy_dir), 2);

        clock.advance(Duration::hours(1));
        assert_eq!(registry.sweep().unwrap().len(), 2);
        assert!(!first.path.exists());
        assert!(!second.path.exists());
        assert_eq!(copies_in(&copy_dir), 0);
        assert!(path.exists());
    }

    #[test]
    fn test_reset_discards_copies() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", 10);
        let copy_dir = dir.path().join("copies");
        let (registry, _clock) = copy_registry(Box::new(MemoryStore::new()), &copy_dir);

        registry.add(add_request(&path, 1, AccessModes::ALL)).unwrap();
        registry.add(add_request(&path, 5, AccessModes::ALL)).unwrap();

        assert_eq!(registry.reset().unwrap(), 2);
        assert_eq!(copies_in(&copy_dir), 0);
        assert!(path.exists());
    }

    #[test]
    fn test_failed_sweep_still_discards_deleted_copies() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", 10);
        let mut store = FlakyStore::new();
        store.deletes_before_failure = Some(1);
        let (registry, clock) = copy_registry(Box::new(store), &dir.path().join("copies"));

        let first = registry.add(add_request(&path, 1, AccessModes::ALL)).unwrap();
        clock.advance(Duration::minutes(1));
        let second = registry.add(add_request(&path, 1, AccessModes::ALL)).unwrap();

        clock.advance(Duration::hours(2));
        assert!(matches!(registry.sweep(), Err(RegistryError::Store(_))));

        // The first record left the store, so its copy must be gone too
        assert_eq!(
            registry.get_active(first.id).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(!first.path.exists());

        // The second is still stored and keeps its copy for the next sweep
        assert!(matches!(
            registry.get_active(second.id),
            Err(RegistryError::Expired(_))
        ));
        assert!(second.path.exists());
    }

    #[test]
    fn test_discard_partial_copy() {
        let dir = TempDir::new().unwrap();
        let partial = write_file(&dir, "partial", 4);

        discard_partial_copy(&partial);
        assert!(!partial.exists());

        // Already gone is not an error
        discard_partial_copy(&partial);
    }

    #[test]
    fn test_non_utf8_file_name_survives_sqlite() {
        use std::ffi::OsString;
        use std::os::unix::ffi::OsStringExt;

        let dir = TempDir::new().unwrap();
        let path = dir
            .path()
            .join(OsString::from_vec(b"caf\xE9.txt".to_vec()));
        std::fs::write(&path, b"coffee").unwrap();
        let registry = Registry::new(
            Box::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(ManualClock::new(start_time())),
            RegistryOptions::default(),
        );

        let record = registry.add(add_request(&path, 1, AccessModes::ALL)).unwrap();
        let fetched = registry.get_active(record.id).unwrap();
        assert_eq!(fetched.path, record.path);
        assert_eq!(std::fs::read(&fetched.path).unwrap(), b"coffee");
        assert_eq!(fetched.file_type, "txt");
    }

    #[test]
    fn test_concurrent_adds_produce_unique_ids() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", 3);
        let registry = Arc::new(Registry::new(
            Box::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(ManualClock::new(start_time())),
            RegistryOptions::default(),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let path = path.clone();
                std::thread::spawn(move || {
                    (0..10)
                        .map(|_| {
                            registry
                                .add(add_request(&path, 1, AccessModes::ALL))
                                .unwrap()
                                .id
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let ids: Vec<ShareId> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        let unique: HashSet<ShareId> = ids.iter().copied().collect();
        assert_eq!(ids.len(), 80);
        assert_eq!(unique.len(), 80);
        assert_eq!(registry.list(OWNER).unwrap().len(), 80);
    }
}
