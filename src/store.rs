//! Persistence for the shared ownership record.
//!
//! Every store exposes a version-checked write so a claim is a
//! read / decide / compare-and-swap cycle rather than a blind overwrite.
//! Versions are ETag-like: a SHA-256 of the stored bytes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::record::OwnershipRecord;

/// Identity of the stored bytes at the time they were read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Version {
    /// Nothing stored yet.
    Absent,
    /// Something is stored but could not be read at all.
    Unreadable,
    Digest(String),
}

impl Version {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::Digest(format!("{:x}", hasher.finalize()))
    }
}

/// Result of reading the store.
#[derive(Debug, Clone)]
pub enum Loaded {
    Missing,
    Corrupt { reason: String, version: Version },
    Present {
        record: OwnershipRecord,
        version: Version,
    },
}

impl Loaded {
    pub fn version(&self) -> Version {
        match self {
            Self::Missing => Version::Absent,
            Self::Corrupt { version, .. } | Self::Present { version, .. } => version.clone(),
        }
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let version = Version::of(bytes);
        match OwnershipRecord::parse(bytes) {
            Ok(record) => Self::Present { record, version },
            Err(e) => Self::Corrupt {
                reason: e.to_string(),
                version,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Swap {
    Applied,
    /// Someone else wrote since the expected version was read.
    Conflict,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("writing {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("lock {} still held after {waited_ms}ms", path.display())]
    LockTimeout { path: PathBuf, waited_ms: u128 },

    #[error("encoding ownership record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where the ownership record lives.
pub trait OwnershipStore {
    /// Read the current record. Unreadable or unparsable content is reported
    /// as [`Loaded::Corrupt`], not as an error.
    fn load(&self) -> Result<Loaded, StoreError>;

    /// Write `record` only if the stored version still equals `expected`.
    fn compare_and_swap(&self, expected: &Version, record: &OwnershipRecord)
    -> Result<Swap, StoreError>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

impl<T: OwnershipStore + ?Sized> OwnershipStore for &T {
    fn load(&self) -> Result<Loaded, StoreError> {
        (**self).load()
    }

    fn compare_and_swap(
        &self,
        expected: &Version,
        record: &OwnershipRecord,
    ) -> Result<Swap, StoreError> {
        (**self).compare_and_swap(expected, record)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// JSON file on a path both nodes can reach (synced folder, network mount).
///
/// Writes happen under `<file>.lock`, created exclusively, and land via
/// temp file + rename so readers never observe a partial record.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    lock_timeout: Duration,
    stale_lock_after: Duration,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: Duration::from_secs(5),
            stale_lock_after: Duration::from_secs(30),
        }
    }

    /// How long to wait for the lock, and when a leftover lock counts as abandoned.
    #[must_use]
    pub const fn with_lock_settings(mut self, timeout: Duration, stale_after: Duration) -> Self {
        self.lock_timeout = timeout;
        self.stale_lock_after = stale_after;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        sibling(&self.path, "lock")
    }

    fn read_current(&self) -> Loaded {
        match fs::read(&self.path) {
            Ok(bytes) => Loaded::from_bytes(&bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Loaded::Missing,
            Err(e) => Loaded::Corrupt {
                reason: format!("reading {}: {e}", self.path.display()),
                version: Version::Unreadable,
            },
        }
    }

    fn acquire_lock(&self) -> Result<LockGuard, StoreError> {
        let lock_path = self.lock_path();
        let start = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    let token = lock_token();
                    if let Err(source) = file.write_all(token.as_bytes()).and_then(|()| file.sync_all()) {
                        let _ = fs::remove_file(&lock_path);
                        return Err(StoreError::Write {
                            path: lock_path,
                            source,
                        });
                    }
                    return Ok(LockGuard {
                        path: lock_path,
                        token,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if let Some(observed) = self.abandoned_token(&lock_path) {
                        if break_lock(&lock_path, &observed) {
                            continue;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    let dir = lock_path.parent().unwrap_or_else(|| Path::new("."));
                    fs::create_dir_all(dir).map_err(|source| StoreError::Write {
                        path: dir.to_path_buf(),
                        source,
                    })?;
                    continue;
                }
                Err(source) => {
                    return Err(StoreError::Write {
                        path: lock_path,
                        source,
                    });
                }
            }

            if start.elapsed() >= self.lock_timeout {
                return Err(StoreError::LockTimeout {
                    path: lock_path,
                    waited_ms: start.elapsed().as_millis(),
                });
            }
            std::thread::sleep(Duration::from_millis(25));
        }
    }

    /// Token of the lock at `lock_path` if it is older than `stale_lock_after`.
    ///
    /// Contents are read before the mtime: if the lock is replaced in between,
    /// the fresh mtime wins and nothing is broken.
    fn abandoned_token(&self, lock_path: &Path) -> Option<String> {
        let token = fs::read_to_string(lock_path).ok()?;
        let age = fs::metadata(lock_path)
            .and_then(|m| m.modified())
            .ok()?
            .elapsed()
            .ok()?;
        (age > self.stale_lock_after).then_some(token)
    }

    fn write_atomic(&self, bytes: &[u8]) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let tmp = sibling(&self.path, &format!("{}.tmp", std::process::id()));
        let result = File::create(&tmp)
            .and_then(|mut f| {
                f.write_all(bytes)?;
                f.sync_all()
            })
            .and_then(|()| fs::rename(&tmp, &self.path));
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

impl OwnershipStore for FileStore {
    fn load(&self) -> Result<Loaded, StoreError> {
        Ok(self.read_current())
    }

    fn compare_and_swap(
        &self,
        expected: &Version,
        record: &OwnershipRecord,
    ) -> Result<Swap, StoreError> {
        let bytes = record.to_json_bytes()?;
        let _lock = self.acquire_lock()?;

        if self.read_current().version() != *expected {
            return Ok(Swap::Conflict);
        }

        self.write_atomic(&bytes).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;
        Ok(Swap::Applied)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Removes the lock file when the write is done, including on error paths.
/// A lock that no longer carries our token belongs to someone else and is left alone.
struct LockGuard {
    path: PathBuf,
    token: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(held) if held == self.token => {
                if let Err(e) = fs::remove_file(&self.path) {
                    tracing::warn!(lock = %self.path.display(), "failed to release lock: {e}");
                }
            }
            Ok(_) => {
                tracing::warn!(lock = %self.path.display(), "lock was taken over while held, leaving it");
            }
            Err(e) => {
                tracing::warn!(lock = %self.path.display(), "lock vanished while held: {e}");
            }
        }
    }
}

/// `<pid> <random>`: unique per acquisition, so a holder can tell its lock
/// from a successor's.
fn lock_token() -> String {
    format!("{} {:016x}\n", std::process::id(), rand::random::<u64>())
}

/// Break the abandoned lock whose contents were `observed`.
///
/// The lock is first renamed to a private name, so only one breaker can win
/// it. If what was renamed is not the abandoned lock (it was re-acquired after
/// the staleness check), it is linked back into place. Returns whether the
/// abandoned lock is gone.
fn break_lock(lock_path: &Path, observed: &str) -> bool {
    let claimed = sibling(
        lock_path,
        &format!("{}.{:08x}.stale", std::process::id(), rand::random::<u32>()),
    );
    if fs::rename(lock_path, &claimed).is_err() {
        // Another writer broke or released it first.
        return false;
    }

    let taken = fs::read_to_string(&claimed).unwrap_or_default();
    if taken == observed {
        tracing::warn!(lock = %lock_path.display(), "breaking abandoned lock");
        let _ = fs::remove_file(&claimed);
        return true;
    }

    if let Err(e) = fs::hard_link(&claimed, lock_path) {
        tracing::warn!(lock = %lock_path.display(), "could not restore a live lock taken by mistake: {e}");
    }
    let _ = fs::remove_file(&claimed);
    false
}

/// `state.json` -> `state.json.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// In-process store with the same compare-and-swap contract, for tests and
/// for embedding the coordinator without a shared filesystem.
#[derive(Debug, Default)]
pub struct MemoryStore {
    bytes: Mutex<Option<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Mutex::new(Some(bytes.into())),
        }
    }

    pub fn with_record(record: &OwnershipRecord) -> Result<Self, StoreError> {
        Ok(Self::with_bytes(record.to_json_bytes()?))
    }

    /// Raw stored bytes, if any.
    pub fn bytes(&self) -> Option<Vec<u8>> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the stored bytes without a version check, as a peer would.
    pub fn overwrite(&self, bytes: impl Into<Vec<u8>>) {
        *self.bytes.lock().unwrap_or_else(PoisonError::into_inner) = Some(bytes.into());
    }
}

impl OwnershipStore for MemoryStore {
    fn load(&self) -> Result<Loaded, StoreError> {
        Ok(self
            .bytes()
            .map_or(Loaded::Missing, |bytes| Loaded::from_bytes(&bytes)))
    }

    fn compare_and_swap(
        &self,
        expected: &Version,
        record: &OwnershipRecord,
    ) -> Result<Swap, StoreError> {
        let encoded = record.to_json_bytes()?;
        let mut slot = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        let current = slot.as_deref().map_or(Version::Absent, Version::of);
        if current != *expected {
            return Ok(Swap::Conflict);
        }
        *slot = Some(encoded);
        Ok(Swap::Applied)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
