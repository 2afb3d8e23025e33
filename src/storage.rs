//! Durable key-set storage.
//!
//! Every piece of durable state (pending items, each result set, the token
//! list) is a set of lines. [`FileStore`] keeps one key per line and replaces
//! the file atomically on every mutation, so external readers only ever see
//! a complete file. Each read-modify-write runs under an advisory lock on a
//! sidecar `<file>.lock`, so several `verifyq` processes can share a data
//! directory. [`MemoryStore`] is the test backend.
//!
//! Store calls block. Async callers go through [`RetryPolicy::run`], which
//! moves them onto the blocking pool.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use fd_lock::RwLock;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::backoff::Backoff;
use crate::error::{Error, Result};

/// A durable, deduplicated set of string keys.
pub trait KeySetStore: Send + Sync {
    /// All keys, in stored order. Blank lines are skipped, keys are trimmed.
    fn list(&self) -> io::Result<Vec<String>>;

    /// Add every key not already present, in order. Returns how many were
    /// added.
    fn append_all(&self, keys: &[String]) -> io::Result<usize>;

    /// Keep only the keys `keep` accepts. Returns how many were removed.
    fn retain(&self, keep: &mut dyn FnMut(&str) -> bool) -> io::Result<usize>;

    /// Atomically replace the whole set.
    fn replace_all(&self, keys: &[String]) -> io::Result<()>;

    /// Add `key` if it is not already present.
    fn append(&self, key: &str) -> io::Result<()> {
        self.append_all(&[key.to_string()]).map(|_| ())
    }

    /// Remove `key`. Returns whether it was present.
    fn remove(&self, key: &str) -> io::Result<bool> {
        self.retain(&mut |k: &str| k != key).map(|removed| removed > 0)
    }
}

fn merge_new(current: &mut Vec<String>, keys: &[String]) -> usize {
    let mut seen: HashSet<String> = current.iter().cloned().collect();
    let before = current.len();
    for key in keys {
        if seen.insert(key.clone()) {
            current.push(key.clone());
        }
    }
    current.len() - before
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// One key per line in a plain text file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileStore {
    /// Open a store at `path`. The parent directory is created; the file
    /// itself is created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Ok(Self {
            path,
            lock_path: lock_path.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> io::Result<RwLock<File>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)?;
        Ok(RwLock::new(file))
    }

    /// Unlocked read. Callers hold the lock.
    fn read_keys(&self) -> io::Result<Vec<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(parse_lines(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Unlocked write. Callers hold the exclusive lock.
    fn write_atomic(&self, keys: &[String]) -> io::Result<()> {
        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => dir,
            None => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        for key in keys {
            writeln!(tmp, "{key}")?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl KeySetStore for FileStore {
    fn list(&self) -> io::Result<Vec<String>> {
        let lock = self.lock()?;
        let _guard = lock.read()?;
        self.read_keys()
    }

    fn append_all(&self, keys: &[String]) -> io::Result<usize> {
        let mut lock = self.lock()?;
        let _guard = lock.write()?;
        let mut current = self.read_keys()?;
        let added = merge_new(&mut current, keys);
        if added > 0 {
            self.write_atomic(&current)?;
        }
        Ok(added)
    }

    fn retain(&self, keep: &mut dyn FnMut(&str) -> bool) -> io::Result<usize> {
        let mut lock = self.lock()?;
        let _guard = lock.write()?;
        let current = self.read_keys()?;
        let before = current.len();
        let kept: Vec<String> = current.into_iter().filter(|k| keep(k.as_str())).collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.write_atomic(&kept)?;
        }
        Ok(removed)
    }

    fn replace_all(&self, keys: &[String]) -> io::Result<()> {
        let mut lock = self.lock()?;
        let _guard = lock.write()?;
        self.write_atomic(keys)
    }
}

fn parse_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Memory store
// ---------------------------------------------------------------------------

/// In-process store for tests. Can be told to fail upcoming operations.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keys: Mutex<Vec<String>>,
    failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: Mutex::new(keys.into_iter().map(Into::into).collect()),
            failures: AtomicU32::new(0),
        }
    }

    /// Make the next `n` operations fail with an I/O error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn check_failure(&self) -> io::Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(io::Error::other("injected storage failure")),
            Err(_) => Ok(()),
        }
    }

    fn keys(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeySetStore for MemoryStore {
    fn list(&self) -> io::Result<Vec<String>> {
        self.check_failure()?;
        Ok(self.keys().clone())
    }

    fn append_all(&self, keys: &[String]) -> io::Result<usize> {
        self.check_failure()?;
        Ok(merge_new(&mut self.keys(), keys))
    }

    fn retain(&self, keep: &mut dyn FnMut(&str) -> bool) -> io::Result<usize> {
        self.check_failure()?;
        let mut keys = self.keys();
        let before = keys.len();
        keys.retain(|k| keep(k.as_str()));
        Ok(before - keys.len())
    }

    fn replace_all(&self, keys: &[String]) -> io::Result<()> {
        self.check_failure()?;
        *self.keys() = keys.to_vec();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store bundle
// ---------------------------------------------------------------------------

/// The four durable sets the engine works against.
#[derive(Clone)]
pub struct Stores {
    pub pending: Arc<dyn KeySetStore>,
    pub positive: Arc<dyn KeySetStore>,
    pub negative: Arc<dyn KeySetStore>,
    pub tokens: Arc<dyn KeySetStore>,
}

impl Stores {
    pub const PENDING_FILE: &'static str = "pending.txt";
    pub const POSITIVE_FILE: &'static str = "positive.txt";
    pub const NEGATIVE_FILE: &'static str = "negative.txt";
    pub const TOKENS_FILE: &'static str = "tokens.txt";

    /// File-backed stores under `dir`.
    pub fn files(dir: &Path) -> Result<Self> {
        Ok(Self {
            pending: Arc::new(FileStore::open(dir.join(Self::PENDING_FILE))?),
            positive: Arc::new(FileStore::open(dir.join(Self::POSITIVE_FILE))?),
            negative: Arc::new(FileStore::open(dir.join(Self::NEGATIVE_FILE))?),
            tokens: Arc::new(FileStore::open(dir.join(Self::TOKENS_FILE))?),
        })
    }

    /// Fresh in-memory stores (for testing).
    pub fn in_memory() -> Self {
        Self {
            pending: Arc::new(MemoryStore::new()),
            positive: Arc::new(MemoryStore::new()),
            negative: Arc::new(MemoryStore::new()),
            tokens: Arc::new(MemoryStore::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Bounded retry for transiently unavailable storage.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Run `call` against `store` on the blocking pool until it succeeds or
    /// the attempts run out. The final failure escalates as
    /// [`Error::Storage`].
    pub async fn run<T, F>(&self, op: &'static str, store: &Arc<dyn KeySetStore>, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&dyn KeySetStore) -> io::Result<T> + Send + Sync + 'static,
    {
        let call = Arc::new(call);
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            let task_store = Arc::clone(store);
            let task_call = Arc::clone(&call);
            let result = tokio::task::spawn_blocking(move || task_call(task_store.as_ref()))
                .await
                .unwrap_or_else(|e| Err(io::Error::other(format!("storage task failed: {e}"))));
            match result {
                Ok(value) => return Ok(value),
                Err(source) if attempt + 1 >= attempts => {
                    return Err(Error::Storage {
                        op,
                        attempts,
                        source,
                    });
                }
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(op, attempt = attempt + 1, ?delay, error = %e, "storage op failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
