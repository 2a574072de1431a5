//! Key/value stores with expiry, used to share session tokens between runs.

use std::{
    collections::HashMap,
    fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
    sync::Mutex,
    time,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A key/value cache whose entries expire after a time-to-live.
///
/// Expired entries behave exactly like missing ones. Last writer wins; no
/// locking is performed across processes.
pub trait CredentialStore: Send + Sync {
    /// Look up a live entry.
    fn get(&self, key: &str) -> io::Result<Option<String>>;

    /// Insert or replace an entry.
    fn set(&self, key: &str, value: &str, ttl: time::Duration) -> io::Result<()>;

    /// Remove an entry. Removing a missing entry is not an error.
    fn remove(&self, key: &str) -> io::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    value: String,
    /// Seconds since the epoch.
    expires_at: u64,
}

impl StoredEntry {
    fn new(value: &str, ttl: time::Duration) -> Self {
        Self {
            value: value.to_owned(),
            expires_at: now_secs().saturating_add(ttl.as_secs()),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at > now_secs()
    }
}

fn now_secs() -> u64 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// A store that keeps one JSON file per key in a directory.
///
/// On unix, the directory is created as `0700` and entries are written as
/// `0600`, since they hold live session tokens.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Use (and create, on first write) the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    // Keys are md5 hex digests in practice, but anything that isn't a plain
    // file name is hashed so it can't escape the directory.
    fn path_for(&self, key: &str) -> PathBuf {
        let is_plain = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

        if is_plain {
            self.dir.join(key)
        } else {
            self.dir.join(format!("{:x}", md5::compute(key)))
        }
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: &str) -> io::Result<Option<String>> {
        let path = self.path_for(key);
        let contents = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let entry: StoredEntry = match serde_json::from_slice(&contents) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(path = %path.display(), "discarding unreadable cache entry: {e}");
                self.remove(key)?;
                return Ok(None);
            }
        };

        if entry.is_live() {
            Ok(Some(entry.value))
        } else {
            debug!(path = %path.display(), "cache entry expired");
            self.remove(key)?;
            Ok(None)
        }
    }

    fn set(&self, key: &str, value: &str, ttl: time::Duration) -> io::Result<()> {
        create_private_dir(&self.dir)?;
        let entry = serde_json::to_vec(&StoredEntry::new(value, ttl))?;

        // Entries are replaced by rename, so readers never see a torn write.
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        let res = write_private(&tmp, &entry).and_then(|()| fs::rename(&tmp, &path));
        if res.is_err() {
            let _ = fs::remove_file(&tmp);
        }

        res
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            res => res,
        }
    }
}

fn create_private_dir(dir: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt as _;
        builder.mode(0o700);
    }

    builder.create(dir)
}

fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt as _;
        opts.mode(0o600);
    }

    let mut file = opts.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

/// An in-process store. Entries don't outlive the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> io::Result<Option<String>> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.is_live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: time::Duration) -> io::Result<()> {
        self.entries()
            .insert(key.to_owned(), StoredEntry::new(value, ttl));
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        self.entries().remove(key);
        Ok(())
    }
}

impl<T: CredentialStore + ?Sized> CredentialStore for std::sync::Arc<T> {
    fn get(&self, key: &str) -> io::Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str, ttl: time::Duration) -> io::Result<()> {
        (**self).set(key, value, ttl)
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        (**self).remove(key)
    }
}
