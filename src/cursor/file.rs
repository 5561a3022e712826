//! Durable, file-backed cursor store.

use super::CursorStore;
use crate::error::{Result, SyncError};
use crate::types::{Cursor, FeedId, FeedKey, Timestamp, ViewerId};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the cursor file.
const CURSOR_MAGIC: &[u8; 4] = b"CUR\0";

/// Current cursor file format version.
const CURSOR_VERSION: u8 = 1;

const CURSOR_FILE: &str = "cursors.bin";
const LOCK_FILE: &str = "LOCK";

/// Cursor store configuration.
#[derive(Clone, Debug)]
pub struct CursorStoreConfig {
    /// Directory holding the cursor file.
    pub path: PathBuf,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for CursorStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./cursors"),
            create_if_missing: true,
        }
    }
}

/// Cursor store persisted to a single file.
///
/// Layout: magic, version, body length (u64 LE), MessagePack body (a list of
/// cursors, timestamps in milliseconds), CRC32 of the body (u32 LE).
/// Every `set` rewrites the file through a temporary file and a rename, so
/// a crash leaves either the old or the new contents.
pub struct FileCursorStore {
    /// Store directory.
    path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// In-memory view of the file.
    entries: RwLock<HashMap<FeedKey, Timestamp>>,

    /// Serializes file rewrites.
    write_lock: Mutex<()>,
}

impl FileCursorStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: CursorStoreConfig) -> Result<Self> {
        if !config.path.exists() {
            if !config.create_if_missing {
                return Err(SyncError::Storage(format!(
                    "cursor directory {} does not exist",
                    config.path.display()
                )));
            }
            fs::create_dir_all(&config.path)?;
        }

        let lock_file = Self::acquire_lock(&config.path)?;

        let store = Self {
            path: config.path,
            _lock_file: lock_file,
            entries: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        };

        let file_path = store.file_path();
        if file_path.exists() {
            let loaded = Self::load_from_file(&file_path)?;
            tracing::debug!(path = %file_path.display(), cursors = loaded.len(), "loaded cursors");
            *store.entries.write() = loaded;
        }

        Ok(store)
    }

    /// Get the store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_path(&self) -> PathBuf {
        self.path.join(CURSOR_FILE)
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join(LOCK_FILE))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| SyncError::Locked)?;

        Ok(lock_file)
    }

    /// Write the given entries to disk, replacing the previous file.
    fn save(&self, entries: &HashMap<FeedKey, Timestamp>) -> Result<()> {
        let mut cursors: Vec<Cursor> = entries
            .iter()
            .map(|(key, at)| Cursor::new(key.feed.clone(), key.viewer.clone(), *at))
            .collect();
        cursors.sort_by(|a, b| (&a.feed, &a.viewer).cmp(&(&b.feed, &b.viewer)));

        let encoded = rmp_serde::to_vec(&cursors)?;
        let checksum = crc32fast::hash(&encoded);

        let tmp_path = self.path.join(format!("{}.tmp", CURSOR_FILE));
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;

            file.write_all(CURSOR_MAGIC)?;
            file.write_all(&[CURSOR_VERSION])?;
            file.write_all(&(encoded.len() as u64).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.write_all(&checksum.to_le_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, self.file_path())?;
        Ok(())
    }

    fn load_from_file(path: &Path) -> Result<HashMap<FeedKey, Timestamp>> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != CURSOR_MAGIC {
            return Err(SyncError::InvalidFormat("Invalid cursor file magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != CURSOR_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "Unsupported cursor file version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);

        // Body plus trailing checksum must fit in what is left of the file.
        let remaining = file.metadata()?.len().saturating_sub(file.stream_position()?);
        if len.saturating_add(4) > remaining {
            return Err(SyncError::InvalidFormat(format!(
                "cursor body of {} bytes exceeds file size",
                len
            )));
        }

        let mut encoded = vec![0u8; len as usize];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(SyncError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        let cursors: Vec<Cursor> = rmp_serde::from_slice(&encoded)?;
        Ok(cursors
            .into_iter()
            .map(|c| (FeedKey::new(c.feed, c.viewer), c.last_acknowledged))
            .collect())
    }

    /// Apply a change to a copy of the entries, persist it, then publish it.
    fn mutate<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut HashMap<FeedKey, Timestamp>) -> T,
    {
        let _lock = self.write_lock.lock();

        let mut next = self.entries.read().clone();
        let out = f(&mut next);

        self.save(&next)
            .map_err(|e| SyncError::Storage(format!("persisting cursors: {}", e)))?;

        *self.entries.write() = next;
        Ok(out)
    }
}

impl CursorStore for FileCursorStore {
    fn get(&self, feed: &FeedId, viewer: &ViewerId) -> Result<Option<Cursor>> {
        let key = FeedKey::new(feed.clone(), viewer.clone());
        Ok(self
            .entries
            .read()
            .get(&key)
            .map(|at| Cursor::new(feed.clone(), viewer.clone(), *at)))
    }

    fn set(&self, feed: &FeedId, viewer: &ViewerId, at: Timestamp) -> Result<()> {
        let key = FeedKey::new(feed.clone(), viewer.clone());
        self.mutate(|entries| {
            entries.insert(key, at);
        })
    }

    fn remove_viewer(&self, viewer: &ViewerId) -> Result<usize> {
        self.mutate(|entries| {
            let before = entries.len();
            entries.retain(|key, _| &key.viewer != viewer);
            before - entries.len()
        })
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}
