//! Content-addressed storage for uploaded media.
//!
//! Uploads are stored by the SHA-256 of their content, sharded by the first
//! byte of the hash. The public URL of an upload is `url_prefix` followed by
//! the hex hash, so identical content always yields the same URL.

use crate::error::{Result, SyncError};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Magic bytes for media files.
const MEDIA_MAGIC: &[u8; 4] = b"MED\0";

/// Current media format version.
const MEDIA_VERSION: u8 = 1;

/// SHA-256 of an upload's content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaHash(pub [u8; 32]);

impl MediaHash {
    pub fn of(data: &[u8]) -> Self {
        MediaHash(Sha256::digest(data).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(MediaHash(arr))
    }

    fn shard_prefix(&self) -> String {
        hex::encode(&self.0[0..1])
    }
}

impl fmt::Debug for MediaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MediaHash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for MediaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Configuration for a [`MediaStore`].
#[derive(Clone, Debug)]
pub struct MediaStoreConfig {
    pub path: PathBuf,
    /// Number of uploads kept in memory.
    pub cache_size: usize,
    /// Prepended to the hex hash to form an upload's URL.
    pub url_prefix: String,
    /// Bytes written between progress reports.
    pub chunk_size: usize,
}

impl Default for MediaStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./media"),
            cache_size: 64,
            url_prefix: "media://".to_string(),
            chunk_size: 256 * 1024,
        }
    }
}

/// A stored upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Media {
    pub hash: MediaHash,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// Result of an upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upload {
    pub hash: MediaHash,
    pub url: String,
    pub size: u64,
    /// False when identical content was already stored.
    pub created: bool,
}

#[derive(Clone)]
struct CachedMedia {
    content: Vec<u8>,
    content_type: String,
}

/// Local content-addressed media storage.
pub struct MediaStore {
    config: MediaStoreConfig,
    cache: Mutex<LruCache<MediaHash, CachedMedia>>,
    next_temp: AtomicU64,
}

impl MediaStore {
    pub fn open(config: MediaStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        let cache_size = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            cache: Mutex::new(LruCache::new(cache_size)),
            config,
            next_temp: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// The public URL for a hash.
    pub fn url_for(&self, hash: &MediaHash) -> String {
        format!("{}{}", self.config.url_prefix, hash.to_hex())
    }

    /// Store `content`, reporting `(bytes_sent, total)` after every chunk.
    pub fn upload<F>(&self, content: &[u8], content_type: &str, progress: F) -> Result<Upload>
    where
        F: FnMut(u64, u64),
    {
        self.upload_from(content, content.len() as u64, content_type, progress)
    }

    /// Store exactly `total` bytes read from `reader`.
    ///
    /// The content is staged in a temporary file and moved into place once
    /// its hash is known. A reader that ends early or runs long fails the
    /// upload with nothing stored.
    pub fn upload_from<R, F>(&self, mut reader: R, total: u64, content_type: &str, mut progress: F) -> Result<Upload>
    where
        R: Read,
        F: FnMut(u64, u64),
    {
        let type_bytes = content_type.as_bytes();
        let type_len = u16::try_from(type_bytes.len())
            .map_err(|_| SyncError::Validation("content type too long".into()))?;

        let temp_path = self.config.path.join(format!(
            "upload-{}-{}.tmp",
            std::process::id(),
            self.next_temp.fetch_add(1, Ordering::SeqCst)
        ));

        let staged = (|| -> Result<(MediaHash, Vec<u8>)> {
            let mut file = BufWriter::new(File::create(&temp_path)?);
            file.write_all(MEDIA_MAGIC)?;
            file.write_all(&[MEDIA_VERSION])?;
            file.write_all(&type_len.to_le_bytes())?;
            file.write_all(type_bytes)?;
            file.write_all(&total.to_le_bytes())?;

            let mut hasher = Sha256::new();
            let mut crc = crc32fast::Hasher::new();
            let mut content = Vec::with_capacity(total.min(16 * 1024 * 1024) as usize);
            let mut chunk = vec![0u8; self.config.chunk_size.max(1)];
            let mut sent = 0u64;

            progress(0, total);
            loop {
                let n = reader.read(&mut chunk)?;
                if n == 0 {
                    break;
                }
                sent += n as u64;
                if sent > total {
                    return Err(SyncError::Validation(format!(
                        "upload longer than declared {} bytes",
                        total
                    )));
                }
                let bytes = &chunk[..n];
                hasher.update(bytes);
                crc.update(bytes);
                file.write_all(bytes)?;
                content.extend_from_slice(bytes);
                progress(sent, total);
            }
            if sent != total {
                return Err(SyncError::Validation(format!(
                    "upload ended after {} of {} bytes",
                    sent, total
                )));
            }

            file.write_all(&crc.finalize().to_le_bytes())?;
            file.into_inner()
                .map_err(|e| SyncError::Io(e.into_error()))?
                .sync_all()?;

            Ok((MediaHash(hasher.finalize().into()), content))
        })();

        let (hash, content) = match staged {
            Ok(staged) => staged,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e);
            }
        };

        let created = if self.exists(&hash) {
            fs::remove_file(&temp_path)?;
            false
        } else {
            fs::create_dir_all(self.shard_path(&hash))?;
            fs::rename(&temp_path, self.media_path(&hash))?;
            true
        };

        self.cache.lock().put(
            hash,
            CachedMedia {
                content,
                content_type: content_type.to_string(),
            },
        );

        let url = self.url_for(&hash);
        tracing::debug!(%hash, size = total, created, "stored media");
        Ok(Upload {
            hash,
            url,
            size: total,
            created,
        })
    }

    /// Look up an upload by URL.
    pub fn resolve(&self, url: &str) -> Result<Media> {
        let hex = url
            .strip_prefix(self.config.url_prefix.as_str())
            .ok_or_else(|| SyncError::Validation(format!("not a media url: {}", url)))?;
        let hash = MediaHash::from_hex(hex)
            .map_err(|e| SyncError::Validation(format!("bad media url {}: {}", url, e)))?;
        self.get(&hash)?
            .ok_or_else(|| SyncError::NotFound(url.to_string()))
    }

    /// Read an upload by hash, verifying checksum and content hash.
    pub fn get(&self, hash: &MediaHash) -> Result<Option<Media>> {
        if let Some(cached) = self.cache.lock().get(hash).cloned() {
            return Ok(Some(Media {
                hash: *hash,
                content_type: cached.content_type,
                content: cached.content,
            }));
        }

        let path = self.media_path(hash);
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MEDIA_MAGIC {
            return Err(SyncError::InvalidFormat("invalid media magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != MEDIA_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "unsupported media version: {}",
                version[0]
            )));
        }

        let mut type_len = [0u8; 2];
        file.read_exact(&mut type_len)?;
        let mut type_bytes = vec![0u8; u16::from_le_bytes(type_len) as usize];
        file.read_exact(&mut type_bytes)?;
        let content_type = String::from_utf8_lossy(&type_bytes).into_owned();

        let mut len = [0u8; 8];
        file.read_exact(&mut len)?;
        let len = u64::from_le_bytes(len);
        let remaining = file.metadata()?.len().saturating_sub(file.stream_position()?);
        if len.saturating_add(4) > remaining {
            return Err(SyncError::InvalidFormat(format!(
                "media {} declares {} bytes, more than the file holds",
                hash, len
            )));
        }
        let mut content = vec![0u8; len as usize];
        file.read_exact(&mut content)?;

        let mut checksum = [0u8; 4];
        file.read_exact(&mut checksum)?;
        let expected = u32::from_le_bytes(checksum);
        let got = crc32fast::hash(&content);
        if expected != got {
            return Err(SyncError::ChecksumMismatch { expected, got });
        }

        let computed = MediaHash::of(&content);
        if &computed != hash {
            return Err(SyncError::InvalidFormat(format!(
                "media {} holds content hashing to {}",
                hash, computed
            )));
        }

        self.cache.lock().put(
            *hash,
            CachedMedia {
                content: content.clone(),
                content_type: content_type.clone(),
            },
        );

        Ok(Some(Media {
            hash: *hash,
            content_type,
            content,
        }))
    }

    pub fn exists(&self, hash: &MediaHash) -> bool {
        self.cache.lock().contains(hash) || self.media_path(hash).exists()
    }

    /// Remove an upload. Returns whether it existed.
    pub fn delete(&self, hash: &MediaHash) -> Result<bool> {
        self.cache.lock().pop(hash);
        let path = self.media_path(hash);
        if path.exists() {
            fs::remove_file(&path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn shard_path(&self, hash: &MediaHash) -> PathBuf {
        self.config.path.join(hash.shard_prefix())
    }

    fn media_path(&self, hash: &MediaHash) -> PathBuf {
        self.shard_path(hash).join(hash.to_hex())
    }
}
