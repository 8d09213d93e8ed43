//! Filesystem durable store
//!
//! One file per key under a cache directory. The file name is the lowercase hex
//! SHA-256 of the key. Every file starts with an 8-byte big-endian expiry in Unix
//! seconds followed by the payload:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────┐
//! │ expires_at (u64 BE)  │ encoded image bytes ...      │
//! └──────────────────────┴──────────────────────────────┘
//! ```
//!
//! Reads bump the file's mtime, which [`FsDurableStore::cleanup`] uses as the
//! recency signal when trimming the directory to its size limit.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use filetime::FileTime;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument, warn};

use super::durable::{DurableStore, DurableStoreStats};
use super::{DEFAULT_DURABLE_MAX_BYTES, DEFAULT_DURABLE_TTL_SECS};
use crate::error::{Error, Result};

/// Size of the expiry header
const HEADER_LEN: usize = 8;

/// Suffix of in-progress writes; such files are ignored by reads and cleanup
const TMP_SUFFIX: &str = ".tmp";

/// Filesystem store configuration
#[derive(Debug, Clone)]
pub struct FsStoreConfig {
    /// Directory holding the entry files
    pub directory: PathBuf,
    /// Size limit enforced by `cleanup`
    pub max_bytes: u64,
    /// Lifetime of newly written entries
    pub default_ttl: Duration,
}

impl Default for FsStoreConfig {
    fn default() -> Self {
        Self {
            directory: default_cache_dir(),
            max_bytes: DEFAULT_DURABLE_MAX_BYTES,
            default_ttl: Duration::from_secs(DEFAULT_DURABLE_TTL_SECS),
        }
    }
}

impl FsStoreConfig {
    /// Config with default limits rooted at `directory`
    pub fn in_dir(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Default::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.directory.as_os_str().is_empty() {
            return Err(Error::Config("durable store directory is empty".into()));
        }
        if self.max_bytes == 0 {
            return Err(Error::Config("durable max_bytes must be non-zero".into()));
        }
        if self.default_ttl.is_zero() {
            return Err(Error::Config("durable default_ttl must be non-zero".into()));
        }
        Ok(())
    }
}

/// Platform cache directory, falling back to the temp directory
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("artcache")
        .join("images")
}

/// Result of a cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Files removed because they had expired
    pub expired: usize,
    /// Files removed to get under the size limit
    pub evicted: usize,
    /// Bytes left in the directory afterwards
    pub remaining_bytes: u64,
}

/// File-per-key durable store
pub struct FsDurableStore {
    config: FsStoreConfig,
    tmp_counter: AtomicU64,
    reads: AtomicU64,
    hits: AtomicU64,
    writes: AtomicU64,
    removes: AtomicU64,
}

impl FsDurableStore {
    /// Create a store. The directory is created lazily on first write.
    pub fn new(config: FsStoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            tmp_counter: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            removes: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &FsStoreConfig {
        &self.config
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// File name used for `key`: lowercase hex SHA-256
    pub fn file_name(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    /// Full path of the file backing `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.config.directory.join(Self::file_name(key))
    }

    /// Total size in bytes of all entry files
    pub async fn disk_usage(&self) -> Result<u64> {
        let mut total = 0;
        for file in self.list_entries().await? {
            total += file.len;
        }
        Ok(total)
    }

    /// Remove expired entries, then the least recently used ones until the
    /// directory is within `max_bytes`.
    #[instrument(skip(self), fields(dir = %self.config.directory.display()))]
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let now = unix_now();
        let mut report = CleanupReport::default();
        let mut live = Vec::new();

        for file in self.list_entries().await? {
            match read_expiry(&file.path).await {
                Ok(Some(expires_at)) if expires_at > now => live.push(file),
                Ok(_) => {
                    if remove_quietly(&file.path).await {
                        report.expired += 1;
                    }
                }
                Err(e) => warn!("Skipping {} during cleanup: {}", file.path.display(), e),
            }
        }

        let mut total: u64 = live.iter().map(|f| f.len).sum();
        if total > self.config.max_bytes {
            live.sort_by_key(|f| f.modified);
            for file in &live {
                if total <= self.config.max_bytes {
                    break;
                }
                if remove_quietly(&file.path).await {
                    total -= file.len;
                    report.evicted += 1;
                }
            }
        }
        report.remaining_bytes = total;

        debug!(
            "Durable cleanup: {} expired, {} evicted, {} bytes remaining",
            report.expired, report.evicted, report.remaining_bytes
        );
        Ok(report)
    }

    async fn list_entries(&self) -> Result<Vec<EntryFile>> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.config.directory).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(item) = dir.next_entry().await? {
            if item.file_name().to_string_lossy().ends_with(TMP_SUFFIX) {
                continue;
            }
            let metadata = match item.metadata().await {
                Ok(metadata) => metadata,
                // Raced with a concurrent remove
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !metadata.is_file() {
                continue;
            }
            entries.push(EntryFile {
                path: item.path(),
                len: metadata.len(),
                modified: metadata.modified().unwrap_or(UNIX_EPOCH),
            });
        }
        Ok(entries)
    }

    async fn write_entry(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.config.directory).await?;

        let expires_at = unix_now().saturating_add(self.config.default_ttl.as_secs());
        let mut contents = Vec::with_capacity(HEADER_LEN + data.len());
        contents.extend_from_slice(&expires_at.to_be_bytes());
        contents.extend_from_slice(data);

        let seq = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(format!(".{}.{}{}", std::process::id(), seq, TMP_SUFFIX));
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &contents).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for FsDurableStore {
    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let path = self.path_for(key);

        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let expires_at = match parse_expiry(&contents) {
            Some(expires_at) => expires_at,
            None => {
                debug!("Removing truncated durable entry {}", path.display());
                remove_quietly(&path).await;
                return Ok(None);
            }
        };
        if expires_at <= unix_now() {
            debug!("Durable entry for {} expired", key);
            remove_quietly(&path).await;
            return Ok(None);
        }

        match filetime::set_file_mtime(&path, FileTime::now()) {
            Ok(()) => {}
            // Cleanup removed it after we read it; the bytes are still good
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to touch {}: {}", path.display(), e),
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(Bytes::from(contents).slice(HEADER_LEN..)))
    }

    async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let path = self.path_for(key);

        self.write_entry(&path, &data)
            .await
            .map_err(|e| Error::DurableStore(format!("write {}: {}", path.display(), e)))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.removes.fetch_add(1, Ordering::Relaxed);
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.config.directory).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!("Cleared durable store {}", self.config.directory.display());
        Ok(())
    }

    fn stats(&self) -> DurableStoreStats {
        DurableStoreStats {
            // Not tracked in memory; see `disk_usage`
            entry_count: 0,
            total_bytes: 0,
            reads: self.reads.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
        }
    }
}

struct EntryFile {
    path: PathBuf,
    len: u64,
    modified: SystemTime,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn parse_expiry(contents: &[u8]) -> Option<u64> {
    let header: [u8; HEADER_LEN] = contents.get(..HEADER_LEN)?.try_into().ok()?;
    Some(u64::from_be_bytes(header))
}

/// Read only the expiry header. `None` means the file is too short to be valid.
async fn read_expiry(path: &Path) -> io::Result<Option<u64>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut header = [0u8; HEADER_LEN];
    match file.read_exact(&mut header).await {
        Ok(_) => Ok(Some(u64::from_be_bytes(header))),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

async fn remove_quietly(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Failed to remove {}: {}", path.display(), e);
            false
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> FsDurableStore {
        FsDurableStore::new(FsStoreConfig::in_dir(dir)).unwrap()
    }

    fn write_raw(path: &Path, expires_at: u64, payload: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut contents = expires_at.to_be_bytes().to_vec();
        contents.extend_from_slice(payload);
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_file_name_is_sha256_hex() {
        let name = FsDurableStore::file_name("https://img/cover-1.jpg");
        assert_eq!(name.len(), 64);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(
            FsDurableStore::file_name(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        store
            .put_bytes("https://img/a.jpg", Bytes::from_static(b"jpeg bytes"))
            .await
            .unwrap();

        let got = store.get_bytes("https://img/a.jpg").await.unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"jpeg bytes")));
        assert!(store.path_for("https://img/a.jpg").exists());

        let stats = store.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_miss_on_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir.path().join("not-yet-created"));

        assert!(store.get_bytes("k").await.unwrap().is_none());
        assert_eq!(store.disk_usage().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_entry_is_miss_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let path = store.path_for("old");
        write_raw(&path, 1, b"stale");

        assert!(store.get_bytes("old").await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_truncated_entry_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let path = store.path_for("short");
        std::fs::write(&path, b"abc").unwrap();

        assert!(store.get_bytes("short").await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_read_refreshes_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.put_bytes("k", Bytes::from_static(b"v")).await.unwrap();

        let path = store.path_for("k");
        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_000, 0)).unwrap();

        store.get_bytes("k").await.unwrap().unwrap();

        let modified = FileTime::from_last_modification_time(&std::fs::metadata(&path).unwrap());
        assert!(modified.unix_seconds() > 1_000);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("images");
        let store = store(&root);

        store.put_bytes("a", Bytes::from_static(b"1")).await.unwrap();
        store.put_bytes("b", Bytes::from_static(b"2")).await.unwrap();

        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());

        store.clear().await.unwrap();
        assert!(!root.exists());
        assert!(store.get_bytes("b").await.unwrap().is_none());

        // Writes recreate the directory
        store.put_bytes("c", Bytes::from_static(b"3")).await.unwrap();
        assert!(store.get_bytes("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_then_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDurableStore::new(FsStoreConfig {
            directory: dir.path().to_path_buf(),
            max_bytes: 250,
            default_ttl: Duration::from_secs(3600),
        })
        .unwrap();

        let payload = Bytes::from(vec![7u8; 92]); // 100 bytes with header
        for (key, mtime) in [("oldest", 100), ("middle", 200), ("newest", 300)] {
            store.put_bytes(key, payload.clone()).await.unwrap();
            filetime::set_file_mtime(store.path_for(key), FileTime::from_unix_time(mtime, 0))
                .unwrap();
        }
        write_raw(&store.path_for("expired"), 1, b"gone");

        let report = store.cleanup().await.unwrap();

        assert_eq!(report.expired, 1);
        assert_eq!(report.evicted, 1);
        assert_eq!(report.remaining_bytes, 200);
        assert!(!store.path_for("oldest").exists());
        assert!(store.path_for("middle").exists());
        assert!(store.path_for("newest").exists());
        assert_eq!(store.disk_usage().await.unwrap(), 200);
    }

    #[test]
    fn test_config_validation() {
        assert!(FsStoreConfig::in_dir("/tmp/x").validate().is_ok());

        let zero = FsStoreConfig {
            max_bytes: 0,
            ..FsStoreConfig::in_dir("/tmp/x")
        };
        assert!(zero.validate().is_err());

        let empty = FsStoreConfig::in_dir("");
        assert!(FsDurableStore::new(empty).is_err());
    }
}
