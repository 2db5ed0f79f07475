use std::fs;
use std::io::{self, Write};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use directories::BaseDirs;
use rand::Rng;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::Builder;
use tracing::{debug, warn};

use crate::error::KiraError;

pub const CACHED_BLOB_TIME: Duration = Duration::from_secs(3 * 60 * 60);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub root: Utf8PathBuf,
    pub timeout: Duration,
    pub enabled: bool,
}

impl CacheConfig {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            timeout: CACHED_BLOB_TIME,
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        let root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("kira-sync")).ok()
            })
            .unwrap_or_else(|| Utf8PathBuf::from("."));
        Self::new(root)
    }
}

/// SHA-256 of a resource pre-hash, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_pre_hash(pre_hash: &str) -> Self {
        Self(hex::encode(Sha256::digest(pre_hash.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// On-disk cache of raw server blobs, one `<hash>__<unix-ts>.json` file per key.
///
/// Safe to share between processes: every write lands through a rename and
/// readers always pick the newest file for a hash, so a lost race only costs
/// one extra round trip.
#[derive(Debug, Clone)]
pub struct BlobCache {
    config: CacheConfig,
}

impl BlobCache {
    pub fn new(config: CacheConfig) -> Self {
        Self { config }
    }

    pub fn disabled() -> Self {
        Self::new(CacheConfig::disabled())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn entry_dir(&self) -> Utf8PathBuf {
        self.config.root.join(".api_cache").join("v1")
    }

    pub fn get(&self, key: &CacheKey) -> Result<Option<Value>, KiraError> {
        if !self.config.enabled {
            return Ok(None);
        }
        let Some(entry) = self.latest_entry(key)? else {
            debug!(key = key.as_str(), "cache miss");
            return Ok(None);
        };

        if entry.age() > self.config.timeout + self.jitter() {
            debug!(key = key.as_str(), path = %entry.path, "cache entry expired");
            remove_quietly(&entry.path)?;
            return Ok(None);
        }

        let content = match fs::read_to_string(entry.path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(key = key.as_str(), "cache entry removed before it could be read");
                return Ok(None);
            }
            Err(err) => return Err(KiraError::filesystem(err)),
        };
        match serde_json::from_str(&content) {
            Ok(blob) => {
                debug!(key = key.as_str(), "cache hit");
                Ok(Some(blob))
            }
            Err(err) => {
                warn!(path = %entry.path, error = %err, "discarding unreadable cache entry");
                remove_quietly(&entry.path)?;
                Ok(None)
            }
        }
    }

    pub fn put(&self, key: &CacheKey, blob: &Value) -> Result<(), KiraError> {
        if !self.config.enabled {
            return Ok(());
        }
        if let Some(entry) = self.latest_entry(key)? {
            if entry.age() < self.config.timeout / 2 + self.jitter() {
                debug!(key = key.as_str(), "cache entry still fresh, skipping write");
                return Ok(());
            }
            self.invalidate(key)?;
        }

        let dir = self.entry_dir();
        fs::create_dir_all(dir.as_std_path()).map_err(KiraError::filesystem)?;
        let content = serde_json::to_vec(blob).map_err(KiraError::filesystem)?;
        let mut temp = Builder::new()
            .prefix(".kira-sync-cache")
            .tempfile_in(dir.as_std_path())
            .map_err(KiraError::filesystem)?;
        temp.write_all(&content).map_err(KiraError::filesystem)?;
        let path = dir.join(format!("{}__{}.json", key.as_str(), Utc::now().timestamp()));
        temp.persist(path.as_std_path())
            .map_err(|err| KiraError::filesystem(err.error))?;
        debug!(key = key.as_str(), path = %path, "cached blob");
        Ok(())
    }

    pub fn invalidate(&self, key: &CacheKey) -> Result<(), KiraError> {
        if !self.config.enabled {
            return Ok(());
        }
        for entry in self.entries(key)? {
            debug!(key = key.as_str(), path = %entry.path, "clearing cached blob");
            remove_quietly(&entry.path)?;
        }
        Ok(())
    }

    fn latest_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, KiraError> {
        Ok(self.entries(key)?.pop())
    }

    /// Entries for `key`, oldest first by filename.
    fn entries(&self, key: &CacheKey) -> Result<Vec<CacheEntry>, KiraError> {
        let dir = self.entry_dir();
        let listing = match fs::read_dir(dir.as_std_path()) {
            Ok(listing) => listing,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(KiraError::filesystem(err)),
        };

        let mut names = Vec::new();
        for item in listing {
            let item = item.map_err(KiraError::filesystem)?;
            if let Ok(name) = item.file_name().into_string() {
                if parse_entry_name(&name).is_some_and(|(hash, _)| hash == key.as_str()) {
                    names.push(name);
                }
            }
        }
        names.sort();

        Ok(names
            .into_iter()
            .filter_map(|name| {
                let (_, timestamp) = parse_entry_name(&name)?;
                Some(CacheEntry {
                    path: dir.join(&name),
                    timestamp,
                })
            })
            .collect())
    }

    fn jitter(&self) -> Duration {
        let max_ms = (self.config.timeout.as_millis() / 10) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

struct CacheEntry {
    path: Utf8PathBuf,
    timestamp: i64,
}

impl CacheEntry {
    fn age(&self) -> Duration {
        let elapsed = Utc::now().timestamp() - self.timestamp;
        Duration::from_secs(elapsed.max(0) as u64)
    }
}

fn parse_entry_name(name: &str) -> Option<(&str, i64)> {
    let stem = name.strip_suffix(".json")?;
    let (hash, timestamp) = stem.rsplit_once("__")?;
    Some((hash, timestamp.parse().ok()?))
}

fn remove_quietly(path: &Utf8Path) -> Result<(), KiraError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(KiraError::filesystem(err)),
    }
}
