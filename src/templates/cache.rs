//! The on-disk, TTL-expiring template cache.
//!
//! Each `(name, version)` is one file at `<cache_root>/templates/<name>@<version>.json`,
//! written atomically (temp file + rename) so readers never observe a
//! half-written entry. A small in-memory LRU amortizes repeated disk reads
//! within a single process lifetime; `cache.meta` tracks aggregate size and
//! drives eviction once `max_size_bytes` is exceeded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::templates::descriptor::TemplateDescriptor;

/// `cache_version` this build writes and expects to read. A mismatch on an
/// existing entry is treated as corruption so incompatible on-disk layouts
/// self-evict instead of panicking a newer binary.
pub const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub template: TemplateDescriptor,
    pub blob: Vec<u8>,
    pub downloaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub checksum: String,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default = "Utc::now")]
    pub last_accessed: DateTime<Utc>,
    #[serde(default = "default_cache_version")]
    pub cache_version: u32,
}

fn default_cache_version() -> u32 {
    CACHE_VERSION
}

impl CacheEntry {
    pub fn new(template: TemplateDescriptor, blob: Vec<u8>, ttl: chrono::Duration) -> Self {
        let now = Utc::now();
        let checksum = checksum_of(&blob);
        Self {
            key: template.cache_key(),
            template,
            blob,
            downloaded_at: now,
            expires_at: now + ttl,
            checksum,
            access_count: 0,
            last_accessed: now,
            cache_version: CACHE_VERSION,
        }
    }

    /// Re-derived on every read rather than trusted from disk, per the
    /// normalization called out for the `isValid`-vs-`age` discrepancy: the
    /// single source of truth is `now < expires_at`.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    fn checksum_matches(&self) -> bool {
        self.checksum == checksum_of(&self.blob)
    }
}

fn checksum_of(blob: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(blob);
    hex::encode(hasher.finalize())
}

/// Result of a cache lookup, matching the state machine in the spec exactly.
#[derive(Debug, Clone)]
pub enum Lookup {
    Hit(CacheEntry),
    Expired(CacheEntry),
    Corrupted,
    Miss,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheMeta {
    pub cache_version: u32,
    pub total_entries: u64,
    pub total_size_bytes: u64,
    pub last_cleanup: Option<DateTime<Utc>>,
    pub default_ttl_secs: i64,
    pub max_size_bytes: u64,
}

struct LruTracker {
    order: HashMap<String, u64>,
    tick: u64,
    max_entries: usize,
}

impl LruTracker {
    fn new(max_entries: usize) -> Self {
        Self { order: HashMap::new(), tick: 0, max_entries }
    }

    fn touch(&mut self, key: &str) {
        self.tick += 1;
        self.order.insert(key.to_string(), self.tick);
        if self.order.len() > self.max_entries {
            if let Some((oldest, _)) = self.order.iter().min_by_key(|(_, tick)| **tick) {
                let oldest = oldest.clone();
                self.order.remove(&oldest);
            }
        }
    }

    fn evict(&mut self, key: &str) {
        self.order.remove(key);
    }
}

/// The per-process template cache: on-disk entries plus a bounded in-memory
/// LRU of recently touched ones. Tests construct a fresh instance pointed at
/// a temp directory; there is no process-wide static.
pub struct TemplateCache {
    cache_root: PathBuf,
    default_ttl: chrono::Duration,
    max_size_bytes: u64,
    memory: Mutex<HashMap<String, CacheEntry>>,
    lru: Mutex<LruTracker>,
}

impl TemplateCache {
    pub fn new(cache_root: PathBuf, default_ttl: chrono::Duration, max_size_bytes: u64) -> Self {
        Self {
            cache_root,
            default_ttl,
            max_size_bytes,
            memory: Mutex::new(HashMap::new()),
            lru: Mutex::new(LruTracker::new(256)),
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.cache_root.join("templates").join(format!("{key}.json"))
    }

    fn meta_path(&self) -> PathBuf {
        self.cache_root.join("cache.meta")
    }

    pub fn lookup(&self, key: &str) -> Lookup {
        if let Some(entry) = self.memory.lock().unwrap().get(key).cloned() {
            self.lru.lock().unwrap().touch(key);
            return self.classify(entry);
        }

        let path = self.entry_path(key);
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return Lookup::Miss;
        };
        let entry: CacheEntry = match serde_json::from_str(&contents) {
            Ok(e) => e,
            Err(_) => return Lookup::Corrupted,
        };
        if entry.cache_version != CACHE_VERSION {
            return Lookup::Corrupted;
        }
        if !entry.checksum_matches() {
            return Lookup::Corrupted;
        }

        self.memory.lock().unwrap().insert(key.to_string(), entry.clone());
        self.lru.lock().unwrap().touch(key);
        self.classify(entry)
    }

    fn classify(&self, mut entry: CacheEntry) -> Lookup {
        entry.access_count += 1;
        entry.last_accessed = Utc::now();
        let valid = entry.is_valid(Utc::now());
        self.memory.lock().unwrap().insert(entry.key.clone(), entry.clone());
        if valid {
            Lookup::Hit(entry)
        } else {
            Lookup::Expired(entry)
        }
    }

    /// Write `entry` atomically (temp file + rename) and update the
    /// in-memory LRU and `cache.meta`.
    pub fn put(&self, entry: CacheEntry) -> std::io::Result<()> {
        let templates_dir = self.cache_root.join("templates");
        std::fs::create_dir_all(&templates_dir)?;

        let contents = serde_json::to_vec_pretty(&entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&templates_dir)?;
        use std::io::Write as _;
        tmp.write_all(&contents)?;
        tmp.flush()?;
        tmp.persist(self.entry_path(&entry.key))
            .map_err(|e| e.error)?;

        let key = entry.key.clone();
        self.memory.lock().unwrap().insert(key.clone(), entry);
        self.lru.lock().unwrap().touch(&key);
        self.update_meta()?;
        Ok(())
    }

    pub fn clear(&self, key: &str) {
        self.memory.lock().unwrap().remove(key);
        self.lru.lock().unwrap().evict(key);
        let _ = std::fs::remove_file(self.entry_path(key));
    }

    pub fn default_ttl(&self) -> chrono::Duration {
        self.default_ttl
    }

    /// Any entry for `name`, valid or expired — used by `acquire()`'s
    /// stale-serve-on-network-error and offline fallback paths.
    pub fn any_entry_for(&self, name: &str, all_known_keys: &[String]) -> Option<CacheEntry> {
        let prefix = format!("{name}@");
        all_known_keys
            .iter()
            .filter(|k| k.starts_with(&prefix))
            .filter_map(|k| match self.lookup(k) {
                Lookup::Hit(e) | Lookup::Expired(e) => Some(e),
                _ => None,
            })
            .max_by_key(|e| e.downloaded_at)
    }

    /// Remove expired entries and, if over `max_size_bytes`, evict
    /// least-recently-accessed entries until under the limit.
    pub fn cleanup(&self) -> std::io::Result<()> {
        let templates_dir = self.cache_root.join("templates");
        let Ok(read_dir) = std::fs::read_dir(&templates_dir) else {
            return Ok(());
        };

        let mut entries: Vec<(PathBuf, CacheEntry)> = Vec::new();
        for entry in read_dir.flatten() {
            let path = entry.path();
            if let Ok(contents) = std::fs::read_to_string(&path) {
                if let Ok(cache_entry) = serde_json::from_str::<CacheEntry>(&contents) {
                    if cache_entry.cache_version == CACHE_VERSION && cache_entry.checksum_matches() {
                        entries.push((path, cache_entry));
                    } else {
                        let _ = std::fs::remove_file(&path);
                    }
                }
            }
        }

        let now = Utc::now();
        entries.retain(|(path, entry)| {
            if !entry.is_valid(now) {
                let _ = std::fs::remove_file(path);
                self.memory.lock().unwrap().remove(&entry.key);
                false
            } else {
                true
            }
        });

        let mut total_size: u64 = entries.iter().map(|(_, e)| e.blob.len() as u64).sum();
        if total_size > self.max_size_bytes {
            entries.sort_by_key(|(_, e)| e.last_accessed);
            for (path, entry) in &entries {
                if total_size <= self.max_size_bytes {
                    break;
                }
                let _ = std::fs::remove_file(path);
                self.memory.lock().unwrap().remove(&entry.key);
                total_size = total_size.saturating_sub(entry.blob.len() as u64);
            }
        }

        self.update_meta()?;
        Ok(())
    }

    fn update_meta(&self) -> std::io::Result<()> {
        let templates_dir = self.cache_root.join("templates");
        let (total_entries, total_size_bytes) = std::fs::read_dir(&templates_dir)
            .map(|rd| {
                rd.flatten().fold((0u64, 0u64), |(count, size), entry| {
                    let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
                    (count + 1, size + len)
                })
            })
            .unwrap_or((0, 0));

        let meta = CacheMeta {
            cache_version: CACHE_VERSION,
            total_entries,
            total_size_bytes,
            last_cleanup: Some(Utc::now()),
            default_ttl_secs: self.default_ttl.num_seconds(),
            max_size_bytes: self.max_size_bytes,
        };

        std::fs::create_dir_all(&self.cache_root)?;
        let contents = serde_json::to_vec_pretty(&meta)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.cache_root)?;
        use std::io::Write as _;
        tmp.write_all(&contents)?;
        tmp.flush()?;
        tmp.persist(self.meta_path()).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn read_meta(&self) -> Option<CacheMeta> {
        let contents = std::fs::read_to_string(self.meta_path()).ok()?;
        serde_json::from_str(&contents).ok()
    }
}

/// List the `<name>@<version>` keys known to the on-disk cache — used by
/// `any_entry_for` callers that don't already have a candidate key list.
pub fn known_keys(cache_root: &Path) -> Vec<String> {
    let templates_dir = cache_root.join("templates");
    let Ok(read_dir) = std::fs::read_dir(&templates_dir) else {
        return Vec::new();
    };
    read_dir
        .flatten()
        .filter_map(|entry| {
            entry
                .path()
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, version: &str) -> TemplateDescriptor {
        TemplateDescriptor {
            name: name.to_string(),
            version: semver::Version::parse(version).unwrap(),
            description: "test".into(),
            min_flutter_sdk: semver::Version::new(3, 0, 0),
            min_dart_sdk: semver::Version::new(3, 0, 0),
            cli_min_version: None,
            cli_max_version: None,
            features: vec![],
            packages: vec![],
            deprecated: false,
            deprecation_date: None,
            eol_date: None,
            variables_schema: serde_json::json!({"type": "object"}),
        }
    }

    #[test]
    fn miss_when_nothing_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TemplateCache::new(dir.path().to_path_buf(), chrono::Duration::hours(1), 1_000_000);
        assert!(matches!(cache.lookup("foo@1.0.0"), Lookup::Miss));
    }

    #[test]
    fn put_then_lookup_is_a_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TemplateCache::new(dir.path().to_path_buf(), chrono::Duration::hours(1), 1_000_000);
        let entry = CacheEntry::new(descriptor("riverpod", "2.1.0"), b"blob".to_vec(), chrono::Duration::hours(1));
        cache.put(entry).unwrap();
        assert!(matches!(cache.lookup("riverpod@2.1.0"), Lookup::Hit(_)));
    }

    #[test]
    fn expired_entry_reports_expired_not_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TemplateCache::new(dir.path().to_path_buf(), chrono::Duration::hours(1), 1_000_000);
        let mut entry = CacheEntry::new(descriptor("riverpod", "2.1.0"), b"blob".to_vec(), chrono::Duration::hours(1));
        entry.expires_at = Utc::now() - chrono::Duration::seconds(1);
        cache.put(entry).unwrap();
        assert!(matches!(cache.lookup("riverpod@2.1.0"), Lookup::Expired(_)));
    }

    #[test]
    fn corrupted_checksum_is_reported_as_corrupted_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TemplateCache::new(dir.path().to_path_buf(), chrono::Duration::hours(1), 1_000_000);
        let entry = CacheEntry::new(descriptor("riverpod", "2.1.0"), b"blob".to_vec(), chrono::Duration::hours(1));
        cache.put(entry).unwrap();

        // Corrupt the on-disk blob field without touching the checksum, then
        // force a disk read past the in-memory cache.
        let path = cache.entry_path("riverpod@2.1.0");
        let mut raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        raw["blob"] = serde_json::json!([9, 9, 9, 9]);
        cache.clear("riverpod@2.1.0");
        std::fs::write(&path, serde_json::to_string(&raw).unwrap()).unwrap();
        assert!(matches!(cache.lookup("riverpod@2.1.0"), Lookup::Corrupted));
    }

    #[test]
    fn corrupted_json_is_reported_as_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TemplateCache::new(dir.path().to_path_buf(), chrono::Duration::hours(1), 1_000_000);
        std::fs::create_dir_all(dir.path().join("templates")).unwrap();
        std::fs::write(dir.path().join("templates").join("bad@1.0.0.json"), "{not json").unwrap();
        assert!(matches!(cache.lookup("bad@1.0.0"), Lookup::Corrupted));
    }

    #[test]
    fn mismatched_cache_version_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TemplateCache::new(dir.path().to_path_buf(), chrono::Duration::hours(1), 1_000_000);
        let mut entry = CacheEntry::new(descriptor("riverpod", "2.1.0"), b"blob".to_vec(), chrono::Duration::hours(1));
        entry.cache_version = 99;
        cache.put(entry).unwrap();
        assert!(matches!(cache.lookup("riverpod@2.1.0"), Lookup::Corrupted));
    }

    #[test]
    fn monotonicity_put_then_lookup_is_hit_until_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TemplateCache::new(dir.path().to_path_buf(), chrono::Duration::hours(1), 1_000_000);
        let entry = CacheEntry::new(descriptor("x", "1.0.0"), b"blob".to_vec(), chrono::Duration::hours(1));
        cache.put(entry).unwrap();
        for _ in 0..5 {
            assert!(matches!(cache.lookup("x@1.0.0"), Lookup::Hit(_)));
        }
        cache.clear("x@1.0.0");
        assert!(matches!(cache.lookup("x@1.0.0"), Lookup::Miss));
    }

    #[test]
    fn cleanup_evicts_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TemplateCache::new(dir.path().to_path_buf(), chrono::Duration::hours(1), 1_000_000);
        let mut entry = CacheEntry::new(descriptor("x", "1.0.0"), b"blob".to_vec(), chrono::Duration::hours(1));
        entry.expires_at = Utc::now() - chrono::Duration::seconds(1);
        cache.put(entry).unwrap();
        cache.cleanup().unwrap();
        assert!(matches!(cache.lookup("x@1.0.0"), Lookup::Miss));
    }

    #[test]
    fn cleanup_evicts_lru_when_over_size_budget() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TemplateCache::new(dir.path().to_path_buf(), chrono::Duration::hours(1), 10);
        let mut old = CacheEntry::new(descriptor("old", "1.0.0"), vec![0u8; 8], chrono::Duration::hours(1));
        old.last_accessed = Utc::now() - chrono::Duration::hours(2);
        cache.put(old).unwrap();
        let recent = CacheEntry::new(descriptor("new", "1.0.0"), vec![0u8; 8], chrono::Duration::hours(1));
        cache.put(recent).unwrap();

        cache.cleanup().unwrap();
        assert!(matches!(cache.lookup("old@1.0.0"), Lookup::Miss));
    }
}
