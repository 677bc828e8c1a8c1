//! Content cache - per-package registry of verified entries
//!
//! The registry is in-memory only. Entries get into it after their files
//! have been verified, either by a finished download or by a cache scan,
//! and leave it only through [`CacheSystem::discard`].

pub mod clear;
pub mod layout;
pub mod scan;
pub mod verify;

pub use clear::{ClearCacheOperation, ClearMode};
pub use layout::{CacheLayout, CachePaths, RootKind};
pub use scan::CacheScanOperation;
pub use verify::{verify, verify_data_file, CachePathInfo, VerifyBatchOperation, VerifyElement};

use bundlefetch_types::{CacheRecord, VerifyLevel, VerifyResult};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, warn};

/// Set of keys a package currently needs, supplied by the host
pub trait PackageManifest {
    fn requires(&self, key: &str) -> bool;
}

impl PackageManifest for HashSet<String> {
    fn requires(&self, key: &str) -> bool {
        self.contains(key)
    }
}

impl PackageManifest for BTreeSet<String> {
    fn requires(&self, key: &str) -> bool {
        self.contains(key)
    }
}

impl PackageManifest for [String] {
    fn requires(&self, key: &str) -> bool {
        self.iter().any(|k| k == key)
    }
}

/// Registry of verified cache records, one map per package
#[derive(Debug)]
pub struct CacheSystem {
    layout: CacheLayout,
    packages: HashMap<String, HashMap<String, CacheRecord>>,
}

impl CacheSystem {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            layout: CacheLayout::new(root.as_ref()),
            packages: HashMap::new(),
        }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Membership check against the registry; never touches disk.
    pub fn is_cached(&self, package: &str, key: &str) -> bool {
        self.packages
            .get(package)
            .is_some_and(|records| records.contains_key(key))
    }

    /// Insert or overwrite a record.
    pub fn record(&mut self, package: &str, record: CacheRecord) {
        debug!(package, key = %record.key, size = record.size, "cache record registered");
        self.packages
            .entry(package.to_string())
            .or_default()
            .insert(record.key.clone(), record);
    }

    pub fn get(&self, package: &str, key: &str) -> Option<&CacheRecord> {
        self.packages.get(package)?.get(key)
    }

    /// Remove a record and delete its entry directory.
    ///
    /// Deletion is best-effort: a failure is logged and the record stays
    /// removed. Returns whether a record was present.
    pub fn discard(&mut self, package: &str, key: &str) -> bool {
        let Some(record) = self.packages.get_mut(package).and_then(|r| r.remove(key)) else {
            return false;
        };

        let target = record.data_path.parent().unwrap_or(&record.data_path);
        let removed = if target.is_dir() {
            std::fs::remove_dir_all(target)
        } else {
            std::fs::remove_file(target)
        };
        match removed {
            Ok(()) => debug!(package, key, "cache entry discarded"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(package, key, "cache entry discarded, files already gone")
            }
            Err(e) => warn!(package, key, path = %target.display(), error = %e, "failed to delete cache entry"),
        }
        true
    }

    /// Keys registered for a package, sorted
    pub fn keys(&self, package: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .packages
            .get(package)
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Records registered for a package, sorted by key
    pub fn records(&self, package: &str) -> Vec<CacheRecord> {
        let mut records: Vec<CacheRecord> = self
            .packages
            .get(package)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Re-check a registered entry's files at `level`.
    ///
    /// Returns `CacheNotFound` for keys that are not registered. The
    /// registry is left untouched whatever the result.
    pub fn verify_cached(&self, package: &str, key: &str, level: VerifyLevel) -> VerifyResult {
        let Some(record) = self.get(package, key) else {
            return VerifyResult::CacheNotFound;
        };
        let paths = CachePathInfo {
            data: record.data_path.clone(),
            info: record.info_path.clone(),
        };
        verify(&paths, record.size, &record.crc, level)
    }

    pub fn count(&self, package: &str) -> usize {
        self.packages.get(package).map_or(0, HashMap::len)
    }

    /// Registered keys the manifest no longer requires. No I/O.
    pub fn unused_keys<M>(&self, package: &str, manifest: &M) -> Vec<String>
    where
        M: PackageManifest + ?Sized,
    {
        let mut unused: Vec<String> = self
            .packages
            .get(package)
            .map(|records| {
                records
                    .keys()
                    .filter(|key| !manifest.requires(key))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        unused.sort();
        unused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn record_at(dir: &Path, key: &str) -> CacheRecord {
        let entry = dir.join(key);
        std::fs::create_dir_all(&entry).unwrap();
        let data_path = entry.join(layout::DATA_FILE_NAME);
        std::fs::write(&data_path, b"data").unwrap();
        CacheRecord {
            key: key.to_string(),
            info_path: entry.join(layout::INFO_FILE_NAME),
            data_path,
            size: 4,
            crc: "00000000".into(),
            verified_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_is_idempotent_and_scoped_by_package() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CacheSystem::new(dir.path());
        let record = record_at(dir.path(), "k1");

        cache.record("a", record.clone());
        cache.record("a", record);
        assert!(cache.is_cached("a", "k1"));
        assert!(!cache.is_cached("b", "k1"));
        assert_eq!(cache.count("a"), 1);
    }

    #[test]
    fn test_discard_removes_record_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CacheSystem::new(dir.path());
        let record = record_at(dir.path(), "k1");
        let entry = record.data_path.parent().unwrap().to_path_buf();
        cache.record("a", record);

        assert!(cache.discard("a", "k1"));
        assert!(!cache.is_cached("a", "k1"));
        assert!(!entry.exists());
        assert!(!cache.discard("a", "k1"));
    }

    #[test]
    fn test_discard_missing_files_still_drops_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CacheSystem::new(dir.path());
        cache.record(
            "a",
            CacheRecord {
                key: "gone".into(),
                data_path: PathBuf::from("/nonexistent/bundlefetch/gone/__data"),
                info_path: PathBuf::from("/nonexistent/bundlefetch/gone/__info"),
                size: 1,
                crc: "0".into(),
                verified_at: Utc::now(),
            },
        );

        assert!(cache.discard("a", "gone"));
        assert!(!cache.is_cached("a", "gone"));
    }

    #[test]
    fn test_verify_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CacheSystem::new(dir.path());
        let record = record_at(dir.path(), "k1");
        std::fs::write(&record.info_path, b"x").unwrap();
        cache.record("a", record);

        assert_eq!(
            cache.verify_cached("a", "k1", VerifyLevel::Middle),
            VerifyResult::Succeeded
        );
        assert_eq!(
            cache.verify_cached("a", "missing", VerifyLevel::Low),
            VerifyResult::CacheNotFound
        );
    }

    #[test]
    fn test_unused_keys_is_set_difference() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CacheSystem::new(dir.path());
        for key in ["k1", "k2", "k3"] {
            cache.record("a", record_at(dir.path(), key));
        }

        let manifest: HashSet<String> = ["k2".to_string(), "other".to_string()].into();
        assert_eq!(cache.unused_keys("a", &manifest), vec!["k1", "k3"]);

        let everything: Vec<String> = vec!["k1".into(), "k2".into(), "k3".into()];
        assert!(cache.unused_keys("a", everything.as_slice()).is_empty());
        assert!(cache.unused_keys("missing", &manifest).is_empty());
    }
}
