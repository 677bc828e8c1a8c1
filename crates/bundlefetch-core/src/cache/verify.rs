//! Cache file verification
//!
//! Everything here is pure with respect to shared state: functions read
//! the filesystem and return a [`VerifyResult`], they never touch the
//! registry and never return an error. That makes them safe to run on a
//! worker and keeps one bad file from aborting a batch.

use crate::cache::layout::{RootKind, DATA_FILE_NAME, INFO_FILE_NAME};
use crate::checksum::{crc_matches, file_crc32};
use crate::codec::read_info_file;
use crate::operation::{AsyncOperation, OperationContext, StepResult};
use bundlefetch_types::{CacheRecord, VerifyLevel, VerifyResult};
use chrono::Utc;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Data-file and info-file locations of one cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePathInfo {
    pub data: PathBuf,
    pub info: PathBuf,
}

/// Verify a data file against an expected size and CRC.
///
/// Size is checked before the checksum at every level.
pub fn verify_data_file(
    data: &Path,
    expected_size: u64,
    expected_crc: &str,
    level: VerifyLevel,
) -> VerifyResult {
    let metadata = match std::fs::metadata(data) {
        Ok(m) if m.is_file() => m,
        Ok(_) => return VerifyResult::DataFileNotExisted,
        Err(e) if e.kind() == ErrorKind::NotFound => return VerifyResult::DataFileNotExisted,
        Err(e) => {
            warn!(path = %data.display(), error = %e, "stat failed during verification");
            return VerifyResult::Exception;
        }
    };

    if level == VerifyLevel::Low {
        return VerifyResult::Succeeded;
    }

    let actual = metadata.len();
    if actual < expected_size {
        return VerifyResult::FileNotComplete;
    }
    if actual > expected_size {
        return VerifyResult::FileOverflow;
    }

    if level == VerifyLevel::High {
        match file_crc32(data) {
            Ok(crc) if crc_matches(expected_crc, &crc) => {}
            Ok(_) => return VerifyResult::FileCrcError,
            Err(e) => {
                warn!(path = %data.display(), error = %e, "checksum read failed");
                return VerifyResult::Exception;
            }
        }
    }

    VerifyResult::Succeeded
}

/// Verify a cache entry (info file plus data file).
pub fn verify(
    paths: &CachePathInfo,
    expected_size: u64,
    expected_crc: &str,
    level: VerifyLevel,
) -> VerifyResult {
    if !paths.info.is_file() {
        return VerifyResult::InfoFileNotExisted;
    }
    verify_data_file(&paths.data, expected_size, expected_crc, level)
}

/// One on-disk entry found by a scan, awaiting verification
#[derive(Debug, Clone)]
pub struct VerifyElement {
    pub package: String,
    pub key: String,
    pub paths: CachePathInfo,
    /// Filled from the info file by [`VerifyElement::verify`]
    pub size: Option<u64>,
    pub crc: Option<String>,
    pub result: Option<VerifyResult>,
}

impl VerifyElement {
    pub fn new(package: impl Into<String>, key: impl Into<String>, paths: CachePathInfo) -> Self {
        Self {
            package: package.into(),
            key: key.into(),
            paths,
            size: None,
            crc: None,
            result: None,
        }
    }

    /// Build an element for a key directory found on disk.
    ///
    /// Raw entries keep an extension on the data file, so the directory is
    /// searched for the first `__data*` file.
    pub fn from_entry_dir(package: &str, kind: RootKind, dir: &Path) -> Option<Self> {
        let key = dir.file_name()?.to_str()?.to_string();
        let data = match kind {
            RootKind::Bundle => dir.join(DATA_FILE_NAME),
            RootKind::Raw => find_raw_data_file(dir).unwrap_or_else(|| dir.join(DATA_FILE_NAME)),
        };
        Some(Self::new(
            package,
            key,
            CachePathInfo {
                data,
                info: dir.join(INFO_FILE_NAME),
            },
        ))
    }

    /// Read the persisted size/CRC and verify the data file against it.
    pub fn verify(&mut self, level: VerifyLevel) -> VerifyResult {
        let result = self.run(level);
        self.result = Some(result);
        result
    }

    fn run(&mut self, level: VerifyLevel) -> VerifyResult {
        if !self.paths.info.is_file() {
            return VerifyResult::InfoFileNotExisted;
        }
        let info = match read_info_file(&self.paths.info) {
            Ok(info) => info,
            Err(e) => {
                warn!(package = %self.package, key = %self.key, error = %e, "unreadable info file");
                return VerifyResult::Exception;
            }
        };
        let result = verify(&self.paths, info.size, &info.crc, level);
        self.size = Some(info.size);
        self.crc = Some(info.crc);
        result
    }

    /// Convert a successfully verified element into a cache record
    pub fn into_record(self) -> Option<CacheRecord> {
        match (self.result, self.size, self.crc) {
            (Some(VerifyResult::Succeeded), Some(size), Some(crc)) => Some(CacheRecord {
                key: self.key,
                data_path: self.paths.data,
                info_path: self.paths.info,
                size,
                crc,
                verified_at: Utc::now(),
            }),
            _ => None,
        }
    }
}

fn find_raw_data_file(dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(DATA_FILE_NAME))
        })
}

/// Verifies a batch of elements a few at a time, registering the ones
/// that pass. Failures are reported, never fatal.
pub struct VerifyBatchOperation {
    pending: VecDeque<VerifyElement>,
    total: usize,
    level: Option<VerifyLevel>,
    verified: Vec<String>,
    failed: Vec<(String, VerifyResult)>,
}

impl VerifyBatchOperation {
    pub fn new(elements: Vec<VerifyElement>) -> Self {
        Self {
            total: elements.len(),
            pending: elements.into(),
            level: None,
            verified: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Verify more strictly than configured. A lower level is raised to
    /// the configured one, since passing entries get registered.
    pub fn with_level(mut self, level: VerifyLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn verified(&self) -> &[String] {
        &self.verified
    }

    pub fn failed(&self) -> &[(String, VerifyResult)] {
        &self.failed
    }
}

impl AsyncOperation for VerifyBatchOperation {
    fn step(&mut self, ctx: &mut OperationContext<'_>) -> StepResult {
        let configured = ctx.settings.verify_level;
        let level = self.level.map_or(configured, |level| level.max(configured));
        let per_step = ctx.settings.verify_files_per_step.max(1);

        for _ in 0..per_step {
            let Some(mut element) = self.pending.pop_front() else {
                break;
            };
            let result = element.verify(level);
            if result.is_success() {
                let package = element.package.clone();
                let key = element.key.clone();
                if let Some(record) = element.into_record() {
                    if !ctx.cache.is_cached(&package, &key) {
                        ctx.cache.record(&package, record);
                    }
                    self.verified.push(key);
                }
            } else {
                debug!(package = %element.package, key = %element.key, %result, "cache entry failed verification");
                self.failed.push((element.key, result));
            }
            if ctx.is_busy() {
                break;
            }
        }

        if self.pending.is_empty() {
            StepResult::Succeeded
        } else {
            StepResult::Running
        }
    }

    fn progress(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            (self.total - self.pending.len()) as f32 / self.total as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::bytes_crc32;
    use crate::codec::{write_info_file, InfoRecord};

    fn entry(dir: &Path, claimed_size: u64, claimed_crc: &str, data: &[u8]) -> CachePathInfo {
        std::fs::create_dir_all(dir).unwrap();
        let paths = CachePathInfo {
            data: dir.join(DATA_FILE_NAME),
            info: dir.join(INFO_FILE_NAME),
        };
        std::fs::write(&paths.data, data).unwrap();
        write_info_file(
            &paths.info,
            &InfoRecord {
                crc: claimed_crc.to_string(),
                size: claimed_size,
            },
        )
        .unwrap();
        paths
    }

    #[test]
    fn test_size_mismatch_by_level() {
        let dir = tempfile::tempdir().unwrap();
        let short = entry(&dir.path().join("short"), 1000, "00000000", &[7u8; 999]);
        let long = entry(&dir.path().join("long"), 1000, "00000000", &[7u8; 1001]);

        for level in [VerifyLevel::Middle, VerifyLevel::High] {
            assert_eq!(verify(&short, 1000, "00000000", level), VerifyResult::FileNotComplete);
            assert_eq!(verify(&long, 1000, "00000000", level), VerifyResult::FileOverflow);
        }
        assert_eq!(verify(&short, 1000, "00000000", VerifyLevel::Low), VerifyResult::Succeeded);
        assert_eq!(verify(&long, 1000, "00000000", VerifyLevel::Low), VerifyResult::Succeeded);
    }

    #[test]
    fn test_crc_checked_only_at_high() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![3u8; 1000];
        let paths = entry(dir.path(), 1000, "ffffffff", &data);

        assert_eq!(verify(&paths, 1000, "ffffffff", VerifyLevel::Middle), VerifyResult::Succeeded);
        assert_eq!(verify(&paths, 1000, "ffffffff", VerifyLevel::High), VerifyResult::FileCrcError);
        assert_eq!(
            verify(&paths, 1000, &bytes_crc32(&data), VerifyLevel::High),
            VerifyResult::Succeeded
        );
    }

    #[test]
    fn test_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CachePathInfo {
            data: dir.path().join(DATA_FILE_NAME),
            info: dir.path().join(INFO_FILE_NAME),
        };
        assert_eq!(verify(&paths, 1, "0", VerifyLevel::Low), VerifyResult::InfoFileNotExisted);

        std::fs::write(&paths.info, b"x").unwrap();
        assert_eq!(verify(&paths, 1, "0", VerifyLevel::Low), VerifyResult::DataFileNotExisted);
    }

    #[test]
    fn test_high_verification_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 7) as u8).collect();
        let crc = bytes_crc32(&data);
        let paths = entry(dir.path(), data.len() as u64, &crc, &data);

        for _ in 0..3 {
            assert_eq!(
                verify(&paths, data.len() as u64, &crc, VerifyLevel::High),
                VerifyResult::Succeeded
            );
        }
    }

    #[test]
    fn test_element_reads_info_and_builds_record() {
        let dir = tempfile::tempdir().unwrap();
        let key_dir = dir.path().join("ke").join("key1");
        let data = b"hello cache".to_vec();
        entry(&key_dir, data.len() as u64, &bytes_crc32(&data), &data);

        let mut element = VerifyElement::from_entry_dir("pkg", RootKind::Bundle, &key_dir).unwrap();
        assert_eq!(element.key, "key1");
        assert_eq!(element.verify(VerifyLevel::High), VerifyResult::Succeeded);

        let record = element.into_record().unwrap();
        assert_eq!(record.size, data.len() as u64);
        assert_eq!(record.key, "key1");
    }

    #[test]
    fn test_element_with_truncated_info_is_exception() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INFO_FILE_NAME), [5u8, 0, b'a']).unwrap();
        std::fs::write(dir.path().join(DATA_FILE_NAME), b"abc").unwrap();

        let mut element = VerifyElement::from_entry_dir("pkg", RootKind::Bundle, dir.path()).unwrap();
        assert_eq!(element.verify(VerifyLevel::Low), VerifyResult::Exception);
        assert!(element.into_record().is_none());
    }

    #[test]
    fn test_raw_element_finds_data_file_with_extension() {
        let dir = tempfile::tempdir().unwrap();
        let key_dir = dir.path().join("raw1");
        std::fs::create_dir_all(&key_dir).unwrap();
        std::fs::write(key_dir.join("__data.txt"), b"raw").unwrap();

        let element = VerifyElement::from_entry_dir("pkg", RootKind::Raw, &key_dir).unwrap();
        assert_eq!(element.paths.data, key_dir.join("__data.txt"));
    }
}
