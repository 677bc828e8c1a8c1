//! Cache scan - rediscovers on-disk entries that are not registered yet
//!
//! Directory enumeration is held as explicit cursors in the operation and
//! advanced a bounded number of entries per step, so a large cache tree is
//! walked across many ticks. Candidates are then handed to a
//! [`VerifyBatchOperation`] submitted as a child. The scan itself always
//! succeeds; entries that fail verification stay on disk untouched.

use crate::cache::layout::RootKind;
use crate::cache::verify::{VerifyBatchOperation, VerifyElement};
use crate::operation::{AsyncOperation, OperationContext, OperationHandle, StepResult};
use bundlefetch_types::{CoreEvent, VerifyLevel};
use std::collections::VecDeque;
use std::fs::ReadDir;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanPhase {
    Prepare,
    Enumerate,
    StartVerify,
    Verifying,
    Done,
}

/// Async operation scanning one package's cache roots
pub struct CacheScanOperation {
    package: String,
    level: Option<VerifyLevel>,
    phase: ScanPhase,
    roots: VecDeque<(RootKind, PathBuf)>,
    /// Cursor over `<root>/<prefix>` directories
    prefixes: Option<(RootKind, ReadDir)>,
    /// Cursor over `<root>/<prefix>/<key>` directories
    entries: Option<(RootKind, ReadDir)>,
    candidates: Vec<VerifyElement>,
    skipped: usize,
    verifier: Option<OperationHandle<VerifyBatchOperation>>,
    found: usize,
    verified: usize,
    failed: usize,
}

impl CacheScanOperation {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            level: None,
            phase: ScanPhase::Prepare,
            roots: VecDeque::new(),
            prefixes: None,
            entries: None,
            candidates: Vec::new(),
            skipped: 0,
            verifier: None,
            found: 0,
            verified: 0,
            failed: 0,
        }
    }

    /// Verify at this level; never below the configured one
    pub fn with_level(mut self, level: VerifyLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    /// Unregistered entries found on disk
    pub fn found(&self) -> usize {
        self.found
    }

    /// Entries that passed verification and were registered
    pub fn verified(&self) -> usize {
        self.verified
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Entries skipped because they were already registered
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Advance the directory cursors by one entry.
    ///
    /// Returns false once every root has been walked.
    fn advance(&mut self, ctx: &OperationContext<'_>) -> bool {
        if let Some((kind, iter)) = &mut self.entries {
            let kind = *kind;
            match iter.next() {
                Some(Ok(entry)) => {
                    let path = entry.path();
                    if !path.is_dir() {
                        return true;
                    }
                    let Some(element) = VerifyElement::from_entry_dir(&self.package, kind, &path)
                    else {
                        return true;
                    };
                    if ctx.cache.is_cached(&self.package, &element.key) {
                        self.skipped += 1;
                    } else {
                        self.candidates.push(element);
                    }
                }
                Some(Err(e)) => {
                    warn!(package = %self.package, error = %e, "failed to read cache entry");
                }
                None => self.entries = None,
            }
            return true;
        }

        if let Some((kind, iter)) = &mut self.prefixes {
            let kind = *kind;
            match iter.next() {
                Some(Ok(entry)) => {
                    let path = entry.path();
                    if path.is_dir() {
                        match std::fs::read_dir(&path) {
                            Ok(iter) => self.entries = Some((kind, iter)),
                            Err(e) => {
                                warn!(package = %self.package, path = %path.display(), error = %e, "failed to open cache directory")
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(package = %self.package, error = %e, "failed to read cache directory");
                }
                None => self.prefixes = None,
            }
            return true;
        }

        let Some((kind, root)) = self.roots.pop_front() else {
            return false;
        };
        match std::fs::read_dir(&root) {
            Ok(iter) => self.prefixes = Some((kind, iter)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(package = %self.package, root = %root.display(), "cache root absent");
            }
            Err(e) => {
                warn!(package = %self.package, root = %root.display(), error = %e, "failed to open cache root");
            }
        }
        true
    }

    fn finish(&mut self, ctx: &OperationContext<'_>) -> StepResult {
        self.phase = ScanPhase::Done;
        info!(
            package = %self.package,
            found = self.found,
            verified = self.verified,
            failed = self.failed,
            skipped = self.skipped,
            "cache scan finished"
        );
        ctx.emit(CoreEvent::ScanFinished {
            package: self.package.clone(),
            found: self.found,
            verified: self.verified,
            failed: self.failed,
        });
        StepResult::Succeeded
    }
}

impl AsyncOperation for CacheScanOperation {
    fn start(&mut self, ctx: &mut OperationContext<'_>) {
        let layout = ctx.cache.layout();
        self.roots = [RootKind::Bundle, RootKind::Raw]
            .into_iter()
            .map(|kind| (kind, layout.kind_root(&self.package, kind)))
            .collect();
        self.phase = ScanPhase::Enumerate;
        debug!(package = %self.package, "cache scan started");
    }

    fn step(&mut self, ctx: &mut OperationContext<'_>) -> StepResult {
        match self.phase {
            ScanPhase::Prepare => {
                // Stepped without start (not submitted through a scheduler)
                self.start(ctx);
                StepResult::Running
            }
            ScanPhase::Enumerate => {
                let budget = ctx.settings.scan_entries_per_step.max(1);
                for _ in 0..budget {
                    if !self.advance(ctx) {
                        self.phase = ScanPhase::StartVerify;
                        break;
                    }
                    if ctx.is_busy() {
                        break;
                    }
                }
                StepResult::Running
            }
            ScanPhase::StartVerify => {
                self.found = self.candidates.len();
                if self.candidates.is_empty() {
                    return self.finish(ctx);
                }
                let mut batch = VerifyBatchOperation::new(std::mem::take(&mut self.candidates));
                if let Some(level) = self.level {
                    batch = batch.with_level(level);
                }
                self.verifier = Some(ctx.submit(batch));
                self.phase = ScanPhase::Verifying;
                StepResult::Running
            }
            ScanPhase::Verifying => {
                let Some(verifier) = &self.verifier else {
                    return self.finish(ctx);
                };
                if !verifier.is_done() {
                    return StepResult::Running;
                }
                let (verified, failed) =
                    verifier.with(|batch| (batch.verified().len(), batch.failed().len()));
                self.verified = verified;
                self.failed = failed;
                self.finish(ctx)
            }
            ScanPhase::Done => StepResult::Succeeded,
        }
    }

    fn progress(&self) -> f32 {
        match self.phase {
            ScanPhase::Prepare | ScanPhase::Enumerate | ScanPhase::StartVerify => 0.0,
            ScanPhase::Verifying => self
                .verifier
                .as_ref()
                .map_or(0.0, |v| 0.1 + 0.9 * v.progress()),
            ScanPhase::Done => 1.0,
        }
    }

    fn abort(&mut self) {
        if let Some(verifier) = &self.verifier {
            verifier.cancel();
        }
        self.prefixes = None;
        self.entries = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::layout::{CacheLayout, DATA_FILE_NAME, INFO_FILE_NAME};
    use crate::cache::CacheSystem;
    use crate::checksum::bytes_crc32;
    use crate::codec::{write_info_file, InfoRecord};
    use crate::engine::{DownloadOrchestrator, TransportRegistry};
    use crate::scheduler::{OperationScheduler, Services};
    use bundlefetch_types::{ContentKind, OperationStatus, Settings};
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn write_entry(layout: &CacheLayout, key: &str, data: &[u8], claimed_size: u64) {
        let paths = layout.paths("pkg", &ContentKind::Bundle, key);
        std::fs::create_dir_all(&paths.dir).unwrap();
        std::fs::write(paths.dir.join(DATA_FILE_NAME), data).unwrap();
        write_info_file(
            &paths.dir.join(INFO_FILE_NAME),
            &InfoRecord {
                crc: bytes_crc32(data),
                size: claimed_size,
            },
        )
        .unwrap();
    }

    fn run_scan(
        cache: &mut CacheSystem,
        settings: &Settings,
    ) -> OperationHandle<CacheScanOperation> {
        run(cache, settings, CacheScanOperation::new("pkg"))
    }

    fn run(
        cache: &mut CacheSystem,
        settings: &Settings,
        scan: CacheScanOperation,
    ) -> OperationHandle<CacheScanOperation> {
        let (events, _) = broadcast::channel(16);
        let mut downloads = DownloadOrchestrator::new(TransportRegistry::new(), events.clone());
        let mut scheduler = OperationScheduler::new(Duration::ZERO);
        let handle = scheduler.submit(
            scan,
            Services {
                cache: &mut *cache,
                downloads: &mut downloads,
                settings,
                events: &events,
            },
        );
        for _ in 0..1000 {
            if handle.is_done() {
                break;
            }
            scheduler.tick(Services {
                cache: &mut *cache,
                downloads: &mut downloads,
                settings,
                events: &events,
            });
        }
        handle
    }

    #[test]
    fn test_scan_registers_good_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            cache_root: dir.path().to_path_buf(),
            scan_entries_per_step: 1,
            verify_files_per_step: 1,
            ..Settings::default()
        };
        let mut cache = CacheSystem::new(dir.path());
        let layout = cache.layout().clone();
        write_entry(&layout, "aa01", b"good", 4);
        write_entry(&layout, "aa02", b"also good", 9);
        write_entry(&layout, "bb01", b"short", 50);

        let handle = run_scan(&mut cache, &settings);

        assert_eq!(handle.status(), OperationStatus::Succeeded);
        assert_eq!(handle.with(|s| (s.found(), s.verified(), s.failed())), (3, 2, 1));
        assert_eq!(cache.keys("pkg"), vec!["aa01", "aa02"]);
        assert!(layout.paths("pkg", &ContentKind::Bundle, "bb01").dir.exists());
    }

    #[test]
    fn test_second_scan_skips_registered_keys() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            cache_root: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let mut cache = CacheSystem::new(dir.path());
        let layout = cache.layout().clone();
        write_entry(&layout, "k1", b"one", 3);
        write_entry(&layout, "k2", b"two", 3);

        run_scan(&mut cache, &settings);
        let first = cache.records("pkg");

        let again = run_scan(&mut cache, &settings);
        assert_eq!(again.with(|s| (s.found(), s.skipped())), (0, 2));
        assert_eq!(cache.records("pkg"), first);
    }

    #[test]
    fn test_scan_of_missing_package_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            cache_root: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let mut cache = CacheSystem::new(dir.path());

        let handle = run_scan(&mut cache, &settings);
        assert_eq!(handle.status(), OperationStatus::Succeeded);
        assert_eq!(handle.with(|s| s.found()), 0);
    }

    #[test]
    fn test_requested_level_never_drops_below_configured() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            cache_root: dir.path().to_path_buf(),
            verify_level: VerifyLevel::High,
            ..Settings::default()
        };
        let mut cache = CacheSystem::new(dir.path());
        let layout = cache.layout().clone();
        write_entry(&layout, "cc01", b"original", 8);
        let data = layout.paths("pkg", &ContentKind::Bundle, "cc01").data;
        std::fs::write(&data, b"tampered").unwrap();

        let handle = run(
            &mut cache,
            &settings,
            CacheScanOperation::new("pkg").with_level(VerifyLevel::Low),
        );

        assert_eq!(handle.with(|s| (s.found(), s.verified(), s.failed())), (1, 0, 1));
        assert!(!cache.is_cached("pkg", "cc01"));
    }
}
