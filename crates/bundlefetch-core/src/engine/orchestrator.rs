//! Download orchestrator - at most one downloader per destination path
//!
//! Polled once per host tick next to the operation scheduler. A request
//! for a path that already has a live downloader joins it: the first
//! caller's retry count and stall timeout stay in effect and later values
//! are ignored.

use crate::cache::layout::{validate_kind, validate_segment};
use crate::cache::CacheSystem;
use crate::engine::downloader::{DownloadEnv, DownloadHandle, DownloadPolicy, ResumableDownloader};
use crate::engine::transport::TransportRegistry;
use crate::error::BundleResult;
use bundlefetch_types::{BundleDescriptor, CoreEvent, Settings};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Keyed registry of live downloaders
pub struct DownloadOrchestrator {
    transports: TransportRegistry,
    live: HashMap<PathBuf, DownloadHandle>,
    events: broadcast::Sender<CoreEvent>,
}

impl DownloadOrchestrator {
    pub fn new(transports: TransportRegistry, events: broadcast::Sender<CoreEvent>) -> Self {
        Self {
            transports,
            live: HashMap::new(),
            events,
        }
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    pub fn transports_mut(&mut self) -> &mut TransportRegistry {
        &mut self.transports
    }

    /// Start (or join) the download of one resource.
    ///
    /// `timeout` is the stall window; `None` uses the configured default.
    pub fn begin_download(
        &mut self,
        cache: &CacheSystem,
        settings: &Settings,
        descriptor: BundleDescriptor,
        retries: u32,
        timeout: Option<Duration>,
    ) -> BundleResult<DownloadHandle> {
        validate_segment("package", &descriptor.package)?;
        validate_segment("key", &descriptor.key)?;
        validate_kind(&descriptor.kind)?;

        let paths = cache
            .layout()
            .paths(&descriptor.package, &descriptor.kind, &descriptor.key);

        if let Some(existing) = self.live.get(&paths.data) {
            debug!(
                package = %descriptor.package,
                key = %descriptor.key,
                "joining in-flight download"
            );
            return Ok(existing.clone());
        }

        if cache.is_cached(&descriptor.package, &descriptor.key) {
            debug!(package = %descriptor.package, key = %descriptor.key, "already cached");
            return Ok(DownloadHandle::cached(
                &descriptor.package,
                &descriptor.key,
                paths.data,
            ));
        }

        info!(
            package = %descriptor.package,
            key = %descriptor.key,
            size = descriptor.size,
            retries,
            "download requested"
        );
        let destination = paths.data.clone();
        let mut downloader = ResumableDownloader::new(
            descriptor,
            paths,
            DownloadPolicy::from_settings(settings, retries, timeout),
            self.events.clone(),
        );
        downloader.start();

        let handle = DownloadHandle::network(downloader, destination.clone());
        self.live.insert(destination, handle.clone());
        Ok(handle)
    }

    /// Poll every live downloader once, then drop the terminal ones.
    pub fn tick(&mut self, cache: &mut CacheSystem) {
        if self.live.is_empty() {
            return;
        }
        let mut env = DownloadEnv {
            cache,
            transports: &self.transports,
        };
        for handle in self.live.values() {
            handle.update(&mut env);
        }
        self.live.retain(|_, handle| !handle.is_done());
    }

    /// Live downloader for a destination path
    pub fn get(&self, destination: &Path) -> Option<DownloadHandle> {
        self.live.get(destination).cloned()
    }

    pub fn active(&self) -> Vec<DownloadHandle> {
        self.live.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Abort every live downloader (teardown); no status events are sent.
    pub fn abort_all(&mut self) {
        let count = self.live.len();
        for (_, handle) in self.live.drain() {
            handle.abort();
        }
        if count > 0 {
            info!(count, "aborted all downloads");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BundleError;
    use bundlefetch_types::{ContentKind, DownloadStatus, MirrorUrls};

    fn descriptor(key: &str) -> BundleDescriptor {
        BundleDescriptor::new(
            "pkg",
            key,
            10,
            "00000000",
            MirrorUrls::parse("mock://a/x", None).unwrap(),
        )
    }

    #[test]
    fn test_duplicate_request_returns_same_instance() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheSystem::new(dir.path());
        let settings = Settings::default();
        let (events, _) = broadcast::channel(16);
        let mut orchestrator = DownloadOrchestrator::new(TransportRegistry::new(), events);

        let first = orchestrator
            .begin_download(&cache, &settings, descriptor("k1"), 3, None)
            .unwrap();
        let second = orchestrator
            .begin_download(&cache, &settings, descriptor("k1"), 9, Some(Duration::from_secs(1)))
            .unwrap();
        let other = orchestrator
            .begin_download(&cache, &settings, descriptor("k2"), 3, None)
            .unwrap();

        assert!(first.same_download(&second));
        assert!(!first.same_download(&other));
        assert_eq!(orchestrator.len(), 2);
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheSystem::new(dir.path());
        let (events, _) = broadcast::channel(16);
        let mut orchestrator = DownloadOrchestrator::new(TransportRegistry::new(), events);

        assert!(orchestrator
            .begin_download(&cache, &Settings::default(), descriptor("../escape"), 0, None)
            .is_err());
        assert!(orchestrator.is_empty());
    }

    #[test]
    fn test_escaping_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheSystem::new(dir.path());
        let (events, _) = broadcast::channel(16);
        let mut orchestrator = DownloadOrchestrator::new(TransportRegistry::new(), events);
        let escaping = descriptor("k1").with_kind(ContentKind::Raw {
            extension: Some("x/../../../outside".into()),
        });

        let result = orchestrator.begin_download(&cache, &Settings::default(), escaping, 0, None);

        assert!(matches!(result, Err(BundleError::InvalidOperation(_))));
        assert!(orchestrator.is_empty());
    }

    #[test]
    fn test_unknown_scheme_fails_and_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CacheSystem::new(dir.path());
        let (events, _) = broadcast::channel(16);
        let mut orchestrator = DownloadOrchestrator::new(TransportRegistry::new(), events);

        let handle = orchestrator
            .begin_download(&cache, &Settings::default(), descriptor("k1"), 3, None)
            .unwrap();
        orchestrator.tick(&mut cache);

        assert!(matches!(handle.status(), DownloadStatus::Failed { .. }));
        assert!(orchestrator.is_empty());
    }

    #[test]
    fn test_abort_all_fails_live_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheSystem::new(dir.path());
        let (events, _) = broadcast::channel(16);
        let mut orchestrator = DownloadOrchestrator::new(TransportRegistry::new(), events);
        let handle = orchestrator
            .begin_download(&cache, &Settings::default(), descriptor("k1"), 3, None)
            .unwrap();

        orchestrator.abort_all();

        assert!(orchestrator.is_empty());
        assert_eq!(handle.error().as_deref(), Some("user cancelled"));
    }
}
