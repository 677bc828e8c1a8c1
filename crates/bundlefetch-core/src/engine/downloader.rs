//! Resumable downloader - per-resource download state machine
//!
//! ```text
//! Idle -> CheckLocalPartialFile -> (VerifyExistingCache | PrepareTransfer)
//!      -> (ResumeTransfer | FullTransfer) -> VerifyDownloadedFile
//!      -> CacheCommit -> Succeeded
//!
//! recoverable failure: -> RetryBackoff -> PrepareTransfer
//! retries exhausted or local error: -> Failed
//! ```
//!
//! The machine only moves when the orchestrator polls it. Transfers are
//! written to `__temp` in the entry directory and renamed over the data
//! file on commit, so a data file is never partially written.

use crate::cache::layout::CachePaths;
use crate::cache::{verify, verify_data_file, CachePathInfo, CacheSystem};
use crate::codec::{write_info_file, InfoRecord};
use crate::engine::transport::{TransferHandle, TransportRegistry, TransportRequest};
use crate::error::{BundleError, BundleResult};
use bundlefetch_types::{
    BundleDescriptor, CacheRecord, CoreEvent, DownloadStatus, Settings, VerifyLevel, VerifyResult,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Immediate transitions taken in one poll before yielding
const MAX_TRANSITIONS_PER_UPDATE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloaderState {
    Idle,
    CheckLocalPartialFile,
    VerifyExistingCache,
    PrepareTransfer,
    ResumeTransfer,
    FullTransfer,
    VerifyDownloadedFile,
    CacheCommit,
    RetryBackoff,
    Succeeded,
    Failed,
}

impl DownloaderState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DownloaderState::Succeeded | DownloaderState::Failed)
    }
}

/// Settings snapshot taken when a downloader is created
#[derive(Debug, Clone)]
pub struct DownloadPolicy {
    pub max_retries: u32,
    pub stall_timeout: Duration,
    pub request_timeout: Option<Duration>,
    pub retry_delay: Duration,
    pub resume_threshold: u64,
    pub verify_level: VerifyLevel,
    pub clear_file_status_codes: Vec<u16>,
    pub hard_fail_status: Option<u16>,
    pub delete_partial_on_abort: bool,
}

impl DownloadPolicy {
    pub fn from_settings(settings: &Settings, max_retries: u32, stall_timeout: Option<Duration>) -> Self {
        Self {
            max_retries,
            stall_timeout: stall_timeout
                .unwrap_or_else(|| Duration::from_secs(settings.stall_timeout_secs)),
            request_timeout: settings.request_timeout_secs.map(Duration::from_secs),
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            resume_threshold: settings.resume_threshold,
            verify_level: settings.verify_level,
            clear_file_status_codes: settings.clear_file_status_codes.clone(),
            hard_fail_status: settings.hard_fail_status,
            delete_partial_on_abort: settings.delete_partial_on_abort,
        }
    }
}

/// What a downloader may touch while being polled
pub(crate) struct DownloadEnv<'a> {
    pub cache: &'a mut CacheSystem,
    pub transports: &'a TransportRegistry,
}

/// Network-backed downloader for one destination path
pub struct ResumableDownloader {
    descriptor: BundleDescriptor,
    paths: CachePaths,
    policy: DownloadPolicy,
    events: broadcast::Sender<CoreEvent>,
    state: DownloaderState,
    /// 1-based number of the current (or last) transfer attempt
    attempt: u32,
    retries_used: u32,
    transfer: Option<Box<dyn TransferHandle>>,
    /// Offset the current transfer resumed from
    range_start: u64,
    sampled_bytes: u64,
    last_advance: Instant,
    backoff_until: Option<Instant>,
    last_error: Option<String>,
    last_status: Option<u16>,
    downloaded: u64,
    progress: f32,
}

impl ResumableDownloader {
    pub fn new(
        descriptor: BundleDescriptor,
        paths: CachePaths,
        policy: DownloadPolicy,
        events: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            descriptor,
            paths,
            policy,
            events,
            state: DownloaderState::Idle,
            attempt: 0,
            retries_used: 0,
            transfer: None,
            range_start: 0,
            sampled_bytes: 0,
            last_advance: Instant::now(),
            backoff_until: None,
            last_error: None,
            last_status: None,
            downloaded: 0,
            progress: 0.0,
        }
    }

    pub fn state(&self) -> DownloaderState {
        self.state
    }

    pub fn descriptor(&self) -> &BundleDescriptor {
        &self.descriptor
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn retries_used(&self) -> u32 {
        self.retries_used
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_status(&self) -> Option<u16> {
        self.last_status
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    /// Leave `Idle`; the first real work happens on the next poll.
    pub fn start(&mut self) {
        if self.state == DownloaderState::Idle {
            self.state = DownloaderState::CheckLocalPartialFile;
        }
    }

    pub(crate) fn update(&mut self, env: &mut DownloadEnv<'_>) {
        for _ in 0..MAX_TRANSITIONS_PER_UPDATE {
            let before = self.state;
            self.advance(env);
            if self.state == before || self.state.is_terminal() {
                break;
            }
        }
    }

    fn advance(&mut self, env: &mut DownloadEnv<'_>) {
        match self.state {
            DownloaderState::Idle => self.start(),
            DownloaderState::CheckLocalPartialFile => self.check_local(env),
            DownloaderState::VerifyExistingCache => self.verify_existing(env),
            DownloaderState::PrepareTransfer => self.prepare_transfer(env),
            DownloaderState::ResumeTransfer | DownloaderState::FullTransfer => {
                self.poll_transfer()
            }
            DownloaderState::VerifyDownloadedFile => self.verify_downloaded(),
            DownloaderState::CacheCommit => self.commit(env),
            DownloaderState::RetryBackoff => {
                if self.backoff_until.map_or(true, |t| Instant::now() >= t) {
                    self.backoff_until = None;
                    self.state = DownloaderState::PrepareTransfer;
                }
            }
            DownloaderState::Succeeded | DownloaderState::Failed => {}
        }
    }

    fn check_local(&mut self, env: &mut DownloadEnv<'_>) {
        if env.cache.is_cached(&self.descriptor.package, &self.descriptor.key) {
            debug!(package = %self.descriptor.package, key = %self.descriptor.key, "already cached");
            self.succeed();
            return;
        }

        if let Some(len) = file_len(&self.paths.temp) {
            if len >= self.descriptor.size {
                // A previous run finished the transfer but not the commit
                debug!(key = %self.descriptor.key, len, "complete temp file found");
                self.state = DownloaderState::VerifyDownloadedFile;
                return;
            }
        }

        self.state = if self.paths.info.is_file() && self.paths.data.is_file() {
            DownloaderState::VerifyExistingCache
        } else {
            DownloaderState::PrepareTransfer
        };
    }

    fn verify_existing(&mut self, env: &mut DownloadEnv<'_>) {
        let paths = CachePathInfo {
            data: self.paths.data.clone(),
            info: self.paths.info.clone(),
        };
        let result = verify(
            &paths,
            self.descriptor.size,
            &self.descriptor.crc,
            self.policy.verify_level,
        );
        if result.is_success() {
            info!(package = %self.descriptor.package, key = %self.descriptor.key, "existing cache entry verified");
            env.cache
                .record(&self.descriptor.package, self.cache_record());
            self.succeed();
        } else {
            debug!(key = %self.descriptor.key, %result, "existing entry rejected, downloading");
            self.state = DownloaderState::PrepareTransfer;
        }
    }

    fn prepare_transfer(&mut self, env: &mut DownloadEnv<'_>) {
        if let Err(e) = std::fs::create_dir_all(&self.paths.dir) {
            self.fail(BundleError::Io(e));
            return;
        }

        let resume = self.descriptor.size >= self.policy.resume_threshold;
        let offset = if resume {
            file_len(&self.paths.temp).unwrap_or(0)
        } else {
            0
        };
        if resume && offset > 0 && offset >= self.descriptor.size {
            self.state = DownloaderState::VerifyDownloadedFile;
            return;
        }

        self.attempt += 1;
        let url = self.descriptor.urls.for_attempt(self.attempt).to_string();
        let transport = match env.transports.resolve(&url) {
            Ok(transport) => transport,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        let request = TransportRequest {
            url: url.clone(),
            range_start: (offset > 0).then_some(offset),
            save_path: self.paths.temp.clone(),
            timeout: self.policy.request_timeout,
        };
        info!(
            key = %self.descriptor.key,
            %url,
            attempt = self.attempt,
            range_start = offset,
            "starting transfer"
        );

        match transport.send(request) {
            Ok(handle) => {
                self.transfer = Some(handle);
                self.range_start = offset;
                self.sampled_bytes = 0;
                self.last_advance = Instant::now();
                self.set_downloaded(offset);
                self.state = if resume {
                    DownloaderState::ResumeTransfer
                } else {
                    DownloaderState::FullTransfer
                };
            }
            Err(e) => self.attempt_failed(e, None),
        }
    }

    fn poll_transfer(&mut self) {
        let Some(transfer) = self.transfer.as_ref() else {
            self.state = DownloaderState::PrepareTransfer;
            return;
        };
        let bytes = transfer.bytes_transferred();
        let done = transfer.is_done();
        let status = transfer.status_code();
        let error = transfer.has_error().then(|| {
            transfer
                .error_message()
                .unwrap_or_else(|| "transfer failed".to_string())
        });

        let now = Instant::now();
        if bytes != self.sampled_bytes {
            self.sampled_bytes = bytes;
            self.last_advance = now;
            self.set_downloaded(self.range_start + bytes);
        }

        if done {
            self.transfer = None;
            self.last_status = status.or(self.last_status);
            match error {
                Some(message) => {
                    let err = match status {
                        Some(status) => BundleError::ServerError { status, message },
                        None => BundleError::Transfer(message),
                    };
                    self.attempt_failed(err, status);
                }
                None => self.state = DownloaderState::VerifyDownloadedFile,
            }
            return;
        }

        if now.duration_since(self.last_advance) >= self.policy.stall_timeout {
            warn!(
                key = %self.descriptor.key,
                attempt = self.attempt,
                bytes = self.range_start + bytes,
                "transfer stalled"
            );
            if let Some(mut transfer) = self.transfer.take() {
                transfer.abort();
            }
            self.attempt_failed(
                BundleError::Stalled {
                    window: self.policy.stall_timeout,
                },
                None,
            );
        }
    }

    fn verify_downloaded(&mut self) {
        // Transferred size is always checked, whatever the configured level
        let level = self.policy.verify_level.max(VerifyLevel::Middle);
        let result = verify_data_file(
            &self.paths.temp,
            self.descriptor.size,
            &self.descriptor.crc,
            level,
        );
        match result {
            VerifyResult::Succeeded => self.state = DownloaderState::CacheCommit,
            VerifyResult::FileNotComplete | VerifyResult::DataFileNotExisted => {
                self.attempt_failed(BundleError::Verification(result), None)
            }
            VerifyResult::FileOverflow | VerifyResult::FileCrcError => {
                remove_partial(&self.paths.temp);
                self.attempt_failed(BundleError::Verification(result), None);
            }
            _ => self.fail(BundleError::Verification(result)),
        }
    }

    fn commit(&mut self, env: &mut DownloadEnv<'_>) {
        match self.commit_files() {
            Ok(()) => {
                env.cache
                    .record(&self.descriptor.package, self.cache_record());
                self.succeed();
            }
            Err(e) => self.fail(e),
        }
    }

    fn commit_files(&self) -> BundleResult<()> {
        if self.paths.data.exists() {
            std::fs::remove_file(&self.paths.data)?;
        }
        std::fs::rename(&self.paths.temp, &self.paths.data)?;
        write_info_file(
            &self.paths.info,
            &InfoRecord {
                crc: self.descriptor.crc.to_ascii_lowercase(),
                size: self.descriptor.size,
            },
        )
    }

    fn cache_record(&self) -> CacheRecord {
        CacheRecord {
            key: self.descriptor.key.clone(),
            data_path: self.paths.data.clone(),
            info_path: self.paths.info.clone(),
            size: self.descriptor.size,
            crc: self.descriptor.crc.to_ascii_lowercase(),
            verified_at: Utc::now(),
        }
    }

    /// Handle a recoverable-or-not attempt failure.
    fn attempt_failed(&mut self, err: BundleError, status: Option<u16>) {
        if let Some(status) = status {
            self.last_status = Some(status);
            if self.policy.clear_file_status_codes.contains(&status) {
                debug!(key = %self.descriptor.key, status, "clearing partial file");
                remove_partial(&self.paths.temp);
            }
        }

        if !err.is_retryable(self.policy.hard_fail_status) {
            self.fail(err);
            return;
        }
        if self.retries_used >= self.policy.max_retries {
            warn!(
                key = %self.descriptor.key,
                attempts = self.attempt,
                "retries exhausted"
            );
            self.fail(err);
            return;
        }

        self.retries_used += 1;
        warn!(
            key = %self.descriptor.key,
            attempt = self.attempt,
            retry = self.retries_used,
            max_retries = self.policy.max_retries,
            error = %err,
            "attempt failed, will retry"
        );
        self.last_error = Some(err.to_string());
        self.backoff_until = Some(Instant::now() + self.policy.retry_delay);
        self.state = DownloaderState::RetryBackoff;
    }

    fn set_downloaded(&mut self, downloaded: u64) {
        self.downloaded = downloaded;
        if self.descriptor.size > 0 {
            let fraction = (downloaded as f64 / self.descriptor.size as f64).min(1.0) as f32;
            self.progress = self.progress.max(fraction);
        }
        let _ = self.events.send(CoreEvent::DownloadProgress {
            package: self.descriptor.package.clone(),
            key: self.descriptor.key.clone(),
            downloaded,
            total: self.descriptor.size,
        });
    }

    fn succeed(&mut self) {
        self.state = DownloaderState::Succeeded;
        self.downloaded = self.descriptor.size;
        self.progress = 1.0;
        info!(
            package = %self.descriptor.package,
            key = %self.descriptor.key,
            attempts = self.attempt,
            retries = self.retries_used,
            "download succeeded"
        );
        self.emit_status();
    }

    fn fail(&mut self, err: BundleError) {
        if let Some(mut transfer) = self.transfer.take() {
            transfer.abort();
        }
        error!(
            package = %self.descriptor.package,
            key = %self.descriptor.key,
            status = ?self.last_status,
            error = %err,
            "download failed"
        );
        self.last_error = Some(err.to_string());
        self.state = DownloaderState::Failed;
        self.emit_status();
    }

    fn emit_status(&self) {
        let _ = self.events.send(CoreEvent::DownloadStatusChanged {
            package: self.descriptor.package.clone(),
            key: self.descriptor.key.clone(),
            status: self.status(),
            at: Utc::now(),
        });
    }

    /// Tear down the transfer and go straight to `Failed`.
    ///
    /// Does not consume a retry and does not emit a status event.
    pub fn abort(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if let Some(mut transfer) = self.transfer.take() {
            transfer.abort();
        }
        if self.policy.delete_partial_on_abort {
            remove_partial(&self.paths.temp);
        }
        info!(key = %self.descriptor.key, "download aborted");
        self.last_error = Some(BundleError::Cancelled.to_string());
        self.state = DownloaderState::Failed;
    }

    pub fn status(&self) -> DownloadStatus {
        match self.state {
            DownloaderState::Succeeded => DownloadStatus::Succeeded,
            DownloaderState::Failed => DownloadStatus::Failed {
                message: self
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "download failed".to_string()),
            },
            _ => DownloadStatus::Ongoing {
                progress: self.progress,
            },
        }
    }
}

fn file_len(path: &Path) -> Option<u64> {
    std::fs::metadata(path)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete partial file"),
    }
}

/// The closed set of downloader kinds, chosen once at construction
pub(crate) enum Downloader {
    /// Key was already registered when requested
    Cached,
    Network(Box<ResumableDownloader>),
}

impl Downloader {
    fn update(&mut self, env: &mut DownloadEnv<'_>) {
        if let Downloader::Network(d) = self {
            d.update(env);
        }
    }

    fn is_done(&self) -> bool {
        match self {
            Downloader::Cached => true,
            Downloader::Network(d) => d.state().is_terminal(),
        }
    }

    fn abort(&mut self) {
        if let Downloader::Network(d) = self {
            d.abort();
        }
    }
}

/// Caller-facing handle; clones share one downloader
#[derive(Clone)]
pub struct DownloadHandle {
    package: String,
    key: String,
    destination: PathBuf,
    inner: Arc<Mutex<Downloader>>,
}

impl DownloadHandle {
    pub(crate) fn cached(package: &str, key: &str, destination: PathBuf) -> Self {
        Self {
            package: package.to_string(),
            key: key.to_string(),
            destination,
            inner: Arc::new(Mutex::new(Downloader::Cached)),
        }
    }

    pub(crate) fn network(downloader: ResumableDownloader, destination: PathBuf) -> Self {
        Self {
            package: downloader.descriptor.package.clone(),
            key: downloader.descriptor.key.clone(),
            destination,
            inner: Arc::new(Mutex::new(Downloader::Network(Box::new(downloader)))),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Final data-file path
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn status(&self) -> DownloadStatus {
        match &*self.inner.lock() {
            Downloader::Cached => DownloadStatus::Succeeded,
            Downloader::Network(d) => d.status(),
        }
    }

    pub fn state(&self) -> DownloaderState {
        match &*self.inner.lock() {
            Downloader::Cached => DownloaderState::Succeeded,
            Downloader::Network(d) => d.state(),
        }
    }

    pub fn progress(&self) -> f32 {
        match &*self.inner.lock() {
            Downloader::Cached => 1.0,
            Downloader::Network(d) => d.progress(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().is_done()
    }

    pub fn error(&self) -> Option<String> {
        match &*self.inner.lock() {
            Downloader::Network(d) if d.state() == DownloaderState::Failed => {
                d.last_error().map(str::to_string)
            }
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &*self.inner.lock() {
            Downloader::Cached => None,
            Downloader::Network(d) => d.last_status(),
        }
    }

    pub fn attempts(&self) -> u32 {
        match &*self.inner.lock() {
            Downloader::Cached => 0,
            Downloader::Network(d) => d.attempts(),
        }
    }

    pub fn retries_used(&self) -> u32 {
        match &*self.inner.lock() {
            Downloader::Cached => 0,
            Downloader::Network(d) => d.retries_used(),
        }
    }

    /// Bytes present in the destination so far
    pub fn downloaded(&self) -> u64 {
        match &*self.inner.lock() {
            Downloader::Cached => 0,
            Downloader::Network(d) => d.downloaded(),
        }
    }

    pub fn abort(&self) {
        self.inner.lock().abort();
    }

    /// True if both handles refer to the same downloader instance
    pub fn same_download(&self, other: &DownloadHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn update(&self, env: &mut DownloadEnv<'_>) {
        self.inner.lock().update(env);
    }
}

impl std::fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("package", &self.package)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}
