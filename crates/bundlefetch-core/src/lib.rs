//! bundlefetch core
//!
//! Retrieval, verification and local caching of content bundles for hosts
//! that run in fixed-budget frames. Three pieces do the work:
//!
//! - [`OperationScheduler`] steps cooperative [`AsyncOperation`]s within a
//!   wall-clock slice per tick.
//! - [`DownloadOrchestrator`] runs one [`ResumableDownloader`] per
//!   destination path, with range resume, mirror rotation and stall
//!   detection.
//! - [`CacheSystem`] keeps the per-package registry of verified entries;
//!   [`CacheScanOperation`] rebuilds it from disk.
//!
//! [`BundleRuntime`] owns all of them and is driven by one call to
//! [`BundleRuntime::tick`] per host frame.

pub mod cache;
pub mod checksum;
pub mod codec;
pub mod config;
mod dispatch;
pub mod engine;
mod error;
pub mod operation;
mod scheduler;

pub use cache::{
    CacheScanOperation, CacheSystem, ClearCacheOperation, ClearMode, PackageManifest,
    VerifyBatchOperation,
};
pub use dispatch::{callback_queue, CallbackQueue, Dispatcher};
pub use engine::{
    BatchOptions, DownloadBatchOperation, DownloadHandle, DownloadOrchestrator, DownloaderState,
    FileTransport, HttpTransport, ResumableDownloader, TransferHandle, Transport,
    TransportRegistry, TransportRequest,
};
pub use error::*;
pub use operation::{AsyncOperation, OperationContext, OperationHandle, OperationReport, StepResult};
pub use scheduler::{OperationScheduler, Services};

use bundlefetch_types::{
    BundleDescriptor, CacheRecord, CoreEvent, Settings, VerifyLevel, VerifyResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Sleep between forced-wait iterations that made no progress
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Context object owning the scheduler, orchestrator, cache and queues
pub struct BundleRuntime {
    settings: Settings,
    cache: CacheSystem,
    downloads: DownloadOrchestrator,
    scheduler: OperationScheduler,
    dispatcher: Dispatcher,
    callbacks: CallbackQueue,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl BundleRuntime {
    /// Create a runtime with no transports registered.
    pub fn new(settings: Settings) -> BundleResult<Self> {
        config::validate(&settings)?;
        let (event_tx, _) = broadcast::channel(1000);
        let (dispatcher, callbacks) = callback_queue();

        info!(
            cache_root = %settings.cache_root.display(),
            time_slice_ms = settings.time_slice_ms,
            verify_level = ?settings.verify_level,
            "bundle runtime created"
        );

        Ok(Self {
            cache: CacheSystem::new(&settings.cache_root),
            downloads: DownloadOrchestrator::new(TransportRegistry::new(), event_tx.clone()),
            scheduler: OperationScheduler::new(Duration::from_millis(settings.time_slice_ms)),
            settings,
            dispatcher,
            callbacks,
            event_tx,
        })
    }

    /// Create a runtime with the HTTP(S) and file transports registered.
    pub fn with_http(settings: Settings) -> BundleResult<Self> {
        let mut runtime = Self::new(settings)?;
        let http = HttpTransport::builder(runtime.dispatcher())
            .user_agent(runtime.settings.user_agent.clone())
            .build()?;
        runtime.register_transport(&["http", "https"], Arc::new(http));
        let file = FileTransport::new(runtime.dispatcher());
        runtime.register_transport(&["file"], Arc::new(file));
        Ok(runtime)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn register_transport(&mut self, schemes: &[&str], transport: Arc<dyn Transport>) {
        debug!(?schemes, "transport registered");
        self.downloads.transports_mut().register(schemes, transport);
    }

    /// Sender for worker-side callbacks, drained at the start of each tick
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// One host frame: drain worker callbacks, run the budgeted scheduler
    /// tick, then poll every live download once.
    pub fn tick(&mut self, elapsed: Duration) {
        let drained = self.callbacks.drain();
        let Self {
            scheduler,
            cache,
            downloads,
            settings,
            event_tx,
            ..
        } = self;
        scheduler.tick(Services {
            cache: &mut *cache,
            downloads: &mut *downloads,
            settings,
            events: event_tx,
        });
        downloads.tick(cache);
        trace!(
            elapsed_ms = elapsed.as_millis() as u64,
            drained,
            operations = self.scheduler.len(),
            downloads = self.downloads.len(),
            "runtime tick"
        );
    }

    /// Submit an operation; it is started now and stepped from the next tick.
    pub fn submit<O: AsyncOperation>(&mut self, op: O) -> OperationHandle<O> {
        let Self {
            scheduler,
            cache,
            downloads,
            settings,
            event_tx,
            ..
        } = self;
        scheduler.submit(
            op,
            Services {
                cache,
                downloads,
                settings,
                events: event_tx,
            },
        )
    }

    /// Start or join a download. `timeout` is the stall window.
    pub fn begin_download(
        &mut self,
        descriptor: BundleDescriptor,
        retries: u32,
        timeout: Option<Duration>,
    ) -> BundleResult<DownloadHandle> {
        self.downloads
            .begin_download(&self.cache, &self.settings, descriptor, retries, timeout)
    }

    pub fn scan_cache(&mut self, package: &str) -> OperationHandle<CacheScanOperation> {
        self.submit(CacheScanOperation::new(package))
    }

    pub fn clear_cache(
        &mut self,
        package: &str,
        mode: ClearMode,
    ) -> OperationHandle<ClearCacheOperation> {
        self.submit(ClearCacheOperation::new(package, mode))
    }

    pub fn download_batch(
        &mut self,
        descriptors: Vec<BundleDescriptor>,
        options: BatchOptions,
    ) -> OperationHandle<DownloadBatchOperation> {
        self.submit(DownloadBatchOperation::new(descriptors, options))
    }

    /// Block until `handle` is terminal by forcing unbudgeted passes.
    ///
    /// Ignores the tick time slice. The handle must belong to an operation
    /// submitted to this runtime, otherwise this never returns.
    pub fn wait_for_completion<O: AsyncOperation>(&mut self, handle: &OperationHandle<O>) {
        while !handle.is_done() {
            self.force_pass();
        }
        // Completion callbacks fire on removal, after the pass that finished it
        self.force_pass();
    }

    /// Block until a download is terminal, ignoring the time slice.
    pub fn wait_for_download(&mut self, handle: &DownloadHandle) {
        while !handle.is_done() {
            self.force_pass();
        }
    }

    fn force_pass(&mut self) {
        let drained = self.callbacks.drain();
        let Self {
            scheduler,
            cache,
            downloads,
            settings,
            event_tx,
            ..
        } = self;
        scheduler.run_pass(Services {
            cache: &mut *cache,
            downloads: &mut *downloads,
            settings,
            events: event_tx,
        });
        downloads.tick(cache);
        if drained == 0 {
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    pub fn cache(&self) -> &CacheSystem {
        &self.cache
    }

    pub fn is_cached(&self, package: &str, key: &str) -> bool {
        self.cache.is_cached(package, key)
    }

    pub fn record(&mut self, package: &str, record: CacheRecord) {
        self.cache.record(package, record);
    }

    pub fn discard(&mut self, package: &str, key: &str) -> bool {
        self.cache.discard(package, key)
    }

    pub fn unused_keys<M>(&self, package: &str, manifest: &M) -> Vec<String>
    where
        M: PackageManifest + ?Sized,
    {
        self.cache.unused_keys(package, manifest)
    }

    pub fn records(&self, package: &str) -> Vec<CacheRecord> {
        self.cache.records(package)
    }

    pub fn verify_cached(&self, package: &str, key: &str, level: VerifyLevel) -> VerifyResult {
        self.cache.verify_cached(package, key, level)
    }

    /// Live operations (including ones admitted but not yet stepped)
    pub fn pending_operations(&self) -> usize {
        self.scheduler.len()
    }

    pub fn active_downloads(&self) -> usize {
        self.downloads.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    /// Abandon all operations and abort all downloads without completions.
    pub fn shutdown(&mut self) {
        self.scheduler.shutdown();
        self.downloads.abort_all();
        info!("bundle runtime shut down");
    }
}
