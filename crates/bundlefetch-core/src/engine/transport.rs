//! Transport abstraction used by the resumable downloader
//!
//! A transport starts one transfer per [`Transport::send`] call and hands
//! back a pollable [`TransferHandle`]. Byte counters are updated live from
//! the worker; completion (done flag, status code, error) is posted through
//! the [`Dispatcher`] so the owner only sees it after draining the queue.

use crate::dispatch::Dispatcher;
use crate::error::{BundleError, BundleResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One transfer request
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    /// Resume offset; `Some` means "append to `save_path` from this byte"
    pub range_start: Option<u64>,
    pub save_path: PathBuf,
    /// Whole-request timeout, if any
    pub timeout: Option<Duration>,
}

/// Pollable state of an in-flight transfer
pub trait TransferHandle: Send {
    fn is_done(&self) -> bool;
    /// Progress of this request in [0, 1]; 0 while the length is unknown
    fn progress(&self) -> f32;
    fn has_error(&self) -> bool;
    fn error_message(&self) -> Option<String>;
    fn status_code(&self) -> Option<u16>;
    /// Bytes written by this request (excluding any resumed prefix)
    fn bytes_transferred(&self) -> u64;
    /// Stop the worker; the handle never reports done afterwards.
    fn abort(&mut self);
}

/// Something that can fetch a URL to a local file
pub trait Transport: Send + Sync {
    fn send(&self, request: TransportRequest) -> BundleResult<Box<dyn TransferHandle>>;
}

/// Final result of a worker, applied on the owning stream
#[derive(Debug, Clone, Default)]
pub struct TransferOutcome {
    pub status: Option<u16>,
    pub error: Option<String>,
}

impl TransferOutcome {
    pub fn ok(status: u16) -> Self {
        Self {
            status: Some(status),
            error: None,
        }
    }

    pub fn failed(status: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            status,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Default)]
struct Completion {
    done: bool,
    outcome: TransferOutcome,
}

/// State shared between a transfer worker and its handle
#[derive(Debug, Default)]
pub struct TransferState {
    bytes: AtomicU64,
    /// Expected bytes for this request; 0 when unknown
    expected: AtomicU64,
    cancelled: AtomicBool,
    completion: Mutex<Completion>,
}

impl TransferState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::AcqRel);
    }

    pub fn set_expected(&self, n: u64) {
        self.expected.store(n, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Post the outcome to the owning stream.
    pub fn finish(self: &Arc<Self>, dispatcher: &Dispatcher, outcome: TransferOutcome) {
        let state = Arc::clone(self);
        if !dispatcher.post(move || state.complete(outcome)) {
            debug!("transfer finished after callback queue was dropped");
        }
    }

    fn complete(&self, outcome: TransferOutcome) {
        if self.is_cancelled() {
            return;
        }
        let mut completion = self.completion.lock();
        completion.done = true;
        completion.outcome = outcome;
    }
}

/// [`TransferHandle`] over a [`TransferState`], used by the built-in
/// transports
pub struct WorkerTransfer {
    state: Arc<TransferState>,
    on_abort: Option<Box<dyn FnOnce() + Send>>,
}

impl WorkerTransfer {
    pub fn new(state: Arc<TransferState>) -> Self {
        Self {
            state,
            on_abort: None,
        }
    }

    /// Extra teardown run on abort (e.g. aborting a spawned task)
    pub fn with_abort(mut self, on_abort: impl FnOnce() + Send + 'static) -> Self {
        self.on_abort = Some(Box::new(on_abort));
        self
    }
}

impl TransferHandle for WorkerTransfer {
    fn is_done(&self) -> bool {
        self.state.completion.lock().done
    }

    fn progress(&self) -> f32 {
        let expected = self.state.expected.load(Ordering::Acquire);
        if expected == 0 {
            return 0.0;
        }
        (self.bytes_transferred() as f64 / expected as f64).min(1.0) as f32
    }

    fn has_error(&self) -> bool {
        self.state.completion.lock().outcome.error.is_some()
    }

    fn error_message(&self) -> Option<String> {
        self.state.completion.lock().outcome.error.clone()
    }

    fn status_code(&self) -> Option<u16> {
        self.state.completion.lock().outcome.status
    }

    fn bytes_transferred(&self) -> u64 {
        self.state.bytes.load(Ordering::Acquire)
    }

    fn abort(&mut self) {
        self.state.cancelled.store(true, Ordering::Release);
        if let Some(on_abort) = self.on_abort.take() {
            on_abort();
        }
    }
}

/// Transports keyed by URL scheme
#[derive(Default, Clone)]
pub struct TransportRegistry {
    transports: HashMap<String, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `transport` for each scheme, replacing earlier entries.
    pub fn register(&mut self, schemes: &[&str], transport: Arc<dyn Transport>) {
        for scheme in schemes {
            self.transports
                .insert(scheme.to_ascii_lowercase(), Arc::clone(&transport));
        }
    }

    pub fn supports(&self, scheme: &str) -> bool {
        self.transports.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Find the transport for a URL's scheme
    pub fn resolve(&self, url: &str) -> BundleResult<Arc<dyn Transport>> {
        let parsed = url::Url::parse(url)?;
        self.transports
            .get(parsed.scheme())
            .cloned()
            .ok_or_else(|| BundleError::UnsupportedScheme(parsed.scheme().to_string()))
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<&String> = self.transports.keys().collect();
        schemes.sort();
        f.debug_struct("TransportRegistry")
            .field("schemes", &schemes)
            .finish()
    }
}
