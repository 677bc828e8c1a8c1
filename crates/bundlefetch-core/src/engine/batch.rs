//! Download batch - waits on a set of downloads as one async operation

use crate::engine::downloader::DownloadHandle;
use crate::operation::{AsyncOperation, OperationContext, StepResult};
use bundlefetch_types::{BundleDescriptor, DownloadStatus};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Downloads in flight at once
    pub concurrency: usize,
    pub retries: u32,
    /// Stall window per download; `None` uses the configured default
    pub timeout: Option<Duration>,
    /// Fail the batch (and abort what is running) on the first failure
    pub fail_fast: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retries: 3,
            timeout: None,
            fail_fast: false,
        }
    }
}

pub struct DownloadBatchOperation {
    options: BatchOptions,
    queued: VecDeque<BundleDescriptor>,
    active: Vec<(u64, DownloadHandle)>,
    total_bytes: u64,
    completed_bytes: u64,
    succeeded: Vec<String>,
    failed: Vec<(String, String)>,
}

impl DownloadBatchOperation {
    pub fn new(descriptors: Vec<BundleDescriptor>, options: BatchOptions) -> Self {
        Self {
            total_bytes: descriptors.iter().map(|d| d.size).sum(),
            queued: descriptors.into(),
            options,
            active: Vec::new(),
            completed_bytes: 0,
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> &[String] {
        &self.succeeded
    }

    /// (key, message) for each failed download
    pub fn failed(&self) -> &[(String, String)] {
        &self.failed
    }

    /// Handles currently in flight
    pub fn active(&self) -> Vec<DownloadHandle> {
        self.active.iter().map(|(_, h)| h.clone()).collect()
    }

    fn abort_active(&mut self) {
        for (_, handle) in self.active.drain(..) {
            handle.abort();
        }
    }
}

impl AsyncOperation for DownloadBatchOperation {
    fn step(&mut self, ctx: &mut OperationContext<'_>) -> StepResult {
        while self.active.len() < self.options.concurrency.max(1) {
            let Some(descriptor) = self.queued.pop_front() else {
                break;
            };
            let key = descriptor.key.clone();
            let size = descriptor.size;
            match ctx.downloads.begin_download(
                ctx.cache,
                ctx.settings,
                descriptor,
                self.options.retries,
                self.options.timeout,
            ) {
                Ok(handle) => self.active.push((size, handle)),
                Err(e) => {
                    warn!(%key, error = %e, "download could not be started");
                    self.completed_bytes += size;
                    self.failed.push((key, e.to_string()));
                }
            }
        }

        let mut still_active = Vec::with_capacity(self.active.len());
        for (size, handle) in self.active.drain(..) {
            match handle.status() {
                DownloadStatus::Ongoing { .. } => still_active.push((size, handle)),
                DownloadStatus::Succeeded => {
                    self.completed_bytes += size;
                    self.succeeded.push(handle.key().to_string());
                }
                DownloadStatus::Failed { message } => {
                    self.completed_bytes += size;
                    self.failed.push((handle.key().to_string(), message));
                }
            }
        }
        self.active = still_active;

        if self.options.fail_fast {
            if let Some((key, message)) = self.failed.first() {
                let message = format!("{}: {}", key, message);
                self.abort_active();
                self.queued.clear();
                return StepResult::Failed(message);
            }
        }

        if !self.active.is_empty() || !self.queued.is_empty() {
            return StepResult::Running;
        }

        debug!(
            succeeded = self.succeeded.len(),
            failed = self.failed.len(),
            "download batch finished"
        );
        if self.failed.is_empty() {
            StepResult::Succeeded
        } else {
            StepResult::Failed(format!(
                "{} of {} downloads failed",
                self.failed.len(),
                self.failed.len() + self.succeeded.len()
            ))
        }
    }

    fn progress(&self) -> f32 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let in_flight: f64 = self
            .active
            .iter()
            .map(|(size, handle)| *size as f64 * handle.progress() as f64)
            .sum();
        ((self.completed_bytes as f64 + in_flight) / self.total_bytes as f64).min(1.0) as f32
    }

    fn abort(&mut self) {
        self.queued.clear();
        self.abort_active();
    }
}
