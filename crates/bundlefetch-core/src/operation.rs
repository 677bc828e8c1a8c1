//! Async operations - cooperative units of work driven by the scheduler
//!
//! An operation is an explicit state machine: every suspension point is a
//! named state and [`AsyncOperation::step`] advances it by one increment.
//! Callers hold an [`OperationHandle`] to observe status and progress,
//! attach completion callbacks, or cancel.
//!
//! Status rules enforced here (not by individual operations):
//! - `Succeeded`/`Failed` are final; later step results are discarded.
//! - Progress never decreases while running and is forced to 1.0 when
//!   completion callbacks fire.
//! - Completion callbacks fire exactly once; a callback attached after
//!   that point runs immediately on the attaching thread.

use crate::cache::CacheSystem;
use crate::engine::DownloadOrchestrator;
use crate::error::BundleError;
use bundlefetch_types::{CoreEvent, OperationStatus, Settings};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Result of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Running,
    Succeeded,
    Failed(String),
}

/// A unit of cooperative work
pub trait AsyncOperation: Send + 'static {
    /// Called once, synchronously, when the operation is submitted.
    fn start(&mut self, _ctx: &mut OperationContext<'_>) {}

    /// Advance by one increment.
    fn step(&mut self, ctx: &mut OperationContext<'_>) -> StepResult;

    /// Progress in [0, 1]
    fn progress(&self) -> f32 {
        0.0
    }

    /// Release resources after a cancel. Not called for normal completion.
    fn abort(&mut self) {}
}

/// Services available to an operation while it is being started or stepped
pub struct OperationContext<'a> {
    pub cache: &'a mut CacheSystem,
    pub downloads: &'a mut DownloadOrchestrator,
    pub settings: &'a Settings,
    pub events: &'a broadcast::Sender<CoreEvent>,
    admissions: &'a mut Vec<Arc<dyn Steppable>>,
    deadline: Option<Instant>,
}

impl<'a> OperationContext<'a> {
    pub(crate) fn new(
        cache: &'a mut CacheSystem,
        downloads: &'a mut DownloadOrchestrator,
        settings: &'a Settings,
        events: &'a broadcast::Sender<CoreEvent>,
        admissions: &'a mut Vec<Arc<dyn Steppable>>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            cache,
            downloads,
            settings,
            events,
            admissions,
            deadline,
        }
    }

    /// Submit a child operation from inside a step.
    ///
    /// The child is started now and joins the live set on the next tick.
    pub fn submit<O: AsyncOperation>(&mut self, op: O) -> OperationHandle<O> {
        let handle = OperationHandle::new(op);
        let cell = handle.steppable();
        cell.start(self);
        self.admissions.push(cell);
        handle
    }

    /// True once the current tick's time slice is used up.
    ///
    /// Operations doing several increments in one step should stop early
    /// when this turns true. Always false for forced synchronous waits.
    pub fn is_busy(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Broadcast an event; having no subscribers is fine.
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.events.send(event);
    }
}

/// Snapshot handed to completion callbacks
#[derive(Debug, Clone)]
pub struct OperationReport {
    pub id: Uuid,
    pub status: OperationStatus,
    pub error: Option<String>,
}

/// Token for detaching a completion callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type CompletionCallback = Box<dyn FnOnce(&OperationReport) + Send + 'static>;

struct OperationCore {
    status: OperationStatus,
    progress: f32,
    error: Option<String>,
    callbacks: Vec<(CallbackId, CompletionCallback)>,
    next_callback: u64,
    notified: bool,
}

struct OperationCell<O> {
    id: Uuid,
    name: &'static str,
    core: Mutex<OperationCore>,
    op: Mutex<O>,
}

impl<O> OperationCell<O> {
    fn report(&self, core: &OperationCore) -> OperationReport {
        OperationReport {
            id: self.id,
            status: core.status,
            error: core.error.clone(),
        }
    }
}

/// Type-erased view the scheduler works with
pub(crate) trait Steppable: Send + Sync {
    fn id(&self) -> Uuid;
    fn name(&self) -> &'static str;
    fn start(&self, ctx: &mut OperationContext<'_>);
    /// Step once; true if the operation is terminal afterwards.
    fn step(&self, ctx: &mut OperationContext<'_>) -> bool;
    fn is_terminal(&self) -> bool;
    /// Force progress to 1.0 and fire completion callbacks (once).
    fn notify(&self);
}

impl<O: AsyncOperation> Steppable for OperationCell<O> {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn start(&self, ctx: &mut OperationContext<'_>) {
        {
            let mut core = self.core.lock();
            if core.status != OperationStatus::NotStarted {
                return;
            }
            core.status = OperationStatus::Running;
        }
        debug!(id = %self.id, op = self.name, "operation started");
        self.op.lock().start(ctx);
    }

    fn step(&self, ctx: &mut OperationContext<'_>) -> bool {
        if self.core.lock().status.is_terminal() {
            return true;
        }

        let (result, progress) = {
            let mut op = self.op.lock();
            let result = op.step(ctx);
            (result, op.progress())
        };

        let mut core = self.core.lock();
        if core.status.is_terminal() {
            // Cancelled while stepping
            return true;
        }
        core.progress = core.progress.max(progress.clamp(0.0, 1.0));
        match result {
            StepResult::Running => false,
            StepResult::Succeeded => {
                core.status = OperationStatus::Succeeded;
                true
            }
            StepResult::Failed(message) => {
                core.status = OperationStatus::Failed;
                core.error = Some(message);
                true
            }
        }
    }

    fn is_terminal(&self) -> bool {
        self.core.lock().status.is_terminal()
    }

    fn notify(&self) {
        let (callbacks, report) = {
            let mut core = self.core.lock();
            if core.notified {
                return;
            }
            core.notified = true;
            core.progress = 1.0;
            (std::mem::take(&mut core.callbacks), self.report(&core))
        };
        debug!(id = %self.id, op = self.name, status = ?report.status, "operation completed");
        for (_, callback) in callbacks {
            callback(&report);
        }
    }
}

/// Caller-side handle to a submitted (or not yet submitted) operation
pub struct OperationHandle<O> {
    cell: Arc<OperationCell<O>>,
}

impl<O> Clone for OperationHandle<O> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<O> std::fmt::Debug for OperationHandle<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.cell.core.lock();
        f.debug_struct("OperationHandle")
            .field("id", &self.cell.id)
            .field("op", &self.cell.name)
            .field("status", &core.status)
            .field("progress", &core.progress)
            .finish()
    }
}

impl<O: AsyncOperation> OperationHandle<O> {
    pub(crate) fn new(op: O) -> Self {
        Self {
            cell: Arc::new(OperationCell {
                id: Uuid::new_v4(),
                name: std::any::type_name::<O>(),
                core: Mutex::new(OperationCore {
                    status: OperationStatus::NotStarted,
                    progress: 0.0,
                    error: None,
                    callbacks: Vec::new(),
                    next_callback: 0,
                    notified: false,
                }),
                op: Mutex::new(op),
            }),
        }
    }

    pub(crate) fn steppable(&self) -> Arc<dyn Steppable> {
        self.cell.clone()
    }

    pub fn id(&self) -> Uuid {
        self.cell.id
    }

    pub fn status(&self) -> OperationStatus {
        self.cell.core.lock().status
    }

    pub fn progress(&self) -> f32 {
        self.cell.core.lock().progress
    }

    pub fn error(&self) -> Option<String> {
        self.cell.core.lock().error.clone()
    }

    /// True once the operation reached `Succeeded` or `Failed`
    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    /// Attach a completion callback.
    ///
    /// If completion has already been reported the callback runs now.
    pub fn on_completed<F>(&self, callback: F) -> CallbackId
    where
        F: FnOnce(&OperationReport) + Send + 'static,
    {
        let mut core = self.cell.core.lock();
        let id = CallbackId(core.next_callback);
        core.next_callback += 1;
        if core.notified {
            let report = self.cell.report(&core);
            drop(core);
            callback(&report);
        } else {
            core.callbacks.push((id, Box::new(callback)));
        }
        id
    }

    /// Detach a completion callback; false if it already ran or was unknown.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut core = self.cell.core.lock();
        let before = core.callbacks.len();
        core.callbacks.retain(|(cb, _)| *cb != id);
        core.callbacks.len() != before
    }

    /// Mark the operation failed with a "user cancelled" error.
    ///
    /// No-op once the operation is terminal.
    pub fn cancel(&self) {
        {
            let mut core = self.cell.core.lock();
            if core.status.is_terminal() {
                return;
            }
            core.status = OperationStatus::Failed;
            core.error = Some(BundleError::Cancelled.to_string());
        }
        debug!(id = %self.cell.id, op = self.cell.name, "operation cancelled");
        // Busy means we are inside this operation's own step; the step
        // result is discarded anyway.
        if let Some(mut op) = self.cell.op.try_lock() {
            op.abort();
        }
    }

    /// Read the operation's own state (results, counters).
    pub fn with<R>(&self, f: impl FnOnce(&O) -> R) -> R {
        f(&*self.cell.op.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Countdown {
        remaining: u32,
        total: u32,
        aborted: bool,
    }

    impl Countdown {
        fn new(steps: u32) -> Self {
            Self {
                remaining: steps,
                total: steps,
                aborted: false,
            }
        }
    }

    impl AsyncOperation for Countdown {
        fn step(&mut self, _ctx: &mut OperationContext<'_>) -> StepResult {
            if self.remaining == 0 {
                return StepResult::Succeeded;
            }
            self.remaining -= 1;
            StepResult::Running
        }

        fn progress(&self) -> f32 {
            1.0 - self.remaining as f32 / self.total as f32
        }

        fn abort(&mut self) {
            self.aborted = true;
        }
    }

    #[test]
    fn test_new_handle_is_not_started() {
        let handle = OperationHandle::new(Countdown::new(2));
        assert_eq!(handle.status(), OperationStatus::NotStarted);
        assert_eq!(handle.progress(), 0.0);
        assert!(handle.error().is_none());
    }

    #[test]
    fn test_cancel_is_idempotent_and_aborts() {
        let handle = OperationHandle::new(Countdown::new(2));
        handle.cancel();
        handle.cancel();
        assert_eq!(handle.status(), OperationStatus::Failed);
        assert_eq!(handle.error().as_deref(), Some("user cancelled"));
        assert!(handle.with(|op| op.aborted));
    }

    #[test]
    fn test_callbacks_fire_once_and_late_callbacks_run_immediately() {
        let handle = OperationHandle::new(Countdown::new(1));
        let hits = Arc::new(AtomicUsize::new(0));

        let early = hits.clone();
        handle.on_completed(move |report| {
            assert_eq!(report.status, OperationStatus::Failed);
            early.fetch_add(1, Ordering::SeqCst);
        });

        handle.cancel();
        let cell = handle.steppable();
        cell.notify();
        cell.notify();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(handle.progress(), 1.0);

        let late = hits.clone();
        handle.on_completed(move |_| {
            late.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_removed_callback_does_not_fire() {
        let handle = OperationHandle::new(Countdown::new(1));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = handle.on_completed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handle.remove_callback(id));
        assert!(!handle.remove_callback(id));
        handle.cancel();
        handle.steppable().notify();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
