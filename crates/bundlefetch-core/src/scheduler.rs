//! Operation scheduler - time-sliced, non-preemptive executor
//!
//! Each tick merges newly admitted operations into the live set, then makes
//! passes over the live set, stepping every operation once per pass, until
//! the wall-clock slice is used up. The first pass always runs in full, so a
//! zero budget still gives every live operation one step per tick. Later
//! passes check the budget before each step and stop mid-pass once it is
//! spent; operations not reached wait for the next tick. A single step that
//! overruns the slice is not interrupted.
//!
//! Terminal operations are removed and notified after the pass that
//! observed them, never while the live set is being iterated.

use crate::cache::CacheSystem;
use crate::engine::DownloadOrchestrator;
use crate::operation::{AsyncOperation, OperationContext, OperationHandle, Steppable};
use bundlefetch_types::{CoreEvent, Settings};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Borrowed services handed to operations by the owning runtime
pub struct Services<'a> {
    pub cache: &'a mut CacheSystem,
    pub downloads: &'a mut DownloadOrchestrator,
    pub settings: &'a Settings,
    pub events: &'a broadcast::Sender<CoreEvent>,
}

/// Owns the live set of async operations
pub struct OperationScheduler {
    /// Operations stepped every pass
    live: Vec<Arc<dyn Steppable>>,
    /// Submitted since the last tick; merged before stepping
    admissions: Vec<Arc<dyn Steppable>>,
    /// Wall-clock budget for one tick
    time_slice: Duration,
}

impl OperationScheduler {
    pub fn new(time_slice: Duration) -> Self {
        Self {
            live: Vec::new(),
            admissions: Vec::new(),
            time_slice,
        }
    }

    pub fn time_slice(&self) -> Duration {
        self.time_slice
    }

    /// Number of operations not yet removed (live plus pending admission)
    pub fn len(&self) -> usize {
        self.live.len() + self.admissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start `op` now and schedule it for stepping from the next tick.
    pub fn submit<O: AsyncOperation>(&mut self, op: O, services: Services<'_>) -> OperationHandle<O> {
        let handle = OperationHandle::new(op);
        let cell = handle.steppable();
        {
            let mut ctx = OperationContext::new(
                services.cache,
                services.downloads,
                services.settings,
                services.events,
                &mut self.admissions,
                None,
            );
            cell.start(&mut ctx);
        }
        debug!(id = %cell.id(), op = cell.name(), "operation submitted");
        self.admissions.push(cell);
        handle
    }

    /// Run one budgeted tick.
    pub fn tick(&mut self, services: Services<'_>) {
        self.live.append(&mut self.admissions);
        if self.live.is_empty() {
            return;
        }

        let started = Instant::now();
        let deadline = started + self.time_slice;
        let Services {
            cache,
            downloads,
            settings,
            events,
        } = services;

        let mut passes = 0u32;
        let mut steps = 0usize;
        loop {
            let budgeted = passes > 0;
            passes += 1;
            {
                let mut ctx = OperationContext::new(
                    &mut *cache,
                    &mut *downloads,
                    settings,
                    events,
                    &mut self.admissions,
                    Some(deadline),
                );
                for op in &self.live {
                    if budgeted && Instant::now() >= deadline {
                        break;
                    }
                    op.step(&mut ctx);
                    steps += 1;
                }
            }
            self.remove_finished();

            if self.live.is_empty() || Instant::now() >= deadline {
                break;
            }
        }

        trace!(
            passes,
            steps,
            live = self.live.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "scheduler tick"
        );
    }

    /// One unbudgeted pass over every operation, used by forced waits.
    pub(crate) fn run_pass(&mut self, services: Services<'_>) {
        self.live.append(&mut self.admissions);
        {
            let mut ctx = OperationContext::new(
                services.cache,
                services.downloads,
                services.settings,
                services.events,
                &mut self.admissions,
                None,
            );
            for op in &self.live {
                op.step(&mut ctx);
            }
        }
        self.remove_finished();
    }

    fn remove_finished(&mut self) {
        self.live.retain(|op| {
            if op.is_terminal() {
                op.notify();
                false
            } else {
                true
            }
        });
    }

    /// Drop every operation without firing completions (process teardown).
    pub fn shutdown(&mut self) {
        let abandoned = self.len();
        self.live.clear();
        self.admissions.clear();
        if abandoned > 0 {
            debug!(abandoned, "scheduler shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TransportRegistry;
    use crate::operation::StepResult;
    use bundlefetch_types::OperationStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        cache: CacheSystem,
        downloads: DownloadOrchestrator,
        settings: Settings,
        events: broadcast::Sender<CoreEvent>,
    }

    impl Harness {
        fn new() -> (Self, tempfile::TempDir) {
            let dir = tempfile::tempdir().unwrap();
            let settings = Settings {
                cache_root: dir.path().to_path_buf(),
                ..Settings::default()
            };
            let (events, _) = broadcast::channel(16);
            let harness = Self {
                cache: CacheSystem::new(dir.path()),
                downloads: DownloadOrchestrator::new(TransportRegistry::new(), events.clone()),
                settings,
                events,
            };
            (harness, dir)
        }

        fn services(&mut self) -> Services<'_> {
            Services {
                cache: &mut self.cache,
                downloads: &mut self.downloads,
                settings: &self.settings,
                events: &self.events,
            }
        }
    }

    /// Completes on its first step
    struct Trivial {
        steps: Arc<AtomicUsize>,
    }

    impl AsyncOperation for Trivial {
        fn step(&mut self, _ctx: &mut OperationContext<'_>) -> StepResult {
            self.steps.fetch_add(1, Ordering::SeqCst);
            StepResult::Succeeded
        }
    }

    /// Never finishes
    struct Forever {
        steps: Arc<AtomicUsize>,
    }

    impl AsyncOperation for Forever {
        fn step(&mut self, _ctx: &mut OperationContext<'_>) -> StepResult {
            self.steps.fetch_add(1, Ordering::SeqCst);
            StepResult::Running
        }
    }

    /// Submits a child from inside its first step
    struct Parent {
        child: Option<OperationHandle<Trivial>>,
        child_steps: Arc<AtomicUsize>,
    }

    impl AsyncOperation for Parent {
        fn step(&mut self, ctx: &mut OperationContext<'_>) -> StepResult {
            match &self.child {
                None => {
                    let steps = self.child_steps.clone();
                    self.child = Some(ctx.submit(Trivial { steps }));
                    StepResult::Running
                }
                Some(child) if child.is_done() => StepResult::Succeeded,
                Some(_) => StepResult::Running,
            }
        }
    }

    #[test]
    fn test_zero_budget_still_steps_every_operation_once() {
        let (mut h, _dir) = Harness::new();
        let mut scheduler = OperationScheduler::new(Duration::ZERO);
        let steps = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..1000)
            .map(|_| {
                scheduler.submit(
                    Trivial {
                        steps: steps.clone(),
                    },
                    h.services(),
                )
            })
            .collect();

        scheduler.tick(h.services());

        assert_eq!(steps.load(Ordering::SeqCst), 1000);
        assert!(handles.iter().all(|h| h.status() == OperationStatus::Succeeded));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_submit_starts_immediately_but_steps_on_next_tick() {
        let (mut h, _dir) = Harness::new();
        let mut scheduler = OperationScheduler::new(Duration::ZERO);
        let steps = Arc::new(AtomicUsize::new(0));

        let handle = scheduler.submit(
            Trivial {
                steps: steps.clone(),
            },
            h.services(),
        );
        assert_eq!(handle.status(), OperationStatus::Running);
        assert_eq!(steps.load(Ordering::SeqCst), 0);

        scheduler.tick(h.services());
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(handle.progress(), 1.0);
    }

    #[test]
    fn test_budget_allows_multiple_passes() {
        let (mut h, _dir) = Harness::new();
        let mut scheduler = OperationScheduler::new(Duration::from_millis(5));
        let steps = Arc::new(AtomicUsize::new(0));
        scheduler.submit(
            Forever {
                steps: steps.clone(),
            },
            h.services(),
        );

        scheduler.tick(h.services());
        assert!(steps.load(Ordering::SeqCst) > 1);
        assert_eq!(scheduler.len(), 1);
    }

    /// Sleeps for a fixed time on every step and never finishes
    struct Slow {
        steps: Arc<AtomicUsize>,
        per_step: Duration,
    }

    impl AsyncOperation for Slow {
        fn step(&mut self, _ctx: &mut OperationContext<'_>) -> StepResult {
            std::thread::sleep(self.per_step);
            self.steps.fetch_add(1, Ordering::SeqCst);
            StepResult::Running
        }
    }

    #[test]
    fn test_spent_budget_stops_tick_mid_pass() {
        let (mut h, _dir) = Harness::new();
        let mut scheduler = OperationScheduler::new(Duration::from_millis(35));
        let steps = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            scheduler.submit(
                Slow {
                    steps: steps.clone(),
                    per_step: Duration::from_millis(10),
                },
                h.services(),
            );
        }

        scheduler.tick(h.services());

        // First pass runs in full, the second stops once the slice is spent
        let taken = steps.load(Ordering::SeqCst);
        assert!((3..=4).contains(&taken), "stepped {} times", taken);
        assert_eq!(scheduler.len(), 3);
    }

    #[test]
    fn test_child_submitted_during_step_joins_next_tick() {
        let (mut h, _dir) = Harness::new();
        let mut scheduler = OperationScheduler::new(Duration::ZERO);
        let child_steps = Arc::new(AtomicUsize::new(0));
        let parent = scheduler.submit(
            Parent {
                child: None,
                child_steps: child_steps.clone(),
            },
            h.services(),
        );

        scheduler.tick(h.services());
        assert_eq!(child_steps.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.len(), 2);

        scheduler.tick(h.services());
        assert_eq!(child_steps.load(Ordering::SeqCst), 1);

        scheduler.tick(h.services());
        assert_eq!(parent.status(), OperationStatus::Succeeded);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_cancelled_operation_is_removed_and_notified() {
        let (mut h, _dir) = Harness::new();
        let mut scheduler = OperationScheduler::new(Duration::ZERO);
        let steps = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.submit(
            Forever {
                steps: steps.clone(),
            },
            h.services(),
        );
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        handle.on_completed(move |report| {
            assert_eq!(report.status, OperationStatus::Failed);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.tick(h.services());
        handle.cancel();
        scheduler.tick(h.services());

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_shutdown_abandons_without_completions() {
        let (mut h, _dir) = Harness::new();
        let mut scheduler = OperationScheduler::new(Duration::ZERO);
        let handle = scheduler.submit(
            Forever {
                steps: Arc::new(AtomicUsize::new(0)),
            },
            h.services(),
        );
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        handle.on_completed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.tick(h.services());
        scheduler.shutdown();

        assert!(scheduler.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(handle.status(), OperationStatus::Running);
    }
}
