//! Callback funnel from worker contexts to the owning stream
//!
//! Transport workers never touch owner-visible state directly. They post a
//! closure through a [`Dispatcher`]; the runtime drains the [`CallbackQueue`]
//! at the start of each tick, before any operation is stepped.

use tokio::sync::mpsc;
use tracing::debug;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable sending side, safe to move onto worker threads
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Callback>,
}

impl Dispatcher {
    /// Queue a callback for the owning stream.
    ///
    /// Returns false if the queue has been dropped (runtime torn down).
    pub fn post<F>(&self, callback: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Box::new(callback)).is_ok()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

/// Single-consumer receiving side, owned by the runtime
pub struct CallbackQueue {
    rx: mpsc::UnboundedReceiver<Callback>,
}

impl CallbackQueue {
    /// Run every callback queued so far; returns how many ran.
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while let Ok(callback) = self.rx.try_recv() {
            callback();
            count += 1;
        }
        if count > 0 {
            debug!(count, "drained worker callbacks");
        }
        count
    }
}

/// Create a connected dispatcher/queue pair
pub fn callback_queue() -> (Dispatcher, CallbackQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Dispatcher { tx }, CallbackQueue { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_callbacks_run_only_when_drained() {
        let (dispatcher, mut queue) = callback_queue();
        let hits = Arc::new(AtomicUsize::new(0));

        let worker_hits = hits.clone();
        let worker_dispatcher = dispatcher.clone();
        std::thread::spawn(move || {
            for _ in 0..3 {
                let hits = worker_hits.clone();
                worker_dispatcher.post(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                });
            }
        })
        .join()
        .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(queue.drain(), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(queue.drain(), 0);
    }

    #[test]
    fn test_post_after_queue_dropped() {
        let (dispatcher, queue) = callback_queue();
        drop(queue);
        assert!(!dispatcher.post(|| {}));
    }
}
