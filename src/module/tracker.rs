//! Background work tracking for modules
//!
//! Every task a module starts is registered here so that unload can stop
//! new work and wait for the rest before `on_unload`.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Tracks the background work a module started.
///
/// Once draining, `spawn` and `run` refuse new work and drop it without
/// running it. Work already in the set runs to completion.
#[derive(Clone)]
pub struct WorkTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    state: Mutex<TrackerState>,
    in_flight: watch::Sender<usize>,
}

#[derive(Default)]
struct TrackerState {
    draining: bool,
    next_id: u64,
    running: HashSet<u64>,
}

/// Membership of one work item; leaving the set happens on drop so that
/// panicking or aborted tasks are released too.
struct WorkGuard {
    inner: Arc<TrackerInner>,
    id: u64,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        state.running.remove(&self.id);
        self.inner.in_flight.send_replace(state.running.len());
    }
}

impl TrackerInner {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorkTracker {
    /// Empty tracker accepting work.
    #[must_use]
    pub fn new() -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            inner: Arc::new(TrackerInner {
                state: Mutex::new(TrackerState::default()),
                in_flight,
            }),
        }
    }

    fn enter(&self) -> Option<WorkGuard> {
        let mut state = self.inner.lock();
        if state.draining {
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.running.insert(id);
        self.inner.in_flight.send_replace(state.running.len());
        Some(WorkGuard {
            inner: Arc::clone(&self.inner),
            id,
        })
    }

    /// Spawn tracked asynchronous work on the current runtime.
    ///
    /// Returns `None` (and never polls `work`) when draining.
    pub fn spawn<F>(&self, work: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = self.enter()?;
        Some(tokio::spawn(async move {
            let _guard = guard;
            work.await
        }))
    }

    /// Run tracked synchronous work inline.
    pub fn run<R>(&self, work: impl FnOnce() -> R) -> Option<R> {
        let _guard = self.enter()?;
        Some(work())
    }

    /// Stop accepting new work. Idempotent.
    pub fn begin_draining(&self) {
        self.inner.lock().draining = true;
    }

    /// Whether new work is being refused.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.inner.lock().draining
    }

    /// Number of tracked work items still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.lock().running.len()
    }

    /// Resolves once no tracked work is running.
    pub async fn all_work_complete(&self) {
        let mut rx = self.inner.in_flight.subscribe();
        // The sender lives in `self.inner`, so the channel cannot close here.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for WorkTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("WorkTracker")
            .field("draining", &state.draining)
            .field("in_flight", &state.running.len())
            .finish()
    }
}
