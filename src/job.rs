//! Job handles: shared cancellation and completion state for one request.
//!
//! A handle is held by the caller and by whoever is producing the result.
//! The state only ever moves forward, and exactly one terminal state
//! (finished, failed or aborted) is ever set.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Name of the coordinator thread. Waiting on a job from it would deadlock.
pub(crate) const COORDINATOR_THREAD_NAME: &str = "pyramid-coordinator";

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Running,
    Finished,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Finished | JobState::Failed | JobState::Aborted
        )
    }
}

struct Inner {
    id: u64,
    state: Mutex<JobState>,
    changed: Condvar,
}

/// Cloneable handle to a job's state.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<Inner>,
}

impl JobHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(JobState::Pending),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        // The state is a plain enum, so a poisoned lock still holds a valid value.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> JobState {
        *self.lock()
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == JobState::Aborted
    }

    pub fn is_finished(&self) -> bool {
        self.state() == JobState::Finished
    }

    pub fn is_failed(&self) -> bool {
        self.state() == JobState::Failed
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    fn transition(&self, allowed: impl Fn(JobState) -> bool, next: JobState) -> bool {
        let mut state = self.lock();
        if !allowed(*state) {
            return false;
        }
        *state = next;
        drop(state);
        self.inner.changed.notify_all();
        true
    }

    /// Pending -> Running. Returns false if the job already left Pending.
    pub fn start(&self) -> bool {
        self.transition(|s| s == JobState::Pending, JobState::Running)
    }

    /// Request cancellation. Returns false if the job already terminated.
    pub fn abort(&self) -> bool {
        self.transition(|s| !s.is_terminal(), JobState::Aborted)
    }

    /// Mark the job finished. Returns false if it already terminated.
    pub fn finish(&self) -> bool {
        self.transition(|s| !s.is_terminal(), JobState::Finished)
    }

    /// Mark the job failed. Returns false if it already terminated.
    pub fn fail(&self) -> bool {
        self.transition(|s| !s.is_terminal(), JobState::Failed)
    }

    /// Block until the job reaches a terminal state.
    ///
    /// Must not be called from the coordinator thread.
    pub fn wait(&self) -> JobState {
        debug_assert_ne!(
            std::thread::current().name(),
            Some(COORDINATOR_THREAD_NAME),
            "JobHandle::wait called on the coordinator thread"
        );
        let mut state = self.lock();
        while !state.is_terminal() {
            state = self
                .inner
                .changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *state
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<JobState> {
        let state = self.lock();
        let (state, _) = self
            .inner
            .changed
            .wait_timeout_while(state, timeout, |s| !s.is_terminal())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.is_terminal().then_some(*state)
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for JobHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for JobHandle {}
