use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::error;

use crate::error::{IoError, ResourceError};

const WORKER_THREAD_NAME: &str = "pyramid-worker";

/// Owner of the worker pool's threads.
///
/// Dropping it shuts the pool down without waiting for queued work, which
/// is safe from inside another runtime.
pub struct WorkerRuntime {
    runtime: Option<Runtime>,
    pool: WorkerPool,
}

impl WorkerRuntime {
    /// Start a pool running at most `threads` tasks at once.
    pub fn new(threads: usize) -> Result<Self, IoError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name(WORKER_THREAD_NAME)
            .enable_all()
            .build()
            .map_err(|e| IoError::Connection(format!("failed to start worker pool: {}", e)))?;
        let pool = WorkerPool {
            handle: runtime.handle().clone(),
            threads: threads.max(1),
        };
        Ok(Self {
            runtime: Some(runtime),
            pool,
        })
    }

    pub fn pool(&self) -> WorkerPool {
        self.pool.clone()
    }
}

impl Drop for WorkerRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Cloneable handle for scheduling blocking work on the pool.
#[derive(Clone)]
pub struct WorkerPool {
    handle: Handle,
    threads: usize,
}

impl WorkerPool {
    /// Run `task` on a pool thread.
    ///
    /// A panicking task is logged and does not take the pool down.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let join = self.handle.spawn_blocking(task);
        self.handle.spawn(async move {
            if let Err(e) = join.await {
                if e.is_panic() {
                    error!("worker task panicked: {}", e);
                }
            }
        });
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

/// Run `task`, turning a panic into a [`ResourceError::Handler`] for
/// `handler`.
///
/// Pool callbacks wrap their fallible work in this so a panic still
/// produces a result for whoever is waiting on it.
pub fn catch_panic<T>(
    handler: &str,
    task: impl FnOnce() -> Result<T, ResourceError>,
) -> Result<T, ResourceError> {
    panic::catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|payload| {
        let message = panic_message(&*payload);
        error!(handler, "worker task panicked: {}", message);
        Err(ResourceError::handler(handler, format!("panicked: {}", message)))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads())
            .finish()
    }
}
