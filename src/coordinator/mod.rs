//! Resolution coordinator.
//!
//! One thread owns the [`Database`] and every piece of state that goes with
//! it: resource rows, tiles, the write-back buffer and the registry of
//! running generation jobs. Nothing else touches them.
//!
//! Work reaches the thread as closures on two bounded queues:
//!
//! ```text
//! callers ──request──┐
//!                    ├──> coordinator thread ──> Database
//! workers ──receive──┘          │
//!    ^                          └──> BlobResolver / generation on the pool
//!    └──────────────────────────────────┘
//! ```
//!
//! Each turn drains the receive queue (results from workers) before taking
//! one request, so tiles a job produced are stored before a new request can
//! look at the store's scale range.

mod generation;
mod queue;
mod reply;
mod state;

pub use queue::{Doorbell, MessageQueue};
pub use reply::Pending;

pub(crate) use reply::Responder;
pub(crate) use state::CoordinatorState;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::codec::CodecRegistry;
use crate::error::{IoError, ResourceError};
use crate::job::COORDINATOR_THREAD_NAME;
use crate::pyramid::PyramidGenerator;
use crate::resolver::BlobResolver;
use crate::store::Database;
use crate::tile::TileEncoder;

/// Default capacity of the request queue.
pub const DEFAULT_REQUEST_CAPACITY: usize = 256;

/// Default capacity of the receive queue.
pub const DEFAULT_RECEIVE_CAPACITY: usize = 256;

pub(crate) type Task = Box<dyn FnOnce(&mut CoordinatorState) + Send + 'static>;

// =============================================================================
// Services
// =============================================================================

/// Stateless collaborators shared by the coordinator and its jobs.
pub(crate) struct Services {
    pub resolver: BlobResolver,
    pub codecs: CodecRegistry,
    pub generator: PyramidGenerator,
    pub encoder: TileEncoder,
    pub stats: CoordinatorStats,
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters maintained by the coordinator.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    requests: AtomicU64,
    receives: AtomicU64,
    metadata_resolutions: AtomicU64,
    generation_jobs: AtomicU64,
    folded_requests: AtomicU64,
    tile_hits: AtomicU64,
    tiles_stored: AtomicU64,
}

/// Point-in-time copy of [`CoordinatorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Closures taken from the request queue
    pub requests: u64,
    /// Closures taken from the receive queue
    pub receives: u64,
    /// Metadata misses that went to the blob resolver
    pub metadata_resolutions: u64,
    /// Generation jobs started
    pub generation_jobs: u64,
    /// Tile requests folded into a running job
    pub folded_requests: u64,
    /// Tile requests answered from the store
    pub tile_hits: u64,
    /// Generated tiles written to the store
    pub tiles_stored: u64,
}

impl CoordinatorStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            receives: self.receives.load(Ordering::Relaxed),
            metadata_resolutions: self.metadata_resolutions.load(Ordering::Relaxed),
            generation_jobs: self.generation_jobs.load(Ordering::Relaxed),
            folded_requests: self.folded_requests.load(Ordering::Relaxed),
            tile_hits: self.tile_hits.load(Ordering::Relaxed),
            tiles_stored: self.tiles_stored.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Mailbox
// =============================================================================

struct Queues {
    requests: MessageQueue<Task>,
    receives: MessageQueue<Task>,
    doorbell: Arc<Doorbell>,
    quit: AtomicBool,
}

/// Cloneable sending side of the coordinator's queues.
#[derive(Clone)]
pub(crate) struct Mailbox {
    queues: Arc<Queues>,
}

impl Mailbox {
    fn new(request_capacity: usize, receive_capacity: usize) -> Self {
        let doorbell = Arc::new(Doorbell::new());
        Self {
            queues: Arc::new(Queues {
                requests: MessageQueue::with_doorbell(request_capacity, Arc::clone(&doorbell)),
                receives: MessageQueue::with_doorbell(receive_capacity, Arc::clone(&doorbell)),
                doorbell,
                quit: AtomicBool::new(false),
            }),
        }
    }

    /// Queue a request. Blocks while the request queue is full.
    ///
    /// # Errors
    ///
    /// [`ResourceError::Shutdown`] once the coordinator has stopped; the
    /// closure is dropped without running.
    pub fn request<F>(&self, task: F) -> Result<(), ResourceError>
    where
        F: FnOnce(&mut CoordinatorState) + Send + 'static,
    {
        self.queues
            .requests
            .wait_and_push(Box::new(task))
            .map_err(|_| ResourceError::Shutdown)
    }

    /// Queue a result from a worker. Blocks while the receive queue is full.
    pub fn receive<F>(&self, task: F) -> Result<(), ResourceError>
    where
        F: FnOnce(&mut CoordinatorState) + Send + 'static,
    {
        self.queues
            .receives
            .wait_and_push(Box::new(task))
            .map_err(|_| ResourceError::Shutdown)
    }

    fn is_stopping(&self) -> bool {
        self.queues.quit.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.queues.quit.store(true, Ordering::Release);
        self.queues.requests.wakeup();
        self.queues.receives.wakeup();
        self.queues.doorbell.ring();
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Handle to the running coordinator thread.
pub(crate) struct Coordinator {
    mailbox: Mailbox,
    services: Arc<Services>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Move `db` onto a new coordinator thread and start serving.
    pub fn start(
        db: Database,
        services: Arc<Services>,
        request_capacity: usize,
        receive_capacity: usize,
    ) -> Result<Self, ResourceError> {
        let mailbox = Mailbox::new(request_capacity, receive_capacity);
        let state = CoordinatorState::new(db, Arc::clone(&services), mailbox.clone());
        let run_mailbox = mailbox.clone();

        let thread = std::thread::Builder::new()
            .name(COORDINATOR_THREAD_NAME.to_string())
            .spawn(move || run(state, run_mailbox))
            .map_err(|e| IoError::Connection(format!("failed to start coordinator: {}", e)))?;

        info!(request_capacity, receive_capacity, "coordinator started");
        Ok(Self {
            mailbox,
            services,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.services.stats.snapshot()
    }

    /// Stop taking work, fail whatever is still outstanding, flush the
    /// store and join the thread. Safe to call more than once.
    pub fn stop(&self) {
        self.mailbox.stop();
        let thread = self.thread.lock().ok().and_then(|mut t| t.take());
        let Some(thread) = thread else {
            return;
        };
        if std::thread::current().name() == Some(COORDINATOR_THREAD_NAME) {
            return;
        }
        if thread.join().is_err() {
            error!("coordinator thread panicked");
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(mut state: CoordinatorState, mailbox: Mailbox) {
    let queues = Arc::clone(&mailbox.queues);
    let services = Arc::clone(state.services());

    while !mailbox.is_stopping() {
        while let Some(task) = queues.receives.try_pop() {
            CoordinatorStats::bump(&services.stats.receives);
            execute(&mut state, task);
            if mailbox.is_stopping() {
                break;
            }
        }
        if mailbox.is_stopping() {
            break;
        }
        if let Some(task) = queues.requests.try_pop() {
            CoordinatorStats::bump(&services.stats.requests);
            execute(&mut state, task);
            continue;
        }
        queues.doorbell.wait();
    }

    // Anything still queued is dropped; its responders report Shutdown.
    let mut dropped = 0;
    while let Some(task) = queues.receives.try_pop().or_else(|| queues.requests.try_pop()) {
        drop(task);
        dropped += 1;
    }
    debug!(dropped, "coordinator queues drained");

    state.shutdown();
    info!("coordinator stopped");
}

fn execute(state: &mut CoordinatorState, task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(|| task(state))).is_err() {
        error!("coordinator task panicked");
    }
}
