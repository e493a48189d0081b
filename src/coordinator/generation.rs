//! Tile generation jobs.
//!
//! A job decodes one image and emits the tiles of a range of scales. The
//! coordinator keeps at most one job per locator and folds later requests
//! into it when the job will still produce the tile they want. Tiles travel
//! back through the receive queue one by one; the final outcome travels
//! back through the request queue, after every tile it produced.

use std::cell::RefCell;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::reply::Responder;
use super::{Mailbox, Services};
use crate::codec::IMAGE_HANDLER_TYPE;
use crate::error::{DecodeError, ResourceError};
use crate::io::catch_panic;
use crate::job::JobHandle;
use crate::pyramid::{GenerationOutcome, ScaleRange};
use crate::resource::ResourceMetadata;
use crate::tile::{TileEntry, TilePos};

// =============================================================================
// Waiters
// =============================================================================

/// A request parked on a generation job.
#[derive(Debug)]
pub(crate) enum Waiter {
    Tile {
        scale: u32,
        pos: TilePos,
        responder: Responder<TileEntry>,
    },
    Scales {
        range: ScaleRange,
        responder: Responder<usize>,
    },
}

impl Waiter {
    pub fn handle(&self) -> &JobHandle {
        match self {
            Waiter::Tile { responder, .. } => responder.handle(),
            Waiter::Scales { responder, .. } => responder.handle(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        match self {
            Waiter::Tile { responder, .. } => responder.is_aborted(),
            Waiter::Scales { responder, .. } => responder.is_aborted(),
        }
    }

    /// Scales this waiter needs from a job.
    pub fn range(&self) -> ScaleRange {
        match self {
            Waiter::Tile { scale, .. } => ScaleRange::single(*scale),
            Waiter::Scales { range, .. } => *range,
        }
    }

    pub fn wants(&self, tile: &TileEntry) -> bool {
        matches!(self, Waiter::Tile { scale, pos, .. } if *scale == tile.scale && *pos == tile.pos)
    }

    pub fn fail(self, err: ResourceError) {
        match self {
            Waiter::Tile { responder, .. } => responder.send_err(err),
            Waiter::Scales { responder, .. } => responder.send_err(err),
        }
    }
}

// =============================================================================
// Job
// =============================================================================

/// Shared state of one generation run.
///
/// The coordinator registers interested requests; the worker polls
/// [`is_aborted`](Self::is_aborted) between tiles.
#[derive(Debug)]
pub(crate) struct TileGenerationJob {
    handle: JobHandle,
    range: ScaleRange,
    interested: Mutex<Vec<JobHandle>>,
}

impl TileGenerationJob {
    pub fn new(range: ScaleRange) -> Self {
        Self {
            handle: JobHandle::new(),
            range,
            interested: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn range(&self) -> ScaleRange {
        self.range
    }

    pub fn add_interest(&self, handle: JobHandle) {
        if let Ok(mut interested) = self.interested.lock() {
            interested.push(handle);
        }
    }

    /// Whether a request for `range` can be served by this job.
    ///
    /// Any scale inside the job's range qualifies while the job is alive:
    /// tiles it already emitted are either stored or still in the receive
    /// queue, and both are seen before the request is answered.
    pub fn can_serve(&self, range: &ScaleRange) -> bool {
        !self.is_aborted() && self.range.covers(range)
    }

    /// True once the job itself was aborted or every request waiting on it
    /// has been cancelled.
    pub fn is_aborted(&self) -> bool {
        if self.handle.is_aborted() {
            return true;
        }
        match self.interested.lock() {
            Ok(interested) => {
                !interested.is_empty() && interested.iter().all(JobHandle::is_aborted)
            }
            Err(_) => false,
        }
    }
}

// =============================================================================
// Worker side
// =============================================================================

/// Everything a worker needs to run one job.
pub(crate) struct GenerationTask {
    pub job: Arc<TileGenerationJob>,
    pub metadata: ResourceMetadata,
    pub services: Arc<Services>,
    pub mailbox: Mailbox,
}

impl GenerationTask {
    /// Resolve the source and generate on the worker pool. The outcome is
    /// always reported through the request queue, exactly once.
    pub fn spawn(self) {
        let resolver = self.services.resolver.clone();
        let locator = self.metadata.locator.clone();
        resolver.resolve(&locator, move |blob| {
            let outcome = blob.and_then(|blob| {
                let handler = self.metadata.info.name.handler.qualified_name();
                catch_panic(&handler, || self.generate(&blob.data()?))
            });
            self.report(outcome);
        });
    }

    fn generate(&self, data: &[u8]) -> Result<GenerationOutcome, ResourceError> {
        let job = &self.job;
        if job.is_aborted() {
            return Ok(GenerationOutcome::Aborted { tiles: 0 });
        }
        job.handle.start();

        let handler = &self.metadata.info.name.handler;
        if handler.kind() != IMAGE_HANDLER_TYPE {
            return Err(ResourceError::UnknownHandler(handler.qualified_name()));
        }
        let codec = self
            .services
            .codecs
            .get(handler.name())
            .ok_or_else(|| ResourceError::UnknownHandler(handler.qualified_name()))?;

        let image = codec.decode(data)?;
        if let Some(info) = self.metadata.image {
            if (image.width(), image.height()) != (info.width, info.height) {
                return Err(DecodeError::Codec {
                    codec: codec.name().to_string(),
                    message: format!(
                        "decoded {}x{}, expected {}x{}",
                        image.width(),
                        image.height(),
                        info.width,
                        info.height
                    ),
                }
                .into());
            }
        }
        debug!(job = job.id(), width = image.width(), height = image.height(), "decoded source");

        let image_id = self.metadata.id();
        let key = self.metadata.locator.to_string();
        let failure = RefCell::new(None::<ResourceError>);
        let outcome = self.services.generator.generate_range(
            &image,
            job.range(),
            || failure.borrow().is_some() || job.is_aborted(),
            |tile| {
                let entry = match self.services.encoder.encode(&tile.pixels) {
                    Ok((format, data)) => TileEntry {
                        image_id,
                        scale: tile.scale,
                        pos: tile.pos,
                        format,
                        data,
                    },
                    Err(e) => {
                        *failure.borrow_mut() = Some(e.into());
                        return;
                    }
                };
                let key = key.clone();
                let job_id = job.id();
                if let Err(e) = self
                    .mailbox
                    .receive(move |state| state.tile_arrived(&key, job_id, entry))
                {
                    *failure.borrow_mut() = Some(e);
                }
            },
        );

        match failure.into_inner() {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    fn report(self, outcome: Result<GenerationOutcome, ResourceError>) {
        let key = self.metadata.locator.to_string();
        let job_id = self.job.id();
        if let Err(e) = self
            .mailbox
            .request(move |state| state.finish_generation(&key, job_id, outcome))
        {
            warn!(job = job_id, "generation outcome dropped: {}", e);
        }
    }
}
