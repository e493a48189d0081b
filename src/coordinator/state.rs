//! State owned by the coordinator thread and the handlers that run on it.
//!
//! Every method here runs on the coordinator thread, one closure at a time,
//! so none of it needs locking. Methods never block on a worker: slow work
//! is handed to the pool and its result comes back as another closure.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::generation::{GenerationTask, TileGenerationJob, Waiter};
use super::reply::Responder;
use super::{CoordinatorStats, Mailbox, Services};
use crate::blob::{Blob, MAGIC_PROBE_LEN};
use crate::codec::IMAGE_HANDLER_TYPE;
use crate::error::ResourceError;
use crate::io::catch_panic;
use crate::locator::{Handler, Locator, BLOB_TYPE};
use crate::pyramid::{GenerationOutcome, ScaleRange};
use crate::resource::{ImageInfo, ResourceMetadata, ResourceName, ResourceStatus, RowId};
use crate::store::{CleanupReport, Database};
use crate::tile::{TileEntry, TilePos};

/// Handler recorded for blobs no codec recognizes.
const UNKNOWN_CODEC: &str = "unknown";

/// A generation job registered under its locator.
struct ActiveGeneration {
    job: Arc<TileGenerationJob>,
    metadata: ResourceMetadata,
    /// Requests the job will answer as its tiles arrive
    waiters: Vec<Waiter>,
    /// Requests the job cannot answer; re-dispatched once it ends
    deferred: Vec<Waiter>,
}

/// What a worker learned about a freshly resolved blob.
struct BlobAnalysis {
    name: ResourceName,
    image: Option<ImageInfo>,
    failure: Option<ResourceError>,
}

pub(crate) struct CoordinatorState {
    db: Database,
    services: Arc<Services>,
    mailbox: Mailbox,
    generations: HashMap<String, ActiveGeneration>,
    metadata_waiters: HashMap<String, Vec<Responder<ResourceMetadata>>>,
}

impl CoordinatorState {
    pub(super) fn new(db: Database, services: Arc<Services>, mailbox: Mailbox) -> Self {
        Self {
            db,
            services,
            mailbox,
            generations: HashMap::new(),
            metadata_waiters: HashMap::new(),
        }
    }

    pub(super) fn services(&self) -> &Arc<Services> {
        &self.services
    }

    fn tile_size(&self) -> u32 {
        self.services.generator.tile_size()
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Answer from the locator table when the resource is known and healthy;
    /// otherwise resolve the blob on the pool. Concurrent requests for the
    /// same locator share one resolution.
    pub fn request_resource_metadata(
        &mut self,
        locator: Locator,
        responder: Responder<ResourceMetadata>,
    ) {
        if responder.is_aborted() {
            return;
        }

        match self.db.get_metadata(&locator) {
            Ok(Some(metadata)) if metadata.info.status.is_success() => {
                debug!(locator = %locator, "metadata hit");
                responder.send_ok(metadata);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!(locator = %locator, "metadata lookup failed: {}", e);
                responder.send_err(e.into());
                return;
            }
        }

        let key = locator.to_string();
        if let Some(waiters) = self.metadata_waiters.get_mut(&key) {
            debug!(locator = %key, "joining metadata resolution in flight");
            waiters.push(responder);
            return;
        }
        self.metadata_waiters.insert(key, vec![responder]);
        CoordinatorStats::bump(&self.services.stats.metadata_resolutions);

        let services = Arc::clone(&self.services);
        let mailbox = self.mailbox.clone();
        let target = locator.clone();
        self.services.resolver.resolve(&locator, move |blob| {
            let analysis = blob.and_then(|blob| {
                catch_panic(IMAGE_HANDLER_TYPE, || analyze_blob(&services, &target, &blob))
            });
            if let Err(e) = mailbox.receive(move |state| state.finish_metadata(target, analysis)) {
                debug!("metadata result dropped: {}", e);
            }
        });
    }

    fn finish_metadata(
        &mut self,
        locator: Locator,
        analysis: Result<BlobAnalysis, ResourceError>,
    ) {
        let waiters = self
            .metadata_waiters
            .remove(&locator.to_string())
            .unwrap_or_default();

        let result = analysis.and_then(|analysis| self.persist_analysis(&locator, analysis));
        match &result {
            Ok(metadata) => info!(
                locator = %locator,
                id = %metadata.id(),
                image = ?metadata.image,
                "resource resolved"
            ),
            Err(e) => warn!(locator = %locator, status = %e.status(), "resource failed: {}", e),
        }

        for waiter in waiters {
            waiter.send(result.clone());
        }
    }

    /// Record the analysis. Failures that belong to the content are stored
    /// with their status, then returned.
    fn persist_analysis(
        &mut self,
        locator: &Locator,
        analysis: BlobAnalysis,
    ) -> Result<ResourceMetadata, ResourceError> {
        let status = analysis
            .failure
            .as_ref()
            .map(ResourceError::status)
            .unwrap_or(ResourceStatus::Success);

        let info = self.db.store_resource(&analysis.name, status)?;
        if let Some(image) = &analysis.image {
            self.db.store_image_info(info.id, image)?;
        }
        self.db.store_locator(locator, info.id)?;

        if let Some(failure) = analysis.failure {
            return Err(failure);
        }
        Ok(ResourceMetadata {
            info,
            locator: locator.clone(),
            image: analysis.image,
        })
    }

    // =========================================================================
    // Tiles
    // =========================================================================

    /// Answer from the store, fold into the running job for this locator,
    /// or start generating.
    pub fn request_tile(
        &mut self,
        metadata: ResourceMetadata,
        scale: u32,
        pos: TilePos,
        responder: Responder<TileEntry>,
    ) {
        if responder.is_aborted() {
            return;
        }
        let id = metadata.id();
        let image = match self.check_tile(&metadata, scale, pos) {
            Ok(image) => image,
            Err(e) => {
                responder.send_err(e);
                return;
            }
        };

        match self.db.get_tile(id, scale, pos) {
            Ok(Some(tile)) => {
                CoordinatorStats::bump(&self.services.stats.tile_hits);
                responder.send_ok(tile);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                error!(id = %id, scale, "tile lookup failed: {}", e);
                responder.send_err(e.into());
                return;
            }
        }

        let waiter = Waiter::Tile {
            scale,
            pos,
            responder,
        };
        let Some(waiter) = self.fold(&metadata, waiter) else {
            return;
        };

        // Generate from the requested scale up. When coarser scales are
        // already stored, stop right below them.
        let max_scale = image.max_scale(self.tile_size());
        let range = match self.db.get_min_max_scale(id) {
            Ok(Some(stored)) if scale < stored.min => ScaleRange::new(scale, stored.min - 1),
            Ok(_) => ScaleRange::new(scale, max_scale),
            Err(e) => {
                error!(id = %id, "scale range lookup failed: {}", e);
                waiter.fail(e.into());
                return;
            }
        };
        self.start_generation(metadata, range, waiter);
    }

    /// Make sure every tile of `range` is stored. Answers with the number
    /// of tiles generated for the request.
    pub fn request_tiles(
        &mut self,
        metadata: ResourceMetadata,
        range: ScaleRange,
        responder: Responder<usize>,
    ) {
        if responder.is_aborted() {
            return;
        }
        let Some(image) = metadata.image else {
            responder.send_err(not_an_image(&metadata, range.min));
            return;
        };
        let max_scale = image.max_scale(self.tile_size());
        if range.min > max_scale {
            responder.send_err(not_an_image(&metadata, range.min));
            return;
        }
        let range = ScaleRange::new(range.min, range.max.min(max_scale));

        let missing = match self.missing_scales(&metadata, image, range) {
            Ok(missing) => missing,
            Err(e) => {
                responder.send_err(e);
                return;
            }
        };
        let Some(missing) = missing else {
            debug!(locator = %metadata.locator, ?range, "scales already stored");
            responder.send_ok(0);
            return;
        };

        let waiter = Waiter::Scales {
            range: missing,
            responder,
        };
        if let Some(waiter) = self.fold(&metadata, waiter) {
            self.start_generation(metadata, missing, waiter);
        }
    }

    /// Validate a tile address against the image and the store.
    fn check_tile(
        &self,
        metadata: &ResourceMetadata,
        scale: u32,
        pos: TilePos,
    ) -> Result<ImageInfo, ResourceError> {
        let id = metadata.id();
        id.get()?;
        let Some(image) = metadata.image else {
            return Err(not_an_image(metadata, scale));
        };
        let (cols, rows) = image.tile_grid(scale, self.tile_size());
        if scale > image.max_scale(self.tile_size()) || pos.x >= cols || pos.y >= rows {
            return Err(ResourceError::TileNotFound {
                image_id: id.raw(),
                scale,
                x: pos.x,
                y: pos.y,
            });
        }
        if self.db.get_resource(id)?.is_none() {
            return Err(not_an_image(metadata, scale));
        }
        Ok(image)
    }

    /// Narrowest range covering every scale of `range` with missing tiles,
    /// or `None` when all are stored.
    fn missing_scales(
        &self,
        metadata: &ResourceMetadata,
        image: ImageInfo,
        range: ScaleRange,
    ) -> Result<Option<ScaleRange>, ResourceError> {
        let id = metadata.id();
        id.get()?;
        let mut missing: Option<ScaleRange> = None;
        for scale in range.min..=range.max {
            let (cols, rows) = image.tile_grid(scale, self.tile_size());
            let stored = self.db.tile_positions(id, scale)?;
            if stored.len() < (cols as usize) * (rows as usize) {
                missing = Some(match missing {
                    Some(m) => m.including(scale),
                    None => ScaleRange::single(scale),
                });
            }
        }
        Ok(missing)
    }

    /// Attach `waiter` to the job already registered for this locator.
    ///
    /// Returns the waiter back when no job is registered. A job that cannot
    /// serve it keeps it as deferred and re-dispatches it when it ends, so
    /// at most one job per locator ever runs.
    fn fold(&mut self, metadata: &ResourceMetadata, waiter: Waiter) -> Option<Waiter> {
        let key = metadata.locator.to_string();
        let Some(active) = self.generations.get_mut(&key) else {
            return Some(waiter);
        };

        if active.job.can_serve(&waiter.range()) {
            debug!(locator = %key, job = active.job.id(), "folding request into running job");
            CoordinatorStats::bump(&self.services.stats.folded_requests);
            active.job.add_interest(waiter.handle().clone());
            active.waiters.push(waiter);
        } else {
            debug!(locator = %key, job = active.job.id(), "deferring request until job ends");
            active.deferred.push(waiter);
        }
        None
    }

    fn start_generation(&mut self, metadata: ResourceMetadata, range: ScaleRange, waiter: Waiter) {
        let key = metadata.locator.to_string();
        let job = Arc::new(TileGenerationJob::new(range));
        job.add_interest(waiter.handle().clone());

        info!(
            locator = %key,
            job = job.id(),
            min_scale = range.min,
            max_scale = range.max,
            "starting tile generation"
        );
        CoordinatorStats::bump(&self.services.stats.generation_jobs);

        self.generations.insert(
            key,
            ActiveGeneration {
                job: Arc::clone(&job),
                metadata: metadata.clone(),
                waiters: vec![waiter],
                deferred: Vec::new(),
            },
        );

        GenerationTask {
            job,
            metadata,
            services: Arc::clone(&self.services),
            mailbox: self.mailbox.clone(),
        }
        .spawn();
    }

    /// Store a generated tile and answer the requests waiting for it.
    ///
    /// Tiles of a job that is no longer registered (its resource was
    /// deleted) are dropped.
    pub(super) fn tile_arrived(&mut self, key: &str, job_id: u64, tile: TileEntry) {
        let Some(active) = self.generations.get_mut(key).filter(|a| a.job.id() == job_id) else {
            debug!(locator = %key, job = job_id, "dropping tile of unregistered job");
            return;
        };

        if let Err(e) = self.db.store_tile(tile.clone()) {
            error!(locator = %key, scale = tile.scale, "failed to store tile: {}", e);
        } else {
            CoordinatorStats::bump(&self.services.stats.tiles_stored);
        }

        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut active.waiters)
            .into_iter()
            .partition(|w| w.wants(&tile));
        active.waiters = waiting;
        for waiter in ready {
            if let Waiter::Tile { responder, .. } = waiter {
                responder.send_ok(tile.clone());
            }
        }
    }

    /// Unregister a finished job and settle everything still attached to it.
    pub(super) fn finish_generation(
        &mut self,
        key: &str,
        job_id: u64,
        outcome: Result<GenerationOutcome, ResourceError>,
    ) {
        if !self
            .generations
            .get(key)
            .is_some_and(|a| a.job.id() == job_id)
        {
            debug!(locator = %key, job = job_id, "outcome of unregistered job");
            return;
        }
        let Some(active) = self.generations.remove(key) else {
            return;
        };
        let ActiveGeneration {
            job,
            metadata,
            waiters,
            deferred,
        } = active;

        match outcome {
            Ok(GenerationOutcome::Completed { tiles }) => {
                job.handle().finish();
                info!(locator = %key, job = job_id, tiles, "tile generation finished");
                for waiter in waiters {
                    self.settle_completed(&metadata, waiter, tiles);
                }
            }
            Ok(GenerationOutcome::Aborted { tiles }) => {
                job.handle().abort();
                info!(locator = %key, job = job_id, tiles, "tile generation aborted");
                for waiter in waiters {
                    if waiter.is_aborted() {
                        waiter.fail(ResourceError::Aborted);
                    } else {
                        self.dispatch(metadata.clone(), waiter);
                    }
                }
            }
            Err(e) => {
                job.handle().fail();
                error!(locator = %key, job = job_id, "tile generation failed: {}", e);
                if e.is_persistent() {
                    if let Err(store_err) = self.db.update_status(metadata.id(), e.status()) {
                        error!(locator = %key, "failed to record status: {}", store_err);
                    }
                }
                for waiter in waiters {
                    waiter.fail(e.clone());
                }
            }
        }

        for waiter in deferred {
            self.dispatch(metadata.clone(), waiter);
        }
    }

    /// Answer a waiter left over after its job completed.
    fn settle_completed(&mut self, metadata: &ResourceMetadata, waiter: Waiter, tiles: usize) {
        match waiter {
            Waiter::Scales { responder, .. } => responder.send_ok(tiles),
            Waiter::Tile {
                scale,
                pos,
                responder,
            } => match self.db.get_tile(metadata.id(), scale, pos) {
                Ok(Some(tile)) => responder.send_ok(tile),
                Ok(None) => responder.send_err(ResourceError::TileNotFound {
                    image_id: metadata.id().raw(),
                    scale,
                    x: pos.x,
                    y: pos.y,
                }),
                Err(e) => responder.send_err(e.into()),
            },
        }
    }

    fn dispatch(&mut self, metadata: ResourceMetadata, waiter: Waiter) {
        match waiter {
            Waiter::Tile {
                scale,
                pos,
                responder,
            } => self.request_tile(metadata, scale, pos, responder),
            Waiter::Scales { range, responder } => {
                self.request_tiles(metadata, range, responder)
            }
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Remove a resource with its tiles and locators. Running jobs for it
    /// are aborted and their tiles discarded.
    pub fn delete_resource(&mut self, id: RowId, responder: Responder<bool>) {
        let keys: Vec<String> = self
            .generations
            .iter()
            .filter(|(_, a)| a.metadata.id() == id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(active) = self.generations.remove(&key) {
                active.job.handle().abort();
                for waiter in active.waiters.into_iter().chain(active.deferred) {
                    waiter.fail(ResourceError::Aborted);
                }
            }
        }

        let result = self.db.delete_resource(id).map_err(ResourceError::from);
        match &result {
            Ok(true) => info!(id = %id, "resource deleted"),
            Ok(false) => debug!(id = %id, "no resource to delete"),
            Err(e) => error!(id = %id, "delete failed: {}", e),
        }
        responder.send(result);
    }

    pub fn list_resources(
        &mut self,
        pattern: Option<glob::Pattern>,
        responder: Responder<Vec<ResourceMetadata>>,
    ) {
        responder.send(
            self.db
                .list_resources(pattern.as_ref())
                .map_err(ResourceError::from),
        );
    }

    pub fn flush(&mut self, responder: Responder<usize>) {
        let result = self.db.flush_tiles().map_err(ResourceError::from);
        if let Err(e) = &result {
            error!("flush failed: {}", e);
        }
        responder.send(result);
    }

    pub fn cleanup(&mut self, responder: Responder<CleanupReport>) {
        let result = self.db.cleanup().map_err(ResourceError::from);
        if let Err(e) = &result {
            error!("cleanup failed: {}", e);
        }
        responder.send(result);
    }

    /// Fail everything outstanding and flush the write-back buffer.
    pub(super) fn shutdown(&mut self) {
        for (_, active) in self.generations.drain() {
            active.job.handle().abort();
            for waiter in active.waiters.into_iter().chain(active.deferred) {
                waiter.fail(ResourceError::Shutdown);
            }
        }
        for (_, waiters) in self.metadata_waiters.drain() {
            for waiter in waiters {
                waiter.send_err(ResourceError::Shutdown);
            }
        }
        match self.db.flush_tiles() {
            Ok(0) => {}
            Ok(count) => info!(count, "flushed tiles on shutdown"),
            Err(e) => error!("flush on shutdown failed: {}", e),
        }
    }
}

fn not_an_image(metadata: &ResourceMetadata, scale: u32) -> ResourceError {
    ResourceError::TileNotFound {
        image_id: metadata.id().raw(),
        scale,
        x: 0,
        y: 0,
    }
}

/// Identify a resolved blob: content hash, codec and image size.
///
/// Runs on a worker. Only failures reading the blob are returned as
/// errors; content failures are part of the analysis so they can be
/// recorded against the blob.
fn analyze_blob(
    services: &Services,
    locator: &Locator,
    blob: &Blob,
) -> Result<BlobAnalysis, ResourceError> {
    let blob_info = blob.info()?;
    let header = blob.header(MAGIC_PROBE_LEN)?;

    let codec = match locator.last_handler() {
        Some(handler) if handler.kind() == IMAGE_HANDLER_TYPE => {
            services.codecs.get(handler.name())
        }
        _ => services.codecs.select(
            blob.name().or(locator.url().file_name()),
            blob.content_type(),
            &header,
        ),
    };

    let Some(codec) = codec else {
        let handler = match locator.last_handler() {
            Some(handler) if handler.kind() == IMAGE_HANDLER_TYPE => handler.clone(),
            _ => Handler::new(BLOB_TYPE, UNKNOWN_CODEC, ""),
        };
        let failure = ResourceError::UnknownHandler(format!(
            "no codec for {}",
            blob.name().unwrap_or(&handler.qualified_name())
        ));
        return Ok(BlobAnalysis {
            name: ResourceName::new(blob_info, handler),
            image: None,
            failure: Some(failure),
        });
    };

    let name = ResourceName::new(blob_info, Handler::new(IMAGE_HANDLER_TYPE, codec.name(), ""));
    let data = blob.data()?;
    Ok(match codec.probe_size(&data) {
        Ok((width, height)) => BlobAnalysis {
            name,
            image: Some(ImageInfo::new(width, height)),
            failure: None,
        },
        Err(e) => BlobAnalysis {
            name,
            image: None,
            failure: Some(e.into()),
        },
    })
}
