//! Render worker - runs in separate thread(s)

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use fast_image_resize as fr;
use flume::{Receiver, Sender};
use log::{debug, trace, warn};

use crate::geometry::{RectF, Size};

use super::backend::{BackendError, RenderBackend, TargetSize};
use super::cache::{Completion, TileCache};
use super::queue::RenderQueue;
use super::request::{ExportJob, RenderEvent, RenderJob, RepaintSink, WorkerMessage};
use super::tile::{Tile, resize_rgba, rotate_image};

/// Render below this many pixels per inch at twice the size, then downsample
pub const OVERSAMPLE_THRESHOLD_DPI: f64 = 96.0;
const OVERSAMPLE_FACTOR: u32 = 2;

/// How workers turn jobs into tiles
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RasterOptions {
    pub oversample: bool,
    pub oversample_threshold: f64,
}

impl Default for RasterOptions {
    fn default() -> Self {
        Self {
            oversample: true,
            oversample_threshold: OVERSAMPLE_THRESHOLD_DPI,
        }
    }
}

/// One lock per backend render group
#[derive(Debug, Default)]
pub(crate) struct RenderGroups {
    locks: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl RenderGroups {
    pub(crate) fn get(&self, group: u64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(group).or_default())
    }
}

/// State shared between the service and every worker
pub(crate) struct Shared {
    pub backend: Arc<dyn RenderBackend>,
    pub cache: TileCache,
    pub queue: RenderQueue,
    pub groups: RenderGroups,
    pub raster: RasterOptions,
    pub sink: RwLock<Option<Arc<dyn RepaintSink>>>,
}

pub(crate) fn render_worker(
    shared: Arc<Shared>,
    messages: Receiver<WorkerMessage>,
    events: Sender<RenderEvent>,
) {
    for message in messages {
        match message {
            WorkerMessage::Render => {
                // the job may have been cancelled after its wake-up was sent
                if let Some(job) = shared.queue.pop() {
                    handle_render_job(&shared, job, &events);
                }
            }

            WorkerMessage::Export(job) => {
                handle_export_job(&shared, job, &events);
            }

            WorkerMessage::Shutdown => break,
        }
    }
}

fn handle_render_job(shared: &Shared, job: RenderJob, events: &Sender<RenderEvent>) {
    if !shared.cache.claim(&job.key, job.id, job.generation) {
        trace!("Skipping cancelled job {:?} for {:?}", job.id, job.key);
        return;
    }

    let group = shared.backend.render_group(&job.source).map(|g| shared.groups.get(g));
    let result = {
        let _guard = group
            .as_ref()
            .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner));
        render_tile(shared.backend.as_ref(), &job, &shared.raster)
    };

    match result {
        Ok(tile) => {
            let rect = tile.intrinsic_rect;
            let completion = shared.cache.complete(job.id, tile);
            // listeners see the cache after the budget is restored
            shared.cache.evict();
            match completion {
                Completion::Stored { tile, visible: true } => {
                    debug!("Tile {:?} ready", job.key);
                    notify_sink(shared, &job, rect);
                    let _ = events.send(RenderEvent::RegionChanged {
                        page: job.key.page,
                        key: job.key,
                        rect,
                        tile,
                    });
                }
                Completion::Stored { visible: false, .. } => {
                    trace!("Tile {:?} ready but no longer visible", job.key);
                }
                Completion::Discarded => {
                    debug!("Dropped tile {:?} for outdated generation {}", job.key, job.generation);
                }
            }
        }
        Err(error) => {
            warn!("Rendering {:?} failed: {error}", job.key);
            let failed = shared.cache.fail(job.key, job.generation);
            shared.cache.evict();
            if failed == Some(true) {
                let _ = events.send(RenderEvent::RegionUnavailable {
                    page: job.key.page,
                    key: job.key,
                    rect: job.intrinsic_rect,
                    error,
                });
            }
        }
    }
}

fn handle_export_job(shared: &Shared, job: ExportJob, events: &Sender<RenderEvent>) {
    let group = shared.backend.render_group(&job.source).map(|g| shared.groups.get(g));
    let result = {
        let _guard = group
            .as_ref()
            .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner));
        shared.backend.vector_output(&job.source, job.format, job.rect)
    };
    if let Err(e) = &result {
        warn!("Export of {} as {} failed: {e}", job.source.id, job.format.as_str());
    }
    let _ = events.send(RenderEvent::VectorOutput {
        id: job.id,
        page: job.source.id,
        format: job.format,
        result,
    });
}

fn notify_sink(shared: &Shared, job: &RenderJob, rect: RectF) {
    let sink = shared.sink.read().unwrap_or_else(PoisonError::into_inner).clone();
    if let Some(sink) = sink {
        sink.request_repaint_region(job.key.page, rect);
    }
}

/// Render one tile through the backend.
///
/// The backend draws the unrotated area; the result is rotated into display
/// orientation here. Low resolution tiles are oversampled.
pub fn render_tile(
    backend: &dyn RenderBackend,
    job: &RenderJob,
    raster: &RasterOptions,
) -> Result<Tile, BackendError> {
    let output = job.pixel_rect.size();
    let unrotated = if job.key.rotation.is_transposed() {
        output.transposed()
    } else {
        output
    };

    let dpi = job.key.scale.scale() * job.source.dpi;
    let factor = if raster.oversample && dpi < raster.oversample_threshold {
        OVERSAMPLE_FACTOR
    } else {
        1
    };
    let target = TargetSize::new(unrotated.width * factor, unrotated.height * factor);

    let image = backend.render_region(&job.source, job.intrinsic_rect, target)?;
    let actual = TargetSize::new(image.width(), image.height());
    if actual != target {
        return Err(BackendError::SizeMismatch {
            expected: target,
            actual,
        });
    }

    let image = if factor > 1 {
        resize_rgba(
            image,
            Size::new(unrotated.width, unrotated.height),
            fr::ResizeAlg::Convolution(fr::FilterType::Lanczos3),
        )?
    } else {
        image
    };

    Ok(Tile {
        key: job.key,
        image: rotate_image(image, job.key.rotation),
        pixel_rect: job.pixel_rect,
        intrinsic_rect: job.intrinsic_rect,
        generation: job.generation,
    })
}
