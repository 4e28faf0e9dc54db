//! Render jobs, worker messages and completion events

use std::sync::Arc;

use crate::geometry::{Rect, RectF};
use crate::page::{PageId, PageSource};

use super::backend::{BackendError, VectorFormat};
use super::tile::{Tile, TileKey};

/// Unique identifier for render and export requests
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// One unit of background tile work
#[derive(Clone, Debug)]
pub struct RenderJob {
    pub id: RequestId,
    pub key: TileKey,
    pub source: PageSource,
    /// Area to render, intrinsic and unrotated
    pub intrinsic_rect: RectF,
    /// Tile position in page pixels; its size is the output size
    pub pixel_rect: Rect,
    /// Page content generation at request time
    pub generation: u64,
}

/// Vector export of a page area
#[derive(Clone, Debug)]
pub struct ExportJob {
    pub id: RequestId,
    pub source: PageSource,
    pub format: VectorFormat,
    pub rect: RectF,
}

/// Messages sent to render workers
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    /// A job was queued; take the best one from the queue
    Render,

    /// Run a vector export
    Export(ExportJob),

    /// Shutdown the worker
    Shutdown,
}

/// Notifications from the render workers
#[derive(Debug)]
pub enum RenderEvent {
    /// A visible tile finished rendering; repaint this area
    RegionChanged {
        page: PageId,
        key: TileKey,
        /// Covered area in intrinsic units
        rect: RectF,
        tile: Arc<Tile>,
    },

    /// Rendering a tile failed; the area stays unavailable until retried
    RegionUnavailable {
        page: PageId,
        key: TileKey,
        rect: RectF,
        error: BackendError,
    },

    /// Result of `TileService::export`
    VectorOutput {
        id: RequestId,
        page: PageId,
        format: VectorFormat,
        result: Result<Vec<u8>, BackendError>,
    },
}

impl RenderEvent {
    #[must_use]
    pub fn page(&self) -> PageId {
        match self {
            RenderEvent::RegionChanged { page, .. }
            | RenderEvent::RegionUnavailable { page, .. }
            | RenderEvent::VectorOutput { page, .. } => *page,
        }
    }
}

/// Receives repaint requests straight from worker threads
pub trait RepaintSink: Send + Sync {
    /// `rect` is in the page's intrinsic units
    fn request_repaint_region(&self, page: PageId, rect: RectF);
}

impl<F> RepaintSink for F
where
    F: Fn(PageId, RectF) + Send + Sync,
{
    fn request_repaint_region(&self, page: PageId, rect: RectF) {
        self(page, rect);
    }
}
