//! Tiled rendering infrastructure

mod backend;
mod cache;
mod queue;
mod request;
mod service;
#[cfg(feature = "svg")]
mod svg;
mod tile;
mod worker;

pub use backend::{BackendError, RenderBackend, TargetSize, VectorFormat};
pub use cache::{CacheBudget, CacheStats, Completion, TileCache, TileStatus};
pub use queue::{Priority, RenderQueue};
pub use request::{ExportJob, RenderEvent, RenderJob, RepaintSink, RequestId};
pub use service::{TileConfig, TileContent, TileResponse, TileService, TileView, VisibleArea};
#[cfg(feature = "svg")]
pub use svg::SvgBackend;
pub use tile::{ScaleBucket, Tile, TileGrid, TileKey};
pub use worker::{OVERSAMPLE_THRESHOLD_DPI, RasterOptions, render_tile};

/// Default tile edge in pixels
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Tiles of another scale are reused as placeholders up to this ratio
pub const PLACEHOLDER_MAX_RATIO: f64 = 4.0;

/// Upper bound for the default worker count
pub const MAX_DEFAULT_WORKERS: usize = 4;

/// One thread less than the machine has, at least one, at most four
#[must_use]
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map_or(1, |n| n.get().saturating_sub(1))
        .clamp(1, MAX_DEFAULT_WORKERS)
}
