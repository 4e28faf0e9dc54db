//! Tiled rendering and caching for zoomable, paginated document views

pub mod error;
pub mod geometry;
pub mod layout;
pub mod page;
pub mod render;
pub mod settings;
pub mod spatial;
pub mod transform;
pub mod view;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{Result, ViewError};
pub use geometry::{Point, PointF, Rect, RectF, Size, SizeF};
pub use layout::{LayoutConfig, LayoutMode, LayoutSnapshot, Orientation, PageLayout, ZoomMode};
pub use page::{Link, Links, Page, PageId, PageSource};
pub use render::{
    BackendError, RenderBackend, RenderEvent, RepaintSink, TargetSize, TileConfig, TileContent, TileResponse,
    TileService, VectorFormat, VisibleArea,
};
pub use settings::ViewSettings;
pub use spatial::{SpatialIndex, SpatialIndexBuilder};
pub use transform::{CoordinateTransform, Rotation};
pub use view::{DocumentView, PageTiles};
