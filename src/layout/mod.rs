//! Page layout: arranging pages on a virtual canvas
//!
//! `PageLayout` owns the ordered pages and the layout configuration. Nothing
//! is recomputed implicitly; edits are collected and `update()` rebuilds a
//! fresh [`LayoutSnapshot`], which is what queries and other threads read.

mod engine;
mod zoom;

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut, Range};
use std::sync::Arc;

use log::{trace, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ViewError};
use crate::geometry::{Point, Rect, RectF, Size};
use crate::page::{Link, Page};
use crate::spatial::{SpatialIndex, SpatialIndexBuilder};
use crate::transform::Rotation;

pub use engine::{LayoutEngine, LayoutParams, Orientation, PageGeometry, Placement, RowLayoutEngine};
pub use zoom::{FitExtent, ZoomBounds, ZoomMode, fit_factor};

/// Built-in page arrangements
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutMode {
    /// One page per row
    #[default]
    Single,
    /// Two-page spreads, first page on the left
    #[serde(alias = "double-left")]
    DoubleLeft,
    /// Two-page spreads, first page alone on the right
    #[serde(alias = "double-right")]
    DoubleRight,
    /// Grid with a configurable number of columns
    Raster,
}

impl LayoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayoutMode::Single => "single",
            LayoutMode::DoubleLeft => "double_left",
            LayoutMode::DoubleRight => "double_right",
            LayoutMode::Raster => "raster",
        }
    }

    /// Parse the names used in settings files and on the command line
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().replace('-', "_").as_str() {
            "single" => Ok(Self::Single),
            "double_left" => Ok(Self::DoubleLeft),
            "double_right" => Ok(Self::DoubleRight),
            "raster" => Ok(Self::Raster),
            _ => Err(ViewError::UnknownOption {
                kind: "layout mode",
                value: name.to_string(),
            }),
        }
    }

    fn engine(self, raster_columns: usize) -> RowLayoutEngine {
        match self {
            LayoutMode::Single => RowLayoutEngine::single(),
            LayoutMode::DoubleLeft => RowLayoutEngine::double_left(),
            LayoutMode::DoubleRight => RowLayoutEngine::double_right(),
            LayoutMode::Raster => RowLayoutEngine::raster(raster_columns),
        }
    }
}

/// Everything that affects page positions
#[derive(Clone, Debug, PartialEq)]
pub struct LayoutConfig {
    pub mode: LayoutMode,
    pub orientation: Orientation,
    /// Show every page, or only the spread holding `current_page`
    pub continuous: bool,
    pub rotation: Rotation,
    pub zoom_mode: ZoomMode,
    pub zoom_factor: f64,
    pub zoom_bounds: ZoomBounds,
    /// Output resolution in pixels per inch
    pub dpi: f64,
    pub spacing: u32,
    pub margin: u32,
    pub raster_columns: usize,
    pub current_page: usize,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            mode: LayoutMode::default(),
            orientation: Orientation::default(),
            continuous: true,
            rotation: Rotation::Deg0,
            zoom_mode: ZoomMode::default(),
            zoom_factor: 1.0,
            zoom_bounds: ZoomBounds::default(),
            dpi: 72.0,
            spacing: 8,
            margin: 6,
            raster_columns: 4,
            current_page: 0,
        }
    }
}

impl LayoutConfig {
    pub fn validate(&self) -> Result<()> {
        let ZoomBounds { min, max } = self.zoom_bounds;
        if !(min.is_finite() && max.is_finite() && min > 0.0 && min <= max) {
            return Err(ViewError::config(format!(
                "zoom bounds must satisfy 0 < min <= max, got {min}..{max}"
            )));
        }
        if !(self.zoom_factor.is_finite() && self.zoom_factor > 0.0) {
            return Err(ViewError::InvalidScale(self.zoom_factor));
        }
        if !(self.dpi.is_finite() && self.dpi > 0.0) {
            return Err(ViewError::InvalidDpi(self.dpi));
        }
        if self.raster_columns == 0 {
            return Err(ViewError::config("raster_columns must be at least 1"));
        }
        Ok(())
    }

    fn params(&self) -> LayoutParams {
        LayoutParams {
            rotation: self.rotation,
            zoom: self.zoom_factor,
            dpi: self.dpi,
            orientation: self.orientation,
            spacing: self.spacing,
            margin: self.margin,
        }
    }
}

/// Immutable result of one `PageLayout::update()`.
///
/// Shared through an `Arc`; a later update installs a new snapshot instead
/// of touching this one.
#[derive(Debug, Default)]
pub struct LayoutSnapshot {
    rects: Vec<Option<Rect>>,
    geometry: Rect,
    index: SpatialIndex<usize>,
    generation: u64,
}

impl LayoutSnapshot {
    /// Bounding rectangle of the canvas, margins included
    #[must_use]
    pub fn geometry(&self) -> Rect {
        self.geometry
    }

    /// Canvas rectangle of a page, `None` for hidden or unknown pages
    #[must_use]
    pub fn page_rect(&self, index: usize) -> Option<Rect> {
        self.rects.get(index).copied().flatten()
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.rects.len()
    }

    /// Incremented on every rebuild
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Index of the page under a canvas point
    #[must_use]
    pub fn page_at(&self, point: Point) -> Option<usize> {
        self.index.first_at(point.to_f()).map(|e| e.payload)
    }

    /// Pages overlapping a canvas rectangle, in reading order
    #[must_use]
    pub fn visible_pages(&self, viewport: Rect) -> Vec<usize> {
        self.index
            .intersecting(&viewport.to_f())
            .into_iter()
            .map(|e| e.payload)
            .collect()
    }
}

/// Ordered pages on a virtual canvas
#[derive(Debug)]
pub struct PageLayout {
    pages: Vec<Page>,
    config: LayoutConfig,
    engine: Box<dyn LayoutEngine>,
    custom_engine: bool,
    snapshot: Arc<LayoutSnapshot>,
}

impl Default for PageLayout {
    fn default() -> Self {
        let config = LayoutConfig::default();
        Self {
            engine: Box::new(config.mode.engine(config.raster_columns)),
            pages: Vec::new(),
            config,
            custom_engine: false,
            snapshot: Arc::new(LayoutSnapshot::default()),
        }
    }
}

impl PageLayout {
    pub fn new(config: LayoutConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            engine: Box::new(config.mode.engine(config.raster_columns)),
            pages: Vec::new(),
            config,
            custom_engine: false,
            snapshot: Arc::new(LayoutSnapshot::default()),
        })
    }

    /// Replace the pages; positions are stale until `update()`
    pub fn set_pages(&mut self, pages: Vec<Page>) {
        self.pages = pages;
    }

    #[must_use]
    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// Mutable access for batched edits; call `update()` afterwards
    pub fn pages_mut(&mut self) -> &mut Vec<Page> {
        &mut self.pages
    }

    #[must_use]
    pub fn page(&self, index: usize) -> Option<&Page> {
        self.pages.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Start a batch of page edits that triggers one `update()` when dropped
    pub fn edit(&mut self) -> LayoutEdit<'_> {
        LayoutEdit { layout: self }
    }

    #[must_use]
    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    /// Replace the configuration; positions are stale until `update()`
    pub fn set_config(&mut self, config: LayoutConfig) -> Result<()> {
        config.validate()?;
        if !self.custom_engine {
            self.engine = Box::new(config.mode.engine(config.raster_columns));
        }
        self.config = config;
        Ok(())
    }

    pub fn set_mode(&mut self, mode: LayoutMode) {
        self.config.mode = mode;
        self.custom_engine = false;
        self.engine = Box::new(mode.engine(self.config.raster_columns));
    }

    /// Install a custom engine, overriding the configured mode
    pub fn set_engine(&mut self, engine: Box<dyn LayoutEngine>) {
        self.engine = engine;
        self.custom_engine = true;
    }

    pub fn set_orientation(&mut self, orientation: Orientation) {
        self.config.orientation = orientation;
    }

    pub fn set_continuous(&mut self, continuous: bool) {
        self.config.continuous = continuous;
    }

    pub fn set_rotation(&mut self, rotation: Rotation) {
        self.config.rotation = rotation;
    }

    pub fn set_zoom_mode(&mut self, mode: ZoomMode) {
        self.config.zoom_mode = mode;
    }

    /// Set the zoom factor, clamped to the configured bounds
    pub fn set_zoom_factor(&mut self, factor: f64) -> Result<f64> {
        if !(factor.is_finite() && factor > 0.0) {
            return Err(ViewError::InvalidScale(factor));
        }
        self.config.zoom_factor = self.config.zoom_bounds.clamp(factor);
        Ok(self.config.zoom_factor)
    }

    pub fn set_current_page(&mut self, index: usize) -> Result<()> {
        if index >= self.pages.len() {
            return Err(ViewError::PageOutOfRange {
                index,
                count: self.pages.len(),
            });
        }
        self.config.current_page = index;
        Ok(())
    }

    /// Pages of the spread holding `current_page`
    #[must_use]
    pub fn current_group(&self) -> Range<usize> {
        let current = self.config.current_page.min(self.pages.len().saturating_sub(1));
        self.engine
            .display_groups(self.pages.len())
            .into_iter()
            .find(|g| g.contains(&current))
            .map_or(0..0, |g| g.start..g.end.min(self.pages.len()))
    }

    /// Recompute every page position, the geometry and the page index
    pub fn update(&mut self) {
        let params = self.config.params();
        let shown = if self.config.continuous {
            0..self.pages.len()
        } else {
            self.current_group()
        };

        for page in &mut self.pages {
            page.apply_display(self.config.rotation, self.config.zoom_factor, self.config.dpi);
            page.set_visible(false);
        }

        let geometry: Vec<PageGeometry> = self.pages.iter().map(page_geometry).collect();
        let mut placements = self.engine.layout(&geometry, &params);
        if placements.len() < self.pages.len() {
            warn!(
                "Layout engine placed {} of {} pages, the rest stay hidden",
                placements.len(),
                self.pages.len()
            );
        }
        let shown = shown.start.min(placements.len())..shown.end.min(placements.len());

        // a single spread is shown alone, flush with the margin
        if !self.config.continuous && !shown.is_empty() {
            let min_x = placements[shown.clone()].iter().map(|p| p.position.x).min().unwrap_or(0);
            let min_y = placements[shown.clone()].iter().map(|p| p.position.y).min().unwrap_or(0);
            let margin = params.margin as i32;
            for p in &mut placements[shown.clone()] {
                p.position = p.position.offset(margin - min_x, margin - min_y);
            }
        }

        let mut rects = vec![None; self.pages.len()];
        let mut builder = SpatialIndexBuilder::with_capacity(shown.len());
        let mut bounds = Rect::default();
        for i in shown {
            let placement = placements[i];
            let page = &mut self.pages[i];
            page.set_position(placement.position);
            page.set_visible(true);
            let rect = page.rect();
            rects[i] = Some(rect);
            bounds = bounds.union(&rect);
            builder.insert(rect.to_f(), i);
        }

        let geometry = if bounds.is_empty() {
            Rect::default()
        } else {
            let margin = params.margin;
            Rect::new(
                0,
                0,
                (bounds.right().max(0) as u32).saturating_add(margin),
                (bounds.bottom().max(0) as u32).saturating_add(margin),
            )
        };

        let generation = self.snapshot.generation + 1;
        trace!(
            "Layout: rebuilt {} pages, geometry {}x{}, generation {generation}",
            rects.iter().filter(|r| r.is_some()).count(),
            geometry.width,
            geometry.height
        );
        self.snapshot = Arc::new(LayoutSnapshot {
            rects,
            geometry,
            index: builder.finish(),
            generation,
        });
    }

    /// Current read-only snapshot, shareable across threads
    #[must_use]
    pub fn snapshot(&self) -> Arc<LayoutSnapshot> {
        Arc::clone(&self.snapshot)
    }

    #[must_use]
    pub fn geometry(&self) -> Rect {
        self.snapshot.geometry()
    }

    #[must_use]
    pub fn page_at(&self, point: Point) -> Option<usize> {
        self.snapshot.page_at(point)
    }

    #[must_use]
    pub fn visible_pages(&self, viewport: Rect) -> Vec<usize> {
        self.snapshot.visible_pages(viewport)
    }

    /// Compute and store the zoom factor for the active zoom mode.
    ///
    /// Fits the spread holding `current_page`. Returns the factor now in
    /// effect; positions are stale until `update()`.
    pub fn fit(&mut self, viewport: Size) -> f64 {
        let group = self.current_group();
        if group.is_empty() {
            return self.config.zoom_factor;
        }

        let geometry: Vec<PageGeometry> = self.pages[group].iter().map(page_geometry).collect();
        let mut params = self.config.params();
        params.zoom = 1.0;
        let with_gaps = extent_of(&self.engine.layout(&geometry, &params));
        params.spacing = 0;
        params.margin = 0;
        let content = extent_of(&self.engine.layout(&geometry, &params));
        // the gapped extent already starts past the leading margin
        let trailing = self.config.margin;
        let extent = FitExtent {
            content,
            fixed: Size::new(
                with_gaps.width - content.width + trailing,
                with_gaps.height - content.height + trailing,
            ),
        };

        if let Some(factor) = fit_factor(self.config.zoom_mode, extent, viewport) {
            self.config.zoom_factor = self.config.zoom_bounds.clamp(factor);
        }
        self.config.zoom_factor
    }

    /// Page under a canvas point and the links under it there, innermost first
    #[must_use]
    pub fn links_at(&self, point: Point) -> Option<(usize, Vec<&Link>)> {
        let index = self.page_at(point)?;
        let page = &self.pages[index];
        let local = point.offset(-page.position().x, -page.position().y);
        Some((index, page.links_at(local)))
    }

    /// Every URL in the document with the unit-space areas linking to it,
    /// grouped per page index
    #[must_use]
    pub fn urls(&self) -> BTreeMap<String, BTreeMap<usize, Vec<RectF>>> {
        let mut urls: BTreeMap<String, BTreeMap<usize, Vec<RectF>>> = BTreeMap::new();
        for (index, page) in self.pages.iter().enumerate() {
            for link in page.links().iter() {
                if let Some(url) = &link.url {
                    urls.entry(url.clone())
                        .or_default()
                        .entry(index)
                        .or_default()
                        .push(link.area);
                }
            }
        }
        urls
    }
}

/// Scope guard batching page edits; runs `update()` once when dropped
pub struct LayoutEdit<'a> {
    layout: &'a mut PageLayout,
}

impl Deref for LayoutEdit<'_> {
    type Target = Vec<Page>;

    fn deref(&self) -> &Self::Target {
        &self.layout.pages
    }
}

impl DerefMut for LayoutEdit<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.layout.pages
    }
}

impl Drop for LayoutEdit<'_> {
    fn drop(&mut self) {
        self.layout.update();
    }
}

fn page_geometry(page: &Page) -> PageGeometry {
    PageGeometry {
        intrinsic_size: page.intrinsic_size(),
        dpi: page.dpi(),
    }
}

/// Size of the region spanned by placements, measured from the origin
fn extent_of(placements: &[Placement]) -> Size {
    placements.iter().fold(Size::default(), |acc, p| {
        let right = (p.position.x.max(0) as u32).saturating_add(p.size.width);
        let bottom = (p.position.y.max(0) as u32).saturating_add(p.size.height);
        Size::new(acc.width.max(right), acc.height.max(bottom))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageId;

    fn document(count: usize) -> Vec<Page> {
        (0..count)
            .map(|i| Page::from_points(PageId(i as u64), 100.0, 150.0).unwrap())
            .collect()
    }

    fn layout_with(count: usize, mode: LayoutMode) -> PageLayout {
        let mut layout = PageLayout::new(LayoutConfig {
            mode,
            ..LayoutConfig::default()
        })
        .unwrap();
        layout.set_pages(document(count));
        layout.update();
        layout
    }

    #[test]
    fn update_is_idempotent_and_non_overlapping() {
        for mode in [
            LayoutMode::Single,
            LayoutMode::DoubleLeft,
            LayoutMode::DoubleRight,
            LayoutMode::Raster,
        ] {
            let mut layout = layout_with(9, mode);
            let first: Vec<Point> = layout.pages().iter().map(Page::position).collect();
            let geometry = layout.geometry();
            layout.update();
            let second: Vec<Point> = layout.pages().iter().map(Page::position).collect();
            assert_eq!(first, second, "{mode:?}");
            assert_eq!(geometry, layout.geometry());

            let rects: Vec<Rect> = layout.pages().iter().map(Page::rect).collect();
            for (i, a) in rects.iter().enumerate() {
                for b in &rects[i + 1..] {
                    assert!(!a.intersects(b), "{mode:?}: {a:?} overlaps {b:?}");
                }
            }
        }
    }

    #[test]
    fn set_pages_does_not_relayout() {
        let mut layout = layout_with(2, LayoutMode::Single);
        let before = layout.snapshot();
        layout.set_pages(document(5));
        assert_eq!(layout.snapshot().page_count(), before.page_count());
        layout.update();
        assert_eq!(layout.snapshot().page_count(), 5);
        assert!(layout.snapshot().generation() > before.generation());
    }

    #[test]
    fn edit_scope_updates_once_on_drop() {
        let mut layout = layout_with(1, LayoutMode::Single);
        let generation = layout.snapshot().generation();
        {
            let mut edit = layout.edit();
            edit.push(Page::from_points(PageId(10), 50.0, 50.0).unwrap());
            edit.push(Page::from_points(PageId(11), 50.0, 50.0).unwrap());
        }
        assert_eq!(layout.snapshot().generation(), generation + 1);
        assert_eq!(layout.visible_pages(layout.geometry()), vec![0, 1, 2]);
    }

    #[test]
    fn zero_pages_give_empty_geometry() {
        let layout = layout_with(0, LayoutMode::Raster);
        assert!(layout.geometry().is_empty());
        assert_eq!(layout.page_at(Point::new(1, 1)), None);
        assert!(layout.visible_pages(Rect::new(0, 0, 100, 100)).is_empty());
    }

    #[test]
    fn page_at_hits_pages_and_misses_gaps() {
        let layout = layout_with(3, LayoutMode::Single);
        let second = layout.pages()[1].rect();
        assert_eq!(layout.page_at(second.origin().offset(3, 3)), Some(1));
        assert_eq!(layout.page_at(Point::new(second.x, second.y - 2)), None);
        assert_eq!(layout.page_at(Point::new(-5, -5)), None);
    }

    #[test]
    fn rotation_and_zoom_propagate_to_pages() {
        let mut layout = layout_with(2, LayoutMode::Single);
        layout.set_rotation(Rotation::Deg90);
        layout.set_zoom_factor(2.0).unwrap();
        layout.update();
        let page = &layout.pages()[0];
        assert_eq!(page.rotation(), Rotation::Deg90);
        assert_eq!(page.display_size(), Size::new(300, 200));
    }

    #[test]
    fn zoom_factor_is_clamped_and_validated() {
        let mut layout = layout_with(1, LayoutMode::Single);
        assert_eq!(layout.set_zoom_factor(1000.0).unwrap(), ZoomBounds::MAX_SCALE);
        assert!(layout.set_zoom_factor(-1.0).is_err());
        assert!(layout.set_current_page(3).is_err());
    }

    #[test]
    fn non_continuous_shows_only_current_spread() {
        let mut layout = layout_with(6, LayoutMode::DoubleRight);
        layout.set_continuous(false);
        layout.set_current_page(4).unwrap();
        layout.update();

        assert_eq!(layout.current_group(), 3..5);
        assert_eq!(layout.visible_pages(layout.geometry()), vec![3, 4]);
        assert!(!layout.pages()[0].is_visible());
        let margin = layout.config().margin as i32;
        assert_eq!(layout.pages()[3].position(), Point::new(margin, margin));
    }

    #[test]
    fn fit_width_fills_viewport() {
        let mut layout = layout_with(3, LayoutMode::Single);
        layout.set_zoom_mode(ZoomMode::FitWidth);
        let margin = layout.config().margin;
        let zoom = layout.fit(Size::new(200 + 2 * margin, 100));
        assert!((zoom - 2.0).abs() < 1e-9, "{zoom}");
        layout.update();
        assert_eq!(layout.pages()[0].display_size().width, 200);
        assert_eq!(layout.geometry().width, 200 + 2 * margin);
    }

    #[derive(Debug)]
    struct FirstPageOnly;

    impl LayoutEngine for FirstPageOnly {
        fn layout(&self, pages: &[PageGeometry], params: &LayoutParams) -> Vec<Placement> {
            RowLayoutEngine::single().layout(&pages[..pages.len().min(1)], params)
        }

        fn display_groups(&self, count: usize) -> Vec<Range<usize>> {
            vec![0..count + 2]
        }
    }

    #[test]
    fn short_engine_output_hides_unplaced_pages() {
        let mut layout = layout_with(3, LayoutMode::Single);
        layout.set_engine(Box::new(FirstPageOnly));
        layout.update();
        assert!(layout.pages()[0].is_visible());
        assert!(!layout.pages()[1].is_visible());
        assert_eq!(layout.visible_pages(layout.geometry()), vec![0]);

        layout.set_continuous(false);
        layout.update();
        assert_eq!(layout.visible_pages(layout.geometry()), vec![0]);
        layout.set_zoom_mode(ZoomMode::FitWidth);
        assert!(layout.fit(Size::new(400, 400)) > 0.0);
    }

    #[test]
    fn fit_both_uses_smaller_axis() {
        let mut layout = layout_with(2, LayoutMode::DoubleLeft);
        layout.set_zoom_mode(ZoomMode::FitBoth);
        let zoom = layout.fit(Size::new(10_000, 150 + 2 * layout.config().margin));
        assert!((zoom - 1.0).abs() < 1e-9, "{zoom}");
    }

    #[test]
    fn urls_group_by_url_then_page() {
        let mut layout = PageLayout::default();
        let area = RectF::new(0.1, 0.1, 0.2, 0.2);
        layout.set_pages(vec![
            Page::from_points(PageId(0), 100.0, 100.0)
                .unwrap()
                .with_links(vec![Link::url(area, "https://a.example"), Link::internal(area, 1)]),
            Page::from_points(PageId(1), 100.0, 100.0)
                .unwrap()
                .with_links(vec![Link::url(area, "https://a.example"), Link::url(area, "https://b.example")]),
        ]);
        layout.update();

        let urls = layout.urls();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls["https://a.example"].keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(urls["https://b.example"][&1], vec![area]);

        let first = layout.pages()[0].rect();
        let (page, links) = layout.links_at(first.origin().offset(15, 15)).unwrap();
        assert_eq!(page, 0);
        assert_eq!(links.len(), 2);
    }

    #[test]
    fn parses_mode_names() {
        assert_eq!(LayoutMode::parse("double-right").unwrap(), LayoutMode::DoubleRight);
        assert!(LayoutMode::parse("triple").is_err());
    }
}
