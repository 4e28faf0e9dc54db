//! Document view: the layout and the tile service behind one façade
//!
//! The view owns the page arrangement and the render pipeline. A frontend
//! feeds it the visible canvas region and paints what comes back; render
//! completions arrive through `poll_events` or an installed [`RepaintSink`].

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use crate::error::{Result, ViewError};
use crate::geometry::{Point, Rect, RectF, Size};
use crate::layout::{LayoutMode, PageLayout, ZoomMode};
use crate::page::{Link, Page, PageId};
use crate::render::{
    RenderBackend, RenderEvent, RepaintSink, RequestId, TileResponse, TileService, VectorFormat, VisibleArea,
};
use crate::settings::ViewSettings;
use crate::transform::Rotation;

/// Tiles for one page on screen
#[derive(Clone, Debug)]
pub struct PageTiles {
    /// Page index in the layout
    pub index: usize,
    /// Page origin on the canvas
    pub position: Point,
    pub response: TileResponse,
}

impl PageTiles {
    /// Canvas rectangle of a tile rectangle given in page pixels
    #[must_use]
    pub fn to_canvas(&self, rect: Rect) -> Rect {
        rect.translated(self.position.x, self.position.y)
    }
}

pub struct DocumentView {
    layout: PageLayout,
    tiles: TileService,
    region: Rect,
}

impl DocumentView {
    #[must_use]
    pub fn new(layout: PageLayout, tiles: TileService) -> Self {
        Self {
            layout,
            tiles,
            region: Rect::default(),
        }
    }

    /// Build the layout and the tile service from settings
    pub fn from_settings(backend: Arc<dyn RenderBackend>, settings: &ViewSettings) -> Result<Self> {
        settings.validate()?;
        let layout = PageLayout::new(settings.layout_config())?;
        let tiles = TileService::new(backend, settings.tile_config())?;
        Ok(Self::new(layout, tiles))
    }

    /// Replace the document pages and lay them out
    pub fn set_pages(&mut self, pages: Vec<Page>) {
        self.tiles.invalidate_all();
        self.layout.set_pages(pages);
        self.layout.update();
    }

    #[must_use]
    pub fn layout(&self) -> &PageLayout {
        &self.layout
    }

    /// Direct layout access; call `update()` (or use `edit()`) afterwards
    pub fn layout_mut(&mut self) -> &mut PageLayout {
        &mut self.layout
    }

    #[must_use]
    pub fn tiles(&self) -> &TileService {
        &self.tiles
    }

    pub fn tiles_mut(&mut self) -> &mut TileService {
        &mut self.tiles
    }

    /// Canvas size
    #[must_use]
    pub fn geometry(&self) -> Rect {
        self.layout.geometry()
    }

    /// Last region passed to `set_visible_region`
    #[must_use]
    pub fn visible_region(&self) -> Rect {
        self.region
    }

    /// Show `region` of the canvas.
    ///
    /// Returns whatever is available right now for every page overlapping the
    /// region; missing tiles are scheduled and reported later as events.
    pub fn set_visible_region(&mut self, region: Rect) -> Vec<PageTiles> {
        self.region = region;
        let snapshot = self.layout.snapshot();

        let mut shown = Vec::new();
        let mut areas = Vec::new();
        for index in snapshot.visible_pages(region) {
            let Some(page) = self.layout.page(index) else {
                continue;
            };
            let Some(visible) = region.intersection(&page.rect()) else {
                continue;
            };
            let origin = page.position();
            let local = visible.translated(-origin.x, -origin.y);
            shown.push((index, origin));
            areas.push(VisibleArea::of_page(page, local));
        }

        self.tiles
            .request_pass(&areas)
            .into_iter()
            .zip(shown)
            .map(|(response, (index, position))| PageTiles {
                index,
                position,
                response,
            })
            .collect()
    }

    /// Request the current region again, e.g. after a layout change
    pub fn refresh(&mut self) -> Vec<PageTiles> {
        self.set_visible_region(self.region)
    }

    pub fn poll_events(&mut self) -> Vec<RenderEvent> {
        self.tiles.poll_events()
    }

    pub fn set_repaint_sink(&self, sink: Option<Arc<dyn RepaintSink>>) {
        self.tiles.set_repaint_sink(sink);
    }

    /// Page index under a canvas point
    #[must_use]
    pub fn page_at(&self, point: Point) -> Option<usize> {
        self.layout.page_at(point)
    }

    /// Links on a page under a point in that page's pixels, innermost first
    #[must_use]
    pub fn links_at(&self, page: usize, point: Point) -> Vec<&Link> {
        self.layout.page(page).map(|p| p.links_at(point)).unwrap_or_default()
    }

    #[must_use]
    pub fn urls(&self) -> BTreeMap<String, BTreeMap<usize, Vec<RectF>>> {
        self.layout.urls()
    }

    /// Switch to a fixed zoom factor; returns the factor after clamping
    pub fn set_zoom(&mut self, factor: f64) -> Result<f64> {
        let factor = self.layout.set_zoom_factor(factor)?;
        self.layout.set_zoom_mode(ZoomMode::Fixed);
        self.layout.update();
        Ok(factor)
    }

    pub fn set_rotation(&mut self, rotation: Rotation) {
        self.layout.set_rotation(rotation);
        self.layout.update();
    }

    /// Fit the current spread into `viewport` with `mode`; returns the new
    /// zoom factor
    pub fn fit(&mut self, mode: ZoomMode, viewport: Size) -> f64 {
        self.layout.set_zoom_mode(mode);
        let factor = self.layout.fit(viewport);
        self.layout.update();
        factor
    }

    pub fn set_layout_mode(&mut self, mode: LayoutMode) {
        self.layout.set_mode(mode);
        self.layout.update();
    }

    /// Page content changed: drop its tiles and outdate running renders
    pub fn invalidate(&mut self, page: usize) -> Result<()> {
        let id = self.page_id(page)?;
        debug!("Invalidating page {page} ({id})");
        self.tiles.invalidate_page(id);
        Ok(())
    }

    /// Export part of a page as vector data. `rect` is in page pixels; the
    /// answer arrives as `RenderEvent::VectorOutput`.
    pub fn export(&mut self, page: usize, format: VectorFormat, rect: Rect) -> Result<RequestId> {
        let page = self.layout.page(page).ok_or(ViewError::PageOutOfRange {
            index: page,
            count: self.layout.len(),
        })?;
        let source = *page.source();
        let intrinsic = page.transform().rect_from_pixel(rect);
        Ok(self.tiles.export(source, format, intrinsic))
    }

    /// Text inside `rect` of a page, `rect` in page pixels
    pub fn text(&self, page: usize, rect: Rect) -> Result<String> {
        let page = self.layout.page(page).ok_or(ViewError::PageOutOfRange {
            index: page,
            count: self.layout.len(),
        })?;
        let intrinsic = page.transform().rect_from_pixel(rect);
        Ok(self.tiles.text(page.source(), intrinsic)?)
    }

    /// Canvas rectangle of an intrinsic region of a page, as carried by
    /// render events
    #[must_use]
    pub fn region_to_canvas(&self, page: PageId, rect: RectF) -> Option<Rect> {
        let page = self.layout.pages().iter().find(|p| p.id() == page)?;
        if !page.is_visible() {
            return None;
        }
        let origin = page.position();
        Some(
            page.transform()
                .rect_to_pixel(rect)
                .translated(origin.x, origin.y),
        )
    }

    fn page_id(&self, index: usize) -> Result<PageId> {
        self.layout
            .page(index)
            .map(Page::id)
            .ok_or(ViewError::PageOutOfRange {
                index,
                count: self.layout.len(),
            })
    }
}
