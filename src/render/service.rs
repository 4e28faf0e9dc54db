//! Tile service - schedules tile renders on a worker pool and serves the cache

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use flume::{Receiver, Sender};
use log::{debug, trace};

use crate::error::{Result, ViewError};
use crate::geometry::{Point, PointF, Rect, RectF};
use crate::page::{Page, PageId, PageSource};
use crate::transform::{CoordinateTransform, Rotation};

use super::backend::{BackendError, RenderBackend, VectorFormat};
use super::cache::{CacheBudget, CacheStats, TileCache, TileStatus};
use super::queue::{Priority, RenderQueue};
use super::request::{ExportJob, RenderEvent, RenderJob, RepaintSink, RequestId, WorkerMessage};
use super::tile::{ScaleBucket, Tile, TileGrid, TileKey, compose_placeholder};
use super::worker::{RasterOptions, RenderGroups, Shared, render_worker};
use super::{DEFAULT_TILE_SIZE, PLACEHOLDER_MAX_RATIO, default_workers};

/// Tile service configuration
#[derive(Clone, Debug, PartialEq)]
pub struct TileConfig {
    /// Edge length of a tile in pixels
    pub tile_size: u32,
    pub budget: CacheBudget,
    pub workers: usize,
    /// Queued jobs beyond this are dropped, lowest priority first
    pub max_queued: usize,
    pub raster: RasterOptions,
    /// Largest scale ratio a placeholder may be rescaled across
    pub placeholder_max_ratio: f64,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            budget: CacheBudget::default(),
            workers: default_workers(),
            max_queued: 1024,
            raster: RasterOptions::default(),
            placeholder_max_ratio: PLACEHOLDER_MAX_RATIO,
        }
    }
}

impl TileConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 {
            return Err(ViewError::config("tile_size must be at least 1"));
        }
        if self.workers == 0 {
            return Err(ViewError::config("workers must be at least 1"));
        }
        if self.max_queued == 0 {
            return Err(ViewError::config("max_queued must be at least 1"));
        }
        if !(self.placeholder_max_ratio.is_finite() && self.placeholder_max_ratio >= 1.0) {
            return Err(ViewError::config("placeholder_max_ratio must be >= 1"));
        }
        Ok(())
    }
}

/// The part of one page that is on screen
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VisibleArea {
    pub page: PageSource,
    pub rotation: Rotation,
    /// Pixels per intrinsic unit
    pub scale: f64,
    /// Visible part of the page in intrinsic units
    pub rect: RectF,
    /// Page origin on the layout canvas
    pub position: Point,
}

impl VisibleArea {
    pub fn new(page: PageSource, rotation: Rotation, scale: f64, rect: RectF) -> Result<Self> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(ViewError::InvalidScale(scale));
        }
        if !rect.is_finite() {
            return Err(ViewError::InvalidRect(format!("{rect:?}")));
        }
        Ok(Self {
            page,
            rotation,
            scale,
            rect,
            position: Point::default(),
        })
    }

    /// Visible part of a laid out page, given in page pixels
    #[must_use]
    pub fn of_page(page: &Page, visible: Rect) -> Self {
        Self {
            page: *page.source(),
            rotation: page.rotation(),
            scale: page.pixels_per_unit(),
            rect: page.transform().rect_from_pixel(visible),
            position: page.position(),
        }
    }

    #[must_use]
    pub fn with_position(mut self, position: Point) -> Self {
        self.position = position;
        self
    }

    fn transform(&self) -> CoordinateTransform {
        CoordinateTransform::new_unchecked(self.page.intrinsic_size, self.rotation, self.scale)
    }
}

/// What can be shown for one tile right now
#[derive(Clone, Debug)]
pub enum TileContent {
    Ready(Arc<Tile>),
    /// Rescaled from another scale while the real tile renders
    Placeholder(Arc<Tile>),
    Pending,
    /// Rendering failed
    Unavailable,
}

/// One tile of a response
#[derive(Clone, Debug)]
pub struct TileView {
    pub key: TileKey,
    /// Tile position in page pixels
    pub rect: Rect,
    pub content: TileContent,
}

/// Best available content for one visible area
#[derive(Clone, Debug)]
pub struct TileResponse {
    pub page: PageId,
    pub scale: ScaleBucket,
    pub rotation: Rotation,
    pub tiles: Vec<TileView>,
}

impl TileResponse {
    /// True when every tile is rendered at the requested scale
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.tiles
            .iter()
            .all(|t| matches!(t.content, TileContent::Ready(_)))
    }

    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.tiles
            .iter()
            .filter(|t| matches!(t.content, TileContent::Ready(_)))
            .count()
    }
}

struct Planned {
    area: usize,
    key: TileKey,
    pixel_rect: Rect,
    intrinsic_rect: RectF,
    distance: u64,
}

/// A composed placeholder and the sources it was built from
struct Placeholder {
    generation: u64,
    source: ScaleBucket,
    sources: usize,
    tile: Arc<Tile>,
}

/// Tiled rendering with a worker pool and a shared cache
pub struct TileService {
    shared: Arc<Shared>,
    message_tx: Sender<WorkerMessage>,
    event_rx: Receiver<RenderEvent>,
    config: TileConfig,
    next_request_id: u64,
    epoch: u64,
    interactive: bool,
    placeholders: HashMap<TileKey, Placeholder>,
}

impl TileService {
    /// Create a new tile service and start its workers
    pub fn new(backend: Arc<dyn RenderBackend>, config: TileConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            backend,
            cache: TileCache::new(config.budget),
            queue: RenderQueue::new(),
            groups: RenderGroups::default(),
            raster: config.raster,
            sink: RwLock::new(None),
        });

        // flume gives an MPMC channel, so every worker pulls wake-ups from
        // the same receiver
        let (message_tx, message_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();

        for _ in 0..config.workers {
            let shared = Arc::clone(&shared);
            let rx = message_rx.clone();
            let tx = event_tx.clone();
            std::thread::spawn(move || {
                render_worker(shared, rx, tx);
            });
        }
        debug!(
            "Tile service started: {} workers, tile size {}",
            config.workers, config.tile_size
        );

        Ok(Self {
            shared,
            message_tx,
            event_rx,
            config,
            next_request_id: 1,
            epoch: 0,
            interactive: false,
            placeholders: HashMap::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &TileConfig {
        &self.config
    }

    /// Install a callback invoked from worker threads when a visible tile lands
    pub fn set_repaint_sink(&self, sink: Option<Arc<dyn RepaintSink>>) {
        *self.shared.sink.write().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    /// Request tiles for a single visible area
    pub fn request(&mut self, area: &VisibleArea) -> TileResponse {
        self.request_pass(std::slice::from_ref(area))
            .pop()
            .unwrap_or_else(|| TileResponse {
                page: area.page.id,
                scale: ScaleBucket::from_scale(area.scale),
                rotation: area.rotation,
                tiles: Vec::new(),
            })
    }

    /// Replace the visible set with `areas` and schedule what is missing.
    ///
    /// Never blocks on rendering. Pending tiles that left the visible set are
    /// cancelled, pending tiles still visible are rescored for this pass.
    pub fn request_pass(&mut self, areas: &[VisibleArea]) -> Vec<TileResponse> {
        self.epoch += 1;
        let settled = !self.interactive;
        let shared = Arc::clone(&self.shared);
        let cache = &shared.cache;

        let planned = self.plan(areas);
        for area in areas {
            cache.set_display(area.page.id, ScaleBucket::from_scale(area.scale), area.rotation);
        }

        let visible: HashSet<TileKey> = planned.iter().map(|p| p.key).collect();
        let distances: HashMap<TileKey, u64> = planned.iter().map(|p| (p.key, p.distance)).collect();
        cache.set_visible(visible);
        let cancelled = cache.cancel_hidden();

        let epoch = self.epoch;
        let dropped = self.shared.queue.rescore(|job| {
            distances.get(&job.key).map(|&distance| Priority {
                settled,
                epoch,
                distance,
                id: job.id,
            })
        });
        for job in &dropped {
            cache.cancel(&job.key, job.id);
        }

        let mut scheduled = 0;
        for plan in &planned {
            if cache.status(&plan.key) != TileStatus::Missing {
                continue;
            }
            let id = self.next_id();
            if !cache.mark_pending(plan.key, id) {
                continue;
            }
            let area = &areas[plan.area];
            let job = RenderJob {
                id,
                key: plan.key,
                source: area.page,
                intrinsic_rect: plan.intrinsic_rect,
                pixel_rect: plan.pixel_rect,
                generation: cache.generation(area.page.id),
            };
            let priority = Priority {
                settled,
                epoch,
                distance: plan.distance,
                id,
            };
            self.shared.queue.push(job, priority);
            let _ = self.message_tx.send(WorkerMessage::Render);
            scheduled += 1;
        }

        for job in self.shared.queue.truncate(self.config.max_queued) {
            cache.cancel(&job.key, job.id);
        }

        trace!(
            "Pass {epoch}: {} tiles visible, {scheduled} scheduled, {} cancelled",
            planned.len(),
            cancelled + dropped.len()
        );

        let mut responses: Vec<TileResponse> = areas
            .iter()
            .map(|area| TileResponse {
                page: area.page.id,
                scale: ScaleBucket::from_scale(area.scale),
                rotation: area.rotation,
                tiles: Vec::new(),
            })
            .collect();
        self.placeholders.retain(|key, _| distances.contains_key(key));
        for plan in planned {
            let content = self.content_for(&plan);
            responses[plan.area].tiles.push(TileView {
                key: plan.key,
                rect: plan.pixel_rect,
                content,
            });
        }

        cache.evict();
        responses
    }

    /// Tiles requested from now on belong to an interactive zoom and rank
    /// below tiles of a settled scale
    pub fn begin_interactive_zoom(&mut self) {
        self.interactive = true;
    }

    /// The zoom settled; the next pass is scheduled at full priority
    pub fn end_interactive_zoom(&mut self) {
        self.interactive = false;
    }

    #[must_use]
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Export an area of a page as vector data, answered with
    /// `RenderEvent::VectorOutput`
    pub fn export(&mut self, page: PageSource, format: VectorFormat, rect: RectF) -> RequestId {
        let id = self.next_id();
        let _ = self.message_tx.send(WorkerMessage::Export(ExportJob {
            id,
            source: page,
            format,
            rect,
        }));
        id
    }

    /// Text inside `rect` of a page, read from the backend on the calling
    /// thread while holding the page's render group
    pub fn text(&self, page: &PageSource, rect: RectF) -> Result<String, BackendError> {
        let group = self
            .shared
            .backend
            .render_group(page)
            .map(|g| self.shared.groups.get(g));
        let _guard = group
            .as_ref()
            .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner));
        self.shared.backend.text(page, rect)
    }

    /// The page content changed: drop its tiles and outdate running jobs
    pub fn invalidate_page(&mut self, page: PageId) {
        self.shared.cache.invalidate_page(page);
        self.shared.queue.remove_where(|job| job.key.page == page);
        self.placeholders.retain(|key, _| key.page != page);
    }

    pub fn invalidate_all(&mut self) {
        self.shared.cache.invalidate_all();
        self.shared.queue.remove_where(|_| true);
        self.placeholders.clear();
    }

    /// Forget failures of a page so the next pass requests its tiles again
    pub fn retry_failed(&mut self, page: PageId) -> usize {
        self.shared.cache.retry_failed(page)
    }

    /// Poll for render events
    pub fn poll_events(&mut self) -> Vec<RenderEvent> {
        self.event_rx.try_iter().collect()
    }

    /// Get the event receiver for blocking or async usage
    #[must_use]
    pub fn response_receiver(&self) -> &Receiver<RenderEvent> {
        &self.event_rx
    }

    #[must_use]
    pub fn status(&self, key: &TileKey) -> TileStatus {
        self.shared.cache.status(key)
    }

    #[must_use]
    pub fn tile(&self, key: &TileKey) -> Option<Arc<Tile>> {
        self.shared.cache.get(key)
    }

    #[must_use]
    pub fn is_stale(&self, key: &TileKey) -> bool {
        self.shared.cache.is_stale(key)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.shared.cache.stats()
    }

    /// Jobs waiting for a worker
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Shutdown all workers
    pub fn shutdown(&self) {
        for _ in 0..self.config.workers {
            let _ = self.message_tx.send(WorkerMessage::Shutdown);
        }
    }

    fn plan(&self, areas: &[VisibleArea]) -> Vec<Planned> {
        let mut visible_px = Vec::with_capacity(areas.len());
        let mut viewport = Rect::default();
        for area in areas {
            let transform = area.transform();
            let page_px = Rect::from_origin_size(Point::default(), transform.pixel_size());
            let rect = page_px
                .intersection(&snap_out(transform.rect_to_pixel_f(area.rect)))
                .unwrap_or_default();
            viewport = viewport.union(&rect.translated(area.position.x, area.position.y));
            visible_px.push(rect);
        }
        let center = viewport.center();

        let mut planned = Vec::new();
        for (index, (area, visible)) in areas.iter().zip(visible_px).enumerate() {
            if visible.is_empty() {
                continue;
            }
            let transform = area.transform();
            let grid = TileGrid::new(transform.pixel_size(), self.config.tile_size);
            let scale = ScaleBucket::from_scale(area.scale);
            for (column, row, pixel_rect) in grid.covering(visible) {
                let tile_center = pixel_rect.translated(area.position.x, area.position.y).center();
                planned.push(Planned {
                    area: index,
                    key: TileKey {
                        page: area.page.id,
                        scale,
                        rotation: area.rotation,
                        column,
                        row,
                    },
                    pixel_rect,
                    intrinsic_rect: transform.rect_from_pixel(pixel_rect),
                    distance: distance_squared(tile_center, center),
                });
            }
        }
        planned
    }

    fn content_for(&mut self, plan: &Planned) -> TileContent {
        let shared = Arc::clone(&self.shared);
        let cache = &shared.cache;
        match cache.status(&plan.key) {
            TileStatus::Ready => {
                self.placeholders.remove(&plan.key);
                match cache.get(&plan.key) {
                    Some(tile) => TileContent::Ready(tile),
                    None => TileContent::Pending,
                }
            }
            TileStatus::Failed => {
                self.placeholders.remove(&plan.key);
                TileContent::Unavailable
            }
            TileStatus::Pending | TileStatus::Missing => {
                let sources = cache.placeholder_sources(&plan.key, self.config.placeholder_max_ratio);
                let Some(first) = sources.first() else {
                    self.placeholders.remove(&plan.key);
                    return TileContent::Pending;
                };
                let generation = cache.generation(plan.key.page);
                let source = first.key.scale;
                if let Some(kept) = self.placeholders.get(&plan.key) {
                    if kept.generation == generation && kept.source == source && kept.sources == sources.len() {
                        return TileContent::Placeholder(Arc::clone(&kept.tile));
                    }
                }
                match compose_placeholder(plan.key, plan.pixel_rect, plan.intrinsic_rect, generation, &sources) {
                    Some(tile) => {
                        let tile = Arc::new(tile);
                        self.placeholders.insert(
                            plan.key,
                            Placeholder {
                                generation,
                                source,
                                sources: sources.len(),
                                tile: Arc::clone(&tile),
                            },
                        );
                        TileContent::Placeholder(tile)
                    }
                    None => TileContent::Pending,
                }
            }
        }
    }

    fn next_id(&mut self) -> RequestId {
        let id = RequestId::new(self.next_request_id);
        self.next_request_id += 1;
        id
    }
}

impl Drop for TileService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Outward rounding that ignores floating point noise at pixel edges
fn snap_out(r: RectF) -> Rect {
    const EPS: f64 = 1e-6;
    let x0 = (r.x + EPS).floor();
    let y0 = (r.y + EPS).floor();
    let x1 = (r.right() - EPS).ceil().max(x0);
    let y1 = (r.bottom() - EPS).ceil().max(y0);
    Rect::new(x0 as i32, y0 as i32, (x1 - x0) as u32, (y1 - y0) as u32)
}

fn distance_squared(a: PointF, b: PointF) -> u64 {
    a.distance_squared(b).round() as u64
}
