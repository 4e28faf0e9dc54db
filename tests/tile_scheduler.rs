use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pageview::render::{CacheBudget, RasterOptions, ScaleBucket, TileKey, TileStatus};
use pageview::test_utils::{MockBackend, wait_for_events, wait_for_regions};
use pageview::{
    BackendError, PageId, PageSource, RectF, RenderEvent, Rotation, SizeF, TargetSize, TileConfig, TileContent,
    TileService, VectorFormat, VisibleArea,
};

const WAIT: Duration = Duration::from_secs(10);

fn source(id: u64, width: f64, height: f64) -> PageSource {
    PageSource {
        id: PageId(id),
        intrinsic_size: SizeF::new(width, height),
        dpi: 96.0,
    }
}

fn service(backend: &Arc<MockBackend>, workers: usize, tile_size: u32) -> TileService {
    TileService::new(
        backend.clone(),
        TileConfig {
            tile_size,
            workers,
            ..TileConfig::default()
        },
    )
    .unwrap()
}

fn whole_page(page: PageSource, scale: f64) -> VisibleArea {
    let rect = RectF::new(0.0, 0.0, page.intrinsic_size.width, page.intrinsic_size.height);
    VisibleArea::new(page, Rotation::Deg0, scale, rect).unwrap()
}

fn key(page: u64, scale: f64, column: u32, row: u32) -> TileKey {
    TileKey {
        page: PageId(page),
        scale: ScaleBucket::from_scale(scale),
        rotation: Rotation::Deg0,
        column,
        row,
    }
}

fn changed_keys(events: &[RenderEvent]) -> Vec<TileKey> {
    events
        .iter()
        .filter_map(|e| match e {
            RenderEvent::RegionChanged { key, .. } => Some(*key),
            _ => None,
        })
        .collect()
}

#[test]
fn test_request_returns_before_rendering_finishes() {
    let backend = Arc::new(MockBackend::gated());
    let mut service = service(&backend, 2, 128);
    let page = source(0, 256.0, 256.0);

    let started = Instant::now();
    let response = service.request(&whole_page(page, 1.0));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(response.tiles.len(), 4);
    assert!(
        response
            .tiles
            .iter()
            .all(|t| matches!(t.content, TileContent::Pending))
    );

    backend.release();
    let events = wait_for_regions(&service, 4, WAIT);
    assert_eq!(changed_keys(&events).len(), 4);

    let response = service.request(&whole_page(page, 1.0));
    assert!(response.is_complete());
    let covered: u64 = response.tiles.iter().map(|t| t.rect.size().area()).sum();
    assert_eq!(covered, 256 * 256);
    assert_eq!(service.stats().ready, 4);
    assert_eq!(backend.call_count(), 4);
}

#[test]
fn test_invalidated_render_is_discarded() {
    let backend = Arc::new(MockBackend::gated());
    let mut service = service(&backend, 1, 256);
    let page = source(0, 256.0, 256.0);

    service.request(&whole_page(page, 1.0));
    assert!(backend.wait_for_calls(1, WAIT));
    // the worker is inside the backend; its result belongs to generation 0
    service.invalidate_page(page.id);
    backend.release();

    let events = wait_for_regions(&service, 1, Duration::from_millis(300));
    assert!(events.is_empty(), "outdated result was reported: {events:?}");
    assert_eq!(service.status(&key(0, 1.0, 0, 0)), TileStatus::Missing);

    // asking again produces a fresh entry for the new generation
    service.request(&whole_page(page, 1.0));
    let events = wait_for_regions(&service, 1, WAIT);
    match &events[..] {
        [RenderEvent::RegionChanged { tile, .. }] => assert_eq!(tile.generation, 1),
        other => panic!("unexpected events {other:?}"),
    }
    assert_eq!(service.status(&key(0, 1.0, 0, 0)), TileStatus::Ready);
    assert_eq!(backend.call_count(), 2);
}

#[test]
fn test_hidden_tile_result_is_kept_silently() {
    let backend = Arc::new(MockBackend::gated());
    let mut service = service(&backend, 1, 256);
    let first = source(0, 256.0, 256.0);
    let second = source(1, 256.0, 256.0);

    service.request(&whole_page(first, 1.0));
    assert!(backend.wait_for_calls(1, WAIT));
    // scroll away while the first page renders
    service.request(&whole_page(second, 1.0));
    assert_eq!(service.status(&key(0, 1.0, 0, 0)), TileStatus::Missing);
    backend.release();

    let events = wait_for_regions(&service, 1, WAIT);
    assert_eq!(changed_keys(&events), vec![key(1, 1.0, 0, 0)]);
    // a single worker finished the first page before starting the second
    assert_eq!(service.status(&key(0, 1.0, 0, 0)), TileStatus::Ready);

    let response = service.request(&whole_page(first, 1.0));
    assert!(response.is_complete());
    assert_eq!(backend.call_count(), 2);
}

#[test]
fn test_rapid_zoom_serves_final_scale_first() {
    let backend = Arc::new(MockBackend::gated());
    let mut service = service(&backend, 1, 128);
    let page = source(0, 256.0, 256.0);

    service.request(&whole_page(page, 1.0));
    assert!(backend.wait_for_calls(1, WAIT));

    service.begin_interactive_zoom();
    let zoomed = VisibleArea::new(page, Rotation::Deg0, 4.0, RectF::new(64.0, 64.0, 128.0, 128.0)).unwrap();
    let response = service.request(&zoomed);
    assert_eq!(response.tiles.len(), 16);
    service.end_interactive_zoom();

    service.request(&whole_page(page, 1.0));
    for tile in &response.tiles {
        assert_eq!(service.status(&tile.key), TileStatus::Missing);
    }
    assert!(service.queued() <= 4);

    backend.release();
    let events = wait_for_regions(&service, 4, WAIT);
    let keys = changed_keys(&events);
    assert_eq!(keys.len(), 4);
    assert!(keys.iter().all(|k| k.scale == ScaleBucket::from_scale(1.0)));
    // no 4.0 tile ever reached the backend
    assert!(backend.calls().iter().all(|c| c.rect.width == 128.0));
}

#[test]
fn test_visible_tiles_survive_a_small_budget() {
    let backend = Arc::new(MockBackend::new());
    let mut service = TileService::new(
        backend.clone(),
        TileConfig {
            tile_size: 128,
            workers: 2,
            budget: CacheBudget {
                max_tiles: 4,
                max_bytes: usize::MAX,
            },
            ..TileConfig::default()
        },
    )
    .unwrap();
    let wide = source(0, 640.0, 128.0);

    service.request(&whole_page(wide, 1.0));
    wait_for_regions(&service, 5, WAIT);
    let response = service.request(&whole_page(wide, 1.0));
    assert_eq!(response.tiles.len(), 5);
    assert!(response.is_complete());
    assert_eq!(service.stats().ready, 5);

    // once they scroll out, the budget applies again
    service.request(&whole_page(source(1, 128.0, 128.0), 1.0));
    wait_for_regions(&service, 1, WAIT);
    assert_eq!(service.status(&key(1, 1.0, 0, 0)), TileStatus::Ready);
    assert_eq!(service.stats().ready, 4);
}

#[test]
fn test_failed_tile_is_not_retried_automatically() {
    let backend = Arc::new(MockBackend::new());
    let mut service = service(&backend, 2, 256);
    let page = source(3, 256.0, 256.0);
    backend.fail_page(page.id);

    service.request(&whole_page(page, 1.0));
    let events = wait_for_regions(&service, 1, WAIT);
    assert!(matches!(events[..], [RenderEvent::RegionUnavailable { .. }]));
    assert_eq!(service.status(&key(3, 1.0, 0, 0)), TileStatus::Failed);

    let response = service.request(&whole_page(page, 1.0));
    assert!(matches!(response.tiles[0].content, TileContent::Unavailable));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(backend.call_count(), 1);

    backend.heal_page(page.id);
    assert_eq!(service.retry_failed(page.id), 1);
    service.request(&whole_page(page, 1.0));
    let events = wait_for_regions(&service, 1, WAIT);
    assert_eq!(changed_keys(&events), vec![key(3, 1.0, 0, 0)]);
    assert_eq!(backend.call_count(), 2);
}

#[test]
fn test_failures_across_zoom_steps_stay_bounded() {
    let backend = Arc::new(MockBackend::new());
    let mut service = TileService::new(
        backend.clone(),
        TileConfig {
            tile_size: 128,
            workers: 1,
            budget: CacheBudget {
                max_tiles: 4,
                max_bytes: usize::MAX,
            },
            ..TileConfig::default()
        },
    )
    .unwrap();
    let page = source(5, 32.0, 32.0);
    backend.fail_page(page.id);

    for step in 0..30 {
        service.request(&whole_page(page, 1.0 + f64::from(step) * 0.05));
        wait_for_regions(&service, 1, WAIT);
    }
    let stats = service.stats();
    assert!(stats.failed <= 4, "{stats:?}");
    assert_eq!(backend.call_count(), 30);
}

#[test]
fn test_wrong_size_from_backend_fails_the_tile() {
    let backend = Arc::new(MockBackend::new().with_size_override(TargetSize::new(3, 3)));
    let mut service = service(&backend, 1, 64);
    service.request(&whole_page(source(0, 64.0, 64.0), 1.0));

    let events = wait_for_regions(&service, 1, WAIT);
    match &events[..] {
        [RenderEvent::RegionUnavailable { error, .. }] => {
            assert!(matches!(error, BackendError::SizeMismatch { .. }));
        }
        other => panic!("unexpected events {other:?}"),
    }
}

#[test]
fn test_export_returns_backend_bytes() {
    let backend = Arc::new(MockBackend::new());
    let mut service = service(&backend, 2, 256);
    let page = source(0, 100.0, 100.0);

    let svg = service.export(page, VectorFormat::Svg, RectF::new(0.0, 0.0, 10.0, 10.0));
    let eps = service.export(page, VectorFormat::Eps, RectF::new(0.0, 0.0, 10.0, 10.0));
    let events = wait_for_events(&service, WAIT, |events| events.len() >= 2);
    assert_eq!(events.len(), 2);

    for event in events {
        let RenderEvent::VectorOutput { id, result, .. } = event else {
            panic!("unexpected event {event:?}");
        };
        if id == svg {
            assert_eq!(result.unwrap(), b"svg page#0 0 0 10 10".to_vec());
        } else {
            assert_eq!(id, eps);
            assert!(matches!(result, Err(BackendError::UnsupportedFormat { .. })));
        }
    }
}

#[test]
fn test_render_group_pages_never_render_concurrently() {
    let backend = Arc::new(MockBackend::new().with_group(&[PageId(0), PageId(1)], 7));
    let mut service = service(&backend, 4, 64);
    let areas = [whole_page(source(0, 128.0, 128.0), 1.0), whole_page(source(1, 128.0, 128.0), 1.0)];

    service.request_pass(&areas);
    let events = wait_for_regions(&service, 8, WAIT);
    assert_eq!(changed_keys(&events).len(), 8);
    assert_eq!(backend.max_group_overlap(), 1);
}

#[test]
fn test_text_lookup_waits_for_render_group() {
    let backend = Arc::new(MockBackend::new().with_group(&[PageId(0), PageId(1)], 7));
    let mut service = service(&backend, 4, 64);
    let first = source(0, 128.0, 128.0);
    let second = source(1, 128.0, 128.0);

    service.request(&whole_page(first, 1.0));
    for _ in 0..4 {
        let text = service.text(&second, RectF::new(0.0, 0.0, 10.0, 10.0)).unwrap();
        assert_eq!(text, "text 1 0 0 10 10");
    }
    wait_for_regions(&service, 4, WAIT);
    assert_eq!(backend.max_group_overlap(), 1);
}

#[test]
fn test_nearby_scale_is_used_as_placeholder() {
    let backend = Arc::new(MockBackend::new());
    let mut service = service(&backend, 2, 128);
    let page = source(2, 128.0, 128.0);

    service.request(&whole_page(page, 1.0));
    wait_for_regions(&service, 1, WAIT);

    backend.block();
    let zoomed = VisibleArea::new(page, Rotation::Deg0, 2.0, RectF::new(0.0, 0.0, 64.0, 64.0)).unwrap();
    let response = service.request(&zoomed);
    assert_eq!(response.tiles.len(), 1);
    match &response.tiles[0].content {
        TileContent::Placeholder(tile) => {
            assert_eq!(tile.image.dimensions(), (128, 128));
            let expected = MockBackend::color_of(page.id).0;
            let actual = tile.image.get_pixel(64, 64).0;
            assert!(
                expected.iter().zip(actual).all(|(e, a)| e.abs_diff(a) <= 1),
                "{actual:?} != {expected:?}"
            );
        }
        other => panic!("expected a placeholder, got {other:?}"),
    }
    // the composed placeholder is reused until the real tile lands
    let again = service.request(&zoomed);
    match (&response.tiles[0].content, &again.tiles[0].content) {
        (TileContent::Placeholder(first), TileContent::Placeholder(second)) => {
            assert!(Arc::ptr_eq(first, second));
        }
        other => panic!("expected placeholders, got {other:?}"),
    }

    // too far from any rendered scale
    let far = VisibleArea::new(page, Rotation::Deg0, 16.0, RectF::new(0.0, 0.0, 8.0, 8.0)).unwrap();
    let response = service.request(&far);
    assert!(matches!(response.tiles[0].content, TileContent::Pending));
    backend.release();
}

#[test]
fn test_low_resolution_tiles_are_oversampled() {
    let backend = Arc::new(MockBackend::new());
    let mut service = TileService::new(
        backend.clone(),
        TileConfig {
            tile_size: 100,
            workers: 1,
            raster: RasterOptions::default(),
            ..TileConfig::default()
        },
    )
    .unwrap();
    // 72 dpi points at scale 1 are below the oversampling threshold
    let page = PageSource {
        id: PageId(0),
        intrinsic_size: SizeF::new(100.0, 100.0),
        dpi: 72.0,
    };

    service.request(&whole_page(page, 1.0));
    let events = wait_for_regions(&service, 1, WAIT);
    let RenderEvent::RegionChanged { tile, .. } = &events[0] else {
        panic!("unexpected event {:?}", events[0]);
    };
    assert_eq!(tile.image.dimensions(), (100, 100));
    assert_eq!(backend.calls()[0].target, TargetSize::new(200, 200));
}

#[test]
fn test_repaint_sink_hears_visible_tiles() {
    let backend = Arc::new(MockBackend::new());
    let mut service = service(&backend, 2, 128);
    let seen: Arc<Mutex<Vec<(PageId, RectF)>>> = Arc::default();
    let sink_seen = seen.clone();
    service.set_repaint_sink(Some(Arc::new(move |page: PageId, rect: RectF| {
        sink_seen.lock().unwrap().push((page, rect));
    })));

    service.request(&whole_page(source(5, 256.0, 128.0), 1.0));
    wait_for_regions(&service, 2, WAIT);

    let mut seen = seen.lock().unwrap().clone();
    seen.sort_by(|a, b| a.1.x.total_cmp(&b.1.x));
    assert_eq!(
        seen,
        vec![
            (PageId(5), RectF::new(0.0, 0.0, 128.0, 128.0)),
            (PageId(5), RectF::new(128.0, 0.0, 128.0, 128.0)),
        ]
    );
}

#[test]
fn test_rotated_request_tiles_the_rotated_page() {
    let backend = Arc::new(MockBackend::new());
    let mut service = service(&backend, 2, 128);
    let page = source(0, 256.0, 128.0);
    let area = VisibleArea::new(page, Rotation::Deg90, 1.0, RectF::new(0.0, 0.0, 256.0, 128.0)).unwrap();

    let response = service.request(&area);
    // 128 x 256 on screen
    let mut cells: Vec<(u32, u32)> = response.tiles.iter().map(|t| (t.key.column, t.key.row)).collect();
    cells.sort_unstable();
    assert_eq!(cells, vec![(0, 0), (0, 1)]);

    wait_for_regions(&service, 2, WAIT);
    assert!(
        backend
            .calls()
            .iter()
            .all(|c| c.target == TargetSize::new(128, 128) && c.rect.height == 128.0)
    );
}
