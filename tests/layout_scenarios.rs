use std::sync::Arc;

use pageview::{LayoutConfig, LayoutMode, Orientation, Page, PageId, PageLayout, Point, Rect, Rotation};

fn document(count: usize) -> Vec<Page> {
    (0..count)
        .map(|i| Page::from_points(PageId(i as u64), 100.0, 100.0).unwrap())
        .collect()
}

fn layout(mode: LayoutMode, count: usize) -> PageLayout {
    let mut layout = PageLayout::new(LayoutConfig {
        mode,
        ..LayoutConfig::default()
    })
    .unwrap();
    layout.set_pages(document(count));
    layout.update();
    layout
}

fn assert_disjoint(layout: &PageLayout) {
    let rects: Vec<Rect> = layout.pages().iter().map(Page::rect).collect();
    for (i, a) in rects.iter().enumerate() {
        for b in &rects[i + 1..] {
            assert!(!a.intersects(b), "{a:?} overlaps {b:?}");
        }
    }
}

#[test]
fn test_double_right_spread_visibility() {
    let layout = layout(LayoutMode::DoubleRight, 10);
    assert_disjoint(&layout);

    let first = layout.page(0).unwrap().position();
    let second = layout.page(1).unwrap().position();
    let third = layout.page(2).unwrap().position();
    // the first page sits alone in the right column
    assert_ne!(first.x, second.x);
    assert_eq!(first.x, third.x);
    assert!(second.y > first.y);

    // viewport covering exactly the row of pages 3 and 4
    let row = layout.page(3).unwrap().rect().union(&layout.page(4).unwrap().rect());
    assert_eq!(layout.visible_pages(row), vec![3, 4]);
}

#[test]
fn test_update_is_idempotent_for_every_mode() {
    let modes = [LayoutMode::Single, LayoutMode::DoubleLeft, LayoutMode::DoubleRight, LayoutMode::Raster];
    for mode in modes {
        for orientation in [Orientation::Vertical, Orientation::Horizontal] {
            for rotation in [Rotation::Deg0, Rotation::Deg90, Rotation::Deg180, Rotation::Deg270] {
                let mut layout = layout(mode, 7);
                layout.set_orientation(orientation);
                layout.set_rotation(rotation);
                layout.update();
                let before: Vec<Point> = layout.pages().iter().map(Page::position).collect();
                let geometry = layout.geometry();

                layout.update();
                let after: Vec<Point> = layout.pages().iter().map(Page::position).collect();
                assert_eq!(before, after, "{mode:?} {orientation:?} {rotation:?}");
                assert_eq!(geometry, layout.geometry());
                assert_disjoint(&layout);
            }
        }
    }
}

#[test]
fn test_edit_scope_updates_once_on_drop() {
    let mut layout = layout(LayoutMode::Single, 2);
    let generation = layout.snapshot().generation();
    {
        let mut pages = layout.edit();
        pages.push(Page::from_points(PageId(10), 100.0, 300.0).unwrap());
        pages.push(Page::from_points(PageId(11), 100.0, 300.0).unwrap());
    }
    let snapshot = layout.snapshot();
    assert_eq!(snapshot.generation(), generation + 1);
    assert_eq!(snapshot.page_count(), 4);
    assert!(layout.geometry().height >= 2 * 100 + 2 * 300);
}

#[test]
fn test_snapshot_queries_from_another_thread() {
    let layout = layout(LayoutMode::DoubleLeft, 4);
    let snapshot = layout.snapshot();
    let probe = layout.page(3).unwrap().rect().center().round();

    let found = std::thread::spawn({
        let snapshot = Arc::clone(&snapshot);
        move || snapshot.page_at(probe)
    })
    .join()
    .unwrap();
    assert_eq!(found, Some(3));
    assert_eq!(snapshot.page_at(Point::new(-5, -5)), None);
}

#[test]
fn test_single_spread_mode_shows_current_group_only() {
    let mut layout = layout(LayoutMode::DoubleRight, 6);
    layout.set_continuous(false);
    layout.set_current_page(4).unwrap();
    layout.update();

    let shown: Vec<usize> = (0..6).filter(|&i| layout.page(i).unwrap().is_visible()).collect();
    assert_eq!(shown, vec![3, 4]);
    assert_eq!(layout.visible_pages(layout.geometry()), vec![3, 4]);
    assert!(layout.set_current_page(6).is_err());
}
