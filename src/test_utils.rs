pub mod test_helpers {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Condvar, Mutex, PoisonError};
    use std::time::{Duration, Instant};

    use image::{Rgba, RgbaImage};

    use crate::geometry::RectF;
    use crate::page::{PageId, PageSource};
    use crate::render::{BackendError, RenderBackend, RenderEvent, TargetSize, TileService, VectorFormat};

    /// One `render_region` call seen by the mock
    #[derive(Clone, Debug, PartialEq)]
    pub struct RenderCall {
        pub page: PageId,
        pub rect: RectF,
        pub target: TargetSize,
    }

    /// Blocks renders until opened
    #[derive(Debug, Default)]
    struct Gate {
        open: Mutex<bool>,
        changed: Condvar,
    }

    impl Gate {
        fn wait(&self) {
            let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
            while !*open {
                open = self.changed.wait(open).unwrap_or_else(PoisonError::into_inner);
            }
        }

        fn set(&self, value: bool) {
            *self.open.lock().unwrap_or_else(PoisonError::into_inner) = value;
            self.changed.notify_all();
        }
    }

    /// Backend producing flat-colored tiles, with knobs for failures,
    /// blocking and render groups
    #[derive(Debug)]
    pub struct MockBackend {
        calls: Mutex<Vec<RenderCall>>,
        failing: Mutex<HashSet<PageId>>,
        gate: Gate,
        groups: HashMap<PageId, u64>,
        size_override: Option<TargetSize>,
        active: Mutex<HashMap<u64, usize>>,
        max_group_overlap: AtomicUsize,
    }

    impl Default for MockBackend {
        fn default() -> Self {
            let gate = Gate::default();
            gate.set(true);
            Self {
                calls: Mutex::new(Vec::new()),
                failing: Mutex::new(HashSet::new()),
                gate,
                groups: HashMap::new(),
                size_override: None,
                active: Mutex::new(HashMap::new()),
                max_group_overlap: AtomicUsize::new(0),
            }
        }
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// A backend whose renders block until `release`
        pub fn gated() -> Self {
            let backend = Self::default();
            backend.gate.set(false);
            backend
        }

        /// Put pages into one render group
        pub fn with_group(mut self, pages: &[PageId], group: u64) -> Self {
            for page in pages {
                self.groups.insert(*page, group);
            }
            self
        }

        /// Always return images of this size, whatever was asked
        pub fn with_size_override(mut self, size: TargetSize) -> Self {
            self.size_override = Some(size);
            self
        }

        pub fn fail_page(&self, page: PageId) {
            self.failing.lock().unwrap_or_else(PoisonError::into_inner).insert(page);
        }

        pub fn heal_page(&self, page: PageId) {
            self.failing.lock().unwrap_or_else(PoisonError::into_inner).remove(&page);
        }

        pub fn release(&self) {
            self.gate.set(true);
        }

        pub fn block(&self) {
            self.gate.set(false);
        }

        /// Every render call so far, in the order they started
        pub fn calls(&self) -> Vec<RenderCall> {
            self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
        }

        /// Most renders of one group seen running at the same time
        pub fn max_group_overlap(&self) -> usize {
            self.max_group_overlap.load(Ordering::SeqCst)
        }

        /// Wait until at least `count` renders have started
        pub fn wait_for_calls(&self, count: usize, timeout: Duration) -> bool {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if self.call_count() >= count {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
            self.call_count() >= count
        }

        /// Color used for every pixel of a page
        pub fn color_of(page: PageId) -> Rgba<u8> {
            Rgba([(page.0 * 40 % 256) as u8, 128, 64, 255])
        }

        fn enter_group(&self, page: PageId) -> Option<u64> {
            let group = *self.groups.get(&page)?;
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            let count = active.entry(group).or_insert(0);
            *count += 1;
            self.max_group_overlap.fetch_max(*count, Ordering::SeqCst);
            Some(group)
        }

        fn leave_group(&self, group: Option<u64>) {
            if let Some(group) = group {
                let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(count) = active.get_mut(&group) {
                    *count -= 1;
                }
            }
        }
    }

    impl RenderBackend for MockBackend {
        fn render_region(
            &self,
            page: &PageSource,
            rect: RectF,
            target: TargetSize,
        ) -> Result<RgbaImage, BackendError> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(RenderCall {
                    page: page.id,
                    rect,
                    target,
                });
            let group = self.enter_group(page.id);
            self.gate.wait();
            // give other workers a chance to overlap if groups are broken
            if group.is_some() {
                std::thread::sleep(Duration::from_millis(5));
            }
            self.leave_group(group);

            if self
                .failing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&page.id)
            {
                return Err(BackendError::generic(format!("corrupt page {}", page.id)));
            }
            let size = self.size_override.unwrap_or(target);
            Ok(RgbaImage::from_pixel(size.width, size.height, Self::color_of(page.id)))
        }

        fn vector_output(
            &self,
            page: &PageSource,
            format: VectorFormat,
            rect: RectF,
        ) -> Result<Vec<u8>, BackendError> {
            if format == VectorFormat::Eps {
                return Err(BackendError::UnsupportedFormat { format: "eps" });
            }
            Ok(format!(
                "{} {} {} {} {} {}",
                format.as_str(),
                page.id,
                rect.x,
                rect.y,
                rect.width,
                rect.height
            )
            .into_bytes())
        }

        fn text(&self, page: &PageSource, rect: RectF) -> Result<String, BackendError> {
            let group = self.enter_group(page.id);
            if group.is_some() {
                std::thread::sleep(Duration::from_millis(5));
            }
            self.leave_group(group);
            if self
                .failing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&page.id)
            {
                return Err(BackendError::generic(format!("corrupt page {}", page.id)));
            }
            Ok(format!("text {} {} {} {} {}", page.id, rect.x, rect.y, rect.width, rect.height))
        }

        fn render_group(&self, page: &PageSource) -> Option<u64> {
            self.groups.get(&page.id).copied()
        }
    }

    /// Collect events until `done` holds for everything received, or time out
    pub fn wait_for_events<F>(service: &TileService, timeout: Duration, mut done: F) -> Vec<RenderEvent>
    where
        F: FnMut(&[RenderEvent]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();
        while !done(&events) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match service.response_receiver().recv_timeout(deadline - now) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }
        events
    }

    /// Wait for `count` region events (changed or unavailable)
    pub fn wait_for_regions(service: &TileService, count: usize, timeout: Duration) -> Vec<RenderEvent> {
        wait_for_events(service, timeout, |events| {
            events
                .iter()
                .filter(|e| {
                    matches!(
                        e,
                        RenderEvent::RegionChanged { .. } | RenderEvent::RegionUnavailable { .. }
                    )
                })
                .count()
                >= count
        })
    }
}

pub use test_helpers::{MockBackend, RenderCall, wait_for_events, wait_for_regions};
