//! Tile cache sharded by page
//!
//! Each shard owns the tiles of a subset of pages behind its own mutex, so a
//! lookup for one page never waits on a write for another. Recency is kept
//! per shard by the LRU list and globally by an access stamp, which is what
//! eviction compares across shards.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use log::debug;
use lru::LruCache;

use crate::page::PageId;
use crate::transform::Rotation;

use super::request::RequestId;
use super::tile::{ScaleBucket, Tile, TileKey};

/// Limits for rendered tiles kept in memory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheBudget {
    pub max_tiles: usize,
    pub max_bytes: usize,
}

impl Default for CacheBudget {
    fn default() -> Self {
        Self {
            max_tiles: 512,
            max_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Lifecycle of one tile key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileStatus {
    Missing,
    Pending,
    Ready,
    /// The backend failed; not retried until `retry_failed`
    Failed,
}

/// Outcome of storing a finished render
#[derive(Debug)]
pub enum Completion {
    /// Stored; `visible` tells whether the tile is part of the visible set
    Stored { tile: Arc<Tile>, visible: bool },
    /// The page changed since the job was queued; result dropped
    Discarded,
}

/// Snapshot of cache occupancy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub ready: usize,
    pub pending: usize,
    pub failed: usize,
    pub bytes: usize,
    pub visible: usize,
}

#[derive(Debug)]
enum Slot {
    Pending(RequestId),
    Ready(Arc<Tile>),
    Failed,
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    last_used: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct PageState {
    generation: u64,
    display: Option<(ScaleBucket, Rotation)>,
}

#[derive(Debug)]
struct Shard {
    entries: LruCache<TileKey, Entry>,
    pages: HashMap<PageId, PageState>,
}

impl Shard {
    fn is_stale(&self, key: &TileKey) -> bool {
        self.pages
            .get(&key.page)
            .and_then(|p| p.display)
            .is_some_and(|(scale, rotation)| scale != key.scale || rotation != key.rotation)
    }

    fn generation(&self, page: PageId) -> u64 {
        self.pages.get(&page).map_or(0, |p| p.generation)
    }
}

/// Thread-safe tile store shared by the service and its workers
#[derive(Debug)]
pub struct TileCache {
    shards: Vec<Mutex<Shard>>,
    visible: RwLock<HashSet<TileKey>>,
    clock: AtomicU64,
    budget: CacheBudget,
}

impl TileCache {
    pub const DEFAULT_SHARDS: usize = 16;

    #[must_use]
    pub fn new(budget: CacheBudget) -> Self {
        Self::with_shards(budget, Self::DEFAULT_SHARDS)
    }

    #[must_use]
    pub fn with_shards(budget: CacheBudget, shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1))
                .map(|_| {
                    Mutex::new(Shard {
                        entries: LruCache::unbounded(),
                        pages: HashMap::new(),
                    })
                })
                .collect(),
            visible: RwLock::new(HashSet::new()),
            clock: AtomicU64::new(0),
            budget,
        }
    }

    #[must_use]
    pub fn budget(&self) -> CacheBudget {
        self.budget
    }

    /// Current state of a key, without touching recency
    #[must_use]
    pub fn status(&self, key: &TileKey) -> TileStatus {
        match self.shard(key.page).entries.peek(key) {
            None => TileStatus::Missing,
            Some(Entry { slot: Slot::Pending(_), .. }) => TileStatus::Pending,
            Some(Entry { slot: Slot::Ready(_), .. }) => TileStatus::Ready,
            Some(Entry { slot: Slot::Failed, .. }) => TileStatus::Failed,
        }
    }

    /// A ready tile, marking it as recently used
    #[must_use]
    pub fn get(&self, key: &TileKey) -> Option<Arc<Tile>> {
        let stamp = self.tick();
        let mut shard = self.shard(key.page);
        let entry = shard.entries.get_mut(key)?;
        match &entry.slot {
            Slot::Ready(tile) => {
                entry.last_used = stamp;
                Some(Arc::clone(tile))
            }
            _ => None,
        }
    }

    /// True when the key's scale or rotation no longer matches its page
    #[must_use]
    pub fn is_stale(&self, key: &TileKey) -> bool {
        self.shard(key.page).is_stale(key)
    }

    /// Content generation of a page
    #[must_use]
    pub fn generation(&self, page: PageId) -> u64 {
        self.shard(page).generation(page)
    }

    /// Record the scale and rotation a page is currently shown at
    pub fn set_display(&self, page: PageId, scale: ScaleBucket, rotation: Rotation) {
        self.shard(page).pages.entry(page).or_default().display = Some((scale, rotation));
    }

    /// Move a missing key to pending; false if it is in any other state
    pub fn mark_pending(&self, key: TileKey, id: RequestId) -> bool {
        let stamp = self.tick();
        let mut shard = self.shard(key.page);
        if shard.entries.contains(&key) {
            return false;
        }
        shard.pages.entry(key.page).or_default();
        shard.entries.put(
            key,
            Entry {
                slot: Slot::Pending(id),
                last_used: stamp,
            },
        );
        true
    }

    /// Worker safe point: is this job still wanted?
    #[must_use]
    pub fn claim(&self, key: &TileKey, id: RequestId, generation: u64) -> bool {
        let shard = self.shard(key.page);
        shard.generation(key.page) == generation
            && matches!(shard.entries.peek(key), Some(Entry { slot: Slot::Pending(p), .. }) if *p == id)
    }

    /// Drop a pending marker left by job `id`
    pub fn cancel(&self, key: &TileKey, id: RequestId) -> bool {
        let mut shard = self.shard(key.page);
        if matches!(shard.entries.peek(key), Some(Entry { slot: Slot::Pending(p), .. }) if *p == id) {
            shard.entries.pop(key);
            return true;
        }
        false
    }

    /// Store a finished render for job `id`.
    ///
    /// Results for an outdated page generation are dropped. Results of
    /// cancelled jobs are still valid pixels and are kept.
    pub fn complete(&self, id: RequestId, tile: Tile) -> Completion {
        let key = tile.key;
        let stamp = self.tick();
        let tile = Arc::new(tile);
        {
            let mut shard = self.shard(key.page);
            if shard.generation(key.page) != tile.generation {
                if matches!(shard.entries.peek(&key), Some(Entry { slot: Slot::Pending(p), .. }) if *p == id) {
                    shard.entries.pop(&key);
                }
                return Completion::Discarded;
            }
            shard.entries.put(
                key,
                Entry {
                    slot: Slot::Ready(Arc::clone(&tile)),
                    last_used: stamp,
                },
            );
        }
        Completion::Stored {
            tile,
            visible: self.is_visible(&key),
        }
    }

    /// Mark a key failed; returns whether the failure is current and visible
    pub fn fail(&self, key: TileKey, generation: u64) -> Option<bool> {
        let stamp = self.tick();
        {
            let mut shard = self.shard(key.page);
            if shard.generation(key.page) != generation {
                return None;
            }
            shard.entries.put(
                key,
                Entry {
                    slot: Slot::Failed,
                    last_used: stamp,
                },
            );
        }
        Some(self.is_visible(&key))
    }

    /// Clear failed markers of a page so its tiles get requested again
    pub fn retry_failed(&self, page: PageId) -> usize {
        let mut shard = self.shard(page);
        let failed: Vec<TileKey> = shard
            .entries
            .iter()
            .filter(|(k, e)| k.page == page && matches!(e.slot, Slot::Failed))
            .map(|(k, _)| *k)
            .collect();
        for key in &failed {
            shard.entries.pop(key);
        }
        failed.len()
    }

    /// Replace the visible set
    pub fn set_visible(&self, keys: HashSet<TileKey>) {
        *self.visible.write().unwrap_or_else(PoisonError::into_inner) = keys;
    }

    #[must_use]
    pub fn is_visible(&self, key: &TileKey) -> bool {
        self.visible
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// Revert pending keys outside the visible set to missing
    pub fn cancel_hidden(&self) -> usize {
        let visible = self.visible.read().unwrap_or_else(PoisonError::into_inner);
        let mut cancelled = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            let hidden: Vec<TileKey> = shard
                .entries
                .iter()
                .filter(|(k, e)| matches!(e.slot, Slot::Pending(_)) && !visible.contains(k))
                .map(|(k, _)| *k)
                .collect();
            for key in &hidden {
                shard.entries.pop(key);
            }
            cancelled += hidden.len();
        }
        cancelled
    }

    /// Ready tiles of the same page and rotation at the closest other scale
    /// within `max_ratio`
    #[must_use]
    pub fn placeholder_sources(&self, key: &TileKey, max_ratio: f64) -> Vec<Arc<Tile>> {
        let shard = self.shard(key.page);
        let mut best: Option<(f64, ScaleBucket)> = None;
        for (k, e) in shard.entries.iter() {
            if k.page != key.page || k.rotation != key.rotation || k.scale == key.scale {
                continue;
            }
            if !matches!(e.slot, Slot::Ready(_)) {
                continue;
            }
            let ratio = k.scale.ratio(key.scale);
            if ratio <= max_ratio && best.is_none_or(|(r, _)| ratio < r) {
                best = Some((ratio, k.scale));
            }
        }
        let Some((_, scale)) = best else {
            return Vec::new();
        };
        shard
            .entries
            .iter()
            .filter(|(k, _)| k.page == key.page && k.rotation == key.rotation && k.scale == scale)
            .filter_map(|(_, e)| match &e.slot {
                Slot::Ready(tile) => Some(Arc::clone(tile)),
                _ => None,
            })
            .collect()
    }

    /// Forget everything about a page and bump its generation
    pub fn invalidate_page(&self, page: PageId) {
        let mut shard = self.shard(page);
        shard.pages.entry(page).or_default().generation += 1;
        let keys: Vec<TileKey> = shard
            .entries
            .iter()
            .filter(|(k, _)| k.page == page)
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            shard.entries.pop(key);
        }
        debug!("Invalidated {page}: dropped {} tiles", keys.len());
    }

    pub fn invalidate_all(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            for state in shard.pages.values_mut() {
                state.generation += 1;
            }
            shard.entries.clear();
        }
        debug!("Invalidated all pages");
    }

    /// Evict ready tiles and failure markers until the budget holds.
    ///
    /// Failure markers count against the tile limit but hold no bytes.
    /// Visible entries are never evicted, so the cache stays over budget when
    /// the visible set alone exceeds it. Stale entries go first, then least
    /// recently used.
    pub fn evict(&self) -> usize {
        let visible = self.visible.read().unwrap_or_else(PoisonError::into_inner);

        let mut count = 0usize;
        let mut bytes = 0usize;
        // (stale, last_used, bytes, key)
        let mut candidates: Vec<(bool, u64, usize, TileKey)> = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            for (key, entry) in shard.entries.iter() {
                let size = match &entry.slot {
                    Slot::Ready(tile) => tile.bytes(),
                    Slot::Failed => 0,
                    Slot::Pending(_) => continue,
                };
                count += 1;
                bytes += size;
                if !visible.contains(key) {
                    candidates.push((shard.is_stale(key), entry.last_used, size, *key));
                }
            }
        }

        if count <= self.budget.max_tiles && bytes <= self.budget.max_bytes {
            return 0;
        }

        // stale first, then oldest
        candidates.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        let mut evicted = 0;
        for (_, _, size, key) in candidates {
            if count <= self.budget.max_tiles && bytes <= self.budget.max_bytes {
                break;
            }
            let mut shard = self.shard(key.page);
            if matches!(
                shard.entries.peek(&key),
                Some(Entry {
                    slot: Slot::Ready(_) | Slot::Failed,
                    ..
                })
            ) {
                shard.entries.pop(&key);
                count -= 1;
                bytes = bytes.saturating_sub(size);
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!("Evicted {evicted} entries, {count} entries / {bytes} bytes left");
        }
        evicted
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            visible: self.visible.read().unwrap_or_else(PoisonError::into_inner).len(),
            ..CacheStats::default()
        };
        for shard in &self.shards {
            let shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            for (_, entry) in shard.entries.iter() {
                match &entry.slot {
                    Slot::Pending(_) => stats.pending += 1,
                    Slot::Ready(tile) => {
                        stats.ready += 1;
                        stats.bytes += tile.bytes();
                    }
                    Slot::Failed => stats.failed += 1,
                }
            }
        }
        stats
    }

    fn shard(&self, page: PageId) -> MutexGuard<'_, Shard> {
        let index = (page.0 % self.shards.len() as u64) as usize;
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new(CacheBudget::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Rect, RectF};
    use image::RgbaImage;

    fn key(page: u64, scale: f64, column: u32) -> TileKey {
        TileKey {
            page: PageId(page),
            scale: ScaleBucket::from_scale(scale),
            rotation: Rotation::Deg0,
            column,
            row: 0,
        }
    }

    fn tile(key: TileKey, generation: u64) -> Tile {
        Tile {
            key,
            image: RgbaImage::new(4, 4),
            pixel_rect: Rect::new(key.column as i32 * 4, 0, 4, 4),
            intrinsic_rect: RectF::new(0.0, 0.0, 4.0, 4.0),
            generation,
        }
    }

    fn ready(cache: &TileCache, key: TileKey, id: u64) {
        assert!(cache.mark_pending(key, RequestId(id)));
        assert!(cache.claim(&key, RequestId(id), 0));
        cache.complete(RequestId(id), tile(key, 0));
    }

    #[test]
    fn state_machine() {
        let cache = TileCache::default();
        let k = key(1, 1.0, 0);
        assert_eq!(cache.status(&k), TileStatus::Missing);
        assert!(cache.mark_pending(k, RequestId(1)));
        assert!(!cache.mark_pending(k, RequestId(2)));
        assert_eq!(cache.status(&k), TileStatus::Pending);
        assert!(!cache.claim(&k, RequestId(2), 0));

        cache.set_visible(HashSet::from([k]));
        assert!(matches!(
            cache.complete(RequestId(1), tile(k, 0)),
            Completion::Stored { visible: true, .. }
        ));
        assert_eq!(cache.status(&k), TileStatus::Ready);
        assert!(cache.get(&k).is_some());
    }

    #[test]
    fn outdated_generation_is_discarded() {
        let cache = TileCache::default();
        let k = key(1, 1.0, 0);
        cache.mark_pending(k, RequestId(1));
        cache.invalidate_page(PageId(1));
        assert_eq!(cache.generation(PageId(1)), 1);
        assert!(!cache.claim(&k, RequestId(1), 0));
        assert!(matches!(cache.complete(RequestId(1), tile(k, 0)), Completion::Discarded));
        assert_eq!(cache.status(&k), TileStatus::Missing);
        assert_eq!(cache.fail(k, 0), None);
    }

    #[test]
    fn cancelled_result_is_kept() {
        let cache = TileCache::default();
        let k = key(2, 1.0, 0);
        cache.mark_pending(k, RequestId(7));
        assert_eq!(cache.cancel_hidden(), 1);
        assert_eq!(cache.status(&k), TileStatus::Missing);
        assert!(matches!(
            cache.complete(RequestId(7), tile(k, 0)),
            Completion::Stored { visible: false, .. }
        ));
        assert_eq!(cache.status(&k), TileStatus::Ready);
    }

    #[test]
    fn failed_until_retried() {
        let cache = TileCache::default();
        let k = key(3, 1.0, 0);
        cache.mark_pending(k, RequestId(1));
        assert_eq!(cache.fail(k, 0), Some(false));
        assert_eq!(cache.status(&k), TileStatus::Failed);
        assert!(!cache.mark_pending(k, RequestId(2)));
        assert_eq!(cache.retry_failed(PageId(3)), 1);
        assert_eq!(cache.status(&k), TileStatus::Missing);
    }

    #[test]
    fn eviction_skips_visible_and_prefers_stale() {
        let cache = TileCache::new(CacheBudget {
            max_tiles: 2,
            max_bytes: usize::MAX,
        });
        let old = key(1, 2.0, 0);
        let recent = key(1, 1.0, 1);
        let shown = key(1, 1.0, 2);
        ready(&cache, old, 1);
        ready(&cache, shown, 2);
        ready(&cache, recent, 3);
        cache.set_display(PageId(1), ScaleBucket::from_scale(1.0), Rotation::Deg0);
        cache.set_visible(HashSet::from([shown]));

        // touch the stale tile so plain LRU would keep it
        let _ = cache.get(&old);
        assert!(cache.is_stale(&old));
        assert_eq!(cache.evict(), 1);
        assert_eq!(cache.status(&old), TileStatus::Missing);
        assert_eq!(cache.status(&shown), TileStatus::Ready);
        assert_eq!(cache.status(&recent), TileStatus::Ready);
    }

    #[test]
    fn failure_markers_share_the_tile_limit() {
        let cache = TileCache::new(CacheBudget {
            max_tiles: 3,
            max_bytes: usize::MAX,
        });
        let mut last = key(4, 1.0, 0);
        for step in 0..20 {
            let scale = 1.0 + f64::from(step) * 0.1;
            last = key(4, scale, 0);
            cache.set_display(PageId(4), ScaleBucket::from_scale(scale), Rotation::Deg0);
            cache.set_visible(HashSet::from([last]));
            assert_eq!(cache.fail(last, 0), Some(true));
            cache.evict();
        }
        assert!(cache.stats().failed <= 3, "{:?}", cache.stats());
        // the visible failure stays so it is not retried
        assert_eq!(cache.status(&last), TileStatus::Failed);
    }

    #[test]
    fn visible_tiles_may_exceed_budget() {
        let cache = TileCache::new(CacheBudget {
            max_tiles: 2,
            max_bytes: usize::MAX,
        });
        let keys: Vec<TileKey> = (0..3).map(|c| key(4, 1.0, c)).collect();
        cache.set_visible(keys.iter().copied().collect());
        for (i, k) in keys.iter().enumerate() {
            ready(&cache, *k, i as u64 + 1);
        }
        assert_eq!(cache.evict(), 0);
        assert_eq!(cache.stats().ready, 3);
    }

    #[test]
    fn placeholder_sources_pick_nearest_scale() {
        let cache = TileCache::default();
        ready(&cache, key(5, 1.0, 0), 1);
        ready(&cache, key(5, 1.0, 1), 2);
        ready(&cache, key(5, 3.0, 0), 3);
        ready(&cache, key(5, 32.0, 0), 4);

        let sources = cache.placeholder_sources(&key(5, 2.0, 0), 4.0);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].key.scale, ScaleBucket::from_scale(3.0));

        assert!(cache.placeholder_sources(&key(5, 200.0, 0), 4.0).is_empty());
    }
}
