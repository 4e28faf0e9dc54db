//! Grid-bucket rectangle index
//!
//! Built once through [`SpatialIndexBuilder`] and queried through an
//! immutable [`SpatialIndex`]. There is no removal: when the rectangle set
//! changes the whole index is rebuilt and the old snapshot dropped.

use crate::geometry::{PointF, RectF};

/// Upper bound on grid cells along one axis
const MAX_CELLS_PER_AXIS: usize = 1024;

/// A rectangle and the payload it stands for
#[derive(Clone, Debug)]
pub struct Entry<T> {
    pub rect: RectF,
    pub payload: T,
    order: usize,
}

impl<T> Entry<T> {
    /// Insertion position of this entry
    #[must_use]
    pub fn order(&self) -> usize {
        self.order
    }
}

/// Append-only collector for index entries
#[derive(Debug)]
pub struct SpatialIndexBuilder<T> {
    entries: Vec<Entry<T>>,
}

impl<T> Default for SpatialIndexBuilder<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> SpatialIndexBuilder<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Add a rectangle. Empty or non-finite rectangles can never match a
    /// query and are dropped here.
    pub fn insert(&mut self, rect: RectF, payload: T) {
        if !rect.is_finite() || rect.is_empty() {
            return;
        }
        let order = self.entries.len();
        self.entries.push(Entry {
            rect,
            payload,
            order,
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freeze the collected entries into a queryable index
    #[must_use]
    pub fn finish(self) -> SpatialIndex<T> {
        SpatialIndex::build(self.entries)
    }
}

impl<T> FromIterator<(RectF, T)> for SpatialIndexBuilder<T> {
    fn from_iter<I: IntoIterator<Item = (RectF, T)>>(iter: I) -> Self {
        let mut builder = Self::new();
        for (rect, payload) in iter {
            builder.insert(rect, payload);
        }
        builder
    }
}

/// Immutable rectangle index answering point and overlap queries
#[derive(Clone, Debug)]
pub struct SpatialIndex<T> {
    entries: Vec<Entry<T>>,
    extent: RectF,
    cols: usize,
    rows: usize,
    cell_width: f64,
    cell_height: f64,
    cells: Vec<Vec<u32>>,
}

impl<T> Default for SpatialIndex<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            extent: RectF::default(),
            cols: 0,
            rows: 0,
            cell_width: 0.0,
            cell_height: 0.0,
            cells: Vec::new(),
        }
    }
}

impl<T> SpatialIndex<T> {
    fn build(entries: Vec<Entry<T>>) -> Self {
        if entries.is_empty() {
            return Self::default();
        }

        let extent = entries
            .iter()
            .fold(RectF::default(), |acc, e| acc.union(&e.rect));
        let n = entries.len() as f64;
        let mean_width = entries.iter().map(|e| e.rect.width).sum::<f64>() / n;
        let mean_height = entries.iter().map(|e| e.rect.height).sum::<f64>() / n;

        let mut cols = axis_cells(extent.width, mean_width);
        let mut rows = axis_cells(extent.height, mean_height);
        let max_cells = entries.len() * 4 + 16;
        while cols * rows > max_cells {
            if cols >= rows {
                cols = cols.div_ceil(2);
            } else {
                rows = rows.div_ceil(2);
            }
        }

        let mut index = Self {
            cell_width: extent.width / cols as f64,
            cell_height: extent.height / rows as f64,
            cells: vec![Vec::new(); cols * rows],
            entries,
            extent,
            cols,
            rows,
        };

        for (i, entry) in index.entries.iter().enumerate() {
            let (c0, c1, r0, r1) = index.cell_span(&entry.rect);
            for row in r0..=r1 {
                for col in c0..=c1 {
                    index.cells[row * cols + col].push(i as u32);
                }
            }
        }

        index
    }

    fn col_of(&self, x: f64) -> usize {
        let col = ((x - self.extent.x) / self.cell_width).floor();
        (col.max(0.0) as usize).min(self.cols - 1)
    }

    fn row_of(&self, y: f64) -> usize {
        let row = ((y - self.extent.y) / self.cell_height).floor();
        (row.max(0.0) as usize).min(self.rows - 1)
    }

    /// Inclusive cell range a rectangle touches
    fn cell_span(&self, rect: &RectF) -> (usize, usize, usize, usize) {
        (
            self.col_of(rect.x),
            self.col_of(rect.right()),
            self.row_of(rect.y),
            self.row_of(rect.bottom()),
        )
    }

    /// Entries whose rectangle contains `p`, smallest area first
    #[must_use]
    pub fn at(&self, p: PointF) -> Vec<&Entry<T>> {
        if self.entries.is_empty() || !p.is_finite() || !self.extent.contains(p) {
            return Vec::new();
        }

        let cell = &self.cells[self.row_of(p.y) * self.cols + self.col_of(p.x)];
        let mut hits: Vec<&Entry<T>> = cell
            .iter()
            .map(|&i| &self.entries[i as usize])
            .filter(|e| e.rect.contains(p))
            .collect();
        hits.sort_by(|a, b| {
            a.rect
                .area()
                .total_cmp(&b.rect.area())
                .then(a.order.cmp(&b.order))
        });
        hits
    }

    /// Innermost entry containing `p`
    #[must_use]
    pub fn first_at(&self, p: PointF) -> Option<&Entry<T>> {
        self.at(p).into_iter().next()
    }

    /// Entries overlapping `rect`, in insertion order
    #[must_use]
    pub fn intersecting(&self, rect: &RectF) -> Vec<&Entry<T>> {
        if self.entries.is_empty() || !rect.is_finite() || !self.extent.intersects(rect) {
            return Vec::new();
        }

        let (c0, c1, r0, r1) = self.cell_span(rect);
        let mut candidates: Vec<u32> = Vec::new();
        for row in r0..=r1 {
            for col in c0..=c1 {
                candidates.extend_from_slice(&self.cells[row * self.cols + col]);
            }
        }
        candidates.sort_unstable();
        candidates.dedup();

        candidates
            .into_iter()
            .map(|i| &self.entries[i as usize])
            .filter(|e| e.rect.intersects(rect))
            .collect()
    }

    /// Bounding rectangle of every entry
    #[must_use]
    pub fn extent(&self) -> RectF {
        self.extent
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry<T>> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn axis_cells(extent: f64, mean: f64) -> usize {
    if mean <= 0.0 || !extent.is_finite() {
        return 1;
    }
    ((extent / mean).ceil() as usize).clamp(1, MAX_CELLS_PER_AXIS)
}
