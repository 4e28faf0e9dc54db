//! Layout engines: policies placing pages on the virtual canvas

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::geometry::{Point, Size, SizeF};
use crate::transform::{CoordinateTransform, Rotation};

/// Direction in which rows of pages follow each other
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    /// Rows stack top to bottom, pages in a row run left to right
    #[default]
    Vertical,
    /// Rows become columns running left to right, pages in a column run top to bottom
    Horizontal,
}

/// What an engine knows about a page: its unrotated, unscaled geometry
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PageGeometry {
    pub intrinsic_size: SizeF,
    /// Native units per inch
    pub dpi: f64,
}

impl PageGeometry {
    /// Pixel size under the given display parameters
    #[must_use]
    pub fn display_size(&self, params: &LayoutParams) -> Size {
        let scale = params.zoom * params.dpi / self.dpi;
        CoordinateTransform::new_unchecked(self.intrinsic_size, params.rotation, scale).pixel_size()
    }
}

/// Display parameters shared by every page of a layout pass
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LayoutParams {
    pub rotation: Rotation,
    pub zoom: f64,
    /// Output resolution in pixels per inch
    pub dpi: f64,
    pub orientation: Orientation,
    /// Gap between neighbouring cells, in pixels
    pub spacing: u32,
    /// Empty border around the canvas, in pixels
    pub margin: u32,
}

/// Where one page ends up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub position: Point,
    pub size: Size,
}

/// A policy computing non-overlapping page positions.
///
/// Implementations must return exactly one placement per input page, keep
/// reading order, and never let two placements overlap.
pub trait LayoutEngine: Send + Sync + fmt::Debug {
    fn layout(&self, pages: &[PageGeometry], params: &LayoutParams) -> Vec<Placement>;

    /// Page ranges shown together when the view is not continuous
    fn display_groups(&self, count: usize) -> Vec<Range<usize>>;
}

/// Grid engine: `per_row` pages per row, the first page shifted right by
/// `first_offset` cells.
///
/// Covers single column (1, 0), two-page spreads starting left (2, 0) or
/// right (2, 1), and raster grids (n, 0).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowLayoutEngine {
    per_row: usize,
    first_offset: usize,
}

impl RowLayoutEngine {
    #[must_use]
    pub fn new(per_row: usize, first_offset: usize) -> Self {
        let per_row = per_row.max(1);
        Self {
            per_row,
            first_offset: first_offset.min(per_row - 1),
        }
    }

    #[must_use]
    pub fn single() -> Self {
        Self::new(1, 0)
    }

    #[must_use]
    pub fn double_left() -> Self {
        Self::new(2, 0)
    }

    #[must_use]
    pub fn double_right() -> Self {
        Self::new(2, 1)
    }

    #[must_use]
    pub fn raster(columns: usize) -> Self {
        Self::new(columns, 0)
    }

    #[must_use]
    pub fn per_row(&self) -> usize {
        self.per_row
    }

    /// (row, cell within row) of a page index
    fn slot(&self, index: usize) -> (usize, usize) {
        let slot = index + self.first_offset;
        (slot / self.per_row, slot % self.per_row)
    }
}

impl LayoutEngine for RowLayoutEngine {
    fn layout(&self, pages: &[PageGeometry], params: &LayoutParams) -> Vec<Placement> {
        if pages.is_empty() {
            return Vec::new();
        }

        let vertical = params.orientation == Orientation::Vertical;
        let sizes: Vec<Size> = pages.iter().map(|p| p.display_size(params)).collect();
        // "along" runs across rows, "across" runs within a row
        let along = |s: &Size| if vertical { s.height } else { s.width };
        let across = |s: &Size| if vertical { s.width } else { s.height };

        let (last_row, _) = self.slot(pages.len() - 1);
        let mut row_extent = vec![0u32; last_row + 1];
        let mut cell_extent = vec![0u32; self.per_row];
        for (i, size) in sizes.iter().enumerate() {
            let (row, cell) = self.slot(i);
            row_extent[row] = row_extent[row].max(along(size));
            cell_extent[cell] = cell_extent[cell].max(across(size));
        }

        let offsets = |extents: &[u32]| -> Vec<i64> {
            let mut acc = i64::from(params.margin);
            extents
                .iter()
                .map(|&e| {
                    let start = acc;
                    acc += i64::from(e) + i64::from(params.spacing);
                    start
                })
                .collect()
        };
        let row_start = offsets(&row_extent);
        let cell_start = offsets(&cell_extent);

        sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                let (row, cell) = self.slot(i);
                let a = row_start[row] + i64::from(row_extent[row] - along(&size)) / 2;
                let c = cell_start[cell] + i64::from(cell_extent[cell] - across(&size)) / 2;
                let (x, y) = if vertical { (c, a) } else { (a, c) };
                Placement {
                    position: Point::new(x as i32, y as i32),
                    size,
                }
            })
            .collect()
    }

    fn display_groups(&self, count: usize) -> Vec<Range<usize>> {
        let mut groups = Vec::new();
        let mut start = 0;
        while start < count {
            let (row, _) = self.slot(start);
            let row_end_slot = (row + 1) * self.per_row;
            let end = (row_end_slot - self.first_offset).min(count);
            groups.push(start..end);
            start = end;
        }
        groups
    }
}
