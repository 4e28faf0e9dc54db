//! Pages and their clickable links

use std::fmt;

use crate::error::{Result, ViewError};
use crate::geometry::{Point, PointF, Rect, RectF, Size, SizeF};
use crate::spatial::{SpatialIndex, SpatialIndexBuilder};
use crate::transform::{CoordinateTransform, Rotation};

/// Resolution of PDF points
pub const POINTS_PER_INCH: f64 = 72.0;

/// Identity of a page as known to the render backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page#{}", self.0)
    }
}

/// What a render backend needs to know about a page
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PageSource {
    pub id: PageId,
    pub intrinsic_size: SizeF,
    /// Native units per inch
    pub dpi: f64,
}

/// A clickable area on a page
#[derive(Clone, Debug, PartialEq)]
pub struct Link {
    /// Area in unit coordinates
    pub area: RectF,
    /// Target URL, empty for purely internal links
    pub url: Option<String>,
    /// Zero-based page this link jumps to
    pub target_page: Option<usize>,
}

impl Link {
    /// A link to a URL
    #[must_use]
    pub fn url(area: RectF, url: impl Into<String>) -> Self {
        Self {
            area,
            url: Some(url.into()),
            target_page: None,
        }
    }

    /// A link to another page of the same document
    #[must_use]
    pub fn internal(area: RectF, target_page: usize) -> Self {
        Self {
            area,
            url: None,
            target_page: Some(target_page),
        }
    }

    /// Convert an intrinsic rectangle to the unit area a link expects
    #[must_use]
    pub fn unit_area(rect: RectF, page_size: SizeF) -> RectF {
        RectF::new(
            rect.x / page_size.width,
            rect.y / page_size.height,
            rect.width / page_size.width,
            rect.height / page_size.height,
        )
    }

    /// True for links that leave the document
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.url.as_deref().is_some_and(|u| u.contains("://"))
    }

    /// Last path segment of an external URL
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        if !self.is_external() {
            return None;
        }
        let url = self.url.as_deref()?;
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let (_, rest) = path.split_once("://")?;
        let (_, path) = rest.split_once('/')?;
        path.rsplit('/').next().filter(|s| !s.is_empty())
    }
}

/// Links of one page, indexed for hit testing in unit space
#[derive(Clone, Debug, Default)]
pub struct Links {
    index: SpatialIndex<Link>,
}

impl Links {
    #[must_use]
    pub fn new(links: Vec<Link>) -> Self {
        let mut builder = SpatialIndexBuilder::with_capacity(links.len());
        for link in links {
            builder.insert(link.area, link);
        }
        Self {
            index: builder.finish(),
        }
    }

    /// Links containing a unit-space point, innermost first
    #[must_use]
    pub fn at(&self, p: PointF) -> Vec<&Link> {
        self.index.at(p).into_iter().map(|e| &e.payload).collect()
    }

    /// Links overlapping a unit-space rectangle
    #[must_use]
    pub fn inside(&self, rect: &RectF) -> Vec<&Link> {
        self.index
            .intersecting(rect)
            .into_iter()
            .map(|e| &e.payload)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.index.iter().map(|e| &e.payload)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl FromIterator<Link> for Links {
    fn from_iter<I: IntoIterator<Item = Link>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// One document page.
///
/// Display size is always derived from the intrinsic size, dpi, rotation
/// and scale, so it can never drift out of sync with them.
#[derive(Clone, Debug)]
pub struct Page {
    source: PageSource,
    output_dpi: f64,
    rotation: Rotation,
    scale_factor: f64,
    position: Point,
    visible: bool,
    links: Links,
}

impl Page {
    /// Create a page of the given intrinsic size at `dpi` native units per inch
    pub fn new(id: PageId, intrinsic_size: SizeF, dpi: f64) -> Result<Self> {
        if !intrinsic_size.is_valid() {
            return Err(ViewError::InvalidSize {
                width: intrinsic_size.width,
                height: intrinsic_size.height,
            });
        }
        if !(dpi.is_finite() && dpi > 0.0) {
            return Err(ViewError::InvalidDpi(dpi));
        }
        Ok(Self {
            source: PageSource {
                id,
                intrinsic_size,
                dpi,
            },
            output_dpi: dpi,
            rotation: Rotation::Deg0,
            scale_factor: 1.0,
            position: Point::default(),
            visible: true,
            links: Links::default(),
        })
    }

    /// Create a page measured in PDF points
    pub fn from_points(id: PageId, width: f64, height: f64) -> Result<Self> {
        Self::new(id, SizeF::new(width, height), POINTS_PER_INCH)
    }

    #[must_use]
    pub fn with_links(mut self, links: Vec<Link>) -> Self {
        self.links = Links::new(links);
        self
    }

    #[must_use]
    pub fn id(&self) -> PageId {
        self.source.id
    }

    #[must_use]
    pub fn source(&self) -> &PageSource {
        &self.source
    }

    #[must_use]
    pub fn intrinsic_size(&self) -> SizeF {
        self.source.intrinsic_size
    }

    #[must_use]
    pub fn dpi(&self) -> f64 {
        self.source.dpi
    }

    #[must_use]
    pub fn output_dpi(&self) -> f64 {
        self.output_dpi
    }

    pub fn set_output_dpi(&mut self, dpi: f64) -> Result<()> {
        if !(dpi.is_finite() && dpi > 0.0) {
            return Err(ViewError::InvalidDpi(dpi));
        }
        self.output_dpi = dpi;
        Ok(())
    }

    #[must_use]
    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn set_rotation(&mut self, rotation: Rotation) {
        self.rotation = rotation;
    }

    #[must_use]
    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    pub fn set_scale_factor(&mut self, scale: f64) -> Result<()> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(ViewError::InvalidScale(scale));
        }
        self.scale_factor = scale;
        Ok(())
    }

    /// Layout-wide display settings; values were validated by the layout
    pub(crate) fn apply_display(&mut self, rotation: Rotation, scale: f64, output_dpi: f64) {
        self.rotation = rotation;
        self.scale_factor = scale;
        self.output_dpi = output_dpi;
    }

    /// Pixels per intrinsic unit at the current scale
    #[must_use]
    pub fn pixels_per_unit(&self) -> f64 {
        self.scale_factor * self.output_dpi / self.source.dpi
    }

    #[must_use]
    pub fn transform(&self) -> CoordinateTransform {
        CoordinateTransform::new_unchecked(
            self.source.intrinsic_size,
            self.rotation,
            self.pixels_per_unit(),
        )
    }

    /// Size on screen, after rotation and scale
    #[must_use]
    pub fn display_size(&self) -> Size {
        self.transform().pixel_size()
    }

    /// Top-left corner on the layout canvas
    #[must_use]
    pub fn position(&self) -> Point {
        self.position
    }

    pub(crate) fn set_position(&mut self, position: Point) {
        self.position = position;
    }

    /// Whether the active layout shows this page at all
    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub(crate) fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Page rectangle on the layout canvas
    #[must_use]
    pub fn rect(&self) -> Rect {
        Rect::from_origin_size(self.position, self.display_size())
    }

    #[must_use]
    pub fn links(&self) -> &Links {
        &self.links
    }

    /// Links under a point given in this page's pixel coordinates
    #[must_use]
    pub fn links_at(&self, p: Point) -> Vec<&Link> {
        self.links.at(self.transform().pixel_to_unit(p))
    }

    /// Pixel rectangle of a link on this page, relative to the page origin
    #[must_use]
    pub fn link_rect(&self, link: &Link) -> Rect {
        self.transform().unit_rect_to_pixel(link.area)
    }
}
