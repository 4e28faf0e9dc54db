//! Mapping between pixel, intrinsic and unit coordinate spaces
//!
//! - pixel space: integer, origin top-left, axes follow the displayed
//!   (rotated) orientation
//! - intrinsic space: the page's native units, unrotated, zoom independent
//! - unit space: `[0, 1] x [0, 1]`, unrotated, used for links and highlights
//!
//! Going from intrinsic to pixel space, rotation is applied first and the
//! scale second; the inverse undoes them in the opposite order.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ViewError};
use crate::geometry::{Point, PointF, Rect, RectF, Size, SizeF};

/// Clockwise page rotation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub const ALL: [Rotation; 4] = [
        Rotation::Deg0,
        Rotation::Deg90,
        Rotation::Deg180,
        Rotation::Deg270,
    ];

    /// Parse a rotation in degrees; only right angles in `0..360` are accepted
    pub fn from_degrees(degrees: i64) -> Result<Self> {
        match degrees {
            0 => Ok(Self::Deg0),
            90 => Ok(Self::Deg90),
            180 => Ok(Self::Deg180),
            270 => Ok(Self::Deg270),
            other => Err(ViewError::UnsupportedRotation(other)),
        }
    }

    #[must_use]
    pub const fn degrees(self) -> i64 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// True when width and height swap between intrinsic and pixel space
    #[must_use]
    pub const fn is_transposed(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }

    /// Rotate a further quarter turn clockwise
    #[must_use]
    pub const fn clockwise(self) -> Self {
        match self {
            Self::Deg0 => Self::Deg90,
            Self::Deg90 => Self::Deg180,
            Self::Deg180 => Self::Deg270,
            Self::Deg270 => Self::Deg0,
        }
    }

    #[must_use]
    pub const fn counter_clockwise(self) -> Self {
        match self {
            Self::Deg0 => Self::Deg270,
            Self::Deg90 => Self::Deg0,
            Self::Deg180 => Self::Deg90,
            Self::Deg270 => Self::Deg180,
        }
    }

    /// Combine two rotations
    #[must_use]
    pub fn add(self, other: Rotation) -> Self {
        let degrees = (self.degrees() + other.degrees()) % 360;
        Self::from_degrees(degrees).unwrap_or_default()
    }

    #[must_use]
    pub fn apply(self, size: SizeF) -> SizeF {
        if self.is_transposed() {
            size.transposed()
        } else {
            size
        }
    }
}

impl TryFrom<i64> for Rotation {
    type Error = ViewError;

    fn try_from(value: i64) -> Result<Self> {
        Self::from_degrees(value)
    }
}

impl From<Rotation> for i64 {
    fn from(value: Rotation) -> Self {
        value.degrees()
    }
}

/// Linear map for one page at one rotation and scale.
///
/// Holds only the parameters it was built from, so it is `Copy` and can be
/// shared freely between threads.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoordinateTransform {
    intrinsic: SizeF,
    rotation: Rotation,
    /// Pixels per intrinsic unit
    scale: f64,
}

impl CoordinateTransform {
    /// Build a transform, rejecting degenerate sizes and scales
    pub fn new(intrinsic: SizeF, rotation: Rotation, scale: f64) -> Result<Self> {
        if !intrinsic.is_valid() {
            return Err(ViewError::InvalidSize {
                width: intrinsic.width,
                height: intrinsic.height,
            });
        }
        if !(scale.is_finite() && scale > 0.0) {
            return Err(ViewError::InvalidScale(scale));
        }
        Ok(Self {
            intrinsic,
            rotation,
            scale,
        })
    }

    /// Build from parameters already validated by the caller (page setters)
    pub(crate) fn new_unchecked(intrinsic: SizeF, rotation: Rotation, scale: f64) -> Self {
        Self {
            intrinsic,
            rotation,
            scale,
        }
    }

    #[must_use]
    pub fn intrinsic_size(&self) -> SizeF {
        self.intrinsic
    }

    #[must_use]
    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    #[must_use]
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Displayed size in fractional pixels
    #[must_use]
    pub fn pixel_size_f(&self) -> SizeF {
        self.rotation.apply(self.intrinsic).scaled(self.scale)
    }

    /// Displayed size in whole pixels
    #[must_use]
    pub fn pixel_size(&self) -> Size {
        self.pixel_size_f().to_pixels()
    }

    /// Intrinsic point to fractional pixel position
    #[must_use]
    pub fn to_pixel_f(&self, p: PointF) -> PointF {
        let SizeF { width, height } = self.intrinsic;
        let rotated = match self.rotation {
            Rotation::Deg0 => p,
            Rotation::Deg90 => PointF::new(height - p.y, p.x),
            Rotation::Deg180 => PointF::new(width - p.x, height - p.y),
            Rotation::Deg270 => PointF::new(p.y, width - p.x),
        };
        PointF::new(rotated.x * self.scale, rotated.y * self.scale)
    }

    #[must_use]
    pub fn to_pixel(&self, p: PointF) -> Point {
        self.to_pixel_f(p).round()
    }

    /// Fractional pixel position to intrinsic point
    #[must_use]
    pub fn from_pixel_f(&self, p: PointF) -> PointF {
        let SizeF { width, height } = self.intrinsic;
        let r = PointF::new(p.x / self.scale, p.y / self.scale);
        match self.rotation {
            Rotation::Deg0 => r,
            Rotation::Deg90 => PointF::new(r.y, height - r.x),
            Rotation::Deg180 => PointF::new(width - r.x, height - r.y),
            Rotation::Deg270 => PointF::new(width - r.y, r.x),
        }
    }

    #[must_use]
    pub fn from_pixel(&self, p: Point) -> PointF {
        self.from_pixel_f(p.to_f())
    }

    #[must_use]
    pub fn intrinsic_to_unit(&self, p: PointF) -> PointF {
        PointF::new(p.x / self.intrinsic.width, p.y / self.intrinsic.height)
    }

    #[must_use]
    pub fn unit_to_intrinsic(&self, p: PointF) -> PointF {
        PointF::new(p.x * self.intrinsic.width, p.y * self.intrinsic.height)
    }

    #[must_use]
    pub fn unit_to_pixel(&self, p: PointF) -> Point {
        self.to_pixel(self.unit_to_intrinsic(p))
    }

    #[must_use]
    pub fn pixel_to_unit(&self, p: Point) -> PointF {
        self.intrinsic_to_unit(self.from_pixel(p))
    }

    /// Intrinsic rectangle to fractional pixel rectangle
    #[must_use]
    pub fn rect_to_pixel_f(&self, r: RectF) -> RectF {
        let a = self.to_pixel_f(PointF::new(r.x, r.y));
        let b = self.to_pixel_f(PointF::new(r.right(), r.bottom()));
        RectF::from_corners(a, b)
    }

    /// Intrinsic rectangle to the smallest pixel rectangle covering it
    #[must_use]
    pub fn rect_to_pixel(&self, r: RectF) -> Rect {
        self.rect_to_pixel_f(r).round_out()
    }

    #[must_use]
    pub fn rect_from_pixel_f(&self, r: RectF) -> RectF {
        let a = self.from_pixel_f(PointF::new(r.x, r.y));
        let b = self.from_pixel_f(PointF::new(r.right(), r.bottom()));
        RectF::from_corners(a, b)
    }

    #[must_use]
    pub fn rect_from_pixel(&self, r: Rect) -> RectF {
        self.rect_from_pixel_f(r.to_f())
    }

    #[must_use]
    pub fn unit_rect_to_intrinsic(&self, r: RectF) -> RectF {
        RectF::new(
            r.x * self.intrinsic.width,
            r.y * self.intrinsic.height,
            r.width * self.intrinsic.width,
            r.height * self.intrinsic.height,
        )
    }

    #[must_use]
    pub fn intrinsic_rect_to_unit(&self, r: RectF) -> RectF {
        RectF::new(
            r.x / self.intrinsic.width,
            r.y / self.intrinsic.height,
            r.width / self.intrinsic.width,
            r.height / self.intrinsic.height,
        )
    }

    #[must_use]
    pub fn unit_rect_to_pixel(&self, r: RectF) -> Rect {
        self.rect_to_pixel(self.unit_rect_to_intrinsic(r))
    }

    #[must_use]
    pub fn pixel_rect_to_unit(&self, r: Rect) -> RectF {
        self.intrinsic_rect_to_unit(self.rect_from_pixel(r))
    }
}
