//! Tile keys, rendered tiles and the tile grid

use std::num::NonZeroU32;

use fast_image_resize as fr;
use image::RgbaImage;

use crate::geometry::{Point, Rect, RectF, Size};
use crate::page::PageId;
use crate::transform::Rotation;

use super::backend::BackendError;

/// Scale in pixels per intrinsic unit, stored as millionths for stable hashing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScaleBucket(u64);

impl ScaleBucket {
    #[must_use]
    pub fn from_scale(scale: f64) -> Self {
        Self((scale * 1_000_000.0).round().max(1.0) as u64)
    }

    #[must_use]
    pub fn scale(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Ratio between two buckets, always >= 1
    #[must_use]
    pub fn ratio(self, other: ScaleBucket) -> f64 {
        let (a, b) = (self.scale(), other.scale());
        if a > b { a / b } else { b / a }
    }
}

/// Identity of one tile
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub page: PageId,
    pub scale: ScaleBucket,
    pub rotation: Rotation,
    pub column: u32,
    pub row: u32,
}

/// A rendered tile; never mutated once created
#[derive(Debug)]
pub struct Tile {
    pub key: TileKey,
    pub image: RgbaImage,
    /// Position within the page in (rotated) page pixels
    pub pixel_rect: Rect,
    /// Area of the page covered, in intrinsic units
    pub intrinsic_rect: RectF,
    /// Content generation of the page when the tile was requested
    pub generation: u64,
}

impl Tile {
    /// Approximate memory held by the pixel data
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.image.as_raw().len()
    }
}

/// Grid geometry for one page at one scale
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileGrid {
    page_size: Size,
    tile_size: u32,
}

impl TileGrid {
    #[must_use]
    pub fn new(page_size: Size, tile_size: u32) -> Self {
        Self {
            page_size,
            tile_size: tile_size.max(1),
        }
    }

    #[must_use]
    pub fn columns(&self) -> u32 {
        self.page_size.width.div_ceil(self.tile_size)
    }

    #[must_use]
    pub fn rows(&self) -> u32 {
        self.page_size.height.div_ceil(self.tile_size)
    }

    /// Pixel rect of a tile; edge tiles are clipped to the page
    #[must_use]
    pub fn tile_rect(&self, column: u32, row: u32) -> Rect {
        let x = column * self.tile_size;
        let y = row * self.tile_size;
        Rect::new(
            x as i32,
            y as i32,
            self.tile_size.min(self.page_size.width.saturating_sub(x)),
            self.tile_size.min(self.page_size.height.saturating_sub(y)),
        )
    }

    /// (column, row, pixel rect) of every tile overlapping `visible`
    #[must_use]
    pub fn covering(&self, visible: Rect) -> Vec<(u32, u32, Rect)> {
        let page = Rect::from_origin_size(Point::default(), self.page_size);
        let Some(visible) = page.intersection(&visible) else {
            return Vec::new();
        };
        let ts = self.tile_size as i32;
        let (c0, c1) = (visible.x / ts, (visible.right() - 1) / ts);
        let (r0, r1) = (visible.y / ts, (visible.bottom() - 1) / ts);

        let mut tiles = Vec::with_capacity(((c1 - c0 + 1) * (r1 - r0 + 1)) as usize);
        for row in r0..=r1 {
            for column in c0..=c1 {
                let (column, row) = (column as u32, row as u32);
                tiles.push((column, row, self.tile_rect(column, row)));
            }
        }
        tiles
    }
}

/// Resize RGBA pixels with fast_image_resize
pub(crate) fn resize_rgba(
    image: RgbaImage,
    size: Size,
    alg: fr::ResizeAlg,
) -> Result<RgbaImage, BackendError> {
    if image.dimensions() == (size.width, size.height) {
        return Ok(image);
    }
    let invalid = || BackendError::Resize(format!("cannot resize to {}x{}", size.width, size.height));
    let (src_width, src_height) = image.dimensions();

    let src = fr::Image::from_vec_u8(
        NonZeroU32::new(src_width).ok_or_else(invalid)?,
        NonZeroU32::new(src_height).ok_or_else(invalid)?,
        image.into_raw(),
        fr::PixelType::U8x4,
    )
    .map_err(|e| BackendError::Resize(e.to_string()))?;
    let mut dst = fr::Image::new(
        NonZeroU32::new(size.width).ok_or_else(invalid)?,
        NonZeroU32::new(size.height).ok_or_else(invalid)?,
        fr::PixelType::U8x4,
    );

    let mut resizer = fr::Resizer::new(alg);
    resizer
        .resize(&src.view(), &mut dst.view_mut())
        .map_err(|e| BackendError::Resize(e.to_string()))?;

    RgbaImage::from_raw(size.width, size.height, dst.into_vec()).ok_or_else(invalid)
}

/// Build a low quality stand-in for `target` from tiles of another scale.
///
/// All sources must share the target's page and rotation. Parts of the
/// target no source covers stay transparent. Returns `None` when nothing
/// overlaps.
pub(crate) fn compose_placeholder(
    key: TileKey,
    pixel_rect: Rect,
    intrinsic_rect: RectF,
    generation: u64,
    sources: &[std::sync::Arc<Tile>],
) -> Option<Tile> {
    let mut canvas = RgbaImage::new(pixel_rect.width, pixel_rect.height);
    let target = pixel_rect.to_f();
    let mut painted = false;

    for source in sources {
        let ratio = key.scale.scale() / source.key.scale.scale();
        let src = source.pixel_rect.to_f();
        // the source tile expressed in target pixels
        let scaled = RectF::new(src.x * ratio, src.y * ratio, src.width * ratio, src.height * ratio);
        let Some(overlap) = scaled.intersection(&target) else {
            continue;
        };

        let crop = RectF::new(
            overlap.x / ratio - src.x,
            overlap.y / ratio - src.y,
            overlap.width / ratio,
            overlap.height / ratio,
        )
        .round_out();
        let Some(crop) = crop.intersection(&Rect::from_origin_size(Point::default(), source.pixel_rect.size()))
        else {
            continue;
        };
        let dest = RectF::new(overlap.x - target.x, overlap.y - target.y, overlap.width, overlap.height).round_out();
        let Some(dest) = dest.intersection(&Rect::from_origin_size(Point::default(), pixel_rect.size())) else {
            continue;
        };

        let cropped = image::imageops::crop_imm(
            &source.image,
            crop.x as u32,
            crop.y as u32,
            crop.width,
            crop.height,
        )
        .to_image();
        let Ok(scaled) = resize_rgba(
            cropped,
            dest.size(),
            fr::ResizeAlg::Convolution(fr::FilterType::Bilinear),
        ) else {
            continue;
        };
        image::imageops::replace(&mut canvas, &scaled, i64::from(dest.x), i64::from(dest.y));
        painted = true;
    }

    painted.then(|| Tile {
        key,
        image: canvas,
        pixel_rect,
        intrinsic_rect,
        generation,
    })
}

/// Rotate an unrotated render into displayed orientation
pub(crate) fn rotate_image(image: RgbaImage, rotation: Rotation) -> RgbaImage {
    match rotation {
        Rotation::Deg0 => image,
        Rotation::Deg90 => image::imageops::rotate90(&image),
        Rotation::Deg180 => image::imageops::rotate180(&image),
        Rotation::Deg270 => image::imageops::rotate270(&image),
    }
}
