//! Render backend contract
//!
//! The engine never decodes documents itself. A backend turns an intrinsic
//! rectangle of a page into pixels (or vector bytes); calls are blocking and
//! only ever made from worker threads.

use std::fmt;

use image::RgbaImage;

use crate::geometry::{RectF, Size};
use crate::page::{PageId, PageSource};

/// Pixel dimensions a backend must produce, unrotated
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl From<Size> for TargetSize {
    fn from(size: Size) -> Self {
        Self::new(size.width, size.height)
    }
}

impl fmt::Display for TargetSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Vector export formats
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VectorFormat {
    Pdf,
    Svg,
    Eps,
}

impl VectorFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            VectorFormat::Pdf => "pdf",
            VectorFormat::Svg => "svg",
            VectorFormat::Eps => "eps",
        }
    }
}

/// Errors from render backends
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("unknown page {0}")]
    UnknownPage(PageId),

    #[error("{format} export is not supported by this backend")]
    UnsupportedFormat { format: &'static str },

    #[error("backend returned {actual}, expected {expected}")]
    SizeMismatch {
        expected: TargetSize,
        actual: TargetSize,
    },

    #[error("resize failed: {0}")]
    Resize(String),

    #[error("{detail}")]
    Generic { detail: String },
}

impl BackendError {
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic { detail: msg.into() }
    }
}

/// Produces pixels and vector output for pages
pub trait RenderBackend: Send + Sync {
    /// Render `rect` (intrinsic, unrotated) of `page` into an image of
    /// exactly `target` pixels
    fn render_region(
        &self,
        page: &PageSource,
        rect: RectF,
        target: TargetSize,
    ) -> Result<RgbaImage, BackendError>;

    /// Export `rect` of `page` as vector data
    fn vector_output(
        &self,
        page: &PageSource,
        format: VectorFormat,
        rect: RectF,
    ) -> Result<Vec<u8>, BackendError>;

    /// Text inside `rect` (intrinsic, unrotated) of `page`
    fn text(&self, _page: &PageSource, _rect: RectF) -> Result<String, BackendError> {
        Ok(String::new())
    }

    /// Pages sharing a group are never rendered concurrently
    fn render_group(&self, _page: &PageSource) -> Option<u64> {
        None
    }
}
