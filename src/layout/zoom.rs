//! Zoom modes and fitting pages to the viewport

use serde::{Deserialize, Serialize};

use crate::geometry::Size;

/// How the zoom factor follows the viewport size
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoomMode {
    /// Zoom factor only changes when set explicitly
    #[default]
    Fixed,
    #[serde(alias = "fit-width")]
    FitWidth,
    #[serde(alias = "fit-height")]
    FitHeight,
    /// Whole page (or spread) visible
    #[serde(alias = "fit-both")]
    FitBoth,
}

impl ZoomMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoomMode::Fixed => "fixed",
            ZoomMode::FitWidth => "fit_width",
            ZoomMode::FitHeight => "fit_height",
            ZoomMode::FitBoth => "fit_both",
        }
    }

    /// Parse the names used in settings files and on the command line
    pub fn parse(name: &str) -> crate::error::Result<Self> {
        match name.to_ascii_lowercase().replace('-', "_").as_str() {
            "fixed" => Ok(Self::Fixed),
            "fit_width" => Ok(Self::FitWidth),
            "fit_height" => Ok(Self::FitHeight),
            "fit_both" => Ok(Self::FitBoth),
            _ => Err(crate::error::ViewError::UnknownOption {
                kind: "zoom mode",
                value: name.to_string(),
            }),
        }
    }
}

/// Zoom factor limits
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ZoomBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for ZoomBounds {
    fn default() -> Self {
        Self {
            min: ZoomBounds::MIN_SCALE,
            max: ZoomBounds::MAX_SCALE,
        }
    }
}

impl ZoomBounds {
    /// Smallest zoom factor allowed by default
    pub const MIN_SCALE: f64 = 0.05;
    /// Largest zoom factor allowed by default
    pub const MAX_SCALE: f64 = 64.0;
    /// Zoom in rate multiplier per step
    pub const ZOOM_IN_RATE: f64 = 1.1;
    /// Zoom out rate divisor per step
    pub const ZOOM_OUT_RATE: f64 = 1.1;

    /// Clamp factor to the valid range, mapping NaN/Inf to 1.0
    #[must_use]
    pub fn clamp(&self, factor: f64) -> f64 {
        if !factor.is_finite() || factor <= 0.0 {
            1.0_f64.clamp(self.min, self.max)
        } else {
            factor.clamp(self.min, self.max)
        }
    }

    #[must_use]
    pub fn step_in(&self, factor: f64) -> f64 {
        self.clamp(factor * Self::ZOOM_IN_RATE)
    }

    #[must_use]
    pub fn step_out(&self, factor: f64) -> f64 {
        self.clamp(factor / Self::ZOOM_OUT_RATE)
    }
}

/// Extent of the content to fit, split into the part that scales with zoom
/// and the fixed part (spacing and margins)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FitExtent {
    /// Content size at zoom 1.0, without spacing or margins
    pub content: Size,
    /// Spacing and margins, which do not scale
    pub fixed: Size,
}

/// Zoom factor making `extent` fit `viewport` under `mode`.
///
/// Returns `None` for `Fixed` or when there is nothing to fit.
#[must_use]
pub fn fit_factor(mode: ZoomMode, extent: FitExtent, viewport: Size) -> Option<f64> {
    if extent.content.is_empty() || viewport.is_empty() {
        return None;
    }
    let axis = |available: u32, fixed: u32, content: u32| {
        let usable = f64::from(available.saturating_sub(fixed)).max(1.0);
        usable / f64::from(content)
    };
    let width = axis(viewport.width, extent.fixed.width, extent.content.width);
    let height = axis(viewport.height, extent.fixed.height, extent.content.height);

    match mode {
        ZoomMode::Fixed => None,
        ZoomMode::FitWidth => Some(width),
        ZoomMode::FitHeight => Some(height),
        ZoomMode::FitBoth => Some(width.min(height)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent() -> FitExtent {
        FitExtent {
            content: Size::new(200, 400),
            fixed: Size::new(20, 20),
        }
    }

    #[test]
    fn fit_width_and_height() {
        let viewport = Size::new(420, 420);
        assert_eq!(fit_factor(ZoomMode::FitWidth, extent(), viewport), Some(2.0));
        assert_eq!(fit_factor(ZoomMode::FitHeight, extent(), viewport), Some(1.0));
        assert_eq!(fit_factor(ZoomMode::FitBoth, extent(), viewport), Some(1.0));
        assert_eq!(fit_factor(ZoomMode::Fixed, extent(), viewport), None);
    }

    #[test]
    fn empty_content_does_not_fit() {
        let empty = FitExtent {
            content: Size::default(),
            fixed: Size::default(),
        };
        assert_eq!(fit_factor(ZoomMode::FitBoth, empty, Size::new(10, 10)), None);
    }

    #[test]
    fn clamp_handles_nan() {
        let bounds = ZoomBounds { min: 0.5, max: 4.0 };
        assert_eq!(bounds.clamp(f64::NAN), 1.0);
        assert_eq!(bounds.clamp(10.0), 4.0);
        assert_eq!(bounds.clamp(0.1), 0.5);
        assert!(bounds.step_in(1.0) > 1.0);
        assert!(bounds.step_out(1.0) < 1.0);
    }
}
