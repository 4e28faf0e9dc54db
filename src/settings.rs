use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, ViewError};
use crate::layout::{LayoutConfig, LayoutMode, Orientation, ZoomBounds, ZoomMode};
use crate::render::{
    CacheBudget, DEFAULT_TILE_SIZE, OVERSAMPLE_THRESHOLD_DPI, PLACEHOLDER_MAX_RATIO, RasterOptions, TileConfig,
    default_workers,
};
use crate::transform::Rotation;

pub const CURRENT_VERSION: u32 = 1;
const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "pageview";

/// Every recognized view option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViewSettings {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub layout_mode: LayoutMode,

    #[serde(default)]
    pub orientation: Orientation,

    #[serde(default = "default_true")]
    pub continuous: bool,

    /// Degrees: 0, 90, 180 or 270
    #[serde(default)]
    pub rotation: Rotation,

    #[serde(default)]
    pub zoom_mode: ZoomMode,

    #[serde(default = "default_zoom_factor")]
    pub zoom_factor: f64,

    #[serde(default = "default_zoom_min")]
    pub zoom_min: f64,

    #[serde(default = "default_zoom_max")]
    pub zoom_max: f64,

    /// Output resolution in pixels per inch
    #[serde(default = "default_dpi")]
    pub dpi: f64,

    #[serde(default = "default_spacing")]
    pub spacing: u32,

    #[serde(default = "default_margin")]
    pub margin: u32,

    #[serde(default = "default_raster_columns")]
    pub raster_columns: usize,

    #[serde(default = "default_tile_size")]
    pub tile_size: u32,

    /// Cache budget in tiles
    #[serde(default = "default_cache_tiles")]
    pub cache_tiles: usize,

    /// Cache budget in bytes of pixel data
    #[serde(default = "default_cache_bytes")]
    pub cache_bytes: usize,

    /// Render threads; unset picks one less than the CPU count, at most 4
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    #[serde(default = "default_max_queued")]
    pub max_queued: usize,

    #[serde(default = "default_true")]
    pub oversample: bool,

    #[serde(default = "default_oversample_threshold")]
    pub oversample_threshold: f64,

    #[serde(default = "default_placeholder_max_ratio")]
    pub placeholder_max_ratio: f64,
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_true() -> bool {
    true
}

fn default_zoom_factor() -> f64 {
    1.0
}

fn default_zoom_min() -> f64 {
    ZoomBounds::MIN_SCALE
}

fn default_zoom_max() -> f64 {
    ZoomBounds::MAX_SCALE
}

fn default_dpi() -> f64 {
    72.0
}

fn default_spacing() -> u32 {
    8
}

fn default_margin() -> u32 {
    6
}

fn default_raster_columns() -> usize {
    4
}

fn default_tile_size() -> u32 {
    DEFAULT_TILE_SIZE
}

fn default_cache_tiles() -> usize {
    CacheBudget::default().max_tiles
}

fn default_cache_bytes() -> usize {
    CacheBudget::default().max_bytes
}

fn default_max_queued() -> usize {
    1024
}

fn default_oversample_threshold() -> f64 {
    OVERSAMPLE_THRESHOLD_DPI
}

fn default_placeholder_max_ratio() -> f64 {
    PLACEHOLDER_MAX_RATIO
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            layout_mode: LayoutMode::default(),
            orientation: Orientation::default(),
            continuous: true,
            rotation: Rotation::Deg0,
            zoom_mode: ZoomMode::default(),
            zoom_factor: default_zoom_factor(),
            zoom_min: default_zoom_min(),
            zoom_max: default_zoom_max(),
            dpi: default_dpi(),
            spacing: default_spacing(),
            margin: default_margin(),
            raster_columns: default_raster_columns(),
            tile_size: default_tile_size(),
            cache_tiles: default_cache_tiles(),
            cache_bytes: default_cache_bytes(),
            workers: None,
            max_queued: default_max_queued(),
            oversample: true,
            oversample_threshold: default_oversample_threshold(),
            placeholder_max_ratio: default_placeholder_max_ratio(),
        }
    }
}

/// Default settings location: `<config dir>/pageview/config.yaml`
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

impl ViewSettings {
    /// Parse settings from YAML and validate them
    pub fn from_yaml(content: &str) -> Result<Self> {
        let settings: ViewSettings = serde_yaml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| ViewError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_yaml(&content)?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Load from the default location, falling back to defaults when no
    /// file exists there
    pub fn load_default() -> Result<Self> {
        match config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!("No settings file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.layout_config().validate()?;
        self.tile_config().validate()?;
        if !(self.oversample_threshold.is_finite() && self.oversample_threshold >= 0.0) {
            return Err(ViewError::config("oversample_threshold must be a non-negative number"));
        }
        if self.cache_tiles == 0 {
            return Err(ViewError::config("cache_tiles must be at least 1"));
        }
        Ok(())
    }

    #[must_use]
    pub fn layout_config(&self) -> LayoutConfig {
        LayoutConfig {
            mode: self.layout_mode,
            orientation: self.orientation,
            continuous: self.continuous,
            rotation: self.rotation,
            zoom_mode: self.zoom_mode,
            zoom_factor: self.zoom_factor,
            zoom_bounds: ZoomBounds {
                min: self.zoom_min,
                max: self.zoom_max,
            },
            dpi: self.dpi,
            spacing: self.spacing,
            margin: self.margin,
            raster_columns: self.raster_columns,
            current_page: 0,
        }
    }

    #[must_use]
    pub fn tile_config(&self) -> TileConfig {
        TileConfig {
            tile_size: self.tile_size,
            budget: CacheBudget {
                max_tiles: self.cache_tiles,
                max_bytes: self.cache_bytes,
            },
            workers: self.workers.unwrap_or_else(default_workers),
            max_queued: self.max_queued,
            raster: RasterOptions {
                oversample: self.oversample,
                oversample_threshold: self.oversample_threshold,
            },
            placeholder_max_ratio: self.placeholder_max_ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let settings = ViewSettings::from_yaml("{}").unwrap();
        assert_eq!(settings, ViewSettings::default());
        assert_eq!(settings.layout_config(), LayoutConfig::default());
    }

    #[test]
    fn parses_recognized_options() {
        let settings = ViewSettings::from_yaml(
            "layout_mode: double-right\norientation: horizontal\ncontinuous: false\nrotation: 270\nzoom_mode: fit-width\nzoom_min: 0.5\nzoom_max: 8\ntile_size: 512\ncache_tiles: 64\nworkers: 2\n",
        )
        .unwrap();
        assert_eq!(settings.layout_mode, LayoutMode::DoubleRight);
        assert_eq!(settings.orientation, Orientation::Horizontal);
        assert!(!settings.continuous);
        assert_eq!(settings.rotation, Rotation::Deg270);
        assert_eq!(settings.zoom_mode, ZoomMode::FitWidth);

        let tiles = settings.tile_config();
        assert_eq!(tiles.tile_size, 512);
        assert_eq!(tiles.budget.max_tiles, 64);
        assert_eq!(tiles.workers, 2);
        assert_eq!(settings.layout_config().zoom_bounds, ZoomBounds { min: 0.5, max: 8.0 });
    }

    #[test]
    fn rejects_bad_values() {
        assert!(ViewSettings::from_yaml("rotation: 45").is_err());
        assert!(ViewSettings::from_yaml("zoom_min: 4\nzoom_max: 2").is_err());
        assert!(ViewSettings::from_yaml("layout_mode: triple").is_err());
        assert!(ViewSettings::from_yaml("tile_size: 0").is_err());
        assert!(ViewSettings::from_yaml("workers: 0").is_err());
        assert!(ViewSettings::from_yaml("no_such_option: 1").is_err());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = ViewSettings::load(Path::new("/nonexistent/pageview.yaml")).unwrap_err();
        assert!(matches!(err, ViewError::Io { .. }));
    }
}
