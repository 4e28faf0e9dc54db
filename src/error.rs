//! Errors surfaced synchronously at the API boundary

use std::path::PathBuf;

/// Invariant violations and configuration failures.
///
/// Returned before any state is mutated. Render failures never show up
/// here; the scheduler absorbs them into failed tiles. Only synchronous
/// backend queries such as text lookup surface `Backend`.
#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    #[error("unsupported rotation {0}, expected 0, 90, 180 or 270")]
    UnsupportedRotation(i64),

    #[error("invalid page size {width}x{height}")]
    InvalidSize { width: f64, height: f64 },

    #[error("invalid scale factor {0}")]
    InvalidScale(f64),

    #[error("invalid dpi {0}")]
    InvalidDpi(f64),

    #[error("invalid rectangle: {0}")]
    InvalidRect(String),

    #[error("page {index} out of range ({count} pages)")]
    PageOutOfRange { index: usize, count: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown {kind} '{value}'")]
    UnknownOption { kind: &'static str, value: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Backend(#[from] crate::render::BackendError),
}

impl ViewError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

pub type Result<T, E = ViewError> = std::result::Result<T, E>;
