use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::fingerprint::Fingerprint;

/// Raster formats the extractor accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Jpeg,
    Png,
    Gif,
    Bmp,
    WebP,
    Tiff,
}

impl ImageKind {
    pub const EXTENSIONS: [&'static str; 8] =
        ["jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "webp"];

    pub fn from_format(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Jpeg => Some(Self::Jpeg),
            image::ImageFormat::Png => Some(Self::Png),
            image::ImageFormat::Gif => Some(Self::Gif),
            image::ImageFormat::Bmp => Some(Self::Bmp),
            image::ImageFormat::WebP => Some(Self::WebP),
            image::ImageFormat::Tiff => Some(Self::Tiff),
            _ => None,
        }
    }

    /// Whether `path` carries one of the indexed extensions (case-insensitive).
    pub fn has_supported_extension(path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| Self::EXTENSIONS.contains(&ext.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A fingerprinted file as persisted in the store, keyed by `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedImage {
    pub path: PathBuf,
    pub root: PathBuf,
    pub fingerprint: Fingerprint,
    pub resolution: Resolution,
    pub format: ImageKind,
    pub file_size_bytes: u64,
    pub modified_at: DateTime<Utc>,
    pub metadata_signature: Option<String>,
    pub camera: Option<String>,
    pub taken_at: Option<DateTime<Utc>>,
}

impl IndexedImage {
    /// True when the on-disk file still matches what was fingerprinted.
    pub fn is_current(&self, file_size_bytes: u64, modified_at: DateTime<Utc>) -> bool {
        self.file_size_bytes == file_size_bytes && self.modified_at == modified_at
    }
}

/// A directory that has completed at least one index pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedRoot {
    pub path: PathBuf,
    pub last_indexed_at: DateTime<Utc>,
    pub image_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub path: PathBuf,
    pub similarity: f64,
}
