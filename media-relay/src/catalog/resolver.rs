//! Encoding catalog resolution.
//!
//! Turns classified formats into three disjoint, quality-ordered buckets.

use serde::Serialize;
use tracing::debug;

use super::models::FormatDescriptor;

/// Default resolution floor for video-only candidates.
pub const DEFAULT_QUALITY_FLOOR: u32 = 720;

/// Audio-only, video-only and combined formats.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FormatCatalog {
    pub audio: Vec<FormatDescriptor>,
    pub video: Vec<FormatDescriptor>,
    #[serde(rename = "both")]
    pub combined: Vec<FormatDescriptor>,
}

impl FormatCatalog {
    pub fn is_empty(&self) -> bool {
        self.audio.is_empty() && self.video.is_empty() && self.combined.is_empty()
    }

    /// Whether `format_id` names a format carrying audio.
    pub fn is_audio_capable(&self, format_id: &str) -> bool {
        self.audio
            .iter()
            .chain(&self.combined)
            .any(|f| f.format_id == format_id)
    }

    /// Whether `format_id` names a format carrying video.
    pub fn is_video_capable(&self, format_id: &str) -> bool {
        self.video
            .iter()
            .chain(&self.combined)
            .any(|f| f.format_id == format_id)
    }
}

/// Resolves format lists into a [`FormatCatalog`].
#[derive(Debug, Clone)]
pub struct CatalogResolver {
    quality_floor: u32,
}

impl Default for CatalogResolver {
    fn default() -> Self {
        Self::new(DEFAULT_QUALITY_FLOOR)
    }
}

impl CatalogResolver {
    pub fn new(quality_floor: u32) -> Self {
        Self { quality_floor }
    }

    /// Group formats by codec presence, keeping catalog order and every entry.
    ///
    /// This is the raw view returned alongside the catalog by the info endpoint.
    pub fn classify(&self, formats: &[FormatDescriptor]) -> FormatCatalog {
        let mut catalog = FormatCatalog::default();
        for format in formats {
            if format.is_audio_only() {
                catalog.audio.push(format.clone());
            } else if format.is_video_only() {
                catalog.video.push(format.clone());
            } else if format.is_combined() {
                catalog.combined.push(format.clone());
            }
        }
        catalog
    }

    /// Build the ordered buckets used for selection.
    ///
    /// Entries without any known size are left out. Audio is ordered by
    /// descending size, video and combined by descending resolution; sorts are
    /// stable so ties keep catalog order. Video-only entries below the quality
    /// floor survive only when no video-only or combined entry reaches it.
    pub fn resolve(&self, formats: &[FormatDescriptor]) -> FormatCatalog {
        let sized: Vec<FormatDescriptor> = formats
            .iter()
            .filter(|f| f.filesize.is_some())
            .cloned()
            .collect();
        let mut catalog = self.classify(&sized);

        catalog
            .audio
            .sort_by(|a, b| b.filesize.unwrap_or(0).cmp(&a.filesize.unwrap_or(0)));
        catalog.video.sort_by(|a, b| b.height.cmp(&a.height));
        catalog.combined.sort_by(|a, b| b.height.cmp(&a.height));

        let floor = self.quality_floor;
        let reaches_floor = catalog
            .video
            .iter()
            .chain(&catalog.combined)
            .any(|f| f.height >= floor);
        if reaches_floor {
            catalog.video.retain(|f| f.height >= floor);
        }

        debug!(
            audio = catalog.audio.len(),
            video = catalog.video.len(),
            combined = catalog.combined.len(),
            skipped = formats.len() - sized.len(),
            "Resolved format catalog"
        );
        catalog
    }
}
