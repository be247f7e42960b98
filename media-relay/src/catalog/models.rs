//! Media and format descriptors.

use serde::{Deserialize, Serialize};

use crate::Result;

/// Raw media info as printed by `yt-dlp -J`.
///
/// Only the fields we use are modeled; everything else is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawMediaInfo {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
    pub webpage_url: Option<String>,
    pub formats: Vec<RawFormat>,
}

/// One entry of the raw `formats` array.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawFormat {
    pub format_id: String,
    pub ext: Option<String>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub height: Option<f64>,
    pub resolution: Option<String>,
    pub format_note: Option<String>,
    pub abr: Option<f64>,
}

/// A classified encoding offered by the source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatDescriptor {
    pub format_id: String,
    pub ext: String,
    /// Reported size, or the approximate one when no exact size is known.
    pub filesize: Option<u64>,
    pub has_video: bool,
    pub has_audio: bool,
    /// Human-readable quality label ("1080p", "audio only", ...).
    #[serde(rename = "resolution")]
    pub quality: String,
    /// Vertical resolution, zero when unknown.
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abr: Option<f64>,
}

impl FormatDescriptor {
    /// Classify a raw entry. Entries carrying neither audio nor video are dropped.
    pub fn from_raw(raw: &RawFormat) -> Option<Self> {
        let vcodec = present_codec(raw.vcodec.as_deref());
        let acodec = present_codec(raw.acodec.as_deref());
        if vcodec.is_none() && acodec.is_none() {
            return None;
        }
        if raw.format_id.trim().is_empty() {
            return None;
        }

        let height = parse_height(raw);
        let quality = if vcodec.is_none() {
            "audio only".to_string()
        } else {
            raw.format_note
                .clone()
                .filter(|s| !s.trim().is_empty())
                .or_else(|| raw.resolution.clone().filter(|s| !s.trim().is_empty()))
                .unwrap_or_else(|| format!("{height}p"))
        };

        Some(Self {
            format_id: raw.format_id.clone(),
            ext: raw.ext.clone().unwrap_or_default(),
            filesize: raw
                .filesize
                .and_then(as_byte_count)
                .or_else(|| raw.filesize_approx.and_then(as_byte_count)),
            has_video: vcodec.is_some(),
            has_audio: acodec.is_some(),
            quality,
            height,
            vcodec: vcodec.map(str::to_string),
            acodec: acodec.map(str::to_string),
            abr: raw.abr,
        })
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio && !self.has_video
    }

    pub fn is_video_only(&self) -> bool {
        self.has_video && !self.has_audio
    }

    pub fn is_combined(&self) -> bool {
        self.has_video && self.has_audio
    }
}

/// A fetched media source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaDescriptor {
    pub url: String,
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    /// Classified formats in catalog order.
    pub formats: Vec<FormatDescriptor>,
}

impl MediaDescriptor {
    pub fn from_raw(url: &str, raw: RawMediaInfo) -> Self {
        Self {
            url: raw.webpage_url.unwrap_or_else(|| url.to_string()),
            title: raw.title.filter(|t| !t.trim().is_empty()),
            duration: raw.duration,
            thumbnail: raw.thumbnail,
            formats: raw.formats.iter().filter_map(FormatDescriptor::from_raw).collect(),
        }
    }

    /// Parse the JSON printed by `yt-dlp -J`.
    pub fn parse(url: &str, json: &[u8]) -> Result<Self> {
        let raw: RawMediaInfo = serde_json::from_slice(json)?;
        Ok(Self::from_raw(url, raw))
    }
}

fn present_codec(codec: Option<&str>) -> Option<&str> {
    codec
        .map(str::trim)
        .filter(|c| !c.is_empty() && !c.eq_ignore_ascii_case("none"))
}

fn as_byte_count(value: f64) -> Option<u64> {
    (value.is_finite() && value > 0.0).then_some(value as u64)
}

/// Vertical resolution of a raw entry.
///
/// Tries the numeric `height`, then the `resolution` label (`1920x1080`,
/// `720p60`), then the `format_note`. Anything missing or non-numeric is zero.
pub fn parse_height(raw: &RawFormat) -> u32 {
    if let Some(height) = raw.height
        && height.is_finite()
        && height > 0.0
    {
        return height as u32;
    }
    raw.resolution
        .as_deref()
        .and_then(parse_resolution_label)
        .or_else(|| raw.format_note.as_deref().and_then(parse_resolution_label))
        .unwrap_or(0)
}

/// Parse a resolution label such as `1280x720`, `720p` or `1080p60`.
pub fn parse_resolution_label(label: &str) -> Option<u32> {
    let label = label.trim();
    let candidate = match label.split_once(['x', 'X']) {
        Some((_, height)) => height,
        None => label,
    };
    let digits: String = candidate
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok().filter(|h| *h > 0)
}
