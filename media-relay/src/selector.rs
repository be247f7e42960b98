//! Download request validation and format selection.
//!
//! A [`DownloadRequest`] arrives straight from the client. [`SelectorBuilder`]
//! validates it and produces a [`DownloadPlan`] holding exactly one
//! [`FormatSelector`], which is what the retriever receives after `-f`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::catalog::FormatCatalog;
use crate::{Error, Result};

/// Characters with meaning in the retriever's selector grammar.
const SELECTOR_OPERATORS: &[char] = &['+', '/', ',', '[', ']', '(', ')'];

/// What the client wants to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    /// Audio transcoded to MP3.
    Audio,
    /// Video stream, merged with audio only when an audio id is given.
    Video,
    /// Video and audio merged.
    Both,
}

impl DownloadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Both => "both",
        }
    }

    /// Whether the retriever output goes through the transcoder.
    pub fn needs_transcode(&self) -> bool {
        matches!(self, Self::Audio)
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Audio => "audio/mpeg",
            Self::Video | Self::Both => "video/mp4",
        }
    }

    pub fn default_extension(&self) -> &'static str {
        match self {
            Self::Audio => "mp3",
            Self::Video | Self::Both => "mp4",
        }
    }
}

impl fmt::Display for DownloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "both" => Ok(Self::Both),
            other => Err(Error::validation(format!(
                "unknown download mode '{other}' (expected audio, video or both)"
            ))),
        }
    }
}

/// Body of `POST /api/download`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub download_mode: Option<String>,
    #[serde(default)]
    pub video_format_id: Option<String>,
    #[serde(default)]
    pub audio_format_id: Option<String>,
    /// Title already known to the client; skips the filename lookup.
    #[serde(default)]
    pub title: Option<String>,
}

/// A single retriever format selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatSelector {
    /// One explicit format id.
    Format(String),
    /// Explicit video id merged with an explicit audio id.
    Merge { video: String, audio: String },
    BestAudio,
    BestVideo,
    /// Best video plus best audio, falling back to the best combined format.
    BestMerged,
}

impl FormatSelector {
    /// The expression passed to the retriever.
    pub fn expression(&self) -> String {
        match self {
            Self::Format(id) => id.clone(),
            Self::Merge { video, audio } => format!("{video}+{audio}"),
            Self::BestAudio => "bestaudio".to_string(),
            Self::BestVideo => "bestvideo".to_string(),
            Self::BestMerged => "bestvideo+bestaudio/best".to_string(),
        }
    }

    /// Explicit format ids referenced by this selector.
    pub fn explicit_ids(&self) -> Vec<&str> {
        match self {
            Self::Format(id) => vec![id.as_str()],
            Self::Merge { video, audio } => vec![video.as_str(), audio.as_str()],
            Self::BestAudio | Self::BestVideo | Self::BestMerged => Vec::new(),
        }
    }
}

impl fmt::Display for FormatSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression())
    }
}

/// A validated download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadPlan {
    pub url: String,
    pub mode: DownloadMode,
    pub selector: FormatSelector,
    pub title: Option<String>,
}

/// Maps download requests to plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectorBuilder;

impl SelectorBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Validate a request and pick its selector.
    pub fn build(&self, request: &DownloadRequest) -> Result<DownloadPlan> {
        let url = validate_url(request.url.as_deref())?;
        let mode: DownloadMode = match non_empty(request.download_mode.as_deref()) {
            Some(mode) => mode.parse()?,
            None => return Err(Error::validation("downloadMode is required")),
        };

        let video = explicit_id("videoFormatId", request.video_format_id.as_deref())?;
        let audio = explicit_id("audioFormatId", request.audio_format_id.as_deref())?;

        let selector = match mode {
            DownloadMode::Audio => match audio {
                Some(id) => FormatSelector::Format(id),
                None => FormatSelector::BestAudio,
            },
            DownloadMode::Video => match (video, audio) {
                (Some(video), Some(audio)) => FormatSelector::Merge { video, audio },
                (Some(video), None) => FormatSelector::Format(video),
                (None, _) => FormatSelector::BestVideo,
            },
            DownloadMode::Both => match (video, audio) {
                (Some(video), Some(audio)) => FormatSelector::Merge { video, audio },
                _ => FormatSelector::BestMerged,
            },
        };

        Ok(DownloadPlan {
            url,
            mode,
            selector,
            title: non_empty(request.title.as_deref()).map(str::to_string),
        })
    }

    /// Like [`build`](Self::build), also checking explicit ids against a catalog.
    pub fn build_checked(
        &self,
        request: &DownloadRequest,
        catalog: &FormatCatalog,
    ) -> Result<DownloadPlan> {
        let plan = self.build(request)?;
        let (video, audio) = match &plan.selector {
            FormatSelector::Format(id) if plan.mode == DownloadMode::Audio => (None, Some(id)),
            FormatSelector::Format(id) => (Some(id), None),
            FormatSelector::Merge { video, audio } => (Some(video), Some(audio)),
            _ => (None, None),
        };
        if let Some(id) = video
            && !catalog.is_video_capable(id)
        {
            return Err(Error::validation(format!(
                "format '{id}' does not carry a video stream"
            )));
        }
        if let Some(id) = audio
            && !catalog.is_audio_capable(id)
        {
            return Err(Error::validation(format!(
                "format '{id}' does not carry an audio stream"
            )));
        }
        Ok(plan)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Require a non-empty http(s) URL with a host.
pub fn validate_url(url: Option<&str>) -> Result<String> {
    let Some(raw) = non_empty(url) else {
        return Err(Error::validation("url is required"));
    };
    let parsed = Url::parse(raw).map_err(|e| Error::validation(format!("invalid url: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Error::validation(format!(
            "unsupported url scheme '{}'",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(Error::validation("url has no host"));
    }
    Ok(raw.to_string())
}

fn explicit_id(field: &str, value: Option<&str>) -> Result<Option<String>> {
    let Some(raw) = value else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    if raw.chars().any(char::is_whitespace) {
        return Err(Error::validation(format!("{field} must not contain whitespace")));
    }
    if raw.contains(SELECTOR_OPERATORS) {
        return Err(Error::validation(format!(
            "{field} must be a single format id"
        )));
    }
    if raw.starts_with('-') {
        return Err(Error::validation(format!("{field} must not start with '-'")));
    }
    Ok(Some(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogResolver, FormatDescriptor};

    const URL: &str = "https://www.youtube.com/watch?v=aqz-KE-bpKQ";

    fn request(mode: &str, video: Option<&str>, audio: Option<&str>) -> DownloadRequest {
        DownloadRequest {
            url: Some(URL.to_string()),
            download_mode: Some(mode.to_string()),
            video_format_id: video.map(str::to_string),
            audio_format_id: audio.map(str::to_string),
            title: None,
        }
    }

    fn selector(req: DownloadRequest) -> String {
        SelectorBuilder::new().build(&req).unwrap().selector.expression()
    }

    #[test]
    fn audio_selection() {
        assert_eq!(selector(request("audio", None, None)), "bestaudio");
        assert_eq!(selector(request("audio", None, Some("140"))), "140");
        // A video id has no place in audio mode.
        assert_eq!(selector(request("audio", Some("137"), None)), "bestaudio");
    }

    #[test]
    fn video_selection() {
        assert_eq!(selector(request("video", None, None)), "bestvideo");
        assert_eq!(selector(request("video", Some("137"), None)), "137");
        assert_eq!(selector(request("video", Some("137"), Some("140"))), "137+140");
        assert_eq!(selector(request("video", None, Some("140"))), "bestvideo");
    }

    #[test]
    fn both_selection() {
        assert_eq!(selector(request("both", Some("137"), Some("140"))), "137+140");
        assert_eq!(
            selector(request("both", None, None)),
            "bestvideo+bestaudio/best"
        );
    }

    #[test]
    fn both_fallback_never_references_a_lone_id() {
        for (video, audio) in [(Some("137"), None), (None, Some("140"))] {
            let plan = SelectorBuilder::new()
                .build(&request("both", video, audio))
                .unwrap();
            assert_eq!(plan.selector, FormatSelector::BestMerged);
            assert!(plan.selector.explicit_ids().is_empty());
        }
    }

    #[test]
    fn mode_is_case_insensitive() {
        assert_eq!(selector(request("AUDIO", None, None)), "bestaudio");
    }

    #[test]
    fn blank_ids_count_as_absent() {
        assert_eq!(selector(request("audio", None, Some(""))), "bestaudio");
        assert_eq!(selector(request("video", Some("   "), None)), "bestvideo");
    }

    #[test]
    fn rejects_missing_fields() {
        let builder = SelectorBuilder::new();
        let mut req = request("audio", None, None);
        req.url = None;
        assert!(matches!(builder.build(&req), Err(Error::Validation(_))));

        let mut req = request("audio", None, None);
        req.url = Some("  ".to_string());
        assert!(matches!(builder.build(&req), Err(Error::Validation(_))));

        let mut req = request("audio", None, None);
        req.download_mode = None;
        assert!(matches!(builder.build(&req), Err(Error::Validation(_))));

        assert!(matches!(
            builder.build(&request("karaoke", None, None)),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn rejects_non_http_urls() {
        let builder = SelectorBuilder::new();
        for url in ["file:///etc/passwd", "ftp://host/x", "not a url", "-v", "http://"] {
            let mut req = request("audio", None, None);
            req.url = Some(url.to_string());
            assert!(
                matches!(builder.build(&req), Err(Error::Validation(_))),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_ids_that_could_alter_the_selector() {
        let builder = SelectorBuilder::new();
        for id in ["137+140", "best/worst", "a,b", "[height<480]", "(x)", "1 2", "--exec"] {
            assert!(
                matches!(
                    builder.build(&request("video", Some(id), None)),
                    Err(Error::Validation(_))
                ),
                "{id} should be rejected"
            );
            assert!(
                matches!(
                    builder.build(&request("audio", None, Some(id))),
                    Err(Error::Validation(_))
                ),
                "{id} should be rejected"
            );
        }
    }

    #[test]
    fn accepts_realistic_ids() {
        for id in ["140", "hls-1080p", "dash-audio_eng=128000", "251-drc"] {
            assert_eq!(selector(request("audio", None, Some(id))), id);
        }
    }

    #[test]
    fn title_hint_is_trimmed() {
        let mut req = request("audio", None, None);
        req.title = Some("  Song  ".to_string());
        let plan = SelectorBuilder::new().build(&req).unwrap();
        assert_eq!(plan.title.as_deref(), Some("Song"));

        req.title = Some(String::new());
        assert!(SelectorBuilder::new().build(&req).unwrap().title.is_none());
    }

    #[test]
    fn deserializes_camel_case_body() {
        let req: DownloadRequest = serde_json::from_str(
            r#"{"url":"https://youtu.be/x","downloadMode":"both",
                "videoFormatId":"137","audioFormatId":"140"}"#,
        )
        .unwrap();
        assert_eq!(req.download_mode.as_deref(), Some("both"));
        assert_eq!(selector(req), "137+140");
    }

    fn catalog() -> FormatCatalog {
        let fmt = |id: &str, video: bool, audio: bool| FormatDescriptor {
            format_id: id.to_string(),
            ext: "mp4".to_string(),
            filesize: Some(1),
            has_video: video,
            has_audio: audio,
            quality: String::new(),
            height: if video { 1080 } else { 0 },
            vcodec: None,
            acodec: None,
            abr: None,
        };
        CatalogResolver::default().classify(&[
            fmt("140", false, true),
            fmt("251", false, true),
            fmt("137", true, false),
            fmt("22", true, true),
        ])
    }

    #[test]
    fn checked_audio_ids_must_be_audio_capable() {
        let builder = SelectorBuilder::new();
        let catalog = catalog();
        for id in ["140", "251", "22"] {
            let plan = builder
                .build_checked(&request("audio", None, Some(id)), &catalog)
                .unwrap();
            for referenced in plan.selector.explicit_ids() {
                assert!(catalog.is_audio_capable(referenced));
            }
        }
        for id in ["137", "999"] {
            assert!(matches!(
                builder.build_checked(&request("audio", None, Some(id)), &catalog),
                Err(Error::Validation(_))
            ));
        }
    }

    #[test]
    fn checked_merge_validates_both_sides() {
        let builder = SelectorBuilder::new();
        let catalog = catalog();
        assert!(builder
            .build_checked(&request("both", Some("137"), Some("140")), &catalog)
            .is_ok());
        assert!(builder
            .build_checked(&request("both", Some("140"), Some("137")), &catalog)
            .is_err());
        assert!(builder
            .build_checked(&request("video", Some("140"), None), &catalog)
            .is_err());
        assert!(builder
            .build_checked(&request("both", None, None), &catalog)
            .is_ok());
    }

    #[test]
    fn mode_properties() {
        assert!(DownloadMode::Audio.needs_transcode());
        assert!(!DownloadMode::Both.needs_transcode());
        assert_eq!(DownloadMode::Audio.content_type(), "audio/mpeg");
        assert_eq!(DownloadMode::Video.content_type(), "video/mp4");
        assert_eq!(DownloadMode::Both.default_extension(), "mp4");
    }
}
