//! Service configuration.
//!
//! Everything is read from the environment (a `.env` file is honored by
//! `main`), falling back to defaults for unset variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::DEFAULT_QUALITY_FLOOR;
use crate::{Error, Result};

/// How retrieved media reaches the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Retriever writes to stdout; bytes flow straight to the response.
    #[default]
    Streaming,
    /// Retriever writes into a per-session workspace first, then the file is served.
    Staged,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Staged => "staged",
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "streaming" | "stream" => Ok(Self::Streaming),
            "staged" | "disk" => Ok(Self::Staged),
            other => Err(Error::config(format!("unknown delivery mode '{other}'"))),
        }
    }
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of the retrieval pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to the retriever binary (yt-dlp).
    pub ytdlp_path: String,
    /// Path to the transcoder binary (ffmpeg).
    pub ffmpeg_path: String,
    /// Delivery mode for every session.
    pub delivery_mode: DeliveryMode,
    /// Root under which per-session workspaces are created.
    pub staging_dir: PathBuf,
    /// Target bitrate for audio transcodes, in ffmpeg syntax.
    pub audio_bitrate: String,
    /// Abort a stream when no bytes arrive for this long. `None` disables it.
    pub idle_timeout: Option<Duration>,
    /// Ask the retriever for a title when the request carries none.
    pub resolve_filenames: bool,
    /// How long upstream children get to exit after the terminal child is done.
    pub upstream_grace: Duration,
    /// Video-only formats below this height are hidden when better ones exist.
    pub quality_floor: u32,
    /// Check explicit format ids against the source's formats before downloading.
    pub verify_format_ids: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            delivery_mode: DeliveryMode::Streaming,
            staging_dir: std::env::temp_dir().join("media-relay"),
            audio_bitrate: "192k".to_string(),
            idle_timeout: None,
            resolve_filenames: true,
            upstream_grace: Duration::from_secs(2),
            quality_floor: DEFAULT_QUALITY_FLOOR,
            verify_format_ids: false,
        }
    }
}

impl PipelineConfig {
    /// Load pipeline config from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `YTDLP_PATH`, `FFMPEG_PATH`
    /// - `DELIVERY_MODE` (`streaming` | `staged`)
    /// - `STAGING_DIR`
    /// - `AUDIO_BITRATE` (e.g. "192k")
    /// - `DOWNLOAD_IDLE_TIMEOUT_SECS` (0 disables)
    /// - `RESOLVE_FILENAMES` (true/false)
    /// - `QUALITY_FLOOR` (height in pixels, e.g. 720)
    /// - `VERIFY_FORMAT_IDS` (true/false)
    pub fn from_env_or_default() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env_or_default`](Self::from_env_or_default) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get("YTDLP_PATH") {
            config.ytdlp_path = path;
        }
        if let Some(path) = get("FFMPEG_PATH") {
            config.ffmpeg_path = path;
        }
        if let Some(mode) = get("DELIVERY_MODE") {
            config.delivery_mode = mode.parse()?;
        }
        if let Some(dir) = get("STAGING_DIR") {
            config.staging_dir = PathBuf::from(dir);
        }
        if let Some(bitrate) = get("AUDIO_BITRATE") {
            if !is_valid_bitrate(&bitrate) {
                return Err(Error::config(format!("invalid AUDIO_BITRATE '{bitrate}'")));
            }
            config.audio_bitrate = bitrate;
        }
        if let Some(secs) = get("DOWNLOAD_IDLE_TIMEOUT_SECS") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                Error::config(format!("invalid DOWNLOAD_IDLE_TIMEOUT_SECS '{secs}'"))
            })?;
            config.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(flag) = get("RESOLVE_FILENAMES") {
            config.resolve_filenames = parse_bool("RESOLVE_FILENAMES", &flag)?;
        }
        if let Some(floor) = get("QUALITY_FLOOR") {
            config.quality_floor = floor
                .trim()
                .parse()
                .map_err(|_| Error::config(format!("invalid QUALITY_FLOOR '{floor}'")))?;
        }
        if let Some(flag) = get("VERIFY_FORMAT_IDS") {
            config.verify_format_ids = parse_bool("VERIFY_FORMAT_IDS", &flag)?;
        }

        Ok(config)
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
    pub log_dir: String,
    pub pipeline: PipelineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 12556,
            enable_cors: true,
            log_dir: "logs".to_string(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from `API_BIND_ADDRESS`, `API_PORT`, `API_ENABLE_CORS`, `LOG_DIR`
    /// plus everything [`PipelineConfig`] reads.
    pub fn from_env_or_default() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(bind_address) = get("API_BIND_ADDRESS") {
            config.bind_address = bind_address;
        }
        if let Some(port) = get("API_PORT") {
            config.port = port
                .trim()
                .parse()
                .map_err(|_| Error::config(format!("invalid API_PORT '{port}'")))?;
        }
        if let Some(flag) = get("API_ENABLE_CORS") {
            config.enable_cors = parse_bool("API_ENABLE_CORS", &flag)?;
        }
        if let Some(dir) = get("LOG_DIR") {
            config.log_dir = dir;
        }
        config.pipeline = PipelineConfig::from_lookup(&lookup)?;

        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::config(format!("invalid {key} '{other}'"))),
    }
}

// ffmpeg accepts plain numbers or a k/M suffix.
fn is_valid_bitrate(value: &str) -> bool {
    let digits = value.trim_end_matches(['k', 'K', 'm', 'M']);
    !digits.is_empty()
        && digits.len() + 1 >= value.len()
        && digits.chars().all(|c| c.is_ascii_digit())
}
