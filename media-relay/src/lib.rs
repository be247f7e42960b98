//! media-relay library crate.
//!
//! Streams media fetched by yt-dlp (and transcoded by ffmpeg for audio)
//! straight to HTTP clients.

pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod selector;
pub mod utils;

pub use error::{Error, Result};
