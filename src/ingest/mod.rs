//! Frame ingestion sources.
//!
//! This module provides the sources a stream worker pulls frames from:
//! - RTSP streams (IP cameras, feature: rtsp-gstreamer)
//! - HTTP snapshot / MJPEG endpoints (feature: ingest-http)
//! - Synthetic `stub://` source (demos and testing)
//!
//! Every source reports failures through `SourceError` so the worker can tell
//! an unreachable source (reconnect under backoff) from a transient read
//! failure on an open one (short fixed retry).
//!
//! Sources MUST NOT:
//! - Store frames to disk
//! - Log frame content
//! - Retain frames after handing them to the worker

#[cfg(feature = "ingest-http")]
pub mod http;
pub mod rtsp;

use anyhow::{anyhow, Result};
use std::fmt;
use thiserror::Error;

use crate::frame::Frame;

#[cfg(feature = "ingest-http")]
pub use http::{HttpConfig, HttpSource};
pub use rtsp::{RtspConfig, RtspSource};

/// Why a source could not produce a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The source cannot be reached or opened; the worker must reconnect.
    #[error("source unavailable: {0}")]
    Unavailable(String),
    /// The source is open but the next frame could not be read.
    #[error("frame read failed: {0}")]
    ReadFailure(String),
}

impl SourceError {
    pub fn unavailable(reason: impl fmt::Display) -> Self {
        Self::Unavailable(reason.to_string())
    }

    pub fn read_failure(reason: impl fmt::Display) -> Self {
        Self::ReadFailure(reason.to_string())
    }
}

/// A supplier of frames for one stream.
pub trait FrameSource: Send {
    /// Human-readable location (URL) for logs.
    fn describe(&self) -> String;

    /// Open (or re-open) the underlying stream.
    fn connect(&mut self) -> Result<(), SourceError>;

    /// Block until the next frame is available or the source fails.
    fn next_frame(&mut self) -> Result<Frame, SourceError>;

    /// Check if the source is healthy.
    fn is_healthy(&self) -> bool;

    /// Frames produced since creation.
    fn frames_captured(&self) -> u64;
}

/// Settings shared by every source the daemon opens.
#[derive(Clone, Debug)]
pub struct SourceSettings {
    /// Frame width for synthetic sources.
    pub width: u32,
    /// Frame height for synthetic sources.
    pub height: u32,
    /// Nominal camera frame rate; bounds how long a read may stall.
    pub target_fps: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            target_fps: 10,
        }
    }
}

/// Open a frame source for `url`, chosen by its scheme.
///
/// - `stub://...`: synthetic frames
/// - `rtsp://`, `rtsps://`: GStreamer RTSP (feature rtsp-gstreamer)
/// - `http://`, `https://`: JPEG snapshot or MJPEG (feature ingest-http)
pub fn open_source(url: &str, settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    match check_source_url(url)?.as_str() {
        "stub" | "rtsp" | "rtsps" => {
            let source = RtspSource::new(RtspConfig {
                url: url.to_string(),
                target_fps: settings.target_fps,
                width: settings.width,
                height: settings.height,
            })?;
            Ok(Box::new(source))
        }
        "http" | "https" => open_http(url),
        other => Err(anyhow!(
            "unsupported source scheme '{}'; expected stub, rtsp(s) or http(s)",
            other
        )),
    }
}

/// Validate that `url` names a scheme this build can open. Returns the
/// lower-cased scheme.
pub fn check_source_url(url: &str) -> Result<String> {
    let scheme = url
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .ok_or_else(|| anyhow!("source url '{}' has no scheme", url))?;

    match scheme.as_str() {
        "stub" => Ok(scheme),
        "rtsp" | "rtsps" if cfg!(feature = "rtsp-gstreamer") => Ok(scheme),
        "rtsp" | "rtsps" => Err(anyhow!(
            "source '{}' requires the rtsp-gstreamer feature",
            url
        )),
        "http" | "https" if cfg!(feature = "ingest-http") => Ok(scheme),
        "http" | "https" => Err(anyhow!("source '{}' requires the ingest-http feature", url)),
        other => Err(anyhow!(
            "unsupported source scheme '{}'; expected stub, rtsp(s) or http(s)",
            other
        )),
    }
}

#[cfg(feature = "ingest-http")]
fn open_http(url: &str) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(HttpSource::new(HttpConfig {
        url: url.to_string(),
        ..HttpConfig::default()
    })?))
}

#[cfg(not(feature = "ingest-http"))]
fn open_http(url: &str) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "source '{}' requires the ingest-http feature",
        url
    ))
}
