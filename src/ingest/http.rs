//! HTTP frame source.
//!
//! This module provides `HttpSource` for cameras that expose either a JPEG
//! snapshot endpoint or a multipart MJPEG stream over HTTP.
//!
//! The HTTP source is responsible for:
//! - Connecting to the endpoint and detecting MJPEG vs. single JPEG
//! - Decoding JPEG frames in-memory to packed RGB
//! - Mapping transport errors to `Unavailable` and bad payloads to `ReadFailure`

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};

use image::GenericImageView;
use url::Url;

use super::{FrameSource, SourceError};
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

/// Configuration for an HTTP source.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    /// Snapshot or MJPEG URL (http:// or https://).
    pub url: String,
    /// Connect/read timeout for each request.
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:81/stream".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

pub struct HttpSource {
    config: HttpConfig,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    frame_count: u64,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl HttpSource {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let url = Url::parse(&config.url).context("parse http source url")?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported http source scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.timeout)
            .timeout_read(config.timeout)
            .build();
        Ok(Self {
            config,
            agent,
            stream: None,
            last_frame_at: None,
            connected_at: None,
            frame_count: 0,
        })
    }

    fn fetch_single_jpeg(&self) -> Result<Vec<u8>, SourceError> {
        let response = self.agent.get(&self.config.url).call().map_err(classify)?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64)
            .read_to_end(&mut bytes)
            .map_err(|e| SourceError::read_failure(format!("read jpeg snapshot: {}", e)))?;
        if bytes.is_empty() {
            return Err(SourceError::read_failure("empty jpeg snapshot"));
        }
        Ok(bytes)
    }
}

impl FrameSource for HttpSource {
    fn describe(&self) -> String {
        self.config.url.clone()
    }

    fn connect(&mut self) -> Result<(), SourceError> {
        self.stream = None;
        let response = self.agent.get(&self.config.url).call().map_err(|e| {
            SourceError::unavailable(format!("connect to {}: {}", self.config.url, e))
        })?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(response.into_reader())));
        } else {
            self.stream = Some(HttpStream::SingleJpeg);
        }
        self.connected_at = Some(Instant::now());
        log::info!("HttpSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        let jpeg_bytes = if matches!(self.stream, Some(HttpStream::SingleJpeg)) {
            self.fetch_single_jpeg()?
        } else {
            match self.stream.as_mut() {
                Some(HttpStream::Mjpeg(stream)) => stream.read_next_jpeg()?,
                _ => {
                    return Err(SourceError::unavailable(
                        "http source not connected; call connect() first",
                    ))
                }
            }
        };

        let (pixels, width, height) =
            decode_jpeg(&jpeg_bytes).map_err(|e| SourceError::read_failure(format!("{:#}", e)))?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());

        Ok(Frame::new(pixels, width, height, self.frame_count))
    }

    fn is_healthy(&self) -> bool {
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= self.config.timeout * 2
    }

    fn frames_captured(&self) -> u64 {
        self.frame_count
    }
}

/// Transport errors mean the camera is gone; HTTP status errors mean it
/// answered but had no frame for us.
fn classify(err: ureq::Error) -> SourceError {
    match err {
        ureq::Error::Status(code, _) => {
            SourceError::read_failure(format!("snapshot request returned HTTP {}", code))
        }
        ureq::Error::Transport(transport) => SourceError::unavailable(transport),
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>, SourceError> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self
                .reader
                .read(&mut chunk)
                .map_err(|e| SourceError::unavailable(format!("read mjpeg chunk: {}", e)))?;
            if read == 0 {
                return Err(SourceError::unavailable("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    let rgb = image.into_rgb8();
    Ok((rgb.into_raw(), width, height))
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
