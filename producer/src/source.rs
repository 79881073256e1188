use chrono::Utc;
use facestream_common::config::CaptureConfig;
use image::{ImageFormat, Rgb, RgbImage};
use std::time::Duration;
use tracing::{debug, info};

use crate::mjpeg::MjpegSource;

/// One camera image, owned by a single capture iteration.
#[derive(Debug, Clone)]
pub struct Frame {
    pub pixels: RgbImage,
    /// Unix millis at acquisition.
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl Frame {
    pub fn new(pixels: RgbImage, seq: u64) -> Self {
        Self {
            pixels,
            captured_at_ms: Utc::now().timestamp_millis(),
            seq,
        }
    }

    /// Decode a JPEG into an RGB frame.
    pub fn from_jpeg(jpeg: &[u8], seq: u64) -> Result<Self, CaptureError> {
        let pixels = image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
            .map_err(CaptureError::Decode)?
            .to_rgb8();
        Ok(Self::new(pixels, seq))
    }

    #[cfg(test)]
    pub fn blank(width: u32, height: u32, seq: u64) -> Self {
        Self::new(RgbImage::new(width, height), seq)
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(std::io::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("camera stream ended")]
    StreamEnded,
    #[error("failed to decode camera frame: {0}")]
    Decode(image::ImageError),
    #[error("unknown capture mode '{0}', expected 'synthetic', 'mjpeg' or 'polling'")]
    UnknownMode(String),
}

/// Camera acquisition. A returned error means the camera is gone and ends
/// the capture session.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

pub fn build_source(config: &CaptureConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    info!(mode = config.mode, url = config.url, "opening frame source");
    match config.mode.as_str() {
        "synthetic" => Ok(Box::new(SyntheticSource::new(config.width, config.height))),
        "mjpeg" => Ok(Box::new(MjpegSource::new(&config.url, config.read_timeout())?)),
        "polling" => Ok(Box::new(PollingSource::new(&config.url, config.read_timeout())?)),
        other => Err(CaptureError::UnknownMode(other.to_string())),
    }
}

/// Moving gradient test pattern for running without a camera.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    seq: u64,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, seq: 0 }
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let seq = self.seq;
        self.seq += 1;
        let shift = (seq % 256) as u32;
        let (w, h) = (self.width.max(1), self.height.max(1));
        let pixels = RgbImage::from_fn(self.width, self.height, |x, y| {
            Rgb([
                ((x * 255 / w + shift) % 256) as u8,
                (y * 255 / h) as u8,
                (shift * 2 % 256) as u8,
            ])
        });
        Ok(Frame::new(pixels, seq))
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

/// Fetches one JPEG per frame from a camera snapshot URL.
pub struct PollingSource {
    client: reqwest::blocking::Client,
    url: String,
    seq: u64,
}

impl PollingSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, CaptureError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(CaptureError::HttpConnect)?;
        Ok(Self {
            client,
            url: url.to_string(),
            seq: 0,
        })
    }
}

impl FrameSource for PollingSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .map_err(CaptureError::HttpConnect)?;
        if !resp.status().is_success() {
            return Err(CaptureError::HttpStatus(resp.status().as_u16()));
        }
        let jpeg = resp.bytes().map_err(CaptureError::HttpConnect)?;
        let seq = self.seq;
        self.seq += 1;
        debug!(seq, bytes = jpeg.len(), "fetched camera snapshot");
        Frame::from_jpeg(&jpeg, seq)
    }

    fn name(&self) -> &str {
        "polling"
    }
}
