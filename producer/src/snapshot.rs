use facestream_common::config::SnapshotConfig;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use std::borrow::Cow;

use crate::source::Frame;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("frame has no pixels ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },
    #[error("jpeg encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// Compress a frame to JPEG, downscaling to `max_width` when configured.
pub fn encode_snapshot(frame: &Frame, config: &SnapshotConfig) -> Result<Vec<u8>, EncodeError> {
    let (width, height) = (frame.width(), frame.height());
    if width == 0 || height == 0 {
        return Err(EncodeError::EmptyFrame { width, height });
    }

    let pixels = if config.max_width > 0 && width > config.max_width {
        let scaled_height = ((height as u64 * config.max_width as u64) / width as u64).max(1) as u32;
        Cow::Owned(imageops::resize(
            &frame.pixels,
            config.max_width,
            scaled_height,
            FilterType::Triangle,
        ))
    } else {
        Cow::Borrowed(&frame.pixels)
    };

    let mut jpeg = Vec::with_capacity((width as usize * height as usize) / 4);
    let quality = config.quality.clamp(1, 100);
    JpegEncoder::new_with_quality(&mut jpeg, quality).encode_image(&*pixels)?;
    Ok(jpeg)
}
