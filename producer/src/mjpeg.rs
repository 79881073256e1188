use bytes::{Buf, BytesMut};
use std::io::Read;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::source::{CaptureError, Frame, FrameSource};

const DEFAULT_BOUNDARY: &str = "frame";
const HEADER_END: &[u8] = b"\r\n\r\n";
const READ_CHUNK: usize = 64 * 1024;

/// Parse state for the MJPEG multipart stream.
enum ParseState {
    /// Looking for the boundary marker `--<boundary>\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of part headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental splitter for `multipart/x-mixed-replace` bodies.
pub struct MjpegParser {
    buffer: BytesMut,
    state: ParseState,
    boundary: Vec<u8>,
    /// Offset into `buffer` already scanned for the next boundary.
    jpeg_start: usize,
}

impl MjpegParser {
    pub fn new(boundary: &str) -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            boundary: format!("--{boundary}\r\n").into_bytes(),
            jpeg_start: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Return the next complete JPEG part, or `None` if more bytes are needed.
    pub fn next_jpeg(&mut self) -> Option<Vec<u8>> {
        let blen = self.boundary.len();
        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.boundary) {
                        self.buffer.advance(pos + blen);
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep the tail in case the boundary spans chunks
                        if self.buffer.len() > blen {
                            let excess = self.buffer.len() - blen;
                            self.buffer.advance(excess);
                        }
                        return None;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    let pos = find_subsequence(&self.buffer, HEADER_END)?;
                    self.buffer.advance(pos + HEADER_END.len());
                    self.jpeg_start = 0;
                    self.state = ParseState::CollectingJpeg;
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) = find_subsequence(&self.buffer[self.jpeg_start..], &self.boundary)
                    else {
                        self.jpeg_start = self.buffer.len().saturating_sub(blen);
                        return None;
                    };
                    let jpeg_end = self.jpeg_start + pos;
                    // Strip the CRLF that precedes the boundary
                    let end = if self.buffer[..jpeg_end].ends_with(b"\r\n") {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };
                    let jpeg = self.buffer[..end].to_vec();
                    self.buffer.advance(jpeg_end + blen);
                    self.state = ParseState::SeekingHeaderEnd;
                    if !jpeg.is_empty() {
                        return Some(jpeg);
                    }
                }
            }
        }
    }
}

/// Extract the multipart boundary from a `Content-Type` header value.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"').trim_start_matches("--").to_string())
        .filter(|b| !b.is_empty())
}

/// Reads an HTTP MJPEG camera stream. The connection is opened on the first
/// frame request; losing it is a camera fault.
pub struct MjpegSource {
    client: reqwest::blocking::Client,
    url: String,
    response: Option<reqwest::blocking::Response>,
    parser: MjpegParser,
    read_buf: Vec<u8>,
    seq: u64,
}

impl MjpegSource {
    /// `read_timeout` bounds each body read, not the whole stream, so a
    /// camera that stops sending surfaces as `HttpStream` instead of blocking
    /// the capture loop.
    pub fn new(url: &str, read_timeout: Duration) -> Result<Self, CaptureError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(read_timeout)
            .build()
            .map_err(CaptureError::HttpConnect)?;
        Ok(Self {
            client,
            url: url.to_string(),
            response: None,
            parser: MjpegParser::new(DEFAULT_BOUNDARY),
            read_buf: vec![0u8; READ_CHUNK],
            seq: 0,
        })
    }

    fn connect(&mut self) -> Result<reqwest::blocking::Response, CaptureError> {
        info!(url = self.url, "connecting to MJPEG stream");
        let response = self
            .client
            .get(&self.url)
            .send()
            .map_err(CaptureError::HttpConnect)?;
        if !response.status().is_success() {
            return Err(CaptureError::HttpStatus(response.status().as_u16()));
        }

        let boundary = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(boundary_from_content_type)
            .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());
        info!(status = %response.status(), boundary, "connected to MJPEG stream");
        self.parser = MjpegParser::new(&boundary);
        Ok(response)
    }
}

impl FrameSource for MjpegSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let mut response = match self.response.take() {
            Some(r) => r,
            None => self.connect()?,
        };

        loop {
            if let Some(jpeg) = self.parser.next_jpeg() {
                let seq = self.seq;
                self.seq += 1;
                match Frame::from_jpeg(&jpeg, seq) {
                    Ok(frame) => {
                        debug!(seq, bytes = jpeg.len(), "received MJPEG frame");
                        self.response = Some(response);
                        return Ok(frame);
                    }
                    Err(e) => {
                        warn!(error = %e, seq, "skipping undecodable MJPEG part");
                        continue;
                    }
                }
            }

            let n = response
                .read(&mut self.read_buf)
                .map_err(CaptureError::HttpStream)?;
            if n == 0 {
                return Err(CaptureError::StreamEnded);
            }
            self.parser.push(&self.read_buf[..n]);
        }
    }

    fn name(&self) -> &str {
        "mjpeg"
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
