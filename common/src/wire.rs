use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tracing::trace;

use crate::record::MeasurementRecord;

/// How payloads are delimited on the TCP stream.
///
/// Tagged (default):
///   `DATA:<json>\n`                  measurement record
///   `IMAGE:<len>\n<len raw bytes>`   JPEG snapshot
///
/// Lines:
///   `<json>\n`                       measurement record; images are not carried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    #[default]
    Tagged,
    Lines,
}

pub const DATA_PREFIX: &[u8] = b"DATA:";
pub const IMAGE_PREFIX: &[u8] = b"IMAGE:";

/// Longest header line (including the newline) a receiver accepts.
pub const MAX_HEADER_LEN: usize = 1024;
/// Largest image payload a receiver accepts.
pub const MAX_IMAGE_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("line-delimited framing cannot carry image payloads")]
    ImageUnsupported,
    #[error("header line exceeds {MAX_HEADER_LEN} bytes without a newline")]
    HeaderTooLong,
    #[error("invalid image length in header: {0:?}")]
    BadImageLength(String),
    #[error("image payload of {0} bytes exceeds the {MAX_IMAGE_LEN} byte limit")]
    ImageTooLarge(usize),
    #[error("unrecognized line: {0:?}")]
    UnrecognizedLine(String),
}

impl WireError {
    /// Fatal errors leave the byte stream unsynchronized; the connection
    /// should be dropped. Anything else only skips the offending message.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WireError::HeaderTooLong | WireError::ImageTooLarge(_))
    }
}

/// JSON formatter using `", "` and `": "` separators, matching the
/// desktop receiver's reference output byte for byte.
struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }
}

fn write_json<T: Serialize + ?Sized>(value: &T, dst: &mut BytesMut) -> Result<(), WireError> {
    let mut ser = serde_json::Serializer::with_formatter(dst.writer(), SpacedFormatter);
    value.serialize(&mut ser)?;
    Ok(())
}

/// Append one framed measurement payload to `dst`.
pub fn encode_record<T: Serialize + ?Sized>(
    framing: Framing,
    value: &T,
    dst: &mut BytesMut,
) -> Result<(), WireError> {
    if framing == Framing::Tagged {
        dst.put_slice(DATA_PREFIX);
    }
    write_json(value, dst)?;
    dst.put_u8(b'\n');
    Ok(())
}

/// Append one framed JPEG payload to `dst`.
pub fn encode_image(framing: Framing, jpeg: &[u8], dst: &mut BytesMut) -> Result<(), WireError> {
    if framing == Framing::Lines {
        return Err(WireError::ImageUnsupported);
    }
    dst.reserve(IMAGE_PREFIX.len() + 12 + jpeg.len());
    dst.put_slice(IMAGE_PREFIX);
    dst.put_slice(jpeg.len().to_string().as_bytes());
    dst.put_u8(b'\n');
    dst.put_slice(jpeg);
    Ok(())
}

/// A message recovered from the byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// `DATA:` record.
    Data(MeasurementRecord),
    /// `IMAGE:` payload, exactly the declared number of bytes.
    Image(Bytes),
    /// Untagged JSON line from the line-delimited framing.
    Legacy(MeasurementRecord),
}

enum DecodeState {
    /// Waiting for a complete `\n`-terminated header line.
    SeekingHeader,
    /// Collecting the body announced by an `IMAGE:` header.
    CollectingImage { len: usize },
}

/// Incremental decoder for both framings. Feed it bytes as they arrive and
/// call [`WireDecoder::decode`] until it returns `Ok(None)`.
pub struct WireDecoder {
    buffer: BytesMut,
    state: DecodeState,
}

impl Default for WireDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl WireDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: DecodeState::SeekingHeader,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Read target for `AsyncReadExt::read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Bytes received but not yet consumed by a complete message.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn decode(&mut self) -> Result<Option<WireMessage>, WireError> {
        loop {
            match self.state {
                DecodeState::SeekingHeader => {
                    let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                        if self.buffer.len() >= MAX_HEADER_LEN {
                            return Err(WireError::HeaderTooLong);
                        }
                        return Ok(None);
                    };
                    if pos >= MAX_HEADER_LEN {
                        return Err(WireError::HeaderTooLong);
                    }

                    let line = self.buffer.split_to(pos + 1);
                    let line = trim_line_end(&line);

                    if let Some(json) = line.strip_prefix(DATA_PREFIX) {
                        return Ok(Some(WireMessage::Data(serde_json::from_slice(json)?)));
                    }
                    if let Some(len) = line.strip_prefix(IMAGE_PREFIX) {
                        let len = parse_image_len(len)?;
                        trace!(len, "image header");
                        self.state = DecodeState::CollectingImage { len };
                        continue;
                    }
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return match serde_json::from_slice(line) {
                        Ok(record) => Ok(Some(WireMessage::Legacy(record))),
                        Err(_) => Err(WireError::UnrecognizedLine(
                            String::from_utf8_lossy(line).into_owned(),
                        )),
                    };
                }
                DecodeState::CollectingImage { len } => {
                    if self.buffer.len() < len {
                        self.buffer.reserve(len - self.buffer.len());
                        return Ok(None);
                    }
                    let image = self.buffer.split_to(len).freeze();
                    self.state = DecodeState::SeekingHeader;
                    return Ok(Some(WireMessage::Image(image)));
                }
            }
        }
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn parse_image_len(raw: &[u8]) -> Result<usize, WireError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| WireError::BadImageLength(String::from_utf8_lossy(raw).into_owned()))?;
    let len: usize = text
        .trim()
        .parse()
        .map_err(|_| WireError::BadImageLength(text.to_string()))?;
    if len > MAX_IMAGE_LEN {
        return Err(WireError::ImageTooLarge(len));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FeatureKey;
    use std::collections::BTreeMap;

    fn sample_record() -> MeasurementRecord {
        MeasurementRecord::from_fn(|key| match key {
            FeatureKey::MouthWidth => 0.25,
            _ => 1.5,
        })
    }

    #[test]
    fn tagged_record_is_byte_exact() {
        let mut value = BTreeMap::new();
        value.insert("a", 1.234);
        let mut buf = BytesMut::new();
        encode_record(Framing::Tagged, &value, &mut buf).unwrap();
        assert_eq!(&buf[..], b"DATA:{\"a\": 1.234}\n");
    }

    #[test]
    fn multiple_keys_use_spaced_separators() {
        let mut value = BTreeMap::new();
        value.insert("a", 1.0);
        value.insert("b", -0.5);
        let mut buf = BytesMut::new();
        encode_record(Framing::Lines, &value, &mut buf).unwrap();
        assert_eq!(&buf[..], b"{\"a\": 1.0, \"b\": -0.5}\n");
    }

    #[test]
    fn tagged_image_is_length_prefixed() {
        let jpeg: Vec<u8> = (0u8..10).collect();
        let mut buf = BytesMut::new();
        encode_image(Framing::Tagged, &jpeg, &mut buf).unwrap();
        assert_eq!(&buf[..9], b"IMAGE:10\n");
        assert_eq!(&buf[9..], &jpeg[..]);
        assert_eq!(buf.len(), 19);
    }

    #[test]
    fn lines_framing_rejects_images() {
        let mut buf = BytesMut::new();
        let err = encode_image(Framing::Lines, &[1, 2, 3], &mut buf).unwrap_err();
        assert!(matches!(err, WireError::ImageUnsupported));
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_interleaved_stream_fed_one_byte_at_a_time() {
        let record = sample_record();
        let jpeg = vec![0xFF, 0xD8, b'\n', b'\n', 0x00, 0xFF, 0xD9];

        let mut stream = BytesMut::new();
        encode_record(Framing::Tagged, &record, &mut stream).unwrap();
        encode_image(Framing::Tagged, &jpeg, &mut stream).unwrap();
        encode_record(Framing::Tagged, &record, &mut stream).unwrap();

        let mut decoder = WireDecoder::new();
        let mut messages = Vec::new();
        for byte in stream.iter() {
            decoder.extend(&[*byte]);
            while let Some(msg) = decoder.decode().unwrap() {
                messages.push(msg);
            }
        }

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], WireMessage::Data(record.clone()));
        assert_eq!(messages[1], WireMessage::Image(Bytes::from(jpeg)));
        assert_eq!(messages[2], WireMessage::Data(record));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn untagged_line_decodes_as_legacy() {
        let record = sample_record();
        let mut stream = BytesMut::new();
        encode_record(Framing::Lines, &record, &mut stream).unwrap();

        let mut decoder = WireDecoder::new();
        decoder.extend(&stream);
        assert_eq!(decoder.decode().unwrap(), Some(WireMessage::Legacy(record)));
        assert_eq!(decoder.decode().unwrap(), None);
    }

    #[test]
    fn bad_data_line_is_skipped_without_losing_sync() {
        let record = sample_record();
        let mut decoder = WireDecoder::new();
        decoder.extend(b"DATA:{\"nope\": 1}\r\n");
        decoder.extend(b"IMAGE:abc\n");
        decoder.extend(b"hello\n");
        let mut tail = BytesMut::new();
        encode_record(Framing::Tagged, &record, &mut tail).unwrap();
        decoder.extend(&tail);

        let err = decoder.decode().unwrap_err();
        assert!(!err.is_fatal());
        let err = decoder.decode().unwrap_err();
        assert!(matches!(err, WireError::BadImageLength(_)));
        let err = decoder.decode().unwrap_err();
        assert!(matches!(err, WireError::UnrecognizedLine(_)));
        assert_eq!(decoder.decode().unwrap(), Some(WireMessage::Data(record)));
    }

    #[test]
    fn overlong_header_is_fatal() {
        let mut decoder = WireDecoder::new();
        decoder.extend(&vec![b'x'; MAX_HEADER_LEN]);
        let err = decoder.decode().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn oversized_image_is_fatal() {
        let mut decoder = WireDecoder::new();
        decoder.extend(format!("IMAGE:{}\n", MAX_IMAGE_LEN + 1).as_bytes());
        let err = decoder.decode().unwrap_err();
        assert!(matches!(err, WireError::ImageTooLarge(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn zero_length_image_is_allowed() {
        let mut decoder = WireDecoder::new();
        decoder.extend(b"IMAGE:0\n");
        assert_eq!(decoder.decode().unwrap(), Some(WireMessage::Image(Bytes::new())));
    }
}
