//! One client connection: bytes in, decoded records and snapshots out.

use bytes::Bytes;
use facestream_common::record::{FeatureKey, MeasurementRecord};
use facestream_common::wire::{WireDecoder, WireError, WireMessage};
use image::ImageReader;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub bytes: u64,
    pub records: u64,
    /// Records that arrived as untagged JSON lines.
    pub legacy_records: u64,
    pub images: u64,
    pub bad_images: u64,
    /// Lines or headers that could not be decoded and were skipped.
    pub skipped: u64,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub print_interval: Duration,
    pub snapshot_path: Option<PathBuf>,
}

/// How a session ended, when it ended without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    PeerClosed,
    Shutdown,
}

pub struct Session {
    decoder: WireDecoder,
    settings: SessionSettings,
    last_print: Option<Instant>,
    stats: SessionStats,
}

impl Session {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            decoder: WireDecoder::new(),
            settings,
            last_print: None,
            stats: SessionStats::default(),
        }
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Read and decode until the peer closes, shutdown is requested, or the
    /// stream loses framing. Partial counters stay readable via [`stats`].
    ///
    /// [`stats`]: Session::stats
    pub async fn run<R>(
        &mut self,
        reader: &mut R,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, ReceiverError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let read = tokio::select! {
                read = reader.read_buf(self.decoder.buffer_mut()) => read?,
                _ = shutdown.wait_for(|stop| *stop) => return Ok(SessionEnd::Shutdown),
            };
            if read == 0 {
                if self.decoder.pending() > 0 {
                    debug!(pending = self.decoder.pending(), "peer closed mid-message");
                }
                return Ok(SessionEnd::PeerClosed);
            }
            self.stats.bytes += read as u64;
            self.drain().await?;
        }
    }

    async fn drain(&mut self) -> Result<(), WireError> {
        loop {
            match self.decoder.decode() {
                Ok(Some(message)) => self.handle(message).await,
                Ok(None) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.stats.skipped += 1;
                    warn!(error = %e, "skipping undecodable message");
                }
            }
        }
    }

    async fn handle(&mut self, message: WireMessage) {
        match message {
            WireMessage::Data(record) => self.on_record(&record),
            WireMessage::Legacy(record) => {
                self.stats.legacy_records += 1;
                self.on_record(&record);
            }
            WireMessage::Image(jpeg) => self.on_image(jpeg).await,
        }
    }

    fn on_record(&mut self, record: &MeasurementRecord) {
        self.stats.records += 1;
        let now = Instant::now();
        let due = self
            .last_print
            .map_or(true, |last| now.duration_since(last) >= self.settings.print_interval);
        if !due {
            return;
        }
        self.last_print = Some(now);
        info!(
            records = self.stats.records,
            x = record.get(FeatureKey::NoseX),
            y = record.get(FeatureKey::NoseY),
            z = record.get(FeatureKey::NoseZ),
            mouth_width = record.get(FeatureKey::MouthWidth),
            mouth_height = record.get(FeatureKey::MouthHeight),
            roll = record.get(FeatureKey::Roll),
            "face data"
        );
    }

    async fn on_image(&mut self, jpeg: Bytes) {
        let (width, height) = match image_dimensions(&jpeg) {
            Ok(dims) => dims,
            Err(e) => {
                self.stats.bad_images += 1;
                warn!(error = %e, len = jpeg.len(), "invalid snapshot");
                return;
            }
        };
        self.stats.images += 1;
        debug!(width, height, len = jpeg.len(), "snapshot received");

        if let Some(path) = &self.settings.snapshot_path {
            if let Err(e) = store_snapshot(path, &jpeg).await {
                warn!(error = %e, path = %path.display(), "failed to store snapshot");
            }
        }
    }
}

/// Replace `path` with `jpeg` via a sibling temp file, so readers only ever
/// see a complete image.
pub async fn store_snapshot(path: &Path, jpeg: &[u8]) -> io::Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    tokio::fs::write(&tmp, jpeg).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Read the image header only; the pixel data is not decoded.
pub fn image_dimensions(data: &[u8]) -> image::ImageResult<(u32, u32)> {
    ImageReader::new(Cursor::new(data))
        .with_guessed_format()?
        .into_dimensions()
}
