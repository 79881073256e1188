//! Outbound TCP stream: drains the transfer queue, frames each payload and
//! keeps the connection alive across failures.
//!
//! State machine:
//!
//! ```text
//!   Disconnected --connect--> Connecting --ok--> Connected
//!        ^                        |                  |
//!        +----- fail + backoff ---+-- write fault ---+
//! ```
//!
//! Connect failures retry forever with a fixed backoff. Socket errors never
//! reach the capture side; items produced while disconnected are dropped by
//! the queue.

use bytes::BytesMut;
use facestream_common::config::{EndpointConfig, StreamConfig};
use facestream_common::wire::{self, Framing, WireError};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::queue::{TransferItem, TransferQueue};

/// Upper bound on closing a socket after the pump loop ends.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Opens the outbound byte stream.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncWrite + Unpin + Send;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Peer description for logging.
    fn peer(&self) -> String;
}

/// Plain TCP client with a bounded connect.
pub struct TcpConnector {
    addr: String,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(endpoint: &EndpointConfig) -> Self {
        Self {
            addr: endpoint.addr(),
            timeout: endpoint.connect_timeout(),
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn peer(&self) -> String {
        self.addr.clone()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SenderSettings {
    pub framing: Framing,
    pub reconnect_delay: Duration,
    pub take_timeout: Duration,
}

impl From<&StreamConfig> for SenderSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            framing: config.framing,
            reconnect_delay: config.reconnect_delay(),
            take_timeout: config.take_timeout(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SenderStats {
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub disconnects: u64,
    pub records_sent: u64,
    pub images_sent: u64,
    /// Items the configured framing cannot carry.
    pub skipped: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("write failed: {0}")]
    Write(io::Error),
    #[error("encode failed: {0}")]
    Encode(#[from] WireError),
    #[error("write interrupted by shutdown")]
    Interrupted,
}

pub struct StreamSender<C: Connector> {
    connector: C,
    queue: Arc<TransferQueue>,
    settings: SenderSettings,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Receiver<bool>,
    stats: SenderStats,
    buf: BytesMut,
}

impl<C: Connector> StreamSender<C> {
    pub fn new(
        connector: C,
        queue: Arc<TransferQueue>,
        settings: SenderSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            queue,
            settings,
            state,
            shutdown,
            stats: SenderStats::default(),
            buf: BytesMut::with_capacity(64 * 1024),
        }
    }

    /// Observe connection state changes.
    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Run until shutdown is signalled, then return the session counters.
    pub async fn run(mut self) -> SenderStats {
        let peer = self.connector.peer();
        info!(peer, framing = ?self.settings.framing, "stream sender started");

        while !self.is_shutdown() {
            match self.connect().await {
                Some(mut stream) => {
                    self.pump(&mut stream).await;
                    if tokio::time::timeout(CLOSE_TIMEOUT, stream.shutdown()).await.is_err() {
                        debug!("socket close timed out");
                    }
                }
                None if self.is_shutdown() => break,
                None => {}
            }
            if self.is_shutdown() {
                break;
            }
            debug!(delay = ?self.settings.reconnect_delay, "waiting before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
                _ = wait_for_shutdown(&mut self.shutdown) => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!(
            peer,
            records = self.stats.records_sent,
            images = self.stats.images_sent,
            disconnects = self.stats.disconnects,
            "stream sender stopped"
        );
        self.stats
    }

    /// One connection attempt. `None` on failure or shutdown.
    async fn connect(&mut self) -> Option<C::Stream> {
        self.set_state(ConnectionState::Connecting);
        self.stats.connect_attempts += 1;

        let result = tokio::select! {
            result = self.connector.connect() => Some(result),
            _ = wait_for_shutdown(&mut self.shutdown) => None,
        };
        let Some(result) = result else {
            self.set_state(ConnectionState::Disconnected);
            return None;
        };

        match result {
            Ok(stream) => {
                info!(peer = self.connector.peer(), "connected to receiver");
                self.set_state(ConnectionState::Connected);
                Some(stream)
            }
            Err(e) => {
                self.stats.connect_failures += 1;
                warn!(
                    error = %e,
                    peer = self.connector.peer(),
                    attempt = self.stats.connect_attempts,
                    "connection failed"
                );
                self.set_state(ConnectionState::Disconnected);
                None
            }
        }
    }

    /// Drain the queue into `stream` until a write fault or shutdown.
    async fn pump(&mut self, stream: &mut C::Stream) {
        while !self.is_shutdown() {
            let Some(item) = self.queue.take(self.settings.take_timeout).await else {
                continue;
            };
            let kind = item.kind();
            match self.write_item(stream, item).await {
                Ok(()) => {}
                Err(SendError::Encode(e)) => {
                    self.stats.skipped += 1;
                    debug!(error = %e, kind, "payload not sent");
                }
                Err(SendError::Interrupted) => {
                    debug!(kind, "write abandoned for shutdown");
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                Err(e) => {
                    self.stats.disconnects += 1;
                    warn!(error = %e, kind, "connection lost");
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }

    async fn write_item(&mut self, stream: &mut C::Stream, item: TransferItem) -> Result<(), SendError> {
        self.buf.clear();
        match &item {
            TransferItem::Record(record) => wire::encode_record(self.settings.framing, record, &mut self.buf)?,
            TransferItem::Image(jpeg) => wire::encode_image(self.settings.framing, jpeg, &mut self.buf)?,
        }

        // One contiguous write per payload; a partial write is a fault. A
        // receiver that stops reading must not hold up shutdown.
        let buf = &self.buf;
        let write = async {
            stream.write_all(buf).await?;
            stream.flush().await
        };
        tokio::select! {
            written = write => written.map_err(SendError::Write)?,
            _ = wait_for_shutdown(&mut self.shutdown) => return Err(SendError::Interrupted),
        }

        match item {
            TransferItem::Record(_) => self.stats.records_sent += 1,
            TransferItem::Image(_) => self.stats.images_sent += 1,
        }
        Ok(())
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = ?current, to = ?next, "connection state");
            *current = next;
            true
        });
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Resolves once shutdown is requested or its sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
