use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::session::{ReceiverError, Session, SessionEnd, SessionSettings, SessionStats};

/// Pause after a client leaves before the next accept.
pub const REACCEPT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub session: SessionSettings,
    pub reaccept_delay: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ReceiverTotals {
    pub clients: u64,
    /// Clients dropped for a socket or framing error.
    pub failed_clients: u64,
    pub records: u64,
    pub images: u64,
}

impl ReceiverTotals {
    fn add(&mut self, stats: &SessionStats) {
        self.records += stats.records;
        self.images += stats.images;
    }
}

/// Serve clients one at a time until shutdown. Further connection attempts
/// wait in the listen backlog while a client is being served.
pub async fn serve(
    listener: TcpListener,
    settings: ListenerSettings,
    mut shutdown: watch::Receiver<bool>,
) -> ReceiverTotals {
    let mut totals = ReceiverTotals::default();

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.wait_for(|stop| *stop) => break,
        };
        let (mut stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "accept failed");
                if pause(settings.reaccept_delay, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY");
        }

        totals.clients += 1;
        info!(peer = %peer, "client connected");
        let mut session = Session::new(settings.session.clone());
        let result = session.run(&mut stream, &mut shutdown).await;
        totals.add(session.stats());

        let stats = session.stats();
        match result {
            Ok(SessionEnd::Shutdown) => {
                info!(peer = %peer, records = stats.records, images = stats.images, "closing client for shutdown");
                break;
            }
            Ok(SessionEnd::PeerClosed) => {
                info!(peer = %peer, records = stats.records, images = stats.images, "client disconnected");
            }
            Err(e) => {
                totals.failed_clients += 1;
                match &e {
                    ReceiverError::Io(_) => warn!(peer = %peer, error = %e, "client connection lost"),
                    ReceiverError::Protocol(_) => error!(peer = %peer, error = %e, "stream out of sync, dropping client"),
                }
            }
        }

        if pause(settings.reaccept_delay, &mut shutdown).await {
            break;
        }
    }

    info!(
        clients = totals.clients,
        records = totals.records,
        images = totals.images,
        "receiver stopped"
    );
    totals
}

/// Sleep unless shutdown arrives first. Returns `true` on shutdown.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.wait_for(|stop| *stop) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use facestream_common::record::MeasurementRecord;
    use facestream_common::wire::{encode_record, Framing};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    fn settings() -> ListenerSettings {
        ListenerSettings {
            session: SessionSettings {
                print_interval: Duration::from_millis(500),
                snapshot_path: None,
            },
            reaccept_delay: Duration::from_millis(10),
        }
    }

    async fn send_records(addr: std::net::SocketAddr, count: usize) {
        let mut wire = BytesMut::new();
        for i in 0..count {
            let record = MeasurementRecord::from_fn(|_| i as f64);
            encode_record(Framing::Tagged, &record, &mut wire).unwrap();
        }
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&wire).await.unwrap();
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn serves_clients_one_after_another() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, settings(), rx));

        send_records(addr, 3).await;
        send_records(addr, 2).await;
        // Give the receiver time to drain both sessions.
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).unwrap();

        let totals = server.await.unwrap();
        assert_eq!(totals.clients, 2);
        assert_eq!(totals.records, 5);
        assert_eq!(totals.failed_clients, 0);
    }

    #[tokio::test]
    async fn desynchronized_client_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, settings(), rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[b'z'; 4096]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).unwrap();

        let totals = server.await.unwrap();
        assert_eq!(totals.clients, 1);
        assert_eq!(totals.failed_clients, 1);
    }

    #[tokio::test]
    async fn shutdown_without_clients() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, settings(), rx));
        tx.send(true).unwrap();
        let totals = server.await.unwrap();
        assert_eq!(totals.clients, 0);
    }
}
