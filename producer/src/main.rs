mod capture;
mod detector;
mod landmarks;
mod mjpeg;
mod projector;
mod queue;
mod sender;
mod snapshot;
mod source;

use capture::{CaptureLoop, CaptureSettings, StopReason};
use facestream_common::config::Config;
use queue::TransferQueue;
use sender::{SenderSettings, StreamSender, TcpConnector};
use source::CaptureError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        endpoint = config.endpoint.addr(),
        framing = ?config.stream.framing,
        capture = config.capture.mode,
        detector = config.detector.mode,
        "starting facestream producer"
    );

    let detector = match detector::build_detector(&config.detector) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "failed to create landmark detector");
            std::process::exit(1);
        }
    };

    let queue = Arc::new(TransferQueue::with_capacity(config.stream.queue_capacity));
    info!(capacity = queue.capacity(), "transfer queue ready");
    let stop = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Ctrl+C is the quit signal for the capture session.
    let quit = Arc::clone(&stop);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
        info!("quit requested");
        quit.store(true, Ordering::SeqCst);
    });

    let sender = StreamSender::new(
        TcpConnector::new(&config.endpoint),
        Arc::clone(&queue),
        SenderSettings::from(&config.stream),
        shutdown_rx,
    );
    let sender_task = tokio::spawn(sender.run());

    // The HTTP camera clients block, so the source is opened, driven and
    // dropped on the blocking thread.
    let capture_config = config.capture.clone();
    let settings = CaptureSettings::new(&config.capture, &config.snapshot);
    let capture_queue = Arc::clone(&queue);
    let capture = tokio::task::spawn_blocking(move || {
        let source = source::build_source(&capture_config)?;
        Ok::<_, CaptureError>(CaptureLoop::new(source, detector, capture_queue, settings, stop).run())
    });
    let result = capture.await;
    let _ = shutdown_tx.send(true);

    let summary = match result {
        Ok(Ok(summary)) => summary,
        Ok(Err(e)) => {
            error!(error = %e, "failed to open frame source");
            let _ = sender_task.await;
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "capture loop panicked");
            std::process::exit(1);
        }
    };

    let sent = match sender_task.await {
        Ok(stats) => stats,
        Err(e) => {
            error!(error = %e, "stream sender panicked");
            std::process::exit(1);
        }
    };

    info!(
        frames = summary.frames,
        records_sent = sent.records_sent,
        images_sent = sent.images_sent,
        dropped = queue.dropped(),
        undelivered = queue.len(),
        reconnects = sent.connect_attempts.saturating_sub(1),
        "facestream producer stopped"
    );

    if let StopReason::CameraLost(reason) = summary.ended_by {
        error!(reason, "capture ended by camera failure");
        std::process::exit(2);
    }
}
