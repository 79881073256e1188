//! Capture loop: frame -> landmarks -> record, plus a snapshot per frame.
//!
//! Runs on a blocking thread. It never waits on the sender; everything it
//! produces goes through `TransferQueue::try_put`.

use chrono::Utc;
use facestream_common::config::{CaptureConfig, SnapshotConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::detector::LandmarkDetector;
use crate::projector::project;
use crate::queue::{TransferItem, TransferQueue};
use crate::snapshot::encode_snapshot;
use crate::source::FrameSource;

/// Longest single sleep while pacing, so the stop flag is seen promptly.
const PACER_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    Stopped,
    CameraLost(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub frames: u64,
    pub records_enqueued: u64,
    pub images_enqueued: u64,
    /// Items rejected by a full queue.
    pub dropped: u64,
    pub projection_errors: u64,
    pub encode_failures: u64,
    pub ended_by: StopReason,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub min_interval: Duration,
    pub fps_log_interval: Duration,
    pub snapshot: SnapshotConfig,
}

impl CaptureSettings {
    pub fn new(capture: &CaptureConfig, snapshot: &SnapshotConfig) -> Self {
        Self {
            min_interval: Duration::from_millis(capture.min_interval_ms),
            fps_log_interval: Duration::from_secs(capture.fps_log_interval_secs),
            snapshot: snapshot.clone(),
        }
    }
}

/// Monotonic gate holding iterations at least `min_interval` apart.
pub struct Pacer {
    min_interval: Duration,
    last: Option<Instant>,
}

impl Pacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// Sleep in bounded slices until the interval has passed since the last
    /// call. Returns `false` if `stop` was raised meanwhile.
    pub fn wait(&mut self, stop: &AtomicBool) -> bool {
        if let Some(last) = self.last {
            loop {
                if stop.load(Ordering::Relaxed) {
                    return false;
                }
                let elapsed = last.elapsed();
                if elapsed >= self.min_interval {
                    break;
                }
                std::thread::sleep((self.min_interval - elapsed).min(PACER_SLICE));
            }
        }
        self.last = Some(Instant::now());
        !stop.load(Ordering::Relaxed)
    }
}

/// Average frame rate over a reporting window.
struct FpsMeter {
    window: Duration,
    window_start: Instant,
    frames: u32,
}

impl FpsMeter {
    fn new(window: Duration) -> Self {
        Self {
            window,
            window_start: Instant::now(),
            frames: 0,
        }
    }

    /// Count a frame; returns the rate once per window.
    fn tick(&mut self) -> Option<f64> {
        self.frames += 1;
        let elapsed = self.window_start.elapsed();
        if self.window.is_zero() || elapsed < self.window {
            return None;
        }
        let fps = f64::from(self.frames) / elapsed.as_secs_f64();
        self.window_start = Instant::now();
        self.frames = 0;
        Some(fps)
    }
}

pub struct CaptureLoop {
    source: Box<dyn FrameSource>,
    detector: Box<dyn LandmarkDetector>,
    queue: Arc<TransferQueue>,
    snapshot: SnapshotConfig,
    pacer: Pacer,
    fps: FpsMeter,
    stop: Arc<AtomicBool>,
}

impl CaptureLoop {
    pub fn new(
        source: Box<dyn FrameSource>,
        detector: Box<dyn LandmarkDetector>,
        queue: Arc<TransferQueue>,
        settings: CaptureSettings,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source,
            detector,
            queue,
            snapshot: settings.snapshot,
            pacer: Pacer::new(settings.min_interval),
            fps: FpsMeter::new(settings.fps_log_interval),
            stop,
        }
    }

    /// Run until the stop flag is raised or the camera fails.
    pub fn run(mut self) -> CaptureSummary {
        info!(
            source = self.source.name(),
            detector = self.detector.name(),
            "capture loop started"
        );
        let mut summary = CaptureSummary::default();

        loop {
            if !self.pacer.wait(&self.stop) {
                summary.ended_by = StopReason::Stopped;
                break;
            }

            let frame = match self.source.next_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    error!(error = %e, frames = summary.frames, "camera failure, ending capture");
                    summary.ended_by = StopReason::CameraLost(e.to_string());
                    break;
                }
            };
            summary.frames += 1;

            let landmarks = self.detector.detect(&frame);
            match project(&landmarks) {
                Ok(Some(record)) => {
                    if self.queue.try_put(TransferItem::Record(record)) {
                        summary.records_enqueued += 1;
                    } else {
                        summary.dropped += 1;
                        debug!(seq = frame.seq, "queue full, record dropped");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    summary.projection_errors += 1;
                    warn!(error = %e, seq = frame.seq, "skipping measurement record");
                }
            }

            match encode_snapshot(&frame, &self.snapshot) {
                Ok(jpeg) => {
                    if self.queue.try_put(TransferItem::Image(jpeg)) {
                        summary.images_enqueued += 1;
                    } else {
                        summary.dropped += 1;
                        debug!(seq = frame.seq, "queue full, snapshot dropped");
                    }
                }
                Err(e) => {
                    summary.encode_failures += 1;
                    warn!(error = %e, seq = frame.seq, "snapshot encoding failed");
                }
            }

            // Acquisition to hand-off, including detection and encoding.
            let latency_ms = Utc::now().timestamp_millis() - frame.captured_at_ms;
            debug!(seq = frame.seq, latency_ms, "frame processed");

            if let Some(fps) = self.fps.tick() {
                info!(
                    fps = format!("{fps:.1}"),
                    frames = summary.frames,
                    latency_ms,
                    dropped = self.queue.dropped(),
                    "capture rate"
                );
            }
        }

        info!(
            frames = summary.frames,
            records = summary.records_enqueued,
            images = summary.images_enqueued,
            dropped = summary.dropped,
            "capture loop stopped"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::{LandmarkPoint, LandmarkSet};
    use crate::source::{CaptureError, Frame};
    use std::collections::VecDeque;

    /// Yields the given frame sizes, then reports the camera as gone.
    struct ScriptedSource {
        sizes: VecDeque<(u32, u32)>,
        seq: u64,
    }

    impl ScriptedSource {
        fn new(sizes: &[(u32, u32)]) -> Self {
            Self {
                sizes: sizes.iter().copied().collect(),
                seq: 0,
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Frame, CaptureError> {
            let (w, h) = self.sizes.pop_front().ok_or(CaptureError::StreamEnded)?;
            let seq = self.seq;
            self.seq += 1;
            Ok(Frame::blank(w, h, seq))
        }
    }

    /// Finds a face on every frame except the listed sequence numbers.
    struct ScriptedDetector {
        no_face: Vec<u64>,
    }

    impl LandmarkDetector for ScriptedDetector {
        fn detect(&mut self, frame: &Frame) -> LandmarkSet {
            if self.no_face.contains(&frame.seq) {
                return LandmarkSet::empty();
            }
            LandmarkSet::new(
                (0..468)
                    .map(|id| LandmarkPoint {
                        id,
                        x: 0.3 + id as f64 * 0.001,
                        y: 0.6 - id as f64 * 0.0005,
                        z: 0.01,
                    })
                    .collect(),
            )
        }
    }

    fn settings() -> CaptureSettings {
        CaptureSettings {
            min_interval: Duration::ZERO,
            fps_log_interval: Duration::ZERO,
            snapshot: SnapshotConfig {
                quality: 70,
                max_width: 0,
            },
        }
    }

    fn run_loop(sizes: &[(u32, u32)], no_face: Vec<u64>, queue: Arc<TransferQueue>) -> CaptureSummary {
        CaptureLoop::new(
            Box::new(ScriptedSource::new(sizes)),
            Box::new(ScriptedDetector { no_face }),
            queue,
            settings(),
            Arc::new(AtomicBool::new(false)),
        )
        .run()
    }

    fn drain(queue: &TransferQueue) -> (usize, usize) {
        let (mut records, mut images) = (0, 0);
        while let Some(item) = queue.try_take() {
            match item {
                TransferItem::Record(_) => records += 1,
                TransferItem::Image(_) => images += 1,
            }
        }
        (records, images)
    }

    #[test]
    fn three_frames_with_one_missed_face() {
        let queue = Arc::new(TransferQueue::with_capacity(16));
        let summary = run_loop(&[(16, 16); 3], vec![1], Arc::clone(&queue));

        assert_eq!(summary.frames, 3);
        assert_eq!(summary.records_enqueued, 2);
        assert_eq!(summary.images_enqueued, 3);
        assert!(matches!(summary.ended_by, StopReason::CameraLost(_)));
        assert_eq!(drain(&queue), (2, 3));
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let queue = Arc::new(TransferQueue::default());
        let summary = run_loop(&[(16, 16); 3], vec![], Arc::clone(&queue));

        assert_eq!(summary.frames, 3);
        assert_eq!(summary.records_enqueued + summary.images_enqueued, 2);
        assert_eq!(summary.dropped, 4);
        assert_eq!(queue.dropped(), 4);
    }

    #[test]
    fn encoding_failure_skips_only_the_snapshot() {
        let queue = Arc::new(TransferQueue::with_capacity(16));
        let summary = run_loop(&[(0, 0), (16, 16)], vec![], Arc::clone(&queue));

        assert_eq!(summary.frames, 2);
        assert_eq!(summary.encode_failures, 1);
        assert_eq!(summary.records_enqueued, 2);
        assert_eq!(summary.images_enqueued, 1);
    }

    #[test]
    fn raised_stop_flag_ends_before_first_frame() {
        let stop = Arc::new(AtomicBool::new(true));
        let summary = CaptureLoop::new(
            Box::new(ScriptedSource::new(&[(16, 16)])),
            Box::new(ScriptedDetector { no_face: vec![] }),
            Arc::new(TransferQueue::default()),
            settings(),
            stop,
        )
        .run();

        assert_eq!(summary.frames, 0);
        assert_eq!(summary.ended_by, StopReason::Stopped);
    }

    #[test]
    fn pacer_spaces_iterations() {
        let stop = AtomicBool::new(false);
        let mut pacer = Pacer::new(Duration::from_millis(30));
        let start = Instant::now();
        assert!(pacer.wait(&stop));
        assert!(pacer.wait(&stop));
        assert!(pacer.wait(&stop));
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn pacer_returns_promptly_on_stop() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut pacer = Pacer::new(Duration::from_secs(10));
        assert!(pacer.wait(&stop));

        let flag = Arc::clone(&stop);
        let raiser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::Relaxed);
        });
        let start = Instant::now();
        assert!(!pacer.wait(&stop));
        assert!(start.elapsed() < Duration::from_secs(1));
        raiser.join().unwrap();
    }

    #[test]
    fn fps_meter_reports_once_per_window() {
        let mut meter = FpsMeter::new(Duration::from_millis(20));
        assert!(meter.tick().is_none());
        std::thread::sleep(Duration::from_millis(25));
        let fps = meter.tick().unwrap();
        assert!(fps > 0.0);
        assert!(meter.tick().is_none());
    }
}
