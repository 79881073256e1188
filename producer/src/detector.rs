use facestream_common::config::DetectorConfig;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

use crate::landmarks::{LandmarkPoint, LandmarkSet};
use crate::source::Frame;

/// Face-mesh inference, treated as an external capability.
///
/// Implementations return the landmarks of the first detected face, or an
/// empty set when there is none.
pub trait LandmarkDetector: Send {
    fn detect(&mut self, frame: &Frame) -> LandmarkSet;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("failed to read landmark replay {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("invalid landmark replay line {line}: {source}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },
    #[error("landmark replay {0} contains no samples")]
    Empty(String),
    #[error("unknown detector mode '{0}', expected 'none' or 'replay'")]
    UnknownMode(String),
}

pub fn build_detector(config: &DetectorConfig) -> Result<Box<dyn LandmarkDetector>, DetectorError> {
    match config.mode.as_str() {
        "none" => Ok(Box::new(NoFaceDetector)),
        "replay" => {
            let path = config.replay_path.as_deref().unwrap_or_default();
            Ok(Box::new(ReplayDetector::load(Path::new(path))?))
        }
        other => Err(DetectorError::UnknownMode(other.to_string())),
    }
}

/// Never finds a face; the stream then carries snapshots only.
pub struct NoFaceDetector;

impl LandmarkDetector for NoFaceDetector {
    fn detect(&mut self, _frame: &Frame) -> LandmarkSet {
        LandmarkSet::empty()
    }

    fn name(&self) -> &str {
        "none"
    }
}

/// One line of a recorded session: `{"landmarks": [{"id":..,"x":..,"y":..,"z":..}, ...]}`.
#[derive(Deserialize)]
struct ReplayLine {
    landmarks: Vec<LandmarkPoint>,
}

/// Replays landmark sets recorded from a real face-mesh run, one per frame,
/// looping when the recording ends.
pub struct ReplayDetector {
    samples: Vec<LandmarkSet>,
    cursor: usize,
}

impl ReplayDetector {
    pub fn load(path: &Path) -> Result<Self, DetectorError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DetectorError::ReadFile(path.display().to_string(), e))?;
        let samples = Self::parse(&content)?;
        if samples.is_empty() {
            return Err(DetectorError::Empty(path.display().to_string()));
        }
        info!(path = %path.display(), samples = samples.len(), "loaded landmark replay");
        Ok(Self::from_samples(samples))
    }

    pub fn from_samples(samples: Vec<LandmarkSet>) -> Self {
        Self { samples, cursor: 0 }
    }

    fn parse(content: &str) -> Result<Vec<LandmarkSet>, DetectorError> {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str::<ReplayLine>(line)
                    .map(|l| LandmarkSet::new(l.landmarks))
                    .map_err(|source| DetectorError::Parse { line: i + 1, source })
            })
            .collect()
    }
}

impl LandmarkDetector for ReplayDetector {
    fn detect(&mut self, frame: &Frame) -> LandmarkSet {
        if self.samples.is_empty() {
            return LandmarkSet::empty();
        }
        let set = self.samples[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.samples.len();
        if self.cursor == 0 {
            debug!(seq = frame.seq, "landmark replay wrapped around");
        }
        set
    }

    fn name(&self) -> &str {
        "replay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_session_lines_and_skips_blank_ones() {
        let content = r#"{"landmarks": [{"id": 4, "x": 0.5, "y": 0.5, "z": 0.1}]}

{"landmarks": []}
"#;
        let samples = ReplayDetector::parse(content).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].get(4).unwrap().z, 0.1);
        assert!(samples[1].is_empty());
    }

    #[test]
    fn parse_error_reports_line_number() {
        let content = "{\"landmarks\": []}\n{\"landmarks\": [\n";
        let err = ReplayDetector::parse(content).unwrap_err();
        assert!(matches!(err, DetectorError::Parse { line: 2, .. }));
    }

    #[test]
    fn replay_loops_over_samples() {
        let point = LandmarkPoint { id: 4, x: 0.1, y: 0.2, z: 0.3 };
        let mut detector = ReplayDetector::from_samples(vec![
            LandmarkSet::new(vec![point]),
            LandmarkSet::empty(),
        ]);
        let frame = Frame::blank(2, 2, 0);
        assert!(!detector.detect(&frame).is_empty());
        assert!(detector.detect(&frame).is_empty());
        assert!(!detector.detect(&frame).is_empty());
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let config = DetectorConfig {
            mode: "mediapipe".into(),
            replay_path: None,
        };
        assert!(matches!(
            build_detector(&config),
            Err(DetectorError::UnknownMode(_))
        ));
    }
}
