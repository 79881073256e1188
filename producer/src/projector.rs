//! Derives the fixed-shape measurement record from one face's landmarks.

use facestream_common::record::{FeatureKey, MeasurementRecord};

use crate::landmarks::*;

/// Floor for the eye distance so tiny or degenerate faces cannot blow up
/// the normalized values.
pub const MIN_EYE_DISTANCE: f64 = 0.001;

/// How a single feature is computed from the landmark set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rule {
    /// `point[id].axis`
    Coordinate { id: u32, axis: Axis },
    /// `point[a].axis - point[b].axis`
    Difference { a: u32, b: u32, axis: Axis },
    /// `point[id].axis / eye_distance`
    Normalized { id: u32, axis: Axis },
}

/// The schema: exactly one rule per key. The match is exhaustive, so a new
/// key cannot be added without a rule.
pub fn rule_for(key: FeatureKey) -> Rule {
    use Axis::*;
    use Rule::*;

    match key {
        FeatureKey::NoseX => Coordinate { id: NOSE_TIP, axis: X },
        FeatureKey::NoseY => Coordinate { id: NOSE_TIP, axis: Y },
        FeatureKey::NoseZ => Coordinate { id: NOSE_TIP, axis: Z },
        FeatureKey::RightEyeCornerY => Normalized { id: RIGHT_EYE_CORNER, axis: Y },
        FeatureKey::RightEyeCornerZ => Normalized { id: RIGHT_EYE_CORNER, axis: Z },
        FeatureKey::LeftEyeCornerY => Normalized { id: LEFT_EYE_CORNER, axis: Y },
        FeatureKey::LeftEyeCornerZ => Normalized { id: LEFT_EYE_CORNER, axis: Z },
        FeatureKey::RightEyebrowY => Normalized { id: RIGHT_EYEBROW, axis: Y },
        FeatureKey::LeftEyebrowY => Normalized { id: LEFT_EYEBROW, axis: Y },
        FeatureKey::RightEyesocketY => Normalized { id: RIGHT_EYESOCKET, axis: Y },
        FeatureKey::LeftEyesocketY => Normalized { id: LEFT_EYESOCKET, axis: Y },
        FeatureKey::MouthTopY => Normalized { id: UPPER_LIP, axis: Y },
        FeatureKey::MouthBotY => Normalized { id: LOWER_LIP, axis: Y },
        FeatureKey::MouthLeftX => Normalized { id: MOUTH_LEFT, axis: X },
        FeatureKey::MouthRightX => Normalized { id: MOUTH_RIGHT, axis: X },
        FeatureKey::LeftEarZ => Coordinate { id: LEFT_EAR, axis: Z },
        FeatureKey::RightEarZ => Coordinate { id: RIGHT_EAR, axis: Z },
        FeatureKey::ForeheadZ => Coordinate { id: FOREHEAD, axis: Z },
        FeatureKey::ChinZ => Coordinate { id: CHIN, axis: Z },
        FeatureKey::MouthWidth => Difference { a: MOUTH_LEFT, b: MOUTH_RIGHT, axis: X },
        FeatureKey::MouthHeight => Difference { a: LOWER_LIP, b: UPPER_LIP, axis: Y },
        FeatureKey::Roll => Difference { a: LEFT_EYE_CORNER, b: RIGHT_EYE_CORNER, axis: Y },
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("landmark {0} is missing from a non-empty landmark set")]
    MissingLandmark(u32),
}

/// Round to 3 decimal places.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Clamped distance between the two eye corners.
pub fn eye_distance(set: &LandmarkSet) -> Result<f64, ProjectionError> {
    let left = point(set, LEFT_EYE_CORNER)?;
    let right = point(set, RIGHT_EYE_CORNER)?;
    Ok(left.distance(right).max(MIN_EYE_DISTANCE))
}

/// Compute one record, or `None` when no face was detected.
pub fn project(set: &LandmarkSet) -> Result<Option<MeasurementRecord>, ProjectionError> {
    if set.is_empty() {
        return Ok(None);
    }

    let eye_distance = eye_distance(set)?;

    // Resolve every rule first so a missing id surfaces as an error instead
    // of a partially filled record.
    let mut values = [0.0; FeatureKey::COUNT];
    for (slot, key) in values.iter_mut().zip(FeatureKey::ALL) {
        *slot = match rule_for(key) {
            Rule::Coordinate { id, axis } => point(set, id)?.axis(axis),
            Rule::Difference { a, b, axis } => point(set, a)?.axis(axis) - point(set, b)?.axis(axis),
            Rule::Normalized { id, axis } => point(set, id)?.axis(axis) / eye_distance,
        };
    }

    let mut values = values.into_iter();
    Ok(Some(MeasurementRecord::from_fn(|_| {
        round3(values.next().unwrap_or_default())
    })))
}

fn point(set: &LandmarkSet, id: u32) -> Result<&LandmarkPoint, ProjectionError> {
    set.get(id).ok_or(ProjectionError::MissingLandmark(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A full 468-point mesh with deterministic, distinct coordinates.
    fn synthetic_mesh() -> Vec<LandmarkPoint> {
        (0..468)
            .map(|id| {
                let t = id as f64;
                LandmarkPoint {
                    id,
                    x: 0.3 + (t * 0.37).sin() * 0.2,
                    y: 0.5 + (t * 0.11).cos() * 0.2,
                    z: (t * 0.05).sin() * 0.05,
                }
            })
            .collect()
    }

    fn set_point(mesh: &mut [LandmarkPoint], id: u32, x: f64, y: f64, z: f64) {
        mesh[id as usize] = LandmarkPoint { id, x, y, z };
    }

    #[test]
    fn empty_set_yields_no_record() {
        assert!(project(&LandmarkSet::empty()).unwrap().is_none());
    }

    #[test]
    fn normalized_values_divide_by_eye_distance() {
        let mut mesh = synthetic_mesh();
        set_point(&mut mesh, LEFT_EYE_CORNER, 0.6, 0.4, 0.1);
        set_point(&mut mesh, RIGHT_EYE_CORNER, 0.4, 0.4, 0.1);
        set_point(&mut mesh, RIGHT_EYEBROW, 0.4, 0.3, 0.1);
        let set = LandmarkSet::new(mesh.clone());

        let record = project(&set).unwrap().unwrap();

        let left = mesh[LEFT_EYE_CORNER as usize];
        let right = mesh[RIGHT_EYE_CORNER as usize];
        let distance = ((left.x - right.x).powi(2)
            + (left.y - right.y).powi(2)
            + (left.z - right.z).powi(2))
        .sqrt();
        assert!((distance - 0.2).abs() < 1e-12);

        for key in FeatureKey::ALL {
            if let Rule::Normalized { id, axis } = rule_for(key) {
                let raw = mesh[id as usize].axis(axis);
                let expected = round3(raw / distance.max(MIN_EYE_DISTANCE));
                assert!(
                    (record.get(key) - expected).abs() < 1e-4,
                    "{key}: got {} expected {expected}",
                    record.get(key)
                );
            }
        }
        assert!((record.get(FeatureKey::RightEyebrowY) - 1.5).abs() < 1e-4);
    }

    #[test]
    fn coincident_eyes_clamp_distance() {
        let mut mesh = synthetic_mesh();
        set_point(&mut mesh, LEFT_EYE_CORNER, 0.5, 0.4, 0.0);
        set_point(&mut mesh, RIGHT_EYE_CORNER, 0.5, 0.4, 0.0);
        set_point(&mut mesh, UPPER_LIP, 0.5, 0.002, 0.0);
        let set = LandmarkSet::new(mesh);

        assert_eq!(eye_distance(&set).unwrap(), MIN_EYE_DISTANCE);
        let record = project(&set).unwrap().unwrap();
        assert!((record.get(FeatureKey::MouthTopY) - 2.0).abs() < 1e-9);
        assert!(record.iter().all(|(_, v)| v.is_finite()));
    }

    #[test]
    fn coordinates_and_differences_are_rounded() {
        let mut mesh = synthetic_mesh();
        set_point(&mut mesh, NOSE_TIP, 0.123456, 0.654321, -0.0424);
        set_point(&mut mesh, MOUTH_LEFT, 0.61119, 0.7, 0.0);
        set_point(&mut mesh, MOUTH_RIGHT, 0.4, 0.7, 0.0);
        let record = project(&LandmarkSet::new(mesh)).unwrap().unwrap();

        assert_eq!(record.get(FeatureKey::NoseX), 0.123);
        assert_eq!(record.get(FeatureKey::NoseY), 0.654);
        assert_eq!(record.get(FeatureKey::NoseZ), -0.042);
        assert_eq!(record.get(FeatureKey::MouthWidth), 0.211);
    }

    #[test]
    fn missing_landmark_is_an_error() {
        let mut mesh = synthetic_mesh();
        mesh.truncate(200);
        let err = project(&LandmarkSet::new(mesh)).unwrap_err();
        assert!(matches!(err, ProjectionError::MissingLandmark(_)));
    }
}
