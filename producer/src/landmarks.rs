use serde::Deserialize;

// MediaPipe FaceMesh landmark ids used by the feature schema.
pub const NOSE_TIP: u32 = 4;
pub const RIGHT_EYE_CORNER: u32 = 33;
pub const LEFT_EYE_CORNER: u32 = 263;
pub const RIGHT_EYEBROW: u32 = 66;
pub const LEFT_EYEBROW: u32 = 296;
pub const RIGHT_EYESOCKET: u32 = 145;
pub const LEFT_EYESOCKET: u32 = 374;
pub const UPPER_LIP: u32 = 13;
pub const LOWER_LIP: u32 = 14;
pub const MOUTH_LEFT: u32 = 291;
pub const MOUTH_RIGHT: u32 = 61;
pub const LEFT_EAR: u32 = 454;
pub const RIGHT_EAR: u32 = 234;
pub const FOREHEAD: u32 = 10;
pub const CHIN: u32 = 152;

/// A single normalized 3D landmark.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct LandmarkPoint {
    pub id: u32,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl LandmarkPoint {
    pub fn axis(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    pub fn distance(&self, other: &LandmarkPoint) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Landmarks of the first detected face. Empty when no face was found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LandmarkSet {
    points: Vec<LandmarkPoint>,
}

impl LandmarkSet {
    pub fn new(points: Vec<LandmarkPoint>) -> Self {
        Self { points }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Look up a point by its stable model id.
    ///
    /// Full meshes are stored in id order, so the direct index is tried
    /// before falling back to a scan of sparse sets.
    pub fn get(&self, id: u32) -> Option<&LandmarkPoint> {
        match self.points.get(id as usize) {
            Some(point) if point.id == id => Some(point),
            _ => self.points.iter().find(|p| p.id == id),
        }
    }
}
