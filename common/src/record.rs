//! Measurement record schema shared by the producer and the receiver.
//!
//! A record carries exactly one value per [`FeatureKey`]. Serialization walks
//! the keys in declaration order, so every record in a session has the same
//! key set and the same key order on the wire.

use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Feature names as they appear in the JSON object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum FeatureKey {
    #[serde(rename = "X")]
    NoseX,
    #[serde(rename = "Y")]
    NoseY,
    #[serde(rename = "Z")]
    NoseZ,
    #[serde(rename = "rEyeCornerY")]
    RightEyeCornerY,
    #[serde(rename = "rEyeCornerZ")]
    RightEyeCornerZ,
    #[serde(rename = "lEyeCornerY")]
    LeftEyeCornerY,
    #[serde(rename = "lEyeCornerZ")]
    LeftEyeCornerZ,
    #[serde(rename = "rEyebrowY")]
    RightEyebrowY,
    #[serde(rename = "lEyebrowY")]
    LeftEyebrowY,
    #[serde(rename = "rEyesocketY")]
    RightEyesocketY,
    #[serde(rename = "lEyesocketY")]
    LeftEyesocketY,
    #[serde(rename = "MouthTopY")]
    MouthTopY,
    #[serde(rename = "MouthBotY")]
    MouthBotY,
    #[serde(rename = "MouthLX")]
    MouthLeftX,
    #[serde(rename = "MouthRX")]
    MouthRightX,
    #[serde(rename = "lEarZ")]
    LeftEarZ,
    #[serde(rename = "rEarZ")]
    RightEarZ,
    #[serde(rename = "ForeheadZ")]
    ForeheadZ,
    #[serde(rename = "ChinZ")]
    ChinZ,
    #[serde(rename = "MouthWidth")]
    MouthWidth,
    #[serde(rename = "MouthHeight")]
    MouthHeight,
    #[serde(rename = "Roll")]
    Roll,
}

impl FeatureKey {
    /// Every key, in declaration (and wire) order.
    pub const ALL: [FeatureKey; 22] = [
        FeatureKey::NoseX,
        FeatureKey::NoseY,
        FeatureKey::NoseZ,
        FeatureKey::RightEyeCornerY,
        FeatureKey::RightEyeCornerZ,
        FeatureKey::LeftEyeCornerY,
        FeatureKey::LeftEyeCornerZ,
        FeatureKey::RightEyebrowY,
        FeatureKey::LeftEyebrowY,
        FeatureKey::RightEyesocketY,
        FeatureKey::LeftEyesocketY,
        FeatureKey::MouthTopY,
        FeatureKey::MouthBotY,
        FeatureKey::MouthLeftX,
        FeatureKey::MouthRightX,
        FeatureKey::LeftEarZ,
        FeatureKey::RightEarZ,
        FeatureKey::ForeheadZ,
        FeatureKey::ChinZ,
        FeatureKey::MouthWidth,
        FeatureKey::MouthHeight,
        FeatureKey::Roll,
    ];

    pub const COUNT: usize = Self::ALL.len();

    /// JSON property name.
    pub fn name(self) -> &'static str {
        match self {
            FeatureKey::NoseX => "X",
            FeatureKey::NoseY => "Y",
            FeatureKey::NoseZ => "Z",
            FeatureKey::RightEyeCornerY => "rEyeCornerY",
            FeatureKey::RightEyeCornerZ => "rEyeCornerZ",
            FeatureKey::LeftEyeCornerY => "lEyeCornerY",
            FeatureKey::LeftEyeCornerZ => "lEyeCornerZ",
            FeatureKey::RightEyebrowY => "rEyebrowY",
            FeatureKey::LeftEyebrowY => "lEyebrowY",
            FeatureKey::RightEyesocketY => "rEyesocketY",
            FeatureKey::LeftEyesocketY => "lEyesocketY",
            FeatureKey::MouthTopY => "MouthTopY",
            FeatureKey::MouthBotY => "MouthBotY",
            FeatureKey::MouthLeftX => "MouthLX",
            FeatureKey::MouthRightX => "MouthRX",
            FeatureKey::LeftEarZ => "lEarZ",
            FeatureKey::RightEarZ => "rEarZ",
            FeatureKey::ForeheadZ => "ForeheadZ",
            FeatureKey::ChinZ => "ChinZ",
            FeatureKey::MouthWidth => "MouthWidth",
            FeatureKey::MouthHeight => "MouthHeight",
            FeatureKey::Roll => "Roll",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One value per [`FeatureKey`]; the key set cannot drift between records.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    values: [f64; FeatureKey::COUNT],
}

impl MeasurementRecord {
    /// Build a record by evaluating `value_of` once for every key.
    pub fn from_fn(mut value_of: impl FnMut(FeatureKey) -> f64) -> Self {
        let mut values = [0.0; FeatureKey::COUNT];
        for key in FeatureKey::ALL {
            values[key.index()] = value_of(key);
        }
        Self { values }
    }

    pub fn get(&self, key: FeatureKey) -> f64 {
        self.values[key.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (FeatureKey, f64)> + '_ {
        FeatureKey::ALL.iter().map(|&key| (key, self.get(key)))
    }
}

impl Serialize for MeasurementRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(FeatureKey::COUNT))?;
        for (key, value) in self.iter() {
            map.serialize_entry(key.name(), &value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MeasurementRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(RecordVisitor)
    }
}

struct RecordVisitor;

impl<'de> Visitor<'de> for RecordVisitor {
    type Value = MeasurementRecord;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an object with exactly {} feature keys", FeatureKey::COUNT)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut slots: [Option<f64>; FeatureKey::COUNT] = [None; FeatureKey::COUNT];
        while let Some(key) = map.next_key::<FeatureKey>()? {
            let slot = &mut slots[key.index()];
            if slot.is_some() {
                return Err(de::Error::duplicate_field(key.name()));
            }
            *slot = Some(map.next_value()?);
        }

        let mut values = [0.0; FeatureKey::COUNT];
        for key in FeatureKey::ALL {
            values[key.index()] = slots[key.index()].ok_or_else(|| de::Error::missing_field(key.name()))?;
        }
        Ok(MeasurementRecord { values })
    }
}
