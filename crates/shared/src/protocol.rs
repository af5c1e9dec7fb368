use std::collections::BTreeMap;

use serde::{ser::SerializeMap, Deserialize, Serialize, Serializer};

use crate::{
    domain::{
        ConstraintName, ConstraintValue, Lattice, Matrix, Orientation, Position, ReferenceVectors,
        Reflection, TagOrIndex, Vector,
    },
    error::ApiError,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatticeParams {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub a: Option<f64>,
    #[serde(default)]
    pub b: Option<f64>,
    #[serde(default)]
    pub c: Option<f64>,
    #[serde(default)]
    pub alpha: Option<f64>,
    #[serde(default)]
    pub beta: Option<f64>,
    #[serde(default)]
    pub gamma: Option<f64>,
}

impl LatticeParams {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.system.is_none()
            && [self.a, self.b, self.c, self.alpha, self.beta, self.gamma]
                .iter()
                .all(Option::is_none)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddReflectionParams {
    pub hkl: Vector,
    pub position: Position,
    pub wavelength: f64,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditReflectionParams {
    pub tag_or_idx: TagOrIndex,
    #[serde(default)]
    pub hkl: Option<Vector>,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub wavelength: Option<f64>,
    #[serde(default)]
    pub retag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddOrientationParams {
    pub hkl: Vector,
    pub xyz: Vector,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditOrientationParams {
    pub tag_or_idx: TagOrIndex,
    #[serde(default)]
    pub hkl: Option<Vector>,
    #[serde(default)]
    pub xyz: Option<Vector>,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub retag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload<T> {
    pub payload: T,
}

/// One candidate lab position merged with its virtual angles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionRecord {
    #[serde(flatten)]
    pub position: Position,
    #[serde(flatten)]
    pub virtual_angles: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScanOutcome {
    Positions(Vec<PositionRecord>),
    Failed { error: ApiError },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanEntry {
    pub key: String,
    pub outcome: ScanOutcome,
}

/// Scan output in sweep order, serialized as a JSON object keyed by point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanResults {
    pub entries: Vec<ScanEntry>,
}

impl ScanResults {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&ScanOutcome> {
        self.entries
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| &entry.outcome)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.key.as_str())
    }
}

impl Serialize for ScanResults {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.key, &entry.outcome)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalculationSummary {
    pub name: String,
    pub lattice: Option<Lattice>,
    pub reflections: Vec<Reflection>,
    pub orientations: Vec<Orientation>,
    pub constraints: BTreeMap<ConstraintName, ConstraintValue>,
    pub vectors: ReferenceVectors,
    pub u: Option<Matrix>,
    pub ub: Option<Matrix>,
}
