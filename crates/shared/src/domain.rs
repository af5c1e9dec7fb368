use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

pub type Matrix = [[f64; 3]; 3];
pub type Vector = [f64; 3];

/// Diffractometer angles in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub mu: f64,
    pub delta: f64,
    pub nu: f64,
    pub eta: f64,
    pub chi: f64,
    pub phi: f64,
}

impl Position {
    pub fn from_array(angles: [f64; 6]) -> Self {
        let [mu, delta, nu, eta, chi, phi] = angles;
        Self {
            mu,
            delta,
            nu,
            eta,
            chi,
            phi,
        }
    }

    pub fn to_array(self) -> [f64; 6] {
        [self.mu, self.delta, self.nu, self.eta, self.chi, self.phi]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrystalSystem {
    Cubic,
    Tetragonal,
    Hexagonal,
    Rhombohedral,
    Orthorhombic,
    Monoclinic,
    Triclinic,
}

impl FromStr for CrystalSystem {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "cubic" => Ok(Self::Cubic),
            "tetragonal" => Ok(Self::Tetragonal),
            "hexagonal" => Ok(Self::Hexagonal),
            "rhombohedral" | "trigonal" => Ok(Self::Rhombohedral),
            "orthorhombic" => Ok(Self::Orthorhombic),
            "monoclinic" => Ok(Self::Monoclinic),
            "triclinic" => Ok(Self::Triclinic),
            other => Err(format!("unknown crystal system '{other}'")),
        }
    }
}

/// Unit cell: lengths in angstrom, angles in degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lattice {
    pub name: String,
    pub system: CrystalSystem,
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    pub hkl: Vector,
    pub position: Position,
    pub wavelength: f64,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub hkl: Vector,
    pub xyz: Vector,
    pub position: Position,
    pub tag: Option<String>,
}

/// Reference to a reflection or orientation: a unique tag or a 1-based index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagOrIndex {
    Index(usize),
    Tag(String),
}

impl TagOrIndex {
    /// Strings that parse as an unsigned integer address by index.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<usize>() {
            Ok(index) => Self::Index(index),
            Err(_) => Self::Tag(trimmed.to_string()),
        }
    }
}

impl fmt::Display for TagOrIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{index}"),
            Self::Tag(tag) => f.write_str(tag),
        }
    }
}

trait Tagged {
    fn tag(&self) -> Option<&str>;
}

impl Tagged for Reflection {
    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

impl Tagged for Orientation {
    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

fn locate<T: Tagged>(items: &[T], key: &TagOrIndex) -> Option<usize> {
    match key {
        TagOrIndex::Index(index) => (1..=items.len()).contains(index).then(|| index - 1),
        TagOrIndex::Tag(tag) => items.iter().position(|item| item.tag() == Some(tag.as_str())),
    }
}

fn tag_in_use<T: Tagged>(items: &[T], tag: &str) -> bool {
    items.iter().any(|item| item.tag() == Some(tag))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintCategory {
    Detector,
    Reference,
    Sample,
}

macro_rules! constraint_names {
    ($($variant:ident => $text:literal, $category:ident, $boolean:literal;)+) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum ConstraintName {
            $($variant,)+
        }

        impl ConstraintName {
            pub const ALL: &'static [ConstraintName] = &[$(ConstraintName::$variant,)+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(ConstraintName::$variant => $text,)+
                }
            }

            pub fn category(self) -> ConstraintCategory {
                match self {
                    $(ConstraintName::$variant => ConstraintCategory::$category,)+
                }
            }

            /// Constraints that only carry an on/off flag.
            pub fn is_boolean(self) -> bool {
                match self {
                    $(ConstraintName::$variant => $boolean,)+
                }
            }
        }

        impl FromStr for ConstraintName {
            type Err = String;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(ConstraintName::$variant),)+
                    other => Err(format!("'{other}' is not a valid constraint")),
                }
            }
        }
    };
}

constraint_names! {
    Delta => "delta", Detector, false;
    Nu => "nu", Detector, false;
    Qaz => "qaz", Detector, false;
    Naz => "naz", Detector, false;
    MuIsNu => "mu_is_nu", Detector, true;
    AEqB => "a_eq_b", Reference, true;
    Alpha => "alpha", Reference, false;
    Beta => "beta", Reference, false;
    Psi => "psi", Reference, false;
    BinEqBout => "bin_eq_bout", Reference, true;
    Betain => "betain", Reference, false;
    Betaout => "betaout", Reference, false;
    Mu => "mu", Sample, false;
    Eta => "eta", Sample, false;
    Chi => "chi", Sample, false;
    Phi => "phi", Sample, false;
    Bisect => "bisect", Sample, true;
    Omega => "omega", Sample, false;
}

impl fmt::Display for ConstraintName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstraintValue {
    Flag(bool),
    Value(f64),
}

impl ConstraintValue {
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::Value(value) => Some(value),
            Self::Flag(_) => None,
        }
    }
}

/// Constraint settings keyed by name. A key mapped to `None` has been
/// cleared and is distinct from a key that was never touched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Constraints(BTreeMap<ConstraintName, Option<ConstraintValue>>);

impl Constraints {
    pub fn get(&self, name: ConstraintName) -> Option<ConstraintValue> {
        self.0.get(&name).copied().flatten()
    }

    pub fn is_cleared(&self, name: ConstraintName) -> bool {
        matches!(self.0.get(&name), Some(None))
    }

    pub fn set(&mut self, name: ConstraintName, value: ConstraintValue) {
        self.0.insert(name, Some(value));
    }

    pub fn clear(&mut self, name: ConstraintName) {
        self.0.insert(name, None);
    }

    /// Active constraints; a `false` flag counts as inactive.
    pub fn active(&self) -> impl Iterator<Item = (ConstraintName, ConstraintValue)> + '_ {
        self.0.iter().filter_map(|(name, value)| match value {
            Some(ConstraintValue::Flag(false)) | None => None,
            Some(value) => Some((*name, *value)),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<ConstraintName, Option<ConstraintValue>> {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Property {
    NHkl,
    NPhi,
    SurfNhkl,
    SurfNphi,
}

impl Property {
    pub const ALL: &'static [Property] = &[
        Property::NHkl,
        Property::NPhi,
        Property::SurfNhkl,
        Property::SurfNphi,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Property::NHkl => "n_hkl",
            Property::NPhi => "n_phi",
            Property::SurfNhkl => "surf_nhkl",
            Property::SurfNphi => "surf_nphi",
        }
    }
}

impl FromStr for Property {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Property::ALL
            .iter()
            .copied()
            .find(|property| property.as_str() == value)
            .ok_or_else(|| {
                let allowed: Vec<_> = Property::ALL.iter().map(|p| p.as_str()).collect();
                format!(
                    "invalid property '{value}'; choose one of: {}",
                    allowed.join(", ")
                )
            })
    }
}

/// A direction expressed either in reciprocal-lattice units or in the phi frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "frame", content = "vector")]
pub enum FrameVector {
    Hkl(Vector),
    Phi(Vector),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceVectors {
    pub reference: Option<FrameVector>,
    pub surface: Option<FrameVector>,
}

impl ReferenceVectors {
    pub fn assign(&mut self, property: Property, value: Vector) {
        match property {
            Property::NHkl => self.reference = Some(FrameVector::Hkl(value)),
            Property::NPhi => self.reference = Some(FrameVector::Phi(value)),
            Property::SurfNhkl => self.surface = Some(FrameVector::Hkl(value)),
            Property::SurfNphi => self.surface = Some(FrameVector::Phi(value)),
        }
    }
}

/// Persisted calculation state for one named crystal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationState {
    name: String,
    pub lattice: Option<Lattice>,
    pub reflections: Vec<Reflection>,
    pub orientations: Vec<Orientation>,
    pub constraints: Constraints,
    #[serde(default)]
    pub vectors: ReferenceVectors,
    pub u: Option<Matrix>,
    pub ub: Option<Matrix>,
}

impl CalculationState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lattice: None,
            reflections: Vec::new(),
            orientations: Vec::new(),
            constraints: Constraints::default(),
            vectors: ReferenceVectors::default(),
            u: None,
            ub: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reflection_index(&self, key: &TagOrIndex) -> Option<usize> {
        locate(&self.reflections, key)
    }

    pub fn orientation_index(&self, key: &TagOrIndex) -> Option<usize> {
        locate(&self.orientations, key)
    }

    pub fn reflection_tag_in_use(&self, tag: &str) -> bool {
        tag_in_use(&self.reflections, tag)
    }

    pub fn orientation_tag_in_use(&self, tag: &str) -> bool {
        tag_in_use(&self.orientations, tag)
    }
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
