//! Diffractometer geometry: UB matrices and the mapping between Miller
//! indices and lab positions.

use std::collections::BTreeMap;

use shared::domain::{CalculationState, Lattice, Matrix, Orientation, Position, Reflection, Vector};
use thiserror::Error;

mod four_circle;
pub mod matrices;

pub use four_circle::FourCircleSolver;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolverError {
    /// Not enough reference data to pin the orientation down.
    #[error("{0}")]
    UnderDetermined(String),
    /// The geometry cannot satisfy the request.
    #[error("{0}")]
    Rejected(String),
}

/// One candidate lab position with its derived virtual angles (degrees).
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub position: Position,
    pub virtual_angles: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UbSolution {
    pub u: Matrix,
    pub ub: Matrix,
}

#[derive(Debug, Clone, Copy)]
pub enum Reference<'a> {
    Reflection(&'a Reflection),
    Orientation(&'a Orientation),
}

pub trait GeometrySolver: Send + Sync {
    /// All lab positions reaching `hkl` at `wavelength` under the state's constraints.
    fn positions(
        &self,
        state: &CalculationState,
        hkl: Vector,
        wavelength: f64,
    ) -> Result<Vec<Solution>, SolverError>;

    fn miller_indices(
        &self,
        state: &CalculationState,
        position: &Position,
        wavelength: f64,
    ) -> Result<Vector, SolverError>;

    fn orientation_matrix(
        &self,
        lattice: &Lattice,
        first: Reference<'_>,
        second: Reference<'_>,
    ) -> Result<UbSolution, SolverError>;
}
