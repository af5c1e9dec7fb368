//! Rotation matrices and frame conversions for the six-circle convention:
//! beam along +y, z up, all angles in degrees at the public boundary.

use std::f64::consts::TAU;

use nalgebra::{Matrix3, Vector3};
use shared::domain::{Lattice, Matrix, Position, Vector};

use crate::SolverError;

pub(crate) const EPSILON: f64 = 1e-8;

pub fn x_rotation(theta: f64) -> Matrix3<f64> {
    let (s, c) = theta.sin_cos();
    Matrix3::new(1.0, 0.0, 0.0, 0.0, c, -s, 0.0, s, c)
}

pub fn y_rotation(theta: f64) -> Matrix3<f64> {
    let (s, c) = theta.sin_cos();
    Matrix3::new(c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c)
}

pub fn z_rotation(theta: f64) -> Matrix3<f64> {
    let (s, c) = theta.sin_cos();
    Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0)
}

pub fn to_matrix3(matrix: &Matrix) -> Matrix3<f64> {
    Matrix3::from_fn(|row, col| matrix[row][col])
}

pub fn from_matrix3(matrix: &Matrix3<f64>) -> Matrix {
    let mut out = [[0.0; 3]; 3];
    for (row, values) in out.iter_mut().enumerate() {
        for (col, value) in values.iter_mut().enumerate() {
            *value = matrix[(row, col)];
        }
    }
    out
}

pub fn to_vector3(vector: Vector) -> Vector3<f64> {
    Vector3::new(vector[0], vector[1], vector[2])
}

pub fn from_vector3(vector: &Vector3<f64>) -> Vector {
    [vector.x, vector.y, vector.z]
}

/// Combined sample rotation `MU·ETA·CHI·PHI`, taking phi-frame vectors to the lab.
pub fn sample_rotation(position: &Position) -> Matrix3<f64> {
    x_rotation(position.mu.to_radians())
        * z_rotation(-position.eta.to_radians())
        * y_rotation(position.chi.to_radians())
        * z_rotation(-position.phi.to_radians())
}

/// Detector rotation `NU·DELTA`.
pub fn detector_rotation(position: &Position) -> Matrix3<f64> {
    x_rotation(position.nu.to_radians()) * z_rotation(-position.delta.to_radians())
}

/// Scattering vector in the lab frame, in 2π/Å.
pub fn q_lab(position: &Position, wavelength: f64) -> Vector3<f64> {
    let k = TAU / wavelength;
    let incoming = Vector3::new(0.0, k, 0.0);
    detector_rotation(position) * incoming - incoming
}

/// Scattering vector carried back into the phi frame.
pub fn q_phi(position: &Position, wavelength: f64) -> Vector3<f64> {
    sample_rotation(position).transpose() * q_lab(position, wavelength)
}

/// Reciprocal-lattice B matrix (2π convention).
pub fn b_matrix(lattice: &Lattice) -> Result<Matrix3<f64>, SolverError> {
    let (a1, a2, a3) = (lattice.a, lattice.b, lattice.c);
    let (alpha1, alpha2, alpha3) = (
        lattice.alpha.to_radians(),
        lattice.beta.to_radians(),
        lattice.gamma.to_radians(),
    );
    let (c1, c2, c3) = (alpha1.cos(), alpha2.cos(), alpha3.cos());
    let (s1, s2, s3) = (alpha1.sin(), alpha2.sin(), alpha3.sin());

    let radicand = 1.0 - c1 * c1 - c2 * c2 - c3 * c3 + 2.0 * c1 * c2 * c3;
    if radicand <= EPSILON || a1 <= 0.0 || a2 <= 0.0 || a3 <= 0.0 {
        return Err(SolverError::Rejected(format!(
            "lattice '{}' does not describe a valid unit cell",
            lattice.name
        )));
    }
    let volume = a1 * a2 * a3 * radicand.sqrt();

    let b1 = TAU * a2 * a3 * s1 / volume;
    let b2 = TAU * a1 * a3 * s2 / volume;
    let b3 = TAU * a1 * a2 * s3 / volume;

    let beta2 = clamp_unit((c1 * c3 - c2) / (s1 * s3)).acos();
    let beta3 = clamp_unit((c1 * c2 - c3) / (s1 * s2)).acos();

    Ok(Matrix3::new(
        b1,
        b2 * beta3.cos(),
        b3 * beta2.cos(),
        0.0,
        b2 * beta3.sin(),
        -b3 * beta2.sin() * c1,
        0.0,
        0.0,
        TAU / a3,
    ))
}

pub(crate) fn clamp_unit(value: f64) -> f64 {
    value.clamp(-1.0, 1.0)
}

/// Wrap an angle in degrees into (-180, 180].
pub fn normalize_degrees(angle: f64) -> f64 {
    let mut wrapped = angle % 360.0;
    if wrapped <= -180.0 {
        wrapped += 360.0;
    } else if wrapped > 180.0 {
        wrapped -= 360.0;
    }
    if wrapped.abs() < 1e-10 {
        0.0
    } else {
        wrapped
    }
}

/// Orthonormal triad built from two non-parallel vectors, as columns.
pub(crate) fn triad(first: &Vector3<f64>, second: &Vector3<f64>) -> Option<Matrix3<f64>> {
    if first.norm() < EPSILON || second.norm() < EPSILON {
        return None;
    }
    let t1 = first.normalize();
    let normal = first.cross(second);
    if normal.norm() < EPSILON * first.norm() * second.norm() {
        return None;
    }
    let t3 = normal.normalize();
    let t2 = t3.cross(&t1);
    Some(Matrix3::from_columns(&[t1, t2, t3]))
}
