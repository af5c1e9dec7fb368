use std::{collections::BTreeMap, f64::consts::PI};

use nalgebra::{Matrix3, Vector3};
use shared::domain::{
    CalculationState, ConstraintName, ConstraintValue, FrameVector, Lattice, Position, Vector,
};

use crate::{
    matrices::{
        b_matrix, clamp_unit, detector_rotation, from_matrix3, from_vector3, normalize_degrees,
        q_lab, q_phi, sample_rotation, to_matrix3, to_vector3, triad, x_rotation, y_rotation,
        z_rotation, EPSILON,
    },
    GeometrySolver, Reference, Solution, SolverError, UbSolution,
};

/// Largest hkl mismatch accepted when a candidate is mapped back.
const ROUND_TRIP_TOLERANCE: f64 = 1e-6;

/// Solver for the vertical four-circle subset of the six-circle geometry:
/// one detector constraint (`delta` or `nu`), a fixed `mu`, and one of
/// `eta`, `chi`, `phi` or `bisect`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FourCircleSolver;

#[derive(Debug, Clone, Copy)]
enum DetectorMode {
    Delta(f64),
    Nu(f64),
}

#[derive(Debug, Clone, Copy)]
enum SampleMode {
    Eta(f64),
    Chi(f64),
    Phi(f64),
    Bisect,
}

#[derive(Debug, Clone, Copy)]
struct Mode {
    detector: DetectorMode,
    mu: f64,
    sample: SampleMode,
}

fn describe_active(state: &CalculationState) -> String {
    let names: Vec<_> = state
        .constraints
        .active()
        .map(|(name, _)| name.as_str())
        .collect();
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

fn resolve_mode(state: &CalculationState) -> Result<Mode, SolverError> {
    let active: Vec<(ConstraintName, ConstraintValue)> = state.constraints.active().collect();
    if active.len() != 3 {
        return Err(SolverError::Rejected(format!(
            "calculation is not fully constrained: exactly three constraints are required, active: {}",
            describe_active(state)
        )));
    }

    let mut detector = None;
    let mut mu = None;
    let mut sample = None;
    for (name, value) in active {
        let angle = value.as_f64();
        match (name, angle) {
            (ConstraintName::Delta, Some(v)) => detector = Some(DetectorMode::Delta(v)),
            (ConstraintName::Nu, Some(v)) => detector = Some(DetectorMode::Nu(v)),
            (ConstraintName::Mu, Some(v)) => mu = Some(v),
            (ConstraintName::Eta, Some(v)) => sample = Some(SampleMode::Eta(v)),
            (ConstraintName::Chi, Some(v)) => sample = Some(SampleMode::Chi(v)),
            (ConstraintName::Phi, Some(v)) => sample = Some(SampleMode::Phi(v)),
            (ConstraintName::Bisect, None) => sample = Some(SampleMode::Bisect),
            _ => return Err(unsupported(state)),
        }
    }

    match (detector, mu, sample) {
        (Some(detector), Some(mu), Some(sample)) => Ok(Mode {
            detector,
            mu,
            sample,
        }),
        _ => Err(unsupported(state)),
    }
}

fn unsupported(state: &CalculationState) -> SolverError {
    SolverError::Rejected(format!(
        "constraint combination [{}] is not implemented; use one of delta/nu, mu and one of eta/chi/phi/bisect",
        describe_active(state)
    ))
}

fn ub_matrix(state: &CalculationState) -> Result<Matrix3<f64>, SolverError> {
    state
        .ub
        .as_ref()
        .map(to_matrix3)
        .ok_or_else(|| SolverError::Rejected("UB matrix has not been calculated".to_string()))
}

/// Detector settings (delta, nu) in radians reaching the given 2θ.
fn detector_candidates(mode: DetectorMode, two_theta: f64) -> Vec<(f64, f64)> {
    let cos_two_theta = two_theta.cos();
    let (fixed, fixed_is_nu) = match mode {
        DetectorMode::Delta(delta) => (delta.to_radians(), false),
        DetectorMode::Nu(nu) => (nu.to_radians(), true),
    };
    let cos_fixed = fixed.cos();
    if cos_fixed.abs() < EPSILON {
        return Vec::new();
    }
    let ratio = cos_two_theta / cos_fixed;
    if ratio.abs() > 1.0 + EPSILON {
        return Vec::new();
    }
    let free = clamp_unit(ratio).acos();
    let mut out = Vec::with_capacity(2);
    for signed in [free, -free] {
        let pair = if fixed_is_nu {
            (signed, fixed)
        } else {
            (fixed, signed)
        };
        if !out.iter().any(|existing: &(f64, f64)| {
            (existing.0 - pair.0).abs() < EPSILON && (existing.1 - pair.1).abs() < EPSILON
        }) {
            out.push(pair);
        }
    }
    out
}

/// Sample angles (eta, chi, phi) in radians taking the unit phi-frame vector
/// `v` onto the unit target `t0` (the lab direction with `mu` already removed).
fn sample_candidates(
    sample: SampleMode,
    delta: f64,
    v: &Vector3<f64>,
    t0: &Vector3<f64>,
) -> Vec<(f64, f64, f64)> {
    let radius = t0.x.hypot(t0.y);
    let offset = t0.y.atan2(t0.x);
    let mut out = Vec::new();

    match sample {
        SampleMode::Eta(_) | SampleMode::Bisect => {
            let eta = match sample {
                SampleMode::Eta(eta) => eta.to_radians(),
                _ => delta / 2.0,
            };
            let t = z_rotation(eta) * t0;
            let remainder = 1.0 - v.z * v.z - t.y * t.y;
            if remainder < -EPSILON {
                return out;
            }
            let magnitude = remainder.max(0.0).sqrt();
            for ux in [magnitude, -magnitude] {
                let chi = v.z.atan2(ux) - t.z.atan2(t.x);
                let phi = v.y.atan2(v.x) - t.y.atan2(ux);
                out.push((eta, chi, phi));
            }
        }
        SampleMode::Chi(chi) => {
            let chi = chi.to_radians();
            if chi.sin().abs() < EPSILON || radius < EPSILON {
                return out;
            }
            let ratio = (v.z - chi.cos() * t0.z) / chi.sin() / radius;
            if ratio.abs() > 1.0 + EPSILON {
                return out;
            }
            let base = clamp_unit(ratio).acos();
            for eta in [base - offset, -base - offset] {
                let s = z_rotation(eta) * t0;
                let u = y_rotation(-chi) * s;
                let phi = v.y.atan2(v.x) - u.y.atan2(u.x);
                out.push((eta, chi, phi));
            }
        }
        SampleMode::Phi(phi) => {
            let phi = phi.to_radians();
            if radius < EPSILON {
                return out;
            }
            let u = z_rotation(-phi) * v;
            let ratio = u.y / radius;
            if ratio.abs() > 1.0 + EPSILON {
                return out;
            }
            let base = clamp_unit(ratio).asin();
            for eta in [base - offset, PI - base - offset] {
                let s = z_rotation(eta) * t0;
                let chi = u.z.atan2(u.x) - s.z.atan2(s.x);
                out.push((eta, chi, phi));
            }
        }
    }
    out
}

fn same_position(a: &Position, b: &Position) -> bool {
    a.to_array()
        .iter()
        .zip(b.to_array().iter())
        .all(|(x, y)| (x - y).abs() < ROUND_TRIP_TOLERANCE)
}

fn unit_or(vector: Vector3<f64>, fallback: Vector3<f64>) -> Vector3<f64> {
    if vector.norm() < EPSILON {
        fallback
    } else {
        vector.normalize()
    }
}

fn phi_frame(vector: Option<FrameVector>, ub: &Matrix3<f64>) -> Vector3<f64> {
    let raw = match vector {
        Some(FrameVector::Phi(v)) => to_vector3(v),
        Some(FrameVector::Hkl(h)) => ub * to_vector3(h),
        None => Vector3::z(),
    };
    unit_or(raw, Vector3::z())
}

fn virtual_angles(
    state: &CalculationState,
    ub: &Matrix3<f64>,
    position: &Position,
    q: &Vector3<f64>,
) -> BTreeMap<String, f64> {
    let delta = position.delta.to_radians();
    let nu = position.nu.to_radians();
    let two_theta = clamp_unit(delta.cos() * nu.cos()).acos();
    let qaz = delta.sin().atan2(delta.cos() * nu.sin());

    let rotation = sample_rotation(position);
    let surface_lab = rotation * phi_frame(state.vectors.surface, ub);
    let outgoing = detector_rotation(position) * Vector3::y();
    let alpha = clamp_unit(-surface_lab.y).asin();
    let beta = clamp_unit(surface_lab.dot(&outgoing)).asin();

    let reference = phi_frame(state.vectors.reference, ub);
    let tau = if q.norm() < EPSILON {
        0.0
    } else {
        clamp_unit(q.normalize().dot(&reference)).acos()
    };

    BTreeMap::from([
        ("alpha".to_string(), alpha.to_degrees()),
        ("beta".to_string(), beta.to_degrees()),
        ("qaz".to_string(), qaz.to_degrees()),
        ("tau".to_string(), tau.to_degrees()),
        ("theta".to_string(), (two_theta / 2.0).to_degrees()),
        ("ttheta".to_string(), two_theta.to_degrees()),
    ])
}

fn indices_for(
    ub: &Matrix3<f64>,
    position: &Position,
    wavelength: f64,
) -> Result<Vector3<f64>, SolverError> {
    let inverse = ub
        .try_inverse()
        .ok_or_else(|| SolverError::Rejected("UB matrix is singular".to_string()))?;
    Ok(inverse * q_phi(position, wavelength))
}

fn reference_vectors(b: &Matrix3<f64>, reference: Reference<'_>) -> (Vector3<f64>, Vector3<f64>) {
    match reference {
        Reference::Reflection(reflection) => (
            b * to_vector3(reflection.hkl),
            q_phi(&reflection.position, reflection.wavelength),
        ),
        Reference::Orientation(orientation) => (
            b * to_vector3(orientation.hkl),
            sample_rotation(&orientation.position).transpose() * to_vector3(orientation.xyz),
        ),
    }
}

fn check_wavelength(wavelength: f64) -> Result<(), SolverError> {
    if wavelength.is_finite() && wavelength > 0.0 {
        Ok(())
    } else {
        Err(SolverError::Rejected(format!(
            "wavelength must be positive, got {wavelength}"
        )))
    }
}

impl GeometrySolver for FourCircleSolver {
    fn positions(
        &self,
        state: &CalculationState,
        hkl: Vector,
        wavelength: f64,
    ) -> Result<Vec<Solution>, SolverError> {
        check_wavelength(wavelength)?;
        let ub = ub_matrix(state)?;
        let mode = resolve_mode(state)?;

        let q = ub * to_vector3(hkl);
        let k = 2.0 * PI / wavelength;
        if q.norm() < EPSILON {
            return Err(SolverError::Rejected(
                "scattering vector is zero for the requested indices".to_string(),
            ));
        }
        let sin_theta = q.norm() / (2.0 * k);
        if sin_theta > 1.0 {
            return Err(SolverError::Rejected(format!(
                "reflection {hkl:?} is unreachable at wavelength {wavelength}"
            )));
        }
        let two_theta = 2.0 * sin_theta.asin();
        let v = q.normalize();
        let mu = mode.mu.to_radians();

        let mut solutions: Vec<Solution> = Vec::new();
        for (delta, nu) in detector_candidates(mode.detector, two_theta) {
            let detector = Position {
                delta: delta.to_degrees(),
                nu: nu.to_degrees(),
                ..Position::default()
            };
            let lab = q_lab(&detector, wavelength);
            if lab.norm() < EPSILON {
                continue;
            }
            let t0 = x_rotation(-mu) * lab.normalize();

            for (eta, chi, phi) in sample_candidates(mode.sample, delta, &v, &t0) {
                let position = Position {
                    mu: normalize_degrees(mode.mu),
                    delta: normalize_degrees(delta.to_degrees()),
                    nu: normalize_degrees(nu.to_degrees()),
                    eta: normalize_degrees(eta.to_degrees()),
                    chi: normalize_degrees(chi.to_degrees()),
                    phi: normalize_degrees(phi.to_degrees()),
                };
                let back = indices_for(&ub, &position, wavelength)?;
                let mismatch = (back - to_vector3(hkl)).amax();
                if mismatch > ROUND_TRIP_TOLERANCE {
                    continue;
                }
                if solutions
                    .iter()
                    .any(|existing| same_position(&existing.position, &position))
                {
                    continue;
                }
                let virtual_angles = virtual_angles(state, &ub, &position, &q);
                solutions.push(Solution {
                    position,
                    virtual_angles,
                });
            }
        }

        if solutions.is_empty() {
            return Err(SolverError::Rejected(format!(
                "no diffractometer position reaches {hkl:?} with constraints [{}]",
                describe_active(state)
            )));
        }
        Ok(solutions)
    }

    fn miller_indices(
        &self,
        state: &CalculationState,
        position: &Position,
        wavelength: f64,
    ) -> Result<Vector, SolverError> {
        check_wavelength(wavelength)?;
        let ub = ub_matrix(state)?;
        Ok(from_vector3(&indices_for(&ub, position, wavelength)?))
    }

    fn orientation_matrix(
        &self,
        lattice: &Lattice,
        first: Reference<'_>,
        second: Reference<'_>,
    ) -> Result<UbSolution, SolverError> {
        let b = b_matrix(lattice)?;
        let (h1, u1) = reference_vectors(&b, first);
        let (h2, u2) = reference_vectors(&b, second);

        let crystal = triad(&h1, &h2).ok_or_else(|| {
            SolverError::UnderDetermined(
                "reference miller indices are parallel or zero".to_string(),
            )
        })?;
        let phi = triad(&u1, &u2).ok_or_else(|| {
            SolverError::UnderDetermined(
                "reference directions in the phi frame are parallel or zero".to_string(),
            )
        })?;

        let u = phi * crystal.transpose();
        Ok(UbSolution {
            u: from_matrix3(&u),
            ub: from_matrix3(&(u * b)),
        })
    }
}

#[cfg(test)]
#[path = "tests/four_circle_tests.rs"]
mod tests;
