//! Sweeps over hkl, wavelength or a constraint value. Scans never write back:
//! each one runs against a private copy of the loaded state.

use std::str::FromStr;

use geometry::{GeometrySolver, Solution};
use serde::Deserialize;
use shared::{
    domain::{CalculationState, ConstraintName, ConstraintValue, Vector},
    error::ApiError,
    protocol::{PositionRecord, ScanEntry, ScanOutcome, ScanResults},
};

use crate::errors::solver_error;

/// What happens when one point of a sweep has no solution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanFailurePolicy {
    /// Abort the whole scan with the failing point's error.
    #[default]
    FailFast,
    /// Keep going and record the error against the failing point.
    Isolate,
}

impl FromStr for ScanFailurePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_fast" => Ok(Self::FailFast),
            "isolate" => Ok(Self::Isolate),
            other => Err(format!("unknown scan failure policy '{other}'")),
        }
    }
}

const STEP_TOLERANCE: f64 = 1e-9;

fn round_axis_value(value: f64) -> f64 {
    let rounded = (value * 1e10).round() / 1e10;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Number of points on `start..=stop` in steps of `inc`.
fn axis_len(start: f64, stop: f64, inc: f64) -> Result<usize, ApiError> {
    if !(start.is_finite() && stop.is_finite() && inc.is_finite()) {
        return Err(ApiError::invalid(format!(
            "scan range ({start}, {stop}, {inc}) must be finite"
        )));
    }
    if inc == 0.0 {
        return Ok(1);
    }
    let steps = (stop - start) / inc;
    if steps < -STEP_TOLERANCE {
        return Err(ApiError::invalid(format!(
            "increment {inc} does not move from {start} towards {stop}"
        )));
    }
    let steps = (steps + STEP_TOLERANCE).floor();
    if steps >= usize::MAX as f64 {
        return Err(ApiError::invalid("scan range has too many points"));
    }
    Ok(steps as usize + 1)
}

/// Inclusive axis from `start` to `stop`; a zero increment holds `start`.
pub fn axis(start: f64, stop: f64, inc: f64, max_points: usize) -> Result<Vec<f64>, ApiError> {
    let len = axis_len(start, stop, inc)?;
    check_budget(len, max_points)?;
    Ok((0..len)
        .map(|step| round_axis_value(start + step as f64 * inc))
        .collect())
}

fn check_budget(points: usize, max_points: usize) -> Result<(), ApiError> {
    if points > max_points {
        Err(ApiError::invalid(format!(
            "scan would visit {points} points, more than the limit of {max_points}"
        )))
    } else {
        Ok(())
    }
}

/// One solver call in a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPoint {
    pub key: String,
    pub hkl: Vector,
    pub wavelength: f64,
    pub constraint: Option<(ConstraintName, f64)>,
}

pub fn hkl_key(hkl: Vector) -> String {
    format!("({:?}, {:?}, {:?})", hkl[0], hkl[1], hkl[2])
}

pub fn value_key(value: f64) -> String {
    format!("{value:?}")
}

/// Cartesian product of the three per-axis ranges, h outermost.
pub fn hkl_points(
    start: Vector,
    stop: Vector,
    inc: Vector,
    wavelength: f64,
    max_points: usize,
) -> Result<Vec<ScanPoint>, ApiError> {
    let lens = [
        axis_len(start[0], stop[0], inc[0])?,
        axis_len(start[1], stop[1], inc[1])?,
        axis_len(start[2], stop[2], inc[2])?,
    ];
    let total = lens
        .iter()
        .try_fold(1usize, |acc, len| acc.checked_mul(*len))
        .unwrap_or(usize::MAX);
    check_budget(total, max_points)?;

    let hs = axis(start[0], stop[0], inc[0], max_points)?;
    let ks = axis(start[1], stop[1], inc[1], max_points)?;
    let ls = axis(start[2], stop[2], inc[2], max_points)?;

    let mut points = Vec::with_capacity(total);
    for h in &hs {
        for k in &ks {
            for l in &ls {
                let hkl = [*h, *k, *l];
                points.push(ScanPoint {
                    key: hkl_key(hkl),
                    hkl,
                    wavelength,
                    constraint: None,
                });
            }
        }
    }
    Ok(points)
}

pub fn wavelength_points(
    start: f64,
    stop: f64,
    inc: f64,
    hkl: Vector,
    max_points: usize,
) -> Result<Vec<ScanPoint>, ApiError> {
    axis(start, stop, inc, max_points)?
        .into_iter()
        .map(|wavelength| {
            if wavelength <= 0.0 {
                return Err(ApiError::invalid(format!(
                    "wavelength must be positive, got {wavelength}"
                )));
            }
            Ok(ScanPoint {
                key: value_key(wavelength),
                hkl,
                wavelength,
                constraint: None,
            })
        })
        .collect()
}

pub fn constraint_points(
    constraint: ConstraintName,
    range: (f64, f64, f64),
    hkl: Vector,
    wavelength: f64,
    max_points: usize,
) -> Result<Vec<ScanPoint>, ApiError> {
    if constraint.is_boolean() {
        return Err(ApiError::invalid(format!(
            "constraint '{constraint}' is a flag and cannot be scanned"
        )));
    }
    let (start, stop, inc) = range;
    Ok(axis(start, stop, inc, max_points)?
        .into_iter()
        .map(|value| ScanPoint {
            key: value_key(value),
            hkl,
            wavelength,
            constraint: Some((constraint, value)),
        })
        .collect())
}

pub fn position_records(solutions: Vec<Solution>) -> Vec<PositionRecord> {
    solutions
        .into_iter()
        .map(|solution| PositionRecord {
            position: solution.position,
            virtual_angles: solution.virtual_angles,
        })
        .collect()
}

/// Solves every point in order against `state`, which the caller owns and
/// discards afterwards. Blocking; run it off the async executor.
pub fn run(
    solver: &dyn GeometrySolver,
    mut state: CalculationState,
    points: Vec<ScanPoint>,
    policy: ScanFailurePolicy,
) -> Result<ScanResults, ApiError> {
    let mut results = ScanResults::default();
    for point in points {
        if let Some((name, value)) = point.constraint {
            state.constraints.set(name, ConstraintValue::Value(value));
        }
        let outcome = match solver.positions(&state, point.hkl, point.wavelength) {
            Ok(solutions) => ScanOutcome::Positions(position_records(solutions)),
            Err(err) => {
                let mut error = solver_error(err);
                error.message = format!("at {}: {}", point.key, error.message);
                match policy {
                    ScanFailurePolicy::FailFast => return Err(error),
                    ScanFailurePolicy::Isolate => ScanOutcome::Failed { error },
                }
            }
        };
        results.entries.push(ScanEntry {
            key: point.key,
            outcome,
        });
    }
    Ok(results)
}

#[cfg(test)]
#[path = "tests/scan_tests.rs"]
mod tests;
