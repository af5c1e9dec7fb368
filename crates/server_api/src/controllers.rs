//! Single-edit operations on a loaded [`CalculationState`].
//!
//! Every function here validates completely before touching `state`, so an
//! error leaves the state exactly as it was handed in.

use std::str::FromStr;

use geometry::{matrices::b_matrix, GeometrySolver, Reference};
use shared::{
    domain::{
        CalculationState, ConstraintName, ConstraintValue, Constraints, CrystalSystem, Lattice,
        Matrix, Orientation, Position, Property, Reflection, TagOrIndex, Vector,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        AddOrientationParams, AddReflectionParams, EditOrientationParams, EditReflectionParams,
        LatticeParams,
    },
};

use crate::errors::solver_error;

pub fn parse_constraint(raw: &str) -> Result<ConstraintName, ApiError> {
    ConstraintName::from_str(raw)
        .map_err(|message| ApiError::new(ErrorCode::UnknownConstraint, message))
}

pub fn parse_property(raw: &str) -> Result<Property, ApiError> {
    Property::from_str(raw).map_err(|message| ApiError::new(ErrorCode::InvalidProperty, message))
}

/// Coerces `value` to the shape `name` stores: booleans for flag constraints,
/// finite numbers for the rest.
pub fn coerce_constraint(
    name: ConstraintName,
    value: ConstraintValue,
) -> Result<ConstraintValue, ApiError> {
    match (name.is_boolean(), value) {
        (true, ConstraintValue::Flag(flag)) => Ok(ConstraintValue::Flag(flag)),
        (true, ConstraintValue::Value(number)) if number.is_finite() => {
            Ok(ConstraintValue::Flag(number != 0.0))
        }
        (false, ConstraintValue::Value(number)) if number.is_finite() => {
            Ok(ConstraintValue::Value(number))
        }
        (false, ConstraintValue::Flag(_)) => Err(ApiError::invalid(format!(
            "constraint '{name}' takes a numeric value, not a flag"
        ))),
        _ => Err(ApiError::invalid(format!(
            "constraint '{name}' requires a finite value"
        ))),
    }
}

fn check_tag(tag: Option<&str>) -> Result<(), ApiError> {
    match tag {
        Some(tag) if tag.trim().is_empty() => Err(ApiError::invalid("tag must not be blank")),
        Some(tag) if matches!(TagOrIndex::parse(tag), TagOrIndex::Index(_)) => Err(
            ApiError::invalid(format!("tag '{tag}' would be read as an index")),
        ),
        _ => Ok(()),
    }
}

fn check_wavelength(wavelength: f64) -> Result<(), ApiError> {
    if wavelength.is_finite() && wavelength > 0.0 {
        Ok(())
    } else {
        Err(ApiError::invalid(format!(
            "wavelength must be positive, got {wavelength}"
        )))
    }
}

fn check_finite(label: &str, values: &[f64]) -> Result<(), ApiError> {
    if values.iter().all(|value| value.is_finite()) {
        Ok(())
    } else {
        Err(ApiError::invalid(format!("{label} must be finite")))
    }
}

fn check_position(position: &Position) -> Result<(), ApiError> {
    check_finite("position angles", &position.to_array())
}

fn infer_system(params: &LatticeParams) -> CrystalSystem {
    let angles = [params.alpha, params.beta, params.gamma];
    match (params.b, params.c, angles) {
        (None, None, [None, None, None]) => CrystalSystem::Cubic,
        (None, None, [Some(_), None, None]) => CrystalSystem::Rhombohedral,
        (None, Some(_), [None, None, None]) => CrystalSystem::Tetragonal,
        (None, Some(_), [None, None, Some(gamma)]) if gamma == 120.0 => CrystalSystem::Hexagonal,
        (_, _, [None, None, None]) => CrystalSystem::Orthorhombic,
        (_, _, [None, Some(_), None]) => CrystalSystem::Monoclinic,
        _ => CrystalSystem::Triclinic,
    }
}

/// Completes partial lattice parameters from the crystal system, given or
/// inferred, and checks the result describes a real cell.
pub fn build_lattice(params: &LatticeParams, default_name: &str) -> Result<Lattice, ApiError> {
    if params.is_empty() {
        return Err(ApiError::invalid("no lattice parameters supplied"));
    }
    let a = params
        .a
        .ok_or_else(|| ApiError::invalid("lattice parameter 'a' is required"))?;
    let system = match params.system.as_deref() {
        Some(raw) => CrystalSystem::from_str(raw).map_err(ApiError::invalid)?,
        None => infer_system(params),
    };

    let right = 90.0;
    let (b, c, alpha, beta, gamma) = match system {
        CrystalSystem::Cubic => (a, a, right, right, right),
        CrystalSystem::Tetragonal => (a, params.c.unwrap_or(a), right, right, right),
        CrystalSystem::Hexagonal => (a, params.c.unwrap_or(a), right, right, 120.0),
        CrystalSystem::Rhombohedral => {
            let alpha = params.alpha.unwrap_or(right);
            (a, a, alpha, alpha, alpha)
        }
        CrystalSystem::Orthorhombic => (
            params.b.unwrap_or(a),
            params.c.unwrap_or(a),
            right,
            right,
            right,
        ),
        CrystalSystem::Monoclinic => (
            params.b.unwrap_or(a),
            params.c.unwrap_or(a),
            right,
            params.beta.unwrap_or(right),
            right,
        ),
        CrystalSystem::Triclinic => (
            params.b.unwrap_or(a),
            params.c.unwrap_or(a),
            params.alpha.unwrap_or(right),
            params.beta.unwrap_or(right),
            params.gamma.unwrap_or(right),
        ),
    };

    for (label, length) in [("a", a), ("b", b), ("c", c)] {
        if !(length.is_finite() && length > 0.0) {
            return Err(ApiError::invalid(format!(
                "lattice length '{label}' must be positive, got {length}"
            )));
        }
    }
    for (label, angle) in [("alpha", alpha), ("beta", beta), ("gamma", gamma)] {
        if !(angle.is_finite() && angle > 0.0 && angle < 180.0) {
            return Err(ApiError::invalid(format!(
                "lattice angle '{label}' must lie strictly between 0 and 180, got {angle}"
            )));
        }
    }

    let lattice = Lattice {
        name: params
            .name
            .clone()
            .unwrap_or_else(|| default_name.to_string()),
        system,
        a,
        b,
        c,
        alpha,
        beta,
        gamma,
    };
    b_matrix(&lattice).map_err(|err| ApiError::invalid(err.to_string()))?;
    Ok(lattice)
}

pub fn set_lattice(state: &mut CalculationState, lattice: Lattice) {
    state.lattice = Some(lattice);
}

pub fn validate_new_reflection(params: &AddReflectionParams) -> Result<(), ApiError> {
    check_finite("hkl", &params.hkl)?;
    check_position(&params.position)?;
    check_wavelength(params.wavelength)?;
    check_tag(params.tag.as_deref())
}

pub fn add_reflection(
    state: &mut CalculationState,
    params: AddReflectionParams,
) -> Result<usize, ApiError> {
    if let Some(tag) = params.tag.as_deref() {
        if state.reflection_tag_in_use(tag) {
            return Err(duplicate("reflection", tag));
        }
    }
    state.reflections.push(Reflection {
        hkl: params.hkl,
        position: params.position,
        wavelength: params.wavelength,
        tag: params.tag,
    });
    Ok(state.reflections.len())
}

pub fn validate_reflection_edit(params: &EditReflectionParams) -> Result<(), ApiError> {
    if let Some(hkl) = &params.hkl {
        check_finite("hkl", hkl)?;
    }
    if let Some(position) = &params.position {
        check_position(position)?;
    }
    if let Some(wavelength) = params.wavelength {
        check_wavelength(wavelength)?;
    }
    check_tag(params.retag.as_deref())
}

pub fn edit_reflection(
    state: &mut CalculationState,
    params: EditReflectionParams,
) -> Result<(), ApiError> {
    let index = state
        .reflection_index(&params.tag_or_idx)
        .ok_or_else(|| missing("reflection", &params.tag_or_idx))?;
    if let Some(tag) = params.retag.as_deref() {
        if state.reflections[index].tag.as_deref() != Some(tag)
            && state.reflection_tag_in_use(tag)
        {
            return Err(duplicate("reflection", tag));
        }
    }

    let entry = &mut state.reflections[index];
    if let Some(hkl) = params.hkl {
        entry.hkl = hkl;
    }
    if let Some(position) = params.position {
        entry.position = position;
    }
    if let Some(wavelength) = params.wavelength {
        entry.wavelength = wavelength;
    }
    if let Some(tag) = params.retag {
        entry.tag = Some(tag);
    }
    Ok(())
}

pub fn delete_reflection(
    state: &mut CalculationState,
    key: &TagOrIndex,
) -> Result<Reflection, ApiError> {
    let index = state
        .reflection_index(key)
        .ok_or_else(|| missing("reflection", key))?;
    Ok(state.reflections.remove(index))
}

pub fn validate_new_orientation(params: &AddOrientationParams) -> Result<(), ApiError> {
    check_finite("hkl", &params.hkl)?;
    check_finite("xyz", &params.xyz)?;
    check_direction("hkl", &params.hkl)?;
    check_direction("xyz", &params.xyz)?;
    if let Some(position) = &params.position {
        check_position(position)?;
    }
    check_tag(params.tag.as_deref())
}

pub fn add_orientation(
    state: &mut CalculationState,
    params: AddOrientationParams,
) -> Result<usize, ApiError> {
    if let Some(tag) = params.tag.as_deref() {
        if state.orientation_tag_in_use(tag) {
            return Err(duplicate("orientation", tag));
        }
    }
    state.orientations.push(Orientation {
        hkl: params.hkl,
        xyz: params.xyz,
        position: params.position.unwrap_or_default(),
        tag: params.tag,
    });
    Ok(state.orientations.len())
}

pub fn validate_orientation_edit(params: &EditOrientationParams) -> Result<(), ApiError> {
    if let Some(hkl) = &params.hkl {
        check_finite("hkl", hkl)?;
        check_direction("hkl", hkl)?;
    }
    if let Some(xyz) = &params.xyz {
        check_finite("xyz", xyz)?;
        check_direction("xyz", xyz)?;
    }
    if let Some(position) = &params.position {
        check_position(position)?;
    }
    check_tag(params.retag.as_deref())
}

pub fn edit_orientation(
    state: &mut CalculationState,
    params: EditOrientationParams,
) -> Result<(), ApiError> {
    let index = state
        .orientation_index(&params.tag_or_idx)
        .ok_or_else(|| missing("orientation", &params.tag_or_idx))?;
    if let Some(tag) = params.retag.as_deref() {
        if state.orientations[index].tag.as_deref() != Some(tag)
            && state.orientation_tag_in_use(tag)
        {
            return Err(duplicate("orientation", tag));
        }
    }

    let entry = &mut state.orientations[index];
    if let Some(hkl) = params.hkl {
        entry.hkl = hkl;
    }
    if let Some(xyz) = params.xyz {
        entry.xyz = xyz;
    }
    if let Some(position) = params.position {
        entry.position = position;
    }
    if let Some(tag) = params.retag {
        entry.tag = Some(tag);
    }
    Ok(())
}

pub fn delete_orientation(
    state: &mut CalculationState,
    key: &TagOrIndex,
) -> Result<Orientation, ApiError> {
    let index = state
        .orientation_index(key)
        .ok_or_else(|| missing("orientation", key))?;
    Ok(state.orientations.remove(index))
}

/// `value` must already be coerced with [`coerce_constraint`].
pub fn set_constraint(state: &mut CalculationState, name: ConstraintName, value: ConstraintValue) {
    state.constraints.set(name, value);
}

/// Leaves the key behind as unset, which is not the same as a stored zero.
pub fn remove_constraint(state: &mut CalculationState, name: ConstraintName) {
    state.constraints.clear(name);
}

/// Installs `constraints` wholesale; names it leaves out that the state
/// already knew are cleared rather than forgotten.
pub fn replace_constraints(state: &mut CalculationState, mut constraints: Constraints) {
    for name in state.constraints.entries().keys() {
        if !constraints.entries().contains_key(name) {
            constraints.clear(*name);
        }
    }
    state.constraints = constraints;
}

pub fn modify_property(state: &mut CalculationState, property: Property, value: Vector) {
    state.vectors.assign(property, value);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefSlot {
    Reflection(usize),
    Orientation(usize),
}

fn resolve_slot(state: &CalculationState, key: &TagOrIndex) -> Result<RefSlot, ApiError> {
    state
        .reflection_index(key)
        .map(RefSlot::Reflection)
        .or_else(|| state.orientation_index(key).map(RefSlot::Orientation))
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::UnderDetermined,
                format!("no reflection or orientation matches '{key}'"),
            )
        })
}

fn reference(state: &CalculationState, slot: RefSlot) -> Reference<'_> {
    match slot {
        RefSlot::Reflection(index) => Reference::Reflection(&state.reflections[index]),
        RefSlot::Orientation(index) => Reference::Orientation(&state.orientations[index]),
    }
}

/// Picks the two references for a UB calculation. Without explicit keys the
/// first two reflections are used, then a reflection with the first
/// orientation, then the first two orientations.
fn choose_references(
    state: &CalculationState,
    first: Option<&TagOrIndex>,
    second: Option<&TagOrIndex>,
) -> Result<(RefSlot, RefSlot), ApiError> {
    let available = (0..state.reflections.len())
        .map(RefSlot::Reflection)
        .chain((0..state.orientations.len()).map(RefSlot::Orientation));

    let (first, second) = match (first, second) {
        (Some(first), Some(second)) => (
            resolve_slot(state, first)?,
            Some(resolve_slot(state, second)?),
        ),
        (Some(key), None) | (None, Some(key)) => {
            let pinned = resolve_slot(state, key)?;
            (pinned, available.clone().find(|slot| *slot != pinned))
        }
        (None, None) => {
            let mut defaults = available.clone();
            match defaults.next() {
                Some(slot) => (slot, defaults.next()),
                None => {
                    return Err(ApiError::new(
                        ErrorCode::UnderDetermined,
                        "no reflections or orientations to compute UB from",
                    ))
                }
            }
        }
    };

    match second {
        Some(second) if second != first => Ok((first, second)),
        Some(_) => Err(ApiError::new(
            ErrorCode::UnderDetermined,
            "UB needs two distinct references",
        )),
        None => Err(ApiError::new(
            ErrorCode::UnderDetermined,
            "UB needs a second reflection or orientation",
        )),
    }
}

/// Computes U and UB from two references and stores both on `state`.
pub fn compute_ub(
    state: &mut CalculationState,
    solver: &dyn GeometrySolver,
    first: Option<&TagOrIndex>,
    second: Option<&TagOrIndex>,
) -> Result<Matrix, ApiError> {
    let lattice = state.lattice.as_ref().ok_or_else(|| {
        ApiError::new(ErrorCode::UnderDetermined, "lattice has not been set")
    })?;
    let (first, second) = choose_references(state, first, second)?;
    let solution = solver
        .orientation_matrix(lattice, reference(state, first), reference(state, second))
        .map_err(solver_error)?;
    state.u = Some(solution.u);
    state.ub = Some(solution.ub);
    Ok(solution.ub)
}

fn check_direction(label: &str, vector: &Vector) -> Result<(), ApiError> {
    if vector.iter().all(|component| *component == 0.0) {
        Err(ApiError::invalid(format!("{label} must not be the zero vector")))
    } else {
        Ok(())
    }
}

fn duplicate(kind: &str, tag: &str) -> ApiError {
    ApiError::new(
        ErrorCode::DuplicateTag,
        format!("{kind} tag '{tag}' is already in use"),
    )
}

fn missing(kind: &str, key: &TagOrIndex) -> ApiError {
    ApiError::not_found(format!("no {kind} matches '{key}'"))
}

#[cfg(test)]
#[path = "tests/controllers_tests.rs"]
mod tests;
