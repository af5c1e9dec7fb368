//! Service façade over the calculation store, the mutation controllers and
//! the geometry solver. Every operation is `load -> delegate -> save if
//! mutating`, serialised per calculation name.

use std::{collections::BTreeMap, sync::Arc};

use geometry::GeometrySolver;
use shared::{
    domain::{
        CalculationState, ConstraintName, ConstraintValue, Constraints, Matrix, Position,
        TagOrIndex, Vector,
    },
    error::ApiError,
    protocol::{
        AddOrientationParams, AddReflectionParams, CalculationSummary, EditOrientationParams,
        EditReflectionParams, LatticeParams, PositionRecord, ScanResults,
    },
};
use storage::{validate_name, CalculationStore, NameLocks};
use tracing::{debug, info};

pub mod controllers;
mod errors;
pub mod scan;

pub use scan::ScanFailurePolicy;

use errors::{internal, solver_error, store_error};

pub const DEFAULT_MAX_SCAN_POINTS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    pub max_scan_points: usize,
    pub scan_failure_policy: ScanFailurePolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_scan_points: DEFAULT_MAX_SCAN_POINTS,
            scan_failure_policy: ScanFailurePolicy::FailFast,
        }
    }
}

#[derive(Clone)]
pub struct ApiContext {
    pub store: Arc<dyn CalculationStore>,
    pub solver: Arc<dyn GeometrySolver>,
    pub locks: NameLocks,
    pub config: ServiceConfig,
}

impl ApiContext {
    pub fn new(
        store: Arc<dyn CalculationStore>,
        solver: Arc<dyn GeometrySolver>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            solver,
            locks: NameLocks::new(),
            config,
        }
    }
}

fn check_name(name: &str) -> Result<(), ApiError> {
    validate_name(name).map_err(store_error)
}

/// Load, apply one edit, save. Nothing is written when `edit` fails.
///
/// The sequence runs on its own task that owns the write guard, so a caller
/// dropped mid-save cannot release the lock before the save settles.
async fn mutate<T, F>(ctx: &ApiContext, name: &str, edit: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&mut CalculationState) -> Result<T, ApiError> + Send + 'static,
{
    check_name(name)?;
    let guard = ctx.locks.write(name).await;
    let store = Arc::clone(&ctx.store);
    let name = name.to_string();
    tokio::spawn(async move {
        let _guard = guard;
        let mut state = store.load(&name).await.map_err(store_error)?;
        let output = edit(&mut state)?;
        store.save(&name, &state).await.map_err(store_error)?;
        Ok::<_, ApiError>(output)
    })
    .await
    .map_err(internal)?
}

/// Loads under the read guard and hands the state to the solver on the
/// blocking pool.
async fn solve<T, F>(ctx: &ApiContext, name: &str, work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&dyn GeometrySolver, CalculationState) -> Result<T, ApiError> + Send + 'static,
{
    check_name(name)?;
    let _guard = ctx.locks.read(name).await;
    let state = ctx.store.load(name).await.map_err(store_error)?;
    let solver = Arc::clone(&ctx.solver);
    tokio::task::spawn_blocking(move || work(solver.as_ref(), state))
        .await
        .map_err(internal)?
}

async fn inspect<T>(
    ctx: &ApiContext,
    name: &str,
    view: impl FnOnce(CalculationState) -> Result<T, ApiError>,
) -> Result<T, ApiError> {
    check_name(name)?;
    let _guard = ctx.locks.read(name).await;
    let state = ctx.store.load(name).await.map_err(store_error)?;
    view(state)
}

pub async fn create_entity(ctx: &ApiContext, name: &str) -> Result<String, ApiError> {
    check_name(name)?;
    let guard = ctx.locks.write(name).await;
    let store = Arc::clone(&ctx.store);
    let owned = name.to_string();
    let location = tokio::spawn(async move {
        let _guard = guard;
        store.create(&owned).await
    })
    .await
    .map_err(internal)?
    .map_err(store_error)?;
    info!(name, %location, "calculation created");
    Ok(location.to_string())
}

pub async fn delete_entity(ctx: &ApiContext, name: &str) -> Result<String, ApiError> {
    check_name(name)?;
    let guard = ctx.locks.write(name).await;
    let store = Arc::clone(&ctx.store);
    let owned = name.to_string();
    let location = tokio::spawn(async move {
        let _guard = guard;
        store.delete(&owned).await
    })
    .await
    .map_err(internal)?
    .map_err(store_error)?;
    info!(name, %location, "calculation deleted");
    Ok(location.to_string())
}

pub async fn list_entities(ctx: &ApiContext) -> Result<Vec<String>, ApiError> {
    ctx.store.list().await.map_err(store_error)
}

pub async fn describe(ctx: &ApiContext, name: &str) -> Result<CalculationSummary, ApiError> {
    inspect(ctx, name, |state| {
        Ok(CalculationSummary {
            name: state.name().to_string(),
            constraints: state.constraints.active().collect(),
            lattice: state.lattice,
            reflections: state.reflections,
            orientations: state.orientations,
            vectors: state.vectors,
            u: state.u,
            ub: state.ub,
        })
    })
    .await
}

pub async fn set_lattice(
    ctx: &ApiContext,
    name: &str,
    params: LatticeParams,
) -> Result<(), ApiError> {
    let lattice = controllers::build_lattice(&params, name)?;
    mutate(ctx, name, move |state| {
        controllers::set_lattice(state, lattice);
        Ok(())
    })
    .await?;
    debug!(name, "lattice updated");
    Ok(())
}

/// Returns the 1-based index of the new reflection.
pub async fn add_reflection(
    ctx: &ApiContext,
    name: &str,
    params: AddReflectionParams,
) -> Result<usize, ApiError> {
    controllers::validate_new_reflection(&params)?;
    mutate(ctx, name, move |state| controllers::add_reflection(state, params)).await
}

pub async fn edit_reflection(
    ctx: &ApiContext,
    name: &str,
    params: EditReflectionParams,
) -> Result<(), ApiError> {
    controllers::validate_reflection_edit(&params)?;
    mutate(ctx, name, move |state| controllers::edit_reflection(state, params)).await
}

pub async fn delete_reflection(
    ctx: &ApiContext,
    name: &str,
    key: &TagOrIndex,
) -> Result<(), ApiError> {
    let key = key.clone();
    mutate(ctx, name, move |state| {
        controllers::delete_reflection(state, &key).map(|_| ())
    })
    .await
}

/// Returns the 1-based index of the new orientation.
pub async fn add_orientation(
    ctx: &ApiContext,
    name: &str,
    params: AddOrientationParams,
) -> Result<usize, ApiError> {
    controllers::validate_new_orientation(&params)?;
    mutate(ctx, name, move |state| controllers::add_orientation(state, params)).await
}

pub async fn edit_orientation(
    ctx: &ApiContext,
    name: &str,
    params: EditOrientationParams,
) -> Result<(), ApiError> {
    controllers::validate_orientation_edit(&params)?;
    mutate(ctx, name, move |state| controllers::edit_orientation(state, params)).await
}

pub async fn delete_orientation(
    ctx: &ApiContext,
    name: &str,
    key: &TagOrIndex,
) -> Result<(), ApiError> {
    let key = key.clone();
    mutate(ctx, name, move |state| {
        controllers::delete_orientation(state, &key).map(|_| ())
    })
    .await
}

pub async fn modify_property(
    ctx: &ApiContext,
    name: &str,
    property: &str,
    value: Vector,
) -> Result<(), ApiError> {
    let property = controllers::parse_property(property)?;
    if value.iter().any(|component| !component.is_finite()) {
        return Err(ApiError::invalid(format!(
            "value for '{}' must be finite",
            property.as_str()
        )));
    }
    mutate(ctx, name, move |state| {
        controllers::modify_property(state, property, value);
        Ok(())
    })
    .await
}

pub async fn set_constraint(
    ctx: &ApiContext,
    name: &str,
    constraint: &str,
    value: ConstraintValue,
) -> Result<ConstraintValue, ApiError> {
    let constraint = controllers::parse_constraint(constraint)?;
    let value = controllers::coerce_constraint(constraint, value)?;
    mutate(ctx, name, move |state| {
        controllers::set_constraint(state, constraint, value);
        Ok(value)
    })
    .await
}

pub async fn remove_constraint(
    ctx: &ApiContext,
    name: &str,
    constraint: &str,
) -> Result<(), ApiError> {
    let constraint = controllers::parse_constraint(constraint)?;
    mutate(ctx, name, move |state| {
        controllers::remove_constraint(state, constraint);
        Ok(())
    })
    .await
}

/// Replaces every constraint at once. Names missing from `values` that were
/// set before are cleared, so they stay distinguishable from untouched ones.
pub async fn set_constraints(
    ctx: &ApiContext,
    name: &str,
    values: BTreeMap<String, ConstraintValue>,
) -> Result<(), ApiError> {
    let mut constraints = Constraints::default();
    for (raw, value) in values {
        let constraint = controllers::parse_constraint(&raw)?;
        constraints.set(constraint, controllers::coerce_constraint(constraint, value)?);
    }
    mutate(ctx, name, move |state| {
        controllers::replace_constraints(state, constraints);
        Ok(())
    })
    .await
}

pub async fn get_constraints(
    ctx: &ApiContext,
    name: &str,
) -> Result<BTreeMap<ConstraintName, ConstraintValue>, ApiError> {
    inspect(ctx, name, |state| Ok(state.constraints.active().collect())).await
}

/// Computes and stores UB, returned rounded to 6 decimals.
pub async fn compute_ub(
    ctx: &ApiContext,
    name: &str,
    first: Option<TagOrIndex>,
    second: Option<TagOrIndex>,
) -> Result<Matrix, ApiError> {
    let solver = Arc::clone(&ctx.solver);
    let ub = mutate(ctx, name, move |state| {
        controllers::compute_ub(state, solver.as_ref(), first.as_ref(), second.as_ref())
    })
    .await?;
    info!(name, "UB matrix computed");
    Ok(ub.map(|row| row.map(|value| round_to(value, 1e6))))
}

pub async fn position_from_hkl(
    ctx: &ApiContext,
    name: &str,
    hkl: Vector,
    wavelength: f64,
) -> Result<Vec<PositionRecord>, ApiError> {
    if hkl.iter().any(|value| !value.is_finite()) {
        return Err(ApiError::invalid("hkl must be finite"));
    }
    if hkl.iter().all(|value| *value == 0.0) {
        return Err(ApiError::invalid("hkl must not be (0, 0, 0)"));
    }
    check_wavelength(wavelength)?;
    solve(ctx, name, move |solver, state| {
        solver
            .positions(&state, hkl, wavelength)
            .map(scan::position_records)
            .map_err(solver_error)
    })
    .await
}

pub async fn hkl_from_position(
    ctx: &ApiContext,
    name: &str,
    position: Position,
    wavelength: f64,
) -> Result<Vector, ApiError> {
    if position.to_array().iter().any(|angle| !angle.is_finite()) {
        return Err(ApiError::invalid("position angles must be finite"));
    }
    check_wavelength(wavelength)?;
    let hkl = solve(ctx, name, move |solver, state| {
        solver
            .miller_indices(&state, &position, wavelength)
            .map_err(solver_error)
    })
    .await?;
    Ok(hkl.map(snap_to_integer))
}

pub async fn scan_hkl(
    ctx: &ApiContext,
    name: &str,
    start: Vector,
    stop: Vector,
    inc: Vector,
    wavelength: f64,
) -> Result<ScanResults, ApiError> {
    check_wavelength(wavelength)?;
    let points = scan::hkl_points(start, stop, inc, wavelength, ctx.config.max_scan_points)?;
    run_scan(ctx, name, points).await
}

pub async fn scan_wavelength(
    ctx: &ApiContext,
    name: &str,
    start: f64,
    stop: f64,
    inc: f64,
    hkl: Vector,
) -> Result<ScanResults, ApiError> {
    let points = scan::wavelength_points(start, stop, inc, hkl, ctx.config.max_scan_points)?;
    run_scan(ctx, name, points).await
}

#[allow(clippy::too_many_arguments)]
pub async fn scan_constraint(
    ctx: &ApiContext,
    name: &str,
    constraint: &str,
    start: f64,
    stop: f64,
    inc: f64,
    hkl: Vector,
    wavelength: f64,
) -> Result<ScanResults, ApiError> {
    let constraint = controllers::parse_constraint(constraint)?;
    check_wavelength(wavelength)?;
    let points = scan::constraint_points(
        constraint,
        (start, stop, inc),
        hkl,
        wavelength,
        ctx.config.max_scan_points,
    )?;
    run_scan(ctx, name, points).await
}

async fn run_scan(
    ctx: &ApiContext,
    name: &str,
    points: Vec<scan::ScanPoint>,
) -> Result<ScanResults, ApiError> {
    let policy = ctx.config.scan_failure_policy;
    let count = points.len();
    let results = solve(ctx, name, move |solver, state| {
        scan::run(solver, state, points, policy)
    })
    .await?;
    debug!(name, points = count, "scan finished");
    Ok(results)
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

fn round_to(value: f64, scale: f64) -> f64 {
    let rounded = (value * scale).round() / scale;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

fn snap_to_integer(value: f64) -> f64 {
    let nearest = value.round();
    if (value - nearest).abs() < 1e-12 {
        nearest + 0.0
    } else {
        value
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
