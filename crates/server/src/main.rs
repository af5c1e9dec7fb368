use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Path, Query, State,
    },
    http::StatusCode,
    routing::{get, patch, post, put},
    Json, Router,
};
use geometry::FourCircleSolver;
use serde::{de::DeserializeOwned, Deserialize};
use server_api::ApiContext;
use shared::{
    domain::{ConstraintName, ConstraintValue, Matrix, Position, TagOrIndex, Vector},
    error::{ApiError, ErrorCode},
    protocol::{
        AddOrientationParams, AddReflectionParams, CalculationSummary, EditOrientationParams,
        EditReflectionParams, LatticeParams, MessageResponse, Payload, PositionRecord,
        ScanResults,
    },
};
use storage::FileStore;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, prepare_store_root};

#[derive(Clone)]
struct AppState {
    api: ApiContext,
}

type HttpError = (StatusCode, Json<ApiError>);
type HttpResult<T> = Result<Json<T>, HttpError>;

#[derive(Debug, Deserialize)]
struct UbQuery {
    first_tag: Option<String>,
    second_tag: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagQuery {
    tag_or_idx: String,
}

#[derive(Debug, Deserialize)]
struct LabQuery {
    hkl: String,
    wavelength: f64,
}

#[derive(Debug, Deserialize)]
struct HklQuery {
    pos: String,
    wavelength: f64,
}

#[derive(Debug, Deserialize)]
struct HklScanQuery {
    start: String,
    stop: String,
    inc: String,
    wavelength: f64,
}

#[derive(Debug, Deserialize)]
struct WavelengthScanQuery {
    start: f64,
    stop: f64,
    inc: f64,
    hkl: String,
}

#[derive(Debug, Deserialize)]
struct ConstraintScanQuery {
    start: f64,
    stop: f64,
    inc: f64,
    hkl: String,
    wavelength: f64,
}

#[derive(Debug, Deserialize)]
struct VectorBody {
    value: Vector,
}

#[derive(Debug, Deserialize)]
struct ConstraintBody {
    value: ConstraintValue,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let store_root = prepare_store_root(&settings)?;
    let store = FileStore::new(&store_root)
        .with_context(|| format!("failed to open store at '{}'", store_root.display()))?;
    let api = ApiContext::new(
        Arc::new(store),
        Arc::new(FourCircleSolver),
        settings.service_config(),
    );
    let app = build_router(Arc::new(AppState { api }), settings.max_body_bytes);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, store_root = %store_root.display(), "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/:name", post(create_calculation).delete(delete_calculation))
        .route("/ub/:name", get(describe_calculation))
        .route("/ub/:name/lattice", patch(set_lattice))
        .route(
            "/ub/:name/reflection",
            put(add_reflection)
                .patch(edit_reflection)
                .delete(delete_reflection),
        )
        .route(
            "/ub/:name/orientation",
            put(add_orientation)
                .patch(edit_orientation)
                .delete(delete_orientation),
        )
        .route("/ub/:name/:property", patch(modify_property))
        .route("/calculate/:name/UB", get(calculate_ub))
        .route("/calculate/:name/position/lab", get(lab_position))
        .route("/calculate/:name/position/hkl", get(miller_indices))
        .route("/calculate/:name/scan/hkl", get(scan_hkl))
        .route("/calculate/:name/scan/wavelength", get(scan_wavelength))
        .route("/calculate/:name/scan/:constraint", get(scan_constraint))
        .route(
            "/constraints/:name",
            get(get_constraints).put(replace_constraints),
        )
        .route(
            "/constraints/:name/:constraint",
            patch(set_constraint).delete(remove_constraint),
        )
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::AlreadyExists | ErrorCode::DuplicateTag => StatusCode::CONFLICT,
        ErrorCode::InvalidParameters
        | ErrorCode::InvalidProperty
        | ErrorCode::UnknownConstraint
        | ErrorCode::UnderDetermined
        | ErrorCode::SolverError => StatusCode::BAD_REQUEST,
        ErrorCode::StorageError | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn http_error(err: ApiError) -> HttpError {
    let status = status_for(err.code);
    if status.is_server_error() {
        warn!(code = ?err.code, message = %err.message, "request failed");
    }
    (status, Json(err))
}

fn query<T>(raw: Result<Query<T>, QueryRejection>) -> Result<T, HttpError> {
    raw.map(|Query(value)| value)
        .map_err(|rejection| http_error(ApiError::invalid(rejection.body_text())))
}

fn body<T: DeserializeOwned>(raw: Result<Json<T>, JsonRejection>) -> Result<T, HttpError> {
    raw.map(|Json(value)| value).map_err(|rejection| {
        let err = ApiError::invalid(rejection.body_text());
        (rejection.status(), Json(err))
    })
}

fn parse_numbers<const N: usize>(field: &str, raw: &str) -> Result<[f64; N], HttpError> {
    let trimmed = raw
        .trim()
        .trim_start_matches(['[', '('])
        .trim_end_matches([']', ')']);
    let values = trimmed
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| {
            http_error(ApiError::invalid(format!(
                "'{field}' must be {N} comma-separated numbers, got '{raw}'"
            )))
        })?;
    values.try_into().map_err(|values: Vec<f64>| {
        http_error(ApiError::invalid(format!(
            "'{field}' must have {N} components, got {}",
            values.len()
        )))
    })
}

fn message(text: impl Into<String>) -> Json<MessageResponse> {
    Json(MessageResponse::new(text))
}

fn payload<T>(value: T) -> Json<Payload<T>> {
    Json(Payload { payload: value })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn create_calculation(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<MessageResponse>), HttpError> {
    let location = server_api::create_entity(&state.api, &name)
        .await
        .map_err(http_error)?;
    Ok((
        StatusCode::CREATED,
        message(format!("created calculation '{name}' at {location}")),
    ))
}

async fn delete_calculation(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> HttpResult<MessageResponse> {
    let location = server_api::delete_entity(&state.api, &name)
        .await
        .map_err(http_error)?;
    Ok(message(format!("deleted calculation '{name}' from {location}")))
}

async fn describe_calculation(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> HttpResult<Payload<CalculationSummary>> {
    server_api::describe(&state.api, &name)
        .await
        .map(payload)
        .map_err(http_error)
}

async fn set_lattice(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    params: Result<Json<LatticeParams>, JsonRejection>,
) -> HttpResult<MessageResponse> {
    server_api::set_lattice(&state.api, &name, body(params)?)
        .await
        .map_err(http_error)?;
    Ok(message(format!("lattice set for '{name}'")))
}

async fn add_reflection(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    params: Result<Json<AddReflectionParams>, JsonRejection>,
) -> HttpResult<MessageResponse> {
    let index = server_api::add_reflection(&state.api, &name, body(params)?)
        .await
        .map_err(http_error)?;
    Ok(message(format!("added reflection {index} to '{name}'")))
}

async fn edit_reflection(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    params: Result<Json<EditReflectionParams>, JsonRejection>,
) -> HttpResult<MessageResponse> {
    let params = body(params)?;
    let key = params.tag_or_idx.clone();
    server_api::edit_reflection(&state.api, &name, params)
        .await
        .map_err(http_error)?;
    Ok(message(format!("edited reflection {key} of '{name}'")))
}

async fn delete_reflection(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    params: Result<Query<TagQuery>, QueryRejection>,
) -> HttpResult<MessageResponse> {
    let key = TagOrIndex::parse(&query(params)?.tag_or_idx);
    server_api::delete_reflection(&state.api, &name, &key)
        .await
        .map_err(http_error)?;
    Ok(message(format!("deleted reflection {key} of '{name}'")))
}

async fn add_orientation(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    params: Result<Json<AddOrientationParams>, JsonRejection>,
) -> HttpResult<MessageResponse> {
    let index = server_api::add_orientation(&state.api, &name, body(params)?)
        .await
        .map_err(http_error)?;
    Ok(message(format!("added orientation {index} to '{name}'")))
}

async fn edit_orientation(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    params: Result<Json<EditOrientationParams>, JsonRejection>,
) -> HttpResult<MessageResponse> {
    let params = body(params)?;
    let key = params.tag_or_idx.clone();
    server_api::edit_orientation(&state.api, &name, params)
        .await
        .map_err(http_error)?;
    Ok(message(format!("edited orientation {key} of '{name}'")))
}

async fn delete_orientation(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    params: Result<Query<TagQuery>, QueryRejection>,
) -> HttpResult<MessageResponse> {
    let key = TagOrIndex::parse(&query(params)?.tag_or_idx);
    server_api::delete_orientation(&state.api, &name, &key)
        .await
        .map_err(http_error)?;
    Ok(message(format!("deleted orientation {key} of '{name}'")))
}

async fn modify_property(
    State(state): State<Arc<AppState>>,
    Path((name, property)): Path<(String, String)>,
    params: Result<Json<VectorBody>, JsonRejection>,
) -> HttpResult<MessageResponse> {
    let VectorBody { value } = body(params)?;
    server_api::modify_property(&state.api, &name, &property, value)
        .await
        .map_err(http_error)?;
    Ok(message(format!("{property} set to {value:?} for '{name}'")))
}

async fn calculate_ub(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    params: Result<Query<UbQuery>, QueryRejection>,
) -> HttpResult<Payload<Matrix>> {
    let UbQuery {
        first_tag,
        second_tag,
    } = query(params)?;
    server_api::compute_ub(
        &state.api,
        &name,
        first_tag.as_deref().map(TagOrIndex::parse),
        second_tag.as_deref().map(TagOrIndex::parse),
    )
    .await
    .map(payload)
    .map_err(http_error)
}

async fn lab_position(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    params: Result<Query<LabQuery>, QueryRejection>,
) -> HttpResult<Payload<Vec<PositionRecord>>> {
    let params = query(params)?;
    let hkl = parse_numbers::<3>("hkl", &params.hkl)?;
    server_api::position_from_hkl(&state.api, &name, hkl, params.wavelength)
        .await
        .map(payload)
        .map_err(http_error)
}

async fn miller_indices(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    params: Result<Query<HklQuery>, QueryRejection>,
) -> HttpResult<Payload<Vector>> {
    let params = query(params)?;
    let position = Position::from_array(parse_numbers::<6>("pos", &params.pos)?);
    server_api::hkl_from_position(&state.api, &name, position, params.wavelength)
        .await
        .map(payload)
        .map_err(http_error)
}

async fn scan_hkl(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    params: Result<Query<HklScanQuery>, QueryRejection>,
) -> HttpResult<Payload<ScanResults>> {
    let params = query(params)?;
    let start = parse_numbers::<3>("start", &params.start)?;
    let stop = parse_numbers::<3>("stop", &params.stop)?;
    let inc = parse_numbers::<3>("inc", &params.inc)?;
    server_api::scan_hkl(&state.api, &name, start, stop, inc, params.wavelength)
        .await
        .map(payload)
        .map_err(http_error)
}

async fn scan_wavelength(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    params: Result<Query<WavelengthScanQuery>, QueryRejection>,
) -> HttpResult<Payload<ScanResults>> {
    let params = query(params)?;
    let hkl = parse_numbers::<3>("hkl", &params.hkl)?;
    server_api::scan_wavelength(
        &state.api,
        &name,
        params.start,
        params.stop,
        params.inc,
        hkl,
    )
    .await
    .map(payload)
    .map_err(http_error)
}

async fn scan_constraint(
    State(state): State<Arc<AppState>>,
    Path((name, constraint)): Path<(String, String)>,
    params: Result<Query<ConstraintScanQuery>, QueryRejection>,
) -> HttpResult<Payload<ScanResults>> {
    let params = query(params)?;
    let hkl = parse_numbers::<3>("hkl", &params.hkl)?;
    server_api::scan_constraint(
        &state.api,
        &name,
        &constraint,
        params.start,
        params.stop,
        params.inc,
        hkl,
        params.wavelength,
    )
    .await
    .map(payload)
    .map_err(http_error)
}

async fn get_constraints(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> HttpResult<Payload<BTreeMap<ConstraintName, ConstraintValue>>> {
    server_api::get_constraints(&state.api, &name)
        .await
        .map(payload)
        .map_err(http_error)
}

async fn replace_constraints(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    params: Result<Json<BTreeMap<String, ConstraintValue>>, JsonRejection>,
) -> HttpResult<MessageResponse> {
    server_api::set_constraints(&state.api, &name, body(params)?)
        .await
        .map_err(http_error)?;
    Ok(message(format!("constraints replaced for '{name}'")))
}

async fn set_constraint(
    State(state): State<Arc<AppState>>,
    Path((name, constraint)): Path<(String, String)>,
    params: Result<Json<ConstraintBody>, JsonRejection>,
) -> HttpResult<MessageResponse> {
    let ConstraintBody { value } = body(params)?;
    let stored = server_api::set_constraint(&state.api, &name, &constraint, value)
        .await
        .map_err(http_error)?;
    let shown = match stored {
        ConstraintValue::Flag(flag) => flag.to_string(),
        ConstraintValue::Value(value) => value.to_string(),
    };
    Ok(message(format!("{constraint} set to {shown} for '{name}'")))
}

async fn remove_constraint(
    State(state): State<Arc<AppState>>,
    Path((name, constraint)): Path<(String, String)>,
) -> HttpResult<MessageResponse> {
    server_api::remove_constraint(&state.api, &name, &constraint)
        .await
        .map_err(http_error)?;
    Ok(message(format!("{constraint} cleared for '{name}'")))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
