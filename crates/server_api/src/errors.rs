use geometry::SolverError;
use shared::error::{ApiError, ErrorCode};
use storage::StoreError;
use tracing::error;

pub(crate) fn store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::NotFound(name) => {
            ApiError::not_found(format!("calculation '{name}' does not exist"))
        }
        StoreError::AlreadyExists(name) => ApiError::new(
            ErrorCode::AlreadyExists,
            format!("calculation '{name}' already exists"),
        ),
        StoreError::InvalidName { .. } => ApiError::invalid(err.to_string()),
        StoreError::Task(_) => internal(err),
        StoreError::Codec { .. } | StoreError::Io { .. } => {
            error!(error = %err, "calculation store failure");
            ApiError::new(ErrorCode::StorageError, err.to_string())
        }
    }
}

pub(crate) fn solver_error(err: SolverError) -> ApiError {
    match err {
        SolverError::UnderDetermined(message) => {
            ApiError::new(ErrorCode::UnderDetermined, message)
        }
        SolverError::Rejected(message) => ApiError::new(ErrorCode::SolverError, message),
    }
}

pub(crate) fn internal(err: impl std::fmt::Display) -> ApiError {
    error!(error = %err, "internal failure");
    ApiError::new(ErrorCode::Internal, err.to_string())
}
