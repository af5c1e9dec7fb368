//! Blob format: a versioned JSON envelope around the state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::domain::CalculationState;
use thiserror::Error;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed blob: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported blob format version {0}")]
    UnsupportedVersion(u32),
    #[error("blob belongs to '{found}', expected '{expected}'")]
    NameMismatch { expected: String, found: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<S> {
    format_version: u32,
    name: String,
    saved_at: DateTime<Utc>,
    state: S,
}

pub fn encode(state: &CalculationState) -> Result<Vec<u8>, CodecError> {
    let envelope = Envelope {
        format_version: FORMAT_VERSION,
        name: state.name().to_string(),
        saved_at: Utc::now(),
        state,
    };
    Ok(serde_json::to_vec_pretty(&envelope)?)
}

pub fn decode(name: &str, bytes: &[u8]) -> Result<CalculationState, CodecError> {
    let envelope: Envelope<CalculationState> = serde_json::from_slice(bytes)?;
    if envelope.format_version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(envelope.format_version));
    }
    if envelope.name != name || envelope.state.name() != name {
        return Err(CodecError::NameMismatch {
            expected: name.to_string(),
            found: envelope.name,
        });
    }
    Ok(envelope.state)
}
