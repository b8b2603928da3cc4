use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use std::{io, time::Duration};
use thiserror::Error;

use super::{
    config::ParamError, executor::ExecutionOutcome, normalizer::ParseError,
    prerequisites::PrerequisiteError,
};

/// Upper bound on raw detector output echoed back in a parse failure.
pub const MAX_EXCERPT_BYTES: usize = 2048;

/// Every way a detection request can fail. Each variant maps to one HTTP
/// status and body in [`DetectionError::status_code`] and
/// [`DetectionError::body`].
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("no point cloud file provided, use multipart field \"point_cloud\"")]
    MissingInput,
    #[error("invalid parameter format")]
    InvalidParameters(#[from] ParamError),
    #[error("malformed multipart request: {0}")]
    MalformedUpload(String),
    #[error("failed to save input file")]
    StorageFailure(#[source] io::Error),
    #[error("detector prerequisites missing")]
    Configuration(#[from] PrerequisiteError),
    #[error("failed to start detector")]
    SpawnFailure(#[source] io::Error),
    #[error("detection command failed")]
    ExecutionFailed(ExecutionOutcome),
    #[error("detection command timed out")]
    Timeout {
        limit: Duration,
        outcome: ExecutionOutcome,
    },
    #[error("failed to parse detector output")]
    Parse {
        #[source]
        source: ParseError,
        raw_output: String,
    },
    #[error("internal server error")]
    Internal(String),
}

impl DetectionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DetectionError::MissingInput
            | DetectionError::InvalidParameters(_)
            | DetectionError::MalformedUpload(_) => StatusCode::BAD_REQUEST,
            DetectionError::StorageFailure(_)
            | DetectionError::Configuration(_)
            | DetectionError::SpawnFailure(_)
            | DetectionError::ExecutionFailed(_)
            | DetectionError::Timeout { .. }
            | DetectionError::Parse { .. }
            | DetectionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Coarse category, reported as `kind` in the body.
    pub fn kind(&self) -> &'static str {
        match self {
            DetectionError::MissingInput
            | DetectionError::InvalidParameters(_)
            | DetectionError::MalformedUpload(_) => "input_error",
            DetectionError::StorageFailure(_) | DetectionError::Internal(_) => "internal_error",
            DetectionError::Configuration(_) => "configuration_error",
            DetectionError::SpawnFailure(_) | DetectionError::ExecutionFailed(_) => {
                "execution_error"
            }
            DetectionError::Timeout { .. } => "timeout_error",
            DetectionError::Parse { .. } => "parse_error",
        }
    }

    /// JSON body: always `error` and `details`, plus diagnostics specific to
    /// the failure.
    pub fn body(&self) -> Value {
        let error = self.to_string();
        let kind = self.kind();
        match self {
            DetectionError::MissingInput => json!({
                "error": error,
                "kind": kind,
                "details": "request must be multipart/form-data with a \"point_cloud\" file",
            }),
            DetectionError::InvalidParameters(err) => json!({
                "error": error,
                "kind": kind,
                "details": err.to_string(),
            }),
            DetectionError::MalformedUpload(details) | DetectionError::Internal(details) => json!({
                "error": error,
                "kind": kind,
                "details": details,
            }),
            DetectionError::StorageFailure(err) | DetectionError::SpawnFailure(err) => json!({
                "error": error,
                "kind": kind,
                "details": err.to_string(),
            }),
            DetectionError::Configuration(err) => json!({
                "error": error,
                "kind": kind,
                "details": err.to_string(),
                "path": err.path().display().to_string(),
            }),
            DetectionError::ExecutionFailed(outcome) => json!({
                "error": error,
                "kind": kind,
                "details": outcome.stderr,
                "exit_code": outcome.exit_code,
                "stdout": excerpt(&outcome.stdout),
            }),
            DetectionError::Timeout { limit, outcome } => json!({
                "error": error,
                "kind": kind,
                "details": format!(
                    "detector killed after {:.3}s (limit {:.3}s)",
                    outcome.elapsed.as_secs_f64(),
                    limit.as_secs_f64()
                ),
                "elapsed_secs": outcome.elapsed.as_secs_f64(),
                "stdout": excerpt(&outcome.stdout),
                "stderr": excerpt(&outcome.stderr),
            }),
            DetectionError::Parse { source, raw_output } => json!({
                "error": error,
                "kind": kind,
                "details": source.to_string(),
                "raw_output": excerpt(raw_output),
            }),
        }
    }
}

impl IntoResponse for DetectionError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.body())).into_response()
    }
}

/// Cuts `raw` to at most [`MAX_EXCERPT_BYTES`] on a char boundary.
pub fn excerpt(raw: &str) -> String {
    if raw.len() <= MAX_EXCERPT_BYTES {
        return raw.to_owned();
    }
    let mut end = MAX_EXCERPT_BYTES;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated]", &raw[..end])
}
