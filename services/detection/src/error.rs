//! Request-level error taxonomy and its HTTP mapping.
//!
//! Every failure a detection request can hit is classified into one
//! [`DetectionError`] variant. The variant decides the status code and the
//! machine-readable `code` of the single error response the caller receives.

use crate::artifact_locator::LocateError;
use crate::process_runner::RunnerError;
use crate::publisher::PublishError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to the caller of the detection endpoint.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("No image file provided")]
    MissingInput,

    #[error("Malformed upload: {0}")]
    MalformedUpload(String),

    #[error("Uploaded image is too large")]
    UploadTooLarge(String),

    #[error("Failed to store uploaded image")]
    UploadStorage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Detection process failed to start")]
    ProcessStart {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Detection process exited with an error")]
    ProcessExit { code: i32, stderr: String },

    #[error("Detection process timed out after {limit:?}")]
    ProcessTimeout { limit: Duration },

    #[error("Detection output could not be read")]
    ProcessIo(#[source] io::Error),

    #[error("Result image not found")]
    ArtifactNotFound {
        searched: Vec<String>,
        detector_output: String,
    },

    #[error("Failed to publish result image")]
    Publish(#[from] PublishError),

    #[error("Detection job ended without a response")]
    JobAborted,
}

impl DetectionError {
    /// Stable machine-readable code for this error
    pub fn kind(&self) -> &'static str {
        match self {
            DetectionError::MissingInput => "MISSING_INPUT",
            DetectionError::MalformedUpload(_) => "MALFORMED_UPLOAD",
            DetectionError::UploadTooLarge(_) => "UPLOAD_TOO_LARGE",
            DetectionError::UploadStorage { .. } => "UPLOAD_STORAGE_FAILURE",
            DetectionError::ProcessStart { .. } => "PROCESS_START_FAILURE",
            DetectionError::ProcessExit { .. } => "PROCESS_EXIT_FAILURE",
            DetectionError::ProcessTimeout { .. } => "PROCESS_TIMEOUT",
            DetectionError::ProcessIo(_) => "PROCESS_IO_FAILURE",
            DetectionError::ArtifactNotFound { .. } => "ARTIFACT_NOT_FOUND",
            DetectionError::Publish(_) => "PUBLISH_FAILURE",
            DetectionError::JobAborted => "JOB_ABORTED",
        }
    }

    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            DetectionError::MissingInput | DetectionError::MalformedUpload(_) => {
                StatusCode::BAD_REQUEST
            }
            DetectionError::UploadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Human-readable diagnostic detail, when there is any
    pub fn details(&self) -> Option<String> {
        match self {
            DetectionError::MissingInput
            | DetectionError::ProcessTimeout { .. }
            | DetectionError::JobAborted => None,
            DetectionError::MalformedUpload(reason) | DetectionError::UploadTooLarge(reason) => {
                Some(reason.clone())
            }
            DetectionError::UploadStorage { path, source } => {
                Some(format!("{}: {source}", path.display()))
            }
            DetectionError::ProcessStart { program, source } => {
                Some(format!("{program}: {source}"))
            }
            DetectionError::ProcessExit { code, stderr } => {
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    Some(format!("Detector failed with exit code {code}"))
                } else {
                    Some(stderr.to_string())
                }
            }
            DetectionError::ProcessIo(source) => Some(source.to_string()),
            DetectionError::ArtifactNotFound {
                searched,
                detector_output,
            } => {
                let mut details = format!("Searched: {}", searched.join("; "));
                let output = detector_output.trim();
                if !output.is_empty() {
                    details.push_str("\nDetector output:\n");
                    details.push_str(output);
                }
                Some(details)
            }
            DetectionError::Publish(source) => Some(source.to_string()),
        }
    }

    /// Attach detector stdout to a locator failure.
    pub fn from_locate(err: LocateError, detector_output: &str) -> Self {
        match err {
            LocateError::NotFound { searched } => DetectionError::ArtifactNotFound {
                searched,
                detector_output: detector_output.to_string(),
            },
        }
    }
}

impl From<RunnerError> for DetectionError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Start { program, source } => {
                DetectionError::ProcessStart { program, source }
            }
            RunnerError::Timeout { limit } => DetectionError::ProcessTimeout { limit },
            RunnerError::Io(source) => DetectionError::ProcessIo(source),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&DetectionError> for ErrorResponse {
    fn from(err: &DetectionError) -> Self {
        Self {
            error: err.to_string(),
            code: err.kind(),
            details: err.details(),
        }
    }
}

impl IntoResponse for DetectionError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorResponse::from(&self))).into_response()
    }
}
