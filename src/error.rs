//! Error taxonomy for jobs and submissions.
//!
//! [`ProcessingError`] covers everything that can go wrong while a job
//! executes. It is `Clone` because the result cache hands one failure to
//! every caller waiting on the same fingerprint. Failures are attached to the
//! job as a [`JobError`] (stable `code` + human-readable `message`) and never
//! escape a worker thread.
//!
//! `SizeConstraintUnmet` is deliberately absent: it is a
//! [`Warning`](crate::types::Warning) on a successful result.

use crate::types::ImageFormat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unsupported conversion: {from} -> {to}")]
    UnsupportedConversion { from: ImageFormat, to: ImageFormat },
    #[error("encoding failed: {0}")]
    EncodingFailure(String),
    #[error("upscale service unavailable: {0}")]
    UpscaleServiceUnavailable(String),
    #[error("source blob not found: {0}")]
    SourceNotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProcessingError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::EncodingFailure(msg.into())
    }

    /// Stable snake_case identifier reported through the status API.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::UnsupportedConversion { .. } => "unsupported_conversion",
            Self::EncodingFailure(_) => "encoding_failure",
            Self::UpscaleServiceUnavailable(_) => "upscale_service_unavailable",
            Self::SourceNotFound(_) => "source_not_found",
            Self::Storage(_) => "storage",
            Self::Internal(_) => "internal",
        }
    }

    /// Only upscaler outages are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::UpscaleServiceUnavailable(_))
    }
}

/// Structured error stored on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
}

impl From<&ProcessingError> for JobError {
    fn from(err: &ProcessingError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Rejections that happen synchronously at submission time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("queue is full ({depth} jobs waiting)")]
    Overloaded { depth: usize },
    #[error("engine is shutting down")]
    ShutDown,
}

impl From<ProcessingError> for SubmitError {
    fn from(err: ProcessingError) -> Self {
        match err {
            ProcessingError::InvalidInput(msg) => Self::InvalidInput(msg),
            other => Self::InvalidInput(other.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelError {
    #[error("unknown job")]
    UnknownJob,
    #[error("job already reached a terminal state")]
    AlreadyTerminal,
}
