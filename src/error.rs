//! Crate-wide error type.
//!
//! Every fallible operation in the evaluation core returns `AppError`. The
//! `kind` decides the process exit code; the message is what ends up on
//! stderr. Per-entity model failures are not errors at this level, see
//! `crate::cv::EntityFailure`.

use thiserror::Error;

/// Error kinds surfaced by the evaluation core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DatasetNotRegistered,
    ModelNotRegistered,
    PanelUnreadable,
    PanelSchemaMismatch,
    InsufficientHistory,
    EmptyAfterFiltering,
    ModelFitFailure,
    ForecastFailure,
    HpoTrialFailure,
    MetricUndefined,
    ResultWriteFailure,
    /// Invalid environment or catalog document.
    Config,
    /// Invalid combination of command-line arguments.
    Usage,
    Io,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::DatasetNotRegistered => "DatasetNotRegistered",
            ErrorKind::ModelNotRegistered => "ModelNotRegistered",
            ErrorKind::PanelUnreadable => "PanelUnreadable",
            ErrorKind::PanelSchemaMismatch => "PanelSchemaMismatch",
            ErrorKind::InsufficientHistory => "InsufficientHistory",
            ErrorKind::EmptyAfterFiltering => "EmptyAfterFiltering",
            ErrorKind::ModelFitFailure => "ModelFitFailure",
            ErrorKind::ForecastFailure => "ForecastFailure",
            ErrorKind::HpoTrialFailure => "HPOTrialFailure",
            ErrorKind::MetricUndefined => "MetricUndefined",
            ErrorKind::ResultWriteFailure => "ResultWriteFailure",
            ErrorKind::Config => "Config",
            ErrorKind::Usage => "Usage",
            ErrorKind::Io => "Io",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Error)]
#[error("{kind}: {message}")]
pub struct AppError {
    kind: ErrorKind,
    message: String,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Exit code reported by the `forecast` binary.
    ///
    /// `0` is reserved for success and skips, `2` for usage errors.
    pub fn exit_code(&self) -> u8 {
        match self.kind {
            ErrorKind::Usage => 2,
            _ => 1,
        }
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_exit_with_two() {
        let err = AppError::new(ErrorKind::Usage, "bad flags");
        assert_eq!(err.exit_code(), 2);
        let err = AppError::new(ErrorKind::EmptyAfterFiltering, "nothing left");
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn display_prefixes_kind() {
        let err = AppError::new(ErrorKind::DatasetNotRegistered, "ftsfr_missing");
        assert_eq!(err.to_string(), "DatasetNotRegistered: ftsfr_missing");
    }
}
