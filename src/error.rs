use thiserror::Error;

/// Failure classes surfaced by the measurement pipeline.
///
/// These travel inside `anyhow::Error`; callers that need to branch on the
/// class use `downcast_ref::<PwmetricsError>()`.
#[derive(Debug, Error)]
pub enum PwmetricsError {
    #[error("expectation flag set but no expectations found on config file")]
    NoExpectationsFound,

    #[error("No expectation metrics were found")]
    NoExpectationMetrics,

    #[error("Metric {metric} has to have warn and error values")]
    MissingThreshold { metric: String },

    #[error("Metric {metric} has a non-numeric {field} value '{value}'")]
    InvalidThreshold {
        metric: String,
        field: &'static str,
        value: String,
    },

    #[error("{code} error. Giving up running Lighthouse")]
    RetriesExhausted { code: String },

    #[error("{0}")]
    Adapter(String),

    #[error("Expectation with errors.")]
    ExpectationErrors,

    #[error("All runs failed; there are no results to evaluate")]
    NoSuccessfulRuns,

    #[error("Sheet type {0} is not available.")]
    UnknownSheetType(String),

    #[error("Some of options for submitting data to Google Sheets are absent")]
    MissingSheetOptions,
}

/// Error returned by a measurement tool invocation.
///
/// `code` carries the tool's own error identifier (e.g. `CRI_TIMEOUT`) when
/// one could be recovered from its output.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AuditError {
    pub code: Option<String>,
    pub message: String,
}

impl AuditError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

impl From<anyhow::Error> for AuditError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}
