//! Export error taxonomy

use thiserror::Error;

/// Result type for export operations
pub type ExportResult<T> = Result<T, ExportError>;

/// Export pipeline errors
#[derive(Debug, Error)]
pub enum ExportError {
    /// A row failed validation; the field feeds the stable error code
    /// `EXPORT_VALIDATION_ERROR:<field>`
    #[error("EXPORT_VALIDATION_ERROR:{field}")]
    Validation { field: String },

    /// The data source returned no rows
    #[error("EXPORT_EMPTY")]
    Empty,

    /// Filesystem or connection failure during query/write/finalize
    #[error("EXPORT_IO_ERROR: {0}")]
    Io(String),

    /// Requested profile is not known to this service
    #[error("EXPORT_PROFILE_UNKNOWN")]
    ProfileUnknown,

    /// Transient failures kept failing past the retry limit
    #[error("RETRY_EXHAUSTED: {op}")]
    RetryExhausted { op: String, last_error: String },
}

impl ExportError {
    pub fn validation(field: impl Into<String>) -> Self {
        ExportError::Validation {
            field: field.into(),
        }
    }

    /// Stable machine code for the HTTP envelope
    pub fn code(&self) -> String {
        match self {
            ExportError::Validation { field } => format!("EXPORT_VALIDATION_ERROR:{field}"),
            ExportError::Empty => "EXPORT_EMPTY".to_string(),
            ExportError::Io(_) => "EXPORT_IO_ERROR".to_string(),
            ExportError::ProfileUnknown => "EXPORT_PROFILE_UNKNOWN".to_string(),
            ExportError::RetryExhausted { .. } => "RETRY_EXHAUSTED".to_string(),
        }
    }
}

impl From<std::io::Error> for ExportError {
    fn from(err: std::io::Error) -> Self {
        ExportError::Io(err.to_string())
    }
}

/// Transient errors are retried; everything else is terminal
pub fn is_transient_error(err: &ExportError) -> bool {
    matches!(err, ExportError::Io(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_code_carries_field() {
        assert_eq!(
            ExportError::validation("mobile").code(),
            "EXPORT_VALIDATION_ERROR:mobile"
        );
    }

    #[test]
    fn only_io_is_transient() {
        assert!(is_transient_error(&ExportError::Io("net down".into())));
        assert!(!is_transient_error(&ExportError::Empty));
        assert!(!is_transient_error(&ExportError::validation("gender")));
    }
}
