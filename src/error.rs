use thiserror::Error;

/// Recoverable failures raised by the engine.
///
/// None of these are fatal: the caller reports them and keeps whatever
/// result it displayed before.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A pivot / geo-join / type spec is malformed or references a column
    /// that does not exist. Raised before any computation starts.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// The declared type cannot describe the column's content at all; the
    /// column is left as it was.
    #[error("cannot coerce column '{column}' to {target}: {reason}")]
    TypeCoercionFailure {
        column: String,
        target: String,
        reason: String,
    },

    /// Aggregation failed part-way; no partial result is produced.
    #[error("computation failed on column(s) {}: {message}", .columns.join(", "))]
    ComputationFailure {
        columns: Vec<String>,
        message: String,
    },

    /// The geographic reference table could not be obtained.
    #[error("reference table unavailable: {0}")]
    ReferenceUnavailable(String),

    /// A dataset was built with duplicate names or ragged columns.
    #[error("invalid dataset: {0}")]
    InvalidDataset(String),
}

impl EngineError {
    pub(crate) fn computation(columns: &[&str], message: impl Into<String>) -> Self {
        EngineError::ComputationFailure {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
