use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("unknown label '{0}'")]
    UnknownLabel(String),

    #[error("invalid label filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },

    #[error("unknown environment '{0}' (expected development, int, stg or prod)")]
    UnknownEnvironment(String),

    #[error("duplicate test name '{0}'")]
    DuplicateTest(String),

    #[error("invalid setup model: {0}")]
    InvalidSetup(String),
}
