use std::time::Duration;

use hcpe2e_cloud::CloudError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("config error: {0}")]
    Config(#[from] hcpe2e_config::ConfigError),

    #[error("domain error: {0}")]
    Domain(#[from] hcpe2e_domain::DomainError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("yaml encoding error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A run or test precondition does not hold; nothing was executed.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("unknown test '{0}'")]
    UnknownTest(String),

    #[error("unknown suite '{0}'")]
    UnknownSuite(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HarnessError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        HarnessError::Io { path: path.as_ref().display().to_string(), source }
    }
}

/// Outcome of a failed cluster check.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The check could not be performed, or the cluster answered with an error.
    #[error("{check}: {source}")]
    Request {
        check:  String,
        #[source]
        source: CloudError,
    },

    /// The cluster answered, but not with what the check expects.
    #[error("{check}: {message}")]
    Mismatch { check: String, message: String },

    /// A negative check failed for a reason other than an authorization denial.
    #[error("{check}: wrong error kind, expected an authorization denial: {source}")]
    WrongErrorKind {
        check:  String,
        #[source]
        source: CloudError,
    },

    /// A negative check was allowed.
    #[error("{check}: expected an authorization denial but the request was allowed")]
    UnexpectedSuccess { check: String },

    #[error("{check} did not pass within {}s; last error: {last}", .waited.as_secs())]
    Eventually {
        check:  String,
        waited: Duration,
        last:   Box<VerifyError>,
    },

    #[error("{} verification(s) failed:\n{}", .0.len(), render_list(.0))]
    Aggregate(Vec<VerifyError>),
}

fn render_list(errors: &[VerifyError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

impl VerifyError {
    pub fn mismatch(check: impl Into<String>, message: impl Into<String>) -> Self {
        VerifyError::Mismatch { check: check.into(), message: message.into() }
    }

    pub fn request(check: impl Into<String>, source: CloudError) -> Self {
        VerifyError::Request { check: check.into(), source }
    }

    /// Number of individual failures, counting through aggregates.
    pub fn failure_count(&self) -> usize {
        match self {
            VerifyError::Aggregate(errors) => errors.iter().map(VerifyError::failure_count).sum(),
            _ => 1,
        }
    }
}
