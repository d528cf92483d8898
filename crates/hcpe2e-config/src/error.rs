use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("json parse error in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid setup file {path}: {message}")]
    Invalid { path: String, message: String },

    #[error("required environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("invalid value '{value}' for {var}: {message}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        message: String,
    },

    #[error("domain error: {0}")]
    Domain(#[from] hcpe2e_domain::DomainError),
}
