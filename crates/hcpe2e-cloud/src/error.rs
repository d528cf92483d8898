use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Error codes ARM uses for resources that are already gone.
const NOT_FOUND_CODES: &[&str] = &["ResourceGroupNotFound", "ResourceNotFound", "NotFound"];

#[derive(Debug, Error)]
pub enum CloudError {
    /// The local wait gave up. The remote operation keeps running.
    #[error(
        "timed out after {}s waiting for {operation} (last status: {})",
        .waited.as_secs(),
        .last_status.as_deref().unwrap_or("none observed")
    )]
    Timeout {
        operation:   String,
        waited:      Duration,
        last_status: Option<String>,
    },

    /// The cloud reported a terminal failure for a long-running operation.
    #[error("{operation} finished with status {status}: {message}")]
    OperationFailed {
        operation: String,
        status:    String,
        message:   String,
    },

    #[error("{method} {url}: status {status}: {code}: {message}{}", correlation_suffix(.correlation_id))]
    Api {
        method:         String,
        url:            String,
        status:         u16,
        code:           String,
        message:        String,
        correlation_id: Option<String>,
    },

    #[error("{method} {url}: {source}")]
    Transport {
        method: String,
        url:    String,
        #[source]
        source: reqwest::Error,
    },

    #[error("decoding {what}: {message}")]
    Decode { what: String, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Cleanup stopped because the cloud is not in the expected state.
    #[error("cleanup incomplete: {0}")]
    Cleanup(String),

    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<CloudError>),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source:  Box<CloudError>,
    },
}

fn correlation_suffix(id: &Option<String>) -> String {
    match id {
        Some(id) => format!(" (CorrelationID: {})", id),
        None => String::new(),
    }
}

fn join_errors(errors: &[CloudError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

impl CloudError {
    /// `Ok` when `errors` is empty, the single error, or [`CloudError::Multiple`].
    pub fn join(mut errors: Vec<CloudError>) -> Result<(), CloudError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(CloudError::Multiple(errors)),
        }
    }

    /// Build an API error from a non-success response.
    pub fn api(method: &str, url: &str, status: u16, body: &Value, correlation_id: Option<String>) -> Self {
        let (code, message) = parse_arm_error(body);
        CloudError::Api {
            method: method.to_string(),
            url: url.to_string(),
            status,
            code,
            message,
            correlation_id,
        }
    }

    pub fn decode(what: impl Into<String>, err: impl std::fmt::Display) -> Self {
        CloudError::Decode { what: what.into(), message: err.to_string() }
    }

    /// Wrap with a description of what the caller was doing.
    pub fn context(self, context: impl Into<String>) -> Self {
        CloudError::Context { context: context.into(), source: Box::new(self) }
    }

    /// The innermost error, looking through [`CloudError::Context`].
    pub fn root(&self) -> &CloudError {
        match self {
            CloudError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self.root() {
            CloudError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self.root() {
            CloudError::Api { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self.root() {
            CloudError::Api { correlation_id, .. } => correlation_id.as_deref(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            CloudError::NotFound(_) => true,
            CloudError::Api { status, code, .. } => {
                *status == 404 || NOT_FOUND_CODES.contains(&code.as_str())
            }
            _ => false,
        }
    }

    pub fn is_forbidden(&self) -> bool {
        self.status() == Some(403)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), CloudError::Timeout { .. })
    }

    /// Errors a cleanup path may ignore: the resource is already gone.
    pub fn is_ignorable_cleanup(&self) -> bool {
        self.is_not_found()
    }
}

/// Extract `(code, message)` from an ARM error body.
///
/// Accepts `{"error": {..}}`, `{"Error": {..}}` and bare `{code, message}`
/// objects. Messages of nested `details[]` entries are appended so the
/// cloud's own wording survives. Non-JSON bodies become the message.
pub fn parse_arm_error(body: &Value) -> (String, String) {
    if let Value::String(text) = body {
        return ("Unknown".into(), text.trim().to_string());
    }
    let err = body
        .get("error")
        .or_else(|| body.get("Error"))
        .unwrap_or(body);
    let code = err["code"].as_str().unwrap_or("Unknown").to_string();
    let mut message = err["message"].as_str().unwrap_or("unknown error").to_string();
    let mut details = Vec::new();
    collect_details(err, &mut details);
    if !details.is_empty() {
        message = format!("{}; details: {}", message, details.join("; "));
    }
    (code, message)
}

fn collect_details(err: &Value, out: &mut Vec<String>) {
    let Some(details) = err.get("details").and_then(Value::as_array) else {
        return;
    };
    for d in details {
        let code = d["code"].as_str().unwrap_or("Unknown");
        let message = d["message"].as_str().unwrap_or("");
        out.push(format!("{}: {}", code, message));
        collect_details(d, out);
    }
}

/// `code: message` rendering of an ARM error body.
pub fn describe_arm_error(body: &Value) -> String {
    let (code, message) = parse_arm_error(body);
    format!("{}: {}", code, message)
}
