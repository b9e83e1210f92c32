//! Error types for registry and scanner operations

use reqwest::StatusCode;

pub type Result<T> = std::result::Result<T, RegscanError>;

#[derive(Debug, thiserror::Error)]
pub enum RegscanError {
    /// Transport-level failure (connection, DNS, TLS). Never retried by the core.
    #[error("network error: {0}")]
    Network(String),

    /// Challenge parse failure, token endpoint failure, or missing token field.
    #[error("authentication error: {0}")]
    Auth(String),

    /// The registry wants HTTP Basic credentials instead of a bearer token.
    /// Callers synthesize a Basic Authorization header from stored credentials.
    #[error("registry requires basic auth")]
    BasicAuthRequired,

    /// 404 on a fetch operation. Delete treats 404 as success and never
    /// surfaces this variant.
    #[error("not found: {0}")]
    NotFound(String),

    /// The decoded manifest declared a different schema version than requested.
    #[error("received a different schema version than expected")]
    UnexpectedSchemaVersion,

    /// Any other non-2xx response.
    #[error("unexpected status code {status}: {message}")]
    UnexpectedStatus { status: StatusCode, message: String },

    /// Layer POST, ancestry POST, or subprocess failure. Caught per image so
    /// one broken scan does not abort a catalog-wide report.
    #[error("scanner error: {0}")]
    Scanner(String),

    /// Bad vulnerability or fixable count over the configured limit.
    #[error("{0}")]
    ThresholdExceeded(String),

    /// The operation was canceled or timed out.
    #[error("operation canceled: {0}")]
    Canceled(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<reqwest::Error> for RegscanError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RegscanError::Canceled(err.to_string())
        } else {
            RegscanError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RegscanError {
    fn from(err: serde_json::Error) -> Self {
        RegscanError::Parse(err.to_string())
    }
}

impl From<std::io::Error> for RegscanError {
    fn from(err: std::io::Error) -> Self {
        RegscanError::Io(err.to_string())
    }
}

impl From<url::ParseError> for RegscanError {
    fn from(err: url::ParseError) -> Self {
        RegscanError::Validation(err.to_string())
    }
}
