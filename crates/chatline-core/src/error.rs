use thiserror::Error;

/// Errors surfaced by the session engine.
///
/// `Parse` is recovered inside the stream decoder and only reaches callers
/// through logs; every other variant is returned to the caller, leaving the
/// engine usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Network error: {message}")]
    Network {
        message: String,
        status: Option<u16>,
    },

    #[error("Failed to parse stream line: {message}")]
    Parse { message: String, line: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub fn network(message: impl Into<String>) -> Self {
        EngineError::Network {
            message: message.into(),
            status: None,
        }
    }

    /// Error for a response that came back with a non-success status.
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        EngineError::Network {
            message: format!("{} failed with status {}", context, status),
            status: Some(status.as_u16()),
        }
    }

    /// HTTP status attached to a network error, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            EngineError::Network { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Network {
            message: e.to_string(),
            status: e.status().map(|s| s.as_u16()),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
