use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

/// Every failure a dispatch can end in.
///
/// Request-level variants are rendered to the caller as `{"error": <message>}`
/// with a client-error status. Infrastructure variants only surface when the
/// server itself cannot operate (bind failure, bad configuration).
#[derive(Error, Debug)]
pub enum ActionError {
    /// Unparsable path, missing tenant or action, unsupported method.
    #[error("{0}")]
    BadRequest(String),

    /// The selected bundle does not exist for this tenant.
    #[error("unknown design doc {0}")]
    NotATenant(String),

    /// No source for the requested action/method pair.
    #[error("unknown action {0}")]
    UnknownAction(String),

    #[error("compile error: {0}")]
    Compile(String),

    /// A library required itself, directly or transitively.
    #[error("cyclic dependency while resolving library {0}")]
    CyclicDependency(String),

    /// Uncaught failure raised by tenant code.
    #[error("{0}")]
    Runtime(String),

    /// A backing-store call failed or answered with an error status.
    #[error("store error: {0}")]
    Upstream(String),

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,

    /// The response channel was used out of order.
    #[error("{0}")]
    IllegalResponse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ActionError {
    /// HTTP status used when this error is the whole reply.
    pub fn status(&self) -> u16 {
        if self.is_request_error() {
            400
        } else {
            500
        }
    }

    /// Whether the error belongs to the per-request taxonomy.
    pub fn is_request_error(&self) -> bool {
        !matches!(
            self,
            ActionError::Config(_)
                | ActionError::Transport(_)
                | ActionError::Io(_)
                | ActionError::Json(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ActionError::Timeout(_))
    }

    /// The uniform error body, `{"error": "<message>"}`.
    pub fn to_body(&self) -> Value {
        json!({ "error": self.to_string() })
    }
}

pub type Result<T> = std::result::Result<T, ActionError>;
