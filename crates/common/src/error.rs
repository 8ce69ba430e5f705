use std::time::Duration;

use thiserror::Error;

/// The seven error categories that flow through the whole pipeline:
/// collectors, the store, strategies, and the webhook dispatcher all
/// report failures in this shape rather than raising arbitrary errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    Network,
    ServerError,
    ClientError,
    Validation,
    Storage,
    Unexpected,
}

impl ErrorKind {
    /// Whether the failure kind is something a retry can plausibly fix.
    pub const fn recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::Network | ErrorKind::ServerError | ErrorKind::Storage
        )
    }

    /// Identical to `recoverable` today; kept distinct because the spec
    /// treats them as separately-named attributes of the error taxonomy.
    pub const fn retry_recommended(self) -> bool {
        self.recoverable()
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Network => "network",
            ErrorKind::ServerError => "server_error",
            ErrorKind::ClientError => "client_error",
            ErrorKind::Validation => "validation",
            ErrorKind::Storage => "storage",
            ErrorKind::Unexpected => "unexpected",
        };
        write!(f, "{s}")
    }
}

/// A categorized collector failure, surfaced verbatim to the scheduler.
#[derive(Debug, Clone)]
pub struct CollectionError {
    pub kind: ErrorKind,
    pub detail: String,
    /// Advisory wait requested by the upstream (e.g. `Retry-After` on a 429).
    pub retry_after: Option<Duration>,
}

impl CollectionError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl std::fmt::Display for CollectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.detail)
    }
}

impl std::error::Error for CollectionError {}

#[derive(Debug, Error)]
pub enum Error {
    #[error("upstream error: {0}")]
    Collection(#[from] CollectionError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
