//! Error types for the PD operator and the bootstrap discovery service

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// The owning resource (or a requested object) does not exist
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// Optimistic-concurrency version check failed on a write
    #[error("version conflict: {0}")]
    Conflict(String),

    /// Registry writes kept colliding until the retry budget ran out
    #[error("gave up on {cluster} after {attempts} conflicting registry writes")]
    ConflictExhausted { cluster: String, attempts: u32 },

    /// Input that can never succeed, e.g. an undecodable peer URL
    #[error("malformed input: {0}")]
    Malformed(String),

    /// A remote dependency could not be reached or is not ready yet
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Requested change is not supported for this member type
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Expected transient state, retry shortly
    #[error("requeue: {0}")]
    Requeue(String),

    /// HTTP request to the PD admin API failed
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the controller should retry on its short backoff
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 409 || resp.code >= 500,
            Error::KubeError(_)
            | Error::Conflict(_)
            | Error::ConflictExhausted { .. }
            | Error::Unavailable(_)
            | Error::Requeue(_)
            | Error::HttpError(_) => true,
            Error::NotFound { .. }
            | Error::Malformed(_)
            | Error::Unsupported(_)
            | Error::SerializationError(_)
            | Error::ConfigError(_)
            | Error::ValidationError(_) => false,
        }
    }

    pub fn is_requeue(&self) -> bool {
        matches!(self, Error::Requeue(_))
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::NotFound { .. } => "not_found",
            Error::Conflict(_) => "conflict",
            Error::ConflictExhausted { .. } => "conflict_exhausted",
            Error::Malformed(_) => "malformed",
            Error::Unavailable(_) => "unavailable",
            Error::Unsupported(_) => "unsupported",
            Error::Requeue(_) => "requeue",
            Error::HttpError(_) => "http",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
        }
    }

    pub(crate) fn not_found(kind: &str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            name: name.into(),
        }
    }
}

/// True when a kube error is an API 409 (resourceVersion precondition failed)
pub(crate) fn is_kube_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}
