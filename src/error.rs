//! Error types for the DigitalOcean provider.

use std::fmt;

use thiserror::Error;

use crate::schema::{Diagnostic, DiagnosticSeverity};

/// A non-2xx response from the DigitalOcean API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP method of the failed request.
    pub method: String,
    /// Request path (or absolute URL for off-API endpoints).
    pub path: String,
    /// HTTP status code.
    pub status: u16,
    /// The API's machine-readable error id (e.g. `not_found`).
    pub id: Option<String>,
    /// The API's human-readable message.
    pub message: String,
}

impl ApiError {
    /// Create an API error for the given request and status.
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            status,
            id: None,
            message: message.into(),
        }
    }

    /// Attach the API's error id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {} {}", self.method, self.path, self.status, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Errors that can occur while managing DigitalOcean resources.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The requested object was not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// User input violates the schema or a cross-field constraint.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An internal engine error occurred.
    #[error("SDK error: {0}")]
    Sdk(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested resource or data source type is unknown.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The API answered with a non-success status.
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// The request never produced an HTTP response (TCP/TLS/DNS).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A name is already bound (registry) or the object already exists.
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// A waiter or retry budget ran out.
    #[error("Timeout: {message}")]
    Timeout {
        /// What was being waited for.
        message: String,
        /// The last state observed before giving up.
        last_state: Option<String>,
    },

    /// The operation was cancelled by the host.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// An invariant would be violated (shrinking a share, second share on a VPC).
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Operation not implemented.
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// Invalid request from the host.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Malformed credential blob or import ID.
    #[error("Parse error: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Get the error message as a string.
    ///
    /// Returns a reference to the error message for any variant.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(msg) => msg,
            Self::Validation(msg) => msg,
            Self::Sdk(msg) => msg,
            Self::Configuration(msg) => msg,
            Self::UnknownResource(msg) => msg,
            Self::Serialization(_err) => "serialization error (see Debug output)",
            Self::Api(err) => &err.message,
            Self::Transport(msg) => msg,
            Self::AlreadyExists(msg) => msg,
            Self::Timeout { message, .. } => message,
            Self::Cancelled(msg) => msg,
            Self::FailedPrecondition(msg) => msg,
            Self::Unimplemented(msg) => msg,
            Self::InvalidRequest(msg) => msg,
            Self::Parse(msg) => msg,
        }
    }

    /// HTTP status of an API error, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api(err) => Some(err.status),
            _ => None,
        }
    }

    /// Whether the remote object is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_)) || self.status() == Some(404)
    }

    /// Whether the failure is transient: conflicts, throttling, 5xx and
    /// transport failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api(err) => matches!(err.status, 409 | 429) || err.status >= 500,
            Self::Transport(_) => true,
            _ => false,
        }
    }

    /// Whether this is the 403 DigitalOcean returns when deleting an object
    /// that still has dependents.
    pub fn is_still_contains_resources(&self) -> bool {
        match self {
            Self::Api(err) => {
                err.status == 403 && err.message.to_lowercase().contains("contains resources")
            }
            _ => false,
        }
    }

    /// Fold error-severity diagnostics into a single validation error.
    ///
    /// Returns `None` when no diagnostic has error severity.
    pub fn from_diagnostics(diagnostics: &[Diagnostic]) -> Option<Self> {
        let errors: Vec<String> = diagnostics
            .iter()
            .filter(|d| d.severity == DiagnosticSeverity::Error)
            .map(|d| match (&d.attribute, &d.detail) {
                (Some(attr), Some(detail)) => format!("{}: {} ({})", attr, d.summary, detail),
                (Some(attr), None) => format!("{}: {}", attr, d.summary),
                (None, Some(detail)) => format!("{} ({})", d.summary, detail),
                (None, None) => d.summary.clone(),
            })
            .collect();
        if errors.is_empty() {
            None
        } else {
            Some(Self::Validation(errors.join("; ")))
        }
    }

    /// Render this error as a host-facing diagnostic.
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(self.to_string())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
