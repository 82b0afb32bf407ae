//! Provider error types
//!
//! Error definitions with transient/permanent classification for retry logic.

use thiserror::Error;

use crate::types::LeafKind;

/// Error that can occur during provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    // Connection errors (usually transient)
    /// Failed to establish connection to the provider endpoint.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Provider call timed out.
    #[error("provider call timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// Provider is temporarily unavailable.
    #[error("provider unavailable: {message}")]
    Unavailable { message: String },

    /// Provider rejected the call due to rate limiting.
    #[error("throttled by provider: {message}")]
    Throttled { message: String },

    /// Network error during communication.
    #[error("network error: {message}")]
    NetworkError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // Authentication errors (permanent)
    /// Credentials were rejected by the provider.
    #[error("authentication failed: invalid credentials")]
    AuthenticationFailed,

    /// Insufficient permissions for the operation.
    #[error("authorization failed: insufficient permissions for {operation}")]
    AuthorizationFailed { operation: String },

    // Resource errors
    /// Resource already exists under that identifier or name.
    #[error("resource already exists: {identifier}")]
    AlreadyExists { identifier: String },

    /// Resource not found (read/update/delete target missing).
    #[error("resource not found: {identifier}")]
    NotFound { identifier: String },

    /// Another resource still depends on the one being deleted.
    #[error("dependency violation: {message}")]
    DependencyViolation { message: String },

    /// Payload kind does not match the client's leaf kind, or a required
    /// field is missing or out of range.
    #[error("invalid payload for {kind}: {message}")]
    InvalidPayload { kind: LeafKind, message: String },

    /// Circuit breaker is open for this leaf kind.
    #[error("circuit breaker open for {kind}")]
    CircuitOpen { kind: LeafKind },

    /// Operation failed on the provider side.
    #[error("operation failed: {message}")]
    OperationFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ProviderError {
    /// Check if this error is transient and the operation should be retried.
    ///
    /// Transient errors are those caused by temporary conditions that may
    /// resolve themselves, such as network issues or rate limiting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::ConnectionFailed { .. }
                | ProviderError::Timeout { .. }
                | ProviderError::Unavailable { .. }
                | ProviderError::Throttled { .. }
                | ProviderError::NetworkError { .. }
                | ProviderError::CircuitOpen { .. }
        )
    }

    /// Check if this error is permanent and retry won't help.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Get an error code for classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            ProviderError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            ProviderError::Timeout { .. } => "TIMEOUT",
            ProviderError::Unavailable { .. } => "UNAVAILABLE",
            ProviderError::Throttled { .. } => "THROTTLED",
            ProviderError::NetworkError { .. } => "NETWORK_ERROR",
            ProviderError::AuthenticationFailed => "AUTH_FAILED",
            ProviderError::AuthorizationFailed { .. } => "AUTHORIZATION_FAILED",
            ProviderError::AlreadyExists { .. } => "ALREADY_EXISTS",
            ProviderError::NotFound { .. } => "NOT_FOUND",
            ProviderError::DependencyViolation { .. } => "DEPENDENCY_VIOLATION",
            ProviderError::InvalidPayload { .. } => "INVALID_PAYLOAD",
            ProviderError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            ProviderError::OperationFailed { .. } => "OPERATION_FAILED",
            ProviderError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    // Convenience constructors

    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        ProviderError::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a not found error.
    pub fn not_found(identifier: impl Into<String>) -> Self {
        ProviderError::NotFound {
            identifier: identifier.into(),
        }
    }

    /// Create an already exists error.
    pub fn already_exists(identifier: impl Into<String>) -> Self {
        ProviderError::AlreadyExists {
            identifier: identifier.into(),
        }
    }

    /// Create an invalid payload error.
    pub fn invalid_payload(kind: LeafKind, message: impl Into<String>) -> Self {
        ProviderError::InvalidPayload {
            kind,
            message: message.into(),
        }
    }

    /// Create an operation failed error.
    pub fn operation_failed(message: impl Into<String>) -> Self {
        ProviderError::OperationFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create an operation failed error with source.
    pub fn operation_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ProviderError::OperationFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        ProviderError::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        ProviderError::NetworkError {
            message: message.into(),
            source: None,
        }
    }
}

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;
