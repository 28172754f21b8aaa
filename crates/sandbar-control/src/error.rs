//! Error types for sandbar-control.

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur in the deployment control service.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Invalid input parameters; carries every violation found.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Tester already owns the maximum number of deployments.
    #[error("quota exceeded: {tester} already has {current} of {max} deployments")]
    QuotaExceeded {
        /// Tester email.
        tester: String,
        /// Current deployment count.
        current: u32,
        /// Configured maximum.
        max: u32,
    },

    /// No free port block left in the configured range.
    #[error("port range exhausted: no free block of width {increment} in [{start}, {end})")]
    ResourceExhausted {
        /// Start of the port range.
        start: u16,
        /// End of the port range (exclusive).
        end: u16,
        /// Requested block width.
        increment: u16,
    },

    /// An external tool failed with a transient-looking error and retries
    /// were exhausted.
    #[error("transient infrastructure error: {0}")]
    Transient(String),

    /// A bring-up or update phase failed; the deployment moves to error.
    #[error("phase {phase} failed: {message}")]
    Phase {
        /// Name of the failed phase.
        phase: &'static str,
        /// Failure diagnostic.
        message: String,
    },

    /// Deployment not found.
    #[error("deployment not found: {0}")]
    NotFound(String),

    /// Operation not permitted in the deployment's current status.
    #[error("invalid status: {operation} requires {required}, deployment is {actual}")]
    InvalidStatus {
        /// Attempted operation.
        operation: &'static str,
        /// Status the operation requires.
        required: &'static str,
        /// Actual current status.
        actual: &'static str,
    },

    /// Source-control failure (clone, fetch, checkout, listing).
    #[error("git error: {0}")]
    Git(String),

    /// Container runtime or compose failure.
    #[error("container runtime error: {0}")]
    Container(String),

    /// Reverse-proxy configuration failure.
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a phase failure.
    #[must_use]
    pub fn phase(phase: &'static str, message: impl Into<String>) -> Self {
        Self::Phase {
            phase,
            message: message.into(),
        }
    }

    /// Create a git error.
    #[must_use]
    pub fn git(msg: impl Into<String>) -> Self {
        Self::Git(msg.into())
    }

    /// Create a container runtime error.
    #[must_use]
    pub fn container(msg: impl Into<String>) -> Self {
        Self::Container(msg.into())
    }

    /// Create a proxy error.
    #[must_use]
    pub fn proxy(msg: impl Into<String>) -> Self {
        Self::Proxy(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for ControlError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_joins_all_violations() {
        let err = ControlError::Validation(vec![
            "invalid name".to_owned(),
            "invalid email".to_owned(),
        ]);
        assert_eq!(err.to_string(), "validation failed: invalid name; invalid email");
    }

    #[test]
    fn exhaustion_message_names_the_range() {
        let err = ControlError::ResourceExhausted {
            start: 18000,
            end: 19000,
            increment: 100,
        };
        assert!(err.to_string().contains("[18000, 19000)"));
    }
}
