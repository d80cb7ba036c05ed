//! Error types for lodestar-deploy.

use std::fmt;

/// Result type alias using [`DeployError`].
pub type DeployResult<T> = Result<T, DeployError>;

/// Errors that can occur while orchestrating a deployment.
///
/// The first group of variants are pipeline errors: they are raised inside a
/// step, recorded on that step and turned into a failed deployment. The rest
/// are infrastructure errors which may escape to the job queue for a retry.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Provider credentials or required settings are missing.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The instance manifest or package descriptor is malformed.
    #[error("validation error [{code}]: {message}")]
    Validation {
        /// Machine-readable error code.
        code: &'static str,
        /// Human-readable explanation.
        message: String,
    },

    /// An external provider API call failed during create or poll.
    #[error("provider error: {0}")]
    Provider(String),

    /// The live instance was unreachable or answered with a malformed handshake.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// The final activation transaction failed.
    #[error("publish error: {0}")]
    Publish(String),

    /// Outbound request target rejected by the egress policy.
    #[error("egress blocked: {0}")]
    EgressBlocked(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid deployment status transition attempted.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Create a configuration error.
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a validation error with an explicit code.
    #[must_use]
    pub fn validation(code: &'static str, msg: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: msg.into(),
        }
    }

    /// Create a provider error.
    #[must_use]
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a discovery error.
    #[must_use]
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create a publish error.
    #[must_use]
    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Taxonomy kind used when reporting a failure on a step.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Provider(_) | Self::Http(_) | Self::EgressBlocked(_) => ErrorKind::Provider,
            Self::Discovery(_) => ErrorKind::Discovery,
            Self::Publish(_) => ErrorKind::Publish,
            Self::Database(_)
            | Self::NotFound(_)
            | Self::InvalidStateTransition { .. }
            | Self::Serialisation(_)
            | Self::Internal(_) => ErrorKind::Infrastructure,
        }
    }

    /// Lines suitable for an error entry on a step log.
    #[must_use]
    pub fn log_lines(&self) -> Vec<String> {
        match self {
            Self::Validation { code, message } => vec![format!("{message} ({code})")],
            other => vec![other.to_string()],
        }
    }
}

/// Coarse classification of a [`DeployError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid configuration.
    Configuration,
    /// Malformed user input.
    Validation,
    /// External provider failure.
    Provider,
    /// Capability discovery failure.
    Discovery,
    /// Activation failure.
    Publish,
    /// Storage or internal failure.
    Infrastructure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "configuration",
            Self::Validation => "validation",
            Self::Provider => "provider",
            Self::Discovery => "discovery",
            Self::Publish => "publish",
            Self::Infrastructure => "infrastructure",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_carries_code() {
        let err = DeployError::validation("missing_package_json", "Missing package.json file");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(
            err.to_string(),
            "validation error [missing_package_json]: Missing package.json file"
        );
        assert_eq!(
            err.log_lines(),
            vec!["Missing package.json file (missing_package_json)".to_owned()]
        );
    }

    #[test]
    fn egress_block_counts_as_provider_failure() {
        let err = DeployError::EgressBlocked("10.0.0.1".to_owned());
        assert_eq!(err.kind(), ErrorKind::Provider);
    }
}
