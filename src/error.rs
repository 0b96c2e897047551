//! Error types for the IRA controller

use thiserror::Error;

/// Main error type for IRA operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The ownership chain above a pod did not terminate within the depth limit
    #[error("owner chain too deep: gave up at {owner} after {depth} lookups")]
    OwnerChainTooDeep {
        /// Name of the last owner that still had a controlling parent
        owner: String,
        /// Number of lookups performed before giving up
        depth: usize,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid process configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable
    ///
    /// Kubernetes 4xx responses other than conflicts and throttling will not
    /// fix themselves on the next attempt, nor will configuration problems,
    /// bad payloads or runaway owner chains.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(ae)) => {
                matches!(ae.code, 409 | 429) || !(400..500).contains(&ae.code)
            }
            Error::Kube(_) => true,
            Error::OwnerChainTooDeep { .. } => false,
            Error::Serialization(_) => false,
            Error::Config(_) => false,
            Error::Internal(_) => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Returns true if the error is an API 409 (stale write or already exists)
pub(crate) fn is_conflict(err: &Error) -> bool {
    matches!(err, Error::Kube(kube::Error::Api(ae)) if ae.code == 409)
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} ({code})"),
        reason: reason.to_string(),
        code,
    })
}
