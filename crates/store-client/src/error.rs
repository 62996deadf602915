//! Store client errors

use thiserror::Error;

/// Errors that can occur when talking to the resource store or workload API
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write precondition failed (resource version mismatch)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Watch resource version is too old
    #[error("Resource version expired: {0}")]
    Gone(String),

    /// Store rejected the request as invalid
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// Throttling, server-side or network failure worth retrying
    #[error("Transient error: {0}")]
    Transient(String),

    /// Kubernetes client error not otherwise classified
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Object payload could not be converted to a typed Website
    #[error("Conversion error: {0}")]
    Conversion(String),
}

impl StoreError {
    /// Classifies a kube client error by its HTTP status code.
    #[must_use]
    pub fn from_kube(err: kube::Error) -> Self {
        if let kube::Error::Api(resp) = &err {
            let message = resp.message.clone();
            return match resp.code {
                404 => Self::NotFound(message),
                409 => Self::Conflict(message),
                410 => Self::Gone(message),
                400 | 422 => Self::Invalid(message),
                429 | 500..=599 => Self::Transient(message),
                _ => Self::Kube(err),
            };
        }
        Self::Kube(err)
    }

    /// Whether the operation may succeed if retried unchanged.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Conflict(_) | Self::Gone(_) | Self::Transient(_) | Self::Kube(_) => true,
            Self::NotFound(_) | Self::Invalid(_) | Self::Serialization(_) | Self::Conversion(_) => {
                false
            }
        }
    }

    /// Whether the error is a resource version conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(StoreError::Conflict("rv".into()).is_transient());
        assert!(StoreError::Transient("timeout".into()).is_transient());
        assert!(StoreError::Gone("too old".into()).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
        assert!(!StoreError::Invalid("bad image".into()).is_transient());
        assert!(StoreError::Conflict("rv".into()).is_conflict());
        assert!(!StoreError::Transient("rv".into()).is_conflict());
    }
}
