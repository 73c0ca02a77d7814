//! Service-level error type.

use thiserror::Error;

use proshop_core::CommerceError;

use crate::db::RepositoryError;
use crate::payments::PaymentError;

/// Errors returned by the checkout pipeline services.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A domain rule rejected the request.
    #[error(transparent)]
    Commerce(#[from] CommerceError),

    /// Persistence failed.
    #[error("repository error: {0}")]
    Repository(RepositoryError),

    /// The payment provider failed or rejected the request.
    #[error("payment provider error: {0}")]
    Payment(#[from] PaymentError),

    /// Checkout metadata could not be encoded.
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl From<RepositoryError> for ServiceError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Rule(rule) => Self::Commerce(rule),
            RepositoryError::NotFound => Self::Commerce(CommerceError::NotFound("record")),
            other => Self::Repository(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_errors_surface_as_commerce_errors() {
        let err = ServiceError::from(RepositoryError::Rule(CommerceError::EmptyCart));
        assert!(matches!(err, ServiceError::Commerce(CommerceError::EmptyCart)));

        let err = ServiceError::from(RepositoryError::Conflict("dup".to_string()));
        assert!(matches!(err, ServiceError::Repository(_)));
    }
}
