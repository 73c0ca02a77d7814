//! Unified error handling with Sentry integration.
//!
//! Route handlers return `Result<T, AppError>`. Server-side failures are
//! captured to Sentry before responding; clients get a JSON body of the form
//! `{"error": "...", ...details}` without internal details.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use thiserror::Error;

use proshop_core::CommerceError;

use crate::db::RepositoryError;
use crate::payments::PaymentError;
use crate::services::ServiceError;

/// Application-level error type for the storefront.
#[derive(Debug, Error)]
pub enum AppError {
    /// A domain rule rejected the request.
    #[error(transparent)]
    Commerce(#[from] CommerceError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] RepositoryError),

    /// Payment provider failed or rejected the request.
    #[error("Payment provider error: {0}")]
    Payment(#[from] PaymentError),

    /// User is not authenticated.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Bad request from client.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Commerce(e) => Self::Commerce(e),
            ServiceError::Repository(e) => Self::Database(e),
            ServiceError::Payment(e) => Self::Payment(e),
            ServiceError::Metadata(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<tower_sessions::session::Error> for AppError {
    fn from(err: tower_sessions::session::Error) -> Self {
        Self::Internal(format!("session: {err}"))
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Commerce(err) => match err {
                CommerceError::NotFound(_) => StatusCode::NOT_FOUND,
                CommerceError::InsufficientStock { .. }
                | CommerceError::StockConflict(_)
                | CommerceError::InvalidState(_) => StatusCode::CONFLICT,
                CommerceError::Forbidden(_) => StatusCode::FORBIDDEN,
                CommerceError::EmptyCart
                | CommerceError::InvalidQuantity
                | CommerceError::InvalidRefundAmount { .. } => StatusCode::BAD_REQUEST,
            },
            Self::Payment(PaymentError::InvalidSignature(_) | PaymentError::InvalidPayload(_))
            | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Payment(_) => StatusCode::BAD_GATEWAY,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> Value {
        match self {
            Self::Commerce(CommerceError::InsufficientStock {
                sku,
                requested,
                available,
            }) => json!({
                "error": self.to_string(),
                "sku": sku,
                "requested": requested,
                "available": available,
            }),
            Self::Commerce(CommerceError::StockConflict(conflicts)) => json!({
                "error": self.to_string(),
                "conflicts": conflicts,
            }),
            Self::Commerce(CommerceError::InvalidRefundAmount {
                requested,
                refundable,
            }) => json!({
                "error": self.to_string(),
                "requested": requested,
                "refundable": refundable,
            }),
            Self::Commerce(_) | Self::Unauthorized(_) | Self::BadRequest(_) => {
                json!({ "error": self.to_string() })
            }
            Self::Payment(PaymentError::Api { message, .. }) => json!({
                "error": "Payment provider error",
                "message": message,
            }),
            Self::Payment(PaymentError::InvalidSignature(_) | PaymentError::InvalidPayload(_)) => {
                json!({ "error": "Invalid webhook" })
            }
            // Don't expose internal error details to clients
            Self::Payment(_) => json!({ "error": "Payment provider error" }),
            Self::Database(_) | Self::Internal(_) => json!({ "error": "Internal server error" }),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            let event_id = sentry::capture_error(&self);
            tracing::error!(
                error = %self,
                sentry_event_id = %event_id,
                "Request error"
            );
        }

        (status, Json(self.body())).into_response()
    }
}

/// Result type alias for `AppError`.
pub type Result<T> = std::result::Result<T, AppError>;

/// Set the Sentry user context from a user ID.
///
/// Call this after sign-in to associate errors with users.
pub fn set_sentry_user(user_id: &impl ToString, email: Option<&str>) {
    sentry::configure_scope(|scope| {
        scope.set_user(Some(sentry::User {
            id: Some(user_id.to_string()),
            email: email.map(String::from),
            ..Default::default()
        }));
    });
}

/// Clear the Sentry user context.
pub fn clear_sentry_user() {
    sentry::configure_scope(|scope| {
        scope.set_user(None);
    });
}

/// Add a breadcrumb for a shopper action.
///
/// Breadcrumbs appear in Sentry error reports to show the trail of actions
/// leading up to an error.
pub fn add_breadcrumb(category: &str, message: &str, data: Option<&[(&str, &str)]>) {
    let mut breadcrumb = sentry::Breadcrumb {
        category: Some(category.to_string()),
        message: Some(message.to_string()),
        level: sentry::Level::Info,
        ..Default::default()
    };

    if let Some(pairs) = data {
        for (key, value) in pairs {
            breadcrumb.data.insert(
                (*key).to_string(),
                serde_json::Value::String((*value).to_string()),
            );
        }
    }

    sentry::add_breadcrumb(breadcrumb);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use http_body_util::BodyExt;
    use proshop_core::VariantId;
    use proshop_core::checkout::StockConflict;

    use super::*;

    fn get_status(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_app_error_status_codes() {
        assert_eq!(
            get_status(CommerceError::NotFound("variant").into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            get_status(CommerceError::EmptyCart.into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            get_status(CommerceError::Forbidden("order").into()),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            get_status(CommerceError::InvalidState("shipped".to_string()).into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            get_status(AppError::Unauthorized("sign in".to_string())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            get_status(
                PaymentError::Api {
                    status: 402,
                    message: "card declined".to_string()
                }
                .into()
            ),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            get_status(AppError::Internal("test".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_service_rule_errors_keep_their_status() {
        let err: AppError = ServiceError::from(RepositoryError::Rule(CommerceError::InvalidQuantity)).into();
        assert_eq!(get_status(err), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stock_conflict_body_lists_conflicts() {
        let err = AppError::from(CommerceError::StockConflict(vec![StockConflict {
            variant_id: VariantId::new(4),
            sku: "MUG-RED".to_string(),
            requested: 5,
            available: 3,
        }]));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["conflicts"][0]["sku"], "MUG-RED");
        assert_eq!(body["conflicts"][0]["requested"], 5);
        assert_eq!(body["conflicts"][0]["available"], 3);
    }

    #[tokio::test]
    async fn test_internal_details_hidden() {
        let response = AppError::Internal("db password wrong".to_string()).into_response();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Internal server error");
    }
}
