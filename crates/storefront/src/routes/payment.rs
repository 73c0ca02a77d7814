//! Payment provider callbacks and checkout return pages.

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info, instrument, warn};

use crate::error::{AppError, Result};
use crate::payments::webhook::SIGNATURE_HEADER;
use crate::payments::{PaymentError, WebhookEvent};
use crate::services::PaymentStatusView;
use crate::state::AppState;

/// Query string carrying a checkout session ID.
#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: String,
}

/// Query string on the provider's return redirects.
#[derive(Debug, Deserialize)]
pub struct ReturnQuery {
    pub session_id: Option<String>,
}

/// Receive a provider webhook.
///
/// Only authentication and decoding failures are reported back (400). Once
/// the delivery is verified, processing failures are logged and acknowledged
/// with 200 so the provider does not retry a delivery that cannot succeed.
#[instrument(skip_all)]
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| PaymentError::InvalidSignature("missing signature header".to_string()))?;

    if let Err(e) = state.verifier().verify(&body, signature) {
        warn!(error = %e, "Rejected webhook delivery");
        return Err(e.into());
    }
    let event = WebhookEvent::parse(&body)?;

    match state.reconciler().handle(&event).await {
        Ok(outcome) => {
            info!(event_id = %event.id, kind = %event.kind, ?outcome, "Webhook processed");
        }
        Err(e) => {
            let event_id = sentry::capture_error(&e);
            error!(
                error = %e,
                event_id = %event.id,
                kind = %event.kind,
                sentry_event_id = %event_id,
                "Webhook processing failed"
            );
        }
    }

    Ok((StatusCode::OK, Json(json!({ "received": true }))))
}

/// Report a checkout session's provider and ledger state.
pub async fn status(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<PaymentStatusView>> {
    if query.session_id.is_empty() {
        return Err(AppError::BadRequest("session_id is required".to_string()));
    }
    let view = state.checkout().payment_status(&query.session_id).await?;
    Ok(Json(view))
}

/// Landing page after a successful payment. Informational only.
pub async fn success(Query(query): Query<ReturnQuery>) -> Json<Value> {
    Json(json!({
        "message": "Thank you! Your payment is being confirmed.",
        "session_id": query.session_id,
    }))
}

/// Landing page after an abandoned payment. Informational only.
pub async fn cancel() -> Json<Value> {
    Json(json!({
        "message": "Checkout was cancelled. Your cart has been kept.",
    }))
}
