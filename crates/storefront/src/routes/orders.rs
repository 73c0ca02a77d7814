//! Order route handlers. All require a signed-in user.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use rust_decimal::Decimal;
use serde::Deserialize;

use proshop_core::OrderId;
use proshop_core::ledger::{Order, Refund};

use crate::error::Result;
use crate::middleware::RequireUser;
use crate::services::OrderDetail;
use crate::state::AppState;

/// Refund request body.
#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub amount: Decimal,
    #[serde(default)]
    pub reason: String,
}

/// The user's orders, newest first.
pub async fn list(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
) -> Result<Json<Vec<Order>>> {
    Ok(Json(state.orders().list_orders(user.id).await?))
}

/// One order with items, payment and refunds.
pub async fn show(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Path(id): Path<OrderId>,
) -> Result<Json<OrderDetail>> {
    Ok(Json(state.orders().get_order(id, Some(user.id)).await?))
}

/// One order, addressed by its order number.
pub async fn show_by_number(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Path(order_number): Path<String>,
) -> Result<Json<OrderDetail>> {
    Ok(Json(
        state
            .orders()
            .get_order_by_number(&order_number, Some(user.id))
            .await?,
    ))
}

/// Cancel a pending or confirmed order.
pub async fn cancel(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Path(id): Path<OrderId>,
) -> Result<Json<Order>> {
    Ok(Json(state.orders().cancel(id, Some(user.id)).await?))
}

/// Ask for a refund.
pub async fn request_refund(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Path(id): Path<OrderId>,
    Json(body): Json<RefundRequest>,
) -> Result<(StatusCode, Json<Refund>)> {
    let refund = state
        .orders()
        .request_refund(id, Some(user.id), body.amount, &body.reason)
        .await?;
    Ok((StatusCode::CREATED, Json(refund)))
}
