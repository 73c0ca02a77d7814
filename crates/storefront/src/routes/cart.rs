//! Cart route handlers.
//!
//! The cart belongs to the [`Actor`]: the signed-in user, or the anonymous
//! token held in the session. Totals are recomputed on every response.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use proshop_core::cart::{Cart, LineItem};
use proshop_core::{CartId, CartItemId, VariantId};

use crate::error::{Result, add_breadcrumb};
use crate::middleware::Actor;
use crate::services::CheckoutSession;
use crate::state::AppState;

/// A cart line as returned to clients.
#[derive(Debug, Clone, Serialize)]
pub struct LineView {
    pub id: CartItemId,
    pub variant_id: VariantId,
    pub sku: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
    pub added_at: DateTime<Utc>,
}

impl From<&LineItem> for LineView {
    fn from(item: &LineItem) -> Self {
        Self {
            id: item.id,
            variant_id: item.variant_id,
            sku: item.sku.clone(),
            name: item.name.clone(),
            quantity: item.quantity,
            unit_price: item.unit_price,
            subtotal: item.subtotal(),
            added_at: item.added_at,
        }
    }
}

/// A cart with computed totals.
#[derive(Debug, Clone, Serialize)]
pub struct CartView {
    pub id: CartId,
    pub items: Vec<LineView>,
    pub total_items: u64,
    pub total_price: Decimal,
}

impl From<&Cart> for CartView {
    fn from(cart: &Cart) -> Self {
        let totals = cart.totals();
        Self {
            id: cart.id,
            items: cart.items.iter().map(LineView::from).collect(),
            total_items: totals.total_items,
            total_price: totals.total_price,
        }
    }
}

/// Add-to-cart request body.
#[derive(Debug, Deserialize)]
pub struct AddItemRequest {
    pub variant_id: VariantId,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

const fn default_quantity() -> u32 {
    1
}

/// Quantity update request body.
#[derive(Debug, Deserialize)]
pub struct UpdateItemRequest {
    pub quantity: u32,
}

/// Show the cart.
pub async fn show(State(state): State<AppState>, actor: Actor) -> Result<Json<CartView>> {
    let cart = state.carts().get_or_create_cart(&actor.owner).await?;
    Ok(Json(CartView::from(&cart)))
}

/// Remove every line.
#[instrument(skip(state, actor))]
pub async fn clear(State(state): State<AppState>, actor: Actor) -> Result<Json<CartView>> {
    let cart = state.carts().clear(&actor.owner).await?;
    Ok(Json(CartView::from(&cart)))
}

/// Add a variant to the cart.
#[instrument(skip(state, actor), fields(variant_id = %body.variant_id, quantity = body.quantity))]
pub async fn add(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<AddItemRequest>,
) -> Result<(StatusCode, Json<CartView>)> {
    let cart = state
        .carts()
        .add_item(&actor.owner, body.variant_id, body.quantity)
        .await?;

    let variant = body.variant_id.to_string();
    add_breadcrumb("cart", "Added to cart", Some(&[("variant_id", variant.as_str())]));

    Ok((StatusCode::CREATED, Json(CartView::from(&cart))))
}

/// Change a line's quantity.
#[instrument(skip(state, actor, body), fields(item_id = %item_id))]
pub async fn update(
    State(state): State<AppState>,
    actor: Actor,
    Path(item_id): Path<CartItemId>,
    Json(body): Json<UpdateItemRequest>,
) -> Result<Json<CartView>> {
    let cart = state
        .carts()
        .update_item(&actor.owner, item_id, body.quantity)
        .await?;
    Ok(Json(CartView::from(&cart)))
}

/// Remove a line.
#[instrument(skip(state, actor), fields(item_id = %item_id))]
pub async fn remove(
    State(state): State<AppState>,
    actor: Actor,
    Path(item_id): Path<CartItemId>,
) -> Result<Json<CartView>> {
    let cart = state.carts().remove_item(&actor.owner, item_id).await?;
    Ok(Json(CartView::from(&cart)))
}

/// Open a hosted checkout session for the cart.
#[instrument(skip(state, actor))]
pub async fn checkout(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<(StatusCode, Json<CheckoutSession>)> {
    let session = state
        .checkout()
        .create_checkout(&actor.owner, actor.email())
        .await?;

    add_breadcrumb(
        "checkout",
        "Checkout session created",
        Some(&[("session_id", session.session_id.as_str())]),
    );

    Ok((StatusCode::CREATED, Json(session)))
}
