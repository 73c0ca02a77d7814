//! HTTP route handlers for storefront.
//!
//! # Route Structure
//!
//! ```text
//! GET    /health                      - Liveness
//! GET    /health/ready                - Readiness (database reachable)
//!
//! # Cart
//! GET    /api/cart                    - Cart with items and totals
//! DELETE /api/cart                    - Clear the cart
//! POST   /api/cart/items              - Add a variant
//! PATCH  /api/cart/items/{item_id}    - Change quantity
//! DELETE /api/cart/items/{item_id}    - Remove a line
//! POST   /api/cart/checkout           - Open a hosted checkout session
//!
//! # Payment
//! POST   /api/payment/webhook         - Provider webhook
//! GET    /api/payment/status          - Session status (?session_id=)
//! GET    /checkout/success            - Provider return page
//! GET    /checkout/cancel             - Provider cancel page
//!
//! # Orders (requires sign-in)
//! GET    /api/orders                  - Order history
//! GET    /api/orders/{id}             - Order detail
//! GET    /api/orders/number/{number}  - Order detail by order number
//! POST   /api/orders/{id}/cancel      - Cancel
//! POST   /api/orders/{id}/refunds     - Request a refund
//! ```

pub mod cart;
pub mod orders;
pub mod payment;

use axum::{
    Router,
    routing::{get, patch, post},
};

use crate::state::AppState;

/// Create the cart routes router.
pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(cart::show).delete(cart::clear))
        .route("/items", post(cart::add))
        .route("/items/{item_id}", patch(cart::update).delete(cart::remove))
        .route("/checkout", post(cart::checkout))
}

/// Create the payment routes router.
pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/webhook", post(payment::webhook))
        .route("/status", get(payment::status))
}

/// Create the order routes router.
pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(orders::list))
        .route("/{id}", get(orders::show))
        .route("/number/{order_number}", get(orders::show_by_number))
        .route("/{id}/cancel", post(orders::cancel))
        .route("/{id}/refunds", post(orders::request_refund))
}

/// Create all routes for the storefront.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/api/cart", cart_routes())
        .nest("/api/payment", payment_routes())
        .nest("/api/orders", order_routes())
        .route("/checkout/success", get(payment::success))
        .route("/checkout/cancel", get(payment::cancel))
}
