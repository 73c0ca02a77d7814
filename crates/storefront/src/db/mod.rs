//! Persistence for the checkout pipeline.
//!
//! # Database: `proshop`
//!
//! ## Tables (schema `storefront`)
//!
//! - `product`, `variant` - Catalog rows (read-only here apart from stock)
//! - `cart`, `cart_item` - Carts keyed by user or anonymous session token
//! - `order`, `order_item` - Orders materialized from paid checkout sessions
//! - `payment`, `payment_log` - One payment per order plus its audit trail
//! - `refund` - Refund requests and their processing state
//! - `tower_sessions.session` - Tower-sessions storage
//!
//! Every store is defined as a trait so services can run against
//! [`PgStore`] in production and [`MemoryStore`] in tests. Multi-row
//! changes happen inside one store call so they commit or fail together.
//!
//! # Migrations
//!
//! Migrations are stored in `crates/storefront/migrations/` and run via:
//! ```bash
//! cargo run -p proshop-cli -- migrate
//! ```

pub mod memory;
pub mod postgres;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use proshop_core::cart::{Cart, CartOwner};
use proshop_core::catalog::{StockDecrement, Variant};
use proshop_core::ledger::{
    NewOrder, Order, OrderItem, PaidTransition, Payment, PaymentLog, PaymentUpsert, Refund,
};
use proshop_core::{
    CartId, CartItemId, CommerceError, OrderId, PaymentId, RefundId, UserId, VariantId,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data in the database is corrupted or invalid.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Requested entity was not found.
    #[error("not found")]
    NotFound,

    /// Constraint violation (e.g., duplicate session id).
    #[error("constraint violation: {0}")]
    Conflict(String),

    /// A domain rule rejected the change inside a transaction.
    #[error(transparent)]
    Rule(#[from] CommerceError),
}

/// Create a `PostgreSQL` connection pool with sensible defaults.
///
/// # Arguments
///
/// * `database_url` - `PostgreSQL` connection string (wrapped in `SecretString`)
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(database_url: &secrecy::SecretString) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}

/// Read access to purchasable variants plus the single stock-decrement entry
/// point.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Look up a variant by ID, active or not.
    async fn get_variant(&self, id: VariantId) -> Result<Option<Variant>, RepositoryError>;

    /// Look up several variants at once. Missing IDs are simply absent.
    async fn get_variants(
        &self,
        ids: &[VariantId],
    ) -> Result<HashMap<VariantId, Variant>, RepositoryError>;

    /// Take `amount` units of stock, saturating at zero.
    async fn decrement_stock(
        &self,
        id: VariantId,
        amount: u32,
    ) -> Result<StockDecrement, RepositoryError>;

    /// Check that the backing store is reachable.
    async fn ping(&self) -> Result<(), RepositoryError>;
}

/// Cart persistence. Mutations lock the cart for the whole
/// read-check-write.
#[async_trait]
pub trait CartStore: Send + Sync {
    /// Find the owner's cart, creating it if needed.
    async fn get_or_create_cart(&self, owner: &CartOwner) -> Result<Cart, RepositoryError>;

    /// Find the owner's cart without creating one.
    async fn find_cart(&self, owner: &CartOwner) -> Result<Option<Cart>, RepositoryError>;

    /// Add units of a variant, summing with an existing line.
    async fn add_item(
        &self,
        cart_id: CartId,
        variant_id: VariantId,
        quantity: u32,
    ) -> Result<Cart, RepositoryError>;

    /// Set a line's quantity.
    async fn update_item(
        &self,
        cart_id: CartId,
        item_id: CartItemId,
        quantity: u32,
    ) -> Result<Cart, RepositoryError>;

    /// Delete a line.
    async fn remove_item(
        &self,
        cart_id: CartId,
        item_id: CartItemId,
    ) -> Result<Cart, RepositoryError>;

    /// Delete every line; returns how many were removed.
    async fn clear(&self, cart_id: CartId) -> Result<u64, RepositoryError>;

    /// Fold `source` into `target` and delete `source`.
    ///
    /// The store remembers where `source` went so later writes aimed at it
    /// can follow.
    async fn merge(&self, source: CartId, target: CartId) -> Result<Cart, RepositoryError>;

    /// Take paid-for (variant, quantity) pairs out of the cart a checkout was
    /// started from, or out of the cart it was merged into since.
    ///
    /// Returns `None` if neither cart exists anymore.
    async fn remove_purchased(
        &self,
        cart_id: CartId,
        purchased: &[(VariantId, u32)],
    ) -> Result<Option<Cart>, RepositoryError>;
}

/// Result of the checkout-completed transaction.
#[derive(Debug, Clone)]
pub struct CheckoutCompletion {
    pub order: Order,
    pub payment: Payment,
    pub transition: PaidTransition,
    /// Stock taken, empty unless the paid edge was taken.
    pub decrements: Vec<StockDecrement>,
}

/// Result of applying a failed charge.
#[derive(Debug, Clone)]
pub struct ChargeFailure {
    pub payment: Payment,
    pub order: Order,
    /// Whether the payment or order actually moved to failed.
    pub applied: bool,
}

/// Result of processing a refund.
#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub refund: Refund,
    /// Whether processed refunds now cover the whole payment.
    pub fully_refunded: bool,
}

/// Orders, payments, payment logs and refunds.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert an order with its items unless one exists for the session.
    ///
    /// Returns the order and whether this call created it.
    async fn create_order(&self, order: &NewOrder) -> Result<(Order, bool), RepositoryError>;

    async fn find_order_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<Order>, RepositoryError>;

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>, RepositoryError>;

    async fn find_order_by_number(
        &self,
        order_number: &str,
    ) -> Result<Option<Order>, RepositoryError>;

    async fn order_items(&self, id: OrderId) -> Result<Vec<OrderItem>, RepositoryError>;

    /// Orders owned by `user`, newest first.
    async fn list_orders(&self, user: UserId) -> Result<Vec<Order>, RepositoryError>;

    /// Take the paid edge, decrement stock if it was taken, upsert the
    /// payment and append a log entry, all atomically.
    async fn complete_checkout(
        &self,
        upsert: &PaymentUpsert,
        payload: &serde_json::Value,
    ) -> Result<CheckoutCompletion, RepositoryError>;

    /// Mark the payment with this intent succeeded. `None` if unknown.
    async fn apply_intent_succeeded(
        &self,
        intent_id: &str,
        charge_id: Option<String>,
        payload: &serde_json::Value,
    ) -> Result<Option<Payment>, RepositoryError>;

    /// Mark the payment with this charge failed. `None` if unknown.
    async fn apply_charge_failed(
        &self,
        charge_id: &str,
        reason: &str,
        payload: &serde_json::Value,
    ) -> Result<Option<ChargeFailure>, RepositoryError>;

    /// Cancel on behalf of `actor`.
    async fn cancel_order(
        &self,
        id: OrderId,
        actor: Option<UserId>,
    ) -> Result<Order, RepositoryError>;

    async fn payment_for_order(&self, id: OrderId) -> Result<Option<Payment>, RepositoryError>;

    async fn payment_logs(&self, id: PaymentId) -> Result<Vec<PaymentLog>, RepositoryError>;

    /// Create a refund request after checking the refundable amount.
    async fn request_refund(
        &self,
        order_id: OrderId,
        amount: Decimal,
        reason: &str,
    ) -> Result<Refund, RepositoryError>;

    async fn list_refunds(&self, order_id: OrderId) -> Result<Vec<Refund>, RepositoryError>;

    async fn approve_refund(&self, id: RefundId) -> Result<Refund, RepositoryError>;

    async fn reject_refund(&self, id: RefundId) -> Result<Refund, RepositoryError>;

    /// Mark an approved refund processed, settling the payment and order
    /// once fully refunded.
    async fn process_refund(
        &self,
        id: RefundId,
        transaction_id: &str,
    ) -> Result<RefundOutcome, RepositoryError>;
}

/// Convert a database integer into a count.
pub(crate) fn to_count(value: i32, column: &str) -> Result<u32, RepositoryError> {
    u32::try_from(value)
        .map_err(|_| RepositoryError::DataCorruption(format!("negative {column}: {value}")))
}

/// Convert a count into a database integer.
pub(crate) fn to_db_int(value: u32) -> Result<i32, RepositoryError> {
    i32::try_from(value).map_err(|_| CommerceError::InvalidQuantity.into())
}
