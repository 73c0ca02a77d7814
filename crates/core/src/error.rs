//! Domain error taxonomy shared by the cart, checkout and ledger rules.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::checkout::StockConflict;

/// Rule violations raised by the pure domain logic.
///
/// These are user-correctable conditions, as opposed to infrastructure
/// failures; each carries enough detail for the caller to fix the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommerceError {
    /// A referenced entity does not exist (or is not visible, e.g. an
    /// inactive variant).
    #[error("{0} not found")]
    NotFound(&'static str),

    /// A single line would exceed live stock.
    #[error("insufficient stock for {sku}: requested {requested}, available {available}")]
    InsufficientStock {
        /// SKU of the variant.
        sku: String,
        /// Total quantity the cart line would hold.
        requested: u32,
        /// Live stock at the time of the check.
        available: u32,
    },

    /// One or more lines exceed live stock at checkout time.
    #[error("{} item(s) are no longer in stock", .0.len())]
    StockConflict(Vec<StockConflict>),

    /// Checkout was attempted on a cart with no lines.
    #[error("cannot checkout with an empty cart")]
    EmptyCart,

    /// The actor does not own the resource.
    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    /// The requested transition is not allowed from the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Quantities must be positive.
    #[error("quantity must be at least 1")]
    InvalidQuantity,

    /// Refund amount is non-positive or exceeds what is still refundable.
    #[error("refund amount {requested} is invalid (refundable: {refundable})")]
    InvalidRefundAmount {
        /// Amount asked for.
        requested: Decimal,
        /// Amount still refundable on the payment.
        refundable: Decimal,
    },
}
