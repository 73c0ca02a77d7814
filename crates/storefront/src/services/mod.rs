//! Business logic services for the checkout pipeline.
//!
//! # Services
//!
//! - [`CartService`] - Cart lines, totals and sign-in merge
//! - [`CheckoutService`] - Hosted checkout sessions and status queries
//! - [`Reconciler`] - Applies provider webhook events to the ledger
//! - [`OrderService`] - Order queries, cancellation and refunds
//!
//! Services hold their stores as trait objects and are cheap to clone.

pub mod cart;
pub mod checkout;
pub mod error;
pub mod hooks;
pub mod orders;
pub mod reconciliation;

pub use cart::CartService;
pub use checkout::{CheckoutService, CheckoutSession, PaymentStatusView};
pub use error::ServiceError;
pub use hooks::{LedgerEvent, LedgerObserver, Observers, TracingObserver};
pub use orders::{OrderDetail, OrderService};
pub use reconciliation::{Reconciled, Reconciler};
