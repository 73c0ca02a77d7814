//! Ledger lifecycle notifications.
//!
//! Services publish a [`LedgerEvent`] after each committed state change.
//! Observers run in registration order and cannot fail the operation that
//! triggered them; email, analytics and similar side effects plug in here.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use proshop_core::ledger::{Order, Payment, Refund};

/// A committed change worth telling the outside world about.
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    /// An order was materialized from a paid checkout session.
    OrderCreated(Order),
    /// The order took the paid edge.
    OrderPaid { order: Order, payment: Payment },
    /// A charge failed for the order.
    PaymentFailed {
        order: Order,
        payment: Payment,
        reason: String,
    },
    OrderCancelled(Order),
    RefundRequested(Refund),
    /// A refund was approved, rejected or processed.
    RefundUpdated(Refund),
    /// Processed refunds now cover the whole payment.
    OrderRefunded(Order),
}

impl LedgerEvent {
    /// Short machine-readable name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::OrderCreated(_) => "order_created",
            Self::OrderPaid { .. } => "order_paid",
            Self::PaymentFailed { .. } => "payment_failed",
            Self::OrderCancelled(_) => "order_cancelled",
            Self::RefundRequested(_) => "refund_requested",
            Self::RefundUpdated(_) => "refund_updated",
            Self::OrderRefunded(_) => "order_refunded",
        }
    }
}

/// Receives ledger events.
#[async_trait]
pub trait LedgerObserver: Send + Sync {
    async fn notify(&self, event: &LedgerEvent);
}

/// Ordered list of observers.
#[derive(Clone, Default)]
pub struct Observers(Vec<Arc<dyn LedgerObserver>>);

impl Observers {
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn LedgerObserver>>) -> Self {
        Self(observers)
    }

    /// Observers with only the [`TracingObserver`] registered.
    #[must_use]
    pub fn with_tracing() -> Self {
        Self(vec![Arc::new(TracingObserver)])
    }

    /// Deliver `event` to every observer in order.
    pub async fn notify(&self, event: &LedgerEvent) {
        for observer in &self.0 {
            observer.notify(event).await;
        }
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.0.len())
            .finish()
    }
}

/// Logs every event as a structured line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

#[async_trait]
impl LedgerObserver for TracingObserver {
    async fn notify(&self, event: &LedgerEvent) {
        match event {
            LedgerEvent::OrderCreated(order)
            | LedgerEvent::OrderCancelled(order)
            | LedgerEvent::OrderRefunded(order) => {
                info!(
                    event = event.name(),
                    order_number = %order.order_number,
                    status = %order.status,
                    "ledger event"
                );
            }
            LedgerEvent::OrderPaid { order, payment } => {
                info!(
                    event = event.name(),
                    order_number = %order.order_number,
                    amount = %payment.amount,
                    currency = %payment.currency,
                    "ledger event"
                );
            }
            LedgerEvent::PaymentFailed {
                order,
                reason,
                ..
            } => {
                info!(
                    event = event.name(),
                    order_number = %order.order_number,
                    reason = %reason,
                    "ledger event"
                );
            }
            LedgerEvent::RefundRequested(refund) | LedgerEvent::RefundUpdated(refund) => {
                info!(
                    event = event.name(),
                    refund_id = %refund.id,
                    amount = %refund.amount,
                    status = %refund.status,
                    "ledger event"
                );
            }
        }
    }
}
