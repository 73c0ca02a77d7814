//! Order queries, cancellation and refunds.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, instrument};

use proshop_core::ledger::{Order, OrderItem, Payment, Refund};
use proshop_core::{CommerceError, OrderId, RefundId, UserId};

use super::ServiceError;
use super::hooks::{LedgerEvent, Observers};
use crate::db::{LedgerStore, RefundOutcome};

/// An order with everything needed to render it.
#[derive(Debug, Clone, Serialize)]
pub struct OrderDetail {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub payment: Option<Payment>,
    pub refunds: Vec<Refund>,
}

/// Order service.
#[derive(Clone)]
pub struct OrderService {
    ledger: Arc<dyn LedgerStore>,
    observers: Observers,
}

impl OrderService {
    #[must_use]
    pub fn new(ledger: Arc<dyn LedgerStore>, observers: Observers) -> Self {
        Self { ledger, observers }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// The user's orders, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list_orders(&self, user: UserId) -> Result<Vec<Order>, ServiceError> {
        Ok(self.ledger.list_orders(user).await?)
    }

    /// One order with items, payment and refunds.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the order does not exist or `Forbidden` if
    /// `actor` does not own it.
    pub async fn get_order(
        &self,
        id: OrderId,
        actor: Option<UserId>,
    ) -> Result<OrderDetail, ServiceError> {
        let order = self.owned_order(id, actor).await?;
        self.detail(order).await
    }

    /// One order with its items, looked up by the number shown to shoppers.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no order has this number and `Forbidden` if it
    /// belongs to someone else.
    pub async fn get_order_by_number(
        &self,
        order_number: &str,
        actor: Option<UserId>,
    ) -> Result<OrderDetail, ServiceError> {
        let order = self
            .ledger
            .find_order_by_number(order_number)
            .await?
            .ok_or(CommerceError::NotFound("order"))?;
        order.ensure_owner(actor)?;
        self.detail(order).await
    }

    async fn detail(&self, order: Order) -> Result<OrderDetail, ServiceError> {
        let items = self.ledger.order_items(order.id).await?;
        let payment = self.ledger.payment_for_order(order.id).await?;
        let refunds = self.ledger.list_refunds(order.id).await?;
        Ok(OrderDetail {
            order,
            items,
            payment,
            refunds,
        })
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancel an order on behalf of its owner.
    ///
    /// Stock taken at payment is not returned.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for other actors and `InvalidState` once the order
    /// has moved past confirmed.
    #[instrument(skip(self), fields(order_id = %id))]
    pub async fn cancel(&self, id: OrderId, actor: Option<UserId>) -> Result<Order, ServiceError> {
        let order = self.ledger.cancel_order(id, actor).await?;
        info!(order_number = %order.order_number, "Order cancelled");
        self.observers
            .notify(&LedgerEvent::OrderCancelled(order.clone()))
            .await;
        Ok(order)
    }

    // =========================================================================
    // Refunds
    // =========================================================================

    /// Ask for part or all of an order's payment back.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for other actors, `InvalidState` unless the payment
    /// succeeded, and `InvalidRefundAmount` if the amount is not positive or
    /// exceeds what is still refundable.
    #[instrument(skip(self, reason), fields(order_id = %order_id))]
    pub async fn request_refund(
        &self,
        order_id: OrderId,
        actor: Option<UserId>,
        amount: Decimal,
        reason: &str,
    ) -> Result<Refund, ServiceError> {
        self.owned_order(order_id, actor).await?;
        let refund = self.ledger.request_refund(order_id, amount, reason).await?;
        info!(refund_id = %refund.id, amount = %refund.amount, "Refund requested");
        self.observers
            .notify(&LedgerEvent::RefundRequested(refund.clone()))
            .await;
        Ok(refund)
    }

    /// Approve a requested refund.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the refund is requested.
    pub async fn approve_refund(&self, id: RefundId) -> Result<Refund, ServiceError> {
        let refund = self.ledger.approve_refund(id).await?;
        self.refund_updated(&refund).await;
        Ok(refund)
    }

    /// Reject a requested refund.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the refund is requested.
    pub async fn reject_refund(&self, id: RefundId) -> Result<Refund, ServiceError> {
        let refund = self.ledger.reject_refund(id).await?;
        self.refund_updated(&refund).await;
        Ok(refund)
    }

    /// Record that an approved refund was paid out.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the refund is approved.
    #[instrument(skip(self, transaction_id), fields(refund_id = %id))]
    pub async fn process_refund(
        &self,
        id: RefundId,
        transaction_id: &str,
    ) -> Result<RefundOutcome, ServiceError> {
        let outcome = self.ledger.process_refund(id, transaction_id).await?;
        self.refund_updated(&outcome.refund).await;

        if outcome.fully_refunded
            && let Some(order) = self.ledger.get_order(outcome.refund.order_id).await?
        {
            info!(order_number = %order.order_number, "Order fully refunded");
            self.observers
                .notify(&LedgerEvent::OrderRefunded(order))
                .await;
        }
        Ok(outcome)
    }

    async fn refund_updated(&self, refund: &Refund) {
        info!(refund_id = %refund.id, status = %refund.status, "Refund updated");
        self.observers
            .notify(&LedgerEvent::RefundUpdated(refund.clone()))
            .await;
    }

    async fn owned_order(&self, id: OrderId, actor: Option<UserId>) -> Result<Order, ServiceError> {
        let order = self
            .ledger
            .get_order(id)
            .await?
            .ok_or(CommerceError::NotFound("order"))?;
        order.ensure_owner(actor)?;
        Ok(order)
    }
}

impl std::fmt::Debug for OrderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderService")
            .field("observers", &self.observers)
            .finish_non_exhaustive()
    }
}
