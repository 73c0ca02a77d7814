//! Orders, payments, payment logs and refunds, with their allowed transitions.
//!
//! Stores persist these records; every state change goes through a method
//! here so the rules hold no matter which store is behind the service.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cart::CartOwner;
use crate::checkout::{CheckoutMetadata, ManifestLine};
use crate::error::CommerceError;
use crate::types::{
    CurrencyCode, Email, OrderId, OrderItemId, OrderPaymentStatus, OrderStatus, PaymentId,
    PaymentLogId, PaymentMethod, PaymentStatus, ProductId, RefundId, RefundStatus, UserId,
    VariantId,
};

/// Generate a human-facing order number, e.g. `ORD-20240115-3F9A0C1D`.
#[must_use]
pub fn generate_order_number(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "ORD-{}-{}",
        now.format("%Y%m%d"),
        suffix.get(..8).unwrap_or(&suffix).to_uppercase()
    )
}

/// Postal address copied onto the order at purchase time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddressSnapshot {
    pub name: String,
    pub line1: String,
    pub line2: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
}

/// Outcome of applying a successful checkout to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaidTransition {
    /// The order moved from unpaid/failed to paid; stock must be taken now.
    Applied,
    /// The order was already paid; nothing else may change.
    AlreadyPaid,
}

/// A durable purchase record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub order_number: String,
    /// `None` for anonymous checkouts.
    pub user_id: Option<UserId>,
    /// `None` when neither the shopper nor the provider supplied a valid address.
    pub email: Option<Email>,
    pub status: OrderStatus,
    pub payment_status: OrderPaymentStatus,
    pub provider_session_id: Option<String>,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub shipping_address: AddressSnapshot,
    pub billing_address: AddressSnapshot,
    pub tracking_number: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Ensure `actor` owns this order. Anonymous orders have no owner.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` if the actor is not the owner.
    pub fn ensure_owner(&self, actor: Option<UserId>) -> Result<(), CommerceError> {
        match (self.user_id, actor) {
            (Some(owner), Some(actor)) if owner == actor => Ok(()),
            _ => Err(CommerceError::Forbidden("order belongs to another customer")),
        }
    }

    /// Cancel on behalf of the owner.
    ///
    /// Stock taken for a paid order is not put back.
    ///
    /// # Errors
    ///
    /// - `Forbidden` if `actor` is not the owner
    /// - `InvalidState` unless the order is pending or confirmed
    pub fn cancel(&mut self, actor: Option<UserId>, now: DateTime<Utc>) -> Result<(), CommerceError> {
        self.ensure_owner(actor)?;
        if !self.status.is_cancellable() {
            return Err(CommerceError::InvalidState(format!(
                "order cannot be cancelled in status {}",
                self.status
            )));
        }
        self.status = OrderStatus::Cancelled;
        self.payment_status = OrderPaymentStatus::Cancelled;
        self.updated_at = now;
        Ok(())
    }

    /// Take the unpaid/failed to paid edge.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the order was cancelled or refunded.
    pub fn mark_paid(&mut self, now: DateTime<Utc>) -> Result<PaidTransition, CommerceError> {
        match self.payment_status {
            OrderPaymentStatus::Unpaid | OrderPaymentStatus::Failed => {
                self.payment_status = OrderPaymentStatus::Paid;
                self.status = OrderStatus::Confirmed;
                self.updated_at = now;
                Ok(PaidTransition::Applied)
            }
            OrderPaymentStatus::Paid => Ok(PaidTransition::AlreadyPaid),
            other => Err(CommerceError::InvalidState(format!(
                "order with payment status {other} cannot be paid"
            ))),
        }
    }

    /// Record a failed charge. Returns whether anything changed; a paid order
    /// stays paid.
    pub fn mark_payment_failed(&mut self, now: DateTime<Utc>) -> bool {
        if self.payment_status == OrderPaymentStatus::Unpaid {
            self.payment_status = OrderPaymentStatus::Failed;
            self.updated_at = now;
            return true;
        }
        false
    }

    /// Mark the order refunded once its payment has been paid back in full.
    pub fn mark_refunded(&mut self, now: DateTime<Utc>) {
        self.payment_status = OrderPaymentStatus::Refunded;
        self.updated_at = now;
    }
}

/// An immutable line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: OrderItemId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    /// `None` if the variant has since been removed from the catalog.
    pub variant_id: Option<VariantId>,
    pub sku: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub discount: Decimal,
}

impl OrderItem {
    #[must_use]
    pub fn total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity) - self.discount
    }
}

/// Order line as it is about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrderItem {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub sku: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub discount: Decimal,
}

impl From<&ManifestLine> for NewOrderItem {
    fn from(line: &ManifestLine) -> Self {
        Self {
            product_id: line.product_id,
            variant_id: Some(line.variant_id),
            sku: line.sku.clone(),
            name: line.name.clone(),
            quantity: line.quantity,
            unit_price: line.unit_price,
            discount: Decimal::ZERO,
        }
    }
}

/// Order as it is about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub order_number: String,
    pub user_id: Option<UserId>,
    pub email: Option<Email>,
    pub provider_session_id: String,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub shipping_address: AddressSnapshot,
    pub billing_address: AddressSnapshot,
    pub items: Vec<NewOrderItem>,
}

impl NewOrder {
    /// Build an order from the manifest carried through a paid session.
    ///
    /// `email` is the address the provider collected, used when the metadata
    /// has none. It is validated here; a malformed address is not stored.
    #[must_use]
    pub fn from_checkout(
        session_id: &str,
        metadata: &CheckoutMetadata,
        email: Option<&str>,
        shipping_address: Option<AddressSnapshot>,
        now: DateTime<Utc>,
    ) -> Self {
        let subtotal = metadata.manifest.total();
        let shipping_address = shipping_address.unwrap_or_default();
        Self {
            order_number: generate_order_number(now),
            user_id: match metadata.owner {
                CartOwner::User(id) => Some(id),
                CartOwner::Session(_) => None,
            },
            email: metadata
                .customer_email
                .clone()
                .or_else(|| email.and_then(|e| Email::parse(e).ok())),
            provider_session_id: session_id.to_string(),
            subtotal,
            shipping_cost: Decimal::ZERO,
            tax: Decimal::ZERO,
            total: subtotal,
            billing_address: shipping_address.clone(),
            shipping_address,
            items: metadata.manifest.lines.iter().map(NewOrderItem::from).collect(),
        }
    }
}

/// Monetary transaction record for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub order_id: OrderId,
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub provider_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub charge_id: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Apply a payment-intent success. Refunded and cancelled payments are
    /// left alone. Returns whether anything changed.
    pub fn mark_succeeded(&mut self, charge_id: Option<String>, now: DateTime<Utc>) -> bool {
        if matches!(
            self.status,
            PaymentStatus::Refunded | PaymentStatus::Cancelled
        ) {
            return false;
        }
        self.status = PaymentStatus::Succeeded;
        self.completed_at.get_or_insert(now);
        if charge_id.is_some() {
            self.charge_id = charge_id;
        }
        self.updated_at = now;
        true
    }

    /// Mark the payment fully paid back.
    pub fn mark_refunded(&mut self, now: DateTime<Utc>) {
        self.status = PaymentStatus::Refunded;
        self.updated_at = now;
    }

    /// Apply a failed charge. Only payments that have not completed can fail.
    pub fn mark_failed(&mut self, now: DateTime<Utc>) -> bool {
        if matches!(
            self.status,
            PaymentStatus::Pending | PaymentStatus::Processing | PaymentStatus::Failed
        ) {
            self.status = PaymentStatus::Failed;
            self.updated_at = now;
            return true;
        }
        false
    }
}

/// Fields written by the checkout-completed upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentUpsert {
    pub order_id: OrderId,
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub provider_session_id: String,
    pub payment_intent_id: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Append-only audit entry for a payment transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentLog {
    pub id: PaymentLogId,
    pub payment_id: PaymentId,
    pub status: PaymentStatus,
    pub message: String,
    /// Raw provider payload that caused the entry.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A request to pay back part or all of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub id: RefundId,
    pub order_id: OrderId,
    pub payment_id: PaymentId,
    pub amount: Decimal,
    pub reason: String,
    pub status: RefundStatus,
    pub refund_transaction_id: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Refund {
    fn expect_status(&self, expected: RefundStatus, action: &str) -> Result<(), CommerceError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(CommerceError::InvalidState(format!(
                "cannot {action} a refund in status {}",
                self.status
            )))
        }
    }

    /// # Errors
    ///
    /// Returns `InvalidState` unless the refund is requested.
    pub fn approve(&mut self, now: DateTime<Utc>) -> Result<(), CommerceError> {
        self.expect_status(RefundStatus::Requested, "approve")?;
        self.status = RefundStatus::Approved;
        self.updated_at = now;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `InvalidState` unless the refund is requested.
    pub fn reject(&mut self, now: DateTime<Utc>) -> Result<(), CommerceError> {
        self.expect_status(RefundStatus::Requested, "reject")?;
        self.status = RefundStatus::Rejected;
        self.updated_at = now;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `InvalidState` unless the refund is approved.
    pub fn process(
        &mut self,
        transaction_id: String,
        now: DateTime<Utc>,
    ) -> Result<(), CommerceError> {
        self.expect_status(RefundStatus::Approved, "process")?;
        self.status = RefundStatus::Processed;
        self.refund_transaction_id = Some(transaction_id);
        self.processed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}

/// Amount of `payment_amount` not yet claimed by a non-rejected refund.
#[must_use]
pub fn refundable_amount(payment_amount: Decimal, refunds: &[Refund]) -> Decimal {
    let claimed: Decimal = refunds
        .iter()
        .filter(|r| r.status != RefundStatus::Rejected)
        .map(|r| r.amount)
        .sum();
    (payment_amount - claimed).max(Decimal::ZERO)
}

/// Check a new refund request against the payment.
///
/// # Errors
///
/// - `InvalidState` if the payment has not succeeded
/// - `InvalidRefundAmount` if `requested` is not positive or exceeds what is
///   still refundable
pub fn validate_refund_request(
    payment: &Payment,
    refunds: &[Refund],
    requested: Decimal,
) -> Result<(), CommerceError> {
    if payment.status != PaymentStatus::Succeeded {
        return Err(CommerceError::InvalidState(format!(
            "payment in status {} cannot be refunded",
            payment.status
        )));
    }
    let refundable = refundable_amount(payment.amount, refunds);
    if requested <= Decimal::ZERO || requested > refundable {
        return Err(CommerceError::InvalidRefundAmount {
            requested,
            refundable,
        });
    }
    Ok(())
}

/// Whether processed refunds cover the whole payment.
#[must_use]
pub fn is_fully_refunded(payment_amount: Decimal, refunds: &[Refund]) -> bool {
    let processed: Decimal = refunds
        .iter()
        .filter(|r| r.status == RefundStatus::Processed)
        .map(|r| r.amount)
        .sum();
    processed >= payment_amount
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::checkout::CheckoutManifest;
    use crate::types::{CartId, SessionToken};

    fn order(status: OrderStatus, payment_status: OrderPaymentStatus) -> Order {
        let now = Utc::now();
        Order {
            id: OrderId::new(1),
            order_number: generate_order_number(now),
            user_id: Some(UserId::new(5)),
            email: Email::parse("buyer@example.com").ok(),
            status,
            payment_status,
            provider_session_id: Some("cs_test_1".to_string()),
            subtotal: Decimal::new(5000, 2),
            shipping_cost: Decimal::ZERO,
            tax: Decimal::ZERO,
            total: Decimal::new(5000, 2),
            shipping_address: AddressSnapshot::default(),
            billing_address: AddressSnapshot::default(),
            tracking_number: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn payment(status: PaymentStatus) -> Payment {
        let now = Utc::now();
        Payment {
            id: PaymentId::new(1),
            order_id: OrderId::new(1),
            amount: Decimal::new(5000, 2),
            currency: CurrencyCode::Usd,
            method: PaymentMethod::Stripe,
            status,
            provider_session_id: Some("cs_test_1".to_string()),
            payment_intent_id: Some("pi_1".to_string()),
            charge_id: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn refund(id: i32, amount: i64, status: RefundStatus) -> Refund {
        let now = Utc::now();
        Refund {
            id: RefundId::new(id),
            order_id: OrderId::new(1),
            payment_id: PaymentId::new(1),
            amount: Decimal::new(amount, 2),
            reason: "damaged".to_string(),
            status,
            refund_transaction_id: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_order_number_format() {
        let now = chrono::DateTime::parse_from_rfc3339("2024-01-15T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let number = generate_order_number(now);
        assert!(number.starts_with("ORD-20240115-"));
        assert_eq!(number.len(), "ORD-20240115-".len() + 8);
    }

    #[test]
    fn test_cancel_pending_order() {
        let mut o = order(OrderStatus::Pending, OrderPaymentStatus::Unpaid);
        o.cancel(Some(UserId::new(5)), Utc::now()).unwrap();
        assert_eq!(o.status, OrderStatus::Cancelled);
        assert_eq!(o.payment_status, OrderPaymentStatus::Cancelled);
    }

    #[test]
    fn test_cancel_shipped_order_is_rejected() {
        let mut o = order(OrderStatus::Shipped, OrderPaymentStatus::Paid);
        let err = o.cancel(Some(UserId::new(5)), Utc::now()).unwrap_err();
        assert!(matches!(err, CommerceError::InvalidState(_)));
        assert_eq!(o.status, OrderStatus::Shipped);
    }

    #[test]
    fn test_cancel_by_stranger_is_forbidden() {
        let mut o = order(OrderStatus::Pending, OrderPaymentStatus::Unpaid);
        assert!(matches!(
            o.cancel(Some(UserId::new(6)), Utc::now()),
            Err(CommerceError::Forbidden(_))
        ));
        assert!(matches!(
            o.cancel(None, Utc::now()),
            Err(CommerceError::Forbidden(_))
        ));
    }

    #[test]
    fn test_paid_edge_is_taken_once() {
        let mut o = order(OrderStatus::Pending, OrderPaymentStatus::Unpaid);
        assert_eq!(o.mark_paid(Utc::now()).unwrap(), PaidTransition::Applied);
        assert_eq!(o.status, OrderStatus::Confirmed);
        assert_eq!(o.mark_paid(Utc::now()).unwrap(), PaidTransition::AlreadyPaid);

        let mut failed = order(OrderStatus::Pending, OrderPaymentStatus::Failed);
        assert_eq!(failed.mark_paid(Utc::now()).unwrap(), PaidTransition::Applied);

        let mut cancelled = order(OrderStatus::Cancelled, OrderPaymentStatus::Cancelled);
        assert!(cancelled.mark_paid(Utc::now()).is_err());
    }

    #[test]
    fn test_failure_does_not_unpay() {
        let mut paid = order(OrderStatus::Confirmed, OrderPaymentStatus::Paid);
        assert!(!paid.mark_payment_failed(Utc::now()));
        assert_eq!(paid.payment_status, OrderPaymentStatus::Paid);

        let mut unpaid = order(OrderStatus::Pending, OrderPaymentStatus::Unpaid);
        assert!(unpaid.mark_payment_failed(Utc::now()));
        assert_eq!(unpaid.payment_status, OrderPaymentStatus::Failed);
    }

    #[test]
    fn test_payment_succeeded_keeps_refunds() {
        let mut p = payment(PaymentStatus::Refunded);
        assert!(!p.mark_succeeded(Some("ch_1".to_string()), Utc::now()));

        let mut p = payment(PaymentStatus::Pending);
        assert!(p.mark_succeeded(Some("ch_1".to_string()), Utc::now()));
        assert_eq!(p.charge_id.as_deref(), Some("ch_1"));
        assert!(p.completed_at.is_some());
        assert!(!p.mark_failed(Utc::now()));
    }

    #[test]
    fn test_refund_bounds() {
        let p = payment(PaymentStatus::Succeeded);
        let refunds = vec![
            refund(1, 2000, RefundStatus::Processed),
            refund(2, 1000, RefundStatus::Rejected),
        ];
        assert_eq!(refundable_amount(p.amount, &refunds), Decimal::new(3000, 2));
        validate_refund_request(&p, &refunds, Decimal::new(3000, 2)).unwrap();
        assert!(matches!(
            validate_refund_request(&p, &refunds, Decimal::new(3001, 2)),
            Err(CommerceError::InvalidRefundAmount { .. })
        ));
        assert!(validate_refund_request(&p, &refunds, Decimal::ZERO).is_err());
        assert!(
            validate_refund_request(&payment(PaymentStatus::Pending), &[], Decimal::ONE).is_err()
        );
    }

    #[test]
    fn test_refund_workflow() {
        let mut r = refund(1, 5000, RefundStatus::Requested);
        assert!(r.process("re_1".to_string(), Utc::now()).is_err());
        r.approve(Utc::now()).unwrap();
        assert!(r.reject(Utc::now()).is_err());
        r.process("re_1".to_string(), Utc::now()).unwrap();
        assert_eq!(r.status, RefundStatus::Processed);
        assert!(r.processed_at.is_some());
        assert!(is_fully_refunded(Decimal::new(5000, 2), &[r]));
    }

    #[test]
    fn test_new_order_from_checkout() {
        let metadata = CheckoutMetadata {
            owner: CartOwner::Session(SessionToken::from_string("tok")),
            cart_id: CartId::new(3),
            customer_email: None,
            manifest: CheckoutManifest {
                lines: vec![ManifestLine {
                    variant_id: VariantId::new(1),
                    product_id: ProductId::new(2),
                    sku: "TEE-M".to_string(),
                    name: "Tee M".to_string(),
                    quantity: 2,
                    unit_price: Decimal::new(1250, 2),
                }],
            },
        };
        let new = NewOrder::from_checkout(
            "cs_1",
            &metadata,
            Some("guest@example.com"),
            None,
            Utc::now(),
        );
        assert_eq!(new.user_id, None);
        assert_eq!(new.email.as_ref().map(Email::as_str), Some("guest@example.com"));
        assert_eq!(new.total, Decimal::new(2500, 2));
        assert_eq!(new.items.len(), 1);
        assert_eq!(new.items[0].variant_id, Some(VariantId::new(1)));

        let unusable = NewOrder::from_checkout("cs_2", &metadata, Some("nobody"), None, Utc::now());
        assert_eq!(unusable.email, None);
    }
}
