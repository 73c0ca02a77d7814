//! Webhook-driven payment reconciliation.
//!
//! Provider events arrive at least once, possibly out of order and possibly
//! duplicated. Each handler finds the local record the event refers to and
//! applies a guarded transition, so a replay lands on the same state.
//!
//! Deliveries for the same checkout session are serialized in-process by a
//! per-session lock; the store re-checks the transition under a row lock so
//! several processes are also safe.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use moka::future::Cache;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use proshop_core::CurrencyCode;
use proshop_core::checkout::CheckoutMetadata;
use proshop_core::ledger::{NewOrder, PaidTransition, PaymentUpsert};

use super::ServiceError;
use super::hooks::{LedgerEvent, Observers};
use crate::db::{CartStore, LedgerStore};
use crate::payments::{ProviderEvent, ProviderSession, WebhookEvent};

const MAX_TRACKED_SESSIONS: u64 = 10_000;
const SESSION_LOCK_IDLE: Duration = Duration::from_secs(600);

/// What a delivery did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// A transition was applied.
    Applied,
    /// The target was already in the resulting state.
    Replayed,
    /// Nothing local matched, or the event kind is not handled.
    Ignored,
}

/// Applies provider events to orders and payments.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<ReconcilerInner>,
}

struct ReconcilerInner {
    ledger: Arc<dyn LedgerStore>,
    carts: Arc<dyn CartStore>,
    currency: CurrencyCode,
    locks: Cache<String, Arc<Mutex<()>>>,
    observers: Observers,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        carts: Arc<dyn CartStore>,
        currency: CurrencyCode,
        observers: Observers,
    ) -> Self {
        let locks = Cache::builder()
            .max_capacity(MAX_TRACKED_SESSIONS)
            .time_to_idle(SESSION_LOCK_IDLE)
            .build();
        Self {
            inner: Arc::new(ReconcilerInner {
                ledger,
                carts,
                currency,
                locks,
                observers,
            }),
        }
    }

    /// Dispatch a verified webhook delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the order cannot take the
    /// transition (e.g. it was cancelled before payment completed).
    #[instrument(skip(self, event), fields(event_id = %event.id, kind = %event.kind))]
    pub async fn handle(&self, event: &WebhookEvent) -> Result<Reconciled, ServiceError> {
        match &event.event {
            ProviderEvent::CheckoutCompleted(session) => {
                self.complete_session(session, &event.raw).await
            }
            ProviderEvent::PaymentIntentSucceeded {
                intent_id,
                latest_charge,
            } => {
                self.intent_succeeded(intent_id, latest_charge.clone(), &event.raw)
                    .await
            }
            ProviderEvent::ChargeFailed {
                charge_id,
                failure_message,
            } => {
                let reason = failure_message.as_deref().unwrap_or("charge failed");
                self.charge_failed(charge_id, reason, &event.raw).await
            }
            ProviderEvent::Unknown => {
                debug!("Ignoring unhandled webhook event");
                Ok(Reconciled::Ignored)
            }
        }
    }

    /// Materialize and pay the order for a completed checkout session.
    ///
    /// Also used to recover when the provider reports a session paid but the
    /// local order never took the paid edge.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the order cannot become paid.
    #[instrument(skip(self, session, payload), fields(session_id = %session.id))]
    pub async fn complete_session(
        &self,
        session: &ProviderSession,
        payload: &serde_json::Value,
    ) -> Result<Reconciled, ServiceError> {
        let lock = self
            .inner
            .locks
            .get_with(session.id.clone(), async { Arc::new(Mutex::new(())) })
            .await;
        let _guard = lock.lock().await;

        let ledger = &self.inner.ledger;
        let metadata = CheckoutMetadata::from_pairs(&session.metadata);

        let order = match ledger.find_order_by_session(&session.id).await? {
            Some(order) => order,
            None => {
                let Some(metadata) = metadata.as_ref() else {
                    warn!("Checkout session carries no usable manifest, dropping event");
                    return Ok(Reconciled::Ignored);
                };
                let new_order = NewOrder::from_checkout(
                    &session.id,
                    metadata,
                    session.email(),
                    session.address(),
                    Utc::now(),
                );
                let (order, created) = ledger.create_order(&new_order).await?;
                if created {
                    info!(order_number = %order.order_number, "Order created from checkout session");
                    self.inner
                        .observers
                        .notify(&LedgerEvent::OrderCreated(order.clone()))
                        .await;
                }
                order
            }
        };

        let currency = session
            .currency
            .as_deref()
            .and_then(|c| c.parse().ok())
            .unwrap_or(self.inner.currency);
        let upsert = PaymentUpsert {
            order_id: order.id,
            amount: order.total,
            currency,
            provider_session_id: session.id.clone(),
            payment_intent_id: session.payment_intent.clone(),
            completed_at: Utc::now(),
        };
        let completion = ledger.complete_checkout(&upsert, payload).await?;

        if let Some(charged) = session.amount()
            && charged != completion.order.total
        {
            warn!(
                order_number = %completion.order.order_number,
                %charged,
                total = %completion.order.total,
                "Provider charged a different amount than the order total"
            );
        }

        for decrement in completion.decrements.iter().filter(|d| d.shortfall > 0) {
            warn!(
                order_number = %completion.order.order_number,
                variant_id = %decrement.variant_id,
                shortfall = decrement.shortfall,
                "Oversold variant, stock clamped at zero"
            );
        }

        match completion.transition {
            PaidTransition::Applied => {
                info!(
                    order_number = %completion.order.order_number,
                    amount = %completion.payment.amount,
                    "Order paid"
                );
                if let Some(metadata) = metadata {
                    self.remove_purchased(&metadata).await;
                }
                self.inner
                    .observers
                    .notify(&LedgerEvent::OrderPaid {
                        order: completion.order,
                        payment: completion.payment,
                    })
                    .await;
                Ok(Reconciled::Applied)
            }
            PaidTransition::AlreadyPaid => {
                debug!(order_number = %completion.order.order_number, "Replayed checkout completion");
                Ok(Reconciled::Replayed)
            }
        }
    }

    /// Take the bought units out of the shopper's cart. Anything added after
    /// checkout started stays.
    async fn remove_purchased(&self, metadata: &CheckoutMetadata) {
        let purchased = metadata.manifest.purchased();
        match self
            .inner
            .carts
            .remove_purchased(metadata.cart_id, &purchased)
            .await
        {
            Ok(Some(cart)) => debug!(
                cart_id = %cart.id,
                remaining = cart.items.len(),
                "Removed purchased lines from cart"
            ),
            Ok(None) => debug!(cart_id = %metadata.cart_id, "Purchased cart no longer exists"),
            Err(e) => warn!(error = %e, cart_id = %metadata.cart_id, "Purchased lines not removed"),
        }
    }

    async fn intent_succeeded(
        &self,
        intent_id: &str,
        charge_id: Option<String>,
        payload: &serde_json::Value,
    ) -> Result<Reconciled, ServiceError> {
        match self
            .inner
            .ledger
            .apply_intent_succeeded(intent_id, charge_id, payload)
            .await?
        {
            Some(payment) => {
                debug!(payment_id = %payment.id, status = %payment.status, "Payment intent succeeded");
                Ok(Reconciled::Applied)
            }
            None => {
                debug!(intent_id, "No payment for intent");
                Ok(Reconciled::Ignored)
            }
        }
    }

    async fn charge_failed(
        &self,
        charge_id: &str,
        reason: &str,
        payload: &serde_json::Value,
    ) -> Result<Reconciled, ServiceError> {
        let Some(failure) = self
            .inner
            .ledger
            .apply_charge_failed(charge_id, reason, payload)
            .await?
        else {
            debug!(charge_id, "No payment for charge");
            return Ok(Reconciled::Ignored);
        };

        if !failure.applied {
            info!(
                order_number = %failure.order.order_number,
                reason,
                "Charge failure after payment settled, state kept"
            );
            return Ok(Reconciled::Replayed);
        }

        warn!(order_number = %failure.order.order_number, reason, "Charge failed");
        self.inner
            .observers
            .notify(&LedgerEvent::PaymentFailed {
                order: failure.order,
                payment: failure.payment,
                reason: reason.to_string(),
            })
            .await;
        Ok(Reconciled::Applied)
    }

    /// Payload stored in the payment log when a session is recovered from a
    /// status query instead of a webhook.
    #[must_use]
    pub fn recovery_payload(session: &ProviderSession) -> serde_json::Value {
        json!({
            "source": "status_query",
            "session_id": session.id,
            "payment_status": session.payment_status,
            "payment_intent": session.payment_intent,
        })
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("currency", &self.inner.currency)
            .field("observers", &self.inner.observers)
            .finish_non_exhaustive()
    }
}
