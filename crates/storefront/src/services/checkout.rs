//! Checkout session creation and payment status queries.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, instrument, warn};

use proshop_core::cart::CartOwner;
use proshop_core::checkout::{CheckoutManifest, CheckoutMetadata};
use proshop_core::{
    CommerceError, CurrencyCode, Email, OrderPaymentStatus, OrderStatus, to_minor_units,
};

use super::ServiceError;
use super::reconciliation::Reconciler;
use crate::config::CheckoutUrls;
use crate::db::{CartStore, CatalogStore, LedgerStore};
use crate::payments::{CreateSessionRequest, PaymentError, PaymentProvider, SessionLineItem};

/// A freshly opened hosted checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutSession {
    pub session_id: String,
    pub checkout_url: String,
    pub total_amount: Decimal,
    pub items_count: u64,
}

/// Provider and ledger view of a checkout session.
///
/// Order fields are `None` until the order has been materialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentStatusView {
    pub session_id: String,
    pub provider_status: Option<String>,
    pub order_number: Option<String>,
    pub order_status: Option<OrderStatus>,
    pub payment_status: Option<OrderPaymentStatus>,
    pub amount: Option<Decimal>,
}

/// Checkout service.
#[derive(Clone)]
pub struct CheckoutService {
    catalog: Arc<dyn CatalogStore>,
    carts: Arc<dyn CartStore>,
    ledger: Arc<dyn LedgerStore>,
    provider: Arc<dyn PaymentProvider>,
    reconciler: Reconciler,
    urls: CheckoutUrls,
    currency: CurrencyCode,
}

impl CheckoutService {
    #[must_use]
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        carts: Arc<dyn CartStore>,
        ledger: Arc<dyn LedgerStore>,
        provider: Arc<dyn PaymentProvider>,
        reconciler: Reconciler,
        urls: CheckoutUrls,
        currency: CurrencyCode,
    ) -> Self {
        Self {
            catalog,
            carts,
            ledger,
            provider,
            reconciler,
            urls,
            currency,
        }
    }

    /// Open a hosted checkout session for the owner's cart.
    ///
    /// The cart is left untouched; the bought lines leave it only once the
    /// payment is reconciled.
    ///
    /// # Errors
    ///
    /// Returns `EmptyCart` or `StockConflict` without contacting the
    /// provider, or a payment error if the provider rejects the session.
    #[instrument(skip(self, customer_email))]
    pub async fn create_checkout(
        &self,
        owner: &CartOwner,
        customer_email: Option<&Email>,
    ) -> Result<CheckoutSession, ServiceError> {
        let cart = self.carts.get_or_create_cart(owner).await?;
        if cart.is_empty() {
            return Err(CommerceError::EmptyCart.into());
        }

        let ids: Vec<_> = cart.items.iter().map(|item| item.variant_id).collect();
        let variants = self.catalog.get_variants(&ids).await?;
        let manifest = CheckoutManifest::prepare(&cart.items, &variants)?;

        let line_items = manifest
            .lines
            .iter()
            .map(|line| {
                let unit_amount = to_minor_units(line.unit_price).ok_or_else(|| {
                    PaymentError::InvalidRequest(format!("unrepresentable price for {}", line.sku))
                })?;
                Ok(SessionLineItem {
                    name: line.name.clone(),
                    unit_amount,
                    quantity: line.quantity,
                })
            })
            .collect::<Result<Vec<_>, PaymentError>>()?;

        let total_amount = manifest.total();
        let items_count = manifest.item_count();
        let metadata = CheckoutMetadata {
            owner: owner.clone(),
            cart_id: cart.id,
            customer_email: customer_email.cloned(),
            manifest,
        }
        .to_pairs()?;

        let request = CreateSessionRequest {
            line_items,
            currency: self.currency,
            success_url: self.urls.success_url.clone(),
            cancel_url: self.urls.cancel_url.clone(),
            customer_email: customer_email.map(|e| e.as_str().to_string()),
            metadata,
        };
        let created = self.provider.create_session(&request).await?;

        info!(
            session_id = %created.id,
            cart_id = %cart.id,
            total = %total_amount,
            items = items_count,
            "Checkout session created"
        );

        Ok(CheckoutSession {
            session_id: created.id,
            checkout_url: created.url,
            total_amount,
            items_count,
        })
    }

    /// Report where a checkout session stands on both sides.
    ///
    /// If the provider says the session is paid but the local order is
    /// missing or unpaid (the webhook was lost or its processing failed), the
    /// completion is replayed from the provider's copy of the session before
    /// answering.
    ///
    /// # Errors
    ///
    /// Returns a payment error if the provider lookup fails, or a repository
    /// error if the ledger cannot be read.
    #[instrument(skip(self))]
    pub async fn payment_status(&self, session_id: &str) -> Result<PaymentStatusView, ServiceError> {
        let session = self.provider.retrieve_session(session_id).await?;
        let mut order = self.ledger.find_order_by_session(&session.id).await?;

        let awaiting_payment = order.as_ref().is_none_or(|o| {
            matches!(
                o.payment_status,
                OrderPaymentStatus::Unpaid | OrderPaymentStatus::Failed
            )
        });
        if session.is_paid() && awaiting_payment {
            warn!(session_id = %session.id, "Paid session not reconciled, recovering");
            let payload = Reconciler::recovery_payload(&session);
            match self.reconciler.complete_session(&session, &payload).await {
                Ok(_) => order = self.ledger.find_order_by_session(&session.id).await?,
                Err(e) => warn!(error = %e, session_id = %session.id, "Recovery failed"),
            }
        }

        Ok(PaymentStatusView {
            session_id: session.id,
            provider_status: session.payment_status,
            order_number: order.as_ref().map(|o| o.order_number.clone()),
            order_status: order.as_ref().map(|o| o.status),
            payment_status: order.as_ref().map(|o| o.payment_status),
            amount: order.map(|o| o.total),
        })
    }
}

impl std::fmt::Debug for CheckoutService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutService")
            .field("urls", &self.urls)
            .field("currency", &self.currency)
            .finish_non_exhaustive()
    }
}
