//! Payment provider integration.
//!
//! The provider is reached through the [`PaymentProvider`] trait so the
//! checkout and reconciliation services never depend on a concrete HTTP
//! client. [`StripeClient`] is the production implementation; webhook
//! deliveries are authenticated and decoded by [`webhook`].

pub mod stripe;
pub mod webhook;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use proshop_core::{CurrencyCode, from_minor_units};
use proshop_core::ledger::AddressSnapshot;

pub use stripe::StripeClient;
pub use webhook::{ProviderEvent, WebhookEvent, WebhookVerifier};

/// Errors that can occur when talking to the payment provider.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// HTTP request failed (connect, timeout, TLS).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider rejected the request.
    #[error("provider error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Webhook signature header is missing, malformed, stale or wrong.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Webhook body is not a provider event.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A request could not be built (e.g. unrepresentable amount).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// One line of a checkout session, priced in minor units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLineItem {
    pub name: String,
    pub unit_amount: i64,
    pub quantity: u32,
}

/// Everything needed to open a hosted checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionRequest {
    pub line_items: Vec<SessionLineItem>,
    pub currency: CurrencyCode,
    pub success_url: String,
    pub cancel_url: String,
    pub customer_email: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// A newly opened session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreatedSession {
    pub id: String,
    pub url: String,
}

/// Postal address as reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProviderAddress {
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

/// Customer details collected on the hosted checkout page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CustomerDetails {
    pub email: Option<String>,
    pub name: Option<String>,
    pub address: Option<ProviderAddress>,
}

/// A checkout session as returned by the API and embedded in
/// `checkout.session.completed` events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProviderSession {
    pub id: String,
    /// Session lifecycle: `open`, `complete` or `expired`.
    pub status: Option<String>,
    /// `paid`, `unpaid` or `no_payment_required`.
    pub payment_status: Option<String>,
    pub payment_intent: Option<String>,
    pub customer_email: Option<String>,
    pub customer_details: Option<CustomerDetails>,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ProviderSession {
    /// Whether the provider considers the session paid.
    #[must_use]
    pub fn is_paid(&self) -> bool {
        self.payment_status.as_deref() == Some("paid")
    }

    /// Amount charged, converted from minor units.
    #[must_use]
    pub fn amount(&self) -> Option<Decimal> {
        self.amount_total.map(from_minor_units)
    }

    /// Best known customer email.
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.customer_details
            .as_ref()
            .and_then(|d| d.email.as_deref())
            .or(self.customer_email.as_deref())
    }

    /// Address collected at checkout, if any.
    #[must_use]
    pub fn address(&self) -> Option<AddressSnapshot> {
        let details = self.customer_details.as_ref()?;
        let address = details.address.as_ref()?;
        Some(AddressSnapshot {
            name: details.name.clone().unwrap_or_default(),
            line1: address.line1.clone().unwrap_or_default(),
            line2: address.line2.clone().unwrap_or_default(),
            city: address.city.clone().unwrap_or_default(),
            state: address.state.clone().unwrap_or_default(),
            postal_code: address.postal_code.clone().unwrap_or_default(),
            country: address.country.clone().unwrap_or_default(),
        })
    }
}

/// A hosted-checkout payment provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Open a checkout session.
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreatedSession, PaymentError>;

    /// Fetch a session's current state.
    async fn retrieve_session(&self, session_id: &str) -> Result<ProviderSession, PaymentError>;
}
