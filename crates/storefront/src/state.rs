//! Application state shared across handlers.

use std::sync::Arc;

use sqlx::PgPool;

use proshop_core::CurrencyCode;

use crate::config::{CheckoutUrls, StorefrontConfig};
use crate::db::{CartStore, CatalogStore, LedgerStore, PgStore};
use crate::payments::{PaymentError, PaymentProvider, StripeClient, WebhookVerifier};
use crate::services::{CartService, CheckoutService, Observers, OrderService, Reconciler};

/// The three store seams, usually backed by one object.
#[derive(Clone)]
pub struct Stores {
    pub catalog: Arc<dyn CatalogStore>,
    pub carts: Arc<dyn CartStore>,
    pub ledger: Arc<dyn LedgerStore>,
}

impl Stores {
    /// Use one store for catalog, carts and ledger.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: CatalogStore + CartStore + LedgerStore + 'static,
    {
        Self {
            catalog: store.clone(),
            carts: store.clone(),
            ledger: store,
        }
    }
}

/// Checkout settings that do not come from the stores.
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub urls: CheckoutUrls,
    pub currency: CurrencyCode,
    pub verifier: WebhookVerifier,
}

impl CheckoutSettings {
    #[must_use]
    pub fn from_config(config: &StorefrontConfig) -> Self {
        Self {
            urls: config.checkout_urls(),
            currency: config.payment.currency,
            verifier: WebhookVerifier::from_config(&config.payment),
        }
    }
}

/// Application state shared across all handlers.
///
/// This struct is cheaply cloneable via `Arc` and provides access to the
/// services built over the stores and payment provider.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    catalog: Arc<dyn CatalogStore>,
    carts: CartService,
    checkout: CheckoutService,
    reconciler: Reconciler,
    orders: OrderService,
    verifier: WebhookVerifier,
}

impl AppState {
    /// Create the production state: `PostgreSQL` stores and the Stripe client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &StorefrontConfig, pool: PgPool) -> Result<Self, PaymentError> {
        let provider = Arc::new(StripeClient::new(&config.payment)?);
        Ok(Self::from_parts(
            Stores::shared(Arc::new(PgStore::new(pool))),
            provider,
            CheckoutSettings::from_config(config),
            Observers::with_tracing(),
        ))
    }

    /// Assemble state from explicit parts.
    #[must_use]
    pub fn from_parts(
        stores: Stores,
        provider: Arc<dyn PaymentProvider>,
        settings: CheckoutSettings,
        observers: Observers,
    ) -> Self {
        let reconciler = Reconciler::new(
            stores.ledger.clone(),
            stores.carts.clone(),
            settings.currency,
            observers.clone(),
        );
        let checkout = CheckoutService::new(
            stores.catalog.clone(),
            stores.carts.clone(),
            stores.ledger.clone(),
            provider,
            reconciler.clone(),
            settings.urls,
            settings.currency,
        );

        Self {
            inner: Arc::new(AppStateInner {
                catalog: stores.catalog,
                carts: CartService::new(stores.carts),
                checkout,
                reconciler,
                orders: OrderService::new(stores.ledger, observers),
                verifier: settings.verifier,
            }),
        }
    }

    /// Catalog store, used for readiness checks.
    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.inner.catalog
    }

    #[must_use]
    pub fn carts(&self) -> &CartService {
        &self.inner.carts
    }

    #[must_use]
    pub fn checkout(&self) -> &CheckoutService {
        &self.inner.checkout
    }

    #[must_use]
    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }

    #[must_use]
    pub fn orders(&self) -> &OrderService {
        &self.inner.orders
    }

    /// Webhook signature verifier.
    #[must_use]
    pub fn verifier(&self) -> &WebhookVerifier {
        &self.inner.verifier
    }
}
