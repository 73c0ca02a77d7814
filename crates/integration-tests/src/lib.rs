//! Integration tests for Proshop.
//!
//! The storefront router is driven in-process with `tower::ServiceExt`, over
//! the in-memory stores and a scripted payment provider, so the suite needs
//! no database or network.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p proshop-integration-tests
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request, StatusCode, header};
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde_json::{Value, json};
use sha2::Sha256;
use tower::ServiceExt;
use tower_sessions::Session;

use proshop_core::catalog::Variant;
use proshop_core::{CurrencyCode, ProductId, VariantId};
use proshop_storefront::config::CheckoutUrls;
use proshop_storefront::db::MemoryStore;
use proshop_storefront::error::AppError;
use proshop_storefront::middleware::{CurrentUser, session_layer, sign_in};
use proshop_storefront::payments::webhook::SIGNATURE_HEADER;
use proshop_storefront::payments::{
    CreateSessionRequest, CreatedSession, PaymentError, PaymentProvider, ProviderSession,
    WebhookVerifier,
};
use proshop_storefront::services::{LedgerEvent, LedgerObserver, Observers};
use proshop_storefront::state::{AppState, CheckoutSettings, Stores};

/// Webhook signing secret shared by the test verifier and [`sign`].
pub const WEBHOOK_SECRET: &str = "whsec_integration_9f8e7d6c5b4a";

// ============================================================================
// Payment provider double
// ============================================================================

/// Provider that records requests and serves sessions from memory.
#[derive(Default)]
pub struct FakeProvider {
    counter: AtomicUsize,
    requests: Mutex<Vec<CreateSessionRequest>>,
    sessions: Mutex<HashMap<String, ProviderSession>>,
    fail_next: Mutex<Option<String>>,
}

impl FakeProvider {
    /// Every `create_session` request received so far.
    pub fn requests(&self) -> Vec<CreateSessionRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Make the next `create_session` fail with a provider error.
    pub fn fail_next_create(&self, message: &str) {
        *self.fail_next.lock().unwrap() = Some(message.to_string());
    }

    /// The provider's current copy of a session.
    pub fn session(&self, id: &str) -> ProviderSession {
        self.sessions
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .expect("unknown session")
    }

    /// Simulate the shopper paying: the session becomes complete and paid.
    pub fn pay(&self, id: &str, intent_id: &str) -> ProviderSession {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(id).expect("unknown session");
        session.status = Some("complete".to_string());
        session.payment_status = Some("paid".to_string());
        session.payment_intent = Some(intent_id.to_string());
        session
            .customer_email
            .get_or_insert_with(|| "guest@example.com".to_string());
        session.clone()
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreatedSession, PaymentError> {
        if let Some(message) = self.fail_next.lock().unwrap().take() {
            return Err(PaymentError::Api {
                status: 400,
                message,
            });
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("cs_test_{n}");
        let amount_total = request
            .line_items
            .iter()
            .map(|line| line.unit_amount * i64::from(line.quantity))
            .sum();

        self.requests.lock().unwrap().push(request.clone());
        self.sessions.lock().unwrap().insert(
            id.clone(),
            ProviderSession {
                id: id.clone(),
                status: Some("open".to_string()),
                payment_status: Some("unpaid".to_string()),
                customer_email: request.customer_email.clone(),
                amount_total: Some(amount_total),
                currency: Some(request.currency.as_str().to_string()),
                metadata: request.metadata.clone().into_iter().collect(),
                ..ProviderSession::default()
            },
        );

        Ok(CreatedSession {
            url: format!("https://checkout.test/pay/{id}"),
            id,
        })
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<ProviderSession, PaymentError> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| PaymentError::Api {
                status: 404,
                message: format!("No such checkout.session: {session_id}"),
            })
    }
}

// ============================================================================
// Observer double
// ============================================================================

/// Records the names of ledger events in delivery order.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<&'static str>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| **e == name).count()
    }
}

#[async_trait]
impl LedgerObserver for RecordingObserver {
    async fn notify(&self, event: &LedgerEvent) {
        self.events.lock().unwrap().push(event.name());
    }
}

// ============================================================================
// Test context
// ============================================================================

/// A fully wired storefront over in-memory parts.
pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<FakeProvider>,
    pub observer: Arc<RecordingObserver>,
    pub state: AppState,
    pub router: Router,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(FakeProvider::default());
        let observer = Arc::new(RecordingObserver::default());

        let settings = CheckoutSettings {
            urls: CheckoutUrls {
                success_url: "http://shop.test/checkout/success?session_id={CHECKOUT_SESSION_ID}"
                    .to_string(),
                cancel_url: "http://shop.test/checkout/cancel".to_string(),
            },
            currency: CurrencyCode::Usd,
            verifier: WebhookVerifier::new(
                SecretString::from(WEBHOOK_SECRET),
                Duration::from_secs(300),
            ),
        };
        let state = AppState::from_parts(
            Stores::shared(store.clone()),
            provider.clone(),
            settings,
            Observers::new(vec![observer.clone()]),
        );

        let routes = proshop_storefront::router().route("/test/sign-in", post(test_sign_in));
        let router = proshop_storefront::build(
            routes,
            state.clone(),
            session_layer(tower_sessions::MemoryStore::default(), false),
        );

        Self {
            store,
            provider,
            observer,
            state,
            router,
        }
    }

    /// Add an active variant with the given price (e.g. `"20.00"`) and stock.
    pub async fn seed_variant(&self, id: i32, sku: &str, price: &str, stock: u32) -> VariantId {
        let variant_id = VariantId::new(id);
        self.store
            .put_variant(Variant {
                id: variant_id,
                product_id: ProductId::new(id * 10),
                sku: sku.to_string(),
                name: format!("{sku} name"),
                price: price.parse().expect("price"),
                stock,
                is_active: true,
            })
            .await;
        variant_id
    }

    /// A browser with its own cookie jar.
    pub fn client(&self) -> TestClient {
        TestClient {
            router: self.router.clone(),
            cookie: None,
        }
    }

    /// Deliver a signed webhook body.
    pub async fn deliver(&self, body: &Value) -> StatusCode {
        let bytes = serde_json::to_vec(body).unwrap();
        let header = sign(&bytes, chrono::Utc::now().timestamp());
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/payment/webhook")
            .header(header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, header)
            .body(Body::from(bytes))
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap().status()
    }
}

async fn test_sign_in(
    State(state): State<AppState>,
    session: Session,
    Json(user): Json<CurrentUser>,
) -> Result<Json<Value>, AppError> {
    let cart = sign_in(&session, state.carts(), user).await?;
    Ok(Json(json!({
        "cart_id": cart.id,
        "total_items": cart.totals().total_items,
    })))
}

/// An HTTP client that keeps the session cookie between requests.
pub struct TestClient {
    router: Router,
    cookie: Option<String>,
}

impl TestClient {
    /// Send a request and decode the JSON response (`Value::Null` if empty).
    pub async fn send(&mut self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(cookie) = &self.cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&json).unwrap())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        let response = self.router.clone().oneshot(request).await.unwrap();
        if let Some(set_cookie) = response.headers().get(header::SET_COOKIE) {
            let pair = set_cookie.to_str().unwrap().split(';').next().unwrap();
            self.cookie = Some(pair.to_string());
        }

        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }

    pub async fn get(&mut self, uri: &str) -> (StatusCode, Value) {
        self.send(Method::GET, uri, None).await
    }

    pub async fn post(&mut self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(Method::POST, uri, Some(body)).await
    }

    pub async fn patch(&mut self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(Method::PATCH, uri, Some(body)).await
    }

    pub async fn delete(&mut self, uri: &str) -> (StatusCode, Value) {
        self.send(Method::DELETE, uri, None).await
    }

    /// Add a variant to this client's cart.
    pub async fn add(&mut self, variant: VariantId, quantity: u32) -> (StatusCode, Value) {
        self.post(
            "/api/cart/items",
            json!({ "variant_id": variant, "quantity": quantity }),
        )
        .await
    }

    /// Sign in as `user_id`, merging any anonymous cart.
    pub async fn sign_in(&mut self, user_id: i32) -> Value {
        let (status, body) = self
            .post(
                "/test/sign-in",
                json!({ "id": user_id, "email": format!("user{user_id}@example.com") }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "sign-in failed: {body}");
        body
    }
}

// ============================================================================
// Webhook bodies
// ============================================================================

/// Build a `Stripe-Signature` header value for `payload`.
pub fn sign(payload: &[u8], timestamp: i64) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

/// `checkout.session.completed` for the provider's copy of a session.
pub fn checkout_completed(event_id: &str, session: &ProviderSession) -> Value {
    json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "data": { "object": {
            "id": session.id,
            "status": session.status,
            "payment_status": session.payment_status,
            "payment_intent": session.payment_intent,
            "customer_email": session.customer_email,
            "customer_details": {
                "email": session.customer_email,
                "name": "Pat Shopper",
                "address": {
                    "line1": "1 Market St",
                    "city": "Springfield",
                    "postal_code": "12345",
                    "country": "US"
                }
            },
            "amount_total": session.amount_total,
            "currency": session.currency,
            "metadata": session.metadata,
        }}
    })
}

/// `payment_intent.succeeded`.
pub fn intent_succeeded(event_id: &str, intent_id: &str, charge_id: &str) -> Value {
    json!({
        "id": event_id,
        "type": "payment_intent.succeeded",
        "data": { "object": { "id": intent_id, "latest_charge": charge_id } }
    })
}

/// `charge.failed`.
pub fn charge_failed(event_id: &str, charge_id: &str, message: &str) -> Value {
    json!({
        "id": event_id,
        "type": "charge.failed",
        "data": { "object": { "id": charge_id, "failure_message": message } }
    })
}

/// Read a JSON money value, whether encoded as a string or a number.
pub fn money(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("not a money value: {other}"),
    }
}
