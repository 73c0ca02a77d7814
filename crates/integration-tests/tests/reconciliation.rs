//! Webhook reconciliation: ordering, replays and partial failures.

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use chrono::Utc;
use http_body_util::BodyExt;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tower::ServiceExt;

use proshop_core::cart::CartOwner;
use proshop_core::checkout::CheckoutMetadata;
use proshop_core::ledger::{AddressSnapshot, NewOrder, NewOrderItem, Order, Payment};
use proshop_core::{
    CartId, CurrencyCode, Email, OrderId, OrderPaymentStatus, OrderStatus, PaymentId, PaymentMethod,
    PaymentStatus, ProductId, UserId, VariantId,
};
use proshop_integration_tests::{
    TestContext, charge_failed, checkout_completed, intent_succeeded, money, sign,
};
use proshop_storefront::db::{CartStore, LedgerStore};
use proshop_storefront::payments::ProviderSession;
use proshop_storefront::payments::webhook::SIGNATURE_HEADER;

/// Put two tees in a fresh cart, open a checkout and pay for it.
async fn paid_session(ctx: &TestContext, tee: VariantId) -> ProviderSession {
    let mut client = ctx.client();
    client.add(tee, 2).await;
    let (status, body) = client.post("/api/cart/checkout", json!({})).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    ctx.provider
        .pay(body["session_id"].as_str().unwrap(), "pi_1")
}

async fn order_for(ctx: &TestContext, session_id: &str) -> Order {
    ctx.store
        .find_order_by_session(session_id)
        .await
        .unwrap()
        .expect("order should exist")
}

async fn payment_for(ctx: &TestContext, order_id: OrderId) -> Payment {
    ctx.store
        .payment_for_order(order_id)
        .await
        .unwrap()
        .expect("payment should exist")
}

/// An unpaid order for `user` created without going through checkout.
async fn unpaid_order(ctx: &TestContext, session_id: &str, variant: VariantId) -> Order {
    let order = NewOrder {
        order_number: format!("ORD-TEST-{session_id}"),
        user_id: Some(UserId::new(3)),
        email: Email::parse("user3@example.com").ok(),
        provider_session_id: session_id.to_string(),
        subtotal: Decimal::new(2000, 2),
        shipping_cost: Decimal::ZERO,
        tax: Decimal::ZERO,
        total: Decimal::new(2000, 2),
        shipping_address: AddressSnapshot::default(),
        billing_address: AddressSnapshot::default(),
        items: vec![NewOrderItem {
            product_id: ProductId::new(10),
            variant_id: Some(variant),
            sku: "TEE-M".to_string(),
            name: "TEE-M name".to_string(),
            quantity: 1,
            unit_price: Decimal::new(2000, 2),
            discount: Decimal::ZERO,
        }],
    };
    let (order, created) = ctx.store.create_order(&order).await.unwrap();
    assert!(created);
    order
}

async fn post_raw(ctx: &TestContext, body: &[u8], signature: Option<String>) -> StatusCode {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/api/payment/webhook")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    let request = builder.body(Body::from(body.to_vec())).unwrap();
    ctx.router.clone().oneshot(request).await.unwrap().status()
}

// ============================================================================
// checkout.session.completed
// ============================================================================

#[tokio::test]
async fn test_completion_materializes_paid_order() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let session = paid_session(&ctx, tee).await;

    let status = ctx.deliver(&checkout_completed("evt_1", &session)).await;
    assert_eq!(status, StatusCode::OK);

    let order = order_for(&ctx, &session.id).await;
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.payment_status, OrderPaymentStatus::Paid);
    assert_eq!(order.total, Decimal::new(4000, 2));
    assert_eq!(order.email.as_ref().map(Email::as_str), Some("guest@example.com"));
    assert_eq!(order.user_id, None);
    assert_eq!(order.shipping_address.line1, "1 Market St");
    assert!(order.order_number.starts_with("ORD-"));

    let items = ctx.store.order_items(order.id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].sku, "TEE-M");
    assert_eq!(items[0].quantity, 2);
    assert_eq!(items[0].unit_price, Decimal::new(2000, 2));

    let payment = payment_for(&ctx, order.id).await;
    assert_eq!(payment.status, PaymentStatus::Succeeded);
    assert_eq!(payment.amount, Decimal::new(4000, 2));
    assert_eq!(payment.currency, CurrencyCode::Usd);
    assert_eq!(payment.payment_intent_id.as_deref(), Some("pi_1"));
    assert!(payment.completed_at.is_some());

    assert_eq!(ctx.store.stock(tee).await, Some(8));
    assert_eq!(ctx.observer.events(), vec!["order_created", "order_paid"]);
}

#[tokio::test]
async fn test_completion_clears_the_purchased_cart() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let mut client = ctx.client();
    client.add(tee, 1).await;
    let (_, body) = client.post("/api/cart/checkout", json!({})).await;
    let session = ctx.provider.pay(body["session_id"].as_str().unwrap(), "pi_7");

    ctx.deliver(&checkout_completed("evt_1", &session)).await;

    let (_, cart) = client.get("/api/cart").await;
    assert_eq!(cart["total_items"], 0);
}

#[tokio::test]
async fn test_completion_keeps_lines_added_after_checkout() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let mug = ctx.seed_variant(2, "MUG-RED", "14.50", 10).await;
    let mut client = ctx.client();
    client.add(tee, 1).await;
    let (_, body) = client.post("/api/cart/checkout", json!({})).await;
    let session = ctx.provider.pay(body["session_id"].as_str().unwrap(), "pi_8");

    // Shopping continues in another tab while the payment is in flight.
    client.add(mug, 3).await;
    client.add(tee, 1).await;

    assert_eq!(ctx.deliver(&checkout_completed("evt_1", &session)).await, StatusCode::OK);

    let (_, cart) = client.get("/api/cart").await;
    let items = cart["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    let quantity = |sku: &str| {
        items
            .iter()
            .find(|item| item["sku"] == sku)
            .map(|item| item["quantity"].as_u64().unwrap())
    };
    assert_eq!(quantity("MUG-RED"), Some(3));
    assert_eq!(quantity("TEE-M"), Some(1));
}

#[tokio::test]
async fn test_completion_after_sign_in_clears_the_merged_cart() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let mug = ctx.seed_variant(2, "MUG-RED", "14.50", 10).await;

    // The user left a tee and a mug in their cart on an earlier visit.
    let user_owner = CartOwner::User(UserId::new(9));
    ctx.state.carts().add_item(&user_owner, tee, 1).await.unwrap();
    ctx.state.carts().add_item(&user_owner, mug, 1).await.unwrap();

    let mut client = ctx.client();
    client.add(tee, 2).await;
    let (_, body) = client.post("/api/cart/checkout", json!({})).await;
    let session = ctx.provider.pay(body["session_id"].as_str().unwrap(), "pi_9");

    let merged = client.sign_in(9).await;
    assert_eq!(merged["total_items"], 4);

    assert_eq!(ctx.deliver(&checkout_completed("evt_1", &session)).await, StatusCode::OK);

    let cart = ctx.state.carts().get_or_create_cart(&user_owner).await.unwrap();
    let tees: u32 = cart
        .items
        .iter()
        .filter(|item| item.variant_id == tee)
        .map(|item| item.quantity)
        .sum();
    assert_eq!(tees, 1);
    assert_eq!(cart.totals().total_items, 2);
}

#[tokio::test]
async fn test_completion_for_a_deleted_cart_still_pays() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let mut client = ctx.client();
    client.add(tee, 1).await;
    let (_, body) = client.post("/api/cart/checkout", json!({})).await;
    let session = ctx.provider.pay(body["session_id"].as_str().unwrap(), "pi_10");

    let metadata = CheckoutMetadata::from_pairs(&session.metadata).unwrap();
    let removed = ctx
        .store
        .remove_purchased(CartId::new(9_999), &metadata.manifest.purchased())
        .await
        .unwrap();
    assert!(removed.is_none());

    assert_eq!(ctx.deliver(&checkout_completed("evt_1", &session)).await, StatusCode::OK);
    let order = order_for(&ctx, &session.id).await;
    assert_eq!(order.payment_status, OrderPaymentStatus::Paid);
}

#[tokio::test]
async fn test_replayed_completion_changes_nothing() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let session = paid_session(&ctx, tee).await;
    let event = checkout_completed("evt_1", &session);

    assert_eq!(ctx.deliver(&event).await, StatusCode::OK);
    assert_eq!(ctx.deliver(&event).await, StatusCode::OK);

    assert_eq!(ctx.store.stock(tee).await, Some(8));
    assert_eq!(ctx.store.payment_count().await, 1);

    let order = order_for(&ctx, &session.id).await;
    let payment = payment_for(&ctx, order.id).await;
    assert_eq!(payment.status, PaymentStatus::Succeeded);
    let logs = ctx.store.payment_logs(payment.id).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].payload["id"], "evt_1");
    assert_eq!(ctx.observer.count("order_paid"), 1);
}

#[tokio::test]
async fn test_concurrent_duplicate_deliveries_decrement_once() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let session = paid_session(&ctx, tee).await;
    let event = checkout_completed("evt_1", &session);

    let (a, b, c) = tokio::join!(ctx.deliver(&event), ctx.deliver(&event), ctx.deliver(&event));
    assert_eq!((a, b, c), (StatusCode::OK, StatusCode::OK, StatusCode::OK));

    assert_eq!(ctx.store.stock(tee).await, Some(8));
    assert_eq!(ctx.store.payment_count().await, 1);
    assert_eq!(ctx.observer.count("order_created"), 1);
}

#[tokio::test]
async fn test_oversold_stock_clamps_at_zero() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let session = paid_session(&ctx, tee).await;

    // Someone else bought most of the stock between checkout and payment.
    ctx.store.set_stock(tee, 1).await;
    ctx.deliver(&checkout_completed("evt_1", &session)).await;

    assert_eq!(ctx.store.stock(tee).await, Some(0));
    let order = order_for(&ctx, &session.id).await;
    assert_eq!(order.payment_status, OrderPaymentStatus::Paid);
}

#[tokio::test]
async fn test_completion_without_manifest_is_dropped() {
    let ctx = TestContext::new();
    let session = ProviderSession {
        id: "cs_foreign".to_string(),
        payment_status: Some("paid".to_string()),
        ..ProviderSession::default()
    };

    let status = ctx.deliver(&checkout_completed("evt_1", &session)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(ctx.store.find_order_by_session("cs_foreign").await.unwrap().is_none());
    assert_eq!(ctx.store.payment_count().await, 0);
}

#[tokio::test]
async fn test_completion_for_cancelled_order_keeps_it_cancelled() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let order = unpaid_order(&ctx, "cs_cancelled", tee).await;
    ctx.state
        .orders()
        .cancel(order.id, Some(UserId::new(3)))
        .await
        .unwrap();

    let session = ProviderSession {
        id: "cs_cancelled".to_string(),
        payment_status: Some("paid".to_string()),
        ..ProviderSession::default()
    };
    let status = ctx.deliver(&checkout_completed("evt_1", &session)).await;
    assert_eq!(status, StatusCode::OK);

    let order = order_for(&ctx, "cs_cancelled").await;
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.payment_status, OrderPaymentStatus::Cancelled);
    assert_eq!(ctx.store.stock(tee).await, Some(10));
}

// ============================================================================
// payment_intent.succeeded and charge.failed
// ============================================================================

#[tokio::test]
async fn test_intent_succeeded_records_charge() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let session = paid_session(&ctx, tee).await;
    ctx.deliver(&checkout_completed("evt_1", &session)).await;

    let status = ctx.deliver(&intent_succeeded("evt_2", "pi_1", "ch_1")).await;
    assert_eq!(status, StatusCode::OK);

    let order = order_for(&ctx, &session.id).await;
    let payment = payment_for(&ctx, order.id).await;
    assert_eq!(payment.charge_id.as_deref(), Some("ch_1"));
    assert_eq!(payment.status, PaymentStatus::Succeeded);

    let status = ctx.deliver(&intent_succeeded("evt_3", "pi_unknown", "ch_x")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ctx.store.payment_count().await, 1);
}

#[tokio::test]
async fn test_intent_succeeded_before_completion_is_dropped() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let session = paid_session(&ctx, tee).await;

    assert_eq!(
        ctx.deliver(&intent_succeeded("evt_2", "pi_1", "ch_1")).await,
        StatusCode::OK
    );
    assert_eq!(ctx.store.payment_count().await, 0);

    ctx.deliver(&checkout_completed("evt_1", &session)).await;
    let order = order_for(&ctx, &session.id).await;
    assert_eq!(order.payment_status, OrderPaymentStatus::Paid);
}

#[tokio::test]
async fn test_charge_failed_after_payment_keeps_paid_state() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let session = paid_session(&ctx, tee).await;
    ctx.deliver(&checkout_completed("evt_1", &session)).await;
    ctx.deliver(&intent_succeeded("evt_2", "pi_1", "ch_1")).await;

    let status = ctx
        .deliver(&charge_failed("evt_3", "ch_1", "card_declined"))
        .await;
    assert_eq!(status, StatusCode::OK);

    let order = order_for(&ctx, &session.id).await;
    assert_eq!(order.payment_status, OrderPaymentStatus::Paid);
    let payment = payment_for(&ctx, order.id).await;
    assert_eq!(payment.status, PaymentStatus::Succeeded);

    let logs = ctx.store.payment_logs(payment.id).await.unwrap();
    assert_eq!(logs.len(), 3);
    assert!(logs[2].message.contains("card_declined"));
    assert_eq!(ctx.observer.count("payment_failed"), 0);
}

#[tokio::test]
async fn test_charge_failed_for_unknown_charge_is_noop() {
    let ctx = TestContext::new();
    let status = ctx
        .deliver(&charge_failed("evt_1", "ch_missing", "card_declined"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ctx.store.payment_count().await, 0);
}

#[tokio::test]
async fn test_charge_failed_cascades_then_payment_can_recover() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let order = unpaid_order(&ctx, "cs_retry", tee).await;
    let now = Utc::now();
    ctx.store
        .put_payment(Payment {
            id: PaymentId::new(0),
            order_id: order.id,
            amount: order.total,
            currency: CurrencyCode::Usd,
            method: PaymentMethod::Stripe,
            status: PaymentStatus::Processing,
            provider_session_id: Some("cs_retry".to_string()),
            payment_intent_id: Some("pi_retry".to_string()),
            charge_id: Some("ch_retry".to_string()),
            completed_at: None,
            created_at: now,
            updated_at: now,
        })
        .await;

    ctx.deliver(&charge_failed("evt_1", "ch_retry", "insufficient_funds"))
        .await;

    let failed = order_for(&ctx, "cs_retry").await;
    assert_eq!(failed.payment_status, OrderPaymentStatus::Failed);
    assert_eq!(payment_for(&ctx, order.id).await.status, PaymentStatus::Failed);
    assert_eq!(ctx.observer.count("payment_failed"), 1);

    // A second attempt on the same session succeeds.
    let session = ProviderSession {
        id: "cs_retry".to_string(),
        payment_status: Some("paid".to_string()),
        payment_intent: Some("pi_retry".to_string()),
        ..ProviderSession::default()
    };
    ctx.deliver(&checkout_completed("evt_2", &session)).await;

    let paid = order_for(&ctx, "cs_retry").await;
    assert_eq!(paid.payment_status, OrderPaymentStatus::Paid);
    assert_eq!(paid.status, OrderStatus::Confirmed);
    assert_eq!(payment_for(&ctx, order.id).await.status, PaymentStatus::Succeeded);
    assert_eq!(ctx.store.payment_count().await, 1);
    assert_eq!(ctx.store.stock(tee).await, Some(9));
}

// ============================================================================
// Webhook authentication
// ============================================================================

#[tokio::test]
async fn test_unsigned_or_tampered_deliveries_are_rejected() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let session = paid_session(&ctx, tee).await;
    let body = serde_json::to_vec(&checkout_completed("evt_1", &session)).unwrap();

    assert_eq!(post_raw(&ctx, &body, None).await, StatusCode::BAD_REQUEST);

    let signature = sign(b"something else", Utc::now().timestamp());
    assert_eq!(
        post_raw(&ctx, &body, Some(signature)).await,
        StatusCode::BAD_REQUEST
    );

    let stale = sign(&body, Utc::now().timestamp() - 3_600);
    assert_eq!(post_raw(&ctx, &body, Some(stale)).await, StatusCode::BAD_REQUEST);

    assert!(ctx.store.find_order_by_session(&session.id).await.unwrap().is_none());
    assert_eq!(ctx.store.stock(tee).await, Some(10));
}

#[tokio::test]
async fn test_signed_garbage_is_rejected_and_unknown_kinds_ignored() {
    let ctx = TestContext::new();

    let garbage = br#"{"hello":"world"}"#;
    let signature = sign(garbage, Utc::now().timestamp());
    assert_eq!(
        post_raw(&ctx, garbage, Some(signature)).await,
        StatusCode::BAD_REQUEST
    );

    let unknown = json!({
        "id": "evt_9",
        "type": "customer.created",
        "data": { "object": { "id": "cus_1" } }
    });
    assert_eq!(ctx.deliver(&unknown).await, StatusCode::OK);
}

// ============================================================================
// Status queries and recovery
// ============================================================================

#[tokio::test]
async fn test_status_before_payment_has_no_order() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let mut client = ctx.client();
    client.add(tee, 1).await;
    let (_, body) = client.post("/api/cart/checkout", json!({})).await;
    let session_id = body["session_id"].as_str().unwrap().to_string();

    let (status, view) = client
        .get(&format!("/api/payment/status?session_id={session_id}"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["session_id"], session_id);
    assert_eq!(view["provider_status"], "unpaid");
    assert_eq!(view["order_number"], Value::Null);
    assert_eq!(view["amount"], Value::Null);
}

#[tokio::test]
async fn test_status_recovers_failed_completion() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let session = paid_session(&ctx, tee).await;

    // The order is written, then the paid transition fails.
    ctx.store.fail_next_checkout_completion().await;
    assert_eq!(
        ctx.deliver(&checkout_completed("evt_1", &session)).await,
        StatusCode::OK
    );
    let stuck = order_for(&ctx, &session.id).await;
    assert_eq!(stuck.payment_status, OrderPaymentStatus::Unpaid);
    assert_eq!(ctx.store.stock(tee).await, Some(10));

    let mut client = ctx.client();
    let uri = format!("/api/payment/status?session_id={}", session.id);
    let (status, view) = client.get(&uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["provider_status"], "paid");
    assert_eq!(view["payment_status"], "paid");
    assert_eq!(view["order_status"], "confirmed");
    assert_eq!(view["order_number"], stuck.order_number);
    assert_eq!(money(&view["amount"]), Decimal::new(4000, 2));
    assert_eq!(ctx.store.stock(tee).await, Some(8));

    // Later queries and the provider's retry find nothing left to do.
    client.get(&uri).await;
    ctx.deliver(&checkout_completed("evt_1", &session)).await;
    assert_eq!(ctx.store.stock(tee).await, Some(8));
    assert_eq!(ctx.store.payment_count().await, 1);
}

#[tokio::test]
async fn test_status_recovers_lost_webhook() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let session = paid_session(&ctx, tee).await;

    let mut client = ctx.client();
    let (status, view) = client
        .get(&format!("/api/payment/status?session_id={}", session.id))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["payment_status"], "paid");

    let order = order_for(&ctx, &session.id).await;
    let payment = payment_for(&ctx, order.id).await;
    let logs = ctx.store.payment_logs(payment.id).await.unwrap();
    assert_eq!(logs[0].payload["source"], "status_query");
}

#[tokio::test]
async fn test_status_for_unknown_session_is_provider_error() {
    let ctx = TestContext::new();
    let mut client = ctx.client();
    let (status, body) = client.get("/api/payment/status?session_id=cs_nope").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["message"].as_str().unwrap().contains("cs_nope"));
}

#[tokio::test]
async fn test_return_pages_are_informational() {
    let ctx = TestContext::new();
    let mut client = ctx.client();

    let (status, body) = client.get("/checkout/success?session_id=cs_test_1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_id"], "cs_test_1");

    let (status, _) = client.get("/checkout/cancel").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ctx.store.payment_count().await, 0);
}

#[tokio::test]
async fn test_responses_carry_request_id() {
    let ctx = TestContext::new();
    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "req-123")
        .body(Body::empty())
        .unwrap();
    let response = ctx.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "req-123");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");
}
