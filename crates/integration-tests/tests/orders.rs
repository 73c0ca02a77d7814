//! Order history, cancellation and refunds.

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use axum::http::StatusCode;
use rust_decimal::Decimal;
use serde_json::{Value, json};

use proshop_core::ledger::{AddressSnapshot, NewOrder, NewOrderItem, Order};
use proshop_core::{Email, OrderStatus, ProductId, RefundId, UserId, VariantId};
use proshop_integration_tests::{TestClient, TestContext, checkout_completed, money};
use proshop_storefront::db::LedgerStore;

/// Buy two of `variant` as the signed-in `client` and deliver the webhook.
async fn buy(ctx: &TestContext, client: &mut TestClient, variant: VariantId) -> Order {
    client.add(variant, 2).await;
    let (status, body) = client.post("/api/cart/checkout", json!({})).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let session_id = body["session_id"].as_str().unwrap();
    let session = ctx.provider.pay(session_id, &format!("pi_{session_id}"));
    assert_eq!(
        ctx.deliver(&checkout_completed(&format!("evt_{session_id}"), &session))
            .await,
        StatusCode::OK
    );
    ctx.store
        .find_order_by_session(session_id)
        .await
        .unwrap()
        .unwrap()
}

/// A pending, unpaid order owned by `user`.
async fn pending_order(ctx: &TestContext, user: i32, variant: VariantId) -> Order {
    let (order, _) = ctx
        .store
        .create_order(&NewOrder {
            order_number: format!("ORD-PENDING-{user}"),
            user_id: Some(UserId::new(user)),
            email: Email::parse(&format!("user{user}@example.com")).ok(),
            provider_session_id: format!("cs_pending_{user}"),
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
        })
        .await
        .unwrap();
    order
}

fn refund_id(body: &Value) -> RefundId {
    RefundId::new(i32::try_from(body["id"].as_i64().unwrap()).unwrap())
}

// ============================================================================
// History and detail
// ============================================================================

#[tokio::test]
async fn test_order_routes_require_sign_in() {
    let ctx = TestContext::new();
    let mut client = ctx.client();

    let (status, body) = client.get("/api/orders").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let (status, _) = client.post("/api/orders/1/cancel", json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = client
        .post("/api/orders/1/refunds", json!({ "amount": "1.00" }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = client.get("/api/orders/number/ORD-20250101-00000000").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_history_lists_own_orders_newest_first() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let mut alice = ctx.client();
    alice.sign_in(7).await;
    let first = buy(&ctx, &mut alice, tee).await;
    let second = buy(&ctx, &mut alice, tee).await;

    let (status, body) = alice.get("/api/orders").await;
    assert_eq!(status, StatusCode::OK);
    let orders = body.as_array().unwrap();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0]["order_number"], second.order_number);
    assert_eq!(orders[1]["order_number"], first.order_number);
    assert_eq!(orders[0]["email"], "user7@example.com");

    let mut bob = ctx.client();
    bob.sign_in(8).await;
    let (status, body) = bob.get("/api/orders").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_order_detail_and_ownership() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let mut alice = ctx.client();
    alice.sign_in(7).await;
    let order = buy(&ctx, &mut alice, tee).await;
    let uri = format!("/api/orders/{}", order.id);

    let (status, body) = alice.get(&uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["order_number"], order.order_number);
    assert_eq!(body["status"], "confirmed");
    assert_eq!(body["payment_status"], "paid");
    assert_eq!(money(&body["total"]), Decimal::new(4000, 2));
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
    assert_eq!(body["items"][0]["quantity"], 2);
    assert_eq!(body["payment"]["status"], "succeeded");
    assert_eq!(body["refunds"], json!([]));

    let mut bob = ctx.client();
    bob.sign_in(8).await;
    let (status, _) = bob.get(&uri).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = alice.get("/api/orders/999999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_order_lookup_by_number() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let mut alice = ctx.client();
    alice.sign_in(7).await;
    let order = buy(&ctx, &mut alice, tee).await;
    let uri = format!("/api/orders/number/{}", order.order_number);

    let (status, body) = alice.get(&uri).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["id"], order.id.as_i32());
    assert_eq!(body["order_number"], order.order_number);
    assert_eq!(body["items"][0]["sku"], "TEE-M");
    assert_eq!(body["payment"]["status"], "succeeded");

    let mut bob = ctx.client();
    bob.sign_in(8).await;
    let (status, _) = bob.get(&uri).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = alice.get("/api/orders/number/ORD-19990101-DEADBEEF").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_pending_order() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let order = pending_order(&ctx, 3, tee).await;
    let mut client = ctx.client();
    client.sign_in(3).await;
    let uri = format!("/api/orders/{}/cancel", order.id);

    let (status, body) = client.post(&uri, json!({})).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["payment_status"], "cancelled");
    assert_eq!(ctx.observer.count("order_cancelled"), 1);

    let (status, _) = client.post(&uri, json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_cancel_confirmed_order_keeps_stock_taken() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let mut client = ctx.client();
    client.sign_in(7).await;
    let order = buy(&ctx, &mut client, tee).await;
    assert_eq!(ctx.store.stock(tee).await, Some(8));

    let (status, body) = client
        .post(&format!("/api/orders/{}/cancel", order.id), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
    assert_eq!(ctx.store.stock(tee).await, Some(8));
}

#[tokio::test]
async fn test_cancel_rejected_after_shipping_or_for_others() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let order = pending_order(&ctx, 3, tee).await;
    let uri = format!("/api/orders/{}/cancel", order.id);

    let mut other = ctx.client();
    other.sign_in(4).await;
    let (status, _) = other.post(&uri, json!({})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    ctx.store.set_order_status(order.id, OrderStatus::Shipped).await;
    let mut owner = ctx.client();
    owner.sign_in(3).await;
    let (status, body) = owner.post(&uri, json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("shipped"));

    let stored = ctx.store.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Shipped);
    assert_eq!(ctx.observer.count("order_cancelled"), 0);
}

// ============================================================================
// Refunds
// ============================================================================

#[tokio::test]
async fn test_partial_then_full_refund() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let mut client = ctx.client();
    client.sign_in(7).await;
    let order = buy(&ctx, &mut client, tee).await;
    let uri = format!("/api/orders/{}/refunds", order.id);
    let orders = ctx.state.orders();

    let (status, body) = client
        .post(&uri, json!({ "amount": "50.00", "reason": "too much" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(money(&body["refundable"]), Decimal::new(4000, 2));

    let (status, body) = client.post(&uri, json!({ "amount": "0" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    // First half.
    let (status, body) = client
        .post(&uri, json!({ "amount": "15.00", "reason": "one was torn" }))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["status"], "requested");
    let first = refund_id(&body);
    orders.approve_refund(first).await.unwrap();
    let outcome = orders.process_refund(first, "re_1").await.unwrap();
    assert!(!outcome.fully_refunded);

    let stored = ctx.store.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(
        stored.payment_status,
        proshop_core::OrderPaymentStatus::Paid
    );

    // The rest.
    let (status, body) = client.post(&uri, json!({ "amount": "25.00" })).await;
    assert_eq!(status, StatusCode::CREATED);
    let second = refund_id(&body);

    let (status, body) = client.post(&uri, json!({ "amount": "1.00" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(money(&body["refundable"]), Decimal::ZERO);

    orders.approve_refund(second).await.unwrap();
    let outcome = orders.process_refund(second, "re_2").await.unwrap();
    assert!(outcome.fully_refunded);
    assert_eq!(outcome.refund.refund_transaction_id.as_deref(), Some("re_2"));

    let (_, detail) = client.get(&format!("/api/orders/{}", order.id)).await;
    assert_eq!(detail["payment_status"], "refunded");
    assert_eq!(detail["payment"]["status"], "refunded");
    assert_eq!(detail["refunds"].as_array().unwrap().len(), 2);
    assert_eq!(ctx.observer.count("refund_requested"), 2);
    assert_eq!(ctx.observer.count("order_refunded"), 1);
}

#[tokio::test]
async fn test_rejected_refund_releases_amount() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let mut client = ctx.client();
    client.sign_in(7).await;
    let order = buy(&ctx, &mut client, tee).await;
    let uri = format!("/api/orders/{}/refunds", order.id);
    let orders = ctx.state.orders();

    let (_, body) = client.post(&uri, json!({ "amount": "40.00" })).await;
    let refund = refund_id(&body);
    orders.reject_refund(refund).await.unwrap();
    assert!(orders.process_refund(refund, "re_x").await.is_err());
    assert!(orders.approve_refund(refund).await.is_err());

    let (status, _) = client.post(&uri, json!({ "amount": "40.00" })).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_refund_requires_paid_order_owned_by_caller() {
    let ctx = TestContext::new();
    let tee = ctx.seed_variant(1, "TEE-M", "20.00", 10).await;
    let mut alice = ctx.client();
    alice.sign_in(7).await;
    let order = buy(&ctx, &mut alice, tee).await;

    let mut bob = ctx.client();
    bob.sign_in(8).await;
    let (status, _) = bob
        .post(
            &format!("/api/orders/{}/refunds", order.id),
            json!({ "amount": "5.00" }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let unpaid = pending_order(&ctx, 8, tee).await;
    let (status, _) = bob
        .post(
            &format!("/api/orders/{}/refunds", unpaid.id),
            json!({ "amount": "5.00" }),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(ctx.observer.count("refund_requested"), 0);
}
