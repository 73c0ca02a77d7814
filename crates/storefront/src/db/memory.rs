//! In-memory implementation of the stores.
//!
//! All state lives behind one async mutex, so each store call is atomic in
//! the same way a `PgStore` transaction is. Used by tests and local demos;
//! the seeding helpers at the bottom have no `PostgreSQL` counterpart.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use proshop_core::cart::{self, Cart, CartOwner, LineChange, LineItem, MergeStep, PurchaseStep};
use proshop_core::catalog::{self, StockDecrement, Variant};
use proshop_core::ledger::{
    self, NewOrder, Order, OrderItem, PaidTransition, Payment, PaymentLog, PaymentUpsert, Refund,
};
use proshop_core::{
    CartId, CartItemId, CommerceError, OrderId, OrderItemId, OrderPaymentStatus, OrderStatus,
    PaymentId, PaymentLogId, PaymentMethod, PaymentStatus, RefundId, RefundStatus, UserId,
    VariantId,
};

use super::{
    CartStore, CatalogStore, ChargeFailure, CheckoutCompletion, LedgerStore, RefundOutcome,
    RepositoryError,
};

#[derive(Default)]
struct State {
    next_id: i32,
    variants: BTreeMap<VariantId, Variant>,
    carts: BTreeMap<CartId, Cart>,
    /// Merged-away cart to the cart it was folded into.
    merged: BTreeMap<CartId, CartId>,
    orders: BTreeMap<OrderId, Order>,
    order_items: Vec<OrderItem>,
    payments: BTreeMap<PaymentId, Payment>,
    logs: Vec<PaymentLog>,
    refunds: BTreeMap<RefundId, Refund>,
    fail_next_completion: bool,
}

impl State {
    fn next_id(&mut self) -> i32 {
        self.next_id += 1;
        self.next_id
    }

    fn cart_mut(&mut self, id: CartId) -> Result<&mut Cart, RepositoryError> {
        self.carts
            .get_mut(&id)
            .ok_or(RepositoryError::Rule(CommerceError::NotFound("cart")))
    }

    /// The cart `id` names, or the one it was merged into.
    fn live_cart_id(&self, id: CartId) -> Option<CartId> {
        let mut current = id;
        for _ in 0..=self.merged.len() {
            if self.carts.contains_key(&current) {
                return Some(current);
            }
            current = *self.merged.get(&current)?;
        }
        None
    }

    fn order_mut(&mut self, id: OrderId) -> Result<&mut Order, RepositoryError> {
        self.orders
            .get_mut(&id)
            .ok_or(RepositoryError::Rule(CommerceError::NotFound("order")))
    }

    fn decrement(&mut self, id: VariantId, amount: u32) -> Option<StockDecrement> {
        let variant = self.variants.get_mut(&id)?;
        let result = catalog::decrement(id, variant.stock, amount);
        variant.stock = result.remaining;
        Some(result)
    }

    fn payment_id_where(&self, matches: impl Fn(&Payment) -> bool) -> Option<PaymentId> {
        self.payments.values().find(|p| matches(p)).map(|p| p.id)
    }

    fn payment_for_order(&self, order_id: OrderId) -> Option<&Payment> {
        self.payments.values().find(|p| p.order_id == order_id)
    }

    fn refunds_for_payment(&self, payment_id: PaymentId) -> Vec<Refund> {
        self.refunds
            .values()
            .filter(|r| r.payment_id == payment_id)
            .cloned()
            .collect()
    }

    fn append_log(
        &mut self,
        payment_id: PaymentId,
        status: PaymentStatus,
        message: String,
        payload: &serde_json::Value,
    ) {
        let id = PaymentLogId::new(self.next_id());
        self.logs.push(PaymentLog {
            id,
            payment_id,
            status,
            message,
            payload: payload.clone(),
            created_at: Utc::now(),
        });
    }

    fn transition_refund(
        &mut self,
        id: RefundId,
        apply: impl FnOnce(&mut Refund) -> Result<(), CommerceError>,
    ) -> Result<Refund, RepositoryError> {
        let refund = self
            .refunds
            .get_mut(&id)
            .ok_or(RepositoryError::Rule(CommerceError::NotFound("refund")))?;
        apply(refund)?;
        Ok(refund.clone())
    }
}

/// Store keeping everything in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

// =============================================================================
// Catalog
// =============================================================================

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn get_variant(&self, id: VariantId) -> Result<Option<Variant>, RepositoryError> {
        Ok(self.state.lock().await.variants.get(&id).cloned())
    }

    async fn get_variants(
        &self,
        ids: &[VariantId],
    ) -> Result<HashMap<VariantId, Variant>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.variants.get(id).map(|v| (*id, v.clone())))
            .collect())
    }

    async fn decrement_stock(
        &self,
        id: VariantId,
        amount: u32,
    ) -> Result<StockDecrement, RepositoryError> {
        self.state
            .lock()
            .await
            .decrement(id, amount)
            .ok_or(RepositoryError::Rule(CommerceError::NotFound("variant")))
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

// =============================================================================
// Cart
// =============================================================================

#[async_trait]
impl CartStore for MemoryStore {
    async fn get_or_create_cart(&self, owner: &CartOwner) -> Result<Cart, RepositoryError> {
        let mut state = self.state.lock().await;
        if let Some(cart) = state.carts.values().find(|c| &c.owner == owner) {
            return Ok(cart.clone());
        }

        let now = Utc::now();
        let cart = Cart {
            id: CartId::new(state.next_id()),
            owner: owner.clone(),
            items: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        state.carts.insert(cart.id, cart.clone());
        Ok(cart)
    }

    async fn find_cart(&self, owner: &CartOwner) -> Result<Option<Cart>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.carts.values().find(|c| &c.owner == owner).cloned())
    }

    async fn add_item(
        &self,
        cart_id: CartId,
        variant_id: VariantId,
        quantity: u32,
    ) -> Result<Cart, RepositoryError> {
        let mut state = self.state.lock().await;
        let variant = state.variants.get(&variant_id).cloned();
        let change = cart::plan_add(&state.cart_mut(cart_id)?.items, variant.as_ref(), quantity)?;
        let item_id = CartItemId::new(state.next_id());
        let cart = state.cart_mut(cart_id)?;
        apply_line_change(cart, change, item_id);
        Ok(cart.clone())
    }

    async fn update_item(
        &self,
        cart_id: CartId,
        item_id: CartItemId,
        quantity: u32,
    ) -> Result<Cart, RepositoryError> {
        let mut state = self.state.lock().await;
        let variant_id = state.cart_mut(cart_id)?.item(item_id).map(|item| item.variant_id);
        let variant = variant_id.and_then(|id| state.variants.get(&id).cloned());
        let cart = state.cart_mut(cart_id)?;
        let change = cart::plan_update(&cart.items, item_id, variant.as_ref(), quantity)?;
        apply_line_change(cart, change, item_id);
        Ok(cart.clone())
    }

    async fn remove_item(
        &self,
        cart_id: CartId,
        item_id: CartItemId,
    ) -> Result<Cart, RepositoryError> {
        let mut state = self.state.lock().await;
        let cart = state.cart_mut(cart_id)?;
        let before = cart.items.len();
        cart.items.retain(|item| item.id != item_id);
        if cart.items.len() == before {
            return Err(CommerceError::NotFound("cart item").into());
        }
        cart.updated_at = Utc::now();
        Ok(cart.clone())
    }

    async fn clear(&self, cart_id: CartId) -> Result<u64, RepositoryError> {
        let mut state = self.state.lock().await;
        let cart = state.cart_mut(cart_id)?;
        let removed = cart.items.len() as u64;
        cart.items.clear();
        cart.updated_at = Utc::now();
        Ok(removed)
    }

    async fn merge(&self, source: CartId, target: CartId) -> Result<Cart, RepositoryError> {
        let mut state = self.state.lock().await;
        state.cart_mut(target)?;
        if source == target {
            return Ok(state.cart_mut(target)?.clone());
        }
        let source_cart = state
            .carts
            .remove(&source)
            .ok_or(RepositoryError::Rule(CommerceError::NotFound("cart")))?;
        state.merged.insert(source, target);

        let cart = state.cart_mut(target)?;
        for step in cart::plan_merge(&source_cart.items, &cart.items) {
            match step {
                MergeStep::Increase { target, quantity } => {
                    if let Some(item) = cart.items.iter_mut().find(|i| i.id == target) {
                        item.quantity = quantity;
                    }
                }
                MergeStep::Move { source } => {
                    if let Some(item) = source_cart.items.iter().find(|i| i.id == source) {
                        cart.items.push(item.clone());
                    }
                }
            }
        }
        cart.updated_at = Utc::now();
        Ok(cart.clone())
    }

    async fn remove_purchased(
        &self,
        cart_id: CartId,
        purchased: &[(VariantId, u32)],
    ) -> Result<Option<Cart>, RepositoryError> {
        let mut state = self.state.lock().await;
        let Some(live) = state.live_cart_id(cart_id) else {
            return Ok(None);
        };
        let cart = state.cart_mut(live)?;
        for step in cart::plan_remove_purchased(&cart.items, purchased) {
            match step {
                PurchaseStep::Remove { item_id } => cart.items.retain(|i| i.id != item_id),
                PurchaseStep::Reduce { item_id, quantity } => {
                    if let Some(item) = cart.items.iter_mut().find(|i| i.id == item_id) {
                        item.quantity = quantity;
                    }
                }
            }
        }
        cart.updated_at = Utc::now();
        Ok(Some(cart.clone()))
    }
}

/// Apply a planned cart change; `new_id` names the line if one is inserted.
fn apply_line_change(cart: &mut Cart, change: LineChange, new_id: CartItemId) {
    match change {
        LineChange::Insert {
            variant_id,
            sku,
            name,
            quantity,
            unit_price,
        } => cart.items.push(LineItem {
            id: new_id,
            variant_id,
            sku,
            name,
            quantity,
            unit_price,
            added_at: Utc::now(),
        }),
        LineChange::SetQuantity { item_id, quantity } => {
            if let Some(item) = cart.items.iter_mut().find(|i| i.id == item_id) {
                item.quantity = quantity;
            }
        }
    }
    cart.updated_at = Utc::now();
}

// =============================================================================
// Ledger
// =============================================================================

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn create_order(&self, new: &NewOrder) -> Result<(Order, bool), RepositoryError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .orders
            .values()
            .find(|o| o.provider_session_id.as_deref() == Some(new.provider_session_id.as_str()))
        {
            return Ok((existing.clone(), false));
        }

        let now = Utc::now();
        let order = Order {
            id: OrderId::new(state.next_id()),
            order_number: new.order_number.clone(),
            user_id: new.user_id,
            email: new.email.clone(),
            status: OrderStatus::Pending,
            payment_status: OrderPaymentStatus::Unpaid,
            provider_session_id: Some(new.provider_session_id.clone()),
            subtotal: new.subtotal,
            shipping_cost: new.shipping_cost,
            tax: new.tax,
            total: new.total,
            shipping_address: new.shipping_address.clone(),
            billing_address: new.billing_address.clone(),
            tracking_number: None,
            created_at: now,
            updated_at: now,
        };
        for item in &new.items {
            let id = OrderItemId::new(state.next_id());
            state.order_items.push(OrderItem {
                id,
                order_id: order.id,
                product_id: item.product_id,
                variant_id: item.variant_id,
                sku: item.sku.clone(),
                name: item.name.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
                discount: item.discount,
            });
        }
        state.orders.insert(order.id, order.clone());
        Ok((order, true))
    }

    async fn find_order_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<Order>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .find(|o| o.provider_session_id.as_deref() == Some(session_id))
            .cloned())
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>, RepositoryError> {
        Ok(self.state.lock().await.orders.get(&id).cloned())
    }

    async fn find_order_by_number(
        &self,
        order_number: &str,
    ) -> Result<Option<Order>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .find(|o| o.order_number == order_number)
            .cloned())
    }

    async fn order_items(&self, id: OrderId) -> Result<Vec<OrderItem>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .order_items
            .iter()
            .filter(|item| item.order_id == id)
            .cloned()
            .collect())
    }

    async fn list_orders(&self, user: UserId) -> Result<Vec<Order>, RepositoryError> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.user_id == Some(user))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(orders)
    }

    async fn complete_checkout(
        &self,
        upsert: &PaymentUpsert,
        payload: &serde_json::Value,
    ) -> Result<CheckoutCompletion, RepositoryError> {
        let mut state = self.state.lock().await;
        if std::mem::take(&mut state.fail_next_completion) {
            return Err(RepositoryError::Database(sqlx::Error::PoolTimedOut));
        }

        let now = Utc::now();
        let mut order = state.order_mut(upsert.order_id)?.clone();
        let transition = order.mark_paid(now)?;

        let mut decrements = Vec::new();
        if transition == PaidTransition::Applied {
            let mut takes: Vec<(VariantId, u32)> = state
                .order_items
                .iter()
                .filter(|item| item.order_id == order.id)
                .filter_map(|item| item.variant_id.map(|v| (v, item.quantity)))
                .collect();
            takes.sort_unstable();
            for (variant_id, quantity) in takes {
                if let Some(result) = state.decrement(variant_id, quantity) {
                    decrements.push(result);
                }
            }
            state.orders.insert(order.id, order.clone());
        }

        let payment_id = match state.payment_for_order(order.id).map(|p| p.id) {
            Some(id) => id,
            None => {
                let id = PaymentId::new(state.next_id());
                state.payments.insert(
                    id,
                    Payment {
                        id,
                        order_id: order.id,
                        amount: upsert.amount,
                        currency: upsert.currency,
                        method: PaymentMethod::Stripe,
                        status: PaymentStatus::Pending,
                        provider_session_id: None,
                        payment_intent_id: None,
                        charge_id: None,
                        completed_at: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
                id
            }
        };
        let payment = state
            .payments
            .get_mut(&payment_id)
            .ok_or(RepositoryError::NotFound)?;
        payment.status = PaymentStatus::Succeeded;
        payment.provider_session_id = Some(upsert.provider_session_id.clone());
        if upsert.payment_intent_id.is_some() {
            payment.payment_intent_id.clone_from(&upsert.payment_intent_id);
        }
        payment.completed_at.get_or_insert(upsert.completed_at);
        payment.updated_at = now;
        let payment = payment.clone();

        let message = match transition {
            PaidTransition::Applied => "checkout session completed",
            PaidTransition::AlreadyPaid => "checkout session completed (replay)",
        };
        state.append_log(payment.id, payment.status, message.to_string(), payload);

        Ok(CheckoutCompletion {
            order,
            payment,
            transition,
            decrements,
        })
    }

    async fn apply_intent_succeeded(
        &self,
        intent_id: &str,
        charge_id: Option<String>,
        payload: &serde_json::Value,
    ) -> Result<Option<Payment>, RepositoryError> {
        let mut state = self.state.lock().await;
        let Some(id) =
            state.payment_id_where(|p| p.payment_intent_id.as_deref() == Some(intent_id))
        else {
            return Ok(None);
        };
        let payment = state.payments.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        let message = if payment.mark_succeeded(charge_id, Utc::now()) {
            "payment intent succeeded".to_string()
        } else {
            format!("payment intent succeeded ignored: payment is {}", payment.status)
        };
        let payment = payment.clone();
        state.append_log(payment.id, payment.status, message, payload);
        Ok(Some(payment))
    }

    async fn apply_charge_failed(
        &self,
        charge_id: &str,
        reason: &str,
        payload: &serde_json::Value,
    ) -> Result<Option<ChargeFailure>, RepositoryError> {
        let mut state = self.state.lock().await;
        let Some(id) = state.payment_id_where(|p| p.charge_id.as_deref() == Some(charge_id)) else {
            return Ok(None);
        };
        let now = Utc::now();

        let payment = state.payments.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        let payment_changed = payment.mark_failed(now);
        let payment = payment.clone();

        let order = state.order_mut(payment.order_id)?;
        let order_changed = order.mark_payment_failed(now);
        let order = order.clone();

        state.append_log(
            payment.id,
            PaymentStatus::Failed,
            format!("charge failed: {reason}"),
            payload,
        );
        Ok(Some(ChargeFailure {
            payment,
            order,
            applied: payment_changed || order_changed,
        }))
    }

    async fn cancel_order(
        &self,
        id: OrderId,
        actor: Option<UserId>,
    ) -> Result<Order, RepositoryError> {
        let mut state = self.state.lock().await;
        let order = state.order_mut(id)?;
        order.cancel(actor, Utc::now())?;
        Ok(order.clone())
    }

    async fn payment_for_order(&self, id: OrderId) -> Result<Option<Payment>, RepositoryError> {
        Ok(self.state.lock().await.payment_for_order(id).cloned())
    }

    async fn payment_logs(&self, id: PaymentId) -> Result<Vec<PaymentLog>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .logs
            .iter()
            .filter(|log| log.payment_id == id)
            .cloned()
            .collect())
    }

    async fn request_refund(
        &self,
        order_id: OrderId,
        amount: Decimal,
        reason: &str,
    ) -> Result<Refund, RepositoryError> {
        let mut state = self.state.lock().await;
        let payment = state
            .payment_for_order(order_id)
            .cloned()
            .ok_or(RepositoryError::Rule(CommerceError::NotFound("payment")))?;
        let refunds = state.refunds_for_payment(payment.id);
        ledger::validate_refund_request(&payment, &refunds, amount)?;

        let now = Utc::now();
        let refund = Refund {
            id: RefundId::new(state.next_id()),
            order_id,
            payment_id: payment.id,
            amount,
            reason: reason.to_string(),
            status: RefundStatus::Requested,
            refund_transaction_id: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        };
        state.refunds.insert(refund.id, refund.clone());
        Ok(refund)
    }

    async fn list_refunds(&self, order_id: OrderId) -> Result<Vec<Refund>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .refunds
            .values()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn approve_refund(&self, id: RefundId) -> Result<Refund, RepositoryError> {
        let mut state = self.state.lock().await;
        state.transition_refund(id, |r| r.approve(Utc::now()))
    }

    async fn reject_refund(&self, id: RefundId) -> Result<Refund, RepositoryError> {
        let mut state = self.state.lock().await;
        state.transition_refund(id, |r| r.reject(Utc::now()))
    }

    async fn process_refund(
        &self,
        id: RefundId,
        transaction_id: &str,
    ) -> Result<RefundOutcome, RepositoryError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let refund = state.transition_refund(id, |r| r.process(transaction_id.to_string(), now))?;

        let payment = state
            .payment_for_order(refund.order_id)
            .cloned()
            .ok_or(RepositoryError::Rule(CommerceError::NotFound("payment")))?;
        let refunds = state.refunds_for_payment(payment.id);
        let fully_refunded = ledger::is_fully_refunded(payment.amount, &refunds);

        if fully_refunded && payment.status != PaymentStatus::Refunded {
            if let Some(p) = state.payments.get_mut(&payment.id) {
                p.mark_refunded(now);
            }
            state.order_mut(refund.order_id)?.mark_refunded(now);
            state.append_log(
                payment.id,
                PaymentStatus::Refunded,
                format!("fully refunded by {transaction_id}"),
                &serde_json::Value::Null,
            );
        }

        Ok(RefundOutcome {
            refund,
            fully_refunded,
        })
    }
}

// =============================================================================
// Seeding and inspection
// =============================================================================

impl MemoryStore {
    /// Insert or replace a catalog variant.
    pub async fn put_variant(&self, variant: Variant) {
        self.state.lock().await.variants.insert(variant.id, variant);
    }

    /// Change a variant's live price.
    pub async fn set_price(&self, id: VariantId, price: Decimal) {
        if let Some(v) = self.state.lock().await.variants.get_mut(&id) {
            v.price = price;
        }
    }

    /// Change a variant's live stock.
    pub async fn set_stock(&self, id: VariantId, stock: u32) {
        if let Some(v) = self.state.lock().await.variants.get_mut(&id) {
            v.stock = stock;
        }
    }

    /// Live stock of a variant.
    pub async fn stock(&self, id: VariantId) -> Option<u32> {
        self.state.lock().await.variants.get(&id).map(|v| v.stock)
    }

    /// Whether a cart with this ID still exists.
    pub async fn cart_exists(&self, id: CartId) -> bool {
        self.state.lock().await.carts.contains_key(&id)
    }

    /// Number of payment rows.
    pub async fn payment_count(&self) -> usize {
        self.state.lock().await.payments.len()
    }

    /// Insert a payment as-is (e.g. a pending payment with a known charge).
    ///
    /// The payment's `id` is replaced with a fresh one, which is returned.
    pub async fn put_payment(&self, mut payment: Payment) -> PaymentId {
        let mut state = self.state.lock().await;
        payment.id = PaymentId::new(state.next_id());
        let id = payment.id;
        state.payments.insert(id, payment);
        id
    }

    /// Overwrite an order's fulfillment status.
    pub async fn set_order_status(&self, id: OrderId, status: OrderStatus) {
        if let Some(order) = self.state.lock().await.orders.get_mut(&id) {
            order.status = status;
        }
    }

    /// Make the next `complete_checkout` call fail with a database error.
    pub async fn fail_next_checkout_completion(&self) {
        self.state.lock().await.fail_next_completion = true;
    }
}
