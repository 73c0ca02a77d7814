//! `PostgreSQL` implementation of the stores.
//!
//! Queries are checked at runtime (`query_as` + `FromRow`). Every mutation
//! runs in a transaction that locks the rows it reads with `FOR UPDATE`, then
//! asks `proshop_core` what to change before writing.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};

use proshop_core::cart::{self, Cart, CartOwner, LineChange, LineItem, MergeStep, PurchaseStep};
use proshop_core::catalog::{self, StockDecrement, Variant};
use proshop_core::ledger::{
    self, AddressSnapshot, NewOrder, Order, OrderItem, PaidTransition, Payment, PaymentLog,
    PaymentUpsert, Refund,
};
use proshop_core::{
    CartId, CartItemId, CommerceError, CurrencyCode, Email, OrderId, OrderItemId, PaymentId,
    PaymentLogId, PaymentMethod, PaymentStatus, ProductId, RefundId, SessionToken, UserId,
    VariantId,
};

use super::{
    CartStore, CatalogStore, ChargeFailure, CheckoutCompletion, LedgerStore, RefundOutcome,
    RepositoryError, to_count, to_db_int,
};

const CART_COLUMNS: &str = "id, user_id, session_key, created_at, updated_at";

/// Session carts merge into user carts, which never merge again.
const MAX_MERGE_HOPS: usize = 4;

const ORDER_COLUMNS: &str = "id, order_number, user_id, email, status, payment_status, \
     provider_session_id, subtotal, shipping_cost, tax, total, shipping_address, \
     billing_address, tracking_number, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, order_id, amount, currency, method, status, \
     provider_session_id, payment_intent_id, charge_id, completed_at, created_at, updated_at";

const REFUND_COLUMNS: &str = "id, order_id, payment_id, amount, reason, status, \
     refund_transaction_id, processed_at, created_at, updated_at";

/// Store backed by the storefront `PostgreSQL` database.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new store.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// =============================================================================
// Rows
// =============================================================================

fn parse_text<T: FromStr<Err = String>>(value: &str) -> Result<T, RepositoryError> {
    value.parse().map_err(RepositoryError::DataCorruption)
}

#[derive(FromRow)]
struct VariantRow {
    id: VariantId,
    product_id: ProductId,
    sku: String,
    name: String,
    price: Decimal,
    stock: i32,
    is_active: bool,
}

impl TryFrom<VariantRow> for Variant {
    type Error = RepositoryError;

    fn try_from(row: VariantRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            product_id: row.product_id,
            sku: row.sku,
            name: row.name,
            price: row.price,
            stock: to_count(row.stock, "stock")?,
            is_active: row.is_active,
        })
    }
}

#[derive(FromRow)]
struct CartRow {
    id: CartId,
    user_id: Option<UserId>,
    session_key: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CartRow {
    fn owner(&self) -> Result<CartOwner, RepositoryError> {
        match (self.user_id, &self.session_key) {
            (Some(user), None) => Ok(CartOwner::User(user)),
            (None, Some(token)) => Ok(CartOwner::Session(SessionToken::from_string(token.clone()))),
            _ => Err(RepositoryError::DataCorruption(format!(
                "cart {} must have exactly one owner",
                self.id
            ))),
        }
    }
}

#[derive(FromRow)]
struct LineRow {
    id: CartItemId,
    variant_id: VariantId,
    sku: String,
    name: String,
    quantity: i32,
    unit_price: Decimal,
    added_at: DateTime<Utc>,
}

impl TryFrom<LineRow> for LineItem {
    type Error = RepositoryError;

    fn try_from(row: LineRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            variant_id: row.variant_id,
            sku: row.sku,
            name: row.name,
            quantity: to_count(row.quantity, "quantity")?,
            unit_price: row.unit_price,
            added_at: row.added_at,
        })
    }
}

#[derive(FromRow)]
struct OrderRow {
    id: OrderId,
    order_number: String,
    user_id: Option<UserId>,
    email: Option<String>,
    status: String,
    payment_status: String,
    provider_session_id: Option<String>,
    subtotal: Decimal,
    shipping_cost: Decimal,
    tax: Decimal,
    total: Decimal,
    shipping_address: Json<AddressSnapshot>,
    billing_address: Json<AddressSnapshot>,
    tracking_number: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = RepositoryError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            order_number: row.order_number,
            user_id: row.user_id,
            email: row
                .email
                .as_deref()
                .map(Email::parse)
                .transpose()
                .map_err(|e| RepositoryError::DataCorruption(e.to_string()))?,
            status: parse_text(&row.status)?,
            payment_status: parse_text(&row.payment_status)?,
            provider_session_id: row.provider_session_id,
            subtotal: row.subtotal,
            shipping_cost: row.shipping_cost,
            tax: row.tax,
            total: row.total,
            shipping_address: row.shipping_address.0,
            billing_address: row.billing_address.0,
            tracking_number: row.tracking_number,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct OrderItemRow {
    id: OrderItemId,
    order_id: OrderId,
    product_id: ProductId,
    variant_id: Option<VariantId>,
    sku: String,
    name: String,
    quantity: i32,
    unit_price: Decimal,
    discount: Decimal,
}

impl TryFrom<OrderItemRow> for OrderItem {
    type Error = RepositoryError;

    fn try_from(row: OrderItemRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            product_id: row.product_id,
            variant_id: row.variant_id,
            sku: row.sku,
            name: row.name,
            quantity: to_count(row.quantity, "quantity")?,
            unit_price: row.unit_price,
            discount: row.discount,
        })
    }
}

#[derive(FromRow)]
struct PaymentRow {
    id: PaymentId,
    order_id: OrderId,
    amount: Decimal,
    currency: String,
    method: String,
    status: String,
    provider_session_id: Option<String>,
    payment_intent_id: Option<String>,
    charge_id: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = RepositoryError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            amount: row.amount,
            currency: parse_text::<CurrencyCode>(&row.currency)?,
            method: parse_text::<PaymentMethod>(&row.method)?,
            status: parse_text(&row.status)?,
            provider_session_id: row.provider_session_id,
            payment_intent_id: row.payment_intent_id,
            charge_id: row.charge_id,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct PaymentLogRow {
    id: PaymentLogId,
    payment_id: PaymentId,
    status: String,
    message: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<PaymentLogRow> for PaymentLog {
    type Error = RepositoryError;

    fn try_from(row: PaymentLogRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            payment_id: row.payment_id,
            status: parse_text(&row.status)?,
            message: row.message,
            payload: row.payload,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct RefundRow {
    id: RefundId,
    order_id: OrderId,
    payment_id: PaymentId,
    amount: Decimal,
    reason: String,
    status: String,
    refund_transaction_id: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RefundRow> for Refund {
    type Error = RepositoryError;

    fn try_from(row: RefundRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            payment_id: row.payment_id,
            amount: row.amount,
            reason: row.reason,
            status: parse_text(&row.status)?,
            refund_transaction_id: row.refund_transaction_id,
            processed_at: row.processed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, RepositoryError>
where
    T: TryFrom<R, Error = RepositoryError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// =============================================================================
// Shared statements
// =============================================================================

async fn fetch_variant(
    conn: &mut PgConnection,
    id: VariantId,
) -> Result<Option<Variant>, RepositoryError> {
    sqlx::query_as::<_, VariantRow>(
        r"
        SELECT id, product_id, sku, name, price, stock, is_active
        FROM storefront.variant
        WHERE id = $1
        ",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .map(Variant::try_from)
    .transpose()
}

/// Lock a variant's stock row and take `amount` from it.
///
/// Returns `None` if the variant no longer exists.
async fn decrement_in(
    conn: &mut PgConnection,
    id: VariantId,
    amount: u32,
) -> Result<Option<StockDecrement>, RepositoryError> {
    let stock: Option<i32> =
        sqlx::query_scalar("SELECT stock FROM storefront.variant WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
    let Some(stock) = stock else {
        return Ok(None);
    };

    let result = catalog::decrement(id, to_count(stock, "stock")?, amount);
    sqlx::query("UPDATE storefront.variant SET stock = $2, updated_at = now() WHERE id = $1")
        .bind(id)
        .bind(to_db_int(result.remaining)?)
        .execute(&mut *conn)
        .await?;
    Ok(Some(result))
}

async fn lock_cart(conn: &mut PgConnection, id: CartId) -> Result<CartRow, RepositoryError> {
    sqlx::query_as::<_, CartRow>(&format!(
        "SELECT {CART_COLUMNS} FROM storefront.cart WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(RepositoryError::Rule(CommerceError::NotFound("cart")))
}

async fn load_lines(conn: &mut PgConnection, id: CartId) -> Result<Vec<LineItem>, RepositoryError> {
    let rows = sqlx::query_as::<_, LineRow>(
        r"
        SELECT id, variant_id, sku, name, quantity, unit_price, added_at
        FROM storefront.cart_item
        WHERE cart_id = $1
        ORDER BY added_at, id
        ",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    convert_all(rows)
}

/// Lock the cart `id` names, following recorded merges if it was folded away.
async fn lock_live_cart(
    conn: &mut PgConnection,
    id: CartId,
) -> Result<Option<CartRow>, RepositoryError> {
    let mut current = id;
    for _ in 0..MAX_MERGE_HOPS {
        let row = sqlx::query_as::<_, CartRow>(&format!(
            "SELECT {CART_COLUMNS} FROM storefront.cart WHERE id = $1 FOR UPDATE"
        ))
        .bind(current)
        .fetch_optional(&mut *conn)
        .await?;
        if row.is_some() {
            return Ok(row);
        }

        let next = sqlx::query_scalar::<_, CartId>(
            "SELECT target_cart_id FROM storefront.cart_merge WHERE source_cart_id = $1",
        )
        .bind(current)
        .fetch_optional(&mut *conn)
        .await?;
        match next {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
    Ok(None)
}

async fn build_cart(conn: &mut PgConnection, row: CartRow) -> Result<Cart, RepositoryError> {
    let owner = row.owner()?;
    let items = load_lines(conn, row.id).await?;
    Ok(Cart {
        id: row.id,
        owner,
        items,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

async fn touch_cart(conn: &mut PgConnection, id: CartId) -> Result<CartRow, RepositoryError> {
    Ok(sqlx::query_as::<_, CartRow>(&format!(
        "UPDATE storefront.cart SET updated_at = now() WHERE id = $1 RETURNING {CART_COLUMNS}"
    ))
    .bind(id)
    .fetch_one(&mut *conn)
    .await?)
}

async fn apply_line_change(
    conn: &mut PgConnection,
    cart_id: CartId,
    change: LineChange,
) -> Result<(), RepositoryError> {
    match change {
        LineChange::Insert {
            variant_id,
            sku,
            name,
            quantity,
            unit_price,
        } => {
            sqlx::query(
                r"
                INSERT INTO storefront.cart_item (cart_id, variant_id, sku, name, quantity, unit_price)
                VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(cart_id)
            .bind(variant_id)
            .bind(sku)
            .bind(name)
            .bind(to_db_int(quantity)?)
            .bind(unit_price)
            .execute(&mut *conn)
            .await?;
        }
        LineChange::SetQuantity { item_id, quantity } => {
            sqlx::query("UPDATE storefront.cart_item SET quantity = $2 WHERE id = $1")
                .bind(item_id)
                .bind(to_db_int(quantity)?)
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

async fn lock_order(conn: &mut PgConnection, id: OrderId) -> Result<Order, RepositoryError> {
    sqlx::query_as::<_, OrderRow>(&format!(
        r#"SELECT {ORDER_COLUMNS} FROM storefront."order" WHERE id = $1 FOR UPDATE"#
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(RepositoryError::Rule(CommerceError::NotFound("order")))?
    .try_into()
}

async fn save_order_state(conn: &mut PgConnection, order: &Order) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"
        UPDATE storefront."order"
        SET status = $2, payment_status = $3, updated_at = $4
        WHERE id = $1
        "#,
    )
    .bind(order.id)
    .bind(order.status.as_str())
    .bind(order.payment_status.as_str())
    .bind(order.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn fetch_order_items(
    conn: &mut PgConnection,
    id: OrderId,
) -> Result<Vec<OrderItem>, RepositoryError> {
    let rows = sqlx::query_as::<_, OrderItemRow>(
        r"
        SELECT id, order_id, product_id, variant_id, sku, name, quantity, unit_price, discount
        FROM storefront.order_item
        WHERE order_id = $1
        ORDER BY id
        ",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    convert_all(rows)
}

/// Lock the payment matching `column = value`.
///
/// `column` is always a fixed identifier chosen by this module.
async fn lock_payment_by(
    conn: &mut PgConnection,
    column: &'static str,
    value: &str,
) -> Result<Option<Payment>, RepositoryError> {
    sqlx::query_as::<_, PaymentRow>(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM storefront.payment WHERE {column} = $1 \
         ORDER BY id LIMIT 1 FOR UPDATE"
    ))
    .bind(value)
    .fetch_optional(&mut *conn)
    .await?
    .map(Payment::try_from)
    .transpose()
}

async fn lock_payment_for_order(
    conn: &mut PgConnection,
    order_id: OrderId,
) -> Result<Option<Payment>, RepositoryError> {
    sqlx::query_as::<_, PaymentRow>(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM storefront.payment WHERE order_id = $1 FOR UPDATE"
    ))
    .bind(order_id)
    .fetch_optional(&mut *conn)
    .await?
    .map(Payment::try_from)
    .transpose()
}

async fn save_payment_state(
    conn: &mut PgConnection,
    payment: &Payment,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r"
        UPDATE storefront.payment
        SET status = $2, charge_id = $3, completed_at = $4, updated_at = $5
        WHERE id = $1
        ",
    )
    .bind(payment.id)
    .bind(payment.status.as_str())
    .bind(payment.charge_id.as_deref())
    .bind(payment.completed_at)
    .bind(payment.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn append_log(
    conn: &mut PgConnection,
    payment_id: PaymentId,
    status: PaymentStatus,
    message: &str,
    payload: &serde_json::Value,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r"
        INSERT INTO storefront.payment_log (payment_id, status, message, payload)
        VALUES ($1, $2, $3, $4)
        ",
    )
    .bind(payment_id)
    .bind(status.as_str())
    .bind(message)
    .bind(payload)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn fetch_refunds_for_payment(
    conn: &mut PgConnection,
    payment_id: PaymentId,
) -> Result<Vec<Refund>, RepositoryError> {
    let rows = sqlx::query_as::<_, RefundRow>(&format!(
        "SELECT {REFUND_COLUMNS} FROM storefront.refund WHERE payment_id = $1 ORDER BY id"
    ))
    .bind(payment_id)
    .fetch_all(&mut *conn)
    .await?;
    convert_all(rows)
}

async fn lock_refund(conn: &mut PgConnection, id: RefundId) -> Result<Refund, RepositoryError> {
    sqlx::query_as::<_, RefundRow>(&format!(
        "SELECT {REFUND_COLUMNS} FROM storefront.refund WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(RepositoryError::Rule(CommerceError::NotFound("refund")))?
    .try_into()
}

async fn save_refund_state(conn: &mut PgConnection, refund: &Refund) -> Result<(), RepositoryError> {
    sqlx::query(
        r"
        UPDATE storefront.refund
        SET status = $2, refund_transaction_id = $3, processed_at = $4, updated_at = $5
        WHERE id = $1
        ",
    )
    .bind(refund.id)
    .bind(refund.status.as_str())
    .bind(refund.refund_transaction_id.as_deref())
    .bind(refund.processed_at)
    .bind(refund.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Run a refund transition under a row lock.
async fn transition_refund(
    pool: &PgPool,
    id: RefundId,
    apply: impl FnOnce(&mut Refund, DateTime<Utc>) -> Result<(), CommerceError> + Send,
) -> Result<Refund, RepositoryError> {
    let mut tx = pool.begin().await?;
    let mut refund = lock_refund(&mut tx, id).await?;
    apply(&mut refund, Utc::now())?;
    save_refund_state(&mut tx, &refund).await?;
    tx.commit().await?;
    Ok(refund)
}

// =============================================================================
// Catalog
// =============================================================================

#[async_trait]
impl CatalogStore for PgStore {
    async fn get_variant(&self, id: VariantId) -> Result<Option<Variant>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        fetch_variant(&mut conn, id).await
    }

    async fn get_variants(
        &self,
        ids: &[VariantId],
    ) -> Result<HashMap<VariantId, Variant>, RepositoryError> {
        let ids: Vec<i32> = ids.iter().map(VariantId::as_i32).collect();
        let rows = sqlx::query_as::<_, VariantRow>(
            r"
            SELECT id, product_id, sku, name, price, stock, is_active
            FROM storefront.variant
            WHERE id = ANY($1)
            ",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Variant::try_from(row).map(|v| (v.id, v)))
            .collect()
    }

    async fn decrement_stock(
        &self,
        id: VariantId,
        amount: u32,
    ) -> Result<StockDecrement, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let result = decrement_in(&mut tx, id, amount)
            .await?
            .ok_or(RepositoryError::Rule(CommerceError::NotFound("variant")))?;
        tx.commit().await?;
        Ok(result)
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// =============================================================================
// Cart
// =============================================================================

#[async_trait]
impl CartStore for PgStore {
    async fn get_or_create_cart(&self, owner: &CartOwner) -> Result<Cart, RepositoryError> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let row = match owner {
            CartOwner::User(user_id) => {
                sqlx::query_as::<_, CartRow>(&format!(
                    "INSERT INTO storefront.cart AS c (user_id) VALUES ($1) \
                     ON CONFLICT (user_id) WHERE user_id IS NOT NULL \
                     DO UPDATE SET updated_at = c.updated_at \
                     RETURNING {CART_COLUMNS}"
                ))
                .bind(*user_id)
                .fetch_one(&self.pool)
                .await?
            }
            CartOwner::Session(token) => {
                sqlx::query_as::<_, CartRow>(&format!(
                    "INSERT INTO storefront.cart AS c (session_key) VALUES ($1) \
                     ON CONFLICT (session_key) WHERE session_key IS NOT NULL \
                     DO UPDATE SET updated_at = c.updated_at \
                     RETURNING {CART_COLUMNS}"
                ))
                .bind(token.as_str())
                .fetch_one(&self.pool)
                .await?
            }
        };

        let mut conn = self.pool.acquire().await?;
        build_cart(&mut conn, row).await
    }

    async fn find_cart(&self, owner: &CartOwner) -> Result<Option<Cart>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        let row = match owner {
            CartOwner::User(user_id) => {
                sqlx::query_as::<_, CartRow>(&format!(
                    "SELECT {CART_COLUMNS} FROM storefront.cart WHERE user_id = $1"
                ))
                .bind(*user_id)
                .fetch_optional(&mut *conn)
                .await?
            }
            CartOwner::Session(token) => {
                sqlx::query_as::<_, CartRow>(&format!(
                    "SELECT {CART_COLUMNS} FROM storefront.cart WHERE session_key = $1"
                ))
                .bind(token.as_str())
                .fetch_optional(&mut *conn)
                .await?
            }
        };

        match row {
            Some(row) => Ok(Some(build_cart(&mut conn, row).await?)),
            None => Ok(None),
        }
    }

    async fn add_item(
        &self,
        cart_id: CartId,
        variant_id: VariantId,
        quantity: u32,
    ) -> Result<Cart, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        lock_cart(&mut tx, cart_id).await?;

        let items = load_lines(&mut tx, cart_id).await?;
        let variant = fetch_variant(&mut tx, variant_id).await?;
        let change = cart::plan_add(&items, variant.as_ref(), quantity)?;
        apply_line_change(&mut tx, cart_id, change).await?;

        let row = touch_cart(&mut tx, cart_id).await?;
        let cart = build_cart(&mut tx, row).await?;
        tx.commit().await?;
        Ok(cart)
    }

    async fn update_item(
        &self,
        cart_id: CartId,
        item_id: CartItemId,
        quantity: u32,
    ) -> Result<Cart, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        lock_cart(&mut tx, cart_id).await?;

        let items = load_lines(&mut tx, cart_id).await?;
        let variant = match items.iter().find(|item| item.id == item_id) {
            Some(item) => fetch_variant(&mut tx, item.variant_id).await?,
            None => None,
        };
        let change = cart::plan_update(&items, item_id, variant.as_ref(), quantity)?;
        apply_line_change(&mut tx, cart_id, change).await?;

        let row = touch_cart(&mut tx, cart_id).await?;
        let cart = build_cart(&mut tx, row).await?;
        tx.commit().await?;
        Ok(cart)
    }

    async fn remove_item(
        &self,
        cart_id: CartId,
        item_id: CartItemId,
    ) -> Result<Cart, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        lock_cart(&mut tx, cart_id).await?;

        let deleted = sqlx::query("DELETE FROM storefront.cart_item WHERE id = $1 AND cart_id = $2")
            .bind(item_id)
            .bind(cart_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(CommerceError::NotFound("cart item").into());
        }

        let row = touch_cart(&mut tx, cart_id).await?;
        let cart = build_cart(&mut tx, row).await?;
        tx.commit().await?;
        Ok(cart)
    }

    async fn clear(&self, cart_id: CartId) -> Result<u64, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        lock_cart(&mut tx, cart_id).await?;
        let removed = sqlx::query("DELETE FROM storefront.cart_item WHERE cart_id = $1")
            .bind(cart_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        touch_cart(&mut tx, cart_id).await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn merge(&self, source: CartId, target: CartId) -> Result<Cart, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        // Lock both carts in id order so concurrent merges cannot deadlock.
        let (first, second) = if source < target {
            (source, target)
        } else {
            (target, source)
        };
        lock_cart(&mut tx, first).await?;
        if first != second {
            lock_cart(&mut tx, second).await?;
        }

        if source != target {
            let source_items = load_lines(&mut tx, source).await?;
            let target_items = load_lines(&mut tx, target).await?;

            for step in cart::plan_merge(&source_items, &target_items) {
                match step {
                    MergeStep::Increase { target, quantity } => {
                        sqlx::query("UPDATE storefront.cart_item SET quantity = $2 WHERE id = $1")
                            .bind(target)
                            .bind(to_db_int(quantity)?)
                            .execute(&mut *tx)
                            .await?;
                    }
                    MergeStep::Move { source: item_id } => {
                        sqlx::query("UPDATE storefront.cart_item SET cart_id = $2 WHERE id = $1")
                            .bind(item_id)
                            .bind(target)
                            .execute(&mut *tx)
                            .await?;
                    }
                }
            }

            sqlx::query("DELETE FROM storefront.cart WHERE id = $1")
                .bind(source)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                r"
                INSERT INTO storefront.cart_merge (source_cart_id, target_cart_id)
                VALUES ($1, $2)
                ON CONFLICT (source_cart_id) DO UPDATE SET target_cart_id = EXCLUDED.target_cart_id
                ",
            )
            .bind(source)
            .bind(target)
            .execute(&mut *tx)
            .await?;
        }

        let row = touch_cart(&mut tx, target).await?;
        let cart = build_cart(&mut tx, row).await?;
        tx.commit().await?;
        Ok(cart)
    }

    async fn remove_purchased(
        &self,
        cart_id: CartId,
        purchased: &[(VariantId, u32)],
    ) -> Result<Option<Cart>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let Some(live) = lock_live_cart(&mut tx, cart_id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        let items = load_lines(&mut tx, live.id).await?;
        for step in cart::plan_remove_purchased(&items, purchased) {
            match step {
                PurchaseStep::Remove { item_id } => {
                    sqlx::query("DELETE FROM storefront.cart_item WHERE id = $1")
                        .bind(item_id)
                        .execute(&mut *tx)
                        .await?;
                }
                PurchaseStep::Reduce { item_id, quantity } => {
                    sqlx::query("UPDATE storefront.cart_item SET quantity = $2 WHERE id = $1")
                        .bind(item_id)
                        .bind(to_db_int(quantity)?)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        let row = touch_cart(&mut tx, live.id).await?;
        let cart = build_cart(&mut tx, row).await?;
        tx.commit().await?;
        Ok(Some(cart))
    }
}

// =============================================================================
// Ledger
// =============================================================================

#[async_trait]
impl LedgerStore for PgStore {
    async fn create_order(&self, new: &NewOrder) -> Result<(Order, bool), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, OrderRow>(&format!(
            r#"
            INSERT INTO storefront."order" (
                order_number, user_id, email, provider_session_id,
                subtotal, shipping_cost, tax, total, shipping_address, billing_address
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (provider_session_id) DO NOTHING
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(&new.order_number)
        .bind(new.user_id)
        .bind(new.email.as_ref().map(Email::as_str))
        .bind(&new.provider_session_id)
        .bind(new.subtotal)
        .bind(new.shipping_cost)
        .bind(new.tax)
        .bind(new.total)
        .bind(Json(&new.shipping_address))
        .bind(Json(&new.billing_address))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            tx.rollback().await?;
            let existing = self
                .find_order_by_session(&new.provider_session_id)
                .await?
                .ok_or(RepositoryError::NotFound)?;
            return Ok((existing, false));
        };
        let order = Order::try_from(row)?;

        for item in &new.items {
            sqlx::query(
                r"
                INSERT INTO storefront.order_item (
                    order_id, product_id, variant_id, sku, name, quantity, unit_price, discount
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(order.id)
            .bind(item.product_id)
            .bind(item.variant_id)
            .bind(&item.sku)
            .bind(&item.name)
            .bind(to_db_int(item.quantity)?)
            .bind(item.unit_price)
            .bind(item.discount)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok((order, true))
    }

    async fn find_order_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<Order>, RepositoryError> {
        sqlx::query_as::<_, OrderRow>(&format!(
            r#"SELECT {ORDER_COLUMNS} FROM storefront."order" WHERE provider_session_id = $1"#
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Order::try_from)
        .transpose()
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>, RepositoryError> {
        sqlx::query_as::<_, OrderRow>(&format!(
            r#"SELECT {ORDER_COLUMNS} FROM storefront."order" WHERE id = $1"#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Order::try_from)
        .transpose()
    }

    async fn find_order_by_number(
        &self,
        order_number: &str,
    ) -> Result<Option<Order>, RepositoryError> {
        sqlx::query_as::<_, OrderRow>(&format!(
            r#"SELECT {ORDER_COLUMNS} FROM storefront."order" WHERE order_number = $1"#
        ))
        .bind(order_number)
        .fetch_optional(&self.pool)
        .await?
        .map(Order::try_from)
        .transpose()
    }

    async fn order_items(&self, id: OrderId) -> Result<Vec<OrderItem>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        fetch_order_items(&mut conn, id).await
    }

    async fn list_orders(&self, user: UserId) -> Result<Vec<Order>, RepositoryError> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM storefront."order"
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            "#
        ))
        .bind(user)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn complete_checkout(
        &self,
        upsert: &PaymentUpsert,
        payload: &serde_json::Value,
    ) -> Result<CheckoutCompletion, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let mut order = lock_order(&mut tx, upsert.order_id).await?;
        let transition = order.mark_paid(Utc::now())?;

        let mut decrements = Vec::new();
        if transition == PaidTransition::Applied {
            save_order_state(&mut tx, &order).await?;

            // Lock variants in id order so concurrent completions cannot deadlock.
            let mut items = fetch_order_items(&mut tx, order.id).await?;
            items.sort_by_key(|item| item.variant_id);
            for item in items {
                let Some(variant_id) = item.variant_id else {
                    continue;
                };
                if let Some(result) = decrement_in(&mut tx, variant_id, item.quantity).await? {
                    decrements.push(result);
                }
            }
        }

        let payment: Payment = sqlx::query_as::<_, PaymentRow>(&format!(
            r"
            INSERT INTO storefront.payment AS p (
                order_id, amount, currency, method, status,
                provider_session_id, payment_intent_id, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (order_id) DO UPDATE SET
                status = EXCLUDED.status,
                provider_session_id = EXCLUDED.provider_session_id,
                payment_intent_id = COALESCE(EXCLUDED.payment_intent_id, p.payment_intent_id),
                completed_at = COALESCE(p.completed_at, EXCLUDED.completed_at),
                updated_at = now()
            RETURNING {PAYMENT_COLUMNS}
            "
        ))
        .bind(upsert.order_id)
        .bind(upsert.amount)
        .bind(upsert.currency.as_str())
        .bind(PaymentMethod::Stripe.as_str())
        .bind(PaymentStatus::Succeeded.as_str())
        .bind(&upsert.provider_session_id)
        .bind(upsert.payment_intent_id.as_deref())
        .bind(upsert.completed_at)
        .fetch_one(&mut *tx)
        .await?
        .try_into()?;

        let message = match transition {
            PaidTransition::Applied => "checkout session completed",
            PaidTransition::AlreadyPaid => "checkout session completed (replay)",
        };
        append_log(&mut tx, payment.id, payment.status, message, payload).await?;

        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        let Some(mut payment) = lock_payment_by(&mut tx, "payment_intent_id", intent_id).await?
        else {
            return Ok(None);
        };

        let message = if payment.mark_succeeded(charge_id, Utc::now()) {
            save_payment_state(&mut tx, &payment).await?;
            "payment intent succeeded".to_string()
        } else {
            format!("payment intent succeeded ignored: payment is {}", payment.status)
        };
        append_log(&mut tx, payment.id, payment.status, &message, payload).await?;

        tx.commit().await?;
        Ok(Some(payment))
    }

    async fn apply_charge_failed(
        &self,
        charge_id: &str,
        reason: &str,
        payload: &serde_json::Value,
    ) -> Result<Option<ChargeFailure>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let Some(mut payment) = lock_payment_by(&mut tx, "charge_id", charge_id).await? else {
            return Ok(None);
        };
        let mut order = lock_order(&mut tx, payment.order_id).await?;
        let now = Utc::now();

        let payment_changed = payment.mark_failed(now);
        if payment_changed {
            save_payment_state(&mut tx, &payment).await?;
        }
        let order_changed = order.mark_payment_failed(now);
        if order_changed {
            save_order_state(&mut tx, &order).await?;
        }
        append_log(
            &mut tx,
            payment.id,
            PaymentStatus::Failed,
            &format!("charge failed: {reason}"),
            payload,
        )
        .await?;

        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        let mut order = lock_order(&mut tx, id).await?;
        order.cancel(actor, Utc::now())?;
        save_order_state(&mut tx, &order).await?;
        tx.commit().await?;
        Ok(order)
    }

    async fn payment_for_order(&self, id: OrderId) -> Result<Option<Payment>, RepositoryError> {
        sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM storefront.payment WHERE order_id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Payment::try_from)
        .transpose()
    }

    async fn payment_logs(&self, id: PaymentId) -> Result<Vec<PaymentLog>, RepositoryError> {
        let rows = sqlx::query_as::<_, PaymentLogRow>(
            r"
            SELECT id, payment_id, status, message, payload, created_at
            FROM storefront.payment_log
            WHERE payment_id = $1
            ORDER BY created_at, id
            ",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn request_refund(
        &self,
        order_id: OrderId,
        amount: Decimal,
        reason: &str,
    ) -> Result<Refund, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let payment = lock_payment_for_order(&mut tx, order_id)
            .await?
            .ok_or(RepositoryError::Rule(CommerceError::NotFound("payment")))?;
        let refunds = fetch_refunds_for_payment(&mut tx, payment.id).await?;
        ledger::validate_refund_request(&payment, &refunds, amount)?;

        let refund = sqlx::query_as::<_, RefundRow>(&format!(
            r"
            INSERT INTO storefront.refund (order_id, payment_id, amount, reason)
            VALUES ($1, $2, $3, $4)
            RETURNING {REFUND_COLUMNS}
            "
        ))
        .bind(order_id)
        .bind(payment.id)
        .bind(amount)
        .bind(reason)
        .fetch_one(&mut *tx)
        .await?
        .try_into()?;

        tx.commit().await?;
        Ok(refund)
    }

    async fn list_refunds(&self, order_id: OrderId) -> Result<Vec<Refund>, RepositoryError> {
        let rows = sqlx::query_as::<_, RefundRow>(&format!(
            "SELECT {REFUND_COLUMNS} FROM storefront.refund WHERE order_id = $1 ORDER BY id"
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn approve_refund(&self, id: RefundId) -> Result<Refund, RepositoryError> {
        transition_refund(&self.pool, id, Refund::approve).await
    }

    async fn reject_refund(&self, id: RefundId) -> Result<Refund, RepositoryError> {
        transition_refund(&self.pool, id, Refund::reject).await
    }

    async fn process_refund(
        &self,
        id: RefundId,
        transaction_id: &str,
    ) -> Result<RefundOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let mut refund = lock_refund(&mut tx, id).await?;
        refund.process(transaction_id.to_string(), now)?;
        save_refund_state(&mut tx, &refund).await?;

        let mut payment = lock_payment_for_order(&mut tx, refund.order_id)
            .await?
            .ok_or(RepositoryError::Rule(CommerceError::NotFound("payment")))?;
        let refunds = fetch_refunds_for_payment(&mut tx, payment.id).await?;
        let fully_refunded = ledger::is_fully_refunded(payment.amount, &refunds);

        if fully_refunded && payment.status != PaymentStatus::Refunded {
            payment.mark_refunded(now);
            save_payment_state(&mut tx, &payment).await?;

            let mut order = lock_order(&mut tx, refund.order_id).await?;
            order.mark_refunded(now);
            save_order_state(&mut tx, &order).await?;

            append_log(
                &mut tx,
                payment.id,
                PaymentStatus::Refunded,
                &format!("fully refunded by {transaction_id}"),
                &serde_json::Value::Null,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(RefundOutcome {
            refund,
            fully_refunded,
        })
    }
}
