//! Checkout snapshot: stock revalidation and the price-locked manifest.
//!
//! The manifest travels through the payment provider as session metadata and
//! comes back on the checkout-completed webhook, where it is turned into an
//! order. Provider metadata values are limited in length, so the encoded
//! manifest is split across numbered `items_N` keys.

use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::cart::{CartOwner, LineItem};
use crate::catalog::Variant;
use crate::error::CommerceError;
use crate::types::{CartId, Email, ProductId, SessionToken, UserId, VariantId};

/// Maximum length of a single metadata value.
pub const METADATA_VALUE_LIMIT: usize = 500;

/// Prefix of the numbered keys carrying the encoded manifest.
const ITEMS_KEY_PREFIX: &str = "items_";

const USER_ID_KEY: &str = "user_id";
const SESSION_KEY: &str = "session_key";
const CART_ID_KEY: &str = "cart_id";
const EMAIL_KEY: &str = "customer_email";

/// A cart line that can no longer be fulfilled from live stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockConflict {
    pub variant_id: VariantId,
    pub sku: String,
    pub requested: u32,
    pub available: u32,
}

/// Check every line against live stock and collect all violations.
///
/// A variant that is missing from `variants` or inactive counts as having
/// nothing available.
#[must_use]
pub fn find_stock_conflicts(
    items: &[LineItem],
    variants: &HashMap<VariantId, Variant>,
) -> Vec<StockConflict> {
    items
        .iter()
        .filter_map(|item| {
            let available = variants
                .get(&item.variant_id)
                .filter(|v| v.is_purchasable())
                .map_or(0, |v| v.stock);
            (item.quantity > available).then(|| StockConflict {
                variant_id: item.variant_id,
                sku: item.sku.clone(),
                requested: item.quantity,
                available,
            })
        })
        .collect()
}

/// One price-locked line of a checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestLine {
    pub variant_id: VariantId,
    pub product_id: ProductId,
    pub sku: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
}

impl ManifestLine {
    #[must_use]
    pub fn subtotal(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// The lines of a cart frozen at checkout time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckoutManifest {
    pub lines: Vec<ManifestLine>,
}

impl CheckoutManifest {
    /// Validate a cart for checkout and freeze it.
    ///
    /// `variants` must hold the live catalog rows for the cart's variants.
    ///
    /// # Errors
    ///
    /// - `EmptyCart` if there are no lines
    /// - `StockConflict` listing every line that exceeds live stock
    pub fn prepare(
        items: &[LineItem],
        variants: &HashMap<VariantId, Variant>,
    ) -> Result<Self, CommerceError> {
        if items.is_empty() {
            return Err(CommerceError::EmptyCart);
        }

        let conflicts = find_stock_conflicts(items, variants);
        if !conflicts.is_empty() {
            return Err(CommerceError::StockConflict(conflicts));
        }

        let lines = items
            .iter()
            .map(|item| {
                let variant = variants
                    .get(&item.variant_id)
                    .ok_or(CommerceError::NotFound("variant"))?;
                Ok(ManifestLine {
                    variant_id: item.variant_id,
                    product_id: variant.product_id,
                    sku: item.sku.clone(),
                    name: item.name.clone(),
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                })
            })
            .collect::<Result<Vec<_>, CommerceError>>()?;

        Ok(Self { lines })
    }

    /// Sum of the snapshotted line subtotals.
    #[must_use]
    pub fn total(&self) -> Decimal {
        self.lines.iter().map(ManifestLine::subtotal).sum()
    }

    /// Total number of units.
    #[must_use]
    pub fn item_count(&self) -> u64 {
        self.lines.iter().map(|l| u64::from(l.quantity)).sum()
    }

    /// Variant and quantity of every line, for taking them out of the cart
    /// once paid.
    #[must_use]
    pub fn purchased(&self) -> Vec<(VariantId, u32)> {
        self.lines.iter().map(|l| (l.variant_id, l.quantity)).collect()
    }
}

/// Everything the webhook needs to turn a paid session into an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutMetadata {
    pub owner: CartOwner,
    pub cart_id: CartId,
    pub customer_email: Option<Email>,
    pub manifest: CheckoutManifest,
}

/// Compact wire form of a manifest line.
#[derive(Serialize, Deserialize)]
struct WireLine(i32, i32, u32, Decimal, String, String);

impl CheckoutMetadata {
    /// Encode as flat string pairs suitable for provider metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be serialized.
    pub fn to_pairs(&self) -> Result<BTreeMap<String, String>, serde_json::Error> {
        let mut pairs = BTreeMap::new();
        match &self.owner {
            CartOwner::User(id) => pairs.insert(USER_ID_KEY.to_string(), id.to_string()),
            CartOwner::Session(token) => {
                pairs.insert(SESSION_KEY.to_string(), token.as_str().to_string())
            }
        };
        pairs.insert(CART_ID_KEY.to_string(), self.cart_id.to_string());
        if let Some(email) = &self.customer_email {
            pairs.insert(EMAIL_KEY.to_string(), email.as_str().to_string());
        }

        let wire: Vec<WireLine> = self
            .manifest
            .lines
            .iter()
            .map(|l| {
                WireLine(
                    l.variant_id.as_i32(),
                    l.product_id.as_i32(),
                    l.quantity,
                    l.unit_price,
                    l.sku.clone(),
                    l.name.clone(),
                )
            })
            .collect();
        let encoded = serde_json::to_string(&wire)?;
        for (index, chunk) in chunk_str(&encoded, METADATA_VALUE_LIMIT).enumerate() {
            pairs.insert(format!("{ITEMS_KEY_PREFIX}{index}"), chunk.to_string());
        }
        Ok(pairs)
    }

    /// Decode metadata previously produced by [`Self::to_pairs`].
    ///
    /// Returns `None` if the owner, cart or manifest is missing or malformed.
    /// A malformed email is dropped rather than failing the whole decode.
    #[must_use]
    pub fn from_pairs(pairs: &HashMap<String, String>) -> Option<Self> {
        let owner = match (pairs.get(USER_ID_KEY), pairs.get(SESSION_KEY)) {
            (Some(id), _) => CartOwner::User(UserId::new(id.parse().ok()?)),
            (None, Some(token)) if !token.is_empty() => {
                CartOwner::Session(SessionToken::from_string(token.clone()))
            }
            _ => return None,
        };
        let cart_id = CartId::new(pairs.get(CART_ID_KEY)?.parse().ok()?);

        let mut encoded = String::new();
        for index in 0.. {
            match pairs.get(&format!("{ITEMS_KEY_PREFIX}{index}")) {
                Some(chunk) => encoded.push_str(chunk),
                None => break,
            }
        }
        let wire: Vec<WireLine> = serde_json::from_str(&encoded).ok()?;
        if wire.is_empty() {
            return None;
        }
        let lines = wire
            .into_iter()
            .map(|WireLine(variant, product, quantity, unit_price, sku, name)| ManifestLine {
                variant_id: VariantId::new(variant),
                product_id: ProductId::new(product),
                sku,
                name,
                quantity,
                unit_price,
            })
            .collect();

        Some(Self {
            owner,
            cart_id,
            customer_email: pairs.get(EMAIL_KEY).and_then(|e| Email::parse(e).ok()),
            manifest: CheckoutManifest { lines },
        })
    }
}

/// Split a string into pieces of at most `limit` bytes on char boundaries.
fn chunk_str(s: &str, limit: usize) -> impl Iterator<Item = &str> {
    let mut rest = s;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let mut end = rest.len().min(limit);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        rest = tail;
        Some(head)
    })
}
