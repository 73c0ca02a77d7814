//! Catalog view used by the checkout pipeline.
//!
//! The catalog itself (products, categories, images) is owned elsewhere; the
//! pipeline only needs the purchasable variant with its live price and stock.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{ProductId, VariantId};

/// A purchasable SKU-level configuration of a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub product_id: ProductId,
    pub sku: String,
    /// Display name, e.g. "Classic Tee - Medium".
    pub name: String,
    /// Live catalog price.
    pub price: Decimal,
    /// Live stock count. Never negative.
    pub stock: u32,
    pub is_active: bool,
}

impl Variant {
    /// Whether the variant can be put in a cart at all.
    #[must_use]
    pub const fn is_purchasable(&self) -> bool {
        self.is_active
    }
}

/// Result of a stock decrement.
///
/// Stock saturates at zero; any quantity that could not be taken is reported
/// as `shortfall` so the caller can flag an oversell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockDecrement {
    pub variant_id: VariantId,
    pub remaining: u32,
    pub shortfall: u32,
}

/// Apply a decrement to a stock level without going below zero.
#[must_use]
pub const fn decrement(variant_id: VariantId, stock: u32, amount: u32) -> StockDecrement {
    let remaining = stock.saturating_sub(amount);
    StockDecrement {
        variant_id,
        remaining,
        shortfall: amount.saturating_sub(stock),
    }
}
