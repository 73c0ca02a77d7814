//! Cart rules: ownership, price snapshots, stock checks and merging.
//!
//! Everything here is pure. Stores load the current lines and variant inside
//! a transaction, ask these functions what to do, and persist the returned
//! change before committing, so the read-check-write is atomic.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::catalog::Variant;
use crate::error::CommerceError;
use crate::types::{CartId, CartItemId, SessionToken, UserId, VariantId};

/// Who a cart belongs to: exactly one of a signed-in user or an anonymous
/// session token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CartOwner {
    User(UserId),
    Session(SessionToken),
}

impl CartOwner {
    /// The user, if the owner is authenticated.
    #[must_use]
    pub const fn user_id(&self) -> Option<UserId> {
        match self {
            Self::User(id) => Some(*id),
            Self::Session(_) => None,
        }
    }

    /// The session token, if the owner is anonymous.
    #[must_use]
    pub const fn session_token(&self) -> Option<&SessionToken> {
        match self {
            Self::User(_) => None,
            Self::Session(token) => Some(token),
        }
    }
}

/// A line in a cart. The price is the catalog price at the moment the
/// variant was first added and is never refreshed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: CartItemId,
    pub variant_id: VariantId,
    pub sku: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub added_at: DateTime<Utc>,
}

impl LineItem {
    /// Snapshotted price times quantity.
    #[must_use]
    pub fn subtotal(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// A shopping cart with its lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub id: CartId,
    pub owner: CartOwner,
    pub items: Vec<LineItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cart {
    /// Totals derived from the current lines.
    #[must_use]
    pub fn totals(&self) -> CartTotals {
        compute_totals(&self.items)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Find a line by its ID.
    #[must_use]
    pub fn item(&self, item_id: CartItemId) -> Option<&LineItem> {
        self.items.iter().find(|item| item.id == item_id)
    }
}

/// Item count and price total of a cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CartTotals {
    pub total_items: u64,
    pub total_price: Decimal,
}

/// Sum quantities and snapshotted subtotals.
///
/// Totals are never stored; callers recompute them on every read.
#[must_use]
pub fn compute_totals(items: &[LineItem]) -> CartTotals {
    items.iter().fold(CartTotals::default(), |acc, item| CartTotals {
        total_items: acc.total_items + u64::from(item.quantity),
        total_price: acc.total_price + item.subtotal(),
    })
}

/// A single write a store must perform to apply an add or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineChange {
    /// Insert a new line with a fresh price snapshot.
    Insert {
        variant_id: VariantId,
        sku: String,
        name: String,
        quantity: u32,
        unit_price: Decimal,
    },
    /// Overwrite the quantity of an existing line; price is untouched.
    SetQuantity { item_id: CartItemId, quantity: u32 },
}

/// Decide how to add `quantity` of `variant` to a cart holding `items`.
///
/// `variant` is `None` when the catalog has no such variant.
///
/// # Errors
///
/// - `InvalidQuantity` if `quantity` is zero
/// - `NotFound` if the variant is missing or inactive
/// - `InsufficientStock` if the combined quantity would exceed live stock
pub fn plan_add(
    items: &[LineItem],
    variant: Option<&Variant>,
    quantity: u32,
) -> Result<LineChange, CommerceError> {
    if quantity == 0 {
        return Err(CommerceError::InvalidQuantity);
    }
    let variant = variant
        .filter(|v| v.is_purchasable())
        .ok_or(CommerceError::NotFound("variant"))?;

    let existing = items.iter().find(|item| item.variant_id == variant.id);
    let already = existing.map_or(0, |item| item.quantity);
    let combined = already.saturating_add(quantity);

    if combined > variant.stock {
        return Err(CommerceError::InsufficientStock {
            sku: variant.sku.clone(),
            requested: combined,
            available: variant.stock,
        });
    }

    Ok(match existing {
        Some(item) => LineChange::SetQuantity {
            item_id: item.id,
            quantity: combined,
        },
        None => LineChange::Insert {
            variant_id: variant.id,
            sku: variant.sku.clone(),
            name: variant.name.clone(),
            quantity,
            unit_price: variant.price,
        },
    })
}

/// Decide whether a line may be set to `quantity`.
///
/// # Errors
///
/// - `InvalidQuantity` if `quantity` is zero
/// - `NotFound` if the line is not in the cart or its variant is gone
/// - `InsufficientStock` if `quantity` exceeds live stock
pub fn plan_update(
    items: &[LineItem],
    item_id: CartItemId,
    variant: Option<&Variant>,
    quantity: u32,
) -> Result<LineChange, CommerceError> {
    if quantity == 0 {
        return Err(CommerceError::InvalidQuantity);
    }
    let item = items
        .iter()
        .find(|item| item.id == item_id)
        .ok_or(CommerceError::NotFound("cart item"))?;
    let variant = variant
        .filter(|v| v.id == item.variant_id)
        .ok_or(CommerceError::NotFound("variant"))?;

    if quantity > variant.stock {
        return Err(CommerceError::InsufficientStock {
            sku: variant.sku.clone(),
            requested: quantity,
            available: variant.stock,
        });
    }

    Ok(LineChange::SetQuantity { item_id, quantity })
}

/// One write needed to fold a session cart into an owner cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStep {
    /// The owner cart already has the variant: set its summed quantity.
    Increase { target: CartItemId, quantity: u32 },
    /// Re-parent the session line (keeping its price snapshot).
    Move { source: CartItemId },
}

/// Plan the merge of `source` (session cart) lines into `target` (owner cart).
///
/// Stock is deliberately not rechecked here; checkout revalidates it.
#[must_use]
pub fn plan_merge(source: &[LineItem], target: &[LineItem]) -> Vec<MergeStep> {
    source
        .iter()
        .map(|line| {
            target
                .iter()
                .find(|existing| existing.variant_id == line.variant_id)
                .map_or(MergeStep::Move { source: line.id }, |existing| {
                    MergeStep::Increase {
                        target: existing.id,
                        quantity: existing.quantity.saturating_add(line.quantity),
                    }
                })
        })
        .collect()
}

/// One write needed to take paid-for units out of a cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseStep {
    /// Every unit on the line was bought.
    Remove { item_id: CartItemId },
    /// Units were added after checkout started; keep the remainder.
    Reduce { item_id: CartItemId, quantity: u32 },
}

/// Plan the removal of `purchased` (variant, quantity) pairs from a cart.
///
/// Lines for variants that were not bought, and units added on top of the
/// bought quantity, stay in the cart.
#[must_use]
pub fn plan_remove_purchased(
    items: &[LineItem],
    purchased: &[(VariantId, u32)],
) -> Vec<PurchaseStep> {
    items
        .iter()
        .filter_map(|line| {
            let bought = purchased
                .iter()
                .filter(|(variant_id, _)| *variant_id == line.variant_id)
                .fold(0u32, |sum, (_, quantity)| sum.saturating_add(*quantity));
            if bought == 0 {
                None
            } else if line.quantity <= bought {
                Some(PurchaseStep::Remove { item_id: line.id })
            } else {
                Some(PurchaseStep::Reduce {
                    item_id: line.id,
                    quantity: line.quantity - bought,
                })
            }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::types::ProductId;

    fn variant(id: i32, price: i64, stock: u32) -> Variant {
        Variant {
            id: VariantId::new(id),
            product_id: ProductId::new(100),
            sku: format!("SKU-{id}"),
            name: format!("Variant {id}"),
            price: Decimal::new(price, 2),
            stock,
            is_active: true,
        }
    }

    fn line(id: i32, variant_id: i32, quantity: u32, price: i64) -> LineItem {
        LineItem {
            id: CartItemId::new(id),
            variant_id: VariantId::new(variant_id),
            sku: format!("SKU-{variant_id}"),
            name: format!("Variant {variant_id}"),
            quantity,
            unit_price: Decimal::new(price, 2),
            added_at: Utc::now(),
        }
    }

    /// Apply a planned change the way a store would.
    fn apply(items: &mut Vec<LineItem>, change: LineChange) {
        match change {
            LineChange::Insert {
                variant_id,
                sku,
                name,
                quantity,
                unit_price,
            } => {
                let next = i32::try_from(items.len()).unwrap() + 1;
                items.push(LineItem {
                    id: CartItemId::new(next),
                    variant_id,
                    sku,
                    name,
                    quantity,
                    unit_price,
                    added_at: Utc::now(),
                });
            }
            LineChange::SetQuantity { item_id, quantity } => {
                let item = items.iter_mut().find(|i| i.id == item_id).unwrap();
                item.quantity = quantity;
            }
        }
    }

    #[test]
    fn test_repeated_adds_sum_until_stock_is_exceeded() {
        let v = variant(1, 1000, 5);
        let mut items = Vec::new();

        for qty in [2, 2, 1] {
            let change = plan_add(&items, Some(&v), qty).unwrap();
            apply(&mut items, change);
        }
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, 5);

        let err = plan_add(&items, Some(&v), 1).unwrap_err();
        assert_eq!(
            err,
            CommerceError::InsufficientStock {
                sku: "SKU-1".to_string(),
                requested: 6,
                available: 5,
            }
        );
    }

    #[test]
    fn test_add_snapshots_price_once() {
        let mut v = variant(1, 1000, 10);
        let mut items = Vec::new();
        let change = plan_add(&items, Some(&v), 1).unwrap();
        apply(&mut items, change);

        v.price = Decimal::new(2500, 2);
        let change = plan_add(&items, Some(&v), 1).unwrap();
        apply(&mut items, change);

        assert_eq!(items[0].unit_price, Decimal::new(1000, 2));
        assert_eq!(items[0].subtotal(), Decimal::new(2000, 2));
    }

    #[test]
    fn test_add_rejects_zero_and_inactive() {
        let mut v = variant(1, 1000, 10);
        assert_eq!(
            plan_add(&[], Some(&v), 0),
            Err(CommerceError::InvalidQuantity)
        );
        assert_eq!(
            plan_add(&[], None, 1),
            Err(CommerceError::NotFound("variant"))
        );
        v.is_active = false;
        assert_eq!(
            plan_add(&[], Some(&v), 1),
            Err(CommerceError::NotFound("variant"))
        );
    }

    #[test]
    fn test_update_checks_item_and_stock() {
        let v = variant(1, 1000, 3);
        let items = vec![line(10, 1, 1, 1000)];

        assert_eq!(
            plan_update(&items, CartItemId::new(99), Some(&v), 1),
            Err(CommerceError::NotFound("cart item"))
        );
        assert!(matches!(
            plan_update(&items, CartItemId::new(10), Some(&v), 4),
            Err(CommerceError::InsufficientStock { available: 3, .. })
        ));
        assert_eq!(
            plan_update(&items, CartItemId::new(10), Some(&v), 3),
            Ok(LineChange::SetQuantity {
                item_id: CartItemId::new(10),
                quantity: 3
            })
        );
    }

    #[test]
    fn test_merge_sums_shared_variants_and_moves_the_rest() {
        let session = vec![line(1, 100, 2, 500), line(2, 200, 1, 700)];
        let owner = vec![line(3, 100, 1, 450)];

        let steps = plan_merge(&session, &owner);
        assert_eq!(
            steps,
            vec![
                MergeStep::Increase {
                    target: CartItemId::new(3),
                    quantity: 3
                },
                MergeStep::Move {
                    source: CartItemId::new(2)
                },
            ]
        );
    }

    #[test]
    fn test_merge_into_empty_cart_moves_everything() {
        let session = vec![line(1, 100, 2, 500), line(2, 200, 1, 700)];
        let steps = plan_merge(&session, &[]);
        assert!(steps.iter().all(|s| matches!(s, MergeStep::Move { .. })));
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn test_remove_purchased_keeps_later_additions() {
        let items = vec![line(1, 100, 1, 500), line(2, 200, 3, 700), line(3, 300, 5, 250)];
        let purchased = [(VariantId::new(100), 1), (VariantId::new(300), 2)];

        let steps = plan_remove_purchased(&items, &purchased);
        assert_eq!(
            steps,
            vec![
                PurchaseStep::Remove {
                    item_id: CartItemId::new(1)
                },
                PurchaseStep::Reduce {
                    item_id: CartItemId::new(3),
                    quantity: 3
                },
            ]
        );
    }

    #[test]
    fn test_remove_purchased_never_goes_below_zero() {
        let items = vec![line(1, 100, 2, 500)];
        let purchased = [(VariantId::new(100), 1), (VariantId::new(100), 4)];
        assert_eq!(
            plan_remove_purchased(&items, &purchased),
            vec![PurchaseStep::Remove {
                item_id: CartItemId::new(1)
            }]
        );
        assert!(plan_remove_purchased(&items, &[]).is_empty());
    }

    #[test]
    fn test_totals() {
        let items = vec![line(1, 100, 2, 500), line(2, 200, 3, 250)];
        let totals = compute_totals(&items);
        assert_eq!(totals.total_items, 5);
        assert_eq!(totals.total_price, Decimal::new(1750, 2));
    }
}
