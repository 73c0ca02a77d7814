//! Cart operations keyed by owner.
//!
//! Handlers only know who is asking; this service resolves the owner's cart
//! and delegates the locked read-check-write to the [`CartStore`].

use std::sync::Arc;

use tracing::{info, instrument};

use proshop_core::cart::{Cart, CartOwner};
use proshop_core::{CartItemId, CommerceError, SessionToken, UserId, VariantId};

use super::ServiceError;
use crate::db::CartStore;

/// Cart service.
#[derive(Clone)]
pub struct CartService {
    carts: Arc<dyn CartStore>,
}

impl CartService {
    #[must_use]
    pub fn new(carts: Arc<dyn CartStore>) -> Self {
        Self { carts }
    }

    /// The owner's cart, created empty on first access.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn get_or_create_cart(&self, owner: &CartOwner) -> Result<Cart, ServiceError> {
        Ok(self.carts.get_or_create_cart(owner).await?)
    }

    /// Add `quantity` units of a variant, summing with an existing line.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuantity` for zero, `NotFound` for unknown or inactive
    /// variants and `InsufficientStock` when the combined quantity exceeds
    /// live stock.
    #[instrument(skip(self), fields(variant_id = %variant_id))]
    pub async fn add_item(
        &self,
        owner: &CartOwner,
        variant_id: VariantId,
        quantity: u32,
    ) -> Result<Cart, ServiceError> {
        if quantity == 0 {
            return Err(CommerceError::InvalidQuantity.into());
        }
        let cart = self.carts.get_or_create_cart(owner).await?;
        Ok(self.carts.add_item(cart.id, variant_id, quantity).await?)
    }

    /// Overwrite a line's quantity.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the line is not in the owner's cart, plus the
    /// same quantity and stock errors as [`Self::add_item`].
    #[instrument(skip(self), fields(item_id = %item_id))]
    pub async fn update_item(
        &self,
        owner: &CartOwner,
        item_id: CartItemId,
        quantity: u32,
    ) -> Result<Cart, ServiceError> {
        if quantity == 0 {
            return Err(CommerceError::InvalidQuantity.into());
        }
        let cart = self.owned_cart(owner).await?;
        Ok(self.carts.update_item(cart.id, item_id, quantity).await?)
    }

    /// Remove a line.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the line is not in the owner's cart.
    #[instrument(skip(self), fields(item_id = %item_id))]
    pub async fn remove_item(
        &self,
        owner: &CartOwner,
        item_id: CartItemId,
    ) -> Result<Cart, ServiceError> {
        let cart = self.owned_cart(owner).await?;
        Ok(self.carts.remove_item(cart.id, item_id).await?)
    }

    /// Remove every line; the cart itself survives.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn clear(&self, owner: &CartOwner) -> Result<Cart, ServiceError> {
        let cart = self.carts.get_or_create_cart(owner).await?;
        self.carts.clear(cart.id).await?;
        Ok(self.carts.get_or_create_cart(owner).await?)
    }

    /// Fold the anonymous session cart into the user's cart after sign-in.
    ///
    /// Returns the user's cart. Nothing happens when the session never had a
    /// cart.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    #[instrument(skip(self, token), fields(user_id = %user_id))]
    pub async fn merge_on_sign_in(
        &self,
        token: &SessionToken,
        user_id: UserId,
    ) -> Result<Cart, ServiceError> {
        let user_cart = self.carts.get_or_create_cart(&CartOwner::User(user_id)).await?;
        let Some(session_cart) = self
            .carts
            .find_cart(&CartOwner::Session(token.clone()))
            .await?
        else {
            return Ok(user_cart);
        };

        let lines = session_cart.items.len();
        let merged = self.carts.merge(session_cart.id, user_cart.id).await?;
        info!(lines, cart_id = %merged.id, "Merged session cart into user cart");
        Ok(merged)
    }

    async fn owned_cart(&self, owner: &CartOwner) -> Result<Cart, ServiceError> {
        self.carts
            .find_cart(owner)
            .await?
            .ok_or_else(|| CommerceError::NotFound("cart item").into())
    }
}

impl std::fmt::Debug for CartService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CartService").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use proshop_core::ProductId;
    use proshop_core::catalog::Variant;
    use rust_decimal::Decimal;

    use super::*;
    use crate::db::MemoryStore;

    async fn service() -> (CartService, Arc<MemoryStore>, VariantId) {
        let store = Arc::new(MemoryStore::new());
        let id = VariantId::new(1);
        store
            .put_variant(Variant {
                id,
                product_id: ProductId::new(1),
                sku: "TEE-M".to_string(),
                name: "Tee - Medium".to_string(),
                price: Decimal::new(2000, 2),
                stock: 10,
                is_active: true,
            })
            .await;
        (CartService::new(store.clone()), store, id)
    }

    #[tokio::test]
    async fn test_zero_quantity_rejected_before_store() {
        let (carts, store, variant) = service().await;
        let owner = CartOwner::User(UserId::new(1));
        let err = carts.add_item(&owner, variant, 0).await.unwrap_err();
        assert!(matches!(err, ServiceError::Commerce(CommerceError::InvalidQuantity)));
        assert!(store.find_cart(&owner).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_in_someone_elses_cart_is_not_found() {
        let (carts, _store, variant) = service().await;
        let alice = CartOwner::User(UserId::new(1));
        let bob = CartOwner::User(UserId::new(2));
        let cart = carts.add_item(&alice, variant, 1).await.unwrap();
        let item = cart.items[0].id;
        carts.get_or_create_cart(&bob).await.unwrap();

        let err = carts.update_item(&bob, item, 2).await.unwrap_err();
        assert!(matches!(err, ServiceError::Commerce(CommerceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_merge_without_session_cart_returns_user_cart() {
        let (carts, _store, variant) = service().await;
        let user = UserId::new(7);
        carts
            .add_item(&CartOwner::User(user), variant, 2)
            .await
            .unwrap();

        let merged = carts
            .merge_on_sign_in(&SessionToken::generate(), user)
            .await
            .unwrap();
        assert_eq!(merged.totals().total_items, 2);
    }

    #[tokio::test]
    async fn test_clear_keeps_cart() {
        let (carts, store, variant) = service().await;
        let owner = CartOwner::Session(SessionToken::generate());
        carts.add_item(&owner, variant, 3).await.unwrap();
        let before = carts.get_or_create_cart(&owner).await.unwrap();
        let cart = carts.clear(&owner).await.unwrap();
        assert!(cart.is_empty());
        assert_eq!(cart.id, before.id);
        assert!(store.cart_exists(before.id).await);
    }
}
