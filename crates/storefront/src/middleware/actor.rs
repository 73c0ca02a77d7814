//! Who is making the request.
//!
//! Every shopper has a cart owner: the signed-in user, or else an anonymous
//! token kept in the session. Authentication itself happens elsewhere;
//! [`sign_in`] is the hook it calls once a user is known.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use tracing::info;

use proshop_core::cart::{Cart, CartOwner};
use proshop_core::{Email, SessionToken, UserId};

use crate::error::{AppError, clear_sentry_user, set_sentry_user};
use crate::services::CartService;

/// Session keys used by the storefront.
pub mod session_keys {
    /// The signed-in user.
    pub const CURRENT_USER: &str = "current_user";

    /// Anonymous cart token, removed once merged into a user cart.
    pub const CART_TOKEN: &str = "cart_token";
}

/// Session-stored user identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: UserId,
    /// Validated on deserialization, so a malformed address never reaches
    /// the session.
    pub email: Email,
}

/// The requesting shopper.
#[derive(Debug, Clone)]
pub struct Actor {
    pub owner: CartOwner,
    pub user: Option<CurrentUser>,
}

impl Actor {
    #[must_use]
    pub fn user_id(&self) -> Option<UserId> {
        self.user.as_ref().map(|u| u.id)
    }

    #[must_use]
    pub fn email(&self) -> Option<&Email> {
        self.user.as_ref().map(|u| &u.email)
    }
}

fn session_from(parts: &Parts) -> Result<Session, AppError> {
    parts
        .extensions
        .get::<Session>()
        .cloned()
        .ok_or_else(|| AppError::Internal("session layer not installed".to_string()))
}

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let session = session_from(parts)?;

        if let Some(user) = session
            .get::<CurrentUser>(session_keys::CURRENT_USER)
            .await?
        {
            return Ok(Self {
                owner: CartOwner::User(user.id),
                user: Some(user),
            });
        }

        let token = match session.get::<SessionToken>(session_keys::CART_TOKEN).await? {
            Some(token) => token,
            None => {
                let token = SessionToken::generate();
                session.insert(session_keys::CART_TOKEN, &token).await?;
                token
            }
        };

        Ok(Self {
            owner: CartOwner::Session(token),
            user: None,
        })
    }
}

/// Extractor that requires a signed-in user.
///
/// Rejects with `401 Unauthorized` for anonymous shoppers.
#[derive(Debug, Clone)]
pub struct RequireUser(pub CurrentUser);

impl<S> FromRequestParts<S> for RequireUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let session = session_from(parts)?;
        session
            .get::<CurrentUser>(session_keys::CURRENT_USER)
            .await?
            .map(Self)
            .ok_or_else(|| AppError::Unauthorized("sign in required".to_string()))
    }
}

/// Record a successful sign-in and fold the anonymous cart into the user's.
///
/// The session ID is rotated and the anonymous cart token dropped, so the
/// merge happens exactly once per sign-in.
///
/// # Errors
///
/// Returns an error if the session or cart store fails.
pub async fn sign_in(
    session: &Session,
    carts: &CartService,
    user: CurrentUser,
) -> Result<Cart, AppError> {
    let token = session
        .get::<SessionToken>(session_keys::CART_TOKEN)
        .await?;

    session.cycle_id().await?;
    session.insert(session_keys::CURRENT_USER, &user).await?;
    set_sentry_user(&user.id, Some(user.email.as_str()));
    info!(user_id = %user.id, "User signed in");

    let cart = match token {
        Some(token) => {
            let cart = carts.merge_on_sign_in(&token, user.id).await?;
            session
                .remove::<SessionToken>(session_keys::CART_TOKEN)
                .await?;
            cart
        }
        None => carts.get_or_create_cart(&CartOwner::User(user.id)).await?,
    };
    Ok(cart)
}

/// Forget the signed-in user and any anonymous cart token.
///
/// # Errors
///
/// Returns an error if the session cannot be cleared.
pub async fn sign_out(session: &Session) -> Result<(), AppError> {
    session.flush().await?;
    clear_sentry_user();
    Ok(())
}
