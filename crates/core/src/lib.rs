//! Proshop Core - Domain rules of the checkout pipeline.
//!
//! This crate provides the types and pure rules shared by the Proshop
//! components:
//! - `storefront` - Cart, checkout, webhook reconciliation and order HTTP API
//! - `cli` - Command-line tools for migrations and catalog seeding
//!
//! # Architecture
//!
//! The core crate contains only types and decisions - no I/O, no database
//! access, no HTTP clients. Stores load state, ask these functions what to
//! change, and persist the answer inside their own transaction.
//!
//! # Modules
//!
//! - [`types`] - Newtype IDs, money, emails, and statuses
//! - [`catalog`] - The purchasable variant view and stock decrements
//! - [`cart`] - Cart ownership, totals, add/update/merge planning
//! - [`checkout`] - Stock revalidation and the price-locked manifest
//! - [`ledger`] - Orders, payments, refunds and their transitions
//! - [`error`] - Domain error taxonomy

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod cart;
pub mod catalog;
pub mod checkout;
pub mod error;
pub mod ledger;
pub mod types;

pub use error::CommerceError;
pub use types::*;
