//! Refund administration.
//!
//! Shoppers request refunds through the API; staff move them along here.
//!
//! ```bash
//! proshop-cli refund approve 12
//! proshop-cli refund process 12 --transaction-id re_123
//! ```

use std::sync::Arc;

use tracing::info;

use proshop_core::RefundId;
use proshop_storefront::db::{self, PgStore};
use proshop_storefront::services::{Observers, OrderService};

/// What to do with a refund.
#[derive(Debug, Clone)]
pub enum RefundAction {
    Approve,
    Reject,
    Process { transaction_id: String },
}

/// Apply `action` to refund `id`.
///
/// # Errors
///
/// Returns an error if the database is unreachable or the refund is not in a
/// state that allows the action.
pub async fn apply(id: i32, action: RefundAction) -> Result<(), Box<dyn std::error::Error>> {
    let database_url = super::database_url()?;
    let pool = db::create_pool(&database_url).await?;
    let orders = OrderService::new(Arc::new(PgStore::new(pool)), Observers::with_tracing());
    let id = RefundId::new(id);

    match action {
        RefundAction::Approve => {
            let refund = orders.approve_refund(id).await?;
            info!(refund_id = %refund.id, status = %refund.status, "Refund approved");
        }
        RefundAction::Reject => {
            let refund = orders.reject_refund(id).await?;
            info!(refund_id = %refund.id, status = %refund.status, "Refund rejected");
        }
        RefundAction::Process { transaction_id } => {
            let outcome = orders.process_refund(id, &transaction_id).await?;
            info!(
                refund_id = %outcome.refund.id,
                fully_refunded = outcome.fully_refunded,
                "Refund processed"
            );
        }
    }
    Ok(())
}
