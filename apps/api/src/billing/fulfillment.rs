//! Idempotent fulfillment gate.
//!
//! Both the webhook and client-side verification can finish the same checkout
//! session, possibly more than once. The gate reads the session's marker, applies
//! effects only when it is not yet fulfilled, and writes the marker last. The
//! marker write is conditional, so only one finisher can flip it.
//!
//! A crash between "effects applied" and "marker written" lets a later trigger
//! apply the effects again; that window is accepted.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::billing::checkout::{CheckoutEffects, PaidOrder};
use crate::billing::stripe::CheckoutSession;
use crate::errors::AppError;
use crate::notify::Notifier;
use crate::store::{BillingStore, ReferralStore};

#[async_trait]
pub trait FulfillmentEffects: Send + Sync {
    async fn apply(&self, order: &PaidOrder) -> Result<(), AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Applied,
    AlreadyFulfilled,
}

pub async fn run_once(
    store: &dyn BillingStore,
    order: &PaidOrder,
    effects: &dyn FulfillmentEffects,
) -> Result<GateOutcome, AppError> {
    if store
        .get_fulfillment(&order.session_id)
        .await?
        .is_some_and(|marker| marker.fulfilled)
    {
        info!(session_id = %order.session_id, "Session already fulfilled, skipping");
        return Ok(GateOutcome::AlreadyFulfilled);
    }

    effects.apply(order).await?;

    if !store.mark_fulfilled(&order.marker(Utc::now())).await? {
        warn!(
            session_id = %order.session_id,
            "Session was marked fulfilled by a concurrent finisher"
        );
    }

    info!(
        session_id = %order.session_id,
        user_id = %order.user_id,
        "Checkout session fulfilled"
    );
    Ok(GateOutcome::Applied)
}

/// Fulfils a paid checkout session through the gate with the standard checkout effects.
pub async fn fulfill_checkout_session(
    billing: &dyn BillingStore,
    referrals: &dyn ReferralStore,
    notifier: &dyn Notifier,
    session: &CheckoutSession,
) -> Result<GateOutcome, AppError> {
    let order = PaidOrder::from_session(session)?;
    let effects = CheckoutEffects {
        billing,
        referrals,
        notifier,
    };
    run_once(billing, &order, &effects).await
}
