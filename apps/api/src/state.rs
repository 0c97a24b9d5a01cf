use std::sync::Arc;

use crate::billing::stripe::CheckoutSessions;
use crate::config::Config;
use crate::notify::Notifier;
use crate::store::{BillingStore, ReferralStore};

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub referrals: Arc<dyn ReferralStore>,
    pub billing: Arc<dyn BillingStore>,
    /// Outbox publisher. Default: Redis list drained by the email dispatcher.
    pub notifier: Arc<dyn Notifier>,
    pub checkout: Arc<dyn CheckoutSessions>,
    pub config: Config,
}
