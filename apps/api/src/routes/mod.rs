pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::billing::handlers as payments;
use crate::referrals::handlers as referrals;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Referral ledger
        .route("/api/v1/referrals/invite", post(referrals::handle_invite))
        .route("/api/v1/referrals/signup", post(referrals::handle_signup))
        .route(
            "/api/v1/referrals/conversion",
            post(referrals::handle_conversion),
        )
        .route("/api/v1/referrals/repair", post(referrals::handle_repair))
        .route(
            "/api/v1/referrals/recalculate",
            post(referrals::handle_recalculate),
        )
        .route("/api/v1/referrals/redeem", post(referrals::handle_redeem))
        .route("/api/v1/referrals/code", post(referrals::handle_referral_code))
        .route("/api/v1/referrals/stats", get(referrals::handle_stats))
        // Payments
        .route(
            "/api/v1/payments/webhook",
            post(payments::handle_stripe_webhook),
        )
        .route(
            "/api/v1/payments/verify-session",
            get(payments::handle_verify_session),
        )
        .with_state(state)
}
