use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::billing::checkout::async_failure_log;
use crate::billing::fulfillment::{fulfill_checkout_session, GateOutcome};
use crate::billing::stripe::{
    construct_event, CheckoutSession, ASYNC_PAYMENT_FAILED, ASYNC_PAYMENT_SUCCEEDED,
    CHECKOUT_COMPLETED,
};
use crate::errors::AppError;
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "stripe-signature";

/// Fulfils a webhook-delivered session. Metadata without a purchaser can never
/// succeed, so it is logged and acknowledged instead of failing the delivery.
async fn fulfill_from_webhook(state: &AppState, session: &CheckoutSession) -> Result<(), AppError> {
    match fulfill_checkout_session(
        state.billing.as_ref(),
        state.referrals.as_ref(),
        state.notifier.as_ref(),
        session,
    )
    .await
    {
        Ok(_) => Ok(()),
        Err(AppError::Validation(msg)) => {
            error!(session_id = %session.id, "Webhook session not fulfillable: {msg}");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// POST /api/v1/payments/webhook
pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Validation("Missing stripe-signature header".to_string()))?;

    let event = construct_event(
        &body,
        signature,
        &state.config.stripe_webhook_secret,
        Utc::now().timestamp(),
    )
    .map_err(|e| {
        warn!("Webhook signature verification failed: {e}");
        AppError::Validation("Invalid signature".to_string())
    })?;

    debug!(event_id = %event.id, event_type = %event.kind, "Webhook event verified");

    match event.kind.as_str() {
        CHECKOUT_COMPLETED => {
            let session = event.checkout_session()?;
            info!(session_id = %session.id, paid = session.is_paid(), "Checkout session completed");
            if session.is_paid() {
                fulfill_from_webhook(&state, &session).await?;
            }
        }
        ASYNC_PAYMENT_SUCCEEDED => {
            let session = event.checkout_session()?;
            info!(session_id = %session.id, "Async payment succeeded");
            fulfill_from_webhook(&state, &session).await?;
        }
        ASYNC_PAYMENT_FAILED => {
            let session = event.checkout_session()?;
            warn!(session_id = %session.id, "Async payment failed");
            state
                .billing
                .append_payment_log(&async_failure_log(&session, Utc::now()))
                .await?;
        }
        other => debug!(event_id = %event.id, event_type = other, "Unhandled webhook event"),
    }

    Ok(Json(json!({ "received": true })))
}

#[derive(Deserialize)]
pub struct SessionQuery {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySessionResponse {
    pub success: bool,
    pub paid: bool,
    pub already_fulfilled: bool,
    pub payment_status: Option<String>,
}

/// GET /api/v1/payments/verify-session
pub async fn handle_verify_session(
    State(state): State<AppState>,
    Query(params): Query<SessionQuery>,
) -> Result<Json<VerifySessionResponse>, AppError> {
    let session = state.checkout.retrieve(params.session_id.trim()).await?;

    if !session.is_paid() {
        return Ok(Json(VerifySessionResponse {
            success: false,
            paid: false,
            already_fulfilled: false,
            payment_status: session.payment_status,
        }));
    }

    let outcome = fulfill_checkout_session(
        state.billing.as_ref(),
        state.referrals.as_ref(),
        state.notifier.as_ref(),
        &session,
    )
    .await?;

    Ok(Json(VerifySessionResponse {
        success: true,
        paid: true,
        already_fulfilled: outcome == GateOutcome::AlreadyFulfilled,
        payment_status: session.payment_status,
    }))
}
