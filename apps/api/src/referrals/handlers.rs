use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::require_admin;
use crate::errors::AppError;
use crate::referrals::codes::ensure_referral_code;
use crate::referrals::conversion::{record_conversion, ConversionOutcome};
use crate::referrals::invite::{send_invite, InviteRequest};
use crate::referrals::repair::{repair_referral, RefereeLookup};
use crate::referrals::rewards::{recalculate, redeem, referral_summary, ReferralSummary};
use crate::referrals::signup::track_signup;
use crate::state::AppState;

fn missing_fields() -> AppError {
    AppError::Validation("Missing required fields".to_string())
}

fn required_text(value: Option<String>) -> Result<String, AppError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(missing_fields)
}

#[derive(Deserialize)]
pub struct UserIdQuery {
    pub user_id: Uuid,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdRequest {
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referral_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referral_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earnings: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_earnings: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_referrals: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_credits: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeemed_credits: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_sent: Option<bool>,
}

impl LedgerResponse {
    fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    fn with_message(message: &str) -> Self {
        Self {
            success: true,
            message: Some(message.to_string()),
            ..Default::default()
        }
    }
}

/// POST /api/v1/referrals/invite
pub async fn handle_invite(
    State(state): State<AppState>,
    Json(req): Json<InviteRequest>,
) -> Result<Json<LedgerResponse>, AppError> {
    let user_id = req.user_id.ok_or_else(missing_fields)?;
    let outcome = send_invite(
        state.referrals.as_ref(),
        state.notifier.as_ref(),
        user_id,
        &req,
    )
    .await?;

    Ok(Json(LedgerResponse {
        referral_id: Some(outcome.referral_id),
        referral_code: Some(outcome.referral_code),
        email_sent: Some(outcome.email_queued),
        ..LedgerResponse::with_message("Invitation recorded")
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    pub user_id: Option<Uuid>,
    pub referral_code: Option<String>,
    pub email: Option<String>,
}

/// POST /api/v1/referrals/signup
pub async fn handle_signup(
    State(state): State<AppState>,
    Json(req): Json<SignupRequest>,
) -> Result<Json<LedgerResponse>, AppError> {
    let user_id = req.user_id.ok_or_else(missing_fields)?;
    let code = required_text(req.referral_code)?;

    let outcome = track_signup(state.referrals.as_ref(), user_id, &code, req.email.as_deref()).await?;

    let message = if outcome.newly_registered {
        "Referral signup tracked"
    } else {
        "Referral signup already tracked"
    };
    Ok(Json(LedgerResponse {
        referral_id: Some(outcome.referral_id),
        discount: Some(outcome.discount),
        ..LedgerResponse::with_message(message)
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionRequest {
    pub user_id: Option<Uuid>,
    pub plan_purchased: Option<String>,
    pub amount: Option<i64>,
}

/// POST /api/v1/referrals/conversion
pub async fn handle_conversion(
    State(state): State<AppState>,
    Json(req): Json<ConversionRequest>,
) -> Result<Json<LedgerResponse>, AppError> {
    let user_id = req.user_id.ok_or_else(missing_fields)?;
    let plan = required_text(req.plan_purchased)?;

    let outcome = record_conversion(
        state.referrals.as_ref(),
        state.notifier.as_ref(),
        user_id,
        &plan,
        req.amount.unwrap_or_default(),
    )
    .await?;

    let response = match outcome {
        ConversionOutcome::NotReferred => LedgerResponse::with_message("User was not referred"),
        ConversionOutcome::RecordNotFound { .. } => {
            LedgerResponse::with_message("Referral record not found")
        }
        ConversionOutcome::AlreadyConverted { referral_id } => LedgerResponse {
            referral_id: Some(referral_id),
            ..LedgerResponse::with_message("Referral already converted")
        },
        ConversionOutcome::Converted {
            referral_id,
            earnings,
            total_earnings,
            paid_referrals,
            ..
        } => LedgerResponse {
            referral_id: Some(referral_id),
            earnings: Some(earnings),
            total_earnings: Some(total_earnings),
            paid_referrals: Some(paid_referrals),
            ..LedgerResponse::ok()
        },
    };
    Ok(Json(response))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairRequest {
    pub referee_user_id: Option<Uuid>,
    pub referee_email: Option<String>,
    pub referrer_email: Option<String>,
}

/// POST /api/v1/referrals/repair (admin)
pub async fn handle_repair(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RepairRequest>,
) -> Result<Json<LedgerResponse>, AppError> {
    require_admin(&headers, &state.config)?;

    let referrer_email = required_text(req.referrer_email).map_err(|_| {
        AppError::Validation(
            "Missing referee identifier (userId or email) or referrerEmail".to_string(),
        )
    })?;
    let referee = match (req.referee_user_id, required_text(req.referee_email).ok()) {
        (Some(id), _) => RefereeLookup::UserId(id),
        (None, Some(email)) => RefereeLookup::Email(email),
        (None, None) => {
            return Err(AppError::Validation(
                "Missing referee identifier (userId or email) or referrerEmail".to_string(),
            ))
        }
    };

    let outcome = repair_referral(state.referrals.as_ref(), referee, &referrer_email).await?;

    Ok(Json(LedgerResponse {
        referral_id: Some(outcome.referral_id),
        earnings: outcome.earnings,
        total_earnings: outcome.total_earnings,
        paid_referrals: outcome.paid_referrals,
        ..LedgerResponse::with_message(outcome.message)
    }))
}

/// POST /api/v1/referrals/recalculate (admin)
pub async fn handle_recalculate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UserIdRequest>,
) -> Result<Json<LedgerResponse>, AppError> {
    require_admin(&headers, &state.config)?;
    let user_id = req.user_id.ok_or_else(missing_fields)?;

    let write = recalculate(state.referrals.as_ref(), user_id).await?;

    Ok(Json(LedgerResponse {
        earnings: Some(write.earnings_delta),
        total_earnings: Some(write.stats.total_earnings),
        paid_referrals: Some(write.stats.paid_referrals),
        available_credits: Some(write.rewards.available_credits),
        redeemed_credits: Some(write.rewards.redeemed_credits),
        ..LedgerResponse::ok()
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemRequest {
    pub user_id: Option<Uuid>,
    pub amount: Option<i64>,
}

/// POST /api/v1/referrals/redeem
pub async fn handle_redeem(
    State(state): State<AppState>,
    Json(req): Json<RedeemRequest>,
) -> Result<Json<LedgerResponse>, AppError> {
    let (Some(user_id), Some(amount)) = (req.user_id, req.amount) else {
        return Err(missing_fields());
    };

    let rewards = redeem(state.referrals.as_ref(), user_id, amount).await?;

    Ok(Json(LedgerResponse {
        available_credits: Some(rewards.available_credits),
        redeemed_credits: Some(rewards.redeemed_credits),
        ..LedgerResponse::ok()
    }))
}

/// POST /api/v1/referrals/code
pub async fn handle_referral_code(
    State(state): State<AppState>,
    Json(req): Json<UserIdRequest>,
) -> Result<Json<LedgerResponse>, AppError> {
    let user_id = req.user_id.ok_or_else(missing_fields)?;
    let code = ensure_referral_code(state.referrals.as_ref(), user_id).await?;

    Ok(Json(LedgerResponse {
        referral_code: Some(code),
        ..LedgerResponse::ok()
    }))
}

/// GET /api/v1/referrals/stats
pub async fn handle_stats(
    State(state): State<AppState>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<ReferralSummary>, AppError> {
    Ok(Json(
        referral_summary(state.referrals.as_ref(), params.user_id).await?,
    ))
}
