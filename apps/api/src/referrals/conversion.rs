//! Conversion recording: credits a referrer when their referee first pays.
//!
//! Soft outcomes (`NotReferred`, `RecordNotFound`, `AlreadyConverted`) are not errors.
//! The `paid` transition and the aggregate recompute are one atomic store write, so
//! two racing conversions for the same referral credit the referrer once.

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::referral::{Conversion, ReferralStatus};
use crate::models::user::UserRecord;
use crate::notify::{notify_best_effort, templates, Notification, Notifier};
use crate::referrals::codes::normalize_code;
use crate::referrals::earnings::accrue_paid_referral;
use crate::store::{ConversionWrite, ReferralStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionOutcome {
    NotReferred,
    /// The referee points at a referrer but no pair record exists; needs a repair run.
    RecordNotFound { referrer_id: Uuid },
    AlreadyConverted { referral_id: Uuid },
    Converted {
        referral_id: Uuid,
        referrer_id: Uuid,
        earnings: i64,
        total_earnings: i64,
        paid_referrals: i64,
    },
}

pub async fn record_conversion(
    store: &dyn ReferralStore,
    notifier: &dyn Notifier,
    referee_id: Uuid,
    plan_purchased: &str,
    payment_amount: i64,
) -> Result<ConversionOutcome, AppError> {
    if plan_purchased.trim().is_empty() {
        return Err(AppError::Validation(
            "planPurchased cannot be empty".to_string(),
        ));
    }
    if payment_amount < 0 {
        return Err(AppError::Validation(
            "amount must be non-negative".to_string(),
        ));
    }

    let referee = store
        .get_user(referee_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {referee_id} not found")))?;

    let Some(referrer_id) = resolve_referrer(store, &referee).await? else {
        info!(%referee_id, "Conversion skipped: user was not referred");
        return Ok(ConversionOutcome::NotReferred);
    };

    let Some(referral) = store.find_referral(referrer_id, referee_id).await? else {
        warn!(%referee_id, %referrer_id, "No referral record for referred user");
        return Ok(ConversionOutcome::RecordNotFound { referrer_id });
    };

    if referral.status == ReferralStatus::Paid {
        info!(referral_id = %referral.id, "Referral already converted");
        return Ok(ConversionOutcome::AlreadyConverted {
            referral_id: referral.id,
        });
    }

    let conversion = Conversion {
        plan_purchased: plan_purchased.to_string(),
        payment_amount,
        converted_at: Utc::now(),
    };

    let write = match store
        .apply_conversion(referral.id, referrer_id, &conversion, &accrue_paid_referral)
        .await?
    {
        ConversionWrite::AlreadyPaid => {
            info!(referral_id = %referral.id, "Referral converted concurrently");
            return Ok(ConversionOutcome::AlreadyConverted {
                referral_id: referral.id,
            });
        }
        ConversionWrite::Applied(write) => write,
    };

    if write.earnings_delta > 0 {
        notify_best_effort(
            notifier,
            Notification::to_user(
                templates::REFERRAL_CONVERSION,
                referrer_id,
                json!({
                    "earnings": write.earnings_delta,
                    "refereeName": referee.greeting_name(),
                    "totalEarnings": write.stats.total_earnings,
                    "paidReferrals": write.stats.paid_referrals,
                }),
            ),
        )
        .await;
    }

    info!(
        %referrer_id,
        referral_id = %referral.id,
        earnings = write.earnings_delta,
        total_earnings = write.stats.total_earnings,
        paid_referrals = write.stats.paid_referrals,
        "Referral conversion recorded"
    );

    Ok(ConversionOutcome::Converted {
        referral_id: referral.id,
        referrer_id,
        earnings: write.earnings_delta,
        total_earnings: write.stats.total_earnings,
        paid_referrals: write.stats.paid_referrals,
    })
}

/// The referee's referrer, backfilling `referred_by` from `referred_by_code` if the
/// signup-time link write was lost. `None` means "not referred".
async fn resolve_referrer(
    store: &dyn ReferralStore,
    referee: &UserRecord,
) -> Result<Option<Uuid>, AppError> {
    if let Some(referrer_id) = referee.referred_by {
        return Ok(Some(referrer_id));
    }
    let Some(code) = referee.referred_by_code.as_deref() else {
        return Ok(None);
    };

    match store.find_user_by_referral_code(&normalize_code(code)).await? {
        Some(referrer) if referrer.id != referee.id => {
            warn!(
                referee_id = %referee.id,
                referrer_id = %referrer.id,
                "referredBy missing but referredByCode set; backfilling"
            );
            store.set_referred_by(referee.id, referrer.id).await?;
            Ok(Some(referrer.id))
        }
        _ => {
            warn!(referee_id = %referee.id, code, "referredByCode does not resolve to a referrer");
            Ok(None)
        }
    }
}
