//! Operator repair for a (referee, referrer) pair whose automatic tracking failed.
//!
//! Re-running a repair is safe: the pair record is created at most once, the
//! `registered_referrals` counter only moves when it is, and the paid branch goes
//! through the same `apply_conversion` compare-and-swap as a live conversion.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::referral::{Conversion, ReferralRecord, ReferralStatus};
use crate::models::user::{ReferralLink, UserRecord};
use crate::referrals::earnings::accrue_paid_referral;
use crate::referrals::signup::REFERRAL_DISCOUNT_PERCENT;
use crate::store::{ConversionWrite, ReferralStore};

/// Plans that count as a completed purchase for repair purposes. `quarterly` is
/// included on purpose so repair agrees with the cycles checkout converts on.
pub const PAID_PLANS: &[&str] = &["premium", "monthly", "quarterly", "sixMonth"];
const UNKNOWN_CODE: &str = "UNKNOWN";
const FALLBACK_FRIEND_NAME: &str = "Fixed Referral";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefereeLookup {
    UserId(Uuid),
    Email(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairOutcome {
    pub referral_id: Uuid,
    pub earnings: Option<i64>,
    pub total_earnings: Option<i64>,
    pub paid_referrals: Option<i64>,
    pub message: &'static str,
}

impl RepairOutcome {
    fn registered(referral_id: Uuid) -> Self {
        Self {
            referral_id,
            earnings: None,
            total_earnings: None,
            paid_referrals: None,
            message: "Referral fixed as registered (not paid yet)",
        }
    }
}

pub fn is_paid_plan(plan: Option<&str>) -> bool {
    plan.is_some_and(|p| PAID_PLANS.contains(&p))
}

pub async fn repair_referral(
    store: &dyn ReferralStore,
    referee: RefereeLookup,
    referrer_email: &str,
) -> Result<RepairOutcome, AppError> {
    let referrer = store
        .find_user_by_email(referrer_email)
        .await?
        .ok_or_else(|| AppError::NotFound("Referrer not found".to_string()))?;

    let referee = match referee {
        RefereeLookup::UserId(id) => store.get_user(id).await?,
        RefereeLookup::Email(email) => store.find_user_by_email(&email).await?,
    }
    .ok_or_else(|| AppError::NotFound("Referee user not found".to_string()))?;

    if referee.id == referrer.id {
        return Err(AppError::Validation(
            "Referee and referrer are the same user".to_string(),
        ));
    }

    let code = referrer
        .referral_code
        .clone()
        .unwrap_or_else(|| UNKNOWN_CODE.to_string());
    let link = ReferralLink {
        referred_by: referrer.id,
        referred_by_code: code.clone(),
        discount_percent: REFERRAL_DISCOUNT_PERCENT,
    };
    store.write_referral_link(referee.id, &link).await?;

    let record = ensure_pair(store, &referrer, &referee, &code).await?;

    if !is_paid_plan(referee.plan.as_deref()) {
        info!(referral_id = %record.id, "Repaired referral as registered");
        return Ok(RepairOutcome::registered(record.id));
    }

    if record.status == ReferralStatus::Paid {
        info!(referral_id = %record.id, "Repaired referral was already paid");
        return Ok(already_paid(&referrer, record.id));
    }

    let conversion = Conversion {
        plan_purchased: referee.plan.clone().unwrap_or_default(),
        payment_amount: 0,
        converted_at: Utc::now(),
    };
    match store
        .apply_conversion(record.id, referrer.id, &conversion, &accrue_paid_referral)
        .await?
    {
        ConversionWrite::AlreadyPaid => Ok(already_paid(&referrer, record.id)),
        ConversionWrite::Applied(write) => {
            info!(
                referral_id = %record.id,
                referrer_id = %referrer.id,
                earnings = write.earnings_delta,
                "Repaired paid referral"
            );
            Ok(RepairOutcome {
                referral_id: record.id,
                earnings: Some(write.earnings_delta),
                total_earnings: Some(write.stats.total_earnings),
                paid_referrals: Some(write.stats.paid_referrals),
                message: "Referral fixed successfully",
            })
        }
    }
}

/// Returns the pair's record, creating a `registered` one if none exists.
async fn ensure_pair(
    store: &dyn ReferralStore,
    referrer: &UserRecord,
    referee: &UserRecord,
    code: &str,
) -> Result<ReferralRecord, AppError> {
    if let Some(existing) = store.find_referral(referrer.id, referee.id).await? {
        return Ok(existing);
    }

    let friend_name = referee
        .display_name
        .as_deref()
        .unwrap_or(FALLBACK_FRIEND_NAME);
    let record = ReferralRecord::registered(
        referrer.id,
        referee.id,
        code,
        friend_name,
        Some(&referee.email),
    );
    match store.insert_referral(&record).await {
        Ok(()) => {
            store.increment_registered_referrals(referrer.id).await?;
            Ok(record)
        }
        Err(AppError::Conflict(_)) => store
            .find_referral(referrer.id, referee.id)
            .await?
            .ok_or_else(|| {
                AppError::Integrity(format!(
                    "Referral pair {}/{} conflicted but cannot be read",
                    referrer.id, referee.id
                ))
            }),
        Err(e) => Err(e),
    }
}

fn already_paid(referrer: &UserRecord, referral_id: Uuid) -> RepairOutcome {
    RepairOutcome {
        referral_id,
        earnings: Some(0),
        total_earnings: Some(referrer.referral_stats.total_earnings),
        paid_referrals: Some(referrer.referral_stats.paid_referrals),
        message: "Referral already converted",
    }
}
