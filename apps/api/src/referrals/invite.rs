use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::referral::ReferralRecord;
use crate::notify::{notify_best_effort, templates, Notification, Notifier};
use crate::referrals::codes::ensure_referral_code;
use crate::referrals::signup::REFERRAL_DISCOUNT_PERCENT;
use crate::store::ReferralStore;

const DEFAULT_FRIEND_NAME: &str = "Friend";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteRequest {
    pub user_id: Option<Uuid>,
    pub friend_name: Option<String>,
    pub friend_email: Option<String>,
    pub friend_phone: Option<String>,
    pub referrer_name: Option<String>,
    pub referral_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteOutcome {
    pub referral_id: Uuid,
    pub referral_code: String,
    pub email_queued: bool,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Records an `invited` referral and queues the invitation email when an address is given.
pub async fn send_invite(
    store: &dyn ReferralStore,
    notifier: &dyn Notifier,
    referrer_id: Uuid,
    request: &InviteRequest,
) -> Result<InviteOutcome, AppError> {
    let email = non_blank(&request.friend_email);
    let phone = non_blank(&request.friend_phone);
    if email.is_none() && phone.is_none() {
        return Err(AppError::Validation(
            "At least email or phone number is required".to_string(),
        ));
    }

    let code = ensure_referral_code(store, referrer_id).await?;
    let friend_name = non_blank(&request.friend_name).unwrap_or(DEFAULT_FRIEND_NAME);

    let record = ReferralRecord::invited(referrer_id, &code, friend_name, email, phone);
    store.insert_referral(&record).await?;
    store.increment_total_referrals(referrer_id).await?;

    let email_queued = if let Some(address) = record.email.as_deref() {
        notify_best_effort(
            notifier,
            Notification::to_email(
                templates::REFERRAL_INVITE,
                address,
                json!({
                    "friendName": friend_name,
                    "referrerName": non_blank(&request.referrer_name),
                    "referralCode": code,
                    "referralLink": non_blank(&request.referral_link),
                    "discount": REFERRAL_DISCOUNT_PERCENT,
                }),
            ),
        )
        .await;
        true
    } else {
        false
    };

    info!(%referrer_id, referral_id = %record.id, email_queued, "Referral invite recorded");

    Ok(InviteOutcome {
        referral_id: record.id,
        referral_code: code,
        email_queued,
    })
}
