use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Per-referrer counters embedded in the user record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReferralStats {
    pub total_referrals: i64,
    pub registered_referrals: i64,
    pub paid_referrals: i64,
    pub total_earnings: i64,
}

/// Redeemable credit balance. `available_credits` only ever moves by earnings deltas
/// or explicit redemptions, never by a full recompute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReferralRewards {
    pub available_credits: i64,
    pub redeemed_credits: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub plan: Option<String>,
    pub plan_expires_at: Option<DateTime<Utc>>,
    pub currency: Option<String>,
    pub profile_slots: i32,
    pub referral_code: Option<String>,
    pub referred_by: Option<Uuid>,
    pub referred_by_code: Option<String>,
    pub referral_discount: i32,
    #[sqlx(flatten)]
    pub referral_stats: ReferralStats,
    #[sqlx(flatten)]
    pub referral_rewards: ReferralRewards,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    /// A fresh user with no plan and no referral history.
    #[cfg(test)]
    pub fn new(email: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email: email.trim().to_lowercase(),
            display_name: None,
            plan: None,
            plan_expires_at: None,
            currency: None,
            profile_slots: 0,
            referral_code: None,
            referred_by: None,
            referred_by_code: None,
            referral_discount: 0,
            referral_stats: ReferralStats::default(),
            referral_rewards: ReferralRewards::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Name used when addressing this user in a notification.
    pub fn greeting_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.email)
    }
}

/// The fields the signup tracker writes onto a referee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferralLink {
    pub referred_by: Uuid,
    pub referred_by_code: String,
    pub discount_percent: i32,
}
