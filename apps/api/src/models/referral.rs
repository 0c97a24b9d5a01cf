use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle of a referral: `invited → registered → paid`. Never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    Invited,
    Registered,
    Paid,
}

#[derive(Debug, Error)]
#[error("unknown referral status '{0}'")]
pub struct UnknownStatus(pub String);

impl ReferralStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferralStatus::Invited => "invited",
            ReferralStatus::Registered => "registered",
            ReferralStatus::Paid => "paid",
        }
    }

    /// Transitions only move forward.
    pub fn can_advance_to(&self, next: ReferralStatus) -> bool {
        next > *self
    }
}

impl TryFrom<String> for ReferralStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "invited" => Ok(ReferralStatus::Invited),
            "registered" => Ok(ReferralStatus::Registered),
            "paid" => Ok(ReferralStatus::Paid),
            _ => Err(UnknownStatus(value)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReferralRecord {
    pub id: Uuid,
    pub referrer_id: Uuid,
    pub referee_id: Option<Uuid>,
    pub referral_code: String,
    pub friend_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: ReferralStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub registered_at: Option<DateTime<Utc>>,
    pub converted_at: Option<DateTime<Utc>>,
    pub plan_purchased: Option<String>,
    pub payment_amount: Option<i64>,
}

impl ReferralRecord {
    /// A record created by an explicit invite; the referee is unknown until signup.
    pub fn invited(
        referrer_id: Uuid,
        referral_code: &str,
        friend_name: &str,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            referrer_id,
            referee_id: None,
            referral_code: referral_code.to_string(),
            friend_name: friend_name.to_string(),
            email: email.map(|e| e.trim().to_lowercase()),
            phone: phone.map(str::to_string),
            status: ReferralStatus::Invited,
            created_at: now,
            updated_at: now,
            registered_at: None,
            converted_at: None,
            plan_purchased: None,
            payment_amount: None,
        }
    }

    /// A record for a referee who signed up without a prior invite.
    pub fn registered(
        referrer_id: Uuid,
        referee_id: Uuid,
        referral_code: &str,
        friend_name: &str,
        email: Option<&str>,
    ) -> Self {
        let mut record = Self::invited(referrer_id, referral_code, friend_name, email, None);
        record.referee_id = Some(referee_id);
        record.status = ReferralStatus::Registered;
        record.registered_at = Some(record.created_at);
        record
    }
}

/// Payment details stamped on a referral at the `paid` transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversion {
    pub plan_purchased: String,
    pub payment_amount: i64,
    pub converted_at: DateTime<Utc>,
}
